//! # meshccl
//!
//! `meshccl` runs collective communication (all-gather, reduce-scatter,
//! all-reduce) over a simulated mesh of accelerator chips.
//!
//! Each chip owns a grid of cores with L1 and DRAM pools. A chip's cores are
//! partitioned into sub-devices. A [`FabricSession`] reserves one of them
//! as the workers that drive inter-chip transfers. Transfers are paired
//! with [`GlobalSemaphore`] increments and waits, the way a device kernel
//! would synchronize with its neighbours.
//!
//! ## Modules
//!
//! - [`mod@tensor`]: host tensor `Tensor<T, RANK>` and data types.
//! - [`mesh`]: mesh topology, device parameters, core ranges, memory pools.
//! - [`sub_device`]: sub-device managers and the stall group.
//! - [`semaphore`]: global semaphores at one address on every chip.
//! - [`fabric`]: fabric sessions and routing.
//! - [`ccl`]: the collectives.
//! - [`norm`]: RMS and layer norm over a sharded feature dim.
//! - [`queue`]: command queues, events and trace capture/replay.
//! - [`verify`]: PCC and the determinism harness.
//!
//! ## Example
//!
//! ```rust
//! use meshccl::ccl::{CollectiveBackend, CollectiveDescriptor};
//! use meshccl::mesh::{CoreCoord, CoreRange, DeviceParams, MemoryConfig, MeshDevice, MeshShape};
//! use meshccl::sub_device::{SubDevice, SubDeviceLayout};
//! use meshccl::tensor::{DataType, Tensor};
//! use meshccl::{FabricConfig, FabricSession, MeshTensor};
//!
//! # fn main() -> meshccl::Result<()> {
//! let mesh = MeshDevice::open(MeshShape::new(1, 4)?, DeviceParams::default())?;
//! let workers = CoreRange::new(CoreCoord::new(0, 0), CoreCoord::new(1, 0));
//! let layout = SubDeviceLayout::Replicated(vec![SubDevice::new(workers.into())]);
//! let manager = mesh.create_sub_device_manager(&layout, 0)?;
//! mesh.load_sub_device_manager(manager)?;
//!
//! let session = FabricSession::open(&mesh, FabricConfig::default())?;
//! let host = Tensor::<f32, 2>::from_fn([4, 8], |i| i as f32);
//! let input = MeshTensor::shard(&mesh, &host, 0, None, DataType::Float32, MemoryConfig::DRAM)?;
//! let gathered = session.all_gather(input, &CollectiveDescriptor::all_gather(0))?;
//! assert_eq!(gathered.shards()[3].data(), host.data());
//! session.close()?;
//! # Ok(())
//! # }
//! ```

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod ccl;
pub mod error;
pub mod fabric;
pub mod mesh;
pub mod mesh_tensor;
pub mod norm;
pub mod queue;
pub mod semaphore;
pub mod sub_device;
pub mod tensor;
pub mod verify;

pub use ccl::{CollectiveBackend, CollectiveDescriptor};
pub use error::{CclError, Result};
pub use fabric::{Fabric, FabricConfig, FabricSession};
pub use mesh::{MeshDevice, MeshShape};
pub use mesh_tensor::MeshTensor;
pub use semaphore::GlobalSemaphore;
pub use tensor::{DataType, Tensor, TensorElem, TensorError};

/// Locks `m`, recovering the guard if a worker panicked while holding it.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
