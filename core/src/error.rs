//! Error taxonomy for the collective layer.
//!
//! Configuration and resource errors are returned synchronously, before
//! any transfer is issued. There is no variant for a stalled partner chip:
//! a wait that is never satisfied blocks forever and has to be caught by
//! whatever supervises the process.

use thiserror::Error;

use crate::ccl::Topology;
use crate::mesh::{BufferType, ChipId, ConfigError, CoreCoord, CoreRange};
use crate::queue::{QueueId, TraceId};
use crate::sub_device::{SubDeviceId, SubDeviceManagerId};
use crate::tensor::TensorError;
use meshccl_kernels::KernelError;

#[derive(Error, Debug)]
pub enum CclError {
    // Configuration
    #[error("dim {dim} has size {size}, not divisible by {devices} devices along the collective axis")]
    IndivisibleDim {
        dim: usize,
        size: usize,
        devices: usize,
    },
    #[error("cluster axis {axis} is invalid for a {rows}x{cols} mesh")]
    InvalidClusterAxis { axis: usize, rows: usize, cols: usize },
    #[error("dim {dim} is out of range for rank {rank}")]
    InvalidDim { dim: usize, rank: usize },
    #[error("core ranges {first} and {second} overlap")]
    OverlappingCoreRanges { first: CoreRange, second: CoreRange },
    #[error("core range {range} lies outside the {grid} core grid")]
    CoreRangeOutOfGrid { range: CoreRange, grid: CoreCoord },
    #[error("{topology:?} topology unsupported: {reason}")]
    TopologyUnsupported { topology: Topology, reason: String },
    #[error("{requested} links requested, only {available} available")]
    TooManyLinks { requested: usize, available: usize },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // Resources
    #[error("out of {buffer:?} memory on chip {chip}: requested {requested} bytes, {available} available")]
    OutOfMemory {
        chip: ChipId,
        buffer: BufferType,
        requested: usize,
        available: usize,
    },

    // Lifecycle
    #[error("unknown sub-device manager {0}")]
    UnknownSubDeviceManager(SubDeviceManagerId),
    #[error("sub-device manager {0} is loaded and cannot be removed")]
    SubDeviceManagerLoaded(SubDeviceManagerId),
    #[error("no sub-device manager is loaded on chip {0}")]
    NoSubDeviceManagerLoaded(ChipId),
    #[error("sub-device manager {manager} is pinned by {sessions} open fabric session(s)")]
    SubDeviceBusy {
        manager: SubDeviceManagerId,
        sessions: usize,
    },
    #[error("sub-device {0} does not exist in the loaded manager")]
    UnknownSubDevice(SubDeviceId),
    #[error("worker cores {0} are already owned by an open fabric session")]
    CoreRangeClaimed(CoreRange),
    #[error("persistent fabric has not been created on this mesh")]
    FabricNotCreated,
    #[error("persistent fabric is already created on this mesh")]
    FabricAlreadyCreated,
    #[error("unknown command queue {0}")]
    UnknownQueue(QueueId),
    #[error("unknown trace {0}")]
    UnknownTrace(TraceId),
    #[error("a trace capture is already active on queue {0}")]
    TraceActive(QueueId),
    #[error("no trace capture is active on queue {0}")]
    NoTraceActive(QueueId),
    #[error("trace region size is zero; traces cannot be captured")]
    TraceRegionUnavailable,
    #[error("{0} cannot be recorded into a trace")]
    NotCapturable(&'static str),

    #[error("fabric error: {0}")]
    Fabric(String),
    #[error(transparent)]
    Tensor(#[from] TensorError),
    #[error(transparent)]
    Kernel(#[from] KernelError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub type Result<T> = std::result::Result<T, CclError>;
