//! Collective operations over the chips of a mesh axis.
//!
//! Every call walks the same steps:
//!
//! 1. **configure**: check the descriptor against the mesh and the tensor
//!    (axis, dim, divisibility, links, topology). Errors here are returned
//!    before anything moves.
//! 2. **reformat**: cast to the working dtype and move sharded inputs to an
//!    interleaved layout where the algorithm needs it.
//! 3. **dispatch**: one worker per (chip, link) exchanges chunks over the
//!    session's routing, each transfer guarded by a global semaphore.
//! 4. **synchronize**: wait on every worker's completion semaphore.
//! 5. **result**: reassemble, reshape back, cast to the output dtype.
//!
//! An axis with a single chip short-circuits to the identity after step 1.

use crate::error::Result;
use crate::fabric::{Fabric, FabricSession};
use crate::mesh::{MeshDevice, MeshShape};
use crate::mesh_tensor::MeshTensor;
use crate::tensor::TensorElem;

mod all_gather;
mod all_reduce;
pub mod descriptor;
pub(crate) mod dispatch;
mod reduce_scatter;

pub use descriptor::{AllReduceMode, CollectiveDescriptor, CollectiveKind, ReduceOp, Topology};

/// Something that can run collectives over a mesh.
///
/// Implemented by [`Fabric`] (what queued operations receive) and by
/// [`FabricSession`] for direct calls from the host.
pub trait CollectiveBackend {
    /// The mesh collectives run over.
    fn mesh(&self) -> &MeshDevice;

    fn mesh_shape(&self) -> MeshShape {
        self.mesh().shape()
    }

    /// Gathers every chip's shard along `desc.dim()`.
    ///
    /// # Errors
    ///
    /// Configuration errors for a bad axis, dim, link count or topology.
    fn all_gather<T, const RANK: usize>(
        &self,
        input: MeshTensor<T, RANK>,
        desc: &CollectiveDescriptor,
    ) -> Result<MeshTensor<T, RANK>>
    where
        T: TensorElem + 'static;

    /// Reduces the shards and scatters slices of `desc.dim()`.
    ///
    /// # Errors
    ///
    /// As [`CollectiveBackend::all_gather`], plus `IndivisibleDim` if the
    /// scatter dim is not a multiple of the axis size.
    fn reduce_scatter<T, const RANK: usize>(
        &self,
        input: MeshTensor<T, RANK>,
        desc: &CollectiveDescriptor,
    ) -> Result<MeshTensor<T, RANK>>
    where
        T: TensorElem + 'static;

    /// Reduces the shards and replicates the result on every chip.
    fn all_reduce<T, const RANK: usize>(
        &self,
        input: MeshTensor<T, RANK>,
        desc: &CollectiveDescriptor,
    ) -> Result<MeshTensor<T, RANK>>
    where
        T: TensorElem + 'static;

    /// Runs whichever collective `desc` describes.
    fn collective<T, const RANK: usize>(
        &self,
        input: MeshTensor<T, RANK>,
        desc: &CollectiveDescriptor,
    ) -> Result<MeshTensor<T, RANK>>
    where
        T: TensorElem + 'static,
    {
        match desc.kind() {
            CollectiveKind::AllGather => self.all_gather(input, desc),
            CollectiveKind::ReduceScatter => self.reduce_scatter(input, desc),
            CollectiveKind::AllReduce(_) => self.all_reduce(input, desc),
        }
    }
}

impl CollectiveBackend for Fabric {
    fn mesh(&self) -> &MeshDevice {
        &self.mesh
    }

    fn all_gather<T, const RANK: usize>(
        &self,
        input: MeshTensor<T, RANK>,
        desc: &CollectiveDescriptor,
    ) -> Result<MeshTensor<T, RANK>>
    where
        T: TensorElem + 'static,
    {
        all_gather::all_gather(self, input, desc)
    }

    fn reduce_scatter<T, const RANK: usize>(
        &self,
        input: MeshTensor<T, RANK>,
        desc: &CollectiveDescriptor,
    ) -> Result<MeshTensor<T, RANK>>
    where
        T: TensorElem + 'static,
    {
        reduce_scatter::reduce_scatter(self, input, desc)
    }

    fn all_reduce<T, const RANK: usize>(
        &self,
        input: MeshTensor<T, RANK>,
        desc: &CollectiveDescriptor,
    ) -> Result<MeshTensor<T, RANK>>
    where
        T: TensorElem + 'static,
    {
        all_reduce::all_reduce(self, input, desc)
    }
}

impl CollectiveBackend for FabricSession<'_> {
    fn mesh(&self) -> &MeshDevice {
        self.mesh
    }

    fn all_gather<T, const RANK: usize>(
        &self,
        input: MeshTensor<T, RANK>,
        desc: &CollectiveDescriptor,
    ) -> Result<MeshTensor<T, RANK>>
    where
        T: TensorElem + 'static,
    {
        self.fabric.all_gather(input, desc)
    }

    fn reduce_scatter<T, const RANK: usize>(
        &self,
        input: MeshTensor<T, RANK>,
        desc: &CollectiveDescriptor,
    ) -> Result<MeshTensor<T, RANK>>
    where
        T: TensorElem + 'static,
    {
        self.fabric.reduce_scatter(input, desc)
    }

    fn all_reduce<T, const RANK: usize>(
        &self,
        input: MeshTensor<T, RANK>,
        desc: &CollectiveDescriptor,
    ) -> Result<MeshTensor<T, RANK>>
    where
        T: TensorElem + 'static,
    {
        self.fabric.all_reduce(input, desc)
    }
}
