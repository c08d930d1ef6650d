//! Tensors distributed over the chips of a mesh.
//!
//! A [`MeshTensor`] holds one host-side shard per chip (indexed by
//! [`ChipId`](crate::mesh::ChipId)) together with the device format every shard is stored in:
//! element [`DataType`] and [`MemoryConfig`]. Each shard reserves its bytes
//! in the owning chip's L1 or DRAM pool; the reservation is released when
//! the last clone of the tensor is dropped.
//!
//! Mappers build a mesh tensor from one host tensor:
//!
//! - [`MeshTensor::replicate`]: every chip gets a full copy,
//! - [`MeshTensor::shard`]: split along a tensor dim across one cluster axis
//!   (or all chips), replicated across the other axis,
//! - [`MeshTensor::shard_2d`]: split along one tensor dim across rows and
//!   another across columns.
//!
//! [`MeshTensor::concat_along`] is the composer going the other way.

use std::sync::Arc;

use crate::error::{CclError, Result};
use crate::mesh::{Allocation, MemoryConfig, MeshDevice, MeshShape};
use crate::tensor::{DataType, Tensor, TensorElem};

/// Per-chip layout of a mesh tensor's shards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardSpec {
    pub shape: Vec<usize>,
    pub dtype: DataType,
    pub memory_config: MemoryConfig,
}

#[derive(Debug, Clone)]
pub struct MeshTensor<T: TensorElem, const RANK: usize> {
    mesh_shape: MeshShape,
    shards: Vec<Tensor<T, RANK>>,
    dtype: DataType,
    memory_config: MemoryConfig,
    allocations: Arc<[Allocation]>,
}

impl<T: TensorElem, const RANK: usize> MeshTensor<T, RANK> {
    /// Places `shards[i]` on chip `i`, rounding to `dtype`.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` if the shard count does not match the mesh or the
    /// shards differ in shape, `OutOfMemory` if a chip's pool is full.
    pub fn from_shards(
        mesh: &MeshDevice,
        mut shards: Vec<Tensor<T, RANK>>,
        dtype: DataType,
        memory_config: MemoryConfig,
    ) -> Result<Self> {
        if shards.len() != mesh.num_devices() {
            return Err(CclError::InvalidConfig(format!(
                "{} shards for a mesh of {} chips",
                shards.len(),
                mesh.num_devices()
            )));
        }
        if let Some(first) = shards.first() {
            let shape = *first.shape();
            if let Some(bad) = shards.iter().find(|s| *s.shape() != shape) {
                return Err(CclError::InvalidConfig(format!(
                    "shard shapes differ: {:?} vs {:?}",
                    shape,
                    bad.shape()
                )));
            }
        }
        for shard in &mut shards {
            dtype.quantize(shard.data_mut());
        }
        let allocations = allocate(mesh, &shards, dtype, memory_config)?;
        Ok(Self {
            mesh_shape: mesh.shape(),
            shards,
            dtype,
            memory_config,
            allocations,
        })
    }

    /// Copies `tensor` to every chip.
    pub fn replicate(
        mesh: &MeshDevice,
        tensor: &Tensor<T, RANK>,
        dtype: DataType,
        memory_config: MemoryConfig,
    ) -> Result<Self> {
        let shards = vec![tensor.clone(); mesh.num_devices()];
        Self::from_shards(mesh, shards, dtype, memory_config)
    }

    /// Splits `tensor` along `dim` across the chips of `cluster_axis` and
    /// replicates the pieces across the other axis. `None` splits across
    /// every chip in row-major order.
    ///
    /// # Errors
    ///
    /// `IndivisibleDim` if `shape[dim]` is not a multiple of the axis size.
    pub fn shard(
        mesh: &MeshDevice,
        tensor: &Tensor<T, RANK>,
        dim: usize,
        cluster_axis: Option<usize>,
        dtype: DataType,
        memory_config: MemoryConfig,
    ) -> Result<Self> {
        let shape = mesh.shape();
        let pieces = split_for_axis(tensor, dim, shape.axis_size(cluster_axis)?)?;
        let shards = mesh
            .chips()
            .iter()
            .map(|chip| -> Result<Tensor<T, RANK>> {
                let pos = shape.position_along(chip.id(), cluster_axis)?;
                Ok(pieces[pos].clone())
            })
            .collect::<Result<Vec<_>>>()?;
        Self::from_shards(mesh, shards, dtype, memory_config)
    }

    /// Splits `tensor` along `dims.0` across mesh rows and `dims.1` across
    /// mesh columns. A `None` dim replicates along that mesh dimension.
    pub fn shard_2d(
        mesh: &MeshDevice,
        tensor: &Tensor<T, RANK>,
        dims: (Option<usize>, Option<usize>),
        dtype: DataType,
        memory_config: MemoryConfig,
    ) -> Result<Self> {
        let shape = mesh.shape();
        let row_pieces = match dims.0 {
            Some(dim) => split_for_axis(tensor, dim, shape.rows())?,
            None => vec![tensor.clone(); shape.rows()],
        };
        let grid = row_pieces
            .iter()
            .map(|piece| match dims.1 {
                Some(dim) => split_for_axis(piece, dim, shape.cols()),
                None => Ok(vec![piece.clone(); shape.cols()]),
            })
            .collect::<Result<Vec<_>>>()?;
        let shards = mesh
            .chips()
            .iter()
            .map(|chip| grid[chip.coord().row][chip.coord().col].clone())
            .collect();
        Self::from_shards(mesh, shards, dtype, memory_config)
    }

    pub fn shards(&self) -> &[Tensor<T, RANK>] {
        &self.shards
    }

    pub fn mesh_shape(&self) -> MeshShape {
        self.mesh_shape
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    pub fn memory_config(&self) -> MemoryConfig {
        self.memory_config
    }

    /// Local shape of every shard.
    pub fn shard_shape(&self) -> [usize; RANK] {
        self.shards.first().map_or([0; RANK], |s| *s.shape())
    }

    pub fn spec(&self) -> ShardSpec {
        ShardSpec {
            shape: self.shard_shape().to_vec(),
            dtype: self.dtype,
            memory_config: self.memory_config,
        }
    }

    /// Device bytes held by this tensor across all chips.
    pub fn device_bytes(&self) -> usize {
        self.allocations.iter().map(Allocation::bytes).sum()
    }

    /// Whether two handles share the same device buffers.
    pub fn shares_buffers(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.allocations, &other.allocations)
    }

    /// Concatenates the shards of the chips of `cluster_axis` group `group`
    /// along `dim`.
    ///
    /// This undoes [`MeshTensor::shard`] for that group.
    pub fn concat_along(
        &self,
        dim: usize,
        cluster_axis: Option<usize>,
        group: usize,
    ) -> Result<Tensor<T, RANK>> {
        let groups = self.mesh_shape.axis_groups(cluster_axis)?;
        let chips = groups.get(group).ok_or_else(|| {
            CclError::InvalidConfig(format!("group {group} does not exist along {cluster_axis:?}"))
        })?;
        let parts: Vec<Tensor<T, RANK>> = chips.iter().map(|c| self.shards[c.0].clone()).collect();
        Ok(Tensor::concat(&parts, dim)?)
    }

    /// Reshapes every shard, keeping the device buffers.
    pub fn reshape<const NEW_RANK: usize>(
        self,
        shape: [usize; NEW_RANK],
    ) -> Result<MeshTensor<T, NEW_RANK>> {
        let shards = self
            .shards
            .into_iter()
            .map(|s| s.reshape(shape))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(MeshTensor {
            mesh_shape: self.mesh_shape,
            shards,
            dtype: self.dtype,
            memory_config: self.memory_config,
            allocations: self.allocations,
        })
    }

    /// Re-stores the same values in a new format, returning a tensor with
    /// its own buffers. Values are rounded to `dtype`.
    pub fn reformat(
        &self,
        mesh: &MeshDevice,
        dtype: DataType,
        memory_config: MemoryConfig,
    ) -> Result<Self> {
        Self::from_shards(mesh, self.shards.clone(), dtype, memory_config)
    }

    /// Replaces the shards, keeping the format and reserving fresh buffers.
    pub(crate) fn with_shards<const R: usize>(
        &self,
        mesh: &MeshDevice,
        shards: Vec<Tensor<T, R>>,
        memory_config: MemoryConfig,
    ) -> Result<MeshTensor<T, R>> {
        MeshTensor::from_shards(mesh, shards, self.dtype, memory_config)
    }
}

fn split_for_axis<T: TensorElem, const RANK: usize>(
    tensor: &Tensor<T, RANK>,
    dim: usize,
    parts: usize,
) -> Result<Vec<Tensor<T, RANK>>> {
    if dim >= RANK {
        return Err(CclError::InvalidDim { dim, rank: RANK });
    }
    let size = tensor.shape()[dim];
    if size % parts != 0 {
        return Err(CclError::IndivisibleDim {
            dim,
            size,
            devices: parts,
        });
    }
    Ok(tensor.split(dim, parts)?)
}

fn allocate<T: TensorElem, const RANK: usize>(
    mesh: &MeshDevice,
    shards: &[Tensor<T, RANK>],
    dtype: DataType,
    memory_config: MemoryConfig,
) -> Result<Arc<[Allocation]>> {
    mesh.chips()
        .iter()
        .zip(shards)
        .map(|(chip, shard)| {
            chip.pool(memory_config.buffer_type)
                .allocate(shard.nbytes(dtype))
        })
        .collect::<Result<Vec<_>>>()
        .map(Arc::from)
}
