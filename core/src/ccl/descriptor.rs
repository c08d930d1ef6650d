//! What a collective call asks for.

use crate::error::{CclError, Result};
use crate::mesh::{MemoryConfig, MeshShape};
use crate::tensor::DataType;

pub use meshccl_kernels::ReduceOp;

/// Logical path data follows between the chips of one axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Topology {
    /// Each chip talks to both neighbours; the ends do not connect.
    #[default]
    Linear,
    /// The last chip of the axis also connects back to the first.
    Ring,
}

/// How an all-reduce is carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllReduceMode {
    /// One bidirectional pass along the line; every chip accumulates the
    /// whole tensor. Best for one-dimensional meshes and two-chip axes.
    LineReduce,
    /// All-gather the canonical `[1, 1, N, W]` view along dim 0, then
    /// reduce the gathered copies locally.
    Fused,
    /// Reduce-scatter along the descriptor dim, then all-gather it back.
    Composite {
        /// Links for the all-gather phase; the reduce-scatter phase uses
        /// the descriptor's `num_links`.
        all_gather_links: usize,
    },
}

impl AllReduceMode {
    /// The mode used for `mesh` and `cluster_axis` unless the caller
    /// overrides it.
    ///
    /// A one-dimensional mesh or an axis of at most two chips gets
    /// [`AllReduceMode::LineReduce`]; a two-dimensional mesh gets
    /// [`AllReduceMode::Fused`].
    pub fn default_for(mesh: MeshShape, cluster_axis: Option<usize>) -> Self {
        let axis_size = mesh.axis_size(cluster_axis).unwrap_or(1);
        if mesh.is_line() || axis_size <= 2 {
            AllReduceMode::LineReduce
        } else {
            AllReduceMode::Fused
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CollectiveKind {
    AllGather,
    ReduceScatter,
    AllReduce(AllReduceMode),
}

/// A fully specified collective.
///
/// Built with one of the kind constructors and refined with the `with_*`
/// methods:
///
/// ```rust
/// use meshccl::ccl::{CollectiveDescriptor, Topology};
///
/// let desc = CollectiveDescriptor::all_gather(3)
///     .with_cluster_axis(1)
///     .with_links(2)
///     .with_topology(Topology::Ring);
/// assert_eq!(desc.num_links(), 2);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CollectiveDescriptor {
    kind: CollectiveKind,
    reduce_op: ReduceOp,
    cluster_axis: Option<usize>,
    dim: usize,
    topology: Topology,
    num_links: usize,
    memory_config: Option<MemoryConfig>,
    dtype: Option<DataType>,
    output_dtype: Option<DataType>,
}

impl CollectiveDescriptor {
    fn new(kind: CollectiveKind, dim: usize) -> Self {
        Self {
            kind,
            reduce_op: ReduceOp::Sum,
            cluster_axis: None,
            dim,
            topology: Topology::Linear,
            num_links: 1,
            memory_config: None,
            dtype: None,
            output_dtype: None,
        }
    }

    /// Gather every chip's shard along tensor dim `dim`.
    pub fn all_gather(dim: usize) -> Self {
        Self::new(CollectiveKind::AllGather, dim)
    }

    /// Reduce the shards and leave slice `i` of tensor dim `dim` on the
    /// chip at axis position `i`.
    pub fn reduce_scatter(dim: usize) -> Self {
        Self::new(CollectiveKind::ReduceScatter, dim)
    }

    /// Reduce the shards and replicate the result. `dim` (default 3 of the
    /// canonical view) is only used by [`AllReduceMode::Composite`].
    pub fn all_reduce(mode: AllReduceMode) -> Self {
        Self::new(CollectiveKind::AllReduce(mode), 3)
    }

    pub fn with_cluster_axis(mut self, axis: usize) -> Self {
        self.cluster_axis = Some(axis);
        self
    }

    pub fn with_dim(mut self, dim: usize) -> Self {
        self.dim = dim;
        self
    }

    pub fn with_links(mut self, num_links: usize) -> Self {
        self.num_links = num_links;
        self
    }

    pub fn with_topology(mut self, topology: Topology) -> Self {
        self.topology = topology;
        self
    }

    pub fn with_reduce_op(mut self, op: ReduceOp) -> Self {
        self.reduce_op = op;
        self
    }

    /// Output memory config; defaults to the input's.
    pub fn with_memory_config(mut self, config: MemoryConfig) -> Self {
        self.memory_config = Some(config);
        self
    }

    /// Working dtype the input is cast to before transfer.
    pub fn with_dtype(mut self, dtype: DataType) -> Self {
        self.dtype = Some(dtype);
        self
    }

    /// Dtype the result is cast to after reduction.
    pub fn with_output_dtype(mut self, dtype: DataType) -> Self {
        self.output_dtype = Some(dtype);
        self
    }

    pub fn kind(&self) -> CollectiveKind {
        self.kind
    }

    pub fn reduce_op(&self) -> ReduceOp {
        self.reduce_op
    }

    pub fn cluster_axis(&self) -> Option<usize> {
        self.cluster_axis
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn topology(&self) -> Topology {
        self.topology
    }

    pub fn num_links(&self) -> usize {
        self.num_links
    }

    pub fn memory_config(&self) -> Option<MemoryConfig> {
        self.memory_config
    }

    pub fn dtype(&self) -> Option<DataType> {
        self.dtype
    }

    pub fn output_dtype(&self) -> Option<DataType> {
        self.output_dtype
    }

    /// Fails unless this descriptor is of the same kind as `expected`; the
    /// all-reduce mode is not compared.
    pub(crate) fn expect_kind(&self, expected: CollectiveKind) -> Result<()> {
        if std::mem::discriminant(&self.kind) == std::mem::discriminant(&expected) {
            Ok(())
        } else {
            Err(CclError::InvalidConfig(format!(
                "{:?} descriptor passed to a {expected:?} collective",
                self.kind
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_mode() {
        let line = MeshShape::new(1, 8).unwrap();
        assert_eq!(AllReduceMode::default_for(line, Some(1)), AllReduceMode::LineReduce);

        let galaxy = MeshShape::new(8, 4).unwrap();
        assert_eq!(AllReduceMode::default_for(galaxy, Some(0)), AllReduceMode::Fused);
        assert_eq!(AllReduceMode::default_for(galaxy, Some(1)), AllReduceMode::Fused);

        let small = MeshShape::new(2, 4).unwrap();
        assert_eq!(AllReduceMode::default_for(small, Some(0)), AllReduceMode::LineReduce);
    }

    #[test]
    fn test_builder() {
        let desc = CollectiveDescriptor::reduce_scatter(2)
            .with_cluster_axis(0)
            .with_reduce_op(ReduceOp::Max)
            .with_memory_config(MemoryConfig::L1)
            .with_dtype(DataType::Float32);
        assert_eq!(desc.kind(), CollectiveKind::ReduceScatter);
        assert_eq!(desc.dim(), 2);
        assert_eq!(desc.cluster_axis(), Some(0));
        assert_eq!(desc.reduce_op(), ReduceOp::Max);
        assert_eq!(desc.num_links(), 1);
        assert_eq!(desc.topology(), Topology::Linear);
        assert_eq!(desc.memory_config(), Some(MemoryConfig::L1));

        assert!(desc.expect_kind(CollectiveKind::ReduceScatter).is_ok());
        assert!(desc.expect_kind(CollectiveKind::AllGather).is_err());

        let fused = CollectiveDescriptor::all_reduce(AllReduceMode::Fused);
        assert!(fused
            .expect_kind(CollectiveKind::AllReduce(AllReduceMode::LineReduce))
            .is_ok());
    }

    #[test]
    fn test_expect_kind_compares_variants() {
        let composite = CollectiveDescriptor::all_reduce(AllReduceMode::Composite { all_gather_links: 2 });
        assert!(composite
            .expect_kind(CollectiveKind::AllReduce(AllReduceMode::Fused))
            .is_ok());
        assert!(matches!(
            composite.expect_kind(CollectiveKind::ReduceScatter),
            Err(CclError::InvalidConfig(_))
        ));

        let gather = CollectiveDescriptor::all_gather(0);
        assert!(matches!(
            gather.expect_kind(CollectiveKind::AllReduce(AllReduceMode::LineReduce)),
            Err(CclError::InvalidConfig(_))
        ));
    }
}
