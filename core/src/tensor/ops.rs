//! Data movement on shards: split and concatenate along a dim, reduce
//! along a dim, and the rank-4 view collectives run on.

use super::{DataType, Result, Tensor, TensorElem, TensorError};
use meshccl_kernels::{cpu_concat, cpu_reduce_dim, cpu_split, ReduceOp};

impl<T: TensorElem, const RANK: usize> Tensor<T, RANK> {
    /// Splits into `parts` equal pieces along `dim`.
    ///
    /// # Errors
    ///
    /// `DimOutOfRange` for a bad `dim`, `Indivisible` if `shape[dim]` is
    /// not a multiple of `parts`.
    pub fn split(&self, dim: usize, parts: usize) -> Result<Vec<Self>> {
        let pieces = cpu_split(self.data(), self.shape(), dim, parts)?;
        let mut piece_shape = *self.shape();
        piece_shape[dim] /= parts;
        pieces
            .into_iter()
            .map(|data| Tensor::new(data, piece_shape))
            .collect()
    }

    /// Joins equally shaped tensors along `dim`.
    pub fn concat(parts: &[Self], dim: usize) -> Result<Self> {
        let first = parts.first().ok_or(TensorError::EmptyConcat)?;
        if dim >= RANK {
            return Err(TensorError::DimOutOfRange { dim, rank: RANK });
        }
        if let Some(bad) = parts.iter().find(|p| p.shape() != first.shape()) {
            return Err(TensorError::ShapeMismatch {
                expected: first.shape().to_vec(),
                got: bad.shape().to_vec(),
            });
        }
        let views: Vec<&[T]> = parts.iter().map(Tensor::data).collect();
        let data = cpu_concat(&views, first.shape(), dim)?;
        let mut shape = *first.shape();
        shape[dim] *= parts.len();
        Tensor::new(data, shape)
    }

    /// Reduces along `dim` with `op`, keeping it as a size-1 dim.
    pub fn reduce_dim(&self, dim: usize, op: ReduceOp) -> Result<Self> {
        let data = cpu_reduce_dim(self.data(), self.shape(), dim, op)?;
        let mut shape = *self.shape();
        shape[dim] = 1;
        Tensor::new(data, shape)
    }

    /// Device bytes when stored as `dtype`.
    pub fn nbytes(&self, dtype: DataType) -> usize {
        self.size() * dtype.size_bytes()
    }
}

/// Shape of the `[1, 1, rows, width]` view of a tensor of `shape`: the
/// last dim stays the width and every other dim folds into the rows.
pub fn canonical_shape(shape: &[usize]) -> [usize; 4] {
    match shape.split_last() {
        Some((&width, rest)) => [1, 1, rest.iter().product(), width],
        None => [1, 1, 1, 1],
    }
}
