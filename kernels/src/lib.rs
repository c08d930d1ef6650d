//! Device-local kernels for the mesh collective layer.
//!
//! Every function here operates on one chip's flat, row-major buffer. The
//! collective dispatcher composes them with point-to-point transfers: a
//! reduce-scatter is `cpu_split` + transfers + `cpu_accumulate`, a fused
//! all-reduce is transfers + `cpu_concat` + `cpu_reduce_dim`, and so on.

use num_traits::{FromPrimitive, Num, NumAssign, ToPrimitive};
use std::fmt::Debug;
use thiserror::Error;

pub mod cpu_reduce;
pub mod cpu_split;
pub mod cpu_typecast;

pub use cpu_reduce::{cpu_accumulate, cpu_reduce_dim};
pub use cpu_split::{cpu_concat, cpu_split};
pub use cpu_typecast::{cpu_typecast_bf16, cpu_typecast_f16};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KernelError {
    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    #[error("Dimension {dim} out of range for rank {rank}")]
    DimOutOfRange { dim: usize, rank: usize },
    #[error("Dimension of size {size} cannot be split into {parts} equal parts")]
    Indivisible { size: usize, parts: usize },
}

pub type Result<T> = std::result::Result<T, KernelError>;

/// Trait bound for elements that can be processed by kernels.
/// This mirrors `TensorElem` in the main crate to avoid circular dependencies.
pub trait KernelElem:
    Num + NumAssign + Copy + Clone + Debug + Send + Sync + FromPrimitive + ToPrimitive + PartialOrd
{
}

impl<T> KernelElem for T where
    T: Num
        + NumAssign
        + Copy
        + Clone
        + Debug
        + Send
        + Sync
        + FromPrimitive
        + ToPrimitive
        + PartialOrd
{
}

/// Elementwise combine applied by reducing collectives.
///
/// All variants are associative and commutative, so the order in which
/// partial results arrive over the fabric does not change the value beyond
/// floating-point rounding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ReduceOp {
    #[default]
    Sum,
    Max,
    Min,
}

impl ReduceOp {
    #[inline]
    pub fn combine<T: KernelElem>(self, acc: T, rhs: T) -> T {
        match self {
            ReduceOp::Sum => acc + rhs,
            ReduceOp::Max => {
                if rhs > acc {
                    rhs
                } else {
                    acc
                }
            }
            ReduceOp::Min => {
                if rhs < acc {
                    rhs
                } else {
                    acc
                }
            }
        }
    }
}

/// Splits `shape` around `dim` into `(outer, dim_size, inner)` extents.
///
/// `outer` is the product of the dimensions before `dim`, `inner` the product
/// of those after it. A row-major buffer is then `outer` blocks of
/// `dim_size * inner` contiguous elements.
pub fn dim_extents(shape: &[usize], dim: usize) -> Result<(usize, usize, usize)> {
    if dim >= shape.len() {
        return Err(KernelError::DimOutOfRange {
            dim,
            rank: shape.len(),
        });
    }
    let outer = shape[..dim].iter().product();
    let inner = shape[dim + 1..].iter().product();
    Ok((outer, shape[dim], inner))
}

fn check_len(len: usize, shape: &[usize]) -> Result<()> {
    let size: usize = shape.iter().product();
    if len != size {
        return Err(KernelError::ShapeMismatch {
            expected: vec![size],
            got: vec![len],
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reduce_op_combine() {
        assert_eq!(ReduceOp::Sum.combine(2.0f32, 3.0), 5.0);
        assert_eq!(ReduceOp::Max.combine(2.0f32, 3.0), 3.0);
        assert_eq!(ReduceOp::Min.combine(2.0f32, 3.0), 2.0);
        assert_eq!(ReduceOp::default(), ReduceOp::Sum);
    }

    #[test]
    fn test_dim_extents() {
        assert_eq!(dim_extents(&[2, 3, 4], 1).unwrap(), (2, 3, 4));
        assert_eq!(dim_extents(&[2, 3, 4], 0).unwrap(), (1, 2, 12));
        assert_eq!(dim_extents(&[2, 3, 4], 2).unwrap(), (6, 4, 1));
        assert!(matches!(
            dim_extents(&[2, 3], 2),
            Err(KernelError::DimOutOfRange { dim: 2, rank: 2 })
        ));
    }
}
