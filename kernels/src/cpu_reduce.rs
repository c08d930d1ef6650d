use crate::{check_len, dim_extents, KernelElem, KernelError, ReduceOp, Result};
use rayon::prelude::*;

/// Folds `src` into `acc` elementwise with `op`.
///
/// This is the receive-side kernel of every reducing collective: a partial
/// result arrives from a neighbour and is combined into the local buffer.
pub fn cpu_accumulate<T>(acc: &mut [T], src: &[T], op: ReduceOp) -> Result<()>
where
    T: KernelElem,
{
    if acc.len() != src.len() {
        return Err(KernelError::ShapeMismatch {
            expected: vec![acc.len()],
            got: vec![src.len()],
        });
    }
    acc.par_iter_mut()
        .zip(src.par_iter())
        .for_each(|(a, &s)| *a = op.combine(*a, s));
    Ok(())
}

/// Reduces a row-major buffer along `dim`, keeping the dimension with size 1.
///
/// Used after a fused all-gather to collapse the gathered copies into a
/// single reduced tensor on each chip.
pub fn cpu_reduce_dim<T>(data: &[T], shape: &[usize], dim: usize, op: ReduceOp) -> Result<Vec<T>>
where
    T: KernelElem,
{
    check_len(data.len(), shape)?;
    let (outer, size, inner) = dim_extents(shape, dim)?;
    let mut out = vec![T::zero(); outer * inner];
    if size == 0 || inner == 0 {
        return Ok(out);
    }

    out.par_chunks_mut(inner).enumerate().for_each(|(o, out_row)| {
        let base = o * size * inner;
        out_row.copy_from_slice(&data[base..base + inner]);
        for j in 1..size {
            let start = base + j * inner;
            for (dst, &src) in out_row.iter_mut().zip(&data[start..start + inner]) {
                *dst = op.combine(*dst, src);
            }
        }
    });
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accumulate_sum() {
        let mut acc = vec![1.0f32, 2.0, 3.0];
        cpu_accumulate(&mut acc, &[10.0, 20.0, 30.0], ReduceOp::Sum).unwrap();
        assert_eq!(acc, vec![11.0, 22.0, 33.0]);
    }

    #[test]
    fn test_accumulate_max() {
        let mut acc = vec![1, 5, 3];
        cpu_accumulate(&mut acc, &[4, 2, 3], ReduceOp::Max).unwrap();
        assert_eq!(acc, vec![4, 5, 3]);
    }

    #[test]
    fn test_accumulate_mismatch() {
        let mut acc = vec![1.0f32];
        let result = cpu_accumulate(&mut acc, &[1.0, 2.0], ReduceOp::Sum);
        assert!(matches!(result, Err(KernelError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_reduce_first_dim() {
        // Three gathered copies of a [1, 2] tensor.
        let data = vec![1.0f32, 2.0, 10.0, 20.0, 100.0, 200.0];
        let out = cpu_reduce_dim(&data, &[3, 1, 2], 0, ReduceOp::Sum).unwrap();
        assert_eq!(out, vec![111.0, 222.0]);
    }

    #[test]
    fn test_reduce_middle_dim_min() {
        // [2, 2, 2]
        let data = vec![4, 1, 2, 3, 8, 9, 5, 7];
        let out = cpu_reduce_dim(&data, &[2, 2, 2], 1, ReduceOp::Min).unwrap();
        assert_eq!(out, vec![2, 1, 5, 7]);
    }
}
