use crate::{check_len, dim_extents, KernelElem, KernelError, Result};
use rayon::prelude::*;

/// Splits a row-major buffer into `parts` equal pieces along `dim`.
///
/// Piece `k` holds indices `[k * size / parts, (k + 1) * size / parts)` of
/// `dim` and keeps every other dimension intact, so each piece is itself a
/// row-major buffer of shape `shape` with `shape[dim] / parts` in place of
/// `shape[dim]`.
///
/// # Errors
///
/// - `ShapeMismatch` if `data.len()` does not match `shape`.
/// - `DimOutOfRange` if `dim >= shape.len()`.
/// - `Indivisible` if `shape[dim]` is not a multiple of `parts`.
pub fn cpu_split<T>(data: &[T], shape: &[usize], dim: usize, parts: usize) -> Result<Vec<Vec<T>>>
where
    T: KernelElem,
{
    check_len(data.len(), shape)?;
    let (outer, size, inner) = dim_extents(shape, dim)?;
    if parts == 0 || size % parts != 0 {
        return Err(KernelError::Indivisible { size, parts });
    }

    let piece = size / parts;
    let block = piece * inner;

    let out = (0..parts)
        .into_par_iter()
        .map(|k| {
            let mut buf = Vec::with_capacity(outer * block);
            for o in 0..outer {
                let start = o * size * inner + k * block;
                buf.extend_from_slice(&data[start..start + block]);
            }
            buf
        })
        .collect();
    Ok(out)
}

/// Concatenates equally shaped row-major buffers along `dim`.
///
/// `part_shape` is the shape of every input piece. The result has shape
/// `part_shape` with `part_shape[dim] * parts.len()` in place of
/// `part_shape[dim]`. Inverse of [`cpu_split`].
pub fn cpu_concat<T>(parts: &[&[T]], part_shape: &[usize], dim: usize) -> Result<Vec<T>>
where
    T: KernelElem,
{
    let (outer, size, inner) = dim_extents(part_shape, dim)?;
    for part in parts {
        check_len(part.len(), part_shape)?;
    }

    let block = size * inner;
    let row = block * parts.len();
    let mut out = vec![T::zero(); outer * row];
    if row == 0 {
        return Ok(out);
    }

    out.par_chunks_mut(row).enumerate().for_each(|(o, out_row)| {
        for (k, part) in parts.iter().enumerate() {
            out_row[k * block..(k + 1) * block].copy_from_slice(&part[o * block..(o + 1) * block]);
        }
    });
    Ok(out)
}
