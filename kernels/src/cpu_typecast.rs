use crate::KernelElem;
use half::{bf16, f16};
use rayon::prelude::*;

/// Rounds every element to the nearest `bfloat16` value in place.
///
/// Storage stays in `T`; only precision is dropped. Values that do not
/// survive the round trip through `f32` (non-float `T`) are left untouched.
pub fn cpu_typecast_bf16<T: KernelElem>(data: &mut [T]) {
    data.par_iter_mut().for_each(|v| {
        if let Some(x) = v.to_f32().and_then(|x| T::from_f32(bf16::from_f32(x).to_f32())) {
            *v = x;
        }
    });
}

/// Rounds every element to the nearest IEEE half-precision value in place.
pub fn cpu_typecast_f16<T: KernelElem>(data: &mut [T]) {
    data.par_iter_mut().for_each(|v| {
        if let Some(x) = v.to_f32().and_then(|x| T::from_f32(f16::from_f32(x).to_f32())) {
            *v = x;
        }
    });
}
