//! Element formats a shard can be stored in on device.
//!
//! Shard buffers always hold `T` on the host side; a `DataType` records the
//! precision the device keeps and is applied by rounding values on every
//! typecast. This is what makes a bf16 all-reduce lose bits the same way
//! the hardware would.

use meshccl_kernels::{cpu_typecast_bf16, cpu_typecast_f16};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::TensorElem;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Float32,
    #[default]
    BFloat16,
    Float16,
}

impl DataType {
    /// Bytes per element on device.
    pub const fn size_bytes(self) -> usize {
        match self {
            DataType::Float32 => 4,
            DataType::BFloat16 | DataType::Float16 => 2,
        }
    }

    /// Rounds `data` in place to this format's precision.
    pub fn quantize<T: TensorElem>(self, data: &mut [T]) {
        match self {
            DataType::Float32 => {}
            DataType::BFloat16 => cpu_typecast_bf16(data),
            DataType::Float16 => cpu_typecast_f16(data),
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::Float32 => write!(f, "float32"),
            DataType::BFloat16 => write!(f, "bfloat16"),
            DataType::Float16 => write!(f, "float16"),
        }
    }
}
