//! Host-side shard type.
//!
//! Every chip's piece of a [`crate::MeshTensor`] is a `Tensor`: a flat
//! row-major buffer and a shape whose rank is a const generic. Collectives
//! only ever split, concatenate, reduce and round shards, so that is all
//! this module offers.
//!
//! ```rust
//! use meshccl::tensor::Tensor;
//!
//! let t = Tensor::<f32, 2>::from_fn([2, 4], |i| i as f32);
//! let halves = t.split(1, 2).unwrap();
//! assert_eq!(halves[1].data(), &[2.0, 3.0, 6.0, 7.0]);
//! assert_eq!(Tensor::concat(&halves, 1).unwrap(), t);
//! ```

use meshccl_kernels::{KernelElem, KernelError};
use std::fmt::Debug;
use thiserror::Error;

pub mod dtype;
pub mod ops;

pub use dtype::DataType;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TensorError {
    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    #[error("Dimension {dim} out of range for rank {rank}")]
    DimOutOfRange { dim: usize, rank: usize },
    #[error("dimension of size {size} cannot be split into {parts} parts")]
    Indivisible { size: usize, parts: usize },
    #[error("cannot concatenate zero tensors")]
    EmptyConcat,
}

impl From<KernelError> for TensorError {
    fn from(e: KernelError) -> Self {
        match e {
            KernelError::ShapeMismatch { expected, got } => TensorError::ShapeMismatch { expected, got },
            KernelError::DimOutOfRange { dim, rank } => TensorError::DimOutOfRange { dim, rank },
            KernelError::Indivisible { size, parts } => TensorError::Indivisible { size, parts },
        }
    }
}

pub type Result<T> = std::result::Result<T, TensorError>;

/// Element types a shard can hold: anything the host kernels accept.
pub trait TensorElem: KernelElem {}

impl<T: KernelElem> TensorElem for T {}

/// A dense row-major tensor of rank `RANK`.
#[derive(Clone, PartialEq)]
pub struct Tensor<T: TensorElem, const RANK: usize> {
    shape: [usize; RANK],
    data: Vec<T>,
}

impl<T: TensorElem, const RANK: usize> Tensor<T, RANK> {
    /// # Errors
    ///
    /// `ShapeMismatch` if `data` does not hold exactly `shape`'s element count.
    pub fn new(data: Vec<T>, shape: [usize; RANK]) -> Result<Self> {
        let size: usize = shape.iter().product();
        if data.len() != size {
            return Err(TensorError::ShapeMismatch {
                expected: vec![size],
                got: vec![data.len()],
            });
        }
        Ok(Self { shape, data })
    }

    pub fn full(shape: [usize; RANK], value: T) -> Self {
        Self {
            shape,
            data: vec![value; shape.iter().product()],
        }
    }

    pub fn zeros(shape: [usize; RANK]) -> Self {
        Self::full(shape, T::zero())
    }

    pub fn ones(shape: [usize; RANK]) -> Self {
        Self::full(shape, T::one())
    }

    /// Element `i` of the flat buffer is `f(i)`.
    pub fn from_fn<F>(shape: [usize; RANK], f: F) -> Self
    where
        F: FnMut(usize) -> T,
    {
        let size: usize = shape.iter().product();
        Self {
            shape,
            data: (0..size).map(f).collect(),
        }
    }

    /// Reinterprets the buffer with `shape`, possibly of another rank.
    ///
    /// # Errors
    ///
    /// `ShapeMismatch` if the element counts differ.
    pub fn reshape<const NEW_RANK: usize>(self, shape: [usize; NEW_RANK]) -> Result<Tensor<T, NEW_RANK>> {
        Tensor::new(self.data, shape)
    }

    pub const fn shape(&self) -> &[usize; RANK] {
        &self.shape
    }

    pub fn data(&self) -> &[T] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [T] {
        &mut self.data
    }

    pub fn into_data(self) -> Vec<T> {
        self.data
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }
}

impl<T: TensorElem, const RANK: usize> Debug for Tensor<T, RANK> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tensor")
            .field("shape", &self.shape)
            .field("len", &self.data.len())
            .finish()
    }
}
