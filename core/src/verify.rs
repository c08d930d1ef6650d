//! Numeric acceptance helpers: Pearson correlation and a golden-run
//! determinism harness.

use tracing::{debug, warn};

use crate::error::Result;
use crate::mesh_tensor::MeshTensor;
use crate::tensor::TensorElem;

/// Pearson correlation coefficient between two equally long buffers.
///
/// Two constant buffers correlate perfectly when they are equal and not at
/// all otherwise. Mismatched lengths and non-finite values give `0.0`.
pub fn pcc<T: TensorElem>(expected: &[T], actual: &[T]) -> f64 {
    if expected.len() != actual.len() || expected.is_empty() {
        return 0.0;
    }
    let a: Vec<f64> = expected.iter().map(|v| v.to_f64().unwrap_or(f64::NAN)).collect();
    let b: Vec<f64> = actual.iter().map(|v| v.to_f64().unwrap_or(f64::NAN)).collect();
    if a.iter().chain(&b).any(|v| !v.is_finite()) {
        return 0.0;
    }

    let n = a.len() as f64;
    let mean_a = a.iter().sum::<f64>() / n;
    let mean_b = b.iter().sum::<f64>() / n;
    let (mut cov, mut var_a, mut var_b) = (0.0, 0.0, 0.0);
    for (x, y) in a.iter().zip(&b) {
        let (dx, dy) = (x - mean_a, y - mean_b);
        cov += dx * dy;
        var_a += dx * dx;
        var_b += dy * dy;
    }
    if var_a == 0.0 || var_b == 0.0 {
        return if a == b { 1.0 } else { 0.0 };
    }
    (cov / (var_a.sqrt() * var_b.sqrt())).clamp(-1.0, 1.0)
}

/// Outcome of a [`DeterminismCheck`].
#[derive(Debug, Clone, PartialEq)]
pub struct DeterminismReport {
    /// Runs compared against the golden one.
    pub trials: usize,
    /// Runs whose output differed from the golden one in at least one bit.
    pub mismatches: usize,
    /// Index of the first differing run.
    pub first_mismatch: Option<usize>,
    /// Lowest PCC any run reached against the golden output.
    pub min_pcc: f64,
    epsilon: f64,
}

impl DeterminismReport {
    pub fn mismatch_rate(&self) -> f64 {
        if self.trials == 0 {
            0.0
        } else {
            self.mismatches as f64 / self.trials as f64
        }
    }

    /// Whether the mismatch rate stayed within the configured tolerance.
    pub fn passes(&self) -> bool {
        self.mismatch_rate() <= self.epsilon
    }
}

/// Runs a computation once to capture a golden output, then repeats it and
/// counts runs whose output is not bit-identical.
///
/// ```no_run
/// # use meshccl::verify::DeterminismCheck;
/// let check = DeterminismCheck::new(100);
/// # let run = || -> meshccl::Result<meshccl::MeshTensor<f32, 2>> { unimplemented!() };
/// let report = check.run(run).unwrap();
/// assert!(report.passes());
/// ```
#[derive(Debug, Clone, Copy)]
pub struct DeterminismCheck {
    iterations: usize,
    epsilon: f64,
}

impl DeterminismCheck {
    pub fn new(iterations: usize) -> Self {
        Self {
            iterations,
            epsilon: 0.0,
        }
    }

    /// Fraction of mismatching runs still accepted by
    /// [`DeterminismReport::passes`].
    pub fn with_epsilon(mut self, epsilon: f64) -> Self {
        self.epsilon = epsilon;
        self
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }

    /// # Errors
    ///
    /// The first error `run` returns. Runs are not retried.
    pub fn run<T, F, const RANK: usize>(&self, mut run: F) -> Result<DeterminismReport>
    where
        T: TensorElem,
        F: FnMut() -> Result<MeshTensor<T, RANK>>,
    {
        let golden = flatten(&run()?);
        let mut report = DeterminismReport {
            trials: self.iterations,
            mismatches: 0,
            first_mismatch: None,
            min_pcc: 1.0,
            epsilon: self.epsilon,
        };

        for iteration in 0..self.iterations {
            let output = flatten(&run()?);
            if bit_identical(&golden, &output) {
                continue;
            }
            let score = pcc(&golden, &output);
            warn!(iteration, pcc = score, "output differs from golden run");
            report.mismatches += 1;
            report.first_mismatch.get_or_insert(iteration);
            report.min_pcc = report.min_pcc.min(score);
        }

        debug!(
            trials = report.trials,
            mismatches = report.mismatches,
            "determinism check finished"
        );
        Ok(report)
    }
}

fn flatten<T: TensorElem, const RANK: usize>(tensor: &MeshTensor<T, RANK>) -> Vec<T> {
    tensor
        .shards()
        .iter()
        .flat_map(|s| s.data().iter().copied())
        .collect()
}

fn bit_identical<T: TensorElem>(a: &[T], b: &[T]) -> bool {
    let bits = |v: &T| v.to_f64().map(f64::to_bits);
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| bits(x) == bits(y))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::{DeviceParams, MemoryConfig, MeshDevice, MeshShape};
    use crate::tensor::{DataType, Tensor};

    #[test]
    fn test_pcc_perfect_and_inverse() {
        let a = [1.0f32, 2.0, 3.0, 4.0];
        let b = [2.0f32, 4.0, 6.0, 8.0];
        let c = [4.0f32, 3.0, 2.0, 1.0];
        assert!((pcc(&a, &b) - 1.0).abs() < 1e-12);
        assert!((pcc(&a, &c) + 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_pcc_degenerate() {
        assert_eq!(pcc(&[3.0f32; 5], &[3.0f32; 5]), 1.0);
        assert_eq!(pcc(&[3.0f32; 5], &[2.0f32; 5]), 0.0);
        assert_eq!(pcc(&[1.0f32, 2.0], &[1.0f32]), 0.0);
        assert_eq!(pcc(&[1.0f32, f32::NAN], &[1.0f32, 2.0]), 0.0);
    }

    #[test]
    fn test_pcc_noise() {
        let a: Vec<f32> = (0..100).map(|i| i as f32).collect();
        let b: Vec<f32> = a.iter().enumerate().map(|(i, v)| v + (i % 3) as f32 * 0.01).collect();
        assert!(pcc(&a, &b) > 0.999);
    }

    fn mesh() -> MeshDevice {
        MeshDevice::open(MeshShape::new(1, 2).unwrap(), DeviceParams::default()).unwrap()
    }

    #[test]
    fn test_deterministic_run_passes() {
        let mesh = mesh();
        let host = Tensor::<f32, 2>::from_fn([2, 4], |i| i as f32);
        let report = DeterminismCheck::new(5)
            .run(|| MeshTensor::replicate(&mesh, &host, DataType::Float32, MemoryConfig::DRAM))
            .unwrap();
        assert_eq!(report.trials, 5);
        assert_eq!(report.mismatches, 0);
        assert_eq!(report.first_mismatch, None);
        assert!(report.passes());
    }

    #[test]
    fn test_mismatches_are_counted() {
        let mesh = mesh();
        let mut call = 0;
        let check = DeterminismCheck::new(4);
        let report = check
            .run(|| {
                call += 1;
                // the third call onwards drifts by one ulp in a single value
                let drift = if call >= 3 { f32::EPSILON } else { 0.0 };
                let host = Tensor::<f32, 2>::from_fn([2, 4], |i| match i {
                    0 => 1.0 + drift,
                    _ => i as f32 + 1.0,
                });
                MeshTensor::replicate(&mesh, &host, DataType::Float32, MemoryConfig::DRAM)
            })
            .unwrap();
        assert_eq!(report.mismatches, 3);
        assert_eq!(report.first_mismatch, Some(1));
        assert!(!report.passes());
        assert!(report.min_pcc > 0.999);

        let ones = Tensor::<f32, 2>::ones([1, 1]);
        let tolerant = check
            .with_epsilon(0.75)
            .run(|| MeshTensor::replicate(&mesh, &ones, DataType::Float32, MemoryConfig::DRAM))
            .unwrap();
        assert!(tolerant.passes());
    }
}
