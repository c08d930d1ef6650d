//! Normalization of activations whose feature dim is sharded across a mesh
//! axis.
//!
//! A full all-reduce of the activation is avoided. Instead:
//!
//! 1. [`DistributedNorm::pre_all_gather`] computes per-row statistics of the
//!    local shard (`[Σx²]` for RMS, `[Σx, Σx²]` for layer norm),
//! 2. the statistics, one or two values per row per chip, are all-gathered
//!    along the axis,
//! 3. [`DistributedNorm::post_all_gather`] folds the gathered statistics into
//!    global moments and normalizes the local shard with its slice of the
//!    weights. No further communication happens.

use num_traits::Float;
use rayon::prelude::*;

use crate::ccl::{CollectiveBackend, CollectiveDescriptor, Topology};
use crate::error::{CclError, Result};
use crate::mesh::{ChipId, MemoryConfig};
use crate::mesh_tensor::MeshTensor;
use crate::tensor::{DataType, Tensor, TensorElem, TensorError};

/// Which normalization to apply, with its full-width parameters.
#[derive(Debug, Clone)]
pub enum NormKind<T: TensorElem> {
    /// `y = x / sqrt(mean(x²) + eps) * weight`
    Rms { weight: Tensor<T, 1> },
    /// `y = (x - mean) / sqrt(var + eps) * weight + bias`
    Layer {
        weight: Tensor<T, 1>,
        bias: Tensor<T, 1>,
    },
}

impl<T: TensorElem> NormKind<T> {
    /// Statistics per row a chip contributes.
    fn stats_per_row(&self) -> usize {
        match self {
            NormKind::Rms { .. } => 1,
            NormKind::Layer { .. } => 2,
        }
    }

    fn width(&self) -> usize {
        match self {
            NormKind::Rms { weight } | NormKind::Layer { weight, .. } => weight.shape()[0],
        }
    }
}

/// A norm over the last dim of a tensor sharded along it.
#[derive(Debug, Clone)]
pub struct DistributedNorm<T: TensorElem> {
    kind: NormKind<T>,
    eps: T,
    cluster_axis: Option<usize>,
    num_links: usize,
    topology: Topology,
}

impl<T: TensorElem + Float + 'static> DistributedNorm<T> {
    /// # Errors
    ///
    /// `Tensor(ShapeMismatch)` if a layer norm's weight and bias differ in
    /// width.
    pub fn new(kind: NormKind<T>, eps: T, cluster_axis: Option<usize>) -> Result<Self> {
        if let NormKind::Layer { weight, bias } = &kind {
            if weight.shape() != bias.shape() {
                return Err(TensorError::ShapeMismatch {
                    expected: weight.shape().to_vec(),
                    got: bias.shape().to_vec(),
                }
                .into());
            }
        }
        Ok(Self {
            kind,
            eps,
            cluster_axis,
            num_links: 1,
            topology: Topology::Linear,
        })
    }

    pub fn with_links(mut self, num_links: usize) -> Self {
        self.num_links = num_links;
        self
    }

    pub fn with_topology(mut self, topology: Topology) -> Self {
        self.topology = topology;
        self
    }

    pub fn kind(&self) -> &NormKind<T> {
        &self.kind
    }

    /// Runs all three phases.
    pub fn forward<B, const RANK: usize>(
        &self,
        backend: &B,
        input: &MeshTensor<T, RANK>,
    ) -> Result<MeshTensor<T, RANK>>
    where
        B: CollectiveBackend,
    {
        let local = self.pre_all_gather(backend, input)?;
        let desc = CollectiveDescriptor::all_gather(RANK - 1)
            .with_links(self.num_links)
            .with_topology(self.topology);
        let desc = match self.cluster_axis {
            Some(axis) => desc.with_cluster_axis(axis),
            None => desc,
        };
        let global = backend.all_gather(local, &desc)?;
        self.post_all_gather(backend, input, &global)
    }

    /// Per-row statistics of every chip's local shard, shape `[.., s]` with
    /// `s` values per row, kept in float32.
    pub fn pre_all_gather<B, const RANK: usize>(
        &self,
        backend: &B,
        input: &MeshTensor<T, RANK>,
    ) -> Result<MeshTensor<T, RANK>>
    where
        B: CollectiveBackend,
    {
        self.check_width(backend, input)?;
        let per_row = self.kind.stats_per_row();
        let shards = input
            .shards()
            .iter()
            .map(|shard| {
                let width = shard.shape()[RANK - 1];
                let mut shape = *shard.shape();
                shape[RANK - 1] = per_row;
                let mut stats = Tensor::<T, RANK>::zeros(shape);
                stats
                    .data_mut()
                    .par_chunks_mut(per_row)
                    .zip(shard.data().par_chunks(width))
                    .for_each(|(out, row)| {
                        let sum_sq = row.iter().fold(T::zero(), |acc, &v| acc + v * v);
                        match per_row {
                            1 => out[0] = sum_sq,
                            _ => {
                                out[0] = row.iter().fold(T::zero(), |acc, &v| acc + v);
                                out[1] = sum_sq;
                            }
                        }
                    });
                stats
            })
            .collect();
        MeshTensor::from_shards(backend.mesh(), shards, DataType::Float32, MemoryConfig::L1)
    }

    /// Normalizes each chip's shard of `input` using `stats`, the
    /// all-gathered output of [`DistributedNorm::pre_all_gather`].
    ///
    /// # Errors
    ///
    /// `Tensor(ShapeMismatch)` if the sharded width does not match the
    /// weights or `stats` has a different row count, `InvalidConfig` if
    /// `stats` holds the wrong number of values per row.
    pub fn post_all_gather<B, const RANK: usize>(
        &self,
        backend: &B,
        input: &MeshTensor<T, RANK>,
        stats: &MeshTensor<T, RANK>,
    ) -> Result<MeshTensor<T, RANK>>
    where
        B: CollectiveBackend,
    {
        self.check_width(backend, input)?;
        let (input_shape, stats_shape) = (input.shard_shape(), stats.shard_shape());
        if input_shape[..RANK - 1] != stats_shape[..RANK - 1] {
            return Err(TensorError::ShapeMismatch {
                expected: input_shape[..RANK - 1].to_vec(),
                got: stats_shape[..RANK - 1].to_vec(),
            }
            .into());
        }
        let mesh = backend.mesh();
        let axis_size = mesh.shape().axis_size(self.cluster_axis)?;
        let width = input.shard_shape()[RANK - 1];
        let per_row = self.kind.stats_per_row();
        let gathered = stats.shard_shape()[RANK - 1];
        if gathered != per_row * axis_size {
            return Err(CclError::InvalidConfig(format!(
                "expected {} gathered statistics per row, got {gathered}",
                per_row * axis_size
            )));
        }
        let n = T::from_usize(width * axis_size).ok_or_else(|| {
            CclError::InvalidConfig(format!("width {} not representable", width * axis_size))
        })?;

        let shards = input
            .shards()
            .iter()
            .zip(stats.shards())
            .enumerate()
            .map(|(chip, (shard, stat))| -> Result<Tensor<T, RANK>> {
                let pos = mesh.shape().position_along(ChipId(chip), self.cluster_axis)?;
                let (weight, bias) = self.params_slice(pos * width, width)?;
                let mut out = Tensor::<T, RANK>::zeros(*shard.shape());
                out.data_mut()
                    .par_chunks_mut(width)
                    .zip(shard.data().par_chunks(width))
                    .zip(stat.data().par_chunks(gathered))
                    .for_each(|((out_row, in_row), stat_row)| {
                        let (mean, var) = match per_row {
                            1 => {
                                let sum_sq = stat_row.iter().fold(T::zero(), |a, &v| a + v);
                                (T::zero(), sum_sq / n)
                            }
                            _ => {
                                let (sum, sum_sq) = stat_row
                                    .chunks(2)
                                    .fold((T::zero(), T::zero()), |(s, q), c| (s + c[0], q + c[1]));
                                let mean = sum / n;
                                (mean, sum_sq / n - mean * mean)
                            }
                        };
                        let rstd = T::one() / (var + self.eps).sqrt();
                        for (j, o) in out_row.iter_mut().enumerate() {
                            let y = (in_row[j] - mean) * rstd * weight[j];
                            *o = bias.map_or(y, |b| y + b[j]);
                        }
                    });
                Ok(out)
            })
            .collect::<Result<Vec<_>>>()?;
        MeshTensor::from_shards(mesh, shards, input.dtype(), input.memory_config())
    }

    /// Columns `start..start + len` of the weight and bias.
    fn params_slice(&self, start: usize, len: usize) -> Result<(&[T], Option<&[T]>)> {
        let range = start..start + len;
        let out_of_range = || {
            CclError::InvalidConfig(format!(
                "columns {range:?} exceed the norm width {}",
                self.kind.width()
            ))
        };
        match &self.kind {
            NormKind::Rms { weight } => Ok((
                weight.data().get(range.clone()).ok_or_else(out_of_range)?,
                None,
            )),
            NormKind::Layer { weight, bias } => Ok((
                weight.data().get(range.clone()).ok_or_else(out_of_range)?,
                Some(bias.data().get(range.clone()).ok_or_else(out_of_range)?),
            )),
        }
    }

    fn check_width<B: CollectiveBackend, const RANK: usize>(
        &self,
        backend: &B,
        input: &MeshTensor<T, RANK>,
    ) -> Result<()> {
        let axis_size = backend.mesh().shape().axis_size(self.cluster_axis)?;
        let local = input.shard_shape()[RANK - 1];
        if local == 0 {
            return Err(CclError::InvalidConfig(
                "cannot normalize over an empty feature dim".into(),
            ));
        }
        if local.checked_mul(axis_size) != Some(self.kind.width()) {
            return Err(TensorError::ShapeMismatch {
                expected: vec![self.kind.width()],
                got: vec![local.saturating_mul(axis_size)],
            }
            .into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::{FabricConfig, FabricSession};
    use crate::mesh::{CoreCoord, CoreRange, DeviceParams, MeshDevice, MeshShape};
    use crate::sub_device::{SubDevice, SubDeviceLayout};

    fn mesh(rows: usize, cols: usize) -> MeshDevice {
        let mesh = MeshDevice::open(MeshShape::new(rows, cols).unwrap(), DeviceParams::default())
            .unwrap();
        let workers = CoreRange::new(CoreCoord::new(0, 0), CoreCoord::new(1, 0));
        let layout = SubDeviceLayout::Replicated(vec![SubDevice::new(workers.into())]);
        let id = mesh.create_sub_device_manager(&layout, 0).unwrap();
        mesh.load_sub_device_manager(id).unwrap();
        mesh
    }

    fn reference(x: &[f32], weight: &[f32], bias: Option<&[f32]>, eps: f32) -> Vec<f32> {
        let n = x.len() as f32;
        let (mean, var) = match bias {
            None => (0.0, x.iter().map(|v| v * v).sum::<f32>() / n),
            Some(_) => {
                let mean = x.iter().sum::<f32>() / n;
                (mean, x.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / n)
            }
        };
        let rstd = 1.0 / (var + eps).sqrt();
        x.iter()
            .enumerate()
            .map(|(j, v)| (v - mean) * rstd * weight[j] + bias.map_or(0.0, |b| b[j]))
            .collect()
    }

    fn check(kind: NormKind<f32>) {
        let mesh = mesh(1, 4);
        let session = FabricSession::open(&mesh, FabricConfig::default()).unwrap();
        let x = Tensor::<f32, 2>::from_fn([3, 16], |i| ((i * 7) % 11) as f32 - 5.0);
        let input = MeshTensor::shard(&mesh, &x, 1, None, DataType::Float32, MemoryConfig::DRAM)
            .unwrap();

        let (weight, bias) = match &kind {
            NormKind::Rms { weight } => (weight.data().to_vec(), None),
            NormKind::Layer { weight, bias } => (weight.data().to_vec(), Some(bias.data().to_vec())),
        };
        let norm = DistributedNorm::new(kind, 1e-5, None).unwrap().with_links(2);
        let out = norm.forward(&session, &input).unwrap();
        let got = out.concat_along(1, None, 0).unwrap();

        for (row, got_row) in x.data().chunks(16).zip(got.data().chunks(16)) {
            let want = reference(row, &weight, bias.as_deref(), 1e-5);
            for (g, w) in got_row.iter().zip(&want) {
                assert!((g - w).abs() < 1e-4, "got {g}, want {w}");
            }
        }
        session.close().unwrap();
    }

    #[test]
    fn test_rms_matches_full_width() {
        let weight = Tensor::from_fn([16], |i| 0.5 + i as f32 / 16.0);
        check(NormKind::Rms { weight });
    }

    #[test]
    fn test_layer_matches_full_width() {
        let weight = Tensor::from_fn([16], |i| 1.0 + i as f32 / 32.0);
        let bias = Tensor::from_fn([16], |i| i as f32 / 8.0 - 1.0);
        check(NormKind::Layer { weight, bias });
    }

    #[test]
    fn test_statistics_are_small() {
        let mesh = mesh(1, 2);
        let session = FabricSession::open(&mesh, FabricConfig::default()).unwrap();
        let x = Tensor::<f32, 2>::ones([4, 64]);
        let input = MeshTensor::shard(&mesh, &x, 1, None, DataType::Float32, MemoryConfig::DRAM)
            .unwrap();
        let norm = DistributedNorm::new(NormKind::Rms { weight: Tensor::ones([64]) }, 1e-5, None)
            .unwrap();
        let stats = norm.pre_all_gather(&session, &input).unwrap();
        assert_eq!(stats.shard_shape(), [4, 1]);
        assert_eq!(stats.shards()[0].data(), &[32.0; 4]);
        session.close().unwrap();
    }

    #[test]
    fn test_width_mismatch() {
        let mesh = mesh(1, 2);
        let session = FabricSession::open(&mesh, FabricConfig::default()).unwrap();
        let input = MeshTensor::replicate(
            &mesh,
            &Tensor::<f32, 2>::ones([1, 8]),
            DataType::Float32,
            MemoryConfig::DRAM,
        )
        .unwrap();
        let norm = DistributedNorm::new(NormKind::Rms { weight: Tensor::ones([8]) }, 1e-5, None)
            .unwrap();
        assert!(matches!(
            norm.forward(&session, &input),
            Err(CclError::Tensor(TensorError::ShapeMismatch { .. }))
        ));
        session.close().unwrap();
    }

    #[test]
    fn test_post_all_gather_rejects_mismatched_width() {
        let mesh = mesh(1, 2);
        let session = FabricSession::open(&mesh, FabricConfig::default()).unwrap();
        let input = MeshTensor::replicate(
            &mesh,
            &Tensor::<f32, 2>::ones([2, 8]),
            DataType::Float32,
            MemoryConfig::DRAM,
        )
        .unwrap();
        let stats = MeshTensor::replicate(
            &mesh,
            &Tensor::<f32, 2>::ones([2, 2]),
            DataType::Float32,
            MemoryConfig::L1,
        )
        .unwrap();
        let norm = DistributedNorm::new(NormKind::Rms { weight: Tensor::ones([8]) }, 1e-5, None)
            .unwrap();
        assert!(matches!(
            norm.post_all_gather(&session, &input, &stats),
            Err(CclError::Tensor(TensorError::ShapeMismatch { .. }))
        ));
        session.close().unwrap();
    }

    #[test]
    fn test_post_all_gather_rejects_short_stats() {
        let mesh = mesh(1, 2);
        let session = FabricSession::open(&mesh, FabricConfig::default()).unwrap();
        let x = Tensor::<f32, 2>::ones([4, 8]);
        let input = MeshTensor::shard(&mesh, &x, 1, None, DataType::Float32, MemoryConfig::DRAM)
            .unwrap();
        let stats = MeshTensor::replicate(
            &mesh,
            &Tensor::<f32, 2>::ones([3, 2]),
            DataType::Float32,
            MemoryConfig::L1,
        )
        .unwrap();
        let norm = DistributedNorm::new(NormKind::Rms { weight: Tensor::ones([8]) }, 1e-5, None)
            .unwrap();
        assert!(matches!(
            norm.post_all_gather(&session, &input, &stats),
            Err(CclError::Tensor(TensorError::ShapeMismatch { .. }))
        ));
        session.close().unwrap();
    }

    #[test]
    fn test_empty_feature_dim() {
        let mesh = mesh(1, 2);
        let session = FabricSession::open(&mesh, FabricConfig::default()).unwrap();
        let input = MeshTensor::replicate(
            &mesh,
            &Tensor::<f32, 2>::zeros([2, 0]),
            DataType::Float32,
            MemoryConfig::DRAM,
        )
        .unwrap();
        let norm = DistributedNorm::new(NormKind::Rms { weight: Tensor::ones([0]) }, 1e-5, None)
            .unwrap();
        assert!(matches!(
            norm.pre_all_gather(&session, &input),
            Err(CclError::InvalidConfig(_))
        ));
        session.close().unwrap();
    }
}
