//! Reduce-scatter: the shards are combined elementwise and chip `i` of the
//! axis keeps slice `i` of the scatter dim.

use super::descriptor::{CollectiveDescriptor, CollectiveKind, ReduceOp, Topology};
use super::dispatch::{run_lanes, Lane, Route};
use crate::error::{CclError, Result};
use crate::fabric::{Direction, Fabric};
use crate::mesh::MemoryConfig;
use crate::mesh_tensor::MeshTensor;
use crate::tensor::{Tensor, TensorElem};

pub(crate) fn reduce_scatter<T, const RANK: usize>(
    fabric: &Fabric,
    input: MeshTensor<T, RANK>,
    desc: &CollectiveDescriptor,
) -> Result<MeshTensor<T, RANK>>
where
    T: TensorElem + 'static,
{
    desc.expect_kind(CollectiveKind::ReduceScatter)?;
    let route = Route {
        axis: desc.cluster_axis(),
        links: desc.num_links(),
        topology: desc.topology(),
    };
    let plan = fabric.plan(route)?;
    check_scatter_dim(&input, desc.dim(), plan.axis_size)?;
    if plan.axis_size == 1 {
        fabric.stats.record_identity();
        return Ok(input);
    }

    let in_config = input.memory_config();
    let out_config = desc.memory_config().unwrap_or(in_config);
    let working = desc.dtype().unwrap_or(input.dtype());
    let input = fabric.reformat(input, working, scatter_input_config(in_config))?;
    let reduced = scatter(fabric, input, desc.dim(), route, desc.reduce_op(), out_config)?;
    match desc.output_dtype() {
        Some(dtype) => fabric.reformat(reduced, dtype, out_config),
        None => Ok(reduced),
    }
}

/// Sharded inputs are converted to interleaved L1 before scattering.
pub(crate) fn scatter_input_config(config: MemoryConfig) -> MemoryConfig {
    if config.is_sharded() {
        MemoryConfig::L1
    } else {
        config
    }
}

pub(crate) fn check_scatter_dim<T: TensorElem, const RANK: usize>(
    input: &MeshTensor<T, RANK>,
    dim: usize,
    devices: usize,
) -> Result<()> {
    if dim >= RANK {
        return Err(CclError::InvalidDim { dim, rank: RANK });
    }
    let size = input.shard_shape()[dim];
    if size % devices != 0 {
        return Err(CclError::IndivisibleDim { dim, size, devices });
    }
    Ok(())
}

/// Reduce-scatters an already formatted `input` along `dim`.
pub(crate) fn scatter<T, const RANK: usize>(
    fabric: &Fabric,
    input: MeshTensor<T, RANK>,
    dim: usize,
    route: Route,
    op: ReduceOp,
    out_config: MemoryConfig,
) -> Result<MeshTensor<T, RANK>>
where
    T: TensorElem + 'static,
{
    let plan = fabric.plan(route)?;
    check_scatter_dim(&input, dim, plan.axis_size)?;
    if plan.axis_size == 1 {
        fabric.stats.record_identity();
        return Ok(input);
    }
    fabric.stats.record_collective();
    tracing::debug!(
        kind = "reduce_scatter",
        axis = ?route.axis,
        dim,
        links = route.links,
        topology = ?route.topology,
        ?op,
        group = plan.axis_size,
        "dispatching collective"
    );

    let mut chunk_shape = input.shard_shape();
    chunk_shape[dim] /= plan.axis_size;
    let inputs = input
        .shards()
        .iter()
        .map(|s| -> Result<Vec<Vec<T>>> {
            Ok(s.split(dim, plan.axis_size)?
                .into_iter()
                .map(Tensor::into_data)
                .collect())
        })
        .collect::<Result<Vec<_>>>()?;
    let outputs = run_lanes(fabric, &plan, input.dtype(), inputs, |lane, chunks| {
        let mine = match route.topology {
            Topology::Ring => ring(lane, chunks, op)?,
            Topology::Linear => line(lane, chunks, op)?,
        };
        Ok(vec![mine])
    })?;

    let shards = outputs
        .into_iter()
        .map(|chunks| Tensor::new(chunks.into_iter().flatten().collect(), chunk_shape))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    input.with_shards(&fabric.mesh, shards, out_config)
}

/// Ring reduce-scatter: at step `s` chip `i` sends its partial of chunk
/// `i - s - 1` right and folds the partial of chunk `i - s - 2` arriving from
/// the left into its own. After `K - 1` steps chunk `i` is complete.
fn ring<T: TensorElem + 'static>(
    lane: &Lane<'_>,
    mut chunks: Vec<Vec<T>>,
    op: ReduceOp,
) -> Result<Vec<T>> {
    let k = lane.size() as isize;
    let i = lane.pos() as isize;
    let right = (i + 1).rem_euclid(k) as usize;

    for step in 0..k - 1 {
        let send_idx = (i - step - 1).rem_euclid(k) as usize;
        let recv_idx = (i - step - 2).rem_euclid(k) as usize;
        lane.send(right, Direction::Forward, send_idx, chunks[send_idx].clone())?;
        let partial: Vec<T> = lane.recv(Direction::Forward, recv_idx)?;
        lane.accumulate(&mut chunks[recv_idx], &partial, op)?;
    }
    Ok(std::mem::take(&mut chunks[i as usize]))
}

/// Line reduce-scatter: partials for chunks right of `i` flow rightwards and
/// those left of `i` flow leftwards, each chip folding in its own shard on
/// the way. Chip `i` combines what reaches it from both sides with its own
/// chunk `i`.
fn line<T: TensorElem + 'static>(
    lane: &Lane<'_>,
    mut chunks: Vec<Vec<T>>,
    op: ReduceOp,
) -> Result<Vec<T>> {
    let k = lane.size();
    let i = lane.pos();

    // Rightward: chunks i..k carry the reduction of positions 0..i.
    if i > 0 {
        for c in i..k {
            let partial: Vec<T> = lane.recv(Direction::Forward, c)?;
            lane.accumulate(&mut chunks[c], &partial, op)?;
        }
    }
    if i + 1 < k {
        for c in i + 1..k {
            lane.send(i + 1, Direction::Forward, c, chunks[c].clone())?;
        }
    }

    // Leftward: chunks 0..=i carry the reduction of positions i+1..k. Only
    // the received partials are accumulated for chunk i, which already holds
    // the left side and this chip's own contribution.
    if i + 1 < k {
        for c in 0..=i {
            let partial: Vec<T> = lane.recv(Direction::Backward, c)?;
            lane.accumulate(&mut chunks[c], &partial, op)?;
        }
    }
    if i > 0 {
        for c in 0..i {
            lane.send(i - 1, Direction::Backward, c, chunks[c].clone())?;
        }
    }
    Ok(std::mem::take(&mut chunks[i]))
}
