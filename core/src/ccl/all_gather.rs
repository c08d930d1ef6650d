//! All-gather: every chip of the axis ends up with all shards concatenated
//! along the gather dim, in axis-position order.

use super::descriptor::{CollectiveDescriptor, CollectiveKind, Topology};
use super::dispatch::{run_lanes, Lane, Route};
use crate::error::{CclError, Result};
use crate::fabric::{Direction, Fabric};
use crate::mesh::MemoryConfig;
use crate::mesh_tensor::MeshTensor;
use crate::tensor::{Tensor, TensorElem};

pub(crate) fn all_gather<T, const RANK: usize>(
    fabric: &Fabric,
    input: MeshTensor<T, RANK>,
    desc: &CollectiveDescriptor,
) -> Result<MeshTensor<T, RANK>>
where
    T: TensorElem + 'static,
{
    desc.expect_kind(CollectiveKind::AllGather)?;
    let route = Route {
        axis: desc.cluster_axis(),
        links: desc.num_links(),
        topology: desc.topology(),
    };
    if desc.dim() >= RANK {
        return Err(CclError::InvalidDim {
            dim: desc.dim(),
            rank: RANK,
        });
    }
    let plan = fabric.plan(route)?;
    if plan.axis_size == 1 {
        fabric.stats.record_identity();
        return Ok(input);
    }

    let in_config = input.memory_config();
    let out_config = desc.memory_config().unwrap_or(in_config);
    let working = desc.dtype().unwrap_or(input.dtype());
    let input = fabric.reformat(input, working, in_config)?;
    let gathered = gather(fabric, input, desc.dim(), route, out_config)?;
    match desc.output_dtype() {
        Some(dtype) => fabric.reformat(gathered, dtype, out_config),
        None => Ok(gathered),
    }
}

/// Gathers an already formatted `input` along `dim`.
pub(crate) fn gather<T, const RANK: usize>(
    fabric: &Fabric,
    input: MeshTensor<T, RANK>,
    dim: usize,
    route: Route,
    out_config: MemoryConfig,
) -> Result<MeshTensor<T, RANK>>
where
    T: TensorElem + 'static,
{
    let plan = fabric.plan(route)?;
    if plan.axis_size == 1 {
        fabric.stats.record_identity();
        return Ok(input);
    }
    fabric.stats.record_collective();
    tracing::debug!(
        kind = "all_gather",
        axis = ?route.axis,
        dim,
        links = route.links,
        topology = ?route.topology,
        group = plan.axis_size,
        "dispatching collective"
    );

    let shard_shape = input.shard_shape();
    let inputs = input
        .shards()
        .iter()
        .map(|s| vec![s.data().to_vec()])
        .collect();
    let outputs = run_lanes(fabric, &plan, input.dtype(), inputs, |lane, chunks| {
        let mine = chunks.into_iter().next().unwrap_or_default();
        match route.topology {
            Topology::Ring => ring(lane, mine),
            Topology::Linear => line(lane, mine),
        }
    })?;

    let shards = outputs
        .into_iter()
        .map(|chunks| -> Result<Tensor<T, RANK>> {
            let parts = chunks
                .into_iter()
                .map(|data| Tensor::new(data, shard_shape))
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(Tensor::concat(&parts, dim)?)
        })
        .collect::<Result<Vec<_>>>()?;
    input.with_shards(&fabric.mesh, shards, out_config)
}

fn take_chunk<T: Clone>(chunks: &[Option<Vec<T>>], idx: usize) -> Result<Vec<T>> {
    chunks[idx]
        .clone()
        .ok_or_else(|| CclError::Fabric(format!("chunk {idx} missing before forwarding")))
}

/// Ring all-gather: at step `s` chip `i` forwards chunk `i - s` to its
/// right neighbour and receives chunk `i - s - 1` from its left one.
fn ring<T: TensorElem + 'static>(lane: &Lane<'_>, mine: Vec<T>) -> Result<Vec<Vec<T>>> {
    let k = lane.size() as isize;
    let i = lane.pos() as isize;
    let right = ((i + 1).rem_euclid(k)) as usize;
    let mut chunks: Vec<Option<Vec<T>>> = vec![None; k as usize];
    chunks[i as usize] = Some(mine);

    for step in 0..k - 1 {
        let send_idx = (i - step).rem_euclid(k) as usize;
        let recv_idx = (i - step - 1).rem_euclid(k) as usize;
        let outgoing = take_chunk(&chunks, send_idx)?;
        lane.send(right, Direction::Forward, send_idx, outgoing)?;
        chunks[recv_idx] = Some(lane.recv(Direction::Forward, recv_idx)?);
    }
    collect(chunks)
}

/// Line all-gather: chunks flow both ways at once. At step `s` chip `i`
/// forwards chunk `i - s` rightwards and chunk `i + s` leftwards, as far as
/// they exist.
fn line<T: TensorElem + 'static>(lane: &Lane<'_>, mine: Vec<T>) -> Result<Vec<Vec<T>>> {
    let k = lane.size();
    let i = lane.pos();
    let mut chunks: Vec<Option<Vec<T>>> = vec![None; k];
    chunks[i] = Some(mine);

    for step in 0..k - 1 {
        if i + 1 < k && step <= i {
            let idx = i - step;
            lane.send(i + 1, Direction::Forward, idx, take_chunk(&chunks, idx)?)?;
        }
        if i > 0 && i + step < k {
            let idx = i + step;
            lane.send(i - 1, Direction::Backward, idx, take_chunk(&chunks, idx)?)?;
        }
        if step < i {
            let idx = i - step - 1;
            chunks[idx] = Some(lane.recv(Direction::Forward, idx)?);
        }
        if i + step + 1 < k {
            let idx = i + step + 1;
            chunks[idx] = Some(lane.recv(Direction::Backward, idx)?);
        }
    }
    collect(chunks)
}

fn collect<T>(chunks: Vec<Option<Vec<T>>>) -> Result<Vec<Vec<T>>> {
    chunks
        .into_iter()
        .enumerate()
        .map(|(idx, c)| c.ok_or_else(|| CclError::Fabric(format!("chunk {idx} never arrived"))))
        .collect()
}
