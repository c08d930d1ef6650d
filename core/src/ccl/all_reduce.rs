//! All-reduce: every chip of the axis ends up with the elementwise
//! reduction of all shards.
//!
//! The input is viewed as rank 4 `[1, 1, N, W]` for the duration of the
//! call and reshaped back before returning. Three strategies:
//!
//! | mode         | transfers                               | staging                   |
//! |--------------|-----------------------------------------|---------------------------|
//! | `LineReduce` | accumulate forward, broadcast backward  | interleaved               |
//! | `Fused`      | all-gather on dim 0, local reduce       | DRAM, or L1 if sharded    |
//! | `Composite`  | reduce-scatter then all-gather on `dim` | interleaved               |

use super::all_gather::gather;
use super::descriptor::{AllReduceMode, CollectiveDescriptor, CollectiveKind, ReduceOp};
use super::dispatch::{run_lanes, Lane, Route};
use super::reduce_scatter::{scatter, scatter_input_config};
use crate::error::{CclError, Result};
use crate::fabric::{Direction, Fabric};
use crate::mesh::MemoryConfig;
use crate::mesh_tensor::MeshTensor;
use crate::tensor::ops::canonical_shape;
use crate::tensor::{Tensor, TensorElem};

pub(crate) fn all_reduce<T, const RANK: usize>(
    fabric: &Fabric,
    input: MeshTensor<T, RANK>,
    desc: &CollectiveDescriptor,
) -> Result<MeshTensor<T, RANK>>
where
    T: TensorElem + 'static,
{
    let mode = match desc.kind() {
        CollectiveKind::AllReduce(mode) => mode,
        other => {
            return Err(CclError::InvalidConfig(format!(
                "{other:?} descriptor passed to all_reduce"
            )))
        }
    };
    let route = Route {
        axis: desc.cluster_axis(),
        links: desc.num_links(),
        topology: desc.topology(),
    };
    let plan = fabric.plan(route)?;
    let original = input.shard_shape();
    let canonical = canonical_shape(&original);
    if let AllReduceMode::Composite { all_gather_links } = mode {
        fabric.plan(Route {
            links: all_gather_links,
            ..route
        })?;
        let dim = desc.dim();
        if dim >= 4 {
            return Err(CclError::InvalidDim { dim, rank: 4 });
        }
        if canonical[dim] % plan.axis_size != 0 {
            return Err(CclError::IndivisibleDim {
                dim,
                size: canonical[dim],
                devices: plan.axis_size,
            });
        }
    }
    if plan.axis_size == 1 {
        fabric.stats.record_identity();
        return Ok(input);
    }

    let in_config = input.memory_config();
    let out_config = desc.memory_config().unwrap_or(in_config);
    let working = desc.dtype().unwrap_or(input.dtype());
    let op = desc.reduce_op();
    let input = input.reshape(canonical)?;

    let reduced = match mode {
        AllReduceMode::LineReduce => {
            let input = fabric.reformat(input, working, scatter_input_config(in_config))?;
            line_reduce(fabric, input, route, op, out_config)?
        }
        AllReduceMode::Fused => {
            let staging = if in_config.is_sharded() {
                MemoryConfig::L1
            } else {
                MemoryConfig::DRAM
            };
            let input = fabric.reformat(input, working, staging)?;
            let gathered = gather(fabric, input, 0, route, staging)?;
            let shards = gathered
                .shards()
                .iter()
                .map(|s| s.reduce_dim(0, op))
                .collect::<std::result::Result<Vec<_>, _>>()?;
            gathered.with_shards(&fabric.mesh, shards, out_config)?
        }
        AllReduceMode::Composite { all_gather_links } => {
            let staging = scatter_input_config(in_config);
            let input = fabric.reformat(input, working, staging)?;
            let scattered = scatter(fabric, input, desc.dim(), route, op, staging)?;
            let gather_route = Route {
                links: all_gather_links,
                ..route
            };
            gather(fabric, scattered, desc.dim(), gather_route, out_config)?
        }
    };

    let reduced = reduced.reshape(original)?;
    match desc.output_dtype() {
        Some(dtype) => fabric.reformat(reduced, dtype, out_config),
        None => Ok(reduced),
    }
}

fn line_reduce<T>(
    fabric: &Fabric,
    input: MeshTensor<T, 4>,
    route: Route,
    op: ReduceOp,
    out_config: MemoryConfig,
) -> Result<MeshTensor<T, 4>>
where
    T: TensorElem + 'static,
{
    let plan = fabric.plan(route)?;
    fabric.stats.record_collective();
    tracing::debug!(
        kind = "all_reduce",
        mode = "line_reduce",
        axis = ?route.axis,
        links = route.links,
        ?op,
        group = plan.axis_size,
        "dispatching collective"
    );

    let shape = input.shard_shape();
    let inputs = input
        .shards()
        .iter()
        .map(|s| vec![s.data().to_vec()])
        .collect();
    let outputs = run_lanes(fabric, &plan, input.dtype(), inputs, |lane, chunks| {
        let mine = chunks.into_iter().next().unwrap_or_default();
        Ok(vec![line_all_reduce(lane, mine, op)?])
    })?;

    let shards = outputs
        .into_iter()
        .map(|chunks| Tensor::new(chunks.into_iter().flatten().collect(), shape))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    input.with_shards(&fabric.mesh, shards, out_config)
}

/// Partial sums travel forward to the last chip, which then holds the
/// total; the total travels back so every chip returns the same bits.
fn line_all_reduce<T: TensorElem + 'static>(
    lane: &Lane<'_>,
    mine: Vec<T>,
    op: ReduceOp,
) -> Result<Vec<T>> {
    let k = lane.size();
    let i = lane.pos();
    let mut acc = mine;
    if i > 0 {
        let left: Vec<T> = lane.recv(Direction::Forward, 0)?;
        lane.accumulate(&mut acc, &left, op)?;
    }
    if i + 1 < k {
        lane.send(i + 1, Direction::Forward, 0, acc)?;
        acc = lane.recv(Direction::Backward, 0)?;
    }
    if i > 0 {
        lane.send(i - 1, Direction::Backward, 0, acc.clone())?;
    }
    Ok(acc)
}
