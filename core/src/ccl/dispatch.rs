//! Lane workers and the point-to-point transfer primitive.
//!
//! A collective over an axis of `K` chips with `L` links runs `K * L`
//! workers per axis group, one per (chip, link). Worker `l` of a chip owns
//! the `l`-th contiguous slice of every chunk and runs on worker core `l`
//! of the session's sub-device, so links never share a mailbox or a
//! semaphore. Every worker signals the completion semaphore on its core
//! when it exits; the dispatcher waits on all of them before assembling the
//! result.

use std::ops::Range;
use std::thread;

use super::descriptor::{ReduceOp, Topology};
use crate::error::{CclError, Result};
use crate::fabric::{Direction, Fabric, Packet};
use crate::mesh::{ChipId, CoreCoord, MemoryConfig};
use crate::mesh_tensor::MeshTensor;
use crate::semaphore::GlobalSemaphore;
use crate::tensor::{DataType, TensorElem};
use meshccl_kernels::cpu_accumulate;

/// Which chips take part and how they are connected.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Route {
    pub(crate) axis: Option<usize>,
    pub(crate) links: usize,
    pub(crate) topology: Topology,
}

/// A validated [`Route`] resolved against the mesh.
#[derive(Debug)]
pub(crate) struct Plan {
    pub(crate) groups: Vec<Vec<ChipId>>,
    pub(crate) axis_size: usize,
    pub(crate) route: Route,
}

impl Fabric {
    /// Checks `route` against the mesh and session without touching the
    /// fabric.
    pub(crate) fn plan(&self, route: Route) -> Result<Plan> {
        let shape = self.mesh.shape();
        let axis_size = shape.axis_size(route.axis)?;
        let groups = shape.axis_groups(route.axis)?;
        if route.links == 0 {
            return Err(CclError::InvalidConfig("num_links must be at least 1".into()));
        }
        if route.links > self.max_links() {
            return Err(CclError::TooManyLinks {
                requested: route.links,
                available: self.max_links(),
            });
        }
        if route.topology == Topology::Ring && axis_size > 2 && !self.mesh.params().ring_wraparound
        {
            return Err(CclError::TopologyUnsupported {
                topology: Topology::Ring,
                reason: format!(
                    "axis of {axis_size} chips has no wraparound link; use Linear or enable ring_wraparound"
                ),
            });
        }
        Ok(Plan {
            groups,
            axis_size,
            route,
        })
    }

    /// Converts `input` to `dtype` in `memory_config`, counting the
    /// conversion. A no-op when nothing changes.
    ///
    /// The old buffers are released only after the new ones are reserved.
    pub(crate) fn reformat<T: TensorElem, const RANK: usize>(
        &self,
        input: MeshTensor<T, RANK>,
        dtype: DataType,
        memory_config: MemoryConfig,
    ) -> Result<MeshTensor<T, RANK>> {
        if input.dtype() == dtype && input.memory_config() == memory_config {
            return Ok(input);
        }
        let converted = input.reformat(&self.mesh, dtype, memory_config)?;
        self.stats.record_reformat();
        tracing::debug!(
            from_dtype = %input.dtype(),
            to_dtype = %dtype,
            from = ?input.memory_config(),
            to = ?memory_config,
            "reformatted collective input"
        );
        Ok(converted)
    }
}

/// One (chip, link) worker of a collective.
pub(crate) struct Lane<'a> {
    fabric: &'a Fabric,
    group: &'a [ChipId],
    pos: usize,
    lane: usize,
    core: CoreCoord,
    dtype: DataType,
}

impl Lane<'_> {
    /// Position of this chip in its axis group.
    pub(crate) fn pos(&self) -> usize {
        self.pos
    }

    /// Number of chips in the axis group.
    pub(crate) fn size(&self) -> usize {
        self.group.len()
    }

    fn chip(&self) -> ChipId {
        self.group[self.pos]
    }

    fn semaphore(&self, dir: Direction) -> &GlobalSemaphore {
        match dir {
            Direction::Forward => &self.fabric.forward,
            Direction::Backward => &self.fabric.backward,
        }
    }

    /// Writes `data` into the mailbox of the chip at position `to`, then
    /// signals its semaphore.
    pub(crate) fn send<T: TensorElem + 'static>(
        &self,
        to: usize,
        dir: Direction,
        chunk: usize,
        data: Vec<T>,
    ) -> Result<()> {
        let peer = self.group[to];
        let bytes = data.len() * self.dtype.size_bytes();
        self.fabric.routing.send(
            peer,
            self.lane,
            dir,
            Packet {
                chunk,
                payload: Box::new(data),
            },
        )?;
        self.semaphore(dir).increment(peer, self.core, 1)?;
        self.fabric.stats.record_transfer(bytes);
        tracing::trace!(from = %self.chip(), to = %peer, lane = self.lane, chunk, bytes, "transfer");
        Ok(())
    }

    /// Folds a received `partial` into `acc`, rounding the result to the
    /// working dtype the way a device accumulator stored in that format
    /// would after every hop.
    pub(crate) fn accumulate<T: TensorElem>(&self, acc: &mut [T], partial: &[T], op: ReduceOp) -> Result<()> {
        cpu_accumulate(acc, partial, op)?;
        self.dtype.quantize(acc);
        Ok(())
    }

    /// Blocks until the next packet travelling in `dir` has landed and
    /// returns it, checking it carries `chunk`.
    pub(crate) fn recv<T: TensorElem + 'static>(&self, dir: Direction, chunk: usize) -> Result<Vec<T>> {
        let chip = self.chip();
        {
            let _inflight = self.fabric.inflight.begin();
            self.semaphore(dir).wait(chip, self.core, 1)?;
        }
        let packet = self.fabric.routing.try_recv(chip, self.lane, dir)?;
        if packet.chunk != chunk {
            return Err(CclError::Fabric(format!(
                "chip {chip} lane {} expected chunk {chunk}, got {}",
                self.lane, packet.chunk
            )));
        }
        packet
            .payload
            .downcast::<Vec<T>>()
            .map(|data| *data)
            .map_err(|_| CclError::Fabric(format!("chip {chip} received a payload of the wrong type")))
    }
}

/// Signals the completion semaphore when a worker exits, even by panic.
struct CompletionSignal<'a> {
    semaphore: &'a GlobalSemaphore,
    chip: ChipId,
    core: CoreCoord,
}

impl Drop for CompletionSignal<'_> {
    fn drop(&mut self) {
        let _ = self.semaphore.increment(self.chip, self.core, 1);
    }
}

/// Elements `[i * len / parts, (i + 1) * len / parts)`: link `i`'s slice.
pub(crate) fn lane_range(len: usize, parts: usize, i: usize) -> Range<usize> {
    (i * len / parts)..((i + 1) * len / parts)
}

type LaneOutput<T> = (ChipId, usize, Vec<Vec<T>>);

/// Runs `algorithm` on every (chip, link) of `plan` and reassembles the
/// per-link outputs.
///
/// `inputs[c]` holds chip `c`'s chunks as flat buffers. Each worker gets its
/// link's slice of every chunk and returns slices of its output chunks; the
/// result has, per chip, those output chunks with the links concatenated
/// back in order.
pub(crate) fn run_lanes<T, F>(
    fabric: &Fabric,
    plan: &Plan,
    dtype: DataType,
    mut inputs: Vec<Vec<Vec<T>>>,
    algorithm: F,
) -> Result<Vec<Vec<Vec<T>>>>
where
    T: TensorElem + 'static,
    F: Fn(&Lane<'_>, Vec<Vec<T>>) -> Result<Vec<Vec<T>>> + Sync,
{
    let links = plan.route.links;
    let cores = &fabric.worker_cores[..links];
    let _exclusive = fabric.routing.exclusive();

    let lane_outputs = thread::scope(|s| -> Result<Vec<LaneOutput<T>>> {
        let algorithm = &algorithm;
        let mut handles = Vec::with_capacity(inputs.len() * links);
        for group in &plan.groups {
            for (pos, &chip) in group.iter().enumerate() {
                let chunks = inputs.get_mut(chip.0).map(std::mem::take).unwrap_or_default();
                for (lane, &core) in cores.iter().enumerate() {
                    let slices: Vec<Vec<T>> = chunks
                        .iter()
                        .map(|c| c[lane_range(c.len(), links, lane)].to_vec())
                        .collect();
                    let worker = Lane {
                        fabric,
                        group,
                        pos,
                        lane,
                        core,
                        dtype,
                    };
                    handles.push(s.spawn(move || {
                        let _done = CompletionSignal {
                            semaphore: &fabric.completion,
                            chip,
                            core,
                        };
                        algorithm(&worker, slices).map(|out| (chip, lane, out))
                    }));
                }
            }
        }

        for group in &plan.groups {
            for &chip in group {
                for &core in cores {
                    fabric.completion.wait(chip, core, 1)?;
                }
            }
        }

        handles
            .into_iter()
            .map(|h| {
                h.join()
                    .unwrap_or_else(|_| Err(CclError::Fabric("collective worker panicked".into())))
            })
            .collect()
    })?;

    let num_chips = fabric.mesh.num_devices();
    let mut per_chip: Vec<Vec<Vec<Vec<T>>>> = (0..num_chips).map(|_| vec![Vec::new(); links]).collect();
    for (chip, lane, out) in lane_outputs {
        per_chip[chip.0][lane] = out;
    }
    Ok(per_chip
        .into_iter()
        .map(|lanes| {
            let num_chunks = lanes.first().map_or(0, Vec::len);
            (0..num_chunks)
                .map(|j| {
                    lanes
                        .iter()
                        .flat_map(|pieces| pieces.get(j).into_iter().flatten().copied())
                        .collect()
                })
                .collect()
        })
        .collect())
}
