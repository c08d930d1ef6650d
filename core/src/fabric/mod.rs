//! Persistent fabric sessions.
//!
//! A [`FabricSession`] is opened once against a borrowed [`MeshDevice`] and
//! reused for many collectives. Opening it:
//!
//! 1. claims the worker sub-device's cores exclusively for this session,
//! 2. pins the loaded sub-device manager so it cannot be swapped underneath,
//! 3. creates (or attaches to) the routing tables,
//! 4. allocates the session's global semaphores on the worker cores,
//! 5. restricts the sub-device stall group to the worker sub-device.
//!
//! It also starts one worker thread per command queue (see [`crate::queue`]).
//! [`FabricSession::close`] drains in-flight work and undoes all of it.
//! Nothing survives a close except routing that was created with
//! `teardown_on_close = false`, which a later session can attach to with
//! `create = false`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};

use crate::error::{CclError, Result};
use crate::lock;
use crate::mesh::{ChipId, CoreCoord, CoreRangeSet, MeshDevice};
use crate::queue::CommandQueues;
use crate::semaphore::GlobalSemaphore;
use crate::sub_device::{SubDeviceId, SubDeviceManagerId};

pub(crate) mod routing;

pub(crate) use routing::{Direction, Packet, RoutingTable};

/// How a session sets up and tears down routing.
///
/// `create` and `teardown_on_close` only make sense for persistent routing;
/// [`FabricConfig::validate`] rejects them otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FabricConfig {
    /// Sub-device whose cores run the collective workers.
    pub worker_sub_device: SubDeviceId,
    /// Keep routing on the mesh so later sessions can reuse it.
    pub enable_persistent: bool,
    /// Build persistent routing now instead of attaching to existing routing.
    pub create: bool,
    /// Release persistent routing when this session closes.
    pub teardown_on_close: bool,
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            worker_sub_device: SubDeviceId(0),
            enable_persistent: true,
            create: true,
            teardown_on_close: true,
        }
    }
}

impl FabricConfig {
    pub fn validate(&self) -> Result<()> {
        if self.create && !self.enable_persistent {
            return Err(CclError::InvalidConfig(
                "create requires enable_persistent".into(),
            ));
        }
        if self.teardown_on_close && !self.enable_persistent {
            return Err(CclError::InvalidConfig(
                "teardown_on_close requires enable_persistent".into(),
            ));
        }
        Ok(())
    }
}

/// Mesh-wide fabric bookkeeping shared by all sessions.
#[derive(Debug, Default)]
pub(crate) struct FabricState {
    routing: Option<Arc<RoutingTable>>,
    claims: Vec<(u64, CoreRangeSet)>,
    next_session: u64,
}

impl FabricState {
    pub(crate) fn open_sessions(&self) -> usize {
        self.claims.len()
    }

    pub(crate) fn has_routing(&self) -> bool {
        self.routing.is_some()
    }
}

/// Counters for the work a session has dispatched.
#[derive(Debug, Default)]
pub(crate) struct DispatchStats {
    collectives: AtomicU64,
    identities: AtomicU64,
    transfers: AtomicU64,
    bytes: AtomicU64,
    reformats: AtomicU64,
}

impl DispatchStats {
    pub(crate) fn record_collective(&self) {
        self.collectives.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_identity(&self) {
        self.identities.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_transfer(&self, bytes: usize) {
        self.transfers.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_reformat(&self) {
        self.reformats.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> DispatchSnapshot {
        DispatchSnapshot {
            collectives: self.collectives.load(Ordering::Relaxed),
            identities: self.identities.load(Ordering::Relaxed),
            transfers: self.transfers.load(Ordering::Relaxed),
            bytes_moved: self.bytes.load(Ordering::Relaxed),
            reformats: self.reformats.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of a session's dispatch counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DispatchSnapshot {
    /// Collectives that issued transfers.
    pub collectives: u64,
    /// Collectives short-circuited because the axis had a single chip.
    pub identities: u64,
    /// Point-to-point transfers issued.
    pub transfers: u64,
    pub bytes_moved: u64,
    /// Layout or dtype conversions performed before dispatch.
    pub reformats: u64,
}

/// Number of semaphore waits currently blocked under a session.
#[derive(Debug, Default)]
pub(crate) struct Inflight {
    count: Mutex<usize>,
    idle: Condvar,
}

pub(crate) struct InflightGuard<'a>(&'a Inflight);

impl Inflight {
    pub(crate) fn begin(&self) -> InflightGuard<'_> {
        *lock(&self.count) += 1;
        InflightGuard(self)
    }

    fn wait_idle(&self) {
        let guard = lock(&self.count);
        let _idle = self
            .idle
            .wait_while(guard, |n| *n > 0)
            .unwrap_or_else(PoisonError::into_inner);
    }
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        let mut count = lock(&self.0.count);
        *count -= 1;
        if *count == 0 {
            self.0.idle.notify_all();
        }
    }
}

enum RoutingOwnership {
    /// Routing private to this session.
    Private,
    /// Persistent routing, released on close when `teardown` is set.
    Persistent { teardown: bool },
}

/// Everything a collective needs from an open session.
///
/// Handed to operations enqueued on a command queue; obtained directly via
/// [`FabricSession::fabric`]. Shared with the session's queue workers, so it
/// keeps its own handle to the mesh.
pub struct Fabric {
    pub(crate) mesh: MeshDevice,
    session: u64,
    worker: SubDeviceId,
    manager: SubDeviceManagerId,
    pub(crate) worker_cores: Vec<CoreCoord>,
    pub(crate) routing: Arc<RoutingTable>,
    pub(crate) forward: GlobalSemaphore,
    pub(crate) backward: GlobalSemaphore,
    pub(crate) completion: GlobalSemaphore,
    pub(crate) stats: DispatchStats,
    pub(crate) inflight: Inflight,
}

impl Fabric {
    pub fn mesh(&self) -> &MeshDevice {
        &self.mesh
    }

    pub fn worker_sub_device(&self) -> SubDeviceId {
        self.worker
    }

    pub fn sub_device_manager(&self) -> SubDeviceManagerId {
        self.manager
    }

    /// Parallel links available to one collective.
    pub fn max_links(&self) -> usize {
        self.routing.lanes().min(self.worker_cores.len())
    }

    pub fn stats(&self) -> DispatchSnapshot {
        self.stats.snapshot()
    }
}

impl std::fmt::Debug for Fabric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fabric")
            .field("session", &self.session)
            .field("worker", &self.worker)
            .field("worker_cores", &self.worker_cores.len())
            .field("routing", &self.routing)
            .finish()
    }
}

/// An open fabric session over a borrowed mesh.
///
/// The session can only be used while open: [`FabricSession::close`]
/// consumes it. Dropping without closing releases the same resources but
/// discards queued work and logs a warning.
pub struct FabricSession<'m> {
    pub(crate) mesh: &'m MeshDevice,
    pub(crate) fabric: Arc<Fabric>,
    pub(crate) queues: CommandQueues,
    ownership: RoutingOwnership,
    worker_set: CoreRangeSet,
    released: bool,
}

impl<'m> FabricSession<'m> {
    /// Opens a session whose workers run on `config.worker_sub_device`.
    ///
    /// Starts one worker thread per command queue; they run until the
    /// session is closed or dropped.
    ///
    /// # Errors
    ///
    /// - `InvalidConfig` for inconsistent flags or a worker sub-device that
    ///   differs between chips
    /// - `NoSubDeviceManagerLoaded` / `UnknownSubDevice` if the worker
    ///   sub-device is not available
    /// - `CoreRangeClaimed` if another open session owns any worker core
    /// - `FabricAlreadyCreated` / `FabricNotCreated` for `create` against
    ///   existing routing and attach without routing
    pub fn open(mesh: &'m MeshDevice, config: FabricConfig) -> Result<Self> {
        config.validate()?;
        let worker_set = mesh.sub_device_cores(ChipId(0), config.worker_sub_device)?;
        for chip in mesh.chips().iter().skip(1) {
            if mesh.sub_device_cores(chip.id(), config.worker_sub_device)? != worker_set {
                return Err(CclError::InvalidConfig(format!(
                    "worker sub-device {} covers different cores on chip {}",
                    config.worker_sub_device,
                    chip.id()
                )));
            }
        }
        let worker_cores = worker_set.cores();

        let forward = mesh.create_global_semaphore(&worker_set, 0)?;
        let backward = mesh.create_global_semaphore(&worker_set, 0)?;
        let completion = mesh.create_global_semaphore(&worker_set, 0)?;
        let queues = CommandQueues::new(mesh.params())?;

        let mut state = lock(mesh.fabric_state());
        if let Some((range, _)) = state
            .claims
            .iter()
            .find_map(|(_, claimed)| worker_set.overlap(claimed))
        {
            return Err(CclError::CoreRangeClaimed(range));
        }
        let lanes = mesh.params().fabric_links_per_edge;
        let (routing, ownership) = match (config.enable_persistent, config.create) {
            (true, true) => {
                if state.routing.is_some() {
                    return Err(CclError::FabricAlreadyCreated);
                }
                (
                    Arc::new(RoutingTable::build(mesh.shape(), lanes)),
                    RoutingOwnership::Persistent {
                        teardown: config.teardown_on_close,
                    },
                )
            }
            (true, false) => (
                state.routing.clone().ok_or(CclError::FabricNotCreated)?,
                RoutingOwnership::Persistent {
                    teardown: config.teardown_on_close,
                },
            ),
            (false, _) => (
                Arc::new(RoutingTable::build(mesh.shape(), lanes)),
                RoutingOwnership::Private,
            ),
        };

        let manager = mesh.pin_sub_device_manager(config.worker_sub_device)?;
        if config.enable_persistent && config.create {
            state.routing = Some(Arc::clone(&routing));
            tracing::info!(mesh = %mesh.shape(), lanes, "created persistent fabric");
        }
        let id = state.next_session;
        state.next_session += 1;
        state.claims.push((id, worker_set.clone()));
        drop(state);

        tracing::info!(
            session = id,
            worker = %config.worker_sub_device,
            cores = %worker_set,
            "opened fabric session"
        );
        let mut session = Self {
            mesh,
            fabric: Arc::new(Fabric {
                mesh: mesh.share(),
                session: id,
                worker: config.worker_sub_device,
                manager,
                worker_cores,
                routing,
                forward,
                backward,
                completion,
                stats: DispatchStats::default(),
                inflight: Inflight::default(),
            }),
            queues,
            ownership,
            worker_set,
            released: false,
        };
        if let Err(err) = session.queues.start(&session.fabric) {
            session.release();
            return Err(err);
        }
        mesh.set_sub_device_stall_group(&[config.worker_sub_device])?;
        Ok(session)
    }

    /// The collective context of this session.
    pub fn fabric(&self) -> &Fabric {
        &self.fabric
    }

    pub fn mesh(&self) -> &'m MeshDevice {
        self.mesh
    }

    pub fn stats(&self) -> DispatchSnapshot {
        self.fabric.stats()
    }

    /// Waits for all queued work, stops the queue workers, drains in-flight
    /// transfers, and releases the session's routing, core claim, and
    /// sub-device pin.
    ///
    /// Resources are released even if queued work failed; the first such
    /// failure is returned.
    pub fn close(mut self) -> Result<()> {
        let flushed = self.synchronize();
        self.queues.shutdown();
        self.release();
        flushed
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.fabric.inflight.wait_idle();

        let mesh = self.mesh;
        let session = self.fabric.session;
        let draining = {
            let mut state = lock(mesh.fabric_state());
            state.claims.retain(|(id, _)| *id != session);
            match self.ownership {
                RoutingOwnership::Persistent { teardown: true } => state.routing.take(),
                RoutingOwnership::Persistent { teardown: false } => None,
                RoutingOwnership::Private => Some(Arc::clone(&self.fabric.routing)),
            }
        };
        if let Some(routing) = draining {
            // Sessions attached to persistent routing may still be mid-collective.
            let _exclusive = routing.exclusive();
            let dropped = routing.drain();
            if matches!(self.ownership, RoutingOwnership::Persistent { .. }) {
                tracing::info!(session, dropped, "tore down persistent fabric");
            }
        }

        mesh.reset_sub_device_stall_group();
        mesh.unpin_sub_device_manager();
        tracing::info!(session, cores = %self.worker_set, "closed fabric session");
    }
}

impl Drop for FabricSession<'_> {
    fn drop(&mut self) {
        if !self.released {
            let pending = self.queues.discard();
            tracing::warn!(
                session = self.fabric.session,
                pending,
                "fabric session dropped without close; discarding queued commands"
            );
            self.release();
        }
    }
}

impl std::fmt::Debug for FabricSession<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FabricSession")
            .field("fabric", &self.fabric)
            .field("released", &self.released)
            .finish()
    }
}
