//! Command queues, device events, and trace capture/replay.
//!
//! Every queue has a worker thread, started when the session opens, that
//! runs the queue's commands in issue order as soon as they are enqueued.
//! The host only blocks in [`FabricSession::synchronize`] and its
//! per-sub-device variant. Queues run concurrently and are only ordered
//! against each other through [`Event`]s:
//!
//! ```text
//! queue 1:  write(n+1) ── record(written) ──────────── wait(consumed) ── write(n+2) ...
//!                              │                             ▲
//!                              ▼                             │
//! queue 0:  ... ─────── wait(written) ── execute_trace ── record(consumed) ...
//! ```
//!
//! A trace is a recorded list of device operations. Operations enqueued
//! between [`FabricSession::begin_trace`] and [`FabricSession::end_trace`]
//! are captured instead of run, and [`FabricSession::execute_trace`] replays
//! them against whatever the referenced [`MeshBuffer`]s hold at that point.

use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError, RwLock};
use std::thread::{self, JoinHandle};

use crossbeam::channel::{unbounded, Receiver, Sender};

use crate::error::{CclError, Result};
use crate::fabric::{Fabric, FabricSession};
use crate::lock;
use crate::mesh::{ChipId, DeviceParams};
use crate::mesh_tensor::MeshTensor;
use crate::sub_device::SubDeviceId;
use crate::tensor::TensorElem;

/// Trace-region bytes one captured operation occupies.
pub const TRACE_BYTES_PER_OP: usize = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueueId(pub usize);

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TraceId(u64);

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Default)]
struct EventState {
    recorded: Mutex<bool>,
    cv: Condvar,
}

/// A one-shot device-side marker recorded by one queue and awaited by
/// another. Obtained from [`FabricSession::record_event`].
#[derive(Debug, Clone)]
pub struct Event {
    state: Arc<EventState>,
}

impl Event {
    fn new() -> Self {
        Self {
            state: Arc::default(),
        }
    }

    pub fn is_recorded(&self) -> bool {
        *lock(&self.state.recorded)
    }

    fn signal(&self) {
        *lock(&self.state.recorded) = true;
        self.state.cv.notify_all();
    }

    fn wait(&self) {
        let guard = lock(&self.state.recorded);
        let _recorded = self
            .state
            .cv
            .wait_while(guard, |recorded| !*recorded)
            .unwrap_or_else(PoisonError::into_inner);
    }
}

/// A device buffer slot that queued operations read and write.
///
/// Holds at most one [`MeshTensor`]. Once filled, later writes must keep
/// the same shard layout so traces replayed against the slot stay valid.
#[derive(Debug)]
pub struct MeshBuffer<T: TensorElem, const RANK: usize> {
    slot: Arc<RwLock<Option<MeshTensor<T, RANK>>>>,
}

impl<T: TensorElem, const RANK: usize> Clone for MeshBuffer<T, RANK> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<T: TensorElem, const RANK: usize> Default for MeshBuffer<T, RANK> {
    fn default() -> Self {
        Self {
            slot: Arc::new(RwLock::new(None)),
        }
    }
}

impl<T: TensorElem, const RANK: usize> MeshBuffer<T, RANK> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `tensor`, replacing the previous contents.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` if the slot already holds a tensor with a different
    /// shard layout.
    pub fn store(&self, tensor: MeshTensor<T, RANK>) -> Result<()> {
        let mut slot = self.slot.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(old) = slot.as_ref() {
            if old.spec() != tensor.spec() {
                return Err(CclError::InvalidConfig(format!(
                    "buffer holds {:?}, cannot store {:?}",
                    old.spec(),
                    tensor.spec()
                )));
            }
        }
        *slot = Some(tensor);
        Ok(())
    }

    /// A handle to the current contents.
    pub fn load(&self) -> Result<MeshTensor<T, RANK>> {
        self.slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| CclError::InvalidConfig("read from an empty mesh buffer".into()))
    }

    /// Empties the slot, returning its contents.
    pub fn take(&self) -> Option<MeshTensor<T, RANK>> {
        self.slot.write().unwrap_or_else(PoisonError::into_inner).take()
    }

    pub fn is_empty(&self) -> bool {
        self.slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

type Op = Arc<dyn Fn(&Fabric) -> Result<()> + Send + Sync>;

enum Command {
    Op(SubDeviceId, Op),
    Write(Box<dyn FnOnce() -> Result<()> + Send>),
    Record(Event),
    Wait(Event),
}

impl Command {
    fn sub_device(&self) -> Option<SubDeviceId> {
        match self {
            Command::Op(sub_device, _) => Some(*sub_device),
            _ => None,
        }
    }
}

struct Capture {
    trace: TraceId,
    ops: Vec<(SubDeviceId, Op)>,
}

#[derive(Debug, Default, Clone, Copy)]
struct Counter {
    issued: u64,
    done: u64,
}

#[derive(Debug)]
struct Failure {
    queue: QueueId,
    sub_device: Option<SubDeviceId>,
    error: CclError,
}

#[derive(Debug, Default)]
struct ProgressState {
    queues: Vec<Counter>,
    sub_devices: HashMap<SubDeviceId, Counter>,
    failures: Vec<Failure>,
}

/// Issue and completion counts shared between the host and the workers.
///
/// A queue stops running work once it has failed, until the failure is
/// handed to the host by a synchronize.
#[derive(Debug)]
struct Progress {
    state: Mutex<ProgressState>,
    changed: Condvar,
}

impl Progress {
    fn new(queues: usize) -> Self {
        Self {
            state: Mutex::new(ProgressState {
                queues: vec![Counter::default(); queues],
                ..ProgressState::default()
            }),
            changed: Condvar::new(),
        }
    }

    fn issue(&self, queue: QueueId, sub_device: Option<SubDeviceId>) {
        let mut state = lock(&self.state);
        state.queues[queue.0].issued += 1;
        if let Some(id) = sub_device {
            state.sub_devices.entry(id).or_default().issued += 1;
        }
    }

    fn complete(&self, queue: QueueId, sub_device: Option<SubDeviceId>, result: Result<()>) {
        let mut state = lock(&self.state);
        state.queues[queue.0].done += 1;
        if let Some(id) = sub_device {
            state.sub_devices.entry(id).or_default().done += 1;
        }
        if let Err(error) = result {
            tracing::debug!(queue = %queue, error = %error, "queued command failed");
            state.failures.push(Failure {
                queue,
                sub_device,
                error,
            });
        }
        drop(state);
        self.changed.notify_all();
    }

    fn has_failed(&self, queue: QueueId) -> bool {
        lock(&self.state).failures.iter().any(|f| f.queue == queue)
    }

    fn outstanding(&self) -> u64 {
        lock(&self.state)
            .queues
            .iter()
            .map(|c| c.issued.saturating_sub(c.done))
            .sum()
    }

    /// Blocks until every command issued so far on any queue has finished.
    fn wait_queues(&self) -> Result<()> {
        let state = lock(&self.state);
        let target: Vec<u64> = state.queues.iter().map(|c| c.issued).collect();
        let mut state = self
            .changed
            .wait_while(state, |s| {
                s.queues.iter().zip(&target).any(|(c, &t)| c.done < t)
            })
            .unwrap_or_else(PoisonError::into_inner);
        take_first(std::mem::take(&mut state.failures))
    }

    /// Blocks until every operation issued so far on `ids` has finished.
    fn wait_sub_devices(&self, ids: &[SubDeviceId]) -> Result<()> {
        let state = lock(&self.state);
        let target: Vec<(SubDeviceId, u64)> = ids
            .iter()
            .map(|id| (*id, state.sub_devices.get(id).map_or(0, |c| c.issued)))
            .collect();
        let mut state = self
            .changed
            .wait_while(state, |s| {
                target
                    .iter()
                    .any(|(id, t)| s.sub_devices.get(id).map_or(0, |c| c.done) < *t)
            })
            .unwrap_or_else(PoisonError::into_inner);
        let (taken, kept): (Vec<Failure>, Vec<Failure>) = std::mem::take(&mut state.failures)
            .into_iter()
            .partition(|f| f.sub_device.is_some_and(|id| ids.contains(&id)));
        state.failures = kept;
        take_first(taken)
    }
}

fn take_first(failures: Vec<Failure>) -> Result<()> {
    match failures.into_iter().next() {
        Some(failure) => Err(failure.error),
        None => Ok(()),
    }
}

struct Queue {
    sender: Option<Sender<Command>>,
    worker: Option<JoinHandle<()>>,
    capture: Mutex<Option<Capture>>,
}

/// The command queues of one fabric session and the traces captured on them.
pub(crate) struct CommandQueues {
    queues: Vec<Queue>,
    progress: Arc<Progress>,
    discarding: Arc<AtomicBool>,
    traces: Mutex<HashMap<TraceId, Arc<[(SubDeviceId, Op)]>>>,
    next_trace: AtomicU64,
    trace_region_size: usize,
}

impl CommandQueues {
    pub(crate) fn new(params: &DeviceParams) -> Result<Self> {
        if params.num_command_queues == 0 {
            return Err(CclError::InvalidConfig("at least one command queue is required".into()));
        }
        Ok(Self {
            queues: (0..params.num_command_queues)
                .map(|_| Queue {
                    sender: None,
                    worker: None,
                    capture: Mutex::new(None),
                })
                .collect(),
            progress: Arc::new(Progress::new(params.num_command_queues)),
            discarding: Arc::new(AtomicBool::new(false)),
            traces: Mutex::new(HashMap::new()),
            next_trace: AtomicU64::new(0),
            trace_region_size: params.trace_region_size,
        })
    }

    /// Spawns one worker thread per queue.
    pub(crate) fn start(&mut self, fabric: &Arc<Fabric>) -> Result<()> {
        let mut started = Vec::with_capacity(self.queues.len());
        for i in 0..self.queues.len() {
            let (sender, receiver) = unbounded();
            let id = QueueId(i);
            let fabric = Arc::clone(fabric);
            let progress = Arc::clone(&self.progress);
            let discarding = Arc::clone(&self.discarding);
            let worker = thread::Builder::new()
                .name(format!("meshccl-queue-{i}"))
                .spawn(move || run_queue(id, &receiver, &fabric, &progress, &discarding))
                .map_err(|e| CclError::Fabric(format!("failed to start command queue {id}: {e}")))?;
            started.push((sender, worker));
        }
        for (queue, (sender, worker)) in self.queues.iter_mut().zip(started) {
            queue.sender = Some(sender);
            queue.worker = Some(worker);
        }
        Ok(())
    }

    fn queue(&self, id: QueueId) -> Result<&Queue> {
        self.queues.get(id.0).ok_or(CclError::UnknownQueue(id))
    }

    fn send(&self, id: QueueId, command: Command) -> Result<()> {
        let queue = self.queue(id)?;
        let sub_device = command.sub_device();
        self.progress.issue(id, sub_device);
        let sent = match &queue.sender {
            Some(sender) => sender.send(command).is_ok(),
            None => false,
        };
        if !sent {
            self.progress.complete(id, sub_device, Ok(()));
            return Err(CclError::Fabric(format!("command queue {id} is not running")));
        }
        Ok(())
    }

    /// Sends a non-capturable command, rejecting it during a capture.
    fn push(&self, id: QueueId, command: Command, what: &'static str) -> Result<()> {
        if lock(&self.queue(id)?.capture).is_some() {
            return Err(CclError::NotCapturable(what));
        }
        self.send(id, command)
    }

    fn traces_bytes(traces: &HashMap<TraceId, Arc<[(SubDeviceId, Op)]>>) -> usize {
        traces.values().map(|ops| ops.len() * TRACE_BYTES_PER_OP).sum()
    }

    /// Stops the workers once they have drained their channels.
    pub(crate) fn shutdown(&mut self) {
        for queue in &mut self.queues {
            queue.sender = None;
        }
        for (i, queue) in self.queues.iter_mut().enumerate() {
            if let Some(worker) = queue.worker.take() {
                if worker.join().is_err() {
                    tracing::warn!(queue = i, "command queue worker panicked");
                }
            }
        }
    }

    /// Skips every queued command except event records, then shuts down.
    /// Returns how many commands had not finished.
    pub(crate) fn discard(&mut self) -> u64 {
        self.discarding.store(true, Ordering::Release);
        let pending = self.progress.outstanding();
        self.shutdown();
        pending
    }
}

fn run_queue(
    id: QueueId,
    commands: &Receiver<Command>,
    fabric: &Fabric,
    progress: &Progress,
    discarding: &AtomicBool,
) {
    for command in commands.iter() {
        let sub_device = command.sub_device();
        let skip = discarding.load(Ordering::Acquire) || progress.has_failed(id);
        let result = match command {
            // Records always fire so other queues never wait on an event
            // this queue would have produced.
            Command::Record(event) => {
                event.signal();
                Ok(())
            }
            _ if skip => Ok(()),
            Command::Op(_, op) => panic::catch_unwind(AssertUnwindSafe(|| op(fabric)))
                .unwrap_or_else(|_| Err(CclError::Fabric("queued operation panicked".into()))),
            Command::Write(write) => panic::catch_unwind(AssertUnwindSafe(write))
                .unwrap_or_else(|_| Err(CclError::Fabric("queued write panicked".into()))),
            Command::Wait(event) => {
                event.wait();
                Ok(())
            }
        };
        progress.complete(id, sub_device, result);
    }
}

impl<'m> FabricSession<'m> {
    pub fn num_queues(&self) -> usize {
        self.queues.queues.len()
    }

    /// Enqueues a device operation on `queue`, scheduled on the session's
    /// worker sub-device.
    ///
    /// While a trace is being captured on `queue` the operation is recorded
    /// into the trace instead.
    pub fn enqueue<F>(&self, queue: QueueId, op: F) -> Result<()>
    where
        F: Fn(&Fabric) -> Result<()> + Send + Sync + 'static,
    {
        self.enqueue_op(queue, self.fabric.worker_sub_device(), Arc::new(op))
    }

    /// Enqueues a device operation on `queue` that runs on the cores of
    /// `sub_device`.
    ///
    /// # Errors
    ///
    /// `UnknownSubDevice` if the loaded manager has no such sub-device.
    pub fn enqueue_on<F>(&self, queue: QueueId, sub_device: SubDeviceId, op: F) -> Result<()>
    where
        F: Fn(&Fabric) -> Result<()> + Send + Sync + 'static,
    {
        self.mesh.sub_device_cores(ChipId(0), sub_device)?;
        self.enqueue_op(queue, sub_device, Arc::new(op))
    }

    fn enqueue_op(&self, queue: QueueId, sub_device: SubDeviceId, op: Op) -> Result<()> {
        let q = self.queues.queue(queue)?;
        if let Some(capture) = lock(&q.capture).as_mut() {
            capture.ops.push((sub_device, op));
            return Ok(());
        }
        self.queues.send(queue, Command::Op(sub_device, op))
    }

    /// Enqueues a host-to-device copy of `tensor` into `buffer`.
    pub fn enqueue_write<T, const RANK: usize>(
        &self,
        queue: QueueId,
        buffer: &MeshBuffer<T, RANK>,
        tensor: MeshTensor<T, RANK>,
    ) -> Result<()>
    where
        T: TensorElem + 'static,
    {
        let buffer = buffer.clone();
        self.queues.push(
            queue,
            Command::Write(Box::new(move || buffer.store(tensor))),
            "host write",
        )
    }

    /// Enqueues an event record on `queue` and returns the event.
    ///
    /// The event becomes recorded once everything enqueued before it on
    /// `queue` has run.
    pub fn record_event(&self, queue: QueueId) -> Result<Event> {
        let event = Event::new();
        self.queues
            .push(queue, Command::Record(event.clone()), "event record")?;
        Ok(event)
    }

    /// Makes `queue` wait for `event` before running later commands.
    pub fn wait_for_event(&self, queue: QueueId, event: &Event) -> Result<()> {
        self.queues
            .push(queue, Command::Wait(event.clone()), "event wait")
    }

    /// Blocks until every command enqueued so far on every queue has run.
    ///
    /// Returns the first error any queue hit since the last synchronize;
    /// the other queues still run to completion. A failed queue skips its
    /// remaining work until the failure has been returned here.
    pub fn synchronize(&self) -> Result<()> {
        self.queues.progress.wait_queues()
    }

    /// Blocks until the operations enqueued so far on `sub_devices` have
    /// run. Work scheduled on other sub-devices may still be in flight.
    ///
    /// `None` waits on the mesh's sub-device stall group. Only failures of
    /// operations on the awaited sub-devices are returned.
    pub fn synchronize_sub_devices(&self, sub_devices: Option<&[SubDeviceId]>) -> Result<()> {
        match sub_devices {
            Some(ids) => self.queues.progress.wait_sub_devices(ids),
            None => {
                let stall_group = self.mesh.sub_device_stall_group();
                self.queues.progress.wait_sub_devices(&stall_group)
            }
        }
    }

    /// Starts capturing operations enqueued on `queue` into a new trace.
    ///
    /// # Errors
    ///
    /// `TraceRegionUnavailable` if the device has no trace region,
    /// `TraceActive` if `queue` is already capturing.
    pub fn begin_trace(&self, queue: QueueId) -> Result<TraceId> {
        if self.queues.trace_region_size == 0 {
            return Err(CclError::TraceRegionUnavailable);
        }
        let q = self.queues.queue(queue)?;
        let mut capture = lock(&q.capture);
        if capture.is_some() {
            return Err(CclError::TraceActive(queue));
        }
        let trace = TraceId(self.queues.next_trace.fetch_add(1, Ordering::Relaxed));
        *capture = Some(Capture {
            trace,
            ops: Vec::new(),
        });
        tracing::info!(queue = %queue, trace = %trace, "began trace capture");
        Ok(trace)
    }

    /// Finishes the capture of `trace` on `queue`.
    ///
    /// # Errors
    ///
    /// `NoTraceActive` if `queue` is not capturing, `UnknownTrace` if it is
    /// capturing a different trace, `InvalidConfig` if the trace region is
    /// too small to hold the captured operations.
    pub fn end_trace(&self, queue: QueueId, trace: TraceId) -> Result<()> {
        let q = self.queues.queue(queue)?;
        let mut capture = lock(&q.capture);
        match capture.as_ref() {
            None => return Err(CclError::NoTraceActive(queue)),
            Some(c) if c.trace != trace => return Err(CclError::UnknownTrace(trace)),
            Some(_) => {}
        }
        let Some(Capture { ops, .. }) = capture.take() else {
            return Err(CclError::NoTraceActive(queue));
        };

        let mut traces = lock(&self.queues.traces);
        let needed = CommandQueues::traces_bytes(&traces) + ops.len() * TRACE_BYTES_PER_OP;
        if needed > self.queues.trace_region_size {
            return Err(CclError::InvalidConfig(format!(
                "trace region of {} bytes cannot hold {needed} bytes of traces",
                self.queues.trace_region_size
            )));
        }
        tracing::info!(queue = %queue, trace = %trace, ops = ops.len(), "ended trace capture");
        traces.insert(trace, ops.into());
        Ok(())
    }

    /// Replays `trace` on `queue`; with `blocking` set, also synchronizes.
    ///
    /// Without `blocking` this returns as soon as the operations are
    /// queued; they run on the queue's worker in the background.
    pub fn execute_trace(&self, trace: TraceId, queue: QueueId, blocking: bool) -> Result<()> {
        let q = self.queues.queue(queue)?;
        if lock(&q.capture).is_some() {
            return Err(CclError::TraceActive(queue));
        }
        let ops = lock(&self.queues.traces)
            .get(&trace)
            .cloned()
            .ok_or(CclError::UnknownTrace(trace))?;
        for (sub_device, op) in ops.iter() {
            self.queues
                .send(queue, Command::Op(*sub_device, Arc::clone(op)))?;
        }
        if blocking {
            self.synchronize()?;
        }
        Ok(())
    }

    /// Frees a captured trace and its share of the trace region.
    pub fn release_trace(&self, trace: TraceId) -> Result<()> {
        lock(&self.queues.traces)
            .remove(&trace)
            .map(|_| ())
            .ok_or(CclError::UnknownTrace(trace))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::FabricConfig;
    use crate::mesh::{CoreCoord, CoreRange, MeshDevice, MeshShape};
    use crate::sub_device::{SubDevice, SubDeviceLayout};
    use std::sync::atomic::AtomicUsize;

    fn mesh(params: DeviceParams) -> MeshDevice {
        let mesh = MeshDevice::open(MeshShape::new(1, 1).unwrap(), params).unwrap();
        let workers = CoreRange::new(CoreCoord::new(0, 0), CoreCoord::new(1, 0));
        let layout = SubDeviceLayout::Replicated(vec![SubDevice::new(workers.into())]);
        let id = mesh.create_sub_device_manager(&layout, 0).unwrap();
        mesh.load_sub_device_manager(id).unwrap();
        mesh
    }

    fn traced_params() -> DeviceParams {
        DeviceParams {
            num_command_queues: 2,
            trace_region_size: 16 * TRACE_BYTES_PER_OP,
            ..DeviceParams::default()
        }
    }

    #[test]
    fn test_queue_runs_in_order() {
        let mesh = mesh(DeviceParams::default());
        let session = FabricSession::open(&mesh, FabricConfig::default()).unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..4 {
            let log = Arc::clone(&log);
            session
                .enqueue(QueueId(0), move |_| {
                    log.lock().unwrap().push(i);
                    Ok(())
                })
                .unwrap();
        }
        session.synchronize().unwrap();
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3]);
        session.close().unwrap();
    }

    #[test]
    fn test_work_runs_without_synchronize() {
        let mesh = mesh(traced_params());
        let session = FabricSession::open(&mesh, FabricConfig::default()).unwrap();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let trace = session.begin_trace(QueueId(0)).unwrap();
        session
            .enqueue(QueueId(0), move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        session.end_trace(QueueId(0), trace).unwrap();

        session.execute_trace(trace, QueueId(0), false).unwrap();
        let done = session.record_event(QueueId(0)).unwrap();
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
        while !done.is_recorded() {
            assert!(std::time::Instant::now() < deadline, "event never recorded");
            thread::sleep(std::time::Duration::from_millis(1));
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        session.close().unwrap();
    }

    #[test]
    fn test_enqueue_on_unknown_sub_device() {
        let mesh = mesh(DeviceParams::default());
        let session = FabricSession::open(&mesh, FabricConfig::default()).unwrap();
        assert!(matches!(
            session.enqueue_on(QueueId(0), SubDeviceId(4), |_| Ok(())),
            Err(CclError::UnknownSubDevice(SubDeviceId(4)))
        ));
        session.close().unwrap();
    }

    #[test]
    fn test_panicking_op_becomes_error() {
        let mesh = mesh(DeviceParams::default());
        let session = FabricSession::open(&mesh, FabricConfig::default()).unwrap();
        session
            .enqueue(QueueId(0), |_| panic!("kernel fault"))
            .unwrap();
        assert!(matches!(session.synchronize(), Err(CclError::Fabric(_))));
        session.enqueue(QueueId(0), |_| Ok(())).unwrap();
        session.synchronize().unwrap();
        session.close().unwrap();
    }

    #[test]
    fn test_unknown_queue() {
        let mesh = mesh(DeviceParams::default());
        let session = FabricSession::open(&mesh, FabricConfig::default()).unwrap();
        assert!(matches!(
            session.record_event(QueueId(1)),
            Err(CclError::UnknownQueue(QueueId(1)))
        ));
        session.close().unwrap();
    }

    #[test]
    fn test_events_order_queues() {
        let mesh = mesh(traced_params());
        let session = FabricSession::open(&mesh, FabricConfig::default()).unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));

        let seen = Arc::clone(&log);
        session
            .enqueue(QueueId(1), move |_| {
                thread::sleep(std::time::Duration::from_millis(20));
                seen.lock().unwrap().push("write");
                Ok(())
            })
            .unwrap();
        let written = session.record_event(QueueId(1)).unwrap();
        session.wait_for_event(QueueId(0), &written).unwrap();
        let seen = Arc::clone(&log);
        session
            .enqueue(QueueId(0), move |_| {
                seen.lock().unwrap().push("read");
                Ok(())
            })
            .unwrap();

        session.synchronize().unwrap();
        assert!(written.is_recorded());
        assert_eq!(*log.lock().unwrap(), vec!["write", "read"]);
        session.close().unwrap();
    }

    #[test]
    fn test_trace_capture_and_replay() {
        let mesh = mesh(traced_params());
        let session = FabricSession::open(&mesh, FabricConfig::default()).unwrap();
        let runs = Arc::new(AtomicUsize::new(0));

        let trace = session.begin_trace(QueueId(0)).unwrap();
        assert!(matches!(
            session.begin_trace(QueueId(0)),
            Err(CclError::TraceActive(QueueId(0)))
        ));
        let counter = Arc::clone(&runs);
        session
            .enqueue(QueueId(0), move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        assert!(matches!(
            session.record_event(QueueId(0)),
            Err(CclError::NotCapturable(_))
        ));
        session.end_trace(QueueId(0), trace).unwrap();

        session.synchronize().unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        for _ in 0..3 {
            session.execute_trace(trace, QueueId(0), false).unwrap();
        }
        session.synchronize().unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 3);

        session.execute_trace(trace, QueueId(0), true).unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 4);

        session.release_trace(trace).unwrap();
        assert!(matches!(
            session.execute_trace(trace, QueueId(0), false),
            Err(CclError::UnknownTrace(_))
        ));
        session.close().unwrap();
    }

    #[test]
    fn test_trace_requires_region() {
        let mesh = mesh(DeviceParams::default());
        let session = FabricSession::open(&mesh, FabricConfig::default()).unwrap();
        assert!(matches!(
            session.begin_trace(QueueId(0)),
            Err(CclError::TraceRegionUnavailable)
        ));
        assert!(matches!(
            session.end_trace(QueueId(0), TraceId(0)),
            Err(CclError::NoTraceActive(QueueId(0)))
        ));
        session.close().unwrap();
    }

    #[test]
    fn test_trace_region_exhausted() {
        let params = DeviceParams {
            trace_region_size: TRACE_BYTES_PER_OP,
            ..DeviceParams::default()
        };
        let mesh = mesh(params);
        let session = FabricSession::open(&mesh, FabricConfig::default()).unwrap();
        let trace = session.begin_trace(QueueId(0)).unwrap();
        session.enqueue(QueueId(0), |_| Ok(())).unwrap();
        session.enqueue(QueueId(0), |_| Ok(())).unwrap();
        assert!(matches!(
            session.end_trace(QueueId(0), trace),
            Err(CclError::InvalidConfig(_))
        ));
        session.close().unwrap();
    }

    #[test]
    fn test_failed_op_still_records_events() {
        let mesh = mesh(traced_params());
        let session = FabricSession::open(&mesh, FabricConfig::default()).unwrap();
        session
            .enqueue(QueueId(1), |_| Err(CclError::Fabric("boom".into())))
            .unwrap();
        let event = session.record_event(QueueId(1)).unwrap();
        session.wait_for_event(QueueId(0), &event).unwrap();
        assert!(matches!(session.synchronize(), Err(CclError::Fabric(_))));
        assert!(event.is_recorded());
        session.close().unwrap();
    }

    #[test]
    fn test_mesh_buffer_layout_is_fixed() {
        use crate::mesh::MemoryConfig;
        use crate::tensor::{DataType, Tensor};

        let mesh = mesh(DeviceParams::default());
        let buffer = MeshBuffer::<f32, 1>::new();
        assert!(buffer.is_empty());
        assert!(buffer.load().is_err());

        let a = MeshTensor::replicate(&mesh, &Tensor::zeros([4]), DataType::Float32, MemoryConfig::DRAM)
            .unwrap();
        let b = MeshTensor::replicate(&mesh, &Tensor::zeros([8]), DataType::Float32, MemoryConfig::DRAM)
            .unwrap();
        buffer.store(a).unwrap();
        assert!(buffer.store(b).is_err());
        assert_eq!(buffer.load().unwrap().shard_shape(), [4]);
        assert!(buffer.take().is_some());
    }
}
