use std::sync::{Arc, Mutex};

use meshccl::ccl::{AllReduceMode, CollectiveBackend, CollectiveDescriptor};
use meshccl::mesh::{CoreCoord, CoreRange, DeviceParams, MemoryConfig, MeshDevice, MeshShape};
use meshccl::queue::{MeshBuffer, QueueId, TRACE_BYTES_PER_OP};
use meshccl::sub_device::{SubDevice, SubDeviceLayout};
use meshccl::tensor::{DataType, Tensor};
use meshccl::{CclError, FabricConfig, FabricSession, MeshTensor};

const COMPUTE: QueueId = QueueId(0);
const COPY: QueueId = QueueId(1);

fn open_mesh() -> MeshDevice {
    let params = DeviceParams {
        num_command_queues: 2,
        trace_region_size: 8 * TRACE_BYTES_PER_OP,
        ..DeviceParams::default()
    };
    let mesh = MeshDevice::open(MeshShape::new(1, 2).unwrap(), params).unwrap();
    let workers = CoreRange::new(CoreCoord::new(0, 0), CoreCoord::new(1, 0));
    let layout = SubDeviceLayout::Replicated(vec![SubDevice::new(workers.into())]);
    let id = mesh.create_sub_device_manager(&layout, 0).unwrap();
    mesh.load_sub_device_manager(id).unwrap();
    mesh
}

fn filled(mesh: &MeshDevice, value: f32) -> MeshTensor<f32, 4> {
    MeshTensor::replicate(mesh, &Tensor::full([1, 1, 32, 64], value), DataType::Float32, MemoryConfig::DRAM)
        .unwrap()
}

#[test]
fn test_double_buffered_trace_replay() {
    let mesh = open_mesh();
    let session = FabricSession::open(&mesh, FabricConfig::default()).unwrap();
    let inputs = [MeshBuffer::<f32, 4>::new(), MeshBuffer::new()];
    let outputs = [MeshBuffer::<f32, 4>::new(), MeshBuffer::new()];
    let log = Arc::new(Mutex::new(Vec::new()));
    let desc = CollectiveDescriptor::all_reduce(AllReduceMode::LineReduce);

    // one trace per buffer slot
    let traces: Vec<_> = (0..2)
        .map(|slot| {
            let trace = session.begin_trace(COMPUTE).unwrap();
            let input = inputs[slot].clone();
            let output = outputs[slot].clone();
            let log = Arc::clone(&log);
            session
                .enqueue(COMPUTE, move |fabric| {
                    let reduced = fabric.all_reduce(input.load()?, &desc)?;
                    log.lock().unwrap().push(reduced.shards()[1].data()[0]);
                    output.store(reduced)
                })
                .unwrap();
            session.end_trace(COMPUTE, trace).unwrap();
            trace
        })
        .collect();
    assert_eq!(session.stats().collectives, 0);

    let mut consumed = vec![None, None];
    for i in 0..6 {
        let slot = i % 2;
        if let Some(event) = consumed[slot].take() {
            session.wait_for_event(COPY, &event).unwrap();
        }
        session
            .enqueue_write(COPY, &inputs[slot], filled(&mesh, i as f32))
            .unwrap();
        let written = session.record_event(COPY).unwrap();
        session.wait_for_event(COMPUTE, &written).unwrap();
        session.execute_trace(traces[slot], COMPUTE, false).unwrap();
        consumed[slot] = Some(session.record_event(COMPUTE).unwrap());
    }
    session.synchronize().unwrap();

    assert_eq!(*log.lock().unwrap(), vec![0.0, 2.0, 4.0, 6.0, 8.0, 10.0]);
    assert_eq!(outputs[0].load().unwrap().shards()[0].data()[0], 8.0);
    assert_eq!(outputs[1].load().unwrap().shards()[0].data()[0], 10.0);
    assert!(consumed.iter().flatten().all(|e| e.is_recorded()));
    assert_eq!(session.stats().collectives, 6);

    for trace in traces {
        session.release_trace(trace).unwrap();
    }
    session.close().unwrap();
}

#[test]
fn test_queued_failure_surfaces_on_synchronize() {
    let mesh = open_mesh();
    let session = FabricSession::open(&mesh, FabricConfig::default()).unwrap();
    let input = filled(&mesh, 1.0);

    let bad = input.clone();
    session
        .enqueue(COMPUTE, move |fabric| {
            fabric
                .reduce_scatter(bad.clone(), &CollectiveDescriptor::reduce_scatter(0))
                .map(|_| ())
        })
        .unwrap();
    assert!(matches!(
        session.synchronize(),
        Err(CclError::IndivisibleDim { dim: 0, size: 1, devices: 2 })
    ));

    let out = MeshBuffer::new();
    let sink = out.clone();
    session
        .enqueue(COMPUTE, move |fabric| {
            sink.store(fabric.all_gather(input.clone(), &CollectiveDescriptor::all_gather(3))?)
        })
        .unwrap();
    session.synchronize().unwrap();
    assert_eq!(out.load().unwrap().shard_shape(), [1, 1, 32, 128]);
    session.close().unwrap();
}

#[test]
fn test_close_runs_pending_work() {
    let mesh = open_mesh();
    let session = FabricSession::open(&mesh, FabricConfig::default()).unwrap();
    let out = MeshBuffer::<f32, 4>::new();
    session.enqueue_write(COPY, &out, filled(&mesh, 3.0)).unwrap();
    session.close().unwrap();
    assert_eq!(out.load().unwrap().shards()[0].data()[0], 3.0);
}
