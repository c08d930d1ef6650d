//! Property-based tests for the collectives.
//!
//! Key invariants:
//! - all-gather of a sharded tensor restores the host tensor on every chip
//! - reduce-scatter leaves chip `i` with slice `i` of the elementwise sum
//! - every all-reduce mode leaves the full sum on every chip
//! - ring and line routes agree
//!
//! Inputs are small integers so sums are exact in any order.

use meshccl::ccl::{AllReduceMode, CollectiveBackend, CollectiveDescriptor, Topology};
use meshccl::mesh::{CoreCoord, CoreRange, DeviceParams, MemoryConfig, MeshDevice, MeshShape};
use meshccl::sub_device::{SubDevice, SubDeviceLayout};
use meshccl::tensor::{DataType, Tensor};
use meshccl::{FabricConfig, FabricSession, MeshTensor};
use proptest::prelude::*;

fn open_mesh(rows: usize, cols: usize) -> MeshDevice {
    let params = DeviceParams {
        ring_wraparound: true,
        ..DeviceParams::default()
    };
    let mesh = MeshDevice::open(MeshShape::new(rows, cols).unwrap(), params).unwrap();
    let workers = CoreRange::new(CoreCoord::new(0, 0), CoreCoord::new(3, 0));
    let layout = SubDeviceLayout::Replicated(vec![SubDevice::new(workers.into())]);
    let id = mesh.create_sub_device_manager(&layout, 0).unwrap();
    mesh.load_sub_device_manager(id).unwrap();
    mesh
}

fn topology() -> impl Strategy<Value = Topology> {
    prop_oneof![Just(Topology::Linear), Just(Topology::Ring)]
}

fn per_chip(mesh: &MeshDevice, shape: [usize; 2], seed: u64) -> MeshTensor<f32, 2> {
    let shards = (0..mesh.num_devices())
        .map(|c| {
            Tensor::from_fn(shape, |i| {
                let h = (seed ^ (c as u64) << 20 ^ i as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15);
                ((h >> 40) % 17) as f32 - 8.0
            })
        })
        .collect();
    MeshTensor::from_shards(mesh, shards, DataType::Float32, MemoryConfig::DRAM).unwrap()
}

fn host_sum(input: &MeshTensor<f32, 2>, chips: impl Iterator<Item = usize> + Clone) -> Vec<f32> {
    (0..input.shards()[0].size())
        .map(|i| chips.clone().map(|c| input.shards()[c].data()[i]).sum())
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn all_gather_restores_host_tensor(
        devices in 2usize..=5,
        rows in 1usize..=3,
        per_chip_cols in 1usize..=6,
        dim in 0usize..2,
        links in 1usize..=2,
        topology in topology(),
    ) {
        let mesh = open_mesh(1, devices);
        let session = FabricSession::open(&mesh, FabricConfig::default()).unwrap();
        let shape = if dim == 0 { [rows * devices, per_chip_cols] } else { [rows, per_chip_cols * devices] };
        let host = Tensor::<f32, 2>::from_fn(shape, |i| i as f32);
        let input = MeshTensor::shard(&mesh, &host, dim, None, DataType::Float32, MemoryConfig::DRAM).unwrap();

        let desc = CollectiveDescriptor::all_gather(dim).with_links(links).with_topology(topology);
        let out = session.all_gather(input, &desc).unwrap();
        for shard in out.shards() {
            prop_assert_eq!(shard.shape(), host.shape());
            prop_assert_eq!(shard.data(), host.data());
        }
        session.close().unwrap();
    }

    #[test]
    fn reduce_scatter_keeps_own_slice_of_sum(
        devices in 2usize..=5,
        rows in 1usize..=3,
        cols_per_chip in 1usize..=4,
        links in 1usize..=2,
        topology in topology(),
        seed in any::<u64>(),
    ) {
        let mesh = open_mesh(1, devices);
        let session = FabricSession::open(&mesh, FabricConfig::default()).unwrap();
        let cols = cols_per_chip * devices;
        let input = per_chip(&mesh, [rows, cols], seed);
        let sum = host_sum(&input, 0..devices);

        let desc = CollectiveDescriptor::reduce_scatter(1).with_links(links).with_topology(topology);
        let out = session.reduce_scatter(input, &desc).unwrap();
        for (c, shard) in out.shards().iter().enumerate() {
            prop_assert_eq!(shard.shape(), &[rows, cols_per_chip]);
            for r in 0..rows {
                let want = &sum[r * cols + c * cols_per_chip..r * cols + (c + 1) * cols_per_chip];
                prop_assert_eq!(&shard.data()[r * cols_per_chip..(r + 1) * cols_per_chip], want);
            }
        }
        session.close().unwrap();
    }

    #[test]
    fn all_reduce_modes_agree(
        cols in 2usize..=4,
        width_per_chip in 1usize..=4,
        mode_index in 0usize..3,
        seed in any::<u64>(),
    ) {
        let mesh = open_mesh(2, cols);
        let session = FabricSession::open(&mesh, FabricConfig::default()).unwrap();
        let input = per_chip(&mesh, [2, width_per_chip * cols], seed);
        let mode = [
            AllReduceMode::LineReduce,
            AllReduceMode::Fused,
            AllReduceMode::Composite { all_gather_links: 2 },
        ][mode_index];

        let desc = CollectiveDescriptor::all_reduce(mode).with_cluster_axis(1);
        let out = session.all_reduce(input.clone(), &desc).unwrap();
        for row in 0..2 {
            let chips = row * cols..(row + 1) * cols;
            let want = host_sum(&input, chips.clone());
            for c in chips {
                prop_assert_eq!(out.shards()[c].data(), want.as_slice());
            }
        }
        session.close().unwrap();
    }
}
