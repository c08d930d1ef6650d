//! Mesh topology descriptor and the simulated chips behind it.
//!
//! A [`MeshDevice`] is a `rows x cols` grid of chips. Each chip has a
//! compute-core grid, an L1 pool, a DRAM pool, and its own sub-device
//! registry. Collectives address chips by [`ChipId`] (row-major index) and
//! run along one *cluster axis*:
//!
//! - axis `0` groups the chips of each column (the collective spans `rows` chips),
//! - axis `1` groups the chips of each row (it spans `cols` chips),
//! - no axis treats the whole mesh as one line in row-major order.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

pub mod config;
pub mod core_coord;
pub mod memory;

pub use config::{ConfigError, DeviceParams};
pub use core_coord::{CoreCoord, CoreRange, CoreRangeSet};
pub use memory::{Allocation, BufferType, MemoryConfig, MemoryPool, TensorMemoryLayout};

use crate::error::{CclError, Result};
use crate::fabric::FabricState;
use crate::lock;
use crate::semaphore::SemaphoreTable;
use crate::sub_device::{SubDeviceManagerId, SubDeviceRegistry};

/// Unique identifier of a chip; its row-major index in the mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChipId(pub usize);

impl fmt::Display for ChipId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MeshCoordinate {
    pub row: usize,
    pub col: usize,
}

/// Shape of the chip grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MeshShape {
    rows: usize,
    cols: usize,
}

impl MeshShape {
    /// # Errors
    ///
    /// `InvalidConfig` if either extent is zero.
    pub fn new(rows: usize, cols: usize) -> Result<Self> {
        if rows == 0 || cols == 0 {
            return Err(CclError::InvalidConfig(format!(
                "mesh shape {rows}x{cols} has no devices"
            )));
        }
        Ok(Self { rows, cols })
    }

    pub const fn rows(&self) -> usize {
        self.rows
    }

    pub const fn cols(&self) -> usize {
        self.cols
    }

    pub const fn num_devices(&self) -> usize {
        self.rows * self.cols
    }

    /// Whether the grid is one-dimensional (one row or one column).
    pub const fn is_line(&self) -> bool {
        self.rows == 1 || self.cols == 1
    }

    /// Number of chips a collective along `cluster_axis` spans.
    ///
    /// # Errors
    ///
    /// `InvalidClusterAxis` for an axis other than 0 or 1.
    pub fn axis_size(&self, cluster_axis: Option<usize>) -> Result<usize> {
        match cluster_axis {
            None => Ok(self.num_devices()),
            Some(0) => Ok(self.rows),
            Some(1) => Ok(self.cols),
            Some(axis) => Err(CclError::InvalidClusterAxis {
                axis,
                rows: self.rows,
                cols: self.cols,
            }),
        }
    }

    pub const fn coordinate(&self, chip: ChipId) -> MeshCoordinate {
        MeshCoordinate {
            row: chip.0 / self.cols,
            col: chip.0 % self.cols,
        }
    }

    pub const fn chip_at(&self, coord: MeshCoordinate) -> ChipId {
        ChipId(coord.row * self.cols + coord.col)
    }

    /// The ordered chip groups a collective along `cluster_axis` runs over.
    pub fn axis_groups(&self, cluster_axis: Option<usize>) -> Result<Vec<Vec<ChipId>>> {
        self.axis_size(cluster_axis)?;
        let groups = match cluster_axis {
            None => vec![(0..self.num_devices()).map(ChipId).collect()],
            Some(0) => (0..self.cols)
                .map(|col| {
                    (0..self.rows)
                        .map(|row| self.chip_at(MeshCoordinate { row, col }))
                        .collect()
                })
                .collect(),
            _ => (0..self.rows)
                .map(|row| {
                    (0..self.cols)
                        .map(|col| self.chip_at(MeshCoordinate { row, col }))
                        .collect()
                })
                .collect(),
        };
        Ok(groups)
    }

    /// Position of `chip` inside its group along `cluster_axis`.
    pub fn position_along(&self, chip: ChipId, cluster_axis: Option<usize>) -> Result<usize> {
        self.axis_size(cluster_axis)?;
        let coord = self.coordinate(chip);
        Ok(match cluster_axis {
            None => chip.0,
            Some(0) => coord.row,
            _ => coord.col,
        })
    }
}

impl fmt::Display for MeshShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.rows, self.cols)
    }
}

/// One accelerator chip of the mesh.
#[derive(Debug)]
pub struct Chip {
    id: ChipId,
    coord: MeshCoordinate,
    core_grid: CoreCoord,
    l1: Arc<MemoryPool>,
    dram: Arc<MemoryPool>,
    _l1_small: Option<Allocation>,
    pub(crate) sub_devices: Mutex<SubDeviceRegistry>,
}

impl Chip {
    pub fn id(&self) -> ChipId {
        self.id
    }

    pub fn coord(&self) -> MeshCoordinate {
        self.coord
    }

    /// Compute-core grid size (`x` columns by `y` rows of cores).
    pub fn core_grid(&self) -> CoreCoord {
        self.core_grid
    }

    pub fn pool(&self, buffer_type: BufferType) -> &Arc<MemoryPool> {
        match buffer_type {
            BufferType::L1 => &self.l1,
            BufferType::Dram => &self.dram,
        }
    }
}

/// Counts of every resource the collective layer hands out.
///
/// Used to check that repeated open/close cycles leak nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResourceCounts {
    pub live_semaphores: usize,
    pub sub_device_managers: usize,
    pub loaded_managers: usize,
    pub open_sessions: usize,
    pub persistent_fabric: bool,
    pub l1_bytes_in_use: usize,
    pub dram_bytes_in_use: usize,
}

/// A grid of interconnected chips.
///
/// Owned by the runtime; fabric sessions borrow it for their lifetime. The
/// state sits behind an `Arc` so a session's command-queue workers can
/// reach the chips from their own threads until the session is closed.
#[derive(Debug)]
pub struct MeshDevice {
    inner: Arc<MeshState>,
}

#[derive(Debug)]
struct MeshState {
    shape: MeshShape,
    params: DeviceParams,
    chips: Vec<Chip>,
    semaphores: Arc<SemaphoreTable>,
    fabric: Mutex<FabricState>,
    next_manager_id: AtomicU64,
}

impl MeshDevice {
    /// Opens a mesh of `shape` chips configured by `params`.
    ///
    /// # Errors
    ///
    /// `Config` if `params` fail validation, `OutOfMemory` if
    /// `l1_small_size` cannot be carved out of L1.
    pub fn open(shape: MeshShape, params: DeviceParams) -> Result<Self> {
        params.validate()?;
        let core_grid = CoreCoord::new(params.core_grid[0], params.core_grid[1]);
        let l1_bytes = params.l1_bytes_per_chip()?;
        let chips = (0..shape.num_devices())
            .map(|i| -> Result<Chip> {
                let id = ChipId(i);
                let l1 = MemoryPool::new(id, BufferType::L1, l1_bytes);
                let dram = MemoryPool::new(id, BufferType::Dram, params.dram_bytes_per_chip);
                let l1_small = match params.l1_small_size {
                    0 => None,
                    n => Some(l1.allocate(n)?),
                };
                Ok(Chip {
                    id,
                    coord: shape.coordinate(id),
                    core_grid,
                    l1,
                    dram,
                    _l1_small: l1_small,
                    sub_devices: Mutex::new(SubDeviceRegistry::default()),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        tracing::info!(
            mesh = %shape,
            cores_per_chip = params.num_cores(),
            queues = params.num_command_queues,
            "opened mesh device"
        );

        Ok(Self {
            inner: Arc::new(MeshState {
                shape,
                semaphores: SemaphoreTable::new(shape.num_devices()),
                params,
                chips,
                fabric: Mutex::new(FabricState::default()),
                next_manager_id: AtomicU64::new(0),
            }),
        })
    }

    /// Another handle to the same chips, for threads that outlive a borrow.
    pub(crate) fn share(&self) -> MeshDevice {
        MeshDevice {
            inner: Arc::clone(&self.inner),
        }
    }

    pub(crate) fn fabric_state(&self) -> &Mutex<FabricState> {
        &self.inner.fabric
    }

    pub(crate) fn semaphore_table(&self) -> &Arc<SemaphoreTable> {
        &self.inner.semaphores
    }

    pub fn shape(&self) -> MeshShape {
        self.inner.shape
    }

    pub fn params(&self) -> &DeviceParams {
        &self.inner.params
    }

    pub fn num_devices(&self) -> usize {
        self.inner.chips.len()
    }

    pub fn chips(&self) -> &[Chip] {
        &self.inner.chips
    }

    pub fn chip(&self, id: ChipId) -> Option<&Chip> {
        self.inner.chips.get(id.0)
    }

    pub fn core_grid(&self) -> CoreCoord {
        let grid = self.inner.params.core_grid;
        CoreCoord::new(grid[0], grid[1])
    }

    pub(crate) fn next_manager_id(&self) -> SubDeviceManagerId {
        SubDeviceManagerId(self.inner.next_manager_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn resource_counts(&self) -> ResourceCounts {
        let mut managers = HashSet::new();
        let mut loaded = HashSet::new();
        for chip in self.chips() {
            let registry = lock(&chip.sub_devices);
            managers.extend(registry.manager_ids());
            loaded.extend(registry.loaded());
        }
        let fabric = lock(self.fabric_state());
        ResourceCounts {
            live_semaphores: self.inner.semaphores.live(),
            sub_device_managers: managers.len(),
            loaded_managers: loaded.len(),
            open_sessions: fabric.open_sessions(),
            persistent_fabric: fabric.has_routing(),
            l1_bytes_in_use: self.chips().iter().map(|c| c.l1.used()).sum(),
            dram_bytes_in_use: self.chips().iter().map(|c| c.dram.used()).sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mesh_shape_axes() {
        let shape = MeshShape::new(4, 8).unwrap();
        assert_eq!(shape.num_devices(), 32);
        assert_eq!(shape.axis_size(Some(0)).unwrap(), 4);
        assert_eq!(shape.axis_size(Some(1)).unwrap(), 8);
        assert_eq!(shape.axis_size(None).unwrap(), 32);
        assert!(matches!(
            shape.axis_size(Some(2)),
            Err(CclError::InvalidClusterAxis { axis: 2, rows: 4, cols: 8 })
        ));
        assert!(!shape.is_line());
        assert!(MeshShape::new(0, 8).is_err());
    }

    #[test]
    fn test_axis_groups() {
        let shape = MeshShape::new(2, 3).unwrap();
        let cols = shape.axis_groups(Some(0)).unwrap();
        assert_eq!(cols.len(), 3);
        assert_eq!(cols[1], vec![ChipId(1), ChipId(4)]);

        let rows = shape.axis_groups(Some(1)).unwrap();
        assert_eq!(rows[1], vec![ChipId(3), ChipId(4), ChipId(5)]);

        let all = shape.axis_groups(None).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].len(), 6);
    }

    #[test]
    fn test_position_along() {
        let shape = MeshShape::new(2, 3).unwrap();
        assert_eq!(shape.position_along(ChipId(4), Some(0)).unwrap(), 1);
        assert_eq!(shape.position_along(ChipId(4), Some(1)).unwrap(), 1);
        assert_eq!(shape.position_along(ChipId(5), Some(1)).unwrap(), 2);
        assert_eq!(shape.position_along(ChipId(5), None).unwrap(), 5);
    }

    #[test]
    fn test_open_mesh() {
        let params = DeviceParams {
            l1_small_size: 1024,
            ..DeviceParams::default()
        };
        let mesh = MeshDevice::open(MeshShape::new(1, 2).unwrap(), params).unwrap();
        assert_eq!(mesh.num_devices(), 2);
        assert_eq!(mesh.chips()[1].coord(), MeshCoordinate { row: 0, col: 1 });
        assert_eq!(mesh.core_grid(), CoreCoord::new(8, 8));

        let counts = mesh.resource_counts();
        assert_eq!(counts.l1_bytes_in_use, 2048);
        assert_eq!(counts.open_sessions, 0);
        assert!(!counts.persistent_fabric);
    }
}
