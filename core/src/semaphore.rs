//! Global semaphores: counters at one L1 address on every participating
//! core of every participating chip.
//!
//! A remote writer bumps a peer's counter after its payload has landed; the
//! peer blocks in [`GlobalSemaphore::wait`] until the counter reaches the
//! expected value, then consumes it. Because every copy lives at the same
//! address, a kernel can target "the semaphore" on any chip without a
//! per-chip lookup.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};

use crate::error::{CclError, Result};
use crate::lock;
use crate::mesh::{ChipId, CoreCoord, CoreRangeSet, MeshDevice};

/// First L1 address handed out to semaphores.
pub const SEMAPHORE_BASE_ADDRESS: u32 = 0x0001_0000;
/// Bytes reserved per semaphore slot (one aligned word).
pub const SEMAPHORE_SLOT_BYTES: u32 = 16;
/// Number of semaphore slots per chip.
pub const MAX_SEMAPHORES: usize = 256;

/// Tracks which semaphore slots are in use on each chip.
#[derive(Debug)]
pub(crate) struct SemaphoreTable {
    used: Mutex<Vec<BTreeSet<usize>>>,
    live: AtomicUsize,
}

impl SemaphoreTable {
    pub(crate) fn new(num_chips: usize) -> Arc<Self> {
        Arc::new(Self {
            used: Mutex::new(vec![BTreeSet::new(); num_chips]),
            live: AtomicUsize::new(0),
        })
    }

    pub(crate) fn live(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// Claims the lowest slot free on every chip in `chips`.
    fn claim(&self, chips: &[ChipId]) -> Result<usize> {
        let mut used = lock(&self.used);
        let slot = (0..MAX_SEMAPHORES)
            .find(|slot| {
                chips
                    .iter()
                    .all(|c| used.get(c.0).is_some_and(|set| !set.contains(slot)))
            })
            .ok_or_else(|| {
                CclError::Fabric(format!(
                    "no semaphore address is free on all of {} chips",
                    chips.len()
                ))
            })?;
        for chip in chips {
            if let Some(set) = used.get_mut(chip.0) {
                set.insert(slot);
            }
        }
        self.live.fetch_add(1, Ordering::AcqRel);
        Ok(slot)
    }

    fn release(&self, chips: &[ChipId], slot: usize) {
        let mut used = lock(&self.used);
        for chip in chips {
            if let Some(set) = used.get_mut(chip.0) {
                set.remove(&slot);
            }
        }
        self.live.fetch_sub(1, Ordering::AcqRel);
    }
}

#[derive(Debug)]
struct Cell {
    value: Mutex<u32>,
    changed: Condvar,
}

/// A counter replicated on a core range of one or more chips.
///
/// Dropping the semaphore releases its address on every chip.
#[derive(Debug)]
pub struct GlobalSemaphore {
    address: u32,
    slot: usize,
    initial_value: u32,
    chips: Vec<ChipId>,
    cores: CoreRangeSet,
    cells: HashMap<(ChipId, CoreCoord), Cell>,
    table: Arc<SemaphoreTable>,
}

impl GlobalSemaphore {
    /// The L1 address of this semaphore, identical on every chip.
    pub fn address(&self) -> u32 {
        self.address
    }

    pub fn cores(&self) -> &CoreRangeSet {
        &self.cores
    }

    pub fn chips(&self) -> &[ChipId] {
        &self.chips
    }

    pub fn initial_value(&self) -> u32 {
        self.initial_value
    }

    fn cell(&self, chip: ChipId, core: CoreCoord) -> Result<&Cell> {
        self.cells.get(&(chip, core)).ok_or_else(|| {
            CclError::Fabric(format!(
                "semaphore at {:#x} has no copy on chip {chip} core {core}",
                self.address
            ))
        })
    }

    /// Adds `n` to the copy on `chip`/`core` and wakes its waiters.
    pub fn increment(&self, chip: ChipId, core: CoreCoord, n: u32) -> Result<()> {
        let cell = self.cell(chip, core)?;
        let mut value = cell.value.lock().unwrap_or_else(PoisonError::into_inner);
        *value = value.wrapping_add(n);
        cell.changed.notify_all();
        Ok(())
    }

    /// Blocks until the copy on `chip`/`core` reaches `expected`, then
    /// subtracts `expected` from it.
    ///
    /// There is no timeout: a partner that never signals stalls the caller.
    pub fn wait(&self, chip: ChipId, core: CoreCoord, expected: u32) -> Result<()> {
        let cell = self.cell(chip, core)?;
        let guard = cell.value.lock().unwrap_or_else(PoisonError::into_inner);
        let mut value = cell
            .changed
            .wait_while(guard, |v| *v < expected)
            .unwrap_or_else(PoisonError::into_inner);
        *value -= expected;
        Ok(())
    }

    /// Current value of the copy on `chip`/`core`.
    pub fn value(&self, chip: ChipId, core: CoreCoord) -> Result<u32> {
        let cell = self.cell(chip, core)?;
        Ok(*cell.value.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Sets every copy back to the initial value.
    ///
    /// Only safe when no transfer is in flight.
    pub fn reset_value(&self) {
        for cell in self.cells.values() {
            *cell.value.lock().unwrap_or_else(PoisonError::into_inner) = self.initial_value;
        }
    }
}

impl Drop for GlobalSemaphore {
    fn drop(&mut self) {
        self.table.release(&self.chips, self.slot);
    }
}

impl MeshDevice {
    /// Allocates a semaphore on `cores` of every chip in the mesh.
    ///
    /// # Errors
    ///
    /// `CoreRangeOutOfGrid` if `cores` do not fit the grid, `Fabric` if no
    /// address is free on all chips.
    pub fn create_global_semaphore(
        &self,
        cores: &CoreRangeSet,
        initial_value: u32,
    ) -> Result<GlobalSemaphore> {
        let chips: Vec<ChipId> = self.chips().iter().map(|c| c.id()).collect();
        self.create_global_semaphore_on(&chips, cores, initial_value)
    }

    /// Allocates a semaphore on `cores` of the given chips only.
    pub fn create_global_semaphore_on(
        &self,
        chips: &[ChipId],
        cores: &CoreRangeSet,
        initial_value: u32,
    ) -> Result<GlobalSemaphore> {
        cores.check_fits(self.core_grid())?;
        if let Some(bad) = chips.iter().find(|c| self.chip(**c).is_none()) {
            return Err(CclError::InvalidConfig(format!("chip {bad} is not in the mesh")));
        }
        let slot = self.semaphore_table().claim(chips)?;
        let core_list = cores.cores();
        let core_ref = &core_list;
        let cells = chips
            .iter()
            .flat_map(|&chip| core_ref.iter().map(move |&core| (chip, core)))
            .map(|key| {
                let cell = Cell {
                    value: Mutex::new(initial_value),
                    changed: Condvar::new(),
                };
                (key, cell)
            })
            .collect();
        let address = SEMAPHORE_BASE_ADDRESS + slot as u32 * SEMAPHORE_SLOT_BYTES;
        tracing::trace!(address, chips = chips.len(), cores = core_list.len(), "created global semaphore");
        Ok(GlobalSemaphore {
            address,
            slot,
            initial_value,
            chips: chips.to_vec(),
            cores: cores.clone(),
            cells,
            table: Arc::clone(self.semaphore_table()),
        })
    }
}
