//! Sub-device reservation: partitioning each chip's cores into disjoint
//! groups, only one partition (a *manager*) active at a time.
//!
//! Collective ops are scheduled onto the cores of one sub-device while the
//! rest of the grid keeps running compute. Lifecycle of a manager:
//!
//! ```text
//! create -> load -> (clear_loaded | load another) -> remove
//! ```
//!
//! Managers are created with the same id on every chip of the mesh, and
//! load/clear/remove apply to every chip, so the mesh never ends up with
//! different partitions active on different chips.

use std::collections::HashMap;
use std::fmt;
use std::sync::MutexGuard;

use crate::error::{CclError, Result};
use crate::lock;
use crate::mesh::{Allocation, BufferType, ChipId, CoreCoord, CoreRangeSet, MeshDevice};

/// Index of a sub-device inside its manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubDeviceId(pub u8);

impl fmt::Display for SubDeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubDeviceManagerId(pub(crate) u64);

impl fmt::Display for SubDeviceManagerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A named set of worker cores on one chip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubDevice {
    cores: CoreRangeSet,
}

impl SubDevice {
    pub fn new(cores: CoreRangeSet) -> Self {
        Self { cores }
    }

    pub fn cores(&self) -> &CoreRangeSet {
        &self.cores
    }
}

/// How the sub-devices of a new manager are laid out over the mesh.
#[derive(Debug, Clone)]
pub enum SubDeviceLayout {
    /// The same partition on every chip.
    Replicated(Vec<SubDevice>),
    /// One partition per chip, indexed by [`ChipId`].
    PerChip(Vec<Vec<SubDevice>>),
}

impl SubDeviceLayout {
    fn for_chip(&self, chip: ChipId) -> Option<&[SubDevice]> {
        match self {
            SubDeviceLayout::Replicated(subs) => Some(subs),
            SubDeviceLayout::PerChip(per_chip) => per_chip.get(chip.0).map(Vec::as_slice),
        }
    }
}

#[derive(Debug)]
pub(crate) struct SubDeviceManager {
    sub_devices: Vec<SubDevice>,
    local_l1_size: usize,
    reservation: Option<Allocation>,
}

/// Per-chip bookkeeping behind the mesh-level sub-device calls.
#[derive(Debug, Default)]
pub(crate) struct SubDeviceRegistry {
    managers: HashMap<SubDeviceManagerId, SubDeviceManager>,
    loaded: Option<SubDeviceManagerId>,
    /// Open fabric sessions scheduled on the loaded manager.
    pins: usize,
    stall_group: Vec<SubDeviceId>,
}

impl SubDeviceRegistry {
    pub(crate) fn manager_ids(&self) -> impl Iterator<Item = SubDeviceManagerId> + '_ {
        self.managers.keys().copied()
    }

    pub(crate) fn loaded(&self) -> Option<SubDeviceManagerId> {
        self.loaded
    }

    fn loaded_manager(&self, chip: ChipId) -> Result<(SubDeviceManagerId, &SubDeviceManager)> {
        let id = self.loaded.ok_or(CclError::NoSubDeviceManagerLoaded(chip))?;
        let manager = self
            .managers
            .get(&id)
            .ok_or(CclError::UnknownSubDeviceManager(id))?;
        Ok((id, manager))
    }

    fn check_not_busy(&self) -> Result<()> {
        match self.loaded {
            Some(manager) if self.pins > 0 => Err(CclError::SubDeviceBusy {
                manager,
                sessions: self.pins,
            }),
            _ => Ok(()),
        }
    }

    /// Detaches the loaded manager's L1 reservation, leaving it loaded.
    fn take_reservation(&mut self) -> Option<Allocation> {
        let id = self.loaded?;
        self.managers.get_mut(&id)?.reservation.take()
    }

    fn restore_reservation(&mut self, reservation: Option<Allocation>) {
        if let Some(manager) = self.loaded.and_then(|id| self.managers.get_mut(&id)) {
            manager.reservation = reservation;
        }
    }

    fn unload(&mut self) {
        if let Some(id) = self.loaded.take() {
            if let Some(manager) = self.managers.get_mut(&id) {
                manager.reservation = None;
            }
        }
        self.stall_group.clear();
    }
}

/// A chip's reservation while a manager load is in progress.
struct Staged {
    reservation: Option<Allocation>,
    /// Size of the reservation the chip held before the load.
    previous: usize,
}

impl Staged {
    fn rollback(self) -> Option<Allocation> {
        let previous = self.previous;
        self.reservation
            .filter(|_| previous > 0)
            .map(|mut r| {
                r.shrink(previous);
                r
            })
    }
}

fn validate_sub_devices(sub_devices: &[SubDevice], grid: CoreCoord) -> Result<()> {
    if sub_devices.is_empty() {
        return Err(CclError::InvalidConfig(
            "a sub-device manager needs at least one sub-device".into(),
        ));
    }
    if sub_devices.len() > usize::from(u8::MAX) + 1 {
        return Err(CclError::InvalidConfig(format!(
            "{} sub-devices exceed the per-manager limit",
            sub_devices.len()
        )));
    }
    for (i, sub) in sub_devices.iter().enumerate() {
        if sub.cores.is_empty() {
            return Err(CclError::InvalidConfig(format!("sub-device {i} has no cores")));
        }
        sub.cores.check_fits(grid)?;
        for other in &sub_devices[i + 1..] {
            if let Some((first, second)) = sub.cores.overlap(&other.cores) {
                return Err(CclError::OverlappingCoreRanges { first, second });
            }
        }
    }
    Ok(())
}

impl MeshDevice {
    fn lock_registries(&self) -> Vec<MutexGuard<'_, SubDeviceRegistry>> {
        self.chips().iter().map(|c| lock(&c.sub_devices)).collect()
    }

    /// Registers a partition of every chip's cores into sub-devices.
    ///
    /// `local_l1_size` bytes of L1 are reserved on each chip while the
    /// manager is loaded.
    ///
    /// # Errors
    ///
    /// `OverlappingCoreRanges` if two sub-devices share a core,
    /// `CoreRangeOutOfGrid` if a range exceeds the grid, `InvalidConfig`
    /// for empty layouts or a per-chip layout of the wrong length,
    /// `OutOfMemory` if `local_l1_size` exceeds a chip's L1.
    pub fn create_sub_device_manager(
        &self,
        layout: &SubDeviceLayout,
        local_l1_size: usize,
    ) -> Result<SubDeviceManagerId> {
        if let SubDeviceLayout::PerChip(per_chip) = layout {
            if per_chip.len() != self.num_devices() {
                return Err(CclError::InvalidConfig(format!(
                    "per-chip layout has {} entries for {} chips",
                    per_chip.len(),
                    self.num_devices()
                )));
            }
        }

        let grid = self.core_grid();
        for chip in self.chips() {
            let subs = layout.for_chip(chip.id()).unwrap_or_default();
            validate_sub_devices(subs, grid)?;
            let l1 = chip.pool(BufferType::L1);
            if local_l1_size > l1.capacity() {
                return Err(CclError::OutOfMemory {
                    chip: chip.id(),
                    buffer: BufferType::L1,
                    requested: local_l1_size,
                    available: l1.capacity(),
                });
            }
        }

        let id = self.next_manager_id();
        let mut registries = self.lock_registries();
        for (chip, registry) in self.chips().iter().zip(registries.iter_mut()) {
            let sub_devices = layout.for_chip(chip.id()).unwrap_or_default().to_vec();
            registry.managers.insert(
                id,
                SubDeviceManager {
                    sub_devices,
                    local_l1_size,
                    reservation: None,
                },
            );
        }
        tracing::debug!(manager = %id, local_l1_size, "created sub-device manager");
        Ok(id)
    }

    /// Makes `id` the active partition on every chip.
    ///
    /// Replaces any previously loaded manager and resets the stall group to
    /// all of the new manager's sub-devices.
    ///
    /// # Errors
    ///
    /// `UnknownSubDeviceManager`, `SubDeviceBusy` if a fabric session is
    /// still scheduled on the current manager, `OutOfMemory` if the local
    /// L1 reservation does not fit.
    pub fn load_sub_device_manager(&self, id: SubDeviceManagerId) -> Result<()> {
        let mut registries = self.lock_registries();
        let mut local_l1_size = 0;
        for registry in &registries {
            let Some(manager) = registry.managers.get(&id) else {
                return Err(CclError::UnknownSubDeviceManager(id));
            };
            local_l1_size = manager.local_l1_size;
            if registry.loaded == Some(id) {
                continue;
            }
            registry.check_not_busy()?;
        }

        // Reserve on every chip before anything is unloaded. A chip keeps
        // the larger of its old and new reservation until commit.
        let mut staged: Vec<Option<Staged>> = Vec::with_capacity(registries.len());
        for (i, chip) in self.chips().iter().enumerate() {
            let registry = &mut registries[i];
            if registry.loaded == Some(id) {
                staged.push(None);
                continue;
            }
            let held = registry.take_reservation();
            let previous = held.as_ref().map_or(0, Allocation::bytes);
            let reserved = match held {
                Some(mut reservation) => match reservation.grow(local_l1_size) {
                    Ok(()) => Ok(Some(reservation)),
                    Err(err) => {
                        registry.restore_reservation(Some(reservation));
                        Err(err)
                    }
                },
                None if local_l1_size == 0 => Ok(None),
                None => chip.pool(BufferType::L1).allocate(local_l1_size).map(Some),
            };
            match reserved {
                Ok(reservation) => staged.push(Some(Staged {
                    reservation,
                    previous,
                })),
                Err(err) => {
                    for (registry, staged) in registries.iter_mut().zip(staged) {
                        if let Some(staged) = staged {
                            registry.restore_reservation(staged.rollback());
                        }
                    }
                    tracing::warn!(manager = %id, chip = %chip.id(), error = %err, "sub-device manager load rolled back");
                    return Err(err);
                }
            }
        }

        for (registry, staged) in registries.iter_mut().zip(staged) {
            let Some(Staged { reservation, .. }) = staged else {
                continue;
            };
            registry.unload();
            let Some(manager) = registry.managers.get_mut(&id) else {
                continue;
            };
            manager.reservation = reservation.and_then(|mut r| {
                r.shrink(local_l1_size);
                (local_l1_size > 0).then_some(r)
            });
            let count = manager.sub_devices.len();
            registry.stall_group = (0..count).map(|i| SubDeviceId(i as u8)).collect();
            registry.loaded = Some(id);
        }
        tracing::info!(manager = %id, "loaded sub-device manager");
        Ok(())
    }

    /// Unloads the active manager, returning every chip to a single
    /// undivided core grid.
    ///
    /// # Errors
    ///
    /// `SubDeviceBusy` if a fabric session is still open on it.
    pub fn clear_loaded_sub_device_manager(&self) -> Result<()> {
        let mut registries = self.lock_registries();
        for registry in &registries {
            registry.check_not_busy()?;
        }
        for registry in registries.iter_mut() {
            registry.unload();
        }
        tracing::info!("cleared loaded sub-device manager");
        Ok(())
    }

    /// Destroys a manager that is not loaded.
    ///
    /// # Errors
    ///
    /// `SubDeviceManagerLoaded` if it is active, `UnknownSubDeviceManager`
    /// if it does not exist.
    pub fn remove_sub_device_manager(&self, id: SubDeviceManagerId) -> Result<()> {
        let mut registries = self.lock_registries();
        for registry in &registries {
            if registry.loaded == Some(id) {
                return Err(CclError::SubDeviceManagerLoaded(id));
            }
            if !registry.managers.contains_key(&id) {
                return Err(CclError::UnknownSubDeviceManager(id));
            }
        }
        for registry in registries.iter_mut() {
            registry.managers.remove(&id);
        }
        tracing::info!(manager = %id, "removed sub-device manager");
        Ok(())
    }

    /// The manager loaded on the mesh, if any.
    pub fn loaded_sub_device_manager(&self) -> Option<SubDeviceManagerId> {
        self.chips().first().and_then(|c| lock(&c.sub_devices).loaded)
    }

    /// Restricts which sub-devices
    /// [`FabricSession::synchronize_sub_devices`](crate::FabricSession::synchronize_sub_devices)
    /// waits on when given no explicit list.
    ///
    /// # Errors
    ///
    /// `NoSubDeviceManagerLoaded`, or `UnknownSubDevice` for an id the
    /// loaded manager does not have.
    pub fn set_sub_device_stall_group(&self, group: &[SubDeviceId]) -> Result<()> {
        let mut registries = self.lock_registries();
        for (chip, registry) in self.chips().iter().zip(registries.iter()) {
            let (_, manager) = registry.loaded_manager(chip.id())?;
            if let Some(bad) = group
                .iter()
                .find(|id| usize::from(id.0) >= manager.sub_devices.len())
            {
                return Err(CclError::UnknownSubDevice(*bad));
            }
        }
        for registry in registries.iter_mut() {
            registry.stall_group = group.to_vec();
        }
        Ok(())
    }

    /// Restores the stall group to every sub-device of the loaded manager.
    pub fn reset_sub_device_stall_group(&self) {
        for registry in self.lock_registries().iter_mut() {
            let count = registry
                .loaded
                .and_then(|id| registry.managers.get(&id))
                .map_or(0, |m| m.sub_devices.len());
            registry.stall_group = (0..count).map(|i| SubDeviceId(i as u8)).collect();
        }
    }

    /// The sub-devices a stall-group synchronize currently waits on.
    pub fn sub_device_stall_group(&self) -> Vec<SubDeviceId> {
        self.chips()
            .first()
            .map(|c| lock(&c.sub_devices).stall_group.clone())
            .unwrap_or_default()
    }

    /// Cores of sub-device `id` of the manager loaded on `chip`.
    ///
    /// # Errors
    ///
    /// `NoSubDeviceManagerLoaded` or `UnknownSubDevice`.
    pub fn sub_device_cores(&self, chip: ChipId, id: SubDeviceId) -> Result<CoreRangeSet> {
        let chip_ref = self
            .chip(chip)
            .ok_or_else(|| CclError::InvalidConfig(format!("chip {chip} is not in the mesh")))?;
        let registry = lock(&chip_ref.sub_devices);
        let (_, manager) = registry.loaded_manager(chip)?;
        manager
            .sub_devices
            .get(usize::from(id.0))
            .map(|s| s.cores.clone())
            .ok_or(CclError::UnknownSubDevice(id))
    }

    /// Pins the loaded manager for a fabric session on `worker`; returns it.
    pub(crate) fn pin_sub_device_manager(&self, worker: SubDeviceId) -> Result<SubDeviceManagerId> {
        let mut registries = self.lock_registries();
        let mut pinned = None;
        for (chip, registry) in self.chips().iter().zip(registries.iter()) {
            let (id, manager) = registry.loaded_manager(chip.id())?;
            if usize::from(worker.0) >= manager.sub_devices.len() {
                return Err(CclError::UnknownSubDevice(worker));
            }
            pinned = Some(id);
        }
        for registry in registries.iter_mut() {
            registry.pins += 1;
        }
        pinned.ok_or(CclError::NoSubDeviceManagerLoaded(ChipId(0)))
    }

    pub(crate) fn unpin_sub_device_manager(&self) {
        for registry in self.lock_registries().iter_mut() {
            registry.pins = registry.pins.saturating_sub(1);
        }
    }
}
