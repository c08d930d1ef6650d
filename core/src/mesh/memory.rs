//! Per-chip memory tiers and shard placement.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::ChipId;
use crate::error::{CclError, Result};

/// Which memory a buffer lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BufferType {
    /// Small, fast SRAM local to the compute cores.
    L1,
    /// Large off-core device memory.
    Dram,
}

/// How a buffer is distributed over the chip's cores or memory banks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TensorMemoryLayout {
    /// Pages round-robined across banks.
    Interleaved,
    HeightSharded,
    WidthSharded,
    BlockSharded,
}

/// Placement of a shard buffer on each chip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemoryConfig {
    pub layout: TensorMemoryLayout,
    pub buffer_type: BufferType,
}

impl MemoryConfig {
    pub const DRAM: MemoryConfig = MemoryConfig {
        layout: TensorMemoryLayout::Interleaved,
        buffer_type: BufferType::Dram,
    };

    pub const L1: MemoryConfig = MemoryConfig {
        layout: TensorMemoryLayout::Interleaved,
        buffer_type: BufferType::L1,
    };

    /// An L1-resident sharded placement.
    pub const fn sharded(layout: TensorMemoryLayout) -> Self {
        Self {
            layout,
            buffer_type: BufferType::L1,
        }
    }

    pub fn is_sharded(&self) -> bool {
        self.layout != TensorMemoryLayout::Interleaved
    }

    /// The same tier with an interleaved layout.
    pub fn interleaved(self) -> Self {
        Self {
            layout: TensorMemoryLayout::Interleaved,
            ..self
        }
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self::DRAM
    }
}

/// Byte accounting for one memory tier of one chip.
#[derive(Debug)]
pub struct MemoryPool {
    chip: ChipId,
    buffer_type: BufferType,
    capacity: usize,
    used: AtomicUsize,
}

impl MemoryPool {
    pub(crate) fn new(chip: ChipId, buffer_type: BufferType, capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            chip,
            buffer_type,
            capacity,
            used: AtomicUsize::new(0),
        })
    }

    /// Reserves `bytes`, returning a guard that frees them on drop.
    ///
    /// # Errors
    ///
    /// `OutOfMemory` if fewer than `bytes` remain.
    pub fn allocate(self: &Arc<Self>, bytes: usize) -> Result<Allocation> {
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(bytes).filter(|&total| total <= self.capacity)
            })
            .map_err(|used| CclError::OutOfMemory {
                chip: self.chip,
                buffer: self.buffer_type,
                requested: bytes,
                available: self.capacity.saturating_sub(used),
            })?;
        Ok(Allocation {
            pool: Arc::clone(self),
            bytes,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    pub fn available(&self) -> usize {
        self.capacity.saturating_sub(self.used())
    }
}

/// An outstanding reservation in a [`MemoryPool`].
#[derive(Debug)]
pub struct Allocation {
    pool: Arc<MemoryPool>,
    bytes: usize,
}

impl Allocation {
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn chip(&self) -> ChipId {
        self.pool.chip
    }

    pub fn buffer_type(&self) -> BufferType {
        self.pool.buffer_type
    }

    /// Grows the reservation to `bytes` in place.
    ///
    /// # Errors
    ///
    /// `OutOfMemory` if the pool cannot cover the difference; the
    /// reservation keeps its current size.
    pub fn grow(&mut self, bytes: usize) -> Result<()> {
        let extra = bytes.saturating_sub(self.bytes);
        if extra == 0 {
            return Ok(());
        }
        let pool = &self.pool;
        pool.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(extra).filter(|&total| total <= pool.capacity)
            })
            .map_err(|used| CclError::OutOfMemory {
                chip: pool.chip,
                buffer: pool.buffer_type,
                requested: bytes,
                available: pool.capacity.saturating_sub(used) + self.bytes,
            })?;
        self.bytes = bytes;
        Ok(())
    }

    /// Shrinks the reservation to `bytes`, returning the rest to the pool.
    pub fn shrink(&mut self, bytes: usize) {
        let freed = self.bytes.saturating_sub(bytes);
        self.pool.used.fetch_sub(freed, Ordering::AcqRel);
        self.bytes -= freed;
    }
}

impl Drop for Allocation {
    fn drop(&mut self) {
        self.pool.used.fetch_sub(self.bytes, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_and_free() {
        let pool = MemoryPool::new(ChipId(0), BufferType::L1, 1000);
        let a = pool.allocate(600).unwrap();
        assert_eq!(pool.used(), 600);
        assert_eq!(a.bytes(), 600);

        let err = pool.allocate(500).unwrap_err();
        assert!(matches!(
            err,
            CclError::OutOfMemory {
                requested: 500,
                available: 400,
                ..
            }
        ));

        drop(a);
        assert_eq!(pool.used(), 0);
        assert!(pool.allocate(1000).is_ok());
    }

    #[test]
    fn test_grow_and_shrink_in_place() {
        let pool = MemoryPool::new(ChipId(1), BufferType::L1, 1000);
        let mut a = pool.allocate(300).unwrap();
        let _other = pool.allocate(500).unwrap();

        let err = a.grow(600).unwrap_err();
        assert!(matches!(
            err,
            CclError::OutOfMemory {
                chip: ChipId(1),
                requested: 600,
                available: 500,
                ..
            }
        ));
        assert_eq!(a.bytes(), 300);
        assert_eq!(pool.used(), 800);

        a.grow(500).unwrap();
        assert_eq!(pool.used(), 1000);
        a.shrink(100);
        assert_eq!(a.bytes(), 100);
        assert_eq!(pool.used(), 600);
        drop(a);
        assert_eq!(pool.used(), 500);
    }

    #[test]
    fn test_memory_config() {
        assert!(!MemoryConfig::L1.is_sharded());
        let sharded = MemoryConfig::sharded(TensorMemoryLayout::WidthSharded);
        assert!(sharded.is_sharded());
        assert_eq!(sharded.interleaved(), MemoryConfig::L1);
        assert_eq!(MemoryConfig::default(), MemoryConfig::DRAM);
    }
}
