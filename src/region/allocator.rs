//! Offset-space allocators for dataitems inside a region

use std::collections::BTreeMap;

use crate::error::{FamError, Result};

/// Trait for region offset-space allocators
pub trait Allocator: Send + Sync + std::fmt::Debug {
    /// Reserve `size` bytes and return the offset of the extent
    fn allocate(&mut self, size: u64) -> Result<u64>;

    /// Release the extent starting at `offset`, returning its length
    fn deallocate(&mut self, offset: u64) -> Result<u64>;

    /// Get the total size of the managed space
    fn total_size(&self) -> u64;

    /// Get the sum of live extents
    fn used_size(&self) -> u64;

    /// Get the amount of free space
    fn available_size(&self) -> u64 {
        self.total_size() - self.used_size()
    }

    /// Check if a live extent starts at `offset`
    fn owns(&self, offset: u64) -> bool;

    /// Forget every extent
    fn reset(&mut self);

    /// Change the managed size; fails if a live extent would fall outside it
    fn resize(&mut self, new_size: u64) -> Result<()>;
}

/// First-fit allocator over a free list with neighbour coalescing
#[derive(Debug, Clone)]
pub struct FreeListAllocator {
    total_size: u64,
    alignment: u64,
    /// offset -> length of free extents
    free: BTreeMap<u64, u64>,
    /// offset -> length of live extents
    live: BTreeMap<u64, u64>,
}

impl FreeListAllocator {
    pub fn new(total_size: u64, alignment: u64) -> Result<Self> {
        if alignment == 0 || !alignment.is_power_of_two() {
            return Err(FamError::invalid_parameter(
                "alignment",
                "Alignment must be a non-zero power of two",
            ));
        }

        let mut allocator = Self {
            total_size,
            alignment,
            free: BTreeMap::new(),
            live: BTreeMap::new(),
        };
        allocator.reset();
        Ok(allocator)
    }

    fn align_up(&self, value: u64) -> Option<u64> {
        value
            .checked_add(self.alignment - 1)
            .map(|v| v & !(self.alignment - 1))
    }

    /// End of the highest live extent
    pub fn high_water_mark(&self) -> u64 {
        self.live
            .iter()
            .next_back()
            .map(|(offset, len)| offset + len)
            .unwrap_or(0)
    }

    /// Check a resize without applying it
    pub fn check_resize(&self, new_size: u64) -> Result<()> {
        let required = self.high_water_mark();
        if new_size < required {
            return Err(FamError::invalid_range(format!(
                "new size {} is below live dataitem extent end {}",
                new_size, required
            )));
        }
        Ok(())
    }

    pub fn live_extents(&self) -> usize {
        self.live.len()
    }

    fn insert_free(&mut self, mut offset: u64, mut len: u64) {
        if let Some((&prev_offset, &prev_len)) = self.free.range(..offset).next_back() {
            if prev_offset + prev_len == offset {
                self.free.remove(&prev_offset);
                offset = prev_offset;
                len += prev_len;
            }
        }
        if let Some(next_len) = self.free.remove(&(offset + len)) {
            len += next_len;
        }
        self.free.insert(offset, len);
    }
}

impl Allocator for FreeListAllocator {
    fn allocate(&mut self, size: u64) -> Result<u64> {
        if size == 0 {
            return Err(FamError::invalid_parameter("size", "Allocation size must be greater than 0"));
        }

        // Only the start is aligned; the extent keeps its exact length so the
        // last one may end at an unaligned region size.
        let slot = self.free.iter().find_map(|(&offset, &len)| {
            let start = self.align_up(offset)?;
            let end = start.checked_add(size)?;
            (end <= offset + len).then_some((offset, len, start))
        });

        let (offset, len, start) =
            slot.ok_or_else(|| FamError::out_of_space(size, self.available_size()))?;
        self.free.remove(&offset);
        if start > offset {
            self.free.insert(offset, start - offset);
        }
        let end = start + size;
        if offset + len > end {
            self.free.insert(end, offset + len - end);
        }
        self.live.insert(start, size);
        Ok(start)
    }

    fn deallocate(&mut self, offset: u64) -> Result<u64> {
        let len = self
            .live
            .remove(&offset)
            .ok_or_else(|| FamError::not_found(format!("no live extent at offset {}", offset)))?;
        self.insert_free(offset, len);
        Ok(len)
    }

    fn total_size(&self) -> u64 {
        self.total_size
    }

    fn used_size(&self) -> u64 {
        self.live.values().sum()
    }

    fn owns(&self, offset: u64) -> bool {
        self.live.contains_key(&offset)
    }

    fn reset(&mut self) {
        self.live.clear();
        self.free.clear();
        if self.total_size > 0 {
            self.free.insert(0, self.total_size);
        }
    }

    fn resize(&mut self, new_size: u64) -> Result<()> {
        self.check_resize(new_size)?;

        let old_size = self.total_size;
        self.total_size = new_size;

        if new_size > old_size {
            self.insert_free(old_size, new_size - old_size);
        } else if new_size < old_size {
            let mut trimmed = BTreeMap::new();
            for (&offset, &len) in &self.free {
                if offset >= new_size {
                    continue;
                }
                trimmed.insert(offset, len.min(new_size - offset));
            }
            self.free = trimmed;
        }
        Ok(())
    }
}
