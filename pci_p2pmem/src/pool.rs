// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The peer-to-peer memory pool: a byte-range allocator over the regions a
//! provider contributes from its BAR space, plus local-to-bus address
//! translation for the memory it hands out.

use parking_lot::Mutex;
use std::fmt;

/// One contributed range. `local_base` is the CPU-usable address space the
/// pool allocates from; `bus_base` is where the same bytes sit on the bus.
#[derive(Debug, Copy, Clone)]
struct Region {
    local_base: u64,
    bus_base: u64,
    len: u64,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum SlotState {
    Free,
    Allocated,
}

#[derive(Debug, Copy, Clone)]
struct Slot {
    region: usize,
    base: u64,
    len: u64,
    state: SlotState,
}

#[derive(Debug)]
struct PoolInner {
    regions: Vec<Region>,
    slots: Vec<Slot>,
}

/// A byte-range allocator over provider memory.
///
/// The pool is internally synchronized; allocation and free may race with
/// each other and with translation. An allocation never spans two regions,
/// so a single per-region offset translates every byte of it.
pub struct P2pPool {
    granularity: u64,
    node_hint: Option<u32>,
    inner: Mutex<PoolInner>,
}

impl fmt::Debug for P2pPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("P2pPool")
            .field("granularity", &self.granularity)
            .field("node_hint", &self.node_hint)
            .field("size", &self.size())
            .field("available", &self.available())
            .finish()
    }
}

impl P2pPool {
    /// Creates an empty pool.
    ///
    /// `granularity` is the allocation unit (a power of two); sizes round
    /// up to it. `node_hint` is the NUMA node the backing device lives on,
    /// recorded for diagnostics only.
    pub fn new(granularity: u64, node_hint: Option<u32>) -> Self {
        assert!(granularity.is_power_of_two());
        Self {
            granularity,
            node_hint,
            inner: Mutex::new(PoolInner {
                regions: Vec::new(),
                slots: Vec::new(),
            }),
        }
    }

    /// The NUMA node hint the pool was created with.
    pub fn node_hint(&self) -> Option<u32> {
        self.node_hint
    }

    /// Contributes `[local_base, local_base + len)` to the pool, reachable
    /// by peers at `bus_base`. The full `len` counts toward
    /// [`size`](Self::size) and [`available`](Self::available); only whole
    /// allocation units are handed out, so a trailing partial unit is
    /// accounted but never allocated.
    ///
    /// Regions must not overlap, in either address space. This holds by
    /// construction for ranges carved out of distinct BAR windows.
    pub fn add_region(&self, local_base: u64, bus_base: u64, len: u64) {
        if len == 0 {
            return;
        }
        let mut inner = self.inner.lock();
        let region = inner.regions.len();
        inner.regions.push(Region {
            local_base,
            bus_base,
            len,
        });
        let usable = len & !(self.granularity - 1);
        if usable != 0 {
            inner.slots.push(Slot {
                region,
                base: local_base,
                len: usable,
                state: SlotState::Free,
            });
        }
    }

    /// Allocates `size` bytes (rounded up to the allocation unit),
    /// returning the local address, or `None` if no single free range is
    /// large enough. Zero-size allocations fail.
    pub fn alloc(&self, size: u64) -> Option<u64> {
        let size = self.round_up(size)?;
        let mut inner = self.inner.lock();
        let index = inner
            .slots
            .iter()
            .position(|slot| slot.state == SlotState::Free && slot.len >= size)?;
        let slot = inner.slots.swap_remove(index);
        inner.slots.push(Slot {
            region: slot.region,
            base: slot.base,
            len: size,
            state: SlotState::Allocated,
        });
        if slot.len > size {
            inner.slots.push(Slot {
                region: slot.region,
                base: slot.base + size,
                len: slot.len - size,
                state: SlotState::Free,
            });
        }
        Some(slot.base)
    }

    /// Returns an allocation to the pool. `local_addr` and `size` must be
    /// exactly the pair a prior [`alloc`](Self::alloc) produced; anything
    /// else is a caller bug and panics.
    pub fn free(&self, local_addr: u64, size: u64) {
        let size = self.round_up(size).expect("free of an empty range");
        let mut inner = self.inner.lock();
        let index = inner
            .slots
            .iter()
            .position(|slot| {
                slot.state == SlotState::Allocated && slot.base == local_addr && slot.len == size
            })
            .expect("free does not match an outstanding allocation");
        inner.slots[index].state = SlotState::Free;
        inner.coalesce(index);
    }

    /// Translates a local address to the bus address peers must use.
    ///
    /// Zero (the null address) translates to zero. Any other address must
    /// lie within a contributed region.
    pub fn virt_to_bus(&self, local_addr: u64) -> u64 {
        if local_addr == 0 {
            return 0;
        }
        let inner = self.inner.lock();
        let region = inner
            .regions
            .iter()
            .find(|region| {
                local_addr >= region.local_base && local_addr - region.local_base < region.len
            })
            .expect("address does not belong to the pool");
        region.bus_base + (local_addr - region.local_base)
    }

    /// Total bytes under management.
    pub fn size(&self) -> u64 {
        self.inner.lock().regions.iter().map(|region| region.len).sum()
    }

    /// Bytes not handed out: total size minus outstanding allocations.
    pub fn available(&self) -> u64 {
        let inner = self.inner.lock();
        let total: u64 = inner.regions.iter().map(|region| region.len).sum();
        let allocated: u64 = inner
            .slots
            .iter()
            .filter(|slot| slot.state == SlotState::Allocated)
            .map(|slot| slot.len)
            .sum();
        total - allocated
    }

    /// Drops every region. The caller must have drained all allocations
    /// first.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        debug_assert!(
            inner.slots.iter().all(|slot| slot.state == SlotState::Free),
            "pool cleared with outstanding allocations"
        );
        inner.regions.clear();
        inner.slots.clear();
    }

    fn round_up(&self, size: u64) -> Option<u64> {
        if size == 0 {
            return None;
        }
        size.checked_next_multiple_of(self.granularity)
    }
}

impl PoolInner {
    /// Merges the free slot at `index` with free neighbors in the same
    /// region until none remain. Keeps long-lived pools from fragmenting
    /// into unusably small slots.
    fn coalesce(&mut self, mut index: usize) {
        loop {
            let slot = self.slots[index];
            let neighbor = self.slots.iter().position(|other| {
                other.state == SlotState::Free
                    && other.region == slot.region
                    && (other.base + other.len == slot.base || slot.base + slot.len == other.base)
            });
            let Some(neighbor) = neighbor else { break };
            let other = self.slots.swap_remove(neighbor);
            // swap_remove moves the tail slot; fix up if it was ours.
            if index == self.slots.len() {
                index = neighbor;
            }
            let slot = &mut self.slots[index];
            slot.base = slot.base.min(other.base);
            slot.len += other.len;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const PAGE: u64 = 4096;

    fn pool_with_region(len: u64) -> P2pPool {
        let pool = P2pPool::new(PAGE, None);
        pool.add_region(0x10000, 0x8_0000_0000, len);
        pool
    }

    #[test]
    fn alloc_rounds_to_granularity() {
        let pool = pool_with_region(PAGE * 4);
        let addr = pool.alloc(1).unwrap();
        assert_eq!(addr, 0x10000);
        assert_eq!(pool.available(), PAGE * 3);
        pool.free(addr, 1);
        assert_eq!(pool.available(), PAGE * 4);
    }

    #[test]
    fn zero_size_alloc_fails() {
        let pool = pool_with_region(PAGE * 4);
        assert_eq!(pool.alloc(0), None);
        assert_eq!(pool.available(), PAGE * 4);
    }

    #[test]
    fn exhaustion_returns_none() {
        let pool = pool_with_region(PAGE * 2);
        assert!(pool.alloc(PAGE * 2).is_some());
        assert_eq!(pool.alloc(PAGE), None);
    }

    #[test]
    fn freed_neighbors_coalesce() {
        let pool = pool_with_region(PAGE * 3);
        let a = pool.alloc(PAGE).unwrap();
        let b = pool.alloc(PAGE).unwrap();
        let c = pool.alloc(PAGE).unwrap();
        pool.free(a, PAGE);
        pool.free(c, PAGE);
        pool.free(b, PAGE);
        // A split-only allocator would be stuck with three page slots.
        assert_eq!(pool.alloc(PAGE * 3), Some(0x10000));
    }

    #[test]
    fn allocations_never_span_regions() {
        let pool = P2pPool::new(PAGE, None);
        pool.add_region(0x10000, 0x8_0000_0000, PAGE * 2);
        pool.add_region(0x40000, 0x9_0000_0000, PAGE * 4);
        // Leaves one page free in the first region.
        let first = pool.alloc(PAGE).unwrap();
        assert_eq!(first, 0x10000);
        // Does not fit the first region's remainder even though total free
        // space would cover it.
        let big = pool.alloc(PAGE * 3).unwrap();
        assert_eq!(big, 0x40000);
    }

    #[test]
    fn partial_unit_counts_but_never_allocates() {
        let pool = P2pPool::new(PAGE, None);
        pool.add_region(0x10000, 0x8_0000_0000, PAGE + 123);
        assert_eq!(pool.size(), PAGE + 123);
        assert_eq!(pool.available(), PAGE + 123);
        // Only the whole page is allocatable.
        assert_eq!(pool.alloc(PAGE), Some(0x10000));
        assert_eq!(pool.alloc(PAGE), None);
        assert_eq!(pool.available(), 123);
    }

    #[test]
    fn subpage_region_is_accounted_but_unallocatable() {
        let pool = P2pPool::new(PAGE, None);
        pool.add_region(0x10000, 0x8_0000_0000, 100);
        assert_eq!(pool.size(), 100);
        assert_eq!(pool.available(), 100);
        assert_eq!(pool.alloc(1), None);
    }

    #[test]
    fn translation_uses_containing_region() {
        let pool = P2pPool::new(PAGE, None);
        pool.add_region(0x10000, 0x8_0000_0000, PAGE * 2);
        pool.add_region(0x40000, 0x9_0000_0000, PAGE * 2);
        assert_eq!(pool.virt_to_bus(0x10000), 0x8_0000_0000);
        assert_eq!(pool.virt_to_bus(0x10000 + 8), 0x8_0000_0008);
        assert_eq!(pool.virt_to_bus(0x40000 + PAGE), 0x9_0000_0000 + PAGE);
        assert_eq!(pool.virt_to_bus(0), 0);
    }

    #[test]
    #[should_panic(expected = "free does not match an outstanding allocation")]
    fn mismatched_free_panics() {
        let pool = pool_with_region(PAGE * 4);
        let addr = pool.alloc(PAGE * 2).unwrap();
        pool.free(addr, PAGE);
    }
}
