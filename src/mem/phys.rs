use super::BLOCK_AREAS;
use buddy_allocator::{BlockFlags, BlockItem, BlockManager, MemoryBlock, MIN_BLOCK_SIZE};
use core::ptr::NonNull;
use corvid_mm::address::PAddr;
use corvid_sync::Spin;

const MAX_REFERENCE_COUNT: u32 = u32::MAX;

/// The per-frame element of the physical manager: the buddy node plus a
/// reference count, so that frames can be shared (copy-on-write, shared
/// IPC buffers) and freed only when the last user lets go.
pub struct PhysicalBlock {
    ref_count: u32,
    block: MemoryBlock,
}

const _: () = assert!(core::mem::size_of::<PhysicalBlock>() == 16);

impl BlockItem for PhysicalBlock {
    /// Fresh frames are in use with one owner; boot releases the ones
    /// firmware reports usable.
    fn new() -> Self {
        Self {
            ref_count: 1,
            block: MemoryBlock::new(),
        }
    }

    fn block(&self) -> &MemoryBlock {
        &self.block
    }

    fn block_mut(&mut self) -> &mut MemoryBlock {
        &mut self.block
    }
}

/// Reference-counted page frames over a buddy manager.
pub struct PhysicalMemoryManager {
    inner: Spin<BlockManager<PhysicalBlock, PAddr, BLOCK_AREAS>>,
}

impl PhysicalMemoryManager {
    /// Bytes of metadata needed to manage `managed_size` bytes of
    /// physical memory.
    pub const fn metadata_size(managed_size: usize) -> usize {
        managed_size / MIN_BLOCK_SIZE * core::mem::size_of::<PhysicalBlock>()
    }

    /// # Safety
    /// See [`BlockManager::new`]; the same region contract applies.
    pub unsafe fn new(
        region: NonNull<u8>,
        region_size: usize,
        begin: PAddr,
        end: PAddr,
    ) -> Self {
        Self {
            inner: Spin::new(unsafe { BlockManager::new(region, region_size, begin, end, end) }),
        }
    }

    pub fn free_size(&self) -> usize {
        self.inner.lock().free_size()
    }

    pub fn block_count(&self) -> usize {
        self.inner.lock().block_count()
    }

    /// Allocate at least `size` bytes of contiguous physical memory and
    /// set the reference count of every `split_size` piece to 1. When
    /// `split_size` is a power of two smaller than the effective block,
    /// the pieces become independently releasable blocks.
    ///
    /// Returns the address and the effective (power-of-two) size.
    pub fn allocate(&self, size: usize, split_size: usize) -> Option<(PAddr, usize)> {
        let mut inner = self.inner.lock();
        let (address, allocated) = inner.allocate(size, BlockFlags::empty())?;

        let split = if split_size.is_power_of_two() && split_size < allocated {
            inner.split_allocated(address, split_size);
            split_size
        } else {
            allocated
        };
        let mut offset = 0;
        while offset < allocated {
            let element = inner.element_at(address + offset);
            debug_assert_eq!(element.ref_count, 0);
            element.ref_count = 1;
            offset += split;
        }
        Some((address, allocated))
    }

    /// Take another reference on the frame at `address`.
    ///
    /// Out-of-range addresses succeed without doing anything: memory the
    /// manager does not track (firmware-owned regions, device windows)
    /// behaves as permanently referenced. Fails only when the count would
    /// saturate.
    pub fn add_reference(&self, address: PAddr) -> bool {
        let mut inner = self.inner.lock();
        if !inner.is_in_range(address) {
            return true;
        }
        let element = inner.element_at(address);
        // a zero count here means the caller got hold of a covered piece
        debug_assert!(element.ref_count > 0);
        if element.ref_count == MAX_REFERENCE_COUNT {
            return false;
        }
        element.ref_count += 1;
        true
    }

    /// Drop one reference; the frame goes back to the buddy when the last
    /// one is dropped. Out-of-range addresses are silently ignored, which
    /// lets callers release addresses of unknown provenance.
    pub fn release(&self, address: PAddr) {
        let mut inner = self.inner.lock();
        if !inner.is_in_range(address) {
            return;
        }
        let element = inner.element_at(address);
        if element.ref_count == 0 {
            debug_assert!(false, "released a frame with no references");
            return;
        }
        element.ref_count -= 1;
        if element.ref_count == 0 {
            inner.release(address);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use buddy_allocator::MIN_BLOCK_SIZE;

    fn fixture(managed: usize) -> (Vec<PhysicalBlock>, PhysicalMemoryManager) {
        let count = managed / MIN_BLOCK_SIZE;
        let mut storage: Vec<PhysicalBlock> = Vec::with_capacity(count);
        let region = NonNull::new(storage.as_mut_ptr().cast::<u8>()).unwrap();
        let manager = unsafe {
            PhysicalMemoryManager::new(
                region,
                count * core::mem::size_of::<PhysicalBlock>(),
                PAddr::from(0),
                PAddr::from(managed),
            )
        };
        // every frame starts referenced; release them into the free lists
        for i in 0..count {
            manager.release(PAddr::from(i * MIN_BLOCK_SIZE));
        }
        (storage, manager)
    }

    #[test]
    fn reference_counting_keeps_the_frame_alive() {
        let (_storage, manager) = fixture(1024 * 1024);
        let free = manager.free_size();

        let (frame, size) = manager.allocate(MIN_BLOCK_SIZE, MIN_BLOCK_SIZE).unwrap();
        assert_eq!(size, MIN_BLOCK_SIZE);
        assert_eq!(manager.free_size(), free - MIN_BLOCK_SIZE);

        assert!(manager.add_reference(frame));
        manager.release(frame);
        // one reference remains; the frame is still allocated
        assert_eq!(manager.free_size(), free - MIN_BLOCK_SIZE);
        manager.release(frame);
        assert_eq!(manager.free_size(), free);
    }

    #[test]
    fn split_pieces_are_released_one_by_one() {
        let (_storage, manager) = fixture(1024 * 1024);
        let free = manager.free_size();

        let (base, allocated) = manager
            .allocate(4 * MIN_BLOCK_SIZE, MIN_BLOCK_SIZE)
            .unwrap();
        assert_eq!(allocated, 4 * MIN_BLOCK_SIZE);
        for page in 0..4 {
            manager.release(base + page * MIN_BLOCK_SIZE);
        }
        assert_eq!(manager.free_size(), free);
    }

    #[test]
    fn out_of_range_addresses_are_tolerated() {
        let (_storage, manager) = fixture(1024 * 1024);
        let free = manager.free_size();

        // both operations treat untracked memory as permanently referenced
        assert!(manager.add_reference(PAddr::from(0xdead_0000)));
        manager.release(PAddr::from(0xdead_0000));
        assert_eq!(manager.free_size(), free);
    }

    #[test]
    fn exhaustion_reports_failure() {
        let (_storage, manager) = fixture(64 * 1024);
        assert!(manager.allocate(128 * 1024, MIN_BLOCK_SIZE).is_none());
        let (_, _) = manager.allocate(64 * 1024, 64 * 1024).unwrap();
        assert!(manager.allocate(MIN_BLOCK_SIZE, MIN_BLOCK_SIZE).is_none());
    }
}
