use super::{MemResult, MemoryError, BLOCK_AREAS};
use buddy_allocator::{BlockFlags, BlockManager, MemoryBlock, MIN_BLOCK_SIZE};
use core::mem;
use core::ptr::NonNull;
use corvid_mm::address::{Addr as _, VAddr};
use corvid_mm::paging::PAGE_SIZE;
use corvid_sync::Spin;

/// Linear-address ranges over a buddy manager.
///
/// Ranges are handed out in two steps: [`Self::allocate_or_extend`]
/// reserves a range that no concurrent observer can see, and
/// [`Self::commit`] publishes it once the caller has finished mapping.
/// Release is also two-phase, because unmapping must not run under the
/// lock: the block is parked in the releasing state, unmapped, then
/// returned to the free lists.
pub struct LinearBlockManager {
    inner: Spin<BlockManager<MemoryBlock, VAddr, BLOCK_AREAS>>,
}

impl LinearBlockManager {
    /// Bytes of metadata needed for a linear range of `managed_size`
    /// bytes.
    pub const fn metadata_size(managed_size: usize) -> usize {
        managed_size / MIN_BLOCK_SIZE * mem::size_of::<MemoryBlock>()
    }

    /// # Safety
    /// See [`BlockManager::new`]. Metadata slots for blocks past
    /// `init_end` may be unmapped until the extension path maps them.
    pub unsafe fn new(
        region: NonNull<u8>,
        region_size: usize,
        begin: VAddr,
        init_end: VAddr,
        max_end: VAddr,
    ) -> Self {
        Self {
            inner: Spin::new(unsafe {
                BlockManager::new(region, region_size, begin, init_end, max_end)
            }),
        }
    }

    pub fn begin_address(&self) -> VAddr {
        self.inner.lock().begin_address()
    }

    pub fn free_size(&self) -> usize {
        self.inner.lock().free_size()
    }

    pub fn block_count(&self) -> usize {
        self.inner.lock().block_count()
    }

    /// Hand a range to the manager as free. Used while seeding at boot
    /// and at no other time.
    pub fn release(&self, address: VAddr) {
        self.inner.lock().release(address);
    }

    /// Reserve a range of at least `size` bytes, growing the block array
    /// toward its maximum if the managed range is exhausted. The range is
    /// invisible to every `check_*` operation until [`Self::commit`].
    ///
    /// Growth maps one metadata page per `map_one_page` call; the
    /// page-table driver's failure path unmaps prior work, which must not
    /// happen while the lock is held. Extension is not atomic with the
    /// allocation: the appended blocks are released through the normal
    /// path and a concurrent caller may consume them.
    pub fn allocate_or_extend(
        &self,
        size: usize,
        with_physical: bool,
        mut map_one_page: impl FnMut(VAddr) -> bool,
    ) -> MemResult<(VAddr, usize)> {
        let flags = if with_physical {
            BlockFlags::WITH_PHYSICAL_PAGES
        } else {
            BlockFlags::empty()
        };

        let mut inner = self.inner.lock();
        if let Some((address, allocated)) = inner.allocate(size, flags) {
            inner.prepare_release(address);
            return Ok((address, allocated));
        }

        let extend = inner
            .extend_count_for(size)
            .ok_or(MemoryError::OutOfAddressSpace)?;
        let target = inner.block_count() + extend;
        let mut mapped_end = VAddr::from(inner.element_end_address()).page_ceil();
        while inner.block_count() < target {
            let slot_end = inner.element_end_address() + mem::size_of::<MemoryBlock>();
            if slot_end > mapped_end.addr() {
                if !map_one_page(mapped_end) {
                    break;
                }
                mapped_end = mapped_end + PAGE_SIZE;
            }
            // the slot just became writable
            unsafe { inner.push_block() };
        }

        let (address, allocated) = inner.allocate(size, flags).ok_or(MemoryError::OutOfMemory)?;
        inner.prepare_release(address);
        Ok((address, allocated))
    }

    /// Publish a reserved range.
    pub fn commit(&self, address: VAddr) {
        self.inner.lock().commit(address);
    }

    /// Roll back a reserved range that was never published.
    pub fn release_block(&self, address: VAddr) {
        self.inner.lock().finish_release(address);
    }

    /// The public release path. Checks that `address` is a live
    /// allocation, detaches it, runs `unmap(address, size,
    /// release_physical)` with the lock dropped, and frees the range.
    /// Returns false, with no side effects, for anything that is not a
    /// live allocation.
    pub fn check_and_release(
        &self,
        address: VAddr,
        unmap: impl FnOnce(VAddr, usize, bool),
    ) -> bool {
        let (size, flags) = {
            let mut inner = self.inner.lock();
            if !inner.is_releasable(address) {
                return false;
            }
            let size = inner.allocated_size(address);
            let flags = inner.block_flags(address);
            inner.prepare_release(address);
            (size, flags)
        };

        unmap(address, size, flags.contains(BlockFlags::WITH_PHYSICAL_PAGES));

        self.inner.lock().finish_release(address);
        true
    }

    /// Whether `address` falls inside a published allocation.
    pub fn is_using(&self, address: VAddr) -> bool {
        self.inner.lock().is_using(address)
    }

    pub fn allocated_size(&self, address: VAddr) -> usize {
        self.inner.lock().allocated_size(address)
    }

    pub fn block_flags(&self, address: VAddr) -> BlockFlags {
        self.inner.lock().block_flags(address)
    }

    /// Release every block and shrink back to the initial range. Runs
    /// `unmap_block` for each live block and `unmap_metadata` over the
    /// metadata pages the extension path mapped. Assumes the manager is
    /// no longer shared.
    pub fn release_all(
        &self,
        mut unmap_block: impl FnMut(VAddr, usize, bool),
        unmap_metadata: impl FnOnce(VAddr, usize),
    ) {
        let mut index = 0;
        loop {
            let (address, quanta) = {
                let inner = self.inner.lock();
                if index >= inner.block_count() {
                    break;
                }
                let address = inner.begin_address() + index * MIN_BLOCK_SIZE;
                (address, inner.allocated_size(address) / MIN_BLOCK_SIZE)
            };
            // free and covered blocks fail the check and are skipped; the
            // stride never steps over a live block
            self.check_and_release(address, &mut unmap_block);
            index += quanta;
        }

        let mut inner = self.inner.lock();
        let release_begin = VAddr::from(inner.element_address(inner.initial_block_count()))
            .page_ceil()
            .addr();
        let release_end = VAddr::from(inner.element_end_address()).page_ceil().addr();
        if release_end > release_begin {
            unmap_metadata(VAddr::from(release_begin), release_end - release_begin);
        }
        inner.reset();
    }
}
