use super::linear::LinearBlockManager;
use super::page_table::{PageAttribute, PageTable, KERNEL_PAGE};
use super::phys::PhysicalMemoryManager;
use super::{MemResult, MemoryError};
use buddy_allocator::BlockFlags;
use core::ptr::NonNull;
use corvid_mm::address::{Addr as _, PAddr, VAddr, VRange};
use corvid_mm::paging::PAGE_SIZE;

/// The composite memory manager: a linear-range manager, a page table and
/// the (shared, kernel-lifetime) physical manager, working as one unit.
///
/// Every allocation follows reserve → map → commit. The reserved range is
/// invisible until the commit, and failure paths unmap whatever prefix was
/// installed and return the reservation, so a failed operation publishes
/// nothing.
pub struct LinearMemoryManager {
    physical: &'static PhysicalMemoryManager,
    page: PageTable,
    linear: LinearBlockManager,
}

impl LinearMemoryManager {
    pub fn new(
        physical: &'static PhysicalMemoryManager,
        page: PageTable,
        linear: LinearBlockManager,
    ) -> Self {
        Self {
            physical,
            page,
            linear,
        }
    }

    /// Build a manager for a fresh address space, carving the page-table
    /// entries and block metadata from the start of `window` itself. The
    /// carved region stays reserved; `[carved end, init_end)` is seeded
    /// free and the rest of the window is reachable through extension.
    ///
    /// # Safety
    /// The memory behind `window` up to `init_end` must be mapped,
    /// writable and exclusively owned; the range past `init_end` must
    /// become writable before the extension path reaches it.
    pub unsafe fn create(
        physical: &'static PhysicalMemoryManager,
        window: VRange,
        init_end: VAddr,
    ) -> Self {
        assert!(window.start().is_page_aligned());
        assert!(window.start() <= init_end && init_end <= window.end());

        let table_size = PageTable::metadata_size(window.len());
        let metadata_size = LinearBlockManager::metadata_size(window.len());

        let table_region = window.start();
        let metadata_region = table_region + table_size;
        let reserved_end = (metadata_region + metadata_size).page_ceil();
        assert!(reserved_end <= init_end);

        let page = unsafe {
            PageTable::new(
                NonNull::new_unchecked(table_region.as_ptr()),
                table_size,
                window,
            )
        };
        let linear = unsafe {
            LinearBlockManager::new(
                NonNull::new_unchecked(metadata_region.as_ptr()),
                metadata_size,
                window.start(),
                init_end,
                window.end(),
            )
        };

        let mut address = reserved_end;
        while address < init_end {
            linear.release(address);
            address = address + PAGE_SIZE;
        }

        Self::new(physical, page, linear)
    }

    pub fn physical(&self) -> &'static PhysicalMemoryManager {
        self.physical
    }

    pub fn linear(&self) -> &LinearBlockManager {
        &self.linear
    }

    fn page_rounded(size: usize) -> usize {
        if size == 0 {
            PAGE_SIZE
        } else {
            size.div_ceil(PAGE_SIZE) * PAGE_SIZE
        }
    }

    /// Reserve a linear range, mapping metadata pages through this very
    /// manager when the range manager has to grow.
    fn allocate_linear(&self, size: usize, with_physical: bool) -> MemResult<(VAddr, usize)> {
        self.linear.allocate_or_extend(size, with_physical, |metadata_page| {
            self.page
                .map(self.physical, metadata_page, None, PAGE_SIZE, KERNEL_PAGE)
        })
    }

    fn allocate_pages_inner(
        &self,
        size: usize,
        contiguous: bool,
        attribute: PageAttribute,
    ) -> MemResult<VAddr> {
        let size = Self::page_rounded(size);
        let (linear, _) = self.allocate_linear(size, true)?;

        let ok = if contiguous {
            self.page
                .map_contiguous(self.physical, linear, size, attribute)
        } else {
            self.page.map(self.physical, linear, None, size, attribute)
        };
        if !ok {
            self.linear.release_block(linear);
            return Err(MemoryError::OutOfMemory);
        }

        self.linear.commit(linear);
        Ok(linear)
    }

    /// Allocate a linear range backed by fresh, possibly scattered
    /// physical pages.
    pub fn allocate_pages(&self, size: usize, attribute: PageAttribute) -> MemResult<VAddr> {
        self.allocate_pages_inner(size, false, attribute)
    }

    /// Allocate a linear range backed by one contiguous physical run.
    pub fn allocate_contiguous_pages(
        &self,
        size: usize,
        attribute: PageAttribute,
    ) -> MemResult<VAddr> {
        self.allocate_pages_inner(size, true, attribute)
    }

    /// Map caller-supplied physical memory (a frame run or a device
    /// window) into a fresh linear range.
    pub fn map_pages(
        &self,
        frame: PAddr,
        size: usize,
        attribute: PageAttribute,
    ) -> MemResult<VAddr> {
        assert!(frame.is_page_aligned());
        let size = Self::page_rounded(size);
        let (linear, _) = self.allocate_linear(size, true)?;

        if !self
            .page
            .map(self.physical, linear, Some(frame), size, attribute)
        {
            self.linear.release_block(linear);
            return Err(MemoryError::MappingFailed);
        }

        self.linear.commit(linear);
        Ok(linear)
    }

    /// Copy `size` bytes of mappings starting at `src_linear` in `src`
    /// into a fresh range of this manager, taking a reference on every
    /// frame. Every source page must be live, mapped and carry
    /// `src_required`; on any per-page failure the installed prefix is
    /// unmapped, the reservation returned and nothing published.
    pub fn check_and_map_existing_pages(
        &self,
        src: &LinearMemoryManager,
        src_linear: VAddr,
        size: usize,
        attribute: PageAttribute,
        src_required: PageAttribute,
    ) -> MemResult<VAddr> {
        let size = Self::page_rounded(size);
        let (dst_linear, _) = self.allocate_linear(size, true)?;

        let mut offset = 0;
        while offset < size {
            let Some(frame) = src.check_and_reserve_page(src_linear + offset, src_required)
            else {
                break;
            };
            let ok = self
                .page
                .map(self.physical, dst_linear + offset, Some(frame), PAGE_SIZE, attribute);
            // the new mapping holds its own reference now
            src.release_reserved_page(frame);
            if !ok {
                break;
            }
            offset += PAGE_SIZE;
        }

        if offset == size {
            self.linear.commit(dst_linear);
            return Ok(dst_linear);
        }
        self.page.unmap(self.physical, dst_linear, offset, true);
        self.linear.release_block(dst_linear);
        Err(MemoryError::MappingFailed)
    }

    /// Translate one live page and pin its frame with an extra reference.
    /// The frame stays valid until [`Self::release_reserved_page`].
    pub fn check_and_reserve_page(
        &self,
        linear: VAddr,
        required: PageAttribute,
    ) -> Option<PAddr> {
        if !self.linear.is_using(linear) {
            return None;
        }
        let (frame, attribute) = self.page.translate_existing(linear)?;
        if !attribute.contains(required) {
            return None;
        }
        self.physical.add_reference(frame).then_some(frame)
    }

    pub fn release_reserved_page(&self, frame: PAddr) {
        self.physical.release(frame);
    }

    /// Tear down the whole allocation at `linear`, which must be live.
    pub fn unmap_pages(&self, linear: VAddr) {
        let size = self.linear.allocated_size(linear);
        let release = self
            .linear
            .block_flags(linear)
            .contains(BlockFlags::WITH_PHYSICAL_PAGES);
        self.page.unmap(self.physical, linear, size, release);
        self.linear.release(linear);
    }

    /// Safe teardown: false, with no side effects, unless `linear` is a
    /// live allocation of this manager.
    pub fn check_and_unmap_pages(&self, linear: VAddr) -> bool {
        self.linear.check_and_release(linear, |address, size, release| {
            self.page.unmap(self.physical, address, size, release);
        })
    }

    /// The frame behind one live page, or `None` for anything that is not
    /// a live mapped allocation.
    pub fn check_and_translate_page(&self, linear: VAddr) -> Option<PAddr> {
        if !self.linear.is_using(linear) {
            return None;
        }
        self.page.translate_existing(linear).map(|(frame, _)| frame)
    }

    /// Release every allocation and the metadata pages the extension path
    /// mapped, shrinking the range manager back to its initial size. For
    /// address-space teardown; assumes the manager is no longer shared.
    pub fn release_all_blocks(&self) {
        self.linear.release_all(
            |address, size, release| self.page.unmap(self.physical, address, size, release),
            |address, size| self.page.unmap(self.physical, address, size, true),
        );
    }
}
