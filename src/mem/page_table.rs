use super::phys::PhysicalMemoryManager;
use bitflags::bitflags;
use core::mem;
use core::ptr::NonNull;
use corvid_mm::address::{Addr as _, PAddr, VAddr, VRange};
use corvid_mm::paging::{PAGE_SIZE, PAGE_SIZE_BITS, PFN};
use corvid_sync::Spin;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageAttribute: u64 {
        const PRESENT = 1 << 0;
        const WRITE = 1 << 1;
        const USER = 1 << 2;
        const GLOBAL = 1 << 3;
        const CACHE_DISABLE = 1 << 4;
    }
}

pub const KERNEL_PAGE: PageAttribute = PageAttribute::PRESENT
    .union(PageAttribute::WRITE)
    .union(PageAttribute::GLOBAL);

pub const USER_WRITABLE_PAGE: PageAttribute = PageAttribute::PRESENT
    .union(PageAttribute::WRITE)
    .union(PageAttribute::USER);

const ATTRIBUTE_BITS: u64 = (1 << PAGE_SIZE_BITS) - 1;

/// One page-table entry: the frame number above the attribute bits, like
/// the hardware format the architectural layer loads from this table.
#[derive(Clone, Copy)]
#[repr(transparent)]
struct Pte(u64);

impl Pte {
    const EMPTY: Pte = Pte(0);

    fn set(&mut self, pfn: PFN, attribute: PageAttribute) {
        self.0 = ((usize::from(pfn) as u64) << PAGE_SIZE_BITS) | attribute.bits();
    }

    fn get(&self) -> (PFN, PageAttribute) {
        (
            PFN::from((self.0 >> PAGE_SIZE_BITS) as usize),
            PageAttribute::from_bits_truncate(self.0 & ATTRIBUTE_BITS),
        )
    }

    fn take(&mut self) -> (PFN, PageAttribute) {
        let value = self.get();
        *self = Self::EMPTY;
        value
    }

    fn is_present(&self) -> bool {
        self.get().1.contains(PageAttribute::PRESENT)
    }
}

struct PteTable {
    entries: NonNull<Pte>,
    window: VRange,
}

// SAFETY: The entry array is exclusively owned and only reached through
//         the lock.
unsafe impl Send for PteTable {}

impl PteTable {
    fn entry(&self, linear: VAddr) -> Option<&Pte> {
        if !self.window.contains(linear) || !linear.is_page_aligned() {
            return None;
        }
        let index = (linear - self.window.start()) / PAGE_SIZE;
        Some(unsafe { self.entries.add(index).as_ref() })
    }

    fn entry_mut(&mut self, linear: VAddr) -> &mut Pte {
        assert!(self.window.contains(linear) && linear.is_page_aligned());
        let index = (linear - self.window.start()) / PAGE_SIZE;
        unsafe { self.entries.add(index).as_mut() }
    }

    fn unmap_range(
        &mut self,
        physical: &PhysicalMemoryManager,
        linear: VAddr,
        size: usize,
        release_physical: bool,
    ) {
        let mut offset = 0;
        while offset < size {
            let entry = self.entry_mut(linear + offset);
            if entry.is_present() {
                let (pfn, _) = entry.take();
                if release_physical {
                    physical.release(PAddr::from(pfn));
                }
            }
            offset += PAGE_SIZE;
        }
    }
}

/// The page-table driver for one linear window: a flat array with one
/// [`Pte`] per page, kept in a caller-provided region. Loading the table
/// into the MMU and TLB shootdown belong to the architectural layer.
pub struct PageTable {
    inner: Spin<PteTable>,
}

impl PageTable {
    /// Bytes of entry storage needed for a window of `window_len` bytes.
    pub const fn metadata_size(window_len: usize) -> usize {
        window_len / PAGE_SIZE * mem::size_of::<Pte>()
    }

    /// # Safety
    /// `region` must be valid for `region_size` bytes, aligned for the
    /// entries, exclusively owned and live as long as the table.
    pub unsafe fn new(region: NonNull<u8>, region_size: usize, window: VRange) -> Self {
        let count = window.len() / PAGE_SIZE;
        assert!(region_size >= count * mem::size_of::<Pte>());
        assert_eq!(region.as_ptr() as usize % mem::align_of::<Pte>(), 0);

        let entries = region.cast::<Pte>();
        for i in 0..count {
            unsafe { entries.add(i).write(Pte::EMPTY) };
        }
        Self {
            inner: Spin::new(PteTable { entries, window }),
        }
    }

    /// Map `size` bytes at `linear`. With `frame` given, the pages map to
    /// that contiguous physical run and the mapping takes a reference on
    /// every tracked frame; with `None`, each page gets a freshly
    /// allocated (not necessarily contiguous) frame.
    ///
    /// On a per-page failure the already-installed prefix is unmapped and
    /// its references dropped, and the call reports failure.
    pub fn map(
        &self,
        physical: &PhysicalMemoryManager,
        linear: VAddr,
        frame: Option<PAddr>,
        size: usize,
        attribute: PageAttribute,
    ) -> bool {
        assert!(linear.is_page_aligned());
        assert_eq!(size % PAGE_SIZE, 0);

        let mut table = self.inner.lock();
        let mut offset = 0;
        while offset < size {
            let frame_addr = match frame {
                Some(base) => {
                    let frame_addr = base + offset;
                    if !physical.add_reference(frame_addr) {
                        break;
                    }
                    frame_addr
                }
                None => match physical.allocate(PAGE_SIZE, PAGE_SIZE) {
                    Some((frame_addr, _)) => frame_addr,
                    None => break,
                },
            };
            let entry = table.entry_mut(linear + offset);
            debug_assert!(!entry.is_present(), "mapping over a live entry");
            entry.set(PFN::from(frame_addr), attribute | PageAttribute::PRESENT);
            offset += PAGE_SIZE;
        }

        if offset == size {
            return true;
        }
        table.unmap_range(physical, linear, offset, true);
        false
    }

    /// Map `size` bytes at `linear` backed by one contiguous physical
    /// run, each page independently reference-counted. The surplus of the
    /// power-of-two rounding goes straight back to the physical manager.
    pub fn map_contiguous(
        &self,
        physical: &PhysicalMemoryManager,
        linear: VAddr,
        size: usize,
        attribute: PageAttribute,
    ) -> bool {
        assert!(linear.is_page_aligned());
        assert_eq!(size % PAGE_SIZE, 0);

        let Some((base, allocated)) = physical.allocate(size, PAGE_SIZE) else {
            return false;
        };
        let mut surplus = size;
        while surplus < allocated {
            physical.release(base + surplus);
            surplus += PAGE_SIZE;
        }

        let mut table = self.inner.lock();
        let mut offset = 0;
        while offset < size {
            let entry = table.entry_mut(linear + offset);
            debug_assert!(!entry.is_present(), "mapping over a live entry");
            entry.set(
                PFN::from(base + offset),
                attribute | PageAttribute::PRESENT,
            );
            offset += PAGE_SIZE;
        }
        true
    }

    /// Tear down `size` bytes of mappings at `linear`, skipping holes.
    /// With `release_physical`, one reference per present page is
    /// dropped.
    pub fn unmap(
        &self,
        physical: &PhysicalMemoryManager,
        linear: VAddr,
        size: usize,
        release_physical: bool,
    ) {
        self.inner
            .lock()
            .unmap_range(physical, linear, size, release_physical);
    }

    /// The frame and attributes behind a present mapping.
    pub fn translate_existing(&self, linear: VAddr) -> Option<(PAddr, PageAttribute)> {
        let table = self.inner.lock();
        let entry = table.entry(linear)?;
        if !entry.is_present() {
            return None;
        }
        let (pfn, attribute) = entry.get();
        Some((PAddr::from(pfn), attribute))
    }
}
