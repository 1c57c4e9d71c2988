use crate::SLAB_SIZE;
use core::mem;
use core::ptr::{self, NonNull};
use intrusive_list::Link;

/// A unit on a slab's free list. The link is threaded through the unit's
/// own body, which works because every unit size holds at least a pointer.
pub(crate) struct FreeUnit {
    next: *mut FreeUnit,
}

/// The header at the start of every slab page.
///
/// The first unit begins right after the header, so no unit address is
/// ever page-aligned; release paths rely on that to tell slab units from
/// whole-page allocations.
#[repr(C)]
pub(crate) struct Slab {
    pub(crate) link: Link,
    class: usize,
    used_count: usize,
    free_list: *mut FreeUnit,
}

impl Slab {
    /// Turn the page at `page` into an empty slab serving `unit_size`-byte
    /// units for size class `class`.
    ///
    /// # Safety
    /// `page` must point to `SLAB_SIZE` bytes of writable memory aligned
    /// to `SLAB_SIZE`, owned by the caller.
    pub(crate) unsafe fn init(page: NonNull<u8>, class: usize, unit_size: usize) -> NonNull<Slab> {
        debug_assert_eq!(page.as_ptr() as usize % SLAB_SIZE, 0);
        debug_assert!(unit_size >= mem::size_of::<FreeUnit>());

        let mut slab = page.cast::<Slab>();
        unsafe {
            slab.write(Slab {
                link: Link::new(),
                class,
                used_count: 0,
                free_list: ptr::null_mut(),
            });
        }

        let base = page.as_ptr() as usize;
        let mut position = base + mem::size_of::<Slab>();
        let mut free_list = ptr::null_mut();
        while position + unit_size <= base + SLAB_SIZE {
            let unit = position as *mut FreeUnit;
            unsafe { (*unit).next = free_list };
            free_list = unit;
            position += unit_size;
        }
        unsafe { slab.as_mut().free_list = free_list };

        slab
    }

    /// The slab that the unit at `address` belongs to.
    ///
    /// # Safety
    /// `address` must be a unit address previously handed out by a slab.
    pub(crate) unsafe fn of_unit(address: *mut u8) -> NonNull<Slab> {
        let addr = address as usize;
        debug_assert_ne!(addr % SLAB_SIZE, 0, "slab unit at a page boundary");
        unsafe { NonNull::new_unchecked((addr & !(SLAB_SIZE - 1)) as *mut Slab) }
    }

    pub(crate) fn class(&self) -> usize {
        self.class
    }

    pub(crate) fn allocate_unit(&mut self) -> *mut u8 {
        if self.free_list.is_null() {
            return ptr::null_mut();
        }
        let unit = self.free_list;
        self.free_list = unsafe { (*unit).next };
        self.used_count += 1;
        unit.cast()
    }

    /// # Safety
    /// `address` must be a live unit of this slab.
    pub(crate) unsafe fn release_unit(&mut self, address: *mut u8) {
        let unit = address.cast::<FreeUnit>();
        unsafe { (*unit).next = self.free_list };
        self.free_list = unit;
        self.used_count -= 1;
    }

    pub(crate) fn is_totally_free(&self) -> bool {
        self.used_count == 0
    }

    pub(crate) fn is_totally_used(&self) -> bool {
        self.free_list.is_null()
    }
}
