#![cfg_attr(not(test), no_std)]

//! A slab allocator for sub-page allocations.
//!
//! Pages come from a [`PageBackend`]; each page is carved into fixed-size
//! units with a [`slab::Slab`] header at its start. Per size class the
//! allocator keeps a list of slabs with free units and a list of saturated
//! ones. Requests at or above the largest unit size bypass the slabs and
//! go to the backend whole; such allocations are recognized on release by
//! their page alignment.

mod slab;

use core::mem;
use core::ptr::{self, NonNull};
use corvid_mm::paging::PAGE_SIZE;
use corvid_sync::Spin;
use intrusive_list::{List, container_of};
use slab::Slab;

pub const SLAB_SIZE: usize = PAGE_SIZE;

const _: () = assert!(SLAB_SIZE.is_power_of_two());

const SLAB_CLASS_COUNT: usize = 8;

const HEADER_SIZE: usize = mem::size_of::<Slab>();

/// Unit sizes served from slabs. The larger classes are sized so that the
/// units and the header together pack the page without waste.
const SLAB_UNITS: [usize; SLAB_CLASS_COUNT] = [
    16,
    32,
    64,
    128 - HEADER_SIZE,
    256 - HEADER_SIZE,
    512 - HEADER_SIZE,
    1024 - HEADER_SIZE,
    2048 - HEADER_SIZE,
];

/// Where a slab allocator gets whole pages from.
///
/// The kernel backs this with its linear memory manager; tests back it
/// with aligned host allocations.
pub trait PageBackend {
    /// Allocate `size` bytes of `SLAB_SIZE`-aligned memory. Null on
    /// failure.
    fn allocate_pages(&self, size: usize) -> *mut u8;

    /// Give back pages obtained from [`Self::allocate_pages`]. False if
    /// `address` is not a live page allocation.
    fn release_pages(&self, address: *mut u8) -> bool;
}

struct SlabClass {
    usable: List,
    used: List,
}

pub struct SlabAllocator<B> {
    classes: Spin<[SlabClass; SLAB_CLASS_COUNT]>,
    backend: B,
}

// SAFETY: The lists only hold pointers into backend pages, whose ownership
//         moves with the allocator; all access goes through the lock.
unsafe impl<B: Send> Send for SlabAllocator<B> {}
unsafe impl<B: Send + Sync> Sync for SlabAllocator<B> {}

impl<B: PageBackend> SlabAllocator<B> {
    pub const fn new_in(backend: B) -> Self {
        Self {
            classes: Spin::new(
                [const {
                    SlabClass {
                        usable: List::new(),
                        used: List::new(),
                    }
                }; SLAB_CLASS_COUNT],
            ),
            backend,
        }
    }

    fn class_of(size: usize) -> usize {
        SLAB_UNITS
            .iter()
            .position(|&unit| unit >= size)
            .expect("request fits no size class")
    }

    /// Allocate `size` bytes. Never returns a page-aligned pointer for a
    /// sub-page request, and always returns one for a large request.
    pub fn allocate(&self, size: usize) -> *mut u8 {
        if size >= SLAB_UNITS[SLAB_CLASS_COUNT - 1] {
            return self
                .backend
                .allocate_pages(size.div_ceil(PAGE_SIZE) * PAGE_SIZE);
        }
        let class = Self::class_of(size);

        {
            let mut classes = self.classes.lock();
            if let Some(unit) = Self::allocate_from_usable(&mut classes[class]) {
                return unit;
            }
        }

        // No usable slab. Fetch a fresh page with the lock dropped: the
        // backend may fail and unwind page mappings, which must not happen
        // under a spinlock.
        let Some(page) = NonNull::new(self.backend.allocate_pages(SLAB_SIZE)) else {
            return ptr::null_mut();
        };
        let mut slab_ptr = unsafe { Slab::init(page, class, SLAB_UNITS[class]) };

        let mut classes = self.classes.lock();
        let slab = unsafe { slab_ptr.as_mut() };
        let unit = slab.allocate_unit();
        debug_assert!(!unit.is_null());
        if slab.is_totally_used() {
            classes[class].used.insert(&mut slab.link);
        } else {
            classes[class].usable.insert(&mut slab.link);
        }
        debug_assert_ne!(unit as usize % SLAB_SIZE, 0);
        unit
    }

    fn allocate_from_usable(class: &mut SlabClass) -> Option<*mut u8> {
        let link = class.usable.head()?;
        let slab = unsafe { &mut *container_of!(link, Slab, link) };

        let unit = slab.allocate_unit();
        debug_assert!(!unit.is_null());
        if slab.is_totally_used() {
            class.usable.remove(&mut slab.link);
            class.used.insert(&mut slab.link);
        }
        debug_assert_ne!(unit as usize % SLAB_SIZE, 0);
        Some(unit)
    }

    /// Release a pointer obtained from [`Self::allocate`].
    pub fn release(&self, address: *mut u8) {
        if address as usize % PAGE_SIZE == 0 {
            // large-allocation bypass
            let ok = self.backend.release_pages(address);
            assert!(ok, "released a page address with no live allocation");
            return;
        }

        let page_to_free = {
            let mut classes = self.classes.lock();
            let mut slab_ptr = unsafe { Slab::of_unit(address) };
            let slab = unsafe { slab_ptr.as_mut() };
            let class = &mut classes[slab.class()];

            if slab.is_totally_used() {
                // about to have a free unit again; let allocation see it
                class.used.remove(&mut slab.link);
                class.usable.insert(&mut slab.link);
            }
            unsafe { slab.release_unit(address) };

            if slab.is_totally_free() {
                class.usable.remove(&mut slab.link);
                Some(slab_ptr.as_ptr().cast::<u8>())
            } else {
                None
            }
        };

        // the page goes back only after the slab left the lists
        if let Some(page) = page_to_free {
            let ok = self.backend.release_pages(page);
            assert!(ok, "slab page vanished from the backend");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::alloc::{Layout, alloc, dealloc};
    use std::collections::HashMap;
    use std::sync::Arc;

    #[derive(Clone)]
    struct HostBackend {
        live: Arc<Spin<HashMap<usize, usize>>>,
    }

    impl HostBackend {
        fn new() -> Self {
            Self {
                live: Arc::new(Spin::new(HashMap::new())),
            }
        }

        fn live_pages(&self) -> usize {
            self.live.lock().len()
        }
    }

    impl PageBackend for HostBackend {
        fn allocate_pages(&self, size: usize) -> *mut u8 {
            let layout = Layout::from_size_align(size, SLAB_SIZE).unwrap();
            let page = unsafe { alloc(layout) };
            assert!(!page.is_null());
            self.live.lock().insert(page as usize, size);
            page
        }

        fn release_pages(&self, address: *mut u8) -> bool {
            let Some(size) = self.live.lock().remove(&(address as usize)) else {
                return false;
            };
            let layout = Layout::from_size_align(size, SLAB_SIZE).unwrap();
            unsafe { dealloc(address, layout) };
            true
        }
    }

    #[test]
    fn size_class_dispatch() {
        let backend = HostBackend::new();
        let allocator = SlabAllocator::new_in(backend.clone());

        let small = allocator.allocate(24);
        assert!(!small.is_null());
        assert_ne!(small as usize % SLAB_SIZE, 0);
        unsafe { small.write_bytes(0xa5, 24) };

        let large = allocator.allocate(3000);
        assert!(!large.is_null());
        assert_eq!(large as usize % SLAB_SIZE, 0);
        unsafe { large.write_bytes(0x5a, 3000) };

        allocator.release(large);
        allocator.release(small);
        assert_eq!(backend.live_pages(), 0);
    }

    #[test]
    fn units_are_never_page_aligned() {
        let backend = HostBackend::new();
        let allocator = SlabAllocator::new_in(backend);

        let mut units = Vec::new();
        for _ in 0..600 {
            let unit = allocator.allocate(16);
            assert!(!unit.is_null());
            assert_ne!(unit as usize % SLAB_SIZE, 0);
            units.push(unit);
        }
        for unit in units {
            allocator.release(unit);
        }
    }

    #[test]
    fn saturated_slabs_come_back_into_rotation() {
        let backend = HostBackend::new();
        let allocator = SlabAllocator::new_in(backend.clone());

        // saturate the first slab of the largest class and spill into a
        // second one
        let per_slab = (SLAB_SIZE - HEADER_SIZE) / SLAB_UNITS[SLAB_CLASS_COUNT - 1];
        let mut units = Vec::new();
        for _ in 0..per_slab + 1 {
            units.push(allocator.allocate(SLAB_UNITS[SLAB_CLASS_COUNT - 1] - 1));
        }
        assert_eq!(backend.live_pages(), 2);

        // freeing one unit of the saturated slab makes it allocatable again
        let recycled = units.remove(0);
        allocator.release(recycled);
        units.push(allocator.allocate(SLAB_UNITS[SLAB_CLASS_COUNT - 1] - 1));
        assert_eq!(backend.live_pages(), 2);

        for unit in units {
            allocator.release(unit);
        }
        assert_eq!(backend.live_pages(), 0);
    }

    #[test]
    fn distinct_classes_share_nothing() {
        let backend = HostBackend::new();
        let allocator = SlabAllocator::new_in(backend.clone());

        let a = allocator.allocate(16);
        let b = allocator.allocate(500);
        assert_ne!(a as usize & !(SLAB_SIZE - 1), b as usize & !(SLAB_SIZE - 1));
        assert_eq!(backend.live_pages(), 2);

        allocator.release(a);
        allocator.release(b);
        assert_eq!(backend.live_pages(), 0);
    }

    #[test]
    fn large_requests_round_to_pages() {
        let backend = HostBackend::new();
        let allocator = SlabAllocator::new_in(backend.clone());

        let big = allocator.allocate(2 * SLAB_SIZE + 1);
        assert_eq!(big as usize % SLAB_SIZE, 0);
        unsafe { big.write_bytes(7, 2 * SLAB_SIZE + 1) };
        allocator.release(big);
        assert_eq!(backend.live_pages(), 0);
    }

    #[test]
    fn concurrent_allocate_release() {
        let backend = HostBackend::new();
        let allocator = Arc::new(SlabAllocator::new_in(backend.clone()));

        let threads: Vec<_> = (0..4)
            .map(|t| {
                let allocator = allocator.clone();
                std::thread::spawn(move || {
                    let mut held = Vec::new();
                    for round in 0..500usize {
                        let size = 16 << (round % 5);
                        let unit = allocator.allocate(size);
                        assert!(!unit.is_null());
                        unsafe { unit.write_bytes(t as u8 + 1, size) };
                        held.push(unit);
                        if round % 3 == 0 {
                            allocator.release(held.swap_remove(round % held.len()));
                        }
                    }
                    for unit in held {
                        allocator.release(unit);
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }
        assert_eq!(backend.live_pages(), 0);
    }
}
