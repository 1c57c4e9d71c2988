use super::linear::LinearBlockManager;
use super::mm::LinearMemoryManager;
use super::page_table::{PageAttribute, PageTable, KERNEL_PAGE};
use super::phys::{PhysicalBlock, PhysicalMemoryManager};
use super::MemResult;
use buddy_allocator::{MemoryBlock, MIN_BLOCK_SIZE};
use core::mem;
use core::ptr::NonNull;
use corvid_log::println_info;
use corvid_mm::address::{Addr as _, PAddr, VAddr, VRange};
use slab_allocator::{PageBackend, SlabAllocator};

/// The highest physical byte the kernel manages, whatever firmware
/// reports: the largest quantum-aligned address below 4 GiB.
pub const OS_MAX_ADDRESS: usize = 0xffff_ffff - 0xffff_ffff % MIN_BLOCK_SIZE;

/// One record of the firmware memory map, in the 24-byte wire layout the
/// boot stage hands over.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct AddressRange {
    pub base: u64,
    pub size: u64,
    pub kind: u32,
    pub extra: u32,
}

const _: () = assert!(mem::size_of::<AddressRange>() == 24);

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressRangeKind {
    Usable = 1,
    Reserved = 2,
    AcpiReclaimable = 3,
    AcpiNvs = 4,
    BadMemory = 5,
}

impl AddressRange {
    pub const fn new(base: u64, size: u64, kind: AddressRangeKind) -> Self {
        Self {
            base,
            size,
            kind: kind as u32,
            extra: 0,
        }
    }

    /// Only explicitly usable memory is ever allocated from; unknown
    /// kinds are as good as reserved.
    pub fn is_usable(&self) -> bool {
        self.kind == AddressRangeKind::Usable as u32
    }
}

/// One past the highest usable byte, clamped to [`OS_MAX_ADDRESS`].
fn find_max_address(ranges: &[AddressRange]) -> usize {
    let mut max_address: u64 = 0;
    for range in ranges {
        if range.is_usable() && range.size != 0 && max_address < range.base + range.size - 1 {
            max_address = range.base + range.size - 1;
        }
    }
    if max_address >= OS_MAX_ADDRESS as u64 {
        OS_MAX_ADDRESS
    } else {
        max_address as usize + 1
    }
}

/// Whether the quantum at `address` may be handed to an allocator: fully
/// inside some usable range and overlapping no non-usable one, checked
/// across both arrays.
fn is_usable_in_ranges(address: usize, primary: &[AddressRange], extra: &[AddressRange]) -> bool {
    let start = address as u64;
    let end = start + MIN_BLOCK_SIZE as u64;
    let mut usable = false;
    for range in primary.iter().chain(extra) {
        let range_end = range.base + range.size;
        if range.is_usable() {
            if range.base <= start && range_end >= end {
                usable = true;
            }
        } else if range.base < end && range_end > start {
            return false;
        }
    }
    usable
}

/// Bump carving of the boot reservation at the front of the kernel
/// window. Everything placed here lives for the life of the kernel.
struct BootstrapArena {
    cursor: usize,
    end: usize,
}

impl BootstrapArena {
    fn carve(&mut self, size: usize, align: usize) -> NonNull<u8> {
        let start = self.cursor.next_multiple_of(align);
        if start + size > self.end {
            panic!("bootstrap arena too small for memory metadata");
        }
        self.cursor = start + size;
        NonNull::new(start as *mut u8).expect("bootstrap arena at null")
    }

    /// # Safety
    /// The arena memory must be mapped, writable and exclusively owned.
    unsafe fn place<T>(&mut self, value: T) -> &'static T {
        let slot = self.carve(mem::size_of::<T>(), mem::align_of::<T>()).cast::<T>();
        unsafe {
            slot.write(value);
            &*slot.as_ptr()
        }
    }
}

/// The slab's page supply: kernel pages from the composite manager.
struct KernelPageBackend {
    linear: &'static LinearMemoryManager,
}

impl PageBackend for KernelPageBackend {
    fn allocate_pages(&self, size: usize) -> *mut u8 {
        match self.linear.allocate_pages(size, KERNEL_PAGE) {
            Ok(address) => address.as_ptr(),
            Err(_) => core::ptr::null_mut(),
        }
    }

    fn release_pages(&self, address: *mut u8) -> bool {
        self.linear
            .check_and_unmap_pages(VAddr::from(address as usize))
    }
}

/// The kernel's memory services, frozen after [`init_kernel_memory`].
pub struct KernelMemory {
    linear: &'static LinearMemoryManager,
    slab: SlabAllocator<KernelPageBackend>,
}

impl KernelMemory {
    pub fn linear(&self) -> &'static LinearMemoryManager {
        self.linear
    }

    /// Allocate `size` bytes, from the slab or, for large requests,
    /// whole kernel pages. Null when memory is exhausted.
    pub fn allocate_kernel_memory(&self, size: usize) -> *mut u8 {
        self.slab.allocate(size)
    }

    pub fn release_kernel_memory(&self, address: *mut u8) {
        self.slab.release(address);
    }

    pub fn allocate_kernel_pages(
        &self,
        size: usize,
        attribute: PageAttribute,
    ) -> MemResult<VAddr> {
        self.linear.allocate_pages(size, attribute)
    }

    pub fn check_and_release_kernel_pages(&self, address: VAddr) -> bool {
        self.linear.check_and_unmap_pages(address)
    }
}

const BOOTSTRAP_BEGIN_OFFSET: usize = 1 << 20;
const BOOTSTRAP_END_OFFSET: usize = 23 << 20;

/// Bring up the kernel memory subsystem over the linear window `window`,
/// from the firmware address ranges.
///
/// The first [`BOOTSTRAP_END_OFFSET`] bytes of the window (kernel image
/// plus the metadata arena) stay reserved; the managers, the page table
/// and the returned handle itself are placed inside that arena.
///
/// # Safety
/// The window must be mapped one-to-one onto the physical memory at
/// offset zero at this point of boot, writable and exclusively owned, and
/// the function must be called exactly once.
pub unsafe fn init_kernel_memory(
    window: VRange,
    ranges: &[AddressRange],
) -> &'static KernelMemory {
    assert!(window.start().is_page_aligned() && window.end().is_page_aligned());
    assert!(window.len() > BOOTSTRAP_END_OFFSET);

    let max_address = find_max_address(ranges) / MIN_BLOCK_SIZE * MIN_BLOCK_SIZE;
    println_info!(
        "memory: {} firmware ranges, highest usable address {:#x}",
        ranges.len(),
        max_address
    );

    let mut arena = BootstrapArena {
        cursor: window.start().addr() + BOOTSTRAP_BEGIN_OFFSET,
        end: window.start().addr() + BOOTSTRAP_END_OFFSET,
    };

    // physical manager over [0, max_address), seeded from the firmware
    // map minus the physical image of the boot reservation
    let physical = {
        let region_size = PhysicalMemoryManager::metadata_size(max_address);
        let region = arena.carve(region_size, mem::align_of::<PhysicalBlock>());
        let physical = unsafe {
            let manager =
                PhysicalMemoryManager::new(region, region_size, PAddr::from(0), PAddr::from(max_address));
            arena.place(manager)
        };

        let reserved = [AddressRange::new(
            0,
            BOOTSTRAP_END_OFFSET as u64,
            AddressRangeKind::Reserved,
        )];
        for block in 0..physical.block_count() {
            let address = block * MIN_BLOCK_SIZE;
            if is_usable_in_ranges(address, ranges, &reserved) {
                physical.release(PAddr::from(address));
            }
        }
        physical
    };

    let page = {
        let table_size = PageTable::metadata_size(window.len());
        let region = arena.carve(table_size, mem::align_of::<u64>());
        unsafe { PageTable::new(region, table_size, window) }
    };

    // linear manager over the whole window; everything outside the boot
    // reservation is releasable
    let linear = {
        let metadata_size = LinearBlockManager::metadata_size(window.len());
        let region = arena.carve(metadata_size, mem::align_of::<MemoryBlock>());
        let linear = unsafe {
            LinearBlockManager::new(
                region,
                metadata_size,
                window.start(),
                window.end(),
                window.end(),
            )
        };

        let layout = [
            AddressRange::new(
                window.start().addr() as u64,
                BOOTSTRAP_END_OFFSET as u64,
                AddressRangeKind::Reserved,
            ),
            AddressRange::new(
                window.start().addr() as u64,
                window.len() as u64,
                AddressRangeKind::Usable,
            ),
        ];
        for block in 0..linear.block_count() {
            let address = window.start() + block * MIN_BLOCK_SIZE;
            if is_usable_in_ranges(address.addr(), &[], &layout) {
                linear.release(address);
            }
        }
        linear
    };

    let lmm = unsafe { arena.place(LinearMemoryManager::new(physical, page, linear)) };
    let kernel = unsafe {
        arena.place(KernelMemory {
            linear: lmm,
            slab: SlabAllocator::new_in(KernelPageBackend { linear: lmm }),
        })
    };

    println_info!(
        "memory: {} KiB physical free, {} KiB kernel linear free",
        physical.free_size() / 1024,
        lmm.linear().free_size() / 1024
    );
    kernel
}
