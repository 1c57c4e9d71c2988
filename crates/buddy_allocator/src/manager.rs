use crate::block::{BlockFlags, BlockItem, BlockStatus, NIL};
use crate::free_area::FreeArea;
use crate::{MIN_BLOCK_ORDER, MIN_BLOCK_SIZE};
use core::mem;
use core::ptr::NonNull;
use corvid_mm::address::Addr;

/// A buddy manager over the address range `[begin, begin + block_count *
/// MIN_BLOCK_SIZE)`, with one arena element per quantum.
///
/// `AREAS` is the number of block orders served, so the largest block is
/// `MIN_BLOCK_SIZE << (AREAS - 1)`. The element array lives in a region
/// provided at construction, sized for `max_block_count` elements; a
/// linear manager may later grow `block_count` toward that maximum by
/// mapping pages behind the array (see [`BlockManager::push_block`]).
pub struct BlockManager<E, A, const AREAS: usize> {
    blocks: NonNull<E>,
    begin_address: A,
    initial_block_count: usize,
    block_count: usize,
    max_block_count: usize,
    free_size: usize,
    free_areas: [FreeArea; AREAS],
}

// SAFETY: The arena is exclusively owned by the manager; sending the
//         manager moves that ownership with it.
unsafe impl<E: Send, A: Send, const AREAS: usize> Send for BlockManager<E, A, AREAS> {}

impl<E, A, const AREAS: usize> BlockManager<E, A, AREAS>
where
    E: BlockItem,
    A: Addr,
{
    pub const fn max_block_order() -> u32 {
        MIN_BLOCK_ORDER + AREAS as u32 - 1
    }

    pub const fn max_block_size() -> usize {
        MIN_BLOCK_SIZE << (AREAS - 1)
    }

    /// Create a manager whose elements live in `region`.
    ///
    /// Every quantum of `[begin, init_end)` starts out in use; callers
    /// seed the free lists by releasing the quanta that are actually
    /// available.
    ///
    /// # Panics
    /// Panics if `region_size` cannot hold `(max_end - begin) /
    /// MIN_BLOCK_SIZE` elements, or if any address is misaligned.
    ///
    /// # Safety
    /// `region` must be valid for reads and writes of `region_size`
    /// bytes, aligned for `E`, unused by anyone else, and live as long as
    /// the manager. Element slots beyond `init_end`'s may be backed
    /// lazily, but must be mapped before the corresponding
    /// [`Self::push_block`] call.
    pub unsafe fn new(
        region: NonNull<u8>,
        region_size: usize,
        begin: A,
        init_end: A,
        max_end: A,
    ) -> Self {
        const { assert!(AREAS as u32 + MIN_BLOCK_ORDER <= u8::MAX as u32) };
        assert!(begin.is_aligned_to(MIN_BLOCK_SIZE));
        assert!(init_end.is_aligned_to(MIN_BLOCK_SIZE));
        assert!(max_end.is_aligned_to(MIN_BLOCK_SIZE));
        assert!(begin <= init_end && init_end <= max_end);
        assert_eq!(region.as_ptr() as usize % mem::align_of::<E>(), 0);

        let max_block_count = (max_end - begin) / MIN_BLOCK_SIZE;
        assert!(max_block_count < NIL as usize);
        if max_block_count * mem::size_of::<E>() > region_size {
            panic!("block manager metadata region too small");
        }

        let initial_block_count = (init_end - begin) / MIN_BLOCK_SIZE;
        let blocks = region.cast::<E>();
        for i in 0..initial_block_count {
            unsafe { blocks.add(i).write(E::new()) };
        }

        Self {
            blocks,
            begin_address: begin,
            initial_block_count,
            block_count: initial_block_count,
            max_block_count,
            free_size: 0,
            free_areas: [const { FreeArea::new() }; AREAS],
        }
    }

    pub fn begin_address(&self) -> A {
        self.begin_address
    }

    pub fn block_count(&self) -> usize {
        self.block_count
    }

    pub fn initial_block_count(&self) -> usize {
        self.initial_block_count
    }

    pub fn max_block_count(&self) -> usize {
        self.max_block_count
    }

    /// Total size of the blocks currently on the free lists.
    pub fn free_size(&self) -> usize {
        self.free_size
    }

    pub fn is_in_range(&self, address: A) -> bool {
        address.is_aligned_to(MIN_BLOCK_SIZE)
            && address >= self.begin_address
            && (address - self.begin_address) / MIN_BLOCK_SIZE < self.block_count
    }

    fn index_of(&self, address: A) -> u32 {
        debug_assert!(self.is_in_range(address));
        ((address - self.begin_address) / MIN_BLOCK_SIZE) as u32
    }

    fn address_at(&self, index: u32) -> A {
        self.begin_address + index as usize * MIN_BLOCK_SIZE
    }

    fn item(&self, index: u32) -> &E {
        debug_assert!((index as usize) < self.block_count);
        unsafe { self.blocks.add(index as usize).as_ref() }
    }

    fn item_mut(&mut self, index: u32) -> &mut E {
        debug_assert!((index as usize) < self.block_count);
        unsafe { self.blocks.add(index as usize).as_mut() }
    }

    /// The layered element for the quantum at `address`.
    pub fn element_at(&mut self, address: A) -> &mut E {
        assert!(self.is_in_range(address));
        let index = self.index_of(address);
        self.item_mut(index)
    }

    /// The index of the buddy of a block at `index` with order `order`,
    /// or `None` when the buddy would lie past the end of the managed
    /// range.
    fn buddy_of(&self, index: u32, order: u32) -> Option<u32> {
        let buddy = index ^ (1 << (order - MIN_BLOCK_ORDER));
        ((buddy as usize) < self.block_count).then_some(buddy)
    }

    fn area_of(order: u32) -> usize {
        (order - MIN_BLOCK_ORDER) as usize
    }

    fn push_free(&mut self, index: u32) {
        let order = self.item(index).block().size_order();
        let area = Self::area_of(order);
        let head = self.free_areas[area].head;
        {
            let block = self.item_mut(index).block_mut();
            debug_assert!(!block.linked);
            block.prev = NIL;
            block.next = head.unwrap_or(NIL);
            block.linked = true;
        }
        if let Some(head) = head {
            self.item_mut(head).block_mut().prev = index;
        }
        self.free_areas[area].head = Some(index);
        self.free_areas[area].count += 1;
    }

    fn remove_free(&mut self, index: u32) {
        let (order, prev, next) = {
            let block = self.item(index).block();
            debug_assert!(block.linked);
            (block.size_order(), block.prev, block.next)
        };
        let area = Self::area_of(order);
        if prev != NIL {
            self.item_mut(prev).block_mut().next = next;
        } else {
            debug_assert_eq!(self.free_areas[area].head, Some(index));
            self.free_areas[area].head = (next != NIL).then_some(next);
        }
        if next != NIL {
            self.item_mut(next).block_mut().prev = prev;
        }
        let block = self.item_mut(index).block_mut();
        block.prev = NIL;
        block.next = NIL;
        block.linked = false;
        self.free_areas[area].count -= 1;
    }

    fn pop_free(&mut self, area: usize) -> Option<u32> {
        let index = self.free_areas[area].head?;
        self.remove_free(index);
        Some(index)
    }

    /// The order a request for `size` bytes is served at, or `None` when
    /// it exceeds the largest block. Size 0 rounds up to one quantum.
    fn ceil_allocate_order(size: usize) -> Option<u32> {
        if size > Self::max_block_size() {
            return None;
        }
        Some(
            size.next_power_of_two()
                .trailing_zeros()
                .max(MIN_BLOCK_ORDER),
        )
    }

    /// Allocate a block of at least `size` bytes. Returns the block's
    /// address and its effective (power-of-two) size.
    pub fn allocate(&mut self, size: usize, flags: BlockFlags) -> Option<(A, usize)> {
        let order = Self::ceil_allocate_order(size)?;

        let mut found = None;
        for current in order..=Self::max_block_order() {
            if let Some(index) = self.pop_free(Self::area_of(current)) {
                found = Some((index, current));
                break;
            }
        }
        let (index, mut current) = found?;

        {
            let block = self.item_mut(index).block_mut();
            debug_assert_eq!(block.status, BlockStatus::FreeOrCovered);
            block.status = BlockStatus::Using;
            block.flags = flags;
        }

        while current > order {
            // split: halve the block and hand the upper half back
            current -= 1;
            self.item_mut(index).block_mut().size_order = current as u8;
            let buddy = self
                .buddy_of(index, current)
                .expect("split buddy is within the managed range");
            {
                let block = self.item(buddy).block();
                debug_assert!(!block.linked && block.size_order() == current);
                debug_assert_eq!(block.status, BlockStatus::FreeOrCovered);
            }
            self.push_free(buddy);
        }

        self.free_size -= 1usize << order;
        Some((self.address_at(index), 1usize << order))
    }

    /// Split the allocated block at `address` into independent blocks of
    /// `split_size` bytes, each in use and releasable on its own. The
    /// layered manager uses this to reference-count the pieces of a
    /// multi-page allocation separately.
    ///
    /// `split_size` must be a power of two between one quantum and the
    /// block's size.
    pub fn split_allocated(&mut self, address: A, split_size: usize) {
        let index = self.index_of(address);
        let order = self.item(index).block().size_order();
        assert!(split_size.is_power_of_two());
        assert!(split_size >= MIN_BLOCK_SIZE && split_size <= 1usize << order);
        debug_assert_eq!(self.item(index).block().status, BlockStatus::Using);

        let split_order = split_size.trailing_zeros();
        let step = 1u32 << (split_order - MIN_BLOCK_ORDER);
        let count = 1u32 << (order - MIN_BLOCK_ORDER);
        let flags = self.item(index).block().flags;
        for offset in (0..count).step_by(step as usize) {
            let block = self.item_mut(index + offset).block_mut();
            debug_assert!(!block.linked);
            block.size_order = split_order as u8;
            block.status = BlockStatus::Using;
            block.flags = flags;
        }
    }

    fn is_releasable_block(&self, index: u32) -> bool {
        let block = self.item(index).block();
        match block.status {
            BlockStatus::Using => {
                debug_assert!(!block.linked);
                #[cfg(debug_assertions)]
                if let Some(buddy) = self.buddy_of(index, block.size_order()) {
                    debug_assert!(self.item(buddy).block().size_order() <= block.size_order());
                }
                true
            }
            BlockStatus::FreeOrCovered => {
                // either on a free list, or covered by a larger block at
                // a lower address
                #[cfg(debug_assertions)]
                match self.buddy_of(index, block.size_order()) {
                    Some(buddy) => debug_assert!(
                        block.linked
                            || (buddy < index
                                && self.item(buddy).block().size_order() > block.size_order())
                    ),
                    None => debug_assert!(block.linked),
                }
                false
            }
            BlockStatus::Releasing => false,
        }
    }

    /// Whether `address` is the start of a block that can be released:
    /// aligned, in range and currently in use. Covered quanta, free
    /// blocks and blocks mid-release all report false.
    pub fn is_releasable(&self, address: A) -> bool {
        self.is_in_range(address) && self.is_releasable_block(self.index_of(address))
    }

    /// Whether `address` falls inside a block that is in use, walking up
    /// to the covering block if the quantum itself is covered.
    pub fn is_using(&self, address: A) -> bool {
        if !self.is_in_range(address) {
            return false;
        }
        let mut index = self.index_of(address);
        loop {
            let order = self.item(index).block().size_order();
            match self.buddy_of(index, order) {
                Some(buddy) if self.item(buddy).block().size_order() > order => {
                    debug_assert!(buddy < index);
                    index = buddy;
                }
                _ => break,
            }
        }
        self.item(index).block().status == BlockStatus::Using
    }

    /// The effective size of the allocated block at `address`.
    pub fn allocated_size(&self, address: A) -> usize {
        assert!(self.is_in_range(address));
        1usize << self.item(self.index_of(address)).block().size_order()
    }

    pub fn block_flags(&self, address: A) -> BlockFlags {
        assert!(self.is_in_range(address));
        self.item(self.index_of(address)).block().flags
    }

    fn release_block_at(&mut self, mut index: u32) {
        let order = self.item(index).block().size_order();
        self.free_size += 1usize << order;
        {
            let block = self.item_mut(index).block_mut();
            debug_assert!(!block.linked);
            debug_assert!(matches!(
                block.status,
                BlockStatus::Using | BlockStatus::Releasing
            ));
            block.status = BlockStatus::FreeOrCovered;
            block.flags = BlockFlags::empty();
        }

        loop {
            let order = self.item(index).block().size_order();
            if order >= Self::max_block_order() {
                break;
            }
            let Some(buddy) = self.buddy_of(index, order) else {
                break;
            };
            {
                let block = self.item(buddy).block();
                debug_assert!(block.size_order() <= order);
                // a buddy that is off every list is not free; one with a
                // smaller order is only partially free
                if !block.linked || block.size_order() != order {
                    break;
                }
                debug_assert_eq!(block.status, BlockStatus::FreeOrCovered);
            }
            self.remove_free(buddy);
            // the lower-address node survives the merge
            index = index.min(buddy);
            self.item_mut(index).block_mut().size_order = (order + 1) as u8;
        }

        self.push_free(index);
    }

    /// Release the block at `address`, coalescing with free buddies.
    ///
    /// Releasing an address that is not releasable panics in debug
    /// builds and is ignored in release builds.
    pub fn release(&mut self, address: A) {
        if !self.is_in_range(address) || !self.is_releasable_block(self.index_of(address)) {
            debug_assert!(false, "released an address that is not releasable");
            return;
        }
        self.release_block_at(self.index_of(address));
    }

    /// First phase of a two-phase release (or of an unpublished
    /// reservation): detach the block from the releasable state so that
    /// concurrent observers treat it as neither usable nor releasable.
    pub fn prepare_release(&mut self, address: A) {
        let index = self.index_of(address);
        let block = self.item_mut(index).block_mut();
        assert_eq!(block.status, BlockStatus::Using);
        block.status = BlockStatus::Releasing;
    }

    /// Publish a reserved block, making it visible to release and
    /// translation paths.
    pub fn commit(&mut self, address: A) {
        let index = self.index_of(address);
        let block = self.item_mut(index).block_mut();
        assert_eq!(block.status, BlockStatus::Releasing);
        block.status = BlockStatus::Using;
    }

    /// Second phase of a two-phase release: return the detached block to
    /// the free lists.
    pub fn finish_release(&mut self, address: A) {
        let index = self.index_of(address);
        debug_assert_eq!(self.item(index).block().status, BlockStatus::Releasing);
        self.release_block_at(index);
    }

    /// How many quanta to append so that a subsequent allocation of
    /// `size` can be served from the appended range, keeping
    /// `block_count` a multiple of the request's alignment. `None` when
    /// the request is too large or the maximum is reached.
    pub fn extend_count_for(&self, size: usize) -> Option<usize> {
        let order = Self::ceil_allocate_order(size)?;
        let add = 1usize << (order - MIN_BLOCK_ORDER);
        let new_count = add + self.block_count.div_ceil(add) * add;
        (new_count <= self.max_block_count).then(|| new_count - self.block_count)
    }

    /// The address of the element slot at `index`, which may lie past
    /// the live range. Linear managers use it to decide when growing the
    /// array needs another metadata page mapped.
    pub fn element_address(&self, index: usize) -> usize {
        self.blocks.as_ptr() as usize + index * mem::size_of::<E>()
    }

    /// The address one past the last live element.
    pub fn element_end_address(&self) -> usize {
        self.element_address(self.block_count)
    }

    /// Append one quantum to the managed range and release it into the
    /// free lists, where any concurrent caller may pick it up.
    ///
    /// # Safety
    /// The element slot at `block_count` must be backed by mapped,
    /// writable memory.
    pub unsafe fn push_block(&mut self) {
        assert!(self.block_count < self.max_block_count);
        unsafe { self.blocks.add(self.block_count).write(E::new()) };
        self.block_count += 1;
        self.release_block_at((self.block_count - 1) as u32);
    }

    /// Tear down all bookkeeping: shrink back to the initial range with
    /// every quantum in use and nothing free. The caller is responsible
    /// for having released or forgotten all outstanding blocks.
    pub fn reset(&mut self) {
        self.block_count = self.initial_block_count;
        self.free_size = 0;
        for area in &mut self.free_areas {
            *area = FreeArea::new();
        }
        for i in 0..self.block_count {
            unsafe { self.blocks.add(i).write(E::new()) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::MemoryBlock;
    use corvid_mm::address::PAddr;

    const KIB: usize = 1024;

    struct Fixture<const AREAS: usize> {
        _storage: Vec<MemoryBlock>,
        manager: BlockManager<MemoryBlock, PAddr, AREAS>,
    }

    impl<const AREAS: usize> Fixture<AREAS> {
        fn new(begin: usize, init_size: usize, max_size: usize) -> Self {
            let max_count = max_size / MIN_BLOCK_SIZE;
            let mut storage: Vec<MemoryBlock> = Vec::with_capacity(max_count);
            let region = NonNull::new(storage.as_mut_ptr().cast::<u8>()).unwrap();
            let mut manager = unsafe {
                BlockManager::new(
                    region,
                    max_count * mem::size_of::<MemoryBlock>(),
                    PAddr::from(begin),
                    PAddr::from(begin + init_size),
                    PAddr::from(begin + max_size),
                )
            };
            for i in 0..init_size / MIN_BLOCK_SIZE {
                manager.release(PAddr::from(begin + i * MIN_BLOCK_SIZE));
            }
            Self {
                _storage: storage,
                manager,
            }
        }
    }

    #[test]
    fn exhaustion_and_coalescing() {
        let mut f = Fixture::<5>::new(0x10_0000, 64 * KIB, 64 * KIB);
        let m = &mut f.manager;
        assert_eq!(m.free_size(), 64 * KIB);

        let (a0, s0) = m.allocate(16 * KIB, BlockFlags::empty()).unwrap();
        let (a1, s1) = m.allocate(16 * KIB, BlockFlags::empty()).unwrap();
        let (a2, s2) = m.allocate(32 * KIB, BlockFlags::empty()).unwrap();
        assert_eq!((s0, s1, s2), (16 * KIB, 16 * KIB, 32 * KIB));
        assert_eq!(a0, PAddr::from(0x10_0000));
        assert_eq!(a1, a0 + 0x4000);
        assert_eq!(a2, a0 + 0x8000);
        assert_eq!(m.free_size(), 0);
        assert!(m.allocate(MIN_BLOCK_SIZE, BlockFlags::empty()).is_none());

        m.release(a0);
        m.release(a1);
        m.release(a2);
        assert_eq!(m.free_size(), 64 * KIB);

        // everything coalesced back into a single block
        let (again, size) = m.allocate(64 * KIB, BlockFlags::empty()).unwrap();
        assert_eq!(again, a0);
        assert_eq!(size, 64 * KIB);
    }

    #[test]
    fn requests_above_the_largest_order_fail() {
        let mut f = Fixture::<5>::new(0, 64 * KIB, 64 * KIB);
        let max = BlockManager::<MemoryBlock, PAddr, 5>::max_block_size();
        assert!(f.manager.allocate(max + 1, BlockFlags::empty()).is_none());
        assert_eq!(f.manager.free_size(), 64 * KIB);
    }

    #[test]
    fn zero_sized_request_takes_one_quantum() {
        let mut f = Fixture::<5>::new(0, 64 * KIB, 64 * KIB);
        let (_, size) = f.manager.allocate(0, BlockFlags::empty()).unwrap();
        assert_eq!(size, MIN_BLOCK_SIZE);
    }

    #[test]
    fn releasable_follows_the_block_lifecycle() {
        let mut f = Fixture::<5>::new(0, 64 * KIB, 64 * KIB);
        let m = &mut f.manager;

        let (addr, _) = m.allocate(8 * KIB, BlockFlags::empty()).unwrap();
        assert!(m.is_releasable(addr));
        assert!(m.is_using(addr));

        // the covered second quantum is usable but not releasable
        let covered = addr + MIN_BLOCK_SIZE;
        assert!(!m.is_releasable(covered));
        assert!(m.is_using(covered));

        m.release(addr);
        assert!(!m.is_releasable(addr));
        assert!(!m.is_using(addr));
    }

    #[test]
    fn no_merge_past_the_managed_end() {
        // three quanta: 0 and 1 coalesce, 2 has no buddy in range
        let mut f = Fixture::<5>::new(0, 12 * KIB, 12 * KIB);
        let m = &mut f.manager;
        assert_eq!(m.free_size(), 12 * KIB);

        let (low, size) = m.allocate(8 * KIB, BlockFlags::empty()).unwrap();
        assert_eq!(low, PAddr::from(0));
        assert_eq!(size, 8 * KIB);
        let (high, _) = m.allocate(MIN_BLOCK_SIZE, BlockFlags::empty()).unwrap();
        assert_eq!(high, PAddr::from(8 * KIB));
        assert!(m.allocate(MIN_BLOCK_SIZE, BlockFlags::empty()).is_none());

        m.release(high);
        m.release(low);
        assert_eq!(m.free_size(), 12 * KIB);
    }

    #[test]
    fn two_phase_release_hides_the_block() {
        let mut f = Fixture::<5>::new(0, 64 * KIB, 64 * KIB);
        let m = &mut f.manager;

        let (addr, _) = m.allocate(4 * KIB, BlockFlags::empty()).unwrap();
        m.prepare_release(addr);
        assert!(!m.is_releasable(addr));
        assert!(!m.is_using(addr));

        m.finish_release(addr);
        assert_eq!(m.free_size(), 64 * KIB);
    }

    #[test]
    fn commit_publishes_a_reserved_block() {
        let mut f = Fixture::<5>::new(0, 64 * KIB, 64 * KIB);
        let m = &mut f.manager;

        let (addr, _) = m.allocate(4 * KIB, BlockFlags::empty()).unwrap();
        m.prepare_release(addr);
        assert!(!m.is_using(addr));
        m.commit(addr);
        assert!(m.is_releasable(addr));
        assert!(m.is_using(addr));
        m.release(addr);
    }

    #[test]
    fn free_size_accounts_for_outstanding_blocks() {
        let mut f = Fixture::<5>::new(0, 64 * KIB, 64 * KIB);
        let m = &mut f.manager;

        let (a, sa) = m.allocate(5 * KIB, BlockFlags::empty()).unwrap();
        assert_eq!(sa, 8 * KIB);
        let (b, sb) = m.allocate(100, BlockFlags::empty()).unwrap();
        assert_eq!(sb, 4 * KIB);
        assert_eq!(m.free_size(), 64 * KIB - sa - sb);

        m.release(b);
        assert_eq!(m.free_size(), 64 * KIB - sa);
        m.release(a);
        assert_eq!(m.free_size(), 64 * KIB);
    }

    #[test]
    fn live_blocks_never_overlap() {
        let mut f = Fixture::<5>::new(0, 64 * KIB, 64 * KIB);
        let m = &mut f.manager;

        let mut live: Vec<(usize, usize)> = Vec::new();
        let sizes = [4 * KIB, 16 * KIB, 4 * KIB, 8 * KIB, 32 * KIB, 4 * KIB];
        for size in sizes {
            if let Some((addr, got)) = m.allocate(size, BlockFlags::empty()) {
                let start = addr - PAddr::from(0);
                for &(other, other_size) in &live {
                    assert!(start + got <= other || other + other_size <= start);
                }
                live.push((start, got));
            }
        }
        for (start, _) in live {
            m.release(PAddr::from(start));
        }
        assert_eq!(m.free_size(), 64 * KIB);
    }

    #[test]
    fn split_allocated_blocks_release_independently() {
        let mut f = Fixture::<5>::new(0, 64 * KIB, 64 * KIB);
        let m = &mut f.manager;

        let (addr, size) = m.allocate(16 * KIB, BlockFlags::empty()).unwrap();
        m.split_allocated(addr, MIN_BLOCK_SIZE);
        for page in 0..size / MIN_BLOCK_SIZE {
            let piece = addr + page * MIN_BLOCK_SIZE;
            assert!(m.is_releasable(piece));
            assert_eq!(m.allocated_size(piece), MIN_BLOCK_SIZE);
        }

        // pieces released out of order still coalesce into the original
        for page in [2, 0, 3, 1] {
            m.release(addr + page * MIN_BLOCK_SIZE);
        }
        assert_eq!(m.free_size(), 64 * KIB);
        let (again, got) = m.allocate(64 * KIB, BlockFlags::empty()).unwrap();
        assert_eq!((again, got), (PAddr::from(0), 64 * KIB));
    }

    #[test]
    fn extension_reaches_the_configured_maximum() {

        const MIB: usize = 1024 * KIB;
        // orders 12..=21, so a 2 MiB block is the largest
        let mut f = Fixture::<10>::new(0, MIB, 4 * MIB);
        let m = &mut f.manager;

        assert!(m.allocate(2 * MIB, BlockFlags::empty()).is_none());

        let extend = m.extend_count_for(2 * MIB).unwrap();
        assert_eq!(m.block_count() + extend, 1024);
        for _ in 0..extend {
            unsafe { m.push_block() };
        }
        assert_eq!(m.free_size(), 4 * MIB);

        let (addr, size) = m.allocate(2 * MIB, BlockFlags::empty()).unwrap();
        assert_eq!(size, 2 * MIB);
        assert!(addr.is_aligned_to(2 * MIB));
        assert_eq!(m.free_size(), 2 * MIB);

        // growth beyond the maximum is refused
        assert!(m.extend_count_for(4 * MIB).is_none());
        m.release(addr);
    }
}
