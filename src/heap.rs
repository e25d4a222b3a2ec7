use std::cmp;
use std::ffi::CStr;
use std::io::{self, Write};
use std::ptr::{self, NonNull};

use crate::dump;
use crate::header::{align_up, BlockHeader, BLOCK_HEADER_SIZE, NAME_CAPACITY};
use crate::list::BlockList;
use crate::platform::{self, ENV_VALUE_CAPACITY};
use crate::policy::{self, Placement};
use crate::region;
use crate::Pointer;

/// Environment variable that turns payload scribbling on.
const SCRIBBLE_VARIABLE: &CStr = c"ALLOCATOR_SCRIBBLE";

/// Byte written over fresh payloads when scribbling, so reads of memory that
/// was never initialized stand out.
const SCRIBBLE_BYTE: u8 = 0xAA;

/// The free-space manager. One global list encodes the set of mapped regions,
/// the placement of blocks inside each region and the free tail of every
/// block; all five operations below are local edits on that list.
///
/// Splitting always carves from the chosen block's tail slack, never from
/// before the used prefix, so the region-empty check on deallocation is a
/// plain walk testing `usage == 0` on every header. Freed blocks keep their
/// capacity and can be claimed whole by a later request that fits; their
/// neighbors never grow (no coalescing), so fragmented space comes back only
/// when a whole region drains and is unmapped.
///
/// This struct is not thread safe and needs mutable borrows to operate.
/// [`crate::MapAllocator`] wraps it in a mutex; every method here assumes the
/// lock is held.
pub(crate) struct Heap {
    /// Global list, threaded through every header of every live region.
    blocks: BlockList,
    /// Allocations performed so far; doubles as the next fresh id.
    allocations: usize,
}

impl Heap {
    pub const fn new() -> Self {
        Self {
            blocks: BlockList::new(),
            allocations: 0,
        }
    }

    fn next_alloc_id(&mut self) -> usize {
        let id = self.allocations;
        self.allocations += 1;

        id
    }

    /// Allocates a block with room for at least `size` payload bytes and
    /// returns the payload address, or null if the kernel refuses to map a
    /// new region. A zero `size` is fine and produces the smallest legal
    /// block.
    ///
    /// # Safety
    ///
    /// Caller must hold the allocator lock.
    pub unsafe fn allocate(&mut self, size: usize) -> *mut u8 {
        let payload_size = align_up(size);
        let need = payload_size + BLOCK_HEADER_SIZE;

        let placed = match Placement::from_env() {
            Some(placement) => policy::find_candidate(&self.blocks, need, placement),
            None => None,
        };

        let chosen = match placed {
            Some(block) => block,
            None => match self.expand(need) {
                Some(region) => region,
                None => return ptr::null_mut(),
            },
        };

        // Post-condition of the search, and of expansion by construction.
        debug_assert!(chosen.as_ref().tail_slack() >= need);

        let block = if chosen.as_ref().is_free() {
            // Claim the free block whole. Its capacity stays put, so whatever
            // the request doesn't use remains as tail slack for later splits.
            let mut chosen = chosen;
            let header = chosen.as_mut();
            header.usage = need;
            header.name = [0; NAME_CAPACITY];
            chosen
        } else {
            self.split(chosen, need)
        };

        let payload = BlockHeader::payload_address_of(block);

        if scribble_requested() {
            payload.as_ptr().write_bytes(SCRIBBLE_BYTE, payload_size);
        }

        payload.as_ptr()
    }

    /// Same as [`Heap::allocate`], then stamps `name` on the block.
    ///
    /// # Safety
    ///
    /// Caller must hold the allocator lock.
    pub unsafe fn allocate_named(&mut self, size: usize, name: &str) -> *mut u8 {
        let address = self.allocate(size);

        if let Some(payload) = NonNull::new(address) {
            BlockHeader::from_payload(payload).as_mut().set_name(name);
        }

        address
    }

    /// Allocates room for `count` elements of `size` bytes each and zero
    /// fills all of it. Zeroing happens last, so it wins over scribbling.
    ///
    /// # Safety
    ///
    /// Caller must hold the allocator lock.
    pub unsafe fn allocate_zeroed(&mut self, count: usize, size: usize) -> *mut u8 {
        let Some(total) = count.checked_mul(size) else {
            return ptr::null_mut();
        };

        let address = self.allocate(total);
        if !address.is_null() {
            address.write_bytes(0, total);
        }

        address
    }

    /// Resizes the allocation at `address` to `size` payload bytes. Grows or
    /// shrinks in place whenever the block's own capacity permits, otherwise
    /// moves the contents to a fresh block and frees the old one. A null
    /// `address` degenerates to allocation, a zero `size` to deallocation.
    /// When the move fails the original block is left untouched and null is
    /// returned.
    ///
    /// # Safety
    ///
    /// Caller must hold the allocator lock, and `address` must be null or a
    /// payload pointer previously returned by this heap.
    pub unsafe fn reallocate(&mut self, address: *mut u8, size: usize) -> *mut u8 {
        if address.is_null() {
            return self.allocate(size);
        }

        if size == 0 {
            self.deallocate(address);
            return ptr::null_mut();
        }

        let new_payload = align_up(size);
        let need = new_payload + BLOCK_HEADER_SIZE;

        let mut block = BlockHeader::from_payload(NonNull::new_unchecked(address));
        if block.as_ref().size >= need {
            block.as_mut().usage = need;
            return address;
        }

        let old_payload = block.as_ref().payload_size();
        let moved = self.allocate(size);
        if moved.is_null() {
            return ptr::null_mut();
        }

        ptr::copy_nonoverlapping(address, moved, cmp::min(old_payload, new_payload));
        self.deallocate(address);

        moved
    }

    /// Marks the block at `address` free. If that leaves its whole region
    /// without a single live block, the region is unmapped and the global
    /// list stitched past it. Null is a no-op.
    ///
    /// # Safety
    ///
    /// Caller must hold the allocator lock, and `address` must be null or a
    /// payload pointer previously returned by this heap.
    pub unsafe fn deallocate(&mut self, address: *mut u8) {
        let Some(payload) = NonNull::new(address) else {
            return;
        };

        let mut block = BlockHeader::from_payload(payload);
        block.as_mut().usage = 0;

        let region = block.as_ref().region_start;
        let region_size = region.as_ref().region_size;

        // Walk the region's chain. Any live block keeps the region mapped.
        let mut current = Some(region);
        while let Some(header) = current {
            if !region::region_contains(region, header) {
                break;
            }
            if header.as_ref().usage != 0 {
                return;
            }
            current = header.as_ref().next;
        }

        // Every block is free. Unlink first: once the pages are gone the
        // region's headers can't be read anymore.
        let after = current;
        self.blocks.stitch_past_region(region, after);
        platform::return_memory(region.cast(), region_size);
    }

    /// Writes the textual dump of the global list to `stream`.
    ///
    /// # Safety
    ///
    /// Caller must hold the allocator lock.
    pub unsafe fn write_state<W: Write>(&self, stream: &mut W) -> io::Result<()> {
        dump::write_memory(&self.blocks, stream)
    }

    /// Maps a fresh region big enough for one block of `need` bytes and links
    /// it at the end of the global list. The region starts out as a single
    /// free header covering the entire mapping.
    unsafe fn expand(&mut self, need: usize) -> Pointer<BlockHeader> {
        let length = region::determine_region_length(need);
        let address = platform::request_memory(length)?;

        let region = address.cast::<BlockHeader>();
        region.as_ptr().write(BlockHeader {
            alloc_id: self.next_alloc_id(),
            name: [0; NAME_CAPACITY],
            size: length,
            usage: 0,
            region_start: region,
            region_size: length,
            next: None,
        });

        self.blocks.push_back(region);

        Some(region)
    }

    /// Carves a new block out of `chosen`'s tail slack. The new header lands
    /// right past the used prefix and inherits the rest of the capacity:
    ///
    /// **Before**:
    ///
    /// ```text
    ///          +-->  +------------+
    ///          |     |   Header   |  usage = U, size = S
    /// chosen   |     +------------+
    ///          |     |  Payload   |  U bytes in use
    ///          |     +------------+
    ///          |     | Tail slack |  S - U free bytes
    ///          +-->  +------------+
    /// ```
    ///
    /// **After**:
    ///
    /// ```text
    ///          +-->  +------------+
    /// chosen   |     |   Header   |  usage = U, size = U
    ///          +-->  +------------+
    ///          +-->  +------------+
    /// new      |     |   Header   |  usage = need, size = S - U
    /// block    |     +------------+
    ///          |     |  Payload   |
    ///          +-->  +------------+
    /// ```
    unsafe fn split(&mut self, mut chosen: NonNull<BlockHeader>, need: usize) -> NonNull<BlockHeader> {
        let address = chosen
            .as_ptr()
            .cast::<u8>()
            .add(chosen.as_ref().usage)
            .cast::<BlockHeader>();

        address.write(BlockHeader {
            alloc_id: self.next_alloc_id(),
            name: [0; NAME_CAPACITY],
            size: chosen.as_ref().size - chosen.as_ref().usage,
            usage: need,
            region_start: chosen.as_ref().region_start,
            region_size: chosen.as_ref().region_size,
            next: chosen.as_ref().next,
        });

        let block = NonNull::new_unchecked(address);

        // The used prefix keeps its bytes; its capacity shrinks to exactly
        // what it uses.
        let header = chosen.as_mut();
        header.size = header.usage;
        header.next = Some(block);

        block
    }
}

/// Whether `ALLOCATOR_SCRIBBLE` is set to exactly `1`. Like the placement
/// variable, this is re-read on every allocation.
fn scribble_requested() -> bool {
    let mut value = [0; ENV_VALUE_CAPACITY];

    matches!(
        platform::env_setting(SCRIBBLE_VARIABLE, &mut value),
        Some(b"1")
    )
}

#[cfg(test)]
impl Heap {
    pub(crate) fn block_list(&self) -> &BlockList {
        &self.blocks
    }

    pub(crate) unsafe fn num_regions(&self) -> usize {
        let mut count = 0;
        for block in self.blocks.iter() {
            if block.as_ref().is_region_start() {
                count += 1;
            }
        }

        count
    }

    pub(crate) unsafe fn num_blocks(&self) -> usize {
        self.blocks.iter().count()
    }

    /// Verifies the byte accounting of every region: blocks stay inside their
    /// region's bounds, usage never exceeds capacity, and the capacities of a
    /// region's blocks add up to exactly the region's length.
    pub(crate) unsafe fn check_region_accounting(&self) {
        use std::collections::HashMap;

        let mut totals: HashMap<usize, usize> = HashMap::new();
        let mut lengths: HashMap<usize, usize> = HashMap::new();

        for block in self.blocks.iter() {
            let header = block.as_ref();
            let region = header.region_start;

            assert!(region::region_contains(region, block));
            let end = block.as_ptr().cast::<u8>().cast_const().add(header.size);
            assert!(end <= region::region_end(region));
            assert!(header.usage <= header.size);

            *totals.entry(region.as_ptr() as usize).or_insert(0) += header.size;
            lengths.insert(region.as_ptr() as usize, header.region_size);
        }

        for (region, total) in totals {
            assert_eq!(total, lengths[&region]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    unsafe fn header_of(payload: *mut u8) -> NonNull<BlockHeader> {
        BlockHeader::from_payload(NonNull::new(payload).unwrap())
    }

    #[test]
    fn single_allocation_maps_and_drains_a_region() {
        let _guard = testing::clean_env();
        let mut heap = Heap::new();

        unsafe {
            let payload = heap.allocate(5);
            assert!(!payload.is_null());
            assert_eq!(payload as usize % 8, 0);

            assert_eq!(heap.num_regions(), 1);
            assert_eq!(heap.num_blocks(), 1);

            let header = header_of(payload);
            assert_eq!(header.as_ref().usage, BLOCK_HEADER_SIZE + 8);
            assert_eq!(header.as_ref().size, crate::platform::page_size());
            assert!(header.as_ref().is_region_start());
            heap.check_region_accounting();

            heap.deallocate(payload);
            assert_eq!(heap.num_regions(), 0);
            assert_eq!(heap.num_blocks(), 0);
        }
    }

    #[test]
    fn zero_size_requests_get_the_minimum_block() {
        let _guard = testing::clean_env();
        let mut heap = Heap::new();

        unsafe {
            let payload = heap.allocate(0);
            assert!(!payload.is_null());

            let header = header_of(payload);
            assert_eq!(header.as_ref().usage, BLOCK_HEADER_SIZE);
            assert_eq!(header.as_ref().payload_size(), 0);

            heap.deallocate(payload);
            assert_eq!(heap.num_regions(), 0);
        }
    }

    #[test]
    fn splitting_keeps_the_region_accounted() {
        let _guard = testing::clean_env();
        let mut heap = Heap::new();

        unsafe {
            let first = heap.allocate(16);
            let second = heap.allocate(16);

            // Same region, split into two blocks.
            assert_eq!(heap.num_regions(), 1);
            assert_eq!(heap.num_blocks(), 2);
            assert_eq!(
                header_of(second).as_ref().region_start,
                header_of(first).as_ref().region_start,
            );

            // The first block's capacity shrank to exactly its usage.
            assert_eq!(header_of(first).as_ref().size, BLOCK_HEADER_SIZE + 16);
            assert_eq!(header_of(first).as_ref().tail_slack(), 0);
            heap.check_region_accounting();

            // Payloads of live blocks never overlap.
            let distance = second as usize - first as usize;
            assert!(distance >= BLOCK_HEADER_SIZE + 16);

            // Freeing one block keeps the region mapped.
            heap.deallocate(first);
            assert_eq!(heap.num_regions(), 1);
            assert!(header_of(first).as_ref().is_free());
            heap.check_region_accounting();

            // Draining the region unmaps it.
            heap.deallocate(second);
            assert_eq!(heap.num_regions(), 0);
        }
    }

    #[test]
    fn freed_blocks_are_reclaimed_by_fitting_requests() {
        let _guard = testing::clean_env();
        let mut heap = Heap::new();

        unsafe {
            let first = heap.allocate(16);
            let second = heap.allocate(16);

            heap.deallocate(first);

            // Default first fit: the freed slot fits the request exactly, so
            // it's handed out again instead of splitting the tail.
            let reused = heap.allocate(16);
            assert_eq!(reused, first);
            assert_eq!(heap.num_blocks(), 2);

            // A request the freed slot can't hold skips it.
            heap.deallocate(reused);
            let bigger = heap.allocate(64);
            assert_ne!(bigger, first);

            heap.deallocate(bigger);
            heap.deallocate(second);
            assert_eq!(heap.num_regions(), 0);
        }
    }

    #[test]
    fn alloc_ids_strictly_increase() {
        let _guard = testing::clean_env();
        let mut heap = Heap::new();

        unsafe {
            let payloads = [heap.allocate(16), heap.allocate(16), heap.allocate(16)];

            let mut ids = Vec::new();
            for payload in payloads {
                ids.push(header_of(payload).as_ref().alloc_id);
            }
            assert!(ids[0] < ids[1] && ids[1] < ids[2]);

            for payload in payloads {
                heap.deallocate(payload);
            }
            assert_eq!(heap.num_regions(), 0);
        }
    }

    #[test]
    fn page_sized_boundaries() {
        let _guard = testing::clean_env();
        let mut heap = Heap::new();
        let page_size = crate::platform::page_size();

        unsafe {
            // Exactly one page including the header: single region, no slack.
            let exact = heap.allocate(page_size - BLOCK_HEADER_SIZE);
            let header = header_of(exact);
            assert_eq!(header.as_ref().region_size, page_size);
            assert_eq!(header.as_ref().usage, page_size);
            assert_eq!(header.as_ref().tail_slack(), 0);
            assert_eq!(heap.num_blocks(), 1);

            // One byte past a page worth of payload: two pages get mapped.
            let large = heap.allocate(page_size);
            assert_eq!(header_of(large).as_ref().region_size, 2 * page_size);
            assert_eq!(heap.num_regions(), 2);
            heap.check_region_accounting();

            heap.deallocate(exact);
            heap.deallocate(large);
            assert_eq!(heap.num_regions(), 0);
        }
    }

    #[test]
    fn draining_a_middle_region_stitches_the_list() {
        let _guard = testing::clean_env();
        let mut heap = Heap::new();
        let page_size = crate::platform::page_size();

        unsafe {
            // Three dedicated regions: each request is too big for the slack
            // any earlier region has left.
            let big = page_size - BLOCK_HEADER_SIZE;
            let first = heap.allocate(big);
            let second = heap.allocate(big);
            let third = heap.allocate(big);
            assert_eq!(heap.num_regions(), 3);

            heap.deallocate(second);
            assert_eq!(heap.num_regions(), 2);
            heap.check_region_accounting();

            // The survivors are still reachable in order.
            let regions: Vec<_> = heap
                .blocks
                .iter()
                .map(|block| block.as_ptr() as usize)
                .collect();
            assert_eq!(
                regions,
                vec![
                    header_of(first).as_ptr() as usize,
                    header_of(third).as_ptr() as usize,
                ]
            );

            heap.deallocate(first);
            heap.deallocate(third);
            assert_eq!(heap.num_regions(), 0);
        }
    }

    #[test]
    fn named_allocations_stamp_and_clear_names() {
        let _guard = testing::clean_env();
        let mut heap = Heap::new();

        unsafe {
            let named = heap.allocate_named(16, "sensor-buffer");
            assert_eq!(header_of(named).as_ref().name(), b"sensor-buffer");

            let unnamed = heap.allocate(16);
            assert_eq!(header_of(unnamed).as_ref().name(), b"");

            // Recycling a freed named block must not leak the old label.
            heap.deallocate(named);
            let recycled = heap.allocate(16);
            assert_eq!(recycled, named);
            assert_eq!(header_of(recycled).as_ref().name(), b"");

            heap.deallocate(recycled);
            heap.deallocate(unnamed);
            assert_eq!(heap.num_regions(), 0);
        }
    }

    #[test]
    fn zeroed_allocations_override_scribble() {
        let _guard = testing::env_lock();
        std::env::remove_var("ALLOCATOR_ALGORITHM");
        std::env::set_var("ALLOCATOR_SCRIBBLE", "1");

        let mut heap = Heap::new();

        unsafe {
            let scribbled = heap.allocate(32);
            for offset in 0..32 {
                assert_eq!(*scribbled.add(offset), SCRIBBLE_BYTE);
            }

            let zeroed = heap.allocate_zeroed(4, 8);
            for offset in 0..32 {
                assert_eq!(*zeroed.add(offset), 0);
            }

            assert!(heap.allocate_zeroed(usize::MAX, 2).is_null());

            heap.deallocate(scribbled);
            heap.deallocate(zeroed);
            assert_eq!(heap.num_regions(), 0);
        }

        std::env::remove_var("ALLOCATOR_SCRIBBLE");
    }

    #[test]
    fn reallocation_in_place_and_by_moving() {
        let _guard = testing::clean_env();
        let mut heap = Heap::new();
        let page_size = crate::platform::page_size();

        unsafe {
            // Null pointer degenerates to allocation.
            let payload = heap.reallocate(ptr::null_mut(), 8);
            assert!(!payload.is_null());
            payload.write_bytes(0x42, 8);

            // The lone block owns the whole region, so growing fits in place.
            let grown = heap.reallocate(payload, 16);
            assert_eq!(grown, payload);
            assert_eq!(header_of(grown).as_ref().usage, BLOCK_HEADER_SIZE + 16);
            for offset in 0..8 {
                assert_eq!(*grown.add(offset), 0x42);
            }

            // Shrinking in place only drops the usage.
            let shrunk = heap.reallocate(grown, 8);
            assert_eq!(shrunk, grown);
            assert_eq!(header_of(shrunk).as_ref().usage, BLOCK_HEADER_SIZE + 8);
            heap.check_region_accounting();

            // Zero size frees the block.
            assert!(heap.reallocate(shrunk, 0).is_null());
            assert_eq!(heap.num_regions(), 0);

            // Moving realloc: cap a block's capacity by splitting behind it,
            // then grow past that capacity.
            let first = heap.allocate(page_size / 2);
            let second = heap.allocate(16);
            let capacity = header_of(second).as_ref().size;
            second.write_bytes(0x37, 16);

            let moved = heap.reallocate(second, capacity);
            assert_ne!(moved, second);
            for offset in 0..16 {
                assert_eq!(*moved.add(offset), 0x37);
            }

            // The old block was freed by the move.
            assert!(header_of(second).as_ref().is_free());
            heap.check_region_accounting();

            heap.deallocate(moved);
            heap.deallocate(first);
            assert_eq!(heap.num_regions(), 0);
        }
    }

    #[test]
    fn placement_variable_steers_allocation() {
        let _guard = testing::env_lock();
        std::env::remove_var("ALLOCATOR_ALGORITHM");
        std::env::remove_var("ALLOCATOR_SCRIBBLE");

        let mut heap = Heap::new();
        let page_size = crate::platform::page_size();

        unsafe {
            // Three regions with tail slacks 256, 128 and 512.
            let a = heap.allocate(page_size - 256 - BLOCK_HEADER_SIZE);
            let b = heap.allocate(page_size - 128 - BLOCK_HEADER_SIZE);
            let c = heap.allocate(page_size - 512 - BLOCK_HEADER_SIZE);
            assert_eq!(heap.num_regions(), 3);

            std::env::set_var("ALLOCATOR_ALGORITHM", "best_fit");
            let placed = heap.allocate(16);
            assert_eq!(
                header_of(placed).as_ref().region_start,
                header_of(b).as_ref().region_start,
            );
            heap.deallocate(placed);

            std::env::set_var("ALLOCATOR_ALGORITHM", "worst_fit");
            let placed = heap.allocate(16);
            assert_eq!(
                header_of(placed).as_ref().region_start,
                header_of(c).as_ref().region_start,
            );
            heap.deallocate(placed);

            // Unrecognized strategy: placement fails, a fresh region appears.
            std::env::set_var("ALLOCATOR_ALGORITHM", "next_fit");
            let placed = heap.allocate(16);
            assert_eq!(heap.num_regions(), 4);
            assert!(header_of(placed).as_ref().is_region_start());
            heap.deallocate(placed);
            assert_eq!(heap.num_regions(), 3);

            std::env::remove_var("ALLOCATOR_ALGORITHM");
            for payload in [a, b, c] {
                heap.deallocate(payload);
            }
            assert_eq!(heap.num_regions(), 0);
        }
    }

    #[test]
    fn accounting_survives_a_busy_sequence() {
        let _guard = testing::clean_env();
        let mut heap = Heap::new();

        unsafe {
            let mut live = Vec::new();

            for round in 0..8 {
                for size in [0, 8, 24, 120, 512, 2048] {
                    live.push(heap.allocate(size + round));
                }
                heap.check_region_accounting();

                // Free every other block to fragment the regions.
                let mut survivors = Vec::new();
                for (index, payload) in live.drain(..).enumerate() {
                    if index % 2 == 0 {
                        survivors.push(payload);
                    } else {
                        heap.deallocate(payload);
                    }
                }
                live = survivors;
                heap.check_region_accounting();
            }

            for payload in live {
                heap.deallocate(payload);
            }
            assert_eq!(heap.num_regions(), 0);
            assert_eq!(heap.num_blocks(), 0);
        }
    }
}
