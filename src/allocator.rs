use std::alloc::{GlobalAlloc, Layout};
use std::io::{self, Write};
use std::ptr;
use std::sync::Mutex;

use crate::header::ALIGNMENT;
use crate::heap::Heap;

/// General purpose allocator. All memory comes straight from the operating
/// system's anonymous page mapper and is handed back a whole region at a time
/// as soon as every block in the region is free. See the crate docs for the
/// overall picture.
///
/// # Examples
///
/// ## Standalone allocator
///
/// ```rust
/// use mapalloc::MapAllocator;
///
/// let allocator = MapAllocator::new();
///
/// let address = allocator.allocate(64);
/// assert!(!address.is_null());
/// // Payloads are always 8-aligned.
/// assert_eq!(address as usize % 8, 0);
///
/// unsafe {
///     address.write_bytes(0x42, 64);
///     assert_eq!(*address, 0x42);
///     allocator.release(address);
/// }
/// ```
///
/// ## Global allocator
///
/// ```no_run
/// use mapalloc::MapAllocator;
///
/// #[global_allocator]
/// static ALLOCATOR: MapAllocator = MapAllocator::new();
///
/// fn main() {
///     let data = vec![1, 2, 3];
///     assert_eq!(data.len(), 3);
/// }
/// ```
///
/// ## Inspecting the state
///
/// ```rust
/// use mapalloc::MapAllocator;
///
/// let allocator = MapAllocator::new();
/// let address = allocator.allocate_named(32, "scratch");
///
/// let mut output = Vec::new();
/// allocator.dump(&mut output).unwrap();
/// let text = String::from_utf8(output).unwrap();
///
/// assert!(text.contains("[REGION]"));
/// assert!(text.contains("'scratch'"));
/// # unsafe { allocator.release(address) };
/// ```
pub struct MapAllocator {
    /// A single process-wide lock guards every public entry. Allocation
    /// patterns that would benefit from finer locking (one lock per region,
    /// per-thread heaps) are deliberately out of scope.
    heap: Mutex<Heap>,
}

unsafe impl Sync for MapAllocator {}

impl MapAllocator {
    /// Builds a new allocator. No memory is mapped until the first request
    /// comes in, so this is fine in a `static`.
    pub const fn new() -> Self {
        Self {
            heap: Mutex::new(Heap::new()),
        }
    }

    /// Allocates `size` bytes and returns the payload address, or null if the
    /// kernel refuses to map more memory. A zero `size` still returns a
    /// valid, distinct allocation.
    pub fn allocate(&self, size: usize) -> *mut u8 {
        match self.heap.lock() {
            Ok(mut heap) => unsafe { heap.allocate(size) },
            Err(_) => ptr::null_mut(),
        }
    }

    /// Same as [`MapAllocator::allocate`], but also tags the block with
    /// `name`, truncated to the header's fixed capacity. The name shows up in
    /// [`MapAllocator::dump`] output.
    pub fn allocate_named(&self, size: usize, name: &str) -> *mut u8 {
        match self.heap.lock() {
            Ok(mut heap) => unsafe { heap.allocate_named(size, name) },
            Err(_) => ptr::null_mut(),
        }
    }

    /// Allocates room for `count` elements of `size` bytes each, zero filled.
    /// Returns null on overflow of `count * size` or mapping failure.
    pub fn allocate_zeroed(&self, count: usize, size: usize) -> *mut u8 {
        match self.heap.lock() {
            Ok(mut heap) => unsafe { heap.allocate_zeroed(count, size) },
            Err(_) => ptr::null_mut(),
        }
    }

    /// Resizes the allocation at `address` to `size` bytes, in place when the
    /// block's capacity allows it and by moving otherwise. Null `address`
    /// behaves like [`MapAllocator::allocate`], zero `size` like
    /// [`MapAllocator::release`] (returning null). If a move fails the
    /// original allocation stays valid and null is returned.
    ///
    /// # Safety
    ///
    /// `address` must be null or a payload pointer obtained from this
    /// allocator that hasn't been released yet. No validation is performed.
    pub unsafe fn reallocate(&self, address: *mut u8, size: usize) -> *mut u8 {
        match self.heap.lock() {
            Ok(mut heap) => heap.reallocate(address, size),
            Err(_) => ptr::null_mut(),
        }
    }

    /// Releases the allocation at `address`. Memory might not be returned to
    /// the OS right away: a region is only unmapped once every block in it is
    /// free. Null is a no-op.
    ///
    /// # Safety
    ///
    /// `address` must be null or a payload pointer obtained from this
    /// allocator that hasn't been released yet. No validation is performed.
    pub unsafe fn release(&self, address: *mut u8) {
        if let Ok(mut heap) = self.heap.lock() {
            heap.deallocate(address);
        }
    }

    /// Writes a line-oriented dump of every region and block, in list order,
    /// to `stream`. The formatting is done entirely with per-byte writers so
    /// this never allocates, no matter what `stream` does.
    pub fn dump<W: Write>(&self, stream: &mut W) -> io::Result<()> {
        match self.heap.lock() {
            Ok(heap) => unsafe { heap.write_state(stream) },
            Err(_) => Err(io::ErrorKind::Other.into()),
        }
    }
}

impl Default for MapAllocator {
    fn default() -> Self {
        MapAllocator::new()
    }
}

/// Payloads are 8-aligned and nothing stricter, so layouts demanding a larger
/// alignment are refused (null) rather than served misaligned memory.
unsafe impl GlobalAlloc for MapAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return ptr::null_mut();
        }

        self.allocate(layout.size())
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return ptr::null_mut();
        }

        self.allocate_zeroed(layout.size(), 1)
    }

    unsafe fn dealloc(&self, address: *mut u8, _layout: Layout) {
        self.release(address);
    }

    unsafe fn realloc(&self, address: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return ptr::null_mut();
        }

        self.reallocate(address, new_size)
    }
}
