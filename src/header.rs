use std::mem;
use std::ptr::NonNull;

use crate::Pointer;

/// Payload alignment guarantee. Headers only ever land on addresses that are
/// multiples of this and every size in the allocator is rounded up to it, so
/// the byte right after any header is always suitably aligned.
pub(crate) const ALIGNMENT: usize = 8;

/// Capacity of the fixed name field, terminator included.
pub(crate) const NAME_CAPACITY: usize = 32;

/// Block header size in bytes. See [`BlockHeader`].
pub(crate) const BLOCK_HEADER_SIZE: usize = mem::size_of::<BlockHeader>();

/// Rounds `size` up to the next multiple of [`ALIGNMENT`].
#[inline]
pub(crate) fn align_up(size: usize) -> usize {
    (size + ALIGNMENT - 1) & !(ALIGNMENT - 1)
}

/// The record placed at offset 0 of every block. One struct plays three roles
/// at once: it is the node of the global list, the descriptor of its own block
/// and, when it sits at the very start of a mapping, the descriptor of the
/// whole region. Here's how a block looks like in memory:
///
/// ```text
/// +--------------------------+  <- 8-aligned address
/// | alloc_id                 |
/// | name                     |
/// | size                     |
/// | usage                    |
/// | region_start             |
/// | region_size              |
/// | next                     |
/// +--------------------------+
/// |         Payload          |  <- this is where the user writes stuff,
/// |           ...            |     `usage - BLOCK_HEADER_SIZE` bytes of it.
/// +--------------------------+
/// |        Tail slack        |  <- `size - usage` bytes available for
/// |           ...            |     carving out the next block.
/// +--------------------------+
/// ```
///
/// A block is free exactly when `usage == 0`. The first header of a region is
/// recognizable by pointing at itself through `region_start`; there is no
/// separate region type.
pub(crate) struct BlockHeader {
    /// Monotonic id handed out when the header is created. Never reused.
    pub alloc_id: usize,
    /// NUL-terminated label, empty while the block is unnamed.
    pub name: [u8; NAME_CAPACITY],
    /// Total bytes this block occupies, its own header included.
    pub size: usize,
    /// Bytes currently in use within the block, header included. 0 = free.
    pub usage: usize,
    /// Header at offset 0 of the region containing this block.
    pub region_start: NonNull<BlockHeader>,
    /// Total bytes of the containing region. Identical for every block that
    /// shares a `region_start`.
    pub region_size: usize,
    /// Next header in global order, within this region or at the start of a
    /// later one.
    pub next: Pointer<BlockHeader>,
}

impl BlockHeader {
    /// Returns the header that sits right before `address`.
    ///
    /// ```text
    /// +--------------+
    /// | BlockHeader  | <- Returned pointer points here.
    /// +--------------+
    /// |   Payload    | <- Given address should point here.
    /// +--------------+
    /// ```
    ///
    /// # Safety
    ///
    /// Caller must guarantee that `address` points exactly to the first byte
    /// after a live [`BlockHeader`]. Users hand us back addresses we returned
    /// from allocation, so as long as that's true this is fine, otherwise
    /// it's undefined behaviour. No validation is performed.
    #[inline]
    pub unsafe fn from_payload(address: NonNull<u8>) -> NonNull<Self> {
        NonNull::new_unchecked(address.as_ptr().cast::<Self>().offset(-1))
    }

    /// Returns the address right after the given header, which is where its
    /// payload starts.
    ///
    /// # Safety
    ///
    /// `header` must point to a live [`BlockHeader`]. We use the associated
    /// function form instead of a method to avoid going through intermediary
    /// `&self` references, which would narrow provenance and upset Miri.
    #[inline]
    pub unsafe fn payload_address_of(header: NonNull<Self>) -> NonNull<u8> {
        NonNull::new_unchecked(header.as_ptr().offset(1)).cast()
    }

    /// Free bytes at the end of this block, available for splitting.
    #[inline]
    pub fn tail_slack(&self) -> usize {
        self.size - self.usage
    }

    #[inline]
    pub fn is_free(&self) -> bool {
        self.usage == 0
    }

    /// Whether this header is the first header of its region.
    #[inline]
    pub fn is_region_start(&self) -> bool {
        std::ptr::eq(self.region_start.as_ptr().cast_const(), self)
    }

    /// Bytes the user can actually touch: everything in use minus our own
    /// header, or nothing at all while the block is free.
    #[inline]
    pub fn payload_size(&self) -> usize {
        if self.usage == 0 {
            0
        } else {
            self.usage - BLOCK_HEADER_SIZE
        }
    }

    /// Stores `name` in the fixed-capacity field, truncating if needed. The
    /// field always ends up NUL-terminated and old bytes never survive.
    pub fn set_name(&mut self, name: &str) {
        let bytes = name.as_bytes();
        let length = bytes.len().min(NAME_CAPACITY - 1);

        self.name[..length].copy_from_slice(&bytes[..length]);
        self.name[length..].fill(0);
    }

    /// The stored name, up to its terminator.
    pub fn name(&self) -> &[u8] {
        let terminator = self
            .name
            .iter()
            .position(|&byte| byte == 0)
            .unwrap_or(NAME_CAPACITY);

        &self.name[..terminator]
    }
}

#[cfg(test)]
impl BlockHeader {
    /// Heap-backed header posing as its own single-block region, for tests
    /// that need headers outside any real mapping. Release it with
    /// [`Box::from_raw`] when done.
    pub(crate) fn detached(size: usize) -> NonNull<Self> {
        let header = Box::leak(Box::new(BlockHeader {
            alloc_id: 0,
            name: [0; NAME_CAPACITY],
            size,
            usage: 0,
            region_start: NonNull::dangling(),
            region_size: size,
            next: None,
        }));

        let mut header = NonNull::from(header);
        unsafe { header.as_mut().region_start = header };

        header
    }
}
