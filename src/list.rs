use std::ptr::NonNull;

use crate::header::BlockHeader;
use crate::Pointer;

/// The global list. Singly linked, anchored at a head pointer and threaded
/// through every [`BlockHeader`] of every live region, in placement order:
/// blocks of the same region appear in increasing address order, regions in
/// the order they were mapped. Since it cannot do allocations (WE ARE THE
/// ALLOCATOR!) the nodes are the headers themselves; this struct only owns
/// the anchor.
pub(crate) struct BlockList {
    head: Pointer<BlockHeader>,
}

impl BlockList {
    pub const fn new() -> Self {
        Self { head: None }
    }

    /// Links a fully initialized header at the end of the list. The new tail
    /// is found by walking, there is no tail pointer to maintain.
    ///
    /// # Safety
    ///
    /// `block` must point to a live header whose `next` is already `None`,
    /// and every header currently linked must still be valid.
    pub unsafe fn push_back(&mut self, block: NonNull<BlockHeader>) {
        match self.head {
            None => self.head = Some(block),
            Some(head) => {
                let mut tail = head;
                while let Some(next) = tail.as_ref().next {
                    tail = next;
                }
                tail.as_mut().next = Some(block);
            }
        }
    }

    /// Iterates over every linked header in order.
    ///
    /// # Safety
    ///
    /// Every linked header must stay valid for as long as the iterator is
    /// used. Don't unmap regions while holding one.
    pub unsafe fn iter(&self) -> Blocks {
        Blocks { current: self.head }
    }

    /// Routes the list around an entire region: whoever pointed at the
    /// region's first header points at `after` from now on. Called right
    /// before the region's memory is returned to the kernel.
    ///
    /// # Safety
    ///
    /// `region` must be the first header of a region that is currently
    /// linked, and `after` the first header past that region (or `None`).
    pub unsafe fn stitch_past_region(
        &mut self,
        region: NonNull<BlockHeader>,
        after: Pointer<BlockHeader>,
    ) {
        if self.head == Some(region) {
            self.head = after;
            return;
        }

        let mut current = self.head;
        while let Some(mut block) = current {
            if block.as_ref().next == Some(region) {
                block.as_mut().next = after;
                return;
            }
            current = block.as_ref().next;
        }
    }
}

/// See [`BlockList::iter`].
pub(crate) struct Blocks {
    current: Pointer<BlockHeader>,
}

impl Iterator for Blocks {
    type Item = NonNull<BlockHeader>;

    fn next(&mut self) -> Option<Self::Item> {
        let block = self.current?;
        // SAFETY: BlockList::iter's contract, every linked header is live.
        self.current = unsafe { block.as_ref().next };

        Some(block)
    }
}
