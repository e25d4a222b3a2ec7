use std::ptr::NonNull;

use crate::header::BlockHeader;
use crate::platform;

/// A region is not an independent entity: it's the contiguous run of headers
/// whose `region_start` all point at the run's first header. This module only
/// holds the arithmetic around those runs.

/// Length in bytes to request from the kernel for a region that must absorb
/// one block of `need` header-inclusive bytes: whole pages, rounded up. If we
/// want to store 4104 bytes and the page size is 4096 bytes, we'll request a
/// region that's 2 pages in length (8192 bytes).
pub(crate) fn determine_region_length(need: usize) -> usize {
    let page_size = platform::page_size();

    page_size * ((need + page_size - 1) / page_size)
}

/// One past the last byte of the region starting at `region`.
///
/// # Safety
///
/// `region` must be the live first header of a region.
pub(crate) unsafe fn region_end(region: NonNull<BlockHeader>) -> *const u8 {
    region
        .as_ptr()
        .cast::<u8>()
        .cast_const()
        .add(region.as_ref().region_size)
}

/// Whether `header` lies inside the region starting at `region`. Headers of
/// other regions compare outside even when their mapping happens to sit at a
/// lower address.
///
/// # Safety
///
/// `region` must be the live first header of a region.
pub(crate) unsafe fn region_contains(
    region: NonNull<BlockHeader>,
    header: NonNull<BlockHeader>,
) -> bool {
    let address = header.as_ptr().cast::<u8>().cast_const();

    address >= region.as_ptr().cast::<u8>().cast_const() && address < region_end(region)
}
