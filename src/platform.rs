use std::ffi::CStr;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::Pointer;

/// Largest environment value the allocator ever needs to distinguish. The
/// longest recognized token is `worst_fit`; anything that gets truncated at
/// this length couldn't have matched a known value anyway.
pub(crate) const ENV_VALUE_CAPACITY: usize = 16;

/// Abstraction for platform specific services. The allocator only needs to
/// request pages of memory, return them once a region drains, and read the
/// couple of environment variables that tune its behavior. It doesn't care
/// about the APIs offered by the underlying kernel or libraries.
trait PlatformSpecificServices {
    /// Requests a memory region from the kernel where `length` bytes can be
    /// written safely. Returns `None` after reporting the OS error on the
    /// diagnostic stream if the kernel refuses.
    unsafe fn request_memory(length: usize) -> Pointer<u8>;

    /// Returns `length` bytes starting at `address` to the kernel. A refusal
    /// is reported on the diagnostic stream and otherwise ignored.
    unsafe fn return_memory(address: NonNull<u8>, length: usize);

    /// Virtual memory page size in bytes.
    unsafe fn page_size() -> usize;

    /// Copies the value of the environment variable `name` into `buffer`,
    /// truncating if needed, and returns how many bytes were copied. `None`
    /// means the variable is not set. This deliberately avoids `std::env`,
    /// which allocates through the global allocator, and that might be us.
    unsafe fn env_setting(name: &CStr, buffer: &mut [u8]) -> Option<usize>;
}

/// Zero sized type that implements [`PlatformSpecificServices`] for each OS.
struct Platform;

/// Virtual memory page size. 4096 bytes on most computers. This should be a
/// constant but we don't know the value at compile time.
static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

/// We only know the page size at runtime by calling into the platform, so
/// we'll do that once and reuse the cached value afterwards.
#[inline]
pub(crate) fn page_size() -> usize {
    let mut size = PAGE_SIZE.load(Ordering::Relaxed);
    if size == 0 {
        size = unsafe { Platform::page_size() };
        PAGE_SIZE.store(size, Ordering::Relaxed);
    }

    size
}

/// Convenience wrapper for [`PlatformSpecificServices::request_memory`].
#[inline]
pub(crate) unsafe fn request_memory(length: usize) -> Pointer<u8> {
    Platform::request_memory(length)
}

/// Convenience wrapper for [`PlatformSpecificServices::return_memory`].
#[inline]
pub(crate) unsafe fn return_memory(address: NonNull<u8>, length: usize) {
    Platform::return_memory(address, length)
}

/// Convenience wrapper for [`PlatformSpecificServices::env_setting`].
#[inline]
pub(crate) fn env_setting<'b>(name: &CStr, buffer: &'b mut [u8]) -> Option<&'b [u8]> {
    let length = unsafe { Platform::env_setting(name, buffer) }?;
    Some(&buffer[..length])
}

#[cfg(unix)]
#[cfg(not(miri))]
mod unix {
    use std::cmp;
    use std::ffi::CStr;
    use std::ptr::{self, NonNull};

    use super::{Platform, PlatformSpecificServices};
    use crate::dump;
    use crate::Pointer;

    impl PlatformSpecificServices for Platform {
        unsafe fn request_memory(length: usize) -> Pointer<u8> {
            // Read-write pages, private to this process and not mapped to any
            // file or device.
            let protection = libc::PROT_READ | libc::PROT_WRITE;
            let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;

            // For all the configuration options that `mmap` accepts see
            // https://man7.org/linux/man-pages/man2/mmap.2.html
            match libc::mmap(ptr::null_mut(), length, protection, flags, -1, 0) {
                libc::MAP_FAILED => {
                    dump::report_os_error("mmap");
                    None
                }
                address => Some(NonNull::new_unchecked(address).cast()),
            }
        }

        unsafe fn return_memory(address: NonNull<u8>, length: usize) {
            if libc::munmap(address.cast().as_ptr(), length) != 0 {
                // The pages are still mapped at this point, but every header
                // in them has already been unlinked. Diagnostic only.
                dump::report_os_error("munmap");
            }
        }

        unsafe fn page_size() -> usize {
            libc::sysconf(libc::_SC_PAGE_SIZE) as usize
        }

        unsafe fn env_setting(name: &CStr, buffer: &mut [u8]) -> Option<usize> {
            let value = libc::getenv(name.as_ptr());
            if value.is_null() {
                return None;
            }

            let bytes = CStr::from_ptr(value).to_bytes();
            let length = cmp::min(bytes.len(), buffer.len());
            buffer[..length].copy_from_slice(&bytes[..length]);

            Some(length)
        }
    }
}

#[cfg(windows)]
#[cfg(not(miri))]
mod windows {
    use std::ffi::CStr;
    use std::mem::MaybeUninit;
    use std::ptr::NonNull;

    use windows::core::PCSTR;
    use windows::Win32::System::{Environment, Memory, SystemInformation};

    use super::{Platform, PlatformSpecificServices};
    use crate::dump;
    use crate::Pointer;

    impl PlatformSpecificServices for Platform {
        unsafe fn request_memory(length: usize) -> Pointer<u8> {
            // Similar to mmap on Linux, read-write only. Memory has to be
            // reserved first and then committed in order to become usable;
            // both happen in one call here.
            let protection = Memory::PAGE_READWRITE;
            let flags = Memory::MEM_RESERVE | Memory::MEM_COMMIT;

            // For detailed explanations of each parameter, see
            // https://learn.microsoft.com/en-us/windows/win32/api/memoryapi/nf-memoryapi-virtualalloc#parameters
            let address = Memory::VirtualAlloc(None, length, flags, protection);

            if address.is_null() {
                dump::report_os_error("VirtualAlloc");
            }

            NonNull::new(address.cast())
        }

        unsafe fn return_memory(address: NonNull<u8>, _length: usize) {
            // Decommitting can be skipped by passing a length of 0 together
            // with the MEM_RELEASE flag. See the docs for details:
            // https://learn.microsoft.com/en-us/windows/win32/api/memoryapi/nf-memoryapi-virtualfree#parameters
            let address = address.cast().as_ptr();

            if !Memory::VirtualFree(address, 0, Memory::MEM_RELEASE).as_bool() {
                dump::report_os_error("VirtualFree");
            }
        }

        unsafe fn page_size() -> usize {
            let mut system_info = MaybeUninit::uninit();
            SystemInformation::GetSystemInfo(system_info.as_mut_ptr());

            system_info.assume_init().dwPageSize as usize
        }

        unsafe fn env_setting(name: &CStr, buffer: &mut [u8]) -> Option<usize> {
            let capacity = buffer.len();
            let name = PCSTR::from_raw(name.as_ptr().cast());
            let length = Environment::GetEnvironmentVariableA(name, Some(buffer)) as usize;

            // 0 means the variable is not set; larger than the buffer means
            // the API truncated, which can't equal any recognized value.
            if length == 0 || length > capacity {
                return None;
            }

            Some(length)
        }
    }
}

#[cfg(miri)]
mod miri {
    //! When using Miri we can't rely on system calls such as `mmap` because
    //! there's no FFI support, so instead we use the global allocator to mock
    //! low level memory management. This is also useful for detecting memory
    //! leaks in our own allocator (regions that are never returned back to
    //! the kernel).

    use std::alloc;
    use std::ffi::CStr;
    use std::ptr::NonNull;

    use super::{page_size, Platform, PlatformSpecificServices};
    use crate::Pointer;

    fn to_layout(length: usize) -> alloc::Layout {
        alloc::Layout::from_size_align(length, page_size()).unwrap()
    }

    impl PlatformSpecificServices for Platform {
        unsafe fn request_memory(length: usize) -> Pointer<u8> {
            NonNull::new(alloc::alloc(to_layout(length)))
        }

        unsafe fn return_memory(address: NonNull<u8>, length: usize) {
            alloc::dealloc(address.as_ptr(), to_layout(length));
        }

        unsafe fn page_size() -> usize {
            4096
        }

        unsafe fn env_setting(name: &CStr, buffer: &mut [u8]) -> Option<usize> {
            let value = std::env::var(name.to_str().ok()?).ok()?;
            let bytes = value.as_bytes();
            let length = bytes.len().min(buffer.len());
            buffer[..length].copy_from_slice(&bytes[..length]);

            Some(length)
        }
    }
}
