//! State dump and the hand rolled formatters behind it.
//!
//! Nothing in this module may call back into the allocator: the host's
//! formatted-output machinery can allocate behind the scenes, which would
//! recurse into us when we're installed as the global allocator or deadlock
//! on the heap mutex. Everything here writes plain bytes, one small slice at
//! a time.

use std::io::{self, Write};

use crate::list::BlockList;

const HEX_DIGITS: &[u8; 16] = b"0123456789abcdef";

/// Writes `pointer` the way `%p` would: lowercase hex with a `0x` prefix,
/// leading zeros elided, `(nil)` for null.
pub(crate) fn write_pointer<W: Write>(stream: &mut W, pointer: *const u8) -> io::Result<()> {
    if pointer.is_null() {
        return stream.write_all(b"(nil)");
    }

    let address = pointer as usize;
    stream.write_all(b"0x")?;

    let mut printed = false;
    let mut shift = usize::BITS as i32 - 4;
    while shift >= 0 {
        let digit = (address >> shift) & 0xf;
        if digit != 0 || printed {
            printed = true;
            stream.write_all(&[HEX_DIGITS[digit]])?;
        }
        shift -= 4;
    }

    Ok(())
}

/// Writes `value` the way `%zu` would: base 10, no leading zeros, a single
/// `0` for zero.
pub(crate) fn write_unsigned<W: Write>(stream: &mut W, value: usize) -> io::Result<()> {
    if value == 0 {
        return stream.write_all(b"0");
    }

    // Largest power of 10 that doesn't exceed the value, then one digit per
    // division.
    let mut divisor = 1;
    while value / divisor / 10 != 0 {
        divisor *= 10;
    }

    while divisor > 0 {
        stream.write_all(&[b'0' + ((value / divisor) % 10) as u8])?;
        divisor /= 10;
    }

    Ok(())
}

/// Writes the entire allocator state in list order. The first header of each
/// region gets a `[REGION]` line before its `[BLOCK]` line; every header gets
/// a `[BLOCK]` line with its bounds, id, name and byte accounting.
///
/// # Safety
///
/// Caller must hold the allocator lock and every linked header must be valid.
pub(crate) unsafe fn write_memory<W: Write>(blocks: &BlockList, stream: &mut W) -> io::Result<()> {
    stream.write_all(b"-- Current Memory State --\n")?;

    for block in blocks.iter() {
        let header = block.as_ref();
        let start = block.as_ptr().cast::<u8>().cast_const();

        if header.is_region_start() {
            stream.write_all(b"[REGION] ")?;
            write_pointer(stream, start)?;
            stream.write_all(b"-")?;
            write_pointer(stream, start.add(header.region_size))?;
            stream.write_all(b" ")?;
            write_unsigned(stream, header.region_size)?;
            stream.write_all(b"\n")?;
        }

        stream.write_all(b"[BLOCK]  ")?;
        write_pointer(stream, start)?;
        stream.write_all(b"-")?;
        write_pointer(stream, start.add(header.size))?;
        stream.write_all(b" (")?;
        write_unsigned(stream, header.alloc_id)?;
        stream.write_all(b") '")?;
        stream.write_all(header.name())?;
        stream.write_all(b"' ")?;
        write_unsigned(stream, header.size)?;
        stream.write_all(b" ")?;
        write_unsigned(stream, header.usage)?;
        stream.write_all(b" ")?;
        write_unsigned(stream, header.payload_size())?;
        stream.write_all(b"\n")?;
    }

    Ok(())
}

/// Reports the most recent OS error on the diagnostic stream. Same rules as
/// the dump formatters: raw byte writes only.
pub(crate) fn report_os_error(syscall: &str) {
    // Capture the code before any other call can clobber it.
    let code = io::Error::last_os_error().raw_os_error().unwrap_or(0);

    let mut stderr = io::stderr().lock();
    let _ = stderr.write_all(b"mapalloc: ");
    let _ = stderr.write_all(syscall.as_bytes());
    let _ = stderr.write_all(b": os error ");
    let _ = write_unsigned(&mut stderr, code.unsigned_abs() as usize);
    let _ = stderr.write_all(b"\n");
}
