//! Makes a few named allocations and prints the allocator state before and
//! after releasing them. Try it with `ALLOCATOR_ALGORITHM=best_fit` or
//! `ALLOCATOR_SCRIBBLE=1` in the environment.

use std::io;

use mapalloc::MapAllocator;

fn main() -> io::Result<()> {
    let allocator = MapAllocator::new();

    let config = allocator.allocate_named(128, "config");
    let table = allocator.allocate_named(4096, "table");
    let scratch = allocator.allocate(48);
    assert!(!config.is_null() && !table.is_null() && !scratch.is_null());

    allocator.dump(&mut io::stdout())?;

    unsafe {
        allocator.release(scratch);
        allocator.release(table);
        allocator.release(config);
    }

    // Every region drained, so only the banner remains.
    allocator.dump(&mut io::stdout())?;

    Ok(())
}
