//! Runs a normal program on top of `mapalloc` installed as the global
//! allocator. Note that layouts with alignments above 8 are refused, so this
//! sticks to ordinary collections.

use mapalloc::MapAllocator;

#[global_allocator]
static ALLOCATOR: MapAllocator = MapAllocator::new();

fn main() {
    let num = Box::new(10usize);
    println!("Boxed num {num} at {:?}", &*num as *const usize);

    let mut bytes: Vec<u8> = Vec::with_capacity(*num);
    for i in 0..*num {
        bytes.push(i as u8);
    }
    println!("Vec: {bytes:?} at {:?}", bytes.as_ptr());

    let handle = std::thread::spawn(|| {
        let mut bytes: Vec<u8> = Vec::with_capacity(256);
        bytes.push(5);
        bytes.push(6);
        println!("Second thread Vec: {bytes:?} at {:?}", bytes.as_ptr());
    });

    handle.join().unwrap();

    let cap = 1024 * 1024;
    let mut large: Vec<u8> = Vec::with_capacity(cap);
    large.push(1);
    println!("Large allocation of {cap} bytes at {:?}", large.as_ptr());
}
