#![no_main]
use libfuzzer_sys::fuzz_target;

// Interpret the input as a tape of alloc/free/usable-size operations and
// check that live blocks never overlap or lose their fill byte.
fuzz_target!(|data: &[u8]| {
    if data.len() < 4 {
        return;
    }

    let mut live: Vec<(usize, usize, u8)> = Vec::new(); // (ptr, size, fill)

    for chunk in data.chunks(4) {
        if chunk.len() < 4 {
            break;
        }
        let op = chunk[0] % 4;
        let size = u16::from_le_bytes([chunk[1], chunk[2]]) as usize;
        let fill = chunk[3];

        match op {
            0 | 1 => {
                let size = size.min(1 << 20);
                let p = shardalloc_core::malloc(size);
                if p.is_null() {
                    continue;
                }
                // SAFETY: fresh allocation of `size` bytes.
                unsafe { std::ptr::write_bytes(p, fill, size) };
                live.push((p as usize, size, fill));
            }
            2 => {
                if live.is_empty() {
                    continue;
                }
                let idx = size % live.len();
                let (p, size, fill) = live.swap_remove(idx);
                // SAFETY: tracked live block; verified then freed once.
                unsafe {
                    for i in (0..size).step_by(37) {
                        assert_eq!((p as *mut u8).add(i).read(), fill);
                    }
                    shardalloc_core::free(p as *mut u8);
                }
            }
            _ => {
                if let Some(&(p, size, _)) = live.last() {
                    let usable = shardalloc_core::usable_size(p as *mut u8);
                    assert!(usable >= size);
                }
            }
        }
    }

    for (p, _, _) in live {
        // SAFETY: each tracked block freed exactly once.
        unsafe { shardalloc_core::free(p as *mut u8) };
    }
});
