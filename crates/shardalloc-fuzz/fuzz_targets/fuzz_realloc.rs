#![no_main]
use libfuzzer_sys::fuzz_target;

// Chains of reallocs over a small working set, checking that the
// preserved prefix survives every move.
fuzz_target!(|data: &[u8]| {
    const SLOTS: usize = 8;
    let mut slots: [(usize, usize); SLOTS] = [(0, 0); SLOTS]; // (ptr, size)

    for chunk in data.chunks(3) {
        if chunk.len() < 3 {
            break;
        }
        let slot = (chunk[0] as usize) % SLOTS;
        let new_size = u16::from_le_bytes([chunk[1], chunk[2]]) as usize;
        let (ptr, old_size) = slots[slot];

        // SAFETY: slot pointers are either null or live blocks we own.
        unsafe {
            let q = shardalloc_core::realloc(ptr as *mut u8, new_size);
            if new_size == 0 {
                // Contract: a fresh minimal allocation.
                assert!(!q.is_null());
                slots[slot] = (q as usize, 1);
                std::ptr::write_bytes(q, slot as u8, 1);
                continue;
            }
            if q.is_null() {
                // Old block (if any) is still valid on failure.
                continue;
            }
            for i in (0..old_size.min(new_size)).step_by(29) {
                assert_eq!(q.add(i).read(), slot as u8, "prefix lost in slot {}", slot);
            }
            std::ptr::write_bytes(q, slot as u8, new_size);
            slots[slot] = (q as usize, new_size);
        }
    }

    for (ptr, _) in slots {
        // SAFETY: each live slot freed exactly once.
        unsafe { shardalloc_core::free(ptr as *mut u8) };
    }
});
