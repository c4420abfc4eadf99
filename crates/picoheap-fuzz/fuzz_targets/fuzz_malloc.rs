#![no_main]
use libfuzzer_sys::fuzz_target;
use picoheap_core::config::{HeapConfig, HeapMode};
use picoheap_core::malloc::{MallocError, MallocState, VecRegion};

fuzz_target!(|data: &[u8]| {
    // Each 4-byte record is one operation: [op, size_lo, size_hi, arg].
    if data.len() < 4 {
        return;
    }

    let mut state = MallocState::with_config(
        VecRegion::new(4 << 20),
        HeapConfig::embedded()
            .with_buckets(data[0] & 1 == 1)
            .with_mode(HeapMode::Fast),
    );
    let mut live: Vec<(usize, usize, u8)> = Vec::new();

    for (step, record) in data[1..].chunks_exact(4).enumerate() {
        let size = u16::from_le_bytes([record[1], record[2]]) as usize;
        match record[0] % 5 {
            0 | 1 => match state.malloc(size) {
                Ok(ptr) => {
                    assert!(state.region().bytes(ptr, size).iter().all(|&b| b == 0));
                    let tag = (step as u8) | 1;
                    state.region_mut().bytes_mut(ptr, size).fill(tag);
                    live.push((ptr, size, tag));
                }
                Err(MallocError::OutOfMemory { .. }) => {}
                Err(err) => panic!("unexpected malloc failure: {err}"),
            },
            2 => {
                if !live.is_empty() {
                    let (ptr, size, tag) = live.swap_remove(record[3] as usize % live.len());
                    assert!(state.region().bytes(ptr, size).iter().all(|&b| b == tag));
                    state.free(ptr).unwrap();
                }
            }
            3 => {
                // A repeated free of a general-list block must be caught.
                if !live.is_empty() {
                    let (ptr, size, _) = live.swap_remove(record[3] as usize % live.len());
                    state.free(ptr).unwrap();
                    if size >= 1024 {
                        assert!(matches!(
                            state.free(ptr),
                            Err(MallocError::DoubleFree { .. })
                        ));
                    }
                }
            }
            _ => {
                if let Some(&(ptr, size, _)) = live.last() {
                    assert!(state.usable_size(ptr).unwrap() >= size);
                }
            }
        }
        if let Err(violation) = state.check_heap() {
            panic!("step {step}: {violation}");
        }
    }

    for (ptr, ..) in live {
        state.free(ptr).unwrap();
    }
    assert_eq!(state.check_heap(), Ok(()));
});
