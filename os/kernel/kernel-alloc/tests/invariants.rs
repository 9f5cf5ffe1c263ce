//! Property tests for the allocator's structural invariants (P1-P6) and its
//! allocate/reallocate/zero_allocate guarantees (P5-P8), driven by random
//! sequences of operations.

use kernel_alloc::RegionAllocator;
use kernel_alloc::region::MIN_PAYLOAD;
use proptest::prelude::*;

/// Every successful allocation must expose at least this many usable,
/// non-overlapping bytes (spec property P5: `>= max(n, min_payload)`).
fn usable(requested: usize) -> usize {
    requested.max(MIN_PAYLOAD)
}

#[derive(Debug, Clone)]
enum Op {
    Alloc(usize),
    Free(usize),
    Realloc(usize, usize),
    ZeroAlloc(usize, usize),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (1usize..=256).prop_map(Op::Alloc),
        any::<usize>().prop_map(Op::Free),
        (any::<usize>(), 1usize..=256).prop_map(|(i, s)| Op::Realloc(i, s)),
        (1usize..=8, 1usize..=32).prop_map(|(c, s)| Op::ZeroAlloc(c, s)),
    ]
}

proptest! {
    #[test]
    fn random_operation_sequences_preserve_invariants(ops in prop::collection::vec(op_strategy(), 1..200)) {
        let mut backing = vec![0u64; 2048]; // 16 KiB, word-aligned
        let base = backing.as_mut_ptr().cast::<u8>();
        let len = backing.len() * 8;

        let mut alloc = RegionAllocator::new();
        prop_assert!(unsafe { alloc.init(base, len) });

        let mut live: Vec<(*mut u8, usize)> = Vec::new();

        for op in ops {
            match op {
                Op::Alloc(size) => {
                    let p = alloc.allocate(size);
                    if !p.is_null() {
                        let addr = p as usize;
                        prop_assert_eq!(addr % size_of::<usize>(), 0);
                        let cap = usable(size);
                        let (rb, re) = alloc.region_range();
                        prop_assert!(addr >= rb && addr + cap <= re);
                        for &(q, qs) in &live {
                            let qa = q as usize;
                            prop_assert!(addr >= qa + qs || addr + cap <= qa);
                        }
                        // P5: the whole guaranteed-usable span must be
                        // writable without corrupting any other live block.
                        unsafe { core::ptr::write_bytes(p, 0xCC, cap) };
                        live.push((p, cap));
                    }
                }
                Op::Free(idx) => {
                    if !live.is_empty() {
                        let i = idx % live.len();
                        let (p, _) = live.remove(i);
                        unsafe { alloc.free(p) };
                    }
                }
                Op::Realloc(idx, size) => {
                    if !live.is_empty() {
                        let i = idx % live.len();
                        let (p, old_cap) = live[i];
                        let marker_len = old_cap.min(size);
                        if marker_len > 0 {
                            unsafe { core::ptr::write_bytes(p, 0x5A, marker_len) };
                        }
                        let new_p = unsafe { alloc.reallocate(p, size) };
                        if new_p.is_null() {
                            // Exhaustion on relocate: the old block is untouched.
                        } else {
                            for k in 0..marker_len {
                                prop_assert_eq!(unsafe { *new_p.add(k) }, 0x5A);
                            }
                            live[i] = (new_p, usable(size));
                        }
                    }
                }
                Op::ZeroAlloc(count, size) => {
                    let p = alloc.zero_allocate(count, size);
                    if !p.is_null() {
                        let total = count * size;
                        for k in 0..total {
                            prop_assert_eq!(unsafe { *p.add(k) }, 0);
                        }
                        live.push((p, usable(total)));
                    }
                }
            }
            prop_assert!(alloc.check_invariants());
        }

        for (p, _) in live {
            unsafe { alloc.free(p) };
        }
        prop_assert!(alloc.check_invariants());
        prop_assert_eq!(alloc.free_blocks(), 1);
    }
}

proptest! {
    #[test]
    fn free_then_allocate_reuses_the_freed_block(size in 1usize..=512) {
        let mut backing = vec![0u64; 1024];
        let base = backing.as_mut_ptr().cast::<u8>();
        let len = backing.len() * 8;

        let mut alloc = RegionAllocator::new();
        prop_assert!(unsafe { alloc.init(base, len) });

        let first = alloc.allocate(size);
        prop_assert!(!first.is_null());
        unsafe { alloc.free(first) };
        let second = alloc.allocate(size);
        prop_assert!(!second.is_null());
        prop_assert_eq!(first, second);
        prop_assert!(alloc.check_invariants());
    }
}
