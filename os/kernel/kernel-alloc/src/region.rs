//! # Region Allocator
//!
//! A single-region, first-fit, split-and-coalesce heap allocator for a
//! constrained bare-metal environment.
//!
//! Unlike a classic free-list allocator that only links free blocks, the
//! block list here is **address-ordered over every block, free or used**:
//! `BlockHeader::next` always points at the header immediately following this
//! block's payload. That single invariant is what lets [`RegionAllocator::free`]
//! find a freed block's predecessor by walking from the head, and it is what
//! [`RegionAllocator::validate_block`] checks to catch structural corruption.
//!
//! ```text
//! +--------+-------------------+--------+-------------------+--------+
//! | header |      payload      | header |      payload       | header | (sentinel)
//! +--------+-------------------+--------+-------------------+--------+
//! ^ region_base                                                      ^ region_end
//! ```
//!
//! The low bit of [`BlockHeader::size_and_flag`] is the used flag; the
//! remaining bits hold the payload size, which is always a multiple of `W`.

use core::ptr::{self, null_mut};

use crate::error::HeapErrorKind;

/// Native word size. Payload sizes are always rounded up to a multiple of this.
pub const W: usize = size_of::<usize>();

/// Smallest payload a free block may carry; anything smaller is left as
/// internal fragmentation rather than split off.
pub const MIN_PAYLOAD: usize = size_of::<BlockHeader>();

/// Largest payload a single allocation may request.
pub const MAX_PAYLOAD: usize = 1usize << 30;

/// Free-block count threshold above which [`RegionAllocator::allocate`] and
/// [`RegionAllocator::reallocate`] run a [`RegionAllocator::coalesce_sweep`].
pub const COALESCE_THRESHOLD: usize = 8;

const USED_BIT: usize = 1;

/// Header stored at the beginning of every block, used or free.
///
/// # Invariants
/// - `addr(b) + size_of::<BlockHeader>() + payload_size(b) == addr(b.next)` for
///   every block but the sentinel.
/// - The sentinel is always used, has payload size zero, and `next == null`.
#[repr(C)]
pub struct BlockHeader {
    next: *mut BlockHeader,
    size_and_flag: usize,
}

impl BlockHeader {
    #[inline]
    fn payload_size(&self) -> usize {
        self.size_and_flag & !USED_BIT
    }

    #[inline]
    fn is_used(&self) -> bool {
        self.size_and_flag & USED_BIT != 0
    }
}

#[inline]
const fn round_up(size: usize, word: usize) -> usize {
    (size + (word - 1)) & !(word - 1)
}

/// A first-fit allocator over one caller-supplied, word-aligned memory region.
///
/// Every public operation masks interrupts for its entire duration via
/// [`critical_section::with`] — not reentrant, not internally thread-safe,
/// but safe to nest inside an outer critical section (e.g. the one a
/// [`crate::global::KernelAllocator`] holds for the whole `GlobalAlloc` call).
pub struct RegionAllocator {
    head: *mut BlockHeader,
    region_base: usize,
    region_end: usize,
    free_blocks: usize,
    initialized: bool,
}

// Safety: exclusive access is always gated by `&mut self` plus a critical section.
unsafe impl Send for RegionAllocator {}

impl Default for RegionAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl RegionAllocator {
    /// Construct an allocator that manages no region yet.
    pub const fn new() -> Self {
        Self {
            head: null_mut(),
            region_base: 0,
            region_end: 0,
            free_blocks: 0,
            initialized: false,
        }
    }

    /// Whether [`init`](Self::init) has been called successfully.
    pub const fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Current count of free headers in the block list.
    pub const fn free_blocks(&self) -> usize {
        self.free_blocks
    }

    /// The managed region as `[region_base, region_end)`, or `(0, 0)` before init.
    pub const fn region_range(&self) -> (usize, usize) {
        (self.region_base, self.region_end)
    }

    /// Decrement [`free_blocks`](Self::free_blocks), panicking on underflow.
    /// `free_blocks` only ever drops on split, merge, and allocate; a
    /// negative result means the block list has already diverged from
    /// reality and continuing would propagate that damage.
    fn dec_free_blocks(&mut self) {
        self.free_blocks = self
            .free_blocks
            .checked_sub(1)
            .unwrap_or_else(|| panic!("{}", HeapErrorKind::FreeCountUnderflow));
    }

    /// Walk the full block list and confirm the structural invariants hold:
    /// the list terminates at a used, zero-payload sentinel; no two adjacent
    /// blocks are both free; every header's `next` immediately follows its
    /// payload; addresses strictly increase and stay within the region; and
    /// the free-block count matches [`free_blocks`](Self::free_blocks).
    ///
    /// Exposed for tests and diagnostics; never called on any allocation path.
    pub fn check_invariants(&self) -> bool {
        if !self.initialized {
            return true;
        }
        let mut cur = self.head;
        let mut prev_was_free = false;
        let mut counted_free = 0usize;
        let mut prev_addr: Option<usize> = None;
        loop {
            if cur.is_null() {
                return false;
            }
            let addr = cur as usize;
            if addr < self.region_base || addr >= self.region_end || addr % W != 0 {
                return false;
            }
            if let Some(p) = prev_addr {
                if addr <= p {
                    return false;
                }
            }
            let header = unsafe { &*cur };
            let free = !header.is_used();
            if free {
                counted_free += 1;
                if prev_was_free {
                    return false;
                }
            }
            prev_was_free = free;

            if header.next.is_null() {
                // Must be the sentinel: used, zero payload.
                return header.is_used() && header.payload_size() == 0 && counted_free == self.free_blocks;
            }

            let expected_next = addr + size_of::<BlockHeader>() + header.payload_size();
            if expected_next != header.next as usize {
                return false;
            }

            prev_addr = Some(addr);
            cur = header.next;
        }
    }

    /// Initialize the allocator to manage `[region, region + length)`.
    /// `length` is rounded down to a multiple of `W` before anything else,
    /// so the region end and every header placed within it stay word-aligned.
    ///
    /// Lays down a single free block spanning the whole region (minus its
    /// header) followed by a used, zero-payload sentinel header. Returns
    /// `false` without changing any state if `region` is null, misaligned, or
    /// the rounded `length` is too small to hold one real block plus the
    /// sentinel.
    ///
    /// # Safety
    /// - `[region, region + length)` must be valid, writable, and exclusive
    ///   to this allocator for the remainder of its lifetime.
    /// - Must be called at most once per instance.
    pub unsafe fn init(&mut self, region: *mut u8, length: usize) -> bool {
        critical_section::with(|_| unsafe { self.init_locked(region, length) })
    }

    unsafe fn init_locked(&mut self, region: *mut u8, length: usize) -> bool {
        let base = region as usize;
        let length = length & !(W - 1);
        let min_length = 2 * size_of::<BlockHeader>() + MIN_PAYLOAD;
        if base == 0 || base % W != 0 || length < min_length {
            log::warn!("region init rejected: base=0x{base:x} length={length}");
            return false;
        }

        let end = base + length;
        let sentinel_addr = end - size_of::<BlockHeader>();
        let head = base as *mut BlockHeader;
        let sentinel = sentinel_addr as *mut BlockHeader;
        let payload = sentinel_addr - base - size_of::<BlockHeader>();

        unsafe {
            ptr::write(
                head,
                BlockHeader {
                    next: sentinel,
                    size_and_flag: payload,
                },
            );
            ptr::write(
                sentinel,
                BlockHeader {
                    next: null_mut(),
                    size_and_flag: USED_BIT,
                },
            );
        }

        self.head = head;
        self.region_base = base;
        self.region_end = end;
        self.free_blocks = 1;
        self.initialized = true;
        log::debug!("region allocator initialized: base=0x{base:x} end=0x{end:x} payload={payload}");
        true
    }

    /// Allocate `size` bytes, rounded up to a multiple of `W` and clamped up
    /// to [`MIN_PAYLOAD`] if that would leave a smaller block.
    ///
    /// Returns null on zero size, oversize requests, or exhaustion. Never
    /// panics on caller input; only structural corruption panics.
    pub fn allocate(&mut self, size: usize) -> *mut u8 {
        if size == 0 || size > MAX_PAYLOAD {
            return null_mut();
        }
        let rounded = round_up(size, W).max(MIN_PAYLOAD);
        critical_section::with(|_| unsafe { self.allocate_locked(rounded) })
    }

    unsafe fn allocate_locked(&mut self, rounded: usize) -> *mut u8 {
        if !self.initialized {
            return null_mut();
        }
        if self.free_blocks > COALESCE_THRESHOLD {
            unsafe { self.coalesce_sweep() };
        }
        if let Some(b) = unsafe { self.find_fit(rounded) } {
            return unsafe { self.take_block(b, rounded) };
        }
        log::warn!("allocation of {rounded} bytes failed: heap exhausted");
        null_mut()
    }

    unsafe fn find_fit(&self, rounded: usize) -> Option<*mut BlockHeader> {
        let mut cur = self.head;
        while !cur.is_null() {
            let h = unsafe { &*cur };
            if !h.is_used() && h.payload_size() >= rounded {
                return Some(cur);
            }
            cur = h.next;
        }
        None
    }

    /// Carve `rounded` bytes out of free block `b` and mark it used.
    unsafe fn take_block(&mut self, b: *mut BlockHeader, rounded: usize) -> *mut u8 {
        unsafe { self.split(b, rounded) };
        unsafe {
            (*b).size_and_flag |= USED_BIT;
        }
        self.dec_free_blocks();
        unsafe { (b as *mut u8).add(size_of::<BlockHeader>()) }
    }

    /// Split `b`'s payload into `size` bytes plus a new free tail, if the tail
    /// would be large enough to host a header and [`MIN_PAYLOAD`]. Preserves
    /// `b`'s used flag. Does nothing (leaving internal fragmentation) otherwise.
    unsafe fn split(&mut self, b: *mut BlockHeader, size: usize) {
        let header = unsafe { &mut *b };
        let flag = header.size_and_flag & USED_BIT;
        let payload = header.payload_size();
        let remaining = payload - size;
        if remaining < size_of::<BlockHeader>() + MIN_PAYLOAD {
            return;
        }

        let new_addr = (b as usize) + size_of::<BlockHeader>() + size;
        let new_block = new_addr as *mut BlockHeader;
        let new_payload = remaining - size_of::<BlockHeader>();
        unsafe {
            ptr::write(
                new_block,
                BlockHeader {
                    next: header.next,
                    size_and_flag: new_payload,
                },
            );
        }
        header.next = new_block;
        header.size_and_flag = size | flag;
        self.free_blocks += 1;
    }

    /// Free a block previously returned by [`allocate`](Self::allocate),
    /// [`zero_allocate`](Self::zero_allocate), or [`reallocate`](Self::reallocate).
    ///
    /// No-op on a null pointer. Panics on structural corruption, including a
    /// double free.
    ///
    /// # Safety
    /// `ptr` must either be null or have been returned by this allocator and
    /// not freed since.
    pub unsafe fn free(&mut self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        critical_section::with(|_| unsafe { self.free_locked(ptr) });
    }

    unsafe fn free_locked(&mut self, ptr: *mut u8) {
        let b = unsafe { ptr.sub(size_of::<BlockHeader>()) } as *mut BlockHeader;
        unsafe { self.validate_block(b) };
        if !unsafe { &*b }.is_used() {
            panic!("{}", HeapErrorKind::DoubleFree);
        }
        unsafe {
            (*b).size_and_flag &= !USED_BIT;
        }
        self.free_blocks += 1;

        unsafe { self.merge_forward(b) };
        unsafe { self.merge_backward(b) };
    }

    /// Merge `b` with its immediate successor if that successor is free.
    /// Preserves `b`'s used flag, so this is also used by `reallocate`'s
    /// grow-into-next path where `b` stays used.
    unsafe fn merge_forward(&mut self, b: *mut BlockHeader) {
        let nxt = unsafe { (*b).next };
        if nxt.is_null() {
            return;
        }
        if unsafe { &*nxt }.is_used() {
            return;
        }
        let flag = unsafe { (*b).size_and_flag } & USED_BIT;
        let cur_payload = unsafe { &*b }.payload_size();
        let nxt_payload = unsafe { &*nxt }.payload_size();
        let merged = cur_payload + size_of::<BlockHeader>() + nxt_payload;
        unsafe {
            (*b).size_and_flag = merged | flag;
            (*b).next = (*nxt).next;
        }
        self.dec_free_blocks();
    }

    /// Find `b`'s predecessor by walking the full address-ordered list from
    /// the head — not a free-only list — and merge into it if free.
    unsafe fn merge_backward(&mut self, b: *mut BlockHeader) {
        let mut prev: *mut BlockHeader = null_mut();
        let mut cur = self.head;
        while !cur.is_null() && !ptr::eq(cur, b) {
            prev = cur;
            cur = unsafe { (*cur).next };
        }
        if prev.is_null() {
            return;
        }
        if unsafe { &*prev }.is_used() {
            return;
        }
        let prev_payload = unsafe { &*prev }.payload_size();
        let b_payload = unsafe { &*b }.payload_size();
        let merged = prev_payload + size_of::<BlockHeader>() + b_payload;
        unsafe {
            (*prev).size_and_flag = merged;
            (*prev).next = (*b).next;
        }
        self.dec_free_blocks();
    }

    /// Resize the allocation at `ptr` to `size` bytes.
    ///
    /// `ptr == null` delegates to [`allocate`](Self::allocate); `size == 0`
    /// delegates to [`free`](Self::free) and returns null. Otherwise tries, in
    /// order: no-op (already the right size), in-place shrink (splitting off
    /// a free tail), growing into an already-free next block, and finally
    /// relocating to a fresh allocation. Byte contents up to `min(old, new)`
    /// size are preserved on every path.
    ///
    /// # Safety
    /// `ptr` must either be null or have been returned by this allocator and
    /// not freed since.
    pub unsafe fn reallocate(&mut self, ptr: *mut u8, size: usize) -> *mut u8 {
        if ptr.is_null() {
            return self.allocate(size);
        }
        if size == 0 {
            unsafe { self.free(ptr) };
            return null_mut();
        }
        if size > MAX_PAYLOAD {
            return null_mut();
        }
        let rounded = round_up(size, W);
        critical_section::with(|_| unsafe { self.reallocate_locked(ptr, rounded) })
    }

    unsafe fn reallocate_locked(&mut self, ptr: *mut u8, rounded: usize) -> *mut u8 {
        let b = unsafe { ptr.sub(size_of::<BlockHeader>()) } as *mut BlockHeader;
        unsafe { self.validate_block(b) };
        let current = unsafe { &*b }.payload_size();

        if rounded == current {
            return ptr;
        }

        if rounded < current {
            let old_next = unsafe { (*b).next };
            unsafe { self.split(b, rounded) };
            let new_next = unsafe { (*b).next };
            if !ptr::eq(new_next, old_next) {
                // `new_next` is the freshly split-off fragment; it may now sit
                // directly before an already-free block.
                unsafe { self.merge_forward(new_next) };
            }
            if self.free_blocks > COALESCE_THRESHOLD {
                unsafe { self.coalesce_sweep() };
            }
            return ptr;
        }

        let needed = rounded - current;
        let nxt = unsafe { (*b).next };
        let can_grow_in_place = !nxt.is_null()
            && !unsafe { &*nxt }.is_used()
            && unsafe { &*nxt }.payload_size() + size_of::<BlockHeader>() >= needed;

        if can_grow_in_place {
            unsafe { self.merge_forward(b) };
            let before = unsafe { (*b).next };
            unsafe { self.split(b, rounded) };
            let after = unsafe { (*b).next };
            if !ptr::eq(before, after) {
                unsafe { self.merge_forward(after) };
            }
            if self.free_blocks > COALESCE_THRESHOLD {
                unsafe { self.coalesce_sweep() };
            }
            return ptr;
        }

        let new_ptr = unsafe { self.allocate_locked(rounded) };
        if new_ptr.is_null() {
            return null_mut();
        }
        unsafe {
            ptr::copy_nonoverlapping(ptr, new_ptr, current);
            self.free_locked(ptr);
        }
        new_ptr
    }

    /// Allocate space for `count` elements of `size` bytes each, zeroed.
    ///
    /// Returns null on `count * size` overflow, zero product, or exhaustion.
    pub fn zero_allocate(&mut self, count: usize, size: usize) -> *mut u8 {
        let Some(total) = count.checked_mul(size) else {
            return null_mut();
        };
        if total == 0 {
            return null_mut();
        }
        let p = self.allocate(total);
        if !p.is_null() {
            unsafe { ptr::write_bytes(p, 0, total) };
        }
        p
    }

    /// Check a user-facing block header for structural corruption:
    /// out-of-region, misaligned, invalid payload size, or broken adjacency
    /// with its successor. Panics on any violation.
    unsafe fn validate_block(&self, b: *mut BlockHeader) {
        let addr = b as usize;
        if addr < self.region_base || addr >= self.region_end {
            panic!("{}", HeapErrorKind::OutOfRegion);
        }
        if addr % W != 0 {
            panic!("{}", HeapErrorKind::Misaligned);
        }
        let header = unsafe { &*b };
        let payload = header.payload_size();
        if payload == 0 || payload > MAX_PAYLOAD {
            panic!("{}", HeapErrorKind::InvalidPayloadSize);
        }
        let block_end = addr + size_of::<BlockHeader>() + payload;
        if block_end > self.region_end {
            panic!("{}", HeapErrorKind::OutOfRegion);
        }
        if !header.next.is_null() && block_end != header.next as usize {
            panic!("{}", HeapErrorKind::BrokenAdjacency);
        }
    }

    /// Merge every pair of adjacent free blocks in the list. Runs ahead of
    /// the first-fit search in [`allocate`](Self::allocate) and on the
    /// shrink/grow-in-place fast paths of
    /// [`reallocate`](Self::reallocate), whenever
    /// [`free_blocks`](Self::free_blocks) exceeds [`COALESCE_THRESHOLD`].
    unsafe fn coalesce_sweep(&mut self) {
        let mut cur = self.head;
        while !cur.is_null() {
            loop {
                if unsafe { &*cur }.is_used() {
                    break;
                }
                let nxt = unsafe { (*cur).next };
                if nxt.is_null() || unsafe { &*nxt }.is_used() {
                    break;
                }
                let cur_payload = unsafe { &*cur }.payload_size();
                let nxt_payload = unsafe { &*nxt }.payload_size();
                unsafe {
                    (*cur).size_and_flag = cur_payload + size_of::<BlockHeader>() + nxt_payload;
                    (*cur).next = (*nxt).next;
                }
                self.dec_free_blocks();
            }
            cur = unsafe { (*cur).next };
        }
        log::trace!("coalesce sweep complete: free_blocks={}", self.free_blocks);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backing(bytes: usize) -> (Vec<u64>, *mut u8, usize) {
        let words = bytes.div_ceil(8);
        let mut buf = vec![0u64; words];
        let len = buf.len() * 8;
        let ptr = buf.as_mut_ptr().cast::<u8>();
        (buf, ptr, len)
    }

    #[test]
    fn round_up_is_idempotent_on_word_multiples() {
        assert_eq!(round_up(0, W), 0);
        assert_eq!(round_up(1, W), W);
        assert_eq!(round_up(W, W), W);
        assert_eq!(round_up(W + 1, W), 2 * W);
    }

    #[test]
    #[should_panic(expected = "outside region bounds")]
    fn validate_block_rejects_payload_reaching_past_region_end_even_with_null_next() {
        let (_buf, ptr, len) = backing(4096);
        let mut alloc = RegionAllocator::new();
        assert!(unsafe { alloc.init(ptr, len) });

        // Forge a header whose declared payload runs past region_end but
        // whose `next` is null, so the adjacency check alone would miss it.
        let b = alloc.head;
        unsafe {
            (*b).next = null_mut();
            (*b).size_and_flag = (alloc.region_end - alloc.region_base) | USED_BIT;
        }

        unsafe { alloc.validate_block(b) };
    }

    #[test]
    fn dec_free_blocks_panics_on_underflow() {
        let mut alloc = RegionAllocator::new();
        assert_eq!(alloc.free_blocks, 0);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            alloc.dec_free_blocks();
        }));
        assert!(result.is_err());
    }
}
