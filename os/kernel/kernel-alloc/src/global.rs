//! # Global Allocator Binding
//!
//! Wires [`RegionAllocator`] up as `#[global_allocator]` so an embedding
//! kernel gets `Box`/`Vec`/`String` for a single statically reserved heap.
//! Strictly additive sugar over the region allocator's own operations — it
//! changes no allocator behavior, it just adapts the `GlobalAlloc` contract
//! to it.

use core::alloc::{GlobalAlloc, Layout};
use core::cell::RefCell;
use core::sync::atomic::{AtomicBool, Ordering};
use critical_section::Mutex;

use crate::region::{RegionAllocator, W};

/// Total size of the statically reserved heap.
const HEAP_SIZE: usize = 4 * 1024 * 1024; // 4 MiB

/// Backing storage for the heap, placed in a dedicated `.bss` section.
#[unsafe(link_section = ".bss.heap")]
static mut HEAP: HeapMem = HeapMem([0; HEAP_SIZE]);

/// Heap storage aligned for the allocator's block headers.
#[repr(align(16))]
struct HeapMem([u8; HEAP_SIZE]);

/// The region allocator backing [`GLOBAL_ALLOCATOR`], protected for shared
/// static access. The allocator's own methods additionally mask interrupts
/// for each operation; nesting two critical sections here is safe by
/// contract and is what lets a single static serve both direct callers of
/// [`RegionAllocator`] and the `GlobalAlloc` impl below.
static ALLOCATOR: Mutex<RefCell<RegionAllocator>> = Mutex::new(RefCell::new(RegionAllocator::new()));

/// One-time heap initialization flag.
static DID_INIT: AtomicBool = AtomicBool::new(false);

/// Ensure the static heap has been handed to the allocator (idempotent).
fn ensure_init() {
    if DID_INIT.load(Ordering::Acquire) {
        return;
    }
    critical_section::with(|cs| {
        let mut alloc = ALLOCATOR.borrow_ref_mut(cs);
        if !alloc.is_initialized() {
            let start = unsafe { (&raw mut HEAP.0).cast::<u8>() };
            unsafe {
                alloc.init(start, HEAP_SIZE);
            }
            DID_INIT.store(true, Ordering::Release);
        }
    });
}

/// The kernel's global allocator, backed by one statically reserved region.
pub struct KernelAllocator;

/// The installed global allocator instance.
#[global_allocator]
pub static GLOBAL_ALLOCATOR: KernelAllocator = KernelAllocator;

unsafe impl GlobalAlloc for KernelAllocator {
    /// Allocate a block of at least `layout.size()` bytes.
    ///
    /// Over-aligned requests (`layout.align() > W`) are rejected with null —
    /// the region allocator only guarantees `W`-alignment.
    ///
    /// # Safety
    /// The `GlobalAlloc` contract applies. Caller must handle a null return.
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > W {
            return core::ptr::null_mut();
        }
        ensure_init();
        critical_section::with(|cs| ALLOCATOR.borrow_ref_mut(cs).allocate(layout.size()))
    }

    /// Deallocate a block previously returned by `alloc`/`alloc_zeroed`/`realloc`.
    ///
    /// # Safety
    /// The `GlobalAlloc` contract applies. `ptr` and `layout` must match a
    /// prior allocation.
    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        ensure_init();
        critical_section::with(|cs| unsafe { ALLOCATOR.borrow_ref_mut(cs).free(ptr) });
    }

    /// Allocate and zero a block.
    ///
    /// # Safety
    /// The `GlobalAlloc` contract applies.
    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if layout.align() > W {
            return core::ptr::null_mut();
        }
        ensure_init();
        critical_section::with(|cs| ALLOCATOR.borrow_ref_mut(cs).zero_allocate(1, layout.size()))
    }

    /// Resize a block previously returned by `alloc`/`alloc_zeroed`/`realloc`.
    ///
    /// # Safety
    /// The `GlobalAlloc` contract applies.
    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() > W {
            return core::ptr::null_mut();
        }
        ensure_init();
        critical_section::with(|cs| unsafe {
            ALLOCATOR.borrow_ref_mut(cs).reallocate(ptr, new_size)
        })
    }
}
