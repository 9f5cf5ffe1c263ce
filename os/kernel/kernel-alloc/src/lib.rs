//! # Kernel Heap Allocator
//!
//! A single-region, first-fit heap allocator for a constrained bare-metal
//! execution environment (small RTOS-style kernel). It owns block-list
//! invariants, splitting, coalescing, and alignment over one caller-supplied
//! memory region; it does not pick that region's address or size, manage
//! multiple heaps, or provide lock-free concurrent allocation.
//!
//! ## Core Type
//!
//! [`RegionAllocator`] is the allocator itself: [`init`](RegionAllocator::init)
//! once over a region, then [`allocate`](RegionAllocator::allocate),
//! [`free`](RegionAllocator::free), [`reallocate`](RegionAllocator::reallocate)
//! and [`zero_allocate`](RegionAllocator::zero_allocate) as needed. Every
//! operation masks interrupts for its full duration via
//! [`critical_section::with`] and is not reentrant.
//!
//! ## Global Binding
//!
//! [`global::KernelAllocator`] wires a static [`RegionAllocator`] instance up
//! as `#[global_allocator]`, for kernels that want `Box`/`Vec`/`String` over
//! the same statically reserved heap.
//!
//! ## Error Model
//!
//! There are three outcomes, never mixed: caller-input errors (zero size,
//! oversize, overflow) return null with no state change; exhaustion returns
//! null; structural corruption — broken adjacency, a header outside the
//! region, a double free — is fatal and reported via [`panic!`] with a
//! [`HeapErrorKind`], since there is no well-defined way to continue after
//! the block list's invariants have been violated.

#![cfg_attr(not(any(test, doctest)), no_std)]

pub mod error;
pub mod global;
pub mod region;

pub use error::HeapErrorKind;
pub use region::RegionAllocator;
