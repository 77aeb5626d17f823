//! `KTimer` vtable hijack technique.
//!
//! For kernels from 2.48.3, where the svcCreateThread patch site is gone. A
//! free-list link is rewritten while the kernel is still committing the page
//! it sits in, so that the next page the kernel hands out is the object pool
//! page holding a freshly created timer. With that page mapped into user
//! space the timer's vtable pointer is swapped for a table of forwarders whose
//! destructor slot runs the grant payload when the timer handle is closed.
//!
//! Implements the [`khax_core::Exploit`] trait.
//!
//! # Steps
//!
//! 1. Raise the application core's CPU time limit
//! 2. Leave a one-page free block at the end of the heap
//! 3. Race the page commit, map the timer's pool page, hijack the destructor
//! 4. Widen service access

#![warn(missing_docs)]

mod payload;
mod vtable;

pub use vtable::{PAGE_COUNT, STEP_COUNT, VtableHax};
