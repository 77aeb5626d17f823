//! Heap free-list coalesce technique ("memchunkhax").
//!
//! For kernels up to 2.46.0. A freed page's free-list link is rewritten
//! through the GPU so that the kernel's own coalesce bookkeeping stores a
//! pointer over two instructions of svcCreateThread. Calling svcCreateThread
//! with an invalid processor id then branches to the payload, which undoes the
//! damage and opens the syscall ACL.
//!
//! Implements the [`khax_core::Exploit`] trait.
//!
//! # Steps
//!
//! 1. Initialize
//! 2. Allocate six linear pages and scratch memory
//! 3. Free pages 2 and 4
//! 4. Verify the free-list links of the freed pages
//! 5. Aim page 2's link at the patch site and free page 1
//! 6. Trigger the patched syscall
//! 7. Widen service access

#![warn(missing_docs)]

mod memchunk;
mod payload;

pub use memchunk::{MemChunkHax, PAGE_COUNT, SCRATCH_SIZE, STEP_COUNT, TRIGGER_PROCESSOR};
pub use payload::PAYLOAD_SENTINEL;
