//! An in-process model of the parts of a 3DS that khax touches.
//!
//! [`SimHorizon`] implements [`khax_core::host::Horizon`] over a byte-level
//! model of FCRAM, the AXI WRAM object pool and a sliver of kernel state:
//!
//! - the kernel's physical-page free list, with nodes stored in the free pages
//!   themselves and links followed without validation, so the heap coalesce
//!   and the racing page commit behave like on hardware;
//! - per-process page tables, the linear region and a small linear allocator;
//! - the calling thread's and process's syscall ACLs, the process id and the
//!   service manager's view of it;
//! - `KTimer` objects with a vtable of native kernel functions;
//! - the svcCreateThread patch site on kernels that have one.
//!
//! Kernel payloads run through [`khax_core::kernel::KernelContext`]. Any access
//! to an unmapped kernel address or branch into nowhere is recorded as a kernel
//! panic, see [`SimHorizon::kernel_panic`].
//!
//! ```no_run
//! use khax_core::host::Horizon;
//! use khax_core::version::SystemVersion;
//! use khax_sim::{SimConfig, SimHorizon};
//!
//! let sim = SimHorizon::new(SimConfig::new(SystemVersion::new(2, 50, 11), true));
//! assert_eq!(sim.check_new_3ds(), Ok(true));
//! ```
#![warn(missing_docs)]

mod config;
mod error;
mod heap;
mod horizon;
mod kernel;
mod phys;
mod state;

pub use crate::config::SimConfig;
pub use crate::error::{
    KERNEL_FAULT, MISALIGNED_ADDRESS, NOT_IMPLEMENTED, OUT_OF_MEMORY, SRV_NOT_CONNECTED,
    SVC_DENIED, SimError,
};
pub use crate::horizon::SimHorizon;
