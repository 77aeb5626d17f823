//! # Khax Core
//!
//! `khax-core` is the foundational library for the khax ARM11 kernel
//! escalation engine. It holds everything the two techniques share and keeps
//! every host and kernel interaction behind a trait so the state machines can
//! run against real hardware or against the `khax-sim` model.
//!
//! ## Architecture Overview
//!
//! - [`host::Horizon`] - The system calls and services the engine consumes,
//!   with [`memory::VirtToPhysResolver`] and [`gspwn::GpuCopyEngine`] as
//!   supertraits.
//!
//! - [`kernel::KernelContext`] - What a kernel-mode payload may do: load and
//!   store kernel memory, branch to kernel code, mask interrupts and maintain
//!   caches.
//!
//! - [`exploit::Exploit`] - The ordered-step contract both techniques
//!   implement.
//!
//! ## Main Components
//!
//! - [`version`] - The version/offset registry and FCRAM address translation.
//! - [`gspwn`] - GPU copies into freed pages and the cache eviction fallback.
//! - [`grant`] - The ACL grant payload and the process id swap.
//! - [`session`] - Step ordering, corruption tracking and the process-wide
//!   active-session slot.
//! - [`memory`] - Address newtypes, the free-list node view and page sets.
//! - [`util`] - Constants, [`util::Size`], cancelable helper threads.

#![warn(missing_docs)]

mod config;
pub mod error;
pub mod exploit;
pub mod grant;
pub mod gspwn;
pub mod host;
pub mod kernel;
pub mod memory;
mod report;
pub mod session;
pub mod util;
pub mod version;

pub use crate::config::KhaxConfig;
pub use crate::error::{FailureClass, KhaxError, Result, ResultCode};
pub use crate::exploit::{Exploit, TechniqueKind};
pub use crate::report::{ReportedError, RunReport};
