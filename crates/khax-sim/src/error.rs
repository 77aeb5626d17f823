use khax_core::ResultCode;
use khax_core::memory::{KernelAddr, PhysAddr, VirtAddr};
use thiserror::Error;

/// `svcControlMemory`: no free pages left.
pub const OUT_OF_MEMORY: ResultCode = ResultCode::new(0xD860_07F3);
/// Address argument not page aligned.
pub const MISALIGNED_ADDRESS: ResultCode = ResultCode::new(0xE0E0_1BF1);
/// The calling thread's ACL does not allow the syscall.
pub const SVC_DENIED: ResultCode = ResultCode::new(0xF8C0_07F4);
/// The query is not implemented by this kernel.
pub const NOT_IMPLEMENTED: ResultCode = ResultCode::new(0xE0E0_1BF4);
/// The kernel faulted while serving the call.
pub const KERNEL_FAULT: ResultCode = ResultCode::new(0xF960_07FE);
/// The service manager connection is closed.
pub const SRV_NOT_CONNECTED: ResultCode = ResultCode::new(0xD8E0_6C05);

/// Faults inside the simulated kernel.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SimError {
    /// A kernel access hit an address no kernel mapping covers.
    #[error("kernel access to unmapped address {0}")]
    UnmappedKernel(KernelAddr),
    /// A user address has no physical backing.
    #[error("user address {0} is not backed")]
    UnmappedUser(VirtAddr),
    /// A free-list link left FCRAM.
    #[error("free list link {0} is outside FCRAM")]
    LinkOutsideFcram(KernelAddr),
    /// The free-list walk did not terminate.
    #[error("free list walk exceeded {0} nodes")]
    FreeListCycle(usize),
    /// A page outside FCRAM was handed to the heap allocator.
    #[error("physical page {0} returned to the heap is not FCRAM")]
    ForeignPage(PhysAddr),
    /// The kernel branched to an address holding no code.
    #[error("branch to {0:#010x}")]
    BadBranch(u32),
}
