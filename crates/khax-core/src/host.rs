//! The host operating system as the engine sees it.
//!
//! [`Horizon`] collects every system call and service the exploit steps use.
//! On hardware it is backed by svc thunks and IPC wrappers; the `khax-sim`
//! crate provides an in-process model of the same contract.

use crate::error::ResultCode;
use crate::gspwn::GpuCopyEngine;
use crate::kernel::KernelEntry;
use crate::memory::{KernelAddr, VirtAddr, VirtToPhysResolver};
use crate::util::CURRENT_PROCESS_HANDLE;
use crate::version::SystemVersion;
use serde::Serialize;
use std::thread::JoinHandle;
use std::time::Duration;

/// A kernel object handle.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct Handle(pub u32);

impl Handle {
    /// Pseudo-handle naming the calling process.
    pub const CURRENT_PROCESS: Handle = Handle(CURRENT_PROCESS_HANDLE);
}

/// `svcControlMemory` operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemOp {
    /// Unmap and release pages
    Free,
    /// Commit pages at a caller-chosen heap address
    Alloc,
    /// Commit physically contiguous pages in the linear region
    AllocLinear,
}

impl MemOp {
    /// The raw operation code.
    pub const fn raw(self) -> u32 {
        match self {
            MemOp::Free => 1,
            MemOp::Alloc => 3,
            MemOp::AllocLinear => 0x1_0003,
        }
    }
}

/// Page permissions passed to `svcControlMemory`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemPerm {
    /// No access
    None,
    /// Read only
    Read,
    /// Read and write
    ReadWrite,
}

/// `svcArbitrateAddress` operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArbitrationType {
    /// Wake up to `value` waiters
    Signal,
    /// Wait while the word is below `value`
    WaitIfLessThan,
    /// Decrement the word, then wait while it is below `value`
    DecrementAndWaitIfLessThan,
    /// [`ArbitrationType::WaitIfLessThan`] with a timeout
    WaitIfLessThanTimeout,
    /// [`ArbitrationType::DecrementAndWaitIfLessThan`] with a timeout
    DecrementAndWaitIfLessThanTimeout,
}

/// Timer reset behavior for `svcCreateTimer`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResetType {
    /// Reset after one waiter is released
    OneShot,
    /// Stay signaled until cleared
    Sticky,
    /// Periodic pulse
    Pulse,
}

/// Work item run on a host thread.
pub type ThreadJob = Box<dyn FnOnce() + Send + 'static>;

/// System calls and services the engine relies on.
///
/// Methods returning `Result<_, ResultCode>` report the host's raw result code
/// on failure. The `*_raw` calls return register contents unchecked because the
/// exploit inspects values the ordinary wrappers would discard.
pub trait Horizon: VirtToPhysResolver + GpuCopyEngine + Send + Sync {
    /// Running kernel version.
    fn kernel_version(&self) -> SystemVersion;

    /// Running firmware version.
    fn firm_version(&self) -> SystemVersion;

    /// `APT:CheckNew3DS`. Unsupported on kernels older than 2.44.6.
    fn check_new_3ds(&self) -> Result<bool, ResultCode>;

    /// `svcControlMemory`. Returns the address of the affected range.
    fn control_memory(
        &self,
        op: MemOp,
        addr: VirtAddr,
        size: usize,
        perm: MemPerm,
    ) -> Result<VirtAddr, ResultCode>;

    /// Allocates from the process's linear heap. `None` when exhausted.
    fn linear_alloc(&self, size: usize, align: usize) -> Option<VirtAddr>;

    /// Returns a [`Horizon::linear_alloc`] block.
    fn linear_free(&self, addr: VirtAddr);

    /// First address above the mapped regular heap.
    fn heap_end(&self) -> VirtAddr;

    /// Reads user memory through the CPU.
    fn read(&self, addr: VirtAddr, buf: &mut [u8]) -> Result<(), ResultCode>;

    /// Writes user memory through the CPU.
    fn write(&self, addr: VirtAddr, data: &[u8]) -> Result<(), ResultCode>;

    /// Reads one little-endian word of user memory.
    fn read_word(&self, addr: VirtAddr) -> Result<u32, ResultCode> {
        let mut buf = [0u8; 4];
        self.read(addr, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Writes one little-endian word of user memory.
    fn write_word(&self, addr: VirtAddr, value: u32) -> Result<(), ResultCode> {
        self.write(addr, &value.to_le_bytes())
    }

    /// Creates a thread with `svcCreateThread` and runs `job` on it.
    fn spawn_thread(
        &self,
        job: ThreadJob,
        priority: i32,
        processor: i32,
    ) -> Result<JoinHandle<()>, ResultCode>;

    /// `svcCreateAddressArbiter`.
    fn create_address_arbiter(&self) -> Result<Handle, ResultCode>;

    /// `svcArbitrateAddress`. Fails with [`ResultCode::INVALID_ADDRESS`] while
    /// `addr` is unmapped.
    fn arbitrate_address(
        &self,
        arbiter: Handle,
        addr: VirtAddr,
        kind: ArbitrationType,
        value: i32,
        timeout: Duration,
    ) -> Result<(), ResultCode>;

    /// `svcCreateTimer`, also returning the kernel address the call leaves in
    /// `r2`.
    fn create_timer_raw(&self, reset: ResetType) -> Result<(Handle, KernelAddr), ResultCode>;

    /// `svcCreateThread` with raw arguments. Returns `r0` unchecked.
    fn create_thread_raw(
        &self,
        priority: u32,
        entry: u32,
        arg: u32,
        stack_top: u32,
        processor: i32,
    ) -> u32;

    /// `svcCloseHandle`.
    fn close_handle(&self, handle: Handle) -> Result<(), ResultCode>;

    /// `svcGetProcessId`.
    fn get_process_id(&self, process: Handle) -> Result<u32, ResultCode>;

    /// `svcBackdoor`: runs `entry` in kernel mode. Requires svc 0x7B in the
    /// calling thread's ACL.
    fn backdoor(&self, entry: KernelEntry, arg: u32) -> Result<u32, ResultCode>;

    /// Address at which the kernel can branch to `entry`.
    fn kernel_entry_address(&self, entry: KernelEntry) -> u32;

    /// Connects to the service manager.
    fn srv_init(&self) -> Result<(), ResultCode>;

    /// Drops the service manager connection.
    fn srv_exit(&self) -> Result<(), ResultCode>;

    /// Looks up a service port by name.
    fn srv_get_service_handle(&self, name: &str) -> Result<Handle, ResultCode>;

    /// Current CPU time limit of the application core, in percent.
    fn app_cpu_time_limit(&self) -> Result<u32, ResultCode>;

    /// Sets the CPU time limit of the application core.
    fn set_app_cpu_time_limit(&self, percent: u32) -> Result<(), ResultCode>;
}
