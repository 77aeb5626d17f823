//! Privilege grant primitive.
//!
//! Two independent pieces:
//!
//! - [`grant_full_svc_access`] runs in kernel mode and opens the syscall ACL
//!   of the current thread and process.
//! - [`PidSwap`] / [`grant_service_access`] run in user mode once svcBackdoor
//!   is reachable and widen the service manager's view of the process by
//!   briefly presenting process id 0.

use crate::error::{HostOp, KhaxError, Result};
use crate::host::{Handle, Horizon};
use crate::kernel::KernelContext;
use crate::memory::KernelAddr;
use crate::session;
use crate::util::{CURRENT_KPROCESS_PTR, CURRENT_KTHREAD_PTR};
use crate::version::ProcessLayout;
use log::{debug, info, warn};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// ACL allowing every syscall except 0x00, 0x7E and 0x7F, which do not exist.
pub const SVC_ACL_FULL: [u32; 4] = [0xFFFF_FFFE, 0xFFFF_FFFF, 0xFFFF_FFFF, 0x3FFF_FFFF];

/// Size of a syscall ACL in bytes.
pub const SVC_ACL_SIZE: usize = 16;

/// Offset in `KThread` of the pointer to the thread's saved context.
pub const KTHREAD_CONTEXT_OFFSET: u32 = 0x8C;

/// Distance from the saved context down to the thread's syscall ACL.
pub const THREAD_ACL_BELOW_CONTEXT: u32 = 0x18;

/// Returned by the process id payloads when no session is registered.
pub const PID_ENTRY_FAILED: u32 = u32::MAX;

/// Returns `true` if `acl` allows syscall `svc`.
pub fn svc_allowed(acl: &[u32; 4], svc: u8) -> bool {
    let word = (svc / 32) as usize;
    acl[word] & (1 << (svc % 32)) != 0
}

/// Kernel address of the current thread's syscall ACL.
pub fn thread_svc_acl(k: &mut dyn KernelContext) -> KernelAddr {
    let kthread = k.read_u32(KernelAddr::new(CURRENT_KTHREAD_PTR));
    let context = k.read_u32(KernelAddr::new(kthread).wrapping_add(KTHREAD_CONTEXT_OFFSET));
    KernelAddr::new(context).wrapping_sub(THREAD_ACL_BELOW_CONTEXT)
}

/// Kernel address of the current `KProcess`.
pub fn current_kprocess(k: &mut dyn KernelContext) -> KernelAddr {
    KernelAddr::new(k.read_u32(KernelAddr::new(CURRENT_KPROCESS_PTR)))
}

fn read_acl(k: &mut dyn KernelContext, addr: KernelAddr) -> [u32; 4] {
    std::array::from_fn(|i| k.read_u32(addr.wrapping_add(4 * i as u32)))
}

fn write_acl(k: &mut dyn KernelContext, addr: KernelAddr, acl: &[u32; 4]) {
    for (i, word) in acl.iter().enumerate() {
        k.write_u32(addr.wrapping_add(4 * i as u32), *word);
    }
}

/// Copies of the ACLs and process id taken right before they are overwritten.
///
/// Written from kernel mode, so every field is atomic.
#[derive(Debug, Default)]
pub struct AclBackup {
    thread: [AtomicU32; 4],
    process: [AtomicU32; 4],
    process_id: AtomicU32,
    acl_saved: AtomicBool,
    pid_saved: AtomicBool,
}

/// Plain copy of an [`AclBackup`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct AclSnapshot {
    /// Thread ACL before the grant
    pub thread: [u32; 4],
    /// Process ACL before the grant
    pub process: [u32; 4],
    /// Process id before it was zeroed
    pub process_id: Option<u32>,
}

impl AclBackup {
    fn save_acls(&self, thread: &[u32; 4], process: &[u32; 4]) {
        for i in 0..4 {
            self.thread[i].store(thread[i], Ordering::SeqCst);
            self.process[i].store(process[i], Ordering::SeqCst);
        }
        self.acl_saved.store(true, Ordering::SeqCst);
    }

    fn save_process_id(&self, pid: u32) {
        self.process_id.store(pid, Ordering::SeqCst);
        self.pid_saved.store(true, Ordering::SeqCst);
    }

    /// The saved values, once the ACLs were captured.
    pub fn snapshot(&self) -> Option<AclSnapshot> {
        if !self.acl_saved.load(Ordering::SeqCst) {
            return None;
        }
        Some(AclSnapshot {
            thread: std::array::from_fn(|i| self.thread[i].load(Ordering::SeqCst)),
            process: std::array::from_fn(|i| self.process[i].load(Ordering::SeqCst)),
            process_id: self
                .pid_saved
                .load(Ordering::SeqCst)
                .then(|| self.process_id.load(Ordering::SeqCst)),
        })
    }
}

/// Opens the syscall ACLs of the current thread and process.
///
/// Kernel mode only. Both ACLs are backed up into `backup` before being
/// overwritten with [`SVC_ACL_FULL`].
pub fn grant_full_svc_access(k: &mut dyn KernelContext, layout: ProcessLayout, backup: &AclBackup) {
    let thread_acl = thread_svc_acl(k);
    let kprocess = current_kprocess(k);
    let process_acl = layout.pointers(kprocess).svc_acl;
    let old_thread = read_acl(k, thread_acl);
    let old_process = read_acl(k, process_acl);
    backup.save_acls(&old_thread, &old_process);
    write_acl(k, thread_acl, &SVC_ACL_FULL);
    write_acl(k, process_acl, &SVC_ACL_FULL);
    k.data_sync_barrier();
}

/// Kernel payload: replaces the current process id with `arg`.
///
/// Returns the previous id, or [`PID_ENTRY_FAILED`] without a session.
pub fn kernel_set_process_id(k: &mut dyn KernelContext, arg: u32) -> u32 {
    // SAFETY: only invoked through svcBackdoor from a step of the registered
    // session.
    let Some(shared) = (unsafe { session::current() }) else {
        return PID_ENTRY_FAILED;
    };
    let pid = shared.descriptor().layout.pointers(current_kprocess(k)).process_id;
    let previous = k.read_u32(pid);
    k.write_u32(pid, arg);
    k.data_sync_barrier();
    previous
}

/// RAII guard presenting process id 0 to the rest of the system.
///
/// Dropping the guard restores the original id if [`PidSwap::restore`] was not
/// called, so the process is never left mis-identified.
pub struct PidSwap<'a, H: Horizon + ?Sized> {
    host: &'a H,
    original: u32,
    zeroed: bool,
}

impl<'a, H: Horizon + ?Sized> PidSwap<'a, H> {
    /// Saves the current process id and sets it to 0.
    pub fn zero(host: &'a H) -> Result<Self> {
        let original = host
            .get_process_id(Handle::CURRENT_PROCESS)
            .op("svcGetProcessId")?;
        // SAFETY: called from a step of the registered session, if any.
        if let Some(shared) = unsafe { session::current() } {
            shared.acl().save_process_id(original);
        }
        let previous = host
            .backdoor(kernel_set_process_id, 0)
            .op("svcBackdoor")?;
        if previous == PID_ENTRY_FAILED {
            return Err(KhaxError::PayloadNotRun);
        }
        let swap = PidSwap {
            host,
            original,
            zeroed: true,
        };
        if previous != original {
            return Err(KhaxError::ProcessId {
                expected: original,
                actual: previous,
            });
        }
        swap.verify(0)?;
        debug!("process id {} zeroed", original);
        Ok(swap)
    }

    /// The id that will be restored.
    pub fn original(&self) -> u32 {
        self.original
    }

    fn verify(&self, expected: u32) -> Result<()> {
        let actual = self
            .host
            .get_process_id(Handle::CURRENT_PROCESS)
            .op("svcGetProcessId")?;
        if actual != expected {
            return Err(KhaxError::ProcessId { expected, actual });
        }
        Ok(())
    }

    /// Writes the original id back and checks that it reads back.
    pub fn restore(mut self) -> Result<()> {
        self.host
            .backdoor(kernel_set_process_id, self.original)
            .op("svcBackdoor")?;
        self.zeroed = false;
        self.verify(self.original)?;
        debug!("process id {} restored", self.original);
        Ok(())
    }
}

impl<H: Horizon + ?Sized> Drop for PidSwap<'_, H> {
    fn drop(&mut self) {
        if !self.zeroed {
            return;
        }
        match self.host.backdoor(kernel_set_process_id, self.original) {
            Ok(_) => warn!("process id {} restored during unwind", self.original),
            Err(code) => warn!("failed to restore process id {}: {}", self.original, code),
        }
    }
}

/// Reconnects to the service manager while presenting process id 0.
///
/// The service manager caches the id at connection time and grants id 0 access
/// to every service.
pub fn grant_service_access<H: Horizon + ?Sized>(host: &H) -> Result<()> {
    let swap = PidSwap::zero(host)?;
    host.srv_exit().op("srvExit")?;
    host.srv_init().op("srvInit")?;
    swap.restore()?;
    info!("service access granted");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_acl_excludes_exactly_three_syscalls() {
        let denied: Vec<u8> = (0..=0x7Fu8)
            .filter(|svc| !svc_allowed(&SVC_ACL_FULL, *svc))
            .collect();
        assert_eq!(denied, [0x00, 0x7E, 0x7F]);
        assert!(svc_allowed(&SVC_ACL_FULL, crate::util::SVC_BACKDOOR));
    }

    #[test]
    fn bit_order_is_little_endian_per_word() {
        let acl = [0, 0, 0, 1 << (0x7B - 96)];
        assert!(svc_allowed(&acl, 0x7B));
        assert!(!svc_allowed(&acl, 0x7A));
    }

    #[test]
    fn empty_backup_has_no_snapshot() {
        let backup = AclBackup::default();
        assert!(backup.snapshot().is_none());
        backup.save_acls(&[1, 2, 3, 4], &[5, 6, 7, 8]);
        let snap = backup.snapshot().unwrap();
        assert_eq!(snap.process, [5, 6, 7, 8]);
        assert_eq!(snap.process_id, None);
        backup.save_process_id(42);
        assert_eq!(backup.snapshot().unwrap().process_id, Some(42));
    }
}
