//! [`Horizon`] over the simulated console.

use crate::config::SimConfig;
use crate::error::{
    KERNEL_FAULT, MISALIGNED_ADDRESS, NOT_IMPLEMENTED, OUT_OF_MEMORY, SRV_NOT_CONNECTED,
    SVC_DENIED, SimError,
};
use crate::kernel::SimKernel;
use crate::phys::page_chunks;
use crate::state::{HEAP_BASE, HEAP_LIMIT, LINEAR_BASE, SimObject, SimState};
use khax_core::ResultCode;
use khax_core::grant::svc_allowed;
use khax_core::gspwn::GpuCopyEngine;
use khax_core::host::{ArbitrationType, Handle, Horizon, MemOp, MemPerm, ResetType, ThreadJob};
use khax_core::kernel::{KernelContext, KernelEntry};
use khax_core::kernel::ktimer::{CLOSE_SLOT, DESTRUCTOR_SLOT, VTABLE_OFFSET};
use khax_core::memory::free_block::NEXT_OFFSET;
use khax_core::memory::{KernelAddr, PhysAddr, VirtAddr, VirtToPhysResolver};
use khax_core::util::{PAGE_SIZE, SVC_BACKDOOR, USER_SPACE_END};
use khax_core::version::{SystemVersion, THREAD_PATCH_ORIGINAL};
use log::{debug, info, trace, warn};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

const PAGE: u32 = PAGE_SIZE as u32;

/// Offset added to linear allocations when misalignment is requested.
const MISALIGNMENT: u32 = 0x10;

/// Kernels older than this have no `APT:CheckNew3DS`.
const CHECK_NEW_3DS_SINCE: SystemVersion = SystemVersion::new(2, 44, 6);

/// Services an ordinary application may open.
const APPLICATION_SERVICES: [&str; 7] = [
    "APT:U", "gsp::Gpu", "hid:USER", "fs:USER", "cfg:u", "ptm:u", "ndm:u",
];

/// Decrements the live thread count when a simulated thread ends.
struct LiveThread(Arc<AtomicU32>);

impl Drop for LiveThread {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A simulated console.
///
/// All state sits behind one lock. The only call that gives the lock up
/// half way is a regular page commit while helper threads run: after mapping
/// each page it waits, up to [`SimConfig::preempt_window`], for the process to
/// store to that page before reading the page's free-list node. That models
/// the preemption window the vtable hijack races against.
pub struct SimHorizon {
    config: SimConfig,
    state: Mutex<SimState>,
    written: Condvar,
    live_threads: Arc<AtomicU32>,
    copy_wait_fault: AtomicU32,
}

impl SimHorizon {
    /// Boots a console described by `config`.
    pub fn new(config: SimConfig) -> Self {
        let mut state = SimState::new(&config);
        state.srv_pid = Some(state.process_id());
        info!(
            "sim: kernel {} firm {} ({})",
            config.kernel_version,
            config.firm_version,
            if config.new_3ds { "New 3DS" } else { "Old 3DS" }
        );
        SimHorizon {
            config,
            state: Mutex::new(state),
            written: Condvar::new(),
            live_threads: Arc::new(AtomicU32::new(0)),
            copy_wait_fault: AtomicU32::new(0),
        }
    }

    /// The configuration the console booted with.
    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `f` in supervisor mode. A kernel fault during `f` becomes
    /// [`KERNEL_FAULT`].
    fn in_kernel<R>(&self, f: impl FnOnce(&mut dyn KernelContext) -> R) -> Result<R, ResultCode> {
        let mut state = self.lock();
        let clean = state.panic.is_none();
        let result = f(&mut SimKernel::new(&mut *state));
        if clean && state.panic.is_some() {
            return Err(KERNEL_FAULT);
        }
        Ok(result)
    }

    fn preemptible(&self) -> bool {
        self.config.race_preemption && self.live_threads.load(Ordering::SeqCst) >= 2
    }

    fn alloc(&self, addr: VirtAddr, pages: u32) -> Result<VirtAddr, ResultCode> {
        if !addr.is_page_aligned() {
            return Err(MISALIGNED_ADDRESS);
        }
        let end = addr.as_u32() as u64 + (pages * PAGE) as u64;
        if addr.as_u32() < HEAP_BASE || end > HEAP_LIMIT as u64 {
            return Err(ResultCode::INVALID_ADDRESS);
        }
        let preempt = self.preemptible();
        let mut state = self.lock();
        if (0..pages).any(|i| state.is_mapped(addr + i * PAGE)) {
            return Err(ResultCode::INVALID_ADDRESS);
        }
        for i in 0..pages {
            let page = addr + i * PAGE;
            let (head, phys) = match state.peek_head() {
                Ok(Some(head)) => head,
                Ok(None) => return Err(OUT_OF_MEMORY),
                Err(err) => {
                    state.fault(err);
                    return Err(KERNEL_FAULT);
                }
            };
            state.map(page, phys);
            trace!("sim: commit {} <- {} ({})", page, head, phys);
            if preempt {
                state.watch(page);
                let (guard, wait) = self
                    .written
                    .wait_timeout_while(state, self.config.preempt_window, |s| !s.watch_hit())
                    .unwrap_or_else(PoisonError::into_inner);
                state = guard;
                if wait.timed_out() {
                    debug!("sim: no store to {} while preempted", page);
                }
                state.unwatch();
            }
            if let Err(err) = state.consume_head(head) {
                state.fault(err);
                return Err(KERNEL_FAULT);
            }
            state.phys.zero_page(phys);
        }
        Ok(addr)
    }

    fn alloc_linear(&self, pages: u32) -> Result<VirtAddr, ResultCode> {
        let mut state = self.lock();
        let kva = match state.carve_contiguous(pages) {
            Ok(Some(kva)) => kva,
            Ok(None) => return Err(OUT_OF_MEMORY),
            Err(err) => {
                state.fault(err);
                return Err(KERNEL_FAULT);
            }
        };
        let phys = state
            .fcram
            .virt_to_phys(kva)
            .ok_or(ResultCode::INVALID_ADDRESS)?;
        let base = VirtAddr::new(LINEAR_BASE + (phys - state.fcram.phys));
        for i in 0..pages {
            state.map(base + i * PAGE, phys + i * PAGE);
            state.phys.zero_page(phys + i * PAGE);
        }
        debug!("sim: linear commit {} pages at {} ({})", pages, base, phys);
        if self.config.misaligned_linear_alloc {
            return Ok(base + MISALIGNMENT);
        }
        Ok(base)
    }

    fn free(&self, addr: VirtAddr, pages: u32) -> Result<VirtAddr, ResultCode> {
        let mut state = self.lock();
        let first = addr.page_base();
        if (0..pages).any(|i| !state.is_mapped(first + i * PAGE)) {
            return Err(ResultCode::INVALID_ADDRESS);
        }
        let mut result = Ok(addr);
        for i in 0..pages {
            let Some(phys) = state.unmap(first + i * PAGE) else {
                continue;
            };
            let kva = match state.fcram.phys_to_virt(phys) {
                Some(kva) => kva,
                None => {
                    state.fault(SimError::ForeignPage(phys));
                    result = Err(KERNEL_FAULT);
                    state.fcram.alias_for_phys(phys)
                }
            };
            if let Err(err) = state.insert_free(kva) {
                state.fault(err);
                result = Err(KERNEL_FAULT);
            }
        }
        result
    }

    fn processor_valid(&self, processor: i32) -> bool {
        match processor {
            -2..=1 => true,
            2 | 3 => self.config.new_3ds,
            _ => false,
        }
    }

    /// Thread ACL of the main thread.
    pub fn thread_acl(&self) -> [u32; 4] {
        self.lock().thread_acl()
    }

    /// Syscall ACL of the process.
    pub fn process_acl(&self) -> [u32; 4] {
        self.lock().process_acl()
    }

    /// Process id as stored in the process object.
    pub fn process_id(&self) -> u32 {
        self.lock().process_id()
    }

    /// The four bytes at the svcCreateThread patch site, on kernels that have
    /// one.
    pub fn thread_patch_bytes(&self) -> Option<[u8; 4]> {
        self.lock().thread_patch_bytes()
    }

    /// Returns `true` if the free list is sorted, doubly linked and inside
    /// FCRAM.
    pub fn free_list_consistent(&self) -> bool {
        self.lock().free_list_consistent()
    }

    /// Free runs as `(address, page count)`.
    pub fn free_blocks(&self) -> Result<Vec<(KernelAddr, u32)>, SimError> {
        self.lock().free_blocks()
    }

    /// Returns `true` if some instruction cache invalidation covered `addr`.
    pub fn icache_invalidated(&self, addr: KernelAddr) -> bool {
        self.lock().icache_invalidated(addr)
    }

    /// Returns `true` while kernel code runs with interrupts masked.
    pub fn interrupts_masked(&self) -> bool {
        self.lock().interrupts_masked
    }

    /// First fault the kernel took, if any. On hardware this is a crash.
    pub fn kernel_panic(&self) -> Option<SimError> {
        self.lock().panic.clone()
    }

    /// Number of timer objects the kernel destroyed.
    pub fn timers_destroyed(&self) -> u32 {
        self.lock().timers_destroyed
    }

    /// Process id the service manager recorded at connection time.
    pub fn srv_pid(&self) -> Option<u32> {
        self.lock().srv_pid
    }

    /// Returns `true` if the page holding `addr` is mapped.
    pub fn is_mapped(&self, addr: VirtAddr) -> bool {
        self.lock().is_mapped(addr)
    }

    /// Replaces the forward link of the free-list node at `page`, as a stray
    /// write from some other process would.
    pub fn overwrite_free_link(&self, page: VirtAddr, next: KernelAddr) -> Result<(), SimError> {
        let mut state = self.lock();
        let phys = state
            .resolve(page.page_base())
            .ok_or(SimError::UnmappedUser(page))?;
        state.phys.write_u32(phys + NEXT_OFFSET as u32, next.as_u32());
        Ok(())
    }

    /// Makes the `nth` copy wait from now on fail with
    /// [`ResultCode::INVALID_ADDRESS`]. The copy itself still lands, as on a
    /// console whose GPU interrupt got lost. Zero disarms.
    pub fn fail_copy_wait(&self, nth: u32) {
        self.copy_wait_fault.store(nth, Ordering::SeqCst);
    }

    /// Reads kernel memory.
    pub fn read_kernel(&self, addr: KernelAddr, buf: &mut [u8]) -> Result<(), SimError> {
        self.lock().kernel_read(addr, buf)
    }

    /// Writes kernel memory.
    pub fn write_kernel(&self, addr: KernelAddr, data: &[u8]) -> Result<(), SimError> {
        self.lock().kernel_write(addr, data)
    }

    fn gpu_read(state: &SimState, addr: VirtAddr, buf: &mut [u8]) -> Result<(), ResultCode> {
        for (at, offset, n) in page_chunks(addr.as_u32(), buf.len()) {
            let phys = state
                .resolve(VirtAddr::new(at))
                .ok_or(ResultCode::INVALID_ADDRESS)?;
            state.phys.read(phys, &mut buf[offset..offset + n]);
        }
        Ok(())
    }

    fn gpu_targets(state: &SimState, addr: VirtAddr, len: usize) -> Result<Vec<(PhysAddr, usize, usize)>, ResultCode> {
        page_chunks(addr.as_u32(), len)
            .map(|(at, offset, n)| {
                state
                    .resolve(VirtAddr::new(at))
                    .map(|phys| (phys, offset, n))
                    .ok_or(ResultCode::INVALID_ADDRESS)
            })
            .collect()
    }
}

impl VirtToPhysResolver for SimHorizon {
    fn get_phys(&self, virt: VirtAddr) -> Option<PhysAddr> {
        self.lock().resolve(virt)
    }
}

impl GpuCopyEngine for SimHorizon {
    fn flush_data_cache(&self, addr: VirtAddr, len: usize) -> Result<(), ResultCode> {
        let state = self.lock();
        let unmapped = page_chunks(addr.as_u32(), len.max(1))
            .any(|(at, _, _)| !state.is_mapped(VirtAddr::new(at)));
        if unmapped {
            return Err(ResultCode::INVALID_ADDRESS);
        }
        Ok(())
    }

    fn invalidate_data_cache(&self, addr: VirtAddr, len: usize) -> Result<(), ResultCode> {
        if addr.as_u32() as u64 + len as u64 > USER_SPACE_END as u64 {
            return Err(ResultCode::INVALID_ADDRESS);
        }
        Ok(())
    }

    fn texture_copy(&self, src: VirtAddr, dst: VirtAddr, len: usize) -> Result<(), ResultCode> {
        let mut state = self.lock();
        let mut data = vec![0u8; len];
        Self::gpu_read(&state, src, &mut data)?;
        for (phys, offset, n) in Self::gpu_targets(&state, dst, len)? {
            state.phys.write(phys, &data[offset..offset + n]);
        }
        trace!("sim: texture copy {} -> {} ({} bytes)", src, dst, len);
        Ok(())
    }

    fn wait_for_copy(&self, _: Duration) -> Result<(), ResultCode> {
        let countdown = self
            .copy_wait_fault
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if countdown == Ok(1) {
            warn!("sim: dropping copy completion");
            return Err(ResultCode::INVALID_ADDRESS);
        }
        Ok(())
    }
}

impl Horizon for SimHorizon {
    fn kernel_version(&self) -> SystemVersion {
        self.config.kernel_version
    }

    fn firm_version(&self) -> SystemVersion {
        self.config.firm_version
    }

    fn check_new_3ds(&self) -> Result<bool, ResultCode> {
        if self.config.kernel_version < CHECK_NEW_3DS_SINCE {
            return Err(NOT_IMPLEMENTED);
        }
        Ok(self.config.new_3ds)
    }

    fn control_memory(
        &self,
        op: MemOp,
        addr: VirtAddr,
        size: usize,
        _: MemPerm,
    ) -> Result<VirtAddr, ResultCode> {
        let pages = size.div_ceil(PAGE_SIZE) as u32;
        if pages == 0 {
            return Err(ResultCode::OUT_OF_RANGE);
        }
        match op {
            MemOp::Alloc => self.alloc(addr, pages),
            MemOp::AllocLinear => self.alloc_linear(pages),
            MemOp::Free => self.free(addr, pages),
        }
    }

    fn linear_alloc(&self, size: usize, align: usize) -> Option<VirtAddr> {
        self.lock().linear_alloc(size, align)
    }

    fn linear_free(&self, addr: VirtAddr) {
        if !self.lock().linear_free(addr) {
            warn!("sim: linear free of unknown block {}", addr);
        }
    }

    fn heap_end(&self) -> VirtAddr {
        self.lock().heap_end()
    }

    fn read(&self, addr: VirtAddr, buf: &mut [u8]) -> Result<(), ResultCode> {
        self.lock().user_read(addr, buf)
    }

    fn write(&self, addr: VirtAddr, data: &[u8]) -> Result<(), ResultCode> {
        let hit = self.lock().user_write(addr, data)?;
        if hit {
            self.written.notify_all();
        }
        Ok(())
    }

    fn spawn_thread(
        &self,
        job: ThreadJob,
        priority: i32,
        processor: i32,
    ) -> Result<JoinHandle<()>, ResultCode> {
        if !(0..=0x3F).contains(&priority) || !self.processor_valid(processor) {
            return Err(ResultCode::OUT_OF_RANGE);
        }
        if processor == 1 && self.lock().cpu_time_limit == 0 {
            return Err(ResultCode::OUT_OF_RANGE);
        }
        self.live_threads.fetch_add(1, Ordering::SeqCst);
        let live = LiveThread(Arc::clone(&self.live_threads));
        std::thread::Builder::new()
            .name(format!("sim-core{}", processor))
            .spawn(move || {
                let _live = live;
                job();
            })
            .map_err(|err| {
                warn!("sim: thread spawn failed: {}", err);
                OUT_OF_MEMORY
            })
    }

    fn create_address_arbiter(&self) -> Result<Handle, ResultCode> {
        Ok(self.lock().add_handle(SimObject::Arbiter))
    }

    fn arbitrate_address(
        &self,
        arbiter: Handle,
        addr: VirtAddr,
        kind: ArbitrationType,
        value: i32,
        _: Duration,
    ) -> Result<(), ResultCode> {
        let mut state = self.lock();
        if state.handle(arbiter) != Some(&SimObject::Arbiter) {
            return Err(ResultCode::INVALID_HANDLE);
        }
        let mut word = [0u8; 4];
        state.user_read(addr, &mut word)?;
        let mut word = i32::from_le_bytes(word);
        match kind {
            ArbitrationType::Signal => return Ok(()),
            ArbitrationType::DecrementAndWaitIfLessThan
            | ArbitrationType::DecrementAndWaitIfLessThanTimeout => {
                word = word.wrapping_sub(1);
                state.user_write(addr, &word.to_le_bytes())?;
            }
            ArbitrationType::WaitIfLessThan | ArbitrationType::WaitIfLessThanTimeout => {}
        }
        if word < value {
            return Err(ResultCode::TIMEOUT);
        }
        Ok(())
    }

    fn create_timer_raw(&self, _: ResetType) -> Result<(Handle, KernelAddr), ResultCode> {
        let mut state = self.lock();
        let object = state.create_timer().ok_or(OUT_OF_MEMORY)?;
        let handle = state.add_handle(SimObject::Timer(object));
        debug!("sim: timer {:?} at {}", handle, object);
        Ok((handle, object))
    }

    fn create_thread_raw(
        &self,
        priority: u32,
        _entry: u32,
        _arg: u32,
        _stack_top: u32,
        processor: i32,
    ) -> u32 {
        if self.processor_valid(processor) {
            return ResultCode::SUCCESS.raw();
        }
        let patched = self
            .lock()
            .thread_patch_bytes()
            .is_some_and(|bytes| bytes != THREAD_PATCH_ORIGINAL);
        if !patched {
            return ResultCode::OUT_OF_RANGE.raw();
        }
        debug!("sim: svcCreateThread error path runs 0x{:08x}", priority);
        self.in_kernel(|k| k.call(priority, 0))
            .unwrap_or_else(ResultCode::raw)
    }

    fn close_handle(&self, handle: Handle) -> Result<(), ResultCode> {
        let object = self
            .lock()
            .remove_handle(handle)
            .ok_or(ResultCode::INVALID_HANDLE)?;
        let SimObject::Timer(object) = object else {
            return Ok(());
        };
        self.in_kernel(|k| {
            let vtable = KernelAddr::new(k.read_u32(object + VTABLE_OFFSET));
            for slot in [CLOSE_SLOT, DESTRUCTOR_SLOT] {
                let target = k.read_u32(vtable + 4 * slot as u32);
                k.call(target, object.as_u32());
            }
        })
    }

    fn get_process_id(&self, process: Handle) -> Result<u32, ResultCode> {
        if process != Handle::CURRENT_PROCESS {
            return Err(ResultCode::INVALID_HANDLE);
        }
        Ok(self.lock().process_id())
    }

    fn backdoor(&self, entry: KernelEntry, arg: u32) -> Result<u32, ResultCode> {
        let addr = {
            let mut state = self.lock();
            if !svc_allowed(&state.thread_acl(), SVC_BACKDOOR) {
                return Err(SVC_DENIED);
            }
            state.register_entry(entry)
        };
        self.in_kernel(|k| k.call(addr, arg))
    }

    fn kernel_entry_address(&self, entry: KernelEntry) -> u32 {
        self.lock().register_entry(entry)
    }

    fn srv_init(&self) -> Result<(), ResultCode> {
        let mut state = self.lock();
        state.srv_pid = Some(state.process_id());
        debug!("sim: srv connected as pid {:?}", state.srv_pid);
        Ok(())
    }

    fn srv_exit(&self) -> Result<(), ResultCode> {
        self.lock().srv_pid = None;
        Ok(())
    }

    fn srv_get_service_handle(&self, name: &str) -> Result<Handle, ResultCode> {
        let mut state = self.lock();
        let pid = state.srv_pid;
        match pid {
            None => Err(SRV_NOT_CONNECTED),
            Some(pid) if pid == 0 || APPLICATION_SERVICES.contains(&name) => {
                Ok(state.add_handle(SimObject::Service(name.to_string())))
            }
            Some(_) => Err(ResultCode::NOT_AUTHORIZED),
        }
    }

    fn app_cpu_time_limit(&self) -> Result<u32, ResultCode> {
        Ok(self.lock().cpu_time_limit)
    }

    fn set_app_cpu_time_limit(&self, percent: u32) -> Result<(), ResultCode> {
        if percent > 80 {
            return Err(ResultCode::OUT_OF_RANGE);
        }
        self.lock().cpu_time_limit = percent;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use khax_core::grant::{KTHREAD_CONTEXT_OFFSET, SVC_ACL_FULL, THREAD_ACL_BELOW_CONTEXT};
    use khax_core::util::{CURRENT_KTHREAD_PTR, spawn_cancelable};

    fn sim(kernel: SystemVersion) -> SimHorizon {
        SimHorizon::new(SimConfig::new(kernel, false))
    }

    fn set_marker(k: &mut dyn KernelContext, arg: u32) -> u32 {
        k.write_u32(KernelAddr::new(0xFFFF_9040), arg);
        arg
    }

    #[test]
    fn heap_commit_and_release_round_trip() {
        let sim = sim(SystemVersion::new(2, 50, 11));
        let before = sim.free_blocks().unwrap();
        let base = sim.heap_end();
        sim.control_memory(MemOp::Alloc, base, 2 * PAGE_SIZE, MemPerm::ReadWrite)
            .unwrap();
        assert_eq!(sim.heap_end(), base + 2 * PAGE);
        assert_eq!(
            sim.control_memory(MemOp::Alloc, base, PAGE_SIZE, MemPerm::ReadWrite),
            Err(ResultCode::INVALID_ADDRESS)
        );
        assert_eq!(
            sim.control_memory(MemOp::Alloc, base + 0x800, PAGE_SIZE, MemPerm::ReadWrite),
            Err(MISALIGNED_ADDRESS)
        );
        sim.write_word(base, 7).unwrap();
        sim.control_memory(MemOp::Free, base, 2 * PAGE_SIZE, MemPerm::None)
            .unwrap();
        assert_eq!(sim.free_blocks().unwrap(), before);
        assert_eq!(sim.read_word(base), Err(ResultCode::INVALID_ADDRESS));
    }

    #[test]
    fn linear_commits_translate_by_offset() {
        let sim = sim(SystemVersion::new(2, 46, 0));
        let base = sim
            .control_memory(MemOp::AllocLinear, VirtAddr::NULL, 3 * PAGE_SIZE, MemPerm::ReadWrite)
            .unwrap();
        let phys = sim.get_phys(base).unwrap();
        assert_eq!(sim.get_phys(base + 2 * PAGE), Some(phys + 2 * PAGE));
        sim.control_memory(MemOp::Free, base + PAGE, PAGE_SIZE, MemPerm::None)
            .unwrap();
        assert!(!sim.is_mapped(base + PAGE));
        assert_eq!(sim.get_phys(base + PAGE), Some(phys + PAGE));
        assert!(sim.free_list_consistent());
    }

    #[test]
    fn gpu_copies_reach_freed_pages() {
        let sim = sim(SystemVersion::new(2, 46, 0));
        let base = sim
            .control_memory(MemOp::AllocLinear, VirtAddr::NULL, 2 * PAGE_SIZE, MemPerm::ReadWrite)
            .unwrap();
        sim.control_memory(MemOp::Free, base, PAGE_SIZE, MemPerm::None)
            .unwrap();
        let scratch = sim.linear_alloc(64, 64).unwrap();
        assert!(sim.flush_data_cache(base, 20).is_err());
        assert!(sim.invalidate_data_cache(base, 20).is_ok());
        sim.texture_copy(base, scratch, 20).unwrap();
        assert_eq!(sim.read_word(scratch).unwrap(), 1);
    }

    #[test]
    fn arbitration_distinguishes_unmapped_addresses() {
        let sim = sim(SystemVersion::new(2, 50, 11));
        let arbiter = sim.create_address_arbiter().unwrap();
        let page = sim.heap_end();
        let wait = |addr| {
            sim.arbitrate_address(arbiter, addr, ArbitrationType::WaitIfLessThanTimeout, 0, Duration::ZERO)
        };
        assert_eq!(wait(page), Err(ResultCode::INVALID_ADDRESS));
        sim.control_memory(MemOp::Alloc, page, PAGE_SIZE, MemPerm::ReadWrite)
            .unwrap();
        assert_eq!(wait(page), Ok(()));
        assert_eq!(
            sim.arbitrate_address(
                arbiter,
                page,
                ArbitrationType::DecrementAndWaitIfLessThan,
                0,
                Duration::ZERO
            ),
            Err(ResultCode::TIMEOUT)
        );
        assert_eq!(sim.read_word(page).unwrap(), u32::MAX);
        assert_eq!(
            sim.arbitrate_address(Handle(1), page, ArbitrationType::Signal, 0, Duration::ZERO),
            Err(ResultCode::INVALID_HANDLE)
        );
    }

    #[test]
    fn commits_wait_for_a_store_while_helpers_run() {
        let sim = Arc::new(SimHorizon::new(
            SimConfig::new(SystemVersion::new(2, 50, 11), false).preempt_window(Duration::from_secs(5)),
        ));
        sim.set_app_cpu_time_limit(5).unwrap();
        let page = sim.heap_end();
        let spinner = spawn_cancelable(&*sim, 0x18, 1, |running| {
            while running.load(Ordering::Relaxed) {
                std::hint::spin_loop();
            }
        })
        .unwrap();
        let host = Arc::clone(&sim);
        let mapper = spawn_cancelable(&*sim, 0x18, 1, move |_| {
            host.control_memory(MemOp::Alloc, page, PAGE_SIZE, MemPerm::ReadWrite)
        })
        .unwrap();
        while !sim.is_mapped(page) {
            std::thread::yield_now();
        }
        // Shrink the head run to this one page before the kernel reads it.
        sim.write_word(page, 1).unwrap();
        assert_eq!(mapper.join(), Some(Ok(page)));
        spinner.join();
        assert!(sim.free_blocks().unwrap().is_empty());
        assert_eq!(sim.kernel_panic(), None);
    }

    #[test]
    fn thread_creation_checks_its_arguments() {
        let sim = sim(SystemVersion::new(2, 50, 11));
        let job = || Box::new(|| {}) as ThreadJob;
        assert!(sim.spawn_thread(job(), 0x40, 0).is_err());
        assert!(sim.spawn_thread(job(), 0x18, 2).is_err());
        assert!(sim.spawn_thread(job(), 0x18, 1).is_err());
        sim.set_app_cpu_time_limit(5).unwrap();
        sim.spawn_thread(job(), 0x18, 1).unwrap().join().unwrap();
        assert_eq!(sim.create_thread_raw(0, 0, 0, 0, 0x7FFF_FFFF), ResultCode::OUT_OF_RANGE.raw());
    }

    #[test]
    fn backdoor_needs_the_acl_bit() {
        let sim = sim(SystemVersion::new(2, 46, 0));
        assert_eq!(sim.backdoor(set_marker, 5), Err(SVC_DENIED));
        {
            let mut state = sim.lock();
            let kthread = state.kernel_read_u32(KernelAddr::new(CURRENT_KTHREAD_PTR)).unwrap();
            let context = state
                .kernel_read_u32(KernelAddr::new(kthread) + KTHREAD_CONTEXT_OFFSET)
                .unwrap();
            let acl = KernelAddr::new(context) - THREAD_ACL_BELOW_CONTEXT;
            for (i, word) in SVC_ACL_FULL.iter().enumerate() {
                state.kernel_write_u32(acl + 4 * i as u32, *word).unwrap();
            }
        }
        assert_eq!(sim.thread_acl(), SVC_ACL_FULL);
        assert_eq!(sim.backdoor(set_marker, 5), Ok(5));
        let mut marker = [0u8; 4];
        sim.read_kernel(KernelAddr::new(0xFFFF_9040), &mut marker).unwrap();
        assert_eq!(u32::from_le_bytes(marker), 5);
    }

    #[test]
    fn timers_run_their_vtable_on_close() {
        let sim = sim(SystemVersion::new(2, 50, 11));
        let (timer, object) = sim.create_timer_raw(ResetType::OneShot).unwrap();
        assert!(object.as_u32() >= USER_SPACE_END);
        sim.close_handle(timer).unwrap();
        assert_eq!(sim.timers_destroyed(), 1);
        assert_eq!(sim.close_handle(timer), Err(ResultCode::INVALID_HANDLE));
    }

    #[test]
    fn services_follow_the_connection_pid() {
        let sim = sim(SystemVersion::new(2, 50, 11));
        assert!(sim.srv_get_service_handle("APT:U").is_ok());
        assert_eq!(sim.srv_get_service_handle("am:net"), Err(ResultCode::NOT_AUTHORIZED));
        sim.srv_exit().unwrap();
        assert_eq!(sim.srv_get_service_handle("APT:U"), Err(SRV_NOT_CONNECTED));
        let pid_offset = sim.lock().layout.offsets().2;
        sim.write_kernel(KernelAddr::new(0xFFF7_1000) + pid_offset, &0u32.to_le_bytes())
            .unwrap();
        sim.srv_init().unwrap();
        assert_eq!(sim.srv_pid(), Some(0));
        assert!(sim.srv_get_service_handle("am:net").is_ok());
    }

    #[test]
    fn check_new_3ds_depends_on_the_kernel() {
        assert_eq!(sim(SystemVersion::new(2, 40, 0)).check_new_3ds(), Err(NOT_IMPLEMENTED));
        assert_eq!(sim(SystemVersion::new(2, 46, 0)).check_new_3ds(), Ok(false));
    }

    #[test]
    fn armed_copy_wait_fails_once_after_the_copy_lands() {
        let sim = sim(SystemVersion::new(2, 46, 0));
        let src = sim.linear_alloc(64, 64).unwrap();
        let dst = sim.linear_alloc(64, 64).unwrap();
        sim.write(src, &[0x5A; 64]).unwrap();
        sim.fail_copy_wait(2);
        assert_eq!(sim.wait_for_copy(Duration::from_millis(1)), Ok(()));
        sim.texture_copy(src, dst, 64).unwrap();
        assert_eq!(
            sim.wait_for_copy(Duration::from_millis(1)),
            Err(ResultCode::INVALID_ADDRESS)
        );
        let mut copied = [0u8; 64];
        sim.read(dst, &mut copied).unwrap();
        assert_eq!(copied, [0x5A; 64]);
        assert_eq!(sim.wait_for_copy(Duration::from_millis(1)), Ok(()));
    }
}
