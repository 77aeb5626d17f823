//! Version/offset registry.
//!
//! One [`VersionDescriptor`] per supported (kernel version, hardware variant)
//! pair. The table is the only place kernel addresses and structure offsets are
//! recorded; everything else derives from the descriptor selected at startup.

use crate::error::{HostOp, KhaxError, Result};
use crate::exploit::TechniqueKind;
use crate::host::Horizon;
use crate::memory::{KernelAddr, PhysAddr, VirtAddr, VirtToPhysResolver};
use itertools::Itertools;
use log::{debug, info};
use serde::Serialize;

/// A packed `major.minor.revision` version as reported by the console.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SystemVersion(u32);

impl SystemVersion {
    /// Packs a version the way the kernel reports it.
    pub const fn new(major: u8, minor: u8, revision: u8) -> Self {
        SystemVersion(((major as u32) << 24) | ((minor as u32) << 16) | ((revision as u32) << 8))
    }

    /// Wraps a packed version.
    pub const fn from_packed(packed: u32) -> Self {
        SystemVersion(packed)
    }

    /// The packed representation.
    pub const fn packed(self) -> u32 {
        self.0
    }

    /// Major component.
    pub const fn major(self) -> u8 {
        (self.0 >> 24) as u8
    }

    /// Minor component.
    pub const fn minor(self) -> u8 {
        (self.0 >> 16) as u8
    }

    /// Revision component.
    pub const fn revision(self) -> u8 {
        (self.0 >> 8) as u8
    }
}

impl std::fmt::Debug for SystemVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SystemVersion({})", self)
    }
}

impl std::fmt::Display for SystemVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major(), self.minor(), self.revision())
    }
}

impl Serialize for SystemVersion {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// First kernel version on which the hardware-variant query is available.
pub const NEW_3DS_QUERY_MIN_KERNEL: SystemVersion = SystemVersion::new(2, 44, 6);

/// Instruction bytes found at the svcCreateThread patch site on every
/// supported kernel.
pub const THREAD_PATCH_ORIGINAL: [u8; 4] = [0xE5, 0x0C, 0xD0, 0x8D];

/// A linear kernel mapping of a physical range.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct DirectMap {
    /// Kernel virtual base
    pub virt: KernelAddr,
    /// Physical base
    pub phys: PhysAddr,
    /// Size of the window in bytes
    pub size: u32,
}

impl DirectMap {
    /// Creates a mapping descriptor.
    pub const fn new(virt: u32, phys: u32, size: u32) -> Self {
        DirectMap {
            virt: KernelAddr::new(virt),
            phys: PhysAddr::new(phys),
            size,
        }
    }

    /// Returns `true` if `phys` lies inside the physical window.
    pub fn contains_phys(&self, phys: PhysAddr) -> bool {
        phys >= self.phys && phys.as_u32() - self.phys.as_u32() < self.size
    }

    /// Returns `true` if `virt` lies inside the virtual window.
    pub fn contains_virt(&self, virt: KernelAddr) -> bool {
        virt >= self.virt && virt.as_u32() - self.virt.as_u32() < self.size
    }

    /// Kernel address of `phys`, if it lies inside the window.
    pub fn phys_to_virt(&self, phys: PhysAddr) -> Option<KernelAddr> {
        self.contains_phys(phys)
            .then(|| self.virt + (phys - self.phys))
    }

    /// Physical address behind `virt`, if it lies inside the window.
    pub fn virt_to_phys(&self, virt: KernelAddr) -> Option<PhysAddr> {
        self.contains_virt(virt)
            .then(|| self.phys + (virt - self.virt))
    }

    /// The kernel address that this window's offset arithmetic turns into
    /// `phys`, even when `phys` lies below the window.
    ///
    /// The kernel heap code translates free-list links with exactly this
    /// arithmetic and never range-checks the result.
    pub fn alias_for_phys(&self, phys: PhysAddr) -> KernelAddr {
        self.virt
            .wrapping_add(phys.as_u32())
            .wrapping_sub(self.phys.as_u32())
    }
}

/// Kernel addresses of the `KProcess` fields the grant primitive touches.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KProcessPointers {
    /// 16-byte syscall access-control list
    pub svc_acl: KernelAddr,
    /// Kernel flags word
    pub kernel_flags: KernelAddr,
    /// Process id word
    pub process_id: KernelAddr,
}

/// `KProcess` layout generation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum ProcessLayout {
    /// Old 3DS kernels 2.34 to 2.40
    Old4_1,
    /// Old 3DS kernels from 2.44
    Old8_0,
    /// New 3DS kernels
    New8_0,
}

impl ProcessLayout {
    /// Field offsets as `(svc_acl, kernel_flags, process_id)`.
    pub const fn offsets(self) -> (u32, u32, u32) {
        match self {
            ProcessLayout::Old4_1 => (0x88, 0xA8, 0xB4),
            ProcessLayout::Old8_0 => (0x88, 0xB0, 0xBC),
            ProcessLayout::New8_0 => (0x90, 0xB8, 0xC4),
        }
    }

    /// Resolves the field addresses of the `KProcess` at `kprocess`.
    pub fn pointers(self, kprocess: KernelAddr) -> KProcessPointers {
        let (acl, flags, pid) = self.offsets();
        KProcessPointers {
            svc_acl: kprocess.wrapping_add(acl),
            kernel_flags: kprocess.wrapping_add(flags),
            process_id: kprocess.wrapping_add(pid),
        }
    }
}

/// Everything the engine needs to know about one kernel build.
#[derive(Debug, PartialEq, Eq, Serialize)]
pub struct VersionDescriptor {
    /// New 3DS hardware
    pub new_3ds: bool,
    /// Exact kernel version
    pub kernel_version: SystemVersion,
    /// Lowest firmware version shipping this kernel (informational)
    pub nominal_version: SystemVersion,
    /// Patch site inside svcCreateThread
    pub thread_patch_address: Option<KernelAddr>,
    /// Patch site of the syscall access check
    pub syscall_patch_address: Option<KernelAddr>,
    /// Kernel mapping of FCRAM
    pub fcram: DirectMap,
    /// Kernel mapping of the object slab
    pub slab: Option<DirectMap>,
    /// `KProcess` layout
    pub layout: ProcessLayout,
}

impl VersionDescriptor {
    /// The technique that applies to this kernel, if any.
    pub fn technique(&self) -> Option<TechniqueKind> {
        match (self.thread_patch_address, self.syscall_patch_address, self.slab) {
            (Some(_), Some(_), _) => Some(TechniqueKind::LegacyHeapCoalesce),
            (None, None, Some(_)) => Some(TechniqueKind::VtableHijack),
            _ => None,
        }
    }

    /// Translates a process-local address into the kernel's FCRAM mapping.
    ///
    /// Returns `None` if the host cannot translate the address or the physical
    /// address lies outside FCRAM.
    pub fn translate_user_to_kernel<R: VirtToPhysResolver + ?Sized>(
        &self,
        resolver: &R,
        addr: VirtAddr,
    ) -> Option<KernelAddr> {
        let phys = resolver.get_phys(addr)?;
        self.fcram.phys_to_virt(phys)
    }
}

const OLD_FCRAM_OLD_MAP: DirectMap = DirectMap::new(0xF000_0000, 0x2000_0000, 0x0800_0000);
const OLD_FCRAM: DirectMap = DirectMap::new(0xE000_0000, 0x2000_0000, 0x0800_0000);
const NEW_FCRAM: DirectMap = DirectMap::new(0xE000_0000, 0x2000_0000, 0x1000_0000);
const OLD_SLAB: DirectMap = DirectMap::new(0xFFF7_0000, 0x1FFA_0000, 0x0004_6000);
const NEW_SLAB: DirectMap = DirectMap::new(0xFFF7_0000, 0x1FFA_0000, 0x0006_0000);

const fn legacy(
    new_3ds: bool,
    kernel: SystemVersion,
    nominal: SystemVersion,
    thread_patch: u32,
    syscall_patch: u32,
    fcram: DirectMap,
    layout: ProcessLayout,
) -> VersionDescriptor {
    VersionDescriptor {
        new_3ds,
        kernel_version: kernel,
        nominal_version: nominal,
        thread_patch_address: Some(KernelAddr::new(thread_patch)),
        syscall_patch_address: Some(KernelAddr::new(syscall_patch)),
        fcram,
        slab: None,
        layout,
    }
}

const fn vtable(new_3ds: bool, kernel: SystemVersion, nominal: SystemVersion) -> VersionDescriptor {
    VersionDescriptor {
        new_3ds,
        kernel_version: kernel,
        nominal_version: nominal,
        thread_patch_address: None,
        syscall_patch_address: None,
        fcram: if new_3ds { NEW_FCRAM } else { OLD_FCRAM },
        slab: Some(if new_3ds { NEW_SLAB } else { OLD_SLAB }),
        layout: if new_3ds {
            ProcessLayout::New8_0
        } else {
            ProcessLayout::Old8_0
        },
    }
}

/// All supported kernels.
pub static VERSION_TABLE: &[VersionDescriptor] = &[
    // Old 3DS, old FCRAM mapping
    legacy(false, SystemVersion::new(2, 34, 0), SystemVersion::new(4, 1, 0), 0xEFF8_3C97, 0xEFF8_27CC, OLD_FCRAM_OLD_MAP, ProcessLayout::Old4_1),
    legacy(false, SystemVersion::new(2, 35, 6), SystemVersion::new(5, 0, 0), 0xEFF8_372F, 0xEFF8_22A8, OLD_FCRAM_OLD_MAP, ProcessLayout::Old4_1),
    legacy(false, SystemVersion::new(2, 36, 0), SystemVersion::new(5, 1, 0), 0xEFF8_372B, 0xEFF8_22A4, OLD_FCRAM_OLD_MAP, ProcessLayout::Old4_1),
    legacy(false, SystemVersion::new(2, 37, 0), SystemVersion::new(6, 0, 0), 0xEFF8_372B, 0xEFF8_22A4, OLD_FCRAM_OLD_MAP, ProcessLayout::Old4_1),
    legacy(false, SystemVersion::new(2, 38, 0), SystemVersion::new(6, 1, 0), 0xEFF8_372B, 0xEFF8_22A4, OLD_FCRAM_OLD_MAP, ProcessLayout::Old4_1),
    legacy(false, SystemVersion::new(2, 39, 4), SystemVersion::new(7, 0, 0), 0xEFF8_372F, 0xEFF8_22A8, OLD_FCRAM_OLD_MAP, ProcessLayout::Old4_1),
    legacy(false, SystemVersion::new(2, 40, 0), SystemVersion::new(7, 2, 0), 0xEFF8_372B, 0xEFF8_22A4, OLD_FCRAM_OLD_MAP, ProcessLayout::Old4_1),
    // Old 3DS, new FCRAM mapping
    legacy(false, SystemVersion::new(2, 44, 6), SystemVersion::new(8, 0, 0), 0xDFF8_3837, 0xDFF8_2290, OLD_FCRAM, ProcessLayout::Old8_0),
    legacy(false, SystemVersion::new(2, 46, 0), SystemVersion::new(9, 0, 0), 0xDFF8_3837, 0xDFF8_2290, OLD_FCRAM, ProcessLayout::Old8_0),
    // New 3DS
    legacy(true, SystemVersion::new(2, 44, 6), SystemVersion::new(8, 0, 0), 0xDFF8_382F, 0xDFF8_2260, NEW_FCRAM, ProcessLayout::New8_0),
    legacy(true, SystemVersion::new(2, 46, 0), SystemVersion::new(9, 0, 0), 0xDFF8_382F, 0xDFF8_2260, NEW_FCRAM, ProcessLayout::New8_0),
    // svcCreateThread patch gone, object slab mapped
    vtable(false, SystemVersion::new(2, 48, 3), SystemVersion::new(9, 3, 0)),
    vtable(false, SystemVersion::new(2, 49, 0), SystemVersion::new(9, 5, 0)),
    vtable(false, SystemVersion::new(2, 50, 1), SystemVersion::new(9, 6, 0)),
    vtable(false, SystemVersion::new(2, 50, 7), SystemVersion::new(10, 0, 0)),
    vtable(false, SystemVersion::new(2, 50, 9), SystemVersion::new(10, 2, 0)),
    vtable(false, SystemVersion::new(2, 50, 11), SystemVersion::new(10, 4, 0)),
    vtable(true, SystemVersion::new(2, 48, 3), SystemVersion::new(9, 3, 0)),
    vtable(true, SystemVersion::new(2, 49, 0), SystemVersion::new(9, 5, 0)),
    vtable(true, SystemVersion::new(2, 50, 1), SystemVersion::new(9, 6, 0)),
    vtable(true, SystemVersion::new(2, 50, 7), SystemVersion::new(10, 0, 0)),
    vtable(true, SystemVersion::new(2, 50, 9), SystemVersion::new(10, 2, 0)),
    vtable(true, SystemVersion::new(2, 50, 11), SystemVersion::new(10, 4, 0)),
];

/// Finds the row for exactly this kernel and hardware variant.
pub fn lookup(kernel: SystemVersion, new_3ds: bool) -> Option<&'static VersionDescriptor> {
    VERSION_TABLE
        .iter()
        .find(|entry| entry.new_3ds == new_3ds && entry.kernel_version == kernel)
}

/// Lowest kernel version present in the table.
pub fn lowest_supported() -> SystemVersion {
    VERSION_TABLE
        .iter()
        .map(|entry| entry.kernel_version)
        .min()
        .unwrap_or_default()
}

/// Every distinct kernel version in the table, ascending.
pub fn supported_kernels() -> Vec<SystemVersion> {
    VERSION_TABLE
        .iter()
        .map(|entry| entry.kernel_version)
        .sorted()
        .dedup()
        .collect()
}

/// Asks the host whether it is a New 3DS.
///
/// Kernels older than [`NEW_3DS_QUERY_MIN_KERNEL`] do not support the query,
/// and no New 3DS ever ran them, so the answer there is `false`.
pub fn is_new_3ds<H: Horizon + ?Sized>(host: &H, kernel: SystemVersion) -> Result<bool> {
    if kernel < NEW_3DS_QUERY_MIN_KERNEL {
        return Ok(false);
    }
    host.check_new_3ds().op("APT_CheckNew3DS")
}

/// Queries the host and returns the matching row.
pub fn lookup_current<H: Horizon + ?Sized>(host: &H) -> Result<&'static VersionDescriptor> {
    let kernel = host.kernel_version();
    let new_3ds = is_new_3ds(host, kernel)?;
    info!(
        "kernel {} firm {} new 3DS {}",
        kernel,
        host.firm_version(),
        new_3ds
    );
    let descriptor = lookup(kernel, new_3ds).ok_or(KhaxError::UnknownVersion { kernel, new_3ds })?;
    debug!(
        "descriptor: thread patch {:?} syscall patch {:?} fcram {} slab {:?}",
        descriptor.thread_patch_address, descriptor.syscall_patch_address, descriptor.fcram.virt, descriptor.slab
    );
    Ok(descriptor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    struct Linear;

    impl VirtToPhysResolver for Linear {
        fn get_phys(&self, virt: VirtAddr) -> Option<PhysAddr> {
            let offset = virt.as_u32().checked_sub(0x1400_0000)?;
            (offset < 0x0800_0000).then(|| PhysAddr::new(0x2000_0000 + offset))
        }
    }

    struct Fixed(u32);

    impl VirtToPhysResolver for Fixed {
        fn get_phys(&self, _: VirtAddr) -> Option<PhysAddr> {
            Some(PhysAddr::new(self.0))
        }
    }

    #[test]
    fn every_row_is_found_by_its_own_key() {
        for entry in VERSION_TABLE {
            let found = lookup(entry.kernel_version, entry.new_3ds).unwrap();
            assert!(std::ptr::eq(found, entry), "{}", entry.kernel_version);
        }
    }

    #[test]
    fn keys_are_unique() {
        let keys: HashSet<_> = VERSION_TABLE
            .iter()
            .map(|e| (e.kernel_version, e.new_3ds))
            .collect();
        assert_eq!(keys.len(), VERSION_TABLE.len());
    }

    #[test]
    fn absent_pairs_are_not_found() {
        let lowest = lowest_supported();
        assert_eq!(lowest, SystemVersion::new(2, 34, 0));
        assert!(lookup(SystemVersion::from_packed(lowest.packed() - 1), false).is_none());
        // No New 3DS ran a 2.34 kernel.
        assert!(lookup(lowest, true).is_none());
        assert!(lookup(SystemVersion::new(2, 51, 0), false).is_none());
        assert!(lookup(SystemVersion::new(2, 44, 5), false).is_none());
    }

    #[test]
    fn patch_addresses_are_returned_unmodified() {
        let entry = lookup(SystemVersion::new(2, 46, 0), false).unwrap();
        assert_eq!(entry.thread_patch_address, Some(KernelAddr::new(0xDFF8_3837)));
        assert_eq!(entry.syscall_patch_address, Some(KernelAddr::new(0xDFF8_2290)));
        let entry = lookup(SystemVersion::new(2, 46, 0), true).unwrap();
        assert_eq!(entry.thread_patch_address, Some(KernelAddr::new(0xDFF8_382F)));
        assert_eq!(entry.fcram.size, 0x1000_0000);
    }

    #[test]
    fn technique_selection() {
        for entry in VERSION_TABLE {
            let expected = if entry.thread_patch_address.is_some() {
                TechniqueKind::LegacyHeapCoalesce
            } else {
                TechniqueKind::VtableHijack
            };
            assert_eq!(entry.technique(), Some(expected));
        }
    }

    #[test]
    fn translation_is_a_constant_offset() {
        for entry in VERSION_TABLE {
            let delta = entry.fcram.virt.as_u32().wrapping_sub(entry.fcram.phys.as_u32());
            let mut seen = HashSet::new();
            for page in [0u32, 1, 2, 0x100, 0x7FFF] {
                let user = VirtAddr::new(0x1400_0000 + page * 0x1000 + 0x24);
                let kernel = entry.translate_user_to_kernel(&Linear, user).unwrap();
                let phys = Linear.get_phys(user).unwrap();
                assert_eq!(kernel.as_u32().wrapping_sub(phys.as_u32()), delta);
                assert!(seen.insert(kernel));
            }
        }
    }

    #[test]
    fn translation_rejects_addresses_outside_fcram() {
        let entry = lookup(SystemVersion::new(2, 40, 0), false).unwrap();
        assert_eq!(entry.translate_user_to_kernel(&Fixed(0x1FFF_F000), VirtAddr::new(0)), None);
        assert_eq!(entry.translate_user_to_kernel(&Fixed(0x2800_0000), VirtAddr::new(0)), None);
        assert_eq!(entry.translate_user_to_kernel(&Linear, VirtAddr::new(0x0800_0000)), None);
        assert_eq!(
            entry.translate_user_to_kernel(&Fixed(0x27FF_FFFF), VirtAddr::new(0)),
            Some(KernelAddr::new(0xF7FF_FFFF))
        );
    }

    #[test]
    fn slab_alias_lands_below_fcram_window() {
        let entry = lookup(SystemVersion::new(2, 50, 11), false).unwrap();
        let slab = entry.slab.unwrap();
        let alias = entry.fcram.alias_for_phys(slab.phys + 0x4000);
        assert_eq!(alias, KernelAddr::new(0xDFFA_4000));
        assert!(!entry.fcram.contains_virt(alias));
        assert_eq!(slab.virt_to_phys(KernelAddr::new(0xFFF7_4040)), Some(PhysAddr::new(0x1FFA_4040)));
        assert_eq!(slab.virt_to_phys(KernelAddr::new(0xFFFF_9000)), None);
    }

    #[test]
    fn process_layouts() {
        let base = KernelAddr::new(0xFFF7_1000);
        let old = ProcessLayout::Old4_1.pointers(base);
        assert_eq!(old.svc_acl, KernelAddr::new(0xFFF7_1088));
        assert_eq!(old.process_id, KernelAddr::new(0xFFF7_10B4));
        let new = ProcessLayout::New8_0.pointers(base);
        assert_eq!(new.kernel_flags, KernelAddr::new(0xFFF7_10B8));
        assert_eq!(new.process_id, KernelAddr::new(0xFFF7_10C4));
    }

    #[test]
    fn version_formatting() {
        let v = SystemVersion::new(2, 46, 0);
        assert_eq!(v.packed(), 0x022E_0000);
        assert_eq!(v.to_string(), "2.46.0");
        assert_eq!(supported_kernels().len(), 15);
    }
}
