use crate::config::SimConfig;
use crate::error::SimError;
use crate::kernel::{NATIVE_NOOP, NATIVE_TIMER_CLOSE, NATIVE_TIMER_DESTROY, native_address};
use crate::phys::{PhysMemory, page_chunks};
use khax_core::ResultCode;
use khax_core::grant::{KTHREAD_CONTEXT_OFFSET, THREAD_ACL_BELOW_CONTEXT};
use khax_core::host::Handle;
use khax_core::kernel::KernelEntry;
use khax_core::kernel::ktimer::{CLOSE_SLOT, DESTRUCTOR_SLOT, VTABLE_LEN};
use khax_core::memory::free_block::free_block;
use khax_core::memory::{KernelAddr, PhysAddr, VirtAddr};
use khax_core::util::{CURRENT_KTHREAD_PTR, PAGE_MASK, PAGE_SIZE, USER_SPACE_END};
use khax_core::version::{DirectMap, ProcessLayout, THREAD_PATCH_ORIGINAL, lookup};
use log::{debug, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, HashMap};

/// Linear (physically contiguous) mappings start here.
pub(crate) const LINEAR_BASE: u32 = 0x1400_0000;
/// Regular heap.
pub(crate) const HEAP_BASE: u32 = 0x0800_0000;
pub(crate) const HEAP_LIMIT: u32 = 0x1000_0000;

const AXI_PHYS: u32 = 0x1FF8_0000;
const AXI_SIZE: u32 = 0x0008_0000;
const SLAB_PHYS: u32 = 0x1FFA_0000;
const TIMER_VTABLE_PHYS: u32 = SLAB_PHYS + 0x100;
const KPROCESS_PHYS: u32 = SLAB_PHYS + 0x1000;
const KTHREAD_PHYS: u32 = SLAB_PHYS + 0x2000;
const TIMER_PHYS: u32 = SLAB_PHYS + 0x4040;
pub(crate) const TIMER_SIZE: u32 = 0x40;
const MAX_TIMERS: u32 = 62;
const STACK_PAGES: u32 = 16;

/// Fallback FCRAM mapping for kernels outside the version table.
const DEFAULT_FCRAM: DirectMap = DirectMap::new(0xE000_0000, 0x2000_0000, 0x0800_0000);

const USER_CODE_BASE: u32 = 0x0010_0000;
pub(crate) const CODE_STRIDE: u32 = 0x20;

pub(crate) const FREE_WALK_LIMIT: usize = 1 << 16;

/// Kernel objects reachable through a handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SimObject {
    Timer(KernelAddr),
    Arbiter,
    Service(String),
}

/// The whole mutable state of the simulated console.
pub(crate) struct SimState {
    pub(crate) fcram: DirectMap,
    pub(crate) slab: Option<DirectMap>,
    pub(crate) layout: ProcessLayout,
    pub(crate) thread_patch: Option<KernelAddr>,
    pub(crate) phys: PhysMemory,
    page_table: BTreeMap<u32, PhysAddr>,
    kernel_store: Box<[u8; PAGE_SIZE]>,
    pub(crate) free_head: KernelAddr,
    linear_blocks: BTreeMap<u32, u32>,
    pool_end: u32,
    entries: Vec<KernelEntry>,
    handles: HashMap<u32, SimObject>,
    next_handle: u32,
    timers_created: u32,
    pub(crate) timers_destroyed: u32,
    pub(crate) interrupts_masked: bool,
    pub(crate) icache_invalidations: Vec<(KernelAddr, usize)>,
    pub(crate) panic: Option<SimError>,
    pub(crate) srv_pid: Option<u32>,
    pub(crate) cpu_time_limit: u32,
    thread_acl: PhysAddr,
    kprocess: PhysAddr,
    watch: Option<u32>,
    watch_hit: bool,
}

fn random_acl(rng: &mut StdRng) -> [u32; 4] {
    let mut acl: [u32; 4] = std::array::from_fn(|_| rng.random::<u32>());
    acl[0] &= !1;
    // svc 0x7B and the nonexistent 0x7E/0x7F
    acl[3] &= !(1 << (0x7B - 96)) & 0x3FFF_FFFF;
    acl
}

impl SimState {
    pub(crate) fn new(config: &SimConfig) -> Self {
        let descriptor = lookup(config.kernel_version, config.new_3ds);
        let (fcram, slab, layout, thread_patch) = match descriptor {
            Some(d) => (d.fcram, d.slab, d.layout, d.thread_patch_address),
            None => {
                warn!(
                    "kernel {} not in the version table, using the default layout",
                    config.kernel_version
                );
                (DEFAULT_FCRAM, None, ProcessLayout::Old8_0, None)
            }
        };
        let mut state = SimState {
            fcram,
            slab,
            layout,
            thread_patch,
            phys: PhysMemory::default(),
            page_table: BTreeMap::new(),
            kernel_store: Box::new([0u8; PAGE_SIZE]),
            free_head: KernelAddr::NULL,
            linear_blocks: BTreeMap::new(),
            pool_end: LINEAR_BASE,
            entries: Vec::new(),
            handles: HashMap::new(),
            next_handle: 0x0001_0002,
            timers_created: 0,
            timers_destroyed: 0,
            interrupts_masked: false,
            icache_invalidations: Vec::new(),
            panic: None,
            srv_pid: None,
            cpu_time_limit: config.cpu_time_limit,
            thread_acl: PhysAddr::NULL,
            kprocess: PhysAddr::new(KPROCESS_PHYS),
            watch: None,
            watch_hit: false,
        };
        state.build_memory_map(config);
        state.build_kernel_objects(config);
        state
    }

    fn build_memory_map(&mut self, config: &SimConfig) {
        let page = PAGE_SIZE as u32;
        let pool = config.user_pool_size.pages() as u32;
        for i in 0..pool {
            self.page_table
                .insert(LINEAR_BASE + i * page, self.fcram.phys + i * page);
        }
        self.pool_end = LINEAR_BASE + pool * page;

        let heap_phys = self.fcram.phys + pool * page;
        for i in 0..config.heap_pages as u32 {
            self.page_table.insert(HEAP_BASE + i * page, heap_phys + i * page);
        }

        let free_phys = heap_phys + config.heap_pages as u32 * page;
        let free_count = (config.free_pages as u32)
            .min((self.fcram.size - (free_phys - self.fcram.phys)) / page - STACK_PAGES);
        let head = self.fcram.alias_for_phys(free_phys);
        let node = free_block(free_count, KernelAddr::NULL, KernelAddr::NULL);
        self.phys.write(free_phys, node.as_bytes());
        self.free_head = head;
        debug!(
            "sim: pool {} pages, heap {} pages, {} free pages at {}",
            pool, config.heap_pages, free_count, head
        );
    }

    fn build_kernel_objects(&mut self, config: &SimConfig) {
        let mut rng = StdRng::seed_from_u64(config.seed);

        let kthread = self.object_kva(PhysAddr::new(KTHREAD_PHYS));
        let kprocess = self.object_kva(PhysAddr::new(KPROCESS_PHYS));
        self.kernel_store[0..4].copy_from_slice(&kthread.as_u32().to_le_bytes());
        self.kernel_store[4..8].copy_from_slice(&kprocess.as_u32().to_le_bytes());

        let fcram_end = self.fcram.phys + self.fcram.size;
        let context = fcram_end - PAGE_SIZE as u32 + 0x800;
        let context_kva = self.fcram.alias_for_phys(context);
        self.phys
            .write_u32(PhysAddr::new(KTHREAD_PHYS) + KTHREAD_CONTEXT_OFFSET, context_kva.as_u32());
        self.thread_acl = context - THREAD_ACL_BELOW_CONTEXT;
        let thread_acl = random_acl(&mut rng);
        self.write_acl(self.thread_acl, &thread_acl);

        let (acl_offset, flags_offset, pid_offset) = self.layout.offsets();
        let process_acl = random_acl(&mut rng);
        self.write_acl(self.kprocess + acl_offset, &process_acl);
        self.phys.write_u32(self.kprocess + flags_offset, 0x0000_0200);
        let pid = rng.random_range(0x28..0x40);
        self.phys.write_u32(self.kprocess + pid_offset, pid);

        for slot in 0..VTABLE_LEN {
            let native = match slot {
                CLOSE_SLOT => NATIVE_TIMER_CLOSE,
                DESTRUCTOR_SLOT => NATIVE_TIMER_DESTROY,
                _ => NATIVE_NOOP,
            };
            self.phys.write_u32(
                PhysAddr::new(TIMER_VTABLE_PHYS) + 4 * slot as u32,
                native_address(native),
            );
        }

        if let Some(patch) = self.thread_patch {
            match self.kernel_phys(patch) {
                Some(phys) => self.phys.write(phys, &THREAD_PATCH_ORIGINAL),
                None => warn!("sim: thread patch site {} is not mapped", patch),
            }
        }
        debug!("sim: kthread {} kprocess {} pid {}", kthread, kprocess, pid);
    }

    fn write_acl(&mut self, at: PhysAddr, acl: &[u32; 4]) {
        for (i, word) in acl.iter().enumerate() {
            self.phys.write_u32(at + 4 * i as u32, *word);
        }
    }

    fn read_acl(&self, at: PhysAddr) -> [u32; 4] {
        std::array::from_fn(|i| self.phys.read_u32(at + 4 * i as u32))
    }

    pub(crate) fn thread_acl(&self) -> [u32; 4] {
        self.read_acl(self.thread_acl)
    }

    pub(crate) fn process_acl(&self) -> [u32; 4] {
        self.read_acl(self.kprocess + self.layout.offsets().0)
    }

    pub(crate) fn process_id(&self) -> u32 {
        self.phys.read_u32(self.kprocess + self.layout.offsets().2)
    }

    /// Kernel address of an object-pool object.
    pub(crate) fn object_kva(&self, phys: PhysAddr) -> KernelAddr {
        self.slab
            .and_then(|slab| slab.phys_to_virt(phys))
            .unwrap_or_else(|| self.fcram.alias_for_phys(phys))
    }

    fn axi(&self) -> DirectMap {
        DirectMap::new(
            self.fcram.virt.as_u32().wrapping_sub(AXI_SIZE),
            AXI_PHYS,
            AXI_SIZE,
        )
    }

    /// Physical address behind a kernel virtual address.
    pub(crate) fn kernel_phys(&self, kva: KernelAddr) -> Option<PhysAddr> {
        if let Some(phys) = self.slab.and_then(|slab| slab.virt_to_phys(kva)) {
            return Some(phys);
        }
        if let Some(phys) = self.axi().virt_to_phys(kva) {
            return Some(phys);
        }
        if let Some(phys) = self.fcram.virt_to_phys(kva) {
            return Some(phys);
        }
        if kva.as_u32() < USER_SPACE_END {
            return self.user_phys(VirtAddr::new(kva.as_u32()));
        }
        None
    }

    fn store_offset(kva: u32) -> Option<usize> {
        kva.checked_sub(CURRENT_KTHREAD_PTR)
            .map(|offset| offset as usize)
            .filter(|offset| *offset < PAGE_SIZE)
    }

    pub(crate) fn kernel_read(&self, kva: KernelAddr, buf: &mut [u8]) -> Result<(), SimError> {
        for (at, offset, n) in page_chunks(kva.as_u32(), buf.len()) {
            if let Some(store) = Self::store_offset(at) {
                buf[offset..offset + n].copy_from_slice(&self.kernel_store[store..store + n]);
                continue;
            }
            let at = KernelAddr::new(at);
            let phys = self.kernel_phys(at).ok_or(SimError::UnmappedKernel(at))?;
            self.phys.read(phys, &mut buf[offset..offset + n]);
        }
        Ok(())
    }

    pub(crate) fn kernel_write(&mut self, kva: KernelAddr, data: &[u8]) -> Result<(), SimError> {
        for (at, offset, n) in page_chunks(kva.as_u32(), data.len()) {
            if let Some(store) = Self::store_offset(at) {
                self.kernel_store[store..store + n].copy_from_slice(&data[offset..offset + n]);
                continue;
            }
            let at = KernelAddr::new(at);
            let phys = self.kernel_phys(at).ok_or(SimError::UnmappedKernel(at))?;
            self.phys.write(phys, &data[offset..offset + n]);
        }
        Ok(())
    }

    pub(crate) fn kernel_read_u32(&self, kva: KernelAddr) -> Result<u32, SimError> {
        let mut word = [0u8; 4];
        self.kernel_read(kva, &mut word)?;
        Ok(u32::from_le_bytes(word))
    }

    pub(crate) fn kernel_write_u32(&mut self, kva: KernelAddr, value: u32) -> Result<(), SimError> {
        self.kernel_write(kva, &value.to_le_bytes())
    }

    /// Records a kernel fault. Only the first one is kept.
    pub(crate) fn fault(&mut self, error: SimError) {
        warn!("sim: kernel fault: {}", error);
        if self.panic.is_none() {
            self.panic = Some(error);
        }
    }

    pub(crate) fn user_phys(&self, addr: VirtAddr) -> Option<PhysAddr> {
        self.page_table
            .get(&addr.page_base().as_u32())
            .map(|phys| *phys + addr.page_offset())
    }

    /// What `osConvertVirtToPhys` returns: offset arithmetic for the linear
    /// region, a page table walk elsewhere.
    pub(crate) fn resolve(&self, addr: VirtAddr) -> Option<PhysAddr> {
        let offset = addr.as_u32().wrapping_sub(LINEAR_BASE);
        if addr.as_u32() >= LINEAR_BASE && offset < self.fcram.size {
            return Some(self.fcram.phys + offset);
        }
        self.user_phys(addr)
    }

    pub(crate) fn is_mapped(&self, addr: VirtAddr) -> bool {
        self.page_table.contains_key(&addr.page_base().as_u32())
    }

    pub(crate) fn map(&mut self, addr: VirtAddr, phys: PhysAddr) {
        self.page_table.insert(addr.page_base().as_u32(), phys.page_base());
    }

    pub(crate) fn unmap(&mut self, addr: VirtAddr) -> Option<PhysAddr> {
        self.page_table.remove(&addr.page_base().as_u32())
    }

    /// Highest mapped regular heap page, plus one page.
    pub(crate) fn heap_end(&self) -> VirtAddr {
        self.page_table
            .range(HEAP_BASE..HEAP_LIMIT)
            .next_back()
            .map(|(page, _)| VirtAddr::new(page + PAGE_SIZE as u32))
            .unwrap_or(VirtAddr::new(HEAP_BASE))
    }

    pub(crate) fn user_read(&self, addr: VirtAddr, buf: &mut [u8]) -> Result<(), ResultCode> {
        let chunks: Vec<_> = page_chunks(addr.as_u32(), buf.len()).collect();
        let mut phys = Vec::with_capacity(chunks.len());
        for (at, _, _) in &chunks {
            phys.push(self.user_phys(VirtAddr::new(*at)).ok_or(ResultCode::INVALID_ADDRESS)?);
        }
        for ((_, offset, n), phys) in chunks.into_iter().zip(phys) {
            self.phys.read(phys, &mut buf[offset..offset + n]);
        }
        Ok(())
    }

    /// CPU store. Returns `true` if it touched the watched page.
    pub(crate) fn user_write(&mut self, addr: VirtAddr, data: &[u8]) -> Result<bool, ResultCode> {
        let chunks: Vec<_> = page_chunks(addr.as_u32(), data.len()).collect();
        let mut phys = Vec::with_capacity(chunks.len());
        for (at, _, _) in &chunks {
            phys.push(self.user_phys(VirtAddr::new(*at)).ok_or(ResultCode::INVALID_ADDRESS)?);
        }
        let mut hit = false;
        for ((at, offset, n), phys) in chunks.into_iter().zip(phys) {
            self.phys.write(phys, &data[offset..offset + n]);
            hit |= self.watch == Some(at & !(PAGE_MASK as u32));
        }
        if hit {
            self.watch_hit = true;
        }
        Ok(hit)
    }

    /// Starts watching `page` for a CPU store.
    pub(crate) fn watch(&mut self, page: VirtAddr) {
        self.watch = Some(page.page_base().as_u32());
        self.watch_hit = false;
    }

    pub(crate) fn watch_hit(&self) -> bool {
        self.watch_hit
    }

    pub(crate) fn unwatch(&mut self) {
        self.watch = None;
        self.watch_hit = false;
    }

    pub(crate) fn linear_alloc(&mut self, size: usize, align: usize) -> Option<VirtAddr> {
        let size = size.max(1) as u32;
        let align = align.max(4) as u32;
        let align_up = |addr: u32| addr.div_ceil(align) * align;
        let mut candidate = align_up(LINEAR_BASE);
        for (start, len) in &self.linear_blocks {
            if candidate + size <= *start {
                break;
            }
            candidate = candidate.max(align_up(start + len));
        }
        if candidate + size > self.pool_end {
            return None;
        }
        self.linear_blocks.insert(candidate, size);
        Some(VirtAddr::new(candidate))
    }

    pub(crate) fn linear_free(&mut self, addr: VirtAddr) -> bool {
        self.linear_blocks.remove(&addr.as_u32()).is_some()
    }

    pub(crate) fn register_entry(&mut self, entry: KernelEntry) -> u32 {
        let index = match self
            .entries
            .iter()
            .position(|known| *known as usize == entry as usize)
        {
            Some(index) => index,
            None => {
                self.entries.push(entry);
                self.entries.len() - 1
            }
        };
        USER_CODE_BASE + index as u32 * CODE_STRIDE
    }

    pub(crate) fn entry_at(&self, addr: u32) -> Option<KernelEntry> {
        let offset = addr.checked_sub(USER_CODE_BASE)?;
        if offset % CODE_STRIDE != 0 {
            return None;
        }
        self.entries.get((offset / CODE_STRIDE) as usize).copied()
    }

    pub(crate) fn add_handle(&mut self, object: SimObject) -> Handle {
        let handle = self.next_handle;
        self.next_handle += 1;
        self.handles.insert(handle, object);
        Handle(handle)
    }

    pub(crate) fn handle(&self, handle: Handle) -> Option<&SimObject> {
        self.handles.get(&handle.0)
    }

    pub(crate) fn remove_handle(&mut self, handle: Handle) -> Option<SimObject> {
        self.handles.remove(&handle.0)
    }

    /// Places a new timer in the object pool.
    pub(crate) fn create_timer(&mut self) -> Option<KernelAddr> {
        if self.timers_created >= MAX_TIMERS {
            return None;
        }
        let phys = PhysAddr::new(TIMER_PHYS + self.timers_created * TIMER_SIZE);
        self.timers_created += 1;
        let vtable = self.object_kva(PhysAddr::new(TIMER_VTABLE_PHYS));
        self.phys.write_u32(phys, vtable.as_u32());
        Some(self.object_kva(phys))
    }

    /// Returns `true` if some instruction cache invalidation covered `addr`.
    pub(crate) fn icache_invalidated(&self, addr: KernelAddr) -> bool {
        self.icache_invalidations
            .iter()
            .any(|(start, len)| addr >= *start && ((addr - *start) as usize) < *len)
    }

    pub(crate) fn thread_patch_bytes(&self) -> Option<[u8; 4]> {
        let mut bytes = [0u8; 4];
        self.kernel_read(self.thread_patch?, &mut bytes).ok()?;
        Some(bytes)
    }
}
