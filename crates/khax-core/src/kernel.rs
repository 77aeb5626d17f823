//! Code that runs at kernel privilege.
//!
//! Payloads are plain functions of type [`KernelEntry`]. They receive a
//! [`KernelContext`] instead of raw pointers so that every kernel memory access
//! goes through one seam: on hardware the context is a thin wrapper around
//! volatile loads and stores, in the simulator it is the simulated kernel.
//!
//! Payloads run with interrupts disabled. They must not block, allocate or
//! panic; results travel back through the return value or through atomics in
//! the active session (see [`crate::session::current`]).

use crate::memory::KernelAddr;

/// Entry point of a kernel-mode payload: `(context, argument) -> r0`.
pub type KernelEntry = fn(&mut dyn KernelContext, u32) -> u32;

/// `KTimer` vtable facts.
pub mod ktimer {
    /// Number of function pointers in the vtable.
    pub const VTABLE_LEN: usize = 10;
    /// Offset of the vtable pointer inside the object.
    pub const VTABLE_OFFSET: u32 = 0;
    /// Slot called when the last handle is closed.
    pub const CLOSE_SLOT: usize = 1;
    /// Slot of the destructor.
    pub const DESTRUCTOR_SLOT: usize = 4;
}

/// Kernel memory and CPU control available to a payload.
pub trait KernelContext {
    /// Loads a word from kernel memory.
    fn read_u32(&mut self, addr: KernelAddr) -> u32;

    /// Stores a word to kernel memory.
    fn write_u32(&mut self, addr: KernelAddr, value: u32);

    /// Copies kernel memory into `buf`. `addr` need not be aligned.
    fn read_bytes(&mut self, addr: KernelAddr, buf: &mut [u8]);

    /// Copies `data` into kernel memory. `addr` need not be aligned.
    fn write_bytes(&mut self, addr: KernelAddr, data: &[u8]);

    /// Branches to kernel code at `addr` with `arg` in `r0`, returning `r0`.
    fn call(&mut self, addr: u32, arg: u32) -> u32;

    /// Masks IRQ and FIQ. Returns the previous mask state.
    fn disable_interrupts(&mut self) -> u32;

    /// Restores a state returned by [`KernelContext::disable_interrupts`].
    fn restore_interrupts(&mut self, state: u32);

    /// Invalidates the instruction cache lines covering the range.
    fn invalidate_instruction_cache(&mut self, addr: KernelAddr, len: usize);

    /// Cleans the data cache lines covering the range.
    fn clean_data_cache(&mut self, addr: KernelAddr, len: usize);

    /// Waits for outstanding stores to complete.
    fn data_sync_barrier(&mut self) {
        cpu::data_sync_barrier();
    }

    /// Orders memory accesses before and after the barrier.
    fn data_memory_barrier(&mut self) {
        cpu::data_memory_barrier();
    }

    /// Discards prefetched instructions.
    fn flush_prefetch_buffer(&mut self) {
        cpu::flush_prefetch_buffer();
    }
}

/// Runs `f` with interrupts masked, restoring the previous state afterwards.
pub fn with_interrupts_disabled<R>(
    k: &mut dyn KernelContext,
    f: impl FnOnce(&mut dyn KernelContext) -> R,
) -> R {
    let state = k.disable_interrupts();
    let result = f(k);
    k.restore_interrupts(state);
    result
}

/// Rewrites kernel code and makes the new bytes visible to instruction fetch.
pub fn patch_code(k: &mut dyn KernelContext, addr: KernelAddr, bytes: &[u8]) {
    k.write_bytes(addr, bytes);
    k.clean_data_cache(addr, bytes.len());
    k.data_sync_barrier();
    k.invalidate_instruction_cache(addr, bytes.len());
    k.flush_prefetch_buffer();
}

/// ARM11 barrier instructions.
///
/// Off target these degrade to compiler/CPU fences with the same ordering
/// guarantees for Rust code.
pub mod cpu {
    /// CP15 data synchronization barrier.
    #[inline]
    pub fn data_sync_barrier() {
        #[cfg(target_arch = "arm")]
        unsafe {
            core::arch::asm!("mcr p15, 0, {0}, c7, c10, 4", in(reg) 0u32, options(nostack));
        }
        #[cfg(not(target_arch = "arm"))]
        std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
    }

    /// CP15 data memory barrier.
    #[inline]
    pub fn data_memory_barrier() {
        #[cfg(target_arch = "arm")]
        unsafe {
            core::arch::asm!("mcr p15, 0, {0}, c7, c10, 5", in(reg) 0u32, options(nostack));
        }
        #[cfg(not(target_arch = "arm"))]
        std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
    }

    /// CP15 prefetch flush.
    #[inline]
    pub fn flush_prefetch_buffer() {
        #[cfg(target_arch = "arm")]
        unsafe {
            core::arch::asm!("mcr p15, 0, {0}, c7, c5, 4", in(reg) 0u32, options(nostack));
        }
        #[cfg(not(target_arch = "arm"))]
        std::sync::atomic::compiler_fence(std::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[derive(Default)]
    struct Recorder {
        mem: HashMap<u32, u8>,
        irq_masked: bool,
        log: Vec<&'static str>,
    }

    impl KernelContext for Recorder {
        fn read_u32(&mut self, addr: KernelAddr) -> u32 {
            let mut buf = [0u8; 4];
            self.read_bytes(addr, &mut buf);
            u32::from_le_bytes(buf)
        }

        fn write_u32(&mut self, addr: KernelAddr, value: u32) {
            self.write_bytes(addr, &value.to_le_bytes());
        }

        fn read_bytes(&mut self, addr: KernelAddr, buf: &mut [u8]) {
            for (i, b) in buf.iter_mut().enumerate() {
                *b = *self.mem.get(&(addr.as_u32() + i as u32)).unwrap_or(&0);
            }
        }

        fn write_bytes(&mut self, addr: KernelAddr, data: &[u8]) {
            self.log.push("write");
            for (i, b) in data.iter().enumerate() {
                self.mem.insert(addr.as_u32() + i as u32, *b);
            }
        }

        fn call(&mut self, _: u32, arg: u32) -> u32 {
            arg
        }

        fn disable_interrupts(&mut self) -> u32 {
            let old = self.irq_masked as u32;
            self.irq_masked = true;
            old
        }

        fn restore_interrupts(&mut self, state: u32) {
            self.irq_masked = state != 0;
        }

        fn invalidate_instruction_cache(&mut self, _: KernelAddr, _: usize) {
            self.log.push("icache");
        }

        fn clean_data_cache(&mut self, _: KernelAddr, _: usize) {
            self.log.push("dcache");
        }
    }

    #[test]
    fn interrupts_are_restored() {
        let mut k = Recorder::default();
        let masked = with_interrupts_disabled(&mut k, |k| k.disable_interrupts());
        assert_eq!(masked, 1);
        assert!(!k.irq_masked);
    }

    #[test]
    fn patch_code_orders_maintenance() {
        let mut k = Recorder::default();
        patch_code(&mut k, KernelAddr::new(0xdff8_3837), &[0xe5, 0x0c, 0xd0, 0x8d]);
        assert_eq!(k.log, ["write", "dcache", "icache"]);
        assert_eq!(k.read_u32(KernelAddr::new(0xdff8_3837)), 0x8dd0_0ce5);
    }
}
