//! Kernel-mode execution.
//!
//! Kernel code lives at fake addresses: user payloads are registered with
//! [`SimState::register_entry`] and the kernel's own functions are the
//! [`NATIVES`] table. A branch anywhere else is a fault.

use crate::error::SimError;
use crate::state::{CODE_STRIDE, SimState, TIMER_SIZE};
use khax_core::kernel::KernelContext;
use khax_core::memory::KernelAddr;
use log::trace;

pub(crate) const NATIVE_CODE_BASE: u32 = 0xFFF0_0000;

pub(crate) const NATIVE_NOOP: usize = 0;
pub(crate) const NATIVE_TIMER_CLOSE: usize = 1;
pub(crate) const NATIVE_TIMER_DESTROY: usize = 2;

type Native = fn(&mut SimState, u32) -> u32;

fn noop(_: &mut SimState, arg: u32) -> u32 {
    arg
}

fn timer_close(_: &mut SimState, _: u32) -> u32 {
    0
}

fn timer_destroy(state: &mut SimState, this: u32) -> u32 {
    if let Err(err) = state.kernel_write(KernelAddr::new(this), &[0u8; TIMER_SIZE as usize]) {
        state.fault(err);
        return 0;
    }
    state.timers_destroyed += 1;
    0
}

const NATIVES: [Native; 3] = [noop, timer_close, timer_destroy];

/// Kernel address of native function `index`.
pub(crate) const fn native_address(index: usize) -> u32 {
    NATIVE_CODE_BASE + index as u32 * CODE_STRIDE
}

fn native_at(addr: u32) -> Option<Native> {
    let offset = addr.checked_sub(NATIVE_CODE_BASE)?;
    if offset % CODE_STRIDE != 0 {
        return None;
    }
    NATIVES.get((offset / CODE_STRIDE) as usize).copied()
}

/// The CPU in supervisor mode.
pub(crate) struct SimKernel<'a> {
    state: &'a mut SimState,
}

impl<'a> SimKernel<'a> {
    pub(crate) fn new(state: &'a mut SimState) -> Self {
        SimKernel { state }
    }
}

impl KernelContext for SimKernel<'_> {
    fn read_u32(&mut self, addr: KernelAddr) -> u32 {
        match self.state.kernel_read_u32(addr) {
            Ok(value) => value,
            Err(err) => {
                self.state.fault(err);
                0
            }
        }
    }

    fn write_u32(&mut self, addr: KernelAddr, value: u32) {
        if let Err(err) = self.state.kernel_write_u32(addr, value) {
            self.state.fault(err);
        }
    }

    fn read_bytes(&mut self, addr: KernelAddr, buf: &mut [u8]) {
        if let Err(err) = self.state.kernel_read(addr, buf) {
            buf.fill(0);
            self.state.fault(err);
        }
    }

    fn write_bytes(&mut self, addr: KernelAddr, data: &[u8]) {
        if let Err(err) = self.state.kernel_write(addr, data) {
            self.state.fault(err);
        }
    }

    fn call(&mut self, addr: u32, arg: u32) -> u32 {
        trace!("sim: kernel branch to 0x{:08x}({:#x})", addr, arg);
        if let Some(native) = native_at(addr) {
            return native(self.state, arg);
        }
        match self.state.entry_at(addr) {
            Some(entry) => entry(self, arg),
            None => {
                self.state.fault(SimError::BadBranch(addr));
                0
            }
        }
    }

    fn disable_interrupts(&mut self) -> u32 {
        let previous = self.state.interrupts_masked;
        self.state.interrupts_masked = true;
        previous as u32
    }

    fn restore_interrupts(&mut self, state: u32) {
        self.state.interrupts_masked = state != 0;
    }

    fn invalidate_instruction_cache(&mut self, addr: KernelAddr, len: usize) {
        self.state.icache_invalidations.push((addr, len));
    }

    fn clean_data_cache(&mut self, _: KernelAddr, _: usize) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimConfig;
    use khax_core::kernel::ktimer::{CLOSE_SLOT, DESTRUCTOR_SLOT};
    use khax_core::kernel::{patch_code, with_interrupts_disabled};
    use khax_core::version::SystemVersion;

    fn state() -> SimState {
        SimState::new(&SimConfig::new(SystemVersion::new(2, 50, 11), false))
    }

    fn write_marker(k: &mut dyn KernelContext, arg: u32) -> u32 {
        k.write_u32(KernelAddr::new(0xFFFF_9010), arg);
        arg + 1
    }

    #[test]
    fn registered_entries_are_callable() {
        let mut state = state();
        let addr = state.register_entry(write_marker);
        assert_eq!(state.register_entry(write_marker), addr);
        let mut k = SimKernel::new(&mut state);
        assert_eq!(k.call(addr, 41), 42);
        assert_eq!(k.read_u32(KernelAddr::new(0xFFFF_9010)), 41);
        assert!(state.panic.is_none());
    }

    #[test]
    fn timer_natives_destroy_the_object() {
        let mut state = state();
        let timer = state.create_timer().unwrap();
        let mut k = SimKernel::new(&mut state);
        let vtable = KernelAddr::new(k.read_u32(timer));
        let close = k.read_u32(vtable + 4 * CLOSE_SLOT as u32);
        let destroy = k.read_u32(vtable + 4 * DESTRUCTOR_SLOT as u32);
        assert_eq!(close, native_address(NATIVE_TIMER_CLOSE));
        k.call(close, timer.as_u32());
        k.call(destroy, timer.as_u32());
        assert_eq!(k.read_u32(timer), 0);
        assert_eq!(state.timers_destroyed, 1);
    }

    #[test]
    fn wild_branches_and_accesses_fault() {
        let mut state = state();
        let mut k = SimKernel::new(&mut state);
        assert_eq!(k.call(0x0010_0004, 0), 0);
        assert_eq!(k.read_u32(KernelAddr::new(0xC000_0000)), 0);
        assert_eq!(state.panic, Some(SimError::BadBranch(0x0010_0004)));
    }

    #[test]
    fn interrupt_mask_and_icache_are_tracked() {
        let mut state = state();
        let mut k = SimKernel::new(&mut state);
        with_interrupts_disabled(&mut k, |k| {
            patch_code(k, KernelAddr::new(0xFFFF_9020), &[1, 2, 3, 4]);
        });
        assert!(!state.interrupts_masked);
        assert!(state.icache_invalidated(KernelAddr::new(0xFFFF_9023)));
        assert!(!state.icache_invalidated(KernelAddr::new(0xFFFF_9024)));
    }
}
