//! Utility functions and types used throughout khax.
//!
//! - [`Size`] - Memory size representation
//! - Constants for pages and well-known kernel addresses ([`PAGE_SIZE`], [`CURRENT_KTHREAD_PTR`], etc.)
//! - Cancelable helper threads spawned through the host ([`spawn_cancelable`])
//! - Progress bar styling ([`NamedProgress`])

mod cancelable_thread;
mod constants;
mod named_progress;
mod size;

pub use self::cancelable_thread::*;
pub use self::constants::*;
pub use self::named_progress::NamedProgress;
pub use self::size::{ParseSizeError, Size};

use std::time::{Duration, Instant};

/// Busy-polls `probe` until it returns `Some` or `timeout` elapses.
///
/// Used where the awaited event is kernel-internal and nothing can signal it
/// cooperatively.
pub fn poll_until<T>(timeout: Duration, mut probe: impl FnMut() -> Option<T>) -> Option<T> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(value) = probe() {
            return Some(value);
        }
        if Instant::now() >= deadline {
            return None;
        }
        std::hint::spin_loop();
    }
}

/// Reads a little-endian word at `offset` of `bytes`.
pub fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

/// Writes a little-endian word at `offset` of `bytes`.
pub fn write_u32(bytes: &mut [u8], offset: usize, value: u32) {
    bytes[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}
