use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    thread,
};

use crate::error::ResultCode;
use crate::host::Horizon;

/// A helper thread that can be signaled to stop.
///
/// Wraps a join handle with a cancellation flag that the thread
/// can check to determine when to exit.
pub struct CancelableJoinHandle<T> {
    handle: thread::JoinHandle<()>,
    running: Arc<AtomicBool>,
    result: Arc<Mutex<Option<T>>>,
}

/// Spawns a cancelable thread through the host's thread-creation call.
///
/// The thread is passed an `Arc<AtomicBool>` that is `true` until
/// [`CancelableJoinHandle::join`] is called.
pub fn spawn_cancelable<H: Horizon + ?Sized, T: Send + 'static>(
    host: &H,
    priority: i32,
    processor: i32,
    func: impl FnOnce(Arc<AtomicBool>) -> T + Send + 'static,
) -> Result<CancelableJoinHandle<T>, ResultCode> {
    let running = Arc::new(AtomicBool::new(true));
    let result = Arc::new(Mutex::new(None));
    let r = Arc::clone(&running);
    let slot = Arc::clone(&result);
    let handle = host.spawn_thread(
        Box::new(move || {
            let value = func(r);
            if let Ok(mut slot) = slot.lock() {
                *slot = Some(value);
            }
        }),
        priority,
        processor,
    )?;
    Ok(CancelableJoinHandle {
        handle,
        running,
        result,
    })
}

impl<T> CancelableJoinHandle<T> {
    /// Checks if the thread has not been signaled to stop yet.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Returns `true` once the thread body has returned.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Signals the thread to stop and waits for it to finish.
    ///
    /// Returns `None` if the thread panicked.
    pub fn join(self) -> Option<T> {
        self.running.store(false, Ordering::Relaxed);
        self.handle.join().ok()?;
        self.result.lock().ok()?.take()
    }
}
