//! Session bookkeeping shared by both techniques.
//!
//! A technique session owns a [`SessionCore`]: the host, the descriptor, the
//! step counter and its registration in the process-wide active-session slot.
//! Kernel payloads run without any Rust calling context and find the session
//! through that slot with [`current`].
//!
//! Only one session may be registered at a time. Registration claims the slot
//! with a compare-exchange; the slot is cleared when the core is dropped.

use crate::config::KhaxConfig;
use crate::error::{KhaxError, Result};
use crate::grant::AclBackup;
use crate::host::Horizon;
use crate::version::VersionDescriptor;
use log::{debug, error, info};
use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, Ordering};
use std::time::Duration;

/// Guards the strict ordering of a session's steps.
#[derive(Debug)]
pub struct StepGuard {
    session: &'static str,
    next: u32,
    count: u32,
}

impl StepGuard {
    /// A guard expecting step 1 of `count`.
    pub fn new(session: &'static str, count: u32) -> Self {
        StepGuard {
            session,
            next: 1,
            count,
        }
    }

    /// Fails with [`KhaxError::Sequence`] unless `step` is the next step.
    pub fn check(&self, step: u32) -> Result<()> {
        if step != self.next {
            return Err(KhaxError::Sequence {
                session: self.session,
                requested: step,
                expected: self.next,
            });
        }
        Ok(())
    }

    /// Records that `step` completed.
    pub fn advance(&mut self, step: u32) {
        debug_assert_eq!(step, self.next);
        self.next = step + 1;
    }

    /// The step that must run next.
    pub fn next(&self) -> u32 {
        self.next
    }

    /// Number of steps in the session.
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Returns `true` once every step has completed.
    pub fn is_complete(&self) -> bool {
        self.next > self.count
    }
}

/// Number of kernel invariants currently broken by the session.
///
/// Raised right after a corrupting write is issued and lowered right after the
/// matching repair. Kernel payloads lower it too, so it is atomic.
#[derive(Debug, Default)]
pub struct CorruptionLevel(AtomicU32);

impl CorruptionLevel {
    /// Records `n` newly broken invariants.
    pub fn raise(&self, n: u32) {
        let level = self.0.fetch_add(n, Ordering::SeqCst) + n;
        debug!("corruption level +{} -> {}", n, level);
    }

    /// Records `n` repaired invariants.
    pub fn lower(&self, n: u32) {
        let _ = self
            .0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |level| {
                Some(level.saturating_sub(n))
            });
    }

    /// Current level.
    pub fn get(&self) -> u32 {
        self.0.load(Ordering::SeqCst)
    }
}

/// State reachable from kernel payloads.
pub struct SessionShared {
    descriptor: &'static VersionDescriptor,
    corruption: CorruptionLevel,
    acl: AclBackup,
    payload_ran: AtomicBool,
    fixups: Box<dyn Any + Send + Sync>,
}

impl SessionShared {
    /// Creates shared state carrying technique-specific `fixups`.
    pub fn new<F: Any + Send + Sync>(descriptor: &'static VersionDescriptor, fixups: F) -> Self {
        SessionShared {
            descriptor,
            corruption: CorruptionLevel::default(),
            acl: AclBackup::default(),
            payload_ran: AtomicBool::new(false),
            fixups: Box::new(fixups),
        }
    }

    /// Descriptor of the running kernel.
    pub fn descriptor(&self) -> &'static VersionDescriptor {
        self.descriptor
    }

    /// The session's corruption level.
    pub fn corruption(&self) -> &CorruptionLevel {
        &self.corruption
    }

    /// ACL and process id backups.
    pub fn acl(&self) -> &AclBackup {
        &self.acl
    }

    /// Technique-specific values, if they are of type `F`.
    pub fn fixups<F: Any>(&self) -> Option<&F> {
        self.fixups.downcast_ref()
    }

    /// Marks the kernel payload as having run to completion.
    pub fn set_payload_ran(&self) {
        self.payload_ran.store(true, Ordering::SeqCst);
    }

    /// Returns `true` once the kernel payload completed.
    pub fn payload_ran(&self) -> bool {
        self.payload_ran.load(Ordering::SeqCst)
    }
}

static ACTIVE: AtomicPtr<SessionShared> = AtomicPtr::new(std::ptr::null_mut());

/// Registration of a session in the process-wide slot.
pub struct ActiveSession {
    shared: Arc<SessionShared>,
}

impl ActiveSession {
    /// Claims the slot for `shared`.
    ///
    /// Fails with [`KhaxError::SessionActive`] while another session holds it.
    pub fn register(shared: Arc<SessionShared>) -> Result<Self> {
        let ptr = Arc::as_ptr(&shared) as *mut SessionShared;
        ACTIVE
            .compare_exchange(
                std::ptr::null_mut(),
                ptr,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_err(|_| KhaxError::SessionActive)?;
        Ok(ActiveSession { shared })
    }

    /// The registered state.
    pub fn shared(&self) -> &Arc<SessionShared> {
        &self.shared
    }
}

impl Drop for ActiveSession {
    fn drop(&mut self) {
        let ptr = Arc::as_ptr(&self.shared) as *mut SessionShared;
        let _ = ACTIVE.compare_exchange(ptr, std::ptr::null_mut(), Ordering::AcqRel, Ordering::Acquire);
    }
}

/// State of the registered session, if any.
///
/// # Safety
///
/// The returned reference is only valid while the registering
/// [`ActiveSession`] is alive. Callers must be running inside a step of that
/// session, which is the case for kernel payloads triggered by the session.
pub unsafe fn current() -> Option<&'static SessionShared> {
    let ptr = ACTIVE.load(Ordering::Acquire);
    // SAFETY: a non-null pointer was produced by `Arc::as_ptr` of a registered
    // session and stays valid until that registration is dropped.
    unsafe { ptr.as_ref() }
}

/// Returns `true` while some session is registered.
pub fn is_active() -> bool {
    !ACTIVE.load(Ordering::Acquire).is_null()
}

/// Never returns. Used when the kernel was left in a corrupted state.
pub fn park_forever() -> ! {
    loop {
        std::thread::sleep(Duration::from_secs(3600));
    }
}

/// Fields every technique session carries.
pub struct SessionCore<H: Horizon + 'static> {
    host: Arc<H>,
    config: KhaxConfig,
    steps: StepGuard,
    active: ActiveSession,
}

impl<H: Horizon + 'static> SessionCore<H> {
    /// Registers a new session named `name` with `steps` steps.
    pub fn new<F: Any + Send + Sync>(
        name: &'static str,
        steps: u32,
        host: Arc<H>,
        descriptor: &'static VersionDescriptor,
        config: KhaxConfig,
        fixups: F,
    ) -> Result<Self> {
        let shared = Arc::new(SessionShared::new(descriptor, fixups));
        let active = ActiveSession::register(shared)?;
        info!("{}: session registered for kernel {}", name, descriptor.kernel_version);
        Ok(SessionCore {
            host,
            config,
            steps: StepGuard::new(name, steps),
            active,
        })
    }

    /// The host.
    pub fn host(&self) -> &H {
        &self.host
    }

    /// A shared handle to the host, for helper threads.
    pub fn host_arc(&self) -> Arc<H> {
        Arc::clone(&self.host)
    }

    /// Engine configuration.
    pub fn config(&self) -> &KhaxConfig {
        &self.config
    }

    /// Descriptor of the running kernel.
    pub fn descriptor(&self) -> &'static VersionDescriptor {
        self.active.shared().descriptor()
    }

    /// State reachable from kernel payloads.
    pub fn shared(&self) -> &SessionShared {
        self.active.shared()
    }

    /// The session's corruption level.
    pub fn corruption(&self) -> &CorruptionLevel {
        self.shared().corruption()
    }

    /// The step guard.
    pub fn steps(&self) -> &StepGuard {
        &self.steps
    }

    /// Checks that `step` is next.
    pub fn begin(&self, step: u32) -> Result<()> {
        self.steps.check(step)?;
        info!("{}: step {}/{}", self.steps.session, step, self.steps.count);
        Ok(())
    }

    /// Marks `step` as completed.
    pub fn complete(&mut self, step: u32) {
        self.steps.advance(step);
    }

    /// Parks the calling thread forever if any invariant is still broken.
    ///
    /// Called first thing in a session's `Drop`, before any cleanup touches
    /// the heap.
    pub fn park_if_corrupted(&self) {
        let level = self.corruption().get();
        if level != 0 {
            error!(
                "{}: dropped with corruption level {}; parking thread",
                self.steps.session, level
            );
            park_forever();
        }
    }
}
