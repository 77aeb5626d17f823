//! # Khax
//!
//! Kernel privilege escalation for the 3DS ARM11 kernel.
//!
//! The engine looks up the running kernel in a version table, picks one of two
//! techniques and drives it step by step until the calling process holds a full
//! syscall access list and reports process id 0 to the service manager:
//!
//! - **memchunkhax** (kernels up to 2.46.0) frees pages around a victim page,
//!   rewrites the victim's free-list node with a GPU copy and lets the kernel's
//!   own coalescing write a branch into svcCreateThread.
//! - **vtable hijack** (2.48.3 up to 2.50.11) races the kernel's page commit to
//!   map an AXI WRAM slab page into user space, then swaps a `KTimer` vtable.
//!
//! Everything the engine needs from the host is behind
//! [`host::Horizon`]. The `khax-sim` crate implements it in-process.
//!
//! ```no_run
//! use khax::Khax;
//! use khax_sim::{SimConfig, SimHorizon};
//! use khax::version::SystemVersion;
//! use std::sync::Arc;
//!
//! let sim = Arc::new(SimHorizon::new(SimConfig::new(SystemVersion::new(2, 46, 0), false)));
//! let report = Khax::builder().host(sim).build()?.run();
//! println!("{}", report.to_json()?);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Features
//!
//! - `memchunk` (default): the heap coalesce technique
//! - `vtable` (default): the `KTimer` vtable technique
#![warn(missing_docs)]

#[cfg(not(any(feature = "memchunk", feature = "vtable")))]
compile_error!("enable at least one of the `memchunk` and `vtable` features");

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use khax_core::error::HostOp;
use khax_core::kernel::KernelEntry;
use khax_core::session::SessionShared;
use khax_core::util::NamedProgress;
use khax_core::version::{VersionDescriptor, lookup_current};
use log::{error, info, warn};
use std::sync::Arc;
use thiserror::Error;

pub use khax_core::{
    Exploit, FailureClass, KhaxConfig, KhaxError, ReportedError, Result, ResultCode, RunReport,
    TechniqueKind, error, exploit, grant, gspwn, host, kernel, memory, session, util, version,
};
#[cfg(feature = "memchunk")]
pub use khax_memchunk::MemChunkHax;
#[cfg(feature = "vtable")]
pub use khax_vtable::VtableHax;

use crate::host::Horizon;

/// The state machine selected for a kernel.
pub enum Technique<H: Horizon + 'static> {
    /// Kernels up to 2.46.0
    #[cfg(feature = "memchunk")]
    LegacyHeapCoalesce(MemChunkHax<H>),
    /// Kernels from 2.48.3 up to 2.50.11
    #[cfg(feature = "vtable")]
    VtableHijack(VtableHax<H>),
}

impl<H: Horizon + 'static> Technique<H> {
    /// Creates the session for the technique `descriptor` calls for.
    ///
    /// Fails with [`KhaxError::Unsupported`] if that technique was compiled
    /// out.
    pub fn select(
        host: Arc<H>,
        descriptor: &'static VersionDescriptor,
        config: KhaxConfig,
    ) -> Result<Self> {
        let kind = descriptor.technique().ok_or(KhaxError::UnknownVersion {
            kernel: descriptor.kernel_version,
            new_3ds: descriptor.new_3ds,
        })?;
        match kind {
            #[cfg(feature = "memchunk")]
            TechniqueKind::LegacyHeapCoalesce => Ok(Technique::LegacyHeapCoalesce(
                MemChunkHax::new(host, descriptor, config)?,
            )),
            #[cfg(feature = "vtable")]
            TechniqueKind::VtableHijack => Ok(Technique::VtableHijack(VtableHax::new(
                host, descriptor, config,
            )?)),
            #[allow(unreachable_patterns)]
            technique => Err(KhaxError::Unsupported {
                kernel: descriptor.kernel_version,
                technique,
            }),
        }
    }

    /// The session as a step-driven [`Exploit`].
    pub fn exploit(&self) -> &dyn Exploit {
        match self {
            #[cfg(feature = "memchunk")]
            Technique::LegacyHeapCoalesce(hax) => hax,
            #[cfg(feature = "vtable")]
            Technique::VtableHijack(hax) => hax,
        }
    }

    /// Mutable access to the session.
    pub fn exploit_mut(&mut self) -> &mut dyn Exploit {
        match self {
            #[cfg(feature = "memchunk")]
            Technique::LegacyHeapCoalesce(hax) => hax,
            #[cfg(feature = "vtable")]
            Technique::VtableHijack(hax) => hax,
        }
    }

    /// State shared with the kernel payloads.
    pub fn shared(&self) -> &SessionShared {
        match self {
            #[cfg(feature = "memchunk")]
            Technique::LegacyHeapCoalesce(hax) => hax.shared(),
            #[cfg(feature = "vtable")]
            Technique::VtableHijack(hax) => hax.shared(),
        }
    }
}

/// Drives one escalation attempt against a host.
pub struct Khax<H: Horizon + 'static> {
    host: Arc<H>,
    config: KhaxConfig,
    progress: Option<MultiProgress>,
}

/// Errors of [`KhaxBuilder::build`].
#[derive(Debug, Error)]
pub enum BuildError {
    /// [`KhaxBuilder::host`] was never called.
    #[error("No host specified")]
    NoHost,
    /// A configuration value is out of range.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

/// Builder for [`Khax`].
pub struct KhaxBuilder<H: Horizon + 'static> {
    host: Option<Arc<H>>,
    config: KhaxConfig,
    progress: Option<MultiProgress>,
}

impl<H: Horizon + 'static> Default for KhaxBuilder<H> {
    fn default() -> Self {
        KhaxBuilder {
            host: None,
            config: KhaxConfig::default(),
            progress: None,
        }
    }
}

impl<H: Horizon + 'static> KhaxBuilder<H> {
    /// The host to escalate on.
    pub fn host(mut self, host: Arc<H>) -> Self {
        self.host = Some(host);
        self
    }

    /// Replaces the default configuration.
    pub fn config(mut self, config: KhaxConfig) -> Self {
        self.config = config;
        self
    }

    /// Adds a step bar to `progress` while running.
    pub fn progress(mut self, progress: MultiProgress) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Validates the configuration and creates the orchestrator.
    pub fn build(self) -> std::result::Result<Khax<H>, BuildError> {
        let host = self.host.ok_or(BuildError::NoHost)?;
        let config = self.config;
        if config.cpu_time_limit == 0 || config.cpu_time_limit > 80 {
            return Err(BuildError::InvalidConfig("cpu_time_limit must be within 1..=80"));
        }
        if config.cache_nuke_size.bytes() == 0 {
            return Err(BuildError::InvalidConfig("cache_nuke_size must not be zero"));
        }
        if config.copy_timeout.is_zero() || config.race_timeout.is_zero() {
            return Err(BuildError::InvalidConfig("timeouts must not be zero"));
        }
        if !(0..=0x3F).contains(&config.helper_priority) {
            return Err(BuildError::InvalidConfig("helper_priority must be within 0..=0x3F"));
        }
        Ok(Khax {
            host,
            config,
            progress: self.progress,
        })
    }
}

impl<H: Horizon + 'static> Khax<H> {
    /// Starts building an orchestrator.
    pub fn builder() -> KhaxBuilder<H> {
        KhaxBuilder::default()
    }

    /// The host this orchestrator runs on.
    pub fn host(&self) -> &Arc<H> {
        &self.host
    }

    /// The configuration handed to the technique.
    pub fn config(&self) -> &KhaxConfig {
        &self.config
    }

    /// Looks up the kernel, runs every step of the matching technique and
    /// releases the session.
    ///
    /// Never returns if the run stopped with kernel structures still
    /// corrupted: the session parks the calling thread on drop.
    pub fn run(&self) -> RunReport {
        let kernel = self.host.kernel_version();
        let firm = self.host.firm_version();
        let descriptor = match lookup_current(&*self.host) {
            Ok(descriptor) => descriptor,
            Err(e) => {
                warn!("{}", e);
                let new_3ds = matches!(e, KhaxError::UnknownVersion { new_3ds: true, .. });
                let mut report = RunReport::new(kernel, firm, new_3ds);
                report.fail(&e);
                return report;
            }
        };

        let mut report = RunReport::new(kernel, firm, descriptor.new_3ds);
        report.technique = descriptor.technique();
        let mut technique = match Technique::select(self.host.clone(), descriptor, self.config.clone()) {
            Ok(technique) => technique,
            Err(e) => {
                warn!("{}", e);
                report.fail(&e);
                return report;
            }
        };

        let exploit = technique.exploit_mut();
        let kind = exploit.kind();
        report.steps_total = exploit.step_count();
        info!("running {} ({} steps)", kind, report.steps_total);
        let bar = self.progress.as_ref().map(|p| {
            let p = p.add(ProgressBar::new(report.steps_total as u64));
            p.set_style(ProgressStyle::named_steps(&kind.to_string()));
            p
        });
        let result = exploit.run(bar.as_ref());
        if let Some(bar) = bar {
            bar.finish();
        }

        let exploit = technique.exploit();
        report.steps_completed = exploit.next_step() - 1;
        report.corruption_level = exploit.corruption_level();
        report.allocated_mask = exploit.allocated_mask();
        report.acl_backup = technique.shared().acl().snapshot();
        match result {
            Ok(()) => info!("{} completed", kind),
            Err(e) => {
                if report.corruption_level > 0 {
                    error!("{} stopped with corruption level {}", kind, report.corruption_level);
                }
                report.fail(&e);
            }
        }
        report
    }
}

/// Runs the matching technique with the default configuration.
///
/// Returns [`ResultCode::SUCCESS`] once the process holds the full syscall
/// access list, otherwise the code of the first failure.
pub fn khax_init<H: Horizon + 'static>(host: Arc<H>) -> ResultCode {
    let khax = Khax {
        host,
        config: KhaxConfig::default(),
        progress: None,
    };
    khax.run().result
}

/// Counterpart of [`khax_init`]. The grant is permanent and the session has
/// already released its resources, so there is nothing left to undo.
pub fn khax_destroy() -> ResultCode {
    ResultCode::SUCCESS
}

/// Runs `entry(arg)` in kernel mode through svcBackdoor.
///
/// Requires a successful [`khax_init`] beforehand.
pub fn kernel_call<H: Horizon + ?Sized>(host: &H, entry: KernelEntry, arg: u32) -> Result<u32> {
    host.backdoor(entry, arg).op("svcBackdoor")
}
