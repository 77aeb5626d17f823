//! The contract shared by both techniques.

use crate::error::Result;
use indicatif::ProgressBar;
use log::warn;
use serde::Serialize;

/// Which state machine applies to a kernel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum TechniqueKind {
    /// Heap free-list coalesce onto the svcCreateThread code
    LegacyHeapCoalesce,
    /// `KTimer` vtable swap through the page-commit race
    VtableHijack,
}

impl std::fmt::Display for TechniqueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TechniqueKind::LegacyHeapCoalesce => write!(f, "memchunkhax"),
            TechniqueKind::VtableHijack => write!(f, "vtable hijack"),
        }
    }
}

/// A multi-step exploit session.
///
/// Steps are numbered from 1 and must run strictly in order; calling any other
/// step fails with [`crate::KhaxError::Sequence`] and leaves the session
/// untouched. Dropping the session releases everything it still owns.
pub trait Exploit {
    /// The technique implemented.
    fn kind(&self) -> TechniqueKind;

    /// Number of steps.
    fn step_count(&self) -> u32;

    /// Short human readable name of `step`.
    fn step_name(&self, step: u32) -> &'static str;

    /// The step that must run next.
    fn next_step(&self) -> u32;

    /// Runs `step`.
    fn run_step(&mut self, step: u32) -> Result<()>;

    /// Current corruption level.
    fn corruption_level(&self) -> u32;

    /// Allocation bitmask of the session's pages.
    fn allocated_mask(&self) -> u32;

    /// Runs every remaining step, stopping at the first failure.
    fn run(&mut self, progress: Option<&ProgressBar>) -> Result<()> {
        for step in self.next_step()..=self.step_count() {
            if let Some(p) = progress {
                p.set_message(self.step_name(step));
            }
            if let Err(e) = self.run_step(step) {
                warn!("{} step {} ({}) failed: {}", self.kind(), step, self.step_name(step), e);
                return Err(e);
            }
            if let Some(p) = progress {
                p.set_position(step as u64);
            }
        }
        Ok(())
    }
}
