use khax_core::util::Size;
use khax_core::version::{SystemVersion, lookup};
use std::time::Duration;

/// Parameters of a simulated console.
///
/// Built with [`SimConfig::new`] and adjusted with the chained setters, in the
/// style of a builder.
#[derive(Clone, Debug)]
pub struct SimConfig {
    /// Kernel version reported to the process
    pub kernel_version: SystemVersion,
    /// Firmware version reported to the process
    pub firm_version: SystemVersion,
    /// New 3DS hardware
    pub new_3ds: bool,
    /// Seed for the process id and the initial ACLs
    pub seed: u64,
    /// How long a page commit waits for the user to touch the page it just
    /// mapped while helper threads are running
    pub preempt_window: Duration,
    /// Whether a page commit can be preempted at all
    pub race_preemption: bool,
    /// Make linear allocations come back off page alignment
    pub misaligned_linear_alloc: bool,
    /// Initial application core time limit in percent
    pub cpu_time_limit: u32,
    /// Size of the pre-mapped linear pool backing `linear_alloc`
    pub user_pool_size: Size,
    /// Number of regular heap pages mapped at start
    pub heap_pages: usize,
    /// Number of pages in the kernel's free list at start
    pub free_pages: usize,
}

impl SimConfig {
    /// A console running `kernel_version` with default parameters.
    ///
    /// The firmware version is the nominal version of the matching table row,
    /// or the kernel version itself for kernels not in the table.
    pub fn new(kernel_version: SystemVersion, new_3ds: bool) -> Self {
        let firm_version = lookup(kernel_version, new_3ds)
            .map(|d| d.nominal_version)
            .unwrap_or(kernel_version);
        SimConfig {
            kernel_version,
            firm_version,
            new_3ds,
            seed: 0x3d5_c0de,
            preempt_window: Duration::from_secs(2),
            race_preemption: true,
            misaligned_linear_alloc: false,
            cpu_time_limit: 0,
            user_pool_size: Size::MB(8),
            heap_pages: 16,
            free_pages: 256,
        }
    }

    /// Sets the seed.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Sets the reported firmware version.
    pub fn firm_version(mut self, version: SystemVersion) -> Self {
        self.firm_version = version;
        self
    }

    /// Enables or disables page-commit preemption.
    pub fn race_preemption(mut self, enabled: bool) -> Self {
        self.race_preemption = enabled;
        self
    }

    /// Sets the page-commit preemption window.
    pub fn preempt_window(mut self, window: Duration) -> Self {
        self.preempt_window = window;
        self
    }

    /// Makes linear allocations misaligned.
    pub fn misaligned_linear(mut self, misaligned: bool) -> Self {
        self.misaligned_linear_alloc = misaligned;
        self
    }

    /// Sets the initial application core time limit.
    pub fn cpu_time_limit(mut self, percent: u32) -> Self {
        self.cpu_time_limit = percent;
        self
    }
}
