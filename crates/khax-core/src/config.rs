use crate::util::Size;
use serde::Serialize;
use std::time::Duration;

/// Configuration parameters for khax sessions.
///
/// Controls the timing bounds of the busy-waits, the size of the cache
/// eviction buffer and the helper threads of the vtable race.
#[derive(Clone, Debug, Serialize)]
pub struct KhaxConfig {
    /// Upper bound for one GPU copy to complete
    pub copy_timeout: Duration,
    /// Size of the data cache eviction buffer
    pub cache_nuke_size: Size,
    /// Touch every page that stays allocated after the surround-free step
    pub probe_pages: bool,
    /// Upper bound for each busy-wait of the vtable race
    pub race_timeout: Duration,
    /// Application core time limit while the race runs, in percent
    pub cpu_time_limit: u32,
    /// Priority of the race helper threads
    pub helper_priority: i32,
    /// Core the race helper threads run on
    pub helper_processor: i32,
}

impl Default for KhaxConfig {
    fn default() -> Self {
        Self {
            copy_timeout: Duration::from_millis(10),
            cache_nuke_size: Size::MB(4),
            probe_pages: true,
            race_timeout: Duration::from_secs(2),
            cpu_time_limit: 5,
            helper_priority: 0x18,
            helper_processor: 1,
        }
    }
}
