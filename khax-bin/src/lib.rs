//! Shared setup of the khax binaries.
//!
//! The binaries drive the engine against [`khax_sim::SimHorizon`] and print a
//! [`khax::RunReport`] as JSON. Logging goes through `env_logger` (filter with
//! `RUST_LOG`, default `info`) and is routed around the step progress bars.

use anyhow::bail;
use indicatif::MultiProgress;
use indicatif_log_bridge::LogWrapper;
use khax::version::SystemVersion;

pub fn init_logging_with_progress() -> anyhow::Result<MultiProgress> {
    let logger =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).build();
    let progress = MultiProgress::new();
    LogWrapper::new(progress.clone(), logger).try_init()?;
    Ok(progress)
}

/// Parses `major.minor.revision`.
pub fn parse_version(s: &str) -> anyhow::Result<SystemVersion> {
    let parts = s
        .split('.')
        .map(str::parse::<u8>)
        .collect::<Result<Vec<_>, _>>()?;
    match parts[..] {
        [major, minor, revision] => Ok(SystemVersion::new(major, minor, revision)),
        _ => bail!("expected major.minor.revision, got {}", s),
    }
}
