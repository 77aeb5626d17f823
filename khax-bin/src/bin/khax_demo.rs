use std::{
    fs::File,
    io::{BufWriter, Write},
    sync::Arc,
};

use anyhow::{Result, bail};
use clap::Parser;
use khax::host::Horizon;
use khax::kernel::KernelContext;
use khax::util::Size;
use khax::version::{SystemVersion, lookup, supported_kernels};
use khax::{Khax, KhaxConfig, kernel_call};
use khax_bin::{init_logging_with_progress, parse_version};
use khax_sim::{SimConfig, SimHorizon};
use log::{info, warn};
use serde::Serialize;

const PRIVILEGED_SERVICE: &str = "am:u";
const BACKDOOR_MARKER: u32 = 0x6666_ABCD;

/// CLI arguments for the `khax_demo` binary.
///
/// Runs one escalation against a simulated console and prints the report.
#[derive(Debug, Parser, Serialize, Clone)]
struct CliArgs {
    /// Kernel version of the simulated console.
    #[clap(long = "kernel", default_value = "2.50.11", value_parser = parse_version)]
    kernel: SystemVersion,
    /// Simulate a New 3DS.
    #[clap(long = "new-3ds")]
    new_3ds: bool,
    /// Seed for the simulated process id and ACLs. Random if omitted.
    #[clap(long = "seed")]
    seed: Option<u64>,
    /// Never preempt a page commit, which makes the vtable race fail.
    #[clap(long = "no-preemption")]
    no_preemption: bool,
    /// Return misaligned linear allocations.
    #[clap(long = "misaligned")]
    misaligned: bool,
    /// Size of the cache eviction buffer.
    #[clap(long = "cache-nuke", default_value = "4M")]
    cache_nuke: Size,
    /// Output file for the report (JSON format).
    #[clap(long = "output")]
    output: Option<String>,
    /// List the supported kernel versions and exit.
    #[clap(long = "list")]
    list: bool,
}

#[derive(Debug, Serialize)]
struct DemoResults<'a> {
    args: &'a CliArgs,
    seed: u64,
    service_before: String,
    service_after: Option<String>,
    backdoor: Option<String>,
    report: khax::RunReport,
}

fn backdoor_smoke(k: &mut dyn KernelContext, _: u32) -> u32 {
    let state = k.disable_interrupts();
    k.restore_interrupts(state);
    BACKDOOR_MARKER
}

fn test_service_access<H: Horizon>(host: &H) -> String {
    match host.srv_get_service_handle(PRIVILEGED_SERVICE) {
        Ok(handle) => {
            if let Err(code) = host.close_handle(handle) {
                warn!("closing {} failed: {}", PRIVILEGED_SERVICE, code);
            }
            format!("{} opened", PRIVILEGED_SERVICE)
        }
        Err(code) => format!("{} denied: {}", PRIVILEGED_SERVICE, code),
    }
}

fn list_kernels() {
    for kernel in supported_kernels() {
        let variants = [false, true]
            .into_iter()
            .filter_map(|new_3ds| lookup(kernel, new_3ds))
            .map(|d| {
                format!(
                    "{} {:?}",
                    if d.new_3ds { "new" } else { "old" },
                    d.technique()
                )
            })
            .collect::<Vec<_>>();
        println!("{:<10} {}", kernel.to_string(), variants.join(", "));
    }
}

fn main() -> Result<()> {
    let progress = init_logging_with_progress()?;
    let args = CliArgs::parse();
    if args.list {
        list_kernels();
        return Ok(());
    }

    let seed = args.seed.unwrap_or_else(rand::random);
    info!("simulating kernel {} (new 3DS: {}), seed {}", args.kernel, args.new_3ds, seed);
    let sim = Arc::new(SimHorizon::new(
        SimConfig::new(args.kernel, args.new_3ds)
            .seed(seed)
            .race_preemption(!args.no_preemption)
            .misaligned_linear(args.misaligned),
    ));

    let service_before = test_service_access(&*sim);
    info!("before: {}", service_before);

    let config = KhaxConfig {
        cache_nuke_size: args.cache_nuke,
        ..Default::default()
    };
    let khax = Khax::builder()
        .host(Arc::clone(&sim))
        .config(config)
        .progress(progress)
        .build()?;
    let report = khax.run();
    info!("khax_init returned {}", report.result);

    let mut results = DemoResults {
        args: &args,
        seed,
        service_before,
        service_after: None,
        backdoor: None,
        report,
    };
    if results.report.is_success() {
        let backdoor = match kernel_call(&*sim, backdoor_smoke, 0) {
            Ok(value) => format!("0x{:08x}", value),
            Err(e) => e.to_string(),
        };
        info!("backdoor returned {}", backdoor);
        results.backdoor = Some(backdoor);
        let service_after = test_service_access(&*sim);
        info!("after: {}", service_after);
        results.service_after = Some(service_after);
    }
    if let Some(panic) = sim.kernel_panic() {
        warn!("simulated kernel panicked: {}", panic);
    }

    match &args.output {
        Some(filename) => {
            let file = File::create(filename)?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer_pretty(&mut writer, &results)?;
            writer.flush()?;
            info!("Results saved to {}", filename);
        }
        None => println!("{}", serde_json::to_string_pretty(&results)?),
    }

    if !results.report.is_success() {
        bail!("escalation failed with {}", results.report.result);
    }
    Ok(())
}
