use std::sync::Arc;

use khax::grant::{SVC_ACL_FULL, svc_allowed};
use khax::host::{Handle, Horizon};
use khax::kernel::KernelContext;
use khax::memory::KernelAddr;
use khax::util::{SVC_BACKDOOR, Size};
use khax::version::{SystemVersion, lookup, lowest_supported, supported_kernels};
use khax::{
    Exploit, FailureClass, Khax, KhaxConfig, KhaxError, MemChunkHax, ResultCode, RunReport,
    Technique, TechniqueKind, khax_init, kernel_call, session,
};
use khax_sim::{SimConfig, SimHorizon};
use serial_test::serial;

const PRIVILEGED_SERVICE: &str = "am:u";

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn sim(kernel: SystemVersion, new_3ds: bool) -> Arc<SimHorizon> {
    Arc::new(SimHorizon::new(SimConfig::new(kernel, new_3ds)))
}

fn config() -> KhaxConfig {
    KhaxConfig {
        cache_nuke_size: Size::KB(64),
        ..Default::default()
    }
}

fn run(sim: &Arc<SimHorizon>) -> anyhow::Result<RunReport> {
    Ok(Khax::builder().host(Arc::clone(sim)).config(config()).build()?.run())
}

fn assert_kernel_intact(sim: &SimHorizon) {
    assert_eq!(sim.kernel_panic(), None);
    assert!(sim.free_list_consistent());
    assert!(!sim.interrupts_masked());
}

#[test]
#[serial]
fn legacy_kernels_escalate_on_both_variants() -> anyhow::Result<()> {
    init_logging();
    for (kernel, new_3ds) in [
        (SystemVersion::new(2, 46, 0), false),
        (SystemVersion::new(2, 46, 0), true),
        (SystemVersion::new(2, 44, 6), false),
    ] {
        let sim = sim(kernel, new_3ds);
        let report = run(&sim)?;
        assert!(report.is_success(), "{}", report.to_json()?);
        assert_eq!(report.technique, Some(TechniqueKind::LegacyHeapCoalesce));
        assert_eq!(report.steps_completed, khax_memchunk::STEP_COUNT);
        assert_eq!(report.corruption_level, 0);
        assert_eq!(sim.thread_acl(), SVC_ACL_FULL);
        assert_eq!(sim.process_acl(), SVC_ACL_FULL);
        assert_kernel_intact(&sim);
    }
    assert!(!session::is_active());
    Ok(())
}

#[test]
#[serial]
fn newer_kernels_escalate_on_both_variants() -> anyhow::Result<()> {
    init_logging();
    for kernel in [SystemVersion::new(2, 48, 3), SystemVersion::new(2, 50, 11)] {
        for new_3ds in [false, true] {
            let sim = sim(kernel, new_3ds);
            let report = run(&sim)?;
            assert!(report.is_success(), "{}", report.to_json()?);
            assert_eq!(report.technique, Some(TechniqueKind::VtableHijack));
            assert_eq!(report.new_3ds, new_3ds);
            assert_eq!(report.steps_completed, khax_vtable::STEP_COUNT);
            assert_eq!(report.corruption_level, 0);
            assert_eq!(sim.thread_acl(), SVC_ACL_FULL);
            assert_eq!(sim.timers_destroyed(), 1);
            assert_kernel_intact(&sim);
        }
    }
    Ok(())
}

#[test]
#[serial]
fn grant_round_trips_the_process_id() -> anyhow::Result<()> {
    for kernel in [SystemVersion::new(2, 46, 0), SystemVersion::new(2, 50, 11)] {
        let sim = sim(kernel, false);
        let pid = sim
            .get_process_id(Handle::CURRENT_PROCESS)
            .map_err(|c| anyhow::anyhow!("{}", c))?;
        let thread_before = sim.thread_acl();
        let process_before = sim.process_acl();

        let report = run(&sim)?;
        assert!(report.is_success());
        assert_eq!(sim.process_id(), pid);
        assert_eq!(sim.srv_pid(), Some(0));

        let backup = report.acl_backup.ok_or_else(|| anyhow::anyhow!("no ACL backup"))?;
        assert_eq!(backup.thread, thread_before);
        assert_eq!(backup.process, process_before);
        assert_eq!(backup.process_id, Some(pid));

        for (before, after) in thread_before.iter().zip(sim.thread_acl()) {
            assert_eq!(before | after, after);
        }
        let denied: Vec<u8> = (0..=0x7Fu8)
            .filter(|svc| !svc_allowed(&sim.thread_acl(), *svc))
            .collect();
        assert_eq!(denied, [0x00, 0x7E, 0x7F]);
        assert!(svc_allowed(&sim.process_acl(), SVC_BACKDOOR));
    }
    Ok(())
}

#[test]
#[serial]
fn privileged_services_open_after_escalation() -> anyhow::Result<()> {
    let sim = sim(SystemVersion::new(2, 46, 0), false);
    assert_eq!(
        sim.srv_get_service_handle(PRIVILEGED_SERVICE),
        Err(ResultCode::NOT_AUTHORIZED)
    );
    assert!(sim.srv_get_service_handle("APT:U").is_ok());

    assert_eq!(khax_init(Arc::clone(&sim)), ResultCode::SUCCESS);
    assert!(sim.srv_get_service_handle(PRIVILEGED_SERVICE).is_ok());
    Ok(())
}

#[test]
#[serial]
fn kernel_calls_run_after_escalation() -> anyhow::Result<()> {
    fn read_patch_site(k: &mut dyn KernelContext, addr: u32) -> u32 {
        let mut word = [0u8; 4];
        k.read_bytes(KernelAddr::new(addr), &mut word);
        u32::from_le_bytes(word)
    }

    let kernel = SystemVersion::new(2, 46, 0);
    let sim = sim(kernel, false);
    let patch = lookup(kernel, false)
        .and_then(|d| d.thread_patch_address)
        .ok_or_else(|| anyhow::anyhow!("no patch site"))?;
    assert!(kernel_call(&*sim, read_patch_site, patch.as_u32()).is_err());

    assert_eq!(khax_init(Arc::clone(&sim)), ResultCode::SUCCESS);
    let word = kernel_call(&*sim, read_patch_site, patch.as_u32())?;
    let original = sim.thread_patch_bytes().ok_or_else(|| anyhow::anyhow!("no patch bytes"))?;
    assert_eq!(word, u32::from_le_bytes(original));
    assert_eq!(sim.kernel_panic(), None);
    Ok(())
}

#[test]
#[serial]
fn unsupported_versions_are_reported() -> anyhow::Result<()> {
    let lowest = lowest_supported();
    let below = SystemVersion::from_packed(lowest.packed() - 1);
    assert!(lookup(below, false).is_none());
    assert!(lookup(below, true).is_none());

    for kernel in [below, SystemVersion::new(2, 51, 0)] {
        let sim = sim(kernel, false);
        let report = run(&sim)?;
        assert!(!report.is_success());
        assert_eq!(report.technique, None);
        let expected = KhaxError::UnknownVersion {
            kernel,
            new_3ds: false,
        };
        assert_eq!(report.result, expected.code());
        assert_eq!(report.error.map(|e| e.class), Some(FailureClass::VersionUnrecognized));
        assert_eq!(khax_init(sim), expected.code());
    }
    Ok(())
}

#[test]
fn table_rows_keep_their_patch_addresses() {
    let entry = lookup(SystemVersion::new(2, 46, 0), false);
    assert_eq!(
        entry.and_then(|d| d.thread_patch_address),
        Some(KernelAddr::new(0xDFF8_3837))
    );
    let kernels = supported_kernels();
    assert_eq!(kernels.first(), Some(&lowest_supported()));
    assert!(kernels.windows(2).all(|w| w[0] < w[1]));
}

#[test]
#[serial]
fn steps_run_strictly_in_order() -> anyhow::Result<()> {
    for kernel in [SystemVersion::new(2, 46, 0), SystemVersion::new(2, 50, 11)] {
        let sim = sim(kernel, false);
        let descriptor = lookup(kernel, false).ok_or_else(|| anyhow::anyhow!("no descriptor"))?;
        let mut technique = Technique::select(Arc::clone(&sim), descriptor, config())?;
        let exploit = technique.exploit_mut();
        let err = exploit.run_step(2).err();
        assert_eq!(err.map(|e| e.class()), Some(FailureClass::Sequencing));
        assert_eq!(exploit.next_step(), 1);
        assert_eq!(exploit.allocated_mask(), 0);

        exploit.run_step(1)?;
        assert!(exploit.run_step(1).is_err());
        assert!(exploit.run_step(exploit.step_count() + 1).is_err());
        assert_eq!(exploit.next_step(), 2);
    }
    Ok(())
}

#[test]
#[serial]
fn one_session_at_a_time() -> anyhow::Result<()> {
    let kernel = SystemVersion::new(2, 46, 0);
    let sim = sim(kernel, false);
    let descriptor = lookup(kernel, false).ok_or_else(|| anyhow::anyhow!("no descriptor"))?;
    let first = MemChunkHax::new(Arc::clone(&sim), descriptor, config())?;
    assert!(session::is_active());
    let second = Technique::select(Arc::clone(&sim), descriptor, config());
    assert!(matches!(second, Err(KhaxError::SessionActive)));
    drop(first);
    assert!(!session::is_active());
    Ok(())
}

#[test]
#[serial]
fn dropped_sessions_free_exactly_their_remaining_pages() -> anyhow::Result<()> {
    let kernel = SystemVersion::new(2, 46, 0);
    let sim = sim(kernel, false);
    let descriptor = lookup(kernel, false).ok_or_else(|| anyhow::anyhow!("no descriptor"))?;
    let mut hax = MemChunkHax::new(Arc::clone(&sim), descriptor, config())?;
    hax.run_step(1)?;
    assert_eq!(hax.allocated_mask(), 0);
    let mut masks = Vec::new();
    for step in 2..=4 {
        hax.run_step(step)?;
        masks.push(hax.allocated_mask());
    }
    assert!(masks.windows(2).all(|w| w[1] & !w[0] == 0));

    let pages = hax.pages().cloned().ok_or_else(|| anyhow::anyhow!("no pages"))?;
    let mask = hax.allocated_mask();
    let free_before = sim.free_blocks()?.iter().map(|(_, n)| *n).sum::<u32>();
    drop(hax);
    let free_after = sim.free_blocks()?.iter().map(|(_, n)| *n).sum::<u32>();
    assert_eq!(free_after - free_before, mask.count_ones());
    for index in 0..khax_memchunk::PAGE_COUNT {
        assert!(!sim.is_mapped(pages.page(index)));
    }
    assert_kernel_intact(&sim);
    Ok(())
}

#[test]
#[serial]
fn foreign_free_blocks_abort_before_corruption() -> anyhow::Result<()> {
    let kernel = SystemVersion::new(2, 46, 0);
    let sim = sim(kernel, false);
    let descriptor = lookup(kernel, false).ok_or_else(|| anyhow::anyhow!("no descriptor"))?;
    let mut hax = MemChunkHax::new(Arc::clone(&sim), descriptor, config())?;
    for step in 1..=3 {
        hax.run_step(step)?;
    }
    let page = hax.pages().map(|p| p.page(2)).ok_or_else(|| anyhow::anyhow!("no pages"))?;
    sim.overwrite_free_link(page, KernelAddr::new(0xF000_0000))?;
    let err = hax.run_step(4).err();
    assert_eq!(err.map(|e| e.class()), Some(FailureClass::LayoutMismatch));
    assert_eq!(hax.corruption_level(), 0);
    assert_eq!(hax.next_step(), 4);
    assert_eq!(sim.thread_patch_bytes(), Some(khax::version::THREAD_PATCH_ORIGINAL));
    Ok(())
}

#[test]
#[serial]
fn misaligned_linear_memory_is_released() -> anyhow::Result<()> {
    let sim = Arc::new(SimHorizon::new(
        SimConfig::new(SystemVersion::new(2, 46, 0), false).misaligned_linear(true),
    ));
    let free_before = sim.free_blocks()?;
    let report = run(&sim)?;
    assert_eq!(report.error.map(|e| e.class), Some(FailureClass::Allocation));
    assert_eq!(report.corruption_level, 0);
    assert_eq!(report.steps_completed, 1);
    assert_eq!(sim.free_blocks()?, free_before);
    assert_kernel_intact(&sim);
    Ok(())
}

#[test]
#[serial]
fn lost_race_is_not_corrupting() -> anyhow::Result<()> {
    let sim = Arc::new(SimHorizon::new(
        SimConfig::new(SystemVersion::new(2, 50, 11), false).race_preemption(false),
    ));
    let limit = sim.app_cpu_time_limit().map_err(|c| anyhow::anyhow!("{}", c))?;
    let report = run(&sim)?;
    assert!(!report.is_success());
    assert_eq!(report.error.map(|e| e.class), Some(FailureClass::Corrupting));
    assert_eq!(report.corruption_level, 0);
    assert_eq!(report.steps_completed, 2);
    assert_ne!(sim.thread_acl(), SVC_ACL_FULL);
    assert_eq!(sim.app_cpu_time_limit().map_err(|c| anyhow::anyhow!("{}", c))?, limit);
    assert_kernel_intact(&sim);
    Ok(())
}

#[test]
#[serial]
fn reports_serialize_to_json() -> anyhow::Result<()> {
    let sim = sim(SystemVersion::new(2, 50, 11), false);
    let report = run(&sim)?;
    let json: serde_json::Value = serde_json::from_str(&report.to_json()?)?;
    assert_eq!(json["technique"], "VtableHijack");
    assert_eq!(json["result"], 0);
    assert_eq!(json["kernel_version"], "2.50.11");
    assert!(json["error"].is_null());
    Ok(())
}
