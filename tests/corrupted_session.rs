//! A session dropped while the kernel is still patched must never release
//! anything. The dropping thread parks for good and the session slot stays
//! claimed, so this lives in its own test binary.

use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use khax::util::Size;
use khax::version::{SystemVersion, THREAD_PATCH_ORIGINAL, lookup};
use khax::{Exploit, KhaxConfig, KhaxError, MemChunkHax, session};
use khax_sim::{SimConfig, SimHorizon};

#[test]
fn dropping_a_corrupted_session_parks_and_keeps_its_pages() -> anyhow::Result<()> {
    let _ = env_logger::builder().is_test(true).try_init();
    let kernel = SystemVersion::new(2, 46, 0);
    let sim = Arc::new(SimHorizon::new(SimConfig::new(kernel, false)));
    let config = KhaxConfig {
        cache_nuke_size: Size::KB(64),
        ..Default::default()
    };

    let (tx, rx) = mpsc::channel();
    let host = Arc::clone(&sim);
    let worker = thread::spawn(move || -> anyhow::Result<()> {
        let descriptor = lookup(kernel, false).ok_or_else(|| anyhow::anyhow!("no descriptor"))?;
        let mut hax = MemChunkHax::new(Arc::clone(&host), descriptor, config)?;
        for step in 1..=4 {
            hax.run_step(step)?;
        }
        // Lose the completion of the write-back that poisons page 2's link.
        host.fail_copy_wait(2);
        let err = hax.run_step(5).err();
        let pages = hax.pages().cloned().ok_or_else(|| anyhow::anyhow!("no pages"))?;
        tx.send((err, pages, hax.corruption_level(), hax.allocated_mask()))
            .map_err(|_| anyhow::anyhow!("receiver gone"))?;
        drop(hax);
        Ok(())
    });

    let (err, pages, level, mask) = rx.recv_timeout(Duration::from_secs(30))?;
    assert!(matches!(err, Some(KhaxError::Host { .. })), "{:?}", err);
    assert!(level >= 2);
    assert_eq!(mask, 0b10_1011);

    thread::sleep(Duration::from_millis(500));
    assert!(!worker.is_finished());
    assert!(session::is_active());
    for index in 0..khax_memchunk::PAGE_COUNT {
        assert_eq!(
            sim.is_mapped(pages.page(index)),
            mask & (1 << index) != 0,
            "page {}",
            index
        );
    }
    assert_eq!(sim.thread_patch_bytes(), Some(THREAD_PATCH_ORIGINAL));
    assert_eq!(sim.kernel_panic(), None);
    Ok(())
}
