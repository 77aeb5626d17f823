use super::VirtAddr;
use crate::host::{Horizon, MemOp, MemPerm};
use crate::util::PAGE_SIZE;
use log::{debug, warn};

/// A run of virtually contiguous pages owned by an exploit session.
///
/// Each page carries an "allocated" bit; steps that free pages clear the bit so
/// that [`PageSet::release`] only frees what the session still owns. Pinned
/// pages are never freed, even when allocated.
#[derive(Debug, Clone)]
pub struct PageSet {
    base: VirtAddr,
    count: usize,
    allocated: u32,
    pinned: u32,
}

impl PageSet {
    /// Creates a set of `count` pages starting at `base`, all marked allocated.
    pub fn allocated(base: VirtAddr, count: usize) -> Self {
        assert!(count <= 32, "PageSet supports at most 32 pages");
        Self {
            base,
            count,
            allocated: ((1u64 << count) - 1) as u32,
            pinned: 0,
        }
    }

    /// Creates a set of `count` pages starting at `base`, none of them allocated.
    pub fn empty(base: VirtAddr, count: usize) -> Self {
        let mut set = Self::allocated(base, count);
        set.allocated = 0;
        set
    }

    /// Address of the first page.
    pub fn base(&self) -> VirtAddr {
        self.base
    }

    /// Number of pages in the set.
    pub fn len(&self) -> usize {
        self.count
    }

    /// Returns `true` if the set has no pages.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Address of page `index`.
    pub fn page(&self, index: usize) -> VirtAddr {
        assert!(index < self.count, "page {} >= {}", index, self.count);
        self.base + (index * PAGE_SIZE) as u32
    }

    /// The allocation bitmask (bit `i` set = page `i` still owned).
    pub fn allocated_mask(&self) -> u32 {
        self.allocated
    }

    /// Returns `true` if page `index` is still owned.
    pub fn is_allocated(&self, index: usize) -> bool {
        self.allocated & (1 << index) != 0
    }

    /// Records that page `index` was freed.
    pub fn mark_freed(&mut self, index: usize) {
        self.allocated &= !(1 << index);
    }

    /// Records that page `index` is owned again.
    pub fn mark_allocated(&mut self, index: usize) {
        self.allocated |= 1 << index;
    }

    /// Keeps page `index` mapped for the rest of the process lifetime.
    pub fn pin(&mut self, index: usize) {
        self.pinned |= 1 << index;
    }

    /// Returns `true` if page `index` is pinned.
    pub fn is_pinned(&self, index: usize) -> bool {
        self.pinned & (1 << index) != 0
    }

    /// Frees page `index` through the host and clears its bit.
    pub fn free_page<H: Horizon + ?Sized>(
        &mut self,
        host: &H,
        index: usize,
    ) -> Result<(), crate::error::ResultCode> {
        host.control_memory(MemOp::Free, self.page(index), PAGE_SIZE, MemPerm::None)?;
        self.mark_freed(index);
        Ok(())
    }

    /// Frees every page that is still allocated and not pinned.
    ///
    /// Failures are logged and the page keeps its bit; nothing here is retried.
    pub fn release<H: Horizon + ?Sized>(&mut self, host: &H) {
        for index in 0..self.count {
            if !self.is_allocated(index) || self.is_pinned(index) {
                continue;
            }
            match self.free_page(host, index) {
                Ok(()) => debug!("free {}: ok", index),
                Err(code) => warn!("free {}: {}", index, code),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitmask_tracks_frees() {
        let mut pages = PageSet::allocated(VirtAddr::new(0x1400_0000), 6);
        assert_eq!(pages.allocated_mask(), 0b11_1111);
        pages.mark_freed(2);
        pages.mark_freed(4);
        assert_eq!(pages.allocated_mask(), 0b10_1011);
        assert!(!pages.is_allocated(4));
        assert_eq!(pages.page(4), VirtAddr::new(0x1400_4000));
    }

    #[test]
    fn empty_set_and_pins() {
        let mut pages = PageSet::empty(VirtAddr::new(0x0800_0000), 4);
        assert_eq!(pages.allocated_mask(), 0);
        pages.mark_allocated(3);
        pages.pin(3);
        assert!(pages.is_allocated(3) && pages.is_pinned(3));
        assert!(!pages.is_pinned(2));
    }

    #[test]
    #[should_panic]
    fn out_of_range_page() {
        PageSet::allocated(VirtAddr::new(0), 2).page(2);
    }
}
