use khax_core::memory::PhysAddr;
use khax_core::util::{PAGE_MASK, PAGE_SHIFT, PAGE_SIZE};
use std::collections::HashMap;

/// Sparse physical memory. Pages that were never written read as zero.
#[derive(Default)]
pub(crate) struct PhysMemory {
    pages: HashMap<u32, Box<[u8; PAGE_SIZE]>>,
}

/// Splits `[addr, addr + len)` at page boundaries.
///
/// Yields `(chunk address, offset into the caller's buffer, chunk length)`.
pub(crate) fn page_chunks(addr: u32, len: usize) -> impl Iterator<Item = (u32, usize, usize)> {
    let mut done = 0usize;
    std::iter::from_fn(move || {
        if done >= len {
            return None;
        }
        let at = addr.wrapping_add(done as u32);
        let room = PAGE_SIZE - (at as usize & PAGE_MASK);
        let n = room.min(len - done);
        let chunk = (at, done, n);
        done += n;
        Some(chunk)
    })
}

impl PhysMemory {
    pub(crate) fn read(&self, phys: PhysAddr, buf: &mut [u8]) {
        for (at, offset, n) in page_chunks(phys.as_u32(), buf.len()) {
            let start = at as usize & PAGE_MASK;
            match self.pages.get(&(at >> PAGE_SHIFT)) {
                Some(page) => buf[offset..offset + n].copy_from_slice(&page[start..start + n]),
                None => buf[offset..offset + n].fill(0),
            }
        }
    }

    pub(crate) fn write(&mut self, phys: PhysAddr, data: &[u8]) {
        for (at, offset, n) in page_chunks(phys.as_u32(), data.len()) {
            let start = at as usize & PAGE_MASK;
            let page = self
                .pages
                .entry(at >> PAGE_SHIFT)
                .or_insert_with(|| Box::new([0u8; PAGE_SIZE]));
            page[start..start + n].copy_from_slice(&data[offset..offset + n]);
        }
    }

    pub(crate) fn read_u32(&self, phys: PhysAddr) -> u32 {
        let mut word = [0u8; 4];
        self.read(phys, &mut word);
        u32::from_le_bytes(word)
    }

    pub(crate) fn write_u32(&mut self, phys: PhysAddr, value: u32) {
        self.write(phys, &value.to_le_bytes());
    }

    pub(crate) fn zero_page(&mut self, phys: PhysAddr) {
        self.pages.remove(&(phys.as_u32() >> PAGE_SHIFT));
    }

    pub(crate) fn copy(&mut self, src: PhysAddr, dst: PhysAddr, len: usize) {
        let mut buf = vec![0u8; len];
        self.read(src, &mut buf);
        self.write(dst, &buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunks_split_at_page_boundaries() {
        let chunks: Vec<_> = page_chunks(0x1000_0ffe, 8).collect();
        assert_eq!(chunks, vec![(0x1000_0ffe, 0, 2), (0x1000_1000, 2, 6)]);
        assert_eq!(page_chunks(0, 0).count(), 0);
    }

    #[test]
    fn unaligned_words_span_pages() {
        let mut mem = PhysMemory::default();
        mem.write_u32(PhysAddr::new(0x1ff8_3ffe), 0xE50C_D08D);
        assert_eq!(mem.read_u32(PhysAddr::new(0x1ff8_3ffe)), 0xE50C_D08D);
        mem.zero_page(PhysAddr::new(0x1ff8_3000));
        assert_eq!(mem.read_u32(PhysAddr::new(0x1ff8_3ffe)), 0xE50C_0000);
    }

    #[test]
    fn untouched_memory_reads_zero() {
        let mem = PhysMemory::default();
        let mut buf = [0xffu8; 16];
        mem.read(PhysAddr::new(0x2000_0000), &mut buf);
        assert_eq!(buf, [0u8; 16]);
    }
}
