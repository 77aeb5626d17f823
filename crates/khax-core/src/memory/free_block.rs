//! Typed view over the kernel's heap free-list node.
//!
//! When the kernel frees FCRAM pages it writes a doubly-linked free-list node
//! into the first bytes of the freed range. The exploit never owns such a node;
//! it reads and writes raw copies of it. [`HeapFreeBlockView`] gives those raw
//! bytes names without aliasing them as a Rust struct.

use super::KernelAddr;

/// Byte offset of the page count field.
pub const COUNT_OFFSET: usize = 0;
/// Byte offset of the forward link.
pub const NEXT_OFFSET: usize = 4;
/// Byte offset of the backward link.
pub const PREV_OFFSET: usize = 8;
/// Byte offset of the first reserved field.
pub const RESERVED1_OFFSET: usize = 12;
/// Byte offset of the second reserved field.
pub const RESERVED2_OFFSET: usize = 16;
/// Size of a free-list node in bytes.
pub const FREE_BLOCK_SIZE: usize = 20;

/// Byte-offset accessors for a heap free-list node stored in `B`.
///
/// `B` is anything that dereferences to bytes: a borrowed slice of a scratch
/// buffer, an owned `[u8; N]`, a `Vec<u8>`. Setters are available when the
/// storage is mutable. All fields are little-endian `u32`.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct HeapFreeBlockView<B> {
    buf: B,
}

impl<B: AsRef<[u8]>> HeapFreeBlockView<B> {
    /// Wraps `buf`. Returns `None` if it is shorter than a node.
    pub fn new(buf: B) -> Option<Self> {
        if buf.as_ref().len() < FREE_BLOCK_SIZE {
            return None;
        }
        Some(Self { buf })
    }

    fn field(&self, offset: usize) -> u32 {
        let bytes = self.buf.as_ref();
        u32::from_le_bytes([
            bytes[offset],
            bytes[offset + 1],
            bytes[offset + 2],
            bytes[offset + 3],
        ])
    }

    /// Number of pages in this free block.
    pub fn count(&self) -> u32 {
        self.field(COUNT_OFFSET)
    }

    /// Kernel address of the next free block.
    pub fn next(&self) -> KernelAddr {
        KernelAddr::new(self.field(NEXT_OFFSET))
    }

    /// Kernel address of the previous free block.
    pub fn prev(&self) -> KernelAddr {
        KernelAddr::new(self.field(PREV_OFFSET))
    }

    /// The two reserved words.
    pub fn reserved(&self) -> (u32, u32) {
        (self.field(RESERVED1_OFFSET), self.field(RESERVED2_OFFSET))
    }

    /// Returns the underlying storage.
    pub fn into_inner(self) -> B {
        self.buf
    }

    /// Borrows the underlying bytes.
    pub fn as_bytes(&self) -> &[u8] {
        self.buf.as_ref()
    }
}

impl HeapFreeBlockView<[u8; FREE_BLOCK_SIZE]> {
    /// Wraps an owned node-sized buffer.
    pub const fn from_array(buf: [u8; FREE_BLOCK_SIZE]) -> Self {
        Self { buf }
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> HeapFreeBlockView<B> {
    fn set_field(&mut self, offset: usize, value: u32) {
        self.buf.as_mut()[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// Sets the page count.
    pub fn set_count(&mut self, count: u32) {
        self.set_field(COUNT_OFFSET, count);
    }

    /// Sets the forward link.
    pub fn set_next(&mut self, next: KernelAddr) {
        self.set_field(NEXT_OFFSET, next.as_u32());
    }

    /// Sets the backward link.
    pub fn set_prev(&mut self, prev: KernelAddr) {
        self.set_field(PREV_OFFSET, prev.as_u32());
    }

    /// Sets both reserved words.
    pub fn set_reserved(&mut self, first: u32, second: u32) {
        self.set_field(RESERVED1_OFFSET, first);
        self.set_field(RESERVED2_OFFSET, second);
    }
}

impl<B: AsRef<[u8]>> std::fmt::Debug for HeapFreeBlockView<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeapFreeBlock")
            .field("count", &self.count())
            .field("next", &self.next())
            .field("prev", &self.prev())
            .finish()
    }
}

/// Builds a node with the given fields in an owned buffer.
pub fn free_block(
    count: u32,
    next: KernelAddr,
    prev: KernelAddr,
) -> HeapFreeBlockView<[u8; FREE_BLOCK_SIZE]> {
    let mut view = HeapFreeBlockView::from_array([0u8; FREE_BLOCK_SIZE]);
    view.set_count(count);
    view.set_next(next);
    view.set_prev(prev);
    view
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fields_are_little_endian_at_fixed_offsets() {
        let mut raw = [0u8; 64];
        raw[4..8].copy_from_slice(&[0x00, 0x30, 0xfa, 0xdf]);
        let view = HeapFreeBlockView::new(&raw[..]).unwrap();
        assert_eq!(view.next(), KernelAddr::new(0xdffa_3000));
        assert_eq!(view.count(), 0);
    }

    #[test]
    fn setters_only_touch_their_field() {
        let mut raw = [0xccu8; 64];
        {
            let mut view = HeapFreeBlockView::new(&mut raw[..]).unwrap();
            view.set_next(KernelAddr::new(0xdff8_382f));
        }
        assert_eq!(&raw[0..4], &[0xcc; 4]);
        assert_eq!(&raw[4..8], &0xdff8_382fu32.to_le_bytes());
        assert_eq!(&raw[8..64], &[0xcc; 56][..]);
    }

    #[test]
    fn short_buffers_are_rejected() {
        assert!(HeapFreeBlockView::new([0u8; 16]).is_none());
    }

    #[test]
    fn owned_node() {
        let node = free_block(1, KernelAddr::new(0xe000_5000), KernelAddr::NULL);
        assert_eq!(node.count(), 1);
        assert_eq!(node.prev(), KernelAddr::NULL);
        assert_eq!(node.reserved(), (0, 0));
    }
}
