//! The kernel's FCRAM free list.
//!
//! Nodes live in the first 20 bytes of each free run and are addressed by
//! their kernel virtual address in the FCRAM window. The list is kept sorted
//! by address and adjacent runs are merged on free. Like the real allocator,
//! none of the links read back from memory are validated.

use crate::error::SimError;
use crate::state::{FREE_WALK_LIMIT, SimState};
use khax_core::memory::free_block::{FREE_BLOCK_SIZE, NEXT_OFFSET, PREV_OFFSET, free_block};
use khax_core::memory::{HeapFreeBlockView, KernelAddr, PhysAddr};
use khax_core::util::PAGE_SIZE;

const PAGE: u32 = PAGE_SIZE as u32;

type Node = HeapFreeBlockView<[u8; FREE_BLOCK_SIZE]>;

impl SimState {
    fn read_node(&self, kva: KernelAddr) -> Result<Node, SimError> {
        let mut raw = [0u8; FREE_BLOCK_SIZE];
        self.kernel_read(kva, &mut raw)?;
        Ok(HeapFreeBlockView::from_array(raw))
    }

    fn write_node(&mut self, kva: KernelAddr, node: &Node) -> Result<(), SimError> {
        self.kernel_write(kva, node.as_bytes())
    }

    fn set_next(&mut self, node: KernelAddr, next: KernelAddr) -> Result<(), SimError> {
        self.kernel_write_u32(node.wrapping_add(NEXT_OFFSET as u32), next.as_u32())
    }

    fn set_prev(&mut self, node: KernelAddr, prev: KernelAddr) -> Result<(), SimError> {
        self.kernel_write_u32(node.wrapping_add(PREV_OFFSET as u32), prev.as_u32())
    }

    /// The page at the head of the list, without unlinking it.
    pub(crate) fn peek_head(&self) -> Result<Option<(KernelAddr, PhysAddr)>, SimError> {
        if self.free_head.is_null() {
            return Ok(None);
        }
        let phys = self
            .kernel_phys(self.free_head)
            .ok_or(SimError::UnmappedKernel(self.free_head))?;
        Ok(Some((self.free_head, phys)))
    }

    /// Unlinks the first page of the head run.
    ///
    /// The node is read only now, after the page may already have been
    /// mapped into user space.
    pub(crate) fn consume_head(&mut self, head: KernelAddr) -> Result<(), SimError> {
        let node = self.read_node(head)?;
        let next = node.next();
        if node.count() > 1 {
            let rest = head.wrapping_add(PAGE);
            self.write_node(rest, &free_block(node.count() - 1, next, KernelAddr::NULL))?;
            if !next.is_null() {
                self.set_prev(next, rest)?;
            }
            self.free_head = rest;
        } else {
            self.free_head = next;
            if !next.is_null() {
                self.set_prev(next, KernelAddr::NULL)?;
            }
        }
        Ok(())
    }

    /// Takes `pages` physically contiguous pages from the start of the first
    /// run large enough.
    pub(crate) fn carve_contiguous(&mut self, pages: u32) -> Result<Option<KernelAddr>, SimError> {
        let mut current = self.free_head;
        let mut visited = 0;
        while !current.is_null() {
            visited += 1;
            if visited > FREE_WALK_LIMIT {
                return Err(SimError::FreeListCycle(FREE_WALK_LIMIT));
            }
            let node = self.read_node(current)?;
            if node.count() < pages {
                current = node.next();
                continue;
            }
            let (next, prev) = (node.next(), node.prev());
            let successor = if node.count() == pages {
                if !next.is_null() {
                    self.set_prev(next, prev)?;
                }
                next
            } else {
                let rest = current.wrapping_add(pages * PAGE);
                self.write_node(rest, &free_block(node.count() - pages, next, prev))?;
                if !next.is_null() {
                    self.set_prev(next, rest)?;
                }
                rest
            };
            if prev.is_null() {
                self.free_head = successor;
            } else {
                self.set_next(prev, successor)?;
            }
            return Ok(Some(current));
        }
        Ok(None)
    }

    /// Returns one page to the list, merging with its neighbors.
    pub(crate) fn insert_free(&mut self, kva: KernelAddr) -> Result<(), SimError> {
        let mut prev = KernelAddr::NULL;
        let mut next = self.free_head;
        let mut visited = 0;
        while !next.is_null() && next < kva {
            visited += 1;
            if visited > FREE_WALK_LIMIT {
                return Err(SimError::FreeListCycle(FREE_WALK_LIMIT));
            }
            prev = next;
            next = self.read_node(next)?.next();
        }

        let mut count = 1;
        let mut link = next;
        if !next.is_null() && kva.wrapping_add(PAGE) == next {
            let following = self.read_node(next)?;
            count += following.count();
            link = following.next();
        }
        self.write_node(kva, &free_block(count, link, prev))?;
        if !link.is_null() {
            self.set_prev(link, kva)?;
        }
        if prev.is_null() {
            self.free_head = kva;
            return Ok(());
        }
        self.set_next(prev, kva)?;

        let before = self.read_node(prev)?;
        if prev.wrapping_add(before.count() * PAGE) == kva {
            self.write_node(prev, &free_block(before.count() + count, link, before.prev()))?;
            if !link.is_null() {
                self.set_prev(link, prev)?;
            }
        }
        Ok(())
    }

    /// Every run as `(address, page count)`, in list order.
    pub(crate) fn free_blocks(&self) -> Result<Vec<(KernelAddr, u32)>, SimError> {
        let mut blocks = Vec::new();
        let mut current = self.free_head;
        while !current.is_null() {
            if blocks.len() >= FREE_WALK_LIMIT {
                return Err(SimError::FreeListCycle(FREE_WALK_LIMIT));
            }
            let node = self.read_node(current)?;
            blocks.push((current, node.count()));
            current = node.next();
        }
        Ok(blocks)
    }

    /// Checks order, back links, overlap and that every run lies in FCRAM.
    pub(crate) fn free_list_consistent(&self) -> bool {
        let mut expected_prev = KernelAddr::NULL;
        let mut end = 0u64;
        let mut current = self.free_head;
        let mut visited = 0;
        while !current.is_null() {
            visited += 1;
            if visited > FREE_WALK_LIMIT || !self.fcram.contains_virt(current) {
                return false;
            }
            let Ok(node) = self.read_node(current) else {
                return false;
            };
            if node.prev() != expected_prev || node.count() == 0 || (current.as_u32() as u64) < end {
                return false;
            }
            end = current.as_u32() as u64 + node.count() as u64 * PAGE as u64;
            expected_prev = current;
            current = node.next();
        }
        true
    }
}
