//! Memory primitives: address newtypes, the virt→phys resolver seam, the
//! free-list node view and the session-owned page set.

pub mod free_block;
mod page_set;
mod virt_to_phys;

pub use self::free_block::{FREE_BLOCK_SIZE, HeapFreeBlockView};
pub use self::page_set::PageSet;
pub use self::virt_to_phys::*;
