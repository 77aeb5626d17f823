/// Page shift value (12 bits) for 4KB pages
pub const PAGE_SHIFT: usize = 12;
/// Standard page size (4096 bytes)
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;
/// Mask for extracting page offset
pub const PAGE_MASK: usize = PAGE_SIZE - 1;

/// Kernel address of the pointer to the running `KThread`
pub const CURRENT_KTHREAD_PTR: u32 = 0xFFFF_9000;
/// Kernel address of the pointer to the running `KProcess`
pub const CURRENT_KPROCESS_PTR: u32 = 0xFFFF_9004;

/// Pseudo-handle for the current process
pub const CURRENT_PROCESS_HANDLE: u32 = 0xFFFF_8001;

/// First address above user space
pub const USER_SPACE_END: u32 = 0x4000_0000;

/// Syscall number of `svcBackdoor`
pub const SVC_BACKDOOR: u8 = 0x7B;
