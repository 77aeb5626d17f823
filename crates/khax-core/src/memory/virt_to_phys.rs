use std::fmt::{Debug, Display, Formatter};
use std::ops::{Add, Sub};

use crate::util::PAGE_MASK;
use serde::Serialize;

macro_rules! address_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[repr(transparent)]
        #[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
        pub struct $name(u32);

        impl $name {
            /// The null address.
            pub const NULL: Self = Self(0);

            /// Wraps a raw 32-bit address.
            pub const fn new(addr: u32) -> Self {
                Self(addr)
            }

            /// Returns the raw address.
            pub const fn as_u32(self) -> u32 {
                self.0
            }

            /// Returns `true` for the null address.
            pub const fn is_null(self) -> bool {
                self.0 == 0
            }

            /// Offset of this address inside its page.
            pub const fn page_offset(self) -> u32 {
                self.0 & PAGE_MASK as u32
            }

            /// The address of the page containing this address.
            pub const fn page_base(self) -> Self {
                Self(self.0 & !(PAGE_MASK as u32))
            }

            /// Returns `true` if the address is page aligned.
            pub const fn is_page_aligned(self) -> bool {
                self.page_offset() == 0
            }

            /// Adds `rhs`, wrapping around the 32-bit address space.
            pub const fn wrapping_add(self, rhs: u32) -> Self {
                Self(self.0.wrapping_add(rhs))
            }

            /// Subtracts `rhs`, wrapping around the 32-bit address space.
            pub const fn wrapping_sub(self, rhs: u32) -> Self {
                Self(self.0.wrapping_sub(rhs))
            }
        }

        impl Debug for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, concat!(stringify!($name), "(0x{:08x})"), self.0)
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, "0x{:08x}", self.0)
            }
        }

        impl Add<u32> for $name {
            type Output = $name;

            fn add(self, rhs: u32) -> Self::Output {
                $name(self.0 + rhs)
            }
        }

        impl Sub<u32> for $name {
            type Output = $name;

            fn sub(self, rhs: u32) -> Self::Output {
                $name(self.0 - rhs)
            }
        }

        impl Sub<$name> for $name {
            type Output = u32;

            fn sub(self, rhs: $name) -> Self::Output {
                assert!(self.0 >= rhs.0);
                self.0 - rhs.0
            }
        }

        impl From<$name> for u32 {
            fn from(addr: $name) -> u32 {
                addr.0
            }
        }
    };
}

address_type!(
    /// Physical memory address.
    ///
    /// A newtype wrapper around a 32-bit bus address (FCRAM, AXI WRAM).
    PhysAddr
);

address_type!(
    /// Process-local virtual address, as seen by user-mode code.
    VirtAddr
);

address_type!(
    /// Kernel virtual address.
    ///
    /// The kernel shares the address space of the current process, so any user
    /// [`VirtAddr`] is also a valid `KernelAddr` while running in kernel mode.
    KernelAddr
);

impl From<VirtAddr> for KernelAddr {
    fn from(addr: VirtAddr) -> Self {
        KernelAddr(addr.0)
    }
}

/// Trait for resolving virtual addresses to physical addresses.
///
/// Implementors translate process-local addresses through whatever the host
/// offers (on the console this is `osConvertVirtToPhys`, which is plain offset
/// arithmetic for the linear heap and a page-table walk elsewhere).
pub trait VirtToPhysResolver {
    /// Translates a virtual address to a physical address.
    ///
    /// Returns `None` if the address is not backed by physical memory the host
    /// knows about.
    fn get_phys(&self, virt: VirtAddr) -> Option<PhysAddr>;
}
