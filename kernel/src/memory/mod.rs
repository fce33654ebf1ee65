//! Address types and the layout of the virtual address space.
//!
//! The 32-bit x86 port splits the 4 GiB address space at [`KERNEL_BASE`]: everything below
//! belongs to the running process, everything above is mapped identically (and only
//! accessibly in supervisor mode) in every address space.

pub mod page_alloc;

use core::ops::{Add, AddAssign, Sub};
use utils::{limits::PAGE_SIZE, math};

/// The address at which kernel space begins. Identical across every address space.
pub const KERNEL_BASE: usize = 0xC000_0000;

/// Size of the user stack region reserved at the top of user space.
pub const USER_STACK_SIZE: usize = 256 * 1024;

/// The fixed top-of-user-space address the initial stack is built at.
pub const USER_STACK_TOP: VirtAddr = VirtAddr(KERNEL_BASE);

/// A physical memory address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Hash)]
pub struct PhysAddr(pub usize);

impl PhysAddr {
	#[inline]
	pub const fn is_aligned(&self) -> bool {
		math::is_aligned(self.0, PAGE_SIZE)
	}
}

/// A virtual memory address, in the address space of whichever process is current.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Hash)]
pub struct VirtAddr(pub usize);

impl VirtAddr {
	pub const NULL: VirtAddr = VirtAddr(0);

	#[inline]
	pub const fn is_aligned(&self) -> bool {
		math::is_aligned(self.0, PAGE_SIZE)
	}

	#[inline]
	pub const fn is_null(&self) -> bool {
		self.0 == 0
	}

	#[inline]
	pub const fn align_down(&self) -> VirtAddr {
		VirtAddr(math::align_down(self.0, PAGE_SIZE))
	}

	#[inline]
	pub const fn align_up(&self) -> VirtAddr {
		VirtAddr(math::align_up(self.0, PAGE_SIZE))
	}

	/// Tells whether `self` falls in the kernel half of the address space.
	#[inline]
	pub const fn is_kernel(&self) -> bool {
		self.0 >= KERNEL_BASE
	}
}

impl Add<usize> for VirtAddr {
	type Output = VirtAddr;
	fn add(self, rhs: usize) -> VirtAddr {
		VirtAddr(self.0 + rhs)
	}
}

impl AddAssign<usize> for VirtAddr {
	fn add_assign(&mut self, rhs: usize) {
		self.0 += rhs;
	}
}

impl Sub<usize> for VirtAddr {
	type Output = VirtAddr;
	fn sub(self, rhs: usize) -> VirtAddr {
		VirtAddr(self.0 - rhs)
	}
}

impl Sub<VirtAddr> for VirtAddr {
	type Output = usize;
	fn sub(self, rhs: VirtAddr) -> usize {
		self.0 - rhs.0
	}
}
