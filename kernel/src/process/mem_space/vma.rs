//! The VM area: a contiguous, protection-homogeneous range of an address space.

use crate::{fs::Dentry, memory::VirtAddr};
use bitflags::bitflags;

bitflags! {
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct VmFlags: u32 {
		const READ      = 1 << 0;
		const WRITE     = 1 << 1;
		const EXEC      = 1 << 2;
		/// A region backing device memory: shared by address, never refcounted as a page.
		const IO        = 1 << 3;
		/// Set-once latch: once set, `mprotect` and `munmap` on this region fail with
		/// `-EPERM`.
		const IMMUTABLE = 1 << 4;
	}
}

/// What kind of region this is, orthogonal to its protection bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmKind {
	Anon,
	Stack,
	Heap,
	File,
}

/// A file-backed region's source: the dentry holding the inode, and the byte offset within
/// the file that `start` maps to.
#[derive(Clone)]
pub struct FileBacking {
	pub dentry: Dentry,
	pub offset: usize,
}

/// `(start, end, actual_end, flags, dentry?, offset, ops?)` from the data model, minus
/// `next`/`prev`: the owning [`super::MemSpace`] keeps areas in a `BTreeMap` keyed by `start`
/// instead of linking them by hand.
#[derive(Clone)]
pub struct VmArea {
	pub start: VirtAddr,
	pub end: VirtAddr,
	/// For file-backed regions, `start + file_size`, possibly less than `end` when the
	/// mapping is padded to a page boundary. Equals `end` for anonymous regions.
	pub actual_end: VirtAddr,
	pub flags: VmFlags,
	pub kind: VmKind,
	pub file: Option<FileBacking>,
}

impl VmArea {
	pub fn contains(&self, addr: VirtAddr) -> bool {
		addr >= self.start && addr < self.end
	}

	pub fn is_immutable(&self) -> bool {
		self.flags.contains(VmFlags::IMMUTABLE)
	}

	/// Whether `access` (a single bit of [`VmFlags::READ`] or [`VmFlags::WRITE`]) is allowed
	/// by this region's protection.
	pub fn permits(&self, access: VmFlags) -> bool {
		self.flags.contains(access)
	}
}
