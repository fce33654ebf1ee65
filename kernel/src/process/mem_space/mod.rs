//! The per-process address space: the VM-area list, the root page table, and the
//! `mmap`/`munmap`/`mprotect`/`brk` family built on top of them.

pub mod fault;
pub mod fork;
pub mod mmap;
pub mod vma;

extern crate alloc;

use crate::{
	arch::page_table::PageDirectory,
	memory::{VirtAddr, USER_STACK_SIZE, USER_STACK_TOP},
};
use alloc::collections::BTreeMap;
use vma::{VmArea, VmFlags};

/// A per-process address space (`mm` in the data model).
///
/// Areas are kept in a `BTreeMap` keyed by `start` rather than the intrusive doubly-linked
/// list the design notes describe: the map gives the same totally-ordered, gap-tolerant view
/// with O(log n) neighbor lookups, without hand-rolled pointer juggling for something that
/// is, in the end, exactly what an ordered map is for.
pub struct MemSpace {
	pub dir: PageDirectory,
	areas: BTreeMap<VirtAddr, VmArea>,
	/// Current heap break. `None` until the process's loader or `brk_vma` creation sets one.
	brk: VirtAddr,
	brk_start: VirtAddr,
	pub code_start: VirtAddr,
	pub code_end: VirtAddr,
	pub stack_start: VirtAddr,
	pub stack_end: VirtAddr,
	pub args_start: VirtAddr,
	pub args_end: VirtAddr,
	pub env_start: VirtAddr,
	pub env_end: VirtAddr,
	/// The one-shot `pinsyscalls` range, if installed.
	syscalls: Option<(VirtAddr, VirtAddr)>,
}

impl MemSpace {
	/// Builds an empty address space around a fresh, empty page directory.
	pub fn new(dir: PageDirectory) -> Self {
		Self {
			dir,
			areas: BTreeMap::new(),
			brk: VirtAddr::NULL,
			brk_start: VirtAddr::NULL,
			code_start: VirtAddr::NULL,
			code_end: VirtAddr::NULL,
			stack_start: VirtAddr::NULL,
			stack_end: VirtAddr::NULL,
			args_start: VirtAddr::NULL,
			args_end: VirtAddr::NULL,
			env_start: VirtAddr::NULL,
			env_end: VirtAddr::NULL,
			syscalls: None,
		}
	}

	/// Current heap break.
	pub fn brk_addr(&self) -> VirtAddr {
		self.brk
	}

	fn brk_start(&self) -> VirtAddr {
		self.brk_start
	}

	fn set_brk(&mut self, addr: VirtAddr) {
		self.brk = addr;
	}

	/// Top of the region `mmap`'s gap search may place a new mapping in: leaves room below
	/// for the fixed-address user stack.
	fn mmap_ceiling(&self) -> VirtAddr {
		USER_STACK_TOP - USER_STACK_SIZE
	}

	/// The region containing `addr`, if any.
	pub(super) fn area_containing(&self, addr: VirtAddr) -> Option<&VmArea> {
		self.areas
			.range(..=addr)
			.next_back()
			.map(|(_, area)| area)
			.filter(|area| area.contains(addr))
	}

	pub(super) fn area_containing_mut(&mut self, addr: VirtAddr) -> Option<&mut VmArea> {
		self.areas
			.range_mut(..=addr)
			.next_back()
			.map(|(_, area)| area)
			.filter(|area| area.contains(addr))
	}

	pub(super) fn areas(&self) -> &BTreeMap<VirtAddr, VmArea> {
		&self.areas
	}

	pub(super) fn areas_mut(&mut self) -> &mut BTreeMap<VirtAddr, VmArea> {
		&mut self.areas
	}

	pub(super) fn insert_area(&mut self, area: VmArea) {
		debug_assert!(area.start < area.end, "empty VM area");
		debug_assert!(area.start.is_aligned() && area.end.is_aligned());
		self.areas.insert(area.start, area);
	}

	pub(super) fn remove_area(&mut self, start: VirtAddr) -> Option<VmArea> {
		self.areas.remove(&start)
	}

	/// Checks the invariant that every two adjacent areas are disjoint and sorted, mainly
	/// exercised by tests after a sequence of `mmap`/`munmap`/`mprotect` calls.
	pub fn check_invariants(&self) -> bool {
		let mut prev_end: Option<VirtAddr> = None;
		for area in self.areas.values() {
			if area.start >= area.end {
				return false;
			}
			if !area.start.is_aligned() || !area.end.is_aligned() {
				return false;
			}
			if let Some(prev_end) = prev_end {
				if prev_end > area.start {
					return false;
				}
			}
			prev_end = Some(area.end);
		}
		true
	}

	/// Installs the one-shot syscall-allowed range. Fails if one is already installed, if the
	/// range isn't executable, or if it isn't contained in a single region.
	pub fn pinsyscalls(&mut self, start: VirtAddr, size: usize) -> utils::errno::EResult<()> {
		if self.syscalls.is_some() {
			return Err(utils::errno!(EPERM));
		}
		let end = start + size;
		let area = self.area_containing(start).ok_or(utils::errno!(EINVAL))?;
		if !area.permits(VmFlags::EXEC) || end > area.end {
			return Err(utils::errno!(EINVAL));
		}
		self.syscalls = Some((start, end));
		Ok(())
	}

	pub fn syscalls_range(&self) -> Option<(VirtAddr, VirtAddr)> {
		self.syscalls
	}

	pub(super) fn set_brk_start(&mut self, addr: VirtAddr) {
		self.brk_start = addr;
		self.brk = addr;
	}

	/// Seeds a forked child's heap bookkeeping from the parent's current break, without
	/// touching the heap `VmArea` itself (the caller clones that separately, like any other
	/// region).
	pub(super) fn clone_brk_state(&mut self, brk_start: VirtAddr, brk: VirtAddr) {
		self.brk_start = brk_start;
		self.brk = brk;
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::{arch::page_table::PageDirectory, memory::page_alloc::PageAllocator, process::mem_space::mmap::MmapFlags};

	fn new_space(alloc: &mut PageAllocator) -> MemSpace {
		MemSpace::new(PageDirectory::new(alloc).unwrap())
	}

	#[test]
	fn pinsyscalls_rejects_non_executable_region() {
		let mut alloc = PageAllocator::new(16);
		let mut mm = new_space(&mut alloc);
		let base = mm.mmap(None, 0x1000, VmFlags::READ | VmFlags::WRITE, MmapFlags::ANONYMOUS, None).unwrap();
		assert_eq!(mm.pinsyscalls(base, 0x1000), Err(utils::errno!(EINVAL)));
	}

	#[test]
	fn pinsyscalls_rejects_range_spanning_past_its_region() {
		let mut alloc = PageAllocator::new(16);
		let mut mm = new_space(&mut alloc);
		let base = mm.mmap(None, 0x1000, VmFlags::READ | VmFlags::EXEC, MmapFlags::ANONYMOUS, None).unwrap();
		assert_eq!(mm.pinsyscalls(base, 0x2000), Err(utils::errno!(EINVAL)));
	}

	#[test]
	fn pinsyscalls_succeeds_once_then_rejects_second_install() {
		let mut alloc = PageAllocator::new(16);
		let mut mm = new_space(&mut alloc);
		let base = mm.mmap(None, 0x1000, VmFlags::READ | VmFlags::EXEC, MmapFlags::ANONYMOUS, None).unwrap();
		mm.pinsyscalls(base, 0x1000).unwrap();
		assert_eq!(mm.syscalls_range(), Some((base, base + 0x1000)));
		assert_eq!(mm.pinsyscalls(base, 0x1000), Err(utils::errno!(EPERM)));
	}
}
