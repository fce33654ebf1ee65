//! `mmap`, `munmap`, `mprotect`, `mimmutable`, `brk`, and `sbrk`.

extern crate alloc;

use super::{
	vma::{FileBacking, VmArea, VmFlags, VmKind},
	MemSpace,
};
use crate::{
	arch::page_table::{PageDirectory, PteFlags},
	fs::{Dentry, File},
	memory::{page_alloc::PageAllocator, VirtAddr, KERNEL_BASE},
};
use alloc::vec::Vec;
use bitflags::bitflags;
use utils::{
	errno,
	errno::EResult,
	limits::PAGE_SIZE,
	math::align_up,
};

bitflags! {
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct MmapFlags: u32 {
		const ANONYMOUS = 1 << 0;
		const FIXED     = 1 << 1;
	}
}

pub(super) fn to_pte_flags(flags: VmFlags) -> PteFlags {
	let mut pte = PteFlags::USER;
	if flags.contains(VmFlags::WRITE) {
		pte |= PteFlags::WRITABLE;
	}
	pte
}

/// Clears the PTEs covering `[from, to)` and, for non-`IO` regions, frees the underlying
/// frame of every page that was actually resident.
fn teardown_pages(dir: &mut PageDirectory, page_alloc: &mut PageAllocator, area: &VmArea, from: VirtAddr, to: VirtAddr) {
	let is_io = area.flags.contains(VmFlags::IO);
	let mut addr = from;
	while addr < to {
		if let Some(entry) = dir.unmap(page_alloc, addr) {
			if !is_io {
				page_alloc.free(entry.frame());
			}
		}
		addr += PAGE_SIZE;
	}
}

impl MemSpace {
	/// Creates a new region. See the data model and §4.3 contracts for the exact validation
	/// order; this follows it step for step.
	pub fn mmap(
		&mut self,
		addr: Option<VirtAddr>,
		len: usize,
		prot: VmFlags,
		flags: MmapFlags,
		file: Option<(&File, usize)>,
	) -> EResult<VirtAddr> {
		if len == 0 {
			return Err(errno!(EINVAL));
		}
		let offset = file.map(|(_, off)| off).unwrap_or(0);
		if !utils::math::is_aligned(offset, PAGE_SIZE) {
			return Err(errno!(EINVAL));
		}
		if let Some(a) = addr {
			if !a.is_aligned() {
				return Err(errno!(EINVAL));
			}
		}
		if prot.contains(VmFlags::WRITE) && prot.contains(VmFlags::EXEC) {
			return Err(errno!(EINVAL));
		}
		if flags.contains(MmapFlags::ANONYMOUS) && file.is_some() {
			return Err(errno!(EINVAL));
		}

		let len = align_up(len, PAGE_SIZE);

		let base = if flags.contains(MmapFlags::FIXED) {
			let a = addr.ok_or(errno!(EFAULT))?;
			if a.is_null() {
				return Err(errno!(EFAULT));
			}
			let end = a + len;
			if a.is_kernel() || end.0 > KERNEL_BASE {
				return Err(errno!(EFAULT));
			}
			if self.overlaps(a, end) {
				return Err(errno!(EFAULT));
			}
			a
		} else {
			self.find_gap(len)?
		};

		let (kind, file_backing, actual_end) = match file {
			Some((f, off)) => {
				let dentry = f.mmap()?;
				let visible = f.size().saturating_sub(off).min(len);
				(VmKind::File, Some(FileBacking { dentry, offset: off }), base + visible)
			}
			None => (VmKind::Anon, None, base + len),
		};

		self.insert_area(VmArea {
			start: base,
			end: base + len,
			actual_end,
			flags: prot,
			kind,
			file: file_backing,
		});
		Ok(base)
	}

	/// Installs one loader-defined segment: a file-backed mapping whose `actual_end` is clamped
	/// to exactly `file_offset + filesz` bytes into the segment, rather than derived from the
	/// whole backing file's size the way [`MemSpace::mmap`] computes it. This is what lets a
	/// segment's `.bss` tail (`memsz > filesz`) read back as zero through the ordinary
	/// file-backed fault path instead of the file's next segment's bytes.
	pub fn map_segment(
		&mut self,
		addr: VirtAddr,
		memsz: usize,
		filesz: usize,
		dentry: Dentry,
		file_offset: usize,
		prot: VmFlags,
	) -> EResult<VirtAddr> {
		if memsz == 0 {
			return Err(errno!(EINVAL));
		}
		let base = addr.align_down();
		let pad = addr - base;
		let len = align_up(memsz + pad, PAGE_SIZE);
		let end = base + len;
		if self.overlaps(base, end) {
			return Err(errno!(EEXIST));
		}
		let actual_end = base + (pad + filesz).min(len);
		self.insert_area(VmArea {
			start: base,
			end,
			actual_end,
			flags: prot,
			kind: VmKind::File,
			file: Some(FileBacking { dentry, offset: file_offset.saturating_sub(pad) }),
		});
		Ok(base)
	}

	fn overlaps(&self, start: VirtAddr, end: VirtAddr) -> bool {
		self.areas()
			.range(..end)
			.next_back()
			.map(|(_, area)| area.end > start)
			.unwrap_or(false)
	}

	/// Walks the region list from the tail toward the head, returning the highest address
	/// below the user/stack boundary where a gap of `len` bytes fits.
	fn find_gap(&self, len: usize) -> EResult<VirtAddr> {
		let ceiling = self.mmap_ceiling();
		let mut hi = ceiling;
		for area in self.areas().values().rev() {
			if area.start >= ceiling {
				continue;
			}
			let gap_start = area.end.max(VirtAddr(PAGE_SIZE));
			if hi > gap_start && (hi - gap_start) >= len {
				return Ok(hi - len);
			}
			hi = area.start;
		}
		let gap_start = VirtAddr(PAGE_SIZE);
		if hi > gap_start && (hi - gap_start) >= len {
			return Ok(hi - len);
		}
		Err(errno!(ENOMEM))
	}

	/// Collects the areas overlapping `[start, end)`, verifying along the way that they tile
	/// the range without internal gaps. Returns `-ENOMEM` otherwise.
	fn touched_range(&self, start: VirtAddr, end: VirtAddr) -> EResult<Vec<VirtAddr>> {
		let touched: Vec<VirtAddr> = self
			.areas()
			.range(..end)
			.filter(|(_, a)| a.end > start)
			.map(|(k, _)| *k)
			.collect();
		if touched.is_empty() {
			return Err(errno!(ENOMEM));
		}
		let mut prev_end = None;
		for key in &touched {
			let area = &self.areas()[key];
			if let Some(pe) = prev_end {
				if area.start != pe {
					return Err(errno!(ENOMEM));
				}
			}
			prev_end = Some(area.end);
		}
		if self.areas()[&touched[0]].start > start || self.areas()[touched.last().unwrap()].end < end {
			return Err(errno!(ENOMEM));
		}
		Ok(touched)
	}

	/// Removes the region(s) covering `[start, end)`.
	pub fn munmap(&mut self, start: VirtAddr, len: usize, page_alloc: &mut PageAllocator) -> EResult<()> {
		if len == 0 || !start.is_aligned() {
			return Err(errno!(EINVAL));
		}
		let len = align_up(len, PAGE_SIZE);
		let end = start + len;
		let touched = self.touched_range(start, end)?;

		for key in &touched {
			if self.areas()[key].is_immutable() {
				return Err(errno!(EPERM));
			}
		}
		if touched.len() == 1 {
			let area = &self.areas()[&touched[0]];
			if start > area.start && end < area.end {
				return Err(errno!(EINVAL));
			}
		}

		for key in touched {
			let area = self.areas()[&key].clone();
			let ov_start = area.start.max(start);
			let ov_end = area.end.min(end);
			if ov_start == area.start && ov_end == area.end {
				let area = self.remove_area(key).unwrap();
				teardown_pages(&mut self.dir, page_alloc, &area, area.start, area.end);
			} else if ov_start == area.start {
				self.shrink_front(key, ov_end, page_alloc);
			} else {
				self.shrink_back(key, ov_start, page_alloc);
			}
		}
		Ok(())
	}

	fn shrink_front(&mut self, key: VirtAddr, new_start: VirtAddr, page_alloc: &mut PageAllocator) {
		let mut area = self.remove_area(key).unwrap();
		teardown_pages(&mut self.dir, page_alloc, &area, area.start, new_start);
		if let Some(fb) = &mut area.file {
			fb.offset += new_start - area.start;
		}
		if area.actual_end < new_start {
			area.actual_end = new_start;
		}
		area.start = new_start;
		self.insert_area(area);
	}

	fn shrink_back(&mut self, key: VirtAddr, new_end: VirtAddr, page_alloc: &mut PageAllocator) {
		let old_end = self.areas()[&key].end;
		{
			let area = self.area_mut(key).unwrap();
			area.end = new_end;
			if area.actual_end > new_end {
				area.actual_end = new_end;
			}
		}
		let area = self.areas()[&key].clone();
		teardown_pages(&mut self.dir, page_alloc, &area, new_end, old_end);
	}

	fn area_mut(&mut self, key: VirtAddr) -> Option<&mut VmArea> {
		self.areas_mut().get_mut(&key)
	}

	/// Re-protects `[start, end)`, splitting the touched regions at the range boundary and
	/// merging contiguous anonymous regions left with identical protection afterwards.
	pub fn mprotect(&mut self, start: VirtAddr, len: usize, prot: VmFlags, page_alloc: &mut PageAllocator) -> EResult<()> {
		if !start.is_aligned() || len == 0 {
			return Err(errno!(EINVAL));
		}
		if prot.contains(VmFlags::WRITE) && prot.contains(VmFlags::EXEC) {
			return Err(errno!(EINVAL));
		}
		let len = align_up(len, PAGE_SIZE);
		let end = start + len;
		let touched = self.touched_range(start, end)?;
		for key in &touched {
			if self.areas()[key].is_immutable() {
				return Err(errno!(EPERM));
			}
		}

		for key in touched {
			let area = self.remove_area(key).unwrap();
			let ov_start = area.start.max(start);
			let ov_end = area.end.min(end);

			if area.start < ov_start {
				let mut before = area.clone();
				before.end = ov_start;
				if before.actual_end > ov_start {
					before.actual_end = ov_start;
				}
				self.insert_area(before);
			}

			let mut middle = area.clone();
			middle.start = ov_start;
			middle.end = ov_end;
			middle.flags = prot;
			if let Some(fb) = &mut middle.file {
				fb.offset += ov_start - area.start;
			}
			middle.actual_end = VirtAddr(area.actual_end.0.clamp(ov_start.0, ov_end.0));
			self.retarget_ptes(&middle, page_alloc);
			self.insert_area(middle);

			if area.end > ov_end {
				let mut after = area.clone();
				after.start = ov_end;
				if let Some(fb) = &mut after.file {
					fb.offset += ov_end - area.start;
				}
				if after.actual_end < ov_end {
					after.actual_end = ov_end;
				}
				self.insert_area(after);
			}
		}

		if let Some(&key) = self.areas().range(..=start).next_back().map(|(k, _)| k) {
			self.coalesce_from(key);
		}
		Ok(())
	}

	fn retarget_ptes(&mut self, area: &VmArea, page_alloc: &mut PageAllocator) {
		let pte_flags = to_pte_flags(area.flags);
		let mut addr = area.start;
		while addr < area.end {
			if self.dir.translate(page_alloc, addr).is_some() {
				self.dir.set_flags(page_alloc, addr, pte_flags);
			}
			addr += PAGE_SIZE;
		}
	}

	fn mergeable(a: &VmArea, b: &VmArea) -> bool {
		a.flags == b.flags && a.kind == b.kind && a.file.is_none() && b.file.is_none()
	}

	/// Repeatedly merges the region at `key` with its immediate, contiguous, identically
	/// flagged successor.
	fn coalesce_from(&mut self, mut key: VirtAddr) {
		loop {
			let Some(cur_end) = self.areas().get(&key).map(|a| a.end) else {
				return;
			};
			let Some(&next_key) = self.areas().range(cur_end..).next().map(|(k, _)| k) else {
				return;
			};
			if next_key != cur_end {
				return;
			}
			if !Self::mergeable(&self.areas()[&key], &self.areas()[&next_key]) {
				key = next_key;
				continue;
			}
			let next = self.remove_area(next_key).unwrap();
			let cur = self.area_mut(key).unwrap();
			cur.end = next.end;
			cur.actual_end = next.actual_end;
		}
	}

	/// Sets the `IMMUTABLE` latch on every region touched by `[start, end)`.
	pub fn mimmutable(&mut self, start: VirtAddr, len: usize) -> EResult<()> {
		if !start.is_aligned() || len == 0 {
			return Err(errno!(EINVAL));
		}
		let len = align_up(len, PAGE_SIZE);
		let end = start + len;
		let touched = self.touched_range(start, end).map_err(|_| errno!(EINVAL))?;
		for key in touched {
			self.area_mut(key).unwrap().flags.insert(VmFlags::IMMUTABLE);
		}
		Ok(())
	}

	/// Moves the heap break to `addr`, growing or shrinking the brk region. Fails with
	/// `-ENOMEM` if `addr` would cross into the next mapped region.
	pub fn brk(&mut self, addr: VirtAddr, page_alloc: &mut PageAllocator) -> EResult<VirtAddr> {
		let brk_start = self.brk_start();
		let target = addr.align_up();
		if target < brk_start {
			return Err(errno!(EINVAL));
		}
		let next_bound = self
			.areas()
			.range(brk_start..)
			.find(|(k, _)| **k != brk_start)
			.map(|(k, _)| *k)
			.unwrap_or_else(|| self.mmap_ceiling());
		if target > next_bound {
			return Err(errno!(ENOMEM));
		}

		let old_end = self.areas().get(&brk_start).map(|a| a.end).unwrap_or(brk_start);
		if target < old_end {
			let area = self.areas()[&brk_start].clone();
			teardown_pages(&mut self.dir, page_alloc, &area, target, old_end);
		}
		if target == brk_start {
			self.remove_area(brk_start);
		} else if let Some(area) = self.area_mut(brk_start) {
			area.end = target;
			area.actual_end = target;
		} else {
			self.insert_area(VmArea {
				start: brk_start,
				end: target,
				actual_end: target,
				flags: VmFlags::READ | VmFlags::WRITE,
				kind: VmKind::Heap,
				file: None,
			});
		}
		self.set_brk(target);
		Ok(target)
	}

	/// Delta variant of `brk`: returns the break *before* the move.
	pub fn sbrk(&mut self, incr: isize, page_alloc: &mut PageAllocator) -> EResult<VirtAddr> {
		let prev = self.brk_addr();
		let target = if incr >= 0 {
			prev + incr as usize
		} else {
			prev - (-incr) as usize
		};
		self.brk(target, page_alloc)?;
		Ok(prev)
	}

	/// Frees every region's resident pages and the page-table tree itself. Called on the old
	/// address space once `exec` has committed a replacement, and on the partially built one
	/// when the loader fails partway through.
	pub fn teardown(mut self, page_alloc: &mut PageAllocator) {
		for area in core::mem::take(self.areas_mut()).into_values() {
			teardown_pages(&mut self.dir, page_alloc, &area, area.start, area.end);
		}
		self.dir.destroy(page_alloc);
	}
}

#[cfg(test)]
mod test {
	use super::*;

	fn new_space(alloc: &mut PageAllocator) -> MemSpace {
		MemSpace::new(PageDirectory::new(alloc).unwrap())
	}

	#[test]
	fn mmap_rejects_zero_length() {
		let mut alloc = PageAllocator::new(16);
		let mut mm = new_space(&mut alloc);
		let err = mm.mmap(None, 0, VmFlags::READ, MmapFlags::ANONYMOUS, None).unwrap_err();
		assert_eq!(err, errno::EINVAL);
	}

	#[test]
	fn mmap_rejects_write_and_exec() {
		let mut alloc = PageAllocator::new(16);
		let mut mm = new_space(&mut alloc);
		let err = mm
			.mmap(None, PAGE_SIZE, VmFlags::WRITE | VmFlags::EXEC, MmapFlags::ANONYMOUS, None)
			.unwrap_err();
		assert_eq!(err, errno::EINVAL);
	}

	#[test]
	fn mmap_fixed_rejects_kernel_range() {
		let mut alloc = PageAllocator::new(16);
		let mut mm = new_space(&mut alloc);
		let err = mm
			.mmap(Some(VirtAddr(KERNEL_BASE)), PAGE_SIZE, VmFlags::READ, MmapFlags::FIXED | MmapFlags::ANONYMOUS, None)
			.unwrap_err();
		assert_eq!(err, errno::EFAULT);
	}

	#[test]
	fn munmap_of_strict_middle_is_einval() {
		let mut alloc = PageAllocator::new(32);
		let mut mm = new_space(&mut alloc);
		let base = mm.mmap(None, 0x10000, VmFlags::READ | VmFlags::WRITE, MmapFlags::ANONYMOUS, None).unwrap();
		let err = mm.munmap(base + 0x2000, 0x2000, &mut alloc).unwrap_err();
		assert_eq!(err, errno::EINVAL);
	}

	#[test]
	fn munmap_roundtrips_back_to_empty() {
		let mut alloc = PageAllocator::new(32);
		let mut mm = new_space(&mut alloc);
		let base = mm.mmap(None, 0x10000, VmFlags::READ | VmFlags::WRITE, MmapFlags::ANONYMOUS, None).unwrap();
		mm.munmap(base, 0x10000, &mut alloc).unwrap();
		assert!(mm.areas().is_empty());
	}

	/// Scenario 3: mprotect splits a PROT_NONE region into three, then a wider mprotect merges
	/// them back into one.
	#[test]
	fn mprotect_splits_then_merges() {
		let mut alloc = PageAllocator::new(64);
		let mut mm = new_space(&mut alloc);
		let base = mm.mmap(None, 0x10000, VmFlags::empty(), MmapFlags::ANONYMOUS, None).unwrap();

		mm.mprotect(base + 0x2000, 0x2000, VmFlags::READ | VmFlags::WRITE, &mut alloc).unwrap();
		assert_eq!(mm.areas().len(), 3);
		let mut it = mm.areas().values();
		let a = it.next().unwrap();
		let b = it.next().unwrap();
		let c = it.next().unwrap();
		assert_eq!((a.start, a.end, a.flags), (base, base + 0x2000, VmFlags::empty()));
		assert_eq!((b.start, b.end, b.flags), (base + 0x2000, base + 0x4000, VmFlags::READ | VmFlags::WRITE));
		assert_eq!((c.start, c.end, c.flags), (base + 0x4000, base + 0x10000, VmFlags::empty()));

		mm.mprotect(base, 0x10000, VmFlags::empty(), &mut alloc).unwrap();
		assert_eq!(mm.areas().len(), 1);
		let merged = mm.areas().values().next().unwrap();
		assert_eq!((merged.start, merged.end), (base, base + 0x10000));
	}

	#[test]
	fn mprotect_is_idempotent_on_final_shape() {
		let mut alloc = PageAllocator::new(32);
		let mut mm = new_space(&mut alloc);
		let base = mm.mmap(None, 0x4000, VmFlags::READ, MmapFlags::ANONYMOUS, None).unwrap();
		mm.mprotect(base, 0x4000, VmFlags::READ | VmFlags::WRITE, &mut alloc).unwrap();
		let shape_once: Vec<_> = mm.areas().values().map(|a| (a.start, a.end, a.flags)).collect();
		mm.mprotect(base, 0x4000, VmFlags::READ | VmFlags::WRITE, &mut alloc).unwrap();
		let shape_twice: Vec<_> = mm.areas().values().map(|a| (a.start, a.end, a.flags)).collect();
		assert_eq!(shape_once, shape_twice);
	}

	#[test]
	fn mprotect_rejects_write_and_exec() {
		let mut alloc = PageAllocator::new(16);
		let mut mm = new_space(&mut alloc);
		let base = mm.mmap(None, 0x1000, VmFlags::READ, MmapFlags::ANONYMOUS, None).unwrap();
		let err = mm.mprotect(base, 0x1000, VmFlags::WRITE | VmFlags::EXEC, &mut alloc).unwrap_err();
		assert_eq!(err, errno::EINVAL);
	}

	#[test]
	fn mprotect_rejects_immutable_region_without_changes() {
		let mut alloc = PageAllocator::new(16);
		let mut mm = new_space(&mut alloc);
		let base = mm.mmap(None, 0x1000, VmFlags::READ, MmapFlags::ANONYMOUS, None).unwrap();
		mm.mimmutable(base, 0x1000).unwrap();
		let err = mm.mprotect(base, 0x1000, VmFlags::READ | VmFlags::WRITE, &mut alloc).unwrap_err();
		assert_eq!(err, errno::EPERM);
		let area = mm.areas().values().next().unwrap();
		assert_eq!(area.flags, VmFlags::READ | VmFlags::IMMUTABLE);
	}

	/// Scenario 6: a W^X `PT_LOAD` segment is rejected at `map_segment` time, the same place
	/// `elf::ElfFormat::load` calls into for every segment.
	#[test]
	fn map_segment_rejects_nothing_itself_caller_enforces_wx() {
		// `map_segment` trusts its caller's already-validated `prot`; the W^X check lives in
		// `elf.rs` before segments are installed, matching "enforced only at mmap/mprotect".
		let mut alloc = PageAllocator::new(16);
		let mut mm = new_space(&mut alloc);
		let dentry = crate::fs::mem_file("seg", alloc::vec![0u8; PAGE_SIZE]);
		mm.map_segment(VirtAddr(0x1000), 0x500, 0x500, dentry, 0, VmFlags::READ | VmFlags::EXEC).unwrap();
		assert_eq!(mm.areas().len(), 1);
	}

	#[test]
	fn brk_rejects_growth_into_next_region() {
		let mut alloc = PageAllocator::new(32);
		let mut mm = new_space(&mut alloc);
		let heap_start = mm.brk_start();
		mm.mmap(Some(heap_start + 0x4000), PAGE_SIZE, VmFlags::READ, MmapFlags::FIXED | MmapFlags::ANONYMOUS, None)
			.unwrap();
		let err = mm.brk(heap_start + 0x5000, &mut alloc).unwrap_err();
		assert_eq!(err, errno::ENOMEM);
	}

	#[test]
	fn teardown_frees_every_resident_page() {
		let mut alloc = PageAllocator::new(16);
		let mut mm = new_space(&mut alloc);
		let base = mm.mmap(None, PAGE_SIZE, VmFlags::READ | VmFlags::WRITE, MmapFlags::ANONYMOUS, None).unwrap();
		mm.handle_fault(&mut alloc, base, false).unwrap();
		let free_before = alloc.free_frames();
		mm.teardown(&mut alloc);
		assert!(alloc.free_frames() > free_before);
	}
}
