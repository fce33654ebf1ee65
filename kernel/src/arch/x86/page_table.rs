//! The 32-bit x86 page-table walker.
//!
//! Real x86-32 paging (without PAE) is two levels: a page directory and, per directory entry,
//! a page table. The rest of the kernel core is written against a four-level walk (pgd / pud
//! / pmd / pte) so a 64-bit or PAE port could slot in without touching callers; here `pud` and
//! `pmd` collapse onto `pgd` and are exposed only as pass-through index functions that always
//! return entry zero.
//!
//! A directory's tables live inside page frames borrowed from
//! [`crate::memory::page_alloc`], not the general heap: `Table` is exactly one page frame
//! wide, so walking the tree and walking the frame array are the same operation.

use crate::memory::{page_alloc::FrameId, page_alloc::PageAllocator, VirtAddr};
use bitflags::bitflags;
use utils::{errno::EResult, limits::PAGE_SIZE as PAGE_STEP};

/// Entries per table at any level, fixed by the frame-to-table-width ratio (4096 / 4 = 1024).
pub const ENTRIES_PER_TABLE: usize = 1024;

bitflags! {
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct PteFlags: u32 {
		const PRESENT    = 1 << 0;
		const WRITABLE   = 1 << 1;
		const USER       = 1 << 2;
		const ACCESSED   = 1 << 5;
		const DIRTY      = 1 << 6;
		/// Software-only bit: set on a read-only entry shared by more than one address space,
		/// meaning the next write fault must copy the frame rather than report `-EFAULT`.
		const COW        = 1 << 9;
	}
}

const ADDR_SHIFT: u32 = 12;
const FLAGS_MASK: u32 = (1 << ADDR_SHIFT) - 1;

/// A single page-table entry, packed the way the MMU expects: frame number in the high bits,
/// flags in the low ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry(u32);

impl Entry {
	pub const EMPTY: Entry = Entry(0);

	pub fn new(frame: FrameId, flags: PteFlags) -> Self {
		Entry(((frame as u32) << ADDR_SHIFT) | (flags.bits() & FLAGS_MASK))
	}

	pub fn is_present(&self) -> bool {
		self.flags().contains(PteFlags::PRESENT)
	}

	pub fn frame(&self) -> FrameId {
		self.0 >> ADDR_SHIFT
	}

	pub fn flags(&self) -> PteFlags {
		PteFlags::from_bits_truncate(self.0 & FLAGS_MASK)
	}

	pub fn with_flags(&self, flags: PteFlags) -> Self {
		Entry::new(self.frame(), flags)
	}
}

/// A page table or page directory: exactly one page frame, reinterpreted as 1024 entries.
#[repr(transparent)]
pub struct Table([Entry; ENTRIES_PER_TABLE]);

impl Table {
	fn view(alloc: &PageAllocator, id: FrameId) -> &Table {
		let bytes = alloc.frame_bytes(id);
		// SAFETY: `FrameBytes` is page-aligned and `Table` has the same size and an alignment
		// no stricter than `u32`; every bit pattern of the backing bytes is a valid `Entry`.
		unsafe { &*(bytes.as_ptr() as *const Table) }
	}

	fn view_mut(alloc: &mut PageAllocator, id: FrameId) -> &mut Table {
		let bytes = alloc.frame_bytes_mut(id);
		// SAFETY: see `view`.
		unsafe { &mut *(bytes.as_mut_ptr() as *mut Table) }
	}

	fn is_empty(&self) -> bool {
		self.0.iter().all(|e| !e.is_present())
	}
}

/// Index into the page directory for `vaddr`.
pub fn pgd_index(vaddr: VirtAddr) -> usize {
	(vaddr.0 >> 22) & 0x3FF
}

/// Index into the leaf page table for `vaddr`.
pub fn pte_index(vaddr: VirtAddr) -> usize {
	(vaddr.0 >> 12) & 0x3FF
}

/// Pass-through for the `pud` level: x86-32 without PAE has no page-upper-directory, so every
/// address maps to the single, implicit entry zero.
pub fn pud_index(_vaddr: VirtAddr) -> usize {
	0
}

/// Pass-through for the `pmd` level; see [`pud_index`].
pub fn pmd_index(_vaddr: VirtAddr) -> usize {
	0
}

/// One process's (or the kernel's) page-table tree.
pub struct PageDirectory {
	root: FrameId,
}

impl PageDirectory {
	/// Allocates a fresh, empty page directory.
	pub fn new(alloc: &mut PageAllocator) -> EResult<Self> {
		let root = alloc.alloc(1, crate::memory::page_alloc::AllocFlags::ZEROED)?;
		Ok(Self { root })
	}

	/// Looks up the leaf entry mapping `vaddr`, if any.
	pub fn translate(&self, alloc: &PageAllocator, vaddr: VirtAddr) -> Option<Entry> {
		let pgd = Table::view(alloc, self.root);
		let pgd_entry = pgd.0[pgd_index(vaddr)];
		if !pgd_entry.is_present() {
			return None;
		}
		let pte_table = Table::view(alloc, pgd_entry.frame());
		let pte_entry = pte_table.0[pte_index(vaddr)];
		pte_entry.is_present().then_some(pte_entry)
	}

	/// Maps `vaddr` to `frame` with `flags`, allocating an intermediate page table on demand.
	pub fn map(
		&mut self,
		alloc: &mut PageAllocator,
		vaddr: VirtAddr,
		frame: FrameId,
		flags: PteFlags,
	) -> EResult<()> {
		let pte_frame = self.ensure_pte_table(alloc, vaddr)?;
		let pte_table = Table::view_mut(alloc, pte_frame);
		pte_table.0[pte_index(vaddr)] = Entry::new(frame, flags | PteFlags::PRESENT);
		Ok(())
	}

	/// Overwrites the flags of an already-present leaf entry (used by `mprotect` and by the
	/// COW write-fault handler once it has made the frame private again).
	pub fn set_flags(&mut self, alloc: &mut PageAllocator, vaddr: VirtAddr, flags: PteFlags) {
		let pgd = Table::view(alloc, self.root);
		let pgd_entry = pgd.0[pgd_index(vaddr)];
		if !pgd_entry.is_present() {
			return;
		}
		let pte_table = Table::view_mut(alloc, pgd_entry.frame());
		let slot = &mut pte_table.0[pte_index(vaddr)];
		if slot.is_present() {
			*slot = slot.with_flags(flags | PteFlags::PRESENT);
		}
	}

	fn ensure_pte_table(&mut self, alloc: &mut PageAllocator, vaddr: VirtAddr) -> EResult<FrameId> {
		let pgd = Table::view_mut(alloc, self.root);
		let slot = &mut pgd.0[pgd_index(vaddr)];
		if slot.is_present() {
			return Ok(slot.frame());
		}
		let new_table = alloc.alloc(1, crate::memory::page_alloc::AllocFlags::ZEROED)?;
		let pgd = Table::view_mut(alloc, self.root);
		pgd.0[pgd_index(vaddr)] =
			Entry::new(new_table, PteFlags::PRESENT | PteFlags::WRITABLE | PteFlags::USER);
		Ok(new_table)
	}

	/// Clears the leaf entry for `vaddr`, returning the old entry if one was present. If the
	/// owning page table becomes entirely empty, it is freed and the directory entry cleared.
	pub fn unmap(&mut self, alloc: &mut PageAllocator, vaddr: VirtAddr) -> Option<Entry> {
		let pgd = Table::view(alloc, self.root);
		let pgd_entry = pgd.0[pgd_index(vaddr)];
		if !pgd_entry.is_present() {
			return None;
		}
		let pte_frame = pgd_entry.frame();
		let pte_table = Table::view_mut(alloc, pte_frame);
		let old = pte_table.0[pte_index(vaddr)];
		if !old.is_present() {
			return None;
		}
		pte_table.0[pte_index(vaddr)] = Entry::EMPTY;
		if Table::view(alloc, pte_frame).is_empty() {
			let pgd = Table::view_mut(alloc, self.root);
			pgd.0[pgd_index(vaddr)] = Entry::EMPTY;
			alloc.free(pte_frame);
		}
		Some(old)
	}

	/// Clones every present mapping in `[lo, hi)` into `dst`, marking both copies read-only
	/// and copy-on-write and bumping the underlying frame's reference count. Used by `fork`
	/// for every region except `IO` mappings, which [`PageDirectory::share_range`] handles
	/// instead.
	pub fn clone_cow_range(&mut self, alloc: &mut PageAllocator, dst: &mut PageDirectory, lo: VirtAddr, hi: VirtAddr) -> EResult<()> {
		let mut vaddr = lo;
		while vaddr < hi {
			if let Some(entry) = self.translate(alloc, vaddr) {
				let ro_flags = (entry.flags() - PteFlags::WRITABLE) | PteFlags::COW;
				alloc.get(entry.frame());
				self.set_flags(alloc, vaddr, ro_flags);
				dst.map(alloc, vaddr, entry.frame(), ro_flags)?;
			}
			vaddr += PAGE_STEP;
		}
		Ok(())
	}

	/// Maps every present entry in `[lo, hi)` into `dst` at the same address and with the
	/// same frame, without touching the frame's reference count: used for `IO` regions, which
	/// are shared by address across fork rather than reference-counted.
	pub fn share_range(&self, alloc: &mut PageAllocator, dst: &mut PageDirectory, lo: VirtAddr, hi: VirtAddr) -> EResult<()> {
		let mut vaddr = lo;
		while vaddr < hi {
			if let Some(entry) = self.translate(alloc, vaddr) {
				dst.map(alloc, vaddr, entry.frame(), entry.flags())?;
			}
			vaddr += PAGE_STEP;
		}
		Ok(())
	}

	/// Tears down the entire tree, dropping a reference to every mapped frame and to the
	/// intermediate tables themselves. Consumes the directory: nothing may use it afterwards.
	pub fn destroy(self, alloc: &mut PageAllocator) {
		for pgd_idx in 0..ENTRIES_PER_TABLE {
			let pgd_entry = Table::view(alloc, self.root).0[pgd_idx];
			if !pgd_entry.is_present() {
				continue;
			}
			let pte_frame = pgd_entry.frame();
			for pte_idx in 0..ENTRIES_PER_TABLE {
				let entry = Table::view(alloc, pte_frame).0[pte_idx];
				if entry.is_present() {
					alloc.free(entry.frame());
				}
			}
			alloc.free(pte_frame);
		}
		alloc.free(self.root);
	}
}

pub fn invalidate(_vaddr: VirtAddr) {
	// A real port would execute `invlpg`; under the host-side simulation every lookup goes
	// through the table directly, so there is no stale TLB entry to flush.
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::memory::page_alloc::{AllocFlags, PageAllocator};

	#[test]
	fn map_then_translate() {
		let mut alloc = PageAllocator::new(8);
		let mut dir = PageDirectory::new(&mut alloc).unwrap();
		let frame = alloc.alloc(1, AllocFlags::ZEROED).unwrap();
		let vaddr = VirtAddr(0x4000);
		dir.map(&mut alloc, vaddr, frame, PteFlags::WRITABLE | PteFlags::USER)
			.unwrap();
		let entry = dir.translate(&alloc, vaddr).unwrap();
		assert_eq!(entry.frame(), frame);
		assert!(entry.flags().contains(PteFlags::WRITABLE));
	}

	#[test]
	fn unmap_frees_empty_table() {
		let mut alloc = PageAllocator::new(8);
		let mut dir = PageDirectory::new(&mut alloc).unwrap();
		let frame = alloc.alloc(1, AllocFlags::ZEROED).unwrap();
		let vaddr = VirtAddr(0x1000);
		dir.map(&mut alloc, vaddr, frame, PteFlags::WRITABLE).unwrap();
		let before = alloc.free_frames();
		let old = dir.unmap(&mut alloc, vaddr).unwrap();
		assert_eq!(old.frame(), frame);
		// The leaf page table itself is freed once it has no more present entries, over and
		// above the mapped frame the caller is responsible for freeing.
		assert_eq!(alloc.free_frames(), before + 1);
	}

	#[test]
	fn cow_clone_shares_frame_read_only() {
		let mut alloc = PageAllocator::new(8);
		let mut parent = PageDirectory::new(&mut alloc).unwrap();
		let mut child = PageDirectory::new(&mut alloc).unwrap();
		let frame = alloc.alloc(1, AllocFlags::ZEROED).unwrap();
		let vaddr = VirtAddr(0x2000);
		parent
			.map(&mut alloc, vaddr, frame, PteFlags::WRITABLE | PteFlags::USER)
			.unwrap();
		parent
			.clone_cow_range(&mut alloc, &mut child, VirtAddr(0), VirtAddr(0x10_0000))
			.unwrap();
		assert_eq!(alloc.refcount(frame), 2);
		let parent_entry = parent.translate(&alloc, vaddr).unwrap();
		let child_entry = child.translate(&alloc, vaddr).unwrap();
		assert!(!parent_entry.flags().contains(PteFlags::WRITABLE));
		assert!(child_entry.flags().contains(PteFlags::COW));
	}
}
