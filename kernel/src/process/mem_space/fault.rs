//! `vm_nopage`: resolves a minor, major, or copy-on-write fault for a faulting address.

use super::{
	mmap::to_pte_flags,
	vma::VmFlags,
	MemSpace,
};
use crate::{
	arch::page_table,
	memory::{page_alloc::AllocFlags, page_alloc::PageAllocator, VirtAddr},
};

/// What the caller must do once [`MemSpace::handle_fault`] returns an error: translate a plain
/// fault into `SIGSEGV`, or an out-of-memory anonymous fault into `SIGKILL`. A successfully
/// resolved fault needs no further action from the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
	/// No region covers the address, or the access violates the region's protection.
	Segv,
	/// Allocation failed while resolving the fault; the faulting process must be killed.
	Oom,
}

impl MemSpace {
	/// Resolves the fault at `addr`. `write` is set for a write access, clear for a read.
	pub fn handle_fault(
		&mut self,
		page_alloc: &mut PageAllocator,
		addr: VirtAddr,
		write: bool,
	) -> Result<(), FaultOutcome> {
		let area = self.area_containing(addr).ok_or(FaultOutcome::Segv)?.clone();
		let access = if write { VmFlags::WRITE } else { VmFlags::READ };
		if !area.permits(access) {
			return Err(FaultOutcome::Segv);
		}

		let page_addr = addr.align_down();
		let pte_flags = to_pte_flags(area.flags);

		match self.dir.translate(page_alloc, page_addr) {
			None => {
				let frame = page_alloc.alloc(1, AllocFlags::ZEROED).map_err(|_| {
					log::warn!("page allocation failed resolving fault at {addr:?}");
					FaultOutcome::Oom
				})?;
				if let Some(fb) = &area.file {
					if page_addr < area.actual_end {
						let file_off = fb.offset + (page_addr - area.start);
						let bytes = page_alloc.frame_bytes_mut(frame);
						// A short read leaves the zero-initialized tail of the page as is,
						// matching the "clamp to remaining file size, zero-fill the rest"
						// contract.
						if fb.dentry.inode.ops().nopage(file_off, bytes).is_err() {
							page_alloc.free(frame);
							return Err(FaultOutcome::Segv);
						}
					}
				}
				self.dir
					.map(page_alloc, page_addr, frame, pte_flags)
					.map_err(|_| FaultOutcome::Oom)?;
			}
			Some(entry) => {
				if page_alloc.refcount(entry.frame()) > 1 {
					let new_frame = page_alloc.alloc(1, AllocFlags::CONTIGUOUS).map_err(|_| FaultOutcome::Oom)?;
					let src = *page_alloc.frame_bytes(entry.frame());
					*page_alloc.frame_bytes_mut(new_frame) = src;
					page_alloc.free(entry.frame());
					self.dir.unmap(page_alloc, page_addr);
					self.dir
						.map(page_alloc, page_addr, new_frame, pte_flags)
						.map_err(|_| FaultOutcome::Oom)?;
				} else {
					// Refcount 1 and already present on a write fault means the page is
					// already private and writable; this path should not be reached.
					return Err(FaultOutcome::Segv);
				}
			}
		}
		page_table::invalidate(page_addr);
		Ok(())
	}
}
