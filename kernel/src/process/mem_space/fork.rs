//! `vm_copy`: the fork-time address-space clone (§4.5).

use super::{vma::VmFlags, MemSpace};
use crate::{arch::page_table::PageDirectory, memory::page_alloc::PageAllocator};
use alloc::vec::Vec;
use utils::errno::EResult;

impl MemSpace {
	/// Clones `self` for a forked child.
	///
	/// The child gets its own copy of the VM-area list — cloning each area's `Dentry` bumps
	/// the backing inode's reference count, this module's equivalent of `inode_get` — and a
	/// fresh page-table tree. Every non-`IO` present PTE is shared copy-on-write with the
	/// writable bit cleared in both trees; `IO` mappings are shared by address without a
	/// refcount bump, since device memory is never freed by the page allocator.
	///
	/// On any allocation failure partway through, the caller is expected to drop the
	/// partially built child (its `Drop`-free `PageDirectory` must be torn down explicitly
	/// with `destroy`, matching the `vm_free`-on-ENOMEM contract).
	pub fn fork(&mut self, page_alloc: &mut PageAllocator) -> EResult<MemSpace> {
		let dir = PageDirectory::new(page_alloc)?;
		let mut child = MemSpace::new(dir);
		child.code_start = self.code_start;
		child.code_end = self.code_end;
		child.stack_start = self.stack_start;
		child.stack_end = self.stack_end;
		child.args_start = self.args_start;
		child.args_end = self.args_end;
		child.env_start = self.env_start;
		child.env_end = self.env_end;
		child.clone_brk_state(self.brk_start(), self.brk_addr());

		let areas: Vec<_> = self.areas().values().cloned().collect();
		for area in areas {
			if area.flags.contains(VmFlags::IO) {
				self.dir.share_range(page_alloc, &mut child.dir, area.start, area.end)?;
			} else {
				self.dir.clone_cow_range(page_alloc, &mut child.dir, area.start, area.end)?;
			}
			child.insert_area(area);
		}
		Ok(child)
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::{
		fs,
		process::mem_space::{mmap::MmapFlags, vma::VmFlags},
	};

	#[test]
	fn write_after_fork_is_private_to_each_side() {
		let mut alloc = PageAllocator::new(32);
		let dir = PageDirectory::new(&mut alloc).unwrap();
		let mut parent = MemSpace::new(dir);
		let base = parent
			.mmap(None, 0x1000, VmFlags::READ | VmFlags::WRITE, MmapFlags::ANONYMOUS, None)
			.unwrap();
		parent.handle_fault(&mut alloc, base, true).unwrap();
		alloc.frame_bytes_mut(parent.dir.translate(&alloc, base).unwrap().frame())[0] = 93;

		let mut child = parent.fork(&mut alloc).unwrap();
		child.handle_fault(&mut alloc, base, true).unwrap();
		alloc.frame_bytes_mut(child.dir.translate(&alloc, base).unwrap().frame())[0] = 58;

		let parent_val = alloc.frame_bytes(parent.dir.translate(&alloc, base).unwrap().frame())[0];
		let child_val = alloc.frame_bytes(child.dir.translate(&alloc, base).unwrap().frame())[0];
		assert_eq!(parent_val, 93);
		assert_eq!(child_val, 58);
	}

	#[test]
	fn forked_file_backing_keeps_inode_alive_independently() {
		let mut alloc = PageAllocator::new(16);
		let dir = PageDirectory::new(&mut alloc).unwrap();
		let mut parent = MemSpace::new(dir);
		let dentry = fs::mem_file("f", alloc::vec::Vec::from(*b"data"));
		let file = fs::File::open(dentry);
		parent
			.mmap(None, 0x1000, VmFlags::READ, MmapFlags::empty(), Some((&file, 0)))
			.unwrap();
		let child = parent.fork(&mut alloc).unwrap();
		assert_eq!(child.areas().len(), 1);
	}
}
