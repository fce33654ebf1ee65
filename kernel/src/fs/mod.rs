//! The inode/file/dentry abstraction the memory subsystem consumes.
//!
//! Filesystem internals (ext2 on-disk layout, procfs synthesis) are out of scope; this module
//! only defines the capability surface a filesystem driver must expose and a minimal
//! in-memory implementation of it, used by the fault-handler tests to stand in for a real
//! mounted filesystem.

extern crate alloc;

use alloc::string::String;
use utils::{errno::EResult, ptr::Arc};

/// The operations a filesystem driver fills in for a regular file, dispatched dynamically —
/// there is exactly one kind of `File`, and every backing filesystem supplies its own
/// implementation of this trait.
pub trait NodeOps: Send + Sync {
	/// Total size of the underlying file, in bytes.
	fn size(&self) -> usize;

	/// Reads up to `buf.len()` bytes starting at `offset`, returning the number actually read.
	fn read(&self, offset: usize, buf: &mut [u8]) -> EResult<usize>;

	/// Populates `buf` (at most one page) with the file bytes living at `offset`, for a
	/// file-backed region's absent-page fault. Returns the number of bytes written; the fault
	/// handler zero-fills whatever is left in the page.
	fn nopage(&self, offset: usize, buf: &mut [u8]) -> EResult<usize>;
}

/// A reference-counted handle to a filesystem node. Cloning is `inode_get`; dropping the last
/// clone is `inode_put` — both are implicit in `Arc`'s own refcounting rather than spelled out
/// as separate calls, but every VM area that attaches one keeps it alive for exactly that
/// region's lifetime, matching the ownership the original interface specifies.
#[derive(Clone)]
pub struct Inode {
	ops: Arc<dyn NodeOps>,
}

impl Inode {
	pub fn new(ops: Arc<dyn NodeOps>) -> Self {
		Self { ops }
	}

	pub fn size(&self) -> usize {
		self.ops.size()
	}

	pub fn ops(&self) -> &dyn NodeOps {
		&*self.ops
	}
}

/// A named directory entry pointing at an inode. The core never walks a directory tree
/// itself; it only ever holds the single dentry a successful `open` returned.
#[derive(Clone)]
pub struct Dentry {
	pub name: String,
	pub inode: Inode,
}

/// An open file: the `File` a process's file-descriptor table actually holds, and the thing
/// an `mmap` call with a non-negative `fd` resolves to before it ever reaches the VM layer.
pub struct File {
	pub dentry: Dentry,
}

impl File {
	/// Opens `dentry`, the filesystem-specific `open(path)` already having resolved it.
	pub fn open(dentry: Dentry) -> Self {
		Self { dentry }
	}

	pub fn size(&self) -> usize {
		self.dentry.inode.size()
	}

	pub fn read(&self, offset: usize, buf: &mut [u8]) -> EResult<usize> {
		self.dentry.inode.ops().read(offset, buf)
	}

	/// The file's `mmap` hook: attaches this file's node as the region's page source. Cloning
	/// the dentry here is what keeps the inode alive for the region's lifetime (`inode_get`);
	/// region teardown drops its clone (`inode_put`).
	pub fn mmap(&self) -> EResult<Dentry> {
		Ok(self.dentry.clone())
	}

	pub fn nopage(&self, offset: usize, buf: &mut [u8]) -> EResult<usize> {
		self.dentry.inode.ops().nopage(offset, buf)
	}
}

/// A trivial in-memory filesystem node, standing in for a real mounted filesystem in tests.
pub struct MemNode {
	content: alloc::vec::Vec<u8>,
}

impl MemNode {
	pub fn new(content: alloc::vec::Vec<u8>) -> Arc<dyn NodeOps> {
		let unsized_std: alloc::sync::Arc<dyn NodeOps> = alloc::sync::Arc::new(Self { content });
		Arc::try_from(unsized_std).expect("infallible conversion")
	}
}

impl NodeOps for MemNode {
	fn size(&self) -> usize {
		self.content.len()
	}

	fn read(&self, offset: usize, buf: &mut [u8]) -> EResult<usize> {
		if offset >= self.content.len() {
			return Ok(0);
		}
		let available = &self.content[offset..];
		let n = available.len().min(buf.len());
		buf[..n].copy_from_slice(&available[..n]);
		Ok(n)
	}

	fn nopage(&self, offset: usize, buf: &mut [u8]) -> EResult<usize> {
		self.read(offset, buf)
	}
}

/// Builds a `Dentry` wrapping a [`MemNode`] with the given name and content, for tests that
/// need an end-to-end file-backed mapping without a real filesystem mounted.
pub fn mem_file(name: &str, content: alloc::vec::Vec<u8>) -> Dentry {
	Dentry {
		name: String::from(name),
		inode: Inode::new(MemNode::new(content)),
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn mem_node_reads_short_tail() {
		let dentry = mem_file("hello", alloc::vec::Vec::from(*b"hello world\n"));
		let file = File::open(dentry);
		let mut buf = [0xffu8; 16];
		let n = file.read(0, &mut buf).unwrap();
		assert_eq!(n, 12);
		assert_eq!(&buf[..12], b"hello world\n");
	}

	#[test]
	fn mem_node_read_past_end_is_empty() {
		let dentry = mem_file("hello", alloc::vec::Vec::from(*b"hi"));
		let file = File::open(dentry);
		let mut buf = [0u8; 4];
		let n = file.read(10, &mut buf).unwrap();
		assert_eq!(n, 0);
	}
}
