//! The binary format plug-in registry (§4.6).
//!
//! Each registered format owns one byte of the file's first-byte signature space and the four
//! hooks that drive it through [`super::do_exec`]'s loader loop: `prepare` inspects the image
//! for a required interpreter, `load`/`interp_load` install its segments, and `cleanup` is the
//! place a format would release state it kept alive across those calls. This port registers
//! only the ELF32 format; the shebang case is handled directly in `do_exec` rather than through
//! this registry, since it never consults a format's `signature`.

use super::elf::ElfFormat;
use crate::{
	fs::Dentry,
	memory::{page_alloc::PageAllocator, VirtAddr},
	process::mem_space::MemSpace,
};
use alloc::string::String;
use utils::errno::EResult;

/// What a format's `load`/`interp_load` hook reports back to `do_exec`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadedBinary {
	pub entry: VirtAddr,
	pub code_start: VirtAddr,
	pub code_end: VirtAddr,
	pub brk: VirtAddr,
}

pub trait BinaryFormat: Sync {
	/// The first byte of a file that identifies this format.
	fn signature(&self) -> u8;
	fn name(&self) -> &'static str;

	/// Inspects `image`, returning the interpreter path if this binary is dynamically linked
	/// and needs one loaded in a second pass.
	fn prepare(&self, image: &[u8]) -> EResult<Option<String>>;

	/// Installs `image` as the process's own program.
	fn load(&self, mm: &mut MemSpace, page_alloc: &mut PageAllocator, image: &[u8], dentry: &Dentry) -> EResult<LoadedBinary>;

	/// Installs `image` as the interpreter taking over for a binary `load` already mapped.
	fn interp_load(&self, mm: &mut MemSpace, page_alloc: &mut PageAllocator, image: &[u8], dentry: &Dentry) -> EResult<LoadedBinary>;

	/// Releases any state `prepare` kept alive for the `load`/`interp_load` call that follows
	/// it. Neither format this port registers keeps any.
	fn cleanup(&self) {}
}

const ELF: ElfFormat = ElfFormat;
const FORMATS: &[&dyn BinaryFormat] = &[&ELF];

/// Finds the registered format whose signature matches the image's first byte.
pub fn find(first_byte: u8) -> Option<&'static dyn BinaryFormat> {
	FORMATS.iter().copied().find(|f| f.signature() == first_byte)
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn finds_elf_by_signature() {
		assert_eq!(find(0x7f).unwrap().name(), "elf32");
	}

	#[test]
	fn unknown_signature_is_none() {
		assert!(find(b'#').is_none());
	}
}
