//! ELF32 parsing and the [`BinaryFormat`] implementation that installs its segments (§4.6).
//!
//! Only statically-linked, non-relocatable executables (`ET_EXEC`) are supported: segment
//! virtual addresses are used as absolute load addresses, with no base-address choice for
//! position-independent binaries. A binary that needs one (`ET_DYN`) is rejected with
//! `-ENOEXEC` rather than silently mis-loaded.

use super::binfmt::{BinaryFormat, LoadedBinary};
use crate::{
	fs::Dentry,
	memory::{page_alloc::PageAllocator, VirtAddr},
	process::mem_space::{vma::VmFlags, MemSpace},
};
use alloc::{string::String, vec::Vec};
use utils::{errno, errno::EResult};

/// `e_ident` magic number: `0x7f 'E' 'L' 'F'`.
const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const ELFCLASS32: u8 = 1;
const ELFDATA2LSB: u8 = 1;

const ET_EXEC: u16 = 2;

const PT_LOAD: u32 = 1;
const PT_INTERP: u32 = 3;

const PF_X: u32 = 1 << 0;
const PF_W: u32 = 1 << 1;
const PF_R: u32 = 1 << 2;

fn read_u16(data: &[u8], off: usize) -> Option<u16> {
	Some(u16::from_le_bytes(data.get(off..off + 2)?.try_into().ok()?))
}

fn read_u32(data: &[u8], off: usize) -> Option<u32> {
	Some(u32::from_le_bytes(data.get(off..off + 4)?.try_into().ok()?))
}

/// The bit-width-agnostic fields of an ELF32 file header actually used by the loader.
struct Header {
	e_type: u16,
	e_entry: u32,
	e_phoff: u32,
	e_phentsize: u16,
	e_phnum: u16,
}

impl Header {
	fn parse(image: &[u8]) -> EResult<Self> {
		if image.len() < 52 || image[0..4] != ELF_MAGIC {
			return Err(errno!(ENOEXEC));
		}
		if image[4] != ELFCLASS32 || image[5] != ELFDATA2LSB {
			return Err(errno!(ENOEXEC));
		}
		let e_type = read_u16(image, 16).ok_or(errno!(ENOEXEC))?;
		let e_entry = read_u32(image, 24).ok_or(errno!(ENOEXEC))?;
		let e_phoff = read_u32(image, 28).ok_or(errno!(ENOEXEC))?;
		let e_phentsize = read_u16(image, 42).ok_or(errno!(ENOEXEC))?;
		let e_phnum = read_u16(image, 44).ok_or(errno!(ENOEXEC))?;
		Ok(Self {
			e_type,
			e_entry,
			e_phoff,
			e_phentsize,
			e_phnum,
		})
	}
}

/// One parsed `PT_LOAD`/`PT_INTERP` program header entry.
struct ProgramHeader {
	p_type: u32,
	p_flags: u32,
	p_offset: u32,
	p_vaddr: u32,
	p_filesz: u32,
	p_memsz: u32,
}

impl ProgramHeader {
	fn parse(data: &[u8]) -> Option<Self> {
		Some(Self {
			p_type: read_u32(data, 0)?,
			p_flags: read_u32(data, 24)?,
			p_offset: read_u32(data, 4)?,
			p_vaddr: read_u32(data, 8)?,
			p_filesz: read_u32(data, 16)?,
			p_memsz: read_u32(data, 20)?,
		})
	}
}

fn program_headers(image: &[u8], hdr: &Header) -> EResult<Vec<ProgramHeader>> {
	let entsize = hdr.e_phentsize as usize;
	let mut out = Vec::new();
	for i in 0..hdr.e_phnum as usize {
		let off = hdr.e_phoff as usize + i * entsize;
		let entry = image.get(off..off + entsize).ok_or(errno!(ENOEXEC))?;
		out.push(ProgramHeader::parse(entry).ok_or(errno!(ENOEXEC))?);
	}
	Ok(out)
}

fn to_vm_flags(p_flags: u32) -> VmFlags {
	let mut flags = VmFlags::empty();
	if p_flags & PF_R != 0 {
		flags |= VmFlags::READ;
	}
	if p_flags & PF_W != 0 {
		flags |= VmFlags::WRITE;
	}
	if p_flags & PF_X != 0 {
		flags |= VmFlags::EXEC;
	}
	flags
}

/// Reads the NUL-terminated path out of a `PT_INTERP` segment's file bytes.
fn read_interp(image: &[u8], seg: &ProgramHeader) -> EResult<String> {
	let start = seg.p_offset as usize;
	let end = start + seg.p_filesz as usize;
	let bytes = image.get(start..end).ok_or(errno!(ENOEXEC))?;
	let nul = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
	core::str::from_utf8(&bytes[..nul])
		.map(String::from)
		.map_err(|_| errno!(ENOEXEC))
}

fn install_segments(
	mm: &mut MemSpace,
	page_alloc: &mut PageAllocator,
	image: &[u8],
	dentry: &Dentry,
) -> EResult<LoadedBinary> {
	let hdr = Header::parse(image)?;
	if hdr.e_type != ET_EXEC {
		return Err(errno!(ENOEXEC));
	}
	let segments = program_headers(image, &hdr)?;

	let mut code_start = VirtAddr(usize::MAX);
	let mut code_end = VirtAddr(0);
	for seg in &segments {
		if seg.p_type != PT_LOAD {
			continue;
		}
		if seg.p_flags & PF_W != 0 && seg.p_flags & PF_X != 0 {
			return Err(errno!(ENOEXEC));
		}
		if seg.p_memsz == 0 {
			continue;
		}
		let vaddr = VirtAddr(seg.p_vaddr as usize);
		mm.map_segment(
			vaddr,
			seg.p_memsz as usize,
			seg.p_filesz as usize,
			dentry.clone(),
			seg.p_offset as usize,
			to_vm_flags(seg.p_flags),
		)?;
		if vaddr < code_start {
			code_start = vaddr;
		}
		let end = vaddr + seg.p_memsz as usize;
		if end > code_end {
			code_end = end;
		}
	}
	if code_start.0 == usize::MAX {
		// No loadable segment at all; nothing to run.
		return Err(errno!(ENOEXEC));
	}

	let _ = page_alloc; // segments are installed file-backed; pages fault in lazily.
	Ok(LoadedBinary {
		entry: VirtAddr(hdr.e_entry as usize),
		code_start,
		code_end: code_end.align_up(),
		brk: code_end.align_up(),
	})
}

/// The ELF32 binary format: signature byte `0x7f`.
pub struct ElfFormat;

impl BinaryFormat for ElfFormat {
	fn signature(&self) -> u8 {
		ELF_MAGIC[0]
	}

	fn name(&self) -> &'static str {
		"elf32"
	}

	fn prepare(&self, image: &[u8]) -> EResult<Option<String>> {
		let hdr = Header::parse(image)?;
		let segments = program_headers(image, &hdr)?;
		segments
			.iter()
			.find(|s| s.p_type == PT_INTERP)
			.map(|s| read_interp(image, s))
			.transpose()
	}

	fn load(&self, mm: &mut MemSpace, page_alloc: &mut PageAllocator, image: &[u8], dentry: &Dentry) -> EResult<LoadedBinary> {
		install_segments(mm, page_alloc, image, dentry)
	}

	fn interp_load(&self, mm: &mut MemSpace, page_alloc: &mut PageAllocator, image: &[u8], dentry: &Dentry) -> EResult<LoadedBinary> {
		install_segments(mm, page_alloc, image, dentry)
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::{arch::page_table::PageDirectory, fs};
	use utils::limits::PAGE_SIZE;

	fn build_elf(entry: u32, segments: &[(u32, u32, u32, u32, &[u8])]) -> Vec<u8> {
		// segments: (p_flags, p_vaddr, p_filesz, p_memsz, data-written-at-an-offset-we-choose)
		let mut image = Vec::new();
		image.extend_from_slice(&ELF_MAGIC);
		image.push(ELFCLASS32);
		image.push(ELFDATA2LSB);
		image.resize(16, 0);
		image.extend_from_slice(&ET_EXEC.to_le_bytes()); // e_type
		image.extend_from_slice(&3u16.to_le_bytes()); // e_machine (unused)
		image.extend_from_slice(&1u32.to_le_bytes()); // e_version
		image.extend_from_slice(&entry.to_le_bytes()); // e_entry
		let phoff = 52u32;
		image.extend_from_slice(&phoff.to_le_bytes()); // e_phoff
		image.extend_from_slice(&0u32.to_le_bytes()); // e_shoff
		image.extend_from_slice(&0u32.to_le_bytes()); // e_flags
		image.extend_from_slice(&52u16.to_le_bytes()); // e_ehsize
		image.extend_from_slice(&32u16.to_le_bytes()); // e_phentsize
		image.extend_from_slice(&(segments.len() as u16).to_le_bytes()); // e_phnum
		image.extend_from_slice(&0u16.to_le_bytes()); // e_shentsize
		image.extend_from_slice(&0u16.to_le_bytes()); // e_shnum
		image.extend_from_slice(&0u16.to_le_bytes()); // e_shstrndx
		assert_eq!(image.len(), 52);

		let data_off = phoff as usize + segments.len() * 32;
		let mut data_blob = Vec::new();
		let mut phdrs = Vec::new();
		for &(p_flags, p_vaddr, p_filesz, p_memsz, data) in segments {
			let p_offset = (data_off + data_blob.len()) as u32;
			phdrs.push((p_flags, p_offset, p_vaddr, p_filesz, p_memsz));
			data_blob.extend_from_slice(data);
		}
		for (p_flags, p_offset, p_vaddr, p_filesz, p_memsz) in phdrs {
			image.extend_from_slice(&PT_LOAD.to_le_bytes());
			image.extend_from_slice(&p_offset.to_le_bytes());
			image.extend_from_slice(&p_vaddr.to_le_bytes());
			image.extend_from_slice(&p_vaddr.to_le_bytes()); // p_paddr, unused
			image.extend_from_slice(&p_filesz.to_le_bytes());
			image.extend_from_slice(&p_memsz.to_le_bytes());
			image.extend_from_slice(&p_flags.to_le_bytes());
			image.extend_from_slice(&(PAGE_SIZE as u32).to_le_bytes()); // p_align
		}
		image.extend_from_slice(&data_blob);
		image
	}

	#[test]
	fn loads_text_and_bss_segment() {
		let code = [0x90u8; 16];
		let image = build_elf(
			0x1000,
			&[
				(PF_R | PF_X, 0x1000, code.len() as u32, code.len() as u32, &code),
				(PF_R | PF_W, 0x3000, 4, 0x2000, &[1, 2, 3, 4]),
			],
		);
		let mut alloc = PageAllocator::new(64);
		let dir = PageDirectory::new(&mut alloc).unwrap();
		let mut mm = MemSpace::new(dir);
		let dentry = fs::mem_file("bin", image.clone());
		let file = fs::File::open(dentry.clone());
		let bin = install_segments(&mut mm, &mut alloc, &image, &dentry).unwrap();
		assert_eq!(bin.entry, VirtAddr(0x1000));
		assert_eq!(bin.code_start, VirtAddr(0x1000));
		assert!(bin.code_end >= VirtAddr(0x5000));
		let _ = file;

		mm.handle_fault(&mut alloc, VirtAddr(0x1000), false).unwrap();
		let frame = mm.dir.translate(&alloc, VirtAddr(0x1000)).unwrap().frame();
		assert_eq!(&alloc.frame_bytes(frame)[..16], &code[..]);

		// Well past the segment's `filesz`, still inside `memsz`: demand-paged zero (bss).
		mm.handle_fault(&mut alloc, VirtAddr(0x4000), true).unwrap();
		let bss_frame = mm.dir.translate(&alloc, VirtAddr(0x4000)).unwrap().frame();
		assert_eq!(alloc.frame_bytes(bss_frame)[0], 0);
	}

	#[test]
	fn rejects_writable_executable_segment() {
		let image = build_elf(0x1000, &[(PF_R | PF_W | PF_X, 0x1000, 4, 4, &[0, 0, 0, 0])]);
		let mut alloc = PageAllocator::new(16);
		let dir = PageDirectory::new(&mut alloc).unwrap();
		let mut mm = MemSpace::new(dir);
		let dentry = fs::mem_file("bin", image.clone());
		assert_eq!(install_segments(&mut mm, &mut alloc, &image, &dentry), Err(errno::ENOEXEC));
	}

	#[test]
	fn finds_interpreter_path() {
		let interp = b"/lib/ld.so\0";
		let image = build_elf(
			0x1000,
			&[
				(PF_R, 0, interp.len() as u32, interp.len() as u32, interp),
			],
		);
		// Patch the single segment's p_type to PT_INTERP.
		let mut image = image;
		let phoff = 52usize;
		image[phoff..phoff + 4].copy_from_slice(&PT_INTERP.to_le_bytes());
		assert_eq!(ElfFormat.prepare(&image).unwrap().as_deref(), Some("/lib/ld.so"));
	}

	#[test]
	fn no_interpreter_is_none() {
		let image = build_elf(0x1000, &[(PF_R | PF_X, 0x1000, 4, 4, &[0x90, 0x90, 0x90, 0x90])]);
		assert_eq!(ElfFormat.prepare(&image).unwrap(), None);
	}
}
