//! `do_exec`: the loader driver that replaces a process's address space (§4.5).
//!
//! Program execution happens in four stages: open the target and peel off any shebang or
//! dynamic-linker indirection, install the resolved binary's segments into a brand new
//! address space, lay out its `argv`/`envp`/`auxv` block on a freshly mapped stack, and only
//! then — once everything fallible has already succeeded — splice the new address space into
//! the process and tear the old one down.

pub mod binfmt;
pub mod elf;
pub mod stack;

use crate::{
	fs::{Dentry, File},
	memory::{page_alloc::PageAllocator, VirtAddr, USER_STACK_SIZE, USER_STACK_TOP},
	process::{
		mem_space::{fault::FaultOutcome, mmap::MmapFlags, vma::VmFlags, MemSpace},
		Process,
	},
};
use alloc::{string::String, vec::Vec};
use binfmt::LoadedBinary;
use stack::Aux;
use utils::{errno, errno::EResult, limits::MAX_SHEBANG_DEPTH, limits::PAGE_SIZE, ptr::Arc};

/// The filesystem collaborator `do_exec` resolves paths through. A real mounted filesystem
/// supplies this; the fault-handler tests' `fs::mem_file` stands in for it here.
pub trait Opener {
	fn open(&self, path: &str) -> EResult<(File, Dentry)>;
}

fn read_whole(file: &File) -> EResult<Vec<u8>> {
	let mut buf = alloc::vec![0u8; file.size()];
	let n = file.read(0, &mut buf)?;
	buf.truncate(n);
	Ok(buf)
}

/// Copies `data` into `mm`'s address space at `addr`, faulting pages in as it crosses them.
fn write_bytes(mm: &mut MemSpace, page_alloc: &mut PageAllocator, addr: VirtAddr, data: &[u8]) -> EResult<()> {
	let mut off = 0;
	while off < data.len() {
		let cur = addr + off;
		let page = cur.align_down();
		mm.handle_fault(page_alloc, cur, true).map_err(|e| match e {
			FaultOutcome::Oom => errno!(ENOMEM),
			FaultOutcome::Segv => errno!(EFAULT),
		})?;
		let frame = mm.dir.translate(page_alloc, page).ok_or(errno!(EFAULT))?.frame();
		let in_page = cur - page;
		let n = (PAGE_SIZE - in_page).min(data.len() - off);
		page_alloc.frame_bytes_mut(frame)[in_page..in_page + n].copy_from_slice(&data[off..off + n]);
		off += n;
	}
	Ok(())
}

/// Peeks the first two bytes of `image` for the `#!` marker, returning the interpreter path on
/// the rest of the line if present.
fn shebang_interp(image: &[u8]) -> Option<String> {
	if image.len() < 2 || &image[0..2] != b"#!" {
		return None;
	}
	let line_end = image[2..].iter().position(|&b| b == b'\n').map(|p| p + 2).unwrap_or(image.len());
	core::str::from_utf8(&image[2..line_end]).ok().map(|s| String::from(s.trim()))
}

struct LoaderResult {
	bin: LoadedBinary,
	aux_extra: Vec<Aux>,
}

fn drive_loader(mm: &mut MemSpace, page_alloc: &mut PageAllocator, opener: &dyn Opener, start_path: &str, argv: &mut Vec<String>) -> EResult<LoaderResult> {
	let mut path = String::from(start_path);
	let mut aux_extra = Vec::new();
	let mut interp_phase = false;
	let mut new_files: Vec<Arc<File>> = Vec::new();

	for _ in 0..=MAX_SHEBANG_DEPTH {
		let (file, dentry) = opener.open(&path)?;
		let image = read_whole(&file)?;

		if let Some(interp) = shebang_interp(&image) {
			log::debug!("{path} is a shebang script, restarting with interpreter {interp}");
			argv.insert(0, path.clone());
			path = interp;
			continue;
		}

		let format = binfmt::find(*image.first().ok_or(errno!(ENOEXEC))?).ok_or(errno!(ENOEXEC))?;
		match format.prepare(&image)? {
			Some(interp_path) => {
				format.load(mm, page_alloc, &image, &dentry)?;
				new_files.push(Arc::new(file)?);
				aux_extra.push(Aux::num(stack::AT_EXECFD, new_files.len() - 1));
				path = interp_path;
				interp_phase = true;
			}
			None => {
				let bin = if interp_phase {
					format.interp_load(mm, page_alloc, &image, &dentry)?
				} else {
					format.load(mm, page_alloc, &image, &dentry)?
				};
				format.cleanup();
				return Ok(LoaderResult { bin, aux_extra });
			}
		}
	}
	Err(errno!(ENOEXEC))
}

/// Replaces `proc`'s address space with the program at `path`. On success, `proc.mm` and
/// `proc.signals` now reflect the new program and the old address space has been freed; on
/// failure the process is untouched and the error is the loader's.
///
/// Returns `(entry, initial stack pointer)` for the caller to install on the return-to-user
/// path; switching to user mode itself is outside this module's scope.
pub fn do_exec(
	proc: &Arc<Process>,
	page_alloc: &mut PageAllocator,
	opener: &dyn Opener,
	path: &str,
	mut argv: Vec<String>,
	envp: Vec<String>,
) -> EResult<(VirtAddr, VirtAddr)> {
	let dir = crate::arch::page_table::PageDirectory::new(page_alloc)?;
	let mut mm = MemSpace::new(dir);

	let outcome = drive_loader(&mut mm, page_alloc, opener, path, &mut argv).and_then(|loaded| {
		let stack_base = USER_STACK_TOP - USER_STACK_SIZE;
		mm.mmap(Some(stack_base), USER_STACK_SIZE, VmFlags::READ | VmFlags::WRITE, MmapFlags::FIXED | MmapFlags::ANONYMOUS, None)?;

		let mut aux = loaded.aux_extra;
		aux.push(Aux::num(stack::AT_PAGESZ, PAGE_SIZE));
		aux.push(Aux::string(stack::AT_EXECFN, path.as_bytes()));
		let init = stack::build(&argv, &envp, aux, USER_STACK_TOP);
		write_bytes(&mut mm, page_alloc, init.base, &init.bytes)?;

		mm.code_start = loaded.bin.code_start;
		mm.code_end = loaded.bin.code_end;
		mm.stack_start = stack_base;
		mm.stack_end = USER_STACK_TOP;
		mm.args_start = init.argv_range.0;
		mm.args_end = init.argv_range.1;
		mm.env_start = init.envp_range.0;
		mm.env_end = init.envp_range.1;
		mm.set_brk_start(loaded.bin.brk);

		Ok((loaded.bin.entry, init.base))
	});

	match outcome {
		Ok((entry, esp)) => {
			let old_mm = core::mem::replace(&mut *proc.mm.lock(), mm);
			old_mm.teardown(page_alloc);
			proc.signals.lock().reset();
			Ok((entry, esp))
		}
		Err(e) => {
			log::warn!("exec of {path} failed: {e}");
			mm.teardown(page_alloc);
			Err(e)
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::{arch::page_table::PageDirectory, fs, process::signal::Signal};

	const PT_LOAD: u32 = 1;
	const PF_R: u32 = 1 << 2;
	const PF_X: u32 = 1 << 0;

	/// A single-segment `ET_EXEC` image, built the same way `elf`'s own tests do.
	fn minimal_elf(entry: u32, code: &[u8]) -> Vec<u8> {
		let mut image = Vec::new();
		image.extend_from_slice(&[0x7f, b'E', b'L', b'F']);
		image.push(1); // ELFCLASS32
		image.push(1); // ELFDATA2LSB
		image.resize(16, 0);
		image.extend_from_slice(&2u16.to_le_bytes()); // e_type = ET_EXEC
		image.extend_from_slice(&3u16.to_le_bytes()); // e_machine
		image.extend_from_slice(&1u32.to_le_bytes()); // e_version
		image.extend_from_slice(&entry.to_le_bytes());
		image.extend_from_slice(&52u32.to_le_bytes()); // e_phoff
		image.extend_from_slice(&0u32.to_le_bytes()); // e_shoff
		image.extend_from_slice(&0u32.to_le_bytes()); // e_flags
		image.extend_from_slice(&52u16.to_le_bytes()); // e_ehsize
		image.extend_from_slice(&32u16.to_le_bytes()); // e_phentsize
		image.extend_from_slice(&1u16.to_le_bytes()); // e_phnum
		image.extend_from_slice(&0u16.to_le_bytes());
		image.extend_from_slice(&0u16.to_le_bytes());
		image.extend_from_slice(&0u16.to_le_bytes());
		let data_off = 52 + 32;
		image.extend_from_slice(&PT_LOAD.to_le_bytes());
		image.extend_from_slice(&(data_off as u32).to_le_bytes()); // p_offset
		image.extend_from_slice(&entry.to_le_bytes()); // p_vaddr
		image.extend_from_slice(&entry.to_le_bytes()); // p_paddr
		image.extend_from_slice(&(code.len() as u32).to_le_bytes()); // p_filesz
		image.extend_from_slice(&(code.len() as u32).to_le_bytes()); // p_memsz
		image.extend_from_slice(&(PF_R | PF_X).to_le_bytes());
		image.extend_from_slice(&(PAGE_SIZE as u32).to_le_bytes()); // p_align
		image.extend_from_slice(code);
		image
	}

	fn fresh_process() -> (Arc<Process>, PageAllocator) {
		let mut alloc = PageAllocator::new(256);
		let dir = PageDirectory::new(&mut alloc).unwrap();
		(Process::init(MemSpace::new(dir)), alloc)
	}

	struct MapOpener {
		path: &'static str,
		dentry: Dentry,
	}

	impl Opener for MapOpener {
		fn open(&self, path: &str) -> EResult<(File, Dentry)> {
			if path == self.path {
				Ok((File::open(self.dentry.clone()), self.dentry.clone()))
			} else {
				Err(errno!(ENOENT))
			}
		}
	}

	#[test]
	fn direct_elf_exec_sets_entry_and_resets_signals() {
		let (proc, mut alloc) = fresh_process();
		proc.signals.lock().raise(Signal::Segv);

		let image = minimal_elf(0x1000, &[0x90u8; 4]);
		let dentry = fs::mem_file("prog", image);
		let opener = MapOpener { path: "/bin/prog", dentry };

		let (entry, esp) =
			do_exec(&proc, &mut alloc, &opener, "/bin/prog", alloc::vec![String::from("prog")], Vec::new()).unwrap();
		assert_eq!(entry, VirtAddr(0x1000));
		assert!(esp < USER_STACK_TOP);
		assert!(!proc.signals.lock().is_pending(Signal::Segv));
	}

	#[test]
	fn shebang_restarts_with_interpreter_and_prepends_path() {
		let (proc, mut alloc) = fresh_process();

		let interp_image = minimal_elf(0x2000, &[0x90u8; 4]);
		let interp_dentry = fs::mem_file("sh", interp_image);
		let script_dentry = fs::mem_file("script", alloc::vec::Vec::from(*b"#!/bin/sh\nrest\n"));

		struct ShebangOpener {
			script: Dentry,
			interp: Dentry,
		}
		impl Opener for ShebangOpener {
			fn open(&self, path: &str) -> EResult<(File, Dentry)> {
				match path {
					"/bin/script" => Ok((File::open(self.script.clone()), self.script.clone())),
					"/bin/sh" => Ok((File::open(self.interp.clone()), self.interp.clone())),
					_ => Err(errno!(ENOENT)),
				}
			}
		}
		let opener = ShebangOpener { script: script_dentry, interp: interp_dentry };

		let (entry, _) =
			do_exec(&proc, &mut alloc, &opener, "/bin/script", alloc::vec![String::from("script")], Vec::new()).unwrap();
		assert_eq!(entry, VirtAddr(0x2000));
	}

	#[test]
	fn unknown_path_leaves_process_untouched() {
		let (proc, mut alloc) = fresh_process();
		let before_code_start = proc.mm.lock().code_start;
		struct EmptyOpener;
		impl Opener for EmptyOpener {
			fn open(&self, _: &str) -> EResult<(File, Dentry)> {
				Err(errno!(ENOENT))
			}
		}
		let err = do_exec(&proc, &mut alloc, &EmptyOpener, "/nope", Vec::new(), Vec::new()).unwrap_err();
		assert_eq!(err, errno::ENOENT);
		assert_eq!(proc.mm.lock().code_start, before_code_start);
	}
}
