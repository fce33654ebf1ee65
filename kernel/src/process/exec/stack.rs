//! Builds the `argc` / `argv` / `envp` / `auxv` block laid out on the initial user stack
//! (§4.5, "Initial stack layout").

use crate::memory::VirtAddr;
use alloc::{string::String, vec::Vec};

pub const AT_NULL: i32 = 0;
pub const AT_EXECFD: i32 = 2;
pub const AT_PAGESZ: i32 = 6;
pub const AT_EXECFN: i32 = 31;

pub enum AuxVal {
	Num(usize),
	Str(Vec<u8>),
}

pub struct Aux {
	pub a_type: i32,
	pub val: AuxVal,
}

impl Aux {
	pub fn num(a_type: i32, val: usize) -> Self {
		Self { a_type, val: AuxVal::Num(val) }
	}

	pub fn string(a_type: i32, val: &[u8]) -> Self {
		let mut bytes = Vec::new();
		bytes.extend_from_slice(val);
		bytes.push(0);
		Self { a_type, val: AuxVal::Str(bytes) }
	}
}

/// The result of [`build`]: the block's base address (its first occupied byte, the new stack
/// pointer) and its bytes, ready to be copied in starting at that address.
pub struct InitStack {
	pub base: VirtAddr,
	pub bytes: Vec<u8>,
	/// Where the `argv`/`envp` string data begins and ends, for the process's `args_start`/
	/// `args_end`/`env_start`/`env_end` bookkeeping.
	pub argv_range: (VirtAddr, VirtAddr),
	pub envp_range: (VirtAddr, VirtAddr),
}

/// Builds the stack block so that it ends exactly at `top` (the fixed top-of-user-space
/// address, or wherever the caller wants the block's last byte to land).
///
/// Layout, matching the diagram: `argc`, a pointer to `argv[]`, a pointer to `envp[]`, a
/// pointer to `auxv[]`, the `argv[]` pointer array (NUL-terminated), the `envp[]` pointer array
/// (NUL-terminated), `argv`/`envp` string data, word-aligned `auxv` pairs terminated by
/// `{0, 0}`, then the string data any `AuxVal::Str` entry points into.
pub fn build(argv: &[String], envp: &[String], mut aux: Vec<Aux>, top: VirtAddr) -> InitStack {
	aux.push(Aux::num(AT_NULL, 0));

	let header_size = 4 * 4; // argc, argv ptr, envp ptr, auxv ptr
	let argv_ptrs_size = (argv.len() + 1) * 4;
	let envp_ptrs_size = (envp.len() + 1) * 4;
	let strings_size: usize = argv.iter().map(|s| s.len() + 1).sum::<usize>()
		+ envp.iter().map(|s| s.len() + 1).sum::<usize>();
	let aux_pairs_size = aux.len() * 8;
	let aux_strings_size: usize = aux
		.iter()
		.map(|a| match &a.val {
			AuxVal::Str(s) => s.len(),
			AuxVal::Num(_) => 0,
		})
		.sum();

	let unaligned_before_aux_strings =
		header_size + argv_ptrs_size + envp_ptrs_size + strings_size + aux_pairs_size;
	let pad = (4 - (unaligned_before_aux_strings % 4)) % 4;
	let total = unaligned_before_aux_strings + pad + aux_strings_size;

	let base = top - total;
	let mut bytes = alloc::vec![0u8; total];

	let write_u32 = |bytes: &mut [u8], off: usize, val: u32| {
		bytes[off..off + 4].copy_from_slice(&val.to_le_bytes());
	};

	let argv_ptr_off = 4;
	let envp_ptr_off = 8;
	let auxv_ptr_off = 12;
	write_u32(&mut bytes, 0, argv.len() as u32);
	write_u32(&mut bytes, argv_ptr_off, (base + header_size).0 as u32);

	let mut cursor = header_size;
	let argv_array_off = cursor;
	cursor += argv_ptrs_size;
	let envp_array_off = cursor;
	write_u32(&mut bytes, envp_ptr_off, (base + envp_array_off).0 as u32);
	cursor += envp_ptrs_size;
	let strings_off = cursor;

	let mut str_cursor = strings_off;
	let argv_start = base + str_cursor;
	for (i, s) in argv.iter().enumerate() {
		write_u32(&mut bytes, argv_array_off + i * 4, (base + str_cursor).0 as u32);
		bytes[str_cursor..str_cursor + s.len()].copy_from_slice(s.as_bytes());
		bytes[str_cursor + s.len()] = 0;
		str_cursor += s.len() + 1;
	}
	write_u32(&mut bytes, argv_array_off + argv.len() * 4, 0);
	let argv_end = base + str_cursor;

	let envp_start = base + str_cursor;
	for (i, s) in envp.iter().enumerate() {
		write_u32(&mut bytes, envp_array_off + i * 4, (base + str_cursor).0 as u32);
		bytes[str_cursor..str_cursor + s.len()].copy_from_slice(s.as_bytes());
		bytes[str_cursor + s.len()] = 0;
		str_cursor += s.len() + 1;
	}
	write_u32(&mut bytes, envp_array_off + envp.len() * 4, 0);
	let envp_end = base + str_cursor;

	let aux_pairs_off = strings_off + strings_size + pad;
	write_u32(&mut bytes, auxv_ptr_off, (base + aux_pairs_off).0 as u32);
	let mut aux_str_cursor = aux_pairs_off + aux_pairs_size;
	for (i, a) in aux.iter().enumerate() {
		let pair_off = aux_pairs_off + i * 8;
		write_u32(&mut bytes, pair_off, a.a_type as u32);
		let val = match &a.val {
			AuxVal::Num(n) => *n as u32,
			AuxVal::Str(s) => {
				let addr = (base + aux_str_cursor).0 as u32;
				bytes[aux_str_cursor..aux_str_cursor + s.len()].copy_from_slice(s);
				aux_str_cursor += s.len();
				addr
			}
		};
		write_u32(&mut bytes, pair_off + 4, val);
	}

	debug_assert_eq!(aux_str_cursor, total);
	InitStack {
		base,
		bytes,
		argv_range: (argv_start, argv_end),
		envp_range: (envp_start, envp_end),
	}
}
