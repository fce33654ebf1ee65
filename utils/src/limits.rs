//! Platform limits shared across the kernel.

/// Size in bytes of a single memory page on x86 (no PAE/PSE large pages in this port).
pub const PAGE_SIZE: usize = 4096;

/// Maximum length of a path passed to `execve` and friends.
pub const PATH_MAX: usize = 4096;

/// Hard limit on shebang interpreter re-entry depth.
///
/// The shebang loop in `do_exec` treats the interpreter path as possibly another script;
/// without a bound, a file that shebangs to itself recurses forever.
pub const MAX_SHEBANG_DEPTH: u32 = 4;
