//! Boot-time kernel command line parsing.
//!
//! Three arguments only: `-root <major> <minor>`, `-init <path>`, `-silent`. There is no
//! bootloader handing this crate a real command-line buffer (no multiboot stage is in scope),
//! so [`bin.rs`](crate) parses a fixed placeholder string; a real boot path would hand `parse`
//! whatever buffer the bootloader places in memory instead.

use alloc::string::String;
use utils::{errno, errno::EResult};

/// Parsed boot parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootConfig {
	/// The root device's major and minor numbers, from `-root <major> <minor>`.
	pub root: Option<(u32, u32)>,
	/// The init program's path, from `-init <path>`. Defaults to `/sbin/init` when absent.
	pub init: Option<String>,
	/// Set by `-silent`: suppress non-essential boot logging.
	pub silent: bool,
}

impl BootConfig {
	/// The init path to use, falling back to the conventional default.
	pub fn init_path(&self) -> &str {
		self.init.as_deref().unwrap_or("/sbin/init")
	}

	/// Parses a whitespace-separated command line. Unrecognized tokens or a flag missing its
	/// required argument are both `-EINVAL`.
	pub fn parse(cmdline: &str) -> EResult<Self> {
		let mut cfg = Self::default();
		let mut tokens = cmdline.split_ascii_whitespace();
		while let Some(tok) = tokens.next() {
			match tok {
				"-root" => {
					let major = tokens.next().and_then(|s| s.parse().ok()).ok_or(errno!(EINVAL))?;
					let minor = tokens.next().and_then(|s| s.parse().ok()).ok_or(errno!(EINVAL))?;
					cfg.root = Some((major, minor));
				}
				"-init" => {
					let path = tokens.next().ok_or(errno!(EINVAL))?;
					cfg.init = Some(String::from(path));
				}
				"-silent" => cfg.silent = true,
				_ => return Err(errno!(EINVAL)),
			}
		}
		Ok(cfg)
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn unknown_flag_is_einval() {
		assert_eq!(BootConfig::parse("-bleh"), Err(errno::EINVAL));
	}

	#[test]
	fn root_missing_minor_is_einval() {
		assert_eq!(BootConfig::parse("-root 1"), Err(errno::EINVAL));
	}

	#[test]
	fn root_parses_major_and_minor() {
		let cfg = BootConfig::parse("-root 1 0").unwrap();
		assert_eq!(cfg.root, Some((1, 0)));
	}

	#[test]
	fn init_missing_path_is_einval() {
		assert_eq!(BootConfig::parse("-root 1 0 -init"), Err(errno::EINVAL));
	}

	#[test]
	fn init_path_defaults_when_absent() {
		let cfg = BootConfig::parse("-root 1 0").unwrap();
		assert_eq!(cfg.init_path(), "/sbin/init");
	}

	#[test]
	fn full_line_parses_every_flag() {
		let cfg = BootConfig::parse("-root 1 0 -init /bin/myinit -silent").unwrap();
		assert_eq!(cfg.root, Some((1, 0)));
		assert_eq!(cfg.init_path(), "/bin/myinit");
		assert!(cfg.silent);
	}
}
