//! Nucleus is a small Unix-like kernel core written in Rust: a virtual memory subsystem,
//! process fork/exec glue, and an ELF32 + shebang program loader. This reference documents
//! interfaces for each module.
//!
//! # Features
//!
//! - `bin`: builds the freestanding entry point in `src/bin.rs`. Without it, the crate is a
//!   plain host-testable library — every module's `#[cfg(test)]` suite runs under `cargo test`
//!   without any special target or bootloader.

#![no_std]
#![feature(arbitrary_self_types)]
#![allow(clippy::tabs_in_doc_comments)]

extern crate alloc;

pub mod arch;
pub mod bootcfg;
pub mod fs;
pub mod logger;
pub mod memory;
pub mod process;

pub use utils;

/// The kernel's name.
pub const NAME: &str = env!("CARGO_PKG_NAME");
/// Current kernel version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
