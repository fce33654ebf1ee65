//! Small freestanding support crate shared between the kernel and, eventually, its modules.
//!
//! Mirrors the handful of conventions the kernel leans on everywhere: fallible allocation
//! (`AllocResult`), a single errno-carrying `EResult`, interrupt-aware locking, and the
//! refcounted [`ptr::Arc`] wrapper.

#![no_std]
#![feature(allocator_api)]

extern crate alloc;

pub mod errno;
pub mod limits;
pub mod lock;
pub mod math;
pub mod ptr;

use core::alloc::AllocError;

/// Result of a fallible allocation: the only way to allocate in the kernel, since an
/// allocation failure must unwind to an errno rather than panic.
pub type AllocResult<T> = Result<T, AllocError>;
