//! Locking primitives used throughout the core.
//!
//! Both are thin wrappers around [`spin::Mutex`]; the distinction is documentation, not
//! mechanism. `Mutex` is for state only ever touched from process context (the address space
//! lock, the page allocator lock). `IntMutex` flags a lock that may also be taken with
//! interrupts masked around the critical section — callers pair it with
//! `arch::x86::idt::wrap_disable_interrupts` rather than the lock enforcing it itself, since
//! only the architecture layer knows how to mask interrupts.

use core::ops::{Deref, DerefMut};
use spin::{Mutex as SpinMutex, MutexGuard as SpinGuard};

/// A mutex taken only from process context, never from an interrupt handler.
pub struct Mutex<T>(SpinMutex<T>);

impl<T> Mutex<T> {
	pub const fn new(val: T) -> Self {
		Self(SpinMutex::new(val))
	}

	pub fn lock(&self) -> MutexGuard<'_, T> {
		MutexGuard(self.0.lock())
	}
}

impl<T: Default> Default for Mutex<T> {
	fn default() -> Self {
		Self::new(T::default())
	}
}

pub struct MutexGuard<'m, T>(SpinGuard<'m, T>);

impl<T> Deref for MutexGuard<'_, T> {
	type Target = T;
	fn deref(&self) -> &T {
		&self.0
	}
}

impl<T> DerefMut for MutexGuard<'_, T> {
	fn deref_mut(&mut self) -> &mut T {
		&mut self.0
	}
}

/// A mutex that may be taken with interrupts masked around the critical section, so that a
/// handler on the same CPU can never observe it half-released.
///
/// Masking itself is the architecture layer's job; see
/// `arch::x86::idt::wrap_disable_interrupts`.
pub struct IntMutex<T>(SpinMutex<T>);

impl<T> IntMutex<T> {
	pub const fn new(val: T) -> Self {
		Self(SpinMutex::new(val))
	}

	pub fn lock(&self) -> IntMutexGuard<'_, T> {
		IntMutexGuard(self.0.lock())
	}
}

impl<T: Default> Default for IntMutex<T> {
	fn default() -> Self {
		Self::new(T::default())
	}
}

pub struct IntMutexGuard<'m, T>(SpinGuard<'m, T>);

impl<T> Deref for IntMutexGuard<'_, T> {
	type Target = T;
	fn deref(&self) -> &T {
		&self.0
	}
}

impl<T> DerefMut for IntMutexGuard<'_, T> {
	fn deref_mut(&mut self) -> &mut T {
		&mut self.0
	}
}
