//! Interrupt control and the page-fault trap frame.
//!
//! [`IntMutex`](utils::lock::IntMutex) only provides the lock; callers that must keep an
//! interrupt handler from re-entering a critical section pair it with
//! [`wrap_disable_interrupts`] at the call site, the same split the rest of the port uses.

use bitflags::bitflags;

bitflags! {
	/// Bits of the error code x86 pushes on the stack for a page-fault exception (vector 14).
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct PageFaultCode: u32 {
		/// Set if the fault was caused by a page-protection violation; clear if the page was
		/// simply not present.
		const PROTECTION = 1 << 0;
		/// Set if the fault happened on a write, clear if on a read.
		const WRITE      = 1 << 1;
		/// Set if the fault happened while running in user mode.
		const USER       = 1 << 2;
		/// Set if the fault was caused by reading a reserved page-table bit.
		const RESERVED   = 1 << 3;
		/// Set if the fault happened on an instruction fetch (requires NX support).
		const INSTRUCTION = 1 << 4;
	}
}

/// Runs `f` with maskable interrupts disabled on the current CPU, restoring the prior flag
/// state afterwards regardless of how `f` returns.
///
/// On the freestanding binary this wraps `cli`/`popf`; the host-side test build has no
/// interrupts to mask, so it is a transparent passthrough there.
pub fn wrap_disable_interrupts<R>(f: impl FnOnce() -> R) -> R {
	#[cfg(all(target_arch = "x86", feature = "bin"))]
	{
		let flags: u32;
		unsafe {
			core::arch::asm!("pushf; pop {0}; cli", out(reg) flags);
		}
		let result = f();
		unsafe {
			if flags & (1 << 9) != 0 {
				core::arch::asm!("sti");
			}
		}
		result
	}
	#[cfg(not(all(target_arch = "x86", feature = "bin")))]
	{
		f()
	}
}
