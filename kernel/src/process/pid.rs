//! Process, group, and session identifiers.

use core::sync::atomic::{AtomicU32, Ordering};

/// A process, process-group, or session id. The three use the same numbering space, as on a
/// real Unix system: a session leader's sid equals its pid, and a process-group leader's pgid
/// equals its pid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pid(pub u32);

impl Pid {
	/// The statically allocated init process.
	pub const INIT: Pid = Pid(1);
}

static NEXT_PID: AtomicU32 = AtomicU32::new(Pid::INIT.0 + 1);

/// Allocates the next pid. Never reused within a boot, which is simpler than the real
/// kernel's wraparound-and-scan allocator and sufficient for the processes this core manages
/// directly.
pub fn alloc() -> Pid {
	Pid(NEXT_PID.fetch_add(1, Ordering::Relaxed))
}
