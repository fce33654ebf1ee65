//! The scheduler's side of the boundary: `process_current`, `wait`/`wake`, `do_kill`, and
//! `schedule`.
//!
//! The scheduler itself — run queues, priorities, preemption — is out of scope; it is the
//! other external collaborator, consumed through this interface exactly like the filesystem
//! is consumed through [`crate::fs::NodeOps`]. The fault handler and `exec` only ever call
//! these four operations.

use crate::process::{pid::Pid, signal::Signal, Process};
use utils::ptr::Arc;

/// What the VM/exec core needs from the scheduler.
pub trait Scheduler {
	/// The process whose kernel stack is presently executing.
	fn current(&self) -> Arc<Process>;

	/// Delivers `sig` to `target`, waking it if it was blocked waiting for a signal.
	fn do_kill(&self, target: &Process, sig: Signal);

	/// Suspends the current process until woken, returning `-EINTR` if a signal arrived
	/// first instead of the awaited condition.
	fn process_wait(&self) -> utils::errno::EResult<()>;

	/// Wakes every process sleeping on the same condition as `target`.
	fn process_wake(&self, target: &Process);

	/// Yields the CPU to another runnable process.
	fn schedule(&self);
}

/// A single-process scheduler used by tests and by the freestanding binary before the real
/// scheduler (out of scope for this core) takes over: there is exactly one process, `current`,
/// and every suspension point resolves immediately.
pub struct SingleProcessScheduler {
	current: Arc<Process>,
}

impl SingleProcessScheduler {
	pub fn new(current: Arc<Process>) -> Self {
		Self { current }
	}

	pub fn pid(&self) -> Pid {
		self.current.pid
	}
}

impl Scheduler for SingleProcessScheduler {
	fn current(&self) -> Arc<Process> {
		self.current.clone()
	}

	fn do_kill(&self, target: &Process, sig: Signal) {
		target.signals.lock().raise(sig);
		if matches!(sig, Signal::Kill) {
			*target.state.lock() = crate::process::State::Zombie;
		}
	}

	fn process_wait(&self) -> utils::errno::EResult<()> {
		Ok(())
	}

	fn process_wake(&self, _target: &Process) {}

	fn schedule(&self) {}
}
