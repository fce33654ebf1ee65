//! The scheduler-visible process object and `fork`.

pub mod exec;
pub mod mem_space;
pub mod pid;
pub mod scheduler;
pub mod signal;

extern crate alloc;

use crate::{
	fs::File,
	memory::page_alloc::PageAllocator,
	process::{mem_space::MemSpace, pid::Pid, signal::SignalState},
};
use alloc::vec::Vec;
use utils::{
	errno::EResult,
	ptr::Arc,
	lock::Mutex,
};

/// A process's run state. The init process is statically allocated and starts `Running`;
/// every other process is produced by [`Process::fork`] and reaped by `wait` on its parent
/// once it reaches `Zombie`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
	Running,
	Waiting,
	Stopped,
	Zombie,
}

/// A kernel-stack placeholder: the freestanding binary backs this with a real allocated
/// stack and a saved register context; the host-side build never actually context-switches,
/// so there is nothing to model beyond a stable identity.
#[derive(Debug, Default)]
pub struct ArchContext {
	pub entry: crate::memory::VirtAddr,
	pub stack_pointer: crate::memory::VirtAddr,
}

pub struct Process {
	pub pid: Pid,
	pub ppid: Pid,
	pub pgid: Pid,
	pub sid: Pid,
	pub mm: Arc<Mutex<MemSpace>>,
	pub files: Mutex<Vec<Arc<File>>>,
	pub signals: Mutex<SignalState>,
	pub children: Mutex<Vec<Pid>>,
	pub state: Mutex<State>,
	pub context: Mutex<ArchContext>,
}

impl Process {
	/// Builds the statically allocated init process around an already-built address space.
	pub fn init(mm: MemSpace) -> Arc<Process> {
		Arc::new(Process {
			pid: Pid::INIT,
			ppid: Pid::INIT,
			pgid: Pid::INIT,
			sid: Pid::INIT,
			mm: Arc::new(Mutex::new(mm)).unwrap_or_else(|_| unreachable!()),
			files: Mutex::new(Vec::new()),
			signals: Mutex::new(SignalState::default()),
			children: Mutex::new(Vec::new()),
			state: Mutex::new(State::Running),
			context: Mutex::new(ArchContext::default()),
		})
		.unwrap_or_else(|_| unreachable!())
	}

	/// Forks `self`, giving the child a copy-on-write clone of the address space (§4.5) and a
	/// copy of the open-file table. The child's pid is freshly allocated; everything else
	/// about its identity (pgid, sid) is inherited from the parent.
	pub fn fork(self: &Arc<Process>, page_alloc: &mut PageAllocator) -> EResult<Arc<Process>> {
		let child_mm = self.mm.lock().fork(page_alloc)?;
		let child = Arc::new(Process {
			pid: pid::alloc(),
			ppid: self.pid,
			pgid: self.pgid,
			sid: self.sid,
			mm: Arc::new(Mutex::new(child_mm))?,
			files: Mutex::new(self.files.lock().clone()),
			signals: Mutex::new(SignalState::default()),
			children: Mutex::new(Vec::new()),
			state: Mutex::new(State::Running),
			context: Mutex::new(ArchContext::default()),
		})?;
		self.children.lock().push(child.pid);
		Ok(child)
	}
}
