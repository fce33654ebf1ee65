//! The page-frame allocator: the leaf of the whole memory subsystem.
//!
//! Owns the page-frame array and a single free list. Everything above it — the page-table
//! walker, VM areas, `mmap` — ultimately bottoms out in [`alloc`] and [`free`].
//!
//! A frame is in exactly one of two states: *free* (refcount 0, linked into the free list) or
//! *in use* (refcount >= 1, detached). This invariant is checked with `debug_assert!` at every
//! transition rather than enforced by the type system, matching how the rest of the kernel
//! core treats "this must never happen" conditions as a panic in debug builds, not a `Result`.

use crate::memory::PhysAddr;
use alloc::vec::Vec;
use bitflags::bitflags;
use utils::{
	errno,
	errno::{EResult, Errno},
	limits::PAGE_SIZE,
	lock::Mutex,
};

bitflags! {
	/// Flags accepted by [`PageAllocator::alloc`].
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct AllocFlags: u32 {
		/// The returned frames must be physically contiguous.
		const CONTIGUOUS = 0b0001;
		/// The returned frames need not be contiguous; cheaper, since it just pops the free
		/// list head `n` times instead of scanning for a run.
		const DISCONTIGUOUS = 0b0010;
		/// Zero the frames before returning them.
		const ZEROED = 0b0100;
		/// The frames are intended for MMIO and should never be cached.
		const UNCACHED = 0b1000;
	}
}

/// Identifies a single page frame by its index in the frame array.
pub type FrameId = u32;

/// One frame's worth of physical memory content, used as the allocator's backing store.
///
/// Over-aligning to the page size lets the page-table walker reinterpret a frame's bytes as a
/// `[u32; 1024]` array of page-table entries without violating alignment.
#[repr(C, align(4096))]
struct FrameBytes([u8; PAGE_SIZE]);

impl Default for FrameBytes {
	fn default() -> Self {
		Self([0; PAGE_SIZE])
	}
}

/// Per-frame metadata.
#[derive(Debug, Default)]
struct Frame {
	/// Number of holders (VM mappings, kernel callers, or the page-table tree itself).
	refcount: u32,
	/// Previous frame in the free list, if free.
	prev_free: Option<FrameId>,
	/// Next frame in the free list, or the next frame of the same allocated run.
	next: Option<FrameId>,
	/// Whether the frame is uncached (set at allocation time, for debugging/inspection only).
	uncached: bool,
}

impl Frame {
	fn is_free(&self) -> bool {
		self.refcount == 0
	}
}

/// The page-frame allocator.
///
/// A real boot would size this to the memory map reported by the firmware; tests and the
/// freestanding binary alike just pick a frame count up front and hand it to [`new`].
pub struct PageAllocator {
	frames: Vec<Frame>,
	storage: Vec<FrameBytes>,
	free_head: Option<FrameId>,
	free_tail: Option<FrameId>,
	free_count: usize,
}

impl PageAllocator {
	/// Creates an allocator owning `frame_count` frames, all initially free.
	pub fn new(frame_count: usize) -> Self {
		let mut frames = Vec::with_capacity(frame_count);
		let mut storage = Vec::with_capacity(frame_count);
		for i in 0..frame_count {
			let prev = if i == 0 { None } else { Some(i as FrameId - 1) };
			let next = if i + 1 == frame_count {
				None
			} else {
				Some(i as FrameId + 1)
			};
			frames.push(Frame {
				refcount: 0,
				prev_free: prev,
				next,
				uncached: false,
			});
			storage.push(FrameBytes::default());
		}
		let free_head = (frame_count > 0).then_some(0);
		let free_tail = (frame_count > 0).then_some(frame_count as FrameId - 1);
		Self {
			frames,
			storage,
			free_head,
			free_tail,
			free_count: frame_count,
		}
	}

	/// Total number of frames owned by this allocator.
	pub fn total_frames(&self) -> usize {
		self.frames.len()
	}

	/// Number of frames currently on the free list.
	pub fn free_frames(&self) -> usize {
		self.free_count
	}

	fn detach_free(&mut self, id: FrameId) {
		let (prev, next) = (self.frames[id as usize].prev_free, self.frames[id as usize].next);
		match prev {
			Some(p) => self.frames[p as usize].next = next,
			None => self.free_head = next,
		}
		match next {
			Some(n) => self.frames[n as usize].prev_free = prev,
			None => self.free_tail = prev,
		}
		self.frames[id as usize].prev_free = None;
		self.frames[id as usize].next = None;
		self.free_count -= 1;
	}

	fn push_free_tail(&mut self, id: FrameId) {
		self.frames[id as usize].prev_free = self.free_tail;
		self.frames[id as usize].next = None;
		match self.free_tail {
			Some(t) => self.frames[t as usize].next = Some(id),
			None => self.free_head = Some(id),
		}
		self.free_tail = Some(id);
		self.free_count += 1;
	}

	/// Allocates `n` page frames according to `flags`.
	///
	/// [`AllocFlags::CONTIGUOUS`] scans the frame array linearly for the first run of `n`
	/// unused frames. [`AllocFlags::DISCONTIGUOUS`] instead detaches `n` frames one at a time
	/// from the free-list head and chains them through [`Frame::next`] — cheaper, but the
	/// frames need not be physically adjacent.
	///
	/// Returns the id of the first frame in the run; follow [`PageAllocator::next_in_run`] to
	/// reach the rest. Fails with `-ENOMEM` if no run of the requested shape is available.
	pub fn alloc(&mut self, n: usize, flags: AllocFlags) -> EResult<FrameId> {
		if n == 0 {
			return Err(errno!(EINVAL));
		}
		let head = if flags.contains(AllocFlags::DISCONTIGUOUS) {
			self.alloc_discontiguous(n)?
		} else {
			self.alloc_contiguous(n)?
		};
		// Mark every frame in the run as in use. For a contiguous run, `alloc_contiguous` never
		// chained `Frame::next` between the detached frames (they weren't linked through the
		// free list together), so this loop links them here as it walks, the same way
		// `alloc_discontiguous` links its run as it detaches.
		let mut cur = Some(head);
		while let Some(id) = cur {
			let next = if flags.contains(AllocFlags::DISCONTIGUOUS) {
				self.frames[id as usize].next
			} else if (id - head) as usize + 1 < n {
				Some(id + 1)
			} else {
				None
			};
			let frame = &mut self.frames[id as usize];
			debug_assert_eq!(frame.refcount, 0, "handing out an in-use frame");
			frame.refcount = 1;
			frame.uncached = flags.contains(AllocFlags::UNCACHED);
			if !flags.contains(AllocFlags::DISCONTIGUOUS) {
				frame.next = next;
			}
			if flags.contains(AllocFlags::ZEROED) {
				self.storage[id as usize] = FrameBytes::default();
			}
			cur = next;
		}
		Ok(head)
	}

	fn alloc_contiguous(&mut self, n: usize) -> EResult<FrameId> {
		let total = self.frames.len();
		if n > total {
			return Err(errno!(ENOMEM));
		}
		let mut run_start = 0usize;
		let mut run_len = 0usize;
		for i in 0..total {
			if self.frames[i].is_free() {
				if run_len == 0 {
					run_start = i;
				}
				run_len += 1;
				if run_len == n {
					for j in run_start..run_start + n {
						self.detach_free(j as FrameId);
					}
					return Ok(run_start as FrameId);
				}
			} else {
				run_len = 0;
			}
		}
		Err(errno!(ENOMEM))
	}

	fn alloc_discontiguous(&mut self, n: usize) -> EResult<FrameId> {
		if self.free_count < n {
			return Err(errno!(ENOMEM));
		}
		let mut head = None;
		let mut tail: Option<FrameId> = None;
		for _ in 0..n {
			let id = self.free_head.expect("free_count says frames remain");
			self.detach_free(id);
			if head.is_none() {
				head = Some(id);
			}
			if let Some(t) = tail {
				self.frames[t as usize].next = Some(id);
			}
			self.frames[id as usize].next = None;
			tail = Some(id);
		}
		Ok(head.unwrap())
	}

	/// Follows the sibling link of a run returned by [`PageAllocator::alloc`].
	pub fn next_in_run(&self, id: FrameId) -> Option<FrameId> {
		self.frames[id as usize].next
	}

	/// Increments the reference count of an in-use frame (a new mapping or kernel holder).
	pub fn get(&mut self, id: FrameId) {
		let frame = &mut self.frames[id as usize];
		debug_assert!(!frame.is_free(), "get() on a free frame");
		frame.refcount += 1;
	}

	/// Decrements the reference count of `id`; once it reaches zero, the frame is returned to
	/// the free list.
	///
	/// Freeing an already-free frame is a programmer error and panics in debug builds.
	pub fn free(&mut self, id: FrameId) {
		let frame = &mut self.frames[id as usize];
		debug_assert!(!frame.is_free(), "double free of frame {id}");
		frame.refcount -= 1;
		if frame.refcount == 0 {
			self.push_free_tail(id);
		}
	}

	/// Frees every frame in a linked run obtained from [`PageAllocator::alloc`].
	pub fn range_free(&mut self, head: FrameId) {
		let mut cur = Some(head);
		while let Some(id) = cur {
			cur = self.frames[id as usize].next;
			self.free(id);
		}
	}

	/// Current reference count of `id`, mainly for copy-on-write decisions.
	pub fn refcount(&self, id: FrameId) -> u32 {
		self.frames[id as usize].refcount
	}

	/// Raw byte access to a frame's backing storage.
	pub fn frame_bytes_mut(&mut self, id: FrameId) -> &mut [u8; PAGE_SIZE] {
		&mut self.storage[id as usize].0
	}

	pub fn frame_bytes(&self, id: FrameId) -> &[u8; PAGE_SIZE] {
		&self.storage[id as usize].0
	}

	pub fn phys_addr(&self, id: FrameId) -> PhysAddr {
		PhysAddr(id as usize * PAGE_SIZE)
	}

	pub fn frame_of(&self, addr: PhysAddr) -> FrameId {
		(addr.0 / PAGE_SIZE) as FrameId
	}
}

/// The system-wide page allocator. Initialized once at boot (or once per test) before any
/// other subsystem runs, per the init order documented in the design notes: allocator -> mm
/// subsystem -> init process -> rest.
pub static PAGES: Mutex<Option<PageAllocator>> = Mutex::new(None);

/// Initializes the global allocator. Must be called exactly once before any other subsystem
/// touches [`PAGES`].
pub fn init(frame_count: usize) {
	let mut guard = PAGES.lock();
	debug_assert!(guard.is_none(), "page allocator initialized twice");
	*guard = Some(PageAllocator::new(frame_count));
}

/// Runs `f` with exclusive access to the global allocator.
///
/// # Panics
/// If [`init`] has not been called yet.
pub fn with<R>(f: impl FnOnce(&mut PageAllocator) -> R) -> R {
	let mut guard = PAGES.lock();
	f(guard.as_mut().expect("page allocator not initialized"))
}

pub type AllocResult<T> = Result<T, Errno>;
