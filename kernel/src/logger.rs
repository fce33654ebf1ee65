//! Kernel logging.
//!
//! Backed by a fixed-size ring buffer so the most recent lines survive even when nothing is
//! draining them; exposed through the standard [`log`] facade rather than a bespoke macro.

use core::cmp::min;
use utils::lock::IntMutex;

const LOGS_SIZE: usize = 16384;

/// The kernel's logger.
pub static LOGGER: IntMutex<RingLogger> = IntMutex::new(RingLogger::new());

/// Ring-buffer-backed [`log::Log`] implementor.
///
/// Tracked as a `(head, len)` pair rather than separate read/write cursors: `head` is the
/// offset of the oldest live byte and `len` is how many bytes starting there are valid, so
/// "full" and "empty" fall out of `len` directly instead of needing a reserved slot to
/// disambiguate `head == tail`.
pub struct RingLogger {
	buf: [u8; LOGS_SIZE],
	head: usize,
	len: usize,
}

impl RingLogger {
	const fn new() -> Self {
		Self { buf: [0; LOGS_SIZE], head: 0, len: 0 }
	}

	fn free_space(&self) -> usize {
		self.buf.len() - self.len
	}

	/// Returns the buffer's raw content, oldest byte first, for a future console drain.
	pub fn get_content(&self) -> &[u8] {
		&self.buf
	}

	fn push(&mut self, s: &[u8]) {
		let n = min(s.len(), self.buf.len());
		if n > self.free_space() {
			self.drop_front(n - self.free_space());
		}
		let write_at = (self.head + self.len) % self.buf.len();
		let tail_space = self.buf.len() - write_at;
		if n <= tail_space {
			self.buf[write_at..write_at + n].copy_from_slice(&s[..n]);
		} else {
			self.buf[write_at..].copy_from_slice(&s[..tail_space]);
			self.buf[..n - tail_space].copy_from_slice(&s[tail_space..n]);
		}
		self.len += n;
	}

	/// Discards at least `n` of the oldest bytes, continuing past `n` until a newline so a
	/// truncated line is never left at the front of the buffer.
	fn drop_front(&mut self, n: usize) {
		let mut dropped = 0;
		while dropped < self.len {
			let at_newline = self.buf[(self.head + dropped) % self.buf.len()] == b'\n';
			dropped += 1;
			if dropped >= n && at_newline {
				break;
			}
		}
		self.head = (self.head + dropped) % self.buf.len();
		self.len -= dropped;
	}
}

struct KernelLog;

impl log::Log for KernelLog {
	fn enabled(&self, _metadata: &log::Metadata) -> bool {
		true
	}

	fn log(&self, record: &log::Record) {
		use core::fmt::Write;
		let mut line = LineBuf { buf: [0; 256], len: 0 };
		let _ = write!(line, "[{}] {}\n", record.level(), record.args());
		LOGGER.lock().push(&line.buf[..line.len]);
	}

	fn flush(&self) {}
}

/// A fixed-capacity `fmt::Write` sink: formatting a log line must not allocate.
struct LineBuf {
	buf: [u8; 256],
	len: usize,
}

impl core::fmt::Write for LineBuf {
	fn write_str(&mut self, s: &str) -> core::fmt::Result {
		let n = min(s.len(), self.buf.len() - self.len);
		self.buf[self.len..self.len + n].copy_from_slice(&s.as_bytes()[..n]);
		self.len += n;
		Ok(())
	}
}

static KERNEL_LOG: KernelLog = KernelLog;

/// Installs the kernel logger as the `log` crate's global logger. Idempotent beyond the first
/// call, matching `log::set_logger`'s own contract.
pub fn init() {
	let _ = log::set_logger(&KERNEL_LOG);
	log::set_max_level(log::LevelFilter::Trace);
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn push_and_wrap_preserve_trailing_bytes() {
		let mut logger = RingLogger::new();
		logger.push(b"hello\n");
		assert_eq!(&logger.get_content()[0..6], b"hello\n");
	}

	#[test]
	fn push_past_capacity_drops_oldest_full_lines() {
		let mut logger = RingLogger::new();
		let line = [b'a'; 64];
		for _ in 0..(LOGS_SIZE / 64 + 4) {
			logger.push(&line);
			logger.push(b"\n");
		}
		assert!(logger.free_space() < LOGS_SIZE);
	}
}
