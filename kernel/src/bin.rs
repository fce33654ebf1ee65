//! This module exists only to link the kernel library into a freestanding executable and
//! provide the handful of items only a final binary crate may define: the global allocator,
//! the panic handler, and the entry point.

#![no_std]
#![no_main]

extern crate alloc;
extern crate kernel;

use core::panic::PanicInfo;
use kernel::arch::idt::wrap_disable_interrupts;
use linked_list_allocator::LockedHeap;

/// Backing storage for [`ALLOCATOR`].
///
/// A real boot sequence would hand the allocator whatever memory the bootloader's memory map
/// reports as usable; this port has no multiboot/memmap stage, so the heap is a fixed static
/// region sized for the VM/exec subsystem's own bookkeeping (page tables and frame metadata
/// live in [`kernel::memory::page_alloc::PageAllocator`], not on this heap).
const HEAP_SIZE: usize = 4 * 1024 * 1024;
static mut HEAP: [u8; HEAP_SIZE] = [0; HEAP_SIZE];

#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

#[panic_handler]
fn panic(_info: &PanicInfo) -> ! {
	loop {
		wrap_disable_interrupts(|| {});
	}
}

#[cfg(all(target_arch = "x86", feature = "bin"))]
const STACK_SIZE: usize = 64 * 1024;
#[cfg(all(target_arch = "x86", feature = "bin"))]
static mut STACK: [u8; STACK_SIZE] = [0; STACK_SIZE];

/// Entry point. The bootloader hands control here with the CPU already in protected mode.
#[cfg(all(target_arch = "x86", feature = "bin"))]
core::arch::global_asm!(
	".section .text",
	".global _start",
	"_start:",
	"lea esp, [{stack} + {size}]",
	"call {main}",
	"2:",
	"hlt",
	"jmp 2b",
	stack = sym STACK,
	size = const STACK_SIZE,
	main = sym rust_main,
);

/// Stand-in for the command line a real bootloader would place in memory; see
/// [`kernel::bootcfg`].
const CMDLINE: &str = "-root 1 0 -init /sbin/init";

/// Placeholder physical frame count: a real boot path derives this from the bootloader's
/// memory map, which this port has no stage for.
const PHYS_FRAME_COUNT: usize = 4096;

#[unsafe(no_mangle)]
extern "C" fn rust_main() -> ! {
	unsafe {
		#[allow(static_mut_refs)]
		ALLOCATOR.lock().init(HEAP.as_mut_ptr(), HEAP_SIZE);
	}
	kernel::logger::init();
	let cfg = kernel::bootcfg::BootConfig::parse(CMDLINE).unwrap_or_default();
	log::info!("booting, init={}", cfg.init_path());

	kernel::memory::page_alloc::init(PHYS_FRAME_COUNT);
	let free = kernel::memory::page_alloc::with(|pa| pa.free_frames());
	log::info!("page allocator ready: {free} frames free");

	loop {
		wrap_disable_interrupts(|| {});
	}
}
