//! Architecture-specific ports.
//!
//! Only the 32-bit x86 port is implemented; everything above this module reaches the
//! hardware only through the items re-exported here, so a second port would slot in beside
//! [`x86`] without touching the memory or process code.

pub mod x86;

pub use x86::idt;
pub use x86::page_table;
