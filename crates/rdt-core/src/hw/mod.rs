//! Hardware access layer (spec.md §4.A, Component A). The only path to
//! hardware: every higher-level component routes MSR/MMIO traffic
//! through `msr` / `mmio`. Errors are surfaced as plain `io::Error`;
//! callers translate into the library's own [`crate::error::Error`].

pub mod mmio;
pub mod msr;
pub mod regs;

pub use mmio::{mmio_read, mmio_write, PciBdf};
pub use msr::{msr_read, msr_rmw, msr_write};
