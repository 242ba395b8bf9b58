//! RDT (Resource Director Technology) userspace control engine:
//! programs cache/bandwidth partitioning (CAT, MBA, SMBA, CDP) and
//! reads occupancy/bandwidth monitoring counters (CMT/MBM), across
//! either the raw MSR/MMIO interface or the Linux kernel's resctrl
//! filesystem.
//!
//! Callers hold one [`Context`], obtained from [`Context::init`], for
//! the process's RDT session; every operation is a free function
//! taking `&Context` (or, for `reset`, consuming and replacing it).
//! There is no global/ambient library state beyond the process-wide
//! advisory lock each call acquires internally.

pub mod allocation;
pub mod backend;
pub mod capability;
pub mod config;
pub mod context;
pub mod error;
pub mod hw;
pub mod lock;
pub mod monitoring;
pub mod resctrl;
pub mod rmid;
pub mod topology;
pub mod types;

pub use context::Context;
pub use error::{Error, Result, StatusCode};
