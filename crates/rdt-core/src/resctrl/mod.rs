//! resctrl filesystem protocol (spec.md §4.D, §6, Component G): mount
//! options, schemata parsing/formatting, cpu-mask bitmap
//! serialization, and group-directory operations.

pub mod cpumask;
pub mod groups;
pub mod mount;
pub mod schemata;
