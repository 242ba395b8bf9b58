//! Error taxonomy for the RDT engine.
//!
//! Every public entry point returns `Result<T, Error>`. `rdt-capi` maps
//! each variant onto the six-member numeric status enum callers see
//! (`Ok/Error/Param/Resource/Busy/Init/Interface`, spec.md §6); the
//! richer enum here is what the Rust-native API and `rdt-testing` use.

use std::fmt;
use std::io;

/// Library-internal error taxonomy (spec.md §7).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Argument out of range, zero bit-mask, non-contiguous mask where
    /// contiguity is required, CDP form used while CDP is disabled, or an
    /// unsupported feature toggle was requested.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The feature family itself (L3 CAT, MBA, ...) is not present on
    /// this platform.
    #[error("feature not present: {0}")]
    FeatureAbsent(String),

    /// No free COS, or no free RMID, for the requested technology set.
    #[error("no free slot available: {0}")]
    SlotExhausted(String),

    /// init-called-twice, fini-before-init, or an operation attempted
    /// before init / after fini.
    #[error("lifecycle violation: {0}")]
    Lifecycle(&'static str),

    /// The operation exists in the public API but the currently
    /// selected backend does not implement it.
    #[error("operation unsupported by the selected backend: {0}")]
    BackendMismatch(&'static str),

    /// A resctrl directory create/mkdir-class operation failed because
    /// the kernel refused (spec.md §6 `Busy`).
    #[error("resctrl group creation failed: {0}")]
    Busy(String),

    /// The requested backend could not be engaged at all (e.g. resctrl
    /// selected but `/sys/fs/resctrl` unusable, or MSR selected on a
    /// platform with no `/dev/cpu/*/msr`).
    #[error("interface unavailable: {0}")]
    Interface(String),

    /// The underlying MSR, MMIO, or resctrl filesystem call failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    pub fn bad_request(msg: impl fmt::Display) -> Self {
        Error::BadRequest(msg.to_string())
    }

    pub fn feature_absent(name: impl fmt::Display) -> Self {
        Error::FeatureAbsent(name.to_string())
    }

    pub fn slot_exhausted(msg: impl fmt::Display) -> Self {
        Error::SlotExhausted(msg.to_string())
    }

    pub fn busy(msg: impl fmt::Display) -> Self {
        Error::Busy(msg.to_string())
    }

    pub fn interface(msg: impl fmt::Display) -> Self {
        Error::Interface(msg.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// The six-member status code callers of the C ABI see (spec.md §6).
/// Kept here (rather than only in `rdt-capi`) so `rdt-core` tests can
/// assert on it directly without depending on the ABI crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum StatusCode {
    Ok = 0,
    Error = 1,
    Param = 2,
    Resource = 3,
    Busy = 4,
    Init = 5,
    Interface = 6,
}

impl From<&Error> for StatusCode {
    fn from(e: &Error) -> Self {
        match e {
            Error::BadRequest(_) => StatusCode::Param,
            Error::FeatureAbsent(_) | Error::SlotExhausted(_) => StatusCode::Resource,
            Error::Lifecycle(_) => StatusCode::Init,
            Error::BackendMismatch(_) => StatusCode::Interface,
            Error::Busy(_) => StatusCode::Busy,
            Error::Interface(_) => StatusCode::Interface,
            Error::Io(_) => StatusCode::Error,
        }
    }
}

impl From<Result<()>> for StatusCode {
    fn from(r: Result<()>) -> Self {
        match r {
            Ok(()) => StatusCode::Ok,
            Err(e) => StatusCode::from(&e),
        }
    }
}
