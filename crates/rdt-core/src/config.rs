//! Init-time configuration (spec.md §4.D "interface selection",
//! §4.E.9 "reset configuration"): which backend to use and how to
//! reset CDP/I/O-RDT/MBA-CTRL/MBA4.0 state at init.

use crate::error::{Error, Result};
use std::path::PathBuf;

/// A three-way on/off/leave-as-is switch (spec.md §4.E.9): `Any`
/// leaves the platform's current setting alone, matching the default
/// behavior of not forcing a particular CDP/I-O-RDT/MBA mode at init.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Tristate {
    #[default]
    Any,
    On,
    Off,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceChoice {
    Msr,
    Resctrl,
}

impl InterfaceChoice {
    /// Resolve which backend to use: an explicit `RDT_IFACE` env var
    /// (spec.md §6: `OS`, `MSR`, or `MMIO` — `OS` selects resctrl,
    /// `MSR`/`MMIO` both select the direct backend, since Component A
    /// treats MSR and MMIO access as one backend with two register
    /// spaces) wins over `config.interface`, which wins over
    /// auto-detection by whether `/sys/fs/resctrl` looks usable
    /// (spec.md §4.D).
    pub fn select(config: &RdtConfig) -> Result<Self> {
        if let Ok(val) = std::env::var("RDT_IFACE") {
            return match val.to_ascii_uppercase().as_str() {
                "OS" => Ok(InterfaceChoice::Resctrl),
                "MSR" | "MMIO" => Ok(InterfaceChoice::Msr),
                other => Err(Error::bad_request(format!("RDT_IFACE={other} is not one of OS, MSR, MMIO"))),
            };
        }
        if let Some(choice) = config.interface {
            return Ok(choice);
        }
        let root = config.resctrl_root.clone().unwrap_or_else(|| PathBuf::from("/sys/fs/resctrl"));
        if root.exists() {
            Ok(InterfaceChoice::Resctrl)
        } else {
            Ok(InterfaceChoice::Msr)
        }
    }
}

/// Reset-time feature toggles (spec.md §4.E.9): each independently
/// `Any`/`On`/`Off`. On the resctrl backend, toggling `l3_cdp`/`l2_cdp`/
/// `mba_ctrl`/`smba_ctrl` away from `Any` requires an unmount/remount of
/// the resctrl filesystem; `mba40` is a direct-backend-only register
/// flip and rejects with `BackendMismatch` there.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResetConfig {
    pub l3_cdp: Tristate,
    pub l2_cdp: Tristate,
    pub l3_iordt: Tristate,
    pub mba_ctrl: Tristate,
    pub smba_ctrl: Tristate,
    pub mba40: Tristate,
}

#[derive(Debug, Clone, Default)]
pub struct RdtConfig {
    pub interface: Option<InterfaceChoice>,
    pub resctrl_root: Option<PathBuf>,
    pub reset: ResetConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_config_choice_wins_over_autodetect() {
        std::env::remove_var("RDT_IFACE");
        let config = RdtConfig { interface: Some(InterfaceChoice::Msr), ..Default::default() };
        assert_eq!(InterfaceChoice::select(&config).unwrap(), InterfaceChoice::Msr);
    }

    #[test]
    fn missing_resctrl_root_falls_back_to_msr() {
        std::env::remove_var("RDT_IFACE");
        let config = RdtConfig { resctrl_root: Some(PathBuf::from("/no/such/path")), ..Default::default() };
        assert_eq!(InterfaceChoice::select(&config).unwrap(), InterfaceChoice::Msr);
    }
}
