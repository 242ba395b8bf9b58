//! Shared data model (spec.md §3): topology, capability, COS/mask/throttle
//! value types, and the association/monitoring entities.

use crate::error::{Error, Result};
use bitflags::bitflags;
use std::collections::HashMap;

/// A COS (Class of Service) index. Pure index in `[0, num_classes)` per
/// technology; COS 0 is always the default / unrestricted slot.
pub type CosId = u32;

/// An RMID (Resource Monitoring ID). Scarce, `[0, max_rmid]`, RMID 0 is
/// the default "not monitored" id.
pub type Rmid = u32;

/// An I/O RDT device channel id (spec.md §3 `ChannelAssociation`,
/// `pqos_channel_t` in the original). Opaque from the engine's point of
/// view; channel 0 is reserved and never a valid association target.
pub type ChannelId = u32;

bitflags! {
    /// Which technologies a multi-technology operation (`assign`, `reset`)
    /// spans. Mirrors spec.md S2's `technology = L3CA | MBA`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Technology: u32 {
        const L3CA = 0b0000_0001;
        const L2CA = 0b0000_0010;
        const MBA  = 0b0000_0100;
        const SMBA = 0b0000_1000;
        const MON  = 0b0001_0000;
    }
}

bitflags! {
    /// Monitoring event set (spec.md §4.F).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EventSet: u32 {
        /// LLC occupancy, point-in-time, RDT hardware (RMID) based.
        const L3_OCCUP   = 0b0000_0001;
        /// Local memory bandwidth, bytes, may wrap.
        const LMEM_BW    = 0b0000_0010;
        /// Total memory bandwidth, bytes, may wrap.
        const TMEM_BW    = 0b0000_0100;
        /// Remote memory bandwidth, bytes, may wrap (derived: total - local).
        const RMEM_BW    = 0b0000_1000;
        /// LLC misses, PMU-only.
        const LLC_MISS   = 0b0001_0000;
        /// LLC references, PMU-only.
        const LLC_REF    = 0b0010_0000;
        /// Derived IPC, PMU-only.
        const IPC        = 0b0100_0000;
    }
}

impl EventSet {
    /// PMU-only events that may only be selected alongside at least one
    /// RDT-hardware event (spec.md §4.F.1).
    pub fn pmu_only(self) -> EventSet {
        self & (EventSet::LLC_MISS | EventSet::LLC_REF | EventSet::IPC)
    }

    pub fn rdt_hardware(self) -> EventSet {
        self & (EventSet::L3_OCCUP | EventSet::LMEM_BW | EventSet::TMEM_BW | EventSet::RMEM_BW)
    }
}

/// A logical core, read-only for the library's lifetime (spec.md §3,
/// Component B).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogicalCore {
    pub lcore: u32,
    pub socket: u32,
    pub l2_id: u32,
    pub l3_id: u32,
    pub mba_id: u32,
    pub smba_id: u32,
}

/// An unsigned cache bit mask of up to `num_ways` bits.
///
/// Invariant (enforced by [`WayMask::new`]): at least one bit set, bits
/// confined to `[0, num_ways)`, and — unless the platform advertises
/// `non_contiguous_cbm_supported` — the set bits form a single run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WayMask(pub u64);

impl WayMask {
    pub fn new(bits: u64, num_ways: u32, allow_non_contiguous: bool) -> Result<Self> {
        if bits == 0 {
            return Err(Error::bad_request("way-mask must have at least one bit set"));
        }
        if num_ways < 64 && bits >= (1u64 << num_ways) {
            return Err(Error::bad_request(format!(
                "way-mask {bits:#x} has bits outside [0, {num_ways})"
            )));
        }
        if !allow_non_contiguous && !Self::is_contiguous(bits) {
            return Err(Error::bad_request(format!(
                "way-mask {bits:#x} is not a contiguous run of bits"
            )));
        }
        Ok(WayMask(bits))
    }

    fn is_contiguous(bits: u64) -> bool {
        // Adding the lowest set bit carries through a contiguous run of 1s,
        // clearing it and setting the bit above; if `bits` was one
        // contiguous run, the result shares no bits with the original.
        let lowest = bits & bits.wrapping_neg();
        bits & bits.wrapping_add(lowest) == 0
    }

    /// Number of set bits (the "width" used by the min-CBM-bits probe).
    pub fn width(&self) -> u32 {
        self.0.count_ones()
    }
}

/// A COS mask entry for L3/L2 CAT: either a plain mask, or a CDP
/// (code, data) pair when CDP is enabled for that resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CosMask {
    Plain(WayMask),
    Cdp { code: WayMask, data: WayMask },
}

impl CosMask {
    pub fn is_cdp(&self) -> bool {
        matches!(self, CosMask::Cdp { .. })
    }
}

/// An MBA/SMBA throttle value, percent-of-bandwidth (or MB/s under CTRL
/// mode) in `[0, throttle_max]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Throttle(pub u32);

impl Throttle {
    pub fn new(value: u32, throttle_max: u32) -> Result<Self> {
        if value == 0 || value > throttle_max {
            return Err(Error::bad_request(format!(
                "throttle {value} out of range [1, {throttle_max}]"
            )));
        }
        Ok(Throttle(value))
    }
}

/// Capability descriptor for L3 or L2 CAT (spec.md §3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatCapability {
    pub num_classes: u32,
    pub num_ways: u32,
    pub way_size: u64,
    pub way_contention_mask: u64,
    pub cdp_supported: bool,
    pub cdp_enabled: bool,
    /// L3 only.
    pub iordt_supported: bool,
    /// L3 only.
    pub iordt_enabled: bool,
    pub non_contiguous_cbm_supported: bool,
}

/// Capability descriptor for MBA or SMBA.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MbaCapability {
    pub num_classes: u32,
    pub throttle_max: u32,
    pub throttle_step: u32,
    pub is_linear: bool,
    pub ctrl_supported: bool,
    pub ctrl_enabled: bool,
    /// MBA only (not SMBA).
    pub mba40_supported: bool,
    pub mba40_enabled: bool,
}

/// One monitorable event: its kind, its hardware scale factor (bytes per
/// counter tick), and the largest RMID that can report it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonEventInfo {
    pub event: EventSet,
    pub scale_factor: u64,
    pub max_rmid: Rmid,
}

/// Sub-NUMA clustering mode, affects how monitoring totals are
/// aggregated (spec.md GLOSSARY "SNC").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SncMode {
    /// Counters are reported per SNC node and must be summed by the
    /// caller's chosen scope.
    Local,
    /// Counters are already aggregated across the whole package.
    Total,
}

/// Capability descriptor for the monitoring subsystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonCapability {
    pub max_rmid: Rmid,
    pub l3_size: u64,
    pub events: Vec<MonEventInfo>,
    pub snc_num: u32,
    pub snc_mode: SncMode,
    pub iordt_on: bool,
    /// Occupancy (bytes) at or below which an RMID pending reclaim, or
    /// an empty resctrl monitoring group, is considered decayed enough
    /// to reuse/delete (spec.md §4.F "decay-gated reclamation"). 0 on
    /// the direct backend, which has no kernel-side purge to gate.
    pub max_threshold_occupancy: u64,
}

/// The sum type over capability variants (spec.md §3). A target-language
/// "tagged union keyed by an enum" becomes a Rust enum carrying its
/// variant's payload, matched exhaustively (spec.md §9).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Capability {
    L3ca(CatCapability),
    L2ca(CatCapability),
    Mba(MbaCapability),
    Smba(MbaCapability),
    Mon(MonCapability),
}

/// The immutable-between-reconfigures set of capabilities discovered at
/// init (spec.md §4.C). Readers observe a consistent snapshot; only
/// `reset`/reconfigure entry points (behind the library lock) replace it
/// wholesale, per spec.md §9 "reset produces a new capability snapshot".
#[derive(Debug, Clone, Default)]
pub struct CapabilitySet {
    pub l3ca: Option<CatCapability>,
    pub l2ca: Option<CatCapability>,
    pub mba: Option<MbaCapability>,
    pub smba: Option<MbaCapability>,
    pub mon: Option<MonCapability>,
}

impl CapabilitySet {
    pub fn is_empty(&self) -> bool {
        self.l3ca.is_none()
            && self.l2ca.is_none()
            && self.mba.is_none()
            && self.smba.is_none()
            && self.mon.is_none()
    }

    pub fn num_classes(&self, tech: Technology) -> Option<u32> {
        match tech {
            Technology::L3CA => self.l3ca.as_ref().map(|c| c.num_classes),
            Technology::L2CA => self.l2ca.as_ref().map(|c| c.num_classes),
            Technology::MBA => self.mba.as_ref().map(|c| c.num_classes),
            Technology::SMBA => self.smba.as_ref().map(|c| c.num_classes),
            _ => None,
        }
    }
}

/// Map of logical core id -> COS id, one namespace per technology
/// (spec.md §3 "CoreAssociation").
#[derive(Debug, Clone, Default)]
pub struct CoreAssociation {
    pub by_tech: HashMap<Technology, HashMap<u32, CosId>>,
}

impl CoreAssociation {
    pub fn get(&self, tech: Technology, lcore: u32) -> CosId {
        self.by_tech
            .get(&tech)
            .and_then(|m| m.get(&lcore))
            .copied()
            .unwrap_or(0)
    }

    pub fn set(&mut self, tech: Technology, lcore: u32, cos: CosId) {
        self.by_tech.entry(tech).or_default().insert(lcore, cos);
    }
}

/// Counter delta semantics (spec.md §3): `(new - old) mod 2^width`.
pub fn wrapping_delta(prev: u64, cur: u64) -> u64 {
    cur.wrapping_sub(prev)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contiguous_mask_accepted() {
        assert!(WayMask::new(0b0000_1111, 8, false).is_ok());
        assert!(WayMask::new(0b0011_1100, 8, false).is_ok());
    }

    #[test]
    fn non_contiguous_mask_rejected_unless_allowed() {
        assert!(WayMask::new(0b0010_1001, 8, false).is_err());
        assert!(WayMask::new(0b0010_1001, 8, true).is_ok());
    }

    #[test]
    fn zero_mask_always_rejected() {
        assert!(WayMask::new(0, 8, true).is_err());
    }

    #[test]
    fn mask_out_of_range_rejected() {
        assert!(WayMask::new(0b1_0000_0000, 8, false).is_err());
    }

    #[test]
    fn delta_wraps_at_width() {
        assert_eq!(wrapping_delta(u64::MAX - 9, 5), 15);
    }
}
