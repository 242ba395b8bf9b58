//! Capability discovery (spec.md §4.C, Component C).
//!
//! Discovery is the exclusive writer of [`CapabilitySet`]; after init,
//! only reconfigure entry points mutate it, and they do so by re-running
//! [`discover_direct`]/[`discover_resctrl`] wholesale against the live
//! hardware/kernel (see `allocation::reset`, which tears the `Context`
//! down and rebuilds it) rather than patching the cached struct in
//! place — matching spec.md §9's "reset produces a new capability
//! snapshot; context swaps to the new snapshot atomically".
//!
//! Two discovery paths exist, one per backend:
//! - [`discover_direct`] probes CPUID leaves 0x10 (allocation) and 0x0F
//!   (monitoring), behind a [`CpuidSource`] seam so tests can supply a
//!   canned table instead of real hardware.
//! - [`discover_resctrl`] reads `/sys/fs/resctrl/info/*`.

use crate::types::{CatCapability, CapabilitySet, EventSet, MbaCapability, MonCapability, MonEventInfo, SncMode};
use std::fs;
use std::path::Path;

/// Per-feature outcome of a probe: detected, or absent. A *fatal* I/O
/// error (e.g. `/sys/fs/resctrl` exists but is unreadable due to a
/// permissions problem, not "file not found") is reported separately by
/// the caller; this type only distinguishes "present" from "simply not
/// supported" (spec.md §4.C failure semantics).
pub enum Probe<T> {
    Present(T),
    Absent,
}

/// Raw (eax, ebx, ecx, edx) CPUID leaf source, abstracted so capability
/// discovery is testable without real hardware.
pub trait CpuidSource {
    fn cpuid(&self, leaf: u32, subleaf: u32) -> (u32, u32, u32, u32);
}

/// The real CPUID instruction, x86_64 only.
#[derive(Debug, Default, Clone, Copy)]
pub struct RealCpuid;

#[cfg(target_arch = "x86_64")]
impl CpuidSource for RealCpuid {
    fn cpuid(&self, leaf: u32, subleaf: u32) -> (u32, u32, u32, u32) {
        // SAFETY: CPUID is always available on x86_64; `__cpuid_count`
        // is a plain instruction wrapper with no preconditions.
        let r = unsafe { std::arch::x86_64::__cpuid_count(leaf, subleaf) };
        (r.eax, r.ebx, r.ecx, r.edx)
    }
}

#[cfg(not(target_arch = "x86_64"))]
impl CpuidSource for RealCpuid {
    fn cpuid(&self, _leaf: u32, _subleaf: u32) -> (u32, u32, u32, u32) {
        (0, 0, 0, 0)
    }
}

/// CPUID leaf 0x10 sub-leaf layout: `eax` low bits = `cbm_len - 1`,
/// `ebx` = contention bitmap, `ecx` bit 2 = CDP supported (L3/L2 only),
/// `edx` low bits = `cos_max`.
fn cat_from_leaf10(cpuid: &dyn CpuidSource, subleaf: u32) -> Option<CatCapability> {
    let (eax, ebx, ecx, edx) = cpuid.cpuid(0x10, subleaf);
    if eax == 0 && ebx == 0 && edx == 0 {
        return None;
    }
    let num_ways = (eax & 0x1f) + 1;
    let cdp_supported = ecx & 0b100 != 0;
    let num_classes = (edx & 0xffff) + 1;
    Some(CatCapability {
        num_classes,
        num_ways,
        way_size: 0,
        way_contention_mask: ebx as u64,
        cdp_supported,
        cdp_enabled: false,
        iordt_supported: false,
        iordt_enabled: false,
        non_contiguous_cbm_supported: false,
    })
}

fn mba_from_leaf10(cpuid: &dyn CpuidSource, subleaf: u32) -> Option<MbaCapability> {
    let (eax, _ebx, ecx, edx) = cpuid.cpuid(0x10, subleaf);
    if eax == 0 && edx == 0 {
        return None;
    }
    let throttle_max = (eax & 0xfff) + 1;
    let is_linear = ecx & 0b100 != 0;
    let num_classes = (edx & 0xffff) + 1;
    Some(MbaCapability {
        num_classes,
        throttle_max,
        throttle_step: 1,
        is_linear,
        ctrl_supported: false,
        ctrl_enabled: false,
        mba40_supported: false,
        mba40_enabled: false,
    })
}

/// Number of sub-NUMA clusters per package, from CPUID leaf 0x1F's (V2
/// Extended Topology Enumeration) level hierarchy: the ratio of
/// logical processors counted at the package level to those counted
/// at the Die level (level type 5) — Intel SDM Vol. 3A §8.9.4. A
/// platform with no Die level, or whose Die count doesn't divide the
/// package count, has no sub-NUMA clustering (`1`).
fn snc_num_from_leaf1f(cpuid: &dyn CpuidSource) -> u32 {
    const LEVEL_TYPE_DIE: u32 = 5;
    let mut die_processors = None;
    let mut package_processors = 0u32;
    for subleaf in 0..8 {
        let (_eax, ebx, ecx, _edx) = cpuid.cpuid(0x1F, subleaf);
        let level_processors = ebx & 0xffff;
        if level_processors == 0 {
            break;
        }
        let level_type = (ecx >> 8) & 0xff;
        if level_type == LEVEL_TYPE_DIE {
            die_processors = Some(level_processors);
        }
        package_processors = level_processors;
    }
    match die_processors {
        Some(die) if die > 0 && package_processors % die == 0 => package_processors / die,
        _ => 1,
    }
}

fn mon_from_leaf0f(cpuid: &dyn CpuidSource) -> Option<MonCapability> {
    let (_eax, ebx, _ecx, _edx) = cpuid.cpuid(0x0F, 0);
    if ebx == 0 {
        return None;
    }
    let max_rmid = ebx;
    let (_eax1, _ebx1, _ecx1, edx1) = cpuid.cpuid(0x0F, 1);
    let mut events = Vec::new();
    if edx1 & 0b0010 != 0 {
        events.push(MonEventInfo { event: EventSet::L3_OCCUP, scale_factor: 1, max_rmid });
    }
    if edx1 & 0b0100 != 0 {
        events.push(MonEventInfo { event: EventSet::TMEM_BW, scale_factor: 1, max_rmid });
    }
    if edx1 & 0b1000 != 0 {
        events.push(MonEventInfo { event: EventSet::LMEM_BW, scale_factor: 1, max_rmid });
    }
    let snc_num = snc_num_from_leaf1f(cpuid);
    Some(MonCapability {
        max_rmid,
        l3_size: 0,
        events,
        snc_num,
        snc_mode: if snc_num > 1 { SncMode::Local } else { SncMode::Total },
        iordt_on: false,
        max_threshold_occupancy: 0,
    })
}

/// Probe the platform for the direct (MSR/MMIO) backend via CPUID.
/// Fails (returns an empty set) only if nothing at all was detected
/// (spec.md §4.C: "init fails only if no feature was detected at all").
pub fn discover_direct(cpuid: &dyn CpuidSource) -> CapabilitySet {
    let mut caps = CapabilitySet {
        l3ca: cat_from_leaf10(cpuid, 1),
        l2ca: cat_from_leaf10(cpuid, 2),
        mba: mba_from_leaf10(cpuid, 3),
        smba: None,
        mon: mon_from_leaf0f(cpuid),
    };
    // I/O RDT presence is read from `structured extended feature flags`
    // (leaf 7); kept as a narrow, separate probe per spec.md's "opaque
    // constant table" treatment of exact bit positions.
    let (_eax, ebx, _ecx, _edx) = cpuid.cpuid(0x07, 0);
    if let Some(l3) = caps.l3ca.as_mut() {
        l3.iordt_supported = ebx & (1 << 22) != 0;
    }
    caps
}

fn read_u64(path: &Path) -> Option<u64> {
    fs::read_to_string(path).ok().and_then(|s| s.trim().parse().ok())
}

fn read_hex(path: &Path) -> Option<u64> {
    fs::read_to_string(path)
        .ok()
        .and_then(|s| u64::from_str_radix(s.trim(), 16).ok())
}

fn read_str(path: &Path) -> Option<String> {
    fs::read_to_string(path).ok().map(|s| s.trim().to_string())
}

/// Probe the platform for the resctrl backend via `/sys/fs/resctrl/info`.
/// `root` is normally `/sys/fs/resctrl`; tests point it at a tempdir
/// populated to look like one. `num_l3_clusters` is the physical L3
/// cache count from topology, used to detect sub-NUMA clustering.
pub fn discover_resctrl(root: &Path, num_l3_clusters: u32) -> CapabilitySet {
    let info = root.join("info");
    let l3ca = discover_resctrl_cat(&info.join("L3"));
    let l2ca = discover_resctrl_cat(&info.join("L2"));
    let mba = discover_resctrl_mba(&info.join("MB"));
    let mon = discover_resctrl_mon(&info.join("L3_MON"), root, num_l3_clusters);
    CapabilitySet { l3ca, l2ca, mba, smba: None, mon }
}

fn discover_resctrl_cat(dir: &Path) -> Option<CatCapability> {
    let cbm_mask = read_hex(&dir.join("cbm_mask"))?;
    let num_ways = 64 - cbm_mask.leading_zeros();
    let num_classes = read_u64(&dir.join("num_closids")).unwrap_or(0) as u32;
    let shareable_bits = read_hex(&dir.join("shareable_bits")).unwrap_or(0);
    let non_contiguous_cbm_supported =
        fs::read_to_string(dir.join("cbm_type")).map(|s| s.contains("non-contiguous")).unwrap_or(false);
    Some(CatCapability {
        num_classes,
        num_ways,
        way_size: 0,
        way_contention_mask: shareable_bits,
        cdp_supported: dir.join("cdp_enabled").exists() || dir.parent().map(|p| p.join("L3CODE").exists()).unwrap_or(false),
        cdp_enabled: false,
        iordt_supported: dir.file_name().map(|n| n == "L3").unwrap_or(false) && dir.join("io_alloc").exists(),
        iordt_enabled: false,
        non_contiguous_cbm_supported,
    })
}

fn discover_resctrl_mba(dir: &Path) -> Option<MbaCapability> {
    let throttle_max = read_u64(&dir.join("bandwidth_gran")).map(|_| 100).unwrap_or(100) as u32;
    let throttle_step = read_u64(&dir.join("bandwidth_gran")).unwrap_or(1) as u32;
    let num_classes = read_u64(&dir.join("num_closids")).unwrap_or(0) as u32;
    if num_classes == 0 {
        return None;
    }
    let is_linear = read_u64(&dir.join("delay_linear")).unwrap_or(1) == 1;
    Some(MbaCapability {
        num_classes,
        throttle_max,
        throttle_step: throttle_step.max(1),
        is_linear,
        ctrl_supported: true,
        ctrl_enabled: false,
        mba40_supported: false,
        mba40_enabled: false,
    })
}

/// Number of monitoring-domain directories (`mon_L3_<id>`) under the
/// root's `mon_data`: on an SNC-enabled platform the kernel exposes
/// more monitoring domains than there are physical L3 caches, one per
/// sub-NUMA node, so the ratio to `num_l3_clusters` is the clustering
/// factor.
fn count_mon_l3_domains(root: &Path) -> u32 {
    let Ok(entries) = fs::read_dir(root.join("mon_data")) else {
        return 0;
    };
    entries
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with("mon_L3_"))
        .count() as u32
}

fn discover_resctrl_mon(dir: &Path, root: &Path, num_l3_clusters: u32) -> Option<MonCapability> {
    let max_rmid = read_u64(&dir.join("num_rmids"))? as u32;
    let max_threshold_occupancy = read_u64(&dir.join("max_threshold_occupancy")).unwrap_or(0);
    let mon_features = read_str(&dir.join("mon_features")).unwrap_or_default();
    let mut events = Vec::new();
    if mon_features.contains("llc_occupancy") {
        events.push(MonEventInfo { event: EventSet::L3_OCCUP, scale_factor: 1, max_rmid });
    }
    if mon_features.contains("mbm_total_bytes") {
        events.push(MonEventInfo { event: EventSet::TMEM_BW, scale_factor: 1, max_rmid });
    }
    if mon_features.contains("mbm_local_bytes") {
        events.push(MonEventInfo { event: EventSet::LMEM_BW, scale_factor: 1, max_rmid });
    }
    let domains = count_mon_l3_domains(root);
    let snc_num = if num_l3_clusters > 0 && domains > num_l3_clusters { domains / num_l3_clusters } else { 1 };
    Some(MonCapability {
        max_rmid,
        l3_size: 0,
        events,
        snc_num,
        snc_mode: if snc_num > 1 { SncMode::Local } else { SncMode::Total },
        iordt_on: false,
        max_threshold_occupancy,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct FakeCpuid(HashMap<(u32, u32), (u32, u32, u32, u32)>);

    impl CpuidSource for FakeCpuid {
        fn cpuid(&self, leaf: u32, subleaf: u32) -> (u32, u32, u32, u32) {
            self.0.get(&(leaf, subleaf)).copied().unwrap_or((0, 0, 0, 0))
        }
    }

    #[test]
    fn l3_cat_detected_from_leaf_10_subleaf_1() {
        let mut m = HashMap::new();
        // num_ways=8 (eax low5 = 7), cdp supported (ecx bit2), cos_max=3 (edx low16)
        m.insert((0x10, 1), (7, 0xff, 0b100, 3));
        let caps = discover_direct(&FakeCpuid(m));
        let l3 = caps.l3ca.unwrap();
        assert_eq!(l3.num_ways, 8);
        assert_eq!(l3.num_classes, 4);
        assert!(l3.cdp_supported);
    }

    #[test]
    fn absent_feature_yields_none() {
        let caps = discover_direct(&FakeCpuid(HashMap::new()));
        assert!(caps.l3ca.is_none());
        assert!(caps.mon.is_none());
    }

    #[test]
    fn resctrl_cat_reads_sysfs_shaped_tree() {
        let dir = tempfile::tempdir().unwrap();
        let l3 = dir.path().join("info/L3");
        fs::create_dir_all(&l3).unwrap();
        fs::write(l3.join("cbm_mask"), "ff\n").unwrap();
        fs::write(l3.join("num_closids"), "16\n").unwrap();
        fs::write(l3.join("shareable_bits"), "0\n").unwrap();
        let caps = discover_resctrl(dir.path(), 1);
        let l3cap = caps.l3ca.unwrap();
        assert_eq!(l3cap.num_ways, 8);
        assert_eq!(l3cap.num_classes, 16);
    }

    #[test]
    fn resctrl_mon_with_one_domain_per_l3_is_total_mode() {
        let dir = tempfile::tempdir().unwrap();
        let mon = dir.path().join("info/L3_MON");
        fs::create_dir_all(&mon).unwrap();
        fs::write(mon.join("num_rmids"), "32\n").unwrap();
        fs::create_dir_all(dir.path().join("mon_data/mon_L3_00")).unwrap();
        let caps = discover_resctrl(dir.path(), 1);
        let mon_cap = caps.mon.unwrap();
        assert_eq!(mon_cap.snc_num, 1);
        assert_eq!(mon_cap.snc_mode, SncMode::Total);
    }

    #[test]
    fn resctrl_mon_with_extra_domains_per_l3_is_snc_local() {
        let dir = tempfile::tempdir().unwrap();
        let mon = dir.path().join("info/L3_MON");
        fs::create_dir_all(&mon).unwrap();
        fs::write(mon.join("num_rmids"), "32\n").unwrap();
        for id in 0..4 {
            fs::create_dir_all(dir.path().join(format!("mon_data/mon_L3_{id:02}"))).unwrap();
        }
        // 4 monitoring domains over 2 physical L3 caches: 2 SNC nodes each.
        let caps = discover_resctrl(dir.path(), 2);
        let mon_cap = caps.mon.unwrap();
        assert_eq!(mon_cap.snc_num, 2);
        assert_eq!(mon_cap.snc_mode, SncMode::Local);
    }

    #[test]
    fn snc_num_from_leaf1f_reads_die_vs_package_ratio() {
        let mut m = HashMap::new();
        // subleaf 0: SMT level, 2 threads per core (ecx type = 1)
        m.insert((0x1F, 0), (0, 2, 1 << 8, 0));
        // subleaf 1: Die level, 8 logical processors per die (ecx type = 5)
        m.insert((0x1F, 1), (0, 8, 5 << 8, 0));
        // subleaf 2: package level, 16 logical processors total (ecx type = 6, "invalid" stop marker not hit since nonzero)
        m.insert((0x1F, 2), (0, 16, 6 << 8, 0));
        assert_eq!(snc_num_from_leaf1f(&FakeCpuid(m)), 2);
    }

    #[test]
    fn snc_num_from_leaf1f_defaults_to_one_without_a_die_level() {
        let mut m = HashMap::new();
        m.insert((0x1F, 0), (0, 2, 1 << 8, 0));
        assert_eq!(snc_num_from_leaf1f(&FakeCpuid(m)), 1);
    }
}
