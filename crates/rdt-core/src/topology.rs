//! Topology inventory (spec.md §4.B, Component B): an immutable
//! descriptor of all logical cores built once at init, with lookups by
//! core id and by cluster/domain id at each level.

use crate::error::{Error, Result};
use crate::types::LogicalCore;
use std::collections::BTreeSet;
use std::fs;

/// Immutable topology snapshot, owned by the library [`crate::Context`]
/// for its lifetime.
#[derive(Debug, Clone)]
pub struct Topology {
    cores: Vec<LogicalCore>,
}

impl Topology {
    pub fn new(cores: Vec<LogicalCore>) -> Self {
        Topology { cores }
    }

    /// Discover topology from `/sys/devices/system/cpu/cpu*` (real
    /// deployments) — falls back to a single-core, single-domain
    /// topology if the sysfs tree is unreadable (e.g. in a container
    /// without `/sys` mounted), so that init degrades rather than
    /// fails outright.
    pub fn discover() -> Self {
        match Self::discover_from_sysfs() {
            Ok(t) if !t.cores.is_empty() => t,
            _ => Topology {
                cores: vec![LogicalCore {
                    lcore: 0,
                    socket: 0,
                    l2_id: 0,
                    l3_id: 0,
                    mba_id: 0,
                    smba_id: 0,
                }],
            },
        }
    }

    fn discover_from_sysfs() -> std::io::Result<Self> {
        let mut cores = Vec::new();
        for entry in fs::read_dir("/sys/devices/system/cpu")? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let Some(num) = name.strip_prefix("cpu").and_then(|s| s.parse::<u32>().ok()) else {
                continue;
            };
            let base = entry.path().join("topology");
            let read_id = |file: &str| -> u32 {
                fs::read_to_string(base.join(file))
                    .ok()
                    .and_then(|s| s.trim().parse().ok())
                    .unwrap_or(0)
            };
            cores.push(LogicalCore {
                lcore: num,
                socket: read_id("physical_package_id"),
                l2_id: read_id("core_id"),
                l3_id: read_id("physical_package_id"),
                mba_id: read_id("physical_package_id"),
                smba_id: read_id("physical_package_id"),
            });
        }
        cores.sort_by_key(|c| c.lcore);
        Ok(Topology { cores })
    }

    pub fn core(&self, lcore: u32) -> Result<&LogicalCore> {
        self.cores
            .iter()
            .find(|c| c.lcore == lcore)
            .ok_or_else(|| Error::bad_request(format!("no such logical core {lcore}")))
    }

    pub fn all_cores(&self) -> &[LogicalCore] {
        &self.cores
    }

    pub fn sockets(&self) -> BTreeSet<u32> {
        self.cores.iter().map(|c| c.socket).collect()
    }

    pub fn l2_ids(&self) -> BTreeSet<u32> {
        self.cores.iter().map(|c| c.l2_id).collect()
    }

    pub fn l3cat_ids(&self) -> BTreeSet<u32> {
        self.cores.iter().map(|c| c.l3_id).collect()
    }

    pub fn mba_ids(&self) -> BTreeSet<u32> {
        self.cores.iter().map(|c| c.mba_id).collect()
    }

    pub fn smba_ids(&self) -> BTreeSet<u32> {
        self.cores.iter().map(|c| c.smba_id).collect()
    }

    pub fn cores_in_l3(&self, l3_id: u32) -> Vec<u32> {
        self.cores.iter().filter(|c| c.l3_id == l3_id).map(|c| c.lcore).collect()
    }

    pub fn cores_in_l2(&self, l2_id: u32) -> Vec<u32> {
        self.cores.iter().filter(|c| c.l2_id == l2_id).map(|c| c.lcore).collect()
    }

    pub fn cores_in_mba(&self, mba_id: u32) -> Vec<u32> {
        self.cores.iter().filter(|c| c.mba_id == mba_id).map(|c| c.lcore).collect()
    }

    pub fn cores_in_smba(&self, smba_id: u32) -> Vec<u32> {
        self.cores.iter().filter(|c| c.smba_id == smba_id).map(|c| c.lcore).collect()
    }

    /// Pick one representative core for a resource id: deterministically
    /// the lowest core id in the cluster/domain (spec.md §4.B invariant).
    /// Writes to a COS register apply cluster-wide, so one write per
    /// cluster — issued on this core — suffices.
    pub fn representative_l3(&self, l3_id: u32) -> Result<u32> {
        self.cores_in_l3(l3_id)
            .into_iter()
            .min()
            .ok_or_else(|| Error::bad_request(format!("no cores in L3 cluster {l3_id}")))
    }

    pub fn representative_l2(&self, l2_id: u32) -> Result<u32> {
        self.cores_in_l2(l2_id)
            .into_iter()
            .min()
            .ok_or_else(|| Error::bad_request(format!("no cores in L2 cluster {l2_id}")))
    }

    pub fn representative_mba(&self, mba_id: u32) -> Result<u32> {
        self.cores_in_mba(mba_id)
            .into_iter()
            .min()
            .ok_or_else(|| Error::bad_request(format!("no cores in MBA domain {mba_id}")))
    }

    pub fn representative_smba(&self, smba_id: u32) -> Result<u32> {
        self.cores_in_smba(smba_id)
            .into_iter()
            .min()
            .ok_or_else(|| Error::bad_request(format!("no cores in SMBA domain {smba_id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Topology {
        Topology::new(vec![
            LogicalCore { lcore: 0, socket: 0, l2_id: 0, l3_id: 0, mba_id: 0, smba_id: 0 },
            LogicalCore { lcore: 1, socket: 0, l2_id: 0, l3_id: 0, mba_id: 0, smba_id: 0 },
            LogicalCore { lcore: 2, socket: 0, l2_id: 1, l3_id: 0, mba_id: 0, smba_id: 0 },
            LogicalCore { lcore: 3, socket: 1, l2_id: 2, l3_id: 1, mba_id: 1, smba_id: 1 },
            LogicalCore { lcore: 4, socket: 1, l2_id: 2, l3_id: 1, mba_id: 1, smba_id: 1 },
        ])
    }

    #[test]
    fn representative_core_is_lowest_id_in_cluster() {
        let topo = sample();
        assert_eq!(topo.representative_l3(0).unwrap(), 0);
        assert_eq!(topo.representative_l3(1).unwrap(), 3);
    }

    #[test]
    fn unique_ids_at_each_level() {
        let topo = sample();
        assert_eq!(topo.sockets().len(), 2);
        assert_eq!(topo.l3cat_ids().len(), 2);
        assert_eq!(topo.l2_ids().len(), 3);
    }

    #[test]
    fn unknown_core_is_an_error() {
        assert!(sample().core(99).is_err());
    }
}
