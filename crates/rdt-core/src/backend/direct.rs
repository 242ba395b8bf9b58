//! Direct (MSR/MMIO) backend (spec.md §4.A/§4.D "direct"): programs
//! `IA32_L3_QOS_MASK_n` / `IA32_L2_QOS_MASK_n` / `IA32_MBA_MASK_n` and
//! `IA32_PQR_ASSOC` one logical core at a time via `/dev/cpu/<n>/msr`,
//! and polls occupancy/bandwidth counters through `IA32_QM_EVTSEL` /
//! `IA32_QM_CTR`.

use crate::backend::{AllocBackend, CatResource, CatValue, CatWrite, MbaResource, MonBackend, PolledCounters};
use crate::error::{Error, Result};
use crate::hw::regs::*;
use crate::hw::{msr_read, msr_rmw, msr_write};
use crate::monitoring::GroupHandle;
use crate::rmid::RmidPool;
use crate::topology::Topology;
use crate::types::{ChannelId, CosId, Rmid, Technology, WayMask};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

fn cat_base(resource: CatResource) -> u32 {
    match resource {
        CatResource::L3 => IA32_L3_QOS_MASK_BASE,
        CatResource::L2 => IA32_L2_QOS_MASK_BASE,
    }
}

fn mba_base(resource: MbaResource) -> u32 {
    match resource {
        MbaResource::Mba => IA32_MBA_MASK_BASE,
        MbaResource::Smba => AMD_SMBA_MASK_BASE,
    }
}

/// A linear platform always counts percent-of-bandwidth down from 100,
/// regardless of `throttle_max` (which only bounds how far the register
/// is allowed to clamp, per `examples/original_source/lib/allocation.c`
/// `hw_mba_set`).
const MBA_LINEAR_MAX: u32 = 100;

/// Linear throttle (percent) to register value: the register stores
/// the *delay* (spec.md §4.E.4 "linear transform"), so `value = 100 -
/// round_to_step(throttle)`, clamped to `throttle_max`.
fn throttle_to_reg(throttle: u32, throttle_max: u32, step: u32) -> u64 {
    let rounded = ((throttle + step / 2) / step) * step;
    let delay = MBA_LINEAR_MAX.saturating_sub(rounded);
    delay.min(throttle_max) as u64
}

fn reg_to_throttle(reg: u64) -> u32 {
    MBA_LINEAR_MAX.saturating_sub(reg as u32)
}

/// One L3 cluster's share of a monitoring group: the RMID allocated
/// from that cluster's pool and the member cores programmed with it.
struct ClusterBinding {
    l3_id: u32,
    rmid: Rmid,
    lcores: Vec<u32>,
}

pub struct DirectBackend {
    topology: Arc<Topology>,
    max_rmid: Rmid,
    /// One RMID pool per L3 cluster id (spec.md §3 "RMID", one
    /// namespace per monitoring domain).
    mon_pools: Mutex<HashMap<u32, RmidPool>>,
    /// RMID each core was programmed with before a group claimed it,
    /// restored on `stop` (spec.md §4.F "reassociate to RMID 0 on
    /// stop" generalized to "restore prior RMID").
    prior_rmid: Mutex<HashMap<u32, Rmid>>,
    next_handle: AtomicU32,
    /// One binding per L3 cluster a group's cores span (spec.md §4.F.2
    /// "allocate an RMID per involved L3 cluster").
    active: Mutex<HashMap<u32, Vec<ClusterBinding>>>,
    /// Per-channel COS tag (spec.md §3 `ChannelAssociation`). The device
    /// channel table itself (PCI BDF enumeration, `clos_tagging`
    /// support per channel) is out of scope here the same way the MSR
    /// address catalog is; a channel id not present was never tagged
    /// and reads back as COS 0.
    channel_cos: Mutex<HashMap<ChannelId, CosId>>,
}

impl DirectBackend {
    pub fn new(topology: Arc<Topology>, max_rmid: Rmid) -> Self {
        let mut mon_pools = HashMap::new();
        for l3_id in topology.l3cat_ids() {
            mon_pools.insert(l3_id, RmidPool::new(max_rmid));
        }
        DirectBackend {
            topology,
            max_rmid,
            mon_pools: Mutex::new(mon_pools),
            prior_rmid: Mutex::new(HashMap::new()),
            next_handle: AtomicU32::new(1),
            active: Mutex::new(HashMap::new()),
            channel_cos: Mutex::new(HashMap::new()),
        }
    }

    fn pqr_write_rmid(&self, lcore: u32, rmid: Rmid) -> Result<()> {
        msr_rmw(lcore, IA32_PQR_ASSOC, |cur| {
            (cur & !PQR_ASSOC_RMID_MASK) | (rmid as u64 & PQR_ASSOC_RMID_MASK)
        })
        .map_err(Error::Io)
    }

    fn pqr_write_cos(&self, lcore: u32, cos: CosId) -> Result<()> {
        msr_rmw(lcore, IA32_PQR_ASSOC, |cur| {
            (cur & PQR_ASSOC_RMID_MASK) | ((cos as u64) << PQR_ASSOC_RMID_BITS)
        })
        .map_err(Error::Io)
    }

    /// Read the counter for (`rmid`, `event_id`) on `lcore`. `lcore`
    /// only determines which package/L3 domain answers the read; the
    /// RMID written into `IA32_QM_EVTSEL` determines whose counter it
    /// is, so any core in the target's L3 cluster works as the
    /// reader, not just a core the group itself owns.
    fn read_qm_counter(&self, lcore: u32, rmid: Rmid, event_id: u8) -> Result<Option<u64>> {
        let evtsel = ((rmid as u64) << QM_EVTSEL_RMID_SHIFT) | event_id as u64;
        msr_write(lcore, IA32_QM_EVTSEL, evtsel).map_err(Error::Io)?;
        let ctr = msr_read(lcore, IA32_QM_CTR).map_err(Error::Io)?;
        if ctr & QM_CTR_ERROR_BIT != 0 {
            return Err(Error::interface("IA32_QM_CTR reported an error bit"));
        }
        if ctr & QM_CTR_UNAVAILABLE_BIT != 0 {
            return Ok(None);
        }
        Ok(Some(ctr & !(QM_CTR_ERROR_BIT | QM_CTR_UNAVAILABLE_BIT)))
    }
}

impl AllocBackend for DirectBackend {
    fn set_cat(&self, resource: CatResource, class: CosId, write: CatWrite) -> Result<()> {
        let base = cat_base(resource);
        for l3_id in self.topology_ids_for(resource) {
            let lcore = self.representative(resource, l3_id)?;
            match write {
                CatWrite::Plain(mask) => {
                    msr_write(lcore, base + class, mask.0).map_err(Error::Io)?;
                }
                CatWrite::Cdp { code, data } => {
                    msr_write(lcore, base + class * 2, code.0).map_err(Error::Io)?;
                    msr_write(lcore, base + class * 2 + 1, data.0).map_err(Error::Io)?;
                }
            }
        }
        Ok(())
    }

    fn get_cat(&self, resource: CatResource, class: CosId, cdp: bool) -> Result<CatValue> {
        let base = cat_base(resource);
        let ids = self.topology_ids_for(resource);
        let l3_id = *ids.first().ok_or_else(|| Error::bad_request("no clusters for resource"))?;
        let lcore = self.representative(resource, l3_id)?;
        if cdp {
            let code = msr_read(lcore, base + class * 2).map_err(Error::Io)?;
            let data = msr_read(lcore, base + class * 2 + 1).map_err(Error::Io)?;
            Ok(CatValue::Cdp { code: WayMask(code), data: WayMask(data) })
        } else {
            let mask = msr_read(lcore, base + class).map_err(Error::Io)?;
            Ok(CatValue::Plain(WayMask(mask)))
        }
    }

    fn set_mba(
        &self,
        resource: MbaResource,
        class: CosId,
        throttle: crate::types::Throttle,
        cap: &crate::types::MbaCapability,
    ) -> Result<()> {
        if !cap.is_linear {
            // Matches `examples/original_source/lib/allocation.c`
            // `hw_mba_set`: non-linear delay tables aren't modeled.
            return Err(Error::feature_absent("MBA non-linear mode is not supported on the direct backend"));
        }
        let base = mba_base(resource);
        for mba_id in self.topology_ids_for_mba(resource) {
            let lcore = self.representative_mba(resource, mba_id)?;
            msr_write(lcore, base + class, throttle_to_reg(throttle.0, cap.throttle_max, cap.throttle_step)).map_err(Error::Io)?;
        }
        Ok(())
    }

    fn get_mba(&self, resource: MbaResource, class: CosId, cap: &crate::types::MbaCapability) -> Result<crate::types::Throttle> {
        if !cap.is_linear {
            return Err(Error::feature_absent("MBA non-linear mode is not supported on the direct backend"));
        }
        let base = mba_base(resource);
        let ids = self.topology_ids_for_mba(resource);
        let mba_id = *ids.first().ok_or_else(|| Error::bad_request("no domains for resource"))?;
        let lcore = self.representative_mba(resource, mba_id)?;
        let reg = msr_read(lcore, base + class).map_err(Error::Io)?;
        Ok(crate::types::Throttle(reg_to_throttle(reg)))
    }

    fn assoc_set_core(&self, lcore: u32, class: CosId) -> Result<()> {
        self.pqr_write_cos(lcore, class)
    }

    fn assoc_get_core(&self, lcore: u32) -> Result<CosId> {
        let cur = msr_read(lcore, IA32_PQR_ASSOC).map_err(Error::Io)?;
        Ok((cur >> PQR_ASSOC_RMID_BITS) as CosId)
    }

    fn assoc_set_task(&self, _pid: i32, _class: CosId) -> Result<()> {
        Err(Error::BackendMismatch("direct backend has no task association, only core association"))
    }

    fn existing_cos_count(&self, _tech: Technology) -> Result<u32> {
        Err(Error::BackendMismatch("direct backend reports class counts via the capability set, not the backend"))
    }

    /// RMW the CDP enable bit in `L3_QOS_CFG`/`L2_QOS_CFG` on every
    /// cluster's representative core (spec.md §4.E.9 scenario S3: "for
    /// each L3 cluster, one RMW of `L3_QOS_CFG` turning on the CDP
    /// bit").
    fn set_cdp(&self, resource: CatResource, enable: bool) -> Result<()> {
        let cfg_reg = match resource {
            CatResource::L3 => IA32_L3_QOS_CFG,
            CatResource::L2 => IA32_L2_QOS_CFG,
        };
        for id in self.topology_ids_for(resource) {
            let lcore = self.representative(resource, id)?;
            msr_rmw(lcore, cfg_reg, |cur| {
                if enable {
                    cur | QOS_CFG_ENABLE_BIT
                } else {
                    cur & !QOS_CFG_ENABLE_BIT
                }
            })
            .map_err(Error::Io)?;
        }
        Ok(())
    }

    fn assoc_set_channel(&self, channel: ChannelId, class: CosId) -> Result<()> {
        if channel == 0 {
            return Err(Error::bad_request("channel 0 is reserved and cannot be tagged"));
        }
        self.channel_cos.lock().unwrap().insert(channel, class);
        Ok(())
    }

    fn assoc_get_channel(&self, channel: ChannelId) -> Result<CosId> {
        if channel == 0 {
            return Err(Error::bad_request("channel 0 is reserved and cannot be tagged"));
        }
        Ok(self.channel_cos.lock().unwrap().get(&channel).copied().unwrap_or(0))
    }

    fn reset_channels(&self) -> Result<()> {
        self.channel_cos.lock().unwrap().clear();
        Ok(())
    }

    /// RMW the MBA 4.0 enable bit in `MBA_CFG` on a representative core
    /// of every MBA domain, mirroring `set_cdp`.
    fn set_mba40(&self, enable: bool) -> Result<()> {
        for id in self.topology_ids_for_mba(MbaResource::Mba) {
            let lcore = self.representative_mba(MbaResource::Mba, id)?;
            msr_rmw(lcore, IA32_MBA_CFG, |cur| {
                if enable {
                    cur | QOS_CFG_ENABLE_BIT
                } else {
                    cur & !QOS_CFG_ENABLE_BIT
                }
            })
            .map_err(Error::Io)?;
        }
        Ok(())
    }
}

impl DirectBackend {
    fn topology_ids_for(&self, resource: CatResource) -> Vec<u32> {
        match resource {
            CatResource::L3 => self.topology.l3cat_ids().into_iter().collect(),
            CatResource::L2 => self.topology.l2_ids().into_iter().collect(),
        }
    }

    fn representative(&self, resource: CatResource, id: u32) -> Result<u32> {
        match resource {
            CatResource::L3 => self.topology.representative_l3(id),
            CatResource::L2 => self.topology.representative_l2(id),
        }
    }

    fn topology_ids_for_mba(&self, resource: MbaResource) -> Vec<u32> {
        match resource {
            MbaResource::Mba => self.topology.mba_ids().into_iter().collect(),
            MbaResource::Smba => self.topology.smba_ids().into_iter().collect(),
        }
    }

    fn representative_mba(&self, resource: MbaResource, id: u32) -> Result<u32> {
        match resource {
            MbaResource::Mba => self.topology.representative_mba(id),
            MbaResource::Smba => self.topology.representative_smba(id),
        }
    }
}

impl MonBackend for DirectBackend {
    /// Groups cores by L3 cluster and allocates one RMID per cluster
    /// they span (spec.md §4.F.2): a group that crosses socket/SNC
    /// boundaries is bound to several (cluster, RMID) pairs, not one.
    fn start(&self, lcores: &[u32], pids: &[i32]) -> Result<GroupHandle> {
        if !pids.is_empty() {
            return Err(Error::BackendMismatch("direct backend monitors logical cores, not pids"));
        }
        if lcores.is_empty() {
            return Err(Error::bad_request("monitoring group must name at least one core"));
        }
        let mut by_cluster: std::collections::BTreeMap<u32, Vec<u32>> = std::collections::BTreeMap::new();
        for &lcore in lcores {
            let l3_id = self.topology.core(lcore)?.l3_id;
            by_cluster.entry(l3_id).or_default().push(lcore);
        }

        let mut bindings = Vec::with_capacity(by_cluster.len());
        let mut prior = self.prior_rmid.lock().unwrap();
        for (l3_id, cluster_cores) in by_cluster {
            let rmid = {
                let mut pools = self.mon_pools.lock().unwrap();
                let pool = pools.entry(l3_id).or_insert_with(|| RmidPool::new(self.max_rmid));
                pool.allocate().ok_or_else(|| Error::slot_exhausted(format!("no free RMID in L3 cluster {l3_id}")))?
            };
            for &lcore in &cluster_cores {
                let cur = msr_read(lcore, IA32_PQR_ASSOC).map_err(Error::Io)?;
                prior.insert(lcore, (cur & PQR_ASSOC_RMID_MASK) as Rmid);
                self.pqr_write_rmid(lcore, rmid)?;
            }
            bindings.push(ClusterBinding { l3_id, rmid, lcores: cluster_cores });
        }

        let id = self.next_handle.fetch_add(1, Ordering::SeqCst);
        self.active.lock().unwrap().insert(id, bindings);
        Ok(GroupHandle(id))
    }

    /// Read this group's counters for one of its L3 clusters. Returns
    /// an all-`None` sample (not an error) when `l3_id` isn't one of
    /// the clusters the group's cores span, so a caller summing across
    /// every cluster in the topology doesn't need to know in advance
    /// which ones a given group actually touches.
    fn poll(&self, handle: &GroupHandle, l3_id: u32) -> Result<PolledCounters> {
        let active = self.active.lock().unwrap();
        let bindings = active.get(&handle.0).ok_or_else(|| Error::bad_request("unknown monitoring group handle"))?;
        let Some(binding) = bindings.iter().find(|b| b.l3_id == l3_id) else {
            return Ok(PolledCounters::default());
        };
        let lcore = *binding.lcores.first().ok_or_else(|| Error::bad_request("empty cluster binding"))?;
        Ok(PolledCounters {
            l3_occupancy: self.read_qm_counter(lcore, binding.rmid, QM_EVENT_L3_OCCUPANCY)?,
            tmem_bw: self.read_qm_counter(lcore, binding.rmid, QM_EVENT_TOTAL_BW)?,
            lmem_bw: self.read_qm_counter(lcore, binding.rmid, QM_EVENT_LOCAL_BW)?,
            llc_misses: None,
            llc_references: None,
            ipc: None,
        })
    }

    fn stop(&self, handle: GroupHandle) -> Result<()> {
        let bindings = self
            .active
            .lock()
            .unwrap()
            .remove(&handle.0)
            .ok_or_else(|| Error::bad_request("unknown monitoring group handle"))?;
        let mut prior = self.prior_rmid.lock().unwrap();
        let mut pools = self.mon_pools.lock().unwrap();
        for binding in bindings {
            for lcore in binding.lcores {
                let restore = prior.remove(&lcore).unwrap_or(0);
                self.pqr_write_rmid(lcore, restore)?;
            }
            pools.entry(binding.l3_id).or_insert_with(|| RmidPool::new(self.max_rmid)).release_pending(binding.rmid);
        }
        Ok(())
    }

    fn reset(&self) -> Result<()> {
        let handles: Vec<u32> = self.active.lock().unwrap().keys().copied().collect();
        for id in handles {
            self.stop(GroupHandle(id))?;
        }
        Ok(())
    }

    fn active_count(&self) -> usize {
        self.active.lock().unwrap().len()
    }

    /// Poll each cluster's `pending_decay` RMIDs for residual L3
    /// occupancy and return any that have decayed to or below
    /// `max_threshold_occupancy` to that cluster's free pool (spec.md
    /// §4.F.3 "empty group purge" / rmid.rs's `free -> pending_decay ->
    /// free` state machine).
    fn reclaim_empty(&self, max_threshold_occupancy: u64) -> Result<()> {
        let l3_ids: Vec<u32> = self.mon_pools.lock().unwrap().keys().copied().collect();
        for l3_id in l3_ids {
            let pending = {
                let pools = self.mon_pools.lock().unwrap();
                pools.get(&l3_id).map(|p| p.pending_rmids()).unwrap_or_default()
            };
            if pending.is_empty() {
                continue;
            }
            let lcore = self.representative(CatResource::L3, l3_id)?;
            for rmid in pending {
                let occupancy = self.read_qm_counter(lcore, rmid, QM_EVENT_L3_OCCUPANCY)?.unwrap_or(0);
                if let Some(pool) = self.mon_pools.lock().unwrap().get_mut(&l3_id) {
                    pool.reclaim_if_decayed(rmid, occupancy, max_threshold_occupancy);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LogicalCore;

    fn backend() -> DirectBackend {
        let topo = Arc::new(Topology::new(vec![LogicalCore { lcore: 0, socket: 0, l2_id: 0, l3_id: 0, mba_id: 0, smba_id: 0 }]));
        DirectBackend::new(topo, 8)
    }

    #[test]
    fn channel_zero_is_rejected() {
        let b = backend();
        assert!(b.assoc_set_channel(0, 1).is_err());
        assert!(b.assoc_get_channel(0).is_err());
    }

    #[test]
    fn untagged_channel_reads_back_as_cos_zero() {
        let b = backend();
        assert_eq!(b.assoc_get_channel(5).unwrap(), 0);
    }

    #[test]
    fn channel_tag_round_trips_and_clears_on_reset() {
        let b = backend();
        b.assoc_set_channel(5, 3).unwrap();
        assert_eq!(b.assoc_get_channel(5).unwrap(), 3);
        b.reset_channels().unwrap();
        assert_eq!(b.assoc_get_channel(5).unwrap(), 0);
    }

    #[test]
    fn linear_throttle_round_trips_through_register_encoding() {
        assert_eq!(throttle_to_reg(90, 100, 10), 10);
        assert_eq!(reg_to_throttle(10), 90);
    }

    #[test]
    fn throttle_to_reg_clamps_to_platform_throttle_max() {
        // A platform whose delay register tops out at 80 still counts
        // percent-of-bandwidth down from 100, so requesting 0% (full
        // throttle) clamps to the platform's max delay, not 100.
        assert_eq!(throttle_to_reg(0, 80, 1), 80);
    }
}
