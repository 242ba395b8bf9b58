//! resctrl filesystem backend (spec.md §4.A/§4.D "resctrl"): drives
//! `schemata`/`cpus`/`tasks` under a `COS<n>` directory tree and
//! `mon_groups/<name>/mon_data/mon_L3_<id>/*` for monitoring.

use crate::backend::{AllocBackend, CatResource, CatValue, CatWrite, MbaResource, MonBackend, PolledCounters};
use crate::error::{Error, Result};
use crate::monitoring::GroupHandle;
use crate::resctrl::groups;
use crate::resctrl::schemata::{Kind, Schemata};
use crate::types::{CosId, Technology, WayMask};
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

fn cat_kind(resource: CatResource, cdp: Option<bool>) -> (Kind, Kind) {
    match (resource, cdp) {
        (CatResource::L3, Some(true)) => (Kind::L3Code, Kind::L3Data),
        (CatResource::L3, _) => (Kind::L3, Kind::L3),
        (CatResource::L2, Some(true)) => (Kind::L2Code, Kind::L2Data),
        (CatResource::L2, _) => (Kind::L2, Kind::L2),
    }
}

fn mba_kind(resource: MbaResource) -> Kind {
    match resource {
        MbaResource::Mba => Kind::Mb,
        MbaResource::Smba => Kind::Smba,
    }
}

pub struct ResctrlBackend {
    root: PathBuf,
    next_handle: AtomicU32,
    active: Mutex<HashMap<u32, PathBuf>>,
}

impl ResctrlBackend {
    pub fn new(root: PathBuf) -> Self {
        ResctrlBackend { root, next_handle: AtomicU32::new(1), active: Mutex::new(HashMap::new()) }
    }

    fn schemata_path(&self, cos: CosId) -> PathBuf {
        groups::cos_dir(&self.root, cos).join("schemata")
    }

    fn read_schemata(&self, cos: CosId) -> Result<Schemata> {
        let text = fs::read_to_string(self.schemata_path(cos)).map_err(Error::Io)?;
        Ok(Schemata::parse(&text))
    }

    fn write_schemata(&self, cos: CosId, s: &Schemata) -> Result<()> {
        fs::write(self.schemata_path(cos), s.format()).map_err(Error::Io)
    }

    /// Create `COS<n>` if it doesn't exist yet and seed its `schemata`
    /// from the root group's, mirroring the kernel's own behavior of
    /// populating a freshly-`mkdir`'d resctrl directory with the
    /// platform defaults rather than leaving it empty.
    fn ensure_cos_exists(&self, cos: CosId) -> Result<()> {
        groups::create_cos_dir(&self.root, cos)?;
        let path = self.schemata_path(cos);
        if !path.exists() {
            let default = fs::read_to_string(self.schemata_path(0)).unwrap_or_default();
            fs::write(path, default).map_err(Error::Io)?;
        }
        Ok(())
    }

    /// Remove any task-tracking group whose `tasks` file has gone empty
    /// (all member processes exited) and whose residual counters have
    /// decayed to at or below `max_threshold_occupancy` (spec.md's
    /// supplemented "empty-group purge" behavior). Core-tracking groups
    /// are never candidates here: an empty `tasks` file on those simply
    /// means they were never task-based, not that they were abandoned.
    /// A group still tracked in `self.active` is never purged out from
    /// under its owning `MonitoringGroup`, even if it happens to be
    /// both task-based and momentarily empty.
    pub fn reclaim_empty_groups(&self, max_threshold_occupancy: u64) -> Result<()> {
        let live: std::collections::HashSet<PathBuf> = self.active.lock().unwrap().values().cloned().collect();
        for cos in 0..64u32 {
            let dir = groups::cos_dir(&self.root, cos);
            if !dir.exists() {
                continue;
            }
            for mon_dir in groups::list_mon_groups(&dir)? {
                if live.contains(&mon_dir) {
                    continue;
                }
                let Ok(tasks) = fs::read_to_string(mon_dir.join("tasks")) else {
                    continue;
                };
                if !tasks.trim().is_empty() {
                    continue;
                }
                let l3_ids: BTreeSet<u32> = fs::read_dir(mon_dir.join("mon_data"))
                    .into_iter()
                    .flatten()
                    .filter_map(|e| e.ok())
                    .filter_map(|e| e.file_name().to_string_lossy().strip_prefix("mon_L3_").and_then(|s| s.parse().ok()))
                    .collect();
                let decayed = l3_ids.iter().all(|&id| {
                    groups::read_mon_counter(&mon_dir, id, "llc_occupancy").unwrap_or(0) <= max_threshold_occupancy
                });
                if decayed {
                    groups::remove_mon_group(&mon_dir)?;
                }
            }
        }
        Ok(())
    }
}

impl AllocBackend for ResctrlBackend {
    fn set_cat(&self, resource: CatResource, class: CosId, write: CatWrite) -> Result<()> {
        self.ensure_cos_exists(class)?;
        let mut s = self.read_schemata(class)?;
        let ids = self.l3_or_l2_ids(resource)?;
        match write {
            CatWrite::Plain(mask) => {
                let (kind, _) = cat_kind(resource, Some(false));
                for id in ids {
                    s.set(kind, id, mask.0);
                }
            }
            CatWrite::Cdp { code, data } => {
                let (code_kind, data_kind) = cat_kind(resource, Some(true));
                for id in ids {
                    s.set(code_kind, id, code.0);
                    s.set(data_kind, id, data.0);
                }
            }
        }
        self.write_schemata(class, &s)
    }

    fn get_cat(&self, resource: CatResource, class: CosId, _cdp: bool) -> Result<CatValue> {
        // Schemata keys self-describe their shape (`L3:` vs `L3CODE:`/
        // `L3DATA:`), so unlike the direct backend this doesn't need
        // the caller's capability snapshot to pick which to read.
        let s = self.read_schemata(class)?;
        let ids = self.l3_or_l2_ids(resource)?;
        let id = *ids.first().ok_or_else(|| Error::bad_request("no resource ids on this platform"))?;
        let (plain_kind, _) = cat_kind(resource, Some(false));
        if let Some(v) = s.get(plain_kind, id) {
            return Ok(CatValue::Plain(WayMask(v)));
        }
        let (code_kind, data_kind) = cat_kind(resource, Some(true));
        let code = s.get(code_kind, id).ok_or_else(|| Error::bad_request("no schemata entry for this resource id"))?;
        let data = s.get(data_kind, id).ok_or_else(|| Error::bad_request("no schemata entry for this resource id"))?;
        Ok(CatValue::Cdp { code: WayMask(code), data: WayMask(data) })
    }

    fn set_mba(
        &self,
        resource: MbaResource,
        class: CosId,
        throttle: crate::types::Throttle,
        _cap: &crate::types::MbaCapability,
    ) -> Result<()> {
        self.ensure_cos_exists(class)?;
        let mut s = self.read_schemata(class)?;
        let kind = mba_kind(resource);
        for id in self.mba_ids()? {
            s.set(kind, id, throttle.0 as u64);
        }
        self.write_schemata(class, &s)
    }

    fn get_mba(&self, resource: MbaResource, class: CosId, _cap: &crate::types::MbaCapability) -> Result<crate::types::Throttle> {
        let s = self.read_schemata(class)?;
        let kind = mba_kind(resource);
        let id = *self.mba_ids()?.first().ok_or_else(|| Error::bad_request("no MBA domains on this platform"))?;
        let v = s.get(kind, id).ok_or_else(|| Error::bad_request("no schemata entry for this resource id"))?;
        Ok(crate::types::Throttle(v as u32))
    }

    fn assoc_set_core(&self, lcore: u32, class: CosId) -> Result<()> {
        let num_cos = self.existing_cos_count(Technology::empty())?.max(class + 1);
        for cos in 1..num_cos {
            groups::create_cos_dir(&self.root, cos)?;
            if !groups::cos_dir(&self.root, cos).join("cpus").exists() {
                groups::write_cpus(&self.root, cos, &BTreeSet::new())?;
            }
        }
        groups::move_core_to_cos(&self.root, num_cos, lcore, class)
    }

    fn assoc_get_core(&self, lcore: u32) -> Result<CosId> {
        let num_cos = self.existing_cos_count(Technology::empty())?;
        for cos in 0..num_cos {
            if groups::read_cpus(&self.root, cos).unwrap_or_default().contains(&lcore) {
                return Ok(cos);
            }
        }
        Ok(0)
    }

    fn assoc_set_task(&self, pid: i32, class: CosId) -> Result<()> {
        groups::create_cos_dir(&self.root, class)?;
        groups::write_task(&self.root, class, pid)
    }

    fn existing_cos_count(&self, _tech: Technology) -> Result<u32> {
        let mut max = 1u32;
        for entry in fs::read_dir(&self.root).map_err(Error::Io)? {
            let entry = entry.map_err(Error::Io)?;
            if let Some(n) = entry.file_name().to_string_lossy().strip_prefix("COS").and_then(|s| s.parse::<u32>().ok()) {
                max = max.max(n + 1);
            }
        }
        Ok(max)
    }
}

impl ResctrlBackend {
    fn l3_or_l2_ids(&self, resource: CatResource) -> Result<Vec<u32>> {
        let dir = self.root.join("info").join(match resource {
            CatResource::L3 => "L3",
            CatResource::L2 => "L2",
        });
        self.ids_from_cbm_dir(&dir)
    }

    fn mba_ids(&self) -> Result<Vec<u32>> {
        self.ids_from_cbm_dir(&self.root.join("info").join("MB"))
    }

    /// resctrl doesn't enumerate domain ids directly; infer them from
    /// an existing schemata line rather than re-deriving topology here.
    fn ids_from_cbm_dir(&self, _dir: &std::path::Path) -> Result<Vec<u32>> {
        let s = self.read_schemata(0)?;
        let mut ids = BTreeSet::new();
        for kind in [Kind::L3, Kind::L3Code, Kind::L2, Kind::L2Code, Kind::Mb, Kind::Smba] {
            if let Some(v) = first_id(&s, kind) {
                ids.insert(v);
            }
        }
        if ids.is_empty() {
            ids.insert(0);
        }
        Ok(ids.into_iter().collect())
    }
}

fn first_id(s: &Schemata, kind: Kind) -> Option<u32> {
    (0..256).find(|&id| s.get(kind, id).is_some())
}

impl MonBackend for ResctrlBackend {
    fn start(&self, lcores: &[u32], pids: &[i32]) -> Result<GroupHandle> {
        if !lcores.is_empty() && !pids.is_empty() {
            return Err(Error::bad_request("monitoring group cannot mix cores and pids"));
        }
        let id = self.next_handle.fetch_add(1, Ordering::SeqCst);
        let name = format!("rdt-{id}");
        let cos_dir = groups::cos_dir(&self.root, 0);
        let mon_dir = groups::create_mon_group(&cos_dir, &name)?;
        if !pids.is_empty() {
            for &pid in pids {
                fs::write(mon_dir.join("tasks"), pid.to_string()).map_err(Error::Io)?;
            }
        } else {
            let set: BTreeSet<u32> = lcores.iter().copied().collect();
            fs::write(mon_dir.join("cpus"), crate::resctrl::cpumask::format(&set)).map_err(Error::Io)?;
        }
        self.active.lock().unwrap().insert(id, mon_dir);
        Ok(GroupHandle(id))
    }

    fn poll(&self, handle: &GroupHandle, l3_id: u32) -> Result<PolledCounters> {
        let active = self.active.lock().unwrap();
        let mon_dir = active.get(&handle.0).ok_or_else(|| Error::bad_request("unknown monitoring group handle"))?;
        let read = |file: &str| groups::read_mon_counter(mon_dir, l3_id, file).ok();
        Ok(PolledCounters {
            l3_occupancy: read("llc_occupancy"),
            lmem_bw: read("mbm_local_bytes"),
            tmem_bw: read("mbm_total_bytes"),
            llc_misses: None,
            llc_references: None,
            ipc: None,
        })
    }

    fn stop(&self, handle: GroupHandle) -> Result<()> {
        let mon_dir = self.active.lock().unwrap().remove(&handle.0).ok_or_else(|| Error::bad_request("unknown monitoring group handle"))?;
        groups::remove_mon_group(&mon_dir)
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

    fn reclaim_empty(&self, max_threshold_occupancy: u64) -> Result<()> {
        self.reclaim_empty_groups(max_threshold_occupancy)
    }
}
