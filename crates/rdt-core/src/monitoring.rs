//! Monitoring engine (spec.md §4.F, Component F): validates event
//! sets, starts/polls/stops monitoring groups, sums per-L3-cluster
//! samples for groups that span more than one cluster, and derives
//! wrapped deltas (and IPC, where PMU counters back it) from the
//! aggregate.
//!
//! A monitoring group is a move-only handle with a `valid` sentinel
//! (spec.md §9 "move-on-stop handle type... instead of a magic-number
//! guard"): once `stop`ped it cannot be polled again, enforced at the
//! type level rather than by checking a live/dead flag on every call.

use crate::backend::{MonBackend, PolledCounters};
use crate::error::{Error, Result};
use crate::types::{wrapping_delta, EventSet, MonCapability};
use std::sync::Arc;

/// Opaque per-backend handle identifying one active monitoring group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GroupHandle(pub u32);

/// What a monitoring group watches: a set of logical cores (direct
/// backend) or a set of process ids (resctrl backend), never both.
#[derive(Debug, Clone)]
pub enum MonTarget {
    Cores(Vec<u32>),
    Pids(Vec<i32>),
}

/// One poll's worth of derived values, `None` for events not in the
/// group's [`EventSet`] or not supported by the platform.
#[derive(Debug, Clone, Copy, Default)]
pub struct MonValues {
    pub l3_occupancy_bytes: Option<u64>,
    pub lmem_bw_bytes: Option<u64>,
    pub tmem_bw_bytes: Option<u64>,
    pub rmem_bw_bytes: Option<u64>,
    pub ipc: Option<f64>,
}

/// Validate that PMU-only events (`LLC_MISS`, `LLC_REF`, `IPC`) are
/// only requested alongside at least one RDT-hardware event (spec.md
/// §4.F.1 edge case).
pub fn validate_events(events: EventSet, cap: &MonCapability) -> Result<()> {
    if events.is_empty() {
        return Err(Error::bad_request("monitoring group must select at least one event"));
    }
    if !events.pmu_only().is_empty() && events.rdt_hardware().is_empty() {
        return Err(Error::bad_request(
            "PMU-only events (LLC_MISS/LLC_REF/IPC) require at least one RDT-hardware event in the same group",
        ));
    }
    let supported: EventSet = cap.events.iter().map(|e| e.event).fold(EventSet::empty(), |a, b| a | b);
    if !(events.rdt_hardware() & !supported).is_empty() {
        return Err(Error::feature_absent("requested monitoring event not supported on this platform"));
    }
    Ok(())
}

/// Sum per-cluster samples into one aggregate (spec.md §4.F.3
/// "Occupancy: sum across clusters (point value). Bandwidth counters:
/// sum across clusters"). A field is `None` only when every cluster
/// reported `None` for it; a cluster that came back `None` while
/// another reported a value contributes `0` rather than poisoning the
/// whole sum, since "event not visible this poll" (the kernel having
/// momentarily moved a sub-group) is expected to be transient.
fn sum_polled(samples: &[PolledCounters]) -> PolledCounters {
    fn sum_field(samples: &[PolledCounters], get: impl Fn(&PolledCounters) -> Option<u64>) -> Option<u64> {
        if samples.iter().all(|s| get(s).is_none()) {
            return None;
        }
        Some(samples.iter().filter_map(|s| get(s)).sum())
    }
    PolledCounters {
        l3_occupancy: sum_field(samples, |s| s.l3_occupancy),
        lmem_bw: sum_field(samples, |s| s.lmem_bw),
        tmem_bw: sum_field(samples, |s| s.tmem_bw),
        llc_misses: sum_field(samples, |s| s.llc_misses),
        llc_references: sum_field(samples, |s| s.llc_references),
        ipc: samples.iter().find_map(|s| s.ipc),
    }
}

/// A live monitoring group. `stop` consumes `self`; there is no way to
/// poll or stop it twice because the value no longer exists after
/// `stop` returns (the "move-on-stop" idiom replacing a validity flag).
pub struct MonitoringGroup {
    handle: Option<GroupHandle>,
    backend: Arc<dyn MonBackend>,
    target: MonTarget,
    events: EventSet,
    /// Every L3 cluster this group's cores/tasks span (spec.md §4.F.3
    /// "for each event in the group, for each involved L3 cluster,
    /// read the counter"). A group confined to one socket/SNC node has
    /// exactly one entry; polling sums across all of them.
    l3_ids: Vec<u32>,
    max_threshold_occupancy: u64,
    prev: Option<PolledCounters>,
}

impl MonitoringGroup {
    pub fn start(
        backend: Arc<dyn MonBackend>,
        target: MonTarget,
        events: EventSet,
        l3_ids: Vec<u32>,
        max_threshold_occupancy: u64,
    ) -> Result<Self> {
        if l3_ids.is_empty() {
            return Err(Error::bad_request("monitoring group must span at least one L3 cluster"));
        }
        let handle = match &target {
            MonTarget::Cores(cores) => backend.start(cores, &[])?,
            MonTarget::Pids(pids) => backend.start(&[], pids)?,
        };
        Ok(MonitoringGroup { handle: Some(handle), backend, target, events, l3_ids, max_threshold_occupancy, prev: None })
    }

    pub fn target(&self) -> &MonTarget {
        &self.target
    }

    /// Poll current counters, returning deltas against the previous
    /// poll for events that wrap (spec.md §3 "counter delta
    /// semantics"); the first poll after `start` has no prior sample,
    /// so its bandwidth fields are `None` rather than a bogus delta
    /// against zero.
    pub fn poll(&mut self) -> Result<MonValues> {
        let handle = self.handle.ok_or(Error::Lifecycle("monitoring group already stopped"))?;
        self.backend.reclaim_empty(self.max_threshold_occupancy)?;
        let mut samples = Vec::with_capacity(self.l3_ids.len());
        for &l3_id in &self.l3_ids {
            samples.push(self.backend.poll(&handle, l3_id)?);
        }
        let sample = sum_polled(&samples);
        let mut values = MonValues::default();

        if self.events.contains(EventSet::L3_OCCUP) {
            values.l3_occupancy_bytes = sample.l3_occupancy;
        }
        if let Some(prev) = self.prev {
            if self.events.contains(EventSet::LMEM_BW) {
                values.lmem_bw_bytes = match (prev.lmem_bw, sample.lmem_bw) {
                    (Some(p), Some(c)) => Some(wrapping_delta(p, c)),
                    _ => None,
                };
            }
            if self.events.contains(EventSet::TMEM_BW) {
                values.tmem_bw_bytes = match (prev.tmem_bw, sample.tmem_bw) {
                    (Some(p), Some(c)) => Some(wrapping_delta(p, c)),
                    _ => None,
                };
            }
            if self.events.contains(EventSet::RMEM_BW) {
                values.rmem_bw_bytes = match (values.tmem_bw_bytes, values.lmem_bw_bytes) {
                    (Some(t), Some(l)) => Some(t.saturating_sub(l)),
                    _ => None,
                };
            }
        }
        if self.events.contains(EventSet::IPC) {
            values.ipc = sample.ipc;
        }
        self.prev = Some(sample);
        Ok(values)
    }

    pub fn stop(mut self) -> Result<()> {
        let handle = self.handle.take().ok_or(Error::Lifecycle("monitoring group already stopped"))?;
        self.backend.stop(handle)
    }
}

impl Drop for MonitoringGroup {
    /// A dropped-without-`stop` group still releases its backend
    /// resources (RMID, mon_groups directory) rather than leaking them;
    /// errors here have no caller left to report to, so they're
    /// logged and swallowed.
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(e) = self.backend.stop(handle) {
                log::warn!("monitoring group dropped without stop(), cleanup failed: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MonEventInfo, SncMode};

    fn cap_with(events: &[EventSet]) -> MonCapability {
        MonCapability {
            max_rmid: 16,
            l3_size: 0,
            events: events.iter().map(|&e| MonEventInfo { event: e, scale_factor: 1, max_rmid: 16 }).collect(),
            snc_num: 1,
            snc_mode: SncMode::Total,
            iordt_on: false,
            max_threshold_occupancy: 1_048_576,
        }
    }

    #[test]
    fn pmu_only_event_requires_rdt_hardware_event() {
        let cap = cap_with(&[EventSet::L3_OCCUP]);
        assert!(validate_events(EventSet::IPC, &cap).is_err());
        assert!(validate_events(EventSet::IPC | EventSet::L3_OCCUP, &cap).is_ok());
    }

    #[test]
    fn unsupported_event_rejected() {
        let cap = cap_with(&[EventSet::L3_OCCUP]);
        assert!(validate_events(EventSet::TMEM_BW, &cap).is_err());
    }

    #[test]
    fn empty_event_set_rejected() {
        let cap = cap_with(&[EventSet::L3_OCCUP]);
        assert!(validate_events(EventSet::empty(), &cap).is_err());
    }
}
