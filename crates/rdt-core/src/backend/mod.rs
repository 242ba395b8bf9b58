//! Backend abstraction (spec.md §9 "capability-set interface"): two
//! concrete, mutually exclusive implementations — [`direct::DirectBackend`]
//! (raw MSR/MMIO) and [`resctrl_backend::ResctrlBackend`] (the kernel's
//! resctrl filesystem) — sit behind a pair of traits so the allocation
//! and monitoring engines never branch on interface choice themselves.

pub mod direct;
pub mod resctrl_backend;

use crate::error::{Error, Result};
use crate::types::{ChannelId, CosId, MbaCapability, Throttle, WayMask};

/// Which cache resource a CAT operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatResource {
    L3,
    L2,
}

/// Which bandwidth resource an MBA-family operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MbaResource {
    Mba,
    Smba,
}

/// A CAT class write: a plain mask, or a CDP code/data pair. Kept
/// separate from [`crate::types::CosMask`] so the backend layer only
/// ever deals in raw masks, never in validation.
#[derive(Debug, Clone, Copy)]
pub enum CatWrite {
    Plain(WayMask),
    Cdp { code: WayMask, data: WayMask },
}

/// A CAT class read-back, mirroring [`CatWrite`].
#[derive(Debug, Clone, Copy)]
pub enum CatValue {
    Plain(WayMask),
    Cdp { code: WayMask, data: WayMask },
}

/// Allocation-side operations common to both backends (spec.md §4.E).
/// A resctrl backend rejects the handful of operations that require an
/// unmount/remount cycle — CDP toggling, I/O RDT toggling, MBA-CTRL
/// toggling — with [`crate::error::Error::BackendMismatch`]; those are
/// instead orchestrated one layer up, by `allocation.rs`, which owns
/// the mount lifecycle.
pub trait AllocBackend: Send + Sync {
    fn set_cat(&self, resource: CatResource, class: CosId, write: CatWrite) -> Result<()>;
    /// Read back a class's mask. `cdp` tells the backend which shape to
    /// read: the two halves are indistinguishable from raw register
    /// offsets alone once CDP is enabled (unlike the resctrl backend's
    /// schemata, which carries the shape in its own keys), so the
    /// caller — which holds the capability snapshot — supplies it.
    fn get_cat(&self, resource: CatResource, class: CosId, cdp: bool) -> Result<CatValue>;

    /// `cap` is the discovered capability for this resource — the
    /// direct backend needs `throttle_max`/`throttle_step`/`is_linear`
    /// to convert the requested percentage into a register delay value;
    /// the resctrl backend writes the percentage straight into
    /// schemata and ignores it, since the kernel does that conversion.
    fn set_mba(&self, resource: MbaResource, class: CosId, throttle: Throttle, cap: &MbaCapability) -> Result<()>;
    fn get_mba(&self, resource: MbaResource, class: CosId, cap: &MbaCapability) -> Result<Throttle>;

    fn assoc_set_core(&self, lcore: u32, class: CosId) -> Result<()>;
    fn assoc_get_core(&self, lcore: u32) -> Result<CosId>;

    /// Attach `pid` to `class` (resctrl: move a task; direct: not
    /// supported, since the MSR backend has no task-to-core concept
    /// beyond the PQR_ASSOC of whatever core the task happens to run
    /// on, so this always fails with `BackendMismatch` there).
    fn assoc_set_task(&self, pid: i32, class: CosId) -> Result<()>;

    /// Existing number of classes actually configured (resctrl: number
    /// of `COS<n>` directories present; direct: the capability-set's
    /// `num_classes`, since nothing short of a reset changes it).
    fn existing_cos_count(&self, tech: crate::types::Technology) -> Result<u32>;

    /// Flip the CDP enable bit in `L3_QOS_CFG`/`L2_QOS_CFG` on a
    /// representative core of every cluster (spec.md §4.E.9 "set the
    /// `L3_QOS_CFG` / `L2_QOS_CFG` CDP bit on a representative core of
    /// every cluster"). Only the direct backend has a register for
    /// this; the resctrl backend's CDP state is a mount option, so
    /// toggling it is a full unmount/remount orchestrated one layer up
    /// by `allocation::reset`, and this always fails with
    /// `BackendMismatch` there.
    fn set_cdp(&self, resource: CatResource, enable: bool) -> Result<()> {
        let _ = (resource, enable);
        Err(Error::BackendMismatch("CDP toggling on this backend is a mount-option change, not a per-call operation"))
    }

    /// Flip the MBA 4.0 enable bit in `MBA_CFG` on a representative core
    /// of every MBA domain. Only the direct backend has a register for
    /// this; resctrl has no mount option for MBA 4.0, so this always
    /// fails with `BackendMismatch` there.
    fn set_mba40(&self, enable: bool) -> Result<()> {
        let _ = enable;
        Err(Error::BackendMismatch("MBA 4.0 toggling is only supported on the direct MSR/MMIO backend"))
    }

    /// Tag a PCIe device channel with `class` (I/O RDT, spec.md §4.E.6).
    /// Only the direct backend models channel tagging; resctrl has no
    /// filesystem surface for it, so the default rejects with
    /// `BackendMismatch`.
    fn assoc_set_channel(&self, channel: ChannelId, class: CosId) -> Result<()> {
        let _ = (channel, class);
        Err(Error::BackendMismatch("channel association requires the direct MSR/MMIO backend"))
    }

    fn assoc_get_channel(&self, channel: ChannelId) -> Result<CosId> {
        let _ = channel;
        Err(Error::BackendMismatch("channel association requires the direct MSR/MMIO backend"))
    }

    /// Re-associate every tagged channel with COS 0 (spec.md §4.E.9,
    /// invoked on I/O RDT on/off toggle). A no-op default for backends
    /// that don't support channel tagging at all.
    fn reset_channels(&self) -> Result<()> {
        Ok(())
    }
}

/// Raw counter values at one polling instant, before delta/scale math
/// (spec.md §4.F.2). `ipc` is computed by the monitoring engine from
/// PMU instruction/cycle counts where available, not by the backend.
#[derive(Debug, Clone, Copy, Default)]
pub struct PolledCounters {
    pub l3_occupancy: Option<u64>,
    pub lmem_bw: Option<u64>,
    pub tmem_bw: Option<u64>,
    pub llc_misses: Option<u64>,
    pub llc_references: Option<u64>,
    pub ipc: Option<f64>,
}

/// Monitoring-side operations common to both backends (spec.md §4.F).
pub trait MonBackend: Send + Sync {
    /// Start monitoring `lcores` (direct) or `pids` (resctrl) as one
    /// group, returning an opaque per-backend handle consumed by
    /// `poll`/`stop`.
    fn start(&self, lcores: &[u32], pids: &[i32]) -> Result<crate::monitoring::GroupHandle>;
    fn poll(&self, handle: &crate::monitoring::GroupHandle, l3_id: u32) -> Result<PolledCounters>;
    fn stop(&self, handle: crate::monitoring::GroupHandle) -> Result<()>;
    /// Tear down every monitoring group this backend currently tracks.
    fn reset(&self) -> Result<()>;
    /// Number of monitoring groups currently live. A CDP/MBA-CTRL
    /// toggle on the resctrl backend must refuse to proceed while this
    /// is nonzero (spec.md §4.E.9).
    fn active_count(&self) -> usize;

    /// Purge groups left behind by processes that exited without
    /// calling `stop` once their residual occupancy has decayed to at
    /// or below `max_threshold_occupancy` (spec.md §4.F.3 "empty group
    /// purge"). A no-op default; only the resctrl backend has a
    /// filesystem-visible notion of an abandoned group.
    fn reclaim_empty(&self, max_threshold_occupancy: u64) -> Result<()> {
        let _ = max_threshold_occupancy;
        Ok(())
    }
}
