//! Init/fini lifecycle and backend wiring (spec.md §4.D, §5).
//!
//! `Context` replaces the teacher's ambient singletons with an explicit
//! handle: callers thread it through every operation instead of the
//! library reaching for process-global state (spec.md §9 "Context
//! handle, threaded explicitly").

use crate::backend::direct::DirectBackend;
use crate::backend::resctrl_backend::ResctrlBackend;
use crate::backend::{AllocBackend, MonBackend};
use crate::capability::{self, RealCpuid};
use crate::config::{InterfaceChoice, RdtConfig};
use crate::error::{Error, Result};
use crate::lock::ApiLock;
use crate::resctrl::mount::{self, MountOptions};
use crate::topology::Topology;
use crate::types::{CapabilitySet, CosId};
use std::path::PathBuf;
use std::sync::Arc;

const DEFAULT_RESCTRL_ROOT: &str = "/sys/fs/resctrl";

/// The library's live state: one instance per `init`/`fini` cycle. Not
/// `Clone`; `fini` consumes it, matching spec.md §9's
/// "init/fini/reset govern one process-wide handle, not a value type
/// callers copy around."
pub struct Context {
    topology: Arc<Topology>,
    capability: CapabilitySet,
    interface: InterfaceChoice,
    resctrl_root: PathBuf,
    alloc_backend: Arc<dyn AllocBackend>,
    mon_backend: Arc<dyn MonBackend>,
    mounted_by_us: bool,
    lock: Arc<ApiLock>,
}

impl Context {
    /// Select an interface, discover capabilities, mount resctrl if
    /// this call is the one that needs to, and build the matching
    /// backend pair (spec.md §4.D).
    pub fn init(config: RdtConfig) -> Result<Self> {
        let lock = Arc::new(ApiLock::new());
        let _guard = lock.acquire()?;

        let interface = InterfaceChoice::select(&config)?;
        let resctrl_root = config.resctrl_root.clone().unwrap_or_else(|| PathBuf::from(DEFAULT_RESCTRL_ROOT));
        let topology = Arc::new(crate::topology::Topology::discover());

        let (capability, alloc_backend, mon_backend, mounted_by_us): (
            CapabilitySet,
            Arc<dyn AllocBackend>,
            Arc<dyn MonBackend>,
            bool,
        ) = match interface {
            InterfaceChoice::Msr => {
                let capability = capability::discover_direct(&RealCpuid);
                if capability.is_empty() {
                    return Err(Error::feature_absent("no RDT feature detected via CPUID"));
                }
                let max_rmid = capability.mon.as_ref().map(|m| m.max_rmid).unwrap_or(0);
                let backend = Arc::new(DirectBackend::new(topology.clone(), max_rmid));
                let alloc: Arc<dyn AllocBackend> = backend.clone();
                let mon: Arc<dyn MonBackend> = backend;
                (capability, alloc, mon, false)
            }
            InterfaceChoice::Resctrl => {
                let mut mounted_by_us = false;
                if !mount::is_mounted(&resctrl_root) {
                    let opts = MountOptions {
                        l3_cdp: config.reset.l3_cdp == crate::config::Tristate::On,
                        l2_cdp: config.reset.l2_cdp == crate::config::Tristate::On,
                        mba_mbps: config.reset.mba_ctrl == crate::config::Tristate::On,
                    };
                    mount::mount(&resctrl_root, opts)?;
                    mounted_by_us = true;
                }
                let capability = capability::discover_resctrl(&resctrl_root, topology.l3cat_ids().len() as u32);
                if capability.is_empty() {
                    return Err(Error::feature_absent("resctrl exposes no usable L3/L2/MB/MON info"));
                }
                let backend = Arc::new(ResctrlBackend::new(resctrl_root.clone()));
                let alloc: Arc<dyn AllocBackend> = backend.clone();
                let mon: Arc<dyn MonBackend> = backend;
                (capability, alloc, mon, mounted_by_us)
            }
        };

        Ok(Context { topology, capability, interface, resctrl_root, alloc_backend, mon_backend, mounted_by_us, lock })
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn resctrl_root(&self) -> &std::path::Path {
        &self.resctrl_root
    }

    /// Tear down: unmount resctrl only if this `Context` is the one
    /// that mounted it (spec.md §4.D "fini unmounts only if we
    /// mounted").
    pub fn fini(self) -> Result<()> {
        let _guard = self.lock.acquire()?;
        self.mon_backend.reset()?;
        if self.mounted_by_us {
            mount::unmount(&self.resctrl_root)?;
        }
        Ok(())
    }

    pub fn capability(&self) -> &CapabilitySet {
        &self.capability
    }

    /// Hand-toggle the cached CDP fields after a direct-backend CDP
    /// enable (spec.md §4.C "falling back to a hand-toggle of the two
    /// affected fields if discovery is not available" — CPUID has no
    /// leaf reporting whether CDP is *enabled*, only whether it's
    /// *supported*, so the freshly-discovered capability always reads
    /// back as disabled and this patches it after the fact). Disabling
    /// needs no patch: a fresh CPUID read already reports the
    /// CDP-off/full-`num_classes` shape.
    pub(crate) fn apply_cdp_enabled(&mut self, resource: crate::backend::CatResource, num_classes_when_off: u32) {
        let cat = match resource {
            crate::backend::CatResource::L3 => &mut self.capability.l3ca,
            crate::backend::CatResource::L2 => &mut self.capability.l2ca,
        };
        if let Some(cap) = cat {
            cap.cdp_enabled = true;
            cap.num_classes = num_classes_when_off / 2;
        }
    }

    pub fn interface(&self) -> InterfaceChoice {
        self.interface
    }

    pub fn alloc_backend(&self) -> Arc<dyn AllocBackend> {
        self.alloc_backend.clone()
    }

    pub fn mon_backend(&self) -> Arc<dyn MonBackend> {
        self.mon_backend.clone()
    }

    pub(crate) fn lock(&self) -> Result<crate::lock::ApiLockGuard<'_>> {
        self.lock.acquire()
    }

    /// Process ids currently associated with `cos` (resctrl only;
    /// spec.md §4.E.3 task association read-back).
    pub fn pid_assoc_list(&self, cos: CosId) -> Result<Vec<i32>> {
        if self.interface != InterfaceChoice::Resctrl {
            return Err(Error::BackendMismatch("pid association is a resctrl-only concept"));
        }
        crate::resctrl::groups::read_tasks(&self.resctrl_root, cos)
    }
}
