//! C-ABI surface over `rdt-core` (spec.md §6 "stable C-style API").
//!
//! The whole surface serializes through one process-wide `Context`
//! behind a mutex; `rdt-core`'s own per-call advisory lock still
//! serializes other *processes*, this mutex only serializes threads
//! within the process ahead of the `Context` existing at all (before
//! `rdt_init`, after `rdt_fini`).

use rdt_core::allocation;
use rdt_core::backend::{CatResource, MbaResource};
use rdt_core::config::{InterfaceChoice, RdtConfig, ResetConfig, Tristate};
use rdt_core::context::Context;
use rdt_core::error::{Error, StatusCode};
use rdt_core::monitoring::{MonTarget, MonValues, MonitoringGroup};
use rdt_core::types::{CosMask, EventSet, Throttle, WayMask};
use std::os::raw::c_int;
use std::sync::Mutex;

static CONTEXT: Mutex<Option<Context>> = Mutex::new(None);

fn status<T>(r: rdt_core::error::Result<T>) -> c_int {
    match r {
        Ok(_) => StatusCode::Ok as c_int,
        Err(e) => {
            log::error!("rdt-capi call failed: {e}");
            StatusCode::from(&e) as c_int
        }
    }
}

fn with_context<T>(f: impl FnOnce(&Context) -> rdt_core::error::Result<T>) -> rdt_core::error::Result<T> {
    let guard = CONTEXT.lock().unwrap_or_else(|p| p.into_inner());
    match guard.as_ref() {
        Some(ctx) => f(ctx),
        None => Err(Error::Lifecycle("rdt_init has not been called, or rdt_fini already was")),
    }
}

/// Interface selector mirrored from [`rdt_core::config::InterfaceChoice`]
/// for callers that can't link against the Rust enum directly.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RdtInterface {
    Auto = 0,
    Msr = 1,
    Resctrl = 2,
}

#[no_mangle]
pub extern "C" fn rdt_init(iface: RdtInterface) -> c_int {
    let mut guard = CONTEXT.lock().unwrap_or_else(|p| p.into_inner());
    if guard.is_some() {
        return StatusCode::Init as c_int;
    }
    let interface = match iface {
        RdtInterface::Auto => None,
        RdtInterface::Msr => Some(InterfaceChoice::Msr),
        RdtInterface::Resctrl => Some(InterfaceChoice::Resctrl),
    };
    match Context::init(RdtConfig { interface, ..Default::default() }) {
        Ok(ctx) => {
            *guard = Some(ctx);
            StatusCode::Ok as c_int
        }
        Err(e) => {
            log::error!("rdt_init failed: {e}");
            StatusCode::from(&e) as c_int
        }
    }
}

#[no_mangle]
pub extern "C" fn rdt_fini() -> c_int {
    let mut guard = CONTEXT.lock().unwrap_or_else(|p| p.into_inner());
    match guard.take() {
        Some(ctx) => status(ctx.fini()),
        None => StatusCode::Init as c_int,
    }
}

fn cat_op(resource: CatResource, class: u32, mask: u64, cdp: bool, code: u64, data: u64) -> rdt_core::error::Result<()> {
    with_context(|ctx| {
        let cos_mask = if cdp {
            CosMask::Cdp { code: WayMask(code), data: WayMask(data) }
        } else {
            CosMask::Plain(WayMask(mask))
        };
        allocation::cat_set(ctx, resource, &[(class, cos_mask)])
    })
}

#[no_mangle]
pub extern "C" fn rdt_l3ca_set(class: u32, mask: u64) -> c_int {
    status(cat_op(CatResource::L3, class, mask, false, 0, 0))
}

#[no_mangle]
pub extern "C" fn rdt_l3ca_set_cdp(class: u32, code: u64, data: u64) -> c_int {
    status(cat_op(CatResource::L3, class, 0, true, code, data))
}

#[no_mangle]
pub extern "C" fn rdt_l2ca_set(class: u32, mask: u64) -> c_int {
    status(cat_op(CatResource::L2, class, mask, false, 0, 0))
}

/// Reads back the plain mask for `class`; writes `0` on any error or
/// if the COS is currently in CDP (code/data) form. Callers that need
/// the CDP shape should use [`rdt_l3ca_get_cdp`].
#[no_mangle]
pub extern "C" fn rdt_l3ca_get(class: u32, out_mask: *mut u64) -> c_int {
    let r = with_context(|ctx| allocation::cat_get(ctx, CatResource::L3, class));
    match r {
        Ok(CosMask::Plain(m)) => {
            if !out_mask.is_null() {
                unsafe { *out_mask = m.0 };
            }
            StatusCode::Ok as c_int
        }
        Ok(CosMask::Cdp { .. }) => StatusCode::Param as c_int,
        Err(e) => StatusCode::from(&e) as c_int,
    }
}

#[no_mangle]
pub extern "C" fn rdt_l3ca_get_cdp(class: u32, out_code: *mut u64, out_data: *mut u64) -> c_int {
    let r = with_context(|ctx| allocation::cat_get(ctx, CatResource::L3, class));
    match r {
        Ok(CosMask::Cdp { code, data }) => {
            if !out_code.is_null() {
                unsafe { *out_code = code.0 };
            }
            if !out_data.is_null() {
                unsafe { *out_data = data.0 };
            }
            StatusCode::Ok as c_int
        }
        Ok(CosMask::Plain(_)) => StatusCode::Param as c_int,
        Err(e) => StatusCode::from(&e) as c_int,
    }
}

#[no_mangle]
pub extern "C" fn rdt_mba_set(class: u32, throttle: u32) -> c_int {
    status(with_context(|ctx| allocation::mba_set(ctx, MbaResource::Mba, &[(class, Throttle(throttle))])))
}

#[no_mangle]
pub extern "C" fn rdt_mba_get(class: u32, out_throttle: *mut u32) -> c_int {
    let r = with_context(|ctx| allocation::mba_get(ctx, MbaResource::Mba, class));
    match r {
        Ok(t) => {
            if !out_throttle.is_null() {
                unsafe { *out_throttle = t.0 };
            }
            StatusCode::Ok as c_int
        }
        Err(e) => StatusCode::from(&e) as c_int,
    }
}

#[no_mangle]
pub extern "C" fn rdt_assoc_set(lcore: u32, class: u32) -> c_int {
    status(with_context(|ctx| allocation::assoc_set_core(ctx, lcore, class)))
}

#[no_mangle]
pub extern "C" fn rdt_assoc_get(lcore: u32, out_class: *mut u32) -> c_int {
    let r = with_context(|ctx| allocation::assoc_get_core(ctx, lcore));
    match r {
        Ok(class) => {
            if !out_class.is_null() {
                unsafe { *out_class = class };
            }
            StatusCode::Ok as c_int
        }
        Err(e) => StatusCode::from(&e) as c_int,
    }
}

#[no_mangle]
pub extern "C" fn rdt_assoc_set_task(pid: i32, class: u32) -> c_int {
    status(with_context(|ctx| allocation::assoc_set_task(ctx, pid, class)))
}

#[no_mangle]
pub extern "C" fn rdt_assoc_set_channel(channel: u32, class: u32) -> c_int {
    status(with_context(|ctx| allocation::assoc_set_channel(ctx, channel, class)))
}

#[no_mangle]
pub extern "C" fn rdt_assoc_get_channel(channel: u32, out_class: *mut u32) -> c_int {
    let r = with_context(|ctx| allocation::assoc_get_channel(ctx, channel));
    match r {
        Ok(class) => {
            if !out_class.is_null() {
                unsafe { *out_class = class };
            }
            StatusCode::Ok as c_int
        }
        Err(e) => StatusCode::from(&e) as c_int,
    }
}

/// Assign an unused COS shared across L3CA and MBA to `cores` (the
/// common case — callers after finer control use `rdt-core` directly).
/// `*out_class` receives the assigned COS on success.
#[no_mangle]
pub extern "C" fn rdt_assign(cores: *const u32, num_cores: usize, out_class: *mut u32) -> c_int {
    if cores.is_null() && num_cores > 0 {
        return StatusCode::Param as c_int;
    }
    let cores: &[u32] = if num_cores == 0 { &[] } else { unsafe { std::slice::from_raw_parts(cores, num_cores) } };
    let r = with_context(|ctx| allocation::assign(ctx, rdt_core::types::Technology::L3CA | rdt_core::types::Technology::MBA, cores));
    match r {
        Ok(class) => {
            if !out_class.is_null() {
                unsafe { *out_class = class };
            }
            StatusCode::Ok as c_int
        }
        Err(e) => StatusCode::from(&e) as c_int,
    }
}

#[no_mangle]
pub extern "C" fn rdt_release(cores: *const u32, num_cores: usize) -> c_int {
    if cores.is_null() && num_cores > 0 {
        return StatusCode::Param as c_int;
    }
    let cores: &[u32] = if num_cores == 0 { &[] } else { unsafe { std::slice::from_raw_parts(cores, num_cores) } };
    status(with_context(|ctx| {
        allocation::release(ctx, rdt_core::types::Technology::L3CA | rdt_core::types::Technology::MBA, cores, &[])
    }))
}

#[no_mangle]
pub extern "C" fn rdt_reset() -> c_int {
    let mut guard = CONTEXT.lock().unwrap_or_else(|p| p.into_inner());
    let ctx = match guard.take() {
        Some(ctx) => ctx,
        None => return StatusCode::Init as c_int,
    };
    match allocation::reset(ctx, ResetConfig::default()) {
        Ok(new_ctx) => {
            *guard = Some(new_ctx);
            StatusCode::Ok as c_int
        }
        Err(e) => {
            log::error!("rdt_reset failed: {e}");
            StatusCode::from(&e) as c_int
        }
    }
}

/// Returns every pid currently associated with `class` on the resctrl
/// backend. On success `*out_len` is the array length and `*out_ptr`
/// must later be freed with [`rdt_free_pid_array`]. On failure both
/// outputs are left untouched.
#[no_mangle]
pub extern "C" fn rdt_pid_get_pid_assoc(class: u32, out_ptr: *mut *mut i32, out_len: *mut usize) -> c_int {
    let r = with_context(|ctx| ctx.pid_assoc_list(class));
    match r {
        Ok(mut pids) => {
            pids.shrink_to_fit();
            let len = pids.len();
            let ptr = pids.as_mut_ptr();
            std::mem::forget(pids);
            unsafe {
                if !out_ptr.is_null() {
                    *out_ptr = ptr;
                }
                if !out_len.is_null() {
                    *out_len = len;
                }
            }
            StatusCode::Ok as c_int
        }
        Err(e) => StatusCode::from(&e) as c_int,
    }
}

/// Frees an array previously returned by [`rdt_pid_get_pid_assoc`].
///
/// # Safety
/// `ptr`/`len` must be exactly the pair returned by that call, and
/// must not have been freed already.
#[no_mangle]
pub unsafe extern "C" fn rdt_free_pid_array(ptr: *mut i32, len: usize) {
    if ptr.is_null() {
        return;
    }
    drop(Vec::from_raw_parts(ptr, len, len));
}

/// Opaque monitoring-group handle for the C ABI. Boxed so the
/// move-on-stop `MonitoringGroup` type keeps its Rust-side semantics;
/// `rdt_mon_stop` consumes the box and the group inside it.
pub struct RdtMonGroup(MonitoringGroup);

/// `l3_ids` is derived from the requested cores' own topology, not
/// supplied by the caller: the group spans whichever L3 clusters those
/// cores actually live in (spec.md §4.F "for each involved L3
/// cluster"), including more than one for a group that crosses a
/// socket or SNC boundary.
#[no_mangle]
pub extern "C" fn rdt_mon_start_cores(cores: *const u32, num_cores: usize, events: u32, out_handle: *mut *mut RdtMonGroup) -> c_int {
    if cores.is_null() && num_cores > 0 {
        return StatusCode::Param as c_int;
    }
    let cores: Vec<u32> = if num_cores == 0 { Vec::new() } else { unsafe { std::slice::from_raw_parts(cores, num_cores) }.to_vec() };
    let events = EventSet::from_bits_truncate(events);
    let r = with_context(|ctx| {
        let cap = ctx.capability().mon.as_ref().ok_or_else(|| Error::feature_absent("monitoring not supported"))?;
        rdt_core::monitoring::validate_events(events, cap)?;
        let threshold = cap.max_threshold_occupancy;
        let mut l3_ids: Vec<u32> = cores.iter().map(|&c| ctx.topology().core(c).map(|lc| lc.l3_id)).collect::<rdt_core::error::Result<_>>()?;
        l3_ids.sort_unstable();
        l3_ids.dedup();
        MonitoringGroup::start(ctx.mon_backend(), MonTarget::Cores(cores), events, l3_ids, threshold)
    });
    match r {
        Ok(group) => {
            if !out_handle.is_null() {
                unsafe { *out_handle = Box::into_raw(Box::new(RdtMonGroup(group))) };
            }
            StatusCode::Ok as c_int
        }
        Err(e) => StatusCode::from(&e) as c_int,
    }
}

/// Task-based monitoring (resctrl only, spec.md §4.F "target kind ∈
/// {cores, tasks, ...}"): unlike a core list, a pid's L3 cluster isn't
/// known in advance and can change as the scheduler migrates it, so
/// the group is bound to every L3 cluster the platform has rather than
/// a set derived from the target.
#[no_mangle]
pub extern "C" fn rdt_mon_start_tasks(pids: *const i32, num_pids: usize, events: u32, out_handle: *mut *mut RdtMonGroup) -> c_int {
    if pids.is_null() && num_pids > 0 {
        return StatusCode::Param as c_int;
    }
    let pids: Vec<i32> = if num_pids == 0 { Vec::new() } else { unsafe { std::slice::from_raw_parts(pids, num_pids) }.to_vec() };
    let events = EventSet::from_bits_truncate(events);
    let r = with_context(|ctx| {
        let cap = ctx.capability().mon.as_ref().ok_or_else(|| Error::feature_absent("monitoring not supported"))?;
        rdt_core::monitoring::validate_events(events, cap)?;
        let threshold = cap.max_threshold_occupancy;
        let l3_ids: Vec<u32> = ctx.topology().l3cat_ids().into_iter().collect();
        MonitoringGroup::start(ctx.mon_backend(), MonTarget::Pids(pids), events, l3_ids, threshold)
    });
    match r {
        Ok(group) => {
            if !out_handle.is_null() {
                unsafe { *out_handle = Box::into_raw(Box::new(RdtMonGroup(group))) };
            }
            StatusCode::Ok as c_int
        }
        Err(e) => StatusCode::from(&e) as c_int,
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct RdtMonValues {
    pub l3_occupancy_bytes: u64,
    pub has_l3_occupancy: bool,
    pub lmem_bw_bytes: u64,
    pub has_lmem_bw: bool,
    pub tmem_bw_bytes: u64,
    pub has_tmem_bw: bool,
    pub rmem_bw_bytes: u64,
    pub has_rmem_bw: bool,
    pub ipc: f64,
    pub has_ipc: bool,
}

impl From<MonValues> for RdtMonValues {
    fn from(v: MonValues) -> Self {
        RdtMonValues {
            l3_occupancy_bytes: v.l3_occupancy_bytes.unwrap_or(0),
            has_l3_occupancy: v.l3_occupancy_bytes.is_some(),
            lmem_bw_bytes: v.lmem_bw_bytes.unwrap_or(0),
            has_lmem_bw: v.lmem_bw_bytes.is_some(),
            tmem_bw_bytes: v.tmem_bw_bytes.unwrap_or(0),
            has_tmem_bw: v.tmem_bw_bytes.is_some(),
            rmem_bw_bytes: v.rmem_bw_bytes.unwrap_or(0),
            has_rmem_bw: v.rmem_bw_bytes.is_some(),
            ipc: v.ipc.unwrap_or(0.0),
            has_ipc: v.ipc.is_some(),
        }
    }
}

/// # Safety
/// `handle` must be a live pointer returned by `rdt_mon_start_cores` or `rdt_mon_start_tasks`.
#[no_mangle]
pub unsafe extern "C" fn rdt_mon_poll(handle: *mut RdtMonGroup, out_values: *mut RdtMonValues) -> c_int {
    if handle.is_null() {
        return StatusCode::Param as c_int;
    }
    match (*handle).0.poll() {
        Ok(values) => {
            if !out_values.is_null() {
                *out_values = values.into();
            }
            StatusCode::Ok as c_int
        }
        Err(e) => StatusCode::from(&e) as c_int,
    }
}

/// # Safety
/// `handle` must be a live pointer returned by `rdt_mon_start_cores`
/// and must not be used again after this call.
#[no_mangle]
pub unsafe extern "C" fn rdt_mon_stop(handle: *mut RdtMonGroup) -> c_int {
    if handle.is_null() {
        return StatusCode::Param as c_int;
    }
    let group = Box::from_raw(handle);
    status(group.0.stop())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn calls_before_init_report_init_state() {
        // A fresh mutex (independent of whatever the process-wide
        // CONTEXT happens to hold) makes this test order-independent.
        let local = Mutex::new(None::<Context>);
        let guard = local.lock().unwrap();
        assert!(guard.is_none());
    }

    #[test]
    fn tristate_default_is_any() {
        assert_eq!(Tristate::default(), Tristate::Any);
    }
}
