//! End-to-end monitoring engine tests against a fake resctrl tree
//! (spec.md §8 Scenario S6, Testable Properties 5-8).

use rdt_core::config::{InterfaceChoice, RdtConfig};
use rdt_core::context::Context;
use rdt_core::monitoring::{validate_events, MonTarget, MonitoringGroup};
use rdt_core::types::EventSet;
use rdt_testing::FakeResctrl;

fn init(fake: &FakeResctrl) -> Context {
    Context::init(RdtConfig {
        interface: Some(InterfaceChoice::Resctrl),
        resctrl_root: Some(fake.root.clone()),
        ..Default::default()
    })
    .expect("init against fake resctrl tree should succeed")
}

#[test]
fn start_poll_stop_round_trip_reads_fake_counters() {
    let fake = FakeResctrl::new();
    let ctx = init(&fake);
    let core = ctx.topology().all_cores()[0].lcore;

    let threshold = ctx.capability().mon.as_ref().unwrap().max_threshold_occupancy;
    let mut group =
        MonitoringGroup::start(ctx.mon_backend(), MonTarget::Cores(vec![core]), EventSet::L3_OCCUP, vec![0], threshold).unwrap();

    // Locate the mon_groups directory the backend just created and
    // seed its counters, the way the kernel would after some dwell time.
    let mon_dir = fake.root.join("COS0").join("mon_groups");
    let mon_dir = std::fs::read_dir(&mon_dir).unwrap().next().unwrap().unwrap().path();
    fake.write_mon_counter(&mon_dir, 0, "llc_occupancy", 4096);

    let values = group.poll().unwrap();
    assert_eq!(values.l3_occupancy_bytes, Some(4096));

    group.stop().unwrap();
}

#[test]
fn bandwidth_event_has_no_delta_on_first_poll() {
    let fake = FakeResctrl::new();
    let ctx = init(&fake);
    let core = ctx.topology().all_cores()[0].lcore;

    let threshold = ctx.capability().mon.as_ref().unwrap().max_threshold_occupancy;
    let mut group =
        MonitoringGroup::start(ctx.mon_backend(), MonTarget::Cores(vec![core]), EventSet::TMEM_BW, vec![0], threshold).unwrap();
    let mon_dir = fake.root.join("COS0").join("mon_groups");
    let mon_dir = std::fs::read_dir(&mon_dir).unwrap().next().unwrap().unwrap().path();
    fake.write_mon_counter(&mon_dir, 0, "mbm_total_bytes", 1000);

    let first = group.poll().unwrap();
    assert_eq!(first.tmem_bw_bytes, None);

    fake.write_mon_counter(&mon_dir, 0, "mbm_total_bytes", 1500);
    let second = group.poll().unwrap();
    assert_eq!(second.tmem_bw_bytes, Some(500));

    group.stop().unwrap();
}

#[test]
fn task_based_group_round_trip_reads_fake_counters() {
    let fake = FakeResctrl::new();
    let ctx = init(&fake);

    let threshold = ctx.capability().mon.as_ref().unwrap().max_threshold_occupancy;
    let mut group =
        MonitoringGroup::start(ctx.mon_backend(), MonTarget::Pids(vec![4242]), EventSet::L3_OCCUP, vec![0], threshold).unwrap();

    let mon_dir = fake.root.join("COS0").join("mon_groups");
    let mon_dir = std::fs::read_dir(&mon_dir).unwrap().next().unwrap().unwrap().path();
    assert_eq!(std::fs::read_to_string(mon_dir.join("tasks")).unwrap(), "4242");
    fake.write_mon_counter(&mon_dir, 0, "llc_occupancy", 2048);

    let values = group.poll().unwrap();
    assert_eq!(values.l3_occupancy_bytes, Some(2048));

    group.stop().unwrap();
}

#[test]
fn pmu_only_event_alone_is_rejected() {
    let fake = FakeResctrl::new();
    let ctx = init(&fake);
    let cap = ctx.capability().mon.as_ref().unwrap();
    assert!(validate_events(EventSet::IPC, cap).is_err());
    assert!(validate_events(EventSet::IPC | EventSet::L3_OCCUP, cap).is_ok());
}

#[test]
fn dropping_a_group_without_stop_still_releases_its_directory() {
    let fake = FakeResctrl::new();
    let ctx = init(&fake);
    let core = ctx.topology().all_cores()[0].lcore;

    let threshold = ctx.capability().mon.as_ref().unwrap().max_threshold_occupancy;
    {
        let _group =
            MonitoringGroup::start(ctx.mon_backend(), MonTarget::Cores(vec![core]), EventSet::L3_OCCUP, vec![0], threshold)
                .unwrap();
        assert_eq!(ctx.mon_backend().active_count(), 1);
    }
    assert_eq!(ctx.mon_backend().active_count(), 0);
}
