//! End-to-end allocation engine tests against a fake resctrl tree
//! (spec.md §8 Scenarios S2-S5, Testable Properties 1-3, 9).

use rdt_core::allocation;
use rdt_core::backend::{CatResource, MbaResource};
use rdt_core::config::{InterfaceChoice, RdtConfig, ResetConfig};
use rdt_core::context::Context;
use rdt_core::types::{CosMask, Technology, Throttle, WayMask};
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
fn cat_set_then_get_round_trips() {
    let fake = FakeResctrl::new();
    let ctx = init(&fake);

    let mask = CosMask::Plain(WayMask::new(0x0f, 16, false).unwrap());
    allocation::cat_set(&ctx, CatResource::L3, &[(1, mask)]).unwrap();
    assert_eq!(allocation::cat_get(&ctx, CatResource::L3, 1).unwrap(), mask);
}

#[test]
fn cat_set_preserves_other_classes_and_resources() {
    let fake = FakeResctrl::new();
    let ctx = init(&fake);

    let mask1 = CosMask::Plain(WayMask::new(0xff, 16, false).unwrap());
    let mask2 = CosMask::Plain(WayMask::new(0x0f, 16, false).unwrap());
    allocation::cat_set(&ctx, CatResource::L3, &[(1, mask1)]).unwrap();
    allocation::cat_set(&ctx, CatResource::L3, &[(2, mask2)]).unwrap();
    assert_eq!(allocation::cat_get(&ctx, CatResource::L3, 1).unwrap(), mask1);
    assert_eq!(allocation::cat_get(&ctx, CatResource::L3, 2).unwrap(), mask2);
}

#[test]
fn zero_mask_is_rejected_before_any_write() {
    let fake = FakeResctrl::new();
    let ctx = init(&fake);

    let bad = CosMask::Plain(WayMask(0));
    assert!(allocation::cat_set(&ctx, CatResource::L3, &[(1, bad)]).is_err());
}

/// Mirrors spec.md Scenario S4: a linear MBA platform, 90% throttle
/// requested, step size 10 -> register value is `90 - round(90,10) = 0`.
/// Exercised here via the resctrl backend, which stores the percent
/// value directly rather than the MSR delay encoding.
#[test]
fn mba_set_accepts_values_within_throttle_max() {
    let fake = FakeResctrl::new();
    let ctx = init(&fake);

    allocation::mba_set(&ctx, MbaResource::Mba, &[(1, Throttle(90))]).unwrap();
    assert_eq!(allocation::mba_get(&ctx, MbaResource::Mba, 1).unwrap().0, 90);
}

#[test]
fn mba_throttle_out_of_range_rejected() {
    let fake = FakeResctrl::new();
    let ctx = init(&fake);

    assert!(allocation::mba_set(&ctx, MbaResource::Mba, &[(1, Throttle(0))]).is_err());
}

#[test]
fn assign_never_returns_cos_zero_and_marks_core_used() {
    let fake = FakeResctrl::new();
    let ctx = init(&fake);
    let core = ctx.topology().all_cores()[0].lcore;

    let cos = allocation::assign(&ctx, Technology::L3CA, &[core]).unwrap();
    assert_ne!(cos, 0);
    assert_eq!(allocation::assoc_get_core(&ctx, core).unwrap(), cos);
}

#[test]
fn release_returns_core_to_cos_zero() {
    let fake = FakeResctrl::new();
    let ctx = init(&fake);
    let core = ctx.topology().all_cores()[0].lcore;

    allocation::assign(&ctx, Technology::L3CA, &[core]).unwrap();
    allocation::release(&ctx, Technology::L3CA, &[core], &[]).unwrap();
    assert_eq!(allocation::assoc_get_core(&ctx, core).unwrap(), 0);
}

/// Testable Property 4: a reset with no CDP/MBA-CTRL toggle still
/// clears every mask and association back to default, not just the
/// toggles that were actually requested.
#[test]
fn reset_with_no_toggles_still_clears_masks_and_associations() {
    let fake = FakeResctrl::new();
    fake.create_cos(1);
    let ctx = init(&fake);
    let core = ctx.topology().all_cores()[0].lcore;

    let narrow = CosMask::Plain(WayMask::new(0x0f, 16, false).unwrap());
    allocation::cat_set(&ctx, CatResource::L3, &[(1, narrow)]).unwrap();
    allocation::mba_set(&ctx, MbaResource::Mba, &[(1, Throttle(40))]).unwrap();
    allocation::assoc_set_core(&ctx, core, 1).unwrap();

    let ctx = allocation::reset(ctx, ResetConfig::default()).unwrap();

    assert_eq!(allocation::assoc_get_core(&ctx, core).unwrap(), 0);
    let all_ways = CosMask::Plain(WayMask::new(0xffff, 16, false).unwrap());
    assert_eq!(allocation::cat_get(&ctx, CatResource::L3, 1).unwrap(), all_ways);
    assert_eq!(allocation::mba_get(&ctx, MbaResource::Mba, 1).unwrap().0, 100);
}

#[test]
fn probe_min_cbm_bits_finds_expected_width_and_restores_scratch() {
    let fake = FakeResctrl::new();
    let ctx = init(&fake);

    let width = allocation::probe_min_cbm_bits(&ctx, CatResource::L3).unwrap();
    assert_eq!(width, 1);
}
