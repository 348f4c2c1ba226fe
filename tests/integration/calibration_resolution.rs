//! Integration tests for calibration resolution

use crate::integration::test_utils::{at, header, light, Harness};
use astrocal::header::{Binning, FieldMap, FrameKind};
use astrocal::resolver::CalibrationRef;
use astrocal::session::{CalibrationSession, LightSession, Session};
use chrono::{DateTime, Utc};

fn light_session(h: &Harness) -> LightSession {
    let mut lights: Vec<LightSession> = h
        .api
        .sessions()
        .unwrap()
        .into_iter()
        .filter_map(|s| match s {
            Session::Light(l) => Some(l),
            Session::Calibration(_) => None,
        })
        .collect();
    assert_eq!(lights.len(), 1);
    lights.remove(0)
}

fn dark_at(h: &Harness, temperature: f64) -> CalibrationSession {
    h.api
        .sessions()
        .unwrap()
        .into_iter()
        .filter_map(|s| match s {
            Session::Calibration(c) if c.kind == FrameKind::Dark => Some(c),
            _ => None,
        })
        .find(|c| (c.temperature_c.unwrap() - temperature).abs() < 1e-6)
        .expect("no dark session at that temperature")
}

/// Ha light at 300s on 2025-06-01 with two 300s dark sessions: -10.2C on 05-30, -4.0C on 05-31
fn dark_scenario(light_temperature: f64) -> Harness {
    let h = Harness::new();
    h.series(
        "ha",
        3,
        |t| light("IC1396", "Ha", 300.0, t).with_temperature(light_temperature),
        at(2025, 6, 1, 22, 0),
    );
    h.series(
        "dark_cold",
        3,
        |t| header(FrameKind::Dark, 300.0, t).with_temperature(-10.2),
        at(2025, 5, 30, 12, 0),
    );
    h.series(
        "dark_warm",
        3,
        |t| header(FrameKind::Dark, 300.0, t).with_temperature(-4.0),
        at(2025, 5, 31, 12, 0),
    );
    h.import_and_group();
    h
}

/// Test that a -12C light picks the -10.2C dark and rejects the -4.0C one
#[test]
fn test_dark_within_tolerance_is_selected() {
    let h = dark_scenario(-12.0);
    let light = light_session(&h);
    let resolution = h.api.resolve(&light.id).unwrap();

    let cold = dark_at(&h, -10.2);
    assert_eq!(resolution.dark_for(300_000), Some(CalibrationRef::Session(cold.id)));
}

/// Test that a light far from both dark temperatures resolves no dark
#[test]
fn test_dark_outside_tolerance_is_rejected() {
    let h = dark_scenario(5.0);
    let light = light_session(&h);
    let resolution = h.api.resolve(&light.id).unwrap();

    assert_eq!(resolution.dark_for(300_000), None);
    assert!(resolution.gaps().contains(&"dark[300s]".to_string()));
    assert!(!resolution.is_complete());
}

/// Test that among darks within tolerance the nearest earlier date wins
#[test]
fn test_nearest_date_breaks_temperature_ties() {
    let h = dark_scenario(-8.0);
    let light = light_session(&h);
    let resolution = h.api.resolve(&light.id).unwrap();

    let warm = dark_at(&h, -4.0);
    assert_eq!(resolution.dark_for(300_000), Some(CalibrationRef::Session(warm.id)));
}

/// A -10.2C dark session and a light session at `light_temperature`
fn single_dark(light_temperature: f64) -> Harness {
    let h = Harness::new();
    h.series("ha", 3, |t| light_frame(t, light_temperature), at(2025, 6, 1, 22, 0));
    h.series(
        "dark",
        3,
        |t| header(FrameKind::Dark, 300.0, t).with_temperature(-10.2),
        at(2025, 5, 30, 12, 0),
    );
    h.import_and_group();
    h
}

fn light_frame(t: DateTime<Utc>, temperature: f64) -> FieldMap {
    light("IC1396", "Ha", 300.0, t).with_temperature(temperature)
}

/// Test the tolerance boundary: exactly 5.0C apart matches, 5.01C does not
#[test]
fn test_temperature_tolerance_boundary() {
    let at_limit = single_dark(-5.2);
    let light = light_session(&at_limit);
    let cold = dark_at(&at_limit, -10.2);
    assert_eq!(
        at_limit.api.resolve(&light.id).unwrap().dark_for(300_000),
        Some(CalibrationRef::Session(cold.id))
    );

    let beyond = single_dark(-5.19);
    let light = light_session(&beyond);
    assert_eq!(beyond.api.resolve(&light.id).unwrap().dark_for(300_000), None);
}

/// Test that a dark with a different exposure never matches
#[test]
fn test_dark_exposure_must_match_exactly() {
    let h = Harness::new();
    h.series("ha", 3, |t| light_frame(t, -10.0), at(2025, 6, 1, 22, 0));
    h.series(
        "dark",
        3,
        |t| header(FrameKind::Dark, 299.0, t).with_temperature(-10.0),
        at(2025, 6, 1, 12, 0),
    );
    h.import_and_group();

    let light = light_session(&h);
    assert_eq!(h.api.resolve(&light.id).unwrap().dark_for(300_000), None);
}

/// Test that bias ignores temperature and exposure while equipment must match exactly
#[test]
fn test_bias_matches_on_equipment_only() {
    let h = Harness::new();
    h.series("ha", 3, |t| light_frame(t, -10.0), at(2025, 6, 1, 22, 0));
    h.series(
        "bias_warm",
        3,
        |t| header(FrameKind::Bias, 0.001, t).with_temperature(20.0),
        at(2025, 5, 20, 12, 0),
    );
    h.series(
        "bias_bin2",
        3,
        |t| header(FrameKind::Bias, 0.001, t).with_binning(Binning::new(2, 2)),
        at(2025, 6, 1, 12, 0),
    );
    h.import_and_group();

    let light = light_session(&h);
    let resolution = h.api.resolve(&light.id).unwrap();
    let warm = h
        .api
        .sessions()
        .unwrap()
        .into_iter()
        .filter_map(|s| match s {
            Session::Calibration(c) if c.equipment.binning == Binning::new(1, 1) => Some(c),
            _ => None,
        })
        .next()
        .unwrap();
    assert_eq!(resolution.bias, Some(CalibrationRef::Session(warm.id)));
}

/// Test that flats resolve per filter and a missing filter is a gap, not an error
#[test]
fn test_flats_resolve_per_filter() {
    let h = Harness::new();
    h.series("ha", 3, |t| light_frame(t, -10.0), at(2025, 6, 1, 22, 0));
    h.series(
        "oiii",
        3,
        |t| light("IC1396", "OIII", 300.0, t).with_temperature(-10.0),
        at(2025, 6, 2, 0, 0),
    );
    h.series(
        "flat_ha",
        3,
        |t| header(FrameKind::Flat, 2.0, t).with_filter("Ha"),
        at(2025, 6, 1, 20, 0),
    );
    h.import_and_group();

    let light = light_session(&h);
    let resolution = h.api.resolve(&light.id).unwrap();
    assert!(resolution.flats["Ha"].is_some());
    assert_eq!(resolution.flats["OIII"], None);
    assert!(resolution.gaps().contains(&"flat[OIII]".to_string()));
}

/// Test that an earlier calibration session beats a nearer later one
#[test]
fn test_earlier_date_preferred_over_later() {
    let h = Harness::new();
    h.series("ha", 3, |t| light_frame(t, -10.0), at(2025, 6, 10, 22, 0));
    h.series("bias_before", 3, |t| header(FrameKind::Bias, 0.001, t), at(2025, 6, 5, 12, 0));
    h.series("bias_after", 3, |t| header(FrameKind::Bias, 0.001, t), at(2025, 6, 11, 12, 0));
    h.import_and_group();

    let light = light_session(&h);
    let resolution = h.api.resolve(&light.id).unwrap();
    let before = h
        .api
        .sessions()
        .unwrap()
        .into_iter()
        .filter_map(|s| match s {
            Session::Calibration(c) => Some(c),
            _ => None,
        })
        .min_by_key(|c| c.observed_at)
        .unwrap();
    assert_eq!(resolution.bias, Some(CalibrationRef::Session(before.id)));
}

/// Test that resolving twice against an unchanged catalog gives the same answer
#[test]
fn test_resolution_is_idempotent() {
    let h = dark_scenario(-12.0);
    let light = light_session(&h);
    let first = h.api.resolve(&light.id).unwrap();
    let second = h.api.resolve(&light.id).unwrap();
    assert_eq!(first, second);

    let stored = h
        .api
        .links()
        .unwrap()
        .into_iter()
        .find(|(id, _)| *id == light.id)
        .map(|(_, r)| r)
        .unwrap();
    assert_eq!(stored, first);
}

/// Test that resolving a calibration session id is a lookup error
#[test]
fn test_resolve_rejects_calibration_session() {
    let h = dark_scenario(-12.0);
    let dark = dark_at(&h, -10.2);
    assert!(matches!(
        h.api.resolve(&dark.id),
        Err(astrocal::error::CalibrationError::NotFound(_))
    ));
}
