//! Integration tests for import and session grouping

use crate::integration::test_utils::{at, header, light, Harness};
use astrocal::header::{FieldMap, FrameKind};
use astrocal::session::Session;

/// Test that frames sharing target, optics and night form exactly one light session
#[test]
fn test_one_light_session_per_target_and_night() {
    let h = Harness::new();
    h.series("m31_ha", 4, |t| light("M31", "Ha", 300.0, t), at(2025, 6, 1, 21, 0));
    h.series("m31_oiii", 3, |t| light("M31", "OIII", 300.0, t), at(2025, 6, 2, 1, 0));
    h.import_and_group();

    let sessions = h.api.sessions().unwrap();
    let lights: Vec<_> = sessions.iter().filter_map(Session::as_light).collect();
    assert_eq!(lights.len(), 1);
    assert_eq!(lights[0].frames.len(), 7);
    assert_eq!(
        lights[0].filters,
        vec![Some("Ha".to_string()), Some("OIII".to_string())]
    );
}

/// Test that a second night of the same target starts a new session
#[test]
fn test_separate_nights_split_sessions() {
    let h = Harness::new();
    h.series("night1", 3, |t| light("M42", "L", 120.0, t), at(2025, 6, 1, 21, 0));
    h.series("night2", 3, |t| light("M42", "L", 120.0, t), at(2025, 6, 3, 21, 0));
    h.import_and_group();

    let lights: Vec<_> = h
        .api
        .sessions()
        .unwrap()
        .into_iter()
        .filter(|s| s.as_light().is_some())
        .collect();
    assert_eq!(lights.len(), 2);
    assert!(lights.iter().all(|s| s.frames().len() == 3));
}

/// Test that every catalogued frame belongs to exactly one session
#[test]
fn test_every_frame_assigned_once() {
    let h = Harness::new();
    h.series("light", 3, |t| light("NGC7000", "Ha", 300.0, t), at(2025, 6, 1, 21, 0));
    h.series("bias", 3, |t| header(FrameKind::Bias, 0.001, t), at(2025, 6, 1, 19, 0));
    h.series("dark", 3, |t| header(FrameKind::Dark, 300.0, t).with_temperature(-10.0), at(2025, 6, 1, 18, 0));
    h.series("flat", 3, |t| header(FrameKind::Flat, 2.0, t).with_filter("Ha"), at(2025, 6, 1, 20, 0));
    h.import_and_group();

    let sessions = h.api.sessions().unwrap();
    let mut members: Vec<_> = sessions.iter().flat_map(|s| s.frames().to_vec()).collect();
    let total = members.len();
    members.sort();
    members.dedup();
    assert_eq!(total, members.len(), "a frame appears in two sessions");
    assert_eq!(total, h.api.frames().unwrap().len());

    for frame in h.api.frames().unwrap() {
        let owner = frame.session_id.expect("frame has no session");
        let session = sessions.iter().find(|s| s.id() == owner).unwrap();
        assert!(session.frames().contains(&frame.hash));
    }
    assert_eq!(sessions.len(), 4);
}

/// Test that darks of different exposures form different calibration sessions
#[test]
fn test_dark_exposures_group_separately() {
    let h = Harness::new();
    h.series("dark300", 3, |t| header(FrameKind::Dark, 300.0, t), at(2025, 6, 1, 18, 0));
    h.series("dark120", 3, |t| header(FrameKind::Dark, 120.0, t), at(2025, 6, 1, 18, 30));
    h.import_and_group();

    let mut exposures: Vec<u64> = h
        .api
        .sessions()
        .unwrap()
        .iter()
        .filter_map(Session::as_calibration)
        .map(|s| s.exposure_ms)
        .collect();
    exposures.sort();
    assert_eq!(exposures, vec![120_000, 300_000]);
}

/// Test that importing the same directory twice reports duplicates and changes nothing
#[test]
fn test_reimport_reports_duplicates() {
    let h = Harness::new();
    h.series("light", 3, |t| light("M31", "L", 60.0, t), at(2025, 6, 1, 21, 0));

    let first = h.api.import_directory(&h.raw()).unwrap();
    assert_eq!(first.imported, 3);
    let before = h.catalog.dump().unwrap();

    let second = h.api.import_directory(&h.raw()).unwrap();
    assert_eq!(second.imported, 0);
    assert_eq!(second.duplicates.len(), 3);
    assert_eq!(h.catalog.dump().unwrap(), before);
}

/// Test that a header without DATE-OBS is reported invalid rather than catalogued
#[test]
fn test_incomplete_header_is_reported_invalid() {
    let h = Harness::new();
    let mut cards = light("M31", "L", 60.0, at(2025, 6, 1, 21, 0)).to_cards();
    cards.remove("DATE-OBS");
    let fields = FieldMap::from_cards(&cards);
    h.exposure("no_date.fits", &fields);
    h.exposure("ok.fits", &light("M31", "L", 60.0, at(2025, 6, 1, 21, 5)));

    let report = h.api.import_directory(&h.raw()).unwrap();
    assert_eq!(report.imported, 1);
    assert_eq!(report.invalid.len(), 1);
    assert!(report.invalid[0].reason.contains("DATE-OBS"));
}

/// Test that regenerating twice over an unchanged catalog is byte-for-byte idempotent
#[test]
fn test_regeneration_is_idempotent() {
    let h = Harness::new();
    h.series("light", 3, |t| light("M51", "L", 180.0, t), at(2025, 6, 1, 21, 0));
    h.series("dark", 3, |t| header(FrameKind::Dark, 180.0, t).with_temperature(-10.0), at(2025, 6, 1, 18, 0));
    h.series("flat", 3, |t| header(FrameKind::Flat, 1.5, t).with_filter("L"), at(2025, 6, 1, 20, 0));
    h.import_and_group();
    let first = h.catalog.dump().unwrap();

    let report = h.api.regenerate_sessions(true).unwrap();
    assert!(!report.skipped);
    assert_eq!(h.catalog.dump().unwrap(), first);
}

/// Test that regeneration without force skips a fully grouped catalog
#[test]
fn test_regeneration_skips_when_current() {
    let h = Harness::new();
    h.series("light", 2, |t| light("M51", "L", 180.0, t), at(2025, 6, 1, 21, 0));
    h.import_and_group();

    let report = h.api.regenerate_sessions(false).unwrap();
    assert!(report.skipped);

    h.exposure("late.fits", &light("M51", "L", 180.0, at(2025, 6, 1, 23, 0)));
    h.api.import_directory(&h.raw()).unwrap();
    let report = h.api.regenerate_sessions(false).unwrap();
    assert!(!report.skipped);
    assert_eq!(report.light_sessions, 1);
}
