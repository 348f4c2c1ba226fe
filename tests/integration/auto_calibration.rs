//! Integration tests for the five-phase auto-calibration job

use crate::integration::test_utils::{at, header, light, Harness};
use astrocal::catalog::{CalibrationStatus, LifecycleState};
use astrocal::collaborators::{FrameMetadata, SidecarMetadata};
use astrocal::error::CalibrationError;
use astrocal::header::{keys, Binning, FrameKind};
use astrocal::master::{MasterManager, MasterSettings};
use astrocal::orchestrator::{Orchestrator, RunOptions};
use astrocal::progress::{CancellationToken, JobStatus, NullProgress, ProgressUpdate};
use astrocal::resolver::Resolver;
use astrocal::session::SessionIndex;
use parking_lot::Mutex;
use std::sync::Arc;

/// Three Ha lights at -10C plus three each of bias, 300s dark and Ha flat frames
fn full_library(h: &Harness) {
    h.series(
        "ha",
        3,
        |t| light("NGC7000", "Ha", 300.0, t).with_temperature(-10.0),
        at(2025, 6, 1, 22, 0),
    );
    h.series("bias", 3, |t| header(FrameKind::Bias, 0.001, t), at(2025, 6, 1, 12, 0));
    h.series(
        "dark",
        3,
        |t| header(FrameKind::Dark, 300.0, t).with_temperature(-10.2),
        at(2025, 5, 30, 12, 0),
    );
    h.series(
        "flat",
        3,
        |t| header(FrameKind::Flat, 2.0, t).with_filter("Ha"),
        at(2025, 6, 1, 20, 0),
    );
    h.import_and_group();
}

/// Test that a dry run plans masters and frames without changing the catalog
#[test]
fn test_dry_run_changes_nothing() {
    let h = Harness::new();
    full_library(&h);
    let before = h.catalog.dump().unwrap();

    let summary = h.api.run_auto_calibration(true, None).unwrap();
    assert!(summary.dry_run);
    assert_eq!(summary.masters_planned.len(), 3);
    assert_eq!(summary.frames_planned, 3);
    assert!(summary.masters_created.is_empty());
    assert!(h.combiner.calls.lock().is_empty());
    assert_eq!(h.catalog.dump().unwrap(), before);
}

/// Test a full run: masters built, links resolved to masters, every light calibrated
#[test]
fn test_full_run_calibrates_every_light() {
    let h = Harness::new();
    full_library(&h);

    let summary = h.api.run_auto_calibration(false, None).unwrap();
    assert!(!summary.cancelled);
    assert_eq!(summary.halted, None);
    assert_eq!(summary.masters_created.len(), 3);
    assert_eq!(summary.links_resolved, 1);
    assert!(summary.resolution_gaps.is_empty(), "{:?}", summary.resolution_gaps);
    assert_eq!(summary.frames_calibrated, 3);
    assert_eq!(summary.error_count(), 0);

    let (_, resolution) = h.api.links().unwrap().remove(0);
    assert!(resolution.is_complete());
    assert!(resolution.references().iter().all(|r| r.is_master()));

    for frame in h.api.frames().unwrap() {
        match frame.kind {
            FrameKind::Light => {
                assert_eq!(frame.calibration, CalibrationStatus::Calibrated);
                assert_eq!(frame.lifecycle, LifecycleState::Active);
                let provenance = frame.provenance.expect("calibrated light lacks provenance");
                assert!(provenance.bias.is_some());
                assert!(provenance.dark.is_some());
                assert!(provenance.flat.is_some());
                assert!(provenance.output_path.exists());

                let cards = SidecarMetadata.read_header(&provenance.output_path).unwrap();
                assert_eq!(cards.extra(keys::CALSTAT), Some("BDF"));
            }
            _ => assert_eq!(frame.lifecycle, LifecycleState::SoftDeleted),
        }
    }

    let requests = h.calibrator.requests.lock();
    assert_eq!(requests.len(), 3);
    let object_dir = h.config.storage.calibrated_dir.join("NGC7000");
    assert!(requests.iter().all(|r| r.output_dir == requests[0].output_dir));
    assert_eq!(requests[0].output_dir.parent(), Some(object_dir.as_path()));
    let night = requests[0].output_dir.file_name().unwrap().to_string_lossy().into_owned();
    assert!(night.starts_with("20250601_"), "{}", night);
}

/// Bias, 300s dark at -10.2C and Ha flat masters' source frames
fn calibration_frames(h: &Harness) {
    h.series("bias", 3, |t| header(FrameKind::Bias, 0.001, t), at(2025, 6, 1, 12, 0));
    h.series(
        "dark",
        3,
        |t| header(FrameKind::Dark, 300.0, t).with_temperature(-10.2),
        at(2025, 5, 30, 12, 0),
    );
    h.series(
        "flat",
        3,
        |t| header(FrameKind::Flat, 2.0, t).with_filter("Ha"),
        at(2025, 6, 1, 20, 0),
    );
}

/// Test that same-named lights from two nights of one target both keep their outputs
#[test]
fn test_same_named_lights_on_two_nights_get_separate_outputs() {
    let h = Harness::new();
    h.exposure(
        "n1/Light_001.fits",
        &light("M31", "Ha", 300.0, at(2025, 6, 1, 22, 0)).with_temperature(-10.0),
    );
    h.exposure(
        "n2/Light_001.fits",
        &light("M31", "Ha", 300.0, at(2025, 6, 3, 22, 0)).with_temperature(-10.0),
    );
    calibration_frames(&h);
    h.import_and_group();

    let summary = h.api.run_auto_calibration(false, None).unwrap();
    assert_eq!(summary.error_count(), 0, "{:?}", summary.failures);
    assert_eq!(summary.frames_calibrated, 2);

    let outputs: Vec<_> = h
        .api
        .frames()
        .unwrap()
        .into_iter()
        .filter(|f| f.kind == FrameKind::Light)
        .map(|f| f.provenance.expect("calibrated light lacks provenance").output_path)
        .collect();
    assert_eq!(outputs.len(), 2);
    assert_ne!(outputs[0], outputs[1]);
    assert!(outputs.iter().all(|p| p.exists()));
    assert_ne!(
        std::fs::read(&outputs[0]).unwrap(),
        std::fs::read(&outputs[1]).unwrap()
    );
}

/// Test that a light whose exposure has no dark is calibrated and reported as partial
#[test]
fn test_mixed_exposures_report_the_missing_dark() {
    let h = Harness::new();
    h.series(
        "long",
        2,
        |t| light("M31", "Ha", 300.0, t).with_temperature(-10.0),
        at(2025, 6, 1, 22, 0),
    );
    h.exposure(
        "short.fits",
        &light("M31", "Ha", 120.0, at(2025, 6, 1, 23, 0)).with_temperature(-10.0),
    );
    calibration_frames(&h);
    h.import_and_group();
    let lights: Vec<_> = h
        .api
        .sessions()
        .unwrap()
        .into_iter()
        .filter(|s| s.as_light().is_some())
        .collect();
    assert_eq!(lights.len(), 1);

    let summary = h.api.run_auto_calibration(false, None).unwrap();
    assert_eq!(summary.frames_calibrated, 3);
    let gaps: Vec<&str> = summary.resolution_gaps.iter().map(|g| g.reason.as_str()).collect();
    assert_eq!(gaps, vec!["no dark[120s] calibration"]);
    assert_eq!(summary.partial.len(), 1);
    assert!(summary.partial[0].item.ends_with("short.fits"));
    assert_eq!(summary.partial[0].reason, "calibrated without dark[120s]");

    for frame in h.api.frames().unwrap() {
        if frame.kind != FrameKind::Light {
            continue;
        }
        let provenance = frame.provenance.expect("calibrated light lacks provenance");
        let short = frame.path.ends_with("short.fits");
        assert_eq!(provenance.dark.is_none(), short);
        assert!(provenance.bias.is_some());
        assert!(provenance.flat.is_some());
    }
}

/// Test that lights on different optics form their own sessions and each is calibrated alone
#[test]
fn test_minority_equipment_lights_are_not_dropped() {
    let h = Harness::new();
    h.series(
        "unbinned",
        3,
        |t| light("M31", "Ha", 300.0, t).with_temperature(-10.0),
        at(2025, 6, 1, 22, 0),
    );
    h.exposure(
        "binned.fits",
        &light("M31", "Ha", 300.0, at(2025, 6, 1, 23, 0))
            .with_temperature(-10.0)
            .with_binning(Binning::new(2, 2)),
    );
    calibration_frames(&h);
    h.import_and_group();

    let summary = h.api.run_auto_calibration(false, None).unwrap();
    assert_eq!(summary.frames_calibrated, 3);
    assert_eq!(summary.skipped.len(), 1);
    assert!(summary.skipped[0].item.starts_with("light M31"));
    assert_eq!(summary.resolution_gaps.len(), 3);
    assert!(summary
        .resolution_gaps
        .iter()
        .all(|g| g.item == summary.skipped[0].item));
}

/// Test that a second run finds nothing left to do
#[test]
fn test_second_run_is_a_no_op() {
    let h = Harness::new();
    full_library(&h);
    h.api.run_auto_calibration(false, None).unwrap();

    let summary = h.api.run_auto_calibration(false, None).unwrap();
    assert!(summary.masters_created.is_empty());
    assert_eq!(summary.frames_planned, 0);
    assert_eq!(summary.frames_calibrated, 0);
    assert_eq!(h.calibrator.requests.lock().len(), 3);
}

/// Test that one failing light does not stop its siblings
#[test]
fn test_calibrator_failure_is_isolated() {
    let h = Harness::new();
    full_library(&h);
    h.calibrator.fail_for.lock().push("ha_001.fits".to_string());

    let summary = h.api.run_auto_calibration(false, None).unwrap();
    assert_eq!(summary.frames_calibrated, 2);
    assert_eq!(summary.failures.len(), 1);
    assert!(summary.failures[0].item.ends_with("ha_001.fits"));
    assert_eq!(summary.halted, None);

    let uncalibrated: Vec<_> = h
        .api
        .frames()
        .unwrap()
        .into_iter()
        .filter(|f| f.kind == FrameKind::Light && f.calibration == CalibrationStatus::Uncalibrated)
        .collect();
    assert_eq!(uncalibrated.len(), 1);
}

/// Test that a light with no usable masters is skipped, not failed
#[test]
fn test_light_without_calibration_is_skipped() {
    let h = Harness::new();
    h.series(
        "ha",
        3,
        |t| light("M27", "Ha", 300.0, t).with_temperature(-10.0),
        at(2025, 6, 1, 22, 0),
    );
    h.import_and_group();

    let summary = h.api.run_auto_calibration(false, None).unwrap();
    assert_eq!(summary.frames_calibrated, 0);
    assert_eq!(summary.failures.len(), 0);
    assert_eq!(summary.skipped.len(), 1);
    let gaps: Vec<&str> = summary.resolution_gaps.iter().map(|g| g.reason.as_str()).collect();
    assert_eq!(gaps, vec!["no bias calibration", "no dark[300s] calibration", "no flat[Ha] calibration"]);
}

/// Test that cancelling while masters are being built leaves no partial master behind
#[test]
fn test_cancel_during_master_creation() {
    let h = Harness::new();
    full_library(&h);
    let before = h.catalog.dump().unwrap();

    let token = CancellationToken::new();
    *h.combiner.cancel_on_call.lock() = Some(token.clone());
    let masters = MasterManager::new(
        Arc::clone(&h.catalog),
        h.combiner.clone(),
        Arc::new(SidecarMetadata),
        Arc::new(astrocal::collaborators::Unscored),
        MasterSettings {
            min_frames: 3,
            min_quality: None,
            library_root: h.config.storage.library_root.clone(),
        },
    );
    let index = SessionIndex::new();
    let resolver = Resolver::default();
    let orchestrator = Orchestrator::new(
        &h.catalog,
        &index,
        &resolver,
        &masters,
        h.calibrator.as_ref(),
        &SidecarMetadata,
        h.config.storage.calibrated_dir.clone(),
    );

    let summary = orchestrator
        .run(&RunOptions::default(), &token, &NullProgress)
        .unwrap();
    assert!(summary.cancelled);
    assert!(summary.masters_created.is_empty());
    assert_eq!(h.combiner.calls.lock().len(), 1);
    assert!(h.catalog.list_masters().unwrap().is_empty());
    assert_eq!(h.catalog.dump().unwrap(), before);
    assert!(h.calibrator.requests.lock().is_empty());

    let work = h.config.storage.library_root.join("Masters").join(".work");
    let leftovers = std::fs::read_dir(&work).map(|d| d.count()).unwrap_or(0);
    assert_eq!(leftovers, 0);
}

/// Test that progress reports every phase in order
#[test]
fn test_progress_reports_phases_in_order() {
    let h = Harness::new();
    full_library(&h);
    let updates = Arc::new(Mutex::new(Vec::<ProgressUpdate>::new()));
    let sink = Arc::clone(&updates);
    let api = h
        .fresh_api()
        .with_progress(Arc::new(move |u: ProgressUpdate| sink.lock().push(u)));

    api.run_auto_calibration(false, None).unwrap();
    let updates = updates.lock();
    let phases: Vec<usize> = updates.iter().map(|u| u.phase_index).collect();
    assert!(phases.windows(2).all(|w| w[0] <= w[1]), "{:?}", phases);
    assert_eq!(phases.first(), Some(&1));
    assert_eq!(phases.last(), Some(&5));
    assert!(updates.iter().all(|u| u.phase_total == 5));
    assert!(updates
        .iter()
        .any(|u| u.phase_index == 4 && u.current_item.as_deref().map_or(false, |i| i.ends_with("ha_000.fits"))));
}

/// Test that a session filter limits the run to one light session's calibration
#[test]
fn test_session_filter_limits_scope() {
    let h = Harness::new();
    full_library(&h);
    h.series(
        "other",
        3,
        |t| light("M101", "L", 60.0, t).with_temperature(-10.0),
        at(2025, 6, 3, 22, 0),
    );
    h.import_and_group();

    let target = h
        .api
        .sessions()
        .unwrap()
        .into_iter()
        .find(|s| s.as_light().map(|l| l.object.as_deref() == Some("NGC7000")).unwrap_or(false))
        .unwrap();
    let summary = h.api.run_auto_calibration(false, Some(target.id())).unwrap();
    assert_eq!(summary.masters_created.len(), 3);
    assert_eq!(summary.frames_calibrated, 3);
    assert_eq!(summary.links_resolved, 1);

    let m101_calibrated = h
        .api
        .frames()
        .unwrap()
        .iter()
        .filter(|f| f.acquisition.object.as_deref() == Some("M101"))
        .any(|f| f.calibration == CalibrationStatus::Calibrated);
    assert!(!m101_calibrated);
}

/// Test that the run is recorded in job history
#[test]
fn test_run_is_recorded_as_a_job() {
    let h = Harness::new();
    full_library(&h);
    h.api.run_auto_calibration(false, None).unwrap();

    let jobs = h.api.jobs().unwrap();
    let calibrate = jobs.iter().find(|j| j.command == "calibrate").unwrap();
    assert_eq!(calibrate.status, JobStatus::Completed);
    assert_eq!(calibrate.summary.as_ref().unwrap()["frames_calibrated"], 3);
    assert!(h.api.active_job().is_none());
}

/// Test that a background run holds the slot until it finishes
#[test]
fn test_background_run_blocks_other_jobs() {
    let h = Harness::new();
    full_library(&h);
    let api = Arc::new(h.fresh_api());

    let held = h.combiner.hold.lock();
    let handle = api.spawn_auto_calibration(false, None).unwrap();
    assert_eq!(
        api.active_job(),
        Some((handle.job_id().to_string(), "calibrate"))
    );
    assert!(matches!(
        api.regenerate_sessions(true),
        Err(CalibrationError::Busy(_))
    ));
    drop(held);

    let summary = handle.join().unwrap();
    assert_eq!(summary.frames_calibrated, 3);
    assert!(api.active_job().is_none());
    api.regenerate_sessions(true).unwrap();
}
