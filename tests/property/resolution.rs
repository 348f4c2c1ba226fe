//! Property tests for calibration resolution

use astrocal::header::{Binning, FrameKind};
use astrocal::resolver::{CalibrationCandidate, CalibrationRef, CandidatePool, Resolver};
use astrocal::session::{EquipmentSignature, LightSession};
use chrono::{DateTime, Duration, TimeZone, Utc};
use proptest::prelude::*;

fn equipment(bin: u32) -> EquipmentSignature {
    EquipmentSignature {
        telescope: "T1".to_string(),
        instrument: "I1".to_string(),
        binning: Binning::new(bin, bin),
        gain: Some(100),
        offset: Some(10),
    }
}

fn light_night() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 15, 22, 0, 0).unwrap()
}

fn light_session(temperature_c: Option<f64>) -> LightSession {
    LightSession {
        id: [0xAA; 32],
        object: Some("M31".to_string()),
        equipment: equipment(1),
        filters: vec![Some("Ha".to_string())],
        exposure_ms: 300_000,
        exposures: vec![300_000],
        temperature_c,
        observed_at: light_night(),
        frames: vec![[1; 32]],
    }
}

/// (bin, exposure, temperature in tenths, day offset, frame count, id byte)
type DarkSpec = (u32, bool, Option<i32>, i64, usize, u8);

fn dark_spec() -> impl Strategy<Value = DarkSpec> {
    (
        1..3u32,
        any::<bool>(),
        prop::option::weighted(0.9, -250..50i32),
        -20..20i64,
        1..20usize,
        any::<u8>(),
    )
}

fn dark(spec: &DarkSpec, index: usize) -> CalibrationCandidate {
    let &(bin, same_exposure, tenths, days, frames, id) = spec;
    let mut session = [id; 32];
    session[31] = index as u8;
    CalibrationCandidate {
        reference: CalibrationRef::Session(session),
        kind: FrameKind::Dark,
        equipment: equipment(bin),
        exposure_ms: if same_exposure { 300_000 } else { 120_000 },
        filter: None,
        temperature_c: tenths.map(|t| f64::from(t) / 10.0),
        observed_at: light_night() + Duration::days(days),
        frame_count: frames,
        quality: None,
    }
}

/// The temperature tier is symmetric and widening the tolerance never rejects a match
#[test]
fn test_temperature_tier_is_symmetric_and_monotonic() {
    let mut runner = proptest::test_runner::TestRunner::default();

    runner
        .run(
            &(-40.0..40.0f64, -40.0..40.0f64, 0.0..10.0f64, 0.0..10.0f64),
            |(a, b, tolerance, extra)| {
                let narrow = Resolver::new(tolerance);
                let wide = Resolver::new(tolerance + extra);

                prop_assert_eq!(
                    narrow.temperature_within(Some(a), Some(b)),
                    narrow.temperature_within(Some(b), Some(a))
                );
                if narrow.temperature_within(Some(a), Some(b)) {
                    prop_assert!(wide.temperature_within(Some(a), Some(b)));
                }
                prop_assert!(narrow.temperature_within(None, None));
                prop_assert!(!narrow.temperature_within(Some(a), None));
                Ok(())
            },
        )
        .unwrap();
}

/// A resolved dark always satisfies every matching tier, and a gap means none could
#[test]
fn test_resolved_dark_satisfies_every_tier() {
    let mut runner = proptest::test_runner::TestRunner::default();

    runner
        .run(
            &(
                prop::collection::vec(dark_spec(), 0..24),
                prop::option::weighted(0.9, -250..50i32),
            ),
            |(specs, light_tenths)| {
                let light = light_session(light_tenths.map(|t| f64::from(t) / 10.0));
                let candidates: Vec<CalibrationCandidate> =
                    specs.iter().enumerate().map(|(i, s)| dark(s, i)).collect();
                let mut pool = CandidatePool::default();
                for candidate in &candidates {
                    pool.push(candidate.clone());
                }
                let resolver = Resolver::default();

                let eligible: Vec<&CalibrationCandidate> = candidates
                    .iter()
                    .filter(|c| c.equipment == light.equipment)
                    .filter(|c| c.exposure_ms == light.exposure_ms)
                    .filter(|c| resolver.temperature_within(light.temperature_c, c.temperature_c))
                    .collect();

                match resolver.resolve(&light, &pool).dark_for(300_000) {
                    Some(reference) => {
                        prop_assert!(eligible.iter().any(|c| c.reference == reference));
                    }
                    None => prop_assert!(eligible.is_empty()),
                }
                Ok(())
            },
        )
        .unwrap();
}

/// The chosen dark does not depend on the order candidates were added to the pool
#[test]
fn test_resolution_ignores_pool_order() {
    let mut runner = proptest::test_runner::TestRunner::default();

    runner
        .run(
            &prop::collection::vec(dark_spec(), 1..16).prop_flat_map(|specs| {
                let len = specs.len();
                (Just(specs), Just((0..len).collect::<Vec<_>>()).prop_shuffle())
            }),
            |(specs, order)| {
                let light = light_session(Some(-10.0));
                let candidates: Vec<CalibrationCandidate> =
                    specs.iter().enumerate().map(|(i, s)| dark(s, i)).collect();

                let mut forward = CandidatePool::default();
                for candidate in &candidates {
                    forward.push(candidate.clone());
                }
                let mut shuffled = CandidatePool::default();
                for &i in &order {
                    shuffled.push(candidates[i].clone());
                }

                let resolver = Resolver::default();
                prop_assert_eq!(
                    resolver.resolve(&light, &forward),
                    resolver.resolve(&light, &shuffled)
                );
                Ok(())
            },
        )
        .unwrap();
}
