//! Session and resolution formatters.

use crate::cli::parse::OutputFormat;
use crate::cli::presentation::shared::{dash, new_table, to_json, Palette};
use crate::error::CalibrationError;
use crate::resolver::{CalibrationRef, Resolution};
use crate::session::{exposure_label, LightSession, Session};
use crate::types::{short_hex, to_hex};
use serde_json::{json, Value};

fn session_json(session: &Session) -> Value {
    match session {
        Session::Light(s) => json!({
            "id": to_hex(&s.id),
            "kind": "light",
            "object": s.object,
            "equipment": s.equipment,
            "filters": s.filters,
            "exposure_ms": s.exposure_ms,
            "exposures_ms": s.exposures,
            "temperature_c": s.temperature_c,
            "observed_at": s.observed_at,
            "frames": s.frames.len(),
        }),
        Session::Calibration(s) => json!({
            "id": to_hex(&s.id),
            "kind": s.kind.as_str(),
            "equipment": s.equipment,
            "filter": s.filter,
            "exposure_ms": s.exposure_ms,
            "temperature_c": s.temperature_c,
            "observed_at": s.observed_at,
            "frames": s.frames.len(),
            "master": s.master.as_ref().map(to_hex),
        }),
    }
}

pub fn format_sessions(
    sessions: &[Session],
    format: OutputFormat,
    palette: Palette,
) -> Result<String, CalibrationError> {
    if format == OutputFormat::Json {
        let rows: Vec<Value> = sessions.iter().map(session_json).collect();
        return to_json(&rows);
    }
    if sessions.is_empty() {
        return Ok("No sessions. Import frames and run `astrocal regenerate`.".to_string());
    }

    let mut table = new_table();
    table.set_header(vec![
        "Session", "Kind", "Target / Filter", "Equipment", "Exposure", "Temp", "Night", "Frames",
        "Master",
    ]);
    for session in sessions {
        let (target, exposure_ms, temperature, master) = match session {
            Session::Light(s) => {
                let filters: Vec<&str> = s
                    .filters
                    .iter()
                    .map(|f| f.as_deref().unwrap_or("none"))
                    .collect();
                (
                    format!("{} [{}]", s.object.as_deref().unwrap_or("?"), filters.join(",")),
                    s.exposure_ms,
                    s.temperature_c,
                    String::new(),
                )
            }
            Session::Calibration(s) => (
                s.filter.clone().unwrap_or_default(),
                s.exposure_ms,
                s.temperature_c,
                match &s.master {
                    Some(h) => palette.good(&short_hex(h)),
                    None => "-".to_string(),
                },
            ),
        };
        table.add_row(vec![
            short_hex(&session.id()),
            session.kind_label().to_string(),
            target,
            equipment_of(session),
            format!("{}s", exposure_ms as f64 / 1000.0),
            dash(temperature.map(|t| format!("{:.1}", t))),
            session.observed_at().format("%Y-%m-%d").to_string(),
            session.frames().len().to_string(),
            master,
        ]);
    }
    Ok(table.to_string())
}

fn equipment_of(session: &Session) -> String {
    match session {
        Session::Light(s) => s.equipment.to_string(),
        Session::Calibration(s) => s.equipment.to_string(),
    }
}

fn describe(reference: &Option<CalibrationRef>, palette: Palette) -> String {
    match reference {
        Some(r) if r.is_master() => palette.good(&r.to_string()),
        Some(r) => r.to_string(),
        None => palette.bad("missing"),
    }
}

pub fn format_resolution(
    light: &LightSession,
    resolution: &Resolution,
    format: OutputFormat,
    palette: Palette,
) -> Result<String, CalibrationError> {
    if format == OutputFormat::Json {
        let refs = |r: &Option<CalibrationRef>| r.as_ref().map(|r| r.to_string());
        let darks: serde_json::Map<String, Value> = resolution
            .darks
            .iter()
            .map(|(exposure, r)| (exposure_label(*exposure), json!(refs(r))))
            .collect();
        let flats: serde_json::Map<String, Value> = resolution
            .flats
            .iter()
            .map(|(filter, r)| (filter.clone(), json!(refs(r))))
            .collect();
        return to_json(&json!({
            "session": to_hex(&light.id),
            "object": light.object,
            "bias": refs(&resolution.bias),
            "darks": darks,
            "flats": flats,
            "complete": resolution.is_complete(),
            "gaps": resolution.gaps(),
        }));
    }

    let mut s = format!(
        "Light session {} ({}, {})\n  Bias: {}",
        short_hex(&light.id),
        light.object.as_deref().unwrap_or("?"),
        light.observed_at.format("%Y-%m-%d"),
        describe(&resolution.bias, palette),
    );
    for (exposure, dark) in &resolution.darks {
        s.push_str(&format!(
            "\n  Dark [{}]: {}",
            exposure_label(*exposure),
            describe(dark, palette)
        ));
    }
    for (filter, flat) in &resolution.flats {
        let label = if filter.is_empty() { "none" } else { filter.as_str() };
        s.push_str(&format!("\n  Flat [{}]: {}", label, describe(flat, palette)));
    }
    if !resolution.is_complete() {
        s.push_str(&format!(
            "\n\n{} {}",
            palette.warn("Unresolved:"),
            resolution.gaps().join(", ")
        ));
    }
    Ok(s)
}
