//! Import, regeneration and auto-calibration formatters.

use crate::cli::parse::OutputFormat;
use crate::cli::presentation::shared::{outcome_section, to_json, Palette};
use crate::error::CalibrationError;
use crate::import::ImportReport;
use crate::orchestrator::Summary;
use crate::regeneration::RegenerationReport;

pub fn format_import(
    report: &ImportReport,
    format: OutputFormat,
    palette: Palette,
) -> Result<String, CalibrationError> {
    if format == OutputFormat::Json {
        return to_json(report);
    }
    let mut s = format!(
        "Import {}:\n  Scanned: {}\n  Imported: {}\n  Duplicates: {}\n  Invalid: {}\n  Failed: {}",
        if report.cancelled {
            palette.warn("cancelled")
        } else {
            palette.good("finished")
        },
        report.scanned,
        report.imported,
        report.duplicates.len(),
        report.invalid.len(),
        report.failures.len(),
    );
    s.push_str(&outcome_section("Invalid", &report.invalid));
    s.push_str(&outcome_section("Failures", &report.failures));
    if report.imported > 0 {
        s.push_str("\n\nRun `astrocal regenerate` to group the new frames.");
    }
    Ok(s)
}

pub fn format_regeneration(
    report: &RegenerationReport,
    format: OutputFormat,
) -> Result<String, CalibrationError> {
    if format == OutputFormat::Json {
        return to_json(report);
    }
    if report.skipped {
        return Ok("Sessions are current; nothing to regenerate (use --force to rebuild).".to_string());
    }
    Ok(format!(
        "Regenerated sessions:\n  Light sessions: {}\n  Calibration sessions: {}\n  Links: {} ({} incomplete)\n  Masters reattached: {}",
        report.light_sessions,
        report.calibration_sessions,
        report.links,
        report.incomplete_links,
        report.masters_reattached,
    ))
}

pub fn format_summary(
    summary: &Summary,
    format: OutputFormat,
    palette: Palette,
) -> Result<String, CalibrationError> {
    if format == OutputFormat::Json {
        return to_json(summary);
    }

    let status = if let Some(reason) = &summary.halted {
        palette.bad(&format!("halted: {}", reason))
    } else if summary.cancelled {
        palette.warn("cancelled")
    } else if summary.error_count() > 0 {
        palette.warn("finished with errors")
    } else {
        palette.good("finished")
    };
    let title = if summary.dry_run {
        "Auto-calibration (dry run)"
    } else {
        "Auto-calibration"
    };

    let mut s = format!("{} {}", palette.title(title), status);
    if summary.dry_run {
        s.push_str(&format!(
            "\n  Masters to build: {}\n  Frames to calibrate: {}",
            summary.masters_planned.len(),
            summary.frames_planned
        ));
    } else {
        s.push_str(&format!(
            "\n  Masters created: {} of {} planned\n  Links resolved: {}\n  Frames calibrated: {} of {} planned",
            summary.masters_created.len(),
            summary.masters_planned.len(),
            summary.links_resolved,
            summary.frames_calibrated,
            summary.frames_planned,
        ));
    }
    s.push_str(&format!(
        "\n  Skipped: {}\n  Errors: {}",
        summary.skipped.len(),
        summary.error_count()
    ));
    s.push_str(&outcome_section("Resolution gaps", &summary.resolution_gaps));
    s.push_str(&outcome_section("Partially calibrated", &summary.partial));
    s.push_str(&outcome_section("Skipped", &summary.skipped));
    s.push_str(&outcome_section("Failures", &summary.failures));
    Ok(s)
}
