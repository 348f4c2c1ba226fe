//! Retention, master validation, job history and config formatters.

use crate::api::MasterCheck;
use crate::cli::parse::OutputFormat;
use crate::cli::presentation::shared::{dash, format_millis, new_table, outcome_section, to_json, Palette};
use crate::config::AstrocalConfig;
use crate::error::CalibrationError;
use crate::master::{Master, MasterValidation};
use crate::progress::{JobRecord, JobStatus};
use crate::retention::RetentionReport;
use crate::types::{short_hex, to_hex};
use serde_json::{json, Value};

pub fn format_retention(
    report: &RetentionReport,
    format: OutputFormat,
    palette: Palette,
) -> Result<String, CalibrationError> {
    if format == OutputFormat::Json {
        return to_json(report);
    }
    let mut s = format!(
        "Retention ({}) {}:\n  Examined: {}\n  Uploaded: {}\n  Verified: {}\n  Purged locally: {}\n  Retryable: {}\n  Failed: {}",
        report.policy,
        if report.cancelled {
            palette.warn("cancelled")
        } else {
            palette.good("finished")
        },
        report.examined,
        report.uploaded,
        report.verified,
        report.purged,
        report.retryable.len(),
        report.failures.len(),
    );
    s.push_str(&outcome_section("Skipped", &report.skipped));
    s.push_str(&outcome_section("Retryable (local copy kept)", &report.retryable));
    s.push_str(&outcome_section("Failures", &report.failures));
    Ok(s)
}

pub fn format_master(
    master: &Master,
    format: OutputFormat,
    palette: Palette,
) -> Result<String, CalibrationError> {
    if format == OutputFormat::Json {
        return to_json(&json!({
            "master": to_hex(&master.hash),
            "kind": master.kind.as_str(),
            "source_session": to_hex(&master.source_session),
            "frames": master.frame_count,
            "quality": master.quality,
            "path": master.path,
        }));
    }
    Ok(format!(
        "{} master {} from {} frames
  Session: {}
  Quality: {}
  Path: {}",
        palette.good("Created"),
        master.kind.as_str(),
        master.frame_count,
        short_hex(&master.source_session),
        dash(master.quality),
        master.path.display(),
    ))
}

fn validation_label(validation: &MasterValidation) -> &'static str {
    match validation {
        MasterValidation::Valid => "valid",
        MasterValidation::Missing => "missing",
        MasterValidation::HashMismatch { .. } => "hash mismatch",
    }
}

pub fn format_master_checks(
    checks: &[MasterCheck],
    format: OutputFormat,
    palette: Palette,
) -> Result<String, CalibrationError> {
    if format == OutputFormat::Json {
        let rows: Vec<Value> = checks
            .iter()
            .map(|c| {
                let actual = match &c.validation {
                    MasterValidation::HashMismatch { actual } => Some(to_hex(actual)),
                    _ => None,
                };
                json!({
                    "master": to_hex(&c.master.hash),
                    "kind": c.master.kind.as_str(),
                    "path": c.master.path,
                    "status": validation_label(&c.validation),
                    "actual_hash": actual,
                })
            })
            .collect();
        return to_json(&rows);
    }
    if checks.is_empty() {
        return Ok("No masters in the catalog.".to_string());
    }

    let mut table = new_table();
    table.set_header(vec!["Master", "Kind", "Frames", "Status", "Path"]);
    for c in checks {
        let label = validation_label(&c.validation);
        let status = if c.validation.is_valid() {
            palette.good(label)
        } else {
            palette.bad(label)
        };
        table.add_row(vec![
            short_hex(&c.master.hash),
            c.master.kind.as_str().to_string(),
            c.master.frame_count.to_string(),
            status,
            c.master.path.display().to_string(),
        ]);
    }
    let broken = checks.iter().filter(|c| !c.validation.is_valid()).count();
    Ok(format!(
        "{}\n{} of {} masters need attention.",
        table,
        broken,
        checks.len()
    ))
}

fn status_cell(status: JobStatus, palette: Palette) -> String {
    match status {
        JobStatus::Completed => palette.good(status.as_str()),
        JobStatus::Active | JobStatus::Cancelled => palette.warn(status.as_str()),
        JobStatus::Failed | JobStatus::Interrupted => palette.bad(status.as_str()),
    }
}

pub fn format_jobs(
    jobs: &[JobRecord],
    format: OutputFormat,
    palette: Palette,
) -> Result<String, CalibrationError> {
    if format == OutputFormat::Json {
        return to_json(jobs);
    }
    if jobs.is_empty() {
        return Ok("No jobs recorded.".to_string());
    }
    let mut table = new_table();
    table.set_header(vec!["Job", "Command", "Status", "Started (UTC)", "Ended (UTC)", "Error"]);
    for job in jobs {
        table.add_row(vec![
            job.job_id.clone(),
            job.command.clone(),
            status_cell(job.status, palette),
            format_millis(job.started_at_ms),
            dash(job.ended_at_ms.map(format_millis)),
            dash(job.error.as_deref()),
        ]);
    }
    Ok(table.to_string())
}

pub fn format_config(config: &AstrocalConfig, palette: Palette) -> Result<String, CalibrationError> {
    let mut s = config.to_toml()?;
    match config.validate() {
        Ok(()) => s.push_str(&format!("\n# {}", palette.good("configuration is valid"))),
        Err(errors) => {
            s.push_str(&format!("\n# {}", palette.bad("configuration problems:")));
            for e in errors {
                s.push_str(&format!("\n#   - {}", e));
            }
        }
    }
    Ok(s)
}
