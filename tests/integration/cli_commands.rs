//! Integration tests for CLI commands

use crate::integration::test_utils::{at, header, light};
use astrocal::cli::{exit_code, map_error, Cli, Commands, RunContext};
use astrocal::collaborators::{FrameMetadata, SidecarMetadata};
use astrocal::config::AstrocalConfig;
use astrocal::error::CalibrationError;
use astrocal::header::{FieldMap, FrameKind};
use clap::Parser;
use std::path::Path;
use tempfile::TempDir;

fn write_exposure(dir: &Path, name: &str, fields: &FieldMap) {
    std::fs::create_dir_all(dir).unwrap();
    let path = dir.join(name);
    std::fs::write(&path, format!("SIMPLE = T / {}", name)).unwrap();
    SidecarMetadata.write_header(&path, fields).unwrap();
}

/// Workspace with three Ha lights and three bias frames under `raw/`
fn workspace() -> (TempDir, RunContext) {
    let dir = TempDir::new().unwrap();
    let raw = dir.path().join("raw");
    for i in 0..3 {
        write_exposure(
            &raw,
            &format!("light_{}.fits", i),
            &light("M31", "Ha", 300.0, at(2025, 6, 1, 22, i)).with_temperature(-10.0),
        );
        write_exposure(
            &raw,
            &format!("bias_{}.fits", i),
            &header(FrameKind::Bias, 0.001, at(2025, 6, 1, 12, i)),
        );
    }
    let ctx = RunContext::new(dir.path().to_path_buf(), AstrocalConfig::default(), false, false)
        .unwrap();
    (dir, ctx)
}

fn run(ctx: &RunContext, args: &[&str]) -> Result<String, CalibrationError> {
    let mut argv = vec!["astrocal"];
    argv.extend_from_slice(args);
    let cli = Cli::try_parse_from(argv).unwrap();
    ctx.execute(&cli.command)
}

/// Test import, regenerate and session listing end to end
#[test]
fn test_import_regenerate_and_list() {
    let (_dir, ctx) = workspace();

    let out = run(&ctx, &["import", "raw"]).unwrap();
    assert!(out.contains("Imported: 6"), "{}", out);
    assert!(out.contains("astrocal regenerate"));

    let out = run(&ctx, &["regenerate"]).unwrap();
    assert!(out.contains("Light sessions: 1"), "{}", out);
    assert!(out.contains("Calibration sessions: 1"));

    let out = run(&ctx, &["sessions", "--format", "json"]).unwrap();
    let rows: Vec<serde_json::Value> = serde_json::from_str(&out).unwrap();
    assert_eq!(rows.len(), 2);
    let light = rows.iter().find(|r| r["kind"] == "light").unwrap();
    assert_eq!(light["object"], "M31");
    assert_eq!(light["frames"], 3);

    let out = run(&ctx, &["sessions", "--kind", "calibration"]).unwrap();
    assert!(out.contains("bias"));
    assert!(!out.contains("M31"));
}

/// Test resolving by id prefix, with gaps listed
#[test]
fn test_resolve_by_prefix() {
    let (_dir, ctx) = workspace();
    run(&ctx, &["import", "raw"]).unwrap();
    run(&ctx, &["regenerate"]).unwrap();

    let rows: Vec<serde_json::Value> =
        serde_json::from_str(&run(&ctx, &["sessions", "--kind", "light", "--format", "json"]).unwrap())
            .unwrap();
    let id = rows[0]["id"].as_str().unwrap().to_string();

    let out = run(&ctx, &["resolve", &id[..12], "--format", "json"]).unwrap();
    let value: serde_json::Value = serde_json::from_str(&out).unwrap();
    assert_eq!(value["session"], id.as_str());
    assert!(value["bias"].as_str().unwrap().starts_with("session:"));
    assert!(value["darks"]["300s"].is_null());
    assert_eq!(value["complete"], false);

    let text = run(&ctx, &["resolve", &id[..12]]).unwrap();
    assert!(text.contains("Unresolved: dark[300s], flat[Ha]"), "{}", text);
}

/// Test that an unknown session prefix is a not-found error with exit code 1
#[test]
fn test_unknown_session_is_not_found() {
    let (_dir, ctx) = workspace();
    let err = run(&ctx, &["resolve", "ffffffff"]).unwrap_err();
    assert!(matches!(err, CalibrationError::NotFound(_)));
    assert_eq!(exit_code(&err), 1);
}

/// Test that calibrating without a configured combiner reports failures but completes
#[test]
fn test_calibrate_without_tools_reports_failures() {
    let (_dir, ctx) = workspace();
    run(&ctx, &["import", "raw"]).unwrap();
    run(&ctx, &["regenerate"]).unwrap();

    let out = run(&ctx, &["calibrate", "--dry-run"]).unwrap();
    assert!(out.starts_with("Auto-calibration (dry run)"), "{}", out);
    assert!(out.contains("Masters to build: 1"));

    let out = run(&ctx, &["calibrate", "--format", "json"]).unwrap();
    let summary: serde_json::Value = serde_json::from_str(&out).unwrap();
    assert_eq!(summary["masters_created"].as_array().unwrap().len(), 0);
    let failures = summary["failures"].as_array().unwrap();
    assert_eq!(failures.len(), 1);
    assert!(failures[0]["reason"]
        .as_str()
        .unwrap()
        .contains("no program configured"));
    assert_eq!(failures[0]["class"], "external_tool_failure");

    let jobs = run(&ctx, &["jobs", "--format", "json"]).unwrap();
    let jobs: Vec<serde_json::Value> = serde_json::from_str(&jobs).unwrap();
    assert!(jobs.iter().any(|j| j["command"] == "calibrate" && j["status"] == "completed"));
}

/// Test that retention without an archive maps to the configuration exit code
#[test]
fn test_retention_without_archive_is_config_error() {
    let (_dir, ctx) = workspace();
    let err = run(&ctx, &["retention", "--policy", "on-demand"]).unwrap_err();
    assert!(matches!(err, CalibrationError::Config(_)));
    assert_eq!(exit_code(&err), 78);
    assert!(map_error(&err).contains("mirror_root"));

    let err = run(&ctx, &["retention", "--policy", "delete-everything"]).unwrap_err();
    assert!(matches!(err, CalibrationError::Config(_)));
}

/// Test validate-masters on an empty library and the config command
#[test]
fn test_validate_masters_and_config_output() {
    let (_dir, ctx) = workspace();
    let out = run(&ctx, &["validate-masters"]).unwrap();
    assert_eq!(out, "No masters in the catalog.");

    let out = run(&ctx, &["config"]).unwrap();
    assert!(out.contains("[matching]"));
    assert!(out.contains("dark_temperature_tolerance_c = 5.0"));
    assert!(out.contains("# configuration is valid"));
}

/// Test that the master subcommand parses its session, force flag and format
#[test]
fn test_cli_parses_master_command() {
    let cli = Cli::try_parse_from(["astrocal", "master", "abc123", "--force", "--format", "json"])
        .unwrap();
    match &cli.command {
        Commands::Master { session, force, .. } => {
            assert_eq!(session, "abc123");
            assert!(*force);
        }
        other => panic!("unexpected command {:?}", other),
    }
    assert!(astrocal::cli::wants_json(&cli.command));
}
