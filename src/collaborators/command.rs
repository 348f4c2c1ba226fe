//! Command-line tool adapters
//!
//! Drive an external stacking or calibration program through its command line. The
//! program receives its inputs as flags, writes exactly one output file and may report the
//! number of combined frames on stdout as `NCOMBINE=<n>`.

use crate::collaborators::{
    CalibrationRequest, Calibrator, CombineOutput, CombinePolicy, Combiner,
};
use crate::error::CalibrationError;
use crate::header::FrameKind;
use crate::types::short_hex;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tracing::debug;

fn run(tool: &str, command: &mut Command) -> Result<Output, CalibrationError> {
    debug!(tool, command = ?command, "Running external tool");
    let output = command
        .output()
        .map_err(|e| CalibrationError::external(tool, format!("failed to start: {}", e)))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(CalibrationError::external(
            tool,
            format!("exited with {}: {}", output.status, stderr.trim()),
        ));
    }
    Ok(output)
}

fn require_output(tool: &str, path: &Path) -> Result<(), CalibrationError> {
    match std::fs::metadata(path) {
        Ok(meta) if meta.len() > 0 => Ok(()),
        _ => Err(CalibrationError::external(
            tool,
            format!("reported success but produced no output at {:?}", path),
        )),
    }
}

fn reported_count(stdout: &[u8]) -> Option<usize> {
    String::from_utf8_lossy(stdout)
        .lines()
        .find_map(|line| line.trim().strip_prefix("NCOMBINE=")?.trim().parse().ok())
}

/// Stacking program invoked once per master
#[derive(Debug, Clone)]
pub struct CommandCombiner {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandCombiner {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

impl Combiner for CommandCombiner {
    fn combine(
        &self,
        kind: FrameKind,
        inputs: &[PathBuf],
        policy: &CombinePolicy,
        output_dir: &Path,
    ) -> Result<CombineOutput, CalibrationError> {
        std::fs::create_dir_all(output_dir).map_err(crate::error::StorageError::from)?;

        let mut hasher = blake3::Hasher::new();
        for input in inputs {
            hasher.update(input.to_string_lossy().as_bytes());
            hasher.update(&[0]);
        }
        let tag = short_hex(hasher.finalize().as_bytes());
        let output = output_dir.join(format!("combine_{}_{}.fits", kind.as_str(), tag));

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .arg("--kind")
            .arg(kind.as_str())
            .arg("--reject")
            .arg(policy.rejection.as_str())
            .arg("--normalize")
            .arg(policy.normalization.as_str())
            .arg("--output")
            .arg(&output)
            .args(inputs);

        let result = run("combiner", &mut command)?;
        require_output("combiner", &output)?;
        Ok(CombineOutput {
            path: output,
            frame_count: reported_count(&result.stdout).unwrap_or(inputs.len()),
        })
    }
}

/// Calibration program invoked once per light frame
#[derive(Debug, Clone)]
pub struct CommandCalibrator {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandCalibrator {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

impl Calibrator for CommandCalibrator {
    fn calibrate(&self, request: &CalibrationRequest) -> Result<PathBuf, CalibrationError> {
        std::fs::create_dir_all(&request.output_dir).map_err(crate::error::StorageError::from)?;
        let stem = request
            .light
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "light".to_string());
        let output = request.output_dir.join(format!("{}_cal.fits", stem));
        if output.exists() {
            return Err(CalibrationError::external(
                "calibrator",
                format!("output {:?} already exists", output),
            ));
        }

        let mut command = Command::new(&self.program);
        command.args(&self.args).arg("--light").arg(&request.light);
        for (flag, master) in [
            ("--bias", &request.bias),
            ("--dark", &request.dark),
            ("--flat", &request.flat),
        ] {
            if let Some(path) = master {
                command.arg(flag).arg(path);
            }
        }
        command.arg("--output").arg(&output);

        run("calibrator", &mut command)?;
        require_output("calibrator", &output)?;
        Ok(output)
    }
}

/// Stand-in when `[combiner]` or `[calibrator]` has no program; every call fails
#[derive(Debug, Clone, Copy)]
pub struct Unconfigured(pub &'static str);

impl Unconfigured {
    fn fail(&self) -> CalibrationError {
        CalibrationError::external(
            self.0,
            format!("no program configured; set [{}] program", self.0),
        )
    }
}

impl Combiner for Unconfigured {
    fn combine(
        &self,
        _kind: FrameKind,
        _inputs: &[PathBuf],
        _policy: &CombinePolicy,
        _output_dir: &Path,
    ) -> Result<CombineOutput, CalibrationError> {
        Err(self.fail())
    }
}

impl Calibrator for Unconfigured {
    fn calibrate(&self, _request: &CalibrationRequest) -> Result<PathBuf, CalibrationError> {
        Err(self.fail())
    }
}
