//! Service implementations that delegate to an external program.
//!
//! The program is invoked once per request as `program [args] <verb> <operands>`:
//!
//! * `extract <image> <mask> <out.tsv>` writes the region series, one row per
//!   scan, with a header naming the regions.
//! * `drift <frame_times.tsv> <out.tsv>` writes the nuisance regressors for the
//!   frame times given in the single `frame_time` column.
//! * `compute <manifest.toml>` fits the model described by the manifest and
//!   writes the requested statistic volume to its `output` path.
//!
//! Every request gets its own job directory inside a scratch workspace that is
//! removed when the backend is dropped.

use crate::contrast::ContrastVector;
use crate::matrix::DesignMatrix;
use ndarray::{Array1, Array2};
use serde::Serialize;
use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::TempDir;

use super::config::BackendConfig;
use super::service::{
    FittedModel, HemodynamicBasis, ModelFittingService, RegionMasker, ServiceError,
    StatisticKind, StatisticVolume,
};

pub struct CommandBackend {
    program: String,
    args: Vec<String>,
    volume_extension: String,
    workspace: TempDir,
    jobs: AtomicUsize,
}

impl CommandBackend {
    pub fn new(config: &BackendConfig) -> Result<Self, ServiceError> {
        let workspace = tempfile::Builder::new().prefix("seedglm-").tempdir()?;
        log::debug!(
            "Backend '{}' staging jobs in {}",
            config.program,
            workspace.path().display()
        );
        Ok(Self {
            program: config.program.clone(),
            args: config.args.clone(),
            volume_extension: config.volume_extension.trim_start_matches('.').to_string(),
            workspace,
            jobs: AtomicUsize::new(0),
        })
    }

    fn job_dir(&self, kind: &str) -> Result<PathBuf, ServiceError> {
        let id = self.jobs.fetch_add(1, Ordering::Relaxed);
        let dir = self.workspace.path().join(format!("{kind}-{id:05}"));
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }
}

/// Runs one backend verb, turning a failed launch or non-zero exit into an error
/// carrying the program's stderr.
fn invoke(
    program: &str,
    args: &[String],
    verb: &str,
    operands: &[&OsStr],
) -> Result<(), ServiceError> {
    log::debug!("Running backend: {program} {} {verb}", args.join(" "));
    let output = Command::new(program)
        .args(args)
        .arg(verb)
        .args(operands)
        .output()
        .map_err(|e| ServiceError::Backend(format!("could not start '{program}': {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ServiceError::Backend(format!(
            "'{program} {verb}' exited with {}: {}",
            output.status,
            stderr.trim()
        )));
    }
    Ok(())
}

/// Reads a headed, tab-separated numeric table.
fn read_numeric_tsv(path: &Path) -> Result<(Vec<String>, Array2<f64>), ServiceError> {
    let malformed = |reason: String| ServiceError::Malformed {
        path: path.to_path_buf(),
        reason,
    };
    if !path.exists() {
        return Err(ServiceError::MissingOutput(path.to_path_buf()));
    }

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .from_path(path)
        .map_err(|e| malformed(e.to_string()))?;
    let header: Vec<String> = reader
        .headers()
        .map_err(|e| malformed(e.to_string()))?
        .iter()
        .map(str::to_string)
        .collect();

    let mut values = Vec::new();
    let mut rows = 0;
    for record in reader.records() {
        let record = record.map_err(|e| malformed(e.to_string()))?;
        for cell in record.iter() {
            let value = lexical_core::parse::<f64>(cell.trim().as_bytes())
                .map_err(|_| malformed(format!("'{cell}' on row {} is not a number", rows + 1)))?;
            values.push(value);
        }
        rows += 1;
    }

    let table = Array2::from_shape_vec((rows, header.len()), values)
        .map_err(|e| malformed(e.to_string()))?;
    Ok((header, table))
}

impl RegionMasker for CommandBackend {
    fn extract(&self, image: &Path, mask: &Path) -> Result<Array2<f64>, ServiceError> {
        let dir = self.job_dir("extract")?;
        let out = dir.join("series.tsv");
        invoke(
            &self.program,
            &self.args,
            "extract",
            &[image.as_os_str(), mask.as_os_str(), out.as_os_str()],
        )?;
        let (_, series) = read_numeric_tsv(&out)?;
        Ok(series)
    }
}

impl HemodynamicBasis for CommandBackend {
    fn drift(&self, frame_times: &Array1<f64>) -> Result<(Vec<String>, Array2<f64>), ServiceError> {
        let dir = self.job_dir("drift")?;
        let times = dir.join("frame_times.tsv");
        let out = dir.join("drift.tsv");

        let mut contents = String::from("frame_time\n");
        let mut buffer = ryu::Buffer::new();
        for t in frame_times {
            contents.push_str(buffer.format(*t));
            contents.push('\n');
        }
        fs::write(&times, contents)?;

        invoke(
            &self.program,
            &self.args,
            "drift",
            &[times.as_os_str(), out.as_os_str()],
        )?;
        let (names, values) = read_numeric_tsv(&out)?;
        if values.nrows() != frame_times.len() {
            return Err(ServiceError::Malformed {
                path: out,
                reason: format!(
                    "expected {} rows, one per frame, found {}",
                    frame_times.len(),
                    values.nrows()
                ),
            });
        }
        Ok((names, values))
    }
}

impl ModelFittingService for CommandBackend {
    type Model = CommandModel;

    fn fit(
        &self,
        measurements: &[PathBuf],
        design: &DesignMatrix,
    ) -> Result<CommandModel, ServiceError> {
        let job_dir = self.job_dir("fit")?;
        let design_path = job_dir.join("design.tsv");
        design.write_tsv(&design_path, "row")?;
        Ok(CommandModel {
            program: self.program.clone(),
            args: self.args.clone(),
            volume_extension: self.volume_extension.clone(),
            job_dir,
            design: design_path,
            inputs: measurements.to_vec(),
        })
    }
}

/// A model staged for the backend. Each contrast request is a separate
/// `compute` invocation against the same inputs and design.
pub struct CommandModel {
    program: String,
    args: Vec<String>,
    volume_extension: String,
    job_dir: PathBuf,
    design: PathBuf,
    inputs: Vec<PathBuf>,
}

#[derive(Serialize)]
struct ComputeManifest<'a> {
    inputs: &'a [PathBuf],
    design: &'a Path,
    contrast: &'a str,
    weights: Vec<f64>,
    statistic: StatisticKind,
    output: &'a Path,
}

impl FittedModel for CommandModel {
    type Volume = StagedVolume;

    fn compute(
        &self,
        contrast: &ContrastVector,
        kind: StatisticKind,
    ) -> Result<StagedVolume, ServiceError> {
        let stem = format!("{}_{}", contrast.name(), kind);
        let output = if self.volume_extension.is_empty() {
            self.job_dir.join(&stem)
        } else {
            self.job_dir.join(format!("{stem}.{}", self.volume_extension))
        };
        let manifest_path = self.job_dir.join(format!("{stem}.toml"));

        let manifest = ComputeManifest {
            inputs: &self.inputs,
            design: &self.design,
            contrast: contrast.name(),
            weights: contrast.weights().to_vec(),
            statistic: kind,
            output: &output,
        };
        fs::write(&manifest_path, toml::to_string(&manifest)?)?;

        invoke(
            &self.program,
            &self.args,
            "compute",
            &[manifest_path.as_os_str()],
        )?;
        if !output.is_file() {
            return Err(ServiceError::MissingOutput(output));
        }
        Ok(StagedVolume { path: output })
    }
}

/// A volume the backend has written into the scratch workspace.
pub struct StagedVolume {
    path: PathBuf,
}

impl StatisticVolume for StagedVolume {
    fn save(&self, path: &Path) -> Result<(), ServiceError> {
        if fs::rename(&self.path, path).is_err() {
            // Rename fails across filesystems.
            fs::copy(&self.path, path)?;
            fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}
