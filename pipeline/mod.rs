pub mod command;
pub mod config;
pub mod first_level;
pub mod paths;
pub mod progress;
pub mod second_level;
pub mod service;
#[cfg(test)]
pub(crate) mod testing;

pub use config::{
    BackendConfig, CompositeContrast, FirstLevelConfig, GroupConfig, PipelineConfig,
    RegressionConfig,
};
pub use first_level::{FirstLevelOutput, FirstLevelReport, SubjectOutcome, run_first_level};
pub use progress::{NoopProgress, PipelineStage, ProgressObserver};
pub use second_level::{
    GroupMeanOutput, RegressionOutput, RegressionPlan, RegressionRequest, plan_regression,
    run_group_mean, run_regression, write_plan_reports,
};
pub use service::{
    FittedModel, HemodynamicBasis, ModelFittingService, RegionMasker, ServiceError,
    StatisticKind, StatisticVolume,
};

use crate::contrast::ContrastError;
use crate::covariates::CovariateError;
use crate::matching::MatchError;
use crate::matrix::DesignError;
use std::path::PathBuf;
use thiserror::Error;

/// Every way a pipeline stage can fail. Each variant names the entity at fault.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Match(#[from] MatchError),
    #[error(transparent)]
    Covariates(#[from] CovariateError),
    #[error(transparent)]
    Design(#[from] DesignError),
    #[error(transparent)]
    Contrast(#[from] ContrastError),
    #[error(transparent)]
    Service(#[from] ServiceError),
    #[error("No {what} matching '{pattern}' found in '{dir}'. Please check the input directory.")]
    EmptyInputSet {
        what: &'static str,
        dir: PathBuf,
        pattern: String,
    },
    #[error(
        "None of the {measured} subject(s) with measurement files has a row in the covariate table ({covaried} rows). Nothing to model."
    )]
    NoMatchedSubjects { measured: usize, covaried: usize },
    #[error(
        "Seed extraction for subject '{subject_id}' with mask '{mask}' returned {scans} scans x {regions} regions; a non-empty single-region series is required."
    )]
    SeedShape {
        subject_id: String,
        mask: String,
        scans: usize,
        regions: usize,
    },
    #[error("Design row '{0}' has no matching measurement file.")]
    UnalignedRow(String),
    #[error("Failed to create output directory '{path}': {source}")]
    OutputDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to write time series '{path}': {source}")]
    SeriesReport {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("Invalid configuration file '{path}': {source}")]
    Config {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
