//! Boundaries to the collaborators that do the numerical and imaging work.
//!
//! Nothing in this crate estimates a GLM, reads a volume or writes one. Those
//! jobs belong to whatever implements the traits below; the pipeline only hands
//! them correctly aligned inputs and names the outputs.

use crate::contrast::ContrastVector;
use crate::matrix::{DesignError, DesignMatrix};
use clap::ValueEnum;
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Model fitting backend failed: {0}")]
    Backend(String),
    #[error("Backend produced no output at '{0}'")]
    MissingOutput(PathBuf),
    #[error("Backend returned malformed data from '{path}': {reason}")]
    Malformed { path: PathBuf, reason: String },
    #[error(transparent)]
    Design(#[from] DesignError),
    #[error("Failed to write backend job manifest: {0}")]
    Manifest(#[from] toml::ser::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// The statistic a fitted model is asked to produce for a contrast.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum StatisticKind {
    EffectSize,
    EffectVariance,
    ZScore,
    Stat,
    PValue,
}

impl StatisticKind {
    pub fn describe(self) -> &'static str {
        match self {
            Self::EffectSize => "effect_size",
            Self::EffectVariance => "effect_variance",
            Self::ZScore => "z_score",
            Self::Stat => "stat",
            Self::PValue => "p_value",
        }
    }
}

impl fmt::Display for StatisticKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// A statistic volume returned by a fitted model.
pub trait StatisticVolume {
    fn save(&self, path: &Path) -> Result<(), ServiceError>;
}

/// A model that has been fitted and can evaluate contrasts.
pub trait FittedModel {
    type Volume: StatisticVolume;

    fn compute(
        &self,
        contrast: &ContrastVector,
        kind: StatisticKind,
    ) -> Result<Self::Volume, ServiceError>;
}

/// Fits a GLM of `measurements` against `design`.
///
/// `measurements[i]` is the observation for `design.row_labels()[i]` at the group
/// level; at the first level there is a single 4D image whose scans are the rows.
pub trait ModelFittingService: Sync {
    type Model: FittedModel;

    fn fit(
        &self,
        measurements: &[PathBuf],
        design: &DesignMatrix,
    ) -> Result<Self::Model, ServiceError>;
}

/// Reduces a 4D image to one time series per label of a mask image.
/// Returns an array of shape `[n_scans, n_regions]`.
pub trait RegionMasker: Sync {
    fn extract(&self, image: &Path, mask: &Path) -> Result<Array2<f64>, ServiceError>;
}

/// Supplies the nuisance part of a first-level design (drifts, constant) for
/// the given acquisition times.
pub trait HemodynamicBasis: Sync {
    fn drift(&self, frame_times: &Array1<f64>) -> Result<(Vec<String>, Array2<f64>), ServiceError>;
}
