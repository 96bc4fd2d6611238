//! In-process fakes of the collaborator services for pipeline tests.

use crate::contrast::ContrastVector;
use crate::matrix::DesignMatrix;
use itertools::Itertools;
use ndarray::{Array1, Array2};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use super::service::{
    FittedModel, HemodynamicBasis, ModelFittingService, RegionMasker, ServiceError,
    StatisticKind, StatisticVolume,
};

#[derive(Clone, Debug)]
pub struct RecordedFit {
    pub measurements: Vec<PathBuf>,
    pub design: DesignMatrix,
}

#[derive(Clone, Debug)]
pub struct RecordedCompute {
    pub contrast: String,
    pub weights: Vec<f64>,
    pub statistic: StatisticKind,
}

/// Records every fit and contrast request. Saved volumes contain the contrast
/// name and weights as text.
#[derive(Default)]
pub struct RecordingService {
    pub fits: Mutex<Vec<RecordedFit>>,
    pub computes: Arc<Mutex<Vec<RecordedCompute>>>,
}

impl RecordingService {
    pub fn fits(&self) -> Vec<RecordedFit> {
        self.fits.lock().unwrap().clone()
    }

    pub fn computes(&self) -> Vec<RecordedCompute> {
        self.computes.lock().unwrap().clone()
    }
}

pub struct RecordingModel {
    computes: Arc<Mutex<Vec<RecordedCompute>>>,
}

pub struct TextVolume(String);

impl ModelFittingService for RecordingService {
    type Model = RecordingModel;

    fn fit(
        &self,
        measurements: &[PathBuf],
        design: &DesignMatrix,
    ) -> Result<RecordingModel, ServiceError> {
        self.fits.lock().unwrap().push(RecordedFit {
            measurements: measurements.to_vec(),
            design: design.clone(),
        });
        Ok(RecordingModel {
            computes: Arc::clone(&self.computes),
        })
    }
}

impl FittedModel for RecordingModel {
    type Volume = TextVolume;

    fn compute(
        &self,
        contrast: &ContrastVector,
        kind: StatisticKind,
    ) -> Result<TextVolume, ServiceError> {
        self.computes.lock().unwrap().push(RecordedCompute {
            contrast: contrast.name().to_string(),
            weights: contrast.weights().to_vec(),
            statistic: kind,
        });
        Ok(TextVolume(format!(
            "{} {}",
            contrast.name(),
            contrast.weights().iter().join(" ")
        )))
    }
}

impl StatisticVolume for TextVolume {
    fn save(&self, path: &Path) -> Result<(), ServiceError> {
        fs::write(path, &self.0)?;
        Ok(())
    }
}

/// Returns a ramp series of `scans` rows for every image, with one region
/// unless the image name contains `multi`.
pub struct RampMasker {
    pub scans: usize,
}

impl RegionMasker for RampMasker {
    fn extract(&self, image: &Path, mask: &Path) -> Result<Array2<f64>, ServiceError> {
        let name = image
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let regions = if name.contains("multi") {
            2
        } else {
            1
        };
        if !mask.exists() {
            return Err(ServiceError::MissingOutput(mask.to_path_buf()));
        }
        Ok(Array2::from_shape_fn((self.scans, regions), |(i, j)| {
            (i + j) as f64
        }))
    }
}

/// A linear drift plus a constant column.
pub struct LinearDrift;

impl HemodynamicBasis for LinearDrift {
    fn drift(&self, frame_times: &Array1<f64>) -> Result<(Vec<String>, Array2<f64>), ServiceError> {
        let n = frame_times.len();
        let values = Array2::from_shape_fn((n, 2), |(i, j)| {
            if j == 0 { frame_times[i] } else { 1.0 }
        });
        Ok((vec!["drift_1".to_string(), "constant".to_string()], values))
    }
}
