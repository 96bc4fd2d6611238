//! First-level seed analysis.
//!
//! For every mask, each subject's preprocessed image is reduced to the mask's
//! mean time series, that series becomes the regressor of interest of a
//! per-subject GLM, and the seed effect map is written under a name the group
//! stage can discover. Subjects are processed in parallel; a failing subject is
//! reported and skipped rather than aborting the others.

use crate::contrast::ContrastVector;
use crate::matching::{
    AnalysisLevel, FilePattern, MeasurementFile, discover, list_matching, single_file_per_subject,
};
use crate::matrix::{DesignError, DesignMatrix};
use ndarray::{Array1, ArrayView1, Axis, concatenate};
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use super::PipelineError;
use super::config::FirstLevelConfig;
use super::paths::{
    EFFECT_MAP_DIR, TIMESERIES_DIR, effect_map_path, ensure_dir, file_tag, parent_or_current,
    timeseries_path,
};
use super::progress::{PipelineStage, ProgressObserver};
use super::service::{
    FittedModel, HemodynamicBasis, ModelFittingService, RegionMasker, StatisticVolume,
};

// ========================================================================================
//                                   Stage report
// ========================================================================================

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FirstLevelOutput {
    pub timeseries: PathBuf,
    pub effect_map: PathBuf,
}

#[derive(Debug)]
pub struct SubjectOutcome {
    pub subject_id: String,
    pub mask_tag: String,
    pub result: Result<FirstLevelOutput, PipelineError>,
}

/// One outcome per (mask, subject), masks in natural order, subjects in
/// lexicographic order within a mask.
#[derive(Debug, Default)]
pub struct FirstLevelReport {
    pub outcomes: Vec<SubjectOutcome>,
}

impl FirstLevelReport {
    pub fn succeeded(&self) -> impl Iterator<Item = (&SubjectOutcome, &FirstLevelOutput)> {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().ok().map(|output| (o, output)))
    }

    pub fn failed(&self) -> impl Iterator<Item = (&SubjectOutcome, &PipelineError)> {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().err().map(|err| (o, err)))
    }

    pub fn is_success(&self) -> bool {
        self.failed().next().is_none()
    }
}

// ========================================================================================
//                                   Stage driver
// ========================================================================================

struct SubjectContext<'a> {
    mask: &'a Path,
    mask_tag: &'a str,
    timeseries_dir: &'a Path,
    effect_dir: &'a Path,
    config: &'a FirstLevelConfig,
}

/// Runs the first-level analysis for every mask in `mask_dir` against every
/// subject image in `data_dir`.
///
/// Fails up front if either input set is empty or a subject has more than one
/// image. Failures after that are per subject and end up in the report.
pub fn run_first_level<S: ModelFittingService>(
    mask_dir: &Path,
    data_dir: &Path,
    config: &FirstLevelConfig,
    masker: &dyn RegionMasker,
    basis: &dyn HemodynamicBasis,
    service: &S,
    progress: &dyn ProgressObserver,
) -> Result<FirstLevelReport, PipelineError> {
    let mask_pattern = FilePattern::new(&config.mask_pattern)?;
    let masks = list_matching(mask_dir, &mask_pattern)?;
    if masks.is_empty() {
        return Err(PipelineError::EmptyInputSet {
            what: "mask images",
            dir: mask_dir.to_path_buf(),
            pattern: config.mask_pattern.clone(),
        });
    }

    let image_pattern = FilePattern::new(&config.image_pattern)?;
    let files = discover(
        data_dir,
        &image_pattern,
        &config.subject_rule,
        AnalysisLevel::First,
    )?;
    if files.is_empty() {
        return Err(PipelineError::EmptyInputSet {
            what: "preprocessed images",
            dir: data_dir.to_path_buf(),
            pattern: config.image_pattern.clone(),
        });
    }
    // Output names carry only subject and mask, so two images of one subject
    // would overwrite each other.
    let images: Vec<MeasurementFile> = single_file_per_subject(&files)?.into_values().collect();

    let output_root = config
        .output_root
        .clone()
        .unwrap_or_else(|| parent_or_current(mask_dir));
    let timeseries_dir = output_root.join(TIMESERIES_DIR);
    let effect_dir = output_root.join(EFFECT_MAP_DIR);
    ensure_dir(&timeseries_dir)?;
    ensure_dir(&effect_dir)?;

    let stage = PipelineStage::FirstLevelSubjects;
    progress.on_stage_start(stage, masks.len() * images.len());
    let processed = AtomicUsize::new(0);

    let mut report = FirstLevelReport::default();
    for mask in &masks {
        let mask_tag = file_tag(mask);
        log::info!(
            "Seed mask '{mask_tag}': fitting {} subject(s)",
            images.len()
        );
        let context = SubjectContext {
            mask,
            mask_tag: &mask_tag,
            timeseries_dir: &timeseries_dir,
            effect_dir: &effect_dir,
            config,
        };

        let outcomes: Vec<SubjectOutcome> = images
            .par_iter()
            .map(|image| {
                let result = analyze_subject(image, &context, masker, basis, service);
                if let Err(e) = &result {
                    log::warn!(
                        "Subject '{}' with mask '{mask_tag}' failed: {e}",
                        image.subject_id
                    );
                }
                let done = processed.fetch_add(1, Ordering::Relaxed) + 1;
                progress.on_stage_advance(stage, done);
                SubjectOutcome {
                    subject_id: image.subject_id.clone(),
                    mask_tag: mask_tag.clone(),
                    result,
                }
            })
            .collect();
        report.outcomes.extend(outcomes);
    }
    progress.on_stage_finish(stage);

    log::info!(
        "First level finished: {} succeeded, {} failed",
        report.succeeded().count(),
        report.failed().count()
    );
    Ok(report)
}

fn analyze_subject<S: ModelFittingService>(
    image: &MeasurementFile,
    context: &SubjectContext<'_>,
    masker: &dyn RegionMasker,
    basis: &dyn HemodynamicBasis,
    service: &S,
) -> Result<FirstLevelOutput, PipelineError> {
    let subject_id = image.subject_id.as_str();
    let series = masker.extract(&image.path, context.mask)?;
    let (scans, regions) = series.dim();
    if regions != 1 || scans == 0 {
        return Err(PipelineError::SeedShape {
            subject_id: subject_id.to_string(),
            mask: context.mask_tag.to_string(),
            scans,
            regions,
        });
    }
    let seed = series.column(0).to_owned();

    let timeseries = timeseries_path(context.timeseries_dir, subject_id, context.mask_tag);
    write_series(&timeseries, seed.view(), &context.config.seed_column)?;

    let design = first_level_design(
        &seed,
        context.config.repetition_time,
        &context.config.seed_column,
        basis,
    )?;
    let model = service.fit(std::slice::from_ref(&image.path), &design)?;
    let contrast = ContrastVector::one_hot(&design, &context.config.seed_column)?;
    let volume = model.compute(&contrast, context.config.statistic)?;

    let effect_map = effect_map_path(
        context.effect_dir,
        subject_id,
        context.mask_tag,
        &context.config.output_extension,
    );
    volume.save(&effect_map)?;
    log::debug!("Wrote {}", effect_map.display());

    Ok(FirstLevelOutput {
        timeseries,
        effect_map,
    })
}

/// Builds the per-subject design: the seed series first, then the basis columns
/// evaluated at `0, t_r, 2·t_r, ...`. Rows are labelled by scan index.
pub fn first_level_design(
    seed: &Array1<f64>,
    repetition_time: f64,
    seed_column: &str,
    basis: &dyn HemodynamicBasis,
) -> Result<DesignMatrix, PipelineError> {
    let scans = seed.len();
    let frame_times: Array1<f64> = (0..scans).map(|i| i as f64 * repetition_time).collect();
    let (names, drift) = basis.drift(&frame_times)?;

    let shape_error = || DesignError::ShapeMismatch {
        found: drift.dim(),
        rows: scans,
        columns: names.len(),
    };
    if drift.dim() != (scans, names.len()) {
        return Err(shape_error().into());
    }
    let values = concatenate(Axis(1), &[seed.view().insert_axis(Axis(1)), drift.view()])
        .map_err(|_| shape_error())?;

    let mut columns = Vec::with_capacity(names.len() + 1);
    columns.push(seed_column.to_string());
    columns.extend(names);
    let row_labels = (0..scans).map(|i| i.to_string()).collect();
    Ok(DesignMatrix::new(row_labels, columns, values)?)
}

fn write_series(path: &Path, seed: ArrayView1<'_, f64>, column: &str) -> Result<(), PipelineError> {
    let report_error = |source| PipelineError::SeriesReport {
        path: path.to_path_buf(),
        source,
    };
    let mut writer = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .from_path(path)
        .map_err(report_error)?;
    writer
        .write_record(["scan", column])
        .map_err(report_error)?;

    let mut buffer = ryu::Buffer::new();
    for (scan, value) in seed.iter().enumerate() {
        writer
            .write_record([scan.to_string().as_str(), buffer.format(*value)])
            .map_err(report_error)?;
    }
    writer
        .flush()
        .map_err(|e| report_error(csv::Error::from(e)))?;
    Ok(())
}
