//! Group-level analyses over first-level effect maps.
//!
//! Both analyses discover one effect map per subject, build a design whose row
//! labels fix the order of the measurements handed to the fitting service, fit
//! once and write one statistic map per contrast.

use crate::assemble::{SubjectJoin, assemble, join_subjects};
use crate::contrast::{ContrastError, ContrastVector, contrasts_for, write_contrasts_tsv};
use crate::covariates::load_covariates;
use crate::matching::{
    AnalysisLevel, FilePattern, MeasurementFile, discover, single_file_per_subject,
};
use crate::matrix::{DesignMatrix, INTERCEPT_COLUMN};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use super::PipelineError;
use super::config::{GroupConfig, RegressionConfig};
use super::paths::{
    GROUP_MEAN_DIR, contrast_map_path, contrast_report_path, design_report_path, ensure_dir,
    group_mean_path, parent_or_current,
};
use super::progress::{PipelineStage, ProgressObserver};
use super::service::{FittedModel, ModelFittingService, StatisticVolume};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupMeanOutput {
    pub subjects: Vec<String>,
    pub map: PathBuf,
}

/// Discovers the group's effect maps, one per subject, keyed by subject id.
fn discover_effect_maps(
    data_dir: &Path,
    config: &GroupConfig,
) -> Result<BTreeMap<String, MeasurementFile>, PipelineError> {
    let pattern = FilePattern::new(&config.measurement_pattern)?;
    let files = discover(
        data_dir,
        &pattern,
        &config.subject_rule,
        AnalysisLevel::Second,
    )?;
    if files.is_empty() {
        return Err(PipelineError::EmptyInputSet {
            what: "effect maps",
            dir: data_dir.to_path_buf(),
            pattern: config.measurement_pattern.clone(),
        });
    }
    Ok(single_file_per_subject(&files)?)
}

/// One-sample group mean: an intercept-only model over every subject's effect
/// map, written as `zmap_{tag}_seeded` next to the data directory.
pub fn run_group_mean<S: ModelFittingService>(
    data_dir: &Path,
    output_tag: &str,
    config: &GroupConfig,
    service: &S,
) -> Result<GroupMeanOutput, PipelineError> {
    let maps = discover_effect_maps(data_dir, config)?;
    let subjects: Vec<String> = maps.keys().cloned().collect();
    let measurements: Vec<PathBuf> = maps.into_values().map(|f| f.path).collect();

    let output_dir = config
        .output_dir
        .clone()
        .unwrap_or_else(|| parent_or_current(data_dir).join(GROUP_MEAN_DIR));
    ensure_dir(&output_dir)?;

    let design = DesignMatrix::intercept(subjects.clone());
    log::info!("Fitting group mean over {} subject(s)", subjects.len());
    let model = service.fit(&measurements, &design)?;
    let contrast = ContrastVector::one_hot(&design, INTERCEPT_COLUMN)?;
    let volume = model.compute(&contrast, config.statistic)?;

    let map = group_mean_path(&output_dir, output_tag, &config.output_extension);
    volume.save(&map)?;
    log::info!("Wrote group mean {}", map.display());
    Ok(GroupMeanOutput { subjects, map })
}

/// Inputs of a covariate regression.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegressionRequest {
    pub data_dir: PathBuf,
    pub covariates: PathBuf,
    pub effect_1: String,
    pub effect_2: String,
    pub output_tag: String,
}

/// Everything a regression run needs before any collaborator is involved.
///
/// `measurements[i]` belongs to `design.row_labels()[i]`.
#[derive(Clone, Debug)]
pub struct RegressionPlan {
    pub join: SubjectJoin,
    pub design: DesignMatrix,
    pub measurements: Vec<PathBuf>,
    pub contrasts: Vec<ContrastVector>,
    pub output_dir: PathBuf,
}

/// Discovers, loads, joins, derives over the matched subjects and assembles,
/// then generates the contrasts:
/// one per effect, one for their interaction, then the configured composites.
pub fn plan_regression(
    request: &RegressionRequest,
    group: &GroupConfig,
    regression: &RegressionConfig,
) -> Result<RegressionPlan, PipelineError> {
    let maps = discover_effect_maps(&request.data_dir, group)?;

    let raw = load_covariates(&request.covariates, &regression.covariates)?;
    let join = join_subjects(maps.keys().map(String::as_str), &raw);
    if join.matched.is_empty() {
        return Err(PipelineError::NoMatchedSubjects {
            measured: maps.len(),
            covaried: raw.len(),
        });
    }
    join.log_exclusions();

    // Excluded subjects never reach derivation, so their cells cannot fail the run.
    let table = raw
        .restrict_to(join.matched.iter().map(String::as_str))
        .derive(&regression.rules_with_interaction(&request.effect_1, &request.effect_2))?;

    let order = regression.canonical_order(&request.effect_1, &request.effect_2);
    let design = assemble(&join, &table, &order)?;

    let measurements = design
        .row_labels()
        .iter()
        .map(|subject_id| {
            maps.get(subject_id)
                .map(|file| file.path.clone())
                .ok_or_else(|| PipelineError::UnalignedRow(subject_id.clone()))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let targets: Vec<&String> = order.effects.iter().chain(order.interaction.iter()).collect();
    let mut contrasts = contrasts_for(&design, &targets)?;
    for composite in &regression.contrasts {
        if contrasts.iter().any(|c| c.name() == composite.name) {
            return Err(ContrastError::DuplicateTarget(composite.name.clone()).into());
        }
        let terms: Vec<(&str, f64)> = composite
            .weights
            .iter()
            .map(|(column, weight)| (column.as_str(), *weight))
            .collect();
        contrasts.push(ContrastVector::composite(&design, &composite.name, &terms)?);
    }

    let output_dir = group
        .output_dir
        .clone()
        .unwrap_or_else(|| parent_or_current(&request.covariates));

    Ok(RegressionPlan {
        join,
        design,
        measurements,
        contrasts,
        output_dir,
    })
}

/// Writes the design matrix and contrast weights as TSV reports and returns
/// their paths.
pub fn write_plan_reports(
    plan: &RegressionPlan,
    output_tag: &str,
    subject_column: &str,
) -> Result<(PathBuf, PathBuf), PipelineError> {
    ensure_dir(&plan.output_dir)?;
    let design_path = design_report_path(&plan.output_dir, output_tag);
    plan.design.write_tsv(&design_path, subject_column)?;
    let contrast_path = contrast_report_path(&plan.output_dir, output_tag);
    write_contrasts_tsv(&contrast_path, &plan.design, &plan.contrasts)?;
    Ok((design_path, contrast_path))
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegressionOutput {
    pub design_report: PathBuf,
    pub contrast_report: PathBuf,
    /// `(contrast name, written map)` in contrast order.
    pub maps: Vec<(String, PathBuf)>,
}

/// Fits the regression model once and writes one statistic map per contrast.
pub fn run_regression<S: ModelFittingService>(
    request: &RegressionRequest,
    group: &GroupConfig,
    regression: &RegressionConfig,
    service: &S,
    progress: &dyn ProgressObserver,
) -> Result<RegressionOutput, PipelineError> {
    let plan = plan_regression(request, group, regression)?;
    let (design_report, contrast_report) = write_plan_reports(
        &plan,
        &request.output_tag,
        &regression.covariates.subject_column,
    )?;

    log::info!(
        "Fitting regression over {} subject(s) with {} contrast(s)",
        plan.design.nrows(),
        plan.contrasts.len()
    );
    let model = service.fit(&plan.measurements, &plan.design)?;

    let stage = PipelineStage::GroupContrasts;
    progress.on_stage_start(stage, plan.contrasts.len());
    let mut maps = Vec::with_capacity(plan.contrasts.len());
    for (done, contrast) in plan.contrasts.iter().enumerate() {
        let volume = model.compute(contrast, group.statistic)?;
        let path = contrast_map_path(
            &plan.output_dir,
            &request.output_tag,
            contrast.name(),
            &group.output_extension,
        );
        volume.save(&path)?;
        log::info!("Wrote contrast '{}' to {}", contrast.name(), path.display());
        maps.push((contrast.name().to_string(), path));
        progress.on_stage_advance(stage, done + 1);
    }
    progress.on_stage_finish(stage);

    Ok(RegressionOutput {
        design_report,
        contrast_report,
        maps,
    })
}
