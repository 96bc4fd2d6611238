//! Deterministic output naming.
//!
//! Every artifact name encodes the identifiers it was produced from, so the file
//! on disk can always be traced back to its subject, mask and contrast. The
//! effect-map name is also the input convention of the group stage: field 2 of
//! `beta_values_{subject}_{mask}_seed` is the subject id.

use crate::matching::strip_extensions;
use std::fs;
use std::path::{Path, PathBuf};

use super::PipelineError;

pub const TIMESERIES_DIR: &str = "timeseries_output";
pub const EFFECT_MAP_DIR: &str = "betavalues_output";
pub const GROUP_MEAN_DIR: &str = "zmap_output";

/// Tag used for a mask in output names: its file name without extensions.
pub fn file_tag(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    strip_extensions(&name).to_string()
}

pub fn timeseries_path(dir: &Path, subject_id: &str, mask_tag: &str) -> PathBuf {
    dir.join(format!("timeseries_{subject_id}_{mask_tag}_mask.tsv"))
}

pub fn effect_map_path(dir: &Path, subject_id: &str, mask_tag: &str, extension: &str) -> PathBuf {
    dir.join(with_extension(
        format!("beta_values_{subject_id}_{mask_tag}_seed"),
        extension,
    ))
}

pub fn group_mean_path(dir: &Path, output_tag: &str, extension: &str) -> PathBuf {
    dir.join(with_extension(format!("zmap_{output_tag}_seeded"), extension))
}

pub fn contrast_map_path(dir: &Path, output_tag: &str, contrast: &str, extension: &str) -> PathBuf {
    dir.join(with_extension(
        format!("{output_tag}_{contrast}_voxelwise"),
        extension,
    ))
}

pub fn design_report_path(dir: &Path, output_tag: &str) -> PathBuf {
    dir.join(format!("{output_tag}_design_matrix.tsv"))
}

pub fn contrast_report_path(dir: &Path, output_tag: &str) -> PathBuf {
    dir.join(format!("{output_tag}_contrasts.tsv"))
}

/// Parent of `path`, or the current directory for bare relative names.
pub fn parent_or_current(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

pub fn ensure_dir(path: &Path) -> Result<(), PipelineError> {
    fs::create_dir_all(path).map_err(|source| PipelineError::OutputDir {
        path: path.to_path_buf(),
        source,
    })
}

fn with_extension(stem: String, extension: &str) -> String {
    let extension = extension.trim_start_matches('.');
    if extension.is_empty() {
        stem
    } else {
        format!("{stem}.{extension}")
    }
}
