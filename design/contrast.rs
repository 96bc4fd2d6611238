//! Contrast vectors resolved by column name against a live design matrix.
//!
//! A contrast never stores a position computed elsewhere: every index is looked
//! up in the design the contrast will be applied to, so reordering the design's
//! columns cannot detach a contrast from the column it is meant to test.

use crate::matrix::DesignMatrix;
use ndarray::Array1;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ContrastError {
    #[error("Contrast target '{target}' is not a column of the design matrix (columns: {available}).")]
    UnknownTarget { target: String, available: String },
    #[error("Contrast target '{0}' was requested more than once.")]
    DuplicateTarget(String),
    #[error("Failed to write contrast report '{path}': {source}")]
    Report {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
}

/// A named weight vector over the columns of one design matrix.
#[derive(Clone, Debug, PartialEq)]
pub struct ContrastVector {
    name: String,
    weights: Array1<f64>,
}

impl ContrastVector {
    /// One-hot contrast selecting the column called `target`.
    pub fn one_hot(design: &DesignMatrix, target: &str) -> Result<Self, ContrastError> {
        Self::composite(design, target, &[(target, 1.0)])
    }

    /// Weighted combination of named columns. Terms naming the same column add up.
    pub fn composite(
        design: &DesignMatrix,
        name: &str,
        terms: &[(&str, f64)],
    ) -> Result<Self, ContrastError> {
        let mut weights = Array1::zeros(design.ncols());
        for (column, weight) in terms {
            let idx = resolve(design, column)?;
            weights[idx] += weight;
        }
        Ok(Self {
            name: name.to_string(),
            weights,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn weights(&self) -> &Array1<f64> {
        &self.weights
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    /// Index of the single non-zero weight, if the contrast is one-hot.
    pub fn target_index(&self) -> Option<usize> {
        let mut nonzero = self
            .weights
            .iter()
            .enumerate()
            .filter(|(_, w)| **w != 0.0);
        match (nonzero.next(), nonzero.next()) {
            (Some((idx, &w)), None) if w == 1.0 => Some(idx),
            _ => None,
        }
    }
}

fn resolve(design: &DesignMatrix, column: &str) -> Result<usize, ContrastError> {
    design
        .column_index(column)
        .ok_or_else(|| ContrastError::UnknownTarget {
            target: column.to_string(),
            available: design.column_names().join(", "),
        })
}

/// One one-hot contrast per target, in target order.
pub fn contrasts_for<S: AsRef<str>>(
    design: &DesignMatrix,
    targets: &[S],
) -> Result<Vec<ContrastVector>, ContrastError> {
    let mut seen = HashSet::with_capacity(targets.len());
    targets
        .iter()
        .map(|target| {
            let target = target.as_ref();
            if !seen.insert(target) {
                return Err(ContrastError::DuplicateTarget(target.to_string()));
            }
            ContrastVector::one_hot(design, target)
        })
        .collect()
}

/// Writes one row per contrast: the contrast name followed by its weights, with
/// the design's column names as header.
pub fn write_contrasts_tsv(
    path: &Path,
    design: &DesignMatrix,
    contrasts: &[ContrastVector],
) -> Result<(), ContrastError> {
    let report_error = |source| ContrastError::Report {
        path: path.to_path_buf(),
        source,
    };
    let mut writer = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .from_path(path)
        .map_err(report_error)?;

    let mut header = vec!["contrast"];
    header.extend(design.column_names().iter().map(String::as_str));
    writer.write_record(&header).map_err(report_error)?;

    let mut buffer = ryu::Buffer::new();
    for contrast in contrasts {
        let mut record = vec![contrast.name().to_string()];
        record.extend(
            contrast
                .weights()
                .iter()
                .map(|w| buffer.format(*w).to_string()),
        );
        writer.write_record(&record).map_err(report_error)?;
    }
    writer
        .flush()
        .map_err(|e| report_error(csv::Error::from(e)))?;
    Ok(())
}
