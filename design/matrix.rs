use itertools::Itertools;
use ndarray::{Array2, ArrayView1, ArrayView2};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Name of the single column of an intercept-only design.
pub const INTERCEPT_COLUMN: &str = "intercept";

#[derive(Error, Debug)]
pub enum DesignError {
    #[error("The column '{0}' is required by the design but is not in the covariate table.")]
    MissingColumn(String),
    #[error("Subject '{subject_id}' has no value for covariate '{column}'. The design matrix must be complete.")]
    IncompleteCovariate { subject_id: String, column: String },
    #[error(
        "Covariate '{column}' for subject '{subject_id}' is not numeric (found '{value}')."
    )]
    NonNumeric {
        subject_id: String,
        column: String,
        value: String,
    },
    #[error("Column '{0}' appears more than once in the design.")]
    DuplicateColumn(String),
    #[error("The design has no columns.")]
    NoColumns,
    #[error(
        "Design values have shape {found:?} but {rows} row labels and {columns} column names were given."
    )]
    ShapeMismatch {
        found: (usize, usize),
        rows: usize,
        columns: usize,
    },
    #[error("Failed to write design report '{path}': {source}")]
    Report {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
}

/// A numeric design matrix with named columns and labelled rows.
///
/// The row labels are authoritative: any per-row input handed to a model
/// fitting service alongside this matrix must follow the same order.
#[derive(Clone, Debug, PartialEq)]
pub struct DesignMatrix {
    row_labels: Vec<String>,
    columns: Vec<String>,
    values: Array2<f64>,
}

impl DesignMatrix {
    pub fn new(
        row_labels: Vec<String>,
        columns: Vec<String>,
        values: Array2<f64>,
    ) -> Result<Self, DesignError> {
        if columns.is_empty() {
            return Err(DesignError::NoColumns);
        }
        if let Some(duplicate) = columns.iter().duplicates().next() {
            return Err(DesignError::DuplicateColumn(duplicate.clone()));
        }
        if values.dim() != (row_labels.len(), columns.len()) {
            return Err(DesignError::ShapeMismatch {
                found: values.dim(),
                rows: row_labels.len(),
                columns: columns.len(),
            });
        }
        Ok(Self {
            row_labels,
            columns,
            values,
        })
    }

    /// The simple group-mean design: a single column of ones.
    pub fn intercept(row_labels: Vec<String>) -> Self {
        let n = row_labels.len();
        Self {
            row_labels,
            columns: vec![INTERCEPT_COLUMN.to_string()],
            values: Array2::ones((n, 1)),
        }
    }

    pub fn row_labels(&self) -> &[String] {
        &self.row_labels
    }

    pub fn column_names(&self) -> &[String] {
        &self.columns
    }

    /// Position of `name` in the current column order.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn column(&self, name: &str) -> Option<ArrayView1<'_, f64>> {
        self.column_index(name).map(|idx| self.values.column(idx))
    }

    pub fn values(&self) -> ArrayView2<'_, f64> {
        self.values.view()
    }

    pub fn nrows(&self) -> usize {
        self.values.nrows()
    }

    pub fn ncols(&self) -> usize {
        self.values.ncols()
    }

    /// Writes the matrix as a tab-separated table with the row labels in a
    /// leading column called `row_header`.
    pub fn write_tsv(&self, path: &Path, row_header: &str) -> Result<(), DesignError> {
        let report_error = |source| DesignError::Report {
            path: path.to_path_buf(),
            source,
        };
        let mut writer = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .from_path(path)
            .map_err(report_error)?;

        let mut header = Vec::with_capacity(self.columns.len() + 1);
        header.push(row_header);
        header.extend(self.columns.iter().map(String::as_str));
        writer.write_record(&header).map_err(report_error)?;

        let mut buffer = ryu::Buffer::new();
        for (label, row) in self.row_labels.iter().zip(self.values.rows()) {
            let mut record = Vec::with_capacity(row.len() + 1);
            record.push(label.clone());
            record.extend(row.iter().map(|v| buffer.format(*v).to_string()));
            writer.write_record(&record).map_err(report_error)?;
        }
        writer
            .flush()
            .map_err(|e| report_error(csv::Error::from(e)))?;
        Ok(())
    }
}
