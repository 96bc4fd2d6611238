//! # Covariate Table Loading and Derivation
//!
//! This module is the only entry point for the behavioral/demographic table.
//! It reads a delimited text file with `polars`, keeps every cell as text,
//! enforces one row per subject and derives auxiliary regressors through a
//! small declarative rule set.
//!
//! - Raw cells are never coerced on load. A study label such as `Typo2/Soph` and
//!   a numeric age live side by side as text; numeric conversion happens only
//!   where a number is actually needed (interaction terms, design assembly).
//! - Derivation is a pure, row-local transform. Every derived cell is computed
//!   from raw or previously derived cells of the same row.

use ahash::{AHashMap, AHashSet};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::Path;
use thiserror::Error;

/// Cell contents treated as missing in addition to empty fields.
const MISSING_TOKENS: [&str; 6] = ["NA", "N/A", "NaN", "nan", "null", "None"];

#[derive(Error, Debug)]
pub enum CovariateError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    PolarsError(#[from] PolarsError),
    #[error("IO error while reading covariates: {0}")]
    IoError(#[from] std::io::Error),
    #[error(
        "The column '{0}' was not found in the covariate table. Please check spelling and case."
    )]
    MissingColumn(String),
    #[error("Row {row} of the covariate table has no subject id.")]
    MissingSubjectId { row: usize },
    #[error("Subject '{0}' appears more than once in the covariate table.")]
    DuplicateSubject(String),
    #[error(
        "Covariate '{column}' for subject '{subject_id}' is not numeric (found '{value}'), so it cannot enter an interaction term."
    )]
    NonNumeric {
        subject_id: String,
        column: String,
        value: String,
    },
    #[error("Derived column '{0}' would overwrite an existing column.")]
    ColumnConflict(String),
    #[error("The covariate delimiter {0:?} is not a single-byte ASCII character.")]
    InvalidDelimiter(char),
}

/// One cell of the covariate table.
#[derive(Clone, Debug, PartialEq)]
pub enum CovariateValue {
    Text(String),
    Number(f64),
    Missing,
}

impl CovariateValue {
    /// Classifies a raw cell read from the file.
    pub fn from_cell(cell: Option<&str>) -> Self {
        match cell.map(str::trim) {
            None => Self::Missing,
            Some(text) if text.is_empty() || MISSING_TOKENS.contains(&text) => Self::Missing,
            Some(text) => Self::Text(text.to_string()),
        }
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, Self::Missing)
    }

    /// Numeric view of the cell. `Ok(None)` for missing cells; `Err` carries the
    /// offending text for cells that do not parse as a finite number.
    pub fn as_number(&self) -> Result<Option<f64>, String> {
        match self {
            Self::Missing => Ok(None),
            Self::Number(value) => Ok(Some(*value)),
            Self::Text(text) => match lexical_core::parse::<f64>(text.as_bytes()) {
                Ok(value) if value.is_finite() => Ok(Some(value)),
                _ => Err(text.clone()),
            },
        }
    }

    /// Textual view used by the recode rules.
    fn as_text(&self) -> Option<String> {
        match self {
            Self::Missing => None,
            Self::Text(text) => Some(text.clone()),
            Self::Number(value) => Some(ryu::Buffer::new().format(*value).to_string()),
        }
    }
}

/// A single subject's covariates.
#[derive(Clone, Debug, PartialEq)]
pub struct CovariateRow {
    pub subject_id: String,
    pub raw: AHashMap<String, CovariateValue>,
    pub derived: AHashMap<String, CovariateValue>,
}

impl CovariateRow {
    /// Looks a column up, preferring derived values over raw ones.
    pub fn value(&self, column: &str) -> Option<&CovariateValue> {
        self.derived.get(column).or_else(|| self.raw.get(column))
    }
}

/// Describes where the covariate table comes from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CovariateSource {
    /// Column holding the subject identifier (the join key).
    pub subject_column: String,
    /// Field delimiter of the file.
    pub delimiter: char,
}

impl Default for CovariateSource {
    fn default() -> Self {
        Self {
            subject_column: "unique_mri_id".to_string(),
            delimiter: ',',
        }
    }
}

/// A declarative mapping from one or two columns to one derived column.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DerivationRule {
    /// `value == category ? 1 : 0`
    Equals {
        source: String,
        target: String,
        category: String,
    },
    /// `value.starts_with(prefix) ? 1 : 0`
    Prefix {
        source: String,
        target: String,
        prefix: String,
    },
    /// `value.starts_with(prefix) ? 1 : -1`
    SignedPrefix {
        source: String,
        target: String,
        prefix: String,
    },
    /// `value[left] * value[right]`, named `"{left}by{right}"`.
    Interaction { left: String, right: String },
    /// The same value on every row.
    Constant { target: String, value: f64 },
}

impl DerivationRule {
    pub fn interaction(left: &str, right: &str) -> Self {
        Self::Interaction {
            left: left.to_string(),
            right: right.to_string(),
        }
    }

    /// Name of the column this rule produces.
    pub fn target(&self) -> String {
        match self {
            Self::Equals { target, .. }
            | Self::Prefix { target, .. }
            | Self::SignedPrefix { target, .. }
            | Self::Constant { target, .. } => target.clone(),
            Self::Interaction { left, right } => interaction_name(left, right),
        }
    }

    fn sources(&self) -> Vec<&str> {
        match self {
            Self::Equals { source, .. }
            | Self::Prefix { source, .. }
            | Self::SignedPrefix { source, .. } => vec![source.as_str()],
            Self::Interaction { left, right } => vec![left.as_str(), right.as_str()],
            Self::Constant { .. } => Vec::new(),
        }
    }

    fn evaluate(&self, row: &CovariateRow) -> Result<CovariateValue, CovariateError> {
        let recode = |source: &str, hit: f64, miss: f64, test: &dyn Fn(&str) -> bool| {
            match row.value(source).and_then(CovariateValue::as_text) {
                None => CovariateValue::Missing,
                Some(text) if test(&text) => CovariateValue::Number(hit),
                Some(_) => CovariateValue::Number(miss),
            }
        };

        let value = match self {
            Self::Equals {
                source, category, ..
            } => recode(source, 1.0, 0.0, &|text| text == category.as_str()),
            Self::Prefix { source, prefix, .. } => {
                recode(source, 1.0, 0.0, &|text| text.starts_with(prefix.as_str()))
            }
            Self::SignedPrefix { source, prefix, .. } => {
                recode(source, 1.0, -1.0, &|text| text.starts_with(prefix.as_str()))
            }
            Self::Constant { value, .. } => CovariateValue::Number(*value),
            Self::Interaction { left, right } => {
                let operand = |column: &str| -> Result<Option<f64>, CovariateError> {
                    let Some(cell) = row.value(column) else {
                        return Ok(None);
                    };
                    cell.as_number().map_err(|value| CovariateError::NonNumeric {
                        subject_id: row.subject_id.clone(),
                        column: column.to_string(),
                        value,
                    })
                };
                match (operand(left)?, operand(right)?) {
                    (Some(a), Some(b)) => CovariateValue::Number(a * b),
                    _ => CovariateValue::Missing,
                }
            }
        };
        Ok(value)
    }
}

/// Name given to the product of two covariates.
pub fn interaction_name(left: &str, right: &str) -> String {
    format!("{left}by{right}")
}

/// Row-oriented covariate table keyed by subject id.
#[derive(Clone, Debug)]
pub struct CovariateTable {
    subject_column: String,
    raw_columns: Vec<String>,
    derived_columns: Vec<String>,
    rows: Vec<CovariateRow>,
    index: AHashMap<String, usize>,
}

impl CovariateTable {
    /// Builds a table from already-split records. `records[i][j]` is the cell of
    /// row `i` in column `columns[j]`.
    pub fn from_records(
        subject_column: &str,
        columns: &[String],
        records: &[Vec<Option<String>>],
    ) -> Result<Self, CovariateError> {
        let key_idx = columns
            .iter()
            .position(|c| c == subject_column)
            .ok_or_else(|| CovariateError::MissingColumn(subject_column.to_string()))?;

        let mut rows = Vec::with_capacity(records.len());
        let mut index = AHashMap::with_capacity(records.len());
        for (row_idx, record) in records.iter().enumerate() {
            let cell = |j: usize| record.get(j).and_then(|c| c.as_deref());
            let CovariateValue::Text(subject_id) = CovariateValue::from_cell(cell(key_idx))
            else {
                return Err(CovariateError::MissingSubjectId { row: row_idx + 1 });
            };
            if index.insert(subject_id.clone(), row_idx).is_some() {
                return Err(CovariateError::DuplicateSubject(subject_id));
            }

            let raw = columns
                .iter()
                .enumerate()
                .filter(|(j, _)| *j != key_idx)
                .map(|(j, name)| (name.clone(), CovariateValue::from_cell(cell(j))))
                .collect();
            rows.push(CovariateRow {
                subject_id,
                raw,
                derived: AHashMap::new(),
            });
        }

        Ok(Self {
            subject_column: subject_column.to_string(),
            raw_columns: columns
                .iter()
                .filter(|c| c.as_str() != subject_column)
                .cloned()
                .collect(),
            derived_columns: Vec::new(),
            rows,
            index,
        })
    }

    pub fn subject_column(&self) -> &str {
        &self.subject_column
    }

    /// Raw columns in file order, excluding the subject column.
    pub fn raw_columns(&self) -> &[String] {
        &self.raw_columns
    }

    /// Derived columns in rule order.
    pub fn derived_columns(&self) -> &[String] {
        &self.derived_columns
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.raw_columns.iter().any(|c| c == name) || self.derived_columns.iter().any(|c| c == name)
    }

    pub fn rows(&self) -> &[CovariateRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn row(&self, subject_id: &str) -> Option<&CovariateRow> {
        self.index.get(subject_id).map(|&i| &self.rows[i])
    }

    /// Subject ids in file order.
    pub fn subject_ids(&self) -> impl Iterator<Item = &str> {
        self.rows.iter().map(|r| r.subject_id.as_str())
    }

    /// Returns a table holding only the listed subjects, in file order. Ids with
    /// no row are ignored.
    pub fn restrict_to<'a>(&self, subject_ids: impl IntoIterator<Item = &'a str>) -> Self {
        let keep: AHashSet<&str> = subject_ids.into_iter().collect();
        let rows: Vec<CovariateRow> = self
            .rows
            .iter()
            .filter(|row| keep.contains(row.subject_id.as_str()))
            .cloned()
            .collect();
        let index = rows
            .iter()
            .enumerate()
            .map(|(i, row)| (row.subject_id.clone(), i))
            .collect();
        Self {
            subject_column: self.subject_column.clone(),
            raw_columns: self.raw_columns.clone(),
            derived_columns: self.derived_columns.clone(),
            rows,
            index,
        }
    }

    /// Returns a table with one derived column appended per rule, in rule order.
    /// Later rules may reference columns produced by earlier ones.
    pub fn derive(&self, rules: &[DerivationRule]) -> Result<Self, CovariateError> {
        let mut table = self.clone();
        for rule in rules {
            let target = rule.target();
            if table.has_column(&target) || target == table.subject_column {
                return Err(CovariateError::ColumnConflict(target));
            }
            for source in rule.sources() {
                if !table.has_column(source) {
                    return Err(CovariateError::MissingColumn(source.to_string()));
                }
            }

            let values = table
                .rows
                .iter()
                .map(|row| rule.evaluate(row))
                .collect::<Result<Vec<_>, _>>()?;
            for (row, value) in table.rows.iter_mut().zip(values) {
                row.derived.insert(target.clone(), value);
            }
            log::debug!("Derived covariate '{target}'");
            table.derived_columns.push(target);
        }
        Ok(table)
    }
}

/// Loads a delimited covariate file into a [`CovariateTable`].
pub fn load_covariates(
    path: &Path,
    source: &CovariateSource,
) -> Result<CovariateTable, CovariateError> {
    log::info!("Loading covariates from '{}'", path.display());

    let separator = u8::try_from(source.delimiter)
        .ok()
        .filter(u8::is_ascii)
        .ok_or(CovariateError::InvalidDelimiter(source.delimiter))?;
    // Every column is read as text; numeric parsing happens on demand.
    let df = CsvReader::new(File::open(path)?)
        .with_options(
            CsvReadOptions::default()
                .with_has_header(true)
                .with_infer_schema_length(Some(0))
                .with_parse_options(CsvParseOptions::default().with_separator(separator)),
        )
        .finish()?;

    let columns: Vec<String> = df
        .get_column_names()
        .into_iter()
        .map(|name| name.to_string())
        .collect();
    if !columns.iter().any(|c| c == &source.subject_column) {
        return Err(CovariateError::MissingColumn(source.subject_column.clone()));
    }

    let mut records: Vec<Vec<Option<String>>> = vec![Vec::with_capacity(columns.len()); df.height()];
    for name in &columns {
        let cells = df.column(name)?.str()?;
        for (record, cell) in records.iter_mut().zip(cells.into_iter()) {
            record.push(cell.map(str::to_string));
        }
    }

    let table = CovariateTable::from_records(&source.subject_column, &columns, &records)?;
    log::info!(
        "Loaded {} subjects with {} covariate columns",
        table.len(),
        table.raw_columns().len()
    );
    Ok(table)
}
