//! # Design Matrix Assembly
//!
//! Joins the subjects that have measurement files against the covariate table and
//! lays the matched rows out as a numeric design matrix.
//!
//! The join is explicit. Subjects present on only one side are excluded from the
//! model, and both exclusion lists are returned so callers can log or assert on
//! them instead of losing subjects without a trace.
//!
//! Column order is canonical: every effect of interest, then the interaction
//! term, then nuisance regressors in declaration order. Rows are sorted by
//! subject id, and that order is the one the caller must use for the
//! measurement list handed to the model fitting service.

use crate::covariates::CovariateTable;
use crate::matrix::{DesignError, DesignMatrix};
use itertools::Itertools;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Result of joining measurement subjects against covariate subjects.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SubjectJoin {
    /// Present in both sources; these are the rows of the design.
    pub matched: Vec<String>,
    /// Have a measurement file but no covariate row.
    pub measurement_only: Vec<String>,
    /// Have a covariate row but no measurement file.
    pub covariate_only: Vec<String>,
}

impl SubjectJoin {
    pub fn is_complete(&self) -> bool {
        self.measurement_only.is_empty() && self.covariate_only.is_empty()
    }

    /// Emits the exclusion lists at `warn` level.
    pub fn log_exclusions(&self) {
        if !self.measurement_only.is_empty() {
            log::warn!(
                "Excluding {} subject(s) with measurements but no covariates: {}",
                self.measurement_only.len(),
                self.measurement_only.join(", ")
            );
        }
        if !self.covariate_only.is_empty() {
            log::warn!(
                "Excluding {} subject(s) with covariates but no measurements: {}",
                self.covariate_only.len(),
                self.covariate_only.join(", ")
            );
        }
    }
}

/// Inner join of measurement subject ids against the covariate table.
/// All three lists are sorted lexicographically and de-duplicated.
pub fn join_subjects<'a>(
    measurement_ids: impl IntoIterator<Item = &'a str>,
    table: &CovariateTable,
) -> SubjectJoin {
    let measured: BTreeSet<&str> = measurement_ids.into_iter().collect();
    let covaried: BTreeSet<&str> = table.subject_ids().collect();

    SubjectJoin {
        matched: measured
            .intersection(&covaried)
            .map(|s| s.to_string())
            .collect(),
        measurement_only: measured
            .difference(&covaried)
            .map(|s| s.to_string())
            .collect(),
        covariate_only: covaried
            .difference(&measured)
            .map(|s| s.to_string())
            .collect(),
    }
}

/// Canonical column layout of a group design.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CanonicalOrder {
    pub effects: Vec<String>,
    pub interaction: Option<String>,
    pub nuisance: Vec<String>,
}

impl CanonicalOrder {
    /// Final column list. The join key is dropped if it was listed, since it
    /// identifies rows rather than carrying a regressor.
    pub fn columns(&self, join_key: &str) -> Result<Vec<String>, DesignError> {
        let columns: Vec<String> = self
            .effects
            .iter()
            .chain(self.interaction.iter())
            .chain(self.nuisance.iter())
            .filter(|name| name.as_str() != join_key)
            .cloned()
            .collect();

        if columns.is_empty() {
            return Err(DesignError::NoColumns);
        }
        if let Some(duplicate) = columns.iter().duplicates().next() {
            return Err(DesignError::DuplicateColumn(duplicate.clone()));
        }
        Ok(columns)
    }
}

/// Builds the group design matrix for the matched subjects.
pub fn assemble(
    join: &SubjectJoin,
    table: &CovariateTable,
    order: &CanonicalOrder,
) -> Result<DesignMatrix, DesignError> {
    let columns = order.columns(table.subject_column())?;
    if let Some(missing) = columns.iter().find(|c| !table.has_column(c)) {
        return Err(DesignError::MissingColumn(missing.clone()));
    }

    let subjects: Vec<String> = join.matched.iter().sorted().dedup().cloned().collect();

    let mut values = Array2::zeros((subjects.len(), columns.len()));
    for (i, subject_id) in subjects.iter().enumerate() {
        let row = table
            .row(subject_id)
            .ok_or_else(|| DesignError::MissingColumn(table.subject_column().to_string()))?;
        for (j, column) in columns.iter().enumerate() {
            let incomplete = || DesignError::IncompleteCovariate {
                subject_id: subject_id.clone(),
                column: column.clone(),
            };
            let cell = row.value(column).ok_or_else(incomplete)?;
            values[[i, j]] = cell
                .as_number()
                .map_err(|value| DesignError::NonNumeric {
                    subject_id: subject_id.clone(),
                    column: column.clone(),
                    value,
                })?
                .ok_or_else(incomplete)?;
        }
    }

    let design = DesignMatrix::new(subjects, columns, values)?;
    warn_on_constant_columns(&design, order);
    log::info!(
        "Assembled design matrix: {} subjects x {} columns [{}]",
        design.nrows(),
        design.ncols(),
        design.column_names().join(", ")
    );
    Ok(design)
}

/// A non-intercept column that does not vary is collinear with any intercept.
fn warn_on_constant_columns(design: &DesignMatrix, order: &CanonicalOrder) {
    if design.nrows() < 2 {
        return;
    }
    let regressors = order.effects.iter().chain(order.interaction.iter());
    for name in regressors {
        if let Some(column) = design.column(name) {
            if column.iter().all_equal() {
                log::warn!("Column '{name}' is constant across all matched subjects");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::covariates::{CovariateTable, DerivationRule};
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;

    fn table(rows: &[(&str, &str, &str, &str)]) -> CovariateTable {
        let columns: Vec<String> = ["unique_mri_id", "score", "age", "Sex"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let records: Vec<Vec<Option<String>>> = rows
            .iter()
            .map(|(id, score, age, sex)| {
                [id, score, age, sex]
                    .iter()
                    .map(|cell| Some(cell.to_string()))
                    .collect()
            })
            .collect();
        CovariateTable::from_records("unique_mri_id", &columns, &records)
            .unwrap()
            .derive(&[
                DerivationRule::SignedPrefix {
                    source: "Sex".into(),
                    target: "reg_sex".into(),
                    prefix: "M".into(),
                },
                DerivationRule::interaction("score", "age"),
                DerivationRule::Constant {
                    target: "constant".into(),
                    value: 1.0,
                },
            ])
            .unwrap()
    }

    fn standard_table() -> CovariateTable {
        table(&[
            ("sub03", "3", "30", "M"),
            ("sub01", "1", "10", "F"),
            ("sub02", "2", "20", "M"),
            ("sub04", "4", "40", "F"),
        ])
    }

    fn order(nuisance: &[&str]) -> CanonicalOrder {
        CanonicalOrder {
            effects: vec!["score".into(), "age".into()],
            interaction: Some("scorebyage".into()),
            nuisance: nuisance.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn join_reports_both_exclusion_sets() {
        let join = join_subjects(["sub02", "sub01", "sub09", "sub01"], &standard_table());
        assert_eq!(join.matched, vec!["sub01", "sub02"]);
        assert_eq!(join.measurement_only, vec!["sub09"]);
        assert_eq!(join.covariate_only, vec!["sub03", "sub04"]);
        assert!(!join.is_complete());
    }

    #[test]
    fn canonical_order_puts_effects_then_interaction_then_nuisance() {
        let columns = order(&["reg_sex", "unique_mri_id", "constant"])
            .columns("unique_mri_id")
            .unwrap();
        assert_eq!(columns, vec!["score", "age", "scorebyage", "reg_sex", "constant"]);
    }

    #[test]
    fn canonical_order_rejects_repeated_names() {
        let err = order(&["age"]).columns("unique_mri_id").unwrap_err();
        assert!(matches!(err, DesignError::DuplicateColumn(name) if name == "age"));
        assert!(matches!(
            CanonicalOrder::default().columns("id"),
            Err(DesignError::NoColumns)
        ));
    }

    #[test]
    fn assembled_rows_are_the_sorted_matched_subjects() {
        let table = standard_table();
        let join = join_subjects(["sub04", "sub02", "sub03"], &table);
        let design = assemble(&join, &table, &order(&["constant", "reg_sex"])).unwrap();

        assert_eq!(design.row_labels(), &["sub02", "sub03", "sub04"]);
        assert_eq!(
            design.column_names(),
            &["score", "age", "scorebyage", "constant", "reg_sex"]
        );
        assert_eq!(design.values().row(0).to_vec(), vec![2.0, 20.0, 40.0, 1.0, 1.0]);
        assert_eq!(design.values().row(2).to_vec(), vec![4.0, 40.0, 160.0, 1.0, -1.0]);
    }

    #[test]
    fn row_order_is_independent_of_input_order() {
        let table = standard_table();
        let mut ids = vec!["sub01", "sub02", "sub03", "sub04"];
        let reference = assemble(&join_subjects(ids.clone(), &table), &table, &order(&[])).unwrap();

        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..10 {
            ids.shuffle(&mut rng);
            let join = join_subjects(ids.clone(), &table);
            let design = assemble(&join, &table, &order(&[])).unwrap();
            assert_eq!(design, reference);

            let mut resorted = design.row_labels().to_vec();
            resorted.sort();
            assert_eq!(resorted, design.row_labels());
        }
    }

    #[test]
    fn subject_without_covariates_is_excluded_not_fatal() {
        let table = standard_table();
        let join = join_subjects(["sub01", "sub99"], &table);
        let design = assemble(&join, &table, &order(&["constant"])).unwrap();
        assert_eq!(design.row_labels(), &["sub01"]);
        assert_eq!(join.measurement_only, vec!["sub99"]);
    }

    #[test]
    fn missing_cell_names_subject_and_column() {
        let table = table(&[("sub01", "1", "10", "F"), ("sub02", "2", "NA", "M")]);
        let join = join_subjects(["sub01", "sub02"], &table);
        let err = assemble(&join, &table, &order(&[])).unwrap_err();
        match err {
            DesignError::IncompleteCovariate { subject_id, column } => {
                assert_eq!(subject_id, "sub02");
                assert_eq!(column, "age");
            }
            other => panic!("Expected IncompleteCovariate, got {other:?}"),
        }
    }

    #[test]
    fn text_cell_in_design_column_is_rejected() {
        let table = standard_table();
        let join = join_subjects(["sub01"], &table);
        let err = assemble(&join, &table, &order(&["Sex"])).unwrap_err();
        assert!(matches!(
            err,
            DesignError::NonNumeric { ref column, ref value, .. } if column == "Sex" && value == "F"
        ));
    }

    #[test]
    fn unknown_nuisance_column_is_rejected() {
        let table = standard_table();
        let join = join_subjects(["sub01"], &table);
        let err = assemble(&join, &table, &order(&["scanner"])).unwrap_err();
        assert!(matches!(err, DesignError::MissingColumn(name) if name == "scanner"));
    }
}
