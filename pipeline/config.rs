//! Explicit configuration for every pipeline stage.
//!
//! Each stage receives the section it needs; nothing is read from process-wide
//! state. Every field has a default reproducing the conventions of the existing
//! imaging outputs, so a config file only needs to list what differs.

use crate::assemble::CanonicalOrder;
use crate::covariates::{CovariateSource, DerivationRule};
use crate::matching::PositionalRule;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use super::PipelineError;
use super::service::StatisticKind;

/// Column name of the seed series in a first-level design.
pub const SEED_COLUMN: &str = "seed_regressor";

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub backend: BackendConfig,
    pub first_level: FirstLevelConfig,
    pub group: GroupConfig,
    pub regression: RegressionConfig,
}

impl PipelineConfig {
    pub fn load(path: &Path) -> Result<Self, PipelineError> {
        let text = fs::read_to_string(path)?;
        toml::from_str(&text).map_err(|source| PipelineError::Config {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// External program that implements the fitting, masking and basis services.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub program: String,
    /// Arguments placed before the verb on every invocation.
    pub args: Vec<String>,
    /// Extension the backend writes statistic volumes with.
    pub volume_extension: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            program: "seedglm-backend".to_string(),
            args: Vec::new(),
            volume_extension: "nii.gz".to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FirstLevelConfig {
    /// Glob selecting the preprocessed 4D images in the data directory.
    pub image_pattern: String,
    /// Glob selecting mask images in the mask directory.
    pub mask_pattern: String,
    pub subject_rule: PositionalRule,
    /// Repetition time in seconds.
    pub repetition_time: f64,
    pub seed_column: String,
    pub statistic: StatisticKind,
    pub output_extension: String,
    /// Root for `timeseries_output/` and `betavalues_output/`. Defaults to the
    /// parent of the mask directory.
    pub output_root: Option<PathBuf>,
}

impl Default for FirstLevelConfig {
    fn default() -> Self {
        Self {
            image_pattern: "*processed.nii.gz".to_string(),
            mask_pattern: "*.nii*".to_string(),
            subject_rule: PositionalRule::new("_", 1),
            repetition_time: 2.0,
            seed_column: SEED_COLUMN.to_string(),
            statistic: StatisticKind::EffectSize,
            output_extension: "nii.gz".to_string(),
            output_root: None,
        }
    }
}

/// Discovery and output settings shared by both group-level analyses.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupConfig {
    pub measurement_pattern: String,
    pub subject_rule: PositionalRule,
    pub statistic: StatisticKind,
    pub output_extension: String,
    /// Overrides the default output directory of either group analysis.
    pub output_dir: Option<PathBuf>,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            measurement_pattern: "beta_values_*_seed.nii.gz".to_string(),
            subject_rule: PositionalRule::new("_", 2),
            statistic: StatisticKind::ZScore,
            output_extension: "nii.gz".to_string(),
            output_dir: None,
        }
    }
}

impl GroupConfig {
    /// Narrows discovery to the effect maps of one mask by appending
    /// `_{mask_tag}` to the last wildcard of the configured pattern.
    /// A pattern without a wildcard is kept as is.
    pub fn for_mask(&self, mask_tag: &str) -> Self {
        let pattern = &self.measurement_pattern;
        let measurement_pattern = match pattern.rfind('*') {
            Some(star) => format!("{}_{mask_tag}{}", &pattern[..=star], &pattern[star + 1..]),
            None => {
                log::warn!("Pattern '{pattern}' has no wildcard; mask '{mask_tag}' is not applied");
                pattern.clone()
            }
        };
        Self {
            measurement_pattern,
            ..self.clone()
        }
    }
}

/// A weighted contrast declared in the config file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CompositeContrast {
    pub name: String,
    pub weights: BTreeMap<String, f64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegressionConfig {
    pub covariates: CovariateSource,
    /// Rules applied in order before the interaction of the two effects.
    pub derive: Vec<DerivationRule>,
    /// Nuisance columns, in design order.
    pub nuisance: Vec<String>,
    pub contrasts: Vec<CompositeContrast>,
}

impl Default for RegressionConfig {
    fn default() -> Self {
        Self {
            covariates: CovariateSource::default(),
            derive: vec![
                DerivationRule::Equals {
                    source: "Study".to_string(),
                    target: "reg_sophis".to_string(),
                    category: "Typo2/Soph".to_string(),
                },
                DerivationRule::Prefix {
                    source: "site".to_string(),
                    target: "reg_site".to_string(),
                    prefix: "L".to_string(),
                },
                DerivationRule::SignedPrefix {
                    source: "Sex".to_string(),
                    target: "reg_sex".to_string(),
                    prefix: "M".to_string(),
                },
                DerivationRule::Constant {
                    target: "constant".to_string(),
                    value: 1.0,
                },
            ],
            nuisance: ["constant", "reg_sophis", "reg_site", "reg_sex", "age", "scanner", "scanOrder"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            contrasts: Vec::new(),
        }
    }
}

impl RegressionConfig {
    /// Canonical order for a two-effect model with their interaction. A nuisance
    /// entry naming one of the effects is moved to the front with the effects
    /// rather than listed twice.
    pub fn canonical_order(&self, effect_1: &str, effect_2: &str) -> CanonicalOrder {
        let interaction = crate::covariates::interaction_name(effect_1, effect_2);
        let nuisance = self
            .nuisance
            .iter()
            .filter(|name| {
                let promoted = [effect_1, effect_2, interaction.as_str()].contains(&name.as_str());
                if promoted {
                    log::debug!("Nuisance column '{name}' is an effect of interest; not repeating it");
                }
                !promoted
            })
            .cloned()
            .collect();
        CanonicalOrder {
            effects: vec![effect_1.to_string(), effect_2.to_string()],
            interaction: Some(interaction),
            nuisance,
        }
    }

    /// Configured rules followed by the interaction of the two effects.
    pub fn rules_with_interaction(&self, effect_1: &str, effect_2: &str) -> Vec<DerivationRule> {
        let mut rules = self.derive.clone();
        rules.push(DerivationRule::interaction(effect_1, effect_2));
        rules
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn empty_file_yields_defaults() {
        let file = NamedTempFile::new().unwrap();
        let config = PipelineConfig::load(file.path()).unwrap();
        assert_eq!(config, PipelineConfig::default());
        assert_eq!(config.group.subject_rule, PositionalRule::new("_", 2));
        assert_eq!(config.first_level.repetition_time, 2.0);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[backend]
program = "python3"
args = ["fit_glm.py"]

[group]
statistic = "stat"

[group.subject_rule]
delimiter = "-"
index = 1

[regression]
nuisance = ["constant", "age"]

[[regression.contrasts]]
name = "age_minus_iq"
weights = {{ age = 1.0, iq = -1.0 }}
"#
        )
        .unwrap();
        let config = PipelineConfig::load(file.path()).unwrap();

        assert_eq!(config.backend.program, "python3");
        assert_eq!(config.backend.args, vec!["fit_glm.py"]);
        assert_eq!(config.group.statistic, StatisticKind::Stat);
        assert_eq!(config.group.subject_rule, PositionalRule::new("-", 1));
        assert_eq!(config.group.measurement_pattern, "beta_values_*_seed.nii.gz");
        assert_eq!(config.regression.nuisance, vec!["constant", "age"]);
        assert_eq!(config.regression.derive.len(), 4);
        assert_eq!(config.regression.contrasts[0].weights["iq"], -1.0);
    }

    #[test]
    fn invalid_config_names_the_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "[group]\nstatistic = \"median\"\n").unwrap();
        let err = PipelineConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, PipelineError::Config { .. }));
    }

    #[test]
    fn canonical_order_puts_interaction_after_effects() {
        let config = RegressionConfig::default();
        let order = config.canonical_order("reading", "age");
        assert_eq!(order.effects, vec!["reading", "age"]);
        assert_eq!(order.interaction.as_deref(), Some("readingbyage"));
        assert_eq!(order.nuisance[0], "constant");

        assert!(!order.nuisance.contains(&"age".to_string()));
        assert_eq!(
            order.columns("unique_mri_id").unwrap(),
            vec![
                "reading",
                "age",
                "readingbyage",
                "constant",
                "reg_sophis",
                "reg_site",
                "reg_sex",
                "scanner",
                "scanOrder"
            ]
        );

        let rules = config.rules_with_interaction("reading", "age");
        assert_eq!(rules.last().unwrap().target(), "readingbyage");
    }

    #[test]
    fn mask_filter_narrows_the_pattern() {
        let group = GroupConfig::default().for_mask("leftIFG");
        assert_eq!(group.measurement_pattern, "beta_values_*_leftIFG_seed.nii.gz");
    }

    #[test]
    fn mask_filter_keeps_the_configured_input_pattern() {
        let group = GroupConfig {
            measurement_pattern: "beta_values_*_seed.nii.gz".to_string(),
            output_extension: "nii".to_string(),
            ..GroupConfig::default()
        };
        let narrowed = group.for_mask("maskB");
        assert_eq!(narrowed.measurement_pattern, "beta_values_*_maskB_seed.nii.gz");
        assert_eq!(narrowed.output_extension, "nii");

        let custom = GroupConfig {
            measurement_pattern: "cope_*.img".to_string(),
            ..GroupConfig::default()
        };
        assert_eq!(custom.for_mask("acc").measurement_pattern, "cope_*_acc.img");
    }
}
