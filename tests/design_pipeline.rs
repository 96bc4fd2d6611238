use approx::assert_abs_diff_eq;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use std::fs;
use std::path::Path;
use tempfile::tempdir;

use seedglm::assemble::{assemble, join_subjects};
use seedglm::contrast::contrasts_for;
use seedglm::covariates::{CovariateSource, load_covariates};
use seedglm::matching::{AnalysisLevel, FilePattern, PositionalRule, discover};
use seedglm::pipeline::{
    GroupConfig, PipelineError, RegressionConfig, RegressionRequest, plan_regression,
};

const HEADER: &str = "unique_mri_id,Study,site,Sex,age,reading,scanner,scanOrder";

fn covariate_rows() -> Vec<&'static str> {
    vec![
        "sub01,Typo2/Soph,L1,M,24,102,1,2",
        "sub02,Control,R2,F,31,88,2,1",
        "sub03,Typo2/Soph,R1,F,27,97,1,3",
        "sub04,Control,L2,M,35,110,2,2",
        "sub05,Control,L4,F,22,91,1,1",
    ]
}

fn write_covariates(path: &Path, rows: &[&str]) {
    let mut text = String::from(HEADER);
    for row in rows {
        text.push('\n');
        text.push_str(row);
    }
    text.push('\n');
    fs::write(path, text).expect("write covariates");
}

fn write_effect_maps(dir: &Path, subjects: &[&str]) {
    fs::create_dir_all(dir).expect("create data dir");
    for subject in subjects {
        fs::write(dir.join(format!("beta_values_{subject}_maskA_seed.nii.gz")), b"")
            .expect("write effect map");
    }
}

#[test]
fn two_subject_scenario_produces_the_expected_design() {
    let tmp = tempdir().unwrap();
    let data_dir = tmp.path().join("betas");
    write_effect_maps(&data_dir, &["sub02", "sub01"]);
    let covariates = tmp.path().join("covariates.csv");
    write_covariates(&covariates, &covariate_rows()[..2]);

    let config = RegressionConfig::default();
    let table = load_covariates(&covariates, &config.covariates)
        .unwrap()
        .derive(&config.rules_with_interaction("reading", "age"))
        .unwrap();

    let pattern = FilePattern::new("beta_values_*_seed.nii.gz").unwrap();
    let files = discover(
        &data_dir,
        &pattern,
        &PositionalRule::new("_", 2),
        AnalysisLevel::Second,
    )
    .unwrap();
    let join = join_subjects(files.iter().map(|f| f.subject_id.as_str()), &table);
    assert!(join.is_complete());

    let order = config.canonical_order("reading", "age");
    let design = assemble(&join, &table, &order).unwrap();

    assert_eq!(design.row_labels(), &["sub01", "sub02"]);
    assert_eq!(design.column("reg_sophis").unwrap().to_vec(), vec![1.0, 0.0]);
    assert_eq!(design.column("reg_site").unwrap().to_vec(), vec![1.0, 0.0]);
    assert_eq!(design.column("reg_sex").unwrap().to_vec(), vec![1.0, -1.0]);
    assert_abs_diff_eq!(design.column("readingbyage").unwrap()[1], 2728.0, epsilon = 1e-9);

    let contrasts = contrasts_for(&design, &["reading", "age", "readingbyage"]).unwrap();
    let first = contrasts[0].weights();
    assert_eq!(first[0], 1.0);
    assert!(first.iter().skip(1).all(|w| *w == 0.0));
    assert_eq!(contrasts[2].target_index(), Some(2));
}

#[test]
fn covariate_row_order_does_not_change_the_design() {
    let tmp = tempdir().unwrap();
    let data_dir = tmp.path().join("betas");
    write_effect_maps(&data_dir, &["sub01", "sub02", "sub03", "sub04", "sub05"]);

    let request = |covariates: &Path| RegressionRequest {
        data_dir: data_dir.clone(),
        covariates: covariates.to_path_buf(),
        effect_1: "age".to_string(),
        effect_2: "reading".to_string(),
        output_tag: "order".to_string(),
    };

    let sorted_path = tmp.path().join("sorted.csv");
    write_covariates(&sorted_path, &covariate_rows());
    let reference = plan_regression(
        &request(&sorted_path),
        &GroupConfig::default(),
        &RegressionConfig::default(),
    )
    .unwrap();

    let mut rng = StdRng::seed_from_u64(17);
    for trial in 0..5 {
        let mut rows = covariate_rows();
        rows.shuffle(&mut rng);
        let path = tmp.path().join(format!("shuffled_{trial}.csv"));
        write_covariates(&path, &rows);

        let plan = plan_regression(
            &request(&path),
            &GroupConfig::default(),
            &RegressionConfig::default(),
        )
        .unwrap();
        assert_eq!(plan.design, reference.design);
        assert_eq!(plan.measurements, reference.measurements);
        assert_eq!(
            plan.contrasts.iter().map(|c| c.weights().to_vec()).collect::<Vec<_>>(),
            reference.contrasts.iter().map(|c| c.weights().to_vec()).collect::<Vec<_>>()
        );
    }
}

#[test]
fn missing_nuisance_value_names_subject_and_column() {
    let tmp = tempdir().unwrap();
    let data_dir = tmp.path().join("betas");
    write_effect_maps(&data_dir, &["sub01", "sub02"]);
    let covariates = tmp.path().join("covariates.csv");
    write_covariates(
        &covariates,
        &["sub01,Typo2/Soph,L1,M,24,102,1,2", "sub02,Control,R2,F,31,88,NA,1"],
    );

    let err = plan_regression(
        &RegressionRequest {
            data_dir,
            covariates,
            effect_1: "reading".to_string(),
            effect_2: "age".to_string(),
            output_tag: "gaps".to_string(),
        },
        &GroupConfig::default(),
        &RegressionConfig::default(),
    )
    .unwrap_err();
    let message = err.to_string();
    assert!(matches!(err, PipelineError::Design(_)));
    assert!(message.contains("sub02"), "{message}");
    assert!(message.contains("scanner"), "{message}");
}

#[test]
fn tab_separated_covariates_with_custom_subject_column() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("covariates.tsv");
    fs::write(&path, "participant\tage\n007\t30\n010\t41\n").unwrap();

    let source = CovariateSource {
        subject_column: "participant".to_string(),
        delimiter: '\t',
    };
    let table = load_covariates(&path, &source).unwrap();
    // Ids are kept verbatim, leading zeros included.
    assert!(table.row("007").is_some());
    assert_eq!(table.subject_ids().collect::<Vec<_>>(), vec!["007", "010"]);
}
