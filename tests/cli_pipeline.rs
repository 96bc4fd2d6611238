use std::fs;
use std::path::Path;
use std::process::{Command, Output};

use tempfile::tempdir;

const COVARIATES: &str = "\
unique_mri_id,Study,site,Sex,age,reading,scanner,scanOrder
sub01,Typo2/Soph,L1,M,24,102,1,2
sub02,Control,R2,F,31,88,2,1
sub03,Control,L2,M,29,95,1,1
";

fn seedglm(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_seedglm"))
        .current_dir(dir)
        .args(args)
        .output()
        .expect("run seedglm cli")
}

fn write_effect_maps(dir: &Path, subjects: &[&str]) {
    fs::create_dir_all(dir).expect("create data dir");
    for subject in subjects {
        fs::write(dir.join(format!("beta_values_{subject}_maskA_seed.nii.gz")), b"map")
            .expect("write effect map");
    }
}

#[test]
fn group_mean_on_empty_directory_exits_non_zero_and_writes_nothing() {
    let tmp = tempdir().expect("temporary directory");
    fs::create_dir(tmp.path().join("betavalues_output")).unwrap();

    let output = seedglm(tmp.path(), &["group-mean", "leftIFG", "betavalues_output"]);

    assert!(!output.status.success(), "CLI unexpectedly succeeded");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Error:"), "stderr: {stderr}");
    assert!(stderr.contains("betavalues_output"), "stderr: {stderr}");
    assert!(!tmp.path().join("zmap_output").exists());
}

#[test]
fn design_command_writes_design_and_contrast_reports() {
    let tmp = tempdir().expect("temporary directory");
    write_effect_maps(&tmp.path().join("betas"), &["sub02", "sub01", "sub04"]);
    fs::write(tmp.path().join("covariates.csv"), COVARIATES).unwrap();

    let output = seedglm(
        tmp.path(),
        &["design", "betas", "covariates.csv", "reading", "age", "inhib"],
    );
    assert!(
        output.status.success(),
        "CLI failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .from_path(tmp.path().join("inhib_design_matrix.tsv"))
        .expect("design report");
    let header: Vec<String> = reader
        .headers()
        .unwrap()
        .iter()
        .map(str::to_string)
        .collect();
    assert_eq!(&header[..4], &["unique_mri_id", "reading", "age", "readingbyage"]);
    let subjects: Vec<String> = reader
        .records()
        .map(|r| r.unwrap()[0].to_string())
        .collect();
    assert_eq!(subjects, vec!["sub01", "sub02"]);

    let contrasts = fs::read_to_string(tmp.path().join("inhib_contrasts.tsv")).unwrap();
    let first = contrasts.lines().nth(1).unwrap();
    assert!(first.starts_with("reading\t1.0\t0.0\t0.0"), "{first}");
}

#[test]
fn unreadable_config_is_reported() {
    let tmp = tempdir().expect("temporary directory");
    fs::write(tmp.path().join("seedglm.toml"), "[first_level]\nrepetition_time = \"fast\"\n")
        .unwrap();

    let output = seedglm(
        tmp.path(),
        &["--config", "seedglm.toml", "first-level", "masks", "data"],
    );
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("seedglm.toml"), "stderr: {stderr}");
}

#[cfg(unix)]
#[test]
fn regress_runs_the_backend_once_per_contrast() {
    let tmp = tempdir().expect("temporary directory");
    write_effect_maps(&tmp.path().join("betas"), &["sub01", "sub02", "sub03"]);
    fs::write(tmp.path().join("covariates.csv"), COVARIATES).unwrap();

    let script = tmp.path().join("backend.sh");
    fs::write(
        &script,
        "verb=\"$1\"\nshift\n\
         [ \"$verb\" = compute ] || exit 2\n\
         echo \"$1\" >> calls.log\n\
         out=$(sed -n 's/^output = \"\\(.*\\)\"$/\\1/p' \"$1\")\n\
         cp \"$1\" \"$out\"\n",
    )
    .unwrap();
    let config = format!(
        "[backend]\nprogram = \"sh\"\nargs = [\"{}\"]\n",
        script.display()
    );
    fs::write(tmp.path().join("seedglm.toml"), config).unwrap();

    let output = seedglm(
        tmp.path(),
        &[
            "--config",
            "seedglm.toml",
            "regress",
            "betas",
            "covariates.csv",
            "reading",
            "age",
            "inhib",
        ],
    );
    assert!(
        output.status.success(),
        "CLI failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    for contrast in ["reading", "age", "readingbyage"] {
        let map = tmp.path().join(format!("inhib_{contrast}_voxelwise.nii.gz"));
        let manifest = fs::read_to_string(&map).expect("contrast map");
        assert!(manifest.contains(&format!("contrast = \"{contrast}\"")));
        assert!(manifest.contains("statistic = \"z_score\""));
    }
    let calls = fs::read_to_string(tmp.path().join("calls.log")).unwrap();
    assert_eq!(calls.lines().count(), 3);
}
