#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::error::Error;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Mutex;

use seedglm::pipeline::command::CommandBackend;
use seedglm::pipeline::{
    GroupConfig, PipelineConfig, PipelineStage, ProgressObserver, RegressionRequest,
    StatisticKind, plan_regression, run_first_level, run_group_mean, run_regression,
    write_plan_reports,
};

#[derive(Parser)]
#[command(
    name = "seedglm",
    about = "Seed-based fMRI GLM pipeline: first-level seed maps and group models",
    long_about = "Builds first-level seed designs per subject and mask, then group-level \
                 designs and contrasts from the resulting effect maps and a covariate table. \
                 Model fitting and volume I/O are delegated to an external backend program."
)]
struct Cli {
    /// TOML configuration file; every setting has a default
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct RegressionArgs {
    /// Directory holding one first-level effect map per subject
    data_dir: PathBuf,

    /// Covariate table with one row per subject
    covariates: PathBuf,

    /// First effect of interest (a covariate column)
    effect_1: String,

    /// Second effect of interest (a covariate column)
    effect_2: String,

    /// Tag used in every output file name
    output_tag: String,

    /// Only use effect maps produced with this mask
    #[arg(long, value_name = "MASK")]
    mask_tag: Option<String>,

    /// Statistic written for each contrast
    #[arg(long, value_enum)]
    statistic: Option<StatisticKind>,
}

#[derive(Subcommand)]
enum Commands {
    /// Fit one seed GLM per subject and mask
    #[command(about = "Run first-level seed models (outputs: timeseries_output/, betavalues_output/)")]
    FirstLevel {
        /// Directory of mask images; each mask is one seed
        mask_dir: PathBuf,
        /// Directory of preprocessed subject images
        data_dir: PathBuf,
        /// Repetition time in seconds
        #[arg(long, value_name = "SECONDS")]
        tr: Option<f64>,
    },
    /// One-sample group mean of first-level effect maps
    #[command(about = "Run the group mean model (outputs: zmap_output/zmap_<TAG>_seeded)")]
    GroupMean {
        output_tag: String,
        data_dir: PathBuf,
        #[arg(long, value_name = "MASK")]
        mask_tag: Option<String>,
    },
    /// Covariate regression with two effects and their interaction
    #[command(about = "Run the covariate regression (outputs: <TAG>_<CONTRAST>_voxelwise)")]
    Regress(RegressionArgs),
    /// Build and write the regression design and contrasts without fitting
    #[command(about = "Preview the regression design (outputs: <TAG>_design_matrix.tsv, <TAG>_contrasts.tsv)")]
    Design(RegressionArgs),
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let Cli { config, command } = Cli::parse();

    let result = load_config(config.as_deref()).and_then(|config| match command {
        Commands::FirstLevel {
            mask_dir,
            data_dir,
            tr,
        } => run_first_level_command(config, &mask_dir, &data_dir, tr),
        Commands::GroupMean {
            output_tag,
            data_dir,
            mask_tag,
        } => run_group_mean_command(config, &output_tag, &data_dir, mask_tag),
        Commands::Regress(args) => run_regression_command(config, args),
        Commands::Design(args) => run_design_command(config, args),
    });

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn load_config(path: Option<&Path>) -> Result<PipelineConfig, Box<dyn Error>> {
    match path {
        Some(path) => {
            println!("Loading configuration from: {}", path.display());
            Ok(PipelineConfig::load(path)?)
        }
        None => Ok(PipelineConfig::default()),
    }
}

fn run_first_level_command(
    mut config: PipelineConfig,
    mask_dir: &Path,
    data_dir: &Path,
    tr: Option<f64>,
) -> Result<(), Box<dyn Error>> {
    if let Some(tr) = tr {
        if !(tr.is_finite() && tr > 0.0) {
            return Err(format!("Repetition time must be a positive number of seconds, got {tr}").into());
        }
        config.first_level.repetition_time = tr;
    }
    let backend = CommandBackend::new(&config.backend)?;
    let progress = BarProgress::default();

    let report = run_first_level(
        mask_dir,
        data_dir,
        &config.first_level,
        &backend,
        &backend,
        &backend,
        &progress,
    )?;

    for (outcome, output) in report.succeeded() {
        println!(
            "{} [{}]: {}",
            outcome.subject_id,
            outcome.mask_tag,
            output.effect_map.display()
        );
    }
    let failures: Vec<String> = report
        .failed()
        .map(|(outcome, err)| format!("  {} [{}]: {err}", outcome.subject_id, outcome.mask_tag))
        .collect();
    if !failures.is_empty() {
        eprintln!("{}", failures.join("\n"));
        return Err(format!("{} first-level fit(s) failed", failures.len()).into());
    }
    Ok(())
}

fn run_group_mean_command(
    config: PipelineConfig,
    output_tag: &str,
    data_dir: &Path,
    mask_tag: Option<String>,
) -> Result<(), Box<dyn Error>> {
    let group = match mask_tag {
        Some(tag) => config.group.for_mask(&tag),
        None => config.group,
    };
    let backend = CommandBackend::new(&config.backend)?;
    let output = run_group_mean(data_dir, output_tag, &group, &backend)?;
    println!(
        "Group mean over {} subjects written to: {}",
        output.subjects.len(),
        output.map.display()
    );
    Ok(())
}

fn regression_inputs(
    config: &PipelineConfig,
    args: RegressionArgs,
) -> (RegressionRequest, GroupConfig) {
    let mut group = match &args.mask_tag {
        Some(tag) => config.group.for_mask(tag),
        None => config.group.clone(),
    };
    if let Some(statistic) = args.statistic {
        group.statistic = statistic;
    }
    let request = RegressionRequest {
        data_dir: args.data_dir,
        covariates: args.covariates,
        effect_1: args.effect_1,
        effect_2: args.effect_2,
        output_tag: args.output_tag,
    };
    (request, group)
}

fn run_regression_command(config: PipelineConfig, args: RegressionArgs) -> Result<(), Box<dyn Error>> {
    let (request, group) = regression_inputs(&config, args);
    let backend = CommandBackend::new(&config.backend)?;
    let progress = BarProgress::default();
    let output = run_regression(&request, &group, &config.regression, &backend, &progress)?;

    println!("Design matrix written to: {}", output.design_report.display());
    println!("Contrasts written to: {}", output.contrast_report.display());
    for (contrast, path) in &output.maps {
        println!("{contrast}: {}", path.display());
    }
    Ok(())
}

fn run_design_command(config: PipelineConfig, args: RegressionArgs) -> Result<(), Box<dyn Error>> {
    let (request, group) = regression_inputs(&config, args);
    let plan = plan_regression(&request, &group, &config.regression)?;
    let (design_path, contrast_path) = write_plan_reports(
        &plan,
        &request.output_tag,
        &config.regression.covariates.subject_column,
    )?;

    println!(
        "{} subjects x {} columns: {}",
        plan.design.nrows(),
        plan.design.ncols(),
        plan.design.column_names().join(", ")
    );
    if !plan.join.is_complete() {
        println!(
            "Excluded: {} without covariates, {} without effect maps",
            plan.join.measurement_only.len(),
            plan.join.covariate_only.len()
        );
    }
    println!("Design matrix written to: {}", design_path.display());
    println!("Contrasts written to: {}", contrast_path.display());
    Ok(())
}

// ========================================================================================
//                                 Terminal progress
// ========================================================================================

fn create_progress_bar(len: u64, message: &str) -> ProgressBar {
    let draw_target = if std::io::stderr().is_terminal() {
        ProgressDrawTarget::stderr_with_hz(20)
    } else {
        ProgressDrawTarget::hidden()
    };

    let pb = ProgressBar::with_draw_target(Some(len), draw_target);
    if let Ok(style) =
        ProgressStyle::with_template("\n> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
    {
        pb.set_style(style.progress_chars("█▉▊▋▌▍▎▏  "));
    }
    pb.set_message(message.to_string());
    pb
}

#[derive(Default)]
struct BarProgress {
    bar: Mutex<Option<ProgressBar>>,
}

impl ProgressObserver for BarProgress {
    fn on_stage_start(&self, stage: PipelineStage, total_items: usize) {
        if let Ok(mut slot) = self.bar.lock() {
            *slot = Some(create_progress_bar(total_items as u64, stage.describe()));
        }
    }

    fn on_stage_advance(&self, _: PipelineStage, processed_items: usize) {
        if let Ok(slot) = self.bar.lock() {
            if let Some(pb) = slot.as_ref() {
                pb.set_position(processed_items as u64);
            }
        }
    }

    fn on_stage_finish(&self, stage: PipelineStage) {
        if let Ok(mut slot) = self.bar.lock() {
            if let Some(pb) = slot.take() {
                pb.finish_with_message(format!("{stage} done"));
            }
        }
    }
}
