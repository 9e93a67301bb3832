use anyhow::anyhow;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use log::info;
use racing_roi::{
    cohort::CohortDimension,
    commands::{
        build_features::{self, BuildFeaturesOptions},
        cohort_report::{self, CohortReportOptions},
        export_race_data,
        predict::{self, PredictOptions},
        train_model::{self, TrainModelOptions},
    },
    context::{AppContext, DEFAULT_MODEL_PATH, DEFAULT_RACE_DATA_FILE},
    models::DateRange,
};
use std::env;
use std::path::PathBuf;

const DEFAULT_FEATURES_FILE: &str = "data/features.csv";
const DEFAULT_REPORT_TOP_N: usize = 20;

#[derive(Parser)]
#[command(name = "racing-roi")]
#[command(about = "Point-in-time ROI features and value models for horse races")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Export a race data snapshot for offline runs
    ExportRaceData {
        /// First race date to include (YYYY-MM-DD)
        #[arg(long)]
        start: NaiveDate,
        /// Last race date to include (YYYY-MM-DD)
        #[arg(long)]
        end: NaiveDate,
        /// Destination file for the snapshot
        #[arg(short, long = "output", value_name = "PATH")]
        output: Option<PathBuf>,
    },
    /// Build the feature matrix for a date window and write it as CSV
    BuildFeatures {
        #[arg(long)]
        start: NaiveDate,
        #[arg(long)]
        end: NaiveDate,
        /// Earliest race date used as history (defaults to ten years before --start)
        #[arg(long)]
        history_start: Option<NaiveDate>,
        /// Path to a race data snapshot file
        #[arg(long = "data-file", value_name = "PATH")]
        data_file: Option<PathBuf>,
        #[arg(short, long = "output", value_name = "PATH")]
        output: Option<PathBuf>,
        /// Append training labels and payouts (finalized races only)
        #[arg(long)]
        with_labels: bool,
        /// Worker threads for aggregation (defaults to all logical CPUs)
        #[arg(long)]
        threads: Option<usize>,
    },
    /// Train a model on finalized races
    TrainModel {
        /// First training race date (defaults to TRAINING_START_DATE)
        #[arg(long)]
        start: Option<NaiveDate>,
        /// Last training race date (defaults to TRAINING_END_DATE)
        #[arg(long)]
        end: Option<NaiveDate>,
        #[arg(long)]
        history_start: Option<NaiveDate>,
        #[arg(long = "data-file", value_name = "PATH")]
        data_file: Option<PathBuf>,
        /// Destination for the trained model (defaults to models/racing_roi_model.txt)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Number of hyperparameter trials
        #[arg(long)]
        trials: Option<usize>,
        /// Early stopping rounds (0 disables early stopping)
        #[arg(long)]
        early_stopping_round: Option<u32>,
        /// Seed for the hyperparameter search
        #[arg(long)]
        seed: Option<u64>,
        #[arg(long)]
        threads: Option<usize>,
    },
    /// Score upcoming races with a trained model
    Predict {
        #[arg(long)]
        start: NaiveDate,
        #[arg(long)]
        end: NaiveDate,
        #[arg(long)]
        history_start: Option<NaiveDate>,
        #[arg(long = "data-file", value_name = "PATH")]
        data_file: Option<PathBuf>,
        /// Model file to use instead of the latest recorded model run
        #[arg(long, value_name = "PATH")]
        model: Option<PathBuf>,
        #[arg(long)]
        threads: Option<usize>,
    },
    /// Rank the cohorts of one dimension by historical ROI
    CohortReport {
        /// sire_condition, jockey_course, horse_course, closing_speed, pace_recovery or stamina_rank
        #[arg(long, value_parser = CohortDimension::parse)]
        dimension: CohortDimension,
        /// Only races strictly before this date are counted
        #[arg(long)]
        as_of: NaiveDate,
        #[arg(long, default_value_t = DEFAULT_REPORT_TOP_N)]
        top: usize,
        #[arg(long)]
        history_start: Option<NaiveDate>,
        #[arg(long = "data-file", value_name = "PATH")]
        data_file: Option<PathBuf>,
        #[arg(long)]
        threads: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let Cli { command } = cli;

    let database_url = env::var("DATABASE_URL").ok();
    if database_url.is_none() && command_requires_database(&command) {
        return Err(anyhow!(
            "DATABASE_URL must be set for this command. For offline runs, use a race data snapshot."
        ));
    }
    let app_context = AppContext::initialize(database_url).await?;
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("Starting racing-roi. Past returns do not guarantee future returns.");

    match command {
        Commands::ExportRaceData { start, end, output } => {
            let output_path = output.unwrap_or_else(|| PathBuf::from(DEFAULT_RACE_DATA_FILE));
            export_race_data::run(&app_context, DateRange::new(start, end)?, &output_path).await?;
        }
        Commands::BuildFeatures {
            start,
            end,
            history_start,
            data_file,
            output,
            with_labels,
            threads,
        } => {
            let output_path = output.unwrap_or_else(|| PathBuf::from(DEFAULT_FEATURES_FILE));
            build_features::run(
                &app_context,
                BuildFeaturesOptions {
                    range: DateRange::new(start, end)?,
                    history_start,
                    data_file: data_file.as_deref(),
                    output: &output_path,
                    with_labels,
                    threads,
                },
            )
            .await?;
        }
        Commands::TrainModel {
            start,
            end,
            history_start,
            data_file,
            output,
            trials,
            early_stopping_round,
            seed,
            threads,
        } => {
            let output_path = output.unwrap_or_else(|| PathBuf::from(DEFAULT_MODEL_PATH));
            train_model::run(
                &app_context,
                TrainModelOptions {
                    start,
                    end,
                    history_start,
                    data_file: data_file.as_deref(),
                    output: &output_path,
                    max_trials: trials,
                    early_stopping_round,
                    seed,
                    threads,
                },
            )
            .await?;
        }
        Commands::Predict {
            start,
            end,
            history_start,
            data_file,
            model,
            threads,
        } => {
            predict::run(
                &app_context,
                PredictOptions {
                    range: DateRange::new(start, end)?,
                    history_start,
                    data_file: data_file.as_deref(),
                    model_path: model.as_deref(),
                    threads,
                },
            )
            .await?;
        }
        Commands::CohortReport {
            dimension,
            as_of,
            top,
            history_start,
            data_file,
            threads,
        } => {
            cohort_report::run(
                &app_context,
                CohortReportOptions {
                    dimension,
                    as_of,
                    top,
                    history_start,
                    data_file: data_file.as_deref(),
                    threads,
                },
            )
            .await?;
        }
    }

    Ok(())
}

fn command_requires_database(command: &Commands) -> bool {
    match command {
        Commands::ExportRaceData { .. } => true,
        Commands::BuildFeatures { data_file, .. }
        | Commands::TrainModel { data_file, .. }
        | Commands::Predict { data_file, .. }
        | Commands::CohortReport { data_file, .. } => data_file.is_none(),
    }
}
