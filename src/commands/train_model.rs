use crate::cohort::build_worker_pool;
use crate::config::PipelineSettings;
use crate::context::{history_range, pipeline_settings, AppContext};
use crate::features::{build_feature_matrix, MatrixPurpose};
use crate::model::{LightGbmCli, ModelFacade, SearchSpace};
use crate::models::DateRange;
use anyhow::{anyhow, Context, Result};
use chrono::NaiveDate;
use log::{info, warn};
use std::path::Path;

pub struct TrainModelOptions<'a> {
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
    pub history_start: Option<NaiveDate>,
    pub data_file: Option<&'a Path>,
    pub output: &'a Path,
    pub max_trials: Option<usize>,
    pub early_stopping_round: Option<u32>,
    pub seed: Option<u64>,
    pub threads: Option<usize>,
}

pub async fn run(app: &AppContext, options: TrainModelOptions<'_>) -> Result<()> {
    let range = resolve_training_range(app, &options).await?;
    let loaded_range = history_range(range, options.history_start)?;
    info!(
        "Training on races in {} with history from {}",
        range, loaded_range.start
    );

    let data = app.race_data(loaded_range, options.data_file).await?;
    let settings = pipeline_settings(&data)?;
    let pool = build_worker_pool(options.threads)?;
    let matrix = build_feature_matrix(&data, range, &settings, &pool, MatrixPurpose::Training)?;

    let mut search = SearchSpace::default();
    if let Some(max_trials) = options.max_trials {
        search.max_trials = max_trials;
    }
    if let Some(early_stopping_round) = options.early_stopping_round {
        search.early_stopping_round = early_stopping_round;
    }
    if let Some(seed) = options.seed {
        search.seed = seed;
    }

    let trainer = LightGbmCli::locate()?;
    let facade = ModelFacade::new(trainer, settings);
    let (model, summary) = facade.fit(&matrix, &search)?;

    model.save_to_file(options.output)?;
    info!(
        "Saved model with {} trees to {}",
        model.num_trees(),
        options.output.display()
    );

    if let Some(db) = app.optional_database().await {
        let record = model.run_record(&format!("racing-roi {}", range))?;
        match db.insert_model_run(&record).await {
            Ok(()) => info!("Recorded model run {}", record.id),
            Err(err) => warn!("Failed to record model run: {err}"),
        }
    }

    let summary_json =
        serde_json::to_string(&summary).context("Failed to serialize training summary")?;
    println!("RACING_ROI_TRAIN_SUMMARY={summary_json}");
    Ok(())
}

async fn resolve_training_range(
    app: &AppContext,
    options: &TrainModelOptions<'_>,
) -> Result<DateRange> {
    if let (Some(start), Some(end)) = (options.start, options.end) {
        return DateRange::new(start, end);
    }
    let settings = PipelineSettings::from_settings_map(&app.settings_map(options.data_file).await?)?;
    let start = options
        .start
        .or(settings.training_start_date)
        .ok_or_else(|| anyhow!("Missing --start and setting TRAINING_START_DATE"))?;
    let end = options
        .end
        .or(settings.training_end_date)
        .ok_or_else(|| anyhow!("Missing --end and setting TRAINING_END_DATE"))?;
    DateRange::new(start, end)
}
