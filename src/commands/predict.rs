use crate::cohort::build_worker_pool;
use crate::context::{history_range, pipeline_settings, AppContext, DEFAULT_MODEL_PATH};
use crate::features::{build_feature_matrix, feature_columns, MatrixPurpose};
use crate::model::{Prediction, TrainedModel};
use crate::models::{DateRange, RaceId};
use anyhow::Result;
use chrono::NaiveDate;
use log::{info, warn};
use std::collections::BTreeMap;
use std::path::Path;

pub struct PredictOptions<'a> {
    pub range: DateRange,
    pub history_start: Option<NaiveDate>,
    pub data_file: Option<&'a Path>,
    pub model_path: Option<&'a Path>,
    pub threads: Option<usize>,
}

pub async fn run(app: &AppContext, options: PredictOptions<'_>) -> Result<()> {
    let model = load_model(app, options.model_path).await?;
    let loaded_range = history_range(options.range, options.history_start)?;
    let data = app.race_data(loaded_range, options.data_file).await?;
    let settings = pipeline_settings(&data)?;
    let pool = build_worker_pool(options.threads)?;

    let matrix = build_feature_matrix(
        &data,
        options.range,
        &settings,
        &pool,
        MatrixPurpose::Prediction,
    )?;
    let predictions = model.predict(&matrix)?;
    info!(
        "Scored {} entrants for {}",
        predictions.len(),
        options.range
    );

    let mut by_race: BTreeMap<RaceId, Vec<Prediction>> = BTreeMap::new();
    for prediction in predictions {
        by_race.entry(prediction.race_id).or_default().push(prediction);
    }
    for (race_id, mut entries) in by_race {
        entries.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.horse_number.cmp(&b.horse_number))
        });
        println!("{race_id}");
        for entry in entries {
            println!(
                "  {:>2} {:<12} {:>10.4}",
                entry.horse_number, entry.horse_id, entry.score
            );
        }
    }
    Ok(())
}

async fn load_model(app: &AppContext, model_path: Option<&Path>) -> Result<TrainedModel> {
    if let Some(path) = model_path {
        return TrainedModel::load_from_file(path, feature_columns());
    }

    if let Some(db) = app.optional_database().await {
        match db.get_latest_model_run().await {
            Ok(Some(record)) => {
                info!("Using model run {} ({})", record.name, record.id);
                return TrainedModel::from_run_record(&record);
            }
            Ok(None) => warn!("No model run found in database; falling back to local file."),
            Err(err) => warn!("Failed to read model runs from database: {err}"),
        }
    }

    info!("Loading model from {}", DEFAULT_MODEL_PATH);
    TrainedModel::load_from_file(DEFAULT_MODEL_PATH, feature_columns())
}
