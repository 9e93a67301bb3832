use crate::cohort::build_worker_pool;
use crate::context::{history_range, pipeline_settings, AppContext};
use crate::features::{build_feature_matrix, MatrixPurpose};
use crate::models::DateRange;
use anyhow::Result;
use chrono::NaiveDate;
use log::info;
use std::path::Path;

pub struct BuildFeaturesOptions<'a> {
    pub range: DateRange,
    pub history_start: Option<NaiveDate>,
    pub data_file: Option<&'a Path>,
    pub output: &'a Path,
    pub with_labels: bool,
    pub threads: Option<usize>,
}

pub async fn run(app: &AppContext, options: BuildFeaturesOptions<'_>) -> Result<()> {
    let loaded_range = history_range(options.range, options.history_start)?;
    info!(
        "Building features for {} with history from {}",
        options.range, loaded_range.start
    );

    let data = app.race_data(loaded_range, options.data_file).await?;
    let settings = pipeline_settings(&data)?;
    let pool = build_worker_pool(options.threads)?;
    let purpose = if options.with_labels {
        MatrixPurpose::Training
    } else {
        MatrixPurpose::Prediction
    };

    let matrix = build_feature_matrix(&data, options.range, &settings, &pool, purpose)?;
    for summary in matrix.column_summaries() {
        info!(
            "{:<28} mean={:>9.3} std={:>9.3} sentinel={:.1}%",
            summary.name,
            summary.mean,
            summary.std_dev,
            summary.sentinel_share * 100.0
        );
    }

    matrix.write_csv(options.output)?;
    info!(
        "Wrote {} feature rows to {}",
        matrix.len(),
        options.output.display()
    );
    Ok(())
}
