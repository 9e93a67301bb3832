use crate::cohort::{build_worker_pool, CohortDimension, CohortEngine};
use crate::context::{history_range, pipeline_settings, AppContext};
use crate::join::{join_batch, OutcomeMode};
use crate::models::DateRange;
use anyhow::Result;
use chrono::NaiveDate;
use log::info;
use std::path::Path;

pub struct CohortReportOptions<'a> {
    pub dimension: CohortDimension,
    pub as_of: NaiveDate,
    pub top: usize,
    pub history_start: Option<NaiveDate>,
    pub data_file: Option<&'a Path>,
    pub threads: Option<usize>,
}

pub async fn run(app: &AppContext, options: CohortReportOptions<'_>) -> Result<()> {
    let as_of_range = DateRange::new(options.as_of, options.as_of)?;
    let loaded_range = history_range(as_of_range, options.history_start)?;
    let data = app.race_data(loaded_range, options.data_file).await?;
    let settings = pipeline_settings(&data)?;
    let pool = build_worker_pool(options.threads)?;

    let history = join_batch(
        &data,
        loaded_range,
        OutcomeMode::FinalizedBefore(options.as_of),
        &settings,
    )?;
    let engine = CohortEngine::build(&history, &settings, &pool);
    info!(
        "Aggregated {} cohorts from {} historical rows",
        engine.partition_count(),
        history.len()
    );

    let mean = engine.dimension_mean_roi(options.dimension, options.as_of);
    println!(
        "{} cohorts as of {} ({} ROI, mean {})",
        options.dimension,
        options.as_of,
        engine.bet_kind().label(),
        mean.map_or("n/a".to_string(), |roi| format!("{roi:.2}%"))
    );
    let ranked = engine.top_cohorts(options.dimension, options.as_of, options.top);
    if ranked.is_empty() {
        println!("  no cohort has enough samples");
    }
    for (rank, (key, roi)) in ranked.iter().enumerate() {
        println!(
            "{:>3}. {:<48} roi={:>8.2}% win={:>5.1}% top3={:>5.1}% samples={:>5} relative={:>7.1}",
            rank + 1,
            key.to_string(),
            roi.roi_pct().unwrap_or_default(),
            roi.win_rate().unwrap_or_default() * 100.0,
            roi.top3_rate().unwrap_or_default() * 100.0,
            roi.samples(),
            engine.relative_score(key, options.as_of)
        );
    }
    Ok(())
}
