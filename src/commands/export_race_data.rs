use crate::context::AppContext;
use crate::data_context::RaceData;
use crate::models::DateRange;
use anyhow::Result;
use log::info;
use std::path::Path;

pub async fn run(app: &AppContext, range: DateRange, output_path: &Path) -> Result<()> {
    info!(
        "Generating race data snapshot for {} at {}",
        range,
        output_path.display()
    );

    let db = app.database().await?;
    let race_data = RaceData::load(&db, range).await?;

    race_data.save_to_file(output_path)?;
    info!(
        "Race data snapshot successfully written to {} ({} races, {} entrants)",
        output_path.display(),
        race_data.races().len(),
        race_data.entrants().len()
    );

    Ok(())
}
