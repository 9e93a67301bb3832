pub mod build_features;
pub mod cohort_report;
pub mod export_race_data;
pub mod predict;
pub mod train_model;
