pub mod retry;

pub mod cohort;
pub mod commands;
pub mod config;
pub mod context;
pub mod data_context;
pub mod database;
pub mod errors;
pub mod features;
pub mod join;
pub mod lightgbm;
pub mod model;
pub mod models;
