pub mod logging;
pub mod processor;
pub mod schema;
pub mod services;
pub mod storage;
pub mod utils;

use common::Result;
use common::config::Settings;
use services::{Pipeline, PipelineReport};

/// Runs the complete star-schema pipeline for `settings`.
pub async fn run_etl_pipeline(settings: &Settings) -> Result<PipelineReport> {
    let pipeline = Pipeline::new(settings)?;
    pipeline.run().await
}
