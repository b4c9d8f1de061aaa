pub mod calendar;
pub mod dimensions;
pub mod facts;
pub mod keys;
pub mod reader;
pub mod table;
pub mod udf;
pub mod writer;

pub use calendar::derive_calendar;
pub use dimensions::{
    DimensionMetrics, extract_actor_dimension, extract_item_dimension,
    extract_publisher_dimension,
};
pub use facts::{FactJoiner, JoinReport};
pub use keys::SurrogateKeys;
pub use reader::{ReadReport, RecordReader};
pub use table::{ParquetTableRegistry, TableRegistry};
pub use udf::register_udfs;
pub use writer::{PartitionedWriter, TableMarker, WriteReport};

use common::config::PipelineSettings;
use datafusion::execution::context::SessionContext;
use datafusion::prelude::SessionConfig;

/// Shared processing state of one pipeline run: the DataFusion session with
/// the calendar UDFs registered, and the run's surrogate key sequences.
pub struct EtlProcessor {
    pub ctx: SessionContext,
    pub keys: SurrogateKeys,
    settings: PipelineSettings,
}

impl EtlProcessor {
    pub fn new(settings: &PipelineSettings) -> Self {
        // Output schemas use Utf8; keep parquet reads from switching to views.
        let config = SessionConfig::new()
            .set_bool("datafusion.execution.parquet.schema_force_view_types", false);
        let ctx = SessionContext::new_with_config(config);
        register_udfs(&ctx, settings.calendar_granularity);

        Self {
            ctx,
            keys: SurrogateKeys::new(),
            settings: settings.clone(),
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn fact_joiner(&self) -> FactJoiner<'_> {
        FactJoiner::new(&self.ctx, &self.keys, self.settings.join_mode)
    }
}
