use crate::processor::dimensions::dimension_metrics;
use crate::processor::{
    DimensionMetrics, EtlProcessor, JoinReport, ParquetTableRegistry, PartitionedWriter,
    ReadReport, RecordReader, TableRegistry, WriteReport, derive_calendar,
    extract_actor_dimension, extract_item_dimension, extract_publisher_dimension,
};
use crate::schema::{OutputTable, RecordType};
use crate::storage::{S3Config, S3Manager, StorageLocation};
use common::Result;
use common::config::Settings;
use datafusion::logical_expr::{col, lit};
use datafusion::prelude::DataFrame;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{info, warn};
use uuid::Uuid;

/// Dimension tables the fact join reads back from the output root.
const READ_BACK_TABLES: [OutputTable; 2] = [OutputTable::Songs, OutputTable::Artists];

/// Summary of one successful run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineReport {
    pub run_id: String,
    pub catalog: ReadReport,
    pub events: ReadReport,
    /// Exact duplicate raw events removed before filtering.
    pub duplicate_events: usize,
    pub play_events: usize,
    pub dimensions: BTreeMap<String, DimensionMetrics>,
    pub tables: Vec<WriteReport>,
    pub join: JoinReport,
}

/// Raw inputs of a run.
struct Sources {
    catalog: DataFrame,
    plays: DataFrame,
}

pub struct Pipeline {
    settings: Settings,
    s3_manager: S3Manager,
    input: StorageLocation,
    output: StorageLocation,
    processor: EtlProcessor,
    run_id: String,
}

impl Pipeline {
    pub fn new(settings: &Settings) -> Result<Self> {
        settings.validate()?;
        let s3_manager = S3Manager::new(S3Config::from(&settings.storage));
        let input = StorageLocation::parse(&settings.storage.input_root, &s3_manager)?;
        let output = StorageLocation::parse(&settings.storage.output_root, &s3_manager)?;

        Ok(Self {
            settings: settings.clone(),
            s3_manager,
            input,
            output,
            processor: EtlProcessor::new(&settings.pipeline),
            run_id: Uuid::new_v4().simple().to_string(),
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Runs every stage in order. A failure stops the run; tables committed
    /// by earlier stages stay in place.
    pub async fn run(&self) -> Result<PipelineReport> {
        info!(
            run_id = %self.run_id,
            input = %self.input.url(),
            output = %self.output.url(),
            "Starting pipeline run"
        );
        self.preflight().await?;

        let mut report = PipelineReport {
            run_id: self.run_id.clone(),
            ..Default::default()
        };
        let writer = PartitionedWriter::new(self.output.clone(), self.run_id.clone());

        let sources = self.load_sources(&mut report).await?;
        self.write_dimensions(&writer, &sources, &mut report).await?;
        self.write_calendar(&writer, &sources, &mut report).await?;
        self.write_facts(&writer, sources.plays, &mut report).await?;

        info!(run_id = %self.run_id, tables = report.tables.len(), "Pipeline run complete");
        Ok(report)
    }

    async fn preflight(&self) -> Result<()> {
        self.input.preflight(&self.s3_manager, false).await?;
        self.output.preflight(&self.s3_manager, true).await?;
        self.output.register(&self.processor.ctx)
    }

    /// Reads both record types, drops exact duplicate events and keeps the
    /// play events.
    async fn load_sources(&self, report: &mut PipelineReport) -> Result<Sources> {
        let ctx = &self.processor.ctx;
        let reader = RecordReader::new(
            self.input.clone(),
            self.processor.settings().read_concurrency,
        );

        let (catalog, catalog_report) = reader
            .read(ctx, &self.settings.sources.song_data, RecordType::Catalog)
            .await?;
        let (events, events_report) = reader
            .read(ctx, &self.settings.sources.log_data, RecordType::Event)
            .await?;

        let distinct = events.distinct()?.cache().await?;
        report.duplicate_events = events_report.records - distinct.clone().count().await?;
        if report.duplicate_events > 0 {
            warn!(
                duplicates = report.duplicate_events,
                "Removed duplicate raw events"
            );
        }

        let play_page = &self.processor.settings().play_page;
        let plays = distinct
            .filter(col("page").eq(lit(play_page.as_str())))?
            .cache()
            .await?;
        report.play_events = plays.clone().count().await?;
        info!(
            catalog_records = catalog_report.records,
            event_records = events_report.records,
            play_events = report.play_events,
            play_page = %play_page,
            "Sources loaded"
        );

        report.catalog = catalog_report;
        report.events = events_report;
        Ok(Sources { catalog, plays })
    }

    async fn write_dimensions(
        &self,
        writer: &PartitionedWriter,
        sources: &Sources,
        report: &mut PipelineReport,
    ) -> Result<()> {
        let ctx = &self.processor.ctx;

        let items =
            extract_item_dimension(ctx, &self.processor.keys, sources.catalog.clone()).await?;
        self.write_dimension(writer, OutputTable::Songs, &sources.catalog, items, "item_id", report)
            .await?;

        let publishers = extract_publisher_dimension(sources.catalog.clone())?;
        self.write_dimension(
            writer,
            OutputTable::Artists,
            &sources.catalog,
            publishers,
            "publisher_id",
            report,
        )
        .await?;

        let actors = extract_actor_dimension(sources.plays.clone())?;
        self.write_dimension(writer, OutputTable::Users, &sources.plays, actors, "actor_id", report)
            .await
    }

    async fn write_calendar(
        &self,
        writer: &PartitionedWriter,
        sources: &Sources,
        report: &mut PipelineReport,
    ) -> Result<()> {
        let calendar = derive_calendar(&self.processor.ctx, sources.plays.clone())?;
        self.write_dimension(
            writer,
            OutputTable::Time,
            &sources.plays,
            calendar,
            "start_time",
            report,
        )
        .await
    }

    async fn write_dimension(
        &self,
        writer: &PartitionedWriter,
        table: OutputTable,
        input: &DataFrame,
        dimension: DataFrame,
        key: &str,
        report: &mut PipelineReport,
    ) -> Result<()> {
        let metrics = dimension_metrics(table.as_str(), input, &dimension, key).await?;
        report.dimensions.insert(table.as_str().to_string(), metrics);
        report.tables.push(writer.write(table, dimension).await?);
        Ok(())
    }

    /// Joins plays against the item and publisher tables as committed in the
    /// output root, never against in-memory results. The read-back tables are
    /// deregistered whether or not the join succeeds.
    async fn write_facts(
        &self,
        writer: &PartitionedWriter,
        plays: DataFrame,
        report: &mut PipelineReport,
    ) -> Result<()> {
        let ctx = &self.processor.ctx;
        let registry = ParquetTableRegistry::new(self.output.clone());
        let outcome = self.join_committed(&registry, writer, plays, report).await;

        let mut cleanup = Ok(());
        for table in READ_BACK_TABLES {
            if let Err(e) = registry.deregister_table(ctx, table).await {
                warn!(table = table.as_str(), error = %e, "Failed to deregister table");
                cleanup = cleanup.and(Err(e));
            }
        }
        outcome.and(cleanup)
    }

    async fn join_committed(
        &self,
        registry: &ParquetTableRegistry,
        writer: &PartitionedWriter,
        plays: DataFrame,
        report: &mut PipelineReport,
    ) -> Result<()> {
        let ctx = &self.processor.ctx;
        for table in READ_BACK_TABLES {
            registry.register_table(ctx, table).await?;
        }

        let items = ctx.table(OutputTable::Songs.as_str()).await?;
        let publishers = ctx.table(OutputTable::Artists.as_str()).await?;
        let (facts, join_report) = self
            .processor
            .fact_joiner()
            .join_facts(plays, items, publishers)
            .await?;

        report.join = join_report;
        report.tables.push(writer.write(OutputTable::Songplays, facts).await?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::Error;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    const SONG: &str = r#"{"num_songs": 1, "artist_id": "AR1", "artist_latitude": null, "artist_longitude": null, "artist_location": "Paris", "artist_name": "Band", "song_id": "SO1", "title": "Song A", "duration": 201.5, "year": 2018}"#;
    const PLAY: &str = r#"{"artist":"Band","auth":"Logged In","firstName":"Ann","gender":"F","itemInSession":0,"lastName":"Lee","length":201.5,"level":"free","location":"Somewhere","method":"PUT","page":"NextSong","registration":1540344794796.0,"sessionId":7,"song":"Song A","status":200,"ts":1541105830796,"userAgent":"Mozilla/5.0","userId":"10"}"#;

    fn write_file(root: &Path, relative: &str, body: &str) {
        let path = root.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, body).unwrap();
    }

    #[tokio::test]
    async fn failed_fact_write_releases_read_back_tables() {
        let input = TempDir::new().unwrap();
        let output = TempDir::new().unwrap();
        write_file(input.path(), "song_data/A/A/A/TRAAA1.json", SONG);
        write_file(input.path(), "log_data/2018/11/2018-11-01-events.json", PLAY);
        // A plain file where the year directory of the facts must go.
        write_file(output.path(), "songplays/year=2018", "");

        let settings = Settings::with_roots(
            input.path().to_str().unwrap(),
            output.path().to_str().unwrap(),
        );
        let pipeline = Pipeline::new(&settings).unwrap();
        let err = pipeline.run().await.unwrap_err();

        assert!(matches!(err, Error::Write { ref table, .. } if table == "songplays"));
        assert!(output.path().join("songs/_SUCCESS").exists());
        assert!(!output.path().join("songplays/_SUCCESS").exists());
        for table in READ_BACK_TABLES {
            assert!(!pipeline.processor.ctx.table_exist(table.as_str()).unwrap());
        }
    }
}
