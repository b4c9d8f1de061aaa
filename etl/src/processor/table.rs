use crate::processor::writer::{TableMarker, read_marker};
use crate::schema::OutputTable;
use crate::storage::StorageLocation;
use async_trait::async_trait;
use common::{Error, Result};
use datafusion::datasource::file_format::options::ParquetReadOptions;
use datafusion::prelude::SessionContext;
use tracing::debug;

/// Makes committed output tables queryable by name.
#[async_trait]
pub trait TableRegistry: Send + Sync + 'static {
    async fn register_table(&self, ctx: &SessionContext, table: OutputTable) -> Result<TableMarker>;

    async fn deregister_table(&self, ctx: &SessionContext, table: OutputTable) -> Result<()>;
}

/// Reads tables back from the parquet files under an output root. Only
/// tables with a `_SUCCESS` marker are registered.
pub struct ParquetTableRegistry {
    location: StorageLocation,
}

impl ParquetTableRegistry {
    pub fn new(location: StorageLocation) -> Self {
        Self { location }
    }
}

#[async_trait]
impl TableRegistry for ParquetTableRegistry {
    async fn register_table(
        &self,
        ctx: &SessionContext,
        table: OutputTable,
    ) -> Result<TableMarker> {
        let table_location = self.location.join(table.as_str())?;
        let marker = read_marker(&self.location, table).await?.ok_or_else(|| {
            Error::UncommittedTable {
                table: table.as_str().to_string(),
                location: table_location.url().to_string(),
            }
        })?;

        self.location.register(ctx)?;
        let schema = table.schema();
        let options = ParquetReadOptions::default()
            .schema(&schema)
            .file_extension(".parquet")
            .table_partition_cols(vec![]);

        debug!(
            table = table.as_str(),
            run_id = %marker.run_id,
            "Registering committed table"
        );
        ctx.register_parquet(table.as_str(), table_location.url().as_str(), options)
            .await
            .map_err(|e| {
                Error::Other(format!(
                    "Failed to register {} at {}: {}",
                    table.as_str(),
                    table_location.url(),
                    e
                ))
            })?;
        Ok(marker)
    }

    async fn deregister_table(&self, ctx: &SessionContext, table: OutputTable) -> Result<()> {
        ctx.deregister_table(table.as_str())?;
        Ok(())
    }
}
