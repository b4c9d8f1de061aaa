use crate::processor::keys::SurrogateKeys;
use common::Result;
use datafusion::logical_expr::{col, ident};
use datafusion::prelude::{DataFrame, SessionContext};
use serde::Serialize;
use tracing::{info, warn};

pub const ITEM_ID_SEQUENCE: &str = "item_id";

/// Row counts of one extracted dimension.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DimensionMetrics {
    pub input_rows: usize,
    pub rows: usize,
    /// Keys carried by more than one surviving row.
    pub key_collisions: usize,
}

/// Catalog items, one row per distinct `(title, publisher_id, year,
/// duration)`, keyed by a fresh `item_id`.
pub async fn extract_item_dimension(
    ctx: &SessionContext,
    keys: &SurrogateKeys,
    catalog: DataFrame,
) -> Result<DataFrame> {
    let distinct = catalog
        .select(vec![
            col("title"),
            col("artist_id").alias("publisher_id"),
            col("year"),
            col("duration"),
        ])?
        .distinct()?;
    keys.assign(ctx, distinct, ITEM_ID_SEQUENCE, "item_id").await
}

/// Publishers, deduplicated on the full tuple.
pub fn extract_publisher_dimension(catalog: DataFrame) -> Result<DataFrame> {
    Ok(catalog
        .select(vec![
            col("artist_id").alias("publisher_id"),
            col("artist_name").alias("name"),
            col("artist_location").alias("location"),
            col("artist_latitude").alias("latitude"),
            col("artist_longitude").alias("longitude"),
        ])?
        .distinct()?)
}

/// Actors seen in `events`, deduplicated on the full tuple. Events without
/// an actor id are dropped first.
pub fn extract_actor_dimension(events: DataFrame) -> Result<DataFrame> {
    Ok(events
        .filter(ident("userId").is_not_null())?
        .select(vec![
            ident("userId").alias("actor_id"),
            ident("firstName").alias("first_name"),
            ident("lastName").alias("last_name"),
            col("gender"),
            col("level"),
        ])?
        .distinct()?)
}

/// Counts keys shared by more than one row of `dimension`.
pub async fn key_collisions(dimension: &DataFrame, key: &str) -> Result<usize> {
    let rows = dimension.clone().count().await?;
    let keys = dimension.clone().select(vec![col(key)])?.distinct()?.count().await?;
    Ok(rows - keys)
}

/// Collects row and collision counts for a dimension and logs them.
pub async fn dimension_metrics(
    name: &str,
    input: &DataFrame,
    dimension: &DataFrame,
    key: &str,
) -> Result<DimensionMetrics> {
    let metrics = DimensionMetrics {
        input_rows: input.clone().count().await?,
        rows: dimension.clone().count().await?,
        key_collisions: key_collisions(dimension, key).await?,
    };
    info!(
        dimension = name,
        input_rows = metrics.input_rows,
        rows = metrics.rows,
        "Dimension extracted"
    );
    if metrics.key_collisions > 0 {
        warn!(
            dimension = name,
            key,
            collisions = metrics.key_collisions,
            "Rows sharing a key with differing attributes were retained"
        );
    }
    Ok(metrics)
}
