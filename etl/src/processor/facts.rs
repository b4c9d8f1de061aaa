use crate::processor::calendar::CalendarField;
use crate::processor::keys::SurrogateKeys;
use crate::processor::udf::{START_TIME_UDF, calendar_expr, field_udf_name};
use common::Result;
use common::config::JoinMode;
use datafusion::functions_aggregate::expr_fn::{count, min};
use datafusion::logical_expr::{col, ident, lit};
use datafusion::prelude::{DataFrame, JoinType, SessionContext};
use serde::Serialize;
use tracing::{info, warn};

pub const EVENT_ID_SEQUENCE: &str = "event_id";

/// Outcome of one fact join.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JoinReport {
    /// Play events with an actor id.
    pub events: usize,
    pub facts: usize,
    pub matched: usize,
    /// Events without a catalog match; kept with null keys in left mode,
    /// dropped in inner mode.
    pub unmatched: usize,
    /// Facts whose title and publisher name matched more than one item.
    pub fanout_events: usize,
}

/// Builds the fact table from play events and the committed item and
/// publisher dimensions.
///
/// Events match items on `song == title` and `artist == publisher name`.
/// When several items share both, the smallest `item_id` wins, so every
/// event yields at most one fact.
pub struct FactJoiner<'a> {
    ctx: &'a SessionContext,
    keys: &'a SurrogateKeys,
    join_mode: JoinMode,
}

impl<'a> FactJoiner<'a> {
    pub fn new(ctx: &'a SessionContext, keys: &'a SurrogateKeys, join_mode: JoinMode) -> Self {
        Self {
            ctx,
            keys,
            join_mode,
        }
    }

    pub async fn join_facts(
        &self,
        plays: DataFrame,
        items: DataFrame,
        publishers: DataFrame,
    ) -> Result<(DataFrame, JoinReport)> {
        let events = plays
            .filter(ident("userId").is_not_null())?
            .select(vec![
                col("ts"),
                ident("userId"),
                col("level"),
                col("song"),
                col("artist"),
                ident("sessionId"),
                col("location"),
                ident("userAgent"),
            ])?;
        let events = self
            .keys
            .assign(self.ctx, events, EVENT_ID_SEQUENCE, "event_id")
            .await?;

        let join_type = match self.join_mode {
            JoinMode::Left => JoinType::Left,
            JoinMode::Inner => JoinType::Inner,
        };
        let joined = events
            .clone()
            .join(
                catalog_matches(items, publishers)?,
                join_type,
                &["song", "artist"],
                &["match_title", "match_name"],
                None,
            )?
            .cache()
            .await?;

        let report = self.report(&events, &joined).await?;
        Ok((self.project(joined)?, report))
    }

    async fn report(&self, events: &DataFrame, joined: &DataFrame) -> Result<JoinReport> {
        let events = events.clone().count().await?;
        let facts = joined.clone().count().await?;
        let matched = joined
            .clone()
            .filter(col("match_item_id").is_not_null())?
            .count()
            .await?;
        let fanout_events = joined
            .clone()
            .filter(col("candidate_count").gt(lit(1i64)))?
            .count()
            .await?;

        let report = JoinReport {
            events,
            facts,
            matched,
            unmatched: events - matched,
            fanout_events,
        };
        info!(
            events = report.events,
            facts = report.facts,
            matched = report.matched,
            "Fact join complete"
        );
        if report.unmatched > 0 {
            warn!(
                unmatched = report.unmatched,
                join_mode = ?self.join_mode,
                "Play events without a catalog match"
            );
        }
        if report.fanout_events > 0 {
            warn!(
                fanout_events = report.fanout_events,
                "Play events matched several catalog items; kept the smallest item_id"
            );
        }
        Ok(report)
    }

    fn project(&self, joined: DataFrame) -> Result<DataFrame> {
        let ts = || col("ts");
        Ok(joined.select(vec![
            col("event_id"),
            calendar_expr(self.ctx, START_TIME_UDF, ts())?.alias("start_time"),
            ident("userId").alias("actor_id"),
            col("level"),
            col("match_item_id").alias("item_id"),
            col("match_publisher_id").alias("publisher_id"),
            ident("sessionId").alias("session_id"),
            col("location"),
            ident("userAgent").alias("user_agent"),
            calendar_expr(self.ctx, &field_udf_name(CalendarField::Year), ts())?.alias("year"),
            calendar_expr(self.ctx, &field_udf_name(CalendarField::Month), ts())?.alias("month"),
        ])?)
    }
}

/// One row per distinct `(title, publisher name)` with the winning item, its
/// publisher and the number of items that shared the pair.
fn catalog_matches(items: DataFrame, publishers: DataFrame) -> Result<DataFrame> {
    let names = publishers.select(vec![
        col("publisher_id").alias("name_publisher_id"),
        col("name"),
    ])?;
    let candidates = items
        .clone()
        .select(vec![col("item_id"), col("title"), col("publisher_id")])?
        .join(
            names,
            JoinType::Inner,
            &["publisher_id"],
            &["name_publisher_id"],
            None,
        )?
        .select(vec![col("item_id"), col("title"), col("name")])?
        .distinct()?;

    let grouped = candidates.aggregate(
        vec![col("title"), col("name")],
        vec![
            min(col("item_id")).alias("match_item_id"),
            count(col("item_id")).alias("candidate_count"),
        ],
    )?;

    let winners = items.select(vec![
        col("item_id").alias("winner_item_id"),
        col("publisher_id").alias("match_publisher_id"),
    ])?;
    Ok(grouped
        .join(
            winners,
            JoinType::Inner,
            &["match_item_id"],
            &["winner_item_id"],
            None,
        )?
        .select(vec![
            col("title").alias("match_title"),
            col("name").alias("match_name"),
            col("match_item_id"),
            col("match_publisher_id"),
            col("candidate_count"),
        ])?)
}
