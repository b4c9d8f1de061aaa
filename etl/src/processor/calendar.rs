use crate::processor::udf::{START_TIME_UDF, calendar_expr, field_udf_name};
use chrono::{DateTime, Datelike, DurationRound, TimeDelta, Timelike, Utc};
use common::Result;
use common::config::CalendarGranularity;
use datafusion::logical_expr::col;
use datafusion::prelude::{DataFrame, SessionContext};

/// Calendar attributes of one (truncated) event timestamp. Everything is UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CalendarParts {
    /// Truncated timestamp, milliseconds since the Unix epoch.
    pub start_time: i64,
    pub hour: i32,
    pub day: i32,
    /// ISO-8601 week number.
    pub week: i32,
    pub month: i32,
    pub year: i32,
    /// ISO weekday, Monday = 1 .. Sunday = 7.
    pub weekday: i32,
}

/// Truncates epoch milliseconds to `granularity`. `None` when the value is
/// outside chrono's representable range.
pub fn truncate_epoch_millis(ts: i64, granularity: CalendarGranularity) -> Option<DateTime<Utc>> {
    let timestamp = DateTime::from_timestamp_millis(ts)?;
    match granularity {
        CalendarGranularity::Millisecond => Some(timestamp),
        CalendarGranularity::Hour => timestamp.duration_trunc(TimeDelta::hours(1)).ok(),
        CalendarGranularity::Day => timestamp.duration_trunc(TimeDelta::days(1)).ok(),
    }
}

impl CalendarParts {
    pub fn from_epoch_millis(ts: i64, granularity: CalendarGranularity) -> Option<Self> {
        let start = truncate_epoch_millis(ts, granularity)?;
        Some(Self {
            start_time: start.timestamp_millis(),
            hour: start.hour() as i32,
            day: start.day() as i32,
            week: start.iso_week().week() as i32,
            month: start.month() as i32,
            year: start.year(),
            weekday: start.weekday().number_from_monday() as i32,
        })
    }
}

/// One derived calendar column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalendarField {
    Hour,
    Day,
    Week,
    Month,
    Year,
    Weekday,
}

impl CalendarField {
    pub const ALL: [CalendarField; 6] = [
        CalendarField::Hour,
        CalendarField::Day,
        CalendarField::Week,
        CalendarField::Month,
        CalendarField::Year,
        CalendarField::Weekday,
    ];

    pub fn column(&self) -> &'static str {
        match self {
            CalendarField::Hour => "hour",
            CalendarField::Day => "day",
            CalendarField::Week => "week",
            CalendarField::Month => "month",
            CalendarField::Year => "year",
            CalendarField::Weekday => "weekday",
        }
    }

    pub fn extract(&self, parts: &CalendarParts) -> i32 {
        match self {
            CalendarField::Hour => parts.hour,
            CalendarField::Day => parts.day,
            CalendarField::Week => parts.week,
            CalendarField::Month => parts.month,
            CalendarField::Year => parts.year,
            CalendarField::Weekday => parts.weekday,
        }
    }
}

/// Calendar rows for the `ts` column of `events`, one per distinct start
/// time. The calendar UDFs must be registered on `ctx`.
pub fn derive_calendar(ctx: &SessionContext, events: DataFrame) -> Result<DataFrame> {
    let mut columns = vec![calendar_expr(ctx, START_TIME_UDF, col("ts"))?.alias("start_time")];
    for field in CalendarField::ALL {
        columns.push(
            calendar_expr(ctx, &field_udf_name(field), col("ts"))?.alias(field.column()),
        );
    }
    Ok(events.select(columns)?.distinct()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    // 2018-11-01T20:57:10.796Z, a Thursday in ISO week 44.
    const GOLDEN_TS: i64 = 1541105830796;

    #[test]
    fn golden_timestamp_at_day_granularity() {
        let parts = CalendarParts::from_epoch_millis(GOLDEN_TS, CalendarGranularity::Day).unwrap();
        assert_eq!(parts.start_time, 1541030400000);
        assert_eq!(parts.hour, 0);
        assert_eq!(parts.day, 1);
        assert_eq!(parts.week, 44);
        assert_eq!(parts.month, 11);
        assert_eq!(parts.year, 2018);
        assert_eq!(parts.weekday, 4);
    }

    #[test]
    fn golden_timestamp_at_hour_granularity() {
        let parts = CalendarParts::from_epoch_millis(GOLDEN_TS, CalendarGranularity::Hour).unwrap();
        assert_eq!(parts.start_time, 1541102400000);
        assert_eq!(parts.hour, 20);
        assert_eq!(parts.weekday, 4);
    }

    #[test]
    fn millisecond_granularity_keeps_timestamp() {
        let parts =
            CalendarParts::from_epoch_millis(GOLDEN_TS, CalendarGranularity::Millisecond).unwrap();
        assert_eq!(parts.start_time, GOLDEN_TS);
        assert_eq!(parts.hour, 20);
    }

    #[test]
    fn derivation_is_deterministic() {
        for granularity in [
            CalendarGranularity::Day,
            CalendarGranularity::Hour,
            CalendarGranularity::Millisecond,
        ] {
            assert_eq!(
                CalendarParts::from_epoch_millis(GOLDEN_TS, granularity),
                CalendarParts::from_epoch_millis(GOLDEN_TS, granularity)
            );
        }
    }

    #[test]
    fn iso_week_crosses_year_boundary() {
        // 2018-12-31 is a Monday in ISO week 1 of 2019.
        let parts =
            CalendarParts::from_epoch_millis(1546214400000, CalendarGranularity::Day).unwrap();
        assert_eq!(parts.year, 2018);
        assert_eq!(parts.week, 1);
        assert_eq!(parts.weekday, 1);
    }

    #[test]
    fn pre_epoch_timestamps_truncate_downwards() {
        // 1969-12-31T23:00:00Z
        let parts = CalendarParts::from_epoch_millis(-3_600_000, CalendarGranularity::Day).unwrap();
        assert_eq!(parts.start_time, -86_400_000);
        assert_eq!(parts.day, 31);
    }

    #[tokio::test]
    async fn derive_calendar_dedups_by_start_time() {
        use crate::processor::reader::decode_shard;
        use crate::processor::udf::register_udfs;
        use crate::schema::{OutputTable, RecordType};
        use arrow::array::{Array, Int32Array, TimestampMillisecondArray};

        let ctx = SessionContext::new();
        register_udfs(&ctx, CalendarGranularity::Day);
        let body = [GOLDEN_TS, GOLDEN_TS + 60_000, 1546214400000]
            .iter()
            .map(|ts| format!(r#"{{"page":"NextSong","ts":{}}}"#, ts))
            .collect::<Vec<_>>()
            .join("\n");
        let events = decode_shard(body.as_bytes(), RecordType::Event).unwrap();
        let calendar = derive_calendar(&ctx, ctx.read_batch(events.batch).unwrap()).unwrap();

        let names: Vec<String> = calendar
            .schema()
            .as_arrow()
            .fields()
            .iter()
            .map(|f| f.name().clone())
            .collect();
        let expected: Vec<String> = OutputTable::Time
            .schema()
            .fields()
            .iter()
            .map(|f| f.name().clone())
            .collect();
        assert_eq!(names, expected);

        let batches = calendar.sort_by(vec![col("start_time")]).unwrap().collect().await.unwrap();
        let rows: usize = batches.iter().map(|b| b.num_rows()).sum();
        assert_eq!(rows, 2);
        let first = &batches[0];
        let start = first
            .column(0)
            .as_any()
            .downcast_ref::<TimestampMillisecondArray>()
            .unwrap();
        assert_eq!(start.value(0), 1541030400000);
        let week = first
            .column_by_name("week")
            .unwrap()
            .as_any()
            .downcast_ref::<Int32Array>()
            .unwrap();
        assert_eq!(week.value(0), 44);
    }
}
