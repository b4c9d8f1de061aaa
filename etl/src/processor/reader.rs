use crate::processor::calendar::truncate_epoch_millis;
use crate::schema::{FieldSpec, RecordType, SemanticType, arrow_schema_for, schema_for};
use crate::storage::StorageLocation;
use arrow::array::{
    ArrayRef, Float64Builder, Int32Builder, RecordBatch, StringBuilder,
    TimestampMillisecondBuilder,
};
use chrono::DateTime;
use common::config::CalendarGranularity;
use common::{Error, Result};
use datafusion::datasource::MemTable;
use datafusion::prelude::{DataFrame, SessionContext};
use futures::{StreamExt, TryStreamExt, stream};
use globset::{GlobBuilder, GlobMatcher};
use object_store::path::Path;
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Outcome of reading one record type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReadReport {
    pub shards: usize,
    pub records: usize,
    pub skipped: usize,
}

/// Records decoded from one shard.
#[derive(Debug)]
pub struct DecodedShard {
    pub batch: RecordBatch,
    pub skipped: usize,
}

pub struct RecordReader {
    location: StorageLocation,
    concurrency: usize,
}

impl RecordReader {
    pub fn new(location: StorageLocation, concurrency: usize) -> Self {
        Self {
            location,
            concurrency: concurrency.max(1),
        }
    }

    /// Shards under the root whose relative path matches `pattern`, sorted.
    pub async fn list_shards(&self, pattern: &str) -> Result<Vec<Path>> {
        let matcher = compile_pattern(pattern)?;
        let prefix = self.location.child(&literal_prefix(pattern));

        let objects: Vec<_> = self
            .location
            .store()
            .list(Some(&prefix))
            .try_collect()
            .await
            .map_err(|e| Error::Read {
                path: format!("{}{}", self.location.url(), pattern),
                reason: e.to_string(),
            })?;

        let mut shards: Vec<Path> = objects
            .into_iter()
            .map(|meta| meta.location)
            .filter(|path| {
                self.location
                    .relative(path)
                    .is_some_and(|relative| matcher.is_match(relative))
            })
            .collect();
        shards.sort();
        Ok(shards)
    }

    /// Reads every shard matching `pattern` as `record_type`. Each shard
    /// becomes one partition of the returned relation.
    pub async fn read(
        &self,
        ctx: &SessionContext,
        pattern: &str,
        record_type: RecordType,
    ) -> Result<(DataFrame, ReadReport)> {
        let shards = self.list_shards(pattern).await?;
        if shards.is_empty() {
            return Err(Error::Read {
                path: format!("{}{}", self.location.url(), pattern),
                reason: "no shards matched".to_string(),
            });
        }
        info!(
            record_type = record_type.as_str(),
            shards = shards.len(),
            "Reading shards"
        );

        let store = self.location.store().clone();
        let decoded: Vec<DecodedShard> = stream::iter(shards.iter().cloned())
            .map(|path| {
                let store = store.clone();
                async move {
                    let read_error = |reason: String| Error::Read {
                        path: path.to_string(),
                        reason,
                    };
                    let bytes = store
                        .get(&path)
                        .await
                        .map_err(|e| read_error(e.to_string()))?
                        .bytes()
                        .await
                        .map_err(|e| read_error(e.to_string()))?;
                    let shard =
                        tokio::task::spawn_blocking(move || decode_shard(&bytes, record_type))
                            .await
                            .map_err(|e| read_error(e.to_string()))??;
                    debug!(
                        shard = %path,
                        records = shard.batch.num_rows(),
                        skipped = shard.skipped,
                        "Decoded shard"
                    );
                    Ok::<_, Error>(shard)
                }
            })
            .buffer_unordered(self.concurrency)
            .try_collect()
            .await?;

        let report = ReadReport {
            shards: shards.len(),
            records: decoded.iter().map(|s| s.batch.num_rows()).sum(),
            skipped: decoded.iter().map(|s| s.skipped).sum(),
        };
        if report.skipped > 0 {
            warn!(
                record_type = record_type.as_str(),
                skipped = report.skipped,
                "Skipped malformed records"
            );
        }

        let partitions: Vec<Vec<RecordBatch>> =
            decoded.into_iter().map(|shard| vec![shard.batch]).collect();
        let table = MemTable::try_new(arrow_schema_for(record_type), partitions)?;
        Ok((ctx.read_table(Arc::new(table))?, report))
    }
}

fn compile_pattern(pattern: &str) -> Result<GlobMatcher> {
    let glob = GlobBuilder::new(pattern.trim_start_matches('/'))
        .literal_separator(true)
        .build()
        .map_err(|e| Error::Config(format!("Invalid shard pattern '{}': {}", pattern, e)))?;
    Ok(glob.compile_matcher())
}

/// Leading directories of `pattern` that contain no glob syntax.
fn literal_prefix(pattern: &str) -> String {
    let segments: Vec<&str> = pattern
        .trim_start_matches('/')
        .split('/')
        .collect();
    segments[..segments.len().saturating_sub(1)]
        .iter()
        .take_while(|segment| !segment.contains(['*', '?', '[', '{']))
        .copied()
        .collect::<Vec<_>>()
        .join("/")
}

/// Parses a shard as one JSON document (object or array of objects), falling
/// back to newline-delimited JSON. Returns the values and the number of
/// unparseable lines.
fn parse_documents(bytes: &[u8]) -> (Vec<Value>, usize) {
    if let Ok(value) = serde_json::from_slice::<Value>(bytes) {
        return match value {
            Value::Array(items) => (items, 0),
            other => (vec![other], 0),
        };
    }

    let mut values = Vec::new();
    let mut malformed = 0;
    for line in bytes.split(|b| *b == b'\n') {
        let line = line.trim_ascii();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_slice::<Value>(line) {
            Ok(value) => values.push(value),
            Err(_) => malformed += 1,
        }
    }
    (values, malformed)
}

/// Decodes and validates one shard against the registered schema. Records
/// that do not conform are counted and dropped.
pub fn decode_shard(bytes: &[u8], record_type: RecordType) -> Result<DecodedShard> {
    let fields = schema_for(record_type);
    let (values, mut skipped) = parse_documents(bytes);
    let mut builder = BatchBuilder::new(fields, values.len());

    for value in &values {
        let Value::Object(record) = value else {
            skipped += 1;
            continue;
        };
        match coerce_record(record, fields) {
            Some(cells) => builder.append(cells),
            None => skipped += 1,
        }
    }

    let batch = RecordBatch::try_new(arrow_schema_for(record_type), builder.finish())?;
    Ok(DecodedShard { batch, skipped })
}

#[derive(Debug, Clone, PartialEq)]
enum Cell {
    Null,
    Str(String),
    Double(f64),
    Integer(i32),
    Timestamp(i64),
}

fn coerce_record(record: &Map<String, Value>, fields: &[FieldSpec]) -> Option<Vec<Cell>> {
    fields
        .iter()
        .map(|spec| {
            let cell = coerce_value(record.get(spec.name), spec.semantic_type)?;
            if cell == Cell::Null && !spec.nullable {
                return None;
            }
            Some(cell)
        })
        .collect()
}

/// `None` means the value cannot represent the semantic type.
fn coerce_value(value: Option<&Value>, semantic_type: SemanticType) -> Option<Cell> {
    let value = match value {
        None | Some(Value::Null) => return Some(Cell::Null),
        Some(value) => value,
    };

    match semantic_type {
        SemanticType::String => match value {
            Value::String(s) => Some(Cell::Str(s.clone())),
            Value::Number(n) => Some(Cell::Str(n.to_string())),
            Value::Bool(b) => Some(Cell::Str(b.to_string())),
            _ => None,
        },
        SemanticType::Double => match value {
            Value::Number(n) => n.as_f64().map(Cell::Double),
            Value::String(s) if s.trim().is_empty() => Some(Cell::Null),
            Value::String(s) => s.trim().parse::<f64>().ok().map(Cell::Double),
            _ => None,
        },
        SemanticType::Integer => match value {
            Value::Number(n) => integer_from_number(n).map(Cell::Integer),
            Value::String(s) if s.trim().is_empty() => Some(Cell::Null),
            Value::String(s) => s
                .trim()
                .parse::<i64>()
                .ok()
                .and_then(|v| i32::try_from(v).ok())
                .map(Cell::Integer),
            _ => None,
        },
        SemanticType::Timestamp => {
            let millis = match value {
                Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.trunc() as i64)),
                Value::String(s) if s.trim().is_empty() => return Some(Cell::Null),
                Value::String(s) => s.trim().parse::<i64>().ok().or_else(|| {
                    DateTime::parse_from_rfc3339(s.trim())
                        .ok()
                        .map(|dt| dt.timestamp_millis())
                }),
                _ => None,
            }?;
            // Only timestamps the calendar can truncate are accepted.
            truncate_epoch_millis(millis, CalendarGranularity::Day)?;
            Some(Cell::Timestamp(millis))
        }
    }
}

fn integer_from_number(n: &serde_json::Number) -> Option<i32> {
    if let Some(v) = n.as_i64() {
        return i32::try_from(v).ok();
    }
    let f = n.as_f64()?;
    if f.fract() == 0.0 && f >= i32::MIN as f64 && f <= i32::MAX as f64 {
        Some(f as i32)
    } else {
        None
    }
}

enum ColumnBuilder {
    Str(StringBuilder),
    Double(Float64Builder),
    Integer(Int32Builder),
    Timestamp(TimestampMillisecondBuilder),
}

struct BatchBuilder {
    columns: Vec<ColumnBuilder>,
}

impl BatchBuilder {
    fn new(fields: &[FieldSpec], capacity: usize) -> Self {
        let columns = fields
            .iter()
            .map(|spec| match spec.semantic_type {
                SemanticType::String => {
                    ColumnBuilder::Str(StringBuilder::with_capacity(capacity, capacity * 16))
                }
                SemanticType::Double => {
                    ColumnBuilder::Double(Float64Builder::with_capacity(capacity))
                }
                SemanticType::Integer => {
                    ColumnBuilder::Integer(Int32Builder::with_capacity(capacity))
                }
                SemanticType::Timestamp => {
                    ColumnBuilder::Timestamp(TimestampMillisecondBuilder::with_capacity(capacity))
                }
            })
            .collect();
        Self { columns }
    }

    /// `cells` were produced by `coerce_record` for the same field list, so
    /// every cell matches its column's type or is null.
    fn append(&mut self, cells: Vec<Cell>) {
        for (column, cell) in self.columns.iter_mut().zip(cells) {
            match (column, cell) {
                (ColumnBuilder::Str(b), Cell::Str(v)) => b.append_value(v),
                (ColumnBuilder::Double(b), Cell::Double(v)) => b.append_value(v),
                (ColumnBuilder::Integer(b), Cell::Integer(v)) => b.append_value(v),
                (ColumnBuilder::Timestamp(b), Cell::Timestamp(v)) => b.append_value(v),
                (ColumnBuilder::Str(b), _) => b.append_null(),
                (ColumnBuilder::Double(b), _) => b.append_null(),
                (ColumnBuilder::Integer(b), _) => b.append_null(),
                (ColumnBuilder::Timestamp(b), _) => b.append_null(),
            }
        }
    }

    fn finish(self) -> Vec<ArrayRef> {
        self.columns
            .into_iter()
            .map(|column| -> ArrayRef {
                match column {
                    ColumnBuilder::Str(mut b) => Arc::new(b.finish()),
                    ColumnBuilder::Double(mut b) => Arc::new(b.finish()),
                    ColumnBuilder::Integer(mut b) => Arc::new(b.finish()),
                    ColumnBuilder::Timestamp(mut b) => Arc::new(b.finish()),
                }
            })
            .collect()
    }
}
