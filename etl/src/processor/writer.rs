use crate::schema::OutputTable;
use crate::storage::StorageLocation;
use crate::utils::paths::{PathBuilder, part_file_name};
use arrow::array::{Array, RecordBatch, UInt32Array};
use arrow::compute::take_record_batch;
use arrow::datatypes::SchemaRef;
use arrow::util::display::array_value_to_string;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use common::{Error, Result};
use datafusion::prelude::DataFrame;
use futures::TryStreamExt;
use object_store::path::Path;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::metadata::KeyValue;
use parquet::file::properties::WriterProperties;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, info, warn};

/// Contents of a table's `_SUCCESS` object. Its presence means every part
/// file of `run_id` is durable and no files of earlier runs remain.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct TableMarker {
    pub table: String,
    pub run_id: String,
    pub row_count: usize,
    pub partition_columns: Vec<String>,
    pub partition_count: usize,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub struct WriteReport {
    pub table: String,
    pub rows: usize,
    pub partitions: usize,
    pub files: usize,
}

/// Rows of one output partition.
struct Partition {
    path: PathBuilder,
    batches: Vec<RecordBatch>,
}

pub struct PartitionedWriter {
    location: StorageLocation,
    run_id: String,
}

impl PartitionedWriter {
    pub fn new(location: StorageLocation, run_id: impl Into<String>) -> Self {
        Self {
            location,
            run_id: run_id.into(),
        }
    }

    pub fn location(&self) -> &StorageLocation {
        &self.location
    }

    pub fn marker_path(&self, table: OutputTable) -> Path {
        self.location
            .child(&PathBuilder::new(table.as_str()).build_marker_path())
    }

    /// Replaces `table` with the rows of `df`. Either every part file of this
    /// run is committed under a fresh marker, or the call fails and the table
    /// has no marker.
    pub async fn write(&self, table: OutputTable, df: DataFrame) -> Result<WriteReport> {
        let schema = table.schema();
        let batches = df.collect().await?;
        let batches = conform_batches(table, &schema, batches)?;
        let rows: usize = batches.iter().map(|b| b.num_rows()).sum();

        let partitions = split_partitions(table, batches)?;
        let properties = self.writer_properties(table);

        let mut files = Vec::with_capacity(partitions.len());
        for (index, partition) in partitions.iter().enumerate() {
            let segments = partition
                .path
                .build_file_segments(&part_file_name(index, &self.run_id));
            let bytes = encode_parquet(&schema, &partition.batches, properties.clone())
                .map_err(|e| write_error(table, e))?;
            files.push((self.location.child_segments(&segments), bytes));
        }

        self.commit(table, files, rows).await?;

        let report = WriteReport {
            table: table.as_str().to_string(),
            rows,
            partitions: partitions.len(),
            files: partitions.len(),
        };
        info!(
            table = table.as_str(),
            rows = report.rows,
            partitions = report.partitions,
            "Table committed"
        );
        Ok(report)
    }

    fn writer_properties(&self, table: OutputTable) -> WriterProperties {
        WriterProperties::builder()
            .set_compression(Compression::SNAPPY)
            .set_key_value_metadata(Some(vec![
                KeyValue::new("table".to_string(), table.as_str().to_string()),
                KeyValue::new("run_id".to_string(), self.run_id.clone()),
            ]))
            .build()
    }

    async fn commit(
        &self,
        table: OutputTable,
        files: Vec<(Path, Bytes)>,
        rows: usize,
    ) -> Result<()> {
        let store = self.location.store();
        let marker_path = self.marker_path(table);
        let table_prefix = self.location.child(table.as_str());

        let previous: Vec<Path> = store
            .list(Some(&table_prefix))
            .map_ok(|meta| meta.location)
            .try_collect()
            .await
            .map_err(|e| write_error(table, e))?;

        delete_if_exists(store.as_ref(), &marker_path)
            .await
            .map_err(|e| write_error(table, e))?;

        let mut written: Vec<Path> = Vec::with_capacity(files.len());
        for (path, bytes) in files {
            debug!(path = %path, size = bytes.len(), "Writing part file");
            if let Err(e) = store.put(&path, bytes.into()).await {
                warn!(
                    table = table.as_str(),
                    error = %e,
                    "Part file write failed, rolling back"
                );
                for path in &written {
                    if let Err(e) = delete_if_exists(store.as_ref(), path).await {
                        warn!(path = %path, error = %e, "Failed to remove partial part file");
                    }
                }
                return Err(write_error(table, e));
            }
            written.push(path);
        }

        let current: HashSet<&Path> = written.iter().collect();
        for path in previous
            .iter()
            .filter(|p| **p != marker_path && !current.contains(p))
        {
            debug!(path = %path, "Removing stale file");
            delete_if_exists(store.as_ref(), path)
                .await
                .map_err(|e| write_error(table, e))?;
        }

        let marker = TableMarker {
            table: table.as_str().to_string(),
            run_id: self.run_id.clone(),
            row_count: rows,
            partition_columns: table
                .partition_columns()
                .iter()
                .map(|c| c.to_string())
                .collect(),
            partition_count: written.len(),
            created_at: Utc::now(),
        };
        let marker_json = serde_json::to_vec_pretty(&marker)?;
        store
            .put(&marker_path, marker_json.into())
            .await
            .map_err(|e| write_error(table, e))?;
        Ok(())
    }
}

/// Reads the `_SUCCESS` marker of `table`, `None` when it is absent.
pub async fn read_marker(
    location: &StorageLocation,
    table: OutputTable,
) -> Result<Option<TableMarker>> {
    let path = location.child(&PathBuilder::new(table.as_str()).build_marker_path());
    match location.store().get(&path).await {
        Ok(result) => {
            let bytes = result.bytes().await?;
            Ok(Some(serde_json::from_slice(&bytes)?))
        }
        Err(object_store::Error::NotFound { .. }) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn write_error(table: OutputTable, e: impl std::fmt::Display) -> Error {
    Error::Write {
        table: table.as_str().to_string(),
        reason: e.to_string(),
    }
}

async fn delete_if_exists(
    store: &dyn object_store::ObjectStore,
    path: &Path,
) -> object_store::Result<()> {
    match store.delete(path).await {
        Err(object_store::Error::NotFound { .. }) => Ok(()),
        other => other,
    }
}

/// Re-labels `batches` with the table schema, checking names, types and
/// nullability.
fn conform_batches(
    table: OutputTable,
    schema: &SchemaRef,
    batches: Vec<RecordBatch>,
) -> Result<Vec<RecordBatch>> {
    batches
        .into_iter()
        .map(|batch| {
            let names: Vec<&str> = batch
                .schema_ref()
                .fields()
                .iter()
                .map(|f| f.name().as_str())
                .collect();
            let expected: Vec<&str> =
                schema.fields().iter().map(|f| f.name().as_str()).collect();
            if names != expected {
                return Err(Error::SchemaValidation(format!(
                    "{} expected columns {:?}, got {:?}",
                    table.as_str(),
                    expected,
                    names
                )));
            }
            RecordBatch::try_new(schema.clone(), batch.columns().to_vec()).map_err(|e| {
                Error::SchemaValidation(format!("{}: {}", table.as_str(), e))
            })
        })
        .collect()
}

/// Groups rows by their partition values. Partitions are ordered by value so
/// part numbering is stable for the same input. A table with no rows yields a
/// single empty partition at the table root.
fn split_partitions(table: OutputTable, batches: Vec<RecordBatch>) -> Result<Vec<Partition>> {
    let columns = table.partition_columns();
    if batches.iter().all(|b| b.num_rows() == 0) {
        return Ok(vec![Partition {
            path: PathBuilder::new(table.as_str()),
            batches: Vec::new(),
        }]);
    }
    if columns.is_empty() {
        return Ok(vec![Partition {
            path: PathBuilder::new(table.as_str()),
            batches,
        }]);
    }

    let mut grouped: BTreeMap<Vec<Option<String>>, Vec<RecordBatch>> = BTreeMap::new();
    for batch in &batches {
        let arrays = columns
            .iter()
            .map(|name| {
                batch.column_by_name(name).ok_or_else(|| {
                    Error::SchemaValidation(format!(
                        "{} is missing partition column {}",
                        table.as_str(),
                        name
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let mut rows_by_key: BTreeMap<Vec<Option<String>>, Vec<u32>> = BTreeMap::new();
        for row in 0..batch.num_rows() {
            let key = arrays
                .iter()
                .map(|array| {
                    if array.is_null(row) {
                        Ok(None)
                    } else {
                        array_value_to_string(array, row).map(Some)
                    }
                })
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows_by_key.entry(key).or_default().push(row as u32);
        }

        for (key, rows) in rows_by_key {
            let taken = take_record_batch(batch, &UInt32Array::from(rows))?;
            grouped.entry(key).or_default().push(taken);
        }
    }

    Ok(grouped
        .into_iter()
        .map(|(key, batches)| {
            let path = columns
                .iter()
                .zip(key.iter())
                .fold(PathBuilder::new(table.as_str()), |path, (column, value)| {
                    path.with_partition(column, value.as_deref())
                });
            Partition { path, batches }
        })
        .collect())
}

fn encode_parquet(
    schema: &SchemaRef,
    batches: &[RecordBatch],
    properties: WriterProperties,
) -> Result<Bytes> {
    let mut buffer: Vec<u8> = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buffer, schema.clone(), Some(properties))?;
    for batch in batches {
        writer.write(batch)?;
    }
    writer.close()?;
    Ok(Bytes::from(buffer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::table::{ParquetTableRegistry, TableRegistry};
    use crate::utils::paths::NULL_PARTITION_VALUE;
    use arrow::array::{
        Float64Array, Int32Array, Int64Array, StringArray, TimestampMillisecondArray,
    };
    use arrow::compute::concat_batches;
    use async_trait::async_trait;
    use datafusion::logical_expr::col;
    use datafusion::prelude::SessionContext;
    use futures::stream::BoxStream;
    use object_store::memory::InMemory;
    use object_store::{
        GetOptions, GetResult, ListResult, MultipartUpload, ObjectMeta, ObjectStore,
        PutMultipartOpts, PutOptions, PutPayload, PutResult,
    };
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;
    use url::Url;

    /// In-memory store whose puts start failing after `allowed` succeed.
    #[derive(Debug)]
    struct FailingPuts {
        inner: InMemory,
        allowed: usize,
        puts: AtomicUsize,
    }

    impl FailingPuts {
        fn new(allowed: usize) -> Self {
            Self {
                inner: InMemory::new(),
                allowed,
                puts: AtomicUsize::new(0),
            }
        }
    }

    impl std::fmt::Display for FailingPuts {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "FailingPuts({})", self.allowed)
        }
    }

    #[async_trait]
    impl ObjectStore for FailingPuts {
        async fn put_opts(
            &self,
            location: &Path,
            payload: PutPayload,
            opts: PutOptions,
        ) -> object_store::Result<PutResult> {
            if self.puts.fetch_add(1, Ordering::SeqCst) >= self.allowed {
                return Err(object_store::Error::Generic {
                    store: "FailingPuts",
                    source: format!("refusing to write {}", location).into(),
                });
            }
            self.inner.put_opts(location, payload, opts).await
        }

        async fn put_multipart_opts(
            &self,
            location: &Path,
            opts: PutMultipartOpts,
        ) -> object_store::Result<Box<dyn MultipartUpload>> {
            self.inner.put_multipart_opts(location, opts).await
        }

        async fn get_opts(
            &self,
            location: &Path,
            options: GetOptions,
        ) -> object_store::Result<GetResult> {
            self.inner.get_opts(location, options).await
        }

        async fn delete(&self, location: &Path) -> object_store::Result<()> {
            self.inner.delete(location).await
        }

        fn list(
            &self,
            prefix: Option<&Path>,
        ) -> BoxStream<'_, object_store::Result<ObjectMeta>> {
            self.inner.list(prefix)
        }

        async fn list_with_delimiter(
            &self,
            prefix: Option<&Path>,
        ) -> object_store::Result<ListResult> {
            self.inner.list_with_delimiter(prefix).await
        }

        async fn copy(&self, from: &Path, to: &Path) -> object_store::Result<()> {
            self.inner.copy(from, to).await
        }

        async fn copy_if_not_exists(&self, from: &Path, to: &Path) -> object_store::Result<()> {
            self.inner.copy_if_not_exists(from, to).await
        }
    }

    /// Calendar rows as `(start_time, day, week, month, weekday)` in 2018.
    fn calendar_batch(rows: &[(i64, i32, i32, i32, i32)]) -> RecordBatch {
        RecordBatch::try_new(
            OutputTable::Time.schema(),
            vec![
                Arc::new(TimestampMillisecondArray::from_iter_values(
                    rows.iter().map(|r| r.0),
                )),
                Arc::new(Int32Array::from_iter_values(rows.iter().map(|_| 0))),
                Arc::new(Int32Array::from_iter_values(rows.iter().map(|r| r.1))),
                Arc::new(Int32Array::from_iter_values(rows.iter().map(|r| r.2))),
                Arc::new(Int32Array::from_iter_values(rows.iter().map(|r| r.3))),
                Arc::new(Int32Array::from_iter_values(rows.iter().map(|_| 2018))),
                Arc::new(Int32Array::from_iter_values(rows.iter().map(|r| r.4))),
            ],
        )
        .unwrap()
    }

    fn songs(ctx: &SessionContext, rows: &[(i64, &str, &str, Option<i32>)]) -> DataFrame {
        let batch = RecordBatch::try_new(
            OutputTable::Songs.schema(),
            vec![
                Arc::new(Int64Array::from_iter_values(rows.iter().map(|r| r.0))),
                Arc::new(StringArray::from_iter_values(rows.iter().map(|r| r.1))),
                Arc::new(StringArray::from_iter_values(rows.iter().map(|r| r.2))),
                Arc::new(Int32Array::from_iter(rows.iter().map(|r| r.3))),
                Arc::new(Float64Array::from_iter_values(rows.iter().map(|_| 200.0))),
            ],
        )
        .unwrap();
        ctx.read_batch(batch).unwrap()
    }

    fn files_under(dir: &std::path::Path) -> Vec<String> {
        let mut found = Vec::new();
        let mut stack = vec![dir.to_path_buf()];
        while let Some(current) = stack.pop() {
            for entry in std::fs::read_dir(&current).unwrap() {
                let path = entry.unwrap().path();
                if path.is_dir() {
                    stack.push(path);
                } else {
                    found.push(path.strip_prefix(dir).unwrap().to_string_lossy().into_owned());
                }
            }
        }
        found.sort();
        found
    }

    #[tokio::test]
    async fn writes_hive_partitions_and_marker() {
        let dir = TempDir::new().unwrap();
        let ctx = SessionContext::new();
        let writer = PartitionedWriter::new(StorageLocation::local(dir.path()).unwrap(), "run1");

        let df = songs(
            &ctx,
            &[(0, "A", "AR1", Some(2018)), (1, "B", "AR1", Some(2018)), (2, "C", "AR2", None)],
        );
        let report = writer.write(OutputTable::Songs, df).await.unwrap();
        assert_eq!(report.rows, 3);
        assert_eq!(report.partitions, 2);

        let files = files_under(dir.path());
        assert!(files.contains(&"songs/_SUCCESS".to_string()));
        assert!(files.contains(
            &"songs/year=2018/publisher_id=AR1/part-00001-run1.parquet".to_string()
        ));
        assert!(files.contains(&format!(
            "songs/year={}/publisher_id=AR2/part-00000-run1.parquet",
            NULL_PARTITION_VALUE
        )));

        let marker = read_marker(writer.location(), OutputTable::Songs)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(marker.run_id, "run1");
        assert_eq!(marker.row_count, 3);
        assert_eq!(marker.partition_count, 2);
        assert_eq!(marker.partition_columns, vec!["year", "publisher_id"]);
    }

    #[tokio::test]
    async fn partition_columns_stay_in_the_data() {
        let dir = TempDir::new().unwrap();
        let ctx = SessionContext::new();
        let writer = PartitionedWriter::new(StorageLocation::local(dir.path()).unwrap(), "run1");
        writer
            .write(OutputTable::Songs, songs(&ctx, &[(0, "A", "AR1", Some(2018))]))
            .await
            .unwrap();

        let file = std::fs::File::open(
            dir.path()
                .join("songs/year=2018/publisher_id=AR1/part-00000-run1.parquet"),
        )
        .unwrap();
        let reader = ParquetRecordBatchReaderBuilder::try_new(file)
            .unwrap()
            .build()
            .unwrap();
        let batches: Vec<RecordBatch> = reader.map(|b| b.unwrap()).collect();
        assert_eq!(batches[0].schema().fields().len(), 5);
        assert!(batches[0].column_by_name("publisher_id").is_some());
    }

    #[tokio::test]
    async fn year_month_table_reads_back_unchanged() {
        let dir = TempDir::new().unwrap();
        let location = StorageLocation::local(dir.path()).unwrap();
        let input = calendar_batch(&[
            (1541030400000, 1, 44, 11, 4),
            (1541116800000, 2, 44, 11, 5),
            (1543622400000, 1, 48, 12, 6),
        ]);

        let ctx = SessionContext::new();
        let report = PartitionedWriter::new(location.clone(), "run1")
            .write(OutputTable::Time, ctx.read_batch(input.clone()).unwrap())
            .await
            .unwrap();
        assert_eq!(report.partitions, 2);
        assert!(dir.path().join("time/year=2018/month=11").is_dir());
        assert!(dir.path().join("time/year=2018/month=12").is_dir());

        let ctx = SessionContext::new();
        ParquetTableRegistry::new(location)
            .register_table(&ctx, OutputTable::Time)
            .await
            .unwrap();
        let batches = ctx
            .table("time")
            .await
            .unwrap()
            .sort(vec![col("start_time").sort(true, false)])
            .unwrap()
            .collect()
            .await
            .unwrap();
        let read = concat_batches(&OutputTable::Time.schema(), &batches).unwrap();

        assert_eq!(read.num_rows(), input.num_rows());
        for (index, field) in input.schema().fields().iter().enumerate() {
            assert_eq!(
                read.column(index).as_ref(),
                input.column(index).as_ref(),
                "column {} differs",
                field.name()
            );
        }
    }

    #[tokio::test]
    async fn failed_part_upload_rolls_back_the_table() {
        let url = Url::parse("memory:///lake/").unwrap();
        let store = Arc::new(FailingPuts::new(1));
        let location = StorageLocation::from_parts(url, store.clone()).unwrap();
        let input = calendar_batch(&[
            (1541030400000, 1, 44, 11, 4),
            (1543622400000, 1, 48, 12, 6),
        ]);

        let ctx = SessionContext::new();
        let err = PartitionedWriter::new(location.clone(), "run1")
            .write(OutputTable::Time, ctx.read_batch(input).unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Write { ref table, .. } if table == "time"));

        let left: Vec<ObjectMeta> = store
            .list(Some(&location.child("time")))
            .try_collect()
            .await
            .unwrap();
        assert!(left.is_empty(), "parts left behind: {:?}", left);
        assert!(read_marker(&location, OutputTable::Time).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rewrite_replaces_previous_run() {
        let dir = TempDir::new().unwrap();
        let ctx = SessionContext::new();
        let location = StorageLocation::local(dir.path()).unwrap();

        PartitionedWriter::new(location.clone(), "first")
            .write(OutputTable::Songs, songs(&ctx, &[(0, "A", "AR1", Some(2017))]))
            .await
            .unwrap();
        PartitionedWriter::new(location.clone(), "second")
            .write(OutputTable::Songs, songs(&ctx, &[(0, "B", "AR2", Some(2018))]))
            .await
            .unwrap();

        let parquet: Vec<String> = files_under(dir.path())
            .into_iter()
            .filter(|f| f.ends_with(".parquet"))
            .collect();
        assert_eq!(
            parquet,
            vec!["songs/year=2018/publisher_id=AR2/part-00000-second.parquet"]
        );
        let marker = read_marker(&location, OutputTable::Songs).await.unwrap().unwrap();
        assert_eq!(marker.run_id, "second");
    }

    #[tokio::test]
    async fn empty_table_still_commits_a_readable_file() {
        let dir = TempDir::new().unwrap();
        let ctx = SessionContext::new();
        let writer = PartitionedWriter::new(StorageLocation::local(dir.path()).unwrap(), "run1");

        let report = writer
            .write(OutputTable::Songs, songs(&ctx, &[]))
            .await
            .unwrap();
        assert_eq!(report.rows, 0);
        assert_eq!(
            files_under(dir.path()),
            vec!["songs/_SUCCESS", "songs/part-00000-run1.parquet"]
        );
    }

    #[tokio::test]
    async fn mismatched_columns_are_rejected_without_marker() {
        let dir = TempDir::new().unwrap();
        let ctx = SessionContext::new();
        let writer = PartitionedWriter::new(StorageLocation::local(dir.path()).unwrap(), "run1");

        let df = songs(&ctx, &[(0, "A", "AR1", Some(2018))])
            .select_columns(&["item_id", "title"])
            .unwrap();
        let err = writer.write(OutputTable::Songs, df).await.unwrap_err();
        assert!(matches!(err, Error::SchemaValidation(_)));
        let marker = read_marker(writer.location(), OutputTable::Songs).await.unwrap();
        assert!(marker.is_none());
    }

    #[tokio::test]
    async fn missing_marker_reads_as_none() {
        let dir = TempDir::new().unwrap();
        let location = StorageLocation::local(dir.path()).unwrap();
        let marker = read_marker(&location, OutputTable::Users).await.unwrap();
        assert!(marker.is_none());
    }
}
