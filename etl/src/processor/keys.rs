use arrow::array::{ArrayRef, Int64Array, RecordBatch};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use common::Result;
use dashmap::DashMap;
use datafusion::datasource::MemTable;
use datafusion::prelude::{DataFrame, SessionContext};
use std::ops::Range;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

/// Per-run surrogate key service. Each named sequence hands out unique,
/// strictly increasing `i64` ranges; ranges are not guaranteed contiguous
/// across callers and nothing is stable across runs.
#[derive(Default)]
pub struct SurrogateKeys {
    sequences: DashMap<String, Arc<AtomicI64>>,
}

impl SurrogateKeys {
    pub fn new() -> Self {
        Self::default()
    }

    fn sequence(&self, name: &str) -> Arc<AtomicI64> {
        self.sequences
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(AtomicI64::new(0)))
            .clone()
    }

    pub fn reserve(&self, name: &str, count: usize) -> Range<i64> {
        let count = count as i64;
        let start = self.sequence(name).fetch_add(count, Ordering::SeqCst);
        start..start + count
    }

    /// Prepends a non-null `column` of keys from `sequence` to every row of
    /// `df`. Partitions keep their layout; each batch gets its own range.
    pub async fn assign(
        &self,
        ctx: &SessionContext,
        df: DataFrame,
        sequence: &str,
        column: &str,
    ) -> Result<DataFrame> {
        let input_schema: Schema = df.schema().as_arrow().clone();
        let schema = keyed_schema(&input_schema, column);
        let partitions = df.collect_partitioned().await?;

        let mut keyed = Vec::with_capacity(partitions.len());
        for batches in partitions {
            let mut keyed_batches = Vec::with_capacity(batches.len());
            for batch in batches {
                keyed_batches.push(self.key_batch(&schema, &batch, sequence)?);
            }
            keyed.push(keyed_batches);
        }
        if keyed.is_empty() {
            keyed.push(Vec::new());
        }

        let table = MemTable::try_new(schema, keyed)?;
        Ok(ctx.read_table(Arc::new(table))?)
    }

    fn key_batch(
        &self,
        schema: &SchemaRef,
        batch: &RecordBatch,
        sequence: &str,
    ) -> Result<RecordBatch> {
        let keys: ArrayRef = Arc::new(Int64Array::from_iter_values(
            self.reserve(sequence, batch.num_rows()),
        ));
        let mut columns = Vec::with_capacity(batch.num_columns() + 1);
        columns.push(keys);
        columns.extend(batch.columns().iter().cloned());
        Ok(RecordBatch::try_new(schema.clone(), columns)?)
    }
}

fn keyed_schema(input: &Schema, column: &str) -> SchemaRef {
    let mut fields = vec![Arc::new(Field::new(column, DataType::Int64, false))];
    fields.extend(input.fields().iter().cloned());
    Arc::new(Schema::new_with_metadata(fields, input.metadata().clone()))
}
