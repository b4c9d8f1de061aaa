use crate::processor::calendar::{CalendarField, CalendarParts, truncate_epoch_millis};
use common::config::CalendarGranularity;
use datafusion::arrow::array::{Array, ArrayRef, Int32Array, TimestampMillisecondArray};
use datafusion::arrow::datatypes::{DataType, TimeUnit};
use datafusion::common::DataFusionError;
use datafusion::error::Result;
use datafusion::execution::FunctionRegistry;
use datafusion::execution::context::SessionContext;
use datafusion::logical_expr::{ColumnarValue, Expr, ScalarUDF, Volatility, create_udf};
use std::sync::Arc;

pub const START_TIME_UDF: &str = "calendar_start_time";

pub fn field_udf_name(field: CalendarField) -> String {
    format!("calendar_{}", field.column())
}

/// Registers the calendar UDFs with the SessionContext. All of them take an
/// epoch-millisecond timestamp and honour the same truncation.
pub fn register_udfs(ctx: &SessionContext, granularity: CalendarGranularity) {
    ctx.register_udf(start_time_udf(granularity));
    for field in CalendarField::ALL {
        ctx.register_udf(calendar_field_udf(field, granularity));
    }
}

/// Applies the registered calendar UDF `name` to `arg`.
pub fn calendar_expr(ctx: &SessionContext, name: &str, arg: Expr) -> Result<Expr> {
    Ok(ctx.udf(name)?.call(vec![arg]))
}

fn timestamp_type() -> DataType {
    DataType::Timestamp(TimeUnit::Millisecond, None)
}

fn start_time_udf(granularity: CalendarGranularity) -> ScalarUDF {
    create_udf(
        START_TIME_UDF,
        vec![timestamp_type()],
        timestamp_type(),
        Volatility::Immutable,
        Arc::new(move |args: &[ColumnarValue]| truncate_timestamps(args, granularity)),
    )
}

fn calendar_field_udf(field: CalendarField, granularity: CalendarGranularity) -> ScalarUDF {
    create_udf(
        &field_udf_name(field),
        vec![timestamp_type()],
        DataType::Int32,
        Volatility::Immutable,
        Arc::new(move |args: &[ColumnarValue]| extract_field(args, field, granularity)),
    )
}

fn timestamp_arg(args: &[ColumnarValue]) -> Result<TimestampMillisecondArray> {
    let arrays = ColumnarValue::values_to_arrays(args)?;
    let array = arrays
        .first()
        .ok_or_else(|| DataFusionError::Internal("Expected one timestamp argument".to_string()))?;
    array
        .as_any()
        .downcast_ref::<TimestampMillisecondArray>()
        .cloned()
        .ok_or_else(|| {
            DataFusionError::Internal("Expected millisecond timestamp array".to_string())
        })
}

/// Converts epoch milliseconds to the truncated start time.
fn truncate_timestamps(
    args: &[ColumnarValue],
    granularity: CalendarGranularity,
) -> Result<ColumnarValue> {
    let input = timestamp_arg(args)?;
    let result: TimestampMillisecondArray = input
        .iter()
        .map(|ts| {
            ts.and_then(|ts| truncate_epoch_millis(ts, granularity))
                .map(|t| t.timestamp_millis())
        })
        .collect();
    Ok(ColumnarValue::Array(Arc::new(result) as ArrayRef))
}

fn extract_field(
    args: &[ColumnarValue],
    field: CalendarField,
    granularity: CalendarGranularity,
) -> Result<ColumnarValue> {
    let input = timestamp_arg(args)?;
    let result: Int32Array = input
        .iter()
        .map(|ts| {
            ts.and_then(|ts| CalendarParts::from_epoch_millis(ts, granularity))
                .map(|parts| field.extract(&parts))
        })
        .collect();
    Ok(ColumnarValue::Array(Arc::new(result) as ArrayRef))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input() -> ColumnarValue {
        ColumnarValue::Array(Arc::new(TimestampMillisecondArray::from(vec![
            Some(1541105830796),
            None,
        ])))
    }

    #[test]
    fn test_truncate_timestamps() {
        let result = truncate_timestamps(&[input()], CalendarGranularity::Day).unwrap();

        if let ColumnarValue::Array(array) = result {
            let ts_array = array.as_any().downcast_ref::<TimestampMillisecondArray>().unwrap();
            assert_eq!(ts_array.value(0), 1541030400000);
            assert!(ts_array.is_null(1));
        } else {
            panic!("Expected Array result");
        }
    }

    #[test]
    fn test_extract_weekday() {
        let result =
            extract_field(&[input()], CalendarField::Weekday, CalendarGranularity::Hour).unwrap();

        if let ColumnarValue::Array(array) = result {
            let int_array = array.as_any().downcast_ref::<Int32Array>().unwrap();
            assert_eq!(int_array.value(0), 4);
            assert!(int_array.is_null(1));
        } else {
            panic!("Expected Array result");
        }
    }

    #[test]
    fn test_registered_names() {
        let ctx = SessionContext::new();
        register_udfs(&ctx, CalendarGranularity::Day);
        assert!(ctx.udf(START_TIME_UDF).is_ok());
        for field in CalendarField::ALL {
            assert!(ctx.udf(&field_udf_name(field)).is_ok());
        }
    }
}
