use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use lazy_static::lazy_static;
use std::sync::Arc;

/// Semantic type of a raw field, independent of how the source encodes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SemanticType {
    String,
    Double,
    Integer,
    /// Milliseconds since the Unix epoch, UTC.
    Timestamp,
}

impl SemanticType {
    pub fn data_type(&self) -> DataType {
        match self {
            SemanticType::String => DataType::Utf8,
            SemanticType::Double => DataType::Float64,
            SemanticType::Integer => DataType::Int32,
            SemanticType::Timestamp => DataType::Timestamp(TimeUnit::Millisecond, None),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub semantic_type: SemanticType,
    pub nullable: bool,
}

const fn field(name: &'static str, semantic_type: SemanticType, nullable: bool) -> FieldSpec {
    FieldSpec {
        name,
        semantic_type,
        nullable,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordType {
    /// One catalog entry from `song_data`.
    Catalog,
    /// One listen/page-view event from `log_data`.
    Event,
}

impl RecordType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordType::Catalog => "catalog",
            RecordType::Event => "event",
        }
    }
}

const CATALOG_FIELDS: &[FieldSpec] = &[
    field("artist_id", SemanticType::String, false),
    field("artist_latitude", SemanticType::Double, true),
    field("artist_location", SemanticType::String, true),
    field("artist_longitude", SemanticType::Double, true),
    field("artist_name", SemanticType::String, false),
    field("duration", SemanticType::Double, false),
    field("num_songs", SemanticType::Integer, true),
    field("song_id", SemanticType::String, true),
    field("title", SemanticType::String, false),
    field("year", SemanticType::Integer, true),
];

const EVENT_FIELDS: &[FieldSpec] = &[
    field("artist", SemanticType::String, true),
    field("auth", SemanticType::String, true),
    field("firstName", SemanticType::String, true),
    field("gender", SemanticType::String, true),
    field("itemInSession", SemanticType::Integer, true),
    field("lastName", SemanticType::String, true),
    field("length", SemanticType::Double, true),
    field("level", SemanticType::String, true),
    field("location", SemanticType::String, true),
    field("method", SemanticType::String, true),
    field("page", SemanticType::String, false),
    field("registration", SemanticType::Double, true),
    field("sessionId", SemanticType::Integer, true),
    field("song", SemanticType::String, true),
    field("status", SemanticType::Integer, true),
    field("ts", SemanticType::Timestamp, false),
    field("userAgent", SemanticType::String, true),
    field("userId", SemanticType::Integer, true),
];

/// Ordered field contract for a raw record type.
pub fn schema_for(record_type: RecordType) -> &'static [FieldSpec] {
    match record_type {
        RecordType::Catalog => CATALOG_FIELDS,
        RecordType::Event => EVENT_FIELDS,
    }
}

pub fn arrow_schema_for(record_type: RecordType) -> SchemaRef {
    match record_type {
        RecordType::Catalog => RAW_CATALOG_SCHEMA.clone(),
        RecordType::Event => RAW_EVENT_SCHEMA.clone(),
    }
}

fn build_arrow_schema(fields: &[FieldSpec]) -> Schema {
    Schema::new(
        fields
            .iter()
            .map(|f| Field::new(f.name, f.semantic_type.data_type(), f.nullable))
            .collect::<Vec<_>>(),
    )
}

/// Output tables of the star schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputTable {
    Songs,
    Artists,
    Users,
    Time,
    Songplays,
}

impl OutputTable {
    pub const ALL: [OutputTable; 5] = [
        OutputTable::Songs,
        OutputTable::Artists,
        OutputTable::Users,
        OutputTable::Time,
        OutputTable::Songplays,
    ];

    /// Directory name under the output root.
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputTable::Songs => "songs",
            OutputTable::Artists => "artists",
            OutputTable::Users => "users",
            OutputTable::Time => "time",
            OutputTable::Songplays => "songplays",
        }
    }

    pub fn partition_columns(&self) -> &'static [&'static str] {
        match self {
            OutputTable::Songs => &["year", "publisher_id"],
            OutputTable::Artists | OutputTable::Users => &[],
            OutputTable::Time | OutputTable::Songplays => &["year", "month"],
        }
    }

    pub fn schema(&self) -> SchemaRef {
        match self {
            OutputTable::Songs => SONGS_SCHEMA.clone(),
            OutputTable::Artists => ARTISTS_SCHEMA.clone(),
            OutputTable::Users => USERS_SCHEMA.clone(),
            OutputTable::Time => TIME_SCHEMA.clone(),
            OutputTable::Songplays => SONGPLAYS_SCHEMA.clone(),
        }
    }
}

fn start_time_type() -> DataType {
    DataType::Timestamp(TimeUnit::Millisecond, None)
}

pub fn songs_schema() -> Schema {
    Schema::new(vec![
        Field::new("item_id", DataType::Int64, false),
        Field::new("title", DataType::Utf8, false),
        Field::new("publisher_id", DataType::Utf8, false),
        Field::new("year", DataType::Int32, true),
        Field::new("duration", DataType::Float64, false),
    ])
}

pub fn artists_schema() -> Schema {
    Schema::new(vec![
        Field::new("publisher_id", DataType::Utf8, false),
        Field::new("name", DataType::Utf8, false),
        Field::new("location", DataType::Utf8, true),
        Field::new("latitude", DataType::Float64, true),
        Field::new("longitude", DataType::Float64, true),
    ])
}

pub fn users_schema() -> Schema {
    Schema::new(vec![
        Field::new("actor_id", DataType::Int32, false),
        Field::new("first_name", DataType::Utf8, true),
        Field::new("last_name", DataType::Utf8, true),
        Field::new("gender", DataType::Utf8, true),
        Field::new("level", DataType::Utf8, true),
    ])
}

pub fn time_schema() -> Schema {
    Schema::new(vec![
        Field::new("start_time", start_time_type(), false),
        Field::new("hour", DataType::Int32, false),
        Field::new("day", DataType::Int32, false),
        Field::new("week", DataType::Int32, false),
        Field::new("month", DataType::Int32, false),
        Field::new("year", DataType::Int32, false),
        Field::new("weekday", DataType::Int32, false),
    ])
}

pub fn songplays_schema() -> Schema {
    Schema::new(vec![
        Field::new("event_id", DataType::Int64, false),
        Field::new("start_time", start_time_type(), false),
        Field::new("actor_id", DataType::Int32, false),
        Field::new("level", DataType::Utf8, true),
        Field::new("item_id", DataType::Int64, true),
        Field::new("publisher_id", DataType::Utf8, true),
        Field::new("session_id", DataType::Int32, true),
        Field::new("location", DataType::Utf8, true),
        Field::new("user_agent", DataType::Utf8, true),
        Field::new("year", DataType::Int32, false),
        Field::new("month", DataType::Int32, false),
    ])
}

// Lazy-loaded static schemas
lazy_static! {
    static ref RAW_CATALOG_SCHEMA: SchemaRef = Arc::new(build_arrow_schema(CATALOG_FIELDS));
    static ref RAW_EVENT_SCHEMA: SchemaRef = Arc::new(build_arrow_schema(EVENT_FIELDS));
    static ref SONGS_SCHEMA: SchemaRef = Arc::new(songs_schema());
    static ref ARTISTS_SCHEMA: SchemaRef = Arc::new(artists_schema());
    static ref USERS_SCHEMA: SchemaRef = Arc::new(users_schema());
    static ref TIME_SCHEMA: SchemaRef = Arc::new(time_schema());
    static ref SONGPLAYS_SCHEMA: SchemaRef = Arc::new(songplays_schema());
}
