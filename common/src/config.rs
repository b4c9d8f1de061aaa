use crate::{Error, Result};
use config::Config;
use serde::Deserialize;
use tracing::debug;

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub storage: StorageSettings,
    #[serde(default)]
    pub sources: SourceSettings,
    #[serde(default)]
    pub pipeline: PipelineSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageSettings {
    pub input_root: String,
    pub output_root: String,
    #[serde(default = "default_s3_region")]
    pub region: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub access_key: Option<String>,
    #[serde(default)]
    pub secret_key: Option<String>,
    #[serde(default)]
    pub allow_http: bool,
}

/// Shard globs, relative to `storage.input_root`.
#[derive(Debug, Deserialize, Clone)]
pub struct SourceSettings {
    #[serde(default = "default_song_data")]
    pub song_data: String,
    #[serde(default = "default_log_data")]
    pub log_data: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineSettings {
    #[serde(default = "default_play_page")]
    pub play_page: String,
    #[serde(default)]
    pub calendar_granularity: CalendarGranularity,
    #[serde(default)]
    pub join_mode: JoinMode,
    #[serde(default = "default_read_concurrency")]
    pub read_concurrency: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingSettings {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

/// Resolution that event timestamps are truncated to before calendar fields
/// are derived.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CalendarGranularity {
    #[default]
    Day,
    Hour,
    Millisecond,
}

/// How play events without a catalog match are treated by the fact join.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum JoinMode {
    /// Keep the event, leaving item and publisher ids null.
    #[default]
    Left,
    /// Drop the event.
    Inner,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            song_data: default_song_data(),
            log_data: default_log_data(),
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            play_page: default_play_page(),
            calendar_granularity: CalendarGranularity::default(),
            join_mode: JoinMode::default(),
            read_concurrency: default_read_concurrency(),
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_s3_region() -> String {
    "us-west-2".to_string()
}

fn default_song_data() -> String {
    "song_data/*/*/*/*.json".to_string()
}

fn default_log_data() -> String {
    "log_data/*/*/*.json".to_string()
}

fn default_play_page() -> String {
    "NextSong".to_string()
}

fn default_read_concurrency() -> usize {
    16
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Settings {
    /// Layers the optional config file, `APP__*` environment variables and
    /// explicit `(key, value)` overrides, in that order.
    pub fn load(path: Option<&str>, overrides: &[(&str, String)]) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }

        builder = builder.add_source(config::Environment::with_prefix("APP").separator("__"));

        for (key, value) in overrides {
            builder = builder.set_override(*key, value.clone())?;
        }

        let config = builder.build()?;
        let settings: Settings = config.try_deserialize()?;

        debug!(
            input_root = %settings.storage.input_root,
            output_root = %settings.storage.output_root,
            "Loaded pipeline settings"
        );

        settings.validate()?;
        Ok(settings)
    }

    /// Settings for two roots with every other option at its default.
    pub fn with_roots(input_root: &str, output_root: &str) -> Self {
        Self {
            storage: StorageSettings {
                input_root: input_root.to_string(),
                output_root: output_root.to_string(),
                region: default_s3_region(),
                endpoint: None,
                access_key: None,
                secret_key: None,
                allow_http: false,
            },
            sources: SourceSettings::default(),
            pipeline: PipelineSettings::default(),
            logging: LoggingSettings::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.storage.input_root.trim().is_empty() {
            return Err(Error::Config("storage.input_root must not be empty".into()));
        }
        if self.storage.output_root.trim().is_empty() {
            return Err(Error::Config("storage.output_root must not be empty".into()));
        }
        if self.storage.access_key.is_some() != self.storage.secret_key.is_some() {
            return Err(Error::Config(
                "storage.access_key and storage.secret_key must be set together".into(),
            ));
        }
        if self.pipeline.play_page.is_empty() {
            return Err(Error::Config("pipeline.play_page must not be empty".into()));
        }
        if self.pipeline.read_concurrency == 0 {
            return Err(Error::Config(
                "pipeline.read_concurrency must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
