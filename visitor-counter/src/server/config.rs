use {
    std::{net::SocketAddr, path::PathBuf, time::Duration},
    tokio::{fs, io},
    serde::Deserialize,
    thiserror::Error,
    tracing::Level,
    crate::{
        counter::{CounterService, MissingRecordPolicy, DEFAULT_MAX_ATTEMPTS},
        kv::{BoxedStorage, FsStorage, FsStorageInitError, NamespacedStorage, SqliteStorage, SqliteStorageConnectionError},
    },
};

#[derive(Deserialize, Debug, Clone)]
pub struct ServerConfig {
    #[serde(skip_deserializing)]
    pub config_path: Option<PathBuf>,

    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    pub metrics_port: Option<u16>,

    #[serde(default)]
    pub log_level: LogLevel,

    #[serde(default = "default_invocation_timeout_millis")]
    pub invocation_timeout_millis: u64,

    #[serde(default)]
    pub counter: CounterConfig,

    pub storage: StorageConfig,
}

#[derive(Deserialize, Debug, Clone, Copy, Default, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

#[derive(Deserialize, Debug, Clone, Eq, PartialEq)]
pub struct CounterConfig {
    /// Becomes the key namespace of the record, `<table>/<key>`.
    #[serde(default = "default_table")]
    pub table: String,

    /// Value of the record's `visitor_id` attribute.
    #[serde(default = "default_key")]
    pub key: String,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default)]
    pub missing_record: MissingRecordPolicy,

    #[serde(default = "default_store_timeout_millis")]
    pub store_timeout_millis: u64,
}

impl Default for CounterConfig {
    fn default() -> Self {
        Self {
            table: default_table(),
            key: default_key(),
            max_attempts: default_max_attempts(),
            missing_record: MissingRecordPolicy::default(),
            store_timeout_millis: default_store_timeout_millis(),
        }
    }
}

impl CounterConfig {
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_millis)
    }
}

#[derive(Deserialize, Debug, Clone, Eq, PartialEq)]
#[serde(tag = "type")]
pub enum StorageConfig {
    #[serde(rename = "sqlite")]
    Sqlite {
        path: PathBuf,
    },
    #[serde(rename = "sqlite_in_memory")]
    SqliteInMemory,
    #[serde(rename = "fs")]
    Fs {
        path: PathBuf,
    },
}

fn default_listen() -> SocketAddr { ([0, 0, 0, 0], 8080).into() }
fn default_invocation_timeout_millis() -> u64 { 10_000 }
fn default_table() -> String { "visitor_count2".to_owned() }
fn default_key() -> String { "visitor".to_owned() }
fn default_max_attempts() -> u32 { DEFAULT_MAX_ATTEMPTS }
fn default_store_timeout_millis() -> u64 { 5_000 }

#[derive(Error, Debug)]
pub enum ConfigLoadError {
    #[error("failed to read config file: {0:?}")]
    FailedToRead(io::Error),

    #[error("failed to parse config: {0}")]
    FailedToParse(serde_yml::Error),

    #[error("invalid config: {reason}")]
    Invalid { reason: String },
}

impl ServerConfig {
    pub async fn load(file_path: PathBuf) -> Result<Self, ConfigLoadError> {
        let config = fs::read_to_string(&file_path).await
            .map_err(ConfigLoadError::FailedToRead)?;
        let mut config = Self::from_yaml(&config)?;
        config.config_path = Some(file_path);
        Ok(config)
    }

    pub fn from_yaml(config: &str) -> Result<Self, ConfigLoadError> {
        let config: Self = serde_yml::from_str(config).map_err(ConfigLoadError::FailedToParse)?;
        config.validate()?;
        Ok(config)
    }

    pub fn invocation_timeout(&self) -> Duration {
        Duration::from_millis(self.invocation_timeout_millis)
    }

    fn validate(&self) -> Result<(), ConfigLoadError> {
        let invalid = |reason: &str| Err(ConfigLoadError::Invalid { reason: reason.to_owned() });

        if self.counter.max_attempts == 0 {
            return invalid("counter.max_attempts should be at least 1");
        }
        if self.counter.table.is_empty() {
            return invalid("counter.table should not be empty");
        }
        if self.counter.key.is_empty() {
            return invalid("counter.key should not be empty");
        }
        if self.invocation_timeout_millis == 0 {
            return invalid("invocation_timeout_millis should be greater than 0");
        }

        Ok(())
    }
}

#[derive(Error, Debug)]
pub enum StorageInitError {
    #[error("failed to open sqlite storage: {0}")]
    Sqlite(#[from] SqliteStorageConnectionError),

    #[error("failed to open filesystem storage: {0}")]
    Fs(#[from] FsStorageInitError),
}

/// Opens the backend and scopes it to the counter table.
pub fn storage_from_config(storage: &StorageConfig, counter: &CounterConfig) -> Result<BoxedStorage, StorageInitError> {
    let namespace = format!("{}/", counter.table);

    Ok(match storage {
        StorageConfig::Sqlite { path } => BoxedStorage::new(NamespacedStorage::new(
            namespace,
            SqliteStorage::new(path, counter.store_timeout())?,
        )),
        StorageConfig::SqliteInMemory => BoxedStorage::new(NamespacedStorage::new(namespace, SqliteStorage::in_memory()?)),
        StorageConfig::Fs { path } => BoxedStorage::new(NamespacedStorage::new(namespace, FsStorage::new(path.clone())?)),
    })
}

pub fn counter_from_config(storage: &StorageConfig, counter: &CounterConfig) -> Result<CounterService, StorageInitError> {
    Ok(CounterService::new(storage_from_config(storage, counter)?, counter.key.as_bytes())
        .with_max_attempts(counter.max_attempts)
        .with_missing_record_policy(counter.missing_record))
}
