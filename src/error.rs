use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Watch error: {0}")]
    Watch(#[from] notify::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown capture strategy: {0}")]
    UnknownStrategy(String),

    #[error("Unknown worker: {0}")]
    UnknownWorker(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Driver error: {0}")]
    Driver(String),

    #[error("Delivery to '{destination}' failed after {attempts} attempts: {reason}")]
    Delivery {
        destination: String,
        attempts: u32,
        reason: String,
    },

    #[error("No home directory")]
    NoHomeDir,

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Task join error: {0}")]
    TaskJoin(String),
}

pub type Result<T> = std::result::Result<T, Error>;
