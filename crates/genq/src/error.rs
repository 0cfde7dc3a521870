use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),

    #[error("Credential error: {0}")]
    Secret(#[from] crate::secrets::SecretError),

    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: String },

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("No generation provider has usable credentials")]
    NoConfiguredProvider,

    #[error("Content store error: {0}")]
    ContentStore(#[from] crate::content::ContentStoreError),
}

impl QueueError {
    pub(crate) fn job_not_found(id: &str) -> Self {
        Self::NotFound {
            entity: "Job",
            id: id.to_string(),
        }
    }

    pub(crate) fn batch_not_found(id: &str) -> Self {
        Self::NotFound {
            entity: "Batch",
            id: id.to_string(),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },

    #[error("Schema validation failed: {errors}")]
    SchemaValidation { errors: String },

    #[error("Invalid provider '{id}': {reason}")]
    InvalidProvider { id: String, reason: String },
}

pub type Result<T> = std::result::Result<T, QueueError>;
