//! Content store contract and the artifact model handed to it.
//!
//! The queue only ever calls [`ContentStore::create_artifact`]; where and how
//! the artifact lands is up to the implementation.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod filesystem;
pub mod title;

pub use filesystem::FileContentStore;
pub use title::derive_title;

/// Metadata tag keys the queue attaches to every artifact.
pub mod tags {
    pub const ORIGIN: &str = "origin";
    pub const SOURCE_TOPIC: &str = "source_topic";
    pub const GENERATED_AT: &str = "generated_at";
    pub const PROVIDER: &str = "provider";
    pub const FALLBACK_FROM: &str = "fallback_from";
    pub const REFRESH_OF: &str = "refresh_of";
    pub const KIND: &str = "kind";

    /// Value of the `origin` tag.
    pub const ORIGIN_VALUE: &str = "genq";
}

pub const DEFAULT_PUBLISH_STATUS: &str = "draft";

/// Target settings for the artifact, taken from the job payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactSettings {
    /// `None` means the store's configured default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publish_status: Option<String>,
    /// Taxonomy name to terms, e.g. `{"category": ["rust"]}`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub taxonomy: BTreeMap<String, Vec<String>>,
    /// Free-form tags. The queue adds its own keys on top.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

/// A fully derived artifact ready to be persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewArtifact {
    pub title: String,
    pub body: String,
    pub settings: ArtifactSettings,
}

#[derive(Error, Debug)]
pub enum ContentStoreError {
    #[error("Failed to create directory '{path}': {source}")]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write artifact '{path}': {source}")]
    WriteFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("No free file name for '{0}'")]
    FileExists(PathBuf),

    #[error("Failed to serialize artifact metadata: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Content store rejected the artifact: {0}")]
    Rejected(String),
}

/// Durably creates artifacts. Returns the new artifact's identifier.
#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn create_artifact(&self, artifact: &NewArtifact) -> Result<String, ContentStoreError>;
}
