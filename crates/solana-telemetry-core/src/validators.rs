// Numan Thabit 2025
//! Validator identity to display metadata, swapped in whole on refresh.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{info, warn};

/// Metadata service failures.
#[derive(Debug, Error)]
pub enum DirectoryError {
    /// The request never produced a response.
    #[error("metadata request failed: {0}")]
    Transport(#[from] reqwest::Error),
    /// Non-success HTTP status.
    #[error("metadata service returned status {0}")]
    Status(u16),
}

/// Display metadata of one validator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorInfo {
    /// Identity pubkey.
    #[serde(alias = "account")]
    pub identity: String,
    /// Display name.
    #[serde(default)]
    pub name: Option<String>,
    /// Logo URL.
    #[serde(default, alias = "avatar_url", alias = "iconUrl")]
    pub logo: Option<String>,
    /// Free-form location.
    #[serde(default, alias = "data_center_key")]
    pub location: Option<String>,
}

/// Source of the full validator list.
#[async_trait]
pub trait MetadataSource: Send + Sync + 'static {
    /// Fetch every known validator.
    async fn fetch_all(&self) -> Result<Vec<ValidatorInfo>, DirectoryError>;
}

type Directory = HashMap<String, Arc<ValidatorInfo>>;

/// Lock-free directory; readers never wait on a refresh.
pub struct ValidatorDirectory {
    source: Arc<dyn MetadataSource>,
    entries: ArcSwap<Directory>,
    refreshed_at: parking_lot::Mutex<Option<Instant>>,
}

impl ValidatorDirectory {
    /// Empty directory over `source`.
    pub fn new(source: Arc<dyn MetadataSource>) -> Self {
        Self {
            source,
            entries: ArcSwap::from_pointee(Directory::new()),
            refreshed_at: parking_lot::Mutex::new(None),
        }
    }

    /// Replace the directory from the source; keeps the old one on failure.
    pub async fn refresh(&self) -> Result<usize, DirectoryError> {
        let validators = match self.source.fetch_all().await {
            Ok(validators) => validators,
            Err(err) => {
                warn!(error = %err, known = self.len(), "validator metadata refresh failed");
                return Err(err);
            }
        };
        let directory: Directory = validators
            .into_iter()
            .map(|info| (info.identity.clone(), Arc::new(info)))
            .collect();
        let count = directory.len();
        self.entries.store(Arc::new(directory));
        *self.refreshed_at.lock() = Some(Instant::now());
        info!(count, "validator metadata refreshed");
        Ok(count)
    }

    /// Metadata for `identity`.
    pub fn lookup(&self, identity: &str) -> Option<Arc<ValidatorInfo>> {
        self.entries.load().get(identity).cloned()
    }

    /// Known validators.
    pub fn len(&self) -> usize {
        self.entries.load().len()
    }

    /// True before the first successful refresh.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Time since the last successful refresh.
    pub fn age(&self) -> Option<Duration> {
        self.refreshed_at.lock().map(|at| at.elapsed())
    }
}

/// Metadata service returning a JSON array of validators.
pub struct HttpMetadataSource {
    client: reqwest::Client,
    url: String,
}

impl HttpMetadataSource {
    /// Fetch from `url`, bounded by `timeout`.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, DirectoryError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl MetadataSource for HttpMetadataSource {
    async fn fetch_all(&self) -> Result<Vec<ValidatorInfo>, DirectoryError> {
        let response = self.client.get(&self.url).send().await?;
        if !response.status().is_success() {
            return Err(DirectoryError::Status(response.status().as_u16()));
        }
        Ok(response.json().await?)
    }
}
