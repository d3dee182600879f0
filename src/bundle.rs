//! Bounded-concurrency bundle loading.
//!
//! A bundle aggregates everything analysis needs for one item: metadata,
//! fulltext, annotations, notes, and optionally multimodal content. Within a
//! chunk the fetches run concurrently under a cap so the remote API's limits
//! are respected, and the result vector always lines up with the input keys.
//! One key failing to fetch never fails the others; the caller sees a `None`
//! slot and records it as a per-item failure.

use std::sync::Arc;

use anyhow::Result;
use futures::stream::{self, StreamExt};
use tracing::{debug, warn};

use crate::config::{Config, RetryConfig};
use crate::models::ItemBundle;
use crate::retry::retry_with_policy;
use crate::source::ItemSource;

/// Which bundle parts to fetch.
#[derive(Debug, Clone, Copy)]
pub struct BundleRequest {
    pub fulltext: bool,
    pub annotations: bool,
    pub notes: bool,
    pub multimodal: bool,
}

impl Default for BundleRequest {
    fn default() -> Self {
        Self {
            fulltext: true,
            annotations: true,
            notes: true,
            multimodal: false,
        }
    }
}

/// Fetches many item bundles concurrently, preserving input order.
pub struct BundleLoader {
    source: Arc<dyn ItemSource>,
    max_concurrency: usize,
    retry: RetryConfig,
}

impl BundleLoader {
    pub fn new(source: Arc<dyn ItemSource>, config: &Config) -> Self {
        Self {
            source,
            max_concurrency: config.bundle.max_concurrency.max(1),
            retry: config.retry.clone(),
        }
    }

    /// Fetch bundles for `keys`, at most `max_concurrency` in flight.
    ///
    /// Returns one slot per input key, in input order. A `None` slot means
    /// that key could not be fetched after the retry budget; the failure is
    /// logged here and isolated from the rest of the chunk.
    pub async fn fetch_many(&self, keys: &[String], request: BundleRequest) -> Vec<Option<ItemBundle>> {
        debug!("fetching {} bundles ({} in flight)", keys.len(), self.max_concurrency);

        stream::iter(keys.iter().map(|key| async move {
            let described = format!("bundle fetch for {}", key);
            match retry_with_policy(&self.retry, &described, || self.fetch_one(key, request)).await
            {
                Ok(bundle) => Some(bundle),
                Err(err) => {
                    warn!("failed to fetch bundle for {}: {:#}", key, err);
                    None
                }
            }
        }))
        .buffered(self.max_concurrency)
        .collect()
        .await
    }

    async fn fetch_one(&self, key: &str, request: BundleRequest) -> Result<ItemBundle> {
        let metadata = self.source.item_metadata(key).await?;
        let fulltext = if request.fulltext {
            self.source.fulltext(key).await?
        } else {
            None
        };
        let annotations = if request.annotations {
            self.source.annotations(key).await?
        } else {
            Vec::new()
        };
        let notes = if request.notes {
            self.source.notes(key).await?
        } else {
            Vec::new()
        };
        let multimodal = if request.multimodal {
            self.source.multimodal_content(key).await?
        } else {
            None
        };

        Ok(ItemBundle {
            key: key.to_string(),
            metadata,
            fulltext,
            annotations,
            notes,
            multimodal,
        })
    }
}
