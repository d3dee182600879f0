//! Collaborator traits: the item source and the LLM client.
//!
//! The workflow engine drives two external systems it deliberately does not
//! implement: the reference-management API (items, collections, notes) and
//! the LLM analysis backend. Both are consumed through trait objects and
//! injected explicitly when services are constructed, so tests and embedders
//! can swap in their own implementations without any global state.
//!
//! ```text
//! ┌───────────────┐       ┌──────────────────┐
//! │ GlobalScanner │──────▶│                  │
//! └───────────────┘       │ Arc<dyn          │     remote reference-
//! ┌───────────────┐       │   ItemSource>    │──▶  management API
//! │WorkflowService│──────▶│                  │
//! └──────┬────────┘       └──────────────────┘
//!        │                ┌──────────────────┐
//!        └───────────────▶│ dyn LlmClient    │──▶  analysis provider
//!                         └──────────────────┘
//! ```

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::error::AnalysisError;
use crate::models::{
    Annotation, AttachmentInfo, CandidateItem, CollectionInfo, ImageContent, ItemMetadata,
    MultimodalContent, NoteInfo,
};

/// The reference-management API, reduced to the operations the workflow
/// engine needs.
///
/// Implementations own transport concerns entirely: HTTP, authentication,
/// and per-request timeouts. Errors should carry enough of the upstream
/// message (status codes, "timeout", "connection") for the retry
/// classifier to recognize transient failures.
#[async_trait]
pub trait ItemSource: Send + Sync {
    /// One page of a collection's items, in the API's pagination order.
    async fn collection_items(
        &self,
        collection_key: &str,
        limit: usize,
        start: usize,
    ) -> Result<Vec<CandidateItem>>;

    /// Items added within the last `days` days, most recent first.
    async fn recent_items(&self, days: u32, limit: Option<usize>) -> Result<Vec<CandidateItem>>;

    /// Bibliographic detail for one item.
    async fn item_metadata(&self, key: &str) -> Result<ItemMetadata>;

    /// Attachment children of an item.
    async fn attachments(&self, key: &str) -> Result<Vec<AttachmentInfo>>;

    /// Extracted fulltext for an item, when the library has it.
    async fn fulltext(&self, key: &str) -> Result<Option<String>>;

    /// Notes attached to an item.
    async fn notes(&self, key: &str) -> Result<Vec<NoteInfo>>;

    /// Reader annotations across an item's attachments.
    async fn annotations(&self, key: &str) -> Result<Vec<Annotation>>;

    /// Images and tables extracted from an item's PDF, when available.
    async fn multimodal_content(&self, key: &str) -> Result<Option<MultimodalContent>>;

    /// Create a note under `item_key` and return the new note's key.
    async fn create_note(&self, item_key: &str, content: &str, tags: &[String]) -> Result<String>;

    /// Delete a note by key.
    async fn delete_note(&self, note_key: &str) -> Result<()>;

    /// Add an item to a collection.
    async fn add_to_collection(&self, item_key: &str, collection_key: &str) -> Result<()>;

    /// Remove an item from a collection.
    async fn remove_from_collection(&self, item_key: &str, collection_key: &str) -> Result<()>;

    /// Keys of every collection the item currently belongs to.
    async fn item_collections(&self, item_key: &str) -> Result<Vec<String>>;

    /// All collections, sorted by name ascending.
    async fn list_collections(&self) -> Result<Vec<CollectionInfo>>;
}

/// Everything the LLM needs to analyze one item.
#[derive(Debug, Clone, Default)]
pub struct AnalysisRequest {
    pub title: String,
    pub authors: Vec<String>,
    pub journal: Option<String>,
    pub date: Option<String>,
    pub doi: Option<String>,
    pub fulltext: String,
    /// Pre-formatted annotation digest, empty when annotations were not
    /// requested.
    pub annotations: String,
    pub template: Option<String>,
    /// Extracted figures, for providers that consume images.
    pub images: Vec<ImageContent>,
}

/// An analysis backend.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Display name used to tag generated notes (e.g. `"claude"`).
    fn provider_name(&self) -> &str;

    /// Model identifier, when the provider exposes one.
    fn model_name(&self) -> Option<&str> {
        None
    }

    /// Whether the provider can consume images. Drives the scanner's
    /// deferred multimodal fetch.
    fn supports_images(&self) -> bool {
        false
    }

    /// Produce a markdown analysis of the item. An empty return is a
    /// contract violation and is recorded as a failure by the caller.
    async fn analyze(&self, request: &AnalysisRequest) -> Result<String>;
}

/// Constructs [`LlmClient`]s on demand.
///
/// Construction is where credentials and provider support are checked, so
/// it is fallible with [`AnalysisError::ClientInit`]; the orchestrator
/// aborts the whole run on that error before touching any checkpoint.
pub trait LlmClientFactory: Send + Sync {
    fn create(
        &self,
        provider: Option<&str>,
        model: Option<&str>,
    ) -> Result<Arc<dyn LlmClient>, AnalysisError>;
}
