//! Core data models used throughout Reference Harness.
//!
//! These types represent the candidate items, per-item bundles, and analysis
//! outcomes that flow through the scanning and batch-analysis pipeline.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Lightweight projection of a library item, produced by the item source.
///
/// Both the remote API and any local cache map into this one type at the
/// boundary, so the scanner never probes attributes at runtime.
#[derive(Debug, Clone)]
pub struct CandidateItem {
    pub key: String,
    pub title: String,
    pub item_type: String,
    pub tags: Vec<String>,
    /// Key of the parent item, for attachment/note/annotation children.
    pub parent_key: Option<String>,
    /// Whether the item has at least one PDF attachment. Derived by the
    /// scanner from the item's attachment children; defaults to `false`
    /// until probed.
    pub has_pdf: bool,
}

impl CandidateItem {
    /// Whether this is a top-level (parent) item rather than an
    /// attachment, note, or annotation child.
    pub fn is_parent(&self) -> bool {
        self.parent_key.is_none()
            && !matches!(self.item_type.as_str(), "attachment" | "note" | "annotation")
    }
}

/// Bibliographic metadata for one item.
#[derive(Debug, Clone, Default)]
pub struct ItemMetadata {
    pub key: String,
    pub title: String,
    pub item_type: String,
    pub creators: Vec<String>,
    pub publication: Option<String>,
    pub date: Option<String>,
    pub doi: Option<String>,
    pub tags: Vec<String>,
}

/// An attachment child of an item.
#[derive(Debug, Clone)]
pub struct AttachmentInfo {
    pub key: String,
    pub content_type: String,
    pub filename: Option<String>,
}

impl AttachmentInfo {
    pub fn is_pdf(&self) -> bool {
        self.content_type == "application/pdf"
            || self
                .filename
                .as_deref()
                .is_some_and(|f| f.to_ascii_lowercase().ends_with(".pdf"))
    }
}

/// A note attached to an item.
#[derive(Debug, Clone)]
pub struct NoteInfo {
    pub key: String,
    pub content: String,
    pub tags: Vec<String>,
}

/// A reader annotation (highlight, underline, comment) on an attachment.
#[derive(Debug, Clone)]
pub struct Annotation {
    pub kind: String,
    pub text: Option<String>,
    pub comment: Option<String>,
    pub page: Option<String>,
}

/// An image extracted from an item's PDF, for multimodal providers.
#[derive(Debug, Clone)]
pub struct ImageContent {
    pub caption: Option<String>,
    pub media_type: String,
    /// Base64-encoded image bytes, passed through to the LLM client.
    pub data: String,
}

/// Extracted non-text content (figures, tables) for multimodal analysis.
#[derive(Debug, Clone, Default)]
pub struct MultimodalContent {
    pub images: Vec<ImageContent>,
    pub tables: Vec<String>,
}

impl MultimodalContent {
    /// Text representation of the multimodal payload: tables plus image
    /// captions. Empty when nothing textual was extracted.
    pub fn text(&self) -> String {
        let mut parts: Vec<&str> = self.tables.iter().map(|t| t.as_str()).collect();
        parts.extend(self.images.iter().filter_map(|i| i.caption.as_deref()));
        parts.join("\n\n")
    }
}

/// Aggregated per-item payload fetched for analysis.
#[derive(Debug, Clone)]
pub struct ItemBundle {
    pub key: String,
    pub metadata: ItemMetadata,
    pub fulltext: Option<String>,
    pub annotations: Vec<Annotation>,
    pub notes: Vec<NoteInfo>,
    pub multimodal: Option<MultimodalContent>,
}

impl ItemBundle {
    /// The text the analysis will run over: the fulltext when present,
    /// otherwise the textual part of the multimodal payload. `None` when
    /// the item has no extractable content at all.
    pub fn extractable_text(&self) -> Option<String> {
        if let Some(text) = &self.fulltext {
            if !text.trim().is_empty() {
                return Some(text.clone());
            }
        }
        let mm = self.multimodal.as_ref().map(MultimodalContent::text)?;
        if mm.trim().is_empty() {
            None
        } else {
            Some(mm)
        }
    }

    /// Whether any multimodal image is present (multimodal-capable
    /// providers receive these alongside the text).
    pub fn has_images(&self) -> bool {
        self.multimodal
            .as_ref()
            .is_some_and(|m| !m.images.is_empty())
    }
}

/// A collection in the library, as listed by the item source.
#[derive(Debug, Clone)]
pub struct CollectionInfo {
    pub key: String,
    pub name: String,
}

// ============ Outcomes and reports ============

/// Terminal outcome of analyzing one item.
///
/// A deliberate skip (note already exists, nothing to analyze) is a distinct
/// variant from a genuine failure, so callers never have to reverse-engineer
/// booleans plus optional strings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ItemOutcome {
    Success { note_key: Option<String> },
    Skipped { reason: String },
    Failed { error: String },
}

impl ItemOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ItemOutcome::Success { .. })
    }
    pub fn is_skipped(&self) -> bool {
        matches!(self, ItemOutcome::Skipped { .. })
    }
    pub fn is_failed(&self) -> bool {
        matches!(self, ItemOutcome::Failed { .. })
    }
}

/// Outcome of analyzing one item, with identification and timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub item_key: String,
    pub title: String,
    #[serde(flatten)]
    pub outcome: ItemOutcome,
    pub processing_time: Duration,
}

/// Aggregate counters for one scan or batch run.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScanMetrics {
    pub scanned: usize,
    pub candidates: usize,
    pub processed: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl ScanMetrics {
    pub fn record(&mut self, outcome: &ItemOutcome) {
        match outcome {
            ItemOutcome::Success { .. } => self.processed += 1,
            ItemOutcome::Skipped { .. } => self.skipped += 1,
            ItemOutcome::Failed { .. } => self.failed += 1,
        }
    }
}

/// Terminal status of a scan run. Closed so an unhandled status is a
/// compile error, not a runtime surprise.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    Success,
    ValidationError,
    Error,
}

/// Result of `GlobalScanner::scan_and_process`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanReport {
    pub status: ScanStatus,
    pub metrics: ScanMetrics,
    pub message: String,
    /// Titles of discovered candidates; populated on dry runs, where
    /// discovery is the only output.
    pub candidate_titles: Vec<String>,
}

impl ScanReport {
    pub fn validation_error(message: impl Into<String>) -> Self {
        Self {
            status: ScanStatus::ValidationError,
            metrics: ScanMetrics::default(),
            message: message.into(),
            candidate_titles: Vec::new(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: ScanStatus::Error,
            metrics: ScanMetrics::default(),
            message: message.into(),
            candidate_titles: Vec::new(),
        }
    }
}

/// Where a batch run draws its item universe from.
#[derive(Debug, Clone)]
pub enum BatchSource {
    /// A collection addressed by key.
    Collection { key: String },
    /// A collection addressed by display name, resolved against the
    /// sorted collection listing.
    CollectionName { name: String },
    /// Recently added items.
    Recent { days: u32 },
}

impl BatchSource {
    /// `(source_type, source_identifier)` pair recorded in the checkpoint.
    pub fn descriptor(&self) -> (String, String) {
        match self {
            BatchSource::Collection { key } => ("collection".into(), key.clone()),
            BatchSource::CollectionName { name } => ("collection_name".into(), name.clone()),
            BatchSource::Recent { days } => ("recent".into(), days.to_string()),
        }
    }
}

/// Aggregate result of one `batch_analyze` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchReport {
    pub workflow_id: String,
    pub total_items: usize,
    /// Cumulative counts across the whole workflow, including items
    /// resolved by earlier resumed calls.
    pub processed: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Per-item results for the items handled in this call only.
    pub results: Vec<AnalysisResult>,
    pub status: crate::checkpoint::WorkflowStatus,
}
