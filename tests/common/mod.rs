#![allow(dead_code)]

//! In-memory collaborator fakes shared by the integration tests.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use async_trait::async_trait;

use reference_harness::config::Config;
use reference_harness::error::AnalysisError;
use reference_harness::models::{
    Annotation, AttachmentInfo, CandidateItem, CollectionInfo, ItemMetadata, MultimodalContent,
    NoteInfo,
};
use reference_harness::source::{AnalysisRequest, ItemSource, LlmClient, LlmClientFactory};
use reference_harness::workflow::WorkflowService;

#[derive(Debug)]
pub struct CreatedNote {
    pub item_key: String,
    pub content: String,
    pub tags: Vec<String>,
}

#[derive(Default)]
pub struct LibraryData {
    pub collections: Vec<CollectionInfo>,
    pub collection_items: HashMap<String, Vec<CandidateItem>>,
    pub recent: Vec<CandidateItem>,
    pub metadata: HashMap<String, ItemMetadata>,
    pub fulltext: HashMap<String, String>,
    pub attachments: HashMap<String, Vec<AttachmentInfo>>,
    pub notes: HashMap<String, Vec<NoteInfo>>,
    pub annotations: HashMap<String, Vec<Annotation>>,
    pub multimodal: HashMap<String, MultimodalContent>,
    pub memberships: HashMap<String, Vec<String>>,
    /// Keys whose fulltext fetch fails with a transient error.
    pub fail_fulltext: HashSet<String>,
    /// Collection keys whose item listing fails with a transient error.
    pub fail_collections: HashSet<String>,
    pub created_notes: Vec<CreatedNote>,
    pub deleted_notes: Vec<String>,
    note_seq: usize,
}

/// In-memory reference library implementing [`ItemSource`].
#[derive(Default)]
pub struct FakeLibrary {
    pub data: Mutex<LibraryData>,
    pub metadata_calls: AtomicUsize,
    pub fulltext_calls: AtomicUsize,
    pub multimodal_calls: AtomicUsize,
    pub note_probe_calls: AtomicUsize,
}

impl FakeLibrary {
    /// Register a collection (idempotent).
    pub fn add_collection(&self, key: &str, name: &str) {
        let mut data = self.data.lock().unwrap();
        if !data.collections.iter().any(|c| c.key == key) {
            data.collections.push(CollectionInfo {
                key: key.to_string(),
                name: name.to_string(),
            });
            data.collection_items.entry(key.to_string()).or_default();
        }
    }

    /// Seed a parent item with a PDF attachment and fulltext, the common
    /// eligible shape.
    pub fn seed_item(&self, collection: &str, key: &str, title: &str) {
        self.seed_item_with(collection, key, title, &[], true, Some("Fulltext body."));
    }

    pub fn seed_item_with(
        &self,
        collection: &str,
        key: &str,
        title: &str,
        tags: &[&str],
        has_pdf: bool,
        fulltext: Option<&str>,
    ) {
        let tags: Vec<String> = tags.iter().map(|t| t.to_string()).collect();
        let mut data = self.data.lock().unwrap();
        data.collection_items
            .entry(collection.to_string())
            .or_default()
            .push(CandidateItem {
                key: key.to_string(),
                title: title.to_string(),
                item_type: "journalArticle".to_string(),
                tags: tags.clone(),
                parent_key: None,
                has_pdf: false,
            });
        data.metadata.insert(
            key.to_string(),
            ItemMetadata {
                key: key.to_string(),
                title: title.to_string(),
                item_type: "journalArticle".to_string(),
                creators: vec!["Doe, Jane".to_string()],
                publication: Some("Journal of Tests".to_string()),
                date: Some("2024".to_string()),
                doi: None,
                tags,
            },
        );
        if has_pdf {
            data.attachments.insert(
                key.to_string(),
                vec![AttachmentInfo {
                    key: format!("{}-pdf", key),
                    content_type: "application/pdf".to_string(),
                    filename: Some(format!("{}.pdf", key)),
                }],
            );
        }
        if let Some(text) = fulltext {
            data.fulltext.insert(key.to_string(), text.to_string());
        }
        data.memberships
            .insert(key.to_string(), vec![collection.to_string()]);
    }

    /// Attach an existing analysis note to an item.
    pub fn seed_analysis_note(&self, key: &str, analysis_tag: &str) {
        let mut data = self.data.lock().unwrap();
        data.notes.entry(key.to_string()).or_default().push(NoteInfo {
            key: format!("{}-note", key),
            content: "<p>old analysis</p>".to_string(),
            tags: vec![analysis_tag.to_string()],
        });
    }

    pub fn created_note_count(&self) -> usize {
        self.data.lock().unwrap().created_notes.len()
    }

    pub fn memberships_of(&self, key: &str) -> Vec<String> {
        self.data
            .lock()
            .unwrap()
            .memberships
            .get(key)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl ItemSource for FakeLibrary {
    async fn collection_items(
        &self,
        collection_key: &str,
        limit: usize,
        start: usize,
    ) -> Result<Vec<CandidateItem>> {
        let data = self.data.lock().unwrap();
        if data.fail_collections.contains(collection_key) {
            bail!("HTTP 503 Service Unavailable");
        }
        let items = data
            .collection_items
            .get(collection_key)
            .cloned()
            .unwrap_or_default();
        Ok(items.into_iter().skip(start).take(limit).collect())
    }

    async fn recent_items(&self, _days: u32, limit: Option<usize>) -> Result<Vec<CandidateItem>> {
        let data = self.data.lock().unwrap();
        let mut items = data.recent.clone();
        if let Some(limit) = limit {
            items.truncate(limit);
        }
        Ok(items)
    }

    async fn item_metadata(&self, key: &str) -> Result<ItemMetadata> {
        self.metadata_calls.fetch_add(1, Ordering::SeqCst);
        let data = self.data.lock().unwrap();
        data.metadata
            .get(key)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("HTTP 404 Not Found: item {}", key))
    }

    async fn attachments(&self, key: &str) -> Result<Vec<AttachmentInfo>> {
        let data = self.data.lock().unwrap();
        Ok(data.attachments.get(key).cloned().unwrap_or_default())
    }

    async fn fulltext(&self, key: &str) -> Result<Option<String>> {
        self.fulltext_calls.fetch_add(1, Ordering::SeqCst);
        let data = self.data.lock().unwrap();
        if data.fail_fulltext.contains(key) {
            bail!("connection reset by peer while fetching fulltext");
        }
        Ok(data.fulltext.get(key).cloned())
    }

    async fn notes(&self, key: &str) -> Result<Vec<NoteInfo>> {
        self.note_probe_calls.fetch_add(1, Ordering::SeqCst);
        let data = self.data.lock().unwrap();
        Ok(data.notes.get(key).cloned().unwrap_or_default())
    }

    async fn annotations(&self, key: &str) -> Result<Vec<Annotation>> {
        let data = self.data.lock().unwrap();
        Ok(data.annotations.get(key).cloned().unwrap_or_default())
    }

    async fn multimodal_content(&self, key: &str) -> Result<Option<MultimodalContent>> {
        self.multimodal_calls.fetch_add(1, Ordering::SeqCst);
        let data = self.data.lock().unwrap();
        Ok(data.multimodal.get(key).cloned())
    }

    async fn create_note(&self, item_key: &str, content: &str, tags: &[String]) -> Result<String> {
        let mut data = self.data.lock().unwrap();
        data.note_seq += 1;
        let note_key = format!("N{}", data.note_seq);
        data.created_notes.push(CreatedNote {
            item_key: item_key.to_string(),
            content: content.to_string(),
            tags: tags.to_vec(),
        });
        data.notes
            .entry(item_key.to_string())
            .or_default()
            .push(NoteInfo {
                key: note_key.clone(),
                content: content.to_string(),
                tags: tags.to_vec(),
            });
        Ok(note_key)
    }

    async fn delete_note(&self, note_key: &str) -> Result<()> {
        let mut data = self.data.lock().unwrap();
        for notes in data.notes.values_mut() {
            notes.retain(|n| n.key != note_key);
        }
        data.deleted_notes.push(note_key.to_string());
        Ok(())
    }

    async fn add_to_collection(&self, item_key: &str, collection_key: &str) -> Result<()> {
        let mut data = self.data.lock().unwrap();
        let memberships = data.memberships.entry(item_key.to_string()).or_default();
        if !memberships.iter().any(|c| c == collection_key) {
            memberships.push(collection_key.to_string());
        }
        Ok(())
    }

    async fn remove_from_collection(&self, item_key: &str, collection_key: &str) -> Result<()> {
        let mut data = self.data.lock().unwrap();
        if let Some(memberships) = data.memberships.get_mut(item_key) {
            memberships.retain(|c| c != collection_key);
        }
        Ok(())
    }

    async fn item_collections(&self, item_key: &str) -> Result<Vec<String>> {
        let data = self.data.lock().unwrap();
        Ok(data.memberships.get(item_key).cloned().unwrap_or_default())
    }

    async fn list_collections(&self) -> Result<Vec<CollectionInfo>> {
        let data = self.data.lock().unwrap();
        let mut collections = data.collections.clone();
        collections.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(collections)
    }
}

/// Scripted LLM client counting its calls.
pub struct StubLlm {
    pub calls: AtomicUsize,
    pub response: Mutex<String>,
    pub supports_images: bool,
    pub fail_with: Mutex<Option<String>>,
}

impl Default for StubLlm {
    fn default() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            response: Mutex::new("## Summary\n\nA solid paper.".to_string()),
            supports_images: false,
            fail_with: Mutex::new(None),
        }
    }
}

impl StubLlm {
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn set_response(&self, response: &str) {
        *self.response.lock().unwrap() = response.to_string();
    }
}

#[async_trait]
impl LlmClient for StubLlm {
    fn provider_name(&self) -> &str {
        "stub"
    }

    fn model_name(&self) -> Option<&str> {
        Some("stub-1")
    }

    fn supports_images(&self) -> bool {
        self.supports_images
    }

    async fn analyze(&self, _request: &AnalysisRequest) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = self.fail_with.lock().unwrap().clone() {
            bail!(message);
        }
        Ok(self.response.lock().unwrap().clone())
    }
}

/// Factory handing out one shared stub client, or refusing to.
pub struct StubFactory {
    pub client: Arc<StubLlm>,
    pub fail_init: bool,
}

impl LlmClientFactory for StubFactory {
    fn create(
        &self,
        _provider: Option<&str>,
        _model: Option<&str>,
    ) -> Result<Arc<dyn LlmClient>, AnalysisError> {
        if self.fail_init {
            return Err(AnalysisError::ClientInit("bad credentials".to_string()));
        }
        Ok(self.client.clone())
    }
}

/// Config tuned for tests: tiny retry delays, small chunks and pages.
pub fn test_config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.workflow.checkpoint_dir = dir.join("checkpoints");
    config.workflow.chunk_size = 2;
    config.retry.max_retries = 1;
    config.retry.base_delay_ms = 1;
    config.retry.max_delay_ms = 2;
    config.scan.page_size = 2;
    config.llm.timeout_secs = 5;
    config
}

pub struct Harness {
    pub library: Arc<FakeLibrary>,
    pub llm: Arc<StubLlm>,
    pub service: Arc<WorkflowService>,
}

/// Wire a service over fresh fakes and a temp checkpoint dir.
pub fn harness(dir: &Path) -> Harness {
    harness_with(dir, StubLlm::default(), false)
}

pub fn harness_with(dir: &Path, llm: StubLlm, fail_init: bool) -> Harness {
    let library = Arc::new(FakeLibrary::default());
    let llm = Arc::new(llm);
    let factory = Arc::new(StubFactory {
        client: llm.clone(),
        fail_init,
    });
    let service = Arc::new(WorkflowService::new(
        library.clone(),
        factory,
        test_config(dir),
    ));
    Harness {
        library,
        llm,
        service,
    }
}
