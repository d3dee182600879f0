//! Batch-analysis orchestration.
//!
//! Coordinates the full resumable run: resolve the item universe → create or
//! load a checkpoint → compute the remaining keys → drive fixed-size chunks
//! (concurrent bundle fetch, strictly sequential analysis) → persist the
//! checkpoint after every single item. One item's failure never aborts the
//! batch; whole-run problems (bad parameters, unusable LLM credentials)
//! abort before any checkpoint is written.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::bundle::{BundleLoader, BundleRequest};
use crate::checkpoint::CheckpointManager;
use crate::config::Config;
use crate::error::AnalysisError;
use crate::models::{
    AnalysisResult, Annotation, BatchReport, BatchSource, CandidateItem, ItemBundle, ItemOutcome,
    NoteInfo,
};
use crate::retry::{is_transient_error, retry_with_policy};
use crate::source::{AnalysisRequest, ItemSource, LlmClient, LlmClientFactory};

/// Parameters for one `batch_analyze` call.
#[derive(Debug, Clone)]
pub struct BatchRequest {
    pub source: BatchSource,
    /// Cap on the item universe, applied after resolution.
    pub limit: Option<usize>,
    /// Resume an earlier run instead of starting a new one. An unknown id
    /// starts fresh rather than erroring.
    pub resume_workflow_id: Option<String>,
    pub skip_existing: bool,
    pub include_annotations: bool,
    pub llm_provider: Option<String>,
    pub llm_model: Option<String>,
    pub template: Option<String>,
    pub dry_run: bool,
    pub delete_old_notes: bool,
    pub move_to_collection: Option<String>,
}

impl BatchRequest {
    pub fn new(source: BatchSource) -> Self {
        Self {
            source,
            limit: None,
            resume_workflow_id: None,
            skip_existing: true,
            include_annotations: true,
            llm_provider: None,
            llm_model: None,
            template: None,
            dry_run: false,
            delete_old_notes: false,
            move_to_collection: None,
        }
    }
}

/// Per-item behavior knobs shared by the batch path and the scanner.
#[derive(Debug, Clone, Default)]
pub struct AnalyzeOptions {
    pub skip_existing: bool,
    pub delete_old_notes: bool,
    pub dry_run: bool,
    pub move_to_collection: Option<String>,
    pub template: Option<String>,
}

/// Per-item analysis material assembled by `prepare_analysis`.
#[derive(Debug, Clone)]
pub struct PreparedItem {
    pub key: String,
    pub title: String,
    /// Set when the existing-note probe decided this item needs no work;
    /// the bundle fetch is then avoided entirely.
    pub skip_reason: Option<String>,
    pub bundle: Option<ItemBundle>,
}

/// The resumable batch-analysis orchestrator.
///
/// Constructed once with its collaborators and passed by reference;
/// independent instances are cheap to build in tests.
pub struct WorkflowService {
    source: Arc<dyn ItemSource>,
    llm_factory: Arc<dyn LlmClientFactory>,
    checkpoints: CheckpointManager,
    loader: BundleLoader,
    config: Config,
}

impl WorkflowService {
    pub fn new(
        source: Arc<dyn ItemSource>,
        llm_factory: Arc<dyn LlmClientFactory>,
        config: Config,
    ) -> Self {
        let checkpoints = CheckpointManager::new(config.workflow.checkpoint_dir.clone());
        let loader = BundleLoader::new(source.clone(), &config);
        Self {
            source,
            llm_factory,
            checkpoints,
            loader,
            config,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn item_source(&self) -> &Arc<dyn ItemSource> {
        &self.source
    }

    pub fn loader(&self) -> &BundleLoader {
        &self.loader
    }

    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    /// Construct the configured LLM client, falling back to the config's
    /// default provider/model when the call does not name one.
    pub fn create_llm_client(
        &self,
        provider: Option<&str>,
        model: Option<&str>,
    ) -> std::result::Result<Arc<dyn LlmClient>, AnalysisError> {
        self.llm_factory.create(
            provider.or(self.config.llm.provider.as_deref()),
            model.or(self.config.llm.model.as_deref()),
        )
    }

    // ============ Batch analysis ============

    /// Run (or resume) a batch analysis over the items of `request.source`.
    ///
    /// The returned report carries cumulative counts from the workflow
    /// state, so a resumed run reports totals across all of its calls.
    pub async fn batch_analyze(&self, request: BatchRequest) -> Result<BatchReport> {
        let items = self.resolve_source(&request.source, request.limit).await?;
        let all_keys: Vec<String> = items.iter().map(|i| i.key.clone()).collect();
        let titles: HashMap<&str, &str> = items
            .iter()
            .map(|i| (i.key.as_str(), i.title.as_str()))
            .collect();

        let (source_type, source_identifier) = request.source.descriptor();
        let mut state = match &request.resume_workflow_id {
            Some(id) => match self.checkpoints.load_state(id).await? {
                Some(state) => {
                    if state.source_type != source_type
                        || state.source_identifier != source_identifier
                    {
                        warn!(
                            "workflow {} was created for {}:{}, resuming against {}:{}",
                            id, state.source_type, state.source_identifier, source_type,
                            source_identifier
                        );
                    }
                    let (processed, skipped, failed) = state.counts();
                    info!(
                        "resuming workflow {} ({}/{} items resolved)",
                        id,
                        processed + skipped + failed,
                        state.total_items
                    );
                    state
                }
                None => {
                    warn!("workflow {} has no checkpoint, starting fresh", id);
                    self.checkpoints.create_workflow(
                        &source_type,
                        &source_identifier,
                        all_keys.len(),
                        HashMap::new(),
                    )
                }
            },
            None => self.checkpoints.create_workflow(
                &source_type,
                &source_identifier,
                all_keys.len(),
                HashMap::new(),
            ),
        };

        let remaining = state.remaining_keys(&all_keys);
        debug!(
            "workflow {}: {} of {} keys remaining",
            state.workflow_id,
            remaining.len(),
            all_keys.len()
        );

        // Client construction happens before the first checkpoint write, so
        // bad credentials cannot leave behind a zero-progress checkpoint
        // that looks like a completed no-op.
        let client = self
            .create_llm_client(request.llm_provider.as_deref(), request.llm_model.as_deref())
            .map_err(anyhow::Error::from)?;

        state.metadata.insert(
            "llm_provider".to_string(),
            serde_json::Value::String(client.provider_name().to_string()),
        );
        self.checkpoints
            .save_state(&state)
            .await
            .context("Failed to write initial checkpoint")?;

        let bundle_request = BundleRequest {
            fulltext: true,
            annotations: request.include_annotations,
            notes: true,
            multimodal: false,
        };
        let opts = AnalyzeOptions {
            skip_existing: request.skip_existing,
            delete_old_notes: request.delete_old_notes,
            dry_run: request.dry_run,
            move_to_collection: request.move_to_collection.clone(),
            template: request.template.clone(),
        };

        let chunk_size = self.config.workflow.chunk_size.max(1);
        let mut results = Vec::with_capacity(remaining.len());

        for chunk in remaining.chunks(chunk_size) {
            let bundles = self.loader.fetch_many(chunk, bundle_request).await;

            // Analysis is sequential within the chunk: provider rate limits
            // apply per key, and checkpoint granularity stays at one item.
            for (key, bundle) in chunk.iter().zip(bundles) {
                let title = titles.get(key.as_str()).copied().unwrap_or_default();
                let result = self
                    .analyze_single_item(key, title, bundle.as_ref(), client.as_ref(), &opts)
                    .await;

                match &result.outcome {
                    ItemOutcome::Success { .. } => state.mark_processed(key),
                    ItemOutcome::Skipped { .. } => state.mark_skipped(key),
                    ItemOutcome::Failed { error } => state.mark_failed(key, error),
                }
                self.checkpoints
                    .save_state(&state)
                    .await
                    .with_context(|| format!("Failed to checkpoint after {}", key))?;
                results.push(result);
            }
        }

        state.mark_completed();
        self.checkpoints.save_state(&state).await?;

        let (processed, skipped, failed) = state.counts();
        info!(
            "workflow {} completed: {} processed, {} skipped, {} failed",
            state.workflow_id, processed, skipped, failed
        );

        Ok(BatchReport {
            workflow_id: state.workflow_id.clone(),
            total_items: state.total_items,
            processed,
            skipped,
            failed,
            results,
            status: state.status,
        })
    }

    // ============ Single-item analysis ============

    /// Analyze one item to a terminal outcome. Never fails the caller:
    /// every error is folded into the returned result.
    pub async fn analyze_single_item(
        &self,
        key: &str,
        title: &str,
        bundle: Option<&ItemBundle>,
        client: &dyn LlmClient,
        opts: &AnalyzeOptions,
    ) -> AnalysisResult {
        let started = Instant::now();
        let outcome = match self.analyze_inner(key, bundle, client, opts).await {
            Ok(outcome) => outcome,
            Err(err) => err.into_outcome(),
        };

        let title = bundle
            .map(|b| b.metadata.title.as_str())
            .filter(|t| !t.is_empty())
            .unwrap_or(title);
        debug!("analyzed {} in {:?}: {:?}", key, started.elapsed(), outcome);

        AnalysisResult {
            item_key: key.to_string(),
            title: title.to_string(),
            outcome,
            processing_time: started.elapsed(),
        }
    }

    async fn analyze_inner(
        &self,
        key: &str,
        bundle: Option<&ItemBundle>,
        client: &dyn LlmClient,
        opts: &AnalyzeOptions,
    ) -> std::result::Result<ItemOutcome, AnalysisError> {
        let bundle = bundle.ok_or_else(|| {
            AnalysisError::Transient(format!("failed to fetch bundle for {}", key))
        })?;

        // Deliberate skip: an analysis note already exists and the caller
        // did not ask for regeneration.
        if opts.skip_existing
            && !opts.delete_old_notes
            && self.has_analysis_note(&bundle.notes)
        {
            return Ok(ItemOutcome::Skipped {
                reason: "analysis note already exists".to_string(),
            });
        }

        let text = bundle.extractable_text().ok_or_else(|| {
            AnalysisError::ContentUnavailable(
                "no fulltext or multimodal text available".to_string(),
            )
        })?;

        let analysis = self.run_analysis(bundle, &text, client, opts).await?;

        if opts.dry_run {
            return Ok(ItemOutcome::Success { note_key: None });
        }

        if opts.delete_old_notes {
            for note in self.analysis_notes(&bundle.notes) {
                retry_with_policy(&self.config.retry, "note deletion", || {
                    self.source.delete_note(&note.key)
                })
                .await?;
            }
        }

        let content = build_note_content(
            &bundle.metadata.title,
            &analysis,
            client.provider_name(),
            client.model_name(),
        );
        let tags = vec![
            self.config.workflow.analysis_tag.clone(),
            client.provider_name().to_string(),
        ];
        let note_key = retry_with_policy(&self.config.retry, "note creation", || {
            self.source.create_note(key, &content, &tags)
        })
        .await?;

        if let Some(target) = &opts.move_to_collection {
            self.move_item(key, target).await?;
        }

        Ok(ItemOutcome::Success {
            note_key: Some(note_key),
        })
    }

    async fn run_analysis(
        &self,
        bundle: &ItemBundle,
        text: &str,
        client: &dyn LlmClient,
        opts: &AnalyzeOptions,
    ) -> std::result::Result<String, AnalysisError> {
        let request = AnalysisRequest {
            title: bundle.metadata.title.clone(),
            authors: bundle.metadata.creators.clone(),
            journal: bundle.metadata.publication.clone(),
            date: bundle.metadata.date.clone(),
            doi: bundle.metadata.doi.clone(),
            fulltext: text.to_string(),
            annotations: format_annotations(&bundle.annotations),
            template: opts
                .template
                .clone()
                .or_else(|| self.config.llm.template.clone()),
            images: if client.supports_images() {
                bundle
                    .multimodal
                    .as_ref()
                    .map(|m| m.images.clone())
                    .unwrap_or_default()
            } else {
                Vec::new()
            },
        };

        let timeout = Duration::from_secs(self.config.llm.timeout_secs);
        let analysis = retry_with_policy(&self.config.retry, "llm analysis", || async {
            match tokio::time::timeout(timeout, client.analyze(&request)).await {
                Ok(result) => result,
                Err(_) => anyhow::bail!("llm analysis timed out after {}s", timeout.as_secs()),
            }
        })
        .await
        .map_err(|err| {
            let message = format!("{:#}", err);
            if is_transient_error(&message) {
                AnalysisError::Transient(message)
            } else {
                AnalysisError::Other(err)
            }
        })?;

        if analysis.trim().is_empty() {
            return Err(AnalysisError::LlmContract(
                "provider returned an empty analysis".to_string(),
            ));
        }
        Ok(analysis)
    }

    /// Move: add to the target collection, then remove from every other
    /// collection the item belongs to.
    async fn move_item(&self, key: &str, target: &str) -> std::result::Result<(), AnalysisError> {
        retry_with_policy(&self.config.retry, "collection add", || {
            self.source.add_to_collection(key, target)
        })
        .await?;

        let memberships = retry_with_policy(&self.config.retry, "collection membership", || {
            self.source.item_collections(key)
        })
        .await?;

        for collection in memberships.iter().filter(|c| c.as_str() != target) {
            retry_with_policy(&self.config.retry, "collection remove", || {
                self.source.remove_from_collection(key, collection)
            })
            .await?;
        }
        Ok(())
    }

    // ============ Read-only assembly ============

    /// Assemble per-item analysis material without invoking the LLM.
    ///
    /// With `skip_existing`, a cheap note probe runs before the expensive
    /// bundle fetch; items that already carry an analysis note are returned
    /// with a skip reason and no bundle.
    pub async fn prepare_analysis(
        &self,
        keys: &[String],
        skip_existing: bool,
        include_annotations: bool,
        include_multimodal: bool,
    ) -> Result<Vec<PreparedItem>> {
        let mut prepared: Vec<PreparedItem> = keys
            .iter()
            .map(|key| PreparedItem {
                key: key.clone(),
                title: String::new(),
                skip_reason: None,
                bundle: None,
            })
            .collect();

        let mut fetch_indices = Vec::new();
        for (index, key) in keys.iter().enumerate() {
            if skip_existing {
                let notes = retry_with_policy(&self.config.retry, "note probe", || {
                    self.source.notes(key)
                })
                .await?;
                if self.has_analysis_note(&notes) {
                    prepared[index].skip_reason =
                        Some("analysis note already exists".to_string());
                    continue;
                }
            }
            fetch_indices.push(index);
        }

        let fetch_keys: Vec<String> = fetch_indices.iter().map(|&i| keys[i].clone()).collect();
        let bundles = self
            .loader
            .fetch_many(
                &fetch_keys,
                BundleRequest {
                    fulltext: true,
                    annotations: include_annotations,
                    notes: true,
                    multimodal: include_multimodal,
                },
            )
            .await;

        for (&index, bundle) in fetch_indices.iter().zip(bundles) {
            if let Some(bundle) = &bundle {
                prepared[index].title = bundle.metadata.title.clone();
            }
            prepared[index].bundle = bundle;
        }

        Ok(prepared)
    }

    // ============ Source resolution ============

    async fn resolve_source(
        &self,
        source: &BatchSource,
        limit: Option<usize>,
    ) -> Result<Vec<CandidateItem>> {
        let mut items = match source {
            BatchSource::Collection { key } => self.collect_all_items(key).await?,
            BatchSource::CollectionName { name } => {
                let key = self.resolve_collection_name(name).await?;
                self.collect_all_items(&key).await?
            }
            BatchSource::Recent { days } => {
                retry_with_policy(&self.config.retry, "recent items", || {
                    self.source.recent_items(*days, limit)
                })
                .await?
            }
        };
        if let Some(limit) = limit {
            items.truncate(limit);
        }
        Ok(items)
    }

    async fn collect_all_items(&self, collection_key: &str) -> Result<Vec<CandidateItem>> {
        let page_size = self.config.scan.page_size.max(1);
        let mut items = Vec::new();
        let mut start = 0;
        loop {
            let description = format!("collection page {}@{}", collection_key, start);
            let page = retry_with_policy(&self.config.retry, &description, || {
                self.source.collection_items(collection_key, page_size, start)
            })
            .await?;
            let fetched = page.len();
            items.extend(page);
            if fetched < page_size {
                break;
            }
            start += fetched;
        }
        Ok(items)
    }

    async fn resolve_collection_name(&self, name: &str) -> Result<String> {
        let collections = retry_with_policy(&self.config.retry, "collection listing", || {
            self.source.list_collections()
        })
        .await?;

        let matches: Vec<_> = collections.iter().filter(|c| c.name == name).collect();
        match matches.as_slice() {
            [] => Err(AnalysisError::Validation(format!(
                "no collection named '{}'",
                name
            ))
            .into()),
            [only] => Ok(only.key.clone()),
            many => {
                let keys: Vec<&str> = many.iter().map(|c| c.key.as_str()).collect();
                Err(AnalysisError::Validation(format!(
                    "collection name '{}' is ambiguous: {}",
                    name,
                    keys.join(", ")
                ))
                .into())
            }
        }
    }

    fn has_analysis_note(&self, notes: &[NoteInfo]) -> bool {
        !self.analysis_notes(notes).is_empty()
    }

    fn analysis_notes<'a>(&self, notes: &'a [NoteInfo]) -> Vec<&'a NoteInfo> {
        let tag = &self.config.workflow.analysis_tag;
        notes
            .iter()
            .filter(|note| note.tags.iter().any(|t| t == tag))
            .collect()
    }
}

/// Render the stored note body for one analysis.
fn build_note_content(title: &str, analysis: &str, provider: &str, model: Option<&str>) -> String {
    let model_suffix = model.map(|m| format!(" ({})", m)).unwrap_or_default();
    format!(
        "<h2>AI Analysis: {}</h2>\n<div>{}</div>\n<p><em>Generated by {}{} on {} UTC</em></p>",
        title,
        analysis,
        provider,
        model_suffix,
        Utc::now().format("%Y-%m-%d %H:%M")
    )
}

/// Digest reader annotations into a plain-text block for the prompt.
fn format_annotations(annotations: &[Annotation]) -> String {
    annotations
        .iter()
        .map(|a| {
            let mut line = format!("- ({})", a.kind);
            if let Some(page) = &a.page {
                line.push_str(&format!(" p.{}", page));
            }
            if let Some(text) = &a.text {
                line.push_str(&format!(" \"{}\"", text));
            }
            if let Some(comment) = &a.comment {
                line.push_str(&format!(" [{}]", comment));
            }
            line
        })
        .collect::<Vec<_>>()
        .join("\n")
}
