//! Library-wide candidate scanning.
//!
//! Discovers items worth analyzing using a two-stage priority strategy:
//! the designated source collection is drained first, then the remaining
//! collections are visited in ascending name order (the naming convention is
//! the priority signal). Discovered candidates flow through the same
//! per-item analysis routine the interactive path uses, so there is exactly
//! one place that decides what an analysis does.
//!
//! A collection whose pages keep failing is abandoned with a warning rather
//! than aborting the whole scan: partial results are acceptable, total
//! failure is not.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::bundle::BundleRequest;
use crate::models::{CandidateItem, ScanMetrics, ScanReport, ScanStatus};
use crate::retry::retry_with_policy;
use crate::workflow::{AnalyzeOptions, WorkflowService};

/// Parameters for one `scan_and_process` call.
#[derive(Debug, Clone, Default)]
pub struct ScanRequest {
    /// Page size used while paginating collections. Defaults to the
    /// configured scan page size.
    pub scan_limit: Option<usize>,
    /// Stop discovering once this many candidates are collected. Unset
    /// means scan everything.
    pub treated_limit: Option<usize>,
    /// Collection analyzed items are moved into. Required unless
    /// `dry_run`.
    pub target_collection: Option<String>,
    pub dry_run: bool,
    pub llm_provider: Option<String>,
    /// Priority collection scanned in stage 1.
    pub source_collection: Option<String>,
    pub include_multimodal: bool,
    pub template: Option<String>,
}

/// Two-stage prioritized candidate scanner.
pub struct GlobalScanner {
    service: Arc<WorkflowService>,
}

impl GlobalScanner {
    pub fn new(service: Arc<WorkflowService>) -> Self {
        Self { service }
    }

    /// Scan collections for candidates and run each through analysis.
    ///
    /// Validation problems and LLM client construction failures are
    /// reported in the returned status rather than as an `Err`, so callers
    /// always get metrics and a message.
    pub async fn scan_and_process(&self, request: ScanRequest) -> ScanReport {
        let config = self.service.config();
        let page_size = request.scan_limit.unwrap_or(config.scan.page_size);

        if page_size == 0 {
            return ScanReport::validation_error("scan_limit must be > 0");
        }
        if !request.dry_run && request.target_collection.is_none() {
            return ScanReport::validation_error(
                "target collection is required unless dry_run is set",
            );
        }

        let mut metrics = ScanMetrics::default();
        let mut seen = HashSet::new();
        let mut candidates = Vec::new();

        // Stage 1: the priority source collection.
        if let Some(source_key) = &request.source_collection {
            self.scan_collection(
                source_key,
                page_size,
                request.treated_limit,
                &mut metrics,
                &mut seen,
                &mut candidates,
            )
            .await;
        }

        // Stage 2: remaining collections, ascending name order.
        if !limit_reached(request.treated_limit, candidates.len()) {
            let listing = retry_with_policy(
                &config.retry,
                "collection listing",
                || self.service.item_source().list_collections(),
            )
            .await;
            let mut collections = match listing {
                Ok(collections) => collections,
                Err(err) => {
                    return ScanReport::error(format!("failed to list collections: {:#}", err))
                }
            };
            collections.sort_by(|a, b| a.name.cmp(&b.name));

            for collection in collections {
                if request.source_collection.as_deref() == Some(collection.key.as_str()) {
                    continue;
                }
                if limit_reached(request.treated_limit, candidates.len()) {
                    break;
                }
                self.scan_collection(
                    &collection.key,
                    page_size,
                    request.treated_limit,
                    &mut metrics,
                    &mut seen,
                    &mut candidates,
                )
                .await;
            }
        }

        metrics.candidates = candidates.len();
        info!(
            "scan discovered {} candidates from {} scanned items",
            metrics.candidates, metrics.scanned
        );

        if request.dry_run {
            let titles = candidates.iter().map(|c| c.title.clone()).collect();
            return ScanReport {
                status: ScanStatus::Success,
                metrics,
                message: format!("dry run: {} candidates discovered", metrics.candidates),
                candidate_titles: titles,
            };
        }

        let client = match self
            .service
            .create_llm_client(request.llm_provider.as_deref(), None)
        {
            Ok(client) => client,
            Err(err) => return ScanReport::error(err.to_string()),
        };

        let opts = AnalyzeOptions {
            skip_existing: true,
            delete_old_notes: false,
            dry_run: false,
            move_to_collection: request.target_collection.clone(),
            template: request.template.clone(),
        };
        let base_request = BundleRequest {
            fulltext: true,
            annotations: true,
            notes: true,
            multimodal: false,
        };

        let chunk_size = config.workflow.chunk_size.max(1);
        for chunk in candidates.chunks(chunk_size) {
            let keys: Vec<String> = chunk.iter().map(|c| c.key.clone()).collect();
            let mut bundles = self.service.loader().fetch_many(&keys, base_request).await;

            // Multimodal extraction is deferred: fetch text-only first, then
            // backfill just the items whose bundle still lacks extractable
            // fulltext. Most items never need the expensive pass.
            if request.include_multimodal {
                let needy: Vec<usize> = bundles
                    .iter()
                    .enumerate()
                    .filter(|(_, b)| {
                        b.as_ref()
                            .is_some_and(|bundle| bundle.extractable_text().is_none())
                    })
                    .map(|(i, _)| i)
                    .collect();
                if !needy.is_empty() {
                    debug!("backfilling multimodal content for {} items", needy.len());
                    let needy_keys: Vec<String> =
                        needy.iter().map(|&i| keys[i].clone()).collect();
                    let refreshed = self
                        .service
                        .loader()
                        .fetch_many(
                            &needy_keys,
                            BundleRequest {
                                multimodal: true,
                                ..base_request
                            },
                        )
                        .await;
                    for (&index, bundle) in needy.iter().zip(refreshed) {
                        if bundle.is_some() {
                            bundles[index] = bundle;
                        }
                    }
                }
            }

            for (item, bundle) in chunk.iter().zip(&bundles) {
                let result = self
                    .service
                    .analyze_single_item(
                        &item.key,
                        &item.title,
                        bundle.as_ref(),
                        client.as_ref(),
                        &opts,
                    )
                    .await;
                metrics.record(&result.outcome);
            }
        }

        ScanReport {
            status: ScanStatus::Success,
            message: format!(
                "scan complete: {} scanned, {} candidates, {} processed, {} skipped, {} failed",
                metrics.scanned, metrics.candidates, metrics.processed, metrics.skipped,
                metrics.failed
            ),
            metrics,
            candidate_titles: Vec::new(),
        }
    }

    /// Paginate one collection, collecting eligible candidates until the
    /// pages run out or the treated limit is reached. Exhausted retries
    /// abandon this collection only.
    async fn scan_collection(
        &self,
        collection_key: &str,
        page_size: usize,
        treated_limit: Option<usize>,
        metrics: &mut ScanMetrics,
        seen: &mut HashSet<String>,
        candidates: &mut Vec<CandidateItem>,
    ) {
        let config = self.service.config();
        let mut start = 0;

        loop {
            if limit_reached(treated_limit, candidates.len()) {
                return;
            }

            let description = format!("scan page {}@{}", collection_key, start);
            let page = match retry_with_policy(&config.retry, &description, || {
                self.service
                    .item_source()
                    .collection_items(collection_key, page_size, start)
            })
            .await
            {
                Ok(page) => page,
                Err(err) => {
                    warn!(
                        "abandoning scan of collection {}: {:#}",
                        collection_key, err
                    );
                    return;
                }
            };

            let fetched = page.len();
            for item in page {
                metrics.scanned += 1;
                if !seen.insert(item.key.clone()) {
                    continue;
                }
                if self.is_candidate(&item).await {
                    candidates.push(CandidateItem {
                        has_pdf: true,
                        ..item
                    });
                    if limit_reached(treated_limit, candidates.len()) {
                        return;
                    }
                }
            }

            if fetched < page_size {
                return;
            }
            start += fetched;
        }
    }

    /// Eligibility: a parent item, not yet tagged as analyzed, with at
    /// least one PDF attachment. The tag and type checks are free, so the
    /// attachment probe runs last.
    async fn is_candidate(&self, item: &CandidateItem) -> bool {
        if !item.is_parent() {
            return false;
        }
        let completion_tag = &self.service.config().scan.completion_tag;
        if item.tags.iter().any(|t| t == completion_tag) {
            return false;
        }

        let description = format!("attachment probe for {}", item.key);
        match retry_with_policy(&self.service.config().retry, &description, || {
            self.service.item_source().attachments(&item.key)
        })
        .await
        {
            Ok(attachments) => attachments.iter().any(|a| a.is_pdf()),
            Err(err) => {
                warn!("could not probe attachments for {}: {:#}", item.key, err);
                false
            }
        }
    }
}

fn limit_reached(treated_limit: Option<usize>, count: usize) -> bool {
    treated_limit.is_some_and(|limit| count >= limit)
}
