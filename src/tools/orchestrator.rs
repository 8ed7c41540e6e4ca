//! Orchestrator: one query in, one result envelope out.
//!
//! Screens are visited in the fixed order Search → Links → Detail on a page
//! the caller owns for the whole run. Per-item extraction failures become
//! `partial_failures`; configuration errors, cancellation and guard
//! exhaustion end the run with a single error.

use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use url::Url;
use uuid::Uuid;

use crate::core::error::{ErrorClass, Result, ScoutError};
use crate::core::types::{
    DetailRecord, ItemResult, PartialFailure, ResultEnvelope, ResultScope, SearchQuery, Stage,
};
use crate::features::guard::{Guard, GuardPolicy};
use crate::scraping::page::HeadlessPage;
use crate::scraping::selectors::SelectorRegistry;
use crate::tools::detail::DetailExtractor;
use crate::tools::filters;
use crate::tools::links::LinkExtractor;
use crate::tools::search::SearchNavigator;

/// Settings the pipeline components need, independent of where they came from.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub base_url: String,
    pub guard: GuardPolicy,
    pub ready_timeout: Duration,
    pub max_detail_pages: usize,
}

#[derive(Debug, Clone)]
pub struct Orchestrator {
    base_url: Url,
    search: SearchNavigator,
    links: LinkExtractor,
    detail: DetailExtractor,
}

impl Orchestrator {
    /// Resolve every locator the pipeline uses. A missing name fails here,
    /// before any page is opened.
    pub fn new(registry: &SelectorRegistry, settings: &PipelineSettings) -> Result<Self> {
        let base_url = Url::parse(&settings.base_url)
            .map_err(|e| ScoutError::Config(format!("base_url `{}`: {}", settings.base_url, e)))?;
        let guard = Guard::new(settings.guard.clone(), registry)?;
        Ok(Self {
            search: SearchNavigator::new(registry, guard.clone(), &base_url, settings.ready_timeout)?,
            links: LinkExtractor::new(registry, guard.clone(), &base_url, settings.ready_timeout)?,
            detail: DetailExtractor::new(
                registry,
                guard,
                &base_url,
                settings.ready_timeout,
                settings.max_detail_pages,
            )?,
            base_url,
        })
    }

    /// First search page URL for a query; also the cache identity of a run.
    pub fn search_url(&self, query: &SearchQuery) -> Result<String> {
        filters::search_url(self.base_url.as_str(), query, 1)
    }

    pub async fn run(
        &self,
        page: &mut dyn HeadlessPage,
        query: &SearchQuery,
        scope: &ResultScope,
        cancel: &CancellationToken,
    ) -> Result<ResultEnvelope> {
        let search_url = self.search_url(query)?;
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%run_id, term = query.term(), mode = %query.mode(), url = %search_url, "run started");

        let outcome = self.search.collect(page, query, cancel).await?;
        let mut partial_failures: Vec<PartialFailure> = outcome.interrupted.into_iter().collect();
        let mut items = Vec::with_capacity(outcome.items.len());

        for item in outcome.items {
            if !scope.visits_details() {
                items.push(ItemResult {
                    item,
                    links: Vec::new(),
                    records: Vec::new(),
                });
                continue;
            }
            if cancel.is_cancelled() {
                return Err(ScoutError::Cancelled);
            }

            let links = match self.links.extract(page, &item, cancel).await {
                Ok(links) => links,
                Err(e) if e.class() == ErrorClass::PerItem => {
                    partial_failures.push(failure(Stage::Links, &item.url, None, &e));
                    items.push(ItemResult {
                        item,
                        links: Vec::new(),
                        records: Vec::new(),
                    });
                    continue;
                }
                Err(e) => return Err(e),
            };

            let mut records: Vec<DetailRecord> = Vec::new();
            for link in links.iter().filter(|l| scope.admits(l)) {
                match self.detail.extract(page, link, cancel).await {
                    Ok(record) => records.push(record),
                    Err(e) if e.class() == ErrorClass::PerItem => {
                        partial_failures.push(failure(Stage::Detail, &link.url, Some(&link.label), &e));
                    }
                    Err(e) => return Err(e),
                }
            }
            items.push(ItemResult {
                item,
                links,
                records,
            });
        }

        let envelope = ResultEnvelope {
            run_id,
            term: query.term().to_string(),
            mode: query.mode(),
            search_url,
            scope: scope.clone(),
            started_at,
            finished_at: Utc::now(),
            items,
            partial_failures,
        };
        info!(
            %run_id,
            items = envelope.items.len(),
            records = envelope.record_count(),
            partial_failures = envelope.partial_failures.len(),
            "run finished"
        );
        Ok(envelope)
    }
}

fn failure(stage: Stage, url: &str, label: Option<&str>, err: &ScoutError) -> PartialFailure {
    warn!(stage = ?stage, url, label, error = %err, "partial failure");
    PartialFailure::new(stage, url, label, err)
}
