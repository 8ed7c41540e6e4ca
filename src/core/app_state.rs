use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::core::config::ScoutConfig;
use crate::core::error::{Result, ScoutError};
use crate::core::sink::RecordSink;
use crate::core::types::{ResultEnvelope, ResultScope, SearchQuery};
use crate::scraping::page::PageSource;
use crate::scraping::selectors::SelectorRegistry;
use crate::tools::orchestrator::Orchestrator;

/// Shared state for every run in the process.
#[derive(Clone)]
pub struct ScoutState {
    pub config: Arc<ScoutConfig>,
    pub registry: Arc<SelectorRegistry>,
    pub orchestrator: Arc<Orchestrator>,
    /// One page per run; pages are never shared between runs.
    pub pages: Arc<dyn PageSource>,
    // Bounds concurrent runs; more parallel traffic means more captchas.
    pub run_limit: Arc<Semaphore>,
    // key: first search URL + result limit + scope
    pub result_cache: Option<moka::future::Cache<String, ResultEnvelope>>,
    pub sinks: Vec<Arc<dyn RecordSink>>,
}

impl std::fmt::Debug for ScoutState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScoutState")
            .field("base_url", &self.config.base_url)
            .field("layout_version", &self.registry.version())
            .field("run_permits", &self.run_limit.available_permits())
            .field("cache_enabled", &self.result_cache.is_some())
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

impl ScoutState {
    /// Build the registry (with overrides) and the pipeline. Any selector
    /// problem surfaces here, before a page is opened.
    pub fn new(config: ScoutConfig, pages: Arc<dyn PageSource>) -> Result<Self> {
        let registry = SelectorRegistry::portal()?.with_overrides(&config.selector_overrides)?;
        let orchestrator = Orchestrator::new(&registry, &config.pipeline_settings())?;
        let result_cache = (config.cache_ttl_secs > 0).then(|| {
            moka::future::Cache::builder()
                .max_capacity(1_000)
                .time_to_live(Duration::from_secs(config.cache_ttl_secs))
                .build()
        });
        info!(
            layout = registry.version(),
            locators = registry.len(),
            max_concurrent_runs = config.max_concurrent_runs,
            "scout state ready"
        );
        Ok(Self {
            run_limit: Arc::new(Semaphore::new(config.max_concurrent_runs.max(1))),
            config: Arc::new(config),
            registry: Arc::new(registry),
            orchestrator: Arc::new(orchestrator),
            pages,
            result_cache,
            sinks: Vec::new(),
        })
    }

    pub fn with_sink(mut self, sink: Arc<dyn RecordSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Run one query in its own page. Waits for a free run slot first.
    pub async fn execute(
        &self,
        query: &SearchQuery,
        scope: &ResultScope,
        cancel: &CancellationToken,
    ) -> Result<ResultEnvelope> {
        let key = format!(
            "{}#{}#{}",
            self.orchestrator.search_url(query)?,
            query.effective_limit(),
            scope.cache_key()
        );
        if let Some(cache) = &self.result_cache {
            if let Some(hit) = cache.get(&key).await {
                info!(key = %key, "result cache hit");
                return Ok(hit);
            }
        }

        let _permit = tokio::select! {
            _ = cancel.cancelled() => return Err(ScoutError::Cancelled),
            permit = self.run_limit.acquire() => permit
                .map_err(|e| ScoutError::Browser(format!("run pool closed: {}", e)))?,
        };

        let mut page = self.pages.open().await?;
        let result = self.orchestrator.run(page.as_mut(), query, scope, cancel).await;
        if let Err(e) = page.close().await {
            warn!("page close failed: {}", e);
        }
        let envelope = result?;

        for sink in &self.sinks {
            sink.accept(&envelope).await?;
        }
        if let Some(cache) = &self.result_cache {
            cache.insert(key, envelope.clone()).await;
        }
        Ok(envelope)
    }

    /// Run several queries over the bounded pool. Results come back in
    /// input order.
    pub async fn execute_many(
        &self,
        runs: Vec<(SearchQuery, ResultScope)>,
        cancel: &CancellationToken,
    ) -> Vec<Result<ResultEnvelope>> {
        let width = self.config.max_concurrent_runs.max(1);
        stream::iter(runs)
            .map(|(query, scope)| async move { self.execute(&query, &scope, cancel).await })
            .buffered(width)
            .collect()
            .await
    }
}
