//! Offline page source that serves recorded HTML.
//!
//! Used by the fixture tests and by `portal-scout --replay DIR`. A directory
//! holds an `index.json` mapping each URL to one recorded file, or to a list
//! of responses served in order (the last one repeats):
//!
//! ```json
//! {
//!   "https://portaldatransparencia.gov.br/pessoa-fisica/busca/lista?termo=x": "search.html",
//!   "https://portaldatransparencia.gov.br/busca/pessoa-fisica/1-x": [
//!     { "file": "blocked.html", "status": 429 },
//!     "ficha.html"
//!   ]
//! }
//! ```

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;
use url::Url;

use crate::core::error::{Result, ScoutError};
use crate::scraping::page::{select_outer_html, HeadlessPage, Navigation, PageSource};
use crate::scraping::selectors::Locator;

/// One recorded response.
#[derive(Debug, Clone)]
pub struct ReplayResponse {
    pub status: u16,
    pub html: String,
    /// Simulated load time.
    pub delay: Option<Duration>,
}

impl ReplayResponse {
    pub fn ok(html: impl Into<String>) -> Self {
        Self {
            status: 200,
            html: html.into(),
            delay: None,
        }
    }

    pub fn status(status: u16, html: impl Into<String>) -> Self {
        Self {
            status,
            html: html.into(),
            delay: None,
        }
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[derive(Debug, Default)]
struct Route {
    responses: VecDeque<ReplayResponse>,
    hits: usize,
}

#[derive(Debug, Default)]
struct Inner {
    routes: Mutex<HashMap<String, Route>>,
    navigations: AtomicUsize,
}

/// Recorded site. Cheap to clone; clones share routes and counters.
#[derive(Debug, Clone, Default)]
pub struct ReplaySite {
    inner: Arc<Inner>,
}

fn route_key(url: &str) -> String {
    Url::parse(url)
        .map(|u| u.to_string())
        .unwrap_or_else(|_| url.to_string())
}

impl ReplaySite {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `html` with status 200 for every navigation to `url`.
    pub fn page(self, url: &str, html: impl Into<String>) -> Self {
        self.respond(url, ReplayResponse::ok(html))
    }

    /// Queue a response for `url`. Responses are served in the order they
    /// were queued; the last one keeps being served.
    pub fn respond(self, url: &str, response: ReplayResponse) -> Self {
        if let Ok(mut routes) = self.inner.routes.lock() {
            routes
                .entry(route_key(url))
                .or_default()
                .responses
                .push_back(response);
        }
        self
    }

    /// Total navigations served, across all pages opened from this site.
    pub fn navigations(&self) -> usize {
        self.inner.navigations.load(Ordering::SeqCst)
    }

    /// Navigations to one URL.
    pub fn hits(&self, url: &str) -> usize {
        self.inner
            .routes
            .lock()
            .ok()
            .and_then(|routes| routes.get(&route_key(url)).map(|r| r.hits))
            .unwrap_or(0)
    }

    /// Load a recorded site from `dir/index.json`.
    pub async fn from_dir(dir: &Path) -> Result<Self> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Entry {
            File(String),
            Full {
                file: String,
                #[serde(default = "default_status")]
                status: u16,
            },
        }

        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Recorded {
            One(Entry),
            Many(Vec<Entry>),
        }

        fn default_status() -> u16 {
            200
        }

        let index_path = dir.join("index.json");
        let index = tokio::fs::read_to_string(&index_path)
            .await
            .map_err(|e| ScoutError::Config(format!("{}: {}", index_path.display(), e)))?;
        let index: HashMap<String, Recorded> = serde_json::from_str(&index)
            .map_err(|e| ScoutError::Config(format!("{}: {}", index_path.display(), e)))?;

        let mut site = ReplaySite::new();
        for (url, recorded) in index {
            let entries = match recorded {
                Recorded::One(entry) => vec![entry],
                Recorded::Many(entries) => entries,
            };
            for entry in entries {
                let (file, status) = match entry {
                    Entry::File(file) => (file, 200),
                    Entry::Full { file, status } => (file, status),
                };
                let path = dir.join(&file);
                let html = tokio::fs::read_to_string(&path)
                    .await
                    .map_err(|e| ScoutError::Config(format!("{}: {}", path.display(), e)))?;
                site = site.respond(&url, ReplayResponse::status(status, html));
            }
        }
        Ok(site)
    }

    fn serve(&self, url: &str) -> Option<ReplayResponse> {
        let mut routes = self.inner.routes.lock().ok()?;
        let route = routes.get_mut(&route_key(url))?;
        route.hits += 1;
        if route.responses.len() > 1 {
            route.responses.pop_front()
        } else {
            route.responses.front().cloned()
        }
    }
}

#[async_trait]
impl PageSource for ReplaySite {
    async fn open(&self) -> Result<Box<dyn HeadlessPage>> {
        Ok(Box::new(ReplayPage {
            site: self.clone(),
            current: None,
        }))
    }
}

/// A page over a [`ReplaySite`].
pub struct ReplayPage {
    site: ReplaySite,
    current: Option<String>,
}

#[async_trait]
impl HeadlessPage for ReplayPage {
    async fn navigate(&mut self, url: &str) -> Result<Navigation> {
        self.site.inner.navigations.fetch_add(1, Ordering::SeqCst);
        let response = self.site.serve(url).ok_or_else(|| ScoutError::NavigationFailed {
            url: url.to_string(),
            reason: "no recorded page".to_string(),
        })?;
        if let Some(delay) = response.delay {
            tokio::time::sleep(delay).await;
        }
        debug!(url, status = response.status, "replay navigation");
        self.current = Some(response.html);
        Ok(Navigation {
            final_url: url.to_string(),
            status: Some(response.status),
        })
    }

    async fn find(&self, locator: &Locator) -> Result<Vec<String>> {
        Ok(self
            .current
            .as_deref()
            .map(|html| select_outer_html(html, locator.selector()))
            .unwrap_or_default())
    }

    async fn wait_for(&self, locator: &Locator, _timeout: Duration) -> Result<bool> {
        // Recorded pages never change after load.
        Ok(!self.find(locator).await?.is_empty())
    }

    async fn close(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}
