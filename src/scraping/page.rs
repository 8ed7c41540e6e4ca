//! Headless page capability.
//!
//! The pipeline only ever talks to a page through [`HeadlessPage`]:
//! `navigate`, `find` and `wait_for`. Both the Chromium backend and the
//! offline replay source implement it, so the automation engine can be
//! swapped without touching extraction code.
//!
//! `find` returns the outer HTML of each match; extractors parse those
//! fragments synchronously with `scraper` and never keep a parsed document
//! across an `.await`.

use std::time::Duration;

use async_trait::async_trait;
use scraper::{ElementRef, Html, Selector};

use crate::core::error::Result;
use crate::scraping::selectors::Locator;

/// Result of a completed navigation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Navigation {
    pub final_url: String,
    /// HTTP status of the main document, when the engine exposes it.
    pub status: Option<u16>,
}

#[async_trait]
pub trait HeadlessPage: Send + Sync {
    async fn navigate(&mut self, url: &str) -> Result<Navigation>;

    /// Outer HTML of every element matching `locator`, in document order.
    async fn find(&self, locator: &Locator) -> Result<Vec<String>>;

    /// Wait until `locator` matches at least one element. `Ok(false)` on timeout.
    async fn wait_for(&self, locator: &Locator, timeout: Duration) -> Result<bool>;

    async fn close(self: Box<Self>) -> Result<()>;
}

/// Hands out one exclusive page per run.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn open(&self) -> Result<Box<dyn HeadlessPage>>;
}

/// Outer HTML of every match of `selector` in a full document.
pub fn select_outer_html(document: &str, selector: &Selector) -> Vec<String> {
    let doc = Html::parse_document(document);
    doc.select(selector).map(|el| el.html()).collect()
}

/// A parsed element fragment returned by [`HeadlessPage::find`].
pub struct Fragment(Html);

impl Fragment {
    pub fn parse(html: &str) -> Self {
        Self(Html::parse_fragment(html))
    }

    pub fn select<'a>(&'a self, locator: &'a Locator) -> impl Iterator<Item = ElementRef<'a>> + 'a {
        self.0.select(locator.selector())
    }

    pub fn first<'a>(&'a self, locator: &'a Locator) -> Option<ElementRef<'a>> {
        self.0.select(locator.selector()).next()
    }

    /// The fragment's top element (the element `find` matched).
    pub fn root(&self) -> Option<ElementRef<'_>> {
        self.0.root_element().children().find_map(ElementRef::wrap)
    }

    pub fn text(&self) -> String {
        clean_text(self.0.root_element())
    }
}

/// Element text with whitespace runs collapsed to single spaces.
pub fn clean_text(el: ElementRef<'_>) -> String {
    el.text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Field name as used in records: trimmed, lowercased, whitespace → `_`,
/// trailing `:` dropped.
pub fn normalize_key(label: &str) -> String {
    label
        .trim()
        .trim_end_matches(':')
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
        .to_lowercase()
}
