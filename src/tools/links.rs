//! Link Extractor: enumerates every detail link on a person's aggregation
//! screen. No category allow-list; whatever the portal shows is reported.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use scraper::ElementRef;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

use crate::core::error::{Result, ScoutError};
use crate::core::types::{DetailLink, SearchResultItem};
use crate::features::guard::{wait_ready, Guard};
use crate::scraping::page::{clean_text, Fragment, HeadlessPage};
use crate::scraping::selectors::{Locator, Screen, SelectorRegistry};

#[derive(Debug)]
struct AggregationLocators {
    container: Arc<Locator>,
    section: Arc<Locator>,
    subsection: Arc<Locator>,
    subsection_title: Arc<Locator>,
    detail_link: Arc<Locator>,
}

#[derive(Debug, Clone)]
pub struct LinkExtractor {
    base_url: Url,
    guard: Guard,
    ready_timeout: Duration,
    locators: Arc<AggregationLocators>,
}

impl LinkExtractor {
    pub fn new(
        registry: &SelectorRegistry,
        guard: Guard,
        base_url: &Url,
        ready_timeout: Duration,
    ) -> Result<Self> {
        let get = |name| registry.get(Screen::LinksAggregation, name);
        let locators = AggregationLocators {
            container: get("container")?,
            section: get("section")?,
            subsection: get("subsection")?,
            subsection_title: get("subsection_title")?,
            detail_link: get("detail_link")?,
        };
        Ok(Self {
            base_url: base_url.clone(),
            guard,
            ready_timeout,
            locators: Arc::new(locators),
        })
    }

    /// Open the item's aggregation screen and list its detail links in
    /// discovery order. Zero links is `NoLinksFound`.
    pub async fn extract(
        &self,
        page: &mut dyn HeadlessPage,
        item: &SearchResultItem,
        cancel: &CancellationToken,
    ) -> Result<Vec<DetailLink>> {
        self.guard.navigate(page, &item.url, cancel).await?;

        let links = if wait_ready(page, &self.locators.container, self.ready_timeout, cancel).await? {
            let sections = page.find(&self.locators.section).await?;
            self.parse_sections(&sections)
        } else {
            debug!(url = %item.url, "aggregation container missing");
            Vec::new()
        };

        if links.is_empty() {
            return Err(ScoutError::NoLinksFound {
                url: item.url.clone(),
            });
        }
        info!(item = %item.label, links = links.len(), "detail links collected");
        Ok(links)
    }

    fn parse_sections(&self, sections: &[String]) -> Vec<DetailLink> {
        let mut seen = HashSet::new();
        let mut links = Vec::new();

        for html in sections {
            let fragment = Fragment::parse(html);
            let Some(root) = fragment.root() else {
                continue;
            };
            let section = root
                .value()
                .id()
                .map(|id| id.trim_start_matches("accordion-").to_string())
                .unwrap_or_else(|| format!("secao_{}", links.len()));

            let subsections: Vec<ElementRef<'_>> = fragment.select(&self.locators.subsection).collect();
            let found: Vec<(String, String)> = if subsections.is_empty() {
                let bare: Vec<ElementRef<'_>> = fragment.select(&self.locators.detail_link).collect();
                let single = bare.len() == 1;
                bare.into_iter()
                    .enumerate()
                    .filter_map(|(i, a)| {
                        let label = if single {
                            section.clone()
                        } else {
                            format!("{}_{}", section, i)
                        };
                        a.value().attr("href").map(|href| (label, href.to_string()))
                    })
                    .collect()
            } else {
                subsections
                    .into_iter()
                    .enumerate()
                    .filter_map(|(i, sub)| {
                        let href = sub
                            .select(self.locators.detail_link.selector())
                            .next()
                            .and_then(|a| a.value().attr("href"))?;
                        let label = sub
                            .select(self.locators.subsection_title.selector())
                            .next()
                            .map(clean_text)
                            .filter(|t| !t.is_empty())
                            .unwrap_or_else(|| format!("{}_{}", section, i));
                        Some((label, href.to_string()))
                    })
                    .collect()
            };

            for (label, href) in found {
                let Ok(url) = self.base_url.join(&href) else {
                    debug!(href = %href, "unparseable detail href skipped");
                    continue;
                };
                let url = url.to_string();
                if seen.insert(url.clone()) {
                    links.push(DetailLink {
                        label,
                        section: section.clone(),
                        url,
                    });
                }
            }
        }
        links
    }
}
