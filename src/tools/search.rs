//! Search Navigator: loads the search list, reads result cards and pages
//! forward until the result limit, the last page, or a block that the
//! guard could not get past.

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::core::error::{Result, ScoutError};
use crate::core::types::{PartialFailure, SearchQuery, SearchResultItem, Stage};
use crate::features::guard::{sleep_or_cancel, wait_ready, Guard};
use crate::scraping::page::{clean_text, normalize_key, Fragment, HeadlessPage};
use crate::scraping::selectors::{Locator, Screen, SelectorRegistry};
use crate::tools::filters;

/// Items collected by one search, plus why paging stopped early (if it did).
#[derive(Debug, Clone, Default)]
pub struct SearchOutcome {
    pub items: Vec<SearchResultItem>,
    /// Total announced by the count banner, when it could be read.
    pub total: Option<usize>,
    pub pages_visited: usize,
    pub interrupted: Option<PartialFailure>,
}

#[derive(Debug)]
struct SearchLocators {
    count: Arc<Locator>,
    results: Arc<Locator>,
    item: Arc<Locator>,
    item_link: Arc<Locator>,
    item_info: Arc<Locator>,
    next_page: Arc<Locator>,
}

#[derive(Debug, Clone)]
pub struct SearchNavigator {
    base_url: Url,
    guard: Guard,
    ready_timeout: Duration,
    locators: Arc<SearchLocators>,
}

impl SearchNavigator {
    pub fn new(
        registry: &SelectorRegistry,
        guard: Guard,
        base_url: &Url,
        ready_timeout: Duration,
    ) -> Result<Self> {
        let get = |name| registry.get(Screen::Search, name);
        let locators = SearchLocators {
            count: get("results_count")?,
            results: get("results")?,
            item: get("result_item")?,
            item_link: get("item_link")?,
            item_info: get("item_info")?,
            next_page: get("next_page")?,
        };
        Ok(Self {
            base_url: base_url.clone(),
            guard,
            ready_timeout,
            locators: Arc::new(locators),
        })
    }

    /// Collect up to `query.effective_limit()` items in portal order.
    ///
    /// A guard failure on the first page fails the search; on a later page
    /// it ends paging and the items already read are returned. A list that
    /// never renders is handled the same way, except that a first page whose
    /// count banner reads zero is a genuine empty result.
    pub async fn collect(
        &self,
        page: &mut dyn HeadlessPage,
        query: &SearchQuery,
        cancel: &CancellationToken,
    ) -> Result<SearchOutcome> {
        let limit = query.effective_limit();
        let mut outcome = SearchOutcome::default();
        let mut page_no = 1usize;

        loop {
            let url = filters::search_url(self.base_url.as_str(), query, page_no)?;
            match self.guard.navigate(page, &url, cancel).await {
                Ok(_) => {}
                Err(e @ ScoutError::RetryExhausted { .. }) if page_no > 1 => {
                    warn!(stage = "search", url = %url, error = %e, "search paging interrupted");
                    outcome.interrupted = Some(PartialFailure::new(Stage::Search, &url, None, &e));
                    break;
                }
                Err(e) => return Err(e),
            }
            outcome.pages_visited = page_no;

            if !wait_ready(page, &self.locators.results, self.ready_timeout, cancel).await? {
                if page_no > 1 {
                    let e = ScoutError::UnknownLayout { url: url.clone() };
                    warn!(stage = "search", url = %url, "search list did not render");
                    outcome.interrupted = Some(PartialFailure::new(Stage::Search, &url, None, &e));
                    break;
                }
                // Without a list only a zero banner tells "no results" apart from a changed layout.
                outcome.total = self.read_count(page, cancel).await?;
                if outcome.total == Some(0) {
                    info!(term = query.term(), "search returned no results");
                    break;
                }
                warn!(url = %url, total = ?outcome.total, "search list did not render");
                return Err(ScoutError::UnknownLayout { url });
            }

            if page_no == 1 {
                outcome.total = self.read_count(page, cancel).await?;
                if outcome.total == Some(0) {
                    info!(term = query.term(), "search returned no results");
                    break;
                }
            }

            let cards = page.find(&self.locators.item).await?;
            let parsed = self.parse_cards(&cards, outcome.items.len());
            let read = parsed.len();
            for item in parsed {
                if outcome.items.len() >= limit {
                    break;
                }
                outcome.items.push(item);
            }
            debug!(page = page_no, read, total = outcome.items.len(), "search page read");

            if outcome.items.len() >= limit || read == 0 {
                break;
            }
            if outcome.total.is_some_and(|t| outcome.items.len() >= t) {
                break;
            }
            if page.find(&self.locators.next_page).await?.is_empty() {
                break;
            }
            page_no += 1;
        }

        info!(
            term = query.term(),
            items = outcome.items.len(),
            pages = outcome.pages_visited,
            "search finished"
        );
        Ok(outcome)
    }

    /// Read the count banner. The banner shows a placeholder while the
    /// list is still loading; that case is re-read once after a pause.
    async fn read_count(
        &self,
        page: &dyn HeadlessPage,
        cancel: &CancellationToken,
    ) -> Result<Option<usize>> {
        for round in 0..2 {
            let banner = page
                .find(&self.locators.count)
                .await?
                .first()
                .map(|html| Fragment::parse(html).text());
            let Some(banner) = banner else {
                return Ok(None);
            };
            if let Some(n) = parse_count(&banner) {
                return Ok(Some(n));
            }
            if round == 0 {
                sleep_or_cancel(self.ready_timeout / 5, cancel).await?;
            }
        }
        Ok(None)
    }

    fn parse_cards(&self, cards: &[String], offset: usize) -> Vec<SearchResultItem> {
        let mut items = Vec::with_capacity(cards.len());
        for html in cards {
            let card = Fragment::parse(html);
            let Some(link) = card.first(&self.locators.item_link) else {
                debug!("search card without link skipped");
                continue;
            };
            let Some(url) = link
                .value()
                .attr("href")
                .and_then(|href| self.base_url.join(href).ok())
            else {
                continue;
            };
            let label = clean_text(link);

            let mut fields = BTreeMap::new();
            for info in card.select(&self.locators.item_info) {
                let line = clean_text(info);
                if let Some((key, value)) = line.split_once(':') {
                    let key = normalize_key(key);
                    let value = value.trim();
                    if !key.is_empty() && !value.is_empty() {
                        fields.insert(key, value.to_string());
                    }
                }
            }

            items.push(SearchResultItem {
                position: offset + items.len(),
                portal_id: portal_id(&url),
                label,
                url: url.to_string(),
                fields,
            });
        }
        items
    }
}

fn count_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\d{1,3}(?:\.\d{3})+|\d+").expect("valid count pattern"))
}

/// First number in the count banner, `1.234` style separators allowed.
pub fn parse_count(banner: &str) -> Option<usize> {
    count_re()
        .find(banner)
        .and_then(|m| m.as_str().replace('.', "").parse().ok())
}

/// Opaque portal id of a result: the `id` query parameter when present,
/// otherwise the leading token of the last path segment
/// (`/busca/pessoa-fisica/7419128-maria-silva` → `7419128`).
pub fn portal_id(url: &Url) -> String {
    if let Some((_, id)) = url.query_pairs().find(|(k, _)| k == "id") {
        return id.into_owned();
    }
    url.path_segments()
        .and_then(|mut segments| segments.next_back())
        .and_then(|last| last.split('-').next())
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_count_banner() {
        assert_eq!(parse_count("Foram encontrados 1.234 resultados"), Some(1234));
        assert_eq!(parse_count("15 resultados"), Some(15));
        assert_eq!(parse_count("0 resultados"), Some(0));
        assert_eq!(parse_count("Carregando..."), None);
    }

    #[test]
    fn portal_id_from_path_or_query() {
        let by_path = Url::parse("https://portal.test/busca/pessoa-fisica/7419128-maria-silva").unwrap();
        assert_eq!(portal_id(&by_path), "7419128");
        let foreign =
            Url::parse("https://portal.test/busca/pessoa-juridica/ESTRANG0022309-cto-events").unwrap();
        assert_eq!(portal_id(&foreign), "ESTRANG0022309");
        let by_query = Url::parse("https://portal.test/busca/pessoa-fisica/x?id=42").unwrap();
        assert_eq!(portal_id(&by_query), "42");
    }

    #[test]
    fn cards_become_items() {
        let registry = SelectorRegistry::portal().unwrap();
        let guard = Guard::new(Default::default(), &registry).unwrap();
        let base = Url::parse("https://portal.test").unwrap();
        let nav = SearchNavigator::new(&registry, guard, &base, Duration::from_millis(10)).unwrap();

        let card = r#"<div class="br-item">
            <div class="col-sm-12"><a class="link-busca-nome" href="/busca/pessoa-fisica/7419128-maria-silva">MARIA  SILVA</a></div>
            <div class="col-sm-12">CPF: ***.456.789-**</div>
            <div class="col-sm-12">Tipo de Vínculo: Servidor</div>
        </div>"#;
        let items = nav.parse_cards(&[card.to_string()], 5);
        assert_eq!(items.len(), 1);
        let item = &items[0];
        assert_eq!(item.position, 5);
        assert_eq!(item.label, "MARIA SILVA");
        assert_eq!(item.portal_id, "7419128");
        assert_eq!(item.url, "https://portal.test/busca/pessoa-fisica/7419128-maria-silva");
        assert_eq!(item.fields["cpf"], "***.456.789-**");
        assert_eq!(item.fields["tipo_de_vínculo"], "Servidor");
    }
}
