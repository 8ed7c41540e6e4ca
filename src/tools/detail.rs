//! Detail Extractor.
//!
//! A detail screen is either a grid (`TabularDetail`) or a key/value sheet
//! (`QueryDetail`). The variant is decided once per screen by a structural
//! probe: a grid container means tabular, a key/value block means query,
//! neither means `UnknownLayout`. Text content never decides the layout.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use scraper::ElementRef;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

use crate::core::error::{Result, ScoutError};
use crate::core::types::{DetailLink, DetailRecord, FieldValue, QueryDetail, TabularDetail};
use crate::features::guard::{sleep_or_cancel, wait_ready, Guard};
use crate::scraping::page::{clean_text, normalize_key, Fragment, HeadlessPage};
use crate::scraping::selectors::{Locator, Screen, SelectorRegistry};

const PROBE_POLL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    Tabular,
    Query,
}

#[derive(Debug)]
struct TabularLocators {
    grid: Arc<Locator>,
    header_cell: Arc<Locator>,
    row: Arc<Locator>,
    cell: Arc<Locator>,
    cell_link: Arc<Locator>,
    empty_row: Arc<Locator>,
    next_page: Arc<Locator>,
}

#[derive(Debug)]
struct QueryLocators {
    block: Arc<Locator>,
    field: Arc<Locator>,
    field_label: Arc<Locator>,
    field_value: Arc<Locator>,
    detailed_section: Arc<Locator>,
    section_title: Arc<Locator>,
}

#[derive(Debug, Clone)]
pub struct DetailExtractor {
    base_url: Url,
    guard: Guard,
    ready_timeout: Duration,
    max_pages: usize,
    tabular: Arc<TabularLocators>,
    query: Arc<QueryLocators>,
}

impl DetailExtractor {
    pub fn new(
        registry: &SelectorRegistry,
        guard: Guard,
        base_url: &Url,
        ready_timeout: Duration,
        max_pages: usize,
    ) -> Result<Self> {
        let tab = |name| registry.get(Screen::TabularDetail, name);
        let tabular = TabularLocators {
            grid: tab("grid")?,
            header_cell: tab("header_cell")?,
            row: tab("row")?,
            cell: tab("cell")?,
            cell_link: tab("cell_link")?,
            empty_row: tab("empty_row")?,
            next_page: tab("next_page")?,
        };
        let kv = |name| registry.get(Screen::QueryDetail, name);
        let query = QueryLocators {
            block: kv("block")?,
            field: kv("field")?,
            field_label: kv("field_label")?,
            field_value: kv("field_value")?,
            detailed_section: kv("detailed_section")?,
            section_title: kv("section_title")?,
        };
        Ok(Self {
            base_url: base_url.clone(),
            guard,
            ready_timeout,
            max_pages: max_pages.max(1),
            tabular: Arc::new(tabular),
            query: Arc::new(query),
        })
    }

    pub async fn extract(
        &self,
        page: &mut dyn HeadlessPage,
        link: &DetailLink,
        cancel: &CancellationToken,
    ) -> Result<DetailRecord> {
        self.guard.navigate(page, &link.url, cancel).await?;

        let record = match self.probe(page, cancel).await? {
            Some(Layout::Tabular) => DetailRecord::Tabular(self.read_tabular(page, link, cancel).await?),
            Some(Layout::Query) => DetailRecord::Query(self.read_query(page, link).await?),
            None => {
                return Err(ScoutError::UnknownLayout {
                    url: link.url.clone(),
                })
            }
        };
        info!(category = %link.label, url = %link.url, layout = ?self.layout_of(&record), "detail extracted");
        Ok(record)
    }

    fn layout_of(&self, record: &DetailRecord) -> Layout {
        match record {
            DetailRecord::Tabular(_) => Layout::Tabular,
            DetailRecord::Query(_) => Layout::Query,
        }
    }

    /// Poll for either structural marker until the ready timeout.
    async fn probe(&self, page: &dyn HeadlessPage, cancel: &CancellationToken) -> Result<Option<Layout>> {
        let deadline = tokio::time::Instant::now() + self.ready_timeout;
        loop {
            if !page.find(&self.tabular.grid).await?.is_empty() {
                return Ok(Some(Layout::Tabular));
            }
            if !page.find(&self.query.block).await?.is_empty() {
                return Ok(Some(Layout::Query));
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            sleep_or_cancel(PROBE_POLL.min(deadline - now), cancel).await?;
        }
    }

    async fn read_tabular(
        &self,
        page: &mut dyn HeadlessPage,
        link: &DetailLink,
        cancel: &CancellationToken,
    ) -> Result<TabularDetail> {
        let mut detail = TabularDetail {
            category: link.label.clone(),
            source_url: link.url.clone(),
            columns: Vec::new(),
            rows: Vec::new(),
        };
        let mut visited = HashSet::from([link.url.clone()]);

        for page_no in 1..=self.max_pages {
            let Some(grid) = page.find(&self.tabular.grid).await?.into_iter().next() else {
                break;
            };
            let (columns, rows) = self.parse_grid(&grid);
            if detail.columns.is_empty() {
                detail.columns = columns;
            }
            detail.rows.extend(rows);

            if page_no == self.max_pages {
                break;
            }
            let next = page
                .find(&self.tabular.next_page)
                .await?
                .first()
                .and_then(|html| self.href_of(html));
            let Some(next) = next.filter(|url| visited.insert(url.clone())) else {
                break;
            };
            debug!(url = %next, page = page_no + 1, "following grid page");
            self.guard.navigate(page, &next, cancel).await?;
            if !wait_ready(page, &self.tabular.grid, self.ready_timeout, cancel).await? {
                break;
            }
        }
        Ok(detail)
    }

    fn href_of(&self, html: &str) -> Option<String> {
        let fragment = Fragment::parse(html);
        let href = fragment.root()?.value().attr("href")?;
        if href.starts_with('#') || href.starts_with("javascript:") {
            return None;
        }
        self.base_url.join(href).ok().map(|u| u.to_string())
    }

    /// Header labels and row mappings of one grid page. Cells are matched to
    /// headers by position; the "no records" placeholder row is skipped.
    fn parse_grid(&self, grid: &str) -> (Vec<String>, Vec<BTreeMap<String, String>>) {
        let fragment = Fragment::parse(grid);
        let columns: Vec<String> = fragment
            .select(&self.tabular.header_cell)
            .enumerate()
            .map(|(i, th)| {
                let label = clean_text(th);
                if label.is_empty() {
                    format!("col_{}", i)
                } else {
                    label
                }
            })
            .collect();

        let mut rows = Vec::new();
        for tr in fragment.select(&self.tabular.row) {
            if tr.select(self.tabular.empty_row.selector()).next().is_some() {
                continue;
            }
            let mut row = BTreeMap::new();
            for (i, td) in tr.select(self.tabular.cell.selector()).enumerate() {
                let key = columns.get(i).cloned().unwrap_or_else(|| format!("col_{}", i));
                row.insert(key, self.cell_value(td));
            }
            if !row.is_empty() {
                rows.push(row);
            }
        }
        (columns, rows)
    }

    fn cell_value(&self, td: ElementRef<'_>) -> String {
        td.select(self.tabular.cell_link.selector())
            .next()
            .and_then(|a| a.value().attr("href"))
            .filter(|href| !href.starts_with('#') && !href.starts_with("javascript:"))
            .and_then(|href| self.base_url.join(href).ok())
            .map(|u| u.to_string())
            .unwrap_or_else(|| clean_text(td))
    }

    async fn read_query(&self, page: &dyn HeadlessPage, link: &DetailLink) -> Result<QueryDetail> {
        let blocks = page.find(&self.query.block).await?;
        let sections = page.find(&self.query.detailed_section).await?;
        Ok(QueryDetail {
            category: link.label.clone(),
            source_url: link.url.clone(),
            fields: self.parse_fields(&blocks, &sections),
        })
    }

    /// Key/value pairs from the main blocks plus the detailed sections
    /// (keyed `{section}.{field}`). A label with an empty value is kept
    /// as `FieldValue::Empty`.
    fn parse_fields(&self, blocks: &[String], sections: &[String]) -> BTreeMap<String, FieldValue> {
        let mut fields = BTreeMap::new();
        for html in blocks {
            let fragment = Fragment::parse(html);
            for field in fragment.select(&self.query.field) {
                if let Some((key, value)) = self.field_pair(field) {
                    fields.insert(key, value);
                }
            }
        }
        for (i, html) in sections.iter().enumerate() {
            let fragment = Fragment::parse(html);
            let title = fragment
                .first(&self.query.section_title)
                .map(|el| normalize_key(&clean_text(el)))
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| format!("secao_{}", i));
            for field in fragment.select(&self.query.field) {
                if let Some((key, value)) = self.field_pair(field) {
                    fields.insert(format!("{}.{}", title, key), value);
                }
            }
        }
        fields
    }

    fn field_pair(&self, field: ElementRef<'_>) -> Option<(String, FieldValue)> {
        let label = field.select(self.query.field_label.selector()).next()?;
        let key = normalize_key(&clean_text(label));
        if key.is_empty() {
            return None;
        }
        let value = field
            .select(self.query.field_value.selector())
            .next()
            .map(|v| FieldValue::from_text(&clean_text(v)))
            .unwrap_or(FieldValue::Empty);
        Some((key, value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extractor() -> DetailExtractor {
        let registry = SelectorRegistry::portal().unwrap();
        let guard = Guard::new(Default::default(), &registry).unwrap();
        let base = Url::parse("https://portal.test").unwrap();
        DetailExtractor::new(&registry, guard, &base, Duration::from_millis(10), 5).unwrap()
    }

    #[test]
    fn grid_rows_map_headers_by_position() {
        let grid = r##"<table id="lista">
            <thead><tr><th>Mês</th><th>Valor</th><th></th></tr></thead>
            <tbody>
              <tr><td>01/2024</td><td>R$ 600,00</td><td><a href="/beneficios/1">Detalhar</a></td></tr>
              <tr><td>02/2024</td><td>R$ 650,00</td><td><a href="#">-</a></td></tr>
            </tbody>
        </table>"##;
        let (columns, rows) = extractor().parse_grid(grid);
        assert_eq!(columns, vec!["Mês", "Valor", "col_2"]);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["Valor"], "R$ 600,00");
        assert_eq!(rows[0]["col_2"], "https://portal.test/beneficios/1");
        assert_eq!(rows[1]["col_2"], "-");
    }

    #[test]
    fn placeholder_row_is_skipped() {
        let grid = r#"<table id="lista">
            <thead><tr><th>Mês</th></tr></thead>
            <tbody><tr><td class="dataTables_empty" colspan="3">Nenhum registro encontrado</td></tr></tbody>
        </table>"#;
        let (columns, rows) = extractor().parse_grid(grid);
        assert_eq!(columns, vec!["Mês"]);
        assert!(rows.is_empty());
    }

    #[test]
    fn fields_keep_empty_and_prefix_sections() {
        let block = r#"<section class="dados-tabelados"><div class="row">
            <div class="col-xs-12 col-sm-4"><strong>Nome</strong><span> ANA SOUZA </span></div>
            <div class="col-xs-12 col-sm-4"><strong>Órgão Sancionador</strong><span>  </span></div>
            <div class="col-xs-12 col-sm-4"><strong>Cargo</strong></div>
        </div></section>"#;
        let section = r#"<section class="dados-detalhados">
            <button class="header">Fundamentação Legal</button>
            <div class="row"><div class="col-sm-6"><strong>Lei</strong><span>8.666/93</span></div></div>
        </section>"#;
        let fields = extractor().parse_fields(&[block.to_string()], &[section.to_string()]);
        assert_eq!(fields["nome"], FieldValue::Text("ANA SOUZA".into()));
        assert_eq!(fields["órgão_sancionador"], FieldValue::Empty);
        assert_eq!(fields["cargo"], FieldValue::Empty);
        assert_eq!(fields["fundamentação_legal.lei"], FieldValue::Text("8.666/93".into()));
        assert!(!fields.contains_key("cpf"));
    }
}
