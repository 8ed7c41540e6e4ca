#![allow(dead_code)]

use std::sync::Arc;

use portal_scout::core::config::ScoutConfig;
use portal_scout::replay::{ReplayResponse, ReplaySite};
use portal_scout::{FilterSet, ScoutState, SearchQuery};

pub const BASE: &str = "https://portal.test";
pub const CPF: &str = "12345678909";
pub const OTHER_CPF: &str = "98765432100";

const AGGREGATION: &str = include_str!("../fixtures/aggregation.html");
const AGGREGATION_EMPTY: &str = include_str!("../fixtures/aggregation_empty.html");
const GRID_PAGE1: &str = include_str!("../fixtures/grid_page1.html");
const GRID_PAGE2: &str = include_str!("../fixtures/grid_page2.html");
const GRID_EMPTY: &str = include_str!("../fixtures/grid_empty.html");
const SANCTION: &str = include_str!("../fixtures/sanction.html");
pub const MAINTENANCE: &str = include_str!("../fixtures/maintenance.html");
pub const CAPTCHA: &str = include_str!("../fixtures/captcha.html");

pub fn init_logger() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// Fast guard settings and no politeness delay, so paused-clock tests
/// only ever wait on backoff.
pub fn config() -> ScoutConfig {
    let mut cfg = ScoutConfig {
        base_url: BASE.to_string(),
        cache_ttl_secs: 0,
        ..ScoutConfig::default()
    };
    cfg.guard.max_retries = 2;
    cfg.guard.initial_backoff_ms = 100;
    cfg.guard.max_backoff_ms = 1000;
    cfg.guard.navigation_timeout_ms = 2000;
    cfg.guard.ready_timeout_ms = 500;
    cfg.request_delay.min_ms = 0;
    cfg.request_delay.max_ms = 0;
    cfg
}

pub fn state(site: &ReplaySite) -> ScoutState {
    state_with(config(), site)
}

pub fn state_with(cfg: ScoutConfig, site: &ReplaySite) -> ScoutState {
    ScoutState::new(cfg, Arc::new(site.clone())).expect("fixture state")
}

pub fn query(term: &str, limit: usize) -> SearchQuery {
    SearchQuery::new(term, FilterSet::new(), limit).expect("fixture query")
}

pub fn search_url(term: &str, page: usize) -> String {
    let url = format!("{}/pessoa-fisica/busca/lista?termo={}", BASE, term);
    if page > 1 {
        format!("{}&pagina={}", url, page)
    } else {
        url
    }
}

pub fn item_url(id: u32) -> String {
    format!("{}/busca/pessoa-fisica/{}-pessoa-{}", BASE, id, id)
}

pub fn grid_url(id: u32) -> String {
    format!("{}/beneficios/bolsa-familia/{}", BASE, id)
}

pub fn sanction_url(id: u32) -> String {
    format!("{}/sancoes/consulta/{}", BASE, id)
}

/// One search list screen with a card per id.
pub fn search_page(ids: impl IntoIterator<Item = u32>, total: usize, has_next: bool) -> String {
    let cards: String = ids
        .into_iter()
        .map(|id| {
            format!(
                r#"<div class="br-item">
  <div class="col-sm-12"><a class="link-busca-nome" href="/busca/pessoa-fisica/{id}-pessoa-{id}">PESSOA {id}</a></div>
  <div class="col-sm-12">CPF: ***.456.789-**</div>
  <div class="col-sm-12">Tipo: Servidor</div>
</div>
"#,
                id = id
            )
        })
        .collect();
    let next = if has_next {
        r##"<li class="next"><a href="#">Próxima</a></li>"##
    } else {
        r##"<li class="next disabled"><a href="#">Próxima</a></li>"##
    };
    format!(
        r#"<!DOCTYPE html>
<html lang="pt-BR">
<head><title>Busca - Portal da Transparência</title></head>
<body>
<p>Foram encontrados <strong id="countResultados">{total}</strong> resultados</p>
<span id="resultados">
{cards}</span>
<ul class="pagination">{next}</ul>
</body>
</html>"#,
        total = total,
        cards = cards,
        next = next
    )
}

/// Search screen whose result list sits in a container the registry does not know.
pub fn drifted_search_page(ids: impl IntoIterator<Item = u32>, total: usize, has_next: bool) -> String {
    search_page(ids, total, has_next)
        .replace(r#"<span id="resultados">"#, r#"<div id="lista-pessoas">"#)
        .replace("</span>\n<ul", "</div>\n<ul")
}

/// `pages` search screens of `per_page` cards for `term`; ids start at 1.
pub fn with_search(site: ReplaySite, term: &str, pages: u32, per_page: u32) -> ReplaySite {
    let total = (pages * per_page) as usize;
    (1..=pages).fold(site, |site, p| {
        let first = (p - 1) * per_page + 1;
        site.page(
            &search_url(term, p as usize),
            search_page(first..first + per_page, total, p < pages),
        )
    })
}

/// Aggregation screen plus both detail screens for a person.
pub fn with_person(site: ReplaySite, id: u32) -> ReplaySite {
    let fill = |html: &str| html.replace("{id}", &id.to_string());
    site.page(&item_url(id), fill(AGGREGATION))
        .page(&grid_url(id), fill(GRID_PAGE1))
        .page(&format!("{}?pagina=2", grid_url(id)), fill(GRID_PAGE2))
        .page(&sanction_url(id), fill(SANCTION))
}

pub fn with_person_without_links(site: ReplaySite, id: u32) -> ReplaySite {
    site.page(&item_url(id), AGGREGATION_EMPTY.replace("{id}", &id.to_string()))
}

pub fn with_empty_grid(site: ReplaySite, id: u32) -> ReplaySite {
    let fill = |html: &str| html.replace("{id}", &id.to_string());
    site.page(&item_url(id), fill(AGGREGATION))
        .page(&grid_url(id), fill(GRID_EMPTY))
        .page(&sanction_url(id), fill(SANCTION))
}

/// The sanction screen renders neither a grid nor a key/value block.
pub fn with_unrecognised_sanction(site: ReplaySite, id: u32) -> ReplaySite {
    let fill = |html: &str| html.replace("{id}", &id.to_string());
    site.page(&item_url(id), fill(AGGREGATION))
        .page(&grid_url(id), fill(GRID_EMPTY))
        .page(&sanction_url(id), MAINTENANCE)
}

/// The grid screen answers every load with a captcha.
pub fn with_blocked_grid(site: ReplaySite, id: u32) -> ReplaySite {
    let fill = |html: &str| html.replace("{id}", &id.to_string());
    site.page(&item_url(id), fill(AGGREGATION))
        .respond(&grid_url(id), blocked())
        .page(&sanction_url(id), fill(SANCTION))
}

pub fn blocked() -> ReplayResponse {
    ReplayResponse::ok(CAPTCHA)
}
