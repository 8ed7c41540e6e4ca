//! Selector Registry: named element locators per screen.
//!
//! Every locator is parsed when the registry is built, and every component
//! resolves the names it needs when it is constructed, so a missing or
//! broken locator fails at start-up instead of in the middle of a crawl.
//! Locators are scoped by ids and structural paths; bare tag selectors are
//! only used relative to an already-scoped element.
//!
//! **Update process**: when the portal layout drifts, capture the page,
//! update the table below (or override in `portal-scout.json`), bump
//! `PORTAL_LAYOUT_VERSION`, and refresh the fixture under `tests/fixtures/`.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use scraper::Selector;
use serde::{Deserialize, Serialize};

use crate::core::error::{Result, ScoutError};

pub const PORTAL_LAYOUT_VERSION: &str = "2025.06";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Screen {
    Search,
    LinksAggregation,
    TabularDetail,
    QueryDetail,
    /// Captcha / challenge interstitials, used by the guard.
    Challenge,
}

impl Screen {
    pub const ALL: [Screen; 5] = [
        Screen::Search,
        Screen::LinksAggregation,
        Screen::TabularDetail,
        Screen::QueryDetail,
        Screen::Challenge,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Screen::Search => "search",
            Screen::LinksAggregation => "links_aggregation",
            Screen::TabularDetail => "tabular_detail",
            Screen::QueryDetail => "query_detail",
            Screen::Challenge => "challenge",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Screen::ALL.into_iter().find(|screen| screen.as_str() == s)
    }
}

impl fmt::Display for Screen {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed CSS locator.
#[derive(Debug, Clone)]
pub struct Locator {
    screen: Screen,
    name: String,
    css: String,
    selector: Selector,
}

impl Locator {
    pub fn parse(screen: Screen, name: &str, css: &str) -> Result<Self> {
        let selector = Selector::parse(css).map_err(|_| ScoutError::InvalidSelector {
            screen: screen.to_string(),
            name: name.to_string(),
            css: css.to_string(),
        })?;
        Ok(Self {
            screen,
            name: name.to_string(),
            css: css.to_string(),
            selector,
        })
    }

    pub fn screen(&self) -> Screen {
        self.screen
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn css(&self) -> &str {
        &self.css
    }

    pub fn selector(&self) -> &Selector {
        &self.selector
    }
}

/// Portal locator table: `(screen, name, css)`.
const PORTAL_LOCATORS: &[(Screen, &str, &str)] = &[
    // Search list
    (Screen::Search, "results_count", "#countResultados"),
    (Screen::Search, "results", "span#resultados"),
    (Screen::Search, "result_item", "span#resultados div.br-item"),
    (Screen::Search, "item_link", "a.link-busca-nome"),
    (Screen::Search, "item_info", "div.col-sm-12"),
    (Screen::Search, "next_page", "ul.pagination > li.next:not(.disabled) > a"),
    // Per-person aggregation screen ("ficha")
    (Screen::LinksAggregation, "container", "#accordion1"),
    (Screen::LinksAggregation, "section", "div[id^='accordion-']"),
    (Screen::LinksAggregation, "subsection", "div.box-ficha__subsecao"),
    (Screen::LinksAggregation, "subsection_title", "strong.box-ficha__titulo"),
    (Screen::LinksAggregation, "detail_link", "div.box-ficha__resultados > a.br-button"),
    // Grid ("consulta") detail screens
    (Screen::TabularDetail, "grid", "table#lista"),
    (Screen::TabularDetail, "header_cell", "thead > tr > th"),
    (Screen::TabularDetail, "row", "tbody > tr"),
    (Screen::TabularDetail, "cell", "td"),
    (Screen::TabularDetail, "cell_link", "a[href]"),
    (Screen::TabularDetail, "empty_row", "td.dataTables_empty"),
    (Screen::TabularDetail, "next_page", "#lista_paginate li.next:not(.disabled) > a[href]"),
    // Key/value detail screens
    (Screen::QueryDetail, "block", "section.dados-tabelados"),
    (Screen::QueryDetail, "field", "div.row > div[class^='col']"),
    (Screen::QueryDetail, "field_label", "strong"),
    (Screen::QueryDetail, "field_value", "span"),
    (Screen::QueryDetail, "detailed_section", "section.dados-detalhados"),
    (Screen::QueryDetail, "section_title", "button.header"),
    // Anti-automation interstitials
    (
        Screen::Challenge,
        "captcha",
        "iframe[src*='recaptcha'], iframe[src*='hcaptcha'], div.g-recaptcha, div.h-captcha",
    ),
    (
        Screen::Challenge,
        "challenge_form",
        "#challenge-form, iframe[src*='challenges.cloudflare.com']",
    ),
    (Screen::Challenge, "notice", "head > title, body > h1"),
];

/// Immutable, shareable table of locators. Built once at start-up.
#[derive(Debug, Clone)]
pub struct SelectorRegistry {
    version: String,
    entries: BTreeMap<(Screen, String), Arc<Locator>>,
}

impl SelectorRegistry {
    pub fn from_table(version: &str, table: &[(Screen, &str, &str)]) -> Result<Self> {
        let mut entries = BTreeMap::new();
        for (screen, name, css) in table {
            let locator = Locator::parse(*screen, name, css)?;
            entries.insert((*screen, name.to_string()), Arc::new(locator));
        }
        Ok(Self {
            version: version.to_string(),
            entries,
        })
    }

    /// The built-in table for the current portal layout.
    pub fn portal() -> Result<Self> {
        Self::from_table(PORTAL_LAYOUT_VERSION, PORTAL_LOCATORS)
    }

    /// Replace locators by `screen → name → css`. Only known names may be
    /// overridden; anything else is reported as `UnknownSelector`.
    pub fn with_overrides(
        mut self,
        overrides: &BTreeMap<String, BTreeMap<String, String>>,
    ) -> Result<Self> {
        if overrides.is_empty() {
            return Ok(self);
        }
        for (screen_name, names) in overrides {
            let screen = Screen::parse(screen_name).ok_or_else(|| ScoutError::UnknownSelector {
                screen: screen_name.clone(),
                name: "*".to_string(),
            })?;
            for (name, css) in names {
                let key = (screen, name.clone());
                if !self.entries.contains_key(&key) {
                    return Err(ScoutError::UnknownSelector {
                        screen: screen.to_string(),
                        name: name.clone(),
                    });
                }
                let locator = Locator::parse(screen, name, css)?;
                self.entries.insert(key, Arc::new(locator));
            }
        }
        self.version = format!("{}+local", self.version);
        Ok(self)
    }

    pub fn get(&self, screen: Screen, name: &str) -> Result<Arc<Locator>> {
        self.entries
            .get(&(screen, name.to_string()))
            .cloned()
            .ok_or_else(|| ScoutError::UnknownSelector {
                screen: screen.to_string(),
                name: name.to_string(),
            })
    }

    /// All locators registered for a screen, in name order.
    pub fn screen(&self, screen: Screen) -> Vec<Arc<Locator>> {
        self.entries
            .iter()
            .filter(|((s, _), _)| *s == screen)
            .map(|(_, l)| Arc::clone(l))
            .collect()
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn portal_table_parses() {
        let registry = SelectorRegistry::portal().unwrap();
        assert_eq!(registry.len(), PORTAL_LOCATORS.len());
        assert_eq!(registry.version(), PORTAL_LAYOUT_VERSION);
        assert_eq!(
            registry.get(Screen::Search, "result_item").unwrap().css(),
            "span#resultados div.br-item"
        );
        assert_eq!(registry.screen(Screen::Challenge).len(), 3);
    }

    #[test]
    fn unknown_name_fails_lookup() {
        let registry = SelectorRegistry::portal().unwrap();
        let err = registry.get(Screen::Search, "sidebar").unwrap_err();
        assert!(matches!(err, ScoutError::UnknownSelector { .. }));
    }

    #[test]
    fn broken_css_fails_at_build() {
        let err = SelectorRegistry::from_table("t", &[(Screen::Search, "results", "span[[")])
            .unwrap_err();
        assert!(matches!(err, ScoutError::InvalidSelector { .. }));
    }

    #[test]
    fn overrides_replace_known_names_only() {
        let mut screen = BTreeMap::new();
        screen.insert("results".to_string(), "div#lista-resultados".to_string());
        let mut overrides = BTreeMap::new();
        overrides.insert("search".to_string(), screen);

        let registry = SelectorRegistry::portal()
            .unwrap()
            .with_overrides(&overrides)
            .unwrap();
        assert_eq!(
            registry.get(Screen::Search, "results").unwrap().css(),
            "div#lista-resultados"
        );
        assert!(registry.version().ends_with("+local"));

        overrides
            .get_mut("search")
            .unwrap()
            .insert("footer".to_string(), "footer#rodape".to_string());
        let err = SelectorRegistry::portal()
            .unwrap()
            .with_overrides(&overrides)
            .unwrap_err();
        assert!(matches!(err, ScoutError::UnknownSelector { ref name, .. } if name == "footer"));
    }
}
