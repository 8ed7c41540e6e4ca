use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::error::{Result, ScoutError};
use crate::tools::filters;

/// The portal never lists more than this many results for one search.
pub const PORTAL_RESULT_CAP: usize = 200;

/// Which search screen a term belongs to. CPF and CNPJ share one shape and
/// are told apart by digit count only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PersonKind {
    Cpf,
    Cnpj,
}

impl PersonKind {
    /// Path segment of the portal's search screen for this kind.
    pub fn path(self) -> &'static str {
        match self {
            PersonKind::Cpf => "pessoa-fisica",
            PersonKind::Cnpj => "pessoa-juridica",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PersonKind::Cpf => "cpf",
            PersonKind::Cnpj => "cnpj",
        }
    }

    /// Infer the kind from a tax ID, ignoring `.`, `-`, `/` and spaces.
    pub fn infer(term: &str) -> Option<Self> {
        let mut digits = 0usize;
        for c in term.chars() {
            if c.is_ascii_digit() {
                digits += 1;
            } else if !matches!(c, '.' | '-' | '/' | ' ') {
                return None;
            }
        }
        match digits {
            11 => Some(PersonKind::Cpf),
            14 => Some(PersonKind::Cnpj),
            _ => None,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpf" | "pessoa-fisica" => Some(PersonKind::Cpf),
            "cnpj" | "pessoa-juridica" => Some(PersonKind::Cnpj),
            _ => None,
        }
    }
}

impl fmt::Display for PersonKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterValue {
    Flag(bool),
    Text(String),
    List(Vec<String>),
}

impl FilterValue {
    /// Parse a raw CLI-style value: `true`/`false` become flags, anything
    /// else stays text (the encoder knows which keys take lists).
    pub fn from_raw(raw: &str) -> Self {
        match raw.trim() {
            "true" => FilterValue::Flag(true),
            "false" => FilterValue::Flag(false),
            other => FilterValue::Text(other.to_string()),
        }
    }
}

/// Named filter flags for one search. Keys are the snake_case names of the
/// portal filter contract; ordering is by key so iteration is stable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FilterSet(BTreeMap<String, FilterValue>);

impl FilterSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: FilterValue) -> Self {
        self.insert(key, value);
        self
    }

    pub fn flag(self, key: impl Into<String>) -> Self {
        self.with(key, FilterValue::Flag(true))
    }

    pub fn insert(&mut self, key: impl Into<String>, value: FilterValue) {
        self.0.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&FilterValue> {
        self.0.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FilterValue)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Parse `key=value` pairs as given on the command line.
    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = &'a str>) -> Result<Self> {
        let mut set = FilterSet::new();
        for pair in pairs {
            let (key, value) = pair.split_once('=').ok_or_else(|| ScoutError::InvalidFilter {
                key: pair.to_string(),
                reason: "expected key=value".to_string(),
            })?;
            set.insert(key.trim(), FilterValue::from_raw(value));
        }
        Ok(set)
    }
}

/// A validated search request. Built once, never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchQuery {
    term: String,
    mode: PersonKind,
    filters: FilterSet,
    result_limit: usize,
}

impl SearchQuery {
    /// Build a query for a CPF or CNPJ, inferring the mode from digit count.
    pub fn new(term: &str, filters: FilterSet, result_limit: usize) -> Result<Self> {
        let mode = PersonKind::infer(term).ok_or_else(|| {
            ScoutError::InvalidQuery(format!(
                "`{}` is not a CPF (11 digits) or CNPJ (14 digits); pass a mode explicitly",
                term
            ))
        })?;
        Self::with_mode(term, mode, filters, result_limit)
    }

    /// Build a query with an explicit mode, e.g. for a name search.
    ///
    /// Filters are checked against the mode's contract here, so an
    /// unrecognised key is rejected before any page is opened.
    pub fn with_mode(
        term: &str,
        mode: PersonKind,
        filters: FilterSet,
        result_limit: usize,
    ) -> Result<Self> {
        if result_limit == 0 {
            return Err(ScoutError::InvalidQuery(
                "result limit must be at least 1".to_string(),
            ));
        }
        filters::encode(mode, &filters)?;
        Ok(Self {
            term: term.trim().to_string(),
            mode,
            filters,
            result_limit,
        })
    }

    pub fn term(&self) -> &str {
        &self.term
    }

    pub fn mode(&self) -> PersonKind {
        self.mode
    }

    pub fn filters(&self) -> &FilterSet {
        &self.filters
    }

    pub fn result_limit(&self) -> usize {
        self.result_limit
    }

    /// The limit actually honoured, after the portal's own cap.
    pub fn effective_limit(&self) -> usize {
        self.result_limit.min(PORTAL_RESULT_CAP)
    }
}

/// One card on the search screen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResultItem {
    /// Zero-based position in portal display order across pages.
    pub position: usize,
    pub label: String,
    pub portal_id: String,
    pub url: String,
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

/// A link from the aggregation screen to one detail screen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetailLink {
    /// Category label shown to the user (sub-section title or section name).
    pub label: String,
    /// The aggregation section the link was found in.
    pub section: String,
    pub url: String,
}

/// Value of a key/value field. `Empty` is a field the screen shows with
/// no value; a field the screen does not show is simply absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Text(String),
    Empty,
}

impl FieldValue {
    pub fn from_text(text: &str) -> Self {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            FieldValue::Empty
        } else {
            FieldValue::Text(trimmed.to_string())
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            FieldValue::Empty => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabularDetail {
    pub category: String,
    pub source_url: String,
    /// Header labels in column order.
    pub columns: Vec<String>,
    pub rows: Vec<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryDetail {
    pub category: String,
    pub source_url: String,
    pub fields: BTreeMap<String, FieldValue>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "layout", rename_all = "lowercase")]
pub enum DetailRecord {
    Tabular(TabularDetail),
    Query(QueryDetail),
}

impl DetailRecord {
    pub fn category(&self) -> &str {
        match self {
            DetailRecord::Tabular(t) => &t.category,
            DetailRecord::Query(q) => &q.category,
        }
    }

    pub fn source_url(&self) -> &str {
        match self {
            DetailRecord::Tabular(t) => &t.source_url,
            DetailRecord::Query(q) => &q.source_url,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    Captcha,
    RateLimit,
    Unknown,
}

impl fmt::Display for BlockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BlockKind::Captcha => "captcha",
            BlockKind::RateLimit => "rate_limit",
            BlockKind::Unknown => "unknown",
        })
    }
}

/// A detected anti-automation response. Only lives inside the guard's
/// retry decision and the log stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockEvent {
    pub kind: BlockKind,
    pub url: String,
    pub at: DateTime<Utc>,
    pub attempt: u32,
}

/// How far a run goes past the search screen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultScope {
    /// Search items only, no aggregation or detail screens.
    SearchOnly,
    /// Every detail category the portal offers.
    Full,
    /// Only detail links whose label or section is in the set.
    Categories(BTreeSet<String>),
}

impl ResultScope {
    pub fn visits_details(&self) -> bool {
        !matches!(self, ResultScope::SearchOnly)
    }

    pub fn admits(&self, link: &DetailLink) -> bool {
        match self {
            ResultScope::SearchOnly => false,
            ResultScope::Full => true,
            ResultScope::Categories(set) => {
                set.contains(&link.label) || set.contains(&link.section)
            }
        }
    }

    pub fn cache_key(&self) -> String {
        match self {
            ResultScope::SearchOnly => "search".to_string(),
            ResultScope::Full => "full".to_string(),
            ResultScope::Categories(set) => {
                format!("only:{}", set.iter().cloned().collect::<Vec<_>>().join("|"))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Search,
    Links,
    Detail,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialFailure {
    pub stage: Stage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub url: String,
    pub kind: String,
    pub message: String,
}

impl PartialFailure {
    pub fn new(stage: Stage, url: &str, label: Option<&str>, err: &ScoutError) -> Self {
        Self {
            stage,
            label: label.map(str::to_string),
            url: url.to_string(),
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemResult {
    pub item: SearchResultItem,
    #[serde(default)]
    pub links: Vec<DetailLink>,
    #[serde(default)]
    pub records: Vec<DetailRecord>,
}

/// Everything one run produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultEnvelope {
    pub run_id: Uuid,
    pub term: String,
    pub mode: PersonKind,
    pub search_url: String,
    pub scope: ResultScope,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub items: Vec<ItemResult>,
    pub partial_failures: Vec<PartialFailure>,
}

impl ResultEnvelope {
    pub fn record_count(&self) -> usize {
        self.items.iter().map(|i| i.records.len()).sum()
    }

    pub fn is_degraded(&self) -> bool {
        !self.partial_failures.is_empty()
    }
}
