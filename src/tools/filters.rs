//! Filter Encoder: structured filter options → portal query-string grammar.
//!
//! Filtering is done by building the search URL directly instead of
//! clicking the on-page filter panel. Each mode has a fixed contract of
//! recognised keys; anything else is rejected with `InvalidFilter` before a
//! page is opened. Output is byte-stable for equal inputs (keys are emitted
//! in sorted order), which the result cache and the fixture tests rely on.

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use regex::Regex;
use std::sync::OnceLock;

use crate::core::error::{Result, ScoutError};
use crate::core::types::{FilterSet, FilterValue, PersonKind, SearchQuery};

/// Characters escaped inside a query-string value. `,` is left alone: the
/// portal reads comma-joined code lists literally.
const QUERY_VALUE: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'&')
    .add(b'+')
    .add(b'<')
    .add(b'=')
    .add(b'>')
    .add(b'?');

#[derive(Debug, Clone, Copy)]
pub enum ParamKind {
    /// Boolean flag; only `true` is ever sent.
    Flag,
    /// One of a closed set of `(name, code)` pairs. The first entry is the
    /// portal default and is never sent.
    Choice(&'static [(&'static str, &'static str)]),
    /// Any subset of a closed set, comma-joined.
    Choices(&'static [(&'static str, &'static str)]),
    /// Two-letter state code.
    Uf,
    /// Seven-digit IBGE municipality code.
    Municipio,
    /// Decimal amount.
    Amount,
}

#[derive(Debug, Clone, Copy)]
pub struct FilterSpec {
    pub key: &'static str,
    pub kind: ParamKind,
}

const NATUREZA_JURIDICA: &[(&str, &str)] = &[
    ("todos", "0"),
    ("administracao_publica", "1"),
    ("entidades_empresariais", "2"),
    ("entidades_sem_fins_lucro", "3"),
    ("organizacao_internacional", "4"),
];

const GRUPO_OBJETO: &[(&str, &str)] = &[
    ("obras", "1"),
    ("servicos", "2"),
    ("bens_patrimoniais", "3"),
    ("materiais", "4"),
    ("outros", "99"),
];

const CPF_FILTERS: &[FilterSpec] = &[
    FilterSpec { key: "servidor_publico", kind: ParamKind::Flag },
    FilterSpec { key: "beneficiario_programa_social", kind: ParamKind::Flag },
    FilterSpec { key: "portador_cpgf", kind: ParamKind::Flag },
    FilterSpec { key: "portador_cpdc", kind: ParamKind::Flag },
    FilterSpec { key: "sancao_vigente", kind: ParamKind::Flag },
    FilterSpec { key: "ocupante_imovel_funcional", kind: ParamKind::Flag },
    FilterSpec { key: "possui_contrato", kind: ParamKind::Flag },
    FilterSpec { key: "favorecido_recurso", kind: ParamKind::Flag },
    FilterSpec { key: "emitente_nfe", kind: ParamKind::Flag },
];

const CNPJ_FILTERS: &[FilterSpec] = &[
    FilterSpec { key: "tipo_natureza_juridica", kind: ParamKind::Choice(NATUREZA_JURIDICA) },
    FilterSpec { key: "uf_pessoa_juridica", kind: ParamKind::Uf },
    FilterSpec { key: "municipio", kind: ParamKind::Municipio },
    FilterSpec { key: "valor_gastos_diretos_de", kind: ParamKind::Amount },
    FilterSpec { key: "valor_gastos_diretos_ate", kind: ParamKind::Amount },
    FilterSpec { key: "valor_transferencia_de", kind: ParamKind::Amount },
    FilterSpec { key: "valor_transferencia_ate", kind: ParamKind::Amount },
    FilterSpec { key: "sancao_vigente", kind: ParamKind::Flag },
    FilterSpec { key: "emitente_nfe", kind: ParamKind::Flag },
    FilterSpec { key: "grupo_objeto", kind: ParamKind::Choices(GRUPO_OBJETO) },
];

/// Recognised filter keys for a search mode.
pub fn contract(mode: PersonKind) -> &'static [FilterSpec] {
    match mode {
        PersonKind::Cpf => CPF_FILTERS,
        PersonKind::Cnpj => CNPJ_FILTERS,
    }
}

fn spec_for(mode: PersonKind, key: &str) -> Option<&'static FilterSpec> {
    contract(mode).iter().find(|s| s.key == key)
}

/// Portal parameter name for a filter key: `servidor_publico` → `servidorPublico`.
pub fn param_name(key: &str) -> String {
    key.split('_')
        .filter(|w| !w.is_empty())
        .enumerate()
        .map(|(i, word)| {
            if i == 0 {
                word.to_string()
            } else {
                let mut chars = word.chars();
                match chars.next() {
                    Some(first) => first.to_uppercase().chain(chars).collect(),
                    None => String::new(),
                }
            }
        })
        .collect()
}

fn amount_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d+(?:[.,]\d{1,2})?$").expect("valid amount pattern"))
}

fn invalid(key: &str, reason: impl Into<String>) -> ScoutError {
    ScoutError::InvalidFilter {
        key: key.to_string(),
        reason: reason.into(),
    }
}

fn text_of<'a>(key: &str, value: &'a FilterValue) -> Result<&'a str> {
    match value {
        FilterValue::Text(s) => Ok(s.trim()),
        FilterValue::Flag(_) => Err(invalid(key, "expected a value, got a boolean")),
        FilterValue::List(_) => Err(invalid(key, "expected a single value, got a list")),
    }
}

fn lookup_choice(
    key: &str,
    table: &'static [(&'static str, &'static str)],
    raw: &str,
) -> Result<(&'static str, &'static str)> {
    let raw = raw.trim().to_ascii_lowercase();
    table
        .iter()
        .copied()
        .find(|(name, code)| *name == raw || *code == raw)
        .ok_or_else(|| invalid(key, format!("`{}` is not one of the accepted values", raw)))
}

/// Canonical form of one value, or `None` when it equals the portal default
/// and must not be sent. Returns `(canonical value, encoded portal value)`.
fn canonicalize(spec: &FilterSpec, value: &FilterValue) -> Result<Option<(FilterValue, String)>> {
    let key = spec.key;
    match spec.kind {
        ParamKind::Flag => match value {
            FilterValue::Flag(true) => Ok(Some((FilterValue::Flag(true), "true".to_string()))),
            FilterValue::Flag(false) => Ok(None),
            FilterValue::Text(s) if s.trim() == "true" => {
                Ok(Some((FilterValue::Flag(true), "true".to_string())))
            }
            FilterValue::Text(s) if s.trim() == "false" => Ok(None),
            _ => Err(invalid(key, "expected true or false")),
        },
        ParamKind::Choice(table) => {
            let (name, code) = lookup_choice(key, table, text_of(key, value)?)?;
            if table.first().map(|(n, _)| *n) == Some(name) {
                return Ok(None);
            }
            Ok(Some((FilterValue::Text(name.to_string()), code.to_string())))
        }
        ParamKind::Choices(table) => {
            let raw: Vec<String> = match value {
                FilterValue::List(items) => items.clone(),
                FilterValue::Text(s) => s.split(',').map(str::to_string).collect(),
                FilterValue::Flag(_) => return Err(invalid(key, "expected a list of values")),
            };
            let mut picked: Vec<(&'static str, &'static str)> = Vec::new();
            for item in raw.iter().filter(|s| !s.trim().is_empty()) {
                let choice = lookup_choice(key, table, item)?;
                if !picked.contains(&choice) {
                    picked.push(choice);
                }
            }
            if picked.is_empty() {
                return Ok(None);
            }
            // Table order, so equal sets encode identically.
            picked.sort_by_key(|c| table.iter().position(|t| t == c));
            let names = picked.iter().map(|(n, _)| n.to_string()).collect();
            let codes = picked.iter().map(|(_, c)| *c).collect::<Vec<_>>().join(",");
            Ok(Some((FilterValue::List(names), codes)))
        }
        ParamKind::Uf => {
            let raw = text_of(key, value)?;
            if raw.len() != 2 || !raw.chars().all(|c| c.is_ascii_alphabetic()) {
                return Err(invalid(key, "expected a two-letter state code"));
            }
            let uf = raw.to_ascii_uppercase();
            Ok(Some((FilterValue::Text(uf.clone()), uf)))
        }
        ParamKind::Municipio => {
            let raw = text_of(key, value)?;
            if raw.len() != 7 || !raw.chars().all(|c| c.is_ascii_digit()) {
                return Err(invalid(key, "expected a seven-digit IBGE code"));
            }
            Ok(Some((FilterValue::Text(raw.to_string()), raw.to_string())))
        }
        ParamKind::Amount => {
            let raw = text_of(key, value)?;
            if !amount_re().is_match(raw) {
                return Err(invalid(key, "expected a decimal amount"));
            }
            let amount = raw.replace(',', ".");
            Ok(Some((FilterValue::Text(amount.clone()), amount)))
        }
    }
}

/// Canonical filter set for a mode: defaults dropped, choice codes turned
/// into names, state codes upper-cased. `decode(encode(x)) == normalize(x)`.
pub fn normalize(mode: PersonKind, filters: &FilterSet) -> Result<FilterSet> {
    let mut out = FilterSet::new();
    for (key, value) in filters.iter() {
        let spec = spec_for(mode, key)
            .ok_or_else(|| invalid(key, format!("not a {} search filter", mode)))?;
        if let Some((canonical, _)) = canonicalize(spec, value)? {
            out.insert(key.clone(), canonical);
        }
    }
    Ok(out)
}

/// Encode a filter set as `param=value&param=value`, keys in sorted order.
pub fn encode(mode: PersonKind, filters: &FilterSet) -> Result<String> {
    let mut parts = Vec::with_capacity(filters.len());
    for (key, value) in filters.iter() {
        let spec = spec_for(mode, key)
            .ok_or_else(|| invalid(key, format!("not a {} search filter", mode)))?;
        if let Some((_, encoded)) = canonicalize(spec, value)? {
            parts.push(format!(
                "{}={}",
                param_name(spec.key),
                utf8_percent_encode(&encoded, QUERY_VALUE)
            ));
        }
    }
    Ok(parts.join("&"))
}

/// Parse an encoded filter string back into a canonical filter set.
/// Parameters that are not filters (`termo`, `pagina`, ...) are ignored.
pub fn decode(mode: PersonKind, query: &str) -> Result<FilterSet> {
    let mut out = FilterSet::new();
    for pair in query.trim_start_matches('?').split('&').filter(|p| !p.is_empty()) {
        let (name, raw) = pair.split_once('=').unwrap_or((pair, ""));
        let Some(spec) = contract(mode).iter().find(|s| param_name(s.key) == name) else {
            continue;
        };
        let raw = percent_decode_str(raw).decode_utf8_lossy();
        let value = match spec.kind {
            ParamKind::Flag => FilterValue::from_raw(&raw),
            ParamKind::Choices(_) => {
                FilterValue::List(raw.split(',').map(str::to_string).collect())
            }
            _ => FilterValue::Text(raw.to_string()),
        };
        if let Some((canonical, _)) = canonicalize(spec, &value)? {
            out.insert(spec.key, canonical);
        }
    }
    Ok(out)
}

/// Search-screen URL for a query. Page 1 carries no page parameter.
pub fn search_url(base_url: &str, query: &SearchQuery, page: usize) -> Result<String> {
    let base = base_url.trim_end_matches('/');
    let mut url = format!(
        "{}/{}/busca/lista?termo={}",
        base,
        query.mode().path(),
        utf8_percent_encode(query.term(), QUERY_VALUE)
    );
    let encoded = encode(query.mode(), query.filters())?;
    if !encoded.is_empty() {
        url.push('&');
        url.push_str(&encoded);
    }
    if page > 1 {
        url.push_str(&format!("&pagina={}", page));
    }
    Ok(url)
}
