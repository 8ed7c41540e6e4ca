use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::features::antibot::RequestDelay;
use crate::features::guard::GuardPolicy;
use crate::tools::orchestrator::PipelineSettings;

// ---------------------------------------------------------------------------
// ScoutConfig: file-based config loader (portal-scout.json) with env overrides
// ---------------------------------------------------------------------------

pub const ENV_CONFIG_PATH: &str = "PORTAL_SCOUT_CONFIG";
pub const ENV_BASE_URL: &str = "PORTAL_BASE_URL";
pub const ENV_MAX_CONCURRENT_RUNS: &str = "PORTAL_MAX_CONCURRENT_RUNS";
pub const ENV_MAX_RETRIES: &str = "PORTAL_MAX_RETRIES";
pub const ENV_INITIAL_BACKOFF_MS: &str = "PORTAL_INITIAL_BACKOFF_MS";
pub const ENV_MAX_BACKOFF_MS: &str = "PORTAL_MAX_BACKOFF_MS";
pub const ENV_NAV_TIMEOUT_MS: &str = "PORTAL_NAV_TIMEOUT_MS";
pub const ENV_DELAY_MIN_MS: &str = "SCRAPE_DELAY_MIN_MS";
pub const ENV_DELAY_MAX_MS: &str = "SCRAPE_DELAY_MAX_MS";
pub const ENV_CACHE_TTL_SECS: &str = "PORTAL_CACHE_TTL_SECS";
pub const ENV_HEADLESS: &str = "PORTAL_HEADLESS";
pub const ENV_CHROME_EXECUTABLE: &str = "CHROME_EXECUTABLE";

pub const DEFAULT_BASE_URL: &str = "https://portaldatransparencia.gov.br";

/// Guard sub-config (mirrors the `guard` key in portal-scout.json).
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct GuardConfig {
    /// Retries after the first attempt. Default: 4.
    pub max_retries: u32,
    /// First backoff wait. Default: 1000.
    pub initial_backoff_ms: u64,
    /// Backoff ceiling. Default: 30000.
    pub max_backoff_ms: u64,
    /// Growth factor between waits. Default: 2.0.
    pub multiplier: f64,
    /// Per-attempt navigation timeout. Default: 30000.
    pub navigation_timeout_ms: u64,
    /// How long to wait for a screen's marker element. Default: 5000.
    pub ready_timeout_ms: u64,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            max_retries: 4,
            initial_backoff_ms: 1000,
            max_backoff_ms: 30_000,
            multiplier: 2.0,
            navigation_timeout_ms: 30_000,
            ready_timeout_ms: 5000,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct DelayConfig {
    pub min_ms: u64,
    pub max_ms: u64,
}

impl Default for DelayConfig {
    fn default() -> Self {
        Self {
            min_ms: 500,
            max_ms: 1500,
        }
    }
}

/// Top-level config loaded from `portal-scout.json`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ScoutConfig {
    pub base_url: String,
    /// Query runs allowed at once, each with its own tab. Default: 2.
    pub max_concurrent_runs: usize,
    pub guard: GuardConfig,
    pub request_delay: DelayConfig,
    /// Grid pages followed per tabular detail screen. Default: 10.
    pub max_detail_pages: usize,
    /// Result cache lifetime; `0` disables the cache. Default: 600.
    pub cache_ttl_secs: u64,
    pub headless: bool,
    /// Browser executable; auto-discovered when unset.
    pub chrome_executable: Option<String>,
    /// `{ "screen": { "locator": "css" } }` replacements for the built-in table.
    pub selector_overrides: BTreeMap<String, BTreeMap<String, String>>,
}

impl Default for ScoutConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            max_concurrent_runs: 2,
            guard: GuardConfig::default(),
            request_delay: DelayConfig::default(),
            max_detail_pages: 10,
            cache_ttl_secs: 600,
            headless: true,
            chrome_executable: None,
            selector_overrides: BTreeMap::new(),
        }
    }
}

impl ScoutConfig {
    pub fn guard_policy(&self) -> GuardPolicy {
        GuardPolicy {
            max_retries: self.guard.max_retries,
            initial_backoff: Duration::from_millis(self.guard.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.guard.max_backoff_ms.max(self.guard.initial_backoff_ms)),
            multiplier: if self.guard.multiplier > 1.0 {
                self.guard.multiplier
            } else {
                2.0
            },
            navigation_timeout: Duration::from_millis(self.guard.navigation_timeout_ms),
            request_delay: RequestDelay::new(self.request_delay.min_ms, self.request_delay.max_ms),
        }
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            base_url: self.base_url.clone(),
            guard: self.guard_policy(),
            ready_timeout: Duration::from_millis(self.guard.ready_timeout_ms),
            max_detail_pages: self.max_detail_pages,
        }
    }

    /// Apply env-var overrides on top of file values.
    pub fn apply_env(mut self) -> Self {
        if let Some(v) = env_string(ENV_BASE_URL) {
            self.base_url = v;
        }
        if let Some(v) = env_parse(ENV_MAX_CONCURRENT_RUNS) {
            self.max_concurrent_runs = v;
        }
        if let Some(v) = env_parse(ENV_MAX_RETRIES) {
            self.guard.max_retries = v;
        }
        if let Some(v) = env_parse(ENV_INITIAL_BACKOFF_MS) {
            self.guard.initial_backoff_ms = v;
        }
        if let Some(v) = env_parse(ENV_MAX_BACKOFF_MS) {
            self.guard.max_backoff_ms = v;
        }
        if let Some(v) = env_parse(ENV_NAV_TIMEOUT_MS) {
            self.guard.navigation_timeout_ms = v;
        }
        if let Some(v) = env_parse(ENV_DELAY_MIN_MS) {
            self.request_delay.min_ms = v;
        }
        if let Some(v) = env_parse(ENV_DELAY_MAX_MS) {
            self.request_delay.max_ms = v;
        }
        if let Some(v) = env_parse(ENV_CACHE_TTL_SECS) {
            self.cache_ttl_secs = v;
        }
        if let Some(v) = env_string(ENV_HEADLESS) {
            self.headless = !matches!(
                v.to_ascii_lowercase().as_str(),
                "0" | "false" | "no" | "off"
            );
        }
        if let Some(v) = env_string(ENV_CHROME_EXECUTABLE) {
            self.chrome_executable = Some(v);
        }
        self.max_concurrent_runs = self.max_concurrent_runs.max(1);
        self
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = env_string(key)?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("{}={} is not valid, ignoring", key, raw);
            None
        }
    }
}

fn config_candidates() -> Vec<PathBuf> {
    let mut v = vec![
        PathBuf::from("portal-scout.json"),
        PathBuf::from("../portal-scout.json"),
    ];
    if let Some(home) = dirs::home_dir() {
        v.push(home.join(".portal-scout").join("config.json"));
    }
    if let Ok(env_path) = std::env::var(ENV_CONFIG_PATH) {
        v.insert(0, PathBuf::from(env_path));
    }
    v
}

/// Load `portal-scout.json` from standard locations.
///
/// Search order (first found wins):
/// 1. `PORTAL_SCOUT_CONFIG` env var path
/// 2. `./portal-scout.json`
/// 3. `../portal-scout.json`
/// 4. `~/.portal-scout/config.json`
///
/// Missing file → defaults (silent). Parse error → log a warning, defaults.
/// Env-var overrides are applied in both cases.
pub fn load_scout_config() -> ScoutConfig {
    for path in config_candidates() {
        match std::fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<ScoutConfig>(&contents) {
                Ok(cfg) => {
                    tracing::info!("portal-scout config loaded from {}", path.display());
                    return cfg.apply_env();
                }
                Err(e) => {
                    tracing::warn!(
                        "portal-scout config parse error at {}: {}, using defaults",
                        path.display(),
                        e
                    );
                    return ScoutConfig::default().apply_env();
                }
            },
            Err(_) => continue,
        }
    }
    ScoutConfig::default().apply_env()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let cfg: ScoutConfig = serde_json::from_str(
            r#"{ "guard": { "max_retries": 2 }, "selector_overrides": { "search": { "results": "div#r" } } }"#,
        )
        .unwrap();
        assert_eq!(cfg.guard.max_retries, 2);
        assert_eq!(cfg.guard.initial_backoff_ms, 1000);
        assert_eq!(cfg.base_url, DEFAULT_BASE_URL);
        assert_eq!(cfg.selector_overrides["search"]["results"], "div#r");
    }

    #[test]
    fn guard_policy_from_config() {
        let mut cfg = ScoutConfig::default();
        cfg.guard.max_backoff_ms = 10;
        cfg.guard.multiplier = 0.5;
        let policy = cfg.guard_policy();
        assert_eq!(policy.attempts(), 5);
        assert_eq!(policy.max_backoff, Duration::from_millis(1000));
        assert_eq!(policy.multiplier, 2.0);
        assert_eq!(policy.request_delay, RequestDelay::new(500, 1500));
    }

    // Only test in this binary that touches the process environment.
    #[test]
    fn env_overrides_file_values() {
        let vars = [
            (ENV_BASE_URL, " https://mirror.test "),
            (ENV_MAX_CONCURRENT_RUNS, "0"),
            (ENV_MAX_RETRIES, "7"),
            (ENV_NAV_TIMEOUT_MS, "not-a-number"),
            (ENV_DELAY_MIN_MS, "10"),
            (ENV_DELAY_MAX_MS, "20"),
            (ENV_HEADLESS, "off"),
        ];
        for (key, value) in vars {
            std::env::set_var(key, value);
        }

        let mut file = ScoutConfig::default();
        file.guard.navigation_timeout_ms = 1234;
        let cfg = file.apply_env();

        for (key, _) in vars {
            std::env::remove_var(key);
        }

        assert_eq!(cfg.base_url, "https://mirror.test");
        assert_eq!(cfg.max_concurrent_runs, 1);
        assert_eq!(cfg.guard.max_retries, 7);
        assert_eq!(cfg.guard.navigation_timeout_ms, 1234);
        assert_eq!(cfg.request_delay.min_ms, 10);
        assert_eq!(cfg.request_delay.max_ms, 20);
        assert!(!cfg.headless);
        assert_eq!(cfg.cache_ttl_secs, ScoutConfig::default().cache_ttl_secs);
    }
}
