use std::sync::OnceLock;
use std::time::Duration;

use aho_corasick::AhoCorasick;
use rand::seq::IndexedRandom;

use crate::core::types::BlockKind;

/// Desktop profiles only; the portal serves a different layout to mobile agents.
pub const USER_AGENTS: &[&str] = &[
    // Chrome Desktop (Windows, macOS, Linux)
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/132.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/132.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
    // Edge Desktop
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/132.0.0.0 Safari/537.36 Edg/132.0.0.0",
    // Firefox Desktop
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:133.0) Gecko/20100101 Firefox/133.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 14.7; rv:133.0) Gecko/20100101 Firefox/133.0",
];

/// Random desktop user agent for a new browser launch.
pub fn random_user_agent() -> &'static str {
    let mut rng = rand::rng();
    USER_AGENTS.choose(&mut rng).copied().unwrap_or(USER_AGENTS[0])
}

/// Request delay configuration for polite scraping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestDelay {
    /// Minimum delay in milliseconds between requests
    pub min_ms: u64,
    /// Maximum delay in milliseconds between requests
    pub max_ms: u64,
}

impl RequestDelay {
    pub fn new(min_ms: u64, max_ms: u64) -> Self {
        if min_ms > max_ms {
            Self { min_ms: max_ms, max_ms: min_ms }
        } else {
            Self { min_ms, max_ms }
        }
    }

    /// No delay at all (replay runs, tests).
    pub fn none() -> Self {
        Self { min_ms: 0, max_ms: 0 }
    }

    /// Default polite delay: 500ms-1500ms
    pub fn default_polite() -> Self {
        Self {
            min_ms: 500,
            max_ms: 1500,
        }
    }

    /// Get random delay within configured range with jitter
    pub fn random_delay(&self) -> u64 {
        use rand::prelude::*;
        if self.max_ms == 0 {
            return 0;
        }
        let mut rng = rand::rng();
        let base_delay = rng.random_range(self.min_ms..=self.max_ms);

        // ±20% jitter, never below the configured minimum
        let jitter_range = (base_delay as f64 * 0.2) as i64;
        let jitter = rng.random_range(-jitter_range..=jitter_range);

        (base_delay as i64 + jitter).max(self.min_ms as i64) as u64
    }

    pub fn next(&self) -> Duration {
        Duration::from_millis(self.random_delay())
    }
}

impl Default for RequestDelay {
    fn default() -> Self {
        Self::default_polite()
    }
}

/// Text markers of interstitial pages, matched against the lowercased
/// title/heading of a loaded page.
const BLOCK_MARKERS: &[(&str, BlockKind)] = &[
    ("captcha", BlockKind::Captcha),
    ("verify you are human", BlockKind::Captcha),
    ("não sou um robô", BlockKind::Captcha),
    ("unusual traffic", BlockKind::RateLimit),
    ("too many requests", BlockKind::RateLimit),
    ("muitas requisições", BlockKind::RateLimit),
    ("access denied", BlockKind::Unknown),
    ("acesso negado", BlockKind::Unknown),
    ("request blocked", BlockKind::Unknown),
];

fn marker_matcher() -> &'static AhoCorasick {
    static MATCHER: OnceLock<AhoCorasick> = OnceLock::new();
    MATCHER.get_or_init(|| {
        AhoCorasick::new(BLOCK_MARKERS.iter().map(|(pattern, _)| *pattern))
            .expect("valid block markers")
    })
}

/// What the guard observed on a freshly loaded page.
#[derive(Debug, Clone, Default)]
pub struct BlockSignals<'a> {
    pub status: Option<u16>,
    /// Challenge markup (captcha widget, challenge form) is present.
    pub challenge_markup: bool,
    /// Title and top heading text of the page.
    pub notice_text: &'a str,
}

/// Classify a loaded page. `None` means the page is usable.
pub fn detect_block(signals: &BlockSignals<'_>) -> Option<BlockKind> {
    if signals.status == Some(429) {
        return Some(BlockKind::RateLimit);
    }
    if signals.challenge_markup {
        return Some(BlockKind::Captcha);
    }
    let lower = signals.notice_text.to_lowercase();
    if let Some(m) = marker_matcher().find(&lower) {
        return Some(BLOCK_MARKERS[m.pattern().as_usize()].1);
    }
    match signals.status {
        Some(403) | Some(503) => Some(BlockKind::Unknown),
        _ => None,
    }
}
