use std::time::Duration;

use thiserror::Error;

use crate::core::types::BlockKind;

/// How the pipeline treats an error once it has been raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Bad input or bad selector table. Aborts before any navigation.
    Configuration,
    /// Absorbed by the guard's retry loop.
    Transient,
    /// Downgraded to a `PartialFailure`; the run continues.
    PerItem,
    /// Ends the run with a single typed error.
    Fatal,
}

#[derive(Debug, Error)]
pub enum ScoutError {
    #[error("invalid filter `{key}`: {reason}")]
    InvalidFilter { key: String, reason: String },

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("unknown selector `{name}` for screen {screen}")]
    UnknownSelector { screen: String, name: String },

    #[error("selector `{name}` for screen {screen} does not parse: {css}")]
    InvalidSelector {
        screen: String,
        name: String,
        css: String,
    },

    #[error("navigation to {url} failed: {reason}")]
    NavigationFailed { url: String, reason: String },

    #[error("blocked ({kind}) at {url}")]
    Blocked { kind: BlockKind, url: String },

    #[error("navigation to {url} timed out after {}ms", .after.as_millis())]
    TimedOut { url: String, after: Duration },

    #[error("no detail links on {url}")]
    NoLinksFound { url: String },

    #[error("unrecognised detail layout at {url}")]
    UnknownLayout { url: String },

    #[error("gave up on {url} after {attempts} attempts (last: {last})")]
    RetryExhausted {
        url: String,
        attempts: u32,
        last: String,
    },

    #[error("run cancelled")]
    Cancelled,

    #[error("browser error: {0}")]
    Browser(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("sink rejected envelope: {0}")]
    Sink(String),
}

impl ScoutError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ScoutError::InvalidFilter { .. }
            | ScoutError::InvalidQuery(_)
            | ScoutError::UnknownSelector { .. }
            | ScoutError::InvalidSelector { .. }
            | ScoutError::Config(_) => ErrorClass::Configuration,
            ScoutError::NavigationFailed { .. }
            | ScoutError::Blocked { .. }
            | ScoutError::TimedOut { .. } => ErrorClass::Transient,
            ScoutError::NoLinksFound { .. } | ScoutError::UnknownLayout { .. } => {
                ErrorClass::PerItem
            }
            ScoutError::RetryExhausted { .. }
            | ScoutError::Cancelled
            | ScoutError::Browser(_)
            | ScoutError::Sink(_) => ErrorClass::Fatal,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Short machine label used in partial-failure entries and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            ScoutError::InvalidFilter { .. } => "invalid_filter",
            ScoutError::InvalidQuery(_) => "invalid_query",
            ScoutError::UnknownSelector { .. } => "unknown_selector",
            ScoutError::InvalidSelector { .. } => "invalid_selector",
            ScoutError::NavigationFailed { .. } => "navigation_failed",
            ScoutError::Blocked { .. } => "blocked",
            ScoutError::TimedOut { .. } => "timed_out",
            ScoutError::NoLinksFound { .. } => "no_links_found",
            ScoutError::UnknownLayout { .. } => "unknown_layout",
            ScoutError::RetryExhausted { .. } => "retry_exhausted",
            ScoutError::Cancelled => "cancelled",
            ScoutError::Browser(_) => "browser",
            ScoutError::Config(_) => "config",
            ScoutError::Sink(_) => "sink",
        }
    }
}

pub type Result<T, E = ScoutError> = std::result::Result<T, E>;
