//! Block/Captcha Guard.
//!
//! Every navigation in a run goes through [`Guard::navigate`]. One attempt
//! walks `Idle → Navigating → {Loaded | Blocked | TimedOut}`; a blocked or
//! timed-out attempt moves to `Backoff` and then back to `Navigating`, until
//! the retry ceiling turns it into `Failed`. Extractors only ever see pages
//! that reached `Loaded`.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::core::error::{Result, ScoutError};
use crate::core::types::{BlockEvent, BlockKind};
use crate::features::antibot::{detect_block, BlockSignals, RequestDelay};
use crate::scraping::page::{Fragment, HeadlessPage, Navigation};
use crate::scraping::selectors::{Locator, Screen, SelectorRegistry};

/// Retry policy. Pure data; the guard holds no state between navigations.
#[derive(Debug, Clone, PartialEq)]
pub struct GuardPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    pub navigation_timeout: Duration,
    pub request_delay: RequestDelay,
}

impl Default for GuardPolicy {
    fn default() -> Self {
        Self {
            max_retries: 4,
            initial_backoff: Duration::from_millis(1000),
            max_backoff: Duration::from_millis(30_000),
            multiplier: 2.0,
            navigation_timeout: Duration::from_millis(30_000),
            request_delay: RequestDelay::default_polite(),
        }
    }
}

impl GuardPolicy {
    pub fn attempts(&self) -> u32 {
        self.max_retries + 1
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_backoff)
            .with_multiplier(self.multiplier)
            .with_max_interval(self.max_backoff)
            .with_randomization_factor(0.0)
            .with_max_elapsed_time(None)
            .build()
    }

    /// The waits between attempts, in order: one per retry.
    pub fn delays(&self) -> Vec<Duration> {
        let mut backoff = self.backoff();
        (0..self.max_retries)
            .map(|_| whole_millis(backoff.next_backoff().unwrap_or(self.max_backoff)))
            .collect()
    }
}

// The backoff crate adds up to a nanosecond of noise even with zero
// randomisation.
fn whole_millis(d: Duration) -> Duration {
    Duration::from_millis(d.as_millis() as u64)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardState {
    Idle,
    Navigating { attempt: u32 },
    Loaded,
    Blocked(BlockKind),
    TimedOut,
    Backoff(Duration),
    Failed,
}

impl fmt::Display for GuardState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GuardState::Idle => f.write_str("idle"),
            GuardState::Navigating { attempt } => write!(f, "navigating#{}", attempt),
            GuardState::Loaded => f.write_str("loaded"),
            GuardState::Blocked(kind) => write!(f, "blocked({})", kind),
            GuardState::TimedOut => f.write_str("timed_out"),
            GuardState::Backoff(d) => write!(f, "backoff({}ms)", d.as_millis()),
            GuardState::Failed => f.write_str("failed"),
        }
    }
}

/// Challenge-screen locators used by the block probe.
#[derive(Debug)]
struct ChallengeProbe {
    markup: Vec<Arc<Locator>>,
    notice: Arc<Locator>,
}

#[derive(Debug, Clone)]
pub struct Guard {
    policy: GuardPolicy,
    probe: Arc<ChallengeProbe>,
}

impl Guard {
    pub fn new(policy: GuardPolicy, registry: &SelectorRegistry) -> Result<Self> {
        let probe = ChallengeProbe {
            markup: vec![
                registry.get(Screen::Challenge, "captcha")?,
                registry.get(Screen::Challenge, "challenge_form")?,
            ],
            notice: registry.get(Screen::Challenge, "notice")?,
        };
        Ok(Self {
            policy,
            probe: Arc::new(probe),
        })
    }

    pub fn policy(&self) -> &GuardPolicy {
        &self.policy
    }

    /// Navigate to `url`, retrying blocked or timed-out loads with
    /// increasing waits. Fails with `RetryExhausted` once
    /// `max_retries + 1` attempts have failed.
    pub async fn navigate(
        &self,
        page: &mut dyn HeadlessPage,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<Navigation> {
        let attempts = self.policy.attempts();
        let mut delays = self.policy.delays().into_iter();
        let mut state = GuardState::Idle;
        let mut last = String::new();

        for attempt in 1..=attempts {
            sleep_or_cancel(self.policy.request_delay.next(), cancel).await?;

            state = advance(state, GuardState::Navigating { attempt }, url);
            let loaded = tokio::select! {
                _ = cancel.cancelled() => return Err(ScoutError::Cancelled),
                res = tokio::time::timeout(self.policy.navigation_timeout, page.navigate(url)) => res,
            };

            let failure = match loaded {
                Ok(Ok(nav)) => match self.inspect(page, &nav).await {
                    Ok(None) => {
                        advance(state, GuardState::Loaded, url);
                        return Ok(nav);
                    }
                    Ok(Some(kind)) => {
                        state = advance(state, GuardState::Blocked(kind), url);
                        ScoutError::Blocked {
                            kind,
                            url: url.to_string(),
                        }
                    }
                    // The page moved under the probe; treat it as a failed load.
                    Err(e) => {
                        state = advance(state, GuardState::TimedOut, url);
                        ScoutError::NavigationFailed {
                            url: url.to_string(),
                            reason: e.to_string(),
                        }
                    }
                },
                // Engine-level failures take the same edge as a timeout.
                Ok(Err(e)) if e.is_transient() => {
                    state = advance(state, GuardState::TimedOut, url);
                    e
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    state = advance(state, GuardState::TimedOut, url);
                    ScoutError::TimedOut {
                        url: url.to_string(),
                        after: self.policy.navigation_timeout,
                    }
                }
            };
            last = failure.to_string();

            let wait = delays.next();
            let backoff_ms = wait.map(|d| d.as_millis() as u64).unwrap_or(0);
            if let ScoutError::Blocked { kind, .. } = &failure {
                let event = BlockEvent {
                    kind: *kind,
                    url: url.to_string(),
                    at: Utc::now(),
                    attempt,
                };
                warn!(
                    kind = %event.kind,
                    url = %event.url,
                    at = %event.at.to_rfc3339(),
                    attempt = event.attempt,
                    backoff_ms,
                    "block detected"
                );
            } else {
                warn!(url, attempt, error = %failure, backoff_ms, "navigation attempt failed");
            }
            let Some(wait) = wait else {
                break;
            };
            state = advance(state, GuardState::Backoff(wait), url);
            sleep_or_cancel(wait, cancel).await?;
        }

        advance(state, GuardState::Failed, url);
        Err(ScoutError::RetryExhausted {
            url: url.to_string(),
            attempts,
            last,
        })
    }

    async fn inspect(
        &self,
        page: &dyn HeadlessPage,
        nav: &Navigation,
    ) -> Result<Option<BlockKind>> {
        let mut challenge_markup = false;
        for locator in &self.probe.markup {
            if !page.find(locator).await?.is_empty() {
                challenge_markup = true;
                break;
            }
        }
        let notice = page
            .find(&self.probe.notice)
            .await?
            .iter()
            .map(|html| Fragment::parse(html).text())
            .collect::<Vec<_>>()
            .join(" ");
        Ok(detect_block(&BlockSignals {
            status: nav.status,
            challenge_markup,
            notice_text: &notice,
        }))
    }
}

fn advance(from: GuardState, to: GuardState, url: &str) -> GuardState {
    debug!(url, from = %from, to = %to, "guard transition");
    to
}

/// Sleep unless the run is cancelled first.
/// `HeadlessPage::wait_for` that gives up as soon as the run is cancelled.
pub async fn wait_ready(
    page: &dyn HeadlessPage,
    locator: &Locator,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<bool> {
    tokio::select! {
        _ = cancel.cancelled() => Err(ScoutError::Cancelled),
        ready = page.wait_for(locator, timeout) => ready,
    }
}

pub async fn sleep_or_cancel(wait: Duration, cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(ScoutError::Cancelled);
    }
    if wait.is_zero() {
        return Ok(());
    }
    tokio::select! {
        _ = cancel.cancelled() => Err(ScoutError::Cancelled),
        _ = tokio::time::sleep(wait) => Ok(()),
    }
}
