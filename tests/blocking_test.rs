/// Block handling and cancellation across a whole run.
mod common;

use std::time::Duration;

use common::*;
use portal_scout::replay::{ReplayResponse, ReplaySite};
use portal_scout::{ResultScope, ScoutError, Stage};
use tokio_util::sync::CancellationToken;

#[tokio::test(start_paused = true)]
async fn blocked_first_search_page_fails_the_run() {
    init_logger();
    let site = ReplaySite::new().respond(&search_url(CPF, 1), blocked());
    let state = state(&site);

    let start = tokio::time::Instant::now();
    let err = state
        .execute(&query(CPF, 10), &ResultScope::Full, &CancellationToken::new())
        .await
        .unwrap_err();

    match err {
        ScoutError::RetryExhausted { url, attempts, last } => {
            assert_eq!(url, search_url(CPF, 1));
            assert_eq!(attempts, 3);
            assert!(last.contains("captcha"), "last error: {}", last);
        }
        other => panic!("expected RetryExhausted, got {:?}", other),
    }
    assert_eq!(site.hits(&search_url(CPF, 1)), 3);
    // 100ms then 200ms between the three attempts
    assert!(start.elapsed() >= Duration::from_millis(300));
}

#[tokio::test(start_paused = true)]
async fn blocked_later_search_page_keeps_earlier_items() {
    let site = ReplaySite::new()
        .page(&search_url(CPF, 1), search_page(1..=5, 10, true))
        .respond(&search_url(CPF, 2), blocked());

    let envelope = state(&site)
        .execute(&query(CPF, 10), &ResultScope::SearchOnly, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(envelope.items.len(), 5);
    assert_eq!(envelope.partial_failures.len(), 1);
    let failure = &envelope.partial_failures[0];
    assert_eq!(failure.stage, Stage::Search);
    assert_eq!(failure.kind, "retry_exhausted");
    assert_eq!(failure.url, search_url(CPF, 2));
}

#[tokio::test(start_paused = true)]
async fn rate_limited_screen_recovers_after_backoff() {
    let site = with_search(ReplaySite::new(), CPF, 1, 1)
        .respond(&item_url(1), ReplayResponse::status(429, "<h1>Too Many Requests</h1>"));
    let site = with_person(site, 1);

    let envelope = state(&site)
        .execute(&query(CPF, 10), &ResultScope::Full, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(site.hits(&item_url(1)), 2);
    assert_eq!(envelope.items[0].records.len(), 2);
    assert!(!envelope.is_degraded());
}

#[tokio::test(start_paused = true)]
async fn blocked_detail_screen_ends_the_run() {
    let site = with_search(ReplaySite::new(), CPF, 1, 1);
    let site = with_blocked_grid(site, 1);

    let err = state(&site)
        .execute(&query(CPF, 10), &ResultScope::Full, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ScoutError::RetryExhausted { .. }), "{:?}", err);
}

#[tokio::test(start_paused = true)]
async fn cancelled_before_start_makes_no_navigation() {
    let site = with_search(ReplaySite::new(), CPF, 1, 5);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = state(&site)
        .execute(&query(CPF, 10), &ResultScope::Full, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, ScoutError::Cancelled));
    assert_eq!(site.navigations(), 0);
}

#[tokio::test(start_paused = true)]
async fn cancellation_interrupts_a_slow_load() {
    let site = ReplaySite::new().respond(
        &search_url(CPF, 1),
        ReplayResponse::ok(search_page(1..=5, 5, false)).delayed(Duration::from_secs(10)),
    );
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        trigger.cancel();
    });

    let err = state(&site)
        .execute(&query(CPF, 10), &ResultScope::SearchOnly, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, ScoutError::Cancelled));
    assert_eq!(site.navigations(), 1);
}
