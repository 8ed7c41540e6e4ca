/// Pipeline tests over recorded portal screens.
mod common;

use std::sync::Arc;

use common::*;
use portal_scout::core::sink::MemorySink;
use portal_scout::replay::ReplaySite;
use portal_scout::{DetailRecord, FieldValue, ResultScope, ScoutError, Stage};
use tokio_util::sync::CancellationToken;

fn only(categories: &[&str]) -> ResultScope {
    ResultScope::Categories(categories.iter().map(|c| c.to_string()).collect())
}

#[tokio::test(start_paused = true)]
async fn paging_stops_at_the_result_limit() {
    init_logger();
    let site = with_search(ReplaySite::new(), CPF, 3, 5);
    let state = state(&site);

    let envelope = state
        .execute(&query(CPF, 12), &ResultScope::SearchOnly, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(envelope.items.len(), 12);
    for (i, item) in envelope.items.iter().enumerate() {
        assert_eq!(item.item.position, i);
        assert_eq!(item.item.portal_id, (i + 1).to_string());
        assert!(item.links.is_empty() && item.records.is_empty());
    }
    assert_eq!(envelope.items[0].item.label, "PESSOA 1");
    assert_eq!(envelope.items[0].item.fields["tipo"], "Servidor");
    assert_eq!(site.navigations(), 3);
    for page in 1..=3 {
        assert_eq!(site.hits(&search_url(CPF, page)), 1);
    }
    assert!(!envelope.is_degraded());
}

#[tokio::test(start_paused = true)]
async fn fewer_results_than_the_limit() {
    let site = with_search(ReplaySite::new(), CPF, 3, 5);
    let envelope = state(&site)
        .execute(&query(CPF, 50), &ResultScope::SearchOnly, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(envelope.items.len(), 15);
    assert_eq!(site.navigations(), 3);
}

#[tokio::test(start_paused = true)]
async fn zero_results_is_an_empty_envelope() {
    let site = ReplaySite::new().page(&search_url(CPF, 1), search_page([], 0, false));
    let envelope = state(&site)
        .execute(&query(CPF, 10), &ResultScope::Full, &CancellationToken::new())
        .await
        .unwrap();

    assert!(envelope.items.is_empty());
    assert!(envelope.partial_failures.is_empty());
    assert_eq!(site.navigations(), 1);
}

#[tokio::test(start_paused = true)]
async fn missing_result_list_is_a_layout_error() {
    let site = ReplaySite::new().page(&search_url(CPF, 1), drifted_search_page(1..=5, 5, false));
    let err = state(&site)
        .execute(&query(CPF, 10), &ResultScope::SearchOnly, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, ScoutError::UnknownLayout { ref url } if url == &search_url(CPF, 1)), "{:?}", err);
}

#[tokio::test(start_paused = true)]
async fn zero_banner_without_list_is_an_empty_result() {
    let site = ReplaySite::new().page(&search_url(CPF, 1), drifted_search_page([], 0, false));
    let envelope = state(&site)
        .execute(&query(CPF, 10), &ResultScope::SearchOnly, &CancellationToken::new())
        .await
        .unwrap();

    assert!(envelope.items.is_empty());
    assert!(envelope.partial_failures.is_empty());
}

#[tokio::test(start_paused = true)]
async fn missing_list_on_a_later_page_keeps_earlier_items() {
    let site = ReplaySite::new()
        .page(&search_url(CPF, 1), search_page(1..=5, 10, true))
        .page(&search_url(CPF, 2), drifted_search_page(6..=10, 10, false));
    let envelope = state(&site)
        .execute(&query(CPF, 10), &ResultScope::SearchOnly, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(envelope.items.len(), 5);
    assert_eq!(envelope.partial_failures.len(), 1);
    let failure = &envelope.partial_failures[0];
    assert_eq!(failure.stage, Stage::Search);
    assert_eq!(failure.kind, "unknown_layout");
    assert_eq!(failure.url, search_url(CPF, 2));
}

#[tokio::test(start_paused = true)]
async fn full_run_reads_both_detail_layouts() {
    init_logger();
    let site = with_search(ReplaySite::new(), CPF, 1, 2);
    let site = with_person(site, 1);
    let site = with_person_without_links(site, 2);
    let sink = Arc::new(MemorySink::new());
    let state = state(&site).with_sink(sink.clone());

    let envelope = state
        .execute(&query(CPF, 10), &ResultScope::Full, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(envelope.items.len(), 2);
    let first = &envelope.items[0];
    let labels: Vec<_> = first.links.iter().map(|l| l.label.as_str()).collect();
    assert_eq!(labels, vec!["Bolsa Família", "sancoes-vigentes"]);
    assert_eq!(first.records.len(), 2);

    let DetailRecord::Tabular(grid) = &first.records[0] else {
        panic!("expected a grid, got {:?}", first.records[0]);
    };
    assert_eq!(grid.category, "Bolsa Família");
    assert_eq!(grid.source_url, grid_url(1));
    assert_eq!(grid.columns, vec!["Mês de referência", "Valor", "Detalhar"]);
    assert_eq!(grid.rows.len(), 3);
    assert_eq!(grid.rows[2]["Mês de referência"], "03/2024");
    assert_eq!(grid.rows[0]["Detalhar"], format!("{}/beneficios/parcela/1-1", BASE));

    let DetailRecord::Query(sanction) = &first.records[1] else {
        panic!("expected key/value fields, got {:?}", first.records[1]);
    };
    assert_eq!(sanction.category, "sancoes-vigentes");
    assert_eq!(sanction.fields["nome"], FieldValue::Text("PESSOA 1".into()));
    assert_eq!(sanction.fields["tipo_de_sanção"], FieldValue::Text("Impedimento".into()));
    assert_eq!(sanction.fields["órgão_sancionador"], FieldValue::Empty);
    assert_eq!(sanction.fields["fundamentação_legal.lei"], FieldValue::Text("14.133/2021".into()));
    assert_eq!(sanction.fields["fundamentação_legal.artigo"], FieldValue::Empty);
    assert!(!sanction.fields.contains_key("cargo"));

    // The second person has an aggregation screen with nothing on it.
    let second = &envelope.items[1];
    assert!(second.links.is_empty() && second.records.is_empty());
    assert_eq!(envelope.partial_failures.len(), 1);
    let failure = &envelope.partial_failures[0];
    assert_eq!(failure.stage, Stage::Links);
    assert_eq!(failure.kind, "no_links_found");
    assert_eq!(failure.url, item_url(2));

    assert_eq!(sink.envelopes().len(), 1);
    assert_eq!(sink.envelopes()[0].run_id, envelope.run_id);
}

#[tokio::test(start_paused = true)]
async fn empty_grid_has_columns_but_no_rows() {
    let site = with_search(ReplaySite::new(), CPF, 1, 1);
    let site = with_empty_grid(site, 1);

    let envelope = state(&site)
        .execute(&query(CPF, 10), &only(&["Bolsa Família"]), &CancellationToken::new())
        .await
        .unwrap();

    let item = &envelope.items[0];
    assert_eq!(item.links.len(), 2);
    assert_eq!(item.records.len(), 1);
    let DetailRecord::Tabular(grid) = &item.records[0] else {
        panic!("expected a grid");
    };
    assert_eq!(grid.columns.len(), 3);
    assert!(grid.rows.is_empty());
    assert!(envelope.partial_failures.is_empty());
    // The sanction screen was outside the scope.
    assert_eq!(site.hits(&sanction_url(1)), 0);
}

#[tokio::test(start_paused = true)]
async fn unrecognised_detail_screen_is_a_partial_failure() {
    let site = with_search(ReplaySite::new(), CPF, 1, 1);
    let site = with_unrecognised_sanction(site, 1);

    let envelope = state(&site)
        .execute(&query(CPF, 10), &ResultScope::Full, &CancellationToken::new())
        .await
        .unwrap();

    let item = &envelope.items[0];
    assert_eq!(item.records.len(), 1);
    assert_eq!(item.records[0].category(), "Bolsa Família");
    assert_eq!(envelope.partial_failures.len(), 1);
    let failure = &envelope.partial_failures[0];
    assert_eq!(failure.stage, Stage::Detail);
    assert_eq!(failure.kind, "unknown_layout");
    assert_eq!(failure.label.as_deref(), Some("sancoes-vigentes"));
    assert_eq!(failure.url, sanction_url(1));
}

#[tokio::test(start_paused = true)]
async fn repeated_runs_give_identical_records() {
    let site = with_search(ReplaySite::new(), CPF, 1, 2);
    let site = with_person(with_person(site, 1), 2);
    let state = state(&site);
    let cancel = CancellationToken::new();

    let first = state.execute(&query(CPF, 10), &ResultScope::Full, &cancel).await.unwrap();
    let second = state.execute(&query(CPF, 10), &ResultScope::Full, &cancel).await.unwrap();

    assert_ne!(first.run_id, second.run_id);
    assert_eq!(
        serde_json::to_string(&first.items).unwrap(),
        serde_json::to_string(&second.items).unwrap()
    );
    assert_eq!(first.record_count(), 4);
}
