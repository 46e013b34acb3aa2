//! Chain tests: mock adapters → RunControl → store + ledger state.
//!
//! Each test wires a MemoryStore with canned sources, drives one or more runs
//! end to end, and asserts on the persisted run row, ledger entries, and items.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use uuid::Uuid;

use inflow_common::{
    IngestError, Item, LedgerStatus, Run, RunStatus, MANUAL_STOP_MESSAGE, STALE_RUN_MESSAGE,
};
use inflow_engine::testing::*;
use inflow_engine::{EngineDeps, RunControl, StatusQuery};
use inflow_store::{ItemStore, MemoryStore, RunLedger};

fn processed_item(url: &str, source_name: &str) -> Item {
    let mut item = Item::from_candidate(&candidate(url, 300), source_name, Utc::now());
    item.is_enriched = true;
    item.summary = Some("Already summarized".into());
    item.enriched_at = Some(Utc::now());
    item
}

/// Poll the ledger until `run_id` leaves the running state.
async fn wait_for_terminal(control: &RunControl, run_id: Uuid) -> Run {
    for _ in 0..500 {
        if let Some(report) = control.get_status(StatusQuery::Run(run_id)).await.unwrap() {
            if report.run.status != RunStatus::Running && !report.live {
                return report.run;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("run {run_id} never finished");
}

#[tokio::test]
async fn mixed_sources_produce_counters_and_ledger() {
    let store = Arc::new(MemoryStore::with_sources([
        feed_source("alpha"),
        feed_source("bravo"),
        feed_source("charlie"),
    ]));
    store.seed_item(processed_item("https://charlie.example/1", "charlie"));
    store.seed_item(processed_item("https://charlie.example/2", "charlie"));

    let alpha: Vec<_> = (0..5)
        .map(|i| candidate(&format!("https://alpha.example/{i}"), 200))
        .collect();
    let adapter = Arc::new(
        MockAdapter::new()
            .on("alpha", alpha)
            .failing("bravo", "connection refused")
            .on(
                "charlie",
                vec![
                    candidate("https://charlie.example/1", 300),
                    candidate("https://charlie.example/2", 300),
                ],
            ),
    );
    let enrichment = Arc::new(CountingEnrichment::new());
    let control = memory_control(store.clone(), adapter, Some(enrichment.clone()), fast_settings());

    let run = control.run_to_completion(true).await.unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert!(run.completed_at.is_some());
    assert!(run.enrichment_enabled);
    assert_eq!(run.counters.total_sources, 3);
    assert_eq!(run.counters.success_sources, 2);
    assert_eq!(run.counters.failed_sources, 1);
    assert_eq!(run.counters.new_items, 5);
    assert_eq!(run.counters.updated_items, 0);
    assert_eq!(run.counters.enriched_count, 5);
    assert_eq!(enrichment.calls(), 5);
    assert_eq!(store.items().len(), 7);

    let mut entries = store.entries_for_run(run.id).await.unwrap();
    entries.sort_by(|a, b| a.source_name.cmp(&b.source_name));
    let summary: Vec<_> = entries
        .iter()
        .map(|e| (e.source_name.as_str(), e.status, e.item_count))
        .collect();
    assert_eq!(
        summary,
        vec![
            ("alpha", LedgerStatus::Success, 5),
            ("bravo", LedgerStatus::Error, 0),
            ("charlie", LedgerStatus::Success, 2),
        ]
    );
    assert!(entries[1]
        .error_message
        .as_deref()
        .unwrap()
        .contains("connection refused"));

    let bravo = store.source("bravo").unwrap();
    assert!(bravo.last_error.unwrap().contains("connection refused"));
    let alpha = store.source("alpha").unwrap();
    assert!(alpha.last_collected_at.is_some());
    assert!(alpha.last_error.is_none());
}

#[tokio::test]
async fn same_url_from_two_sources_keeps_one_row_with_longest_content() {
    let store = Arc::new(MemoryStore::with_sources([feed_source("short"), feed_source("long")]));
    let adapter = Arc::new(
        MockAdapter::new()
            .on("short", vec![candidate("https://shared.example/story", 200)])
            .on("long", vec![candidate("https://shared.example/story", 800)]),
    );
    let control = memory_control(store.clone(), adapter, None, fast_settings());

    let run = control.run_to_completion(false).await.unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(store.items().len(), 1);
    assert_eq!(
        store.item_by_url("https://shared.example/story").unwrap().content_len(),
        800
    );
    assert_eq!(run.counters.new_items, 1);
    assert_eq!(run.counters.updated_items, 1);
}

#[tokio::test]
async fn slightly_longer_content_replaces_the_first_insert() {
    let store = Arc::new(MemoryStore::with_sources([feed_source("a-short"), feed_source("b-longer")]));
    let adapter = Arc::new(
        MockAdapter::new()
            .on("a-short", vec![candidate("https://shared.example/close", 200)])
            .on("b-longer", vec![candidate("https://shared.example/close", 230)]),
    );
    // One source at a time, so the shorter body is inserted first.
    let control = memory_control(store.clone(), adapter, None, fast_settings().with_source_workers(1));

    let run = control.run_to_completion(false).await.unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.counters.new_items, 1);
    assert_eq!(run.counters.updated_items, 1);
    let item = store.item_by_url("https://shared.example/close").unwrap();
    assert_eq!(item.content_len(), 230);
    assert_eq!(item.source_name, "b-longer");
}

#[tokio::test]
async fn rerun_skips_fully_processed_items() {
    let store = Arc::new(MemoryStore::with_sources([feed_source("desk")]));
    let items: Vec<_> = (0..3)
        .map(|i| candidate(&format!("https://desk.example/{i}"), 150))
        .collect();
    let adapter = Arc::new(MockAdapter::new().on("desk", items));
    let enrichment = Arc::new(CountingEnrichment::new());
    let control = memory_control(store.clone(), adapter.clone(), Some(enrichment.clone()), fast_settings());

    let first = control.run_to_completion(true).await.unwrap();
    assert_eq!(first.counters.new_items, 3);
    assert_eq!(enrichment.calls(), 3);

    let second = control.run_to_completion(true).await.unwrap();

    assert_eq!(second.status, RunStatus::Completed);
    assert_eq!(second.counters.new_items, 0);
    assert_eq!(second.counters.updated_items, 0);
    assert_eq!(second.counters.enriched_count, 0);
    assert_eq!(enrichment.calls(), 3);
    assert_eq!(store.items().len(), 3);
    assert_eq!(adapter.call_count("desk"), 2);
}

#[tokio::test]
async fn stop_request_ends_run_with_partial_counters() {
    let store = Arc::new(MemoryStore::with_sources([feed_source("a-first"), feed_source("b-second")]));
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let adapter = Arc::new(
        MockAdapter::new()
            .on("a-first", vec![candidate("https://a.example/1", 200)])
            .on("b-second", vec![candidate("https://b.example/1", 200)])
            .gated("a-first", entered.clone(), release.clone()),
    );
    let settings = fast_settings().with_source_workers(1);
    let control = memory_control(store.clone(), adapter.clone(), None, settings);

    let run_id = control.start_run(false).await.unwrap();
    entered.notified().await;
    assert!(control.stop_run(run_id));
    release.notify_one();

    let run = wait_for_terminal(&control, run_id).await;

    assert_eq!(run.status, RunStatus::Error);
    assert_eq!(run.error_message.as_deref(), Some(MANUAL_STOP_MESSAGE));
    assert!(run.was_manually_stopped());
    assert_eq!(run.counters.total_sources, 1);
    assert_eq!(run.counters.new_items, 1);
    assert_eq!(adapter.call_count("b-second"), 0);
    assert_eq!(store.entries_for_run(run_id).await.unwrap().len(), 1);
    assert!(control.live_run_id().is_none());
}

#[tokio::test]
async fn stop_for_unknown_run_is_refused() {
    let control = memory_control(
        Arc::new(MemoryStore::new()),
        Arc::new(MockAdapter::new()),
        None,
        fast_settings(),
    );
    assert!(!control.stop_run(Uuid::new_v4()));
}

#[tokio::test]
async fn second_run_is_rejected_while_one_is_live() {
    let store = Arc::new(MemoryStore::with_sources([feed_source("slow")]));
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let adapter = Arc::new(
        MockAdapter::new()
            .on("slow", vec![candidate("https://slow.example/1", 200)])
            .gated("slow", entered.clone(), release.clone()),
    );
    let control = memory_control(store.clone(), adapter, None, fast_settings());

    let first = control.start_run(false).await.unwrap();
    entered.notified().await;

    match control.start_run(false).await {
        Err(IngestError::RunAlreadyActive { run_id }) => assert_eq!(run_id, first),
        other => panic!("expected RunAlreadyActive, got {other:?}"),
    }
    assert_eq!(store.running_runs().await.unwrap().len(), 1);

    release.notify_one();
    let finished = wait_for_terminal(&control, first).await;
    assert_eq!(finished.status, RunStatus::Completed);

    // The gate still applies; pre-release it for the follow-up run.
    release.notify_one();
    let next = control.run_to_completion(false).await.unwrap();
    assert_eq!(next.status, RunStatus::Completed);
}

#[tokio::test]
async fn stale_running_row_is_swept_at_admission() {
    let store = Arc::new(MemoryStore::with_sources([feed_source("desk")]));
    let abandoned = Run::start(Uuid::new_v4(), true, Utc::now() - chrono::Duration::hours(3));
    store.seed_run(abandoned.clone());
    let settings = fast_settings().with_stale_after(chrono::Duration::minutes(30));
    let control = memory_control(store.clone(), Arc::new(MockAdapter::new()), None, settings);

    let run = control.run_to_completion(false).await.unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    let swept = store.get_run(abandoned.id).await.unwrap().unwrap();
    assert_eq!(swept.status, RunStatus::Error);
    assert_eq!(swept.error_message.as_deref(), Some(STALE_RUN_MESSAGE));
    assert!(swept.completed_at.is_some());
}

#[tokio::test]
async fn fresh_running_row_blocks_admission() {
    let store = Arc::new(MemoryStore::with_sources([feed_source("desk")]));
    let elsewhere = Run::start(Uuid::new_v4(), false, Utc::now() - chrono::Duration::minutes(1));
    store.seed_run(elsewhere.clone());
    let settings = fast_settings().with_stale_after(chrono::Duration::minutes(30));
    let control = memory_control(store.clone(), Arc::new(MockAdapter::new()), None, settings);

    match control.run_to_completion(false).await {
        Err(IngestError::RunAlreadyActive { run_id }) => assert_eq!(run_id, elsewhere.id),
        other => panic!("expected RunAlreadyActive, got {other:?}"),
    }
    // Rejection must not leave the in-process slot held.
    assert!(control.live_run_id().is_none());
    assert_eq!(store.list_runs(10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn failing_and_panicking_sources_do_not_stop_siblings() {
    let store = Arc::new(MemoryStore::with_sources([
        feed_source("good"),
        feed_source("broken"),
        feed_source("explodes"),
        feed_source("flaky"),
    ]));
    let adapter = Arc::new(
        MockAdapter::new()
            .on("good", vec![candidate("https://good.example/1", 200)])
            .failing("broken", "HTTP 500")
            .panicking("explodes")
            .failing("flaky", "timed out"),
    );
    let control = memory_control(store.clone(), adapter, None, fast_settings());

    let run = control.run_to_completion(false).await.unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.counters.total_sources, 4);
    assert_eq!(run.counters.success_sources, 1);
    assert_eq!(run.counters.failed_sources, 3);
    assert_eq!(run.counters.new_items, 1);

    let entries = store.entries_for_run(run.id).await.unwrap();
    assert_eq!(entries.len(), 4);
    let exploded = entries.iter().find(|e| e.source_name == "explodes").unwrap();
    assert_eq!(exploded.status, LedgerStatus::Error);
    assert!(exploded
        .error_message
        .as_deref()
        .unwrap()
        .starts_with("source task panicked"));
}

#[tokio::test]
async fn lost_insert_race_merges_into_the_winner() {
    let store = Arc::new(MemoryStore::with_sources([feed_source("desk")]));
    let racing = Arc::new(RacingItemStore::new(
        store.clone(),
        &["https://desk.example/contested"],
        "short competitor body",
    ));
    let adapter = Arc::new(MockAdapter::new().on(
        "desk",
        vec![
            candidate("https://desk.example/contested", 400),
            candidate("https://desk.example/quiet", 100),
        ],
    ));
    let deps = EngineDeps {
        items: racing,
        ledger: store.clone(),
        sources: store.clone(),
        adapters: adapters_for_all(adapter),
        content: Arc::new(MockContentFetcher::new()),
        enrichment: None,
        notifier: None,
    };
    let control = RunControl::new(deps, fast_settings());

    let run = control.run_to_completion(false).await.unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.counters.new_items, 1);
    assert_eq!(run.counters.updated_items, 1);
    assert_eq!(store.count_items().await.unwrap(), 2);
    let contested = store.item_by_url("https://desk.example/contested").unwrap();
    assert_eq!(contested.content_len(), 400);
}

#[tokio::test]
async fn exhausted_insert_retries_skip_the_item_but_not_the_source() {
    let store = Arc::new(MemoryStore::with_sources([feed_source("desk")]));
    let contested = Arc::new(ContestedItemStore::new(store.clone()));
    let adapter = Arc::new(MockAdapter::new().on(
        "desk",
        vec![
            candidate("https://desk.example/never", 300),
            candidate("https://desk.example/also-never", 300),
        ],
    ));
    let deps = EngineDeps {
        items: contested.clone(),
        ledger: store.clone(),
        sources: store.clone(),
        adapters: adapters_for_all(adapter),
        content: Arc::new(MockContentFetcher::new()),
        enrichment: None,
        notifier: None,
    };
    let settings = fast_settings();
    let max_attempts = settings.upsert.max_attempts as usize;
    let control = RunControl::new(deps, settings);

    let run = control.run_to_completion(false).await.unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.counters.success_sources, 1);
    assert_eq!(run.counters.failed_sources, 0);
    assert_eq!(run.counters.new_items, 0);
    assert_eq!(run.counters.updated_items, 0);
    assert_eq!(contested.insert_attempts(), 2 * max_attempts);
    assert_eq!(store.count_items().await.unwrap(), 0);

    let entries = store.entries_for_run(run.id).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].status, LedgerStatus::Success);
    assert!(store.source("desk").unwrap().last_error.is_none());
}

#[tokio::test]
async fn source_listing_failure_ends_the_run_in_error() {
    let store = Arc::new(MemoryStore::with_sources([feed_source("desk")]));
    let adapter = Arc::new(MockAdapter::new().on("desk", vec![candidate("https://desk.example/1", 200)]));
    let deps = EngineDeps {
        items: store.clone(),
        ledger: store.clone(),
        sources: Arc::new(BrokenSourceRegistry::new(store.clone(), "registry offline")),
        adapters: adapters_for_all(adapter.clone()),
        content: Arc::new(MockContentFetcher::new()),
        enrichment: None,
        notifier: None,
    };
    let control = RunControl::new(deps, fast_settings());

    let run = control.run_to_completion(false).await.unwrap();

    assert_eq!(run.status, RunStatus::Error);
    assert!(run.completed_at.is_some());
    let message = run.error_message.unwrap();
    assert!(message.contains("unhandled error in feed phase"), "{message}");
    assert!(message.contains("registry offline"), "{message}");
    assert!(adapter.calls().is_empty());

    let stored = store.get_run(run.id).await.unwrap().unwrap();
    assert_eq!(stored.status, RunStatus::Error);
    assert!(control.get_status(StatusQuery::Latest).await.unwrap().is_some_and(|r| !r.live));
}

#[tokio::test]
async fn enrichment_can_be_disabled_per_run() {
    let store = Arc::new(MemoryStore::with_sources([feed_source("desk")]));
    let adapter = Arc::new(MockAdapter::new().on("desk", vec![candidate("https://desk.example/1", 200)]));
    let enrichment = Arc::new(CountingEnrichment::new());
    let control = memory_control(store.clone(), adapter, Some(enrichment.clone()), fast_settings());

    let run = control.run_to_completion(false).await.unwrap();

    assert!(!run.enrichment_enabled);
    assert_eq!(run.counters.enriched_count, 0);
    assert_eq!(enrichment.calls(), 0);
    assert!(!store.item_by_url("https://desk.example/1").unwrap().is_enriched);
}

#[tokio::test]
async fn enrichment_without_a_service_is_downgraded() {
    let store = Arc::new(MemoryStore::with_sources([feed_source("desk")]));
    let adapter = Arc::new(MockAdapter::new().on("desk", vec![candidate("https://desk.example/1", 200)]));
    let control = memory_control(store, adapter, None, fast_settings());

    let run = control.run_to_completion(true).await.unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert!(!run.enrichment_enabled);
}

#[tokio::test]
async fn failed_notification_does_not_fail_the_run() {
    let store = Arc::new(MemoryStore::with_sources([feed_source("desk")]));
    let notifier = Arc::new(RecordingNotifier::failing());
    let deps = EngineDeps::from_store(
        store.clone(),
        adapters_for_all(Arc::new(MockAdapter::new().failing("desk", "gone"))),
        Arc::new(MockContentFetcher::new()),
    )
    .with_notifier(notifier.clone());
    let control = RunControl::new(deps, fast_settings());

    let run = control.run_to_completion(false).await.unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    let sent = notifier.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].run_id, run.id);
    assert_eq!(sent[0].counters.failed_sources, 1);
}

#[tokio::test]
async fn status_reports_orphans_and_source_history() {
    let store = Arc::new(MemoryStore::with_sources([feed_source("desk")]));
    let adapter = Arc::new(MockAdapter::new().on("desk", vec![candidate("https://desk.example/1", 200)]));
    let control = memory_control(store.clone(), adapter, None, fast_settings());

    let run = control.run_to_completion(false).await.unwrap();
    let latest = control.get_status(StatusQuery::Latest).await.unwrap().unwrap();
    assert_eq!(latest.run.id, run.id);
    assert!(!latest.live);
    assert!(!latest.orphaned);
    assert_eq!(latest.sources.len(), 1);

    let summaries = control.source_summaries().await.unwrap();
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].source_name, "desk");
    assert_eq!(summaries[0].item_count, 1);

    let ghost = Run::start(Uuid::new_v4(), false, Utc::now());
    store.seed_run(ghost.clone());
    let report = control.get_status(StatusQuery::Run(ghost.id)).await.unwrap().unwrap();
    assert!(report.orphaned);
    assert!(!report.live);

    assert!(control
        .get_status(StatusQuery::Run(Uuid::new_v4()))
        .await
        .unwrap()
        .is_none());

    let recent = control.list_recent_runs(10).await.unwrap();
    assert_eq!(recent.len(), 2);
    assert_eq!(recent[0].id, ghost.id);
}
