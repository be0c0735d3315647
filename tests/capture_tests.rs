use std::sync::Arc;

use chrono::Utc;
use rosterharvest::{
    CancelToken, CaptureStatus, Dataset, DatasetKind, FetchError, Harvester, KeyValueStore,
    MemoryStore, SqliteStore,
    notify::{NoopNotifier, Notification, Notifier},
    table::field,
};
use spectral::prelude::*;

use crate::scrape_extras::{
    ADS_NAME, RecordingNotifier, StubPortal, offering_ids, offerings_portal, selection, test_config,
};

mod scrape_extras;

fn stored_dataset(harvester: &Harvester, kind: DatasetKind) -> Dataset {
    let snapshot = harvester
        .snapshots()
        .read(kind)
        .expect("Expected read.")
        .expect("Expected a stored snapshot.");
    Dataset::from_blob(&snapshot.blob).expect("Expected a readable blob.")
}

fn ids_of(dataset: &Dataset) -> Vec<String> {
    dataset
        .records
        .iter()
        .map(|record| field(record, "ID Oferta").to_string())
        .collect()
}

#[tokio::test]
async fn capture_with_one_failed_row_is_saved_with_row_errors() {
    let ids = offering_ids(25);
    let (_, source) = offerings_portal(&ids)
        .fail_for(
            "listarProfessoresOferta",
            ("idOferta", "1007"),
            FetchError::HttpStatus(502),
        )
        .into_source();
    let notifier = Arc::new(RecordingNotifier::default());
    let harvester = Harvester::new(
        test_config(10),
        source,
        Arc::new(MemoryStore::new()),
        notifier.clone(),
    );

    let report = harvester
        .capture(
            DatasetKind::Offerings,
            &selection(&[("course", "ADS")]),
            &CancelToken::new(),
        )
        .await;

    assert_that(&report.status).is_equal_to(CaptureStatus::SavedWithRowErrors);
    assert_that(&report.partial).is_false();
    assert_that(&report.captured).is_equal_to(25);
    assert_that(&report.row_errors).has_length(1);
    assert_that(&report.saved).is_some();
    assert_that(&report.summary().contains("with 1 row errors")).is_true();

    let stored = stored_dataset(&harvester, DatasetKind::Offerings);
    assert_that(&stored.len()).is_equal_to(25);
    assert_that(&stored.headers.contains(&"Ocupação".to_string())).is_false();
    let failed = stored.records.get(7).expect("Expected row 7.");
    assert_that(&field(failed, "Professor")).is_equal_to("");
    assert_that(&field(failed, "Curso Selecionado")).is_equal_to(ADS_NAME);

    let progress: Vec<u8> = notifier
        .received()
        .iter()
        .filter_map(|n| n.progress)
        .collect();
    assert_that(&progress).is_equal_to(vec![40, 80, 100]);
}

#[tokio::test]
async fn second_capture_merges_into_the_stored_snapshot() {
    let store: Arc<dyn KeyValueStore> = Arc::new(SqliteStore::in_memory().expect("Expected database."));

    let (_, first_source) = offerings_portal(&[1, 2, 3]).into_source();
    let first = Harvester::new(test_config(10), first_source, Arc::clone(&store), Arc::new(NoopNotifier));
    let report = first
        .capture(DatasetKind::Offerings, &selection(&[("course", "ADS")]), &CancelToken::new())
        .await;
    assert_that(&report.status).is_equal_to(CaptureStatus::Saved);

    let (_, second_source) = offerings_portal(&[3, 4]).into_source();
    let second = Harvester::new(test_config(10), second_source, Arc::clone(&store), Arc::new(NoopNotifier));
    let report = second
        .capture(DatasetKind::Offerings, &selection(&[("course", "ADS")]), &CancelToken::new())
        .await;

    assert_that(&report.status).is_equal_to(CaptureStatus::Saved);
    let merge = report.merge.expect("Expected merge bookkeeping.");
    assert_that(&merge.records).is_equal_to(4);
    assert_that(&merge.replaced).is_equal_to(1);
    assert_that(&merge.kept).is_equal_to(2);
    assert_that(&ids_of(&stored_dataset(&second, DatasetKind::Offerings))).is_equal_to(vec![
        "3".to_string(),
        "4".to_string(),
        "1".to_string(),
        "2".to_string(),
    ]);
    assert_that(&second.snapshots().read(DatasetKind::Students).expect("Expected read.")).is_none();
}

#[tokio::test]
async fn reference_cache_is_persisted_with_the_capture() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let (_, source) = offerings_portal(&[1]).into_source();
    let harvester = Harvester::new(test_config(10), source, Arc::clone(&store), Arc::new(NoopNotifier));

    harvester
        .capture(DatasetKind::Offerings, &selection(&[]), &CancelToken::new())
        .await;

    let (_, idle_source) = StubPortal::new().into_source();
    let restarted = Harvester::new(test_config(10), idle_source, store, Arc::new(NoopNotifier));
    let cache = restarted.cache();
    let cache = cache.lock().expect("Expected cache.");
    assert_that(&cache.get("ADS")).is_equal_to(ADS_NAME);
}

#[tokio::test]
async fn failed_root_listing_saves_nothing() {
    let (_, source) = StubPortal::new()
        .fail("listarOfertas", FetchError::Timeout(1_000))
        .into_source();
    let harvester = Harvester::new(test_config(10), source, Arc::new(MemoryStore::new()), Arc::new(NoopNotifier));

    let report = harvester
        .capture(DatasetKind::Offerings, &selection(&[]), &CancelToken::new())
        .await;

    assert_that(&report.status).is_equal_to(CaptureStatus::Failed);
    assert_that(&report.summary().contains("failed")).is_true();
    assert_that(&harvester.snapshots().read(DatasetKind::Offerings).expect("Expected read.")).is_none();
}

#[tokio::test]
async fn missing_key_column_is_captured_but_not_saved() {
    let mut config = test_config(10);
    config.offerings.key_candidates = vec!["Código Oferta".to_string()];
    let (_, source) = offerings_portal(&[1, 2]).into_source();
    let harvester = Harvester::new(config, source, Arc::new(MemoryStore::new()), Arc::new(NoopNotifier));

    let report = harvester
        .capture(DatasetKind::Offerings, &selection(&[]), &CancelToken::new())
        .await;

    assert_that(&report.status).is_equal_to(CaptureStatus::NotSaved);
    assert_that(&report.captured).is_equal_to(2);
    assert_that(&report.summary().contains("NOT saved")).is_true();
    assert_that(&harvester.snapshots().read(DatasetKind::Offerings).expect("Expected read.")).is_none();
}

#[tokio::test]
async fn unreadable_stored_snapshot_is_not_overwritten() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    store
        .set(&[
            ("snapshot.offerings.blob", "ID Oferta\r\n9\r\n"),
            ("snapshot.offerings.captured_at", "not a timestamp"),
        ])
        .expect("Expected write.");
    let (_, source) = offerings_portal(&[1]).into_source();
    let harvester = Harvester::new(test_config(10), source, Arc::clone(&store), Arc::new(NoopNotifier));

    let report = harvester
        .capture(DatasetKind::Offerings, &selection(&[]), &CancelToken::new())
        .await;

    assert_that(&report.status).is_equal_to(CaptureStatus::NotSaved);
    let values = store.get(&["snapshot.offerings.blob"]).expect("Expected read.");
    assert_that(&values.get("snapshot.offerings.blob").map(String::as_str))
        .is_equal_to(Some("ID Oferta\r\n9\r\n"));
}

#[tokio::test]
async fn cancelled_capture_saves_completed_rows_as_partial() {
    let ids = offering_ids(9);
    let (_, source) = offerings_portal(&ids).into_source();
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let cancel = CancelToken::new();
    let harvester = Harvester::new(
        test_config(3),
        source,
        Arc::clone(&store),
        Arc::new(CancelOnProgress(cancel.clone())),
    );

    let report = harvester
        .capture(DatasetKind::Offerings, &selection(&[]), &cancel)
        .await;

    assert_that(&report.partial).is_true();
    assert_that(&report.captured).is_equal_to(3);
    assert_that(&report.total_rows).is_equal_to(9);
    assert_that(&report.status).is_equal_to(CaptureStatus::Saved);
    assert_that(&report.summary().contains("partial")).is_true();
    assert_that(&stored_dataset(&harvester, DatasetKind::Offerings).len()).is_equal_to(3);
}

#[tokio::test]
async fn cancelled_before_start_is_a_failure() {
    let (portal, source) = offerings_portal(&[1]).into_source();
    let harvester = Harvester::new(test_config(3), source, Arc::new(MemoryStore::new()), Arc::new(NoopNotifier));
    let cancel = CancelToken::new();
    cancel.cancel();

    let report = harvester
        .capture(DatasetKind::Offerings, &selection(&[]), &cancel)
        .await;

    assert_that(&report.status).is_equal_to(CaptureStatus::Failed);
    assert_that(&portal.requests()).is_empty();
}

#[tokio::test]
async fn clear_removes_only_the_requested_slot() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let (_, source) = offerings_portal(&[1]).into_source();
    let harvester = Harvester::new(test_config(3), source, Arc::clone(&store), Arc::new(NoopNotifier));
    harvester
        .snapshots()
        .write(DatasetKind::Students, "RGM\r\n1\r\n", Utc::now())
        .expect("Expected write.");
    harvester
        .capture(DatasetKind::Offerings, &selection(&[]), &CancelToken::new())
        .await;

    harvester.clear(DatasetKind::Offerings).expect("Expected clear.");

    assert_that(&harvester.snapshots().read(DatasetKind::Offerings).expect("Expected read.")).is_none();
    assert_that(&harvester.snapshots().read(DatasetKind::Students).expect("Expected read.")).is_some();
    let view = harvester
        .view(DatasetKind::Offerings, &[], None)
        .expect("Expected a view.");
    assert_that(&view.is_empty()).is_true();
}

/// Notifier that trips a cancel token on the first progress report.
struct CancelOnProgress(CancelToken);

impl Notifier for CancelOnProgress {
    fn notify(&self, notification: Notification) {
        if notification.progress.is_some() {
            self.0.cancel();
        }
    }
}
