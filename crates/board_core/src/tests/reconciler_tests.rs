use super::*;
use std::{
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use anyhow::anyhow;
use async_trait::async_trait;
use shared::{
    domain::Stage,
    protocol::{ChangeEvent, ChangeKind},
};
use tokio::sync::Notify;

use crate::{
    distributor::DragIdentity,
    drag::DragPayload,
    policy::ContactDatePolicy,
};

struct TestSource {
    records: Mutex<Vec<Record>>,
    fetches: AtomicUsize,
}

impl TestSource {
    fn new(records: Vec<Record>) -> Self {
        Self {
            records: Mutex::new(records),
            fetches: AtomicUsize::new(0),
        }
    }

    async fn set_records(&self, records: Vec<Record>) {
        *self.records.lock().await = records;
    }

    fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RecordSource for TestSource {
    async fn fetch_records(&self) -> Result<Vec<Record>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self.records.lock().await.clone())
    }

    async fn fetch_stages(&self) -> Result<Vec<Stage>> {
        Ok(Vec::new())
    }
}

struct TestSink {
    fail_with: Option<String>,
    hang: bool,
    release: Option<Arc<Notify>>,
    calls: Arc<Mutex<Vec<(RecordId, StageUpdateRequest)>>>,
}

impl TestSink {
    fn ok() -> Self {
        Self {
            fail_with: None,
            hang: false,
            release: None,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn failing(err: impl Into<String>) -> Self {
        Self {
            fail_with: Some(err.into()),
            ..Self::ok()
        }
    }

    fn hanging() -> Self {
        Self {
            hang: true,
            ..Self::ok()
        }
    }

    fn gated(release: Arc<Notify>) -> Self {
        Self {
            release: Some(release),
            ..Self::ok()
        }
    }

    async fn calls(&self) -> Vec<(RecordId, StageUpdateRequest)> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl MutationSink for TestSink {
    async fn update_record_stage(
        &self,
        record_id: &RecordId,
        update: &StageUpdateRequest,
    ) -> Result<()> {
        self.calls
            .lock()
            .await
            .push((record_id.clone(), update.clone()));
        if self.hang {
            std::future::pending::<()>().await;
        }
        if let Some(release) = &self.release {
            release.notified().await;
        }
        if let Some(err) = &self.fail_with {
            return Err(anyhow!(err.clone()));
        }
        Ok(())
    }
}

fn two_stage_registry() -> StageRegistry {
    StageRegistry::new(vec![Stage::new("new", "New", 0), Stage::new("won", "Won", 1)])
        .expect("registry")
}

fn build(
    records: Vec<Record>,
    sink: TestSink,
    options: BoardOptions,
) -> (Arc<BoardReconciler>, Arc<TestSource>, Arc<TestSink>) {
    let source = Arc::new(TestSource::new(records.clone()));
    let sink = Arc::new(sink);
    let reconciler = Arc::new(BoardReconciler::new(
        two_stage_registry(),
        options,
        source.clone(),
        sink.clone(),
        records,
    ));
    (reconciler, source, sink)
}

fn session(record: &str, source: Slot, dest: Slot) -> DragSession {
    let record_id = RecordId::new(record);
    DragSession {
        active_id: DragIdentity::for_record(&record_id),
        record_id: record_id.clone(),
        source,
        dest,
        payload: DragPayload::card(record_id, None),
    }
}

fn ids(columns: &[Column], column: usize) -> Vec<String> {
    columns[column]
        .cards
        .iter()
        .map(|card| card.record.id.to_string())
        .collect()
}

async fn wait_until_pending(reconciler: &BoardReconciler, record_id: &RecordId) {
    for _ in 0..1_000 {
        if reconciler.is_pending(record_id).await {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("move for {record_id} never became pending");
}

#[tokio::test]
async fn moves_record_to_won_and_persists_once() {
    let (reconciler, _, sink) = build(
        vec![Record::new("r1", Some("new"))],
        TestSink::ok(),
        BoardOptions::default(),
    );
    let mut notices = reconciler.subscribe_notices();

    let outcome = reconciler
        .on_drop(session("r1", Slot::new(0, 0), Slot::new(1, 0)))
        .await;

    assert_eq!(outcome, MoveOutcome::Confirmed);
    let columns = reconciler.columns().await;
    assert!(ids(&columns, 0).is_empty());
    assert_eq!(ids(&columns, 1), vec!["r1"]);
    assert_eq!(
        columns[1].cards[0].record.stage_id,
        Some(StageId::new("won"))
    );

    let calls = sink.calls().await;
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, RecordId::new("r1"));
    assert_eq!(calls[0].1.stage_id, StageId::new("won"));

    match notices.recv().await.expect("notice") {
        BoardNotice::MoveConfirmed {
            record_id,
            stage_name,
            ..
        } => {
            assert_eq!(record_id, RecordId::new("r1"));
            assert_eq!(stage_name, "Won");
        }
        other => panic!("unexpected notice: {other:?}"),
    }
    assert!(!reconciler.is_pending(&RecordId::new("r1")).await);
}

#[tokio::test]
async fn failed_persistence_restores_board_and_notifies() {
    let (reconciler, _, sink) = build(
        vec![Record::new("r1", Some("new"))],
        TestSink::failing("permission denied"),
        BoardOptions::default(),
    );
    let before = reconciler.columns().await;
    let mut notices = reconciler.subscribe_notices();

    let outcome = reconciler
        .on_drop(session("r1", Slot::new(0, 0), Slot::new(1, 0)))
        .await;

    assert!(matches!(
        outcome,
        MoveOutcome::RolledBack(PersistError::Rejected(ref message)) if message.contains("permission denied")
    ));
    assert_eq!(reconciler.columns().await, before);
    assert_eq!(sink.calls().await.len(), 1);

    let notice = notices.recv().await.expect("notice");
    assert!(matches!(notice, BoardNotice::MoveFailed { .. }));
    assert!(notices.try_recv().is_err());
}

#[tokio::test]
async fn dropping_on_source_slot_is_noop() {
    let (reconciler, _, sink) = build(
        vec![Record::new("r1", Some("new")), Record::new("r2", Some("new"))],
        TestSink::ok(),
        BoardOptions::default(),
    );
    let before = reconciler.columns().await;

    let outcome = reconciler
        .on_drop(session("r2", Slot::new(0, 1), Slot::new(0, 1)))
        .await;

    assert_eq!(outcome, MoveOutcome::Noop);
    assert_eq!(reconciler.columns().await, before);
    assert!(sink.calls().await.is_empty());
}

#[tokio::test]
async fn failed_persistence_rolls_back_to_original_index() {
    let (reconciler, _, _) = build(
        vec![
            Record::new("a", Some("new")),
            Record::new("b", Some("new")),
            Record::new("c", Some("new")),
            Record::new("x", Some("won")),
        ],
        TestSink::failing("boom"),
        BoardOptions::default(),
    );

    let outcome = reconciler
        .on_drop(session("b", Slot::new(0, 1), Slot::new(1, 0)))
        .await;
    assert!(matches!(outcome, MoveOutcome::RolledBack(_)));

    let columns = reconciler.columns().await;
    assert_eq!(ids(&columns, 0), vec!["a", "b", "c"]);
    assert_eq!(ids(&columns, 1), vec!["x"]);
    assert_eq!(
        columns[0].cards[1].record.stage_id,
        Some(StageId::new("new"))
    );
}

#[tokio::test(start_paused = true)]
async fn persistence_timeout_counts_as_failure() {
    let options = BoardOptions {
        persist_timeout: Duration::from_millis(50),
        ..BoardOptions::default()
    };
    let (reconciler, _, _) = build(
        vec![Record::new("r1", Some("new"))],
        TestSink::hanging(),
        options,
    );

    let outcome = reconciler
        .on_drop(session("r1", Slot::new(0, 0), Slot::new(1, 0)))
        .await;

    assert_eq!(
        outcome,
        MoveOutcome::RolledBack(PersistError::TimedOut(Duration::from_millis(50)))
    );
    let columns = reconciler.columns().await;
    assert_eq!(ids(&columns, 0), vec!["r1"]);
    assert!(ids(&columns, 1).is_empty());
}

#[tokio::test]
async fn reorder_within_stage_stays_local() {
    let (reconciler, _, sink) = build(
        vec![
            Record::new("a", Some("new")),
            Record::new("b", Some("new")),
            Record::new("c", Some("new")),
        ],
        TestSink::ok(),
        BoardOptions::default(),
    );

    let outcome = reconciler
        .on_drop(session("a", Slot::new(0, 0), Slot::new(0, 2)))
        .await;

    assert_eq!(outcome, MoveOutcome::Reordered);
    assert_eq!(ids(&reconciler.columns().await, 0), vec!["b", "c", "a"]);
    assert!(sink.calls().await.is_empty());
}

#[tokio::test]
async fn rejects_session_for_missing_record_or_column() {
    let (reconciler, _, sink) = build(
        vec![Record::new("r1", Some("new"))],
        TestSink::ok(),
        BoardOptions::default(),
    );

    let outcome = reconciler
        .on_drop(session("ghost", Slot::new(0, 0), Slot::new(1, 0)))
        .await;
    assert_eq!(
        outcome,
        MoveOutcome::Rejected(DragError::UnknownRecord(RecordId::new("ghost")))
    );

    let outcome = reconciler
        .on_drop(session("r1", Slot::new(0, 0), Slot::new(7, 0)))
        .await;
    assert_eq!(outcome, MoveOutcome::Rejected(DragError::UnknownColumn(7)));
    assert!(sink.calls().await.is_empty());
}

#[tokio::test]
async fn stale_source_index_is_resolved_by_record_id() {
    let (reconciler, _, _) = build(
        vec![Record::new("a", Some("new")), Record::new("b", Some("new"))],
        TestSink::ok(),
        BoardOptions::default(),
    );

    let outcome = reconciler
        .on_drop(session("b", Slot::new(0, 0), Slot::new(1, 0)))
        .await;

    assert_eq!(outcome, MoveOutcome::Confirmed);
    let columns = reconciler.columns().await;
    assert_eq!(ids(&columns, 0), vec!["a"]);
    assert_eq!(ids(&columns, 1), vec!["b"]);
}

#[tokio::test]
async fn contact_policy_stamps_moved_record() {
    let options = BoardOptions {
        contact_policy: ContactDatePolicy::new().with_rule("won", 0),
        ..BoardOptions::default()
    };
    let (reconciler, _, sink) = build(vec![Record::new("r1", Some("new"))], TestSink::ok(), options);

    reconciler
        .on_drop(session("r1", Slot::new(0, 0), Slot::new(1, 0)))
        .await;

    let calls = sink.calls().await;
    assert!(calls[0].1.last_contact_at.is_some());
    let columns = reconciler.columns().await;
    assert_eq!(
        columns[1].cards[0].record.last_contact_at,
        calls[0].1.last_contact_at
    );
}

#[tokio::test]
async fn oversized_contact_offset_moves_without_stamping() {
    let options = BoardOptions {
        contact_policy: ContactDatePolicy::new().with_rule("won", 1_000_000_000),
        ..BoardOptions::default()
    };
    let (reconciler, _, sink) = build(vec![Record::new("r1", Some("new"))], TestSink::ok(), options);

    let outcome = reconciler
        .on_drop(session("r1", Slot::new(0, 0), Slot::new(1, 0)))
        .await;

    assert_eq!(outcome, MoveOutcome::Confirmed);
    let calls = sink.calls().await;
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].1.last_contact_at, None);
    assert_eq!(ids(&reconciler.columns().await, 1), vec!["r1"]);
}

#[tokio::test]
async fn change_event_for_other_record_rederives_board() {
    let (reconciler, source, _) = build(
        vec![Record::new("r1", Some("new"))],
        TestSink::ok(),
        BoardOptions::default(),
    );
    source
        .set_records(vec![
            Record::new("r1", Some("new")),
            Record::new("r2", Some("won")),
        ])
        .await;

    reconciler
        .invalidate(FeedSignal::Event(ChangeEvent::RecordChanged {
            kind: ChangeKind::Insert,
            record_id: RecordId::new("r2"),
        }))
        .await
        .expect("invalidate");

    let columns = reconciler.columns().await;
    assert_eq!(ids(&columns, 0), vec!["r1"]);
    assert_eq!(ids(&columns, 1), vec!["r2"]);
    assert_eq!(source.fetches(), 1);
}

#[tokio::test]
async fn change_event_for_pending_record_waits_for_local_result() {
    let release = Arc::new(Notify::new());
    let (reconciler, source, _) = build(
        vec![Record::new("r1", Some("new")), Record::new("r2", Some("new"))],
        TestSink::gated(release.clone()),
        BoardOptions::default(),
    );
    let r1 = RecordId::new("r1");

    let dropping = {
        let reconciler = reconciler.clone();
        tokio::spawn(async move {
            reconciler
                .on_drop(session("r1", Slot::new(0, 0), Slot::new(1, 0)))
                .await
        })
    };
    wait_until_pending(&reconciler, &r1).await;

    // The backend still reports the old stage while the write is in flight.
    reconciler
        .invalidate(FeedSignal::Event(ChangeEvent::RecordChanged {
            kind: ChangeKind::Update,
            record_id: r1.clone(),
        }))
        .await
        .expect("invalidate pending");
    assert_eq!(source.fetches(), 0);

    // Events for other records re-derive, keeping the optimistic move.
    reconciler
        .invalidate(FeedSignal::Lagged(3))
        .await
        .expect("invalidate lagged");
    assert_eq!(source.fetches(), 1);
    let columns = reconciler.columns().await;
    assert_eq!(ids(&columns, 0), vec!["r2"]);
    assert_eq!(ids(&columns, 1), vec!["r1"]);

    source
        .set_records(vec![
            Record::new("r1", Some("won")),
            Record::new("r2", Some("new")),
        ])
        .await;
    release.notify_one();
    let outcome = dropping.await.expect("join");

    assert_eq!(outcome, MoveOutcome::Confirmed);
    assert_eq!(source.fetches(), 2);
    let columns = reconciler.columns().await;
    assert_eq!(ids(&columns, 0), vec!["r2"]);
    assert_eq!(ids(&columns, 1), vec!["r1"]);
}

#[tokio::test]
async fn deferred_event_after_failed_write_shows_backend_state() {
    let release = Arc::new(Notify::new());
    let sink = TestSink {
        fail_with: Some("gateway timeout".into()),
        ..TestSink::gated(release.clone())
    };
    let (reconciler, source, _) = build(
        vec![Record::new("r1", Some("new")), Record::new("r2", Some("new"))],
        sink,
        BoardOptions::default(),
    );
    let mut notices = reconciler.subscribe_notices();
    let r1 = RecordId::new("r1");

    let dropping = {
        let reconciler = reconciler.clone();
        tokio::spawn(async move {
            reconciler
                .on_drop(session("r1", Slot::new(0, 0), Slot::new(1, 0)))
                .await
        })
    };
    wait_until_pending(&reconciler, &r1).await;

    reconciler
        .invalidate(FeedSignal::Event(ChangeEvent::RecordChanged {
            kind: ChangeKind::Update,
            record_id: r1.clone(),
        }))
        .await
        .expect("invalidate pending");
    assert_eq!(source.fetches(), 0);

    // The write landed on the backend even though the call reported failure.
    source
        .set_records(vec![
            Record::new("r1", Some("won")),
            Record::new("r2", Some("new")),
        ])
        .await;
    release.notify_one();
    let outcome = dropping.await.expect("join");

    assert!(matches!(
        outcome,
        MoveOutcome::RolledBack(PersistError::Rejected(ref message)) if message.contains("gateway timeout")
    ));
    assert_eq!(source.fetches(), 1);
    assert!(!reconciler.is_pending(&r1).await);
    let columns = reconciler.columns().await;
    assert_eq!(ids(&columns, 0), vec!["r2"]);
    assert_eq!(ids(&columns, 1), vec!["r1"]);

    assert!(matches!(
        notices.recv().await.expect("notice"),
        BoardNotice::MoveFailed { ref record_id, .. } if record_id == &r1
    ));
    assert_eq!(
        notices.recv().await.expect("notice"),
        BoardNotice::Refreshed { records: 2 }
    );
}

#[tokio::test]
async fn timed_out_write_with_deferred_event_rolls_back_then_refreshes() {
    let options = BoardOptions {
        persist_timeout: Duration::from_millis(50),
        ..BoardOptions::default()
    };
    let (reconciler, source, _) = build(
        vec![Record::new("r1", Some("new"))],
        TestSink::hanging(),
        options,
    );
    let r1 = RecordId::new("r1");

    let dropping = {
        let reconciler = reconciler.clone();
        tokio::spawn(async move {
            reconciler
                .on_drop(session("r1", Slot::new(0, 0), Slot::new(1, 0)))
                .await
        })
    };
    wait_until_pending(&reconciler, &r1).await;
    reconciler
        .invalidate(FeedSignal::Event(ChangeEvent::RecordChanged {
            kind: ChangeKind::Update,
            record_id: r1.clone(),
        }))
        .await
        .expect("invalidate pending");

    let outcome = dropping.await.expect("join");

    assert_eq!(
        outcome,
        MoveOutcome::RolledBack(PersistError::TimedOut(Duration::from_millis(50)))
    );
    assert_eq!(source.fetches(), 1);
    let columns = reconciler.columns().await;
    assert_eq!(ids(&columns, 0), vec!["r1"]);
    assert!(ids(&columns, 1).is_empty());
}

#[test]
fn rejected_outcomes_can_be_cloned() {
    let outcome = MoveOutcome::Rejected(DragError::PendingMutation(RecordId::new("r1")));
    assert_eq!(outcome.clone(), outcome);
}

#[tokio::test]
async fn refresh_failure_is_reported_and_keeps_last_state() {
    struct FailingSource;

    #[async_trait]
    impl RecordSource for FailingSource {
        async fn fetch_records(&self) -> Result<Vec<Record>> {
            Err(anyhow!("network unreachable"))
        }

        async fn fetch_stages(&self) -> Result<Vec<Stage>> {
            Err(anyhow!("network unreachable"))
        }
    }

    let reconciler = BoardReconciler::new(
        two_stage_registry(),
        BoardOptions::default(),
        Arc::new(FailingSource),
        Arc::new(TestSink::ok()),
        vec![Record::new("r1", Some("won"))],
    );
    let mut notices = reconciler.subscribe_notices();

    assert!(reconciler.refresh().await.is_err());
    assert_eq!(ids(&reconciler.columns().await, 1), vec!["r1"]);
    assert!(matches!(
        notices.recv().await.expect("notice"),
        BoardNotice::RefreshFailed(_)
    ));
}
