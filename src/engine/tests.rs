use std::path::PathBuf;
use std::sync::Arc;

use ulid::Ulid;

use super::*;
use crate::clock::ManualClock;
use crate::model::HoldStatus;
use crate::store::Duplicate;

const HOLD_MS: Ms = 1_000;

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("holdfast_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn open(path: PathBuf, clock: &Arc<ManualClock>) -> Engine {
    Engine::new(path, HOLD_MS, clock.clone()).unwrap()
}

fn engine(name: &str) -> (Engine, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(0));
    (open(test_wal_path(name), &clock), clock)
}

// ── Register ─────────────────────────────────────────────

#[tokio::test]
async fn register_takes_one_unit() {
    let (engine, _clock) = engine("register.wal");
    let event = engine.create_event("Launch", 3).await.unwrap();
    assert_eq!(event.available_capacity, 3);

    let hold_id = engine.register(event.id, "a@example.com", "k1").await.unwrap();
    let hold = engine.get_hold(hold_id).await.unwrap();
    assert_eq!(hold.status, HoldStatus::Pending);
    assert_eq!(hold.event_id, event.id);
    assert_eq!(hold.expires_at, HOLD_MS);
    assert_eq!(engine.get_event(event.id).await.unwrap().available_capacity, 2);
    engine.audit().await.unwrap();
}

#[tokio::test]
async fn register_on_full_event_is_sold_out() {
    let (engine, _clock) = engine("sold_out.wal");
    let event = engine.create_event("Launch", 1).await.unwrap();
    engine.register(event.id, "a", "k1").await.unwrap();

    let err = engine.register(event.id, "b", "k2").await.unwrap_err();
    assert!(matches!(err, EngineError::SoldOut(id) if id == event.id));
    assert!(err.is_conflict());
    assert_eq!(engine.get_event(event.id).await.unwrap().available_capacity, 0);
}

#[tokio::test]
async fn register_on_missing_event() {
    let (engine, _clock) = engine("missing_event.wal");
    let err = engine.register(Ulid::new(), "a", "k1").await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));
}

#[tokio::test]
async fn reused_idempotency_key_is_rejected_and_unit_returned() {
    let (engine, _clock) = engine("dup_key.wal");
    let e1 = engine.create_event("Launch", 2).await.unwrap();
    let e2 = engine.create_event("Encore", 2).await.unwrap();
    engine.register(e1.id, "a", "k1").await.unwrap();

    // Same key, different holder and a different event.
    let err = engine.register(e2.id, "b", "k1").await.unwrap_err();
    assert!(matches!(err, EngineError::AlreadyRegistered(Duplicate::IdempotencyKey)));
    assert_eq!(engine.get_event(e2.id).await.unwrap().available_capacity, 2);
    engine.audit().await.unwrap();
}

#[tokio::test]
async fn second_active_hold_for_holder_is_rejected() {
    let (engine, _clock) = engine("dup_holder.wal");
    let event = engine.create_event("Launch", 2).await.unwrap();
    engine.register(event.id, "a", "k1").await.unwrap();

    let err = engine.register(event.id, "a", "k2").await.unwrap_err();
    assert!(matches!(err, EngineError::AlreadyRegistered(Duplicate::ActiveHolder)));
    assert_eq!(engine.get_event(event.id).await.unwrap().available_capacity, 1);

    // The aborted unit did not keep its key.
    engine.register(event.id, "b", "k2").await.unwrap();
    engine.audit().await.unwrap();
}

#[tokio::test]
async fn invalid_input_is_rejected_before_any_unit() {
    let (engine, _clock) = engine("invalid.wal");
    assert!(matches!(
        engine.create_event("Launch", 0).await,
        Err(EngineError::InvalidInput(_))
    ));
    assert!(matches!(
        engine.create_event("  ", 5).await,
        Err(EngineError::InvalidInput(_))
    ));
    assert!(matches!(
        engine.create_event(&"x".repeat(MAX_NAME_LEN + 1), 5).await,
        Err(EngineError::LimitExceeded(_))
    ));

    let event = engine.create_event("Launch", 1).await.unwrap();
    assert!(matches!(
        engine.register(event.id, "", "k1").await,
        Err(EngineError::InvalidInput(_))
    ));
    assert!(matches!(
        engine.register(event.id, "a", &"k".repeat(MAX_IDEMPOTENCY_KEY_LEN + 1)).await,
        Err(EngineError::LimitExceeded(_))
    ));
    assert_eq!(engine.get_event(event.id).await.unwrap().available_capacity, 1);
}

// ── Confirm / cancel ─────────────────────────────────────

#[tokio::test]
async fn confirm_finalizes_once() {
    let (engine, clock) = engine("confirm.wal");
    let event = engine.create_event("Launch", 2).await.unwrap();
    let hold_id = engine.register(event.id, "a", "k1").await.unwrap();

    clock.set(HOLD_MS - 1);
    engine.confirm(hold_id, "a").await.unwrap();
    assert_eq!(engine.get_hold(hold_id).await.unwrap().status, HoldStatus::Finalized);

    let err = engine.confirm(hold_id, "a").await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::NotPending { status: HoldStatus::Finalized, .. }
    ));

    // A finalized hold still occupies its unit.
    assert_eq!(engine.get_event(event.id).await.unwrap().available_capacity, 1);
    engine.audit().await.unwrap();
}

#[tokio::test]
async fn confirm_by_another_holder_is_rejected() {
    let (engine, _clock) = engine("wrong_holder.wal");
    let event = engine.create_event("Launch", 1).await.unwrap();
    let hold_id = engine.register(event.id, "a", "k1").await.unwrap();

    assert!(matches!(
        engine.confirm(hold_id, "b").await,
        Err(EngineError::WrongHolder(id)) if id == hold_id
    ));
    assert!(matches!(
        engine.cancel(hold_id, "b").await,
        Err(EngineError::WrongHolder(_))
    ));
    assert_eq!(engine.get_hold(hold_id).await.unwrap().status, HoldStatus::Pending);
}

#[tokio::test]
async fn confirm_unknown_hold() {
    let (engine, _clock) = engine("unknown_hold.wal");
    assert!(matches!(
        engine.confirm(Ulid::new(), "a").await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn confirm_at_deadline_is_expired() {
    let (engine, clock) = engine("confirm_expired.wal");
    let event = engine.create_event("Launch", 1).await.unwrap();
    let hold_id = engine.register(event.id, "a", "k1").await.unwrap();

    clock.set(HOLD_MS);
    let err = engine.confirm(hold_id, "a").await.unwrap_err();
    assert!(matches!(err, EngineError::Expired(id) if id == hold_id));
    assert_eq!(engine.get_hold(hold_id).await.unwrap().status, HoldStatus::Pending);
}

#[tokio::test]
async fn cancel_returns_the_unit() {
    let (engine, _clock) = engine("cancel.wal");
    let event = engine.create_event("Launch", 1).await.unwrap();
    let hold_id = engine.register(event.id, "a", "k1").await.unwrap();

    engine.cancel(hold_id, "a").await.unwrap();
    assert_eq!(engine.get_hold(hold_id).await.unwrap().status, HoldStatus::Released);
    assert_eq!(engine.get_event(event.id).await.unwrap().available_capacity, 1);

    assert!(matches!(
        engine.cancel(hold_id, "a").await,
        Err(EngineError::NotPending { status: HoldStatus::Released, .. })
    ));
    assert!(matches!(
        engine.confirm(hold_id, "a").await,
        Err(EngineError::NotPending { status: HoldStatus::Released, .. })
    ));

    // The holder may come back with a fresh key.
    engine.register(event.id, "a", "k2").await.unwrap();
    engine.audit().await.unwrap();
}

#[tokio::test]
async fn finalized_hold_cannot_be_cancelled() {
    let (engine, _clock) = engine("cancel_finalized.wal");
    let event = engine.create_event("Launch", 1).await.unwrap();
    let hold_id = engine.register(event.id, "a", "k1").await.unwrap();
    engine.confirm(hold_id, "a").await.unwrap();

    assert!(matches!(
        engine.cancel(hold_id, "a").await,
        Err(EngineError::NotPending { status: HoldStatus::Finalized, .. })
    ));
    assert_eq!(engine.get_event(event.id).await.unwrap().available_capacity, 0);
}

// ── Reclaim ──────────────────────────────────────────────

#[tokio::test]
async fn reclaim_releases_only_lapsed_pending_holds() {
    let (engine, clock) = engine("reclaim.wal");
    let event = engine.create_event("Launch", 3).await.unwrap();
    let early = engine.register(event.id, "a", "k1").await.unwrap();
    let confirmed = engine.register(event.id, "b", "k2").await.unwrap();
    engine.confirm(confirmed, "b").await.unwrap();

    clock.set(500);
    let late = engine.register(event.id, "c", "k3").await.unwrap();

    assert_eq!(engine.reclaim_once().await, 0);

    clock.set(HOLD_MS);
    assert_eq!(engine.reclaim_once().await, 1);
    assert_eq!(engine.get_hold(early).await.unwrap().status, HoldStatus::Released);
    assert_eq!(engine.get_hold(confirmed).await.unwrap().status, HoldStatus::Finalized);
    assert_eq!(engine.get_hold(late).await.unwrap().status, HoldStatus::Pending);
    assert_eq!(engine.get_event(event.id).await.unwrap().available_capacity, 1);

    // Nothing left to do until the next deadline.
    assert_eq!(engine.reclaim_once().await, 0);
    clock.set(500 + HOLD_MS);
    assert_eq!(engine.reclaim_once().await, 1);
    assert_eq!(engine.get_event(event.id).await.unwrap().available_capacity, 2);
    engine.audit().await.unwrap();
}

#[tokio::test]
async fn confirm_after_reclaim_fails() {
    let (engine, clock) = engine("confirm_after_reclaim.wal");
    let event = engine.create_event("Launch", 1).await.unwrap();
    let hold_id = engine.register(event.id, "a", "k1").await.unwrap();

    clock.advance(HOLD_MS + 1);
    assert_eq!(engine.reclaim_once().await, 1);
    assert!(matches!(
        engine.confirm(hold_id, "a").await,
        Err(EngineError::NotPending { status: HoldStatus::Released, .. })
    ));

    // The freed unit goes to someone else.
    engine.register(event.id, "b", "k2").await.unwrap();
    assert!(matches!(
        engine.register(event.id, "c", "k3").await,
        Err(EngineError::SoldOut(_))
    ));
}

#[tokio::test]
async fn stale_reclaim_candidate_is_skipped() {
    let (engine, clock) = engine("stale_candidate.wal");
    let event = engine.create_event("Launch", 1).await.unwrap();
    let hold_id = engine.register(event.id, "a", "k1").await.unwrap();

    // The hold was confirmed after a scan picked it up.
    engine.confirm(hold_id, "a").await.unwrap();
    clock.set(HOLD_MS * 2);
    let err = engine.reclaim_hold(hold_id, clock.now_ms()).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::NotPending { status: HoldStatus::Finalized, .. }
    ));
    assert_eq!(engine.reclaim_once().await, 0);
    assert_eq!(engine.get_event(event.id).await.unwrap().available_capacity, 0);
}

#[tokio::test]
async fn live_hold_is_not_reclaimed() {
    let (engine, _clock) = engine("reclaim_live.wal");
    let event = engine.create_event("Launch", 1).await.unwrap();
    let hold_id = engine.register(event.id, "a", "k1").await.unwrap();

    assert!(matches!(
        engine.reclaim_hold(hold_id, HOLD_MS - 1).await,
        Err(EngineError::NotPending { status: HoldStatus::Pending, .. })
    ));
    assert_eq!(engine.get_hold(hold_id).await.unwrap().status, HoldStatus::Pending);
}

// ── Concurrency ──────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_registers_never_oversell() {
    let (engine, _clock) = engine("oversell.wal");
    let engine = Arc::new(engine);
    let event = engine.create_event("Launch", 5).await.unwrap();

    let mut handles = Vec::new();
    for i in 0..100 {
        let eng = engine.clone();
        handles.push(tokio::spawn(async move {
            eng.register(event.id, &format!("user{i}@example.com"), &format!("req-{i}"))
                .await
        }));
    }

    let (mut ok, mut sold_out) = (0, 0);
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => ok += 1,
            Err(EngineError::SoldOut(_)) => sold_out += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(ok, 5);
    assert_eq!(sold_out, 95);
    assert_eq!(engine.get_event(event.id).await.unwrap().available_capacity, 0);
    engine.audit().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_retries_of_one_request_place_one_hold() {
    let (engine, _clock) = engine("retries.wal");
    let engine = Arc::new(engine);
    let event = engine.create_event("Launch", 10).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..20 {
        let eng = engine.clone();
        handles.push(tokio::spawn(async move {
            eng.register(event.id, "a@example.com", "same-request").await
        }));
    }

    let mut ok = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => ok += 1,
            Err(EngineError::AlreadyRegistered(_)) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(ok, 1);
    assert_eq!(engine.get_event(event.id).await.unwrap().available_capacity, 9);
    engine.audit().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_confirm_and_reclaim_agree() {
    let (engine, clock) = engine("confirm_vs_reclaim.wal");
    let engine = Arc::new(engine);
    let event = engine.create_event("Launch", 20).await.unwrap();

    let mut holds = Vec::new();
    for i in 0..20 {
        let holder = format!("user{i}");
        let id = engine.register(event.id, &holder, &format!("req-{i}")).await.unwrap();
        holds.push((id, holder));
    }

    // Half the holders confirm while the reclaimer runs at the deadline.
    clock.set(HOLD_MS);
    let reclaimer = {
        let eng = engine.clone();
        tokio::spawn(async move { eng.reclaim_once().await })
    };
    let mut confirms = Vec::new();
    for (id, holder) in holds.iter().step_by(2).cloned() {
        let eng = engine.clone();
        confirms.push(tokio::spawn(async move { eng.confirm(id, &holder).await }));
    }
    for c in confirms {
        assert!(matches!(c.await.unwrap(), Err(EngineError::Expired(_) | EngineError::NotPending { .. })));
    }
    assert_eq!(reclaimer.await.unwrap(), 20);

    for (id, _) in &holds {
        assert_eq!(engine.get_hold(*id).await.unwrap().status, HoldStatus::Released);
    }
    assert_eq!(engine.get_event(event.id).await.unwrap().available_capacity, 20);
    engine.audit().await.unwrap();
}

// ── Durability ───────────────────────────────────────────

#[tokio::test]
async fn state_survives_restart() {
    let path = test_wal_path("restart.wal");
    let clock = Arc::new(ManualClock::new(0));
    let (event_id, confirmed, cancelled, pending) = {
        let engine = open(path.clone(), &clock);
        let event = engine.create_event("Launch", 4).await.unwrap();
        let confirmed = engine.register(event.id, "a", "k1").await.unwrap();
        let cancelled = engine.register(event.id, "b", "k2").await.unwrap();
        let pending = engine.register(event.id, "c", "k3").await.unwrap();
        engine.confirm(confirmed, "a").await.unwrap();
        engine.cancel(cancelled, "b").await.unwrap();
        (event.id, confirmed, cancelled, pending)
    };

    let engine = open(path, &clock);
    let event = engine.get_event(event_id).await.unwrap();
    assert_eq!(event.name, "Launch");
    assert_eq!(event.total_capacity, 4);
    assert_eq!(event.available_capacity, 2);
    assert_eq!(engine.get_hold(confirmed).await.unwrap().status, HoldStatus::Finalized);
    assert_eq!(engine.get_hold(cancelled).await.unwrap().status, HoldStatus::Released);
    assert_eq!(engine.get_hold(pending).await.unwrap().status, HoldStatus::Pending);

    // Uniqueness survives too: keys stay spent, active holders stay active.
    assert!(matches!(
        engine.register(event_id, "d", "k2").await,
        Err(EngineError::AlreadyRegistered(Duplicate::IdempotencyKey))
    ));
    assert!(matches!(
        engine.register(event_id, "c", "k4").await,
        Err(EngineError::AlreadyRegistered(Duplicate::ActiveHolder))
    ));

    // And the pending hold still lapses.
    clock.set(HOLD_MS);
    assert_eq!(engine.reclaim_once().await, 1);
    engine.audit().await.unwrap();
}

#[tokio::test]
async fn compaction_keeps_state() {
    let path = test_wal_path("engine_compact.wal");
    let clock = Arc::new(ManualClock::new(0));
    let event_id = {
        let engine = open(path.clone(), &clock);
        let event = engine.create_event("Launch", 3).await.unwrap();
        for i in 0..3 {
            let id = engine.register(event.id, &format!("u{i}"), &format!("k{i}")).await.unwrap();
            engine.cancel(id, &format!("u{i}")).await.unwrap();
        }
        engine.register(event.id, "kept", "kept-key").await.unwrap();
        assert_eq!(engine.wal_appends_since_compact().await, 8);

        engine.compact_wal().await.unwrap();
        assert_eq!(engine.wal_appends_since_compact().await, 0);
        event.id
    };

    let engine = open(path, &clock);
    assert_eq!(engine.get_event(event_id).await.unwrap().available_capacity, 2);
    assert!(matches!(
        engine.register(event_id, "new", "k0").await,
        Err(EngineError::AlreadyRegistered(Duplicate::IdempotencyKey))
    ));
    engine.audit().await.unwrap();
}

#[tokio::test]
async fn list_events_is_ordered_by_id() {
    let (engine, _clock) = engine("list.wal");
    assert!(engine.list_events().await.is_empty());
    for name in ["A", "B", "C"] {
        engine.create_event(name, 1).await.unwrap();
    }
    let events = engine.list_events().await;
    assert_eq!(events.len(), 3);
    assert!(events.windows(2).all(|w| w[0].id < w[1].id));
}

// ── Store failures and limits ────────────────────────────

#[tokio::test]
async fn register_after_store_failure_is_retryable_and_leaves_no_trace() {
    let path = test_wal_path("store_down.wal");
    let clock = Arc::new(ManualClock::new(0));
    let engine = open(path.clone(), &clock);
    let event = engine.create_event("Launch", 2).await.unwrap();
    engine.shutdown().await;

    let err = engine.register(event.id, "a@example.com", "k1").await.unwrap_err();
    assert!(matches!(err, EngineError::TransientStore(_)));
    assert!(err.is_retryable());
    assert_eq!(engine.get_event(event.id).await.unwrap().available_capacity, 2);

    // The key was freed with the unit, so a retry is not a duplicate.
    let err = engine.register(event.id, "a@example.com", "k1").await.unwrap_err();
    assert!(matches!(err, EngineError::TransientStore(_)));
    engine.audit().await.unwrap();
    drop(engine);

    let engine = open(path, &clock);
    let hold_id = engine.register(event.id, "a@example.com", "k1").await.unwrap();
    assert_eq!(engine.get_hold(hold_id).await.unwrap().status, HoldStatus::Pending);
    assert_eq!(engine.get_event(event.id).await.unwrap().available_capacity, 1);
    engine.audit().await.unwrap();
}

#[tokio::test]
async fn hold_duration_out_of_range_is_rejected() {
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(0));
    for bad in [0, -1, MAX_HOLD_DURATION_MS + 1] {
        let path = test_wal_path("bad_duration.wal");
        assert!(Engine::new(path, bad, clock.clone()).is_err(), "accepted {bad}ms");
    }
    assert!(Engine::new(test_wal_path("max_duration.wal"), MAX_HOLD_DURATION_MS, clock).is_ok());
}

#[tokio::test]
async fn deadline_past_the_clock_range_is_rejected() {
    let clock = Arc::new(ManualClock::new(0));
    let engine = open(test_wal_path("deadline_overflow.wal"), &clock);
    let event = engine.create_event("Launch", 1).await.unwrap();

    clock.set(Ms::MAX - HOLD_MS + 1);
    assert!(matches!(
        engine.register(event.id, "a", "k1").await,
        Err(EngineError::LimitExceeded(_))
    ));
    assert_eq!(engine.get_event(event.id).await.unwrap().available_capacity, 1);
    engine.audit().await.unwrap();
}
