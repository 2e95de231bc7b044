//! Status polling and the delayed resolution queue driven by a manual clock.

mod common;

use async_trait::async_trait;
use bima_backend::clock::Clock;
use bima_backend::database::payment_request_repository::{
    PaymentRequestStore, PROVISIONAL_RECEIPT_PREFIX,
};
use bima_backend::database::resolution_job_repository::ResolutionJobStore;
use bima_backend::payments::error::PaymentError;
use bima_backend::payments::types::{
    GatewayStatus, PaymentOutcome, PaymentStatus, ResolutionSource,
};
use bima_backend::services::callback_processor::CallbackProcessor;
use bima_backend::services::status_poller::{PollOutcome, PollerConfig, StatusPoller, Ticker};
use bima_backend::workers::delayed_resolution::{
    DelayedResolutionConfig, DelayedResolutionWorker,
};
use common::{callback_body, Harness};
use std::time::Duration;
use tokio::sync::watch;

/// Ticks immediately, reporting a fixed step.
struct InstantTicker;

#[async_trait]
impl Ticker for InstantTicker {
    async fn tick(&mut self) -> Duration {
        tokio::task::yield_now().await;
        Duration::from_secs(2)
    }
}

/// Never ticks.
struct StalledTicker;

#[async_trait]
impl Ticker for StalledTicker {
    async fn tick(&mut self) -> Duration {
        std::future::pending::<()>().await;
        Duration::ZERO
    }
}

fn worker(h: &Harness) -> DelayedResolutionWorker {
    DelayedResolutionWorker::new(
        h.orchestrator.clone(),
        h.store.clone(),
        h.jobs.clone(),
        DelayedResolutionConfig::default(),
    )
}

fn poller_config(max_attempts: u32) -> PollerConfig {
    PollerConfig {
        interval: Duration::from_secs(2),
        max_attempts,
    }
}

fn success_without_receipt() -> GatewayStatus {
    GatewayStatus::Resolved(PaymentOutcome::from_result_code(
        "0",
        Some("The service request is processed successfully.".to_string()),
        None,
    ))
}

/// Move the clock to the next attempt of the single queued job.
fn advance_to_next_attempt(h: &Harness) {
    let jobs = h.jobs.all();
    assert_eq!(jobs.len(), 1);
    let wait = jobs[0].next_attempt_at - h.clock.now();
    h.advance_secs(wait.num_seconds().max(0));
}

#[tokio::test]
async fn timed_out_poll_is_resolved_later_by_the_queue() {
    let h = Harness::new();
    let request = h.orchestrator.initiate(h.daily("late-daily", 1)).await.unwrap().request;
    let (_cancel_tx, cancel_rx) = watch::channel(false);

    let outcome = StatusPoller::with_ticker(h.orchestrator.clone(), InstantTicker, poller_config(3))
        .poll(request.id, cancel_rx)
        .await
        .unwrap();

    match outcome {
        PollOutcome::Delayed {
            view,
            classification,
            next_attempt_at,
            state,
        } => {
            assert_eq!(view.status, PaymentStatus::Pending);
            assert!(classification.is_timeout);
            assert_eq!(next_attempt_at, request.created_at + chrono::Duration::seconds(30));
            assert_eq!(state.attempt, 3);
            assert_eq!(state.elapsed, Duration::from_secs(6));
        }
        other => panic!("expected delayed outcome, got {:?}", other),
    }
    assert_eq!(h.gateway.query_count(), 1);
    assert_eq!(h.jobs.all().len(), 1);

    // First background attempt: provider is still processing.
    h.advance_secs(30);
    let report = worker(&h).run_cycle().await.unwrap();
    assert_eq!(report.claimed, 1);
    assert_eq!(report.rescheduled, 1);
    let job = h.jobs.all().remove(0);
    assert_eq!(job.attempts, 1);
    assert_eq!(job.next_attempt_at, h.clock.now() + chrono::Duration::seconds(60));
    assert_eq!(job.last_error.as_deref(), Some("still processing at provider"));

    // Second attempt: provider confirms without a receipt.
    h.gateway.script_query(Ok(success_without_receipt()));
    h.advance_secs(60);
    let report = worker(&h).run_cycle().await.unwrap();
    assert_eq!(report.resolved, 1);
    assert!(h.jobs.all().is_empty());

    let stored = h.store.find_by_id(request.id).await.unwrap().unwrap();
    assert_eq!(stored.status(), PaymentStatus::Completed);
    assert_eq!(stored.resolution_source.as_deref(), Some("reconciliation"));
    assert_eq!(
        stored.mpesa_receipt_number,
        Some(format!("{}{}", PROVISIONAL_RECEIPT_PREFIX, request.checkout_request_id))
    );
    let wallet = h.ledger.wallet(h.wallet_id).unwrap();
    assert_eq!(wallet.daily_payments_count, 1);
    assert_eq!(wallet.balance, 87);

    // The provider's callback eventually arrives with the real receipt.
    let body = callback_body(&request.checkout_request_id, 0, Some("RKT4Q8ZL1"), 87);
    CallbackProcessor::new(h.orchestrator.clone())
        .process_callback(body.to_string().as_bytes())
        .await
        .unwrap();

    let stored = h.store.find_by_id(request.id).await.unwrap().unwrap();
    assert_eq!(stored.mpesa_receipt_number.as_deref(), Some("RKT4Q8ZL1"));
    assert_eq!(h.ledger.effect_count(), 1);
    assert_eq!(h.notifier.delivered(1).await.len(), 1);
}

#[tokio::test]
async fn poller_returns_as_soon_as_the_request_is_terminal() {
    let h = Harness::new();
    let request = h.orchestrator.initiate(h.deposit("poll-done")).await.unwrap().request;
    h.orchestrator
        .apply_outcome(
            request.id,
            PaymentOutcome::completed("POLL1"),
            ResolutionSource::Callback,
        )
        .await
        .unwrap();
    let (_cancel_tx, cancel_rx) = watch::channel(false);

    let outcome = StatusPoller::with_ticker(h.orchestrator.clone(), InstantTicker, poller_config(30))
        .poll(request.id, cancel_rx)
        .await
        .unwrap();

    match outcome {
        PollOutcome::Resolved { view, state } => {
            assert_eq!(view.status, PaymentStatus::Completed);
            assert_eq!(view.receipt_number.as_deref(), Some("POLL1"));
            assert_eq!(state.attempt, 1);
        }
        other => panic!("expected resolution, got {:?}", other),
    }
    assert_eq!(h.gateway.query_count(), 0);
}

#[tokio::test]
async fn cancelling_the_poller_leaves_the_request_alive() {
    let h = Harness::new();
    let request = h.orchestrator.initiate(h.deposit("poll-cancel")).await.unwrap().request;
    let (cancel_tx, cancel_rx) = watch::channel(false);

    let poll = tokio::spawn(
        StatusPoller::with_ticker(h.orchestrator.clone(), StalledTicker, poller_config(30))
            .poll(request.id, cancel_rx),
    );
    cancel_tx.send(true).unwrap();

    let outcome = poll.await.unwrap().unwrap();
    assert!(matches!(outcome, PollOutcome::Cancelled { .. }));
    assert_eq!(h.gateway.query_count(), 0);
    assert!(h.jobs.all().is_empty());

    let body = callback_body(&request.checkout_request_id, 0, Some("LATECB1"), 1048);
    CallbackProcessor::new(h.orchestrator.clone())
        .process_callback(body.to_string().as_bytes())
        .await
        .unwrap();
    let view = h.orchestrator.get_status(request.id).await.unwrap();
    assert_eq!(view.status, PaymentStatus::Completed);
    assert!(h.ledger.wallet(h.wallet_id).unwrap().deposit_paid);
}

#[tokio::test]
async fn exhausted_job_is_flagged_and_cleared_by_a_late_callback() {
    let h = Harness::new();
    let request = h.orchestrator.initiate(h.deposit("exhaust")).await.unwrap().request;
    h.orchestrator.defer_resolution(request.id).await.unwrap();
    let worker = worker(&h);

    for attempt in 1..5 {
        advance_to_next_attempt(&h);
        let report = worker.run_cycle().await.unwrap();
        assert_eq!(report.rescheduled, 1, "attempt {}", attempt);
    }
    advance_to_next_attempt(&h);
    let report = worker.run_cycle().await.unwrap();
    assert_eq!(report.flagged, 1);
    assert!(h.jobs.all().is_empty());
    assert_eq!(h.gateway.query_count(), 5);

    let flagged = h.orchestrator.list_reconciliation(100).await.unwrap();
    assert_eq!(flagged.len(), 1);
    assert_eq!(flagged[0].id, request.id);
    assert_eq!(flagged[0].status, PaymentStatus::Pending);
    assert!(flagged[0].needs_reconciliation);
    assert!(flagged[0]
        .reconciliation_reason
        .as_deref()
        .unwrap()
        .starts_with("no resolution after 5 attempts"));

    // Flagged rows are not picked up again by the stale scan.
    h.advance_secs(3600);
    let report = worker.run_cycle().await.unwrap();
    assert_eq!(report.enqueued_stale, 0);

    let body = callback_body(&request.checkout_request_id, 0, Some("FLAG0K1"), 1048);
    CallbackProcessor::new(h.orchestrator.clone())
        .process_callback(body.to_string().as_bytes())
        .await
        .unwrap();

    assert!(h.orchestrator.list_reconciliation(100).await.unwrap().is_empty());
    assert_eq!(h.ledger.wallet(h.wallet_id).unwrap().balance, 1048);
}

#[tokio::test]
async fn provider_rejection_of_the_query_flags_immediately() {
    let h = Harness::new();
    let request = h.orchestrator.initiate(h.deposit("reject")).await.unwrap().request;
    h.orchestrator.defer_resolution(request.id).await.unwrap();

    h.gateway.script_query(Err(PaymentError::ProviderError {
        provider: "mpesa".to_string(),
        message: "Invalid CheckoutRequestID".to_string(),
        provider_code: Some("400.002.02".to_string()),
        retryable: false,
    }));
    h.advance_secs(30);
    let report = worker(&h).run_cycle().await.unwrap();

    assert_eq!(report.flagged, 1);
    assert!(h.jobs.all().is_empty());
    let flagged = h.orchestrator.list_reconciliation(10).await.unwrap();
    assert_eq!(flagged.len(), 1);
    assert!(flagged[0]
        .reconciliation_reason
        .as_deref()
        .unwrap()
        .contains("400.002.02"));
}

#[tokio::test]
async fn transient_query_errors_back_off_instead_of_flagging() {
    let h = Harness::new();
    let request = h.orchestrator.initiate(h.deposit("transient")).await.unwrap().request;
    h.orchestrator.defer_resolution(request.id).await.unwrap();

    h.gateway.script_query(Err(PaymentError::NetworkError {
        message: "connection reset".to_string(),
    }));
    h.advance_secs(30);
    let report = worker(&h).run_cycle().await.unwrap();

    assert_eq!(report.rescheduled, 1);
    assert_eq!(report.flagged, 0);
    let job = h.jobs.all().remove(0);
    assert_eq!(job.attempts, 1);
    assert!(job.last_error.unwrap().contains("connection reset"));
}

#[tokio::test]
async fn ambiguous_query_answers_keep_the_request_pending() {
    let h = Harness::new();
    let request = h.orchestrator.initiate(h.daily("ambiguous", 1)).await.unwrap().request;
    h.orchestrator.defer_resolution(request.id).await.unwrap();
    let worker = worker(&h);

    h.gateway.script_query(Ok(GatewayStatus::Resolved(PaymentOutcome::from_result_code(
        "4999",
        Some("The transaction is still under processing".to_string()),
        None,
    ))));
    h.advance_secs(30);
    let report = worker.run_cycle().await.unwrap();
    assert_eq!(report.rescheduled, 1);
    assert_eq!(report.resolved, 0);

    // A code we have no entry for is not proof of failure either.
    h.gateway.script_query(Ok(GatewayStatus::Resolved(PaymentOutcome::from_result_code(
        "424242", None, None,
    ))));
    advance_to_next_attempt(&h);
    let report = worker.run_cycle().await.unwrap();
    assert_eq!(report.rescheduled, 1);

    let view = h.orchestrator.get_status(request.id).await.unwrap();
    assert_eq!(view.status, PaymentStatus::Pending);
    assert!(view.error.is_none());
    assert_eq!(h.jobs.all()[0].attempts, 2);
    assert!(h.notifier.sent().is_empty());

    // A documented final decision still settles it.
    h.gateway.script_query(Ok(GatewayStatus::Resolved(PaymentOutcome::from_result_code(
        "1037",
        Some("DS timeout user cannot be reached".to_string()),
        None,
    ))));
    advance_to_next_attempt(&h);
    let report = worker.run_cycle().await.unwrap();
    assert_eq!(report.resolved, 1);
    assert_eq!(
        h.orchestrator.get_status(request.id).await.unwrap().status,
        PaymentStatus::Failed
    );
    assert_eq!(h.notifier.delivered(1).await.len(), 1);
}

#[tokio::test]
async fn stale_pending_requests_are_queued_without_a_client() {
    let h = Harness::new();
    let abandoned = h.orchestrator.initiate(h.deposit("stale-1")).await.unwrap().request;
    let callback_failed = h.orchestrator.initiate(h.daily("stale-2", 1)).await.unwrap().request;
    h.store
        .mark_callback_received(callback_failed.id, h.clock.now())
        .await
        .unwrap();

    // Push validity (90s) plus the stale grace (60s) has not elapsed yet.
    h.advance_secs(120);
    let report = worker(&h).run_cycle().await.unwrap();
    assert_eq!(report.enqueued_stale, 0);

    h.advance_secs(31);
    let report = worker(&h).run_cycle().await.unwrap();
    assert_eq!(report.enqueued_stale, 2);
    assert_eq!(report.claimed, 2);
    assert_eq!(report.rescheduled, 2);

    let mut queued: Vec<_> = h.jobs.all().into_iter().map(|j| j.payment_request_id).collect();
    queued.sort();
    let mut expected = vec![abandoned.id, callback_failed.id];
    expected.sort();
    assert_eq!(queued, expected);

    // Already queued requests are not enqueued twice.
    let report = worker(&h).run_cycle().await.unwrap();
    assert_eq!(report.enqueued_stale, 0);
}

#[tokio::test]
async fn one_cycle_resolves_many_jobs_concurrently() {
    let h = Harness::new();
    let mut ids = Vec::new();
    for day in 1..=4 {
        let request = h
            .orchestrator
            .initiate(h.daily(&format!("batch-{}", day), day))
            .await
            .unwrap()
            .request;
        h.orchestrator.defer_resolution(request.id).await.unwrap();
        h.gateway.script_query(Ok(success_without_receipt()));
        ids.push(request.id);
    }

    h.advance_secs(30);
    let report = worker(&h).run_cycle().await.unwrap();

    assert_eq!(report.claimed, 4);
    assert_eq!(report.resolved, 4);
    assert_eq!(h.ledger.effect_count(), 4);
    assert_eq!(h.ledger.wallet(h.wallet_id).unwrap().daily_payments_count, 10);
    for id in ids {
        assert_eq!(
            h.orchestrator.get_status(id).await.unwrap().status,
            PaymentStatus::Completed
        );
    }
}

#[tokio::test]
async fn worker_cycle_repairs_missed_ledger_effects() {
    let h = Harness::new();
    let request = h.orchestrator.initiate(h.deposit("repair")).await.unwrap().request;
    h.ledger.set_unavailable(true);
    h.orchestrator
        .apply_outcome(
            request.id,
            PaymentOutcome::completed("REP1"),
            ResolutionSource::Callback,
        )
        .await
        .unwrap();
    assert_eq!(h.ledger.effect_count(), 0);

    h.ledger.set_unavailable(false);
    let report = worker(&h).run_cycle().await.unwrap();

    assert_eq!(report.ledger_repaired, 1);
    assert_eq!(h.ledger.wallet(h.wallet_id).unwrap().balance, 1048);
}

#[tokio::test(start_paused = true)]
async fn worker_stops_on_shutdown_signal() {
    let h = Harness::new();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(worker(&h).run(shutdown_rx));

    tokio::time::sleep(Duration::from_secs(12)).await;
    shutdown_tx.send(true).unwrap();

    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("worker did not stop")
        .unwrap();
    assert_eq!(h.jobs.count_active().await.unwrap(), 0);
}
