mod common;

use common::{acknowledged_config, base_config, harness, payloads, records, started};
use sinkbridge::config::RecordProcessor;
use sinkbridge::delivery::DeliveryMode;
use sinkbridge::events::SinkEvent;
use sinkbridge::session::{BrokerAckMode, MemoryBroker};
use sinkbridge::{NackReason, Outcome, SessionState, SinkError, SinkRecord};
use std::time::Duration;

fn committed(outcome: Outcome) -> sinkbridge::CycleReport {
    match outcome {
        Outcome::Committed(report) => report,
        other => panic!("expected committed outcome, got {other:?}"),
    }
}

#[tokio::test]
async fn transacted_batch_commits_once_and_advances_offsets() {
    let mut h = started(base_config(), MemoryBroker::new()).await;
    let report = committed(h.task.submit_batch(records(10, 3)).await);

    assert_eq!(report.delivered, 3);
    assert_eq!(report.commits, 1);
    assert_eq!(h.broker.commits(), 1);
    assert_eq!(h.broker.delivered_payloads(), payloads(10, 3));
    assert!(h.broker.delivered().iter().all(|d| d.transacted));
    assert_eq!(h.task.committed_offsets().get(&("orders".to_string(), 0)), Some(&13));
    h.task.close().await;
}

#[tokio::test]
async fn autoflush_splits_large_transactions() {
    let mut cfg = base_config();
    cfg.publisher.autoflush_size = 2;
    let mut h = started(cfg, MemoryBroker::new()).await;
    let report = committed(h.task.submit_batch(records(0, 5)).await);

    assert_eq!(report.commits, 3);
    assert_eq!(h.broker.commits(), 3);
    assert_eq!(h.broker.delivered_payloads(), payloads(0, 5));
    h.task.close().await;
}

#[tokio::test]
async fn acknowledged_batch_resolves_every_message() {
    let mut h = started(acknowledged_config(), MemoryBroker::new()).await;
    let report = committed(h.task.submit_batch(records(0, 4)).await);

    assert_eq!(report.delivered, 4);
    assert_eq!(report.commits, 0);
    assert!(h
        .broker
        .delivered()
        .iter()
        .all(|d| !d.transacted && d.delivery_mode == DeliveryMode::Persistent));
    let snap = h.task.metrics().snapshot();
    assert_eq!(snap.messages_acked, 4);
    assert_eq!(snap.cycles_committed, 1);
    h.task.close().await;
}

#[tokio::test]
async fn nack_fails_the_cycle_and_withholds_offsets() {
    let broker = MemoryBroker::new();
    broker.nack_payload("m1", NackReason::SubscriptionNotFound);
    let mut h = started(acknowledged_config(), broker).await;

    match h.task.submit_batch(records(0, 3)).await {
        Outcome::Retry(SinkError::DeliveryNack { reason, .. }) => {
            assert_eq!(reason, NackReason::SubscriptionNotFound);
        }
        other => panic!("expected retry on nack, got {other:?}"),
    }
    assert!(h.task.committed_offsets().is_empty());
    assert!(!h.task.is_fatal());
    assert_eq!(h.task.metrics().snapshot().cycles_failed, 1);
    h.task.close().await;
}

#[tokio::test]
async fn ignored_subscription_nack_excludes_only_that_message() {
    let broker = MemoryBroker::new();
    broker.nack_payload("m1", NackReason::SubscriptionNotFound);
    let mut cfg = acknowledged_config();
    cfg.errors.ignore_subscription_not_found = true;
    let mut h = started(cfg, broker).await;

    let report = committed(h.task.submit_batch(records(0, 3)).await);
    assert_eq!(report.ignored_nacks, 1);
    assert_eq!(report.delivered, 2);
    assert_eq!(h.broker.delivered_payloads(), vec!["m0", "m2"]);
    assert_eq!(h.broker.rejected().len(), 1);
    assert_eq!(h.events.count("ignored_nack"), 1);
    assert_eq!(h.task.committed_offsets().get(&("orders".to_string(), 0)), Some(&3));
    h.task.close().await;
}

#[tokio::test]
async fn duplicate_subscription_flag_does_not_cover_missing_subscriptions() {
    let broker = MemoryBroker::new();
    broker.nack_payload("m0", NackReason::SubscriptionNotFound);
    let mut cfg = acknowledged_config();
    cfg.errors.ignore_duplicate_subscription = true;
    let mut h = started(cfg, broker).await;

    assert!(matches!(
        h.task.submit_batch(records(0, 1)).await,
        Outcome::Retry(SinkError::DeliveryNack { .. })
    ));
    h.task.close().await;
}

#[tokio::test]
async fn permission_denied_nack_stops_the_task() {
    let broker = MemoryBroker::new();
    broker.nack_payload("m0", NackReason::PermissionDenied);
    let mut h = started(acknowledged_config(), broker).await;

    assert!(matches!(
        h.task.submit_batch(records(0, 1)).await,
        Outcome::Fatal(SinkError::DeliveryNack { .. })
    ));
    assert!(h.task.is_fatal());
    assert_eq!(h.events.count("fatal"), 1);
    // later batches are refused without touching the broker
    let delivered = h.broker.delivered().len();
    assert!(matches!(h.task.submit_batch(records(1, 1)).await, Outcome::Fatal(_)));
    assert_eq!(h.broker.delivered().len(), delivered);
    h.task.close().await;
}

#[tokio::test]
async fn failed_commit_is_all_or_nothing_and_redelivery_commits_once() {
    let broker = MemoryBroker::new();
    broker.fail_next_commits(1);
    let mut h = started(base_config(), broker).await;

    match h.task.submit_batch(records(0, 3)).await {
        Outcome::Retry(SinkError::TransactionCommit { messages, .. }) => assert_eq!(messages, 3),
        other => panic!("expected retry on commit failure, got {other:?}"),
    }
    assert!(h.broker.delivered().is_empty());
    assert!(h.task.committed_offsets().is_empty());

    let report = committed(h.task.submit_batch(records(0, 3)).await);
    assert_eq!(report.delivered, 3);
    assert_eq!(h.broker.commits(), 1);
    assert_eq!(h.broker.delivered_payloads(), payloads(0, 3));
    assert_eq!(h.task.metrics().snapshot().commit_failures, 1);
    h.task.close().await;
}

fn by_destination(broker: &MemoryBroker) -> Vec<(String, String, bool)> {
    let mut out: Vec<(String, String, bool)> = broker
        .delivered()
        .iter()
        .map(|d| (d.destination.to_string(), d.payload_str(), d.transacted))
        .collect();
    out.sort();
    out
}

#[tokio::test]
async fn mixed_cycle_commits_the_queue_and_sends_topics_direct() {
    let mut cfg = base_config();
    cfg.destinations.topics = vec!["t".into()];
    let mut h = started(cfg, MemoryBroker::new()).await;

    let report = committed(h.task.submit_batch(records(0, 2)).await);
    assert_eq!(report.submitted, 4);
    assert_eq!(report.delivered, 4);
    assert_eq!(report.commits, 1);
    assert_eq!(h.broker.commits(), 1);
    assert_eq!(
        by_destination(&h.broker),
        vec![
            ("queue:q".to_string(), "m0".to_string(), true),
            ("queue:q".to_string(), "m1".to_string(), true),
            ("topic:t".to_string(), "m0".to_string(), false),
            ("topic:t".to_string(), "m1".to_string(), false),
        ]
    );
    assert!(h
        .broker
        .delivered()
        .iter()
        .filter(|d| !d.transacted)
        .all(|d| d.delivery_mode == DeliveryMode::Direct));
    h.task.close().await;
}

#[tokio::test]
async fn nacked_cycle_rolls_back_its_open_transaction() {
    let broker = MemoryBroker::new();
    broker.nack_payload("m0", NackReason::DestinationNotFound);
    let mut cfg = acknowledged_config();
    cfg.publisher.use_transactions_for_topics = true;
    cfg.destinations.topics = vec!["t".into()];
    let mut h = started(cfg, broker).await;

    match h.task.submit_batch(records(0, 1)).await {
        Outcome::Retry(SinkError::DeliveryNack { reason, .. }) => {
            assert_eq!(reason, NackReason::DestinationNotFound);
        }
        other => panic!("expected retry on nack, got {other:?}"),
    }
    assert_eq!(h.broker.rollbacks(), 1);
    assert_eq!(h.broker.commits(), 0);
    assert!(h.broker.delivered().is_empty());
    assert_eq!(h.task.state(), SessionState::Connected);

    let report = committed(h.task.submit_batch(records(1, 1)).await);
    assert_eq!(report.delivered, 2);
    assert_eq!(h.broker.commits(), 1);
    assert_eq!(
        by_destination(&h.broker),
        vec![
            ("queue:q".to_string(), "m1".to_string(), false),
            ("topic:t".to_string(), "m1".to_string(), true),
        ]
    );
    assert_eq!(h.task.committed_offsets().get(&("orders".to_string(), 0)), Some(&2));
    h.task.close().await;
}

#[tokio::test]
async fn failed_commit_on_mixed_cycle_commits_the_queue_on_redelivery() {
    let broker = MemoryBroker::new();
    broker.fail_next_commits(1);
    let mut cfg = base_config();
    cfg.destinations.topics = vec!["t".into()];
    let mut h = started(cfg, broker).await;

    assert!(matches!(
        h.task.submit_batch(records(0, 1)).await,
        Outcome::Retry(SinkError::TransactionCommit { .. })
    ));
    assert_eq!(
        by_destination(&h.broker),
        vec![("topic:t".to_string(), "m0".to_string(), false)]
    );
    assert_eq!(h.broker.rollbacks(), 0);

    committed(h.task.submit_batch(records(0, 1)).await);
    assert_eq!(h.broker.commits(), 1);
    assert_eq!(
        by_destination(&h.broker),
        vec![
            ("queue:q".to_string(), "m0".to_string(), true),
            ("topic:t".to_string(), "m0".to_string(), false),
            ("topic:t".to_string(), "m0".to_string(), false),
        ]
    );
    h.task.close().await;
}

#[tokio::test]
async fn publisher_window_bounds_unacknowledged_messages() {
    let broker = MemoryBroker::new();
    broker.set_ack_mode(BrokerAckMode::Manual);
    let mut cfg = acknowledged_config();
    cfg.publisher.window_size = 2;
    let h = started(cfg, broker.clone()).await;

    let mut task = h.task;
    let cycle = tokio::spawn(async move {
        let outcome = task.submit_batch(records(0, 3)).await;
        (task, outcome)
    });

    let mut released = 0;
    while released < 3 {
        assert!(broker.pending_acks() <= 2);
        released += broker.release_acks(1);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let (task, outcome) = cycle.await.unwrap();
    let report = committed(outcome);
    assert_eq!(report.delivered, 3);
    assert_eq!(broker.max_in_flight(), 2);
    task.close().await;
}

#[tokio::test]
async fn cumulative_acknowledgment_resolves_the_whole_window() {
    let broker = MemoryBroker::new();
    broker.set_ack_mode(BrokerAckMode::Manual);
    let h = started(acknowledged_config(), broker.clone()).await;

    let mut task = h.task;
    let cycle = tokio::spawn(async move {
        let outcome = task.submit_batch(records(0, 5)).await;
        (task, outcome)
    });
    assert!(broker.wait_for_delivered(5, Duration::from_secs(2)).await);
    assert_eq!(broker.release_all(), 5);

    let (task, outcome) = cycle.await.unwrap();
    assert_eq!(committed(outcome).delivered, 5);
    task.close().await;
}

#[tokio::test(start_paused = true)]
async fn missing_acknowledgments_time_out_and_withhold_offsets() {
    let broker = MemoryBroker::new();
    broker.set_ack_mode(BrokerAckMode::Manual);
    let mut cfg = acknowledged_config();
    cfg.publisher.cycle_retries = 0;
    let mut h = started(cfg, broker).await;

    match h.task.submit_batch(records(0, 2)).await {
        Outcome::Retry(SinkError::RetriesExhausted { retries, last }) => {
            assert_eq!(retries, 0);
            assert!(last.contains("acknowledgments outstanding"));
        }
        other => panic!("expected exhausted retries, got {other:?}"),
    }
    assert!(h.task.committed_offsets().is_empty());
    h.task.close().await;
}

#[tokio::test]
async fn dropped_connection_resubmits_only_the_remainder() {
    let broker = MemoryBroker::new();
    broker.drop_after_publishes(2);
    let mut h = started(acknowledged_config(), broker).await;
    let mut transitions = h.task.connection().subscribe();

    let report = committed(h.task.submit_batch(records(0, 4)).await);
    assert_eq!(report.attempts, 2);
    assert_eq!(report.delivered, 4);
    assert_eq!(h.broker.delivered_payloads(), payloads(0, 4));
    assert_eq!(h.broker.connect_log().len(), 2);

    let first = transitions.recv().await.unwrap();
    assert_eq!((first.from, first.to), (SessionState::Connected, SessionState::Reconnecting));
    let second = transitions.recv().await.unwrap();
    assert_eq!((second.from, second.to), (SessionState::Reconnecting, SessionState::Connected));
    assert_eq!(h.task.metrics().snapshot().cycle_retries, 1);
    h.task.close().await;
}

#[tokio::test]
async fn dropped_connection_mid_transaction_replays_the_staged_messages() {
    let broker = MemoryBroker::new();
    broker.drop_after_publishes(2);
    let mut h = started(base_config(), broker).await;

    let report = committed(h.task.submit_batch(records(0, 3)).await);
    assert_eq!(report.attempts, 2);
    assert_eq!(h.broker.commits(), 1);
    assert_eq!(h.broker.delivered_payloads(), payloads(0, 3));
    h.task.close().await;
}

#[tokio::test]
async fn untranslatable_record_is_fatal_by_default() {
    let mut cfg = base_config();
    cfg.record.processor = RecordProcessor::Dynamic;
    cfg.destinations.queue = None;
    let mut h = started(cfg, MemoryBroker::new()).await;

    let batch = vec![SinkRecord::new("orders", 0, 0).with_value("no key")];
    assert!(matches!(
        h.task.submit_batch(batch).await,
        Outcome::Fatal(SinkError::Translation { .. })
    ));
    assert!(h.broker.delivered().is_empty());
    h.task.close().await;
}

#[tokio::test]
async fn untranslatable_record_is_discarded_when_configured() {
    let mut cfg = base_config();
    cfg.record.processor = RecordProcessor::Dynamic;
    cfg.record.ignore_processor_error = true;
    cfg.destinations.queue = None;
    let mut h = started(cfg, MemoryBroker::new()).await;

    let batch = vec![
        SinkRecord::new("orders", 0, 0).with_value("no key"),
        SinkRecord::new("orders", 0, 1)
            .with_key("routed/topic")
            .with_value("keyed"),
    ];
    let report = committed(h.task.submit_batch(batch).await);
    assert_eq!(report.discarded_records, 1);
    assert_eq!(report.delivered, 1);
    let delivered = h.broker.delivered();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].destination.to_string(), "topic:routed/topic");
    assert_eq!(delivered[0].delivery_mode, DeliveryMode::Direct);
    assert!(h
        .events
        .snapshot()
        .iter()
        .any(|e| matches!(e, SinkEvent::DiscardedRecord { record, .. } if record == "orders-0@0")));
    assert_eq!(h.task.committed_offsets().get(&("orders".to_string(), 0)), Some(&2));
    h.task.close().await;
}

#[tokio::test]
async fn direct_topics_need_no_broker_acknowledgment() {
    let broker = MemoryBroker::new();
    broker.set_ack_mode(BrokerAckMode::Manual);
    let mut cfg = base_config();
    cfg.destinations.queue = None;
    cfg.destinations.topics = vec!["events".into()];
    let mut h = started(cfg, broker).await;

    let report = committed(h.task.submit_batch(records(0, 3)).await);
    assert_eq!(report.delivered, 3);
    assert_eq!(h.broker.pending_acks(), 0);
    h.task.close().await;
}

#[tokio::test]
async fn records_without_values_commit_without_publishing() {
    let mut h = started(base_config(), MemoryBroker::new()).await;
    let batch = vec![SinkRecord::new("orders", 3, 41)];
    let report = committed(h.task.submit_batch(batch).await);
    assert_eq!(report.submitted, 0);
    assert!(h.broker.delivered().is_empty());
    assert_eq!(h.task.committed_offsets().get(&("orders".to_string(), 3)), Some(&42));
    h.task.close().await;
}

#[tokio::test]
async fn shutdown_cancels_an_in_flight_cycle() {
    let broker = MemoryBroker::new();
    broker.set_ack_mode(BrokerAckMode::Manual);
    let h = started(acknowledged_config(), broker.clone()).await;
    let shutdown = h.task.shutdown_handle();

    let mut task = h.task;
    let cycle = tokio::spawn(async move {
        let outcome = task.submit_batch(records(0, 2)).await;
        (task, outcome)
    });
    assert!(broker.wait_for_delivered(2, Duration::from_secs(2)).await);
    shutdown.trigger();

    let (task, outcome) = cycle.await.unwrap();
    assert!(matches!(outcome, Outcome::Retry(SinkError::Cancelled)));
    assert!(task.committed_offsets().is_empty());
    assert_eq!(task.state(), SessionState::Disconnected);
    task.close().await;
    assert_eq!(broker.open_sessions(), 0);
}

#[tokio::test]
async fn close_releases_the_session() {
    let broker = MemoryBroker::new();
    let h = started(base_config(), broker.clone()).await;
    assert_eq!(broker.open_sessions(), 1);
    h.task.close().await;
    assert_eq!(broker.open_sessions(), 0);
}

#[tokio::test]
async fn batches_before_start_connect_on_demand() {
    let mut h = harness(base_config(), MemoryBroker::new());
    committed(h.task.submit_batch(records(0, 1)).await);
    assert_eq!(h.task.state(), SessionState::Connected);
    h.task.close().await;
}
