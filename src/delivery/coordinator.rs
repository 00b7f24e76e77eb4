//! Publish cycle coordination.
//!
//! One call to [`DeliveryCoordinator::publish_cycle`] turns a batch of records
//! into broker messages, submits them with the discipline their destination
//! calls for, and resolves to success only when every message is confirmed
//! (ignorable nacks excepted). Session failures mid-cycle reconnect and
//! resubmit the unresolved remainder with fresh correlation ids.

use crate::core::config::PublisherConfig;
use crate::delivery::message::{
    AckState, CorrelationId, DeliveryMode, Destination, DestinationKind, OutboundMessage,
    SinkRecord,
};
use crate::delivery::translator::Translator;
use crate::messaging::acks::{AckError, AckTracker, Resolution};
use crate::messaging::transactions::TransactionBuffer;
use crate::ops::{EventSink, SinkEvent, SinkMetrics};
use crate::policy::{Disposition, ErrorPolicy, NackReason, SinkError};
use crate::session::{BrokerSession, ConnectionManager, SessionError};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// How messages for one destination kind are submitted and confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Discipline {
    /// Published inside a broker transaction; confirmed by commit.
    Transacted,
    /// Persistent; confirmed by a broker acknowledgment.
    Acknowledged,
    /// Fire-and-forget; confirmed by hand-off to the session.
    Direct,
}

impl Discipline {
    pub fn for_destination(publisher: &PublisherConfig, destination: &Destination) -> Self {
        match destination.kind {
            DestinationKind::Queue if publisher.use_transactions_for_queue => {
                Discipline::Transacted
            }
            DestinationKind::Topic if publisher.use_transactions_for_topics => {
                Discipline::Transacted
            }
            DestinationKind::Queue => Discipline::Acknowledged,
            DestinationKind::Topic => Discipline::Direct,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Discipline::Transacted => "transacted",
            Discipline::Acknowledged => "acknowledged",
            Discipline::Direct => "direct",
        }
    }

    pub fn delivery_mode(&self) -> DeliveryMode {
        match self {
            Discipline::Direct => DeliveryMode::Direct,
            Discipline::Transacted | Discipline::Acknowledged => DeliveryMode::Persistent,
        }
    }
}

/// What one successful cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub records: usize,
    pub submitted: usize,
    pub delivered: usize,
    pub ignored_nacks: usize,
    pub discarded_records: usize,
    pub commits: u64,
    pub attempts: u32,
}

/// An attempt that stopped early, with what it left unconfirmed.
struct Interrupted {
    error: SinkError,
    unresolved: Vec<(usize, OutboundMessage)>,
    /// Transacted publishes reached the broker without a commit or rollback.
    open_transaction: bool,
}

impl Interrupted {
    fn settled(error: SinkError, txn: &TransactionBuffer) -> Self {
        Self {
            error,
            unresolved: Vec::new(),
            open_transaction: !txn.is_empty(),
        }
    }
}

pub struct DeliveryCoordinator {
    connection: Arc<ConnectionManager>,
    tracker: AckTracker,
    translator: Arc<dyn Translator>,
    policy: ErrorPolicy,
    publisher: PublisherConfig,
    metrics: Arc<SinkMetrics>,
    events: Arc<dyn EventSink>,
    shutdown: watch::Receiver<bool>,
    next_id: u64,
}

impl DeliveryCoordinator {
    /// `tracker` must be the one whose handle the connection manager hands to sessions.
    pub fn new(
        connection: Arc<ConnectionManager>,
        tracker: AckTracker,
        translator: Arc<dyn Translator>,
        policy: ErrorPolicy,
        publisher: PublisherConfig,
        events: Arc<dyn EventSink>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let metrics = connection.metrics().clone();
        Self {
            connection,
            tracker,
            translator,
            policy,
            publisher,
            metrics,
            events,
            shutdown,
            next_id: 0,
        }
    }

    pub fn tracker(&self) -> &AckTracker {
        &self.tracker
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn policy(&self) -> &ErrorPolicy {
        &self.policy
    }

    pub fn translator_name(&self) -> &'static str {
        self.translator.name()
    }

    fn allocate(&mut self) -> CorrelationId {
        self.next_id += 1;
        CorrelationId(self.next_id)
    }

    fn discipline(&self, destination: &Destination) -> Discipline {
        Discipline::for_destination(&self.publisher, destination)
    }

    /// Deliver one batch. `Ok` means every message is confirmed; any `Err` means
    /// the caller must not advance its offsets.
    pub async fn publish_cycle(&mut self, records: &[SinkRecord]) -> Result<CycleReport, SinkError> {
        let mut report = CycleReport {
            records: records.len(),
            ..Default::default()
        };
        let messages = self.translate(records, &mut report)?;
        if messages.is_empty() {
            return Ok(report);
        }
        report.submitted = messages.len();

        let budget = self.publisher.cycle_retries;
        let mut remaining: Vec<(usize, OutboundMessage)> = messages.into_iter().enumerate().collect();
        loop {
            report.attempts += 1;
            if *self.shutdown.borrow() {
                return Err(SinkError::Cancelled);
            }
            self.connection.ensure_connected().await?;
            let (error, unresolved) = match self.connection.session() {
                Ok(session) => {
                    let result = self.run_attempt(&session, &remaining, &mut report).await;
                    self.tracker.retire_all();
                    let Interrupted {
                        error,
                        unresolved,
                        open_transaction,
                    } = match result {
                        Ok(()) => {
                            debug!(
                                delivered = report.delivered,
                                attempts = report.attempts,
                                "publish cycle resolved"
                            );
                            return Ok(report);
                        }
                        Err(interrupted) => interrupted,
                    };
                    if self.policy.classify(&error) != Disposition::RetrySession {
                        if open_transaction {
                            self.roll_back(&session, &error).await;
                        }
                        return Err(error);
                    }
                    self.connection.mark_broken(&session, &error.to_string()).await;
                    (error, unresolved)
                }
                Err(error) => (error, std::mem::take(&mut remaining)),
            };
            if report.attempts > budget {
                return Err(SinkError::RetriesExhausted {
                    retries: budget,
                    last: error.to_string(),
                });
            }
            warn!(
                error = %error,
                unresolved = unresolved.len(),
                attempt = report.attempts,
                "session failure mid-cycle; resubmitting remainder"
            );
            self.metrics.cycle_retried();
            remaining = unresolved
                .into_iter()
                .map(|(position, message)| {
                    let id = self.allocate();
                    (position, message.resubmitted(id))
                })
                .collect();
        }
    }

    fn translate(
        &mut self,
        records: &[SinkRecord],
        report: &mut CycleReport,
    ) -> Result<Vec<OutboundMessage>, SinkError> {
        let mut messages = Vec::with_capacity(records.len());
        for record in records {
            match self.translator.translate(record) {
                Ok(translated) => {
                    for t in translated {
                        let discipline = self.discipline(&t.destination);
                        let correlation_id = self.allocate();
                        messages.push(OutboundMessage {
                            payload: t.payload,
                            key: t.key,
                            headers: t.headers,
                            destination: t.destination,
                            delivery_mode: discipline.delivery_mode(),
                            correlation_id,
                        });
                    }
                }
                Err(source) => {
                    let reason = source.to_string();
                    let err = SinkError::Translation {
                        record: record.identity(),
                        source,
                    };
                    if self.policy.classify(&err) != Disposition::Ignore {
                        return Err(err);
                    }
                    warn!(record = %record.identity(), %reason, "discarding untranslatable record");
                    self.metrics.record_discarded();
                    self.events.emit(SinkEvent::DiscardedRecord {
                        record: record.identity(),
                        reason,
                    });
                    report.discarded_records += 1;
                }
            }
        }
        Ok(messages)
    }

    /// Discard the broker-side transaction of a cycle that failed for good.
    async fn roll_back(&self, session: &Arc<dyn BrokerSession>, cause: &SinkError) {
        match session.rollback().await {
            Ok(()) => warn!(error = %cause, "rolled back open transaction"),
            Err(err) => {
                warn!(error = %err, "transaction rollback failed; dropping session");
                let reason = format!("rollback failed: {err}");
                self.connection.mark_broken(session, &reason).await;
            }
        }
    }

    async fn run_attempt(
        &mut self,
        session: &Arc<dyn BrokerSession>,
        remaining: &[(usize, OutboundMessage)],
        report: &mut CycleReport,
    ) -> Result<(), Interrupted> {
        let mut txn = TransactionBuffer::new(self.publisher.autoflush_size);
        let mut in_flight: Vec<(usize, OutboundMessage)> = Vec::new();
        let timeout = self.publisher.ack_timeout();

        for (index, (position, message)) in remaining.iter().enumerate() {
            let rest = &remaining[index + 1..];
            if *self.shutdown.borrow() {
                return Err(self.interrupted(SinkError::Cancelled, &mut txn, &in_flight, &[], report));
            }
            match self.discipline(&message.destination) {
                Discipline::Transacted => {
                    if let Err(err) = session.publish_transacted(message).await {
                        let pending = &remaining[index..];
                        return Err(self.interrupted(err.into(), &mut txn, &in_flight, pending, report));
                    }
                    self.metrics.published();
                    let full = match txn.stage(*position, message.clone()) {
                        Ok(full) => full,
                        Err(err) => {
                            let error = SinkError::TransactionCommit {
                                messages: txn.len(),
                                reason: err.to_string(),
                            };
                            return Err(self.interrupted(error, &mut txn, &in_flight, &[], report));
                        }
                    };
                    if full {
                        if let Err(error) = self.commit(session.as_ref(), &mut txn, report).await {
                            return Err(self.interrupted(error, &mut txn, &in_flight, rest, report));
                        }
                    }
                }
                discipline => {
                    let id = message.correlation_id;
                    if let Err(err) = self.tracker.register(id, timeout, &mut self.shutdown).await {
                        let error = match err {
                            AckError::Cancelled => SinkError::Cancelled,
                            AckError::WindowTimeout { .. } => SinkError::AckTimeout(timeout),
                            AckError::Duplicate(id) => {
                                SinkError::Connection(format!("correlation id {id} reused"))
                            }
                        };
                        let pending = &remaining[index..];
                        return Err(self.interrupted(error, &mut txn, &in_flight, pending, report));
                    }
                    in_flight.push((*position, message.clone()));
                    if let Err(err) = session.publish(message).await {
                        return Err(self.interrupted(err.into(), &mut txn, &in_flight, rest, report));
                    }
                    self.metrics.published();
                    if discipline == Discipline::Direct {
                        self.tracker.mark_acked(id);
                    }
                    if let Err(error) = self.settle_nacks(&in_flight, report) {
                        return Err(Interrupted::settled(error, &txn));
                    }
                }
            }
        }

        if !txn.is_empty() {
            if let Err(error) = self.commit(session.as_ref(), &mut txn, report).await {
                return Err(self.interrupted(error, &mut txn, &in_flight, &[], report));
            }
        }

        loop {
            match self.tracker.await_resolution(timeout, &mut self.shutdown).await {
                Resolution::Resolved => break,
                Resolution::Nacked { id, reason } => {
                    if let Err(error) = self.handle_nack(id, reason, &in_flight, report) {
                        return Err(Interrupted::settled(error, &txn));
                    }
                }
                Resolution::TimedOut(after) => {
                    let error = SinkError::AckTimeout(after);
                    return Err(self.interrupted(error, &mut txn, &in_flight, &[], report));
                }
                Resolution::Cancelled => {
                    return Err(self.interrupted(SinkError::Cancelled, &mut txn, &in_flight, &[], report));
                }
            }
        }
        self.count_acked(&in_flight, report);
        Ok(())
    }

    async fn commit(
        &self,
        session: &dyn BrokerSession,
        txn: &mut TransactionBuffer,
        report: &mut CycleReport,
    ) -> Result<(), SinkError> {
        let messages = txn
            .begin_commit()
            .map_err(|err| SinkError::TransactionCommit {
                messages: txn.len(),
                reason: err.to_string(),
            })?;
        match session.commit().await {
            Ok(()) => {
                let done = txn.committed();
                report.delivered += done.len();
                report.commits += 1;
                self.metrics.committed_transaction();
                self.metrics.acked(done.len() as u64);
                debug!(messages, "transaction committed");
                Ok(())
            }
            Err(SessionError::CommitFailed(reason)) => {
                txn.abandon();
                self.metrics.commit_failed();
                warn!(messages, %reason, "transaction commit failed");
                Err(SinkError::TransactionCommit { messages, reason })
            }
            Err(other) => Err(other.into()),
        }
    }

    fn settle_nacks(
        &mut self,
        in_flight: &[(usize, OutboundMessage)],
        report: &mut CycleReport,
    ) -> Result<(), SinkError> {
        for (id, reason) in self.tracker.take_nacks() {
            self.handle_nack(id, reason, in_flight, report)?;
        }
        Ok(())
    }

    fn handle_nack(
        &self,
        id: CorrelationId,
        reason: NackReason,
        in_flight: &[(usize, OutboundMessage)],
        report: &mut CycleReport,
    ) -> Result<(), SinkError> {
        self.metrics.nacked();
        let destination = in_flight
            .iter()
            .find(|(_, m)| m.correlation_id == id)
            .map(|(_, m)| m.destination.to_string())
            .unwrap_or_default();
        match self.policy.classify_nack(&reason) {
            Disposition::Ignore => {
                info!(correlation_id = %id, %destination, %reason, "ignoring nack");
                self.metrics.nack_ignored();
                self.events.emit(SinkEvent::IgnoredNack {
                    correlation_id: id.0,
                    destination,
                    reason: reason.to_string(),
                });
                report.ignored_nacks += 1;
                Ok(())
            }
            _ => Err(SinkError::DeliveryNack { id, reason }),
        }
    }

    fn count_acked(&self, in_flight: &[(usize, OutboundMessage)], report: &mut CycleReport) {
        let acked = in_flight
            .iter()
            .filter(|(_, m)| matches!(self.tracker.state(m.correlation_id), Some(AckState::Acked)))
            .count();
        report.delivered += acked;
        self.metrics.acked(acked as u64);
    }

    /// Collect what an interrupted attempt left unconfirmed, in cycle order.
    ///
    /// Nacks that arrived before the interruption are classified first; a
    /// non-ignorable one replaces the interruption cause.
    fn interrupted(
        &mut self,
        error: SinkError,
        txn: &mut TransactionBuffer,
        in_flight: &[(usize, OutboundMessage)],
        rest: &[(usize, OutboundMessage)],
        report: &mut CycleReport,
    ) -> Interrupted {
        if let Err(nack) = self.settle_nacks(in_flight, report) {
            return Interrupted::settled(nack, txn);
        }
        self.count_acked(in_flight, report);
        let mut unresolved = txn.abandon();
        let open_transaction = !unresolved.is_empty();
        unresolved.extend(
            in_flight
                .iter()
                .filter(|(_, m)| {
                    matches!(self.tracker.state(m.correlation_id), Some(AckState::Pending))
                })
                .cloned(),
        );
        unresolved.extend(rest.iter().cloned());
        unresolved.sort_by_key(|(position, _)| *position);
        Interrupted {
            error,
            unresolved,
            open_transaction,
        }
    }
}
