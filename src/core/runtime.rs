use crate::core::config::Config;
use crate::delivery::coordinator::{CycleReport, DeliveryCoordinator};
use crate::delivery::message::SinkRecord;
use crate::delivery::translator;
use crate::messaging::acks::AckTracker;
use crate::ops::{EventSink, SinkEvent, SinkMetrics, TelemetrySource, TracingEventSink};
use crate::policy::{Disposition, ErrorPolicy, SinkError};
use crate::session::{ConnectionManager, SessionFactory, SessionProperties, SessionState};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Result of one `submit_batch` call.
#[derive(Debug, Clone)]
pub enum Outcome {
    /// Every message confirmed; offsets advanced.
    Committed(CycleReport),
    /// Offsets withheld; the caller redelivers the batch.
    Retry(SinkError),
    /// The task must stop.
    Fatal(SinkError),
}

impl Outcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, Outcome::Committed(_))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Committed(_) => "committed",
            Outcome::Retry(_) => "retry",
            Outcome::Fatal(_) => "fatal",
        }
    }
}

/// Cloneable trigger that stops an in-flight or future cycle.
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Sink task: wires the connection manager, ack tracker and coordinator
/// together and owns the partition offsets the caller may checkpoint.
pub struct SinkTask {
    config: Config,
    connection: Arc<ConnectionManager>,
    coordinator: DeliveryCoordinator,
    metrics: Arc<SinkMetrics>,
    events: Arc<dyn EventSink>,
    committed: HashMap<(String, i32), i64>,
    start_offset: Option<i64>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
    fatal: Option<SinkError>,
}

impl SinkTask {
    pub fn new(config: Config, factory: Arc<dyn SessionFactory>) -> Result<Self, SinkError> {
        Self::with_events(config, factory, Arc::new(TracingEventSink))
    }

    pub fn with_events(
        config: Config,
        factory: Arc<dyn SessionFactory>,
        events: Arc<dyn EventSink>,
    ) -> Result<Self, SinkError> {
        config
            .validate()
            .map_err(|err| SinkError::Configuration(format!("{err:#}")))?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let metrics = Arc::new(SinkMetrics::default());
        let tracker = AckTracker::new(config.publisher.ack_event_mode, config.publisher.window_size);
        let connection = Arc::new(ConnectionManager::new(
            factory,
            SessionProperties::from_config(&config),
            tracker.handle(),
            metrics.clone(),
            events.clone(),
        ));
        let translator = translator::from_config(&config.record, config.destinations.resolve());
        let coordinator = DeliveryCoordinator::new(
            connection.clone(),
            tracker,
            translator,
            ErrorPolicy::from_config(&config),
            config.publisher.clone(),
            events.clone(),
            shutdown_rx.clone(),
        );
        Ok(Self {
            start_offset: config.source.replay_offset,
            config,
            connection,
            coordinator,
            metrics,
            events,
            committed: HashMap::new(),
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
            fatal: None,
        })
    }

    /// Connect and start the keep-alive monitor.
    pub async fn start(&mut self) -> Result<(), SinkError> {
        info!(
            hosts = self.config.hosts().len(),
            translator = self.coordinator.translator_name(),
            "starting sink task"
        );
        if let Err(err) = self.connection.connect().await {
            return Err(self.record_failure(err));
        }
        self.connection.start_keep_alive(self.shutdown_rx.clone());
        Ok(())
    }

    /// Deliver one batch. Offsets advance only on `Committed`.
    pub async fn submit_batch(&mut self, records: Vec<SinkRecord>) -> Outcome {
        if let Some(err) = &self.fatal {
            return Outcome::Fatal(err.clone());
        }
        match self.coordinator.publish_cycle(&records).await {
            Ok(report) => {
                for record in &records {
                    let next = record.offset + 1;
                    let entry = self
                        .committed
                        .entry((record.topic.clone(), record.partition))
                        .or_insert(next);
                    *entry = (*entry).max(next);
                }
                self.metrics.cycle_committed();
                Outcome::Committed(report)
            }
            Err(err) => {
                self.metrics.cycle_failed();
                if matches!(err, SinkError::Cancelled) {
                    self.connection.close().await;
                }
                let err = self.record_failure(err);
                if self.fatal.is_some() {
                    Outcome::Fatal(err)
                } else {
                    Outcome::Retry(err)
                }
            }
        }
    }

    fn record_failure(&mut self, err: SinkError) -> SinkError {
        if self.coordinator.policy().classify(&err) == Disposition::Fatal {
            error!(error = %err, kind = err.kind(), "sink task failed");
            self.events.emit(SinkEvent::Fatal {
                kind: err.kind(),
                message: err.to_string(),
            });
            self.fatal = Some(err.clone());
        } else {
            warn!(error = %err, kind = err.kind(), "batch not committed");
        }
        err
    }

    /// Next offset to consume per `(topic, partition)`, for checkpointing.
    pub fn committed_offsets(&self) -> &HashMap<(String, i32), i64> {
        &self.committed
    }

    /// Starting-offset override from configuration; yields it once.
    pub fn take_start_offset(&mut self) -> Option<i64> {
        self.start_offset.take()
    }

    pub fn state(&self) -> SessionState {
        self.connection.state()
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn metrics(&self) -> Arc<SinkMetrics> {
        self.metrics.clone()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn telemetry_source(&self) -> TelemetrySource {
        TelemetrySource {
            metrics: self.metrics.clone(),
            state: self.connection.state_watch(),
        }
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.shutdown_tx.clone(),
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.fatal.is_some()
    }

    /// Stop the task and release the session.
    pub async fn close(self) {
        self.shutdown_tx.send_replace(true);
        self.connection.close().await;
        info!("sink task closed");
    }
}

/// Wait for ctrl-c, then trigger shutdown.
pub async fn shutdown_on_ctrl_c(handle: ShutdownHandle) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "unable to listen for shutdown signal");
        return;
    }
    info!("shutdown signal received");
    handle.trigger();
}
