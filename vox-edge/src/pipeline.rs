//! Main decision loop: inbound messages and deadline ticks in, status records out.

use std::future::Future;
use std::sync::{Arc, Mutex, TryLockError};
use std::time::{Duration, SystemTime};

use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use vox_core::{
    Accelerator, Action, ClassificationResult, InferenceBridge, InferenceError, InferenceJob,
    Label, SessionController,
};

use crate::config::TopicsConfig;
use crate::transport::{Inbound, TransportClient, TransportError};

/// Outbound side of the pipeline.
pub trait Publisher {
    fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;
}

impl Publisher for TransportClient {
    fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
    ) -> impl Future<Output = Result<(), TransportError>> + Send {
        TransportClient::publish(self, topic, payload)
    }
}

pub type SharedAccelerator = Arc<Mutex<Box<dyn Accelerator>>>;

pub struct Pipeline<P> {
    controller: SessionController,
    bridge: InferenceBridge,
    device: SharedAccelerator,
    publisher: P,
    topics: TopicsConfig,
    tick: Duration,
    hardware_timeout: Duration,
}

impl<P: Publisher> Pipeline<P> {
    pub fn new(
        controller: SessionController,
        bridge: InferenceBridge,
        device: SharedAccelerator,
        publisher: P,
        topics: TopicsConfig,
    ) -> Self {
        Self {
            controller,
            bridge,
            device,
            publisher,
            topics,
            tick: Duration::from_millis(50),
            hardware_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn with_hardware_timeout(mut self, timeout: Duration) -> Self {
        self.hardware_timeout = timeout;
        self
    }

    /// Run until `shutdown` resolves or the inbound channel closes. Returns the publisher.
    pub async fn run(
        mut self,
        mut inbound: mpsc::Receiver<Inbound>,
        shutdown: impl Future<Output = ()>,
    ) -> P {
        tokio::pin!(shutdown);
        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            fragments = %self.topics.fragments,
            control = %self.topics.control,
            results = %self.topics.results,
            "pipeline running"
        );
        // Queued messages always go before a tick: their receipt times predate it.
        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    break;
                }
                msg = inbound.recv() => match msg {
                    Some(msg) => self.on_message(msg).await,
                    None => {
                        info!("inbound channel closed");
                        break;
                    }
                },
                _ = ticker.tick() => {
                    while let Ok(msg) = inbound.try_recv() {
                        self.on_message(msg).await;
                    }
                    let actions = self.controller.tick(Instant::now().into_std());
                    self.perform_all(actions).await;
                }
            }
        }
        self.publisher
    }

    async fn on_message(&mut self, msg: Inbound) {
        if msg.topic == self.topics.fragments {
            match self
                .controller
                .on_fragment(msg.received_at, msg.received_wall, &msg.payload)
            {
                Ok(actions) => self.perform_all(actions).await,
                Err(e) => warn!(error = %e, "fragment dropped"),
            }
        } else if msg.topic == self.topics.control {
            self.controller.on_debug_toggle();
        } else {
            debug!(topic = %msg.topic, "message on unrouted topic ignored");
        }
    }

    async fn perform_all(&mut self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Dispatch(job) => {
                    let outcome = self.infer(&job).await;
                    let record = self.controller.finish(&job, outcome, SystemTime::now());
                    self.emit(record).await;
                }
                Action::Publish(record) => self.emit(record).await,
            }
        }
    }

    /// One hardware transaction on the blocking pool, bounded by `hardware_timeout`. A late
    /// transaction keeps the device locked until it returns; sessions closing meanwhile fail
    /// with `Busy` instead of queueing behind it.
    async fn infer(&self, job: &InferenceJob) -> Result<Label, InferenceError> {
        let bridge = self.bridge.clone();
        let device = Arc::clone(&self.device);
        let waveform = job.waveform.clone();
        let work = tokio::task::spawn_blocking(move || {
            let mut guard = match device.try_lock() {
                Ok(guard) => guard,
                Err(TryLockError::WouldBlock) => return Err(InferenceError::Busy),
                Err(TryLockError::Poisoned(poisoned)) => {
                    warn!("accelerator reclaimed after a panicked transaction");
                    device.clear_poison();
                    poisoned.into_inner()
                }
            };
            bridge.classify(&waveform, &mut **guard)
        });
        match tokio::time::timeout(self.hardware_timeout, work).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(join)) => Err(InferenceError::Aborted(join.to_string())),
            Err(_) => Err(InferenceError::TimedOut(self.hardware_timeout)),
        }
    }

    async fn emit(&self, record: ClassificationResult) {
        let json = match record.to_json() {
            Ok(json) => json,
            Err(e) => {
                error!(error = %e, "status record not serializable");
                return;
            }
        };
        info!(status = record.status(), payload = %json, "publishing result");
        if let Err(e) = self
            .publisher
            .publish(&self.topics.results, json.into_bytes())
            .await
        {
            error!(error = %e, "result not published");
        }
    }
}
