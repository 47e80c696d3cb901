//! Session lifecycle event fan-out.
//!
//! Events are posted to one dispatch task, which forwards each event to a
//! queue per matching registration. Every registration drains its own queue
//! on its own task, so an observer sees events in the order they were posted
//! and a slow observer never holds up the others. Observers that fail, time
//! out or stop answering pings are unregistered without affecting the rest.

use crate::errors::DeliveryError;
use crate::session::{SessionId, UserId};
use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, RwLock};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SessionEventKind {
    Created,
    BadgingChanged,
    ActiveChanged { active: bool },
    ProgressChanged { progress: f32 },
    Finished { success: bool },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEvent {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub kind: SessionEventKind,
}

impl SessionEvent {
    pub fn new(session_id: SessionId, user_id: UserId, kind: SessionEventKind) -> Self {
        Self {
            session_id,
            user_id,
            kind,
        }
    }
}

/// Receiver of session events for one user.
#[async_trait]
pub trait SessionObserver: Send + Sync {
    async fn on_session_event(&self, event: &SessionEvent) -> Result<(), DeliveryError>;

    /// Liveness check for observers that may vanish between events.
    async fn ping(&self) -> Result<(), DeliveryError> {
        Ok(())
    }
}

/// Handle returned by [`CallbackBus::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObserverId(pub u64);

impl std::fmt::Display for ObserverId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

enum QueueItem {
    Event(Arc<SessionEvent>),
    Flush(oneshot::Sender<()>),
}

struct Registration {
    id: ObserverId,
    user_id: UserId,
    observer: Arc<dyn SessionObserver>,
    queue: mpsc::UnboundedSender<QueueItem>,
}

type Registrations = Arc<RwLock<Vec<Registration>>>;

enum BusMessage {
    Event(SessionEvent),
    Flush(oneshot::Sender<()>),
}

#[derive(Clone)]
pub struct CallbackBus {
    registrations: Registrations,
    next_id: Arc<AtomicU64>,
    delivery_timeout: Duration,
    tx: mpsc::UnboundedSender<BusMessage>,
}

impl CallbackBus {
    /// Creates the bus and spawns its dispatch task on the current runtime.
    ///
    /// The task exits once every clone of the bus is dropped.
    pub fn new(delivery_timeout: Duration) -> Self {
        let registrations: Registrations = Arc::new(RwLock::new(Vec::new()));
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_dispatch_worker(registrations.clone(), rx));
        Self {
            registrations,
            next_id: Arc::new(AtomicU64::new(1)),
            delivery_timeout,
            tx,
        }
    }

    pub async fn register(&self, observer: Arc<dyn SessionObserver>, user_id: UserId) -> ObserverId {
        let id = ObserverId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (queue, queue_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_observer_queue(
            Arc::downgrade(&self.registrations),
            id,
            observer.clone(),
            queue_rx,
            self.delivery_timeout,
        ));
        self.registrations.write().await.push(Registration {
            id,
            user_id,
            observer,
            queue,
        });
        tracing::debug!(observer_id = %id, user_id, "Observer registered");
        id
    }

    /// Removes a registration. Returns false if it was already gone.
    pub async fn unregister(&self, id: ObserverId) -> bool {
        let mut registrations = self.registrations.write().await;
        let before = registrations.len();
        registrations.retain(|r| r.id != id);
        before != registrations.len()
    }

    pub async fn observer_count(&self) -> usize {
        self.registrations.read().await.len()
    }

    /// Queues an event for delivery. Never blocks.
    pub fn notify(&self, event: SessionEvent) {
        if self.tx.send(BusMessage::Event(event)).is_err() {
            tracing::debug!("Dispatch worker stopped, dropping session event");
        }
    }

    /// Resolves once every event queued before this call has been delivered
    /// or its observer dropped.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(BusMessage::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }

    /// Pings every observer and unregisters those that fail to answer within
    /// the delivery timeout. Returns how many were removed.
    pub async fn prune_unresponsive(&self) -> usize {
        let targets: Vec<(ObserverId, Arc<dyn SessionObserver>)> = self
            .registrations
            .read()
            .await
            .iter()
            .map(|r| (r.id, r.observer.clone()))
            .collect();
        if targets.is_empty() {
            return 0;
        }

        let pings = targets.into_iter().map(|(id, observer)| async move {
            let answered = matches!(
                tokio::time::timeout(self.delivery_timeout, observer.ping()).await,
                Ok(Ok(()))
            );
            (id, answered)
        });
        let failed: Vec<ObserverId> = join_all(pings)
            .await
            .into_iter()
            .filter(|(_, answered)| !answered)
            .map(|(id, _)| id)
            .collect();

        if !failed.is_empty() {
            let mut registrations = self.registrations.write().await;
            registrations.retain(|r| !failed.contains(&r.id));
            for id in &failed {
                tracing::info!(observer_id = %id, "Removed unresponsive observer");
            }
        }
        failed.len()
    }
}

async fn run_dispatch_worker(registrations: Registrations, mut rx: mpsc::UnboundedReceiver<BusMessage>) {
    while let Some(message) = rx.recv().await {
        match message {
            BusMessage::Event(event) => {
                let event = Arc::new(event);
                let registrations = registrations.read().await;
                for registration in registrations.iter().filter(|r| r.user_id == event.user_id) {
                    let _ = registration.queue.send(QueueItem::Event(event.clone()));
                }
            }
            BusMessage::Flush(done) => {
                let acks: Vec<oneshot::Receiver<()>> = {
                    let registrations = registrations.read().await;
                    registrations
                        .iter()
                        .filter_map(|r| {
                            let (ack_tx, ack_rx) = oneshot::channel();
                            r.queue.send(QueueItem::Flush(ack_tx)).ok().map(|_| ack_rx)
                        })
                        .collect()
                };
                // A queue that closes drops its acks, which also counts as done.
                tokio::spawn(async move {
                    join_all(acks).await;
                    let _ = done.send(());
                });
            }
        }
    }
    tracing::debug!("Callback dispatch worker exiting");
}

/// Drains one registration's queue until it is unregistered or fails.
async fn run_observer_queue(
    registrations: Weak<RwLock<Vec<Registration>>>,
    id: ObserverId,
    observer: Arc<dyn SessionObserver>,
    mut rx: mpsc::UnboundedReceiver<QueueItem>,
    delivery_timeout: Duration,
) {
    while let Some(item) = rx.recv().await {
        let event = match item {
            QueueItem::Event(event) => event,
            QueueItem::Flush(ack) => {
                let _ = ack.send(());
                continue;
            }
        };
        let outcome = match tokio::time::timeout(delivery_timeout, observer.on_session_event(&event)).await {
            Ok(result) => result,
            Err(_) => Err(DeliveryError::TimedOut),
        };
        if let Err(e) = outcome {
            tracing::warn!(observer_id = %id, error = %e, "Observer delivery failed");
            if let Some(registrations) = registrations.upgrade() {
                registrations.write().await.retain(|r| r.id != id);
                tracing::info!(observer_id = %id, "Removed dead observer");
            }
            return;
        }
    }
}

#[cfg(test)]
#[path = "tests/callbacks_tests.rs"]
mod tests;
