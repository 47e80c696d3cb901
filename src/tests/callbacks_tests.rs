//! Tests for the callback bus.

use super::*;
use std::sync::Mutex;

/// Observer that records every event it receives.
#[derive(Default)]
struct RecordingObserver {
    events: Mutex<Vec<SessionEvent>>,
}

impl RecordingObserver {
    fn events(&self) -> Vec<SessionEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl SessionObserver for RecordingObserver {
    async fn on_session_event(&self, event: &SessionEvent) -> Result<(), DeliveryError> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

struct FailingObserver;

#[async_trait]
impl SessionObserver for FailingObserver {
    async fn on_session_event(&self, _event: &SessionEvent) -> Result<(), DeliveryError> {
        Err(DeliveryError::Disconnected("binder died".to_string()))
    }
}

struct StuckObserver;

#[async_trait]
impl SessionObserver for StuckObserver {
    async fn on_session_event(&self, _event: &SessionEvent) -> Result<(), DeliveryError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(())
    }
}

fn event(id: i32, user: UserId, kind: SessionEventKind) -> SessionEvent {
    SessionEvent::new(SessionId(id), user, kind)
}

#[tokio::test]
async fn test_events_filtered_by_user() {
    let bus = CallbackBus::new(Duration::from_secs(1));
    let user0 = Arc::new(RecordingObserver::default());
    let user10 = Arc::new(RecordingObserver::default());
    bus.register(user0.clone(), 0).await;
    bus.register(user10.clone(), 10).await;

    bus.notify(event(1, 0, SessionEventKind::Created));
    bus.notify(event(2, 10, SessionEventKind::Created));
    bus.flush().await;

    assert_eq!(user0.events(), vec![event(1, 0, SessionEventKind::Created)]);
    assert_eq!(user10.events(), vec![event(2, 10, SessionEventKind::Created)]);
}

#[tokio::test]
async fn test_delivery_preserves_post_order() {
    let bus = CallbackBus::new(Duration::from_secs(1));
    let observer = Arc::new(RecordingObserver::default());
    bus.register(observer.clone(), 0).await;

    let posted = vec![
        event(1, 0, SessionEventKind::Created),
        event(1, 0, SessionEventKind::ActiveChanged { active: true }),
        event(1, 0, SessionEventKind::ProgressChanged { progress: 0.5 }),
        event(1, 0, SessionEventKind::Finished { success: true }),
    ];
    for e in &posted {
        bus.notify(e.clone());
    }
    bus.flush().await;

    assert_eq!(observer.events(), posted);
}

#[tokio::test]
async fn test_failing_observer_is_dropped_without_affecting_others() {
    let bus = CallbackBus::new(Duration::from_secs(1));
    let healthy = Arc::new(RecordingObserver::default());
    bus.register(Arc::new(FailingObserver), 0).await;
    bus.register(healthy.clone(), 0).await;

    bus.notify(event(1, 0, SessionEventKind::Created));
    bus.notify(event(1, 0, SessionEventKind::BadgingChanged));
    bus.flush().await;

    assert_eq!(bus.observer_count().await, 1);
    assert_eq!(healthy.events().len(), 2);
}

#[tokio::test]
async fn test_stuck_observer_times_out_and_is_dropped() {
    let bus = CallbackBus::new(Duration::from_millis(100));
    let healthy = Arc::new(RecordingObserver::default());
    bus.register(Arc::new(StuckObserver), 0).await;
    bus.register(healthy.clone(), 0).await;

    bus.notify(event(1, 0, SessionEventKind::Created));
    bus.notify(event(1, 0, SessionEventKind::Finished { success: false }));
    bus.flush().await;

    assert_eq!(bus.observer_count().await, 1);
    assert_eq!(healthy.events().len(), 2);
}

#[tokio::test]
async fn test_unregister_stops_delivery() {
    let bus = CallbackBus::new(Duration::from_secs(1));
    let observer = Arc::new(RecordingObserver::default());
    let id = bus.register(observer.clone(), 0).await;

    assert!(bus.unregister(id).await);
    assert!(!bus.unregister(id).await);

    bus.notify(event(1, 0, SessionEventKind::Created));
    bus.flush().await;
    assert!(observer.events().is_empty());
}

/// Observer that takes a while with every event but stays under the timeout.
#[derive(Default)]
struct SlowObserver {
    seen: Mutex<usize>,
}

#[async_trait]
impl SessionObserver for SlowObserver {
    async fn on_session_event(&self, _event: &SessionEvent) -> Result<(), DeliveryError> {
        tokio::time::sleep(Duration::from_millis(300)).await;
        *self.seen.lock().unwrap() += 1;
        Ok(())
    }
}

/// Observer that still accepts events but no longer answers pings.
struct SilentObserver;

#[async_trait]
impl SessionObserver for SilentObserver {
    async fn on_session_event(&self, _event: &SessionEvent) -> Result<(), DeliveryError> {
        Ok(())
    }

    async fn ping(&self) -> Result<(), DeliveryError> {
        Err(DeliveryError::Disconnected("peer closed".to_string()))
    }
}

#[tokio::test]
async fn test_slow_observer_does_not_delay_others() {
    let bus = CallbackBus::new(Duration::from_secs(2));
    let slow = Arc::new(SlowObserver::default());
    let fast = Arc::new(RecordingObserver::default());
    bus.register(slow.clone(), 0).await;
    bus.register(fast.clone(), 0).await;

    let posted: Vec<SessionEvent> = (1..=5)
        .map(|p| event(1, 0, SessionEventKind::ProgressChanged { progress: p as f32 / 5.0 }))
        .collect();
    for e in &posted {
        bus.notify(e.clone());
    }

    // The slow observer needs 1.5s for all five; the fast one must not wait.
    let caught_up = tokio::time::timeout(Duration::from_millis(700), async {
        while fast.events().len() < posted.len() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(caught_up.is_ok());
    assert_eq!(fast.events(), posted);
    assert!(*slow.seen.lock().unwrap() < posted.len());

    bus.flush().await;
    assert_eq!(*slow.seen.lock().unwrap(), posted.len());
    assert_eq!(bus.observer_count().await, 2);
}

#[tokio::test]
async fn test_prune_removes_observers_that_miss_pings() {
    let bus = CallbackBus::new(Duration::from_millis(200));
    let healthy = Arc::new(RecordingObserver::default());
    bus.register(Arc::new(SilentObserver), 7).await;
    bus.register(Arc::new(StuckObserver), 7).await;
    bus.register(healthy.clone(), 7).await;

    assert_eq!(bus.prune_unresponsive().await, 1);
    assert_eq!(bus.observer_count().await, 2);
    assert_eq!(bus.prune_unresponsive().await, 0);

    bus.notify(event(4, 7, SessionEventKind::Created));
    bus.flush().await;
    assert_eq!(healthy.events().len(), 1);
}
