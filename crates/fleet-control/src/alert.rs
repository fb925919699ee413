//! Offline alerting
//!
//! Tracks a Normal/Firing state per agent and node so one outage produces one
//! offline notification, and the recovery notification carries the downtime.
//! State changes happen on the hub's lifecycle path; delivery runs on the
//! [`AlertDispatcher`] task so a slow notifier never stalls registration.
//!
//! Transitions observed by other instances arrive through
//! [`AlertTracker::follow`] and only move the state: the observing instance
//! sends the notification, so an outage seen on one instance and a reconnect
//! seen on another still pair up into one Offline and one Recovered.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use fleet_db::FleetStore;
use fleet_proto::{ResourceKind, StatusEvent};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::event_bus::EventBus;
use crate::handler::LifecycleHandler;
use crate::hub::Hub;
use crate::notifier::{Notification, NotificationEvent, Notifier};

const QUEUE_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertState {
    Normal,
    Firing { since: DateTime<Utc> },
}

pub struct AlertTracker {
    states: DashMap<(ResourceKind, String), DateTime<Utc>>,
    queue: mpsc::Sender<Notification>,
}

impl AlertTracker {
    pub fn new(store: Arc<dyn FleetStore>, notifier: Arc<dyn Notifier>) -> (Arc<Self>, AlertDispatcher) {
        let (queue, rx) = mpsc::channel(QUEUE_CAPACITY);
        let tracker = Arc::new(Self {
            states: DashMap::new(),
            queue,
        });
        let dispatcher = AlertDispatcher {
            rx,
            store,
            notifier,
        };
        (tracker, dispatcher)
    }

    pub fn state(&self, kind: ResourceKind, id: &str) -> AlertState {
        match self.states.get(&(kind, id.to_string())) {
            Some(since) => AlertState::Firing { since: *since },
            None => AlertState::Normal,
        }
    }

    /// Resources currently firing, oldest outage first
    pub fn firing(&self) -> Vec<(ResourceKind, String, DateTime<Utc>)> {
        let mut firing: Vec<_> = self
            .states
            .iter()
            .map(|entry| (entry.key().0, entry.key().1.clone(), *entry.value()))
            .collect();
        firing.sort_by_key(|(_, _, since)| *since);
        firing
    }

    fn went_offline(&self, kind: ResourceKind, id: &str, at: DateTime<Utc>) -> Option<NotificationEvent> {
        let key = (kind, id.to_string());
        if self.states.contains_key(&key) {
            return None;
        }
        self.states.insert(key, at);
        Some(NotificationEvent::Offline)
    }

    fn came_online(&self, kind: ResourceKind, id: &str, at: DateTime<Utc>) -> NotificationEvent {
        match self.states.remove(&(kind, id.to_string())) {
            Some((_, since)) => NotificationEvent::Recovered {
                downtime_secs: (at - since).num_seconds().max(0) as u64,
            },
            None => NotificationEvent::Online,
        }
    }

    /// Mirror transitions relayed from other instances until cancelled
    pub async fn follow(self: Arc<Self>, bus: Arc<EventBus>, hub: Arc<Hub>, cancel: CancellationToken) {
        let mut events = bus.subscribe_status();
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => return,
                event = events.recv() => match event {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Alert tracker fell behind on status events");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                },
            };
            if event.origin == bus.instance_id() {
                continue;
            }
            let connected_here = hub.is_online(event.kind, &event.id);
            self.mirror(&event, connected_here);
        }
    }

    fn mirror(&self, event: &StatusEvent, connected_here: bool) {
        let key = (event.kind, event.id.clone());
        if event.online {
            if self.states.remove(&key).is_some() {
                debug!(kind = %event.kind, id = %event.id, origin = %event.origin, "Alert resolved elsewhere");
            }
            return;
        }
        // A late offline from the old holder must not re-fire a live session
        if connected_here || self.states.contains_key(&key) {
            return;
        }
        let since = DateTime::<Utc>::from_timestamp(event.timestamp, 0).unwrap_or_else(Utc::now);
        debug!(kind = %event.kind, id = %event.id, origin = %event.origin, "Alert firing elsewhere");
        self.states.insert(key, since);
    }

    fn enqueue(&self, kind: ResourceKind, id: &str, event: NotificationEvent, at: DateTime<Utc>) {
        let notification = Notification {
            kind,
            id: id.to_string(),
            name: id.to_string(),
            event,
            at,
        };
        if self.queue.try_send(notification).is_err() {
            warn!(%kind, id, "Notification queue full, dropping notification");
        }
    }
}

impl LifecycleHandler for AlertTracker {
    fn on_online(&self, kind: ResourceKind, id: &str) {
        let now = Utc::now();
        let event = self.came_online(kind, id, now);
        if let NotificationEvent::Recovered { downtime_secs } = event {
            info!(%kind, id, downtime_secs, "Alert resolved");
        }
        self.enqueue(kind, id, event, now);
    }

    fn on_offline(&self, kind: ResourceKind, id: &str) {
        let now = Utc::now();
        if let Some(event) = self.went_offline(kind, id, now) {
            info!(%kind, id, "Alert firing");
            self.enqueue(kind, id, event, now);
        }
    }
}

/// Delivers queued notifications, honouring each resource's mute flag
pub struct AlertDispatcher {
    rx: mpsc::Receiver<Notification>,
    store: Arc<dyn FleetStore>,
    notifier: Arc<dyn Notifier>,
}

impl AlertDispatcher {
    pub async fn run(mut self, cancel: CancellationToken) {
        loop {
            let notification = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Alert dispatcher stopped");
                    return;
                }
                notification = self.rx.recv() => match notification {
                    Some(n) => n,
                    None => return,
                },
            };
            self.deliver(notification).await;
        }
    }

    async fn deliver(&self, mut notification: Notification) {
        let lookup = match notification.kind {
            ResourceKind::Agent => self
                .store
                .get_agent(&notification.id)
                .await
                .map(|a| a.map(|a| (a.name, a.mute_notifications))),
            ResourceKind::Node => self
                .store
                .get_node(&notification.id)
                .await
                .map(|n| n.map(|n| (n.name, n.mute_notifications))),
        };

        match lookup {
            Ok(Some((_, true))) => {
                debug!(kind = %notification.kind, id = %notification.id, "Notifications muted");
                return;
            }
            Ok(Some((name, false))) if !name.is_empty() => notification.name = name,
            Ok(_) => {}
            Err(e) => {
                warn!(id = %notification.id, error = %e, "Cannot load resource for notification")
            }
        }

        if let Err(e) = self.notifier.notify(&notification).await {
            warn!(
                kind = %notification.kind,
                id = %notification.id,
                error = %e,
                "Failed to send notification"
            );
        }
    }
}
