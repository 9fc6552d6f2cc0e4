//! Fan-out of analysis progress to subscribers grouped by user and tenant.
//!
//! Every notification goes to the union of the owner's user room and the
//! tenant room; a subscriber present in both receives it once. Delivery is
//! best-effort: no replay, and a subscriber whose buffer is full misses the
//! event.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::*;

use crate::{Job, SensitivityLabel, VideoStatus};

const DEFAULT_BUFFER: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Room {
    User(String),
    Tenant(String),
}

impl Room {
    pub fn user(id: impl Into<String>) -> Self {
        Room::User(id.into())
    }

    pub fn tenant(id: impl Into<String>) -> Self {
        Room::Tenant(id.into())
    }
}

impl fmt::Display for Room {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Room::User(id) => write!(f, "user-{id}"),
            Room::Tenant(id) => write!(f, "tenant-{id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all_fields = "camelCase")]
pub enum NotificationEvent {
    #[serde(rename = "video:processing")]
    ProcessingStarted { status: VideoStatus, progress: u8 },

    #[serde(rename = "video:progress")]
    Progress { progress: u8, message: String },

    #[serde(rename = "video:completed")]
    Completed {
        status: VideoStatus,
        sensitivity_status: SensitivityLabel,
        progress: u8,
        confidence: u8,
        analysis_note: String,
    },

    #[serde(rename = "video:error")]
    Error { status: VideoStatus, error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub video_id: String,
    pub owner_id: String,
    pub tenant_id: String,
    #[serde(flatten)]
    pub event: NotificationEvent,
}

impl Notification {
    pub fn for_job(job: &Job, event: NotificationEvent) -> Self {
        Notification {
            video_id: job.video_id.clone(),
            owner_id: job.owner_id.clone(),
            tenant_id: job.tenant_id.clone(),
            event,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.event,
            NotificationEvent::Completed { .. } | NotificationEvent::Error { .. }
        )
    }
}

struct Subscriber {
    rooms: HashSet<Room>,
    tx: mpsc::Sender<Notification>,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    subscribers: HashMap<u64, Subscriber>,
}

struct Inner {
    buffer: usize,
    registry: Mutex<Registry>,
}

#[derive(Clone)]
pub struct ProgressNotifier {
    inner: Arc<Inner>,
}

impl ProgressNotifier {
    pub fn new() -> Self {
        Self::with_buffer(DEFAULT_BUFFER)
    }

    /// `buffer` notifications are held per subscriber before new ones are
    /// dropped.
    pub fn with_buffer(buffer: usize) -> Self {
        ProgressNotifier {
            inner: Arc::new(Inner {
                buffer: buffer.max(1),
                registry: Mutex::new(Registry::default()),
            }),
        }
    }

    pub fn subscribe(&self, rooms: impl IntoIterator<Item = Room>) -> Subscription {
        let (tx, rx) = mpsc::channel(self.inner.buffer);
        let mut registry = self.inner.registry.lock();
        let id = registry.next_id;
        registry.next_id += 1;
        registry.subscribers.insert(
            id,
            Subscriber {
                rooms: rooms.into_iter().collect(),
                tx,
            },
        );
        Subscription {
            id,
            rx,
            inner: self.inner.clone(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.registry.lock().subscribers.len()
    }

    /// Deliver to the owner's user room and the tenant room.
    pub fn publish(&self, notification: Notification) {
        let user = Room::user(notification.owner_id.as_str());
        let tenant = Room::tenant(notification.tenant_id.as_str());

        let mut registry = self.inner.registry.lock();
        let mut closed = Vec::new();
        for (id, subscriber) in registry.subscribers.iter() {
            if !subscriber.rooms.contains(&user) && !subscriber.rooms.contains(&tenant) {
                continue;
            }
            match subscriber.tx.try_send(notification.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    debug!(message = "Subscriber lagging, notification dropped", subscriber = id, video_id = %notification.video_id);
                }
                Err(TrySendError::Closed(_)) => closed.push(*id),
            }
        }
        for id in closed {
            registry.subscribers.remove(&id);
        }
    }
}

impl Default for ProgressNotifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving side of a subscription; unsubscribes when dropped.
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<Notification>,
    inner: Arc<Inner>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<Notification> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Notification> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.inner.registry.lock().subscribers.remove(&self.id);
    }
}
