//! Lifecycle notifications and message listeners
//!
//! Both buses deliver synchronously on the caller's thread. Every listener
//! runs inside `catch_unwind`: a panicking listener is logged and skipped so
//! the remaining listeners, and the dispatch path itself, keep working.

use parking_lot::RwLock;
use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::error;

use crate::midi::{Message, MessageKind};

/// Handle returned on registration, used to unregister
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ListenerId(u64);

/// Lifecycle notification
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum AccessEvent {
    #[serde(rename_all = "camelCase")]
    Initialized { reason: String, device_count: usize },
    #[serde(rename_all = "camelCase")]
    DeviceConnected { device_id: String, name: String },
    #[serde(rename_all = "camelCase")]
    DeviceDisconnected { device_id: String, name: String },
    #[serde(rename_all = "camelCase")]
    DeviceRejected {
        device_id: String,
        name: String,
        reason: String,
    },
    #[serde(rename_all = "camelCase")]
    HandlerAttached {
        device_id: String,
        profile_id: String,
        label: String,
    },
    #[serde(rename_all = "camelCase")]
    HandlerMissing { device_id: String, reason: String },
    AutoReconnectAttempt { reason: String, attempt: u32 },
    AutoReconnectSuccess { reason: String, devices: usize },
    AutoReconnectFailed { reason: String, attempts: u32 },
    #[serde(rename_all = "camelCase")]
    PermissionWaiting { timeout_ms: u64 },
    #[serde(rename_all = "camelCase")]
    PermissionCountdown { remaining_secs: u64 },
    AccessFailed { kind: String, message: String },
    PlaybackModeChanged { enabled: bool },
}

impl AccessEvent {
    pub fn name(&self) -> &'static str {
        match self {
            AccessEvent::Initialized { .. } => "initialized",
            AccessEvent::DeviceConnected { .. } => "device-connected",
            AccessEvent::DeviceDisconnected { .. } => "device-disconnected",
            AccessEvent::DeviceRejected { .. } => "device-rejected",
            AccessEvent::HandlerAttached { .. } => "handler-attached",
            AccessEvent::HandlerMissing { .. } => "handler-missing",
            AccessEvent::AutoReconnectAttempt { .. } => "auto-reconnect-attempt",
            AccessEvent::AutoReconnectSuccess { .. } => "auto-reconnect-success",
            AccessEvent::AutoReconnectFailed { .. } => "auto-reconnect-failed",
            AccessEvent::PermissionWaiting { .. } => "permission-waiting",
            AccessEvent::PermissionCountdown { .. } => "permission-countdown",
            AccessEvent::AccessFailed { .. } => "access-failed",
            AccessEvent::PlaybackModeChanged { .. } => "playback-mode-changed",
        }
    }
}

/// Receiver of lifecycle notifications
pub trait Observer: Send + Sync {
    fn on_event(&self, event: &AccessEvent);
}

impl<F> Observer for F
where
    F: Fn(&AccessEvent) + Send + Sync,
{
    fn on_event(&self, event: &AccessEvent) {
        self(event)
    }
}

/// Observer that ignores everything
pub struct NoopObserver;

impl Observer for NoopObserver {
    fn on_event(&self, _event: &AccessEvent) {}
}

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

fn next_id() -> ListenerId {
    ListenerId(NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed))
}

/// Fan-out of [`AccessEvent`]s to registered observers
#[derive(Default)]
pub struct EventBus {
    observers: RwLock<Vec<(ListenerId, Arc<dyn Observer>)>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, observer: Arc<dyn Observer>) -> ListenerId {
        let id = next_id();
        self.observers.write().push((id, observer));
        id
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut observers = self.observers.write();
        let before = observers.len();
        observers.retain(|(existing, _)| *existing != id);
        observers.len() != before
    }

    pub fn emit(&self, event: AccessEvent) {
        // Snapshot so observers may (un)subscribe from inside the callback
        let observers: Vec<Arc<dyn Observer>> =
            self.observers.read().iter().map(|(_, o)| o.clone()).collect();

        for observer in observers {
            if catch_unwind(AssertUnwindSafe(|| observer.on_event(&event))).is_err() {
                error!("Observer panicked while handling '{}'", event.name());
            }
        }
    }

    pub fn clear(&self) {
        self.observers.write().clear();
    }

    pub fn len(&self) -> usize {
        self.observers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Callback invoked for each decoded message
pub type MessageCallback = Arc<dyn Fn(&Message) + Send + Sync>;

/// Per-kind message listeners (`None` filter receives every message)
#[derive(Default)]
pub struct MessageListeners {
    listeners: RwLock<Vec<(ListenerId, Option<MessageKind>, MessageCallback)>>,
}

impl MessageListeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&self, filter: Option<MessageKind>, callback: MessageCallback) -> ListenerId {
        let id = next_id();
        self.listeners.write().push((id, filter, callback));
        id
    }

    pub fn off(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(existing, _, _)| *existing != id);
        listeners.len() != before
    }

    pub fn dispatch(&self, message: &Message) {
        let matching: Vec<MessageCallback> = self
            .listeners
            .read()
            .iter()
            .filter(|(_, filter, _)| filter.map_or(true, |kind| kind == message.kind))
            .map(|(_, _, cb)| cb.clone())
            .collect();

        for callback in matching {
            if catch_unwind(AssertUnwindSafe(|| callback(message))).is_err() {
                error!(
                    "Message listener panicked on {} from '{}'",
                    message.kind, message.device_id
                );
            }
        }
    }

    pub fn clear(&self) {
        self.listeners.write().clear();
    }

    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
