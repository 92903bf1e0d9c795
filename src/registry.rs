//! Tracked devices
//!
//! The registry owns every connected port. Connecting a port attaches a
//! decoder callback that turns raw bytes into [`Message`]s and dispatches
//! them to the device's handler and to the message listeners. Each device
//! has its own dispatch slot, so the input path never contends with other
//! devices or with registry bookkeeping.

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

use crate::error::Result;
use crate::events::{AccessEvent, EventBus, MessageListeners};
use crate::handlers::{DeviceHandler, HandlerContext, HandlerRegistry, HandlerSettings};
use crate::host::{ConnectionState, DevicePort, HostPort, MidiHost, RawCallback};
use crate::midi::{self, Message};
use crate::security::{DeviceDescriptor, SecurityFilter, Verdict};
use crate::services::{
    ConnectivitySnapshot, InstrumentPlaybackService, KnownDevice, NotificationLevel,
    NotificationSink, PersistenceService,
};

/// Result of a port scan
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanReport {
    pub reason: String,
    /// Input ports visible on the host
    pub discovered: usize,
    /// Ids connected by this scan
    pub connected: Vec<String>,
    /// Ids refused by the security filter
    pub rejected: Vec<String>,
    /// Ids dropped because their port vanished
    pub removed: Vec<String>,
    /// Tracked devices after the scan
    pub device_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectOutcome {
    Connected,
    AlreadyConnected,
    Rejected(Verdict),
    /// The registry was shut down
    Closed,
}

/// Handler attached to a device, read on every incoming message
#[derive(Default)]
struct DispatchSlot {
    handler: RwLock<Option<Arc<dyn DeviceHandler>>>,
}

struct DeviceEntry {
    port: Arc<dyn HostPort>,
    info: DevicePort,
    slot: Arc<DispatchSlot>,
    profile: Option<String>,
}

/// Collaborators handed to handlers and used for snapshots
#[derive(Clone)]
pub struct Collaborators {
    pub playback: Arc<dyn InstrumentPlaybackService>,
    pub notifier: Arc<dyn NotificationSink>,
    pub persistence: Arc<dyn PersistenceService>,
}

pub struct DeviceRegistry {
    filter: Arc<SecurityFilter>,
    handlers: Arc<HandlerRegistry>,
    events: Arc<EventBus>,
    listeners: Arc<MessageListeners>,
    collaborators: Collaborators,
    settings: RwLock<HandlerSettings>,
    devices: Mutex<BTreeMap<String, DeviceEntry>>,
    /// Ids whose port is being opened; lock after `devices`
    connecting: Mutex<HashSet<String>>,
    /// Set under the `devices` lock by `disconnect_all`
    closed: AtomicBool,
    missing_reported: Mutex<HashSet<String>>,
}

impl DeviceRegistry {
    pub fn new(
        filter: Arc<SecurityFilter>,
        handlers: Arc<HandlerRegistry>,
        events: Arc<EventBus>,
        listeners: Arc<MessageListeners>,
        collaborators: Collaborators,
        settings: HandlerSettings,
    ) -> Self {
        Self {
            filter,
            handlers,
            events,
            listeners,
            collaborators,
            settings: RwLock::new(settings),
            devices: Mutex::new(BTreeMap::new()),
            connecting: Mutex::new(HashSet::new()),
            closed: AtomicBool::new(false),
            missing_reported: Mutex::new(HashSet::new()),
        }
    }

    /// Enumerate the host's input ports, connect the authorized ones and
    /// drop tracked devices whose port is gone
    pub async fn scan(&self, host: &dyn MidiHost, reason: &str) -> Result<ScanReport> {
        let ports = host.input_ports()?;
        let mut report = ScanReport {
            reason: reason.to_string(),
            discovered: ports.len(),
            ..Default::default()
        };

        let mut seen = HashSet::new();
        for port in ports {
            let id = port.info().id.clone();
            seen.insert(id.clone());
            match self.connect_device(port).await {
                ConnectOutcome::Connected => report.connected.push(id),
                ConnectOutcome::AlreadyConnected => {}
                ConnectOutcome::Rejected(_) => report.rejected.push(id),
                ConnectOutcome::Closed => {
                    debug!("Scan '{}' stopped: registry closed", reason);
                    return Ok(report);
                }
            }
        }

        let vanished: Vec<String> = self
            .devices
            .lock()
            .keys()
            .filter(|id| !seen.contains(*id))
            .cloned()
            .collect();
        for id in vanished {
            if self.disconnect_device(&id).await {
                report.removed.push(id);
            }
        }

        report.device_count = self.len();
        debug!(
            "Scan '{}': {} ports, {} connected, {} rejected, {} removed, {} tracked",
            reason,
            report.discovered,
            report.connected.len(),
            report.rejected.len(),
            report.removed.len(),
            report.device_count
        );
        Ok(report)
    }

    /// Connect one port. The security filter is checked again here, so no
    /// caller can bypass it.
    pub async fn connect_device(&self, port: Arc<dyn HostPort>) -> ConnectOutcome {
        let info = port.info().clone();
        let verdict = self.filter.evaluate(&info.descriptor());
        if !verdict.is_authorized() {
            if self.filter.record_rejection(&info.id, &info.name, &verdict) {
                self.events.emit(AccessEvent::DeviceRejected {
                    device_id: info.id.clone(),
                    name: info.name.clone(),
                    reason: verdict.reason(),
                });
            }
            return ConnectOutcome::Rejected(verdict);
        }

        // Reserve the id, then open outside the lock
        {
            let mut devices = self.devices.lock();
            if self.is_closed() {
                return ConnectOutcome::Closed;
            }
            if let Some(entry) = devices.get_mut(&info.id) {
                entry.info.last_seen_at = crate::host::now_ms();
                return ConnectOutcome::AlreadyConnected;
            }
            if !self.connecting.lock().insert(info.id.clone()) {
                return ConnectOutcome::AlreadyConnected;
            }
        }

        let slot = Arc::new(DispatchSlot::default());
        port.attach(self.decoder(&info.id, slot.clone()));

        let state = match port.open() {
            Ok(()) => ConnectionState::Open,
            Err(e) => {
                warn!("Could not open '{}', keeping it pending: {}", info.name, e);
                ConnectionState::Pending
            }
        };
        let device = DevicePort::from_info(&info, state);

        let inserted = {
            let mut devices = self.devices.lock();
            self.connecting.lock().remove(&info.id);
            if self.is_closed() {
                false
            } else {
                devices.insert(
                    info.id.clone(),
                    DeviceEntry {
                        port: port.clone(),
                        info: device.clone(),
                        slot: slot.clone(),
                        profile: None,
                    },
                );
                true
            }
        };
        if !inserted {
            debug!("Registry closed while opening '{}'", info.name);
            port.detach();
            if let Err(e) = port.close() {
                warn!("Error closing '{}': {}", info.name, e);
            }
            return ConnectOutcome::Closed;
        }

        info!("🎹 Device connected: '{}' ({})", info.name, info.id);
        self.events.emit(AccessEvent::DeviceConnected {
            device_id: info.id.clone(),
            name: info.name.clone(),
        });

        self.persist().await;
        self.resolve_handler(&device, &slot);
        ConnectOutcome::Connected
    }

    /// Detach, close and tear down a device, then forget it.
    /// Returns false if the id is not tracked.
    pub async fn disconnect_device(&self, id: &str) -> bool {
        let (entry, handler) = {
            let mut devices = self.devices.lock();
            let Some(entry) = devices.get(id) else {
                return false;
            };
            entry.port.detach();
            if let Err(e) = entry.port.close() {
                warn!("Error closing '{}': {}", entry.info.display_name, e);
            }
            let handler = entry.slot.handler.write().take();
            match devices.remove(id) {
                Some(entry) => (entry, handler),
                None => return false,
            }
        };

        if let Some(handler) = handler {
            teardown(id, handler.as_ref());
        }

        info!("Device disconnected: '{}' ({})", entry.info.display_name, id);
        self.events.emit(AccessEvent::DeviceDisconnected {
            device_id: id.to_string(),
            name: entry.info.display_name.clone(),
        });
        self.persist().await;
        true
    }

    /// Disconnect everything without persisting and refuse any later
    /// connection; used on shutdown
    pub fn disconnect_all(&self) -> usize {
        let entries: Vec<(String, DeviceEntry)> = {
            let mut devices = self.devices.lock();
            self.closed.store(true, Ordering::SeqCst);
            for entry in devices.values() {
                entry.port.detach();
                if let Err(e) = entry.port.close() {
                    warn!("Error closing '{}': {}", entry.info.display_name, e);
                }
            }
            std::mem::take(&mut *devices).into_iter().collect()
        };

        for (id, entry) in &entries {
            if let Some(handler) = entry.slot.handler.write().take() {
                teardown(id, handler.as_ref());
            }
        }
        entries.len()
    }

    pub fn devices(&self) -> Vec<DevicePort> {
        self.devices.lock().values().map(|e| e.info.clone()).collect()
    }

    pub fn device(&self, id: &str) -> Option<DevicePort> {
        self.devices.lock().get(id).map(|e| e.info.clone())
    }

    pub fn handler(&self, id: &str) -> Option<Arc<dyn DeviceHandler>> {
        let slot = self.devices.lock().get(id).map(|e| e.slot.clone())?;
        let handler = slot.handler.read().clone();
        handler
    }

    /// Id of the profile resolved for a device
    pub fn profile_of(&self, id: &str) -> Option<String> {
        self.devices.lock().get(id).and_then(|e| e.profile.clone())
    }

    /// Number of devices with a handler attached
    pub fn handler_count(&self) -> usize {
        self.devices
            .lock()
            .values()
            .filter(|e| e.slot.handler.read().is_some())
            .count()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.devices.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.devices.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn filter(&self) -> &SecurityFilter {
        &self.filter
    }

    /// Apply the playback toggle to current and future handlers
    pub fn set_playback_mode(&self, enabled: bool) {
        self.settings.write().playback_enabled = enabled;
        let handlers: Vec<Arc<dyn DeviceHandler>> = self
            .devices
            .lock()
            .values()
            .filter_map(|e| e.slot.handler.read().clone())
            .collect();
        for handler in handlers {
            handler.set_playback_mode(enabled);
        }
    }

    fn decoder(&self, device_id: &str, slot: Arc<DispatchSlot>) -> RawCallback {
        let device_id = device_id.to_string();
        let listeners = self.listeners.clone();
        Arc::new(move |timestamp: u64, bytes: &[u8]| {
            let message = midi::decode(bytes, &device_id, timestamp);
            trace!("{} <- {}", device_id, message);
            dispatch(&device_id, &slot, &message);
            listeners.dispatch(&message);
        })
    }

    fn resolve_handler(&self, device: &DevicePort, slot: &Arc<DispatchSlot>) {
        if self.is_closed() {
            return;
        }
        let descriptor =
            DeviceDescriptor::new(&device.display_name, &device.id, &device.manufacturer);

        let Some(profile) = self.handlers.resolve(&descriptor) else {
            self.report_missing(device, "no handler profile matches this device".to_string());
            return;
        };

        let ctx = HandlerContext {
            port: device.clone(),
            playback: self.collaborators.playback.clone(),
            notifier: self.collaborators.notifier.clone(),
            settings: *self.settings.read(),
        };
        let handler = match profile.instantiate(&ctx) {
            Ok(handler) => handler,
            Err(e) => {
                error!("{}", e);
                self.report_missing(device, e.to_string());
                return;
            }
        };

        let attached = {
            let mut devices = self.devices.lock();
            match devices.get_mut(&device.id) {
                Some(entry) if Arc::ptr_eq(&entry.slot, slot) => {
                    *slot.handler.write() = Some(handler.clone());
                    entry.profile = Some(profile.id().to_string());
                    true
                }
                _ => false,
            }
        };
        if !attached {
            // Disconnected while the factory ran
            teardown(&device.id, handler.as_ref());
            return;
        }

        info!(
            "Handler '{}' attached to '{}'",
            profile.label(),
            device.display_name
        );
        self.events.emit(AccessEvent::HandlerAttached {
            device_id: device.id.clone(),
            profile_id: profile.id().to_string(),
            label: profile.label().to_string(),
        });
    }

    fn report_missing(&self, device: &DevicePort, reason: String) {
        if !self.missing_reported.lock().insert(device.id.clone()) {
            return;
        }
        warn!(
            "No handler for '{}' ({}): {}. Device stays connected without one",
            device.display_name, device.id, reason
        );
        self.collaborators.notifier.notify(
            NotificationLevel::Warning,
            &format!("'{}' is connected but not supported yet", device.display_name),
        );
        self.events.emit(AccessEvent::HandlerMissing {
            device_id: device.id.clone(),
            reason,
        });
    }

    async fn persist(&self) {
        if self.is_closed() {
            return;
        }
        let devices: Vec<KnownDevice> = self
            .devices
            .lock()
            .values()
            .map(|e| KnownDevice {
                id: e.info.id.clone(),
                name: e.info.display_name.clone(),
                manufacturer: e.info.manufacturer.clone(),
            })
            .collect();

        let snapshot = ConnectivitySnapshot::new(devices);
        if let Err(e) = self.collaborators.persistence.save_snapshot(&snapshot).await {
            warn!("Failed to persist connectivity snapshot: {}", e);
        }
    }
}

fn dispatch(device_id: &str, slot: &DispatchSlot, message: &Message) {
    let handler = slot.handler.read().clone();
    if let Some(handler) = handler {
        if catch_unwind(AssertUnwindSafe(|| handler.on_message(message))).is_err() {
            error!("Handler for '{}' panicked on {}", device_id, message.kind);
        }
    }
}

fn teardown(device_id: &str, handler: &dyn DeviceHandler) {
    if catch_unwind(AssertUnwindSafe(|| handler.teardown())).is_err() {
        error!("Handler teardown for '{}' panicked", device_id);
    }
}
