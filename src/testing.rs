//! Test doubles for the host, permission provider and collaborators

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::error::{AccessError, Error, Result};
use crate::events::{AccessEvent, Observer};
use crate::handlers::{DeviceHandler, HandlerContext};
use crate::host::{HostPort, HotplugSignal, MidiHost, PortInfo, RawCallback};
use crate::midi::Message;
use crate::permission::{AccessOptions, HostPermission, PermissionProvider};
use crate::services::{
    ConnectivitySnapshot, InstrumentPlaybackService, MemoryPersistence, PersistenceService,
};

pub struct MockPort {
    info: PortInfo,
    open: AtomicBool,
    fail_open: AtomicBool,
    callback: RwLock<Option<RawCallback>>,
    pub open_calls: AtomicUsize,
    pub close_calls: AtomicUsize,
}

impl MockPort {
    pub fn new(info: PortInfo) -> Arc<Self> {
        Arc::new(Self {
            info,
            open: AtomicBool::new(false),
            fail_open: AtomicBool::new(false),
            callback: RwLock::new(None),
            open_calls: AtomicUsize::new(0),
            close_calls: AtomicUsize::new(0),
        })
    }

    pub fn set_fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }

    pub fn is_attached(&self) -> bool {
        self.callback.read().is_some()
    }

    /// Simulate bytes arriving from the hardware
    pub fn emit(&self, data: &[u8]) {
        let callback = self.callback.read().clone();
        if let Some(callback) = callback {
            callback(0, data);
        }
    }
}

impl HostPort for MockPort {
    fn info(&self) -> &PortInfo {
        &self.info
    }

    fn open(&self) -> Result<()> {
        self.open_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(Error::Port("open refused".to_string()));
        }
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) -> Result<()> {
        if self.open.swap(false, Ordering::SeqCst) {
            self.close_calls.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn attach(&self, callback: RawCallback) {
        *self.callback.write() = Some(callback);
    }

    fn detach(&self) {
        *self.callback.write() = None;
    }
}

#[derive(Default)]
pub struct MockHost {
    ports: Mutex<Vec<Arc<MockPort>>>,
    hotplug: Mutex<Option<mpsc::UnboundedSender<HotplugSignal>>>,
    pub scans: AtomicUsize,
}

impl MockHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_port(&self, id: &str, name: &str, manufacturer: &str) -> Arc<MockPort> {
        let port = MockPort::new(PortInfo::input(id, name, manufacturer));
        self.ports.lock().push(port.clone());
        port
    }

    pub fn remove_port(&self, id: &str) -> Option<Arc<MockPort>> {
        let mut ports = self.ports.lock();
        let index = ports.iter().position(|p| p.info.id == id)?;
        Some(ports.remove(index))
    }

    pub fn port(&self, id: &str) -> Option<Arc<MockPort>> {
        self.ports.lock().iter().find(|p| p.info.id == id).cloned()
    }

    pub fn send_hotplug(&self, signal: HotplugSignal) -> bool {
        match self.hotplug.lock().as_ref() {
            Some(tx) => tx.send(signal).is_ok(),
            None => false,
        }
    }
}

impl MidiHost for MockHost {
    fn input_ports(&self) -> Result<Vec<Arc<dyn HostPort>>> {
        self.scans.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .ports
            .lock()
            .iter()
            .map(|p| p.clone() as Arc<dyn HostPort>)
            .collect())
    }

    fn subscribe_hotplug(&self) -> Option<mpsc::UnboundedReceiver<HotplugSignal>> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.hotplug.lock() = Some(tx);
        Some(rx)
    }
}

#[derive(Clone)]
pub enum ProviderOutcome {
    Grant(Arc<MockHost>),
    Deny,
    Hang,
    Unsupported,
}

pub struct MockProvider {
    outcome: Mutex<ProviderOutcome>,
    delay: Mutex<Duration>,
    supported: AtomicBool,
    insecure: AtomicBool,
    host_permission: Mutex<HostPermission>,
    requests: AtomicU64,
}

impl MockProvider {
    pub fn new(outcome: ProviderOutcome) -> Self {
        Self {
            outcome: Mutex::new(outcome),
            delay: Mutex::new(Duration::ZERO),
            supported: AtomicBool::new(true),
            insecure: AtomicBool::new(false),
            host_permission: Mutex::new(HostPermission::Prompt),
            requests: AtomicU64::new(0),
        }
    }

    pub fn set_outcome(&self, outcome: ProviderOutcome) {
        *self.outcome.lock() = outcome;
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    pub fn set_supported(&self, supported: bool) {
        self.supported.store(supported, Ordering::SeqCst);
    }

    pub fn set_insecure(&self, insecure: bool) {
        self.insecure.store(insecure, Ordering::SeqCst);
    }

    pub fn set_host_permission(&self, permission: HostPermission) {
        *self.host_permission.lock() = permission;
    }

    pub fn request_count(&self) -> u64 {
        self.requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PermissionProvider for MockProvider {
    fn is_supported(&self) -> bool {
        self.supported.load(Ordering::SeqCst)
    }

    fn check_environment(&self) -> std::result::Result<(), AccessError> {
        if self.insecure.load(Ordering::SeqCst) {
            return Err(AccessError::InsecureEnvironment(
                "untrusted test host".to_string(),
            ));
        }
        Ok(())
    }

    async fn query(&self) -> HostPermission {
        *self.host_permission.lock()
    }

    async fn request(
        &self,
        _options: &AccessOptions,
    ) -> std::result::Result<Arc<dyn MidiHost>, AccessError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let outcome = self.outcome.lock().clone();
        match outcome {
            ProviderOutcome::Grant(host) => Ok(host as Arc<dyn MidiHost>),
            ProviderOutcome::Deny => Err(AccessError::Denied),
            ProviderOutcome::Unsupported => {
                Err(AccessError::Unsupported("no MIDI stack".to_string()))
            }
            ProviderOutcome::Hang => std::future::pending().await,
        }
    }
}

/// In-memory persistence whose saves take `delay`
pub struct SlowPersistence {
    pub inner: MemoryPersistence,
    delay: Duration,
}

impl SlowPersistence {
    pub fn new(delay: Duration) -> Self {
        Self {
            inner: MemoryPersistence::new(),
            delay,
        }
    }
}

#[async_trait]
impl PersistenceService for SlowPersistence {
    async fn load_snapshot(&self) -> Result<Option<ConnectivitySnapshot>> {
        self.inner.load_snapshot().await
    }

    async fn save_snapshot(&self, snapshot: &ConnectivitySnapshot) -> Result<()> {
        tokio::time::sleep(self.delay).await;
        self.inner.save_snapshot(snapshot).await
    }
}

#[derive(Default)]
pub struct RecordingPlayback {
    pub notes: Mutex<Vec<(u8, u64, u8)>>,
    pub instruments: Mutex<Vec<String>>,
}

impl InstrumentPlaybackService for RecordingPlayback {
    fn play_note(&self, note: u8, duration_ms: u64, velocity: u8) {
        self.notes.lock().push((note, duration_ms, velocity));
    }

    fn load_instrument(&self, key: &str) {
        self.instruments.lock().push(key.to_string());
    }
}

#[derive(Default)]
pub struct RecordingObserver {
    pub events: Mutex<Vec<AccessEvent>>,
}

impl RecordingObserver {
    pub fn count(&self, name: &str) -> usize {
        self.events.lock().iter().filter(|e| e.name() == name).count()
    }
}

impl Observer for RecordingObserver {
    fn on_event(&self, event: &AccessEvent) {
        self.events.lock().push(event.clone());
    }
}

/// Handler that counts what it receives; instances share one counter set
#[derive(Default)]
pub struct CountingHandler {
    pub messages: AtomicUsize,
    pub teardowns: AtomicUsize,
    pub playback: Mutex<Option<bool>>,
}

impl DeviceHandler for CountingHandler {
    fn on_message(&self, _message: &Message) {
        self.messages.fetch_add(1, Ordering::SeqCst);
    }

    fn set_playback_mode(&self, enabled: bool) {
        *self.playback.lock() = Some(enabled);
    }

    fn teardown(&self) {
        self.teardowns.fetch_add(1, Ordering::SeqCst);
    }
}

/// Factory counting instantiations and handing out the same shared handler
pub fn counting_factory(
    handler: Arc<CountingHandler>,
    created: Arc<AtomicUsize>,
) -> crate::handlers::HandlerFactory {
    Arc::new(move |_ctx: &HandlerContext| {
        created.fetch_add(1, Ordering::SeqCst);
        Ok(handler.clone() as Arc<dyn DeviceHandler>)
    })
}
