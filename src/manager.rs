//! MIDI access facade
//!
//! [`MidiAccess`] wires the permission negotiator, device registry, handler
//! registry and reconnect supervisor together and is the only type most
//! applications touch. It is cheap to clone; background tasks (hotplug
//! listener, deferred rescans, retries) hold weak references and stop once
//! the last handle is dropped or [`MidiAccess::destroy`] is called.

use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::error::{AccessError, Result};
use crate::events::{
    AccessEvent, EventBus, ListenerId, MessageCallback, MessageListeners, Observer,
};
use crate::handlers::builtin::builtin_profiles;
use crate::handlers::{
    DeviceHandler, HandlerProfile, HandlerRegistrar, HandlerRegistry, HandlerSettings,
    RegisterOptions, RegisterOutcome,
};
use crate::host::{DevicePort, HotplugSignal, MidiHost};
use crate::midi::{Message, MessageKind};
use crate::permission::{
    AccessOptions, MidirPermission, PermissionNegotiator, PermissionProvider, PermissionState,
};
use crate::reconnect::{ReconnectPolicy, ReconnectSupervisor, RetryDecision};
use crate::registry::{Collaborators, DeviceRegistry, ScanReport};
use crate::security::{FingerprintRules, RejectedPort, SecurityFilter};
use crate::services::{
    ErrorReporter, InstrumentPlaybackService, KnownDevice, LoggingPlayback, MemoryPersistence,
    NotificationLevel, NotificationSink, PersistenceService, TracingNotifier,
};

/// Point-in-time view of the manager
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessStats {
    pub supported: bool,
    pub initialized: bool,
    pub permission: PermissionState,
    pub device_count: usize,
    /// Devices with a handler attached
    pub handler_count: usize,
    /// Profile ids in resolution order
    pub registered_handlers: Vec<String>,
    pub devices: Vec<DevicePort>,
    pub rejected: Vec<RejectedPort>,
}

pub struct MidiAccessBuilder {
    client_name: String,
    provider: Option<Arc<dyn PermissionProvider>>,
    options: AccessOptions,
    policy: ReconnectPolicy,
    hotplug_poll: Duration,
    rules: FingerprintRules,
    settings: HandlerSettings,
    playback: Arc<dyn InstrumentPlaybackService>,
    notifier: Arc<dyn NotificationSink>,
    persistence: Arc<dyn PersistenceService>,
    registrar: Option<Arc<HandlerRegistrar>>,
    builtin_handlers: bool,
}

impl Default for MidiAccessBuilder {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

impl MidiAccessBuilder {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            client_name: config.midi.client_name.clone(),
            provider: None,
            options: config.access_options(),
            policy: config.reconnect_policy(),
            hotplug_poll: config.hotplug_poll(),
            rules: config.fingerprint_rules(),
            settings: config.handler_settings(),
            playback: Arc::new(LoggingPlayback),
            notifier: Arc::new(TracingNotifier),
            persistence: Arc::new(MemoryPersistence::new()),
            registrar: None,
            builtin_handlers: true,
        }
    }

    /// Permission provider; defaults to the system MIDI stack
    pub fn provider(mut self, provider: Arc<dyn PermissionProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn access_options(mut self, options: AccessOptions) -> Self {
        self.options = options;
        self
    }

    pub fn reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn fingerprint_rules(mut self, rules: FingerprintRules) -> Self {
        self.rules = rules;
        self
    }

    pub fn handler_settings(mut self, settings: HandlerSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn playback(mut self, playback: Arc<dyn InstrumentPlaybackService>) -> Self {
        self.playback = playback;
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn NotificationSink>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn persistence(mut self, persistence: Arc<dyn PersistenceService>) -> Self {
        self.persistence = persistence;
        self
    }

    /// Registrar holding profiles contributed before this manager existed
    pub fn registrar(mut self, registrar: Arc<HandlerRegistrar>) -> Self {
        self.registrar = Some(registrar);
        self
    }

    pub fn without_builtin_handlers(mut self) -> Self {
        self.builtin_handlers = false;
        self
    }

    pub fn build(self) -> Result<MidiAccess> {
        let events = Arc::new(EventBus::new());
        let listeners = Arc::new(MessageListeners::new());
        let handlers = Arc::new(HandlerRegistry::new());

        if self.builtin_handlers {
            for profile in builtin_profiles()? {
                handlers.register(
                    profile,
                    RegisterOptions {
                        allow_override: false,
                        silent_duplicate: true,
                    },
                )?;
            }
        }

        let registrar = self.registrar.unwrap_or_else(HandlerRegistrar::new);
        let flushed = registrar.attach(&handlers);
        if flushed > 0 {
            debug!("{} contributed handler profiles registered", flushed);
        }

        let provider = self.provider.unwrap_or_else(|| {
            Arc::new(MidirPermission::new(self.client_name.clone(), self.hotplug_poll))
                as Arc<dyn PermissionProvider>
        });

        let registry = DeviceRegistry::new(
            Arc::new(SecurityFilter::new(&self.rules)),
            handlers.clone(),
            events.clone(),
            listeners.clone(),
            Collaborators {
                playback: self.playback,
                notifier: self.notifier.clone(),
                persistence: self.persistence.clone(),
            },
            self.settings,
        );

        let inner = Inner {
            negotiator: PermissionNegotiator::new(provider, events.clone()),
            options: self.options,
            supervisor: ReconnectSupervisor::new(self.policy, events.clone()),
            registry,
            handlers,
            registrar,
            events,
            listeners,
            reporter: ErrorReporter::new(self.notifier),
            persistence: self.persistence,
            known_devices: Mutex::new(Vec::new()),
            snapshot_loaded: AtomicBool::new(false),
            initialized: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            hotplug_task: Mutex::new(None),
            scan_lock: tokio::sync::Mutex::new(()),
        };

        Ok(MidiAccess {
            inner: Arc::new(inner),
        })
    }
}

struct Inner {
    negotiator: PermissionNegotiator,
    options: AccessOptions,
    supervisor: ReconnectSupervisor,
    registry: DeviceRegistry,
    handlers: Arc<HandlerRegistry>,
    registrar: Arc<HandlerRegistrar>,
    events: Arc<EventBus>,
    listeners: Arc<MessageListeners>,
    reporter: ErrorReporter,
    persistence: Arc<dyn PersistenceService>,
    /// Devices expected to be present, from the last snapshot or scan
    known_devices: Mutex<Vec<KnownDevice>>,
    snapshot_loaded: AtomicBool,
    initialized: AtomicBool,
    destroyed: AtomicBool,
    hotplug_task: Mutex<Option<JoinHandle<()>>>,
    /// Scans never interleave
    scan_lock: tokio::sync::Mutex<()>,
}

impl Inner {
    fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Negotiate access, start the hotplug listener and scan once.
    /// Returns the number of tracked devices.
    async fn try_initialize(self: &Arc<Self>, reason: &str) -> std::result::Result<usize, AccessError> {
        if self.is_destroyed() {
            return Err(AccessError::Cancelled);
        }

        let host = self.negotiator.request_access(&self.options).await?;
        self.load_known_devices().await;
        self.start_hotplug(&host);

        let device_count = match self.scan_ports(reason).await {
            Some(report) => report.device_count,
            None => self.registry.len(),
        };
        if self.is_destroyed() {
            return Err(AccessError::Cancelled);
        }

        self.initialized.store(true, Ordering::SeqCst);
        info!(
            "✅ MIDI access initialized ({}): {} device(s)",
            reason, device_count
        );
        self.events.emit(AccessEvent::Initialized {
            reason: reason.to_string(),
            device_count,
        });
        Ok(device_count)
    }

    async fn initialize(self: &Arc<Self>, reason: &str) -> bool {
        match self.try_initialize(reason).await {
            Ok(_) => true,
            Err(e) => {
                self.report_access_error(&e);
                false
            }
        }
    }

    fn report_access_error(&self, error: &AccessError) {
        if matches!(error, AccessError::Cancelled) {
            debug!("MIDI access cancelled");
            return;
        }

        warn!("MIDI access failed: {}", error);

        let (level, text) = match error {
            AccessError::Unsupported(_) => (
                NotificationLevel::Error,
                "MIDI devices are not supported on this system",
            ),
            AccessError::InsecureEnvironment(_) => (
                NotificationLevel::Error,
                "MIDI access requires a trusted environment",
            ),
            AccessError::Denied => (
                NotificationLevel::Error,
                "MIDI access was denied. Allow it in the system settings to use your keyboard",
            ),
            AccessError::Timeout(_) => (
                NotificationLevel::Warning,
                "No answer to the MIDI access request yet",
            ),
            AccessError::Cancelled => return,
        };
        if self.reporter.report_once(error.kind(), level, text) {
            self.events.emit(AccessEvent::AccessFailed {
                kind: error.kind().to_string(),
                message: error.to_string(),
            });
        }
    }

    async fn load_known_devices(&self) {
        if self.snapshot_loaded.swap(true, Ordering::SeqCst) {
            return;
        }
        match self.persistence.load_snapshot().await {
            Ok(Some(snapshot)) => {
                debug!(
                    "Connectivity snapshot lists {} known device(s)",
                    snapshot.devices.len()
                );
                *self.known_devices.lock() = snapshot.devices;
            }
            Ok(None) => {}
            Err(e) => warn!("Could not load connectivity snapshot: {}", e),
        }
    }

    async fn scan_ports(&self, reason: &str) -> Option<ScanReport> {
        if self.is_destroyed() {
            return None;
        }
        let Some(host) = self.negotiator.host() else {
            debug!("Scan '{}' skipped: MIDI access not granted", reason);
            return None;
        };

        let _guard = self.scan_lock.lock().await;
        if self.is_destroyed() {
            return None;
        }

        let report = match self.registry.scan(host.as_ref(), reason).await {
            Ok(report) => report,
            Err(e) => {
                warn!("Port scan '{}' failed: {}", reason, e);
                return None;
            }
        };

        if report.device_count > 0 {
            *self.known_devices.lock() = self
                .registry
                .devices()
                .into_iter()
                .map(|d| KnownDevice {
                    id: d.id,
                    name: d.display_name,
                    manufacturer: d.manufacturer,
                })
                .collect();
            if self.supervisor.complete_success(report.device_count) {
                self.reporter
                    .info(&format!("{} MIDI device(s) reconnected", report.device_count));
            }
        }
        Some(report)
    }

    fn start_hotplug(self: &Arc<Self>, host: &Arc<dyn MidiHost>) {
        let mut slot = self.hotplug_task.lock();
        if slot.is_some() || self.is_destroyed() {
            return;
        }
        let Some(mut rx) = host.subscribe_hotplug() else {
            debug!("Host reports no hotplug changes");
            return;
        };

        let weak: Weak<Inner> = Arc::downgrade(self);
        *slot = Some(tokio::spawn(async move {
            while let Some(signal) = rx.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.on_hotplug(signal).await;
            }
            debug!("Hotplug listener stopped");
        }));
    }

    async fn on_hotplug(self: &Arc<Self>, signal: HotplugSignal) {
        if self.is_destroyed() {
            return;
        }
        match signal {
            HotplugSignal::Disconnected(info) => {
                debug!("Hotplug: '{}' removed", info.name);
                self.registry.disconnect_device(&info.id).await;
                self.schedule_rescan("hotplug-disconnect");
            }
            HotplugSignal::Connected(info) => {
                debug!("Hotplug: '{}' added", info.name);
                self.schedule_rescan("hotplug-connect");
            }
        }
    }

    /// Settle, then rescan; a newer rescan supersedes this one
    fn schedule_rescan(self: &Arc<Self>, reason: &'static str) {
        let weak = Arc::downgrade(self);
        self.supervisor.schedule_rescan(async move {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let found = inner
                .scan_ports(reason)
                .await
                .map(|r| r.device_count)
                .unwrap_or(0);
            if found == 0 {
                inner.after_empty_scan(reason.to_string());
            }
        });
    }

    /// Continue an active reconnect attempt after a scan found nothing.
    /// Returns true if a retry was scheduled.
    fn after_empty_scan(self: &Arc<Self>, reason: String) -> bool {
        if self.supervisor.active().is_none() {
            return false;
        }
        if self.known_devices.lock().is_empty() {
            debug!("No known devices, nothing to wait for");
            self.supervisor.abandon();
            return false;
        }

        match self.supervisor.next_retry() {
            RetryDecision::Retry { delay, .. } => {
                let weak = Arc::downgrade(self);
                self.supervisor.schedule_retry(delay, async move {
                    if let Some(inner) = weak.upgrade() {
                        inner.reconnect_pass(reason).await;
                    }
                })
            }
            RetryDecision::Exhausted { .. } | RetryDecision::Idle => false,
        }
    }

    /// One reconnect attempt: re-initialize if access is not granted,
    /// otherwise rescan
    fn reconnect_pass(self: Arc<Self>, reason: String) -> BoxFuture<'static, bool> {
        async move {
            if self.is_destroyed() {
                return false;
            }
            self.load_known_devices().await;

            let found = if self.negotiator.query_state() == PermissionState::Granted {
                self.scan_ports(&reason)
                    .await
                    .map(|r| r.device_count)
                    .unwrap_or(0)
            } else {
                match self.try_initialize(&reason).await {
                    Ok(count) => count,
                    Err(e) => {
                        self.report_access_error(&e);
                        if !e.is_recoverable() {
                            self.supervisor.abandon();
                            return false;
                        }
                        0
                    }
                }
            };

            if found > 0 {
                return true;
            }
            self.after_empty_scan(reason);
            false
        }
        .boxed()
    }

    fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down MIDI access");

        self.negotiator.cancel();
        self.supervisor.shutdown();
        if let Some(task) = self.hotplug_task.lock().take() {
            task.abort();
        }

        let closed = self.registry.disconnect_all();
        self.listeners.clear();
        self.events.clear();
        self.reporter.reset();
        self.initialized.store(false, Ordering::SeqCst);
        debug!("{} device(s) closed", closed);
    }
}

/// Handle to the MIDI access manager
#[derive(Clone)]
pub struct MidiAccess {
    inner: Arc<Inner>,
}

impl MidiAccess {
    pub fn builder() -> MidiAccessBuilder {
        MidiAccessBuilder::default()
    }

    /// Negotiate access and connect authorized devices.
    ///
    /// Concurrent calls share one permission request. Returns false when
    /// access failed; each failure kind is reported once per session,
    /// through the notifier and as an [`AccessEvent::AccessFailed`] event.
    pub async fn initialize(&self, reason: &str) -> bool {
        self.inner.initialize(reason).await
    }

    /// Rescan ports. `None` if access is not granted or the manager is
    /// destroyed.
    pub async fn scan_ports(&self, reason: &str) -> Option<ScanReport> {
        self.inner.scan_ports(reason).await
    }

    /// Manual reconnect trigger, e.g. when the application resumes.
    ///
    /// Returns true if at least one device is connected afterwards. When
    /// nothing is found but devices are known from before, bounded retries
    /// continue in the background.
    pub async fn auto_reconnect(&self, reason: &str) -> bool {
        if self.inner.is_destroyed() {
            return false;
        }
        self.inner.supervisor.begin(reason);
        self.inner.clone().reconnect_pass(reason.to_string()).await
    }

    /// Register a handler profile; allowed before initialization
    pub fn register_handler_profile(
        &self,
        profile: HandlerProfile,
        options: RegisterOptions,
    ) -> Result<Option<RegisterOutcome>> {
        self.inner.registrar.contribute(profile, options)
    }

    /// Listen to decoded messages, optionally of one kind only
    pub fn on<F>(&self, filter: Option<MessageKind>, callback: F) -> ListenerId
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        let callback: MessageCallback = Arc::new(callback);
        self.inner.listeners.on(filter, callback)
    }

    pub fn off(&self, id: ListenerId) -> bool {
        self.inner.listeners.off(id)
    }

    pub fn subscribe(&self, observer: Arc<dyn Observer>) -> ListenerId {
        self.inner.events.subscribe(observer)
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.inner.events.unsubscribe(id)
    }

    pub fn connected_devices(&self) -> Vec<DevicePort> {
        self.inner.registry.devices()
    }

    pub fn device_handler(&self, device_id: &str) -> Option<Arc<dyn DeviceHandler>> {
        self.inner.registry.handler(device_id)
    }

    /// Id of the profile whose handler serves `device_id`
    pub fn device_profile(&self, device_id: &str) -> Option<String> {
        self.inner.registry.profile_of(device_id)
    }

    pub fn stats(&self) -> AccessStats {
        let inner = &self.inner;
        AccessStats {
            supported: inner.negotiator.is_supported(),
            initialized: inner.initialized.load(Ordering::SeqCst),
            permission: inner.negotiator.query_state(),
            device_count: inner.registry.len(),
            handler_count: inner.registry.handler_count(),
            registered_handlers: inner.handlers.profile_ids(),
            devices: inner.registry.devices(),
            rejected: inner.registry.filter().rejected(),
        }
    }

    /// Permission state, asking the host while nothing was requested yet
    pub async fn permission_state(&self) -> PermissionState {
        self.inner.negotiator.refresh_state().await
    }

    pub fn set_playback_mode(&self, enabled: bool) {
        if self.inner.is_destroyed() {
            return;
        }
        info!(
            "Playback mode {}",
            if enabled { "enabled" } else { "disabled" }
        );
        self.inner.registry.set_playback_mode(enabled);
        self.inner
            .events
            .emit(AccessEvent::PlaybackModeChanged { enabled });
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.is_destroyed()
    }

    /// Cancel pending work, close every device and drop all listeners.
    /// Afterwards every operation is a no-op.
    pub fn destroy(&self) {
        self.inner.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::DeviceMatcher;
    use crate::host::HostPort;
    use crate::services::ConnectivitySnapshot;
    use crate::testing::{
        counting_factory, CountingHandler, MockHost, MockProvider, ProviderOutcome,
        RecordingObserver, SlowPersistence,
    };
    use std::sync::atomic::AtomicUsize;

    struct Harness {
        access: MidiAccess,
        host: Arc<MockHost>,
        provider: Arc<MockProvider>,
        observer: Arc<RecordingObserver>,
    }

    fn harness_with(persistence: Arc<MemoryPersistence>) -> Harness {
        let host = MockHost::new();
        let provider = Arc::new(MockProvider::new(ProviderOutcome::Grant(host.clone())));
        let access = MidiAccess::builder()
            .provider(provider.clone())
            .persistence(persistence)
            .build()
            .unwrap();
        let observer = Arc::new(RecordingObserver::default());
        access.subscribe(observer.clone());
        Harness {
            access,
            host,
            provider,
            observer,
        }
    }

    fn harness() -> Harness {
        harness_with(Arc::new(MemoryPersistence::new()))
    }

    fn known_snapshot() -> Arc<MemoryPersistence> {
        Arc::new(MemoryPersistence::with_snapshot(ConnectivitySnapshot::new(vec![
            KnownDevice {
                id: "in-1".into(),
                name: "Rehab Keys".into(),
                manufacturer: "Acme".into(),
            },
        ])))
    }

    fn counting_profile(priority: i32) -> (HandlerProfile, Arc<CountingHandler>) {
        let handler = Arc::new(CountingHandler::default());
        let profile = HandlerProfile::builder("counting")
            .priority(priority)
            .matcher(DeviceMatcher::always())
            .shared_factory(counting_factory(handler.clone(), Arc::new(AtomicUsize::new(0))))
            .build()
            .unwrap();
        (profile, handler)
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_initialize_issues_one_request() {
        let h = harness();
        h.provider.set_delay(Duration::from_millis(300));
        h.host.add_port("in-1", "Rehab Keys", "Acme");

        let mut tasks = Vec::new();
        for i in 0..8 {
            let access = h.access.clone();
            tasks.push(tokio::spawn(async move {
                access.initialize(&format!("caller-{}", i)).await
            }));
        }
        for task in tasks {
            assert!(task.await.unwrap());
        }

        assert_eq!(h.provider.request_count(), 1);
        assert_eq!(h.access.connected_devices().len(), 1);
        assert_eq!(h.observer.count("device-connected"), 1);
        assert_eq!(h.observer.count("permission-waiting"), 1);
    }

    #[tokio::test]
    async fn test_initialize_connects_builtin_handler() {
        let h = harness();
        h.host.add_port("in-1", "Rehab Keys", "Acme");
        h.host.add_port("in-2", "Launchpad Mini", "Novation");

        assert!(h.access.initialize("startup").await);

        let stats = h.access.stats();
        assert!(stats.initialized);
        assert_eq!(stats.permission, PermissionState::Granted);
        assert_eq!(stats.device_count, 1);
        assert_eq!(stats.handler_count, 1);
        assert_eq!(stats.rejected.len(), 1);
        assert_eq!(stats.registered_handlers, vec!["drum-pads", "generic-keyboard"]);
        assert_eq!(h.access.device_profile("in-1").as_deref(), Some("generic-keyboard"));
        assert!(h.access.device_handler("in-1").is_some());
        assert_eq!(h.observer.count("initialized"), 1);
    }

    #[tokio::test]
    async fn test_access_failure_reported_once_per_kind() {
        let h = harness();
        h.provider.set_outcome(ProviderOutcome::Deny);

        assert!(!h.access.initialize("startup").await);
        assert!(!h.access.initialize("again").await);

        assert_eq!(h.provider.request_count(), 1);
        assert_eq!(h.observer.count("access-failed"), 1);
        assert_eq!(h.access.stats().permission, PermissionState::Denied);
    }

    #[tokio::test]
    async fn test_unsupported_reported_once() {
        let provider = Arc::new(MockProvider::new(ProviderOutcome::Unsupported));
        let access = MidiAccess::builder()
            .provider(provider)
            .without_builtin_handlers()
            .build()
            .unwrap();
        let observer = Arc::new(RecordingObserver::default());
        access.subscribe(observer.clone());

        assert!(!access.initialize("startup").await);
        assert!(!access.initialize("again").await);

        assert_eq!(observer.count("access-failed"), 1);
        assert!(access.stats().registered_handlers.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_reconnect_retries_are_bounded() {
        let h = harness_with(known_snapshot());

        assert!(!h.access.auto_reconnect("resume").await);
        tokio::time::sleep(Duration::from_secs(10)).await;

        // Initial scan plus three retries, then halt
        assert_eq!(h.host.scans.load(std::sync::atomic::Ordering::SeqCst), 4);
        assert_eq!(h.observer.count("auto-reconnect-attempt"), 4);
        assert_eq!(h.observer.count("auto-reconnect-failed"), 1);
        assert_eq!(h.observer.count("auto-reconnect-success"), 0);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(h.host.scans.load(std::sync::atomic::Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_retry_without_known_devices() {
        let h = harness();

        assert!(!h.access.auto_reconnect("resume").await);
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(h.host.scans.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(h.observer.count("auto-reconnect-failed"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_success_notified_exactly_once() {
        let h = harness_with(known_snapshot());

        assert!(!h.access.auto_reconnect("resume").await);
        h.host.add_port("in-1", "Rehab Keys", "Acme");
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(h.access.connected_devices().len(), 1);
        assert_eq!(h.observer.count("auto-reconnect-success"), 1);

        h.access.scan_ports("manual").await.unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(h.observer.count("auto-reconnect-success"), 1);
        assert_eq!(h.observer.count("auto-reconnect-failed"), 0);
    }

    #[tokio::test]
    async fn test_auto_reconnect_with_devices_succeeds_immediately() {
        let h = harness();
        h.host.add_port("in-1", "Rehab Keys", "Acme");

        assert!(h.access.auto_reconnect("resume").await);
        assert_eq!(h.observer.count("auto-reconnect-success"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hotplug_disconnect_then_deferred_rescan() {
        let h = harness();
        h.host.add_port("in-1", "Rehab Keys", "Acme");
        assert!(h.access.initialize("startup").await);
        let scans_before = h.host.scans.load(std::sync::atomic::Ordering::SeqCst);

        let port = h.host.remove_port("in-1").unwrap();
        h.host
            .send_hotplug(HotplugSignal::Disconnected(port.info().clone()));
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(h.access.connected_devices().is_empty());
        assert!(!port.is_attached());
        assert!(h.access.inner.supervisor.has_pending());
        assert_eq!(h.host.scans.load(std::sync::atomic::Ordering::SeqCst), scans_before);

        // Reconnected before the rescan fires
        let port = h.host.add_port("in-1", "Rehab Keys", "Acme");
        h.host
            .send_hotplug(HotplugSignal::Connected(port.info().clone()));
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(h.host.scans.load(std::sync::atomic::Ordering::SeqCst), scans_before + 1);
        assert_eq!(h.access.connected_devices().len(), 1);
        assert!(port.is_attached());
    }

    #[tokio::test]
    async fn test_destroy_leaves_no_callbacks() {
        let h = harness();
        let port = h.host.add_port("in-1", "Rehab Keys", "Acme");
        let (profile, handler) = counting_profile(100);
        h.access
            .register_handler_profile(profile, RegisterOptions::default())
            .unwrap();

        let received = Arc::new(AtomicUsize::new(0));
        let r = received.clone();
        h.access.on(None, move |_: &Message| {
            r.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        });

        assert!(h.access.initialize("startup").await);
        port.emit(&[0x90, 60, 100]);
        assert_eq!(received.load(std::sync::atomic::Ordering::SeqCst), 1);

        h.access.destroy();
        port.emit(&[0x90, 60, 100]);

        assert_eq!(received.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(handler.messages.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(handler.teardowns.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert!(!port.is_attached());
        assert!(!port.is_open());
        assert!(h.access.connected_devices().is_empty());
        assert!(h.access.scan_ports("after").await.is_none());
        assert!(!h.access.initialize("after").await);
        assert!(!h.access.auto_reconnect("after").await);
        assert!(h.access.is_destroyed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_during_scan_stops_connecting() {
        let host = MockHost::new();
        let p1 = host.add_port("in-1", "Rehab Keys", "Acme");
        let p2 = host.add_port("in-2", "Digital Piano", "Acme");
        let provider = Arc::new(MockProvider::new(ProviderOutcome::Grant(host.clone())));
        let persistence = Arc::new(SlowPersistence::new(Duration::from_millis(100)));
        let access = MidiAccess::builder()
            .provider(provider)
            .persistence(persistence.clone())
            .build()
            .unwrap();
        let created = Arc::new(AtomicUsize::new(0));
        let profile = HandlerProfile::builder("counting")
            .priority(100)
            .matcher(DeviceMatcher::always())
            .shared_factory(counting_factory(
                Arc::new(CountingHandler::default()),
                created.clone(),
            ))
            .build()
            .unwrap();
        access
            .register_handler_profile(profile, RegisterOptions::default())
            .unwrap();

        let a = access.clone();
        let task = tokio::spawn(async move { a.initialize("startup").await });

        // in-1 is connected and its snapshot is being written
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(p1.is_attached());
        access.destroy();

        assert!(!task.await.unwrap());
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(access.connected_devices().is_empty());
        assert!(!p1.is_attached() && !p1.is_open());
        assert!(!p2.is_attached());
        assert_eq!(p2.open_calls.load(std::sync::atomic::Ordering::SeqCst), 0);
        assert_eq!(created.load(std::sync::atomic::Ordering::SeqCst), 0);
        assert!(!access.stats().initialized);
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_cancels_pending_permission_request() {
        let h = harness();
        h.host.add_port("in-1", "Rehab Keys", "Acme");
        h.provider.set_outcome(ProviderOutcome::Hang);

        let access = h.access.clone();
        let task = tokio::spawn(async move { access.initialize("startup").await });
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(h.provider.request_count(), 1);
        let events_before = h.observer.events.lock().len();

        h.access.destroy();

        assert!(!task.await.unwrap());
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(h.observer.events.lock().len(), events_before);
        assert!(h.access.connected_devices().is_empty());
        assert_eq!(h.host.scans.load(std::sync::atomic::Ordering::SeqCst), 0);
        assert_eq!(h.access.stats().permission, PermissionState::Unrequested);
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_cancels_pending_rescan() {
        let h = harness();
        h.host.add_port("in-1", "Rehab Keys", "Acme");
        assert!(h.access.initialize("startup").await);
        let scans_before = h.host.scans.load(std::sync::atomic::Ordering::SeqCst);

        let port = h.host.add_port("in-2", "Digital Piano", "Acme");
        h.host
            .send_hotplug(HotplugSignal::Connected(port.info().clone()));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(h.access.inner.supervisor.has_pending());
        let events_before = h.observer.events.lock().len();

        h.access.destroy();
        assert!(!h.access.inner.supervisor.has_pending());
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(h.host.scans.load(std::sync::atomic::Ordering::SeqCst), scans_before);
        assert_eq!(h.observer.events.lock().len(), events_before);
        assert!(!port.is_attached());
        assert!(h.access.connected_devices().is_empty());
        assert!(!h.host.send_hotplug(HotplugSignal::Disconnected(port.info().clone())));
    }

    #[tokio::test]
    async fn test_playback_mode_propagates_to_handlers() {
        let h = harness();
        h.host.add_port("in-1", "Rehab Keys", "Acme");
        let (profile, handler) = counting_profile(100);
        h.access
            .register_handler_profile(profile, RegisterOptions::default())
            .unwrap();
        assert!(h.access.initialize("startup").await);

        h.access.set_playback_mode(false);

        assert_eq!(*handler.playback.lock(), Some(false));
        assert_eq!(h.observer.count("playback-mode-changed"), 1);
    }

    #[tokio::test]
    async fn test_registrar_contributions_before_build() {
        let registrar = HandlerRegistrar::new();
        let (profile, _) = counting_profile(100);
        registrar
            .contribute(profile, RegisterOptions::default())
            .unwrap();

        let host = MockHost::new();
        host.add_port("in-1", "Rehab Keys", "Acme");
        let access = MidiAccess::builder()
            .provider(Arc::new(MockProvider::new(ProviderOutcome::Grant(host))))
            .registrar(registrar)
            .build()
            .unwrap();

        assert!(access.initialize("startup").await);
        assert_eq!(access.device_profile("in-1").as_deref(), Some("counting"));
    }

    #[tokio::test]
    async fn test_unsubscribe_and_off() {
        let h = harness();
        let id = h.access.subscribe(Arc::new(crate::events::NoopObserver));
        assert!(h.access.unsubscribe(id));
        let id = h.access.on(Some(MessageKind::NoteOn), |_: &Message| {});
        assert!(h.access.off(id));
        assert!(!h.access.off(id));
    }

    #[tokio::test]
    async fn test_permission_state_queries_host() {
        let h = harness();
        assert_eq!(h.access.permission_state().await, PermissionState::Unrequested);
        h.provider
            .set_host_permission(crate::permission::HostPermission::Denied);
        assert_eq!(h.access.permission_state().await, PermissionState::Denied);
        assert!(!h.access.initialize("startup").await);
        assert_eq!(h.provider.request_count(), 0);
    }
}
