//! Permission negotiation with the host
//!
//! # Single-flight
//!
//! The first caller of [`PermissionNegotiator::request_access`] creates the
//! request future and caches it as a [`Shared`] future in the session. Every
//! concurrent caller awaits a clone of that same future, so the provider sees
//! exactly one request no matter how many call sites race. The future settles
//! the session itself when it completes:
//!
//! - granted → `Granted`, the host handle is cached for later callers
//! - denied → `Denied`, later callers fail without prompting again
//! - timeout, unsupported, insecure, cancelled → `Unrequested`, a fresh call
//!   may retry

pub mod provider;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub use provider::{HostPermission, MidirPermission, PermissionProvider};

use crate::error::AccessError;
use crate::events::{AccessEvent, EventBus};
use crate::host::MidiHost;

/// Hard ceiling for the permission wait, whatever the configuration says
pub const PERMISSION_TIMEOUT_CEILING: Duration = Duration::from_secs(30);

/// Default permission wait
pub const DEFAULT_PERMISSION_TIMEOUT: Duration = Duration::from_secs(10);

pub type PermissionResult = Result<Arc<dyn MidiHost>, AccessError>;

type SharedRequest = Shared<BoxFuture<'static, PermissionResult>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionState {
    Unrequested,
    Pending,
    Granted,
    Denied,
}

#[derive(Debug, Clone)]
pub struct AccessOptions {
    /// Request system-exclusive access
    pub sysex: bool,
    pub timeout: Duration,
}

impl Default for AccessOptions {
    fn default() -> Self {
        Self {
            sysex: false,
            timeout: DEFAULT_PERMISSION_TIMEOUT,
        }
    }
}

impl AccessOptions {
    /// Requested timeout clamped to the ceiling
    pub fn effective_timeout(&self) -> Duration {
        self.timeout.min(PERMISSION_TIMEOUT_CEILING)
    }
}

struct Session {
    state: PermissionState,
    in_flight: Option<SharedRequest>,
    host: Option<Arc<dyn MidiHost>>,
    /// Bumped on each new request and on reset, so a stale request cannot
    /// settle a newer session
    generation: u64,
}

pub struct PermissionNegotiator {
    provider: Arc<dyn PermissionProvider>,
    session: Arc<Mutex<Session>>,
    events: Arc<EventBus>,
    shutdown: watch::Sender<bool>,
    requests_issued: Arc<AtomicU64>,
}

impl PermissionNegotiator {
    pub fn new(provider: Arc<dyn PermissionProvider>, events: Arc<EventBus>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            provider,
            session: Arc::new(Mutex::new(Session {
                state: PermissionState::Unrequested,
                in_flight: None,
                host: None,
                generation: 0,
            })),
            events,
            shutdown,
            requests_issued: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn is_supported(&self) -> bool {
        self.provider.is_supported()
    }

    /// Cached session state; never touches the host
    pub fn query_state(&self) -> PermissionState {
        self.session.lock().state
    }

    /// Ask the provider while the session is still unrequested. Only a
    /// host-side denial is cached; a grant still goes through
    /// [`request_access`](Self::request_access) to obtain the host handle.
    pub async fn refresh_state(&self) -> PermissionState {
        if self.query_state() != PermissionState::Unrequested || !self.provider.is_supported() {
            return self.query_state();
        }
        if self.provider.query().await == HostPermission::Denied {
            let mut session = self.session.lock();
            if session.state == PermissionState::Unrequested {
                session.state = PermissionState::Denied;
            }
        }
        self.query_state()
    }

    /// Host handle, once granted
    pub fn host(&self) -> Option<Arc<dyn MidiHost>> {
        self.session.lock().host.clone()
    }

    /// Number of requests actually forwarded to the provider
    pub fn requests_issued(&self) -> u64 {
        self.requests_issued.load(Ordering::SeqCst)
    }

    /// Acquire the host handle, sharing one in-flight request among callers
    pub async fn request_access(&self, options: &AccessOptions) -> PermissionResult {
        if *self.shutdown.borrow() {
            return Err(AccessError::Cancelled);
        }
        if !self.provider.is_supported() {
            return Err(AccessError::Unsupported(
                "host offers no MIDI access".to_string(),
            ));
        }
        self.provider.check_environment()?;

        // Short-circuit on cached outcomes before considering a prompt
        let needs_query = {
            let session = self.session.lock();
            match session.state {
                PermissionState::Granted => {
                    if let Some(host) = &session.host {
                        return Ok(host.clone());
                    }
                    false
                }
                PermissionState::Denied => return Err(AccessError::Denied),
                PermissionState::Pending => false,
                PermissionState::Unrequested => true,
            }
        };

        if needs_query && self.provider.query().await == HostPermission::Denied {
            let mut session = self.session.lock();
            if session.state == PermissionState::Unrequested {
                info!("Host reports MIDI access denied, not prompting");
                session.state = PermissionState::Denied;
                return Err(AccessError::Denied);
            }
        }

        let request = {
            let mut session = self.session.lock();
            if session.state == PermissionState::Granted {
                if let Some(host) = session.host.clone() {
                    return Ok(host);
                }
            }
            if session.state == PermissionState::Denied {
                return Err(AccessError::Denied);
            }

            let joined = if session.state == PermissionState::Pending {
                session.in_flight.clone()
            } else {
                None
            };
            match joined {
                Some(request) => {
                    debug!("Joining in-flight MIDI access request");
                    request
                }
                None => {
                    let request = self.start_request(&mut session, options);
                    session.in_flight = Some(request.clone());
                    session.state = PermissionState::Pending;
                    request
                }
            }
        };

        request.await
    }

    fn start_request(&self, session: &mut Session, options: &AccessOptions) -> SharedRequest {
        session.generation += 1;
        let generation = session.generation;
        self.requests_issued.fetch_add(1, Ordering::SeqCst);

        let provider = Arc::clone(&self.provider);
        let slot = Arc::clone(&self.session);
        let events = Arc::clone(&self.events);
        let mut shutdown = self.shutdown.subscribe();
        let options = options.clone();
        let timeout = options.effective_timeout();

        info!("Requesting MIDI access (timeout {:?})", timeout);

        async move {
            events.emit(AccessEvent::PermissionWaiting {
                timeout_ms: timeout.as_millis() as u64,
            });

            let started = Instant::now();
            let request = provider.request(&options);
            tokio::pin!(request);
            let deadline = tokio::time::sleep(timeout);
            tokio::pin!(deadline);
            let second = Duration::from_secs(1);
            let mut countdown = tokio::time::interval_at(started + second, second);

            let result = loop {
                tokio::select! {
                    result = &mut request => break result,
                    _ = &mut deadline => break Err(AccessError::Timeout(timeout)),
                    _ = shutdown.wait_for(|stop| *stop) => break Err(AccessError::Cancelled),
                    _ = countdown.tick() => {
                        let remaining = timeout.saturating_sub(started.elapsed());
                        events.emit(AccessEvent::PermissionCountdown {
                            remaining_secs: remaining.as_secs(),
                        });
                    }
                }
            };

            let mut session = slot.lock();
            if session.generation == generation {
                session.in_flight = None;
                match &result {
                    Ok(host) => {
                        session.state = PermissionState::Granted;
                        session.host = Some(host.clone());
                        info!("MIDI access granted");
                    }
                    Err(AccessError::Denied) => {
                        session.state = PermissionState::Denied;
                        warn!("MIDI access denied");
                    }
                    Err(e) => {
                        session.state = PermissionState::Unrequested;
                        warn!("MIDI access request failed: {}", e);
                    }
                }
            }

            result
        }
        .boxed()
        .shared()
    }

    /// Abort any pending request and forget the session
    pub fn cancel(&self) {
        self.shutdown.send_replace(true);
        let mut session = self.session.lock();
        session.generation += 1;
        session.in_flight = None;
        session.host = None;
        session.state = PermissionState::Unrequested;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockHost, MockProvider, ProviderOutcome};

    fn negotiator(provider: Arc<MockProvider>) -> PermissionNegotiator {
        PermissionNegotiator::new(provider, Arc::new(EventBus::new()))
    }

    fn options(timeout_ms: u64) -> AccessOptions {
        AccessOptions {
            sysex: false,
            timeout: Duration::from_millis(timeout_ms),
        }
    }

    #[test]
    fn test_timeout_is_clamped_to_ceiling() {
        assert_eq!(
            options(120_000).effective_timeout(),
            PERMISSION_TIMEOUT_CEILING
        );
        assert_eq!(
            options(500).effective_timeout(),
            Duration::from_millis(500)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_requests_share_one_prompt() {
        let provider = Arc::new(MockProvider::new(ProviderOutcome::Grant(MockHost::new())));
        provider.set_delay(Duration::from_millis(200));
        let negotiator = Arc::new(negotiator(provider.clone()));

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let n = negotiator.clone();
            tasks.push(tokio::spawn(async move { n.request_access(&options(5_000)).await }));
        }
        for task in tasks {
            assert!(task.await.unwrap().is_ok());
        }

        assert_eq!(provider.request_count(), 1);
        assert_eq!(negotiator.requests_issued(), 1);
        assert_eq!(negotiator.query_state(), PermissionState::Granted);

        // Cached afterwards
        assert!(negotiator.request_access(&options(5_000)).await.is_ok());
        assert_eq!(provider.request_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_resets_session() {
        let provider = Arc::new(MockProvider::new(ProviderOutcome::Hang));
        let negotiator = negotiator(provider.clone());

        let result = negotiator.request_access(&options(1_000)).await;
        assert!(matches!(result, Err(AccessError::Timeout(_))));
        assert_eq!(negotiator.query_state(), PermissionState::Unrequested);

        // Fresh call retries
        provider.set_outcome(ProviderOutcome::Grant(MockHost::new()));
        assert!(negotiator.request_access(&options(1_000)).await.is_ok());
        assert_eq!(provider.request_count(), 2);
    }

    #[tokio::test]
    async fn test_denied_is_not_reprompted() {
        let provider = Arc::new(MockProvider::new(ProviderOutcome::Deny));
        let negotiator = negotiator(provider.clone());

        assert_eq!(
            negotiator.request_access(&options(1_000)).await.err(),
            Some(AccessError::Denied)
        );
        assert_eq!(negotiator.query_state(), PermissionState::Denied);
        assert_eq!(
            negotiator.request_access(&options(1_000)).await.err(),
            Some(AccessError::Denied)
        );
        assert_eq!(provider.request_count(), 1);
    }

    #[tokio::test]
    async fn test_host_reported_denial_skips_prompt() {
        let provider = Arc::new(MockProvider::new(ProviderOutcome::Grant(MockHost::new())));
        provider.set_host_permission(HostPermission::Denied);
        let negotiator = negotiator(provider.clone());

        assert_eq!(
            negotiator.request_access(&options(1_000)).await.err(),
            Some(AccessError::Denied)
        );
        assert_eq!(provider.request_count(), 0);
    }

    #[tokio::test]
    async fn test_refresh_state_caches_host_denial() {
        let provider = Arc::new(MockProvider::new(ProviderOutcome::Grant(MockHost::new())));
        let negotiator = negotiator(provider.clone());
        assert_eq!(negotiator.refresh_state().await, PermissionState::Unrequested);

        provider.set_host_permission(HostPermission::Denied);
        assert_eq!(negotiator.refresh_state().await, PermissionState::Denied);
        assert_eq!(provider.request_count(), 0);
    }

    #[tokio::test]
    async fn test_unsupported_and_insecure() {
        let provider = Arc::new(MockProvider::new(ProviderOutcome::Grant(MockHost::new())));
        provider.set_supported(false);
        let n = negotiator(provider.clone());
        assert!(matches!(
            n.request_access(&options(1_000)).await,
            Err(AccessError::Unsupported(_))
        ));

        let provider = Arc::new(MockProvider::new(ProviderOutcome::Grant(MockHost::new())));
        provider.set_insecure(true);
        let n = negotiator(provider.clone());
        assert!(matches!(
            n.request_access(&options(1_000)).await,
            Err(AccessError::InsecureEnvironment(_))
        ));
        assert_eq!(provider.request_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_countdown_events() {
        let provider = Arc::new(MockProvider::new(ProviderOutcome::Hang));
        let events = Arc::new(EventBus::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        events.subscribe(Arc::new(move |e: &AccessEvent| s.lock().push(e.clone())));

        let negotiator = PermissionNegotiator::new(provider, events);
        let _ = negotiator.request_access(&options(3_000)).await;

        let seen = seen.lock();
        assert_eq!(
            seen[0],
            AccessEvent::PermissionWaiting { timeout_ms: 3_000 }
        );
        assert!(seen
            .iter()
            .any(|e| matches!(e, AccessEvent::PermissionCountdown { remaining_secs: 1 })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_pending_request() {
        let provider = Arc::new(MockProvider::new(ProviderOutcome::Hang));
        let negotiator = Arc::new(negotiator(provider));

        let n = negotiator.clone();
        let task = tokio::spawn(async move { n.request_access(&options(20_000)).await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        negotiator.cancel();

        assert_eq!(task.await.unwrap().err(), Some(AccessError::Cancelled));
        assert_eq!(
            negotiator.request_access(&options(1_000)).await.err(),
            Some(AccessError::Cancelled)
        );
    }
}
