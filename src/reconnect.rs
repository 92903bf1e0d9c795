//! Deferred rescans and bounded reconnection
//!
//! Hotplug signals never rescan on the spot: the host usually reports a
//! burst of changes, and the port list is only stable once it settles.
//! [`DeferredScheduler`] keeps at most one pending task, a newer schedule
//! aborting the older one. [`ReconnectSupervisor`] tracks one manual
//! reconnect attempt at a time and bounds the retries it may trigger.

use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::events::{AccessEvent, EventBus};
use crate::host::now_ms;

/// Retry and delay settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_retries: u32,
    pub disconnect_rescan_delay: Duration,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            disconnect_rescan_delay: Duration::from_millis(250),
            retry_base_delay: Duration::from_millis(400),
            retry_max_delay: Duration::from_millis(1200),
        }
    }
}

impl ReconnectPolicy {
    /// Linear backoff, capped
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        self.retry_base_delay
            .saturating_mul(attempt.max(1))
            .min(self.retry_max_delay)
    }
}

struct PendingTask {
    id: u64,
    handle: JoinHandle<()>,
}

/// Single-slot delayed task runner
#[derive(Default)]
pub struct DeferredScheduler {
    pending: Arc<Mutex<Option<PendingTask>>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl DeferredScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `task` after `delay`, superseding whatever is pending.
    ///
    /// Returns false if the scheduler is closed or no runtime is available.
    pub fn schedule<F>(&self, delay: Duration, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                warn!("No async runtime, dropping deferred task");
                return false;
            }
        };

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let slot = Arc::clone(&self.pending);

        // Held while spawning so the task cannot look at the slot first
        let mut pending = self.pending.lock();
        let handle = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            {
                // Leave the slot before running, the task may schedule again
                let mut current = slot.lock();
                if current.as_ref().map(|p| p.id) != Some(id) {
                    return;
                }
                *current = None;
            }
            task.await;
        });

        if let Some(previous) = pending.replace(PendingTask { id, handle }) {
            debug!("Superseding pending deferred task");
            previous.handle.abort();
        }
        true
    }

    /// Abort the pending task, if any
    pub fn cancel(&self) -> bool {
        match self.pending.lock().take() {
            Some(task) => {
                task.handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending
            .lock()
            .as_ref()
            .map(|p| !p.handle.is_finished())
            .unwrap_or(false)
    }

    /// Cancel and refuse further schedules
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.cancel();
    }
}

/// One manual reconnect attempt and its retries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectContext {
    pub reason: String,
    /// Milliseconds since epoch
    pub started_at: u64,
    pub notified: bool,
    pub retries: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { attempt: u32, delay: Duration },
    /// The bound was hit; retries halt until the next manual trigger
    Exhausted { attempts: u32 },
    /// No reconnect attempt is active
    Idle,
}

pub struct ReconnectSupervisor {
    policy: ReconnectPolicy,
    context: Mutex<Option<ReconnectContext>>,
    scheduler: DeferredScheduler,
    events: Arc<EventBus>,
}

impl ReconnectSupervisor {
    pub fn new(policy: ReconnectPolicy, events: Arc<EventBus>) -> Self {
        Self {
            policy,
            context: Mutex::new(None),
            scheduler: DeferredScheduler::new(),
            events,
        }
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    /// Open a fresh context for a manual trigger, resetting the retry count
    pub fn begin(&self, reason: &str) {
        info!("🔄 Auto-reconnect requested: {}", reason);
        *self.context.lock() = Some(ReconnectContext {
            reason: reason.to_string(),
            started_at: now_ms(),
            notified: false,
            retries: 0,
        });
        self.events.emit(AccessEvent::AutoReconnectAttempt {
            reason: reason.to_string(),
            attempt: 0,
        });
    }

    pub fn active(&self) -> Option<ReconnectContext> {
        self.context.lock().clone()
    }

    /// Close the active context after devices were found. Returns true
    /// exactly once per context.
    pub fn complete_success(&self, devices: usize) -> bool {
        let context = {
            let mut slot = self.context.lock();
            let pending = slot.as_ref().map(|ctx| !ctx.notified).unwrap_or(false);
            if pending {
                slot.take().map(|ctx| ReconnectContext {
                    notified: true,
                    ..ctx
                })
            } else {
                None
            }
        };

        match context {
            Some(ctx) => {
                info!(
                    "✅ Auto-reconnect '{}' succeeded with {} device(s) after {} retries",
                    ctx.reason, devices, ctx.retries
                );
                self.events.emit(AccessEvent::AutoReconnectSuccess {
                    reason: ctx.reason,
                    devices,
                });
                true
            }
            None => false,
        }
    }

    /// Decide what to do after a scan that found nothing
    pub fn next_retry(&self) -> RetryDecision {
        let mut slot = self.context.lock();
        let Some(ctx) = slot.as_mut() else {
            return RetryDecision::Idle;
        };

        if ctx.retries >= self.policy.max_retries {
            let attempts = ctx.retries;
            let reason = ctx.reason.clone();
            *slot = None;
            drop(slot);

            warn!(
                "Auto-reconnect '{}' gave up after {} retries",
                reason, attempts
            );
            self.events
                .emit(AccessEvent::AutoReconnectFailed { reason, attempts });
            return RetryDecision::Exhausted { attempts };
        }

        ctx.retries += 1;
        let attempt = ctx.retries;
        let reason = ctx.reason.clone();
        drop(slot);

        let delay = self.policy.retry_delay(attempt);
        debug!(
            "Auto-reconnect '{}' retry {}/{} in {:?}",
            reason, attempt, self.policy.max_retries, delay
        );
        self.events
            .emit(AccessEvent::AutoReconnectAttempt { reason, attempt });
        RetryDecision::Retry { attempt, delay }
    }

    /// Drop the active context without notifying
    pub fn abandon(&self) {
        if let Some(ctx) = self.context.lock().take() {
            debug!("Auto-reconnect '{}' abandoned", ctx.reason);
        }
    }

    /// Schedule `task` after the settle delay, superseding any pending one
    pub fn schedule_rescan<F>(&self, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.scheduler
            .schedule(self.policy.disconnect_rescan_delay, task)
    }

    /// Schedule `task` after `delay`, superseding any pending one
    pub fn schedule_retry<F>(&self, delay: Duration, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.scheduler.schedule(delay, task)
    }

    pub fn has_pending(&self) -> bool {
        self.scheduler.is_pending()
    }

    /// Cancel pending work and forget the active context
    pub fn shutdown(&self) {
        self.scheduler.close();
        *self.context.lock() = None;
    }
}
