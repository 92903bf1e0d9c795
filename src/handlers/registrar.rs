//! Handler contributions made before a registry exists
//!
//! Plugins and application modules may contribute profiles at startup,
//! before the access manager is built. The registrar buffers them and
//! flushes the buffer into the first registry attached; once attached,
//! contributions are forwarded directly.

use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

use super::{HandlerProfile, HandlerRegistry, RegisterOptions, RegisterOutcome};
use crate::error::Result;

#[derive(Default)]
struct RegistrarState {
    pending: Vec<(HandlerProfile, RegisterOptions)>,
    target: Option<Weak<HandlerRegistry>>,
}

/// Shared entry point for handler contributions
#[derive(Default)]
pub struct HandlerRegistrar {
    state: Mutex<RegistrarState>,
}

impl HandlerRegistrar {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register now if a registry is attached, otherwise queue.
    ///
    /// Returns `None` when the profile was queued.
    pub fn contribute(
        &self,
        profile: HandlerProfile,
        options: RegisterOptions,
    ) -> Result<Option<RegisterOutcome>> {
        let mut state = self.state.lock();
        let target = state.target.as_ref().and_then(Weak::upgrade);
        match target {
            Some(registry) => {
                drop(state);
                registry.register(profile, options).map(Some)
            }
            None => {
                debug!("Queueing handler profile '{}' until a registry attaches", profile.id());
                state.pending.push((profile, options));
                Ok(None)
            }
        }
    }

    /// Attach `registry` and flush the queue into it.
    ///
    /// Only the first live registry is attached; later calls are ignored
    /// and return 0. Profiles the registry rejects are logged and dropped.
    pub fn attach(&self, registry: &Arc<HandlerRegistry>) -> usize {
        let pending = {
            let mut state = self.state.lock();
            if let Some(existing) = state.target.as_ref().and_then(Weak::upgrade) {
                if !Arc::ptr_eq(&existing, registry) {
                    warn!("Handler registrar already attached, ignoring second registry");
                }
                return 0;
            }
            state.target = Some(Arc::downgrade(registry));
            std::mem::take(&mut state.pending)
        };

        let mut flushed = 0;
        for (profile, options) in pending {
            let id = profile.id().to_string();
            match registry.register(profile, options) {
                Ok(_) => flushed += 1,
                Err(e) => warn!("Queued handler profile '{}' rejected: {}", id, e),
            }
        }
        if flushed > 0 {
            debug!("Flushed {} queued handler profiles", flushed);
        }
        flushed
    }

    pub fn pending_len(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn is_attached(&self) -> bool {
        self.state
            .lock()
            .target
            .as_ref()
            .and_then(Weak::upgrade)
            .is_some()
    }
}
