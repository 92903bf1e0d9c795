//! Host permission providers

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::AccessOptions;
use crate::error::AccessError;
use crate::host::{MidiHost, MidirHost};

/// Permission as reported by the host, without prompting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostPermission {
    Granted,
    Denied,
    /// The host would ask the user
    Prompt,
}

/// Host capability that grants access to MIDI hardware
#[async_trait]
pub trait PermissionProvider: Send + Sync {
    /// Whether the host offers MIDI access at all
    fn is_supported(&self) -> bool;

    /// Trust precondition of the host environment
    fn check_environment(&self) -> Result<(), AccessError> {
        Ok(())
    }

    /// Cheap state query, never prompts
    async fn query(&self) -> HostPermission;

    /// Ask for access; may prompt the user and take arbitrarily long
    async fn request(&self, options: &AccessOptions) -> Result<Arc<dyn MidiHost>, AccessError>;
}

/// Desktop MIDI through midir. There is no user prompt on desktop hosts:
/// access is granted when the MIDI client can be created.
pub struct MidirPermission {
    client_name: String,
    hotplug_poll: Duration,
}

impl MidirPermission {
    pub fn new(client_name: impl Into<String>, hotplug_poll: Duration) -> Self {
        Self {
            client_name: client_name.into(),
            hotplug_poll,
        }
    }

    fn probe(&self) -> Result<(), AccessError> {
        midir::MidiInput::new(&format!("{}-probe", self.client_name))
            .map(|_| ())
            .map_err(|e| AccessError::Unsupported(e.to_string()))
    }
}

#[async_trait]
impl PermissionProvider for MidirPermission {
    fn is_supported(&self) -> bool {
        true
    }

    async fn query(&self) -> HostPermission {
        match self.probe() {
            Ok(()) => HostPermission::Granted,
            Err(_) => HostPermission::Prompt,
        }
    }

    async fn request(&self, options: &AccessOptions) -> Result<Arc<dyn MidiHost>, AccessError> {
        self.probe()?;
        debug!(
            "MIDI access granted to '{}' (sysex requested: {})",
            self.client_name, options.sysex
        );
        Ok(Arc::new(MidirHost::new(
            self.client_name.clone(),
            self.hotplug_poll,
        )))
    }
}
