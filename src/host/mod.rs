//! Host MIDI access
//!
//! The access manager never talks to a MIDI backend directly. A granted
//! permission yields a [`MidiHost`] handle, which enumerates [`HostPort`]s and
//! optionally reports hotplug changes. [`midir_host`] binds these traits to
//! the system MIDI stack.

pub mod midir_host;

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::security::DeviceDescriptor;

pub use midir_host::MidirHost;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PortDirection {
    Input,
    Output,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Closed,
    Open,
    /// Tracked, but the host refused to open it; input may still arrive if
    /// the host pre-opened the port
    Pending,
}

/// Identity of a port as reported by the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    pub id: String,
    pub name: String,
    pub manufacturer: String,
    pub direction: PortDirection,
}

impl PortInfo {
    pub fn input(id: impl Into<String>, name: impl Into<String>, manufacturer: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            manufacturer: manufacturer.into(),
            direction: PortDirection::Input,
        }
    }

    pub fn descriptor(&self) -> DeviceDescriptor {
        DeviceDescriptor::new(&self.name, &self.id, &self.manufacturer)
    }
}

/// A tracked port as exposed to callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DevicePort {
    pub id: String,
    pub display_name: String,
    pub manufacturer: String,
    pub direction: PortDirection,
    pub connection_state: ConnectionState,
    /// Milliseconds since epoch
    pub last_seen_at: u64,
}

impl DevicePort {
    pub fn from_info(info: &PortInfo, connection_state: ConnectionState) -> Self {
        Self {
            id: info.id.clone(),
            display_name: info.name.clone(),
            manufacturer: info.manufacturer.clone(),
            direction: info.direction,
            connection_state,
            last_seen_at: now_ms(),
        }
    }
}

pub(crate) fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// Raw input callback: (host timestamp in µs, bytes)
pub type RawCallback = Arc<dyn Fn(u64, &[u8]) + Send + Sync>;

/// A single host port
pub trait HostPort: Send + Sync {
    fn info(&self) -> &PortInfo;

    /// Open the port. Opening an open port is a no-op.
    fn open(&self) -> Result<()>;

    /// Close the port. Closing a closed port is a no-op.
    fn close(&self) -> Result<()>;

    fn is_open(&self) -> bool;

    /// Route incoming bytes to `callback`, replacing any previous callback
    fn attach(&self, callback: RawCallback);

    fn detach(&self);
}

/// Port list change reported by the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HotplugSignal {
    Connected(PortInfo),
    Disconnected(PortInfo),
}

/// Handle to the host MIDI system, obtained through a granted permission
pub trait MidiHost: Send + Sync {
    fn input_ports(&self) -> Result<Vec<Arc<dyn HostPort>>>;

    /// Stream of hotplug signals, if the host can report them
    fn subscribe_hotplug(&self) -> Option<mpsc::UnboundedReceiver<HotplugSignal>>;
}
