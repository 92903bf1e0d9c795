//! MIDI Gatekeeper
//!
//! Negotiates access to the host MIDI system, admits only allow-listed
//! input devices, attaches a handler to each one and keeps the set of
//! connected devices current across hotplug and resume.

pub mod config;
pub mod error;
pub mod events;
pub mod handlers;
pub mod host;
pub mod manager;
pub mod midi;
pub mod permission;
pub mod reconnect;
pub mod registry;
pub mod security;
pub mod services;

#[cfg(test)]
mod testing;

pub use config::{AppConfig, ConfigWatcher};
pub use error::{AccessError, Error, Result};
pub use events::{AccessEvent, ListenerId, NoopObserver, Observer};
pub use handlers::{
    DeviceHandler, DeviceMatcher, HandlerContext, HandlerProfile, HandlerRegistrar,
    HandlerSettings, RegisterOptions, RegisterOutcome,
};
pub use host::{ConnectionState, DevicePort, PortDirection};
pub use manager::{AccessStats, MidiAccess, MidiAccessBuilder};
pub use midi::{Message, MessageData, MessageKind};
pub use permission::{AccessOptions, PermissionState};
pub use registry::ScanReport;
pub use security::{FingerprintRules, SecurityFilter, Verdict};
pub use services::{
    ConnectivitySnapshot, InstrumentPlaybackService, JsonFilePersistence, MemoryPersistence,
    NotificationLevel, NotificationSink, PersistenceService,
};
