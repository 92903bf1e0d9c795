//! midir binding for [`MidiHost`] and [`HostPort`]
//!
//! midir couples opening a port with installing its input callback. The
//! connection callback therefore forwards into a swappable slot, which lets
//! the registry attach and detach its decoder independently of the port's
//! open/closed state.

use midir::{Ignore, MidiInput, MidiInputConnection, MidiInputPort};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use super::{HostPort, HotplugSignal, MidiHost, PortInfo, RawCallback};
use crate::error::{Error, Result};

/// System MIDI host backed by midir
pub struct MidirHost {
    client_name: String,
    poll_interval: Duration,
}

impl MidirHost {
    pub fn new(client_name: impl Into<String>, poll_interval: Duration) -> Self {
        Self {
            client_name: client_name.into(),
            poll_interval,
        }
    }

    /// Enumerate input ports as (info, midir port) pairs
    fn enumerate(client_name: &str) -> Result<Vec<(PortInfo, MidiInputPort)>> {
        let midi_in = MidiInput::new(&format!("{}-scanner", client_name))?;

        let mut ports = Vec::new();
        for port in midi_in.ports() {
            match midi_in.port_name(&port) {
                Ok(name) => {
                    // midir does not expose a manufacturer
                    ports.push((PortInfo::input(port.id(), name, ""), port));
                }
                Err(e) => debug!("Skipping port without a name: {}", e),
            }
        }

        Ok(ports)
    }
}

impl MidiHost for MidirHost {
    fn input_ports(&self) -> Result<Vec<Arc<dyn HostPort>>> {
        let ports = Self::enumerate(&self.client_name)?;
        debug!("Found {} MIDI input ports", ports.len());

        Ok(ports
            .into_iter()
            .map(|(info, port)| {
                Arc::new(MidirPort::new(info, port, self.client_name.clone())) as Arc<dyn HostPort>
            })
            .collect())
    }

    fn subscribe_hotplug(&self) -> Option<mpsc::UnboundedReceiver<HotplugSignal>> {
        let runtime = tokio::runtime::Handle::try_current().ok()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let client_name = self.client_name.clone();
        let poll_interval = self.poll_interval;

        runtime.spawn(async move {
            let mut known: HashMap<String, PortInfo> = Self::enumerate(&client_name)
                .map(|ports| ports.into_iter().map(|(i, _)| (i.id.clone(), i)).collect())
                .unwrap_or_default();
            let mut ticker = tokio::time::interval(poll_interval);

            loop {
                ticker.tick().await;
                if tx.is_closed() {
                    debug!("Hotplug watcher stopped");
                    return;
                }

                let current: HashMap<String, PortInfo> = match Self::enumerate(&client_name) {
                    Ok(ports) => ports.into_iter().map(|(i, _)| (i.id.clone(), i)).collect(),
                    Err(e) => {
                        warn!("Hotplug poll failed: {}", e);
                        continue;
                    }
                };

                for (id, info) in &known {
                    if !current.contains_key(id) && tx.send(HotplugSignal::Disconnected(info.clone())).is_err() {
                        return;
                    }
                }
                for (id, info) in &current {
                    if !known.contains_key(id) && tx.send(HotplugSignal::Connected(info.clone())).is_err() {
                        return;
                    }
                }
                known = current;
            }
        });

        Some(rx)
    }
}

/// One midir input port
pub struct MidirPort {
    info: PortInfo,
    port: MidiInputPort,
    client_name: String,
    connection: Mutex<Option<MidiInputConnection<()>>>,
    callback: Arc<RwLock<Option<RawCallback>>>,
}

impl MidirPort {
    fn new(info: PortInfo, port: MidiInputPort, client_name: String) -> Self {
        Self {
            info,
            port,
            client_name,
            connection: Mutex::new(None),
            callback: Arc::new(RwLock::new(None)),
        }
    }
}

impl HostPort for MidirPort {
    fn info(&self) -> &PortInfo {
        &self.info
    }

    fn open(&self) -> Result<()> {
        let mut connection = self.connection.lock();
        if connection.is_some() {
            return Ok(());
        }

        let mut midi_in = MidiInput::new(&format!("{}-in", self.client_name))?;
        // Deliver everything, system messages included
        midi_in.ignore(Ignore::None);

        let slot = self.callback.clone();
        let port_name = self.info.name.clone();
        let conn = midi_in
            .connect(
                &self.port,
                &format!("{}-{}", self.client_name, self.info.id),
                move |timestamp, data, _| {
                    trace!("RX <- '{}' {} bytes", port_name, data.len());
                    if let Some(callback) = slot.read().as_ref() {
                        callback(timestamp, data);
                    }
                },
                (),
            )
            .map_err(|e| Error::Port(format!("failed to open '{}': {}", self.info.name, e)))?;

        *connection = Some(conn);
        debug!("MIDI IN opened: '{}'", self.info.name);
        Ok(())
    }

    fn close(&self) -> Result<()> {
        if let Some(conn) = self.connection.lock().take() {
            conn.close();
            debug!("MIDI IN closed: '{}'", self.info.name);
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.connection.lock().is_some()
    }

    fn attach(&self, callback: RawCallback) {
        *self.callback.write() = Some(callback);
    }

    fn detach(&self) {
        *self.callback.write() = None;
    }
}
