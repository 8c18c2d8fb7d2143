//! OS MIDI services through midir.
//!
//! Virtual destinations are midir virtual inputs, which only exist on
//! platforms with a virtual port API (ALSA, CoreMIDI, JACK). Output
//! connections are opened lazily per destination and cached.
//!
//! ALSA reports port names as `client:port c:p` and JACK as `client:port`;
//! [`base_port_name`] recovers the name a port was published under.

use midir::{Ignore, MidiInput, MidiInputConnection, MidiOutput, MidiOutputConnection};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use tracing::debug;

use super::{DestinationPort, MidiBackend, Packet, PacketSink};
use crate::error::{Error, Result};

/// [`MidiBackend`] backed by the system MIDI services.
pub struct MidirBackend {
    client_name: String,
    /// Client used only to enumerate ports, created on first use
    lister: Mutex<Option<MidiOutput>>,
    connections: Mutex<HashMap<String, MidiOutputConnection>>,
}

impl MidirBackend {
    pub fn new(client_name: impl Into<String>) -> Self {
        Self {
            client_name: client_name.into(),
            lister: Mutex::new(None),
            connections: Mutex::new(HashMap::new()),
        }
    }

    fn connect(&self, destination: &str) -> Result<MidiOutputConnection> {
        let midi_out = MidiOutput::new(&self.client_name)?;
        let port = midi_out
            .ports()
            .into_iter()
            .find(|p| {
                midi_out
                    .port_name(p)
                    .map(|n| n == destination)
                    .unwrap_or(false)
            })
            .ok_or_else(|| Error::Send(format!("destination {} is not visible", destination)))?;

        let connection = midi_out.connect(&port, &format!("{}-out", self.client_name))?;
        debug!("Connected MIDI output to {}", destination);
        Ok(connection)
    }
}

impl MidiBackend for MidirBackend {
    fn destination_names(&self) -> Result<Vec<String>> {
        let mut lister = self.lister.lock().unwrap_or_else(PoisonError::into_inner);
        let midi_out = match lister.take() {
            Some(midi_out) => midi_out,
            None => MidiOutput::new(&self.client_name)?,
        };
        let names = midi_out
            .ports()
            .iter()
            .filter_map(|p| midi_out.port_name(p).ok())
            .collect();
        *lister = Some(midi_out);
        Ok(names)
    }

    fn published_name<'a>(&self, reported: &'a str) -> &'a str {
        base_port_name(reported)
    }

    #[cfg(unix)]
    fn create_destination(&self, name: &str, sink: PacketSink) -> Result<Box<dyn DestinationPort>> {
        use midir::os::unix::VirtualInput;

        let mut midi_in = MidiInput::new(&self.client_name)?;
        midi_in.ignore(Ignore::None);

        let connection = midi_in.create_virtual(
            name,
            move |timestamp, message, _| {
                sink(&[Packet {
                    timestamp,
                    data: message,
                }]);
            },
            (),
        )?;

        Ok(Box::new(MidirDestination {
            name: name.to_string(),
            connection: Some(connection),
        }))
    }

    #[cfg(not(unix))]
    fn create_destination(&self, name: &str, _sink: PacketSink) -> Result<Box<dyn DestinationPort>> {
        Err(Error::ResourceCreation(format!(
            "virtual destination {} is not supported on this platform",
            name
        )))
    }

    fn send_to(&self, destination: &str, bytes: &[u8]) -> Result<()> {
        let connected = self
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(destination);
        // Connect outside the lock; it opens a new OS client.
        let fresh = if connected {
            None
        } else {
            Some(self.connect(destination)?)
        };

        let mut connections = self
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(connection) = fresh {
            connections.entry(destination.to_string()).or_insert(connection);
        }

        let Some(connection) = connections.get_mut(destination) else {
            return Err(Error::Send(format!("no connection to {}", destination)));
        };
        if let Err(e) = connection.send(bytes) {
            // Drop the stale connection so the next send reconnects.
            connections.remove(destination);
            return Err(Error::Send(e.to_string()));
        }
        Ok(())
    }
}

/// Strip transport decoration from a reported port name.
///
/// `"app:com.example.app.destination 128:0"` becomes
/// `"com.example.app.destination"`. Names without decoration pass through.
pub fn base_port_name(reported: &str) -> &str {
    let name = match reported.rsplit_once(' ') {
        Some((head, address)) if is_port_address(address) => head,
        _ => reported,
    };
    match name.split_once(':') {
        Some((_client, port)) if !port.is_empty() => port,
        _ => name,
    }
}

// `client:port` with both parts numeric
fn is_port_address(text: &str) -> bool {
    let numeric = |part: &str| !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit());
    text.split_once(':')
        .is_some_and(|(client, port)| numeric(client) && numeric(port))
}

struct MidirDestination {
    name: String,
    connection: Option<MidiInputConnection<()>>,
}

impl DestinationPort for MidirDestination {
    fn name(&self) -> &str {
        &self.name
    }

    fn dispose(&mut self) {
        if let Some(connection) = self.connection.take() {
            let _ = connection.close();
        }
    }
}

impl Drop for MidirDestination {
    fn drop(&mut self) {
        self.dispose();
    }
}
