//! In-process MIDI bus.
//!
//! Destinations published here are visible only inside this process.
//! Sends are delivered synchronously on the caller's thread, which makes
//! endpoint, playback and recording behavior reproducible without
//! hardware or OS MIDI services.
//!
//! [`LoopbackBackend::with_alsa_names`] makes the bus report names the way
//! the ALSA sequencer does, so name matching can be exercised too.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use super::system::base_port_name;
use super::{DestinationPort, MidiBackend, Packet, PacketSink};
use crate::error::{Error, Result};

struct BusDestination {
    id: u64,
    name: String,
    sink: PacketSink,
}

#[derive(Default)]
struct Bus {
    destinations: Mutex<Vec<BusDestination>>,
    next_id: AtomicU64,
}

impl Bus {
    fn publish(&self, name: &str, sink: PacketSink) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.destinations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(BusDestination {
                id,
                name: name.to_string(),
                sink,
            });
        id
    }

    fn withdraw(&self, id: u64) {
        self.destinations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|d| d.id != id);
    }

    fn sink(&self, name: &str) -> Option<PacketSink> {
        self.destinations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|d| d.name == name)
            .map(|d| Arc::clone(&d.sink))
    }
}

/// Process-local [`MidiBackend`].
#[derive(Default)]
pub struct LoopbackBackend {
    bus: Arc<Bus>,
    fail_creation: AtomicBool,
    /// Client name reported in front of every port, ALSA style
    alsa_client: Option<String>,
}

impl LoopbackBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report destinations as `"{client}:{name} 128:{n}"`.
    pub fn with_alsa_names(client: impl Into<String>) -> Self {
        Self {
            alsa_client: Some(client.into()),
            ..Self::default()
        }
    }

    /// Make subsequent `create_destination` calls fail.
    pub fn fail_creation(&self, fail: bool) {
        self.fail_creation.store(fail, Ordering::SeqCst);
    }

    /// Publish a destination owned by "someone else" that records what it receives.
    pub fn add_external_destination(&self, name: &str) -> ExternalDestination {
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink_buffer = Arc::clone(&received);
        let sink: PacketSink = Arc::new(move |packets: &[Packet<'_>]| {
            let mut buffer = sink_buffer.lock().unwrap_or_else(PoisonError::into_inner);
            for packet in packets {
                buffer.push(packet.data.to_vec());
            }
        });
        let id = self.bus.publish(name, sink);
        ExternalDestination {
            id,
            bus: Arc::clone(&self.bus),
            received,
        }
    }

    /// Number of visible destinations called `name`.
    pub fn destination_count(&self, name: &str) -> usize {
        self.bus
            .destinations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|d| d.name == name)
            .count()
    }

    /// Deliver a packet list to `name` as an external sender would.
    /// Returns false if no such destination is visible.
    pub fn deliver(&self, name: &str, packets: &[Packet<'_>]) -> bool {
        match self.bus.sink(name) {
            Some(sink) => {
                sink(packets);
                true
            }
            None => false,
        }
    }
}

impl MidiBackend for LoopbackBackend {
    fn destination_names(&self) -> Result<Vec<String>> {
        let destinations = self
            .bus
            .destinations
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Ok(destinations
            .iter()
            .enumerate()
            .map(|(port, d)| match &self.alsa_client {
                Some(client) => format!("{}:{} 128:{}", client, d.name, port),
                None => d.name.clone(),
            })
            .collect())
    }

    fn published_name<'a>(&self, reported: &'a str) -> &'a str {
        match self.alsa_client {
            Some(_) => base_port_name(reported),
            None => reported,
        }
    }

    fn create_destination(&self, name: &str, sink: PacketSink) -> Result<Box<dyn DestinationPort>> {
        if self.fail_creation.load(Ordering::SeqCst) {
            return Err(Error::ResourceCreation(format!(
                "loopback refused to publish {}",
                name
            )));
        }
        let id = self.bus.publish(name, sink);
        Ok(Box::new(LoopbackPort {
            id: Some(id),
            name: name.to_string(),
            bus: Arc::clone(&self.bus),
        }))
    }

    fn send_to(&self, destination: &str, bytes: &[u8]) -> Result<()> {
        // Deliver outside the bus lock; the sink may publish or send in turn.
        let sink = self
            .bus
            .sink(self.published_name(destination))
            .ok_or_else(|| Error::Send(format!("no destination named {}", destination)))?;
        sink(&[Packet {
            timestamp: 0,
            data: bytes,
        }]);
        Ok(())
    }
}

struct LoopbackPort {
    id: Option<u64>,
    name: String,
    bus: Arc<Bus>,
}

impl DestinationPort for LoopbackPort {
    fn name(&self) -> &str {
        &self.name
    }

    fn dispose(&mut self) {
        if let Some(id) = self.id.take() {
            self.bus.withdraw(id);
        }
    }
}

impl Drop for LoopbackPort {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// A destination published on the bus on behalf of another client.
pub struct ExternalDestination {
    id: u64,
    bus: Arc<Bus>,
    received: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl ExternalDestination {
    /// Messages received so far, one entry per packet.
    pub fn messages(&self) -> Vec<Vec<u8>> {
        self.received
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Drop for ExternalDestination {
    fn drop(&mut self) {
        self.bus.withdraw(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_external_destination_receives_sends() {
        let backend = LoopbackBackend::new();
        let synth = backend.add_external_destination("synth");
        backend.send_to("synth", &[0xB0, 64, 127]).unwrap();
        assert_eq!(synth.messages(), vec![vec![0xB0, 64, 127]]);
    }

    #[test]
    fn test_send_to_missing_destination_fails() {
        let backend = LoopbackBackend::new();
        assert!(matches!(
            backend.send_to("nowhere", &[0x90, 60, 1]),
            Err(Error::Send(_))
        ));
    }

    #[test]
    fn test_dropping_external_destination_withdraws_it() {
        let backend = LoopbackBackend::new();
        let synth = backend.add_external_destination("synth");
        assert_eq!(backend.destination_names().unwrap(), vec!["synth".to_string()]);
        drop(synth);
        assert!(backend.destination_names().unwrap().is_empty());
    }

    #[test]
    fn test_alsa_names_decorate_and_resolve() {
        let backend = LoopbackBackend::with_alsa_names("app");
        let synth = backend.add_external_destination("synth");
        let names = backend.destination_names().unwrap();
        assert_eq!(names, vec!["app:synth 128:0".to_string()]);
        assert_eq!(backend.published_name(&names[0]), "synth");

        backend.send_to(&names[0], &[0x90, 60, 100]).unwrap();
        assert_eq!(synth.messages(), vec![vec![0x90, 60, 100]]);
    }
}
