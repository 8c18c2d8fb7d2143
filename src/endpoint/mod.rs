//! Virtual MIDI endpoints.
//!
//! The registry publishes named virtual destinations through a
//! [`MidiBackend`], routes inbound packets to a per-endpoint handler and
//! broadcasts outbound messages to every visible destination except the
//! ones this process owns.
//!
//! # Thread Safety
//! Inbound packets arrive on the transport's thread. The packet path only
//! loads the current handler from an [`ArcSwapOption`] and the set of
//! held names from an [`ArcSwap`]. The registry lock is never held while a
//! destination is being published or warmed up.

pub mod loopback;
pub mod system;

use arc_swap::{ArcSwap, ArcSwapOption};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::midi::split_messages;

/// One timestamped message batch as delivered by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Packet<'a> {
    pub timestamp: u64,
    /// One or more raw messages back to back
    pub data: &'a [u8],
}

/// Receives packet lists from a backend destination, on the transport thread.
pub type PacketSink = Arc<dyn Fn(&[Packet<'_>]) + Send + Sync>;

/// Inbound handler, invoked once per message.
pub type PacketHandler = Box<dyn Fn(&[u8]) + Send + Sync>;

/// Transport that can publish virtual destinations and reach visible ones.
pub trait MidiBackend: Send + Sync {
    /// Names of every destination currently visible to this process.
    fn destination_names(&self) -> Result<Vec<String>>;

    /// Publish a virtual destination named `name`.
    fn create_destination(&self, name: &str, sink: PacketSink) -> Result<Box<dyn DestinationPort>>;

    /// Transmit `bytes` to the destination named `destination`.
    fn send_to(&self, destination: &str, bytes: &[u8]) -> Result<()>;

    /// The name a destination was published under, given the name
    /// [`destination_names`](Self::destination_names) reports for it.
    fn published_name<'a>(&self, reported: &'a str) -> &'a str {
        reported
    }
}

/// A published virtual destination.
pub trait DestinationPort: Send {
    fn name(&self) -> &str;

    /// Withdraw the destination. Safe to call more than once.
    fn dispose(&mut self);
}

/// What an endpoint is used for; selects the name suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointRole {
    Playback,
    Recorder,
    Output,
}

impl EndpointRole {
    pub fn suffix(self) -> &'static str {
        match self {
            EndpointRole::Playback => "destination",
            EndpointRole::Recorder => "recorder.destination",
            EndpointRole::Output => "output",
        }
    }
}

/// What `ensure_endpoint` does when this process already owns the name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointPolicy {
    Reuse,
    Recreate,
}

/// Stable per-role endpoint names derived from the application identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointNames {
    pub playback: String,
    pub recorder: String,
    pub output: String,
}

impl EndpointNames {
    pub fn from_identity(identity: &str) -> Self {
        let name = |role: EndpointRole| format!("{}.{}", identity, role.suffix());
        Self {
            playback: name(EndpointRole::Playback),
            recorder: name(EndpointRole::Recorder),
            output: name(EndpointRole::Output),
        }
    }

    pub fn name(&self, role: EndpointRole) -> &str {
        match role {
            EndpointRole::Playback => &self.playback,
            EndpointRole::Recorder => &self.recorder,
            EndpointRole::Output => &self.output,
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.playback == name || self.recorder == name || self.output == name
    }
}

struct EndpointInner {
    name: String,
    /// false when the name was already published by another client
    owned: bool,
    handler: ArcSwapOption<PacketHandler>,
    port: Mutex<Option<Box<dyn DestinationPort>>>,
}

impl EndpointInner {
    fn deliver(&self, packets: &[Packet<'_>]) {
        let guard = self.handler.load();
        let Some(handler) = guard.as_deref() else {
            return;
        };
        for packet in packets {
            for message in split_messages(packet.data) {
                handler(message);
            }
        }
    }

    fn is_active(&self) -> bool {
        self.port
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn dispose(&self) {
        self.handler.store(None);
        let port = self
            .port
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut port) = port {
            port.dispose();
            debug!("Disposed virtual endpoint {}", self.name);
        }
    }
}

impl Drop for EndpointInner {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Handle to a virtual endpoint. Clones refer to the same endpoint.
#[derive(Clone)]
pub struct EndpointHandle {
    inner: Arc<EndpointInner>,
}

impl std::fmt::Debug for EndpointHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointHandle")
            .field("name", &self.inner.name)
            .field("owned", &self.inner.owned)
            .finish()
    }
}

impl EndpointHandle {
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Whether this process published the endpoint (and can receive on it).
    pub fn is_owned(&self) -> bool {
        self.inner.owned
    }

    pub fn is_active(&self) -> bool {
        self.inner.is_active()
    }

    /// Register the inbound handler, replacing any previous one.
    ///
    /// The handler runs on the transport thread, once per message, in
    /// packet order.
    pub fn on_packet_received<F>(&self, handler: F) -> Result<()>
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        if !self.inner.owned {
            return Err(Error::StateViolation(
                "endpoint is published by another client",
            ));
        }
        let handler: PacketHandler = Box::new(handler);
        self.inner.handler.store(Some(Arc::new(handler)));
        Ok(())
    }

    /// Stop delivering inbound packets. Returns once no new callback can
    /// observe the old handler.
    pub fn clear_handler(&self) {
        self.inner.handler.store(None);
    }

    /// Deliver a packet list as if it came from the transport.
    pub fn deliver(&self, packets: &[Packet<'_>]) {
        self.inner.deliver(packets);
    }

    /// Deliver one locally produced message through the inbound path.
    pub fn inject(&self, message: &[u8]) {
        self.inner.deliver(&[Packet {
            timestamp: 0,
            data: message,
        }]);
    }
}

/// Owns this process's virtual endpoints.
pub struct EndpointRegistry {
    backend: Arc<dyn MidiBackend>,
    names: EndpointNames,
    warmup: Duration,
    endpoints: Mutex<HashMap<String, Arc<EndpointInner>>>,
    /// Snapshot of `endpoints`' keys for the packet path
    held: ArcSwap<HashSet<String>>,
}

impl EndpointRegistry {
    pub fn new(backend: Arc<dyn MidiBackend>, names: EndpointNames) -> Self {
        Self {
            backend,
            names,
            warmup: Duration::ZERO,
            endpoints: Mutex::new(HashMap::new()),
            held: ArcSwap::from_pointee(HashSet::new()),
        }
    }

    /// Wait this long after publishing a destination before handing it out.
    pub fn with_warmup(mut self, warmup: Duration) -> Self {
        self.warmup = warmup;
        self
    }

    pub fn names(&self) -> &EndpointNames {
        &self.names
    }

    pub fn backend(&self) -> &Arc<dyn MidiBackend> {
        &self.backend
    }

    /// Ensure the endpoint for `role` exists.
    pub fn ensure_role(&self, role: EndpointRole, policy: EndpointPolicy) -> Result<EndpointHandle> {
        let name = self.names.name(role).to_string();
        self.ensure_endpoint(&name, policy)
    }

    /// Find or create the virtual destination `name`.
    ///
    /// An endpoint this process already owns is returned as-is under
    /// [`EndpointPolicy::Reuse`] and replaced under
    /// [`EndpointPolicy::Recreate`]. A visible destination published by
    /// another client is adopted as a send-only handle rather than
    /// duplicated.
    pub fn ensure_endpoint(&self, name: &str, policy: EndpointPolicy) -> Result<EndpointHandle> {
        let replaced = {
            let mut endpoints = self.lock_endpoints();
            if let Some(existing) = endpoints.get(name) {
                if existing.owned && existing.is_active() && policy == EndpointPolicy::Reuse {
                    debug!("Reusing virtual endpoint {}", name);
                    return Ok(EndpointHandle {
                        inner: Arc::clone(existing),
                    });
                }
            }
            endpoints.remove(name)
        };
        if let Some(existing) = replaced {
            existing.dispose();
        }

        let visible = self.backend.destination_names()?;
        if visible
            .iter()
            .any(|reported| self.backend.published_name(reported) == name)
        {
            warn!(
                "Destination {} is already published by another client; using it send-only",
                name
            );
            let inner = Arc::new(EndpointInner {
                name: name.to_string(),
                owned: false,
                handler: ArcSwapOption::empty(),
                port: Mutex::new(None),
            });
            self.hold(Arc::clone(&inner));
            return Ok(EndpointHandle { inner });
        }

        let inner = Arc::new(EndpointInner {
            name: name.to_string(),
            owned: true,
            handler: ArcSwapOption::empty(),
            port: Mutex::new(None),
        });
        let port = self
            .backend
            .create_destination(name, Self::sink_for(&inner))?;
        *inner.port.lock().unwrap_or_else(PoisonError::into_inner) = Some(port);

        if !self.warmup.is_zero() {
            thread::sleep(self.warmup);
        }

        info!("Created virtual endpoint {}", name);
        self.hold(Arc::clone(&inner));
        Ok(EndpointHandle { inner })
    }

    fn lock_endpoints(&self) -> MutexGuard<'_, HashMap<String, Arc<EndpointInner>>> {
        self.endpoints.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // Callers must hold the endpoints lock so snapshots are stored in order.
    fn publish_held(&self, endpoints: &HashMap<String, Arc<EndpointInner>>) {
        self.held
            .store(Arc::new(endpoints.keys().cloned().collect()));
    }

    fn hold(&self, inner: Arc<EndpointInner>) {
        let previous = {
            let mut endpoints = self.lock_endpoints();
            let previous = endpoints.insert(inner.name.clone(), Arc::clone(&inner));
            self.publish_held(&endpoints);
            previous
        };
        // A concurrent ensure for the same name lost the race
        if let Some(previous) = previous {
            if !Arc::ptr_eq(&previous, &inner) {
                previous.dispose();
            }
        }
    }

    // Weak so the port (held by the endpoint) does not keep its own endpoint alive.
    fn sink_for(inner: &Arc<EndpointInner>) -> PacketSink {
        let weak: Weak<EndpointInner> = Arc::downgrade(inner);
        Arc::new(move |packets: &[Packet<'_>]| {
            if let Some(inner) = weak.upgrade() {
                inner.deliver(packets);
            }
        })
    }

    /// Look up an endpoint this process holds.
    pub fn get(&self, name: &str) -> Option<EndpointHandle> {
        self.lock_endpoints()
            .get(name)
            .map(|inner| EndpointHandle {
                inner: Arc::clone(inner),
            })
    }

    /// Release the endpoint. Idempotent.
    pub fn dispose(&self, handle: &EndpointHandle) {
        let mut endpoints = self.lock_endpoints();
        if let Some(current) = endpoints.get(handle.name()) {
            if Arc::ptr_eq(current, &handle.inner) {
                endpoints.remove(handle.name());
                self.publish_held(&endpoints);
            }
        }
        drop(endpoints);
        handle.inner.dispose();
    }

    /// Whether the destination reported as `name` is one of this
    /// process's own endpoints. Never blocks.
    pub fn is_own(&self, name: &str) -> bool {
        let name = self.backend.published_name(name);
        self.names.contains(name) || self.held.load().contains(name)
    }

    /// Send `bytes` to every visible destination except this process's own.
    ///
    /// Returns how many destinations accepted the message. Per-destination
    /// failures are logged and skipped.
    pub fn send(&self, bytes: &[u8]) -> Result<usize> {
        let mut sent = 0;
        for destination in self.backend.destination_names()? {
            if self.is_own(&destination) {
                continue;
            }
            match self.backend.send_to(&destination, bytes) {
                Ok(()) => sent += 1,
                Err(e) => warn!("Failed to send to {}: {}", destination, e),
            }
        }
        Ok(sent)
    }
}

impl Drop for EndpointRegistry {
    fn drop(&mut self) {
        let endpoints = std::mem::take(&mut *self.lock_endpoints());
        self.held.store(Arc::new(HashSet::new()));
        for inner in endpoints.values() {
            inner.dispose();
        }
    }
}
