//! Listener notification dispatch.
//!
//! Decoded events are produced on the MIDI packet thread. They are pushed
//! onto an unbounded FIFO (never blocks the producer) and delivered to
//! subscribers on the consumer side, either by polling [`Dispatcher::drain`]
//! from an application loop or by running [`Dispatcher::run`] as a task.
//!
//! Subscribers are held weakly: dropping a listener silently discards
//! anything still queued for it.

use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info};

/// Receives note and sequence notifications.
///
/// Every method has a log-only default; implement the ones you need.
/// Channels are the wire channel (0-15).
pub trait MidiListener: Send + Sync {
    fn on_note_on(&self, note: u8, velocity: u8, channel: u8) {
        info!("Note on. Channel {} note {} velocity {}", channel, note, velocity);
    }

    fn on_note_off(&self, note: u8, channel: u8) {
        info!("Note off. Channel {} note {}", channel, note);
    }

    fn on_sequence_finished(&self) {
        info!("MIDI sequence did finish.");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notification {
    NoteOn { note: u8, velocity: u8, channel: u8 },
    NoteOff { note: u8, channel: u8 },
    SequenceFinished,
}

/// Ordered set of weakly held subscribers. Clones share the same set.
#[derive(Clone, Default)]
pub struct ListenerRegistry {
    listeners: Arc<Mutex<Vec<Weak<dyn MidiListener>>>>,
}

fn same_listener(a: &Weak<dyn MidiListener>, b: &Weak<dyn MidiListener>) -> bool {
    a.as_ptr() as *const () == b.as_ptr() as *const ()
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a listener at the end. Subscribing the same listener twice is a no-op.
    pub fn subscribe<L: MidiListener + 'static>(&self, listener: &Arc<L>) {
        let listener: Arc<dyn MidiListener> = listener.clone();
        let weak = Arc::downgrade(&listener);
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        if !listeners.iter().any(|l| same_listener(l, &weak)) {
            listeners.push(weak);
        }
    }

    pub fn unsubscribe<L: MidiListener + 'static>(&self, listener: &Arc<L>) {
        let listener: Arc<dyn MidiListener> = listener.clone();
        let weak = Arc::downgrade(&listener);
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|l| !same_listener(l, &weak));
    }

    /// Live listeners in subscription order. Dead entries are pruned.
    pub fn snapshot(&self) -> Vec<Arc<dyn MidiListener>> {
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        listeners.retain(|l| l.strong_count() > 0);
        listeners.iter().filter_map(Weak::upgrade).collect()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Producer side. Cheap to clone, never blocks.
#[derive(Clone)]
pub struct DispatchSender {
    tx: UnboundedSender<Notification>,
}

impl DispatchSender {
    /// Queue a notification. Returns false once the dispatcher is gone.
    pub fn send(&self, notification: Notification) -> bool {
        if self.tx.send(notification).is_err() {
            debug!("Dispatcher closed; dropped {:?}", notification);
            return false;
        }
        true
    }

    pub fn note_on(&self, note: u8, velocity: u8, channel: u8) -> bool {
        self.send(Notification::NoteOn {
            note,
            velocity,
            channel,
        })
    }

    pub fn note_off(&self, note: u8, channel: u8) -> bool {
        self.send(Notification::NoteOff { note, channel })
    }

    pub fn sequence_finished(&self) -> bool {
        self.send(Notification::SequenceFinished)
    }
}

/// Consumer side: delivers queued notifications in arrival order.
pub struct Dispatcher {
    rx: UnboundedReceiver<Notification>,
    listeners: ListenerRegistry,
}

/// Create a connected sender/dispatcher pair delivering to `listeners`.
pub fn channel(listeners: ListenerRegistry) -> (DispatchSender, Dispatcher) {
    let (tx, rx) = mpsc::unbounded_channel();
    (DispatchSender { tx }, Dispatcher { rx, listeners })
}

impl Dispatcher {
    pub fn listeners(&self) -> &ListenerRegistry {
        &self.listeners
    }

    fn deliver(&self, notification: Notification) {
        for listener in self.listeners.snapshot() {
            match notification {
                Notification::NoteOn {
                    note,
                    velocity,
                    channel,
                } => listener.on_note_on(note, velocity, channel),
                Notification::NoteOff { note, channel } => listener.on_note_off(note, channel),
                Notification::SequenceFinished => listener.on_sequence_finished(),
            }
        }
    }

    /// Deliver everything queued so far. Returns the number of notifications.
    pub fn drain(&mut self) -> usize {
        let mut count = 0;
        while let Ok(notification) = self.rx.try_recv() {
            self.deliver(notification);
            count += 1;
        }
        count
    }

    /// Deliver until every sender has been dropped.
    pub async fn run(mut self) {
        while let Some(notification) = self.rx.recv().await {
            self.deliver(notification);
        }
        debug!("Dispatcher stopped: all senders dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recording {
        seen: Mutex<Vec<Notification>>,
    }

    impl MidiListener for Recording {
        fn on_note_on(&self, note: u8, velocity: u8, channel: u8) {
            self.seen.lock().unwrap().push(Notification::NoteOn {
                note,
                velocity,
                channel,
            });
        }

        fn on_note_off(&self, note: u8, channel: u8) {
            self.seen
                .lock()
                .unwrap()
                .push(Notification::NoteOff { note, channel });
        }

        fn on_sequence_finished(&self) {
            self.seen.lock().unwrap().push(Notification::SequenceFinished);
        }
    }

    struct Silent;

    impl MidiListener for Silent {}

    #[test]
    fn test_delivery_preserves_order() {
        let listeners = ListenerRegistry::new();
        let listener = Arc::new(Recording::default());
        listeners.subscribe(&listener);

        let (sender, mut dispatcher) = channel(listeners);
        sender.note_on(60, 100, 0);
        sender.note_off(60, 0);
        sender.sequence_finished();

        assert_eq!(dispatcher.drain(), 3);
        assert_eq!(
            *listener.seen.lock().unwrap(),
            vec![
                Notification::NoteOn {
                    note: 60,
                    velocity: 100,
                    channel: 0
                },
                Notification::NoteOff { note: 60, channel: 0 },
                Notification::SequenceFinished,
            ]
        );
    }

    #[test]
    fn test_dropped_listener_skipped() {
        let listeners = ListenerRegistry::new();
        let kept = Arc::new(Recording::default());
        let dropped = Arc::new(Recording::default());
        listeners.subscribe(&dropped);
        listeners.subscribe(&kept);

        let (sender, mut dispatcher) = channel(listeners.clone());
        sender.note_on(61, 90, 2);
        drop(dropped);

        assert_eq!(dispatcher.drain(), 1);
        assert_eq!(kept.seen.lock().unwrap().len(), 1);
        assert_eq!(listeners.len(), 1);
    }

    #[test]
    fn test_subscribe_twice_and_unsubscribe() {
        let listeners = ListenerRegistry::new();
        let listener = Arc::new(Recording::default());
        listeners.subscribe(&listener);
        listeners.subscribe(&listener);
        assert_eq!(listeners.len(), 1);

        listeners.unsubscribe(&listener);
        assert!(listeners.is_empty());
    }

    #[test]
    fn test_default_methods_do_not_panic() {
        let listeners = ListenerRegistry::new();
        let listener = Arc::new(Silent);
        listeners.subscribe(&listener);

        let (sender, mut dispatcher) = channel(listeners);
        sender.note_on(60, 100, 0);
        sender.note_off(60, 0);
        sender.sequence_finished();
        assert_eq!(dispatcher.drain(), 3);
    }

    #[test]
    fn test_send_after_dispatcher_dropped() {
        let (sender, dispatcher) = channel(ListenerRegistry::new());
        drop(dispatcher);
        assert!(!sender.sequence_finished());
    }

    #[tokio::test]
    async fn test_run_delivers_until_senders_dropped() {
        let listeners = ListenerRegistry::new();
        let listener = Arc::new(Recording::default());
        listeners.subscribe(&listener);

        let (sender, dispatcher) = channel(listeners);
        let task = tokio::spawn(dispatcher.run());

        let producer = std::thread::spawn(move || {
            for note in 0..10 {
                sender.note_on(note, 100, 0);
            }
        });
        producer.join().unwrap();
        task.await.unwrap();

        let seen = listener.seen.lock().unwrap();
        let notes: Vec<u8> = seen
            .iter()
            .map(|n| match n {
                Notification::NoteOn { note, .. } => *note,
                _ => 255,
            })
            .collect();
        assert_eq!(notes, (0..10).collect::<Vec<u8>>());
    }
}
