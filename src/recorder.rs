//! MIDI performance recorder.
//!
//! While a session is open, note on/off pairs arriving at the recorder
//! endpoint are timed against a [`Clock`] and turned into notes. The packet
//! callback only touches a fixed-size table and pushes finished notes onto
//! an unbounded queue; the application side moves them into the sequence
//! ([`Recorder::pump`]) and writes the file on [`Recorder::save`].

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::SequencerConfig;
use crate::endpoint::{EndpointHandle, EndpointPolicy, EndpointRegistry, EndpointRole};
use crate::error::Result;
use crate::midi::MidiEvent;
use crate::sequence::{NoteMessage, Sequence};
use crate::smf::SequenceStore;

/// A finished note, timed in beats from the start of the session.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RecordedNote {
    pub position: f64,
    pub note: NoteMessage,
}

#[derive(Debug, Clone, Copy)]
struct NoteStart {
    time: f64,
    velocity: u8,
    channel: u8,
}

struct CaptureState {
    /// Session start in clock seconds; `None` when not recording
    start_time: Option<f64>,
    note_starts: [Option<NoteStart>; 128],
    bpm: f64,
}

/// State shared with the packet callback.
struct Capture {
    state: Mutex<CaptureState>,
    clock: Arc<dyn Clock>,
    notes: UnboundedSender<RecordedNote>,
    velocity_zero_as_note_off: AtomicBool,
}

impl Capture {
    fn lock(&self) -> std::sync::MutexGuard<'_, CaptureState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn note_on(&self, note: u8, velocity: u8, channel: u8) {
        let now = self.clock.now();
        let mut state = self.lock();
        if state.start_time.is_none() {
            return;
        }
        // A retrigger replaces the earlier press
        state.note_starts[usize::from(note & 0x7F)] = Some(NoteStart {
            time: now,
            velocity,
            channel,
        });
    }

    fn note_off(&self, note: u8, release_velocity: u8) {
        let now = self.clock.now();
        let mut state = self.lock();
        let Some(start_time) = state.start_time else {
            return;
        };
        let Some(start) = state.note_starts[usize::from(note & 0x7F)].take() else {
            debug!("Dropping note off without note on: {}", note);
            return;
        };

        let duration = now - start.time;
        let position = now - start_time - duration;
        let beats_per_second = state.bpm / 60.0;
        let recorded = RecordedNote {
            position: (position * beats_per_second).max(0.0),
            note: NoteMessage {
                channel: start.channel,
                note: note & 0x7F,
                velocity: start.velocity,
                release_velocity,
                duration: duration.max(0.0) * beats_per_second,
            },
        };
        if self.notes.send(recorded).is_err() {
            warn!("Recorder queue closed; note {} lost", note);
        }
    }

    fn handle(&self, message: &[u8]) {
        let Some(event) = MidiEvent::from_bytes(message) else {
            return;
        };
        match event {
            MidiEvent::NoteOn {
                note,
                velocity: 0,
                ..
            } if self.velocity_zero_as_note_off.load(Ordering::Relaxed) => self.note_off(note, 0),
            MidiEvent::NoteOn {
                channel,
                note,
                velocity,
            } => self.note_on(note, velocity, channel),
            MidiEvent::NoteOff { note, velocity, .. } => self.note_off(note, velocity),
            other => debug!("Not recording {:?}", other),
        }
    }
}

pub struct Recorder {
    registry: Arc<EndpointRegistry>,
    store: Arc<dyn SequenceStore>,
    policy: EndpointPolicy,
    bpm: f64,
    capture: Arc<Capture>,
    notes: UnboundedReceiver<RecordedNote>,
    sequence: Option<Sequence>,
    track: usize,
    endpoint: Option<EndpointHandle>,
}

impl Recorder {
    pub fn new(
        registry: Arc<EndpointRegistry>,
        store: Arc<dyn SequenceStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let bpm = 60.0;
        Self {
            registry,
            store,
            policy: EndpointPolicy::Recreate,
            bpm,
            capture: Arc::new(Capture {
                state: Mutex::new(CaptureState {
                    start_time: None,
                    note_starts: [None; 128],
                    bpm,
                }),
                clock,
                notes: tx,
                velocity_zero_as_note_off: AtomicBool::new(false),
            }),
            notes: rx,
            sequence: None,
            track: 0,
            endpoint: None,
        }
    }

    pub fn from_config(
        config: &SequencerConfig,
        registry: Arc<EndpointRegistry>,
        store: Arc<dyn SequenceStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let mut recorder =
            Self::new(registry, store, clock).with_policy(config.endpoint_policy.recorder);
        recorder.set_bpm(config.recorder_bpm);
        recorder
    }

    /// How the recorder endpoint is obtained on each `begin`.
    pub fn with_policy(mut self, policy: EndpointPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn bpm(&self) -> f64 {
        self.bpm
    }

    /// Tempo for the next session.
    pub fn set_bpm(&mut self, bpm: f64) {
        if bpm > 0.0 {
            self.bpm = bpm;
        } else {
            warn!("Ignoring non-positive recorder tempo {}", bpm);
        }
    }

    /// Treat NoteOn with velocity 0 as NoteOff while recording.
    pub fn set_velocity_zero_as_note_off(&self, enabled: bool) {
        self.capture
            .velocity_zero_as_note_off
            .store(enabled, Ordering::Relaxed);
    }

    pub fn is_recording(&self) -> bool {
        self.capture.lock().start_time.is_some()
    }

    /// The sequence under construction, up to the last [`pump`](Self::pump).
    pub fn sequence(&self) -> Option<&Sequence> {
        self.sequence.as_ref()
    }

    pub fn endpoint(&self) -> Option<&EndpointHandle> {
        self.endpoint.as_ref()
    }

    /// Open a new session. A session already open is discarded.
    pub fn begin(&mut self) {
        if self.is_recording() {
            debug!("Discarding open recording session");
            self.close_session();
        }

        let mut sequence = Sequence::with_tempo(self.bpm);
        self.track = sequence.add_track();
        self.sequence = Some(sequence);

        {
            let mut state = self.capture.lock();
            state.bpm = self.bpm;
            state.note_starts = [None; 128];
            state.start_time = Some(self.capture.clock.now());
        }

        // Recording continues through the direct API if the endpoint fails
        self.endpoint = match self.registry.ensure_role(EndpointRole::Recorder, self.policy) {
            Ok(endpoint) => {
                if endpoint.is_owned() {
                    let capture: Weak<Capture> = Arc::downgrade(&self.capture);
                    let result = endpoint.on_packet_received(move |message| {
                        if let Some(capture) = capture.upgrade() {
                            capture.handle(message);
                        }
                    });
                    if let Err(e) = result {
                        warn!("Cannot listen on {}: {}", endpoint.name(), e);
                    }
                }
                Some(endpoint)
            }
            Err(e) => {
                warn!("Recording without a virtual endpoint: {}", e);
                None
            }
        };
        info!("Recording started at {} bpm", self.bpm);
    }

    /// Record a note press directly.
    pub fn note_on(&self, note: u8, velocity: u8, channel: u8) {
        self.capture.note_on(note, velocity, channel);
    }

    /// Record a note release directly.
    pub fn note_off(&self, note: u8, release_velocity: u8) {
        self.capture.note_off(note, release_velocity);
    }

    /// Move finished notes into the sequence. Returns how many were added.
    pub fn pump(&mut self) -> usize {
        let mut count = 0;
        while let Ok(recorded) = self.notes.try_recv() {
            let Some(track) = self
                .sequence
                .as_mut()
                .and_then(|sequence| sequence.track_mut(self.track))
            else {
                continue;
            };
            track.add_note(recorded.position, recorded.note);
            count += 1;
        }
        count
    }

    /// Stop capturing: unhook the handler, then mark the session closed.
    fn close_session(&mut self) {
        if let Some(endpoint) = &self.endpoint {
            endpoint.clear_handler();
        }
        // Callbacks finish under this lock, so nothing is queued after it
        let mut state = self.capture.lock();
        state.start_time = None;
        state.note_starts = [None; 128];
    }

    /// Close the session and write the recording to `path`.
    ///
    /// Does nothing when no session is open. The session is torn down even
    /// if writing fails.
    pub fn save(&mut self, path: &Path) -> Result<()> {
        if !self.is_recording() {
            debug!("save() ignored: not recording");
            return Ok(());
        }

        self.close_session();
        self.pump();
        let Some(sequence) = self.sequence.take() else {
            return Ok(());
        };

        self.store.save(&sequence, path)?;
        info!(
            "Saved recording ({:.2} beats) to {}",
            sequence.length_in_beats(),
            path.display()
        );
        Ok(())
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        self.close_session();
        if let Some(endpoint) = self.endpoint.take() {
            self.registry.dispose(&endpoint);
        }
    }
}
