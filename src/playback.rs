//! Sequence playback engine.
//!
//! [`Player`] walks a flattened schedule of a loaded sequence, returning the
//! messages due as time advances. [`Sequencer`] wraps it in the playback
//! state machine and publishes played messages through the playback
//! endpoint, so they are observable by listeners and other clients.
//! [`PlaybackDriver`] advances a shared sequencer from a clock thread.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::SequencerConfig;
use crate::dispatch::DispatchSender;
use crate::endpoint::{EndpointHandle, EndpointPolicy, EndpointRegistry, EndpointRole};
use crate::error::{Error, Result};
use crate::midi::MidiEvent;
use crate::sequence::{EventKind, NoteMessage, Sequence, TimedEvent};
use crate::smf::SequenceStore;

/// Gap between the last event and the end marker.
const END_MARKER_EPSILON: f64 = 1e-6;

/// Something the player produced while advancing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PlaybackOutput {
    Message(MidiEvent),
    /// The end marker fired (never while looping)
    EndOfSequence,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Scheduled {
    Message(MidiEvent),
    End,
}

#[derive(Debug, Clone, Copy)]
struct ScheduledEvent {
    /// Position in beats within one pass
    position: f64,
    /// Tie-break at equal positions: note offs, then the rest, then the end marker
    order: u8,
    what: Scheduled,
}

fn schedule_for(sequence: &Sequence) -> Vec<ScheduledEvent> {
    let mut schedule = Vec::new();
    for track in sequence.tracks() {
        for event in track.events() {
            match event.kind {
                EventKind::Note(note) => {
                    schedule.push(ScheduledEvent {
                        position: event.position,
                        order: 1,
                        what: Scheduled::Message(MidiEvent::NoteOn {
                            channel: note.channel,
                            note: note.note,
                            velocity: note.velocity,
                        }),
                    });
                    schedule.push(ScheduledEvent {
                        position: event.end(),
                        order: 0,
                        what: Scheduled::Message(MidiEvent::NoteOff {
                            channel: note.channel,
                            note: note.note,
                            velocity: note.release_velocity,
                        }),
                    });
                }
                EventKind::Midi(message) => schedule.push(ScheduledEvent {
                    position: event.position,
                    order: 1,
                    what: Scheduled::Message(message),
                }),
                EventKind::EndMarker => schedule.push(ScheduledEvent {
                    position: event.position,
                    order: 2,
                    what: Scheduled::End,
                }),
                EventKind::Tempo { .. } => {}
            }
        }
    }
    // Stable, so equal keys keep track order
    schedule.sort_by(|a, b| {
        a.position
            .total_cmp(&b.position)
            .then(a.order.cmp(&b.order))
    });
    schedule
}

/// Cursor over a loaded sequence, in beats.
pub struct Player {
    schedule: Vec<ScheduledEvent>,
    /// Length of one pass when looping
    length: f64,
    looping: bool,
    /// Beats since start; keeps growing across loop passes
    position: f64,
    /// Position at which the current pass started
    pass_start: f64,
    /// Index of next event to play in the current pass
    next_event_idx: usize,
    /// Whether any time has been played since start
    advanced: bool,
    /// Whether playback is enabled
    pub playing: bool,
}

impl Player {
    pub fn new() -> Self {
        Self {
            schedule: Vec::new(),
            length: 0.0,
            looping: false,
            position: 0.0,
            pass_start: 0.0,
            next_event_idx: 0,
            advanced: false,
            playing: false,
        }
    }

    /// Load a sequence for playback from the beginning.
    pub fn load(&mut self, sequence: &Sequence) {
        self.schedule = schedule_for(sequence);
        self.length = sequence.length_in_beats();
        self.reset();
    }

    /// Rebuild the schedule after an edit, keeping the current position.
    pub fn reload(&mut self, sequence: &Sequence) {
        self.schedule = schedule_for(sequence);
        self.length = sequence.length_in_beats();
        let pass_position = self.position - self.pass_start;
        self.next_event_idx = if self.advanced {
            self.schedule.partition_point(|e| e.position <= pass_position)
        } else {
            0
        };
    }

    pub fn set_looping(&mut self, looping: bool) {
        self.looping = looping;
    }

    pub fn is_looping(&self) -> bool {
        self.looping
    }

    /// Start playback from the beginning.
    pub fn start(&mut self) {
        self.reset();
        self.playing = true;
    }

    /// Stop playback.
    pub fn stop(&mut self) {
        self.playing = false;
    }

    /// Rewind to position 0.
    pub fn reset(&mut self) {
        self.position = 0.0;
        self.pass_start = 0.0;
        self.next_event_idx = 0;
        self.advanced = false;
    }

    pub fn position(&self) -> f64 {
        self.position
    }

    /// Advance by `delta` beats. Returns everything that became due, in order.
    pub fn advance(&mut self, delta: f64) -> Vec<PlaybackOutput> {
        if !self.playing || self.schedule.is_empty() {
            return Vec::new();
        }

        self.position += delta.max(0.0);
        self.advanced = true;

        let mut outputs = Vec::new();
        loop {
            let pass_position = self.position - self.pass_start;
            while let Some(event) = self.schedule.get(self.next_event_idx) {
                if event.position > pass_position {
                    break;
                }
                match event.what {
                    Scheduled::Message(message) => outputs.push(PlaybackOutput::Message(message)),
                    Scheduled::End if !self.looping => outputs.push(PlaybackOutput::EndOfSequence),
                    Scheduled::End => {}
                }
                self.next_event_idx += 1;
            }

            // Wrap into the next pass
            if self.looping && self.length > 0.0 && pass_position >= self.length {
                self.pass_start += self.length;
                self.next_event_idx = 0;
                continue;
            }
            break;
        }
        outputs
    }
}

impl Default for Player {
    fn default() -> Self {
        Self::new()
    }
}

/// Playback state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Idle,
    Loaded,
    Playing,
    Looping,
    Finished,
}

pub struct Sequencer {
    registry: Arc<EndpointRegistry>,
    store: Arc<dyn SequenceStore>,
    dispatch: DispatchSender,
    policy: EndpointPolicy,
    enable_looping: bool,
    state: PlaybackState,
    sequence: Option<Sequence>,
    endpoint: Option<EndpointHandle>,
    player: Player,
    bpm: f64,
    length_in_beats: f64,
}

impl Sequencer {
    pub fn new(
        registry: Arc<EndpointRegistry>,
        store: Arc<dyn SequenceStore>,
        dispatch: DispatchSender,
    ) -> Self {
        Self {
            registry,
            store,
            dispatch,
            policy: EndpointPolicy::Reuse,
            enable_looping: false,
            state: PlaybackState::Idle,
            sequence: None,
            endpoint: None,
            player: Player::new(),
            bpm: 0.0,
            length_in_beats: 0.0,
        }
    }

    pub fn from_config(
        config: &SequencerConfig,
        registry: Arc<EndpointRegistry>,
        store: Arc<dyn SequenceStore>,
        dispatch: DispatchSender,
    ) -> Self {
        let mut sequencer =
            Self::new(registry, store, dispatch).with_policy(config.endpoint_policy.playback);
        sequencer.set_enable_looping(config.enable_looping);
        sequencer
    }

    /// How the playback endpoint is obtained on each load.
    pub fn with_policy(mut self, policy: EndpointPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Repeat forever instead of finishing. Takes effect on the next start.
    pub fn set_enable_looping(&mut self, enable: bool) {
        self.enable_looping = enable;
    }

    pub fn enable_looping(&self) -> bool {
        self.enable_looping
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    pub fn bpm(&self) -> f64 {
        self.bpm
    }

    pub fn length_in_beats(&self) -> f64 {
        self.length_in_beats
    }

    pub fn length_in_seconds(&self) -> f64 {
        if self.bpm > 0.0 {
            self.length_in_beats * 60.0 / self.bpm
        } else {
            0.0
        }
    }

    pub fn sequence(&self) -> Option<&Sequence> {
        self.sequence.as_ref()
    }

    /// The playback endpoint, if one could be obtained.
    pub fn endpoint(&self) -> Option<&EndpointHandle> {
        self.endpoint.as_ref()
    }

    pub fn current_position_in_beats(&self) -> f64 {
        match self.state {
            PlaybackState::Playing | PlaybackState::Looping | PlaybackState::Finished => {
                self.player.position()
            }
            PlaybackState::Idle | PlaybackState::Loaded => 0.0,
        }
    }

    pub fn current_position_in_seconds(&self) -> f64 {
        if self.bpm > 0.0 {
            self.current_position_in_beats() * 60.0 / self.bpm
        } else {
            0.0
        }
    }

    /// Load a sequence file, stopping any current playback first.
    ///
    /// On failure the sequencer is left `Idle`.
    pub fn load(&mut self, path: &Path) -> Result<()> {
        self.stop();
        let sequence = self.store.load(path)?;
        info!("Loaded {}", path.display());
        self.load_sequence(sequence);
        Ok(())
    }

    /// Load an in-memory sequence, stopping any current playback first.
    pub fn load_sequence(&mut self, mut sequence: Sequence) {
        self.stop();

        self.length_in_beats = mark_end(&mut sequence);
        self.bpm = sequence.bpm();

        // Playback continues without an endpoint if one cannot be created
        self.endpoint = match self.registry.ensure_role(EndpointRole::Playback, self.policy) {
            Ok(endpoint) => {
                if endpoint.is_owned() {
                    self.listen(&endpoint);
                }
                Some(endpoint)
            }
            Err(e) => {
                warn!("Playing without a virtual endpoint: {}", e);
                None
            }
        };

        self.player.set_looping(false);
        self.player.load(&sequence);
        self.sequence = Some(sequence);
        self.state = PlaybackState::Loaded;
        debug!(
            "Sequence loaded: {:.2} beats at {:.1} bpm",
            self.length_in_beats, self.bpm
        );
    }

    fn listen(&self, endpoint: &EndpointHandle) {
        let dispatch = self.dispatch.clone();
        let result = endpoint.on_packet_received(move |message| {
            let Some(event) = MidiEvent::from_bytes(message) else {
                return;
            };
            match event {
                MidiEvent::NoteOn {
                    channel,
                    note,
                    velocity,
                } => {
                    dispatch.note_on(note, velocity, channel);
                }
                MidiEvent::NoteOff { channel, note, .. } => {
                    dispatch.note_off(note, channel);
                }
                MidiEvent::PolyAftertouch {
                    channel,
                    note,
                    pressure,
                } => debug!(
                    "Polyphonic Key Pressure (Aftertouch). Channel {} note {} pressure {}",
                    channel, note, pressure
                ),
                MidiEvent::ControlChange {
                    channel,
                    controller,
                    value,
                } => debug!(
                    "Control Change. Channel {} controller {} value {}",
                    channel, controller, value
                ),
                MidiEvent::ProgramChange { channel, program } => {
                    debug!("Program Change. Channel {} program {}", channel, program)
                }
                MidiEvent::ChannelAftertouch { channel, pressure } => debug!(
                    "Channel Pressure (Aftertouch). Channel {} pressure {}",
                    channel, pressure
                ),
                MidiEvent::PitchBend { channel, lsb, msb } => debug!(
                    "Pitch Bend Change. Channel {} lsb {} msb {}",
                    channel, lsb, msb
                ),
                MidiEvent::Unknown { raw_status } => {
                    debug!("Unhandled message {:02X}", raw_status)
                }
            }
        });
        if let Err(e) = result {
            warn!("Cannot listen on {}: {}", endpoint.name(), e);
        }
    }

    /// Start playing the loaded sequence from the beginning.
    pub fn start(&mut self) {
        if self.state != PlaybackState::Loaded {
            debug!("start() ignored in state {:?}", self.state);
            return;
        }
        self.begin_playing();
    }

    fn begin_playing(&mut self) {
        let looping = self.enable_looping;
        self.player.set_looping(looping);
        self.player.start();
        self.state = if looping {
            PlaybackState::Looping
        } else {
            PlaybackState::Playing
        };
        info!("Playback started (looping: {})", looping);
    }

    /// Load `path` and start playing it.
    pub fn play_file(&mut self, path: &Path) -> Result<()> {
        self.load(path)?;
        self.start();
        Ok(())
    }

    /// Play again from position 0 without reloading.
    pub fn restart(&mut self) {
        match self.state {
            PlaybackState::Loaded | PlaybackState::Finished => self.begin_playing(),
            state => debug!("restart() ignored in state {:?}", state),
        }
    }

    /// Halt playback, release the playback endpoint and drop the sequence.
    pub fn stop(&mut self) {
        if self.state == PlaybackState::Idle {
            return;
        }
        self.player.stop();
        self.player.reset();
        if let Some(endpoint) = self.endpoint.take() {
            self.registry.dispose(&endpoint);
        }
        self.sequence = None;
        self.bpm = 0.0;
        self.length_in_beats = 0.0;
        self.state = PlaybackState::Idle;
        info!("Playback stopped");
    }

    /// Add a note to track `track` of the loaded sequence.
    ///
    /// `position` and `duration` are in beats; `channel` is 0-15.
    pub fn add_note_event(
        &mut self,
        track: usize,
        note: u8,
        velocity: u8,
        position: f64,
        duration: f64,
        channel: u8,
    ) -> Result<()> {
        let sequence = self
            .sequence
            .as_mut()
            .ok_or(Error::StateViolation("no sequence loaded"))?;
        sequence.add_note(
            track,
            position,
            NoteMessage {
                channel: channel & 0x0F,
                note: note & 0x7F,
                velocity: velocity & 0x7F,
                release_velocity: 0,
                duration,
            },
        )?;
        self.length_in_beats = mark_end(sequence);
        self.player.reload(sequence);
        Ok(())
    }

    /// Advance playback by wall time `elapsed`. Returns the number of
    /// messages played.
    pub fn advance(&mut self, elapsed: Duration) -> usize {
        if !matches!(self.state, PlaybackState::Playing | PlaybackState::Looping) {
            return 0;
        }

        let beats = elapsed.as_secs_f64() * self.bpm / 60.0;
        let mut played = 0;
        for output in self.player.advance(beats) {
            match output {
                PlaybackOutput::Message(message) => {
                    self.emit(&message);
                    played += 1;
                }
                PlaybackOutput::EndOfSequence => {
                    self.finish();
                    break;
                }
            }
        }
        played
    }

    fn emit(&self, message: &MidiEvent) {
        let Some(endpoint) = &self.endpoint else {
            return;
        };
        let bytes = message.to_bytes();
        if endpoint.is_owned() {
            endpoint.inject(&bytes);
        } else if let Err(e) = self.registry.backend().send_to(endpoint.name(), &bytes) {
            warn!("Failed to play to {}: {}", endpoint.name(), e);
        }
    }

    fn finish(&mut self) {
        self.player.stop();
        self.player.reset();
        self.state = PlaybackState::Finished;
        self.dispatch.sequence_finished();
        info!("MIDI sequence finished");
    }
}

impl Drop for Sequencer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Replace the end marker, placing it just past the sequence length on
/// the first track. Returns the length in beats.
fn mark_end(sequence: &mut Sequence) -> f64 {
    for track in sequence.tracks_mut() {
        track.remove_end_markers();
    }
    let length = sequence.length_in_beats();
    if sequence.track_count() == 0 {
        sequence.add_track();
    }
    if let Some(first) = sequence.track_mut(0) {
        first.insert(TimedEvent {
            position: (length + END_MARKER_EPSILON).ceil(),
            kind: EventKind::EndMarker,
        });
    }
    length
}

/// Drives a shared [`Sequencer`] from a dedicated clock thread.
///
/// The thread holds the sequencer weakly and exits when it is dropped or
/// when the driver is dropped.
pub struct PlaybackDriver {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl PlaybackDriver {
    pub fn spawn(sequencer: &Arc<Mutex<Sequencer>>, tick: Duration) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let sequencer: Weak<Mutex<Sequencer>> = Arc::downgrade(sequencer);

        let handle = thread::Builder::new()
            .name("sequencer-clock".to_string())
            .spawn(move || {
                let mut last = Instant::now();
                while !stop_flag.load(Ordering::Relaxed) {
                    thread::sleep(tick);
                    let now = Instant::now();
                    let elapsed = now - last;
                    last = now;

                    let Some(sequencer) = sequencer.upgrade() else {
                        break;
                    };
                    sequencer
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .advance(elapsed);
                }
                debug!("Sequencer clock thread exiting");
            })
            .map_err(|e| Error::ResourceCreation(format!("clock thread: {}", e)))?;

        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for PlaybackDriver {
    fn drop(&mut self) {
        self.stop();
    }
}
