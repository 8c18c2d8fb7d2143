//! Sampler: routes decoded events into a sound engine and rebroadcasts
//! them to the other MIDI destinations.
//!
//! Outbound messages go through [`EndpointRegistry::send`], which never
//! delivers to this process's own endpoints.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

use crate::endpoint::{EndpointHandle, EndpointRegistry};
use crate::error::{Error, Result};
use crate::midi::{MidiEvent, DRUM_CHANNEL, SUSTAIN_PEDAL};

/// Default bank MSB for melodic instruments in a sound bank.
pub const DEFAULT_MELODIC_BANK_MSB: u8 = 0x79;

/// Default bank MSB for percussion instruments in a sound bank.
pub const DEFAULT_PERCUSSION_BANK_MSB: u8 = 0x78;

pub const DEFAULT_BANK_LSB: u8 = 0x00;

/// Velocity used by [`Sampler::start_note`] callers that have none.
pub const DEFAULT_VELOCITY: u8 = 100;

/// Where an instrument's sounds come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstrumentSource {
    SoundBank {
        path: PathBuf,
        program: u8,
        bank_msb: u8,
        bank_lsb: u8,
    },
    AudioFiles(Vec<PathBuf>),
}

impl InstrumentSource {
    /// Program 0 of the default melodic bank. Single-instrument banks
    /// usually put their instrument there.
    pub fn melodic_bank(path: impl Into<PathBuf>) -> Self {
        InstrumentSource::SoundBank {
            path: path.into(),
            program: 0,
            bank_msb: DEFAULT_MELODIC_BANK_MSB,
            bank_lsb: DEFAULT_BANK_LSB,
        }
    }

    pub fn percussion_bank(path: impl Into<PathBuf>) -> Self {
        InstrumentSource::SoundBank {
            path: path.into(),
            program: 0,
            bank_msb: DEFAULT_PERCUSSION_BANK_MSB,
            bank_lsb: DEFAULT_BANK_LSB,
        }
    }
}

/// Sound-generating sink. Channels are wire channels (0-15).
pub trait SoundEngine: Send + Sync {
    fn start_note(&self, note: u8, velocity: u8, channel: u8);

    fn stop_note(&self, note: u8, channel: u8);

    fn send_controller(&self, controller: u8, value: u8, channel: u8);

    fn send_program_change(&self, program: u8, bank_msb: u8, bank_lsb: u8, channel: u8);

    fn set_volume(&self, _volume: f32) {}

    fn volume(&self) -> f32 {
        1.0
    }

    fn load_instrument(&self, source: &InstrumentSource) -> Result<()> {
        Err(Error::ResourceCreation(format!(
            "sound engine cannot load {:?}",
            source
        )))
    }
}

pub struct Sampler {
    engine: Arc<dyn SoundEngine>,
    registry: Arc<EndpointRegistry>,
    /// Wire channel (0-15)
    channel: u8,
    bank_msb: AtomicU8,
    bank_lsb: AtomicU8,
    velocity_zero_as_note_off: AtomicBool,
}

impl Sampler {
    /// Create a sampler playing on wire channel `channel` (0-15).
    pub fn new(engine: Arc<dyn SoundEngine>, registry: Arc<EndpointRegistry>, channel: u8) -> Self {
        Self {
            engine,
            registry,
            channel: channel & 0x0F,
            bank_msb: AtomicU8::new(DEFAULT_MELODIC_BANK_MSB),
            bank_lsb: AtomicU8::new(DEFAULT_BANK_LSB),
            velocity_zero_as_note_off: AtomicBool::new(false),
        }
    }

    /// Treat inbound NoteOn with velocity 0 as NoteOff when routing.
    pub fn set_velocity_zero_as_note_off(&self, enabled: bool) {
        self.velocity_zero_as_note_off
            .store(enabled, Ordering::Relaxed);
    }

    pub fn channel(&self) -> u8 {
        self.channel
    }

    /// Whether this sampler plays the percussion channel.
    pub fn is_drum_channel(&self) -> bool {
        self.channel == DRUM_CHANNEL - 1
    }

    fn engine_stop_note(&self, note: u8) {
        // Drum instruments may not accept explicit note-off
        if !self.is_drum_channel() {
            self.engine.stop_note(note, self.channel);
        }
    }

    fn broadcast(&self, bytes: &[u8]) -> Result<usize> {
        let sent = self.registry.send(bytes)?;
        debug!("Sent {:02X?} to {} destinations", bytes, sent);
        Ok(sent)
    }

    /// Play an inbound event on the engine and rebroadcast it unchanged.
    ///
    /// Returns how many external destinations received the message.
    pub fn route_inbound(&self, event: MidiEvent) -> Result<usize> {
        match event {
            MidiEvent::NoteOn { note, velocity, .. } => {
                if velocity == 0 && self.velocity_zero_as_note_off.load(Ordering::Relaxed) {
                    self.engine_stop_note(note);
                } else {
                    self.engine.start_note(note, velocity, self.channel);
                }
            }
            MidiEvent::NoteOff { note, .. } => self.engine_stop_note(note),
            MidiEvent::ControlChange {
                controller, value, ..
            } => self.engine.send_controller(controller, value, self.channel),
            MidiEvent::ProgramChange { program, .. } => self.engine.send_program_change(
                program,
                self.bank_msb.load(Ordering::Relaxed),
                self.bank_lsb.load(Ordering::Relaxed),
                self.channel,
            ),
            MidiEvent::PolyAftertouch { .. }
            | MidiEvent::ChannelAftertouch { .. }
            | MidiEvent::PitchBend { .. } => {}
            MidiEvent::Unknown { raw_status } => {
                debug!("Not routing unknown status {:02X}", raw_status);
                return Ok(0);
            }
        }
        self.broadcast(&event.to_bytes())
    }

    pub fn start_note(&self, note: u8, velocity: u8) -> Result<usize> {
        self.engine.start_note(note, velocity, self.channel);
        self.broadcast(
            &MidiEvent::NoteOn {
                channel: self.channel,
                note,
                velocity,
            }
            .to_bytes(),
        )
    }

    /// Stop a note. On the wire this is a NoteOn with velocity 0.
    pub fn stop_note(&self, note: u8) -> Result<usize> {
        self.engine_stop_note(note);
        self.broadcast(
            &MidiEvent::NoteOn {
                channel: self.channel,
                note,
                velocity: 0,
            }
            .to_bytes(),
        )
    }

    fn sustain(&self, value: u8) -> Result<usize> {
        self.engine
            .send_controller(SUSTAIN_PEDAL, value, self.channel);
        self.broadcast(
            &MidiEvent::ControlChange {
                channel: self.channel,
                controller: SUSTAIN_PEDAL,
                value,
            }
            .to_bytes(),
        )
    }

    pub fn turn_on_sustain(&self) -> Result<usize> {
        self.sustain(127)
    }

    pub fn turn_off_sustain(&self) -> Result<usize> {
        self.sustain(0)
    }

    /// Select a program on the engine. Not sent on the wire.
    pub fn send_program_change(&self, program: u8, bank_msb: u8, bank_lsb: u8) {
        self.bank_msb.store(bank_msb, Ordering::Relaxed);
        self.bank_lsb.store(bank_lsb, Ordering::Relaxed);
        self.engine
            .send_program_change(program, bank_msb, bank_lsb, self.channel);
    }

    pub fn set_volume(&self, volume: f32) {
        self.engine.set_volume(volume);
    }

    pub fn volume(&self) -> f32 {
        self.engine.volume()
    }

    /// Load an instrument into the engine. Sound-bank sources also become
    /// the bank used for inbound program changes.
    pub fn load_instrument(&self, source: &InstrumentSource) -> Result<()> {
        self.engine.load_instrument(source)?;
        if let InstrumentSource::SoundBank {
            bank_msb, bank_lsb, ..
        } = source
        {
            self.bank_msb.store(*bank_msb, Ordering::Relaxed);
            self.bank_lsb.store(*bank_lsb, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Route everything arriving at `endpoint` through this sampler.
    pub fn attach(self: &Arc<Self>, endpoint: &EndpointHandle) -> Result<()> {
        let sampler: Weak<Sampler> = Arc::downgrade(self);
        endpoint.on_packet_received(move |message| {
            let Some(sampler) = sampler.upgrade() else {
                return;
            };
            let Some(event) = MidiEvent::from_bytes(message) else {
                return;
            };
            if let Err(e) = sampler.route_inbound(event) {
                warn!("Failed to route {:?}: {}", event, e);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::loopback::LoopbackBackend;
    use crate::endpoint::{EndpointNames, EndpointPolicy, EndpointRole};
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Start(u8, u8, u8),
        Stop(u8, u8),
        Controller(u8, u8, u8),
        Program(u8, u8, u8, u8),
        Load(InstrumentSource),
    }

    #[derive(Default)]
    struct MockEngine {
        calls: Mutex<Vec<Call>>,
        volume: Mutex<f32>,
    }

    impl MockEngine {
        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl SoundEngine for MockEngine {
        fn start_note(&self, note: u8, velocity: u8, channel: u8) {
            self.calls.lock().unwrap().push(Call::Start(note, velocity, channel));
        }

        fn stop_note(&self, note: u8, channel: u8) {
            self.calls.lock().unwrap().push(Call::Stop(note, channel));
        }

        fn send_controller(&self, controller: u8, value: u8, channel: u8) {
            self.calls
                .lock()
                .unwrap()
                .push(Call::Controller(controller, value, channel));
        }

        fn send_program_change(&self, program: u8, bank_msb: u8, bank_lsb: u8, channel: u8) {
            self.calls
                .lock()
                .unwrap()
                .push(Call::Program(program, bank_msb, bank_lsb, channel));
        }

        fn set_volume(&self, volume: f32) {
            *self.volume.lock().unwrap() = volume;
        }

        fn volume(&self) -> f32 {
            *self.volume.lock().unwrap()
        }

        fn load_instrument(&self, source: &InstrumentSource) -> Result<()> {
            self.calls.lock().unwrap().push(Call::Load(source.clone()));
            Ok(())
        }
    }

    fn setup(channel: u8) -> (Arc<LoopbackBackend>, Arc<MockEngine>, Arc<EndpointRegistry>, Sampler) {
        setup_on(LoopbackBackend::new(), channel)
    }

    fn setup_on(
        backend: LoopbackBackend,
        channel: u8,
    ) -> (Arc<LoopbackBackend>, Arc<MockEngine>, Arc<EndpointRegistry>, Sampler) {
        let backend = Arc::new(backend);
        let registry = Arc::new(EndpointRegistry::new(
            backend.clone(),
            EndpointNames::from_identity("com.example.app"),
        ));
        let engine = Arc::new(MockEngine::default());
        let sampler = Sampler::new(engine.clone(), registry.clone(), channel);
        (backend, engine, registry, sampler)
    }

    #[test]
    fn test_route_note_to_engine_and_wire() {
        let (backend, engine, _registry, sampler) = setup(0);
        let synth = backend.add_external_destination("External Synth");

        let sent = sampler
            .route_inbound(MidiEvent::NoteOn {
                channel: 0,
                note: 60,
                velocity: 100,
            })
            .unwrap();
        sampler
            .route_inbound(MidiEvent::NoteOff {
                channel: 0,
                note: 60,
                velocity: 0,
            })
            .unwrap();

        assert_eq!(sent, 1);
        assert_eq!(engine.calls(), vec![Call::Start(60, 100, 0), Call::Stop(60, 0)]);
        assert_eq!(
            synth.messages(),
            vec![vec![0x90, 60, 100], vec![0x80, 60, 0]]
        );
    }

    #[test]
    fn test_drum_channel_note_off_skips_engine() {
        let (backend, engine, _registry, sampler) = setup(DRUM_CHANNEL - 1);
        let synth = backend.add_external_destination("External Synth");
        assert!(sampler.is_drum_channel());

        sampler.stop_note(36).unwrap();
        sampler
            .route_inbound(MidiEvent::NoteOff {
                channel: 9,
                note: 38,
                velocity: 0,
            })
            .unwrap();

        assert!(engine.calls().is_empty());
        assert_eq!(
            synth.messages(),
            vec![vec![0x99, 36, 0], vec![0x89, 38, 0]]
        );
    }

    #[test]
    fn test_own_endpoints_excluded_from_broadcast() {
        for backend in [
            LoopbackBackend::new(),
            LoopbackBackend::with_alsa_names("com.example.app"),
        ] {
            let (backend, _engine, registry, sampler) = setup_on(backend, 0);
            let playback = registry
                .ensure_role(EndpointRole::Playback, EndpointPolicy::Reuse)
                .unwrap();
            let recorder = registry
                .ensure_role(EndpointRole::Recorder, EndpointPolicy::Recreate)
                .unwrap();
            let looped = Arc::new(Mutex::new(0));
            for endpoint in [&playback, &recorder] {
                let counter = looped.clone();
                endpoint
                    .on_packet_received(move |_| *counter.lock().unwrap() += 1)
                    .unwrap();
            }
            let synth = backend.add_external_destination("External Synth");

            assert_eq!(sampler.start_note(64, DEFAULT_VELOCITY).unwrap(), 1);
            assert_eq!(*looped.lock().unwrap(), 0);
            assert_eq!(synth.messages(), vec![vec![0x90, 64, 100]]);
        }
    }

    #[test]
    fn test_sustain_and_velocity_zero_policy() {
        let (backend, engine, _registry, sampler) = setup(2);
        let synth = backend.add_external_destination("External Synth");

        sampler.turn_on_sustain().unwrap();
        sampler.turn_off_sustain().unwrap();
        let zero = MidiEvent::NoteOn {
            channel: 2,
            note: 60,
            velocity: 0,
        };
        sampler.route_inbound(zero).unwrap();
        sampler.set_velocity_zero_as_note_off(true);
        sampler.route_inbound(zero).unwrap();

        assert_eq!(
            engine.calls(),
            vec![
                Call::Controller(SUSTAIN_PEDAL, 127, 2),
                Call::Controller(SUSTAIN_PEDAL, 0, 2),
                Call::Start(60, 0, 2),
                Call::Stop(60, 2),
            ]
        );
        assert_eq!(synth.messages()[0], vec![0xB2, 64, 127]);
        assert_eq!(synth.messages().len(), 4);
    }

    #[test]
    fn test_instrument_bank_used_for_program_change() {
        let (_backend, engine, _registry, sampler) = setup(0);
        let source = InstrumentSource::percussion_bank("/sounds/drums.sf2");
        sampler.load_instrument(&source).unwrap();
        sampler
            .route_inbound(MidiEvent::ProgramChange {
                channel: 0,
                program: 5,
            })
            .unwrap();
        sampler.set_volume(0.5);

        assert_eq!(
            engine.calls(),
            vec![
                Call::Load(source),
                Call::Program(5, DEFAULT_PERCUSSION_BANK_MSB, DEFAULT_BANK_LSB, 0),
            ]
        );
        assert_eq!(sampler.volume(), 0.5);
    }

    #[test]
    fn test_attach_routes_endpoint_traffic() {
        let (backend, engine, registry, sampler) = setup(0);
        let sampler = Arc::new(sampler);
        let endpoint = registry
            .ensure_role(EndpointRole::Playback, EndpointPolicy::Reuse)
            .unwrap();
        sampler.attach(&endpoint).unwrap();

        backend.deliver(
            "com.example.app.destination",
            &[crate::endpoint::Packet {
                timestamp: 0,
                data: &[0x90, 67, 80, 0xF8],
            }],
        );
        assert_eq!(engine.calls(), vec![Call::Start(67, 80, 0)]);
    }
}
