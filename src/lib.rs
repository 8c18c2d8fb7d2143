//! MIDI sequencer core.
//!
//! Decodes MIDI wire messages, publishes virtual endpoints, routes events
//! into a sound engine, plays stored sequences and records performances
//! into Standard MIDI Files.

pub mod clock;
pub mod config;
pub mod dispatch;
pub mod endpoint;
pub mod error;
pub mod midi;
pub mod playback;
pub mod recorder;
pub mod sampler;
pub mod sequence;
pub mod smf;

pub use clock::{Clock, ManualClock, WallClock};
pub use config::SequencerConfig;
pub use dispatch::{DispatchSender, Dispatcher, ListenerRegistry, MidiListener, Notification};
pub use endpoint::{EndpointHandle, EndpointNames, EndpointPolicy, EndpointRegistry, EndpointRole, MidiBackend};
pub use error::{Error, Result};
pub use midi::MidiEvent;
pub use playback::{PlaybackDriver, PlaybackState, Sequencer};
pub use recorder::{RecordedNote, Recorder};
pub use sampler::{InstrumentSource, Sampler, SoundEngine};
pub use sequence::{EventKind, NoteMessage, Sequence, TimedEvent, Track};
pub use smf::{SequenceStore, SmfStore};
