//! Standard MIDI File loading and saving.
//!
//! Files are read with `midly` into a [`Sequence`]: tempo meta events go to
//! the tempo track, channel messages are split one track per channel, and
//! note on/off pairs become notes with a duration.

use midly::num::{u14, u15, u24, u28, u4, u7};
use midly::{Format, Header, MetaMessage, MidiMessage, PitchBend, Smf, Timing, TrackEvent, TrackEventKind};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::debug;

use crate::error::{Error, Result};
use crate::midi::MidiEvent;
use crate::sequence::{EventKind, NoteMessage, Sequence, TimedEvent};

/// Loads and saves sequences.
pub trait SequenceStore: Send + Sync {
    fn load(&self, path: &Path) -> Result<Sequence>;
    fn save(&self, sequence: &Sequence, path: &Path) -> Result<()>;
}

/// [`SequenceStore`] for Standard MIDI Files.
#[derive(Debug, Clone, Copy)]
pub struct SmfStore {
    /// Resolution used when writing
    pub ticks_per_beat: u16,
}

impl Default for SmfStore {
    fn default() -> Self {
        Self {
            ticks_per_beat: 480,
        }
    }
}

impl SmfStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse SMF bytes into a sequence.
    pub fn parse(&self, data: &[u8]) -> Result<Sequence> {
        let smf = Smf::parse(data)?;

        let ticks_per_beat = match smf.header.timing {
            Timing::Metrical(tpb) => f64::from(tpb.as_int().max(1)),
            Timing::Timecode(_, _) => {
                return Err(Error::Load(
                    "timecode-based MIDI files are not supported".to_string(),
                ))
            }
        };

        let mut sequence = Sequence::new();
        // channel -> track index, in order of first appearance
        let mut channel_tracks: HashMap<u8, usize> = HashMap::new();

        for track in &smf.tracks {
            let mut tick: u64 = 0;
            // (channel, key) -> pending note-ons (position, velocity), oldest first
            let mut pending: HashMap<(u8, u8), Vec<(f64, u8)>> = HashMap::new();

            for event in track.iter() {
                tick += u64::from(event.delta.as_int());
                let position = tick as f64 / ticks_per_beat;

                match event.kind {
                    TrackEventKind::Meta(MetaMessage::Tempo(tempo)) => {
                        let micros_per_beat = f64::from(tempo.as_int().max(1));
                        sequence.tempo_track_mut().insert(TimedEvent {
                            position,
                            kind: EventKind::Tempo {
                                bpm: 60_000_000.0 / micros_per_beat,
                            },
                        });
                    }
                    TrackEventKind::Midi { channel, message } => {
                        let channel = channel.as_int();
                        let index = *channel_tracks
                            .entry(channel)
                            .or_insert_with(|| sequence.add_track());

                        match message {
                            MidiMessage::NoteOn { key, vel } if vel.as_int() > 0 => {
                                pending
                                    .entry((channel, key.as_int()))
                                    .or_default()
                                    .push((position, vel.as_int()));
                            }
                            // NoteOn with velocity 0 closes a note in files
                            MidiMessage::NoteOn { key, vel } | MidiMessage::NoteOff { key, vel } => {
                                let started = pending
                                    .get_mut(&(channel, key.as_int()))
                                    .filter(|starts| !starts.is_empty())
                                    .map(|starts| starts.remove(0));
                                let Some((start, velocity)) = started else {
                                    debug!("Dropping note off without note on: {}", key.as_int());
                                    continue;
                                };
                                sequence.add_note(
                                    index,
                                    start,
                                    NoteMessage {
                                        channel,
                                        note: key.as_int(),
                                        velocity,
                                        release_velocity: vel.as_int(),
                                        duration: position - start,
                                    },
                                )?;
                            }
                            other => {
                                sequence.add_midi_event(index, position, midi_event(channel, other))?;
                            }
                        }
                    }
                    _ => {}
                }
            }

            // Notes left open end with the track
            let end = tick as f64 / ticks_per_beat;
            for ((channel, note), starts) in pending {
                let index = channel_tracks.get(&channel).copied().unwrap_or(0);
                for (start, velocity) in starts {
                    sequence.add_note(
                        index,
                        start,
                        NoteMessage {
                            channel,
                            note,
                            velocity,
                            release_velocity: 0,
                            duration: end - start,
                        },
                    )?;
                }
            }
        }

        debug!(
            "Parsed MIDI file: {} tracks, {:.2} beats at {:.1} bpm",
            sequence.track_count(),
            sequence.length_in_beats(),
            sequence.bpm()
        );
        Ok(sequence)
    }

    /// Render a sequence as SMF bytes (format 1).
    pub fn render(&self, sequence: &Sequence) -> Result<Vec<u8>> {
        let tpb = f64::from(self.ticks_per_beat);
        let to_tick = |beats: f64| (beats.max(0.0) * tpb).round() as u64;

        let mut smf = Smf::new(Header::new(
            Format::Parallel,
            Timing::Metrical(u15::new(self.ticks_per_beat & 0x7FFF)),
        ));

        let mut tempo_entries = Vec::new();
        for event in sequence.tempo_track().events() {
            if let EventKind::Tempo { bpm } = event.kind {
                tempo_entries.push((to_tick(event.position), 1u8, tempo_event(bpm)));
            }
        }
        smf.tracks.push(finish_track(tempo_entries));

        for track in sequence.tracks() {
            // (tick, order, kind); note offs sort before anything else at a tick
            let mut entries: Vec<(u64, u8, TrackEventKind<'static>)> = Vec::new();
            for event in track.events() {
                let tick = to_tick(event.position);
                match event.kind {
                    EventKind::Note(note) => {
                        let channel = u4::new(note.channel & 0x0F);
                        let key = u7::new(note.note & 0x7F);
                        entries.push((
                            tick,
                            1,
                            TrackEventKind::Midi {
                                channel,
                                message: MidiMessage::NoteOn {
                                    key,
                                    vel: u7::new(note.velocity & 0x7F),
                                },
                            },
                        ));
                        entries.push((
                            to_tick(event.end()),
                            0,
                            TrackEventKind::Midi {
                                channel,
                                message: MidiMessage::NoteOff {
                                    key,
                                    vel: u7::new(note.release_velocity & 0x7F),
                                },
                            },
                        ));
                    }
                    EventKind::Midi(midi) => {
                        if let Some(kind) = track_event(&midi) {
                            entries.push((tick, 1, kind));
                        }
                    }
                    EventKind::Tempo { bpm } => entries.push((tick, 1, tempo_event(bpm))),
                    EventKind::EndMarker => {}
                }
            }
            smf.tracks.push(finish_track(entries));
        }

        let mut bytes = Vec::new();
        smf.write_std(&mut bytes)
            .map_err(|e| Error::FileWrite(e.to_string()))?;
        Ok(bytes)
    }
}

impl SequenceStore for SmfStore {
    fn load(&self, path: &Path) -> Result<Sequence> {
        let data = fs::read(path)
            .map_err(|e| Error::Load(format!("failed to read {}: {}", path.display(), e)))?;
        self.parse(&data)
    }

    fn save(&self, sequence: &Sequence, path: &Path) -> Result<()> {
        let bytes = self.render(sequence)?;
        fs::write(path, bytes)
            .map_err(|e| Error::FileWrite(format!("failed to write {}: {}", path.display(), e)))?;
        debug!("Saved sequence to {}", path.display());
        Ok(())
    }
}

fn midi_event(channel: u8, message: MidiMessage) -> MidiEvent {
    match message {
        MidiMessage::NoteOn { key, vel } => MidiEvent::NoteOn {
            channel,
            note: key.as_int(),
            velocity: vel.as_int(),
        },
        MidiMessage::NoteOff { key, vel } => MidiEvent::NoteOff {
            channel,
            note: key.as_int(),
            velocity: vel.as_int(),
        },
        MidiMessage::Aftertouch { key, vel } => MidiEvent::PolyAftertouch {
            channel,
            note: key.as_int(),
            pressure: vel.as_int(),
        },
        MidiMessage::Controller { controller, value } => MidiEvent::ControlChange {
            channel,
            controller: controller.as_int(),
            value: value.as_int(),
        },
        MidiMessage::ProgramChange { program } => MidiEvent::ProgramChange {
            channel,
            program: program.as_int(),
        },
        MidiMessage::ChannelAftertouch { vel } => MidiEvent::ChannelAftertouch {
            channel,
            pressure: vel.as_int(),
        },
        MidiMessage::PitchBend { bend } => {
            let value = bend.0.as_int();
            MidiEvent::PitchBend {
                channel,
                lsb: (value & 0x7F) as u8,
                msb: ((value >> 7) & 0x7F) as u8,
            }
        }
    }
}

fn track_event(event: &MidiEvent) -> Option<TrackEventKind<'static>> {
    let channel = u4::new(event.channel()? & 0x0F);
    let seven = |v: u8| u7::new(v & 0x7F);
    let message = match *event {
        MidiEvent::NoteOn { note, velocity, .. } => MidiMessage::NoteOn {
            key: seven(note),
            vel: seven(velocity),
        },
        MidiEvent::NoteOff { note, velocity, .. } => MidiMessage::NoteOff {
            key: seven(note),
            vel: seven(velocity),
        },
        MidiEvent::PolyAftertouch { note, pressure, .. } => MidiMessage::Aftertouch {
            key: seven(note),
            vel: seven(pressure),
        },
        MidiEvent::ControlChange {
            controller, value, ..
        } => MidiMessage::Controller {
            controller: seven(controller),
            value: seven(value),
        },
        MidiEvent::ProgramChange { program, .. } => MidiMessage::ProgramChange {
            program: seven(program),
        },
        MidiEvent::ChannelAftertouch { pressure, .. } => MidiMessage::ChannelAftertouch {
            vel: seven(pressure),
        },
        MidiEvent::PitchBend { lsb, msb, .. } => {
            let raw = (u16::from(msb & 0x7F) << 7) | u16::from(lsb & 0x7F);
            MidiMessage::PitchBend {
                bend: PitchBend(u14::new(raw)),
            }
        }
        MidiEvent::Unknown { .. } => return None,
    };
    Some(TrackEventKind::Midi { channel, message })
}

fn tempo_event(bpm: f64) -> TrackEventKind<'static> {
    let micros = (60_000_000.0 / bpm.max(1.0)).round() as u32;
    TrackEventKind::Meta(MetaMessage::Tempo(u24::new(micros.min(0x00FF_FFFF))))
}

/// Sort by tick, convert to deltas and terminate the track.
fn finish_track(mut entries: Vec<(u64, u8, TrackEventKind<'static>)>) -> Vec<TrackEvent<'static>> {
    entries.sort_by_key(|(tick, order, _)| (*tick, *order));

    let mut events = Vec::with_capacity(entries.len() + 1);
    let mut last_tick = 0;
    for (tick, _, kind) in entries {
        let delta = (tick - last_tick).min(0x0FFF_FFFF) as u32;
        last_tick = tick;
        events.push(TrackEvent {
            delta: u28::new(delta),
            kind,
        });
    }
    events.push(TrackEvent {
        delta: u28::new(0),
        kind: TrackEventKind::Meta(MetaMessage::EndOfTrack),
    });
    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn note(channel: u8, note: u8, duration: f64) -> NoteMessage {
        NoteMessage {
            channel,
            note,
            velocity: 100,
            release_velocity: 64,
            duration,
        }
    }

    #[test]
    fn test_save_and_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("song.mid");

        let mut sequence = Sequence::with_tempo(90.0);
        let track = sequence.add_track();
        sequence.add_note(track, 0.0, note(0, 60, 1.0)).unwrap();
        sequence.add_note(track, 1.0, note(0, 62, 0.5)).unwrap();
        sequence.add_note(track, 2.5, note(0, 64, 1.5)).unwrap();

        let store = SmfStore::new();
        store.save(&sequence, &path).unwrap();
        let loaded = store.load(&path).unwrap();

        assert_relative_eq!(loaded.bpm(), 90.0, epsilon = 1e-3);
        assert_eq!(loaded.track_count(), 1);
        assert_relative_eq!(loaded.length_in_beats(), 4.0);

        let notes: Vec<(f64, NoteMessage)> = loaded.tracks()[0]
            .events()
            .iter()
            .filter_map(|e| match e.kind {
                EventKind::Note(n) => Some((e.position, n)),
                _ => None,
            })
            .collect();
        assert_eq!(notes.len(), 3);
        assert_relative_eq!(notes[1].0, 1.0);
        assert_eq!(notes[1].1.note, 62);
        assert_relative_eq!(notes[1].1.duration, 0.5);
        assert_eq!(notes[1].1.release_velocity, 64);
    }

    #[test]
    fn test_channels_split_into_tracks() {
        let mut sequence = Sequence::new();
        let track = sequence.add_track();
        sequence.add_note(track, 0.0, note(0, 60, 1.0)).unwrap();
        sequence.add_note(track, 0.0, note(9, 36, 0.25)).unwrap();
        sequence
            .add_midi_event(
                track,
                0.5,
                MidiEvent::ControlChange {
                    channel: 9,
                    controller: 7,
                    value: 100,
                },
            )
            .unwrap();

        let store = SmfStore::new();
        let loaded = store.parse(&store.render(&sequence).unwrap()).unwrap();

        assert_eq!(loaded.track_count(), 2);
        assert_relative_eq!(loaded.bpm(), crate::sequence::DEFAULT_BPM);
        let drums = &loaded.tracks()[1];
        assert_eq!(drums.events().len(), 2);
        assert!(drums.events().iter().any(|e| e.kind
            == EventKind::Midi(MidiEvent::ControlChange {
                channel: 9,
                controller: 7,
                value: 100
            })));
    }

    #[test]
    fn test_velocity_zero_note_on_closes_note() {
        let mut smf = Smf::new(Header::new(
            Format::SingleTrack,
            Timing::Metrical(u15::new(96)),
        ));
        smf.tracks.push(vec![
            TrackEvent {
                delta: u28::new(0),
                kind: TrackEventKind::Midi {
                    channel: u4::new(0),
                    message: MidiMessage::NoteOn {
                        key: u7::new(60),
                        vel: u7::new(90),
                    },
                },
            },
            TrackEvent {
                delta: u28::new(48),
                kind: TrackEventKind::Midi {
                    channel: u4::new(0),
                    message: MidiMessage::NoteOn {
                        key: u7::new(60),
                        vel: u7::new(0),
                    },
                },
            },
            TrackEvent {
                delta: u28::new(0),
                kind: TrackEventKind::Meta(MetaMessage::EndOfTrack),
            },
        ]);
        let mut bytes = Vec::new();
        smf.write_std(&mut bytes).unwrap();

        let loaded = SmfStore::new().parse(&bytes).unwrap();
        let events = loaded.tracks()[0].events();
        assert_eq!(events.len(), 1);
        match events[0].kind {
            EventKind::Note(n) => {
                assert_eq!(n.velocity, 90);
                assert_relative_eq!(n.duration, 0.5);
            }
            other => panic!("expected a note, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_file_is_load_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = SmfStore::new().load(&dir.path().join("missing.mid"));
        assert!(matches!(result, Err(Error::Load(_))));
    }

    #[test]
    fn test_garbage_is_load_error() {
        let result = SmfStore::new().parse(b"not a midi file");
        assert!(matches!(result, Err(Error::Load(_))));
    }

    #[test]
    fn test_unwritable_path_is_file_write_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("no-such-dir").join("out.mid");
        let result = SmfStore::new().save(&Sequence::new(), &path);
        assert!(matches!(result, Err(Error::FileWrite(_))));
    }
}
