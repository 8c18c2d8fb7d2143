//! In-memory sequence model.
//!
//! Positions and durations are in beats. A [`Sequence`] carries a tempo
//! track plus any number of event tracks; events on a track are kept in
//! non-decreasing position order.

use crate::error::{Error, Result};
use crate::midi::MidiEvent;

/// Tempo used when a sequence carries no tempo event.
pub const DEFAULT_BPM: f64 = 120.0;

/// A note with a length, as stored on a track.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NoteMessage {
    /// Channel (0-15)
    pub channel: u8,
    pub note: u8,
    pub velocity: u8,
    pub release_velocity: u8,
    /// Length in beats
    pub duration: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EventKind {
    Note(NoteMessage),
    /// Any other channel message, sent as-is
    Midi(MidiEvent),
    Tempo { bpm: f64 },
    /// Synthetic marker; fires when playback reaches it
    EndMarker,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimedEvent {
    /// Position in beats from the start of the sequence
    pub position: f64,
    pub kind: EventKind,
}

impl TimedEvent {
    /// Where the event stops sounding. Notes end after their duration.
    pub fn end(&self) -> f64 {
        match self.kind {
            EventKind::Note(note) => self.position + note.duration.max(0.0),
            _ => self.position,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Track {
    events: Vec<TimedEvent>,
}

impl Track {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert keeping positions non-decreasing. Equal positions keep
    /// insertion order.
    pub fn insert(&mut self, event: TimedEvent) {
        let index = self
            .events
            .partition_point(|e| e.position <= event.position);
        self.events.insert(index, event);
    }

    pub fn add_note(&mut self, position: f64, note: NoteMessage) {
        self.insert(TimedEvent {
            position,
            kind: EventKind::Note(note),
        });
    }

    pub fn events(&self) -> &[TimedEvent] {
        &self.events
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Trailing position over every event except end markers.
    pub fn length(&self) -> f64 {
        self.events
            .iter()
            .filter(|e| e.kind != EventKind::EndMarker)
            .map(TimedEvent::end)
            .fold(0.0, f64::max)
    }

    pub fn remove_end_markers(&mut self) {
        self.events.retain(|e| e.kind != EventKind::EndMarker);
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Sequence {
    tempo_track: Track,
    tracks: Vec<Track>,
}

impl Sequence {
    pub fn new() -> Self {
        Self::default()
    }

    /// A sequence whose tempo track is stamped with `bpm` at position 0.
    pub fn with_tempo(bpm: f64) -> Self {
        let mut sequence = Self::new();
        sequence.set_tempo(bpm);
        sequence
    }

    /// Replace the tempo at position 0.
    pub fn set_tempo(&mut self, bpm: f64) {
        self.tempo_track
            .events
            .retain(|e| !(e.position == 0.0 && matches!(e.kind, EventKind::Tempo { .. })));
        self.tempo_track.insert(TimedEvent {
            position: 0.0,
            kind: EventKind::Tempo { bpm },
        });
    }

    pub fn tempo_track(&self) -> &Track {
        &self.tempo_track
    }

    pub fn tempo_track_mut(&mut self) -> &mut Track {
        &mut self.tempo_track
    }

    /// The first tempo on the tempo track, or [`DEFAULT_BPM`].
    pub fn bpm(&self) -> f64 {
        self.tempo_track
            .events
            .iter()
            .find_map(|e| match e.kind {
                EventKind::Tempo { bpm } if bpm > 0.0 => Some(bpm),
                _ => None,
            })
            .unwrap_or(DEFAULT_BPM)
    }

    /// Append an empty track and return its index.
    pub fn add_track(&mut self) -> usize {
        self.tracks.push(Track::new());
        self.tracks.len() - 1
    }

    pub fn track(&self, index: usize) -> Option<&Track> {
        self.tracks.get(index)
    }

    pub fn track_mut(&mut self, index: usize) -> Option<&mut Track> {
        self.tracks.get_mut(index)
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    pub fn tracks_mut(&mut self) -> &mut [Track] {
        &mut self.tracks
    }

    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }

    /// Add a note to track `track`.
    pub fn add_note(&mut self, track: usize, position: f64, note: NoteMessage) -> Result<()> {
        check_position(position)?;
        if !note.duration.is_finite() {
            return Err(Error::StateViolation("note duration must be finite"));
        }
        let track = self
            .tracks
            .get_mut(track)
            .ok_or(Error::StateViolation("track index out of range"))?;
        track.add_note(position, note);
        Ok(())
    }

    /// Add a raw channel message to track `track`.
    pub fn add_midi_event(&mut self, track: usize, position: f64, event: MidiEvent) -> Result<()> {
        check_position(position)?;
        let track = self
            .tracks
            .get_mut(track)
            .ok_or(Error::StateViolation("track index out of range"))?;
        track.insert(TimedEvent {
            position,
            kind: EventKind::Midi(event),
        });
        Ok(())
    }

    /// Maximum trailing event position across all tracks.
    pub fn length_in_beats(&self) -> f64 {
        self.tracks.iter().map(Track::length).fold(0.0, f64::max)
    }

    pub fn length_in_seconds(&self) -> f64 {
        self.seconds_for_beats(self.length_in_beats())
    }

    pub fn seconds_for_beats(&self, beats: f64) -> f64 {
        beats * 60.0 / self.bpm()
    }

    pub fn beats_for_seconds(&self, seconds: f64) -> f64 {
        seconds * self.bpm() / 60.0
    }
}

// A NaN would sort anywhere and break the ordering of the track.
fn check_position(position: f64) -> Result<()> {
    if position.is_finite() {
        Ok(())
    } else {
        Err(Error::StateViolation("event position must be finite"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn note(note: u8, duration: f64) -> NoteMessage {
        NoteMessage {
            channel: 0,
            note,
            velocity: 100,
            release_velocity: 0,
            duration,
        }
    }

    #[test]
    fn test_insert_keeps_positions_ordered() {
        let mut track = Track::new();
        track.add_note(2.0, note(62, 1.0));
        track.add_note(0.0, note(60, 1.0));
        track.add_note(1.0, note(61, 1.0));
        track.add_note(1.0, note(64, 1.0));

        let positions: Vec<f64> = track.events().iter().map(|e| e.position).collect();
        assert_eq!(positions, vec![0.0, 1.0, 1.0, 2.0]);
        // equal positions keep insertion order
        assert_eq!(track.events()[2].kind, EventKind::Note(note(64, 1.0)));
    }

    #[test]
    fn test_length_is_max_trailing_position() {
        let mut sequence = Sequence::new();
        let first = sequence.add_track();
        let second = sequence.add_track();
        sequence.add_note(first, 0.0, note(60, 1.0)).unwrap();
        sequence.add_note(first, 2.0, note(62, 0.5)).unwrap();
        sequence.add_note(second, 3.0, note(64, 1.0)).unwrap();

        assert_relative_eq!(sequence.length_in_beats(), 4.0);
        assert_relative_eq!(sequence.length_in_seconds(), 2.0);
    }

    #[test]
    fn test_end_marker_excluded_from_length() {
        let mut track = Track::new();
        track.add_note(0.0, note(60, 1.0));
        track.insert(TimedEvent {
            position: 8.0,
            kind: EventKind::EndMarker,
        });
        assert_relative_eq!(track.length(), 1.0);

        track.remove_end_markers();
        assert_eq!(track.events().len(), 1);
    }

    #[test]
    fn test_tempo_defaults_and_overrides() {
        let mut sequence = Sequence::new();
        assert_relative_eq!(sequence.bpm(), DEFAULT_BPM);

        sequence.set_tempo(90.0);
        sequence.set_tempo(60.0);
        assert_relative_eq!(sequence.bpm(), 60.0);
        assert_eq!(sequence.tempo_track().events().len(), 1);
        assert_relative_eq!(sequence.beats_for_seconds(3.0), 3.0);
    }

    #[test]
    fn test_add_note_to_missing_track() {
        let mut sequence = Sequence::new();
        assert!(matches!(
            sequence.add_note(0, 0.0, note(60, 1.0)),
            Err(Error::StateViolation(_))
        ));
    }

    #[test]
    fn test_non_finite_positions_rejected() {
        let mut sequence = Sequence::new();
        let track = sequence.add_track();
        sequence.add_note(track, 1.0, note(60, 1.0)).unwrap();

        assert!(matches!(
            sequence.add_note(track, f64::NAN, note(61, 1.0)),
            Err(Error::StateViolation(_))
        ));
        assert!(matches!(
            sequence.add_note(track, 0.0, note(62, f64::INFINITY)),
            Err(Error::StateViolation(_))
        ));
        assert!(matches!(
            sequence.add_midi_event(
                track,
                f64::NEG_INFINITY,
                MidiEvent::ProgramChange {
                    channel: 0,
                    program: 5
                }
            ),
            Err(Error::StateViolation(_))
        ));
        assert_eq!(sequence.tracks()[0].events().len(), 1);
    }
}
