//! MIDI protocol constants and the wire codec.
//!
//! This module decodes and encodes the channel voice messages exchanged
//! with virtual endpoints. These follow the standard MIDI 1.0 specification:
//! the high nibble of the status byte selects the message family, the low
//! nibble the channel.

/// Note Off - key released
pub const NOTE_OFF: u8 = 0x80;

/// Note On - key pressed (velocity 0 is passed through unchanged)
pub const NOTE_ON: u8 = 0x90;

/// Polyphonic Key Pressure (per-note aftertouch)
pub const POLY_AFTERTOUCH: u8 = 0xA0;

/// Control Change
pub const CONTROL_CHANGE: u8 = 0xB0;

/// Program Change - one data byte
pub const PROGRAM_CHANGE: u8 = 0xC0;

/// Channel Pressure (channel aftertouch) - one data byte
pub const CHANNEL_AFTERTOUCH: u8 = 0xD0;

/// Pitch Bend Change - 14-bit value split into lsb/msb
pub const PITCH_BEND: u8 = 0xE0;

/// System Exclusive start
pub const SYSEX_START: u8 = 0xF0;

/// System Exclusive end
pub const SYSEX_END: u8 = 0xF7;

/// Percussion channel, 1-based as printed on instruments.
pub const DRUM_CHANNEL: u8 = 10;

/// Sustain (damper) pedal controller number
pub const SUSTAIN_PEDAL: u8 = 64;

/// A decoded channel message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MidiEvent {
    NoteOn { channel: u8, note: u8, velocity: u8 },
    NoteOff { channel: u8, note: u8, velocity: u8 },
    PolyAftertouch { channel: u8, note: u8, pressure: u8 },
    ControlChange { channel: u8, controller: u8, value: u8 },
    ProgramChange { channel: u8, program: u8 },
    ChannelAftertouch { channel: u8, pressure: u8 },
    PitchBend { channel: u8, lsb: u8, msb: u8 },
    /// Anything outside the channel voice families (system messages,
    /// stray data bytes).
    Unknown { raw_status: u8 },
}

impl MidiEvent {
    /// Decode a status byte and its two data bytes.
    ///
    /// Total over every byte triple. One-data-byte families ignore `d2`.
    pub fn decode(status: u8, d1: u8, d2: u8) -> Self {
        let channel = status & 0x0F;
        match status & 0xF0 {
            NOTE_OFF => MidiEvent::NoteOff {
                channel,
                note: d1,
                velocity: d2,
            },
            NOTE_ON => MidiEvent::NoteOn {
                channel,
                note: d1,
                velocity: d2,
            },
            POLY_AFTERTOUCH => MidiEvent::PolyAftertouch {
                channel,
                note: d1,
                pressure: d2,
            },
            CONTROL_CHANGE => MidiEvent::ControlChange {
                channel,
                controller: d1,
                value: d2,
            },
            PROGRAM_CHANGE => MidiEvent::ProgramChange {
                channel,
                program: d1,
            },
            CHANNEL_AFTERTOUCH => MidiEvent::ChannelAftertouch {
                channel,
                pressure: d1,
            },
            PITCH_BEND => MidiEvent::PitchBend {
                channel,
                lsb: d1,
                msb: d2,
            },
            _ => MidiEvent::Unknown { raw_status: status },
        }
    }

    /// Decode a raw message slice. Missing data bytes read as 0.
    pub fn from_bytes(message: &[u8]) -> Option<Self> {
        let status = *message.first()?;
        let d1 = message.get(1).copied().unwrap_or(0);
        let d2 = message.get(2).copied().unwrap_or(0);
        Some(Self::decode(status, d1, d2))
    }

    /// Encode back to `(status, d1, d2)`.
    ///
    /// One-data-byte families report `d2 = 0`; `Unknown` reports its raw
    /// status with zeroed data.
    pub fn encode(&self) -> (u8, u8, u8) {
        match *self {
            MidiEvent::NoteOff {
                channel,
                note,
                velocity,
            } => (NOTE_OFF | (channel & 0x0F), note, velocity),
            MidiEvent::NoteOn {
                channel,
                note,
                velocity,
            } => (NOTE_ON | (channel & 0x0F), note, velocity),
            MidiEvent::PolyAftertouch {
                channel,
                note,
                pressure,
            } => (POLY_AFTERTOUCH | (channel & 0x0F), note, pressure),
            MidiEvent::ControlChange {
                channel,
                controller,
                value,
            } => (CONTROL_CHANGE | (channel & 0x0F), controller, value),
            MidiEvent::ProgramChange { channel, program } => {
                (PROGRAM_CHANGE | (channel & 0x0F), program, 0)
            }
            MidiEvent::ChannelAftertouch { channel, pressure } => {
                (CHANNEL_AFTERTOUCH | (channel & 0x0F), pressure, 0)
            }
            MidiEvent::PitchBend { channel, lsb, msb } => {
                (PITCH_BEND | (channel & 0x0F), lsb, msb)
            }
            MidiEvent::Unknown { raw_status } => (raw_status, 0, 0),
        }
    }

    /// Encode to the wire bytes, sized by the message family.
    pub fn to_bytes(&self) -> Vec<u8> {
        let (status, d1, d2) = self.encode();
        match message_len(status) {
            3 => vec![status, d1, d2],
            2 => vec![status, d1],
            _ => vec![status],
        }
    }

    /// Channel 0-15, or `None` for `Unknown`.
    pub fn channel(&self) -> Option<u8> {
        match *self {
            MidiEvent::NoteOn { channel, .. }
            | MidiEvent::NoteOff { channel, .. }
            | MidiEvent::PolyAftertouch { channel, .. }
            | MidiEvent::ControlChange { channel, .. }
            | MidiEvent::ProgramChange { channel, .. }
            | MidiEvent::ChannelAftertouch { channel, .. }
            | MidiEvent::PitchBend { channel, .. } => Some(channel),
            MidiEvent::Unknown { .. } => None,
        }
    }

    /// Status high nibble (`status & 0xF0`).
    pub fn family(&self) -> u8 {
        self.encode().0 & 0xF0
    }
}

/// Decode `(status, d1, d2)` into a [`MidiEvent`].
pub fn decode(status: u8, d1: u8, d2: u8) -> MidiEvent {
    MidiEvent::decode(status, d1, d2)
}

/// Encode a [`MidiEvent`] into `(status, d1, d2)`.
pub fn encode(event: &MidiEvent) -> (u8, u8, u8) {
    event.encode()
}

/// Length in bytes of a message starting with `status`.
///
/// System exclusive is variable-length and reports 0; callers scan for
/// [`SYSEX_END`] instead.
pub fn message_len(status: u8) -> usize {
    match status & 0xF0 {
        NOTE_OFF | NOTE_ON | POLY_AFTERTOUCH | CONTROL_CHANGE | PITCH_BEND => 3,
        PROGRAM_CHANGE | CHANNEL_AFTERTOUCH => 2,
        0xF0 => match status {
            SYSEX_START => 0,
            0xF1 | 0xF3 => 2,
            0xF2 => 3,
            _ => 1,
        },
        // data byte in status position
        _ => 1,
    }
}

/// Iterator over the individual messages packed into one packet.
pub struct SplitMessages<'a> {
    bytes: &'a [u8],
}

/// Split a packet's data into individual messages.
///
/// Stray data bytes where a status byte is expected are skipped. A
/// truncated trailing message is yielded as-is.
pub fn split_messages(bytes: &[u8]) -> SplitMessages<'_> {
    SplitMessages { bytes }
}

impl<'a> Iterator for SplitMessages<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        let start = self.bytes.iter().position(|b| b & 0x80 != 0)?;
        let rest = &self.bytes[start..];
        let len = match message_len(rest[0]) {
            0 => rest
                .iter()
                .position(|&b| b == SYSEX_END)
                .map(|end| end + 1)
                .unwrap_or(rest.len()),
            n => n.min(rest.len()),
        };
        let (message, remaining) = rest.split_at(len);
        self.bytes = remaining;
        Some(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_is_total_and_preserves_channel() {
        for status in 0u8..=255 {
            let event = decode(status, 60, 100);
            match event {
                MidiEvent::Unknown { raw_status } => {
                    assert_eq!(raw_status, status);
                    assert!(status < 0x80 || status >= 0xF0);
                }
                _ => {
                    assert_eq!(event.channel(), Some(status & 0x0F));
                    assert_eq!(event.family(), status & 0xF0);
                }
            }
        }
    }

    #[test]
    fn test_round_trip_note_and_control_messages() {
        for status in [0x80u8, 0x8F, 0x90, 0x95, 0x9F, 0xB0, 0xB9] {
            for (d1, d2) in [(0u8, 0u8), (60, 100), (127, 127), (64, 0)] {
                assert_eq!(encode(&decode(status, d1, d2)), (status, d1, d2));
            }
        }
    }

    #[test]
    fn test_velocity_zero_note_on_not_normalized() {
        assert_eq!(
            decode(0x90, 60, 0),
            MidiEvent::NoteOn {
                channel: 0,
                note: 60,
                velocity: 0
            }
        );
    }

    #[test]
    fn test_one_data_byte_families_ignore_second_byte() {
        assert_eq!(
            decode(0xC3, 12, 99),
            MidiEvent::ProgramChange {
                channel: 3,
                program: 12
            }
        );
        assert_eq!(
            decode(0xD1, 40, 99),
            MidiEvent::ChannelAftertouch {
                channel: 1,
                pressure: 40
            }
        );
        assert_eq!(
            MidiEvent::ProgramChange {
                channel: 3,
                program: 12
            }
            .to_bytes(),
            vec![0xC3, 12]
        );
    }

    #[test]
    fn test_pitch_bend_keeps_both_bytes() {
        let event = decode(0xE2, 0x00, 0x40);
        assert_eq!(
            event,
            MidiEvent::PitchBend {
                channel: 2,
                lsb: 0,
                msb: 0x40
            }
        );
        assert_eq!(event.to_bytes(), vec![0xE2, 0x00, 0x40]);
    }

    #[test]
    fn test_from_bytes_pads_missing_data() {
        assert_eq!(MidiEvent::from_bytes(&[]), None);
        assert_eq!(
            MidiEvent::from_bytes(&[0x90, 60]),
            Some(MidiEvent::NoteOn {
                channel: 0,
                note: 60,
                velocity: 0
            })
        );
    }

    #[test]
    fn test_split_messages() {
        let packet = [0x90, 60, 100, 0xC0, 5, 0xF8, 0x80, 60, 0];
        let messages: Vec<&[u8]> = split_messages(&packet).collect();
        assert_eq!(
            messages,
            vec![&[0x90, 60, 100][..], &[0xC0, 5][..], &[0xF8][..], &[0x80, 60, 0][..]]
        );
    }

    #[test]
    fn test_split_messages_sysex_and_stray_bytes() {
        let packet = [0x12, 0xF0, 0x7E, 0x01, 0xF7, 0xB0, 64];
        let messages: Vec<&[u8]> = split_messages(&packet).collect();
        assert_eq!(messages, vec![&[0xF0, 0x7E, 0x01, 0xF7][..], &[0xB0, 64][..]]);
    }
}
