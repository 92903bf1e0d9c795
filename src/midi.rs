//! MIDI message decoding
//!
//! Turns raw bytes received from a hardware port into a structured [`Message`].
//! Decoding is pure and total: any byte sequence yields a message, reserved or
//! malformed input decodes to [`MessageKind::Unknown`] instead of failing.

use serde::Serialize;
use std::fmt;

/// Message category selected by the status byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageKind {
    NoteOn,
    NoteOff,
    ControlChange,
    ProgramChange,
    PitchBend,
    /// Polyphonic key pressure (0xA0)
    Aftertouch,
    ChannelPressure,
    /// System common / real-time (0xF0-0xFF, reserved values excluded)
    System,
    Unknown,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::NoteOn => "noteOn",
            MessageKind::NoteOff => "noteOff",
            MessageKind::ControlChange => "controlChange",
            MessageKind::ProgramChange => "programChange",
            MessageKind::PitchBend => "pitchBend",
            MessageKind::Aftertouch => "aftertouch",
            MessageKind::ChannelPressure => "channelPressure",
            MessageKind::System => "system",
            MessageKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Type-specific payload of a decoded message
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum MessageData {
    /// Note On / Note Off: note (0-127), velocity (0-127)
    #[serde(rename_all = "camelCase")]
    Note {
        note: u8,
        velocity: u8,
        was_converted_from_note_on: bool,
    },

    /// Polyphonic key pressure: note (0-127), pressure (0-127)
    Aftertouch { note: u8, pressure: u8 },

    /// Control Change: controller (0-127), value (0-127)
    ControlChange { controller: u8, value: u8 },

    /// Program Change: program (0-127)
    ProgramChange { program: u8 },

    /// Channel Pressure: pressure (0-127)
    ChannelPressure { pressure: u8 },

    /// Pitch Bend: 14-bit value (0-16383) and signed percentage around center
    PitchBend { value: u16, percent: f32 },

    /// System message, identified by its full status byte
    System { status: u8 },

    None,
}

/// Decoded MIDI message from a device
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub kind: MessageKind,
    /// 1-16 for channel messages
    pub channel: Option<u8>,
    pub raw: Vec<u8>,
    pub data: MessageData,
    /// Host timestamp in microseconds
    pub timestamp: u64,
    pub device_id: String,
}

/// Decode raw MIDI bytes received from `device_id`.
///
/// Missing data bytes read as zero and data bytes are masked to 7 bits, so
/// truncated or noisy input still produces a well-formed message.
pub fn decode(raw: &[u8], device_id: &str, timestamp: u64) -> Message {
    let status = raw.first().copied().unwrap_or(0);
    let data1 = raw.get(1).map(|b| b & 0x7F).unwrap_or(0);
    let data2 = raw.get(2).map(|b| b & 0x7F).unwrap_or(0);

    let (kind, channel, data) = if raw.is_empty() || status < 0x80 {
        // Running status needs per-port state; a lone data byte is not decodable
        (MessageKind::Unknown, None, MessageData::None)
    } else if status >= 0xF0 {
        match status {
            0xF4 | 0xF5 | 0xF9 | 0xFD => (MessageKind::Unknown, None, MessageData::None),
            _ => (MessageKind::System, None, MessageData::System { status }),
        }
    } else {
        let channel = Some((status & 0x0F) + 1);
        match status & 0xF0 {
            0x80 => (
                MessageKind::NoteOff,
                channel,
                MessageData::Note {
                    note: data1,
                    velocity: data2,
                    was_converted_from_note_on: false,
                },
            ),
            0x90 if data2 == 0 => (
                MessageKind::NoteOff,
                channel,
                MessageData::Note {
                    note: data1,
                    velocity: 0,
                    was_converted_from_note_on: true,
                },
            ),
            0x90 => (
                MessageKind::NoteOn,
                channel,
                MessageData::Note {
                    note: data1,
                    velocity: data2,
                    was_converted_from_note_on: false,
                },
            ),
            0xA0 => (
                MessageKind::Aftertouch,
                channel,
                MessageData::Aftertouch {
                    note: data1,
                    pressure: data2,
                },
            ),
            0xB0 => (
                MessageKind::ControlChange,
                channel,
                MessageData::ControlChange {
                    controller: data1,
                    value: data2,
                },
            ),
            0xC0 => (
                MessageKind::ProgramChange,
                channel,
                MessageData::ProgramChange { program: data1 },
            ),
            0xD0 => (
                MessageKind::ChannelPressure,
                channel,
                MessageData::ChannelPressure { pressure: data1 },
            ),
            _ => {
                let value = convert::combine_14bit(data1, data2);
                (
                    MessageKind::PitchBend,
                    channel,
                    MessageData::PitchBend {
                        value,
                        percent: convert::pitch_bend_percent(value),
                    },
                )
            }
        }
    };

    Message {
        kind,
        channel,
        raw: raw.to_vec(),
        data,
        timestamp,
        device_id: device_id.to_string(),
    }
}

impl Message {
    pub fn note(&self) -> Option<u8> {
        match self.data {
            MessageData::Note { note, .. } | MessageData::Aftertouch { note, .. } => Some(note),
            _ => None,
        }
    }

    pub fn velocity(&self) -> Option<u8> {
        match self.data {
            MessageData::Note { velocity, .. } => Some(velocity),
            _ => None,
        }
    }

    pub fn was_converted_from_note_on(&self) -> bool {
        matches!(
            self.data,
            MessageData::Note {
                was_converted_from_note_on: true,
                ..
            }
        )
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ch = self.channel.unwrap_or(0);
        match self.data {
            MessageData::Note { note, velocity, .. } => {
                write!(f, "{} ch:{} n:{} v:{}", self.kind, ch, note, velocity)
            }
            MessageData::Aftertouch { note, pressure } => {
                write!(f, "Aftertouch ch:{} n:{} p:{}", ch, note, pressure)
            }
            MessageData::ControlChange { controller, value } => {
                write!(f, "CC ch:{} cc:{} v:{}", ch, controller, value)
            }
            MessageData::ProgramChange { program } => {
                write!(f, "ProgramChange ch:{} p:{}", ch, program)
            }
            MessageData::ChannelPressure { pressure } => {
                write!(f, "ChannelPressure ch:{} p:{}", ch, pressure)
            }
            MessageData::PitchBend { value, percent } => {
                write!(f, "PitchBend ch:{} v:{} ({:+.1}%)", ch, value, percent)
            }
            MessageData::System { status } => write!(f, "System {:02X}", status),
            MessageData::None => write!(f, "Unknown [{}]", format_hex(&self.raw)),
        }
    }
}

/// MIDI value conversion utilities
pub mod convert {
    /// Pitch bend center value
    pub const PITCH_BEND_CENTER: u16 = 8192;

    /// Combine two 7-bit data bytes into a 14-bit value
    pub fn combine_14bit(lsb: u8, msb: u8) -> u16 {
        (((msb & 0x7F) as u16) << 7) | (lsb & 0x7F) as u16
    }

    /// Split a 14-bit value into (lsb, msb) 7-bit data bytes
    pub fn split_14bit(value: u16) -> (u8, u8) {
        ((value & 0x7F) as u8, ((value >> 7) & 0x7F) as u8)
    }

    /// Re-center a 14-bit pitch bend value to a signed percentage (-100..~+100)
    pub fn pitch_bend_percent(value: u16) -> f32 {
        (value as f32 - PITCH_BEND_CENTER as f32) * 100.0 / PITCH_BEND_CENTER as f32
    }
}

/// Format MIDI bytes as hex string for debugging
pub fn format_hex(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_note_on_parsing() {
        let msg = decode(&[0x90, 60, 100], "dev", 0);

        assert_eq!(msg.kind, MessageKind::NoteOn);
        assert_eq!(msg.channel, Some(1));
        assert_eq!(msg.note(), Some(60));
        assert_eq!(msg.velocity(), Some(100));
        assert!(!msg.was_converted_from_note_on());
    }

    #[test]
    fn test_note_on_velocity_zero() {
        let msg = decode(&[0x90, 60, 0], "dev", 0);

        assert_eq!(msg.kind, MessageKind::NoteOff);
        assert_eq!(msg.channel, Some(1));
        assert_eq!(
            msg.data,
            MessageData::Note {
                note: 60,
                velocity: 0,
                was_converted_from_note_on: true,
            }
        );
    }

    #[test]
    fn test_explicit_note_off_not_flagged() {
        let msg = decode(&[0x83, 64, 20], "dev", 0);
        assert_eq!(msg.kind, MessageKind::NoteOff);
        assert_eq!(msg.channel, Some(4));
        assert!(!msg.was_converted_from_note_on());
    }

    #[test]
    fn test_control_change() {
        let msg = decode(&[0xB2, 7, 100], "dev", 0);
        assert_eq!(msg.kind, MessageKind::ControlChange);
        assert_eq!(msg.channel, Some(3));
        assert_eq!(
            msg.data,
            MessageData::ControlChange {
                controller: 7,
                value: 100
            }
        );
    }

    #[test]
    fn test_program_change_and_pressure() {
        let msg = decode(&[0xCF, 12], "dev", 0);
        assert_eq!(msg.kind, MessageKind::ProgramChange);
        assert_eq!(msg.channel, Some(16));
        assert_eq!(msg.data, MessageData::ProgramChange { program: 12 });

        let msg = decode(&[0xD0, 90], "dev", 0);
        assert_eq!(msg.data, MessageData::ChannelPressure { pressure: 90 });

        let msg = decode(&[0xA1, 60, 33], "dev", 0);
        assert_eq!(msg.kind, MessageKind::Aftertouch);
        assert_eq!(msg.note(), Some(60));
    }

    #[test]
    fn test_pitch_bend_center() {
        let msg = decode(&[0xE0, 0, 64], "dev", 0);
        assert_eq!(msg.kind, MessageKind::PitchBend);
        assert_eq!(
            msg.data,
            MessageData::PitchBend {
                value: 8192,
                percent: 0.0
            }
        );
    }

    #[test]
    fn test_pitch_bend_extremes() {
        assert_eq!(convert::pitch_bend_percent(0), -100.0);
        assert!(convert::pitch_bend_percent(16383) > 99.9);
    }

    #[test]
    fn test_system_and_reserved() {
        assert_eq!(decode(&[0xF8], "dev", 0).kind, MessageKind::System);
        assert_eq!(decode(&[0xF8], "dev", 0).channel, None);
        assert_eq!(decode(&[0xF4], "dev", 0).kind, MessageKind::Unknown);
        assert_eq!(decode(&[0xFD], "dev", 0).kind, MessageKind::Unknown);
        assert_eq!(decode(&[0x40, 1], "dev", 0).kind, MessageKind::Unknown);
        assert_eq!(decode(&[], "dev", 0).kind, MessageKind::Unknown);
    }

    #[test]
    fn test_truncated_message_still_decodes() {
        let msg = decode(&[0x91], "dev", 0);
        assert_eq!(msg.kind, MessageKind::NoteOff);
        assert_eq!(msg.channel, Some(2));
    }

    #[test]
    fn test_decode_is_total_over_status_bytes() {
        for status in 0u8..=255 {
            let msg = decode(&[status, 0x40, 0x40], "dev", 7);
            assert_eq!(msg.raw, vec![status, 0x40, 0x40]);
            assert_eq!(msg.device_id, "dev");
            assert_eq!(msg.timestamp, 7);
            match status {
                0x80..=0xEF => {
                    assert_eq!(msg.channel, Some((status & 0x0F) + 1));
                    assert_ne!(msg.kind, MessageKind::Unknown);
                }
                _ => assert_eq!(msg.channel, None),
            }
        }
    }

    #[test]
    fn test_pitch_bend_reconstructs_every_value() {
        for value in 0u16..=16383 {
            let (lsb, msb) = convert::split_14bit(value);
            let msg = decode(&[0xE5, lsb, msb], "dev", 0);
            match msg.data {
                MessageData::PitchBend { value: decoded, .. } => assert_eq!(decoded, value),
                other => panic!("unexpected payload {:?}", other),
            }
        }
    }

    #[test]
    fn test_format_hex() {
        assert_eq!(format_hex(&[0x90, 0x3C, 0x00]), "90 3C 00");
    }

    proptest! {
        #[test]
        fn decode_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..8)) {
            let msg = decode(&bytes, "dev", 0);
            prop_assert_eq!(msg.raw, bytes);
        }

        #[test]
        fn note_on_velocity_zero_is_note_off(channel in 0u8..16, note in 0u8..128) {
            let msg = decode(&[0x90 | channel, note, 0], "dev", 0);
            prop_assert_eq!(msg.kind, MessageKind::NoteOff);
            prop_assert!(msg.was_converted_from_note_on());
            prop_assert_eq!(msg.channel, Some(channel + 1));
        }
    }
}
