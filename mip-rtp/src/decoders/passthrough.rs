//! Payloads handed on without interpretation

use super::{DecodeError, DecodedMessage, RtpPacketDecoder};
use crate::packet::RtpPacket;
use crate::reassembly::ReassembledFrame;
use mip_core::{AudioEncoding, EncodedAudio, EncodedVideo, MediaTime, Message, VideoEncoding};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Audio { channels: u16 },
    Video,
}

/// Emits payloads as opaque encoded audio or video messages
#[derive(Debug, Clone)]
pub struct PassthroughDecoder {
    clock_rate: u32,
    kind: Kind,
}

impl PassthroughDecoder {
    /// One message per packet, timed with a fixed clock
    pub fn audio(clock_rate: u32, channels: u16) -> Self {
        PassthroughDecoder {
            clock_rate,
            kind: Kind::Audio { channels },
        }
    }

    /// One message per reassembled frame, 90 kHz clock
    pub fn video() -> Self {
        PassthroughDecoder {
            clock_rate: super::H263_CLOCK_RATE,
            kind: Kind::Video,
        }
    }
}

impl RtpPacketDecoder for PassthroughDecoder {
    fn validate_packet(
        &mut self,
        packet: &RtpPacket,
        estimate: Option<f64>,
    ) -> Result<Option<f64>, DecodeError> {
        if packet.payload.is_empty() {
            return Err(DecodeError::TooShort {
                expected: 1,
                actual: 0,
            });
        }
        if self.clock_rate == 0 {
            // Rely on sender reports for the unit
            return Ok(estimate);
        }
        Ok(Some(1.0 / self.clock_rate as f64))
    }

    fn needs_reassembly(&self) -> bool {
        self.kind == Kind::Video
    }

    fn create_new_messages(&mut self, frame: &ReassembledFrame, out: &mut Vec<DecodedMessage>) {
        let payload = frame.concat();
        let message = match self.kind {
            Kind::Audio { channels } => Message::AudioEncoded(EncodedAudio {
                encoding: AudioEncoding::Opaque,
                sample_rate: self.clock_rate,
                channels,
                payload,
                time: MediaTime::ZERO,
                source_id: 0,
            }),
            Kind::Video => Message::VideoEncoded(EncodedVideo {
                encoding: VideoEncoding::Opaque,
                payload,
                time: MediaTime::ZERO,
                source_id: 0,
            }),
        };
        out.push(DecodedMessage {
            message,
            timestamp: frame.timestamp,
        });
    }
}
