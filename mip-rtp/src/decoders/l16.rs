//! Linear 16-bit PCM (RFC 3551 §4.5.11)

use super::{DecodeError, DecodedMessage, RtpPacketDecoder};
use crate::packet::RtpPacket;
use crate::reassembly::ReassembledFrame;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use mip_core::{AudioFrame, MediaTime, Message};

/// Big-endian signed 16-bit samples to float raw audio
#[derive(Debug, Clone)]
pub struct L16Decoder {
    sample_rate: u32,
    channels: u16,
}

impl L16Decoder {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        L16Decoder {
            sample_rate,
            channels: channels.max(1),
        }
    }

    fn frame_size(&self) -> usize {
        2 * self.channels as usize
    }
}

impl RtpPacketDecoder for L16Decoder {
    fn validate_packet(
        &mut self,
        packet: &RtpPacket,
        _estimate: Option<f64>,
    ) -> Result<Option<f64>, DecodeError> {
        let len = packet.payload.len();
        if len == 0 {
            return Err(DecodeError::TooShort {
                expected: self.frame_size(),
                actual: 0,
            });
        }
        if len % self.frame_size() != 0 {
            return Err(DecodeError::Misaligned {
                len,
                frame: self.frame_size(),
            });
        }
        if self.sample_rate == 0 {
            return Err(DecodeError::Unsupported("zero sample rate"));
        }
        Ok(Some(1.0 / self.sample_rate as f64))
    }

    fn create_new_messages(&mut self, frame: &ReassembledFrame, out: &mut Vec<DecodedMessage>) {
        let payload = frame.concat();
        let mut buf = &payload[..];
        let mut samples = Vec::with_capacity(buf.len() / 2);
        while buf.remaining() >= 2 {
            samples.push(buf.get_i16() as f32 / 32768.0);
        }

        out.push(DecodedMessage {
            message: Message::AudioRaw(AudioFrame {
                sample_rate: self.sample_rate,
                channels: self.channels,
                samples,
                time: MediaTime::ZERO,
                source_id: 0,
            }),
            timestamp: frame.timestamp,
        });
    }
}

/// Float samples to big-endian signed 16-bit
pub fn encode_l16(samples: &[f32]) -> Bytes {
    let mut buf = BytesMut::with_capacity(samples.len() * 2);
    for sample in samples {
        buf.put_i16((sample.clamp(-1.0, 1.0) * 32767.0).round() as i16);
    }
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reassembly::Fragment;

    fn packet(payload: &'static [u8]) -> RtpPacket {
        RtpPacket::new(11, 1, 0, 1, Bytes::from_static(payload))
    }

    #[test]
    fn test_validate() {
        let mut decoder = L16Decoder::new(8000, 2);
        assert_eq!(
            decoder.validate_packet(&packet(&[0, 1, 0, 2]), None),
            Ok(Some(1.0 / 8000.0))
        );
        assert_eq!(
            decoder.validate_packet(&packet(&[0, 1, 0]), None),
            Err(DecodeError::Misaligned { len: 3, frame: 4 })
        );
        assert!(decoder.validate_packet(&packet(&[]), None).is_err());
    }

    #[test]
    fn test_decode_samples() {
        let mut decoder = L16Decoder::new(8000, 1);
        let payload = encode_l16(&[0.0, 0.5, -1.0]);
        let frame = ReassembledFrame::single(
            320,
            Fragment {
                sequence: 1,
                payload,
                received_at: MediaTime::ZERO,
                marker: false,
                first: false,
            },
        );

        let mut out = Vec::new();
        decoder.create_new_messages(&frame, &mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].timestamp, 320);
        let Message::AudioRaw(audio) = &out[0].message else {
            panic!("expected raw audio");
        };
        assert_eq!(audio.samples.len(), 3);
        assert_eq!(audio.samples[0], 0.0);
        assert!((audio.samples[1] - 0.5).abs() < 1e-3);
        assert!((audio.samples[2] + 1.0).abs() < 1e-3);
    }
}
