//! H.263 payload format (RFC 4629)
//!
//! Every packet starts with a 16-bit payload header:
//!
//! ```text
//!  0                   1
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |   RR    |P|V|   PLEN    |PEBIT|
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! With P set, the two zero bytes opening a picture or GOB start code are
//! omitted from the packet and must be restored.

use super::{DecodeError, DecodedMessage, RtpPacketDecoder};
use crate::packet::RtpPacket;
use crate::reassembly::ReassembledFrame;
use bytes::{BufMut, Bytes, BytesMut};
use mip_core::{EncodedVideo, MediaTime, Message, VideoEncoding};

/// RTP clock of all video payload formats
pub const H263_CLOCK_RATE: u32 = 90_000;

const HEADER_SIZE: usize = 2;
const P_BIT: u8 = 0x04;
const V_BIT: u8 = 0x02;

struct PayloadHeader {
    picture_start: bool,
    /// Offset of the bitstream data
    data_offset: usize,
}

fn parse_header(payload: &[u8]) -> Result<PayloadHeader, DecodeError> {
    if payload.len() < HEADER_SIZE {
        return Err(DecodeError::TooShort {
            expected: HEADER_SIZE,
            actual: payload.len(),
        });
    }
    let plen = (((payload[0] & 0x01) << 5) | (payload[1] >> 3)) as usize;
    let vrc = usize::from(payload[0] & V_BIT != 0);
    let data_offset = HEADER_SIZE + vrc + plen;
    if payload.len() < data_offset {
        return Err(DecodeError::TooShort {
            expected: data_offset,
            actual: payload.len(),
        });
    }
    Ok(PayloadHeader {
        picture_start: payload[0] & P_BIT != 0,
        data_offset,
    })
}

/// Depacketizes H.263 pictures from reassembled frames
#[derive(Debug, Clone, Default)]
pub struct H263Decoder;

impl H263Decoder {
    pub fn new() -> Self {
        H263Decoder
    }
}

impl RtpPacketDecoder for H263Decoder {
    fn validate_packet(
        &mut self,
        packet: &RtpPacket,
        _estimate: Option<f64>,
    ) -> Result<Option<f64>, DecodeError> {
        parse_header(&packet.payload)?;
        Ok(Some(1.0 / H263_CLOCK_RATE as f64))
    }

    fn needs_reassembly(&self) -> bool {
        true
    }

    fn is_first_fragment(&self, packet: &RtpPacket) -> bool {
        match parse_header(&packet.payload) {
            // Picture start code: 0000 0000 0000 0000 1000 00
            Ok(header) => {
                header.picture_start
                    && packet
                        .payload
                        .get(header.data_offset)
                        .is_some_and(|byte| byte & 0xFC == 0x80)
            }
            Err(_) => false,
        }
    }

    fn create_new_messages(&mut self, frame: &ReassembledFrame, out: &mut Vec<DecodedMessage>) {
        let mut picture = BytesMut::with_capacity(frame.payload_len() + 2);
        for fragment in &frame.fragments {
            let Ok(header) = parse_header(&fragment.payload) else {
                tracing::debug!(sequence = fragment.sequence, "dropping corrupt H.263 frame");
                return;
            };
            if header.picture_start {
                picture.put_bytes(0, 2);
            }
            picture.put_slice(&fragment.payload[header.data_offset..]);
        }

        out.push(DecodedMessage {
            message: Message::VideoEncoded(EncodedVideo {
                encoding: VideoEncoding::H263,
                payload: picture.freeze(),
                time: MediaTime::ZERO,
                source_id: 0,
            }),
            timestamp: frame.timestamp,
        });
    }
}

/// Split an H.263 picture into RFC 4629 payloads of at most `max_payload` bytes
pub fn packetize_h263(picture: &[u8], max_payload: usize) -> Vec<Bytes> {
    let chunk = max_payload.saturating_sub(HEADER_SIZE).max(1);
    let (mut rest, mut picture_start) = match picture {
        [0, 0, tail @ ..] => (tail, true),
        _ => (picture, false),
    };

    let mut payloads = Vec::with_capacity(rest.len() / chunk + 1);
    loop {
        let take = rest.len().min(chunk);
        let mut payload = BytesMut::with_capacity(HEADER_SIZE + take);
        payload.put_u8(if picture_start { P_BIT } else { 0 });
        payload.put_u8(0);
        payload.put_slice(&rest[..take]);
        payloads.push(payload.freeze());

        rest = &rest[take..];
        picture_start = false;
        if rest.is_empty() {
            break;
        }
    }
    payloads
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reassembly::Fragment;

    const PICTURE: [u8; 10] = [0x00, 0x00, 0x80, 0x02, 0x1C, 0x11, 0x22, 0x33, 0x44, 0x55];

    fn fragments(payloads: &[Bytes]) -> ReassembledFrame {
        ReassembledFrame {
            timestamp: 9000,
            fragments: payloads
                .iter()
                .enumerate()
                .map(|(i, payload)| Fragment {
                    sequence: i as u64,
                    payload: payload.clone(),
                    received_at: MediaTime::ZERO,
                    marker: i + 1 == payloads.len(),
                    first: i == 0,
                })
                .collect(),
        }
    }

    #[test]
    fn test_packetize_and_depacketize() {
        let payloads = packetize_h263(&PICTURE, 5);
        assert_eq!(payloads.len(), 3);
        assert_eq!(payloads[0][0], P_BIT);
        assert_eq!(&payloads[0][2..], &[0x80, 0x02, 0x1C]);
        assert_eq!(payloads[1][0], 0);

        let mut decoder = H263Decoder::new();
        let first = RtpPacket::new(34, 0, 9000, 1, payloads[0].clone());
        assert!(decoder.is_first_fragment(&first));
        let second = RtpPacket::new(34, 1, 9000, 1, payloads[1].clone());
        assert!(!decoder.is_first_fragment(&second));
        assert_eq!(
            decoder.validate_packet(&first, None),
            Ok(Some(1.0 / 90000.0))
        );

        let mut out = Vec::new();
        decoder.create_new_messages(&fragments(&payloads), &mut out);
        let Message::VideoEncoded(video) = &out[0].message else {
            panic!("expected encoded video");
        };
        assert_eq!(&video.payload[..], &PICTURE[..]);
        assert_eq!(out[0].timestamp, 9000);
    }

    #[test]
    fn test_header_lengths() {
        // V bit plus three bytes of picture header
        let payload = Bytes::from_static(&[V_BIT, 3 << 3, 0xAA, 1, 2, 3, 0x99]);
        let header = parse_header(&payload).unwrap();
        assert_eq!(header.data_offset, 6);

        let mut decoder = H263Decoder::new();
        let short = RtpPacket::new(34, 0, 0, 1, Bytes::from_static(&[V_BIT, 3 << 3, 0]));
        assert!(decoder.validate_packet(&short, None).is_err());
    }
}
