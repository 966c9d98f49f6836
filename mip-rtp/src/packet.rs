//! RTP Packet Structures and Serialization
//!
//! Implements the RFC 3550 fixed header (12 bytes), optional CSRC list,
//! header extension and padding. Received packets keep their payload as a
//! slice of the datagram buffer.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// RTP protocol version carried in every packet
pub const RTP_VERSION: u8 = 2;

/// Size of the fixed RTP header in bytes
pub const FIXED_HEADER_SIZE: usize = 12;

/// Payload budget for outgoing packets (keeps datagrams below a 1500 byte MTU)
pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 1200;

/// Maximum number of CSRC entries (4-bit count)
pub const MAX_CSRC_COUNT: usize = 15;

const PADDING_FLAG: u8 = 0x20;
const EXTENSION_FLAG: u8 = 0x10;
const CSRC_COUNT_MASK: u8 = 0x0F;
const MARKER_FLAG: u8 = 0x80;
const PAYLOAD_TYPE_MASK: u8 = 0x7F;

/// Wire format errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RtpError {
    #[error("Insufficient data: expected {expected} bytes, got {actual}")]
    InsufficientData { expected: usize, actual: usize },

    #[error("Unsupported RTP version: {0}")]
    UnsupportedVersion(u8),

    #[error("Invalid padding length: {0}")]
    InvalidPadding(u8),

    #[error("Too many CSRC entries: {0}")]
    TooManyCsrcs(usize),

    #[error("Malformed RTCP packet: {0}")]
    MalformedRtcp(&'static str),
}

/// RTP header extension (RFC 3550 §5.3.1)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderExtension {
    /// Profile-defined identifier
    pub profile: u16,
    /// Extension body, a multiple of 4 bytes
    pub data: Bytes,
}

/// RTP packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacket {
    pub marker: bool,
    pub payload_type: u8,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub csrcs: Vec<u32>,
    pub extension: Option<HeaderExtension>,
    pub payload: Bytes,
}

impl RtpPacket {
    /// Create a packet without CSRCs or extension
    pub fn new(
        payload_type: u8,
        sequence_number: u16,
        timestamp: u32,
        ssrc: u32,
        payload: Bytes,
    ) -> Self {
        RtpPacket {
            marker: false,
            payload_type: payload_type & PAYLOAD_TYPE_MASK,
            sequence_number,
            timestamp,
            ssrc,
            csrcs: Vec::new(),
            extension: None,
            payload,
        }
    }

    /// Set the marker bit
    pub fn with_marker(mut self, marker: bool) -> Self {
        self.marker = marker;
        self
    }

    /// Header length including CSRCs and extension
    pub fn header_size(&self) -> usize {
        let extension = self
            .extension
            .as_ref()
            .map(|ext| 4 + padded_len(ext.data.len()))
            .unwrap_or(0);
        FIXED_HEADER_SIZE + 4 * self.csrcs.len() + extension
    }

    /// Total size of the serialized packet
    pub fn size(&self) -> usize {
        self.header_size() + self.payload.len()
    }

    /// Serialize the packet (network byte order, no padding)
    pub fn to_bytes(&self) -> Result<BytesMut, RtpError> {
        if self.csrcs.len() > MAX_CSRC_COUNT {
            return Err(RtpError::TooManyCsrcs(self.csrcs.len()));
        }

        let mut buf = BytesMut::with_capacity(self.size());
        let mut first = (RTP_VERSION << 6) | self.csrcs.len() as u8;
        if self.extension.is_some() {
            first |= EXTENSION_FLAG;
        }
        let mut second = self.payload_type & PAYLOAD_TYPE_MASK;
        if self.marker {
            second |= MARKER_FLAG;
        }

        buf.put_u8(first);
        buf.put_u8(second);
        buf.put_u16(self.sequence_number);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.ssrc);
        for csrc in &self.csrcs {
            buf.put_u32(*csrc);
        }

        if let Some(ext) = &self.extension {
            let padded = padded_len(ext.data.len());
            buf.put_u16(ext.profile);
            buf.put_u16((padded / 4) as u16);
            buf.put_slice(&ext.data);
            buf.put_bytes(0, padded - ext.data.len());
        }

        buf.put_slice(&self.payload);
        Ok(buf)
    }

    /// Parse a packet; the payload shares the input buffer
    pub fn from_bytes(data: &Bytes) -> Result<Self, RtpError> {
        if data.len() < FIXED_HEADER_SIZE {
            return Err(RtpError::InsufficientData {
                expected: FIXED_HEADER_SIZE,
                actual: data.len(),
            });
        }

        let mut buf = &data[..];
        let first = buf.get_u8();
        let second = buf.get_u8();

        let version = first >> 6;
        if version != RTP_VERSION {
            return Err(RtpError::UnsupportedVersion(version));
        }

        let sequence_number = buf.get_u16();
        let timestamp = buf.get_u32();
        let ssrc = buf.get_u32();

        let csrc_count = (first & CSRC_COUNT_MASK) as usize;
        let mut offset = FIXED_HEADER_SIZE + 4 * csrc_count;
        require(data.len(), offset)?;
        let csrcs = (0..csrc_count).map(|_| buf.get_u32()).collect();

        let extension = if first & EXTENSION_FLAG != 0 {
            require(data.len(), offset + 4)?;
            let profile = buf.get_u16();
            let words = buf.get_u16() as usize;
            let body_start = offset + 4;
            offset = body_start + 4 * words;
            require(data.len(), offset)?;
            Some(HeaderExtension {
                profile,
                data: data.slice(body_start..offset),
            })
        } else {
            None
        };

        let mut end = data.len();
        if first & PADDING_FLAG != 0 {
            let padding = data[end - 1];
            if padding == 0 || padding as usize > end - offset {
                return Err(RtpError::InvalidPadding(padding));
            }
            end -= padding as usize;
        }

        Ok(RtpPacket {
            marker: second & MARKER_FLAG != 0,
            payload_type: second & PAYLOAD_TYPE_MASK,
            sequence_number,
            timestamp,
            ssrc,
            csrcs,
            extension,
            payload: data.slice(offset..end),
        })
    }
}

/// Tell RTCP from RTP on a shared port (RFC 5761 §4)
///
/// RTCP packet types 192-223 occupy the byte where RTP carries marker and
/// payload type; RTP payload types 64-95 are avoided for this reason.
pub fn is_rtcp(data: &[u8]) -> bool {
    data.len() >= 2 && data[0] >> 6 == RTP_VERSION && (192..=223).contains(&data[1])
}

fn require(actual: usize, expected: usize) -> Result<(), RtpError> {
    if actual < expected {
        Err(RtpError::InsufficientData { expected, actual })
    } else {
        Ok(())
    }
}

fn padded_len(len: usize) -> usize {
    (len + 3) & !3
}
