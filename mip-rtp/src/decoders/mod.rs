//! Payload-specific packet decoders
//!
//! A decoder validates packets of one payload type, tells the timing layer
//! how long a timestamp tick is, and turns complete frames into media
//! messages. Decoders are registered per payload type in a
//! [`DecoderRegistry`].

mod h263;
mod l16;
mod passthrough;

pub use h263::{packetize_h263, H263Decoder, H263_CLOCK_RATE};
pub use l16::{encode_l16, L16Decoder};
pub use passthrough::PassthroughDecoder;

use crate::packet::RtpPacket;
use crate::reassembly::ReassembledFrame;
use mip_core::Message;
use thiserror::Error;

/// Why a packet was refused
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Payload too short: need {expected} bytes, got {actual}")]
    TooShort { expected: usize, actual: usize },

    #[error("Payload of {len} bytes is not a multiple of the {frame}-byte sample frame")]
    Misaligned { len: usize, frame: usize },

    #[error("Unsupported payload: {0}")]
    Unsupported(&'static str),
}

/// A message produced from a frame, with the RTP timestamp it plays at
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedMessage {
    pub message: Message,
    pub timestamp: u32,
}

/// Decoder plugin for one RTP payload format
pub trait RtpPacketDecoder: Send {
    /// Check a packet before it enters timing and reassembly
    ///
    /// `estimate` is the timestamp unit derived from sender reports, if any.
    /// Returns the timestamp unit (seconds per tick) when the format defines
    /// one.
    fn validate_packet(
        &mut self,
        packet: &RtpPacket,
        estimate: Option<f64>,
    ) -> Result<Option<f64>, DecodeError>;

    /// Packets must go through the fragment reassembler
    fn needs_reassembly(&self) -> bool {
        false
    }

    /// The packet starts a frame
    fn is_first_fragment(&self, _packet: &RtpPacket) -> bool {
        false
    }

    /// Turn a complete frame into messages
    ///
    /// Messages come back unstamped; the caller fills in playout time and
    /// source id.
    fn create_new_messages(&mut self, frame: &ReassembledFrame, out: &mut Vec<DecodedMessage>);
}

/// Decoders by payload type
pub struct DecoderRegistry {
    decoders: Vec<Option<Box<dyn RtpPacketDecoder>>>,
    default: Option<Box<dyn RtpPacketDecoder>>,
}

impl DecoderRegistry {
    pub fn new() -> Self {
        DecoderRegistry {
            decoders: (0..=u8::MAX).map(|_| None).collect(),
            default: None,
        }
    }

    /// Install `decoder` for `payload_type`, replacing any previous one
    pub fn register(&mut self, payload_type: u8, decoder: Box<dyn RtpPacketDecoder>) {
        self.decoders[payload_type as usize] = Some(decoder);
    }

    pub fn unregister(&mut self, payload_type: u8) -> Option<Box<dyn RtpPacketDecoder>> {
        self.decoders[payload_type as usize].take()
    }

    /// Decoder for payload types without their own entry
    pub fn set_default(&mut self, decoder: Option<Box<dyn RtpPacketDecoder>>) {
        self.default = decoder;
    }

    pub fn get_mut(&mut self, payload_type: u8) -> Option<&mut (dyn RtpPacketDecoder + 'static)> {
        match self.decoders[payload_type as usize].as_deref_mut() {
            Some(decoder) => Some(decoder),
            None => self.default.as_deref_mut(),
        }
    }

    pub fn contains(&self, payload_type: u8) -> bool {
        self.decoders[payload_type as usize].is_some() || self.default.is_some()
    }
}

impl Default for DecoderRegistry {
    fn default() -> Self {
        Self::new()
    }
}
