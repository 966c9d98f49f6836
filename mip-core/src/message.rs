//! Messages flowing through a component chain
//!
//! A message is tagged with a type bit and a subtype bit. Connections carry a
//! pair of masks and only forward messages whose tags intersect both masks.
//! Once a message has been handed to the chain it is shared read-only through
//! [`MessageRef`].

use crate::time::MediaTime;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;

/// Shared, immutable handle to a published message
pub type MessageRef = Arc<Message>;

/// Message type bits
pub mod message_type {
    pub const SYSTEM: u32 = 1 << 0;
    pub const AUDIO_RAW: u32 = 1 << 1;
    pub const AUDIO_ENCODED: u32 = 1 << 2;
    pub const VIDEO_RAW: u32 = 1 << 3;
    pub const VIDEO_ENCODED: u32 = 1 << 4;
    pub const RTP: u32 = 1 << 5;
    pub const ALL: u32 = u32::MAX;
}

/// Subtype bits, interpreted relative to the message type
pub mod subtype {
    // System
    pub const WAIT_TIME: u32 = 1 << 0;
    pub const IS_TIME: u32 = 1 << 1;

    // Raw audio
    pub const AUDIO_FLOAT32: u32 = 1 << 0;

    // Encoded audio
    pub const AUDIO_PCM_S16BE: u32 = 1 << 0;
    pub const AUDIO_OPAQUE: u32 = 1 << 1;

    // Raw video
    pub const VIDEO_YUV420P: u32 = 1 << 0;

    // Encoded video
    pub const VIDEO_H263: u32 = 1 << 0;
    pub const VIDEO_JPEG: u32 = 1 << 1;
    pub const VIDEO_OPAQUE: u32 = 1 << 2;

    // RTP
    pub const RTP_PACKET_IN: u32 = 1 << 0;
    pub const RTP_PACKET_OUT: u32 = 1 << 1;
    pub const RTCP_IN: u32 = 1 << 2;
    pub const RTCP_OUT: u32 = 1 << 3;

    pub const ALL: u32 = u32::MAX;
}

/// Connection filter on message type and subtype
///
/// The default filter propagates nothing; such connections only shape the
/// traversal order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MessageFilter {
    pub type_mask: u32,
    pub subtype_mask: u32,
}

impl MessageFilter {
    /// Forward nothing
    pub const NONE: MessageFilter = MessageFilter {
        type_mask: 0,
        subtype_mask: 0,
    };

    /// Forward everything
    pub const ALL: MessageFilter = MessageFilter {
        type_mask: message_type::ALL,
        subtype_mask: subtype::ALL,
    };

    pub const fn new(type_mask: u32, subtype_mask: u32) -> Self {
        MessageFilter {
            type_mask,
            subtype_mask,
        }
    }

    /// Forward every subtype of the given types
    pub const fn types(type_mask: u32) -> Self {
        MessageFilter {
            type_mask,
            subtype_mask: subtype::ALL,
        }
    }

    /// Check whether a message passes this filter
    #[inline]
    pub fn matches(&self, message: &Message) -> bool {
        (message.message_type() & self.type_mask) != 0
            && (message.subtype() & self.subtype_mask) != 0
    }
}

/// Pacing messages generated by the chain and the chain-start component
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemMessage {
    /// Block until the next tick is due
    WaitTime,
    /// A tick is due now
    IsTime,
}

/// Raw interleaved float audio
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub sample_rate: u32,
    pub channels: u16,
    /// Interleaved samples in `[-1.0, 1.0]`
    pub samples: Vec<f32>,
    pub time: MediaTime,
    pub source_id: u64,
}

impl AudioFrame {
    /// Number of sample frames (samples per channel)
    pub fn frames(&self) -> usize {
        if self.channels == 0 {
            0
        } else {
            self.samples.len() / self.channels as usize
        }
    }

    /// Playing time of this block
    pub fn duration(&self) -> MediaTime {
        if self.sample_rate == 0 {
            return MediaTime::ZERO;
        }
        MediaTime::from_micros(self.frames() as i64 * 1_000_000 / self.sample_rate as i64)
    }
}

/// Encoded audio payload kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioEncoding {
    /// Big-endian signed 16-bit PCM
    PcmS16Be,
    /// Codec-specific payload this library does not interpret
    Opaque,
}

/// Encoded audio block
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedAudio {
    pub encoding: AudioEncoding,
    pub sample_rate: u32,
    pub channels: u16,
    pub payload: Bytes,
    pub time: MediaTime,
    pub source_id: u64,
}

/// Raw planar YUV 4:2:0 picture
#[derive(Debug, Clone, PartialEq)]
pub struct VideoFrame {
    pub width: u32,
    pub height: u32,
    pub data: Bytes,
    pub time: MediaTime,
    pub source_id: u64,
}

/// Encoded video payload kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoEncoding {
    H263,
    Jpeg,
    Opaque,
}

/// One complete encoded picture
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedVideo {
    pub encoding: VideoEncoding,
    pub payload: Bytes,
    pub time: MediaTime,
    pub source_id: u64,
}

/// Direction and protocol of an RTP-layer datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtpKind {
    /// Received RTP packet
    PacketIn,
    /// RTP packet to transmit
    PacketOut,
    /// Received RTCP compound packet
    ControlIn,
    /// RTCP compound packet to transmit
    ControlOut,
}

/// RTP or RTCP datagram travelling between transport and codec components
#[derive(Debug, Clone, PartialEq)]
pub struct RtpDatagram {
    pub kind: RtpKind,
    pub data: Bytes,
    /// Local receive time for inbound datagrams, creation time for outbound ones
    pub time: MediaTime,
    /// Remote peer, when known
    pub peer: Option<SocketAddr>,
}

/// A unit of data flowing through the chain
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    System(SystemMessage),
    AudioRaw(AudioFrame),
    AudioEncoded(EncodedAudio),
    VideoRaw(VideoFrame),
    VideoEncoded(EncodedVideo),
    Rtp(RtpDatagram),
}

impl Message {
    /// Type bit of this message
    pub fn message_type(&self) -> u32 {
        match self {
            Message::System(_) => message_type::SYSTEM,
            Message::AudioRaw(_) => message_type::AUDIO_RAW,
            Message::AudioEncoded(_) => message_type::AUDIO_ENCODED,
            Message::VideoRaw(_) => message_type::VIDEO_RAW,
            Message::VideoEncoded(_) => message_type::VIDEO_ENCODED,
            Message::Rtp(_) => message_type::RTP,
        }
    }

    /// Subtype bit of this message
    pub fn subtype(&self) -> u32 {
        match self {
            Message::System(SystemMessage::WaitTime) => subtype::WAIT_TIME,
            Message::System(SystemMessage::IsTime) => subtype::IS_TIME,
            Message::AudioRaw(_) => subtype::AUDIO_FLOAT32,
            Message::AudioEncoded(audio) => match audio.encoding {
                AudioEncoding::PcmS16Be => subtype::AUDIO_PCM_S16BE,
                AudioEncoding::Opaque => subtype::AUDIO_OPAQUE,
            },
            Message::VideoRaw(_) => subtype::VIDEO_YUV420P,
            Message::VideoEncoded(video) => match video.encoding {
                VideoEncoding::H263 => subtype::VIDEO_H263,
                VideoEncoding::Jpeg => subtype::VIDEO_JPEG,
                VideoEncoding::Opaque => subtype::VIDEO_OPAQUE,
            },
            Message::Rtp(datagram) => match datagram.kind {
                RtpKind::PacketIn => subtype::RTP_PACKET_IN,
                RtpKind::PacketOut => subtype::RTP_PACKET_OUT,
                RtpKind::ControlIn => subtype::RTCP_IN,
                RtpKind::ControlOut => subtype::RTCP_OUT,
            },
        }
    }

    /// Short human-readable kind, used in error reports
    pub fn kind_name(&self) -> &'static str {
        match self {
            Message::System(_) => "system",
            Message::AudioRaw(_) => "raw audio",
            Message::AudioEncoded(_) => "encoded audio",
            Message::VideoRaw(_) => "raw video",
            Message::VideoEncoded(_) => "encoded video",
            Message::Rtp(_) => "rtp",
        }
    }

    /// True for system (pacing) messages
    pub fn is_system(&self) -> bool {
        matches!(self, Message::System(_))
    }

    /// Capture/playout time of a media message
    pub fn time(&self) -> Option<MediaTime> {
        match self {
            Message::System(_) => None,
            Message::AudioRaw(m) => Some(m.time),
            Message::AudioEncoded(m) => Some(m.time),
            Message::VideoRaw(m) => Some(m.time),
            Message::VideoEncoded(m) => Some(m.time),
            Message::Rtp(m) => Some(m.time),
        }
    }

    /// Originating stream of a media message
    pub fn source_id(&self) -> Option<u64> {
        match self {
            Message::AudioRaw(m) => Some(m.source_id),
            Message::AudioEncoded(m) => Some(m.source_id),
            Message::VideoRaw(m) => Some(m.source_id),
            Message::VideoEncoded(m) => Some(m.source_id),
            Message::System(_) | Message::Rtp(_) => None,
        }
    }

    /// Stamp a media message with its playout time and source
    ///
    /// Has no effect on system and RTP messages.
    pub fn set_timing(&mut self, time: MediaTime, source_id: u64) {
        match self {
            Message::AudioRaw(m) => {
                m.time = time;
                m.source_id = source_id;
            }
            Message::AudioEncoded(m) => {
                m.time = time;
                m.source_id = source_id;
            }
            Message::VideoRaw(m) => {
                m.time = time;
                m.source_id = source_id;
            }
            Message::VideoEncoded(m) => {
                m.time = time;
                m.source_id = source_id;
            }
            Message::System(_) | Message::Rtp(_) => {}
        }
    }

    /// Publish the message
    pub fn into_ref(self) -> MessageRef {
        Arc::new(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn audio(time_ms: i64) -> Message {
        Message::AudioRaw(AudioFrame {
            sample_rate: 8000,
            channels: 1,
            samples: vec![0.0; 160],
            time: MediaTime::from_millis(time_ms),
            source_id: 7,
        })
    }

    #[test]
    fn test_filter_none_blocks_everything() {
        assert!(!MessageFilter::NONE.matches(&Message::System(SystemMessage::IsTime)));
        assert!(!MessageFilter::default().matches(&audio(0)));
    }

    #[test]
    fn test_filter_by_type_and_subtype() {
        let filter = MessageFilter::new(message_type::SYSTEM, subtype::IS_TIME);
        assert!(filter.matches(&Message::System(SystemMessage::IsTime)));
        assert!(!filter.matches(&Message::System(SystemMessage::WaitTime)));
        assert!(!filter.matches(&audio(0)));

        assert!(MessageFilter::types(message_type::AUDIO_RAW).matches(&audio(0)));
        assert!(MessageFilter::ALL.matches(&audio(0)));
    }

    #[test]
    fn test_set_timing() {
        let mut message = audio(0);
        message.set_timing(MediaTime::from_millis(40), 99);
        assert_eq!(message.time(), Some(MediaTime::from_millis(40)));
        assert_eq!(message.source_id(), Some(99));

        let mut system = Message::System(SystemMessage::WaitTime);
        system.set_timing(MediaTime::from_millis(40), 99);
        assert_eq!(system.time(), None);
    }

    #[test]
    fn test_audio_frame_duration() {
        if let Message::AudioRaw(frame) = audio(0) {
            assert_eq!(frame.frames(), 160);
            assert_eq!(frame.duration(), MediaTime::from_millis(20));
        } else {
            unreachable!();
        }
    }
}
