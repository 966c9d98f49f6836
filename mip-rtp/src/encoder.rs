//! RTP encoder component
//!
//! Packetizes media messages for one outgoing stream and interleaves RTCP
//! sender reports with the stream's CNAME at a fixed interval.

use crate::decoders::{encode_l16, packetize_h263, H263_CLOCK_RATE};
use crate::packet::{RtpPacket, DEFAULT_MAX_PAYLOAD_SIZE, FIXED_HEADER_SIZE};
use crate::rtcp::{self, NtpTimestamp, RtcpPacket, SdesChunk, SenderReport};
use bytes::Bytes;
use mip_core::{
    ChainContext, Clock, Component, ComponentError, IterationQueue, MediaTime, Message,
    MessageRef, RtpDatagram, RtpKind, Timer, VideoEncoding,
};
use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hasher};
use std::sync::Arc;

/// Payload type of L16 mono at 44.1 kHz (RFC 3551)
pub const PT_L16_MONO: u8 = 11;

/// Payload type of H.263 (RFC 3551)
pub const PT_H263: u8 = 34;

#[derive(Debug, Clone)]
pub struct RtpEncoderConfig {
    pub name: String,
    pub ssrc: u32,
    pub payload_type: u8,
    pub cname: String,
    pub max_payload_size: usize,
    pub rtcp_interval: MediaTime,
    pub initial_sequence: u16,
    pub initial_timestamp: u32,
}

impl Default for RtpEncoderConfig {
    fn default() -> Self {
        RtpEncoderConfig {
            name: "rtp-encoder".to_string(),
            ssrc: random_u32(),
            payload_type: PT_L16_MONO,
            cname: "mip@localhost".to_string(),
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            rtcp_interval: MediaTime::from_secs(5),
            initial_sequence: random_u32() as u16,
            initial_timestamp: random_u32(),
        }
    }
}

/// Per-process random value for SSRC and initial counters
fn random_u32() -> u32 {
    let mut hasher = RandomState::new().build_hasher();
    hasher.write_u64(std::process::id() as u64);
    hasher.finish() as u32
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EncoderStats {
    pub packets_sent: u64,
    pub octets_sent: u64,
    pub reports_sent: u64,
}

pub struct RtpEncoder {
    config: RtpEncoderConfig,
    clock: Arc<dyn Clock>,
    sequence: u16,
    first_packet: bool,
    /// RTP timestamp of the latest packet, its clock rate and send time
    last_sent: Option<(u32, u32, MediaTime)>,
    rtcp_timer: Timer,
    queue: IterationQueue,
    stats: EncoderStats,
}

impl RtpEncoder {
    pub fn new(config: RtpEncoderConfig, clock: Arc<dyn Clock>) -> Result<Self, ComponentError> {
        if config.max_payload_size < 16 {
            return Err(ComponentError::Init(format!(
                "payload size {} too small",
                config.max_payload_size
            )));
        }
        Ok(RtpEncoder {
            sequence: config.initial_sequence,
            rtcp_timer: Timer::new(config.rtcp_interval),
            config,
            clock,
            first_packet: true,
            last_sent: None,
            queue: IterationQueue::new(),
            stats: EncoderStats::default(),
        })
    }

    pub fn ssrc(&self) -> u32 {
        self.config.ssrc
    }

    pub fn stats(&self) -> EncoderStats {
        self.stats
    }

    fn rtp_timestamp(&self, time: MediaTime, clock_rate: u32) -> u32 {
        let ticks = (time.as_secs_f64() * clock_rate as f64).round() as i64;
        self.config.initial_timestamp.wrapping_add(ticks as u32)
    }

    /// Marker for an audio packet: set on the first packet of the stream
    fn audio_marker(&mut self) -> bool {
        std::mem::take(&mut self.first_packet)
    }

    fn send(&mut self, timestamp: u32, clock_rate: u32, marker: bool, payload: Bytes, now: MediaTime) {
        let packet = RtpPacket::new(
            self.config.payload_type,
            self.sequence,
            timestamp,
            self.config.ssrc,
            payload,
        )
        .with_marker(marker);
        self.sequence = self.sequence.wrapping_add(1);

        let data = match packet.to_bytes() {
            Ok(data) => data.freeze(),
            Err(err) => {
                tracing::warn!(encoder = %self.config.name, "cannot serialize packet: {}", err);
                return;
            }
        };
        self.stats.packets_sent += 1;
        self.stats.octets_sent += (data.len() - FIXED_HEADER_SIZE) as u64;
        self.last_sent = Some((timestamp, clock_rate, now));
        self.queue.push(
            Message::Rtp(RtpDatagram {
                kind: RtpKind::PacketOut,
                data,
                time: now,
                peer: None,
            })
            .into_ref(),
        );
    }

    fn send_report(&mut self, now: MediaTime) {
        let Some((timestamp, clock_rate, sent_at)) = self.last_sent else {
            return;
        };
        let elapsed = (now - sent_at).as_secs_f64() * clock_rate as f64;
        let report = SenderReport {
            ssrc: self.config.ssrc,
            ntp_timestamp: NtpTimestamp::now(),
            rtp_timestamp: timestamp.wrapping_add(elapsed.round() as u32),
            packet_count: self.stats.packets_sent as u32,
            octet_count: self.stats.octets_sent as u32,
        };
        let data = rtcp::serialize_compound(&[
            RtcpPacket::SenderReport(report),
            RtcpPacket::SourceDescription(vec![SdesChunk {
                ssrc: self.config.ssrc,
                cname: Some(self.config.cname.clone()),
            }]),
        ])
        .freeze();

        self.stats.reports_sent += 1;
        self.queue.push(
            Message::Rtp(RtpDatagram {
                kind: RtpKind::ControlOut,
                data,
                time: now,
                peer: None,
            })
            .into_ref(),
        );
    }
}

impl Component for RtpEncoder {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn push(
        &mut self,
        _chain: &ChainContext,
        iteration: u64,
        message: &MessageRef,
    ) -> Result<(), ComponentError> {
        self.queue.begin(iteration);
        let now = self.clock.now();
        let max_payload = self.config.max_payload_size;

        match message.as_ref() {
            Message::System(_) => {}
            Message::AudioRaw(audio) => {
                let channels = audio.channels.max(1) as usize;
                let frames_per_packet = (max_payload / (2 * channels)).max(1);
                for (index, chunk) in audio.samples.chunks(frames_per_packet * channels).enumerate() {
                    let offset = MediaTime::from_micros(
                        (index * frames_per_packet) as i64 * 1_000_000 / audio.sample_rate.max(1) as i64,
                    );
                    let timestamp = self.rtp_timestamp(audio.time + offset, audio.sample_rate);
                    let marker = self.audio_marker();
                    self.send(timestamp, audio.sample_rate, marker, encode_l16(chunk), now);
                }
            }
            Message::AudioEncoded(audio) => {
                let timestamp = self.rtp_timestamp(audio.time, audio.sample_rate);
                let marker = self.audio_marker();
                self.send(timestamp, audio.sample_rate, marker, audio.payload.clone(), now);
            }
            Message::VideoEncoded(video) => {
                let timestamp = self.rtp_timestamp(video.time, H263_CLOCK_RATE);
                let payloads = match video.encoding {
                    VideoEncoding::H263 => packetize_h263(&video.payload, max_payload),
                    VideoEncoding::Jpeg | VideoEncoding::Opaque => video
                        .payload
                        .chunks(max_payload)
                        .map(|chunk| video.payload.slice_ref(chunk))
                        .collect(),
                };
                // Marker closes the picture, the audio start marker does not apply
                let last = payloads.len().saturating_sub(1);
                for (index, payload) in payloads.into_iter().enumerate() {
                    self.send(timestamp, H263_CLOCK_RATE, index == last, payload, now);
                }
            }
            other => return Err(ComponentError::unexpected("media to packetize", other)),
        }

        if self.last_sent.is_some() && self.rtcp_timer.try_fire(now) {
            self.send_report(now);
        }
        Ok(())
    }

    fn pull(
        &mut self,
        _chain: &ChainContext,
        iteration: u64,
    ) -> Result<Option<MessageRef>, ComponentError> {
        self.queue.begin(iteration);
        Ok(self.queue.next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mip_core::{AudioFrame, EncodedVideo, ManualClock, SystemMessage};

    fn encoder(max_payload_size: usize) -> (RtpEncoder, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(MediaTime::ZERO));
        let config = RtpEncoderConfig {
            ssrc: 0x1234,
            initial_sequence: 65535,
            initial_timestamp: 1000,
            max_payload_size,
            ..Default::default()
        };
        (RtpEncoder::new(config, clock.clone()).unwrap(), clock)
    }

    fn collect(encoder: &mut RtpEncoder, iteration: u64) -> Vec<RtpDatagram> {
        let ctx = ChainContext::new("test");
        let mut out = Vec::new();
        while let Some(message) = encoder.pull(&ctx, iteration).unwrap() {
            if let Message::Rtp(datagram) = message.as_ref() {
                out.push(datagram.clone());
            }
        }
        out
    }

    #[test]
    fn test_audio_is_split_and_timed() {
        let (mut enc, _clock) = encoder(200);
        let frame = Message::AudioRaw(AudioFrame {
            sample_rate: 8000,
            channels: 1,
            samples: vec![0.1; 160],
            time: MediaTime::from_millis(20),
            source_id: 0,
        })
        .into_ref();
        enc.push(&ChainContext::new("test"), 1, &frame).unwrap();

        let out = collect(&mut enc, 1);
        let packets: Vec<_> = out
            .iter()
            .filter(|d| d.kind == RtpKind::PacketOut)
            .map(|d| RtpPacket::from_bytes(&d.data).unwrap())
            .collect();
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].timestamp, 1160);
        assert_eq!(packets[1].timestamp, 1260);
        assert_eq!(packets[0].sequence_number, 65535);
        assert_eq!(packets[1].sequence_number, 0);
        assert!(packets[0].marker);
        assert!(!packets[1].marker);

        // First media push also emits a sender report
        let reports: Vec<_> = out.iter().filter(|d| d.kind == RtpKind::ControlOut).collect();
        assert_eq!(reports.len(), 1);
        let parsed = rtcp::parse_compound(&reports[0].data).unwrap();
        assert!(matches!(&parsed[0], RtcpPacket::SenderReport(sr) if sr.packet_count == 2));
    }

    #[test]
    fn test_video_marker_on_last_fragment() {
        let (mut enc, _clock) = encoder(16);
        let picture: Vec<u8> = [0u8, 0, 0x80].iter().copied().chain(1..=30).collect();
        let message = Message::VideoEncoded(EncodedVideo {
            encoding: VideoEncoding::H263,
            payload: Bytes::from(picture),
            time: MediaTime::from_secs(1),
            source_id: 0,
        })
        .into_ref();
        enc.push(&ChainContext::new("test"), 1, &message).unwrap();

        let packets: Vec<_> = collect(&mut enc, 1)
            .iter()
            .filter(|d| d.kind == RtpKind::PacketOut)
            .map(|d| RtpPacket::from_bytes(&d.data).unwrap())
            .collect();
        assert_eq!(packets.len(), 3);
        assert!(packets.iter().all(|p| p.timestamp == 1000 + 90000));
        assert!(!packets[0].marker);
        assert!(!packets[1].marker);
        assert!(packets[2].marker);
    }

    #[test]
    fn test_video_round_trip_through_decoder() {
        use crate::decoder::{RtpDecoder, RtpDecoderConfig};
        use crate::decoders::H263Decoder;

        let clock = Arc::new(ManualClock::new(MediaTime::ZERO));
        let config = RtpEncoderConfig {
            payload_type: PT_H263,
            max_payload_size: 16,
            ..Default::default()
        };
        let mut enc = RtpEncoder::new(config, clock.clone()).unwrap();
        let mut decoder = RtpDecoder::new(RtpDecoderConfig::default(), clock).unwrap();
        decoder.register_decoder(PT_H263, Box::new(H263Decoder::new()));

        let ctx = ChainContext::new("test");
        let picture: Vec<u8> = [0u8, 0, 0x80].iter().copied().chain(1..=30).collect();
        let message = Message::VideoEncoded(EncodedVideo {
            encoding: VideoEncoding::H263,
            payload: Bytes::from(picture.clone()),
            time: MediaTime::ZERO,
            source_id: 0,
        })
        .into_ref();
        enc.push(&ctx, 1, &message).unwrap();

        for datagram in collect(&mut enc, 1) {
            let kind = match datagram.kind {
                RtpKind::PacketOut => RtpKind::PacketIn,
                _ => RtpKind::ControlIn,
            };
            let inbound = Message::Rtp(RtpDatagram { kind, ..datagram }).into_ref();
            decoder.push(&ctx, 1, &inbound).unwrap();
        }

        let mut pictures = Vec::new();
        while let Some(message) = decoder.pull(&ctx, 1).unwrap() {
            if let Message::VideoEncoded(video) = message.as_ref() {
                pictures.push(video.payload.clone());
            }
        }
        assert_eq!(pictures.len(), 1);
        assert_eq!(&pictures[0][..], &picture[..]);
    }

    #[test]
    fn test_reports_follow_interval() {
        let (mut enc, clock) = encoder(1200);
        let ctx = ChainContext::new("test");
        let tick = Message::System(SystemMessage::IsTime).into_ref();

        // Nothing sent yet: no report
        enc.push(&ctx, 1, &tick).unwrap();
        assert!(collect(&mut enc, 1).is_empty());

        let audio = Message::AudioRaw(AudioFrame {
            sample_rate: 8000,
            channels: 1,
            samples: vec![0.0; 80],
            time: MediaTime::ZERO,
            source_id: 0,
        })
        .into_ref();
        enc.push(&ctx, 2, &audio).unwrap();
        assert_eq!(enc.stats().reports_sent, 1);

        clock.advance(MediaTime::from_secs(1));
        enc.push(&ctx, 3, &tick).unwrap();
        assert_eq!(enc.stats().reports_sent, 1);

        clock.advance(MediaTime::from_secs(5));
        enc.push(&ctx, 4, &tick).unwrap();
        assert_eq!(enc.stats().reports_sent, 2);
    }

    #[test]
    fn test_rejects_rtp_input() {
        let (mut enc, _clock) = encoder(1200);
        let message = Message::Rtp(RtpDatagram {
            kind: RtpKind::PacketIn,
            data: Bytes::new(),
            time: MediaTime::ZERO,
            peer: None,
        })
        .into_ref();
        assert!(enc.push(&ChainContext::new("test"), 1, &message).is_err());
    }
}
