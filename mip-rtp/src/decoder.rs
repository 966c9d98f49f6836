//! RTP decoder component
//!
//! Takes received RTP and RTCP datagrams and produces timed media messages.
//! Per SSRC it keeps a [`SourceTiming`] record, an extended sequence counter
//! and, for fragmented payload formats, a [`Reassembler`]. The payload
//! format is handled by the [`RtpPacketDecoder`] registered for the packet's
//! payload type.
//!
//! Data problems (malformed packets, unknown payload types, packets whose
//! timestamp unit cannot be determined) drop the packet and are counted in
//! [`DecoderStats`]; only messages of the wrong kind fail the chain.

use crate::decoders::{DecodedMessage, DecoderRegistry, RtpPacketDecoder};
use crate::packet::RtpPacket;
use crate::reassembly::{
    Fragment, ReassembledFrame, Reassembler, ReassemblyStats, DEFAULT_WINDOW_SIZE,
};
use crate::rtcp::{self, RtcpPacket};
use crate::sync::RtpSynchronizer;
use crate::timestamp::SequenceUnwrapper;
use crate::timing::{SourceTiming, TimingConfig, SOURCE_TIMEOUT, SWEEP_INTERVAL};
use mip_core::{
    ChainContext, Clock, Component, ComponentError, Feedback, IterationQueue, MediaTime, Message,
    MessageRef, RtpDatagram, RtpKind, Timer,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// RTP synchronization source identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ssrc(pub u32);

#[derive(Debug, Clone)]
pub struct RtpDecoderConfig {
    pub name: String,
    pub timing: TimingConfig,
    /// Slots per source reassembly window
    pub reassembly_window: usize,
    /// Upper 32 bits of the source ids this decoder assigns
    pub session_tag: u32,
}

impl Default for RtpDecoderConfig {
    fn default() -> Self {
        RtpDecoderConfig {
            name: "rtp-decoder".to_string(),
            timing: TimingConfig::default(),
            reassembly_window: DEFAULT_WINDOW_SIZE,
            session_tag: 0,
        }
    }
}

/// Decoder counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecoderStats {
    pub packets_received: u64,
    pub control_packets: u64,
    pub malformed: u64,
    pub unknown_payload_type: u64,
    pub rejected: u64,
    pub no_timestamp_unit: u64,
    pub timestamp_resets: u64,
    pub frames_decoded: u64,
    pub messages_out: u64,
    pub offset_increases: u64,
    pub offset_decreases: u64,
    pub sources_expired: u64,
}

struct SourceState {
    timing: SourceTiming,
    sequence: Option<SequenceUnwrapper>,
    reassembler: Option<Reassembler>,
}

impl SourceState {
    fn new(config: &TimingConfig, now: MediaTime) -> Self {
        SourceState {
            timing: SourceTiming::new(config, now),
            sequence: None,
            reassembler: None,
        }
    }
}

pub struct RtpDecoder {
    config: RtpDecoderConfig,
    clock: Arc<dyn Clock>,
    decoders: DecoderRegistry,
    sources: HashMap<Ssrc, SourceState>,
    synchronizer: Option<Arc<RtpSynchronizer>>,
    /// Latest playback time reported through feedback
    playback_time: Option<MediaTime>,
    sweep_timer: Timer,
    queue: IterationQueue,
    decoded: Vec<DecodedMessage>,
    stats: DecoderStats,
}

impl RtpDecoder {
    pub fn new(config: RtpDecoderConfig, clock: Arc<dyn Clock>) -> Result<Self, ComponentError> {
        // Surface a bad window now rather than on the first fragmented packet
        Reassembler::new(config.reassembly_window)
            .map_err(|err| ComponentError::Init(err.to_string()))?;

        Ok(RtpDecoder {
            config,
            clock,
            decoders: DecoderRegistry::new(),
            sources: HashMap::new(),
            synchronizer: None,
            playback_time: None,
            sweep_timer: Timer::new(SWEEP_INTERVAL),
            queue: IterationQueue::new(),
            decoded: Vec::new(),
            stats: DecoderStats::default(),
        })
    }

    /// Install a payload decoder for `payload_type`
    pub fn register_decoder(&mut self, payload_type: u8, decoder: Box<dyn RtpPacketDecoder>) {
        self.decoders.register(payload_type, decoder);
    }

    pub fn decoders_mut(&mut self) -> &mut DecoderRegistry {
        &mut self.decoders
    }

    /// Align sources sharing a CNAME through `synchronizer`
    pub fn set_synchronizer(&mut self, synchronizer: Option<Arc<RtpSynchronizer>>) {
        self.synchronizer = synchronizer;
    }

    pub fn stats(&self) -> DecoderStats {
        self.stats
    }

    /// Reassembly counters summed over all sources
    pub fn reassembly_stats(&self) -> ReassemblyStats {
        self.sources
            .values()
            .filter_map(|source| source.reassembler.as_ref())
            .map(Reassembler::stats)
            .fold(ReassemblyStats::default(), |mut total, stats| {
                total.fragments_inserted += stats.fragments_inserted;
                total.duplicates += stats.duplicates;
                total.too_old += stats.too_old;
                total.frames_completed += stats.frames_completed;
                total.fragments_dropped += stats.fragments_dropped;
                total
            })
    }

    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    /// Current playback offset of every source, by SSRC
    pub fn source_offsets(&self) -> Vec<(u32, MediaTime)> {
        let mut offsets: Vec<_> = self
            .sources
            .iter()
            .map(|(ssrc, source)| (ssrc.0, source.timing.playback_offset()))
            .collect();
        offsets.sort_unstable();
        offsets
    }

    pub fn playback_time(&self) -> Option<MediaTime> {
        self.playback_time
    }

    /// Source id stamped on messages of `ssrc`
    pub fn source_id(&self, ssrc: u32) -> u64 {
        ((self.config.session_tag as u64) << 32) | ssrc as u64
    }

    fn process_packet(&mut self, datagram: &RtpDatagram, now: MediaTime) {
        self.stats.packets_received += 1;

        let packet = match RtpPacket::from_bytes(&datagram.data) {
            Ok(packet) => packet,
            Err(err) => {
                self.stats.malformed += 1;
                debug!(decoder = %self.config.name, "dropping malformed packet: {}", err);
                return;
            }
        };

        let source_id = self.source_id(packet.ssrc);
        let Some(decoder) = self.decoders.get_mut(packet.payload_type) else {
            self.stats.unknown_payload_type += 1;
            debug!(
                decoder = %self.config.name,
                payload_type = packet.payload_type,
                "no decoder for payload type"
            );
            return;
        };

        let config = &self.config;
        let source = self
            .sources
            .entry(Ssrc(packet.ssrc))
            .or_insert_with(|| SourceState::new(&config.timing, now));
        source.timing.touch(now);

        let estimate = source.timing.unit_estimate();
        let unit = match decoder.validate_packet(&packet, estimate) {
            Ok(unit) => unit.or(source.timing.timestamp_unit()).or(estimate),
            Err(err) => {
                self.stats.rejected += 1;
                debug!(ssrc = packet.ssrc, "packet rejected: {}", err);
                return;
            }
        };
        let Some(unit) = unit else {
            self.stats.no_timestamp_unit += 1;
            debug!(ssrc = packet.ssrc, "timestamp unit unknown, dropping packet");
            return;
        };
        source.timing.set_timestamp_unit(unit);

        let update = source
            .timing
            .register_timestamp(packet.timestamp, self.playback_time);
        if update.reset && source.sequence.is_some() {
            self.stats.timestamp_resets += 1;
            debug!(ssrc = packet.ssrc, timestamp = packet.timestamp, "timestamp base reset");
        }

        if let Some(playback_time) = self.playback_time {
            if let Some(delta) = source.timing.adapt(update.extended, playback_time, now) {
                if delta.is_negative() {
                    self.stats.offset_decreases += 1;
                } else {
                    self.stats.offset_increases += 1;
                }
                debug!(
                    ssrc = packet.ssrc,
                    offset = %source.timing.playback_offset(),
                    "playback offset adjusted"
                );
            }
        }
        if source.timing.update_sync(now) {
            debug!(ssrc = packet.ssrc, offset = %source.timing.sync_offset(), "sync offset updated");
        }

        let sequence = source
            .sequence
            .get_or_insert_with(|| SequenceUnwrapper::new(packet.sequence_number))
            .unwrap(packet.sequence_number);
        let fragment = Fragment {
            sequence,
            payload: packet.payload.clone(),
            received_at: datagram.time,
            marker: packet.marker,
            first: decoder.is_first_fragment(&packet),
        };

        if decoder.needs_reassembly() {
            if source.reassembler.is_none() {
                match Reassembler::new(config.reassembly_window) {
                    Ok(reassembler) => source.reassembler = Some(reassembler),
                    Err(err) => {
                        warn!(ssrc = packet.ssrc, "cannot reassemble: {}", err);
                        return;
                    }
                }
            }
            let Some(reassembler) = source.reassembler.as_mut() else {
                return;
            };
            reassembler.insert(packet.timestamp, fragment);
            while let Some(frame) = reassembler.pop_frame() {
                self.stats.frames_decoded += 1;
                decoder.create_new_messages(&frame, &mut self.decoded);
            }
        } else {
            self.stats.frames_decoded += 1;
            let frame = ReassembledFrame::single(packet.timestamp, fragment);
            decoder.create_new_messages(&frame, &mut self.decoded);
        }

        for decoded in self.decoded.drain(..) {
            let Some(time) = source
                .timing
                .extend(decoded.timestamp)
                .and_then(|extended| source.timing.playout_time(extended))
            else {
                continue;
            };
            let mut message = decoded.message;
            message.set_timing(time, source_id);
            self.queue.push(message.into_ref());
            self.stats.messages_out += 1;
        }
    }

    fn process_control(&mut self, datagram: &RtpDatagram, now: MediaTime) {
        self.stats.control_packets += 1;

        let packets = match rtcp::parse_compound(&datagram.data) {
            Ok(packets) => packets,
            Err(err) => {
                self.stats.malformed += 1;
                debug!(decoder = %self.config.name, "dropping malformed RTCP: {}", err);
                return;
            }
        };

        let timing = self.config.timing;
        for packet in packets {
            match packet {
                RtcpPacket::SenderReport(report) => {
                    let source = self
                        .sources
                        .entry(Ssrc(report.ssrc))
                        .or_insert_with(|| SourceState::new(&timing, now));
                    source.timing.touch(now);
                    if let Some(unit) = source.timing.record_sender_report(&report) {
                        debug!(ssrc = report.ssrc, unit, "timestamp unit estimated");
                    }
                }
                RtcpPacket::SourceDescription(chunks) => {
                    let Some(synchronizer) = &self.synchronizer else {
                        continue;
                    };
                    for chunk in chunks {
                        let Some(cname) = chunk.cname else {
                            continue;
                        };
                        self.sources
                            .entry(Ssrc(chunk.ssrc))
                            .or_insert_with(|| SourceState::new(&timing, now))
                            .timing
                            .set_cname(&cname, synchronizer);
                    }
                }
                RtcpPacket::Bye { ssrcs } => {
                    for ssrc in ssrcs {
                        if self.sources.remove(&Ssrc(ssrc)).is_some() {
                            debug!(ssrc, "source left");
                        }
                    }
                }
                RtcpPacket::ReceiverReport { .. } | RtcpPacket::Other { .. } => {}
            }
        }
    }

    fn sweep(&mut self, now: MediaTime) {
        if !self.sweep_timer.try_fire(now) {
            return;
        }
        let before = self.sources.len();
        self.sources
            .retain(|_, source| now - source.timing.last_access() < SOURCE_TIMEOUT);
        let expired = before - self.sources.len();
        if expired > 0 {
            self.stats.sources_expired += expired as u64;
            debug!(decoder = %self.config.name, expired, "expired idle sources");
        }
    }
}

impl Component for RtpDecoder {
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

        match message.as_ref() {
            Message::Rtp(datagram) if datagram.kind == RtpKind::PacketIn => {
                self.process_packet(datagram, now)
            }
            Message::Rtp(datagram) if datagram.kind == RtpKind::ControlIn => {
                self.process_control(datagram, now)
            }
            other => return Err(ComponentError::unexpected("inbound rtp or rtcp", other)),
        }

        self.sweep(now);
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

    fn process_feedback(
        &mut self,
        _chain: &ChainContext,
        feedback: &mut Feedback,
    ) -> Result<(), ComponentError> {
        if let Some(time) = feedback.playback_stream_time {
            self.playback_time = Some(time);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoders::{encode_l16, packetize_h263, H263Decoder, L16Decoder};
    use crate::rtcp::{NtpTimestamp, SdesChunk, SenderReport};
    use bytes::Bytes;
    use mip_core::{ManualClock, SystemMessage};

    const L16_PT: u8 = 11;
    const H263_PT: u8 = 34;

    fn setup() -> (RtpDecoder, Arc<ManualClock>, ChainContext) {
        let clock = Arc::new(ManualClock::new(MediaTime::ZERO));
        let mut decoder = RtpDecoder::new(RtpDecoderConfig::default(), clock.clone()).unwrap();
        decoder.register_decoder(L16_PT, Box::new(L16Decoder::new(8000, 1)));
        decoder.register_decoder(H263_PT, Box::new(H263Decoder::new()));
        (decoder, clock, ChainContext::new("test"))
    }

    fn datagram(kind: RtpKind, data: Bytes) -> MessageRef {
        Message::Rtp(RtpDatagram {
            kind,
            data,
            time: MediaTime::ZERO,
            peer: None,
        })
        .into_ref()
    }

    fn l16(seq: u16, ts: u32, ssrc: u32) -> MessageRef {
        let packet = RtpPacket::new(L16_PT, seq, ts, ssrc, encode_l16(&[0.25; 160]));
        datagram(RtpKind::PacketIn, packet.to_bytes().unwrap().freeze())
    }

    fn drain(decoder: &mut RtpDecoder, ctx: &ChainContext, iteration: u64) -> Vec<MessageRef> {
        let mut out = Vec::new();
        while let Some(message) = decoder.pull(ctx, iteration).unwrap() {
            out.push(message);
        }
        out
    }

    #[test]
    fn test_audio_packets_are_timed() {
        let (mut decoder, _clock, ctx) = setup();
        decoder.push(&ctx, 1, &l16(1, 1000, 0x42)).unwrap();
        decoder.push(&ctx, 1, &l16(2, 1160, 0x42)).unwrap();

        let out = drain(&mut decoder, &ctx, 1);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].time(), Some(MediaTime::from_millis(50)));
        assert_eq!(out[1].time(), Some(MediaTime::from_millis(70)));
        assert_eq!(out[1].source_id(), Some(0x42));

        // Pulling again in the same iteration repeats the set
        assert_eq!(drain(&mut decoder, &ctx, 1).len(), 2);
        assert!(drain(&mut decoder, &ctx, 2).is_empty());
    }

    #[test]
    fn test_soft_failures_are_counted() {
        let (mut decoder, _clock, ctx) = setup();
        decoder
            .push(&ctx, 1, &datagram(RtpKind::PacketIn, Bytes::from_static(&[1, 2, 3])))
            .unwrap();
        let unknown = RtpPacket::new(96, 1, 0, 7, Bytes::from_static(b"abc"));
        decoder
            .push(&ctx, 1, &datagram(RtpKind::PacketIn, unknown.to_bytes().unwrap().freeze()))
            .unwrap();
        let odd = RtpPacket::new(L16_PT, 1, 0, 7, Bytes::from_static(b"abc"));
        decoder
            .push(&ctx, 1, &datagram(RtpKind::PacketIn, odd.to_bytes().unwrap().freeze()))
            .unwrap();

        let stats = decoder.stats();
        assert_eq!(stats.packets_received, 3);
        assert_eq!(stats.malformed, 1);
        assert_eq!(stats.unknown_payload_type, 1);
        assert_eq!(stats.rejected, 1);
        assert!(drain(&mut decoder, &ctx, 1).is_empty());
    }

    #[test]
    fn test_wrong_message_kind_fails() {
        let (mut decoder, _clock, ctx) = setup();
        let result = decoder.push(&ctx, 1, &Message::System(SystemMessage::IsTime).into_ref());
        assert!(matches!(result, Err(ComponentError::UnexpectedMessage { .. })));
    }

    #[test]
    fn test_fragmented_video_is_reassembled() {
        let (mut decoder, _clock, ctx) = setup();
        let picture = [0u8, 0, 0x80, 1, 2, 3, 4, 5, 6, 7, 8, 9];
        let payloads = packetize_h263(&picture, 6);
        assert_eq!(payloads.len(), 3);

        let last = payloads.len() - 1;
        for index in [2usize, 0, 1] {
            let packet = RtpPacket::new(H263_PT, 500 + index as u16, 3000, 9, payloads[index].clone())
                .with_marker(index == last);
            decoder
                .push(&ctx, 1, &datagram(RtpKind::PacketIn, packet.to_bytes().unwrap().freeze()))
                .unwrap();
        }

        let out = drain(&mut decoder, &ctx, 1);
        assert_eq!(out.len(), 1);
        let Message::VideoEncoded(video) = out[0].as_ref() else {
            panic!("expected encoded video");
        };
        assert_eq!(&video.payload[..], &picture[..]);
        assert_eq!(decoder.reassembly_stats().frames_completed, 1);
    }

    #[test]
    fn test_feedback_anchors_playout() {
        let (mut decoder, _clock, ctx) = setup();
        let mut feedback = Feedback::new(0);
        feedback.playback_stream_time = Some(MediaTime::from_secs(3));
        decoder.process_feedback(&ctx, &mut feedback).unwrap();

        decoder.push(&ctx, 1, &l16(1, 8000, 5)).unwrap();
        let out = drain(&mut decoder, &ctx, 1);
        assert_eq!(
            out[0].time(),
            Some(MediaTime::from_secs(3) + MediaTime::from_millis(50))
        );
    }

    #[test]
    fn test_idle_sources_expire() {
        let (mut decoder, clock, ctx) = setup();
        decoder.push(&ctx, 1, &l16(1, 0, 1)).unwrap();
        clock.advance(MediaTime::from_secs(30));
        decoder.push(&ctx, 2, &l16(1, 0, 2)).unwrap();
        assert_eq!(decoder.source_count(), 2);

        clock.advance(MediaTime::from_secs(40));
        decoder.push(&ctx, 3, &l16(2, 160, 2)).unwrap();
        assert_eq!(decoder.source_count(), 1);
        assert_eq!(decoder.stats().sources_expired, 1);
    }

    #[test]
    fn test_expired_source_leaves_sync_group() {
        let (mut decoder, clock, ctx) = setup();
        let synchronizer = RtpSynchronizer::new();
        decoder.set_synchronizer(Some(synchronizer.clone()));

        let sdes = rtcp::serialize_compound(&[RtcpPacket::SourceDescription(vec![SdesChunk {
            ssrc: 5,
            cname: Some("dave".to_string()),
        }])])
        .freeze();
        decoder.push(&ctx, 1, &datagram(RtpKind::ControlIn, sdes)).unwrap();
        assert_eq!(synchronizer.stream_count(), 1);

        clock.advance(MediaTime::from_secs(61));
        decoder.push(&ctx, 2, &l16(1, 0, 6)).unwrap();
        assert_eq!(decoder.source_count(), 1);
        assert_eq!(synchronizer.stream_count(), 0);
    }

    #[test]
    fn test_late_packets_raise_offset() {
        let (mut decoder, clock, ctx) = setup();
        let base = MediaTime::from_secs(3);
        let block = MediaTime::from_millis(20);
        let mut times = Vec::new();

        for i in 0..16u32 {
            // The first packet arrives on time, the rest 50 ms behind playback
            let late = if i == 0 { MediaTime::ZERO } else { MediaTime::from_millis(100) };
            let mut feedback = Feedback::new(0);
            feedback.playback_stream_time = Some(base + MediaTime::from_millis(20 * i as i64) + late);
            decoder.process_feedback(&ctx, &mut feedback).unwrap();

            let iteration = i as u64 + 1;
            decoder.push(&ctx, iteration, &l16(i as u16, i * 160, 0x99)).unwrap();
            let out = drain(&mut decoder, &ctx, iteration);
            assert_eq!(out.len(), 1);
            times.push(out[0].time().unwrap());
            clock.advance(block);
        }

        assert_eq!(decoder.stats().offset_increases, 1);
        assert_eq!(decoder.source_offsets(), vec![(0x99, MediaTime::from_millis(55))]);
        assert_eq!(times[14], base + MediaTime::from_millis(280 + 50));
        assert_eq!(times[15] - times[14], block + MediaTime::from_millis(5));
    }

    #[test]
    fn test_rtcp_estimates_and_bye() {
        let (mut decoder, _clock, ctx) = setup();
        decoder.set_synchronizer(Some(RtpSynchronizer::new()));
        let report = |secs: u64, rtp: u32| {
            rtcp::serialize_compound(&[
                RtcpPacket::SenderReport(SenderReport {
                    ssrc: 77,
                    ntp_timestamp: NtpTimestamp(secs << 32),
                    rtp_timestamp: rtp,
                    packet_count: 0,
                    octet_count: 0,
                }),
                RtcpPacket::SourceDescription(vec![SdesChunk {
                    ssrc: 77,
                    cname: Some("carol".to_string()),
                }]),
            ])
            .freeze()
        };

        decoder.push(&ctx, 1, &datagram(RtpKind::ControlIn, report(10, 0))).unwrap();
        decoder.push(&ctx, 1, &datagram(RtpKind::ControlIn, report(11, 48000))).unwrap();
        let source = &decoder.sources[&Ssrc(77)];
        let unit = source.timing.unit_estimate().unwrap();
        assert!((unit - 1.0 / 48000.0).abs() < 1e-12);
        assert_eq!(source.timing.cname(), Some("carol"));

        let bye = rtcp::serialize_compound(&[RtcpPacket::Bye { ssrcs: vec![77] }]).freeze();
        decoder.push(&ctx, 2, &datagram(RtpKind::ControlIn, bye)).unwrap();
        assert_eq!(decoder.source_count(), 0);
    }
}
