//! RTCP compound packets
//!
//! Parses and builds the subset of RFC 3550 RTCP this library uses: sender
//! reports (for timestamp-unit estimation and cross-stream sync), source
//! descriptions (CNAME) and BYE. Other packet types are skipped by length.

use crate::packet::{RtpError, RTP_VERSION};
use bytes::{Buf, BufMut, BytesMut};
use mip_core::MediaTime;
use std::time::{SystemTime, UNIX_EPOCH};

pub const RTCP_SR: u8 = 200;
pub const RTCP_RR: u8 = 201;
pub const RTCP_SDES: u8 = 202;
pub const RTCP_BYE: u8 = 203;

const SDES_END: u8 = 0;
const SDES_CNAME: u8 = 1;

const REPORT_BLOCK_SIZE: usize = 24;

/// Seconds between the NTP epoch (1900) and the Unix epoch
const NTP_UNIX_OFFSET: u64 = 2_208_988_800;

/// 64-bit NTP wallclock: seconds since 1900 in 32.32 fixed point
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NtpTimestamp(pub u64);

impl NtpTimestamp {
    pub fn now() -> Self {
        Self::from_system_time(SystemTime::now())
    }

    pub fn from_system_time(time: SystemTime) -> Self {
        let since_unix = time.duration_since(UNIX_EPOCH).unwrap_or_default();
        let secs = since_unix.as_secs() + NTP_UNIX_OFFSET;
        let frac = ((since_unix.subsec_nanos() as u64) << 32) / 1_000_000_000;
        NtpTimestamp((secs << 32) | frac)
    }

    pub fn as_secs_f64(self) -> f64 {
        (self.0 >> 32) as f64 + (self.0 & 0xFFFF_FFFF) as f64 / 4_294_967_296.0
    }

    /// Wallclock as media time measured from the NTP epoch
    pub fn as_media_time(self) -> MediaTime {
        let secs = (self.0 >> 32) as i64;
        let micros = ((self.0 & 0xFFFF_FFFF) * 1_000_000) >> 32;
        MediaTime::from_micros(secs * 1_000_000 + micros as i64)
    }
}

/// Sender report (report blocks are not retained)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SenderReport {
    pub ssrc: u32,
    pub ntp_timestamp: NtpTimestamp,
    pub rtp_timestamp: u32,
    pub packet_count: u32,
    pub octet_count: u32,
}

/// SDES chunk; only the CNAME item is kept
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdesChunk {
    pub ssrc: u32,
    pub cname: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RtcpPacket {
    SenderReport(SenderReport),
    ReceiverReport { ssrc: u32 },
    SourceDescription(Vec<SdesChunk>),
    Bye { ssrcs: Vec<u32> },
    /// Unrecognized packet type, skipped
    Other { packet_type: u8 },
}

/// Parse a compound RTCP datagram
pub fn parse_compound(data: &[u8]) -> Result<Vec<RtcpPacket>, RtpError> {
    let mut packets = Vec::new();
    let mut rest = data;

    while !rest.is_empty() {
        if rest.len() < 4 {
            return Err(RtpError::InsufficientData {
                expected: 4,
                actual: rest.len(),
            });
        }
        if rest[0] >> 6 != RTP_VERSION {
            return Err(RtpError::UnsupportedVersion(rest[0] >> 6));
        }
        let count = (rest[0] & 0x1F) as usize;
        let packet_type = rest[1];
        let length = 4 * (u16::from_be_bytes([rest[2], rest[3]]) as usize + 1);
        if rest.len() < length {
            return Err(RtpError::InsufficientData {
                expected: length,
                actual: rest.len(),
            });
        }
        let mut body = &rest[4..length];
        if rest[0] & 0x20 != 0 {
            let padding = rest[length - 1] as usize;
            if padding == 0 || padding > body.len() {
                return Err(RtpError::InvalidPadding(rest[length - 1]));
            }
            body = &body[..body.len() - padding];
        }

        packets.push(parse_one(packet_type, count, body)?);
        rest = &rest[length..];
    }

    if packets.is_empty() {
        return Err(RtpError::MalformedRtcp("empty compound packet"));
    }
    Ok(packets)
}

fn parse_one(packet_type: u8, count: usize, mut body: &[u8]) -> Result<RtcpPacket, RtpError> {
    match packet_type {
        RTCP_SR => {
            if body.len() < 24 + count * REPORT_BLOCK_SIZE {
                return Err(RtpError::MalformedRtcp("truncated sender report"));
            }
            Ok(RtcpPacket::SenderReport(SenderReport {
                ssrc: body.get_u32(),
                ntp_timestamp: NtpTimestamp(body.get_u64()),
                rtp_timestamp: body.get_u32(),
                packet_count: body.get_u32(),
                octet_count: body.get_u32(),
            }))
        }
        RTCP_RR => {
            if body.len() < 4 + count * REPORT_BLOCK_SIZE {
                return Err(RtpError::MalformedRtcp("truncated receiver report"));
            }
            Ok(RtcpPacket::ReceiverReport {
                ssrc: body.get_u32(),
            })
        }
        RTCP_SDES => {
            let mut chunks = Vec::with_capacity(count);
            for _ in 0..count {
                chunks.push(parse_sdes_chunk(&mut body)?);
            }
            Ok(RtcpPacket::SourceDescription(chunks))
        }
        RTCP_BYE => {
            if body.len() < 4 * count {
                return Err(RtpError::MalformedRtcp("truncated bye"));
            }
            Ok(RtcpPacket::Bye {
                ssrcs: (0..count).map(|_| body.get_u32()).collect(),
            })
        }
        other => Ok(RtcpPacket::Other { packet_type: other }),
    }
}

fn parse_sdes_chunk(body: &mut &[u8]) -> Result<SdesChunk, RtpError> {
    if body.len() < 4 {
        return Err(RtpError::MalformedRtcp("truncated sdes chunk"));
    }
    let start = body.len();
    let ssrc = body.get_u32();
    let mut cname = None;

    loop {
        if body.is_empty() {
            return Err(RtpError::MalformedRtcp("unterminated sdes chunk"));
        }
        let item = body.get_u8();
        if item == SDES_END {
            break;
        }
        if body.is_empty() {
            return Err(RtpError::MalformedRtcp("truncated sdes item"));
        }
        let len = body.get_u8() as usize;
        if body.len() < len {
            return Err(RtpError::MalformedRtcp("truncated sdes item"));
        }
        if item == SDES_CNAME {
            cname = Some(String::from_utf8_lossy(&body[..len]).into_owned());
        }
        body.advance(len);
    }

    // Chunks end on a 32-bit boundary
    let consumed = start - body.len();
    let padding = (4 - consumed % 4) % 4;
    body.advance(padding.min(body.len()));

    Ok(SdesChunk { ssrc, cname })
}

/// Build a compound packet from `packets`
///
/// `Other` entries carry no body and are skipped.
pub fn serialize_compound(packets: &[RtcpPacket]) -> BytesMut {
    let mut buf = BytesMut::new();
    for packet in packets {
        match packet {
            RtcpPacket::SenderReport(sr) => {
                put_header(&mut buf, 0, RTCP_SR, 24);
                buf.put_u32(sr.ssrc);
                buf.put_u64(sr.ntp_timestamp.0);
                buf.put_u32(sr.rtp_timestamp);
                buf.put_u32(sr.packet_count);
                buf.put_u32(sr.octet_count);
            }
            RtcpPacket::ReceiverReport { ssrc } => {
                put_header(&mut buf, 0, RTCP_RR, 4);
                buf.put_u32(*ssrc);
            }
            RtcpPacket::SourceDescription(chunks) => {
                let mut body = BytesMut::new();
                for chunk in chunks {
                    let start = body.len();
                    body.put_u32(chunk.ssrc);
                    if let Some(cname) = &chunk.cname {
                        let bytes = &cname.as_bytes()[..cname.len().min(255)];
                        body.put_u8(SDES_CNAME);
                        body.put_u8(bytes.len() as u8);
                        body.put_slice(bytes);
                    }
                    body.put_u8(SDES_END);
                    let used = body.len() - start;
                    body.put_bytes(0, (4 - used % 4) % 4);
                }
                put_header(&mut buf, chunks.len(), RTCP_SDES, body.len());
                buf.put_slice(&body);
            }
            RtcpPacket::Bye { ssrcs } => {
                put_header(&mut buf, ssrcs.len(), RTCP_BYE, 4 * ssrcs.len());
                for ssrc in ssrcs {
                    buf.put_u32(*ssrc);
                }
            }
            RtcpPacket::Other { .. } => {}
        }
    }
    buf
}

fn put_header(buf: &mut BytesMut, count: usize, packet_type: u8, body_len: usize) {
    buf.put_u8((RTP_VERSION << 6) | (count as u8 & 0x1F));
    buf.put_u8(packet_type);
    buf.put_u16((body_len / 4) as u16);
}

/// Derives seconds-per-tick from successive sender reports of one source
#[derive(Debug, Clone, Default)]
pub struct UnitEstimator {
    last: Option<SenderReport>,
    estimate: Option<f64>,
}

impl UnitEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a sender report, refining the estimate when possible
    pub fn update(&mut self, report: &SenderReport) -> Option<f64> {
        if let Some(last) = &self.last {
            let wallclock = report.ntp_timestamp.as_secs_f64() - last.ntp_timestamp.as_secs_f64();
            let ticks = report.rtp_timestamp.wrapping_sub(last.rtp_timestamp);
            if wallclock > 0.0 && ticks > 0 && ticks < crate::timestamp::WRAP_THRESHOLD {
                self.estimate = Some(wallclock / ticks as f64);
            }
        }
        self.last = Some(*report);
        self.estimate
    }

    pub fn estimate(&self) -> Option<f64> {
        self.estimate
    }

    /// Most recent sender report
    pub fn last_report(&self) -> Option<&SenderReport> {
        self.last.as_ref()
    }
}
