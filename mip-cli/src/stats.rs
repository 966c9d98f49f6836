//! Statistics display and formatting

use mip::io::{UdpInputStats, UdpOutputStats};
use mip::mixer::AudioMixerStats;
use mip::rtp::{DecoderStats, EncoderStats};
use mip::MediaTime;
use std::io::Write;
use std::time::Duration;

/// Format bytes in human-readable form
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Format bandwidth in human-readable form
pub fn format_bandwidth(bps: u64) -> String {
    const KBPS: u64 = 1000;
    const MBPS: u64 = KBPS * 1000;
    const GBPS: u64 = MBPS * 1000;

    if bps >= GBPS {
        format!("{:.2} Gbps", bps as f64 / GBPS as f64)
    } else if bps >= MBPS {
        format!("{:.2} Mbps", bps as f64 / MBPS as f64)
    } else if bps >= KBPS {
        format!("{:.2} Kbps", bps as f64 / KBPS as f64)
    } else {
        format!("{} bps", bps)
    }
}

/// Format a playout offset in milliseconds
pub fn format_offset(offset: MediaTime) -> String {
    format!("{:.1}ms", offset.as_micros() as f64 / 1_000.0)
}

/// Format duration in human-readable form
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;

    if hours > 0 {
        format!("{}h {:02}m {:02}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {:02}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

fn rate(bytes: u64, elapsed: Duration) -> u64 {
    let millis = elapsed.as_millis() as u64;
    if millis == 0 {
        0
    } else {
        bytes * 8 * 1000 / millis
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SenderSnapshot {
    pub encoder: EncoderStats,
    pub output: UdpOutputStats,
}

#[derive(Debug, Clone, Default)]
pub struct ReceiverSnapshot {
    pub input: UdpInputStats,
    pub decoder: DecoderStats,
    pub mixer: AudioMixerStats,
    /// Playout offset per SSRC
    pub offsets: Vec<(u32, MediaTime)>,
}

pub fn sender_line(stats: &SenderSnapshot, elapsed: Duration) -> String {
    format!(
        "[{:8}] Packets: {} | Sent: {} | Rate: {} | RTCP: {} | Errors: {}",
        format_duration(elapsed),
        stats.encoder.packets_sent,
        format_bytes(stats.output.bytes_sent),
        format_bandwidth(rate(stats.output.bytes_sent, elapsed)),
        stats.encoder.reports_sent,
        stats.output.send_errors
    )
}

pub fn receiver_line(stats: &ReceiverSnapshot, elapsed: Duration) -> String {
    let offsets = if stats.offsets.is_empty() {
        "-".to_string()
    } else {
        stats
            .offsets
            .iter()
            .map(|(ssrc, offset)| format!("{:08x}={}", ssrc, format_offset(*offset)))
            .collect::<Vec<_>>()
            .join(",")
    };
    let dropped = stats.mixer.late_dropped + stats.mixer.early_dropped + stats.mixer.mismatched_dropped;
    format!(
        "[{:8}] Packets: {} | Rate: {} | Frames: {} | Dropped: {} | Offsets: {}",
        format_duration(elapsed),
        stats.decoder.packets_received,
        format_bandwidth(rate(stats.input.bytes, elapsed)),
        stats.decoder.frames_decoded,
        dropped + stats.decoder.rejected + stats.decoder.malformed,
        offsets
    )
}

/// Display compact sender stats on one line (for continuous updates)
pub fn display_sender_stats(stats: &SenderSnapshot, elapsed: Duration) {
    print!("\r{}         ", sender_line(stats, elapsed));
    let _ = std::io::stdout().flush();
}

/// Display compact receiver stats on one line (for continuous updates)
pub fn display_receiver_stats(stats: &ReceiverSnapshot, elapsed: Duration) {
    print!("\r{}         ", receiver_line(stats, elapsed));
    let _ = std::io::stdout().flush();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(500), "500 B");
        assert_eq!(format_bytes(2048), "2.00 KB");
        assert_eq!(format_bytes(2 * 1024 * 1024), "2.00 MB");
    }

    #[test]
    fn test_format_bandwidth() {
        assert_eq!(format_bandwidth(500), "500 bps");
        assert_eq!(format_bandwidth(10_000), "10.00 Kbps");
        assert_eq!(format_bandwidth(10_000_000), "10.00 Mbps");
    }

    #[test]
    fn test_format_offset_and_duration() {
        assert_eq!(format_offset(MediaTime::from_micros(52_500)), "52.5ms");
        assert_eq!(format_duration(Duration::from_secs(30)), "30s");
        assert_eq!(format_duration(Duration::from_secs(3661)), "1h 01m 01s");
    }

    #[test]
    fn test_receiver_line() {
        let mut stats = ReceiverSnapshot::default();
        stats.decoder.packets_received = 50;
        stats.input.bytes = 10_000;
        stats.offsets = vec![(0xabcd, MediaTime::from_millis(60))];

        let line = receiver_line(&stats, Duration::from_secs(1));
        assert!(line.contains("Packets: 50"));
        assert!(line.contains("80.00 Kbps"));
        assert!(line.contains("0000abcd=60.0ms"));
    }

    #[test]
    fn test_sender_line_zero_elapsed() {
        let line = sender_line(&SenderSnapshot::default(), Duration::ZERO);
        assert!(line.contains("Rate: 0 bps"));
    }
}
