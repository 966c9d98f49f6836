//! MIP Sender - streams a raw PCM file as RTP
//!
//! timer -> PCM reader -> RTP encoder -> UDP output

use anyhow::Context;
use clap::Parser;
use crossbeam::channel::RecvTimeoutError;
use mip::core::{message_type, ChannelObserver, SystemClock};
use mip::io::{Destination, PacingTimer, PcmFileConfig, PcmFileReader, RtpSocket, UdpRtpOutput};
use mip::rtp::{RtpEncoder, RtpEncoderConfig};
use mip::{shared, Chain, MediaTime, MessageFilter};
use mip_cli::{display_sender_stats, init_logging, Config, SenderConfig, SenderSnapshot};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Parser, Debug)]
#[command(name = "mip-sender")]
#[command(about = "Stream raw s16le PCM audio over RTP", long_about = None)]
struct Args {
    /// Configuration file with a [sender] table
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Input file (raw signed 16-bit little-endian PCM)
    #[arg(short, long)]
    input: Option<String>,

    /// Destination (host:port), repeatable
    #[arg(short, long)]
    dest: Vec<SocketAddr>,

    /// Local bind address
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// Sample rate in Hz
    #[arg(long)]
    rate: Option<u32>,

    /// Channel count
    #[arg(long)]
    channels: Option<u16>,

    /// RTP payload type
    #[arg(long)]
    payload_type: Option<u8>,

    /// Send RTCP to port+1 instead of the RTP port
    #[arg(long)]
    no_rtcp_mux: bool,

    /// Restart the input at end of file
    #[arg(long = "loop")]
    looping: bool,

    /// Print an example configuration and exit
    #[arg(long)]
    example_config: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn load_config(args: &Args) -> anyhow::Result<SenderConfig> {
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("reading {}", path.display()))?
            .sender
            .unwrap_or_default(),
        None => SenderConfig::default(),
    };

    if let Some(input) = &args.input {
        config.input = input.clone();
    }
    if !args.dest.is_empty() {
        config.destinations = args.dest.clone();
    }
    if args.bind.is_some() {
        config.bind = args.bind;
    }
    if let Some(rate) = args.rate {
        config.sample_rate = rate;
    }
    if let Some(channels) = args.channels {
        config.channels = channels;
    }
    if let Some(payload_type) = args.payload_type {
        config.payload_type = payload_type;
    }
    if args.no_rtcp_mux {
        config.rtcp_mux = false;
    }
    if args.looping {
        config.looping = true;
    }

    config.validate()?;
    Ok(config)
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    if args.example_config {
        print!("{}", Config::example().to_toml()?);
        return Ok(());
    }
    init_logging(args.verbose);

    let config = load_config(&args)?;
    tracing::info!("MIP Sender starting...");

    let clock = Arc::new(SystemClock::new());

    let timer = shared(PacingTimer::new("timer", config.block_duration())?);
    let reader = shared(PcmFileReader::open(
        "pcm-reader",
        &config.input,
        PcmFileConfig {
            sample_rate: config.sample_rate,
            channels: config.channels,
            block_duration: MediaTime::from_duration(config.block_duration()),
            looping: config.looping,
            source_id: 0,
        },
    )?);

    let mut encoder_config = RtpEncoderConfig {
        payload_type: config.payload_type,
        max_payload_size: config.max_payload_size,
        ..Default::default()
    };
    if let Some(cname) = &config.cname {
        encoder_config.cname = cname.clone();
    }
    let encoder = shared(RtpEncoder::new(encoder_config, clock)?);

    let socket = RtpSocket::bind(config.bind_addr())?;
    tracing::info!("Sender bound to {}", socket.local_addr()?);
    let mut udp_output = UdpRtpOutput::new("udp-out", socket);
    for dest in &config.destinations {
        let destination = if config.rtcp_mux {
            Destination::muxed(*dest)
        } else {
            Destination::new(*dest)
        };
        tracing::info!("Sending to {} (RTCP {})", destination.rtp, destination.rtcp);
        udp_output.add_destination(destination);
    }
    let output = shared(udp_output);

    let (observer, exits) = ChannelObserver::new();
    let mut chain = Chain::new("sender").with_observer(Arc::new(observer));
    chain.set_chain_start(timer.clone())?;
    chain.add_connection(
        timer.clone(),
        reader.clone(),
        false,
        MessageFilter::types(message_type::SYSTEM),
    )?;
    chain.add_connection(
        reader.clone(),
        encoder.clone(),
        false,
        MessageFilter::types(message_type::AUDIO_RAW),
    )?;
    chain.add_connection(
        encoder.clone(),
        output.clone(),
        false,
        MessageFilter::types(message_type::RTP),
    )?;
    chain.start()?;

    tracing::info!(
        "Streaming {} ({} Hz, {} ch, payload type {})",
        config.input,
        config.sample_rate,
        config.channels,
        config.payload_type
    );

    let start = Instant::now();
    let mut last_stats = start;
    let exit = loop {
        match exits.recv_timeout(POLL_INTERVAL) {
            Ok(exit) => break Some(exit),
            Err(RecvTimeoutError::Disconnected) => break None,
            Err(RecvTimeoutError::Timeout) => {}
        }

        if last_stats.elapsed() >= config.stats_interval() {
            last_stats = Instant::now();
            // Separate statements so no two component locks overlap
            let encoder_stats = encoder.lock().stats();
            let output_stats = output.lock().stats();
            let snapshot = SenderSnapshot {
                encoder: encoder_stats,
                output: output_stats,
            };
            display_sender_stats(&snapshot, start.elapsed());
        }

        if reader.lock().is_finished() {
            tracing::info!("End of input reached");
            chain.stop()?;
            break exits.recv_timeout(POLL_INTERVAL).ok();
        }
    };
    println!();

    if let Some(failure) = exit.and_then(|exit| exit.failure) {
        anyhow::bail!("component '{}' failed: {}", failure.component, failure.error);
    }

    let stats = encoder.lock().stats();
    tracing::info!(
        "Sent {} packets ({} octets), {} RTCP reports",
        stats.packets_sent,
        stats.octets_sent,
        stats.reports_sent
    );
    Ok(())
}
