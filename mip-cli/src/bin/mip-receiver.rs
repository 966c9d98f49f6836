//! MIP Receiver - plays out RTP audio into a raw PCM file
//!
//! timer -> UDP input -> RTP decoder => audio mixer -> PCM writer
//!
//! The decoder and mixer form a feedback chain, so the decoder learns the
//! mixer's playback time and adapts each source's playout offset to it.

use anyhow::Context;
use clap::Parser;
use crossbeam::channel::RecvTimeoutError;
use mip::core::{message_type, ChannelObserver, SystemClock};
use mip::io::{PacingTimer, PcmFileWriter, UdpRtpInput};
use mip::mixer::{AudioMixer, AudioMixerConfig};
use mip::rtp::{L16Decoder, RtpDecoder, RtpDecoderConfig, RtpSynchronizer, TimingConfig};
use mip::{shared, Chain, MediaTime, MessageFilter};
use mip_cli::{display_receiver_stats, init_logging, Config, ReceiverConfig, ReceiverSnapshot};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Parser, Debug)]
#[command(name = "mip-receiver")]
#[command(about = "Receive RTP audio into a raw s16le PCM file", long_about = None)]
struct Args {
    /// Configuration file with a [receiver] table
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Output file (raw signed 16-bit little-endian PCM)
    #[arg(short, long)]
    output: Option<String>,

    /// Listen address (host:port)
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Sample rate in Hz
    #[arg(long)]
    rate: Option<u32>,

    /// Channel count
    #[arg(long)]
    channels: Option<u16>,

    /// RTP payload type
    #[arg(long)]
    payload_type: Option<u8>,

    /// Initial playout offset in milliseconds
    #[arg(long)]
    offset: Option<u64>,

    /// Stop after this many seconds
    #[arg(long)]
    duration: Option<u64>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn load_config(args: &Args) -> anyhow::Result<ReceiverConfig> {
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("reading {}", path.display()))?
            .receiver
            .unwrap_or_default(),
        None => ReceiverConfig::default(),
    };

    if let Some(output) = &args.output {
        config.output = output.clone();
    }
    if let Some(listen) = args.listen {
        config.listen = listen;
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
    if let Some(offset) = args.offset {
        config.initial_offset_ms = offset;
    }

    config.validate()?;
    Ok(config)
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let config = load_config(&args)?;
    tracing::info!("MIP Receiver starting...");

    let clock = Arc::new(SystemClock::new());
    let block = MediaTime::from_duration(config.block_duration());

    let timer = shared(PacingTimer::new("timer", config.block_duration())?);
    let input = shared(UdpRtpInput::bind("udp-in", config.listen, clock.clone())?);
    tracing::info!("Listening on {}", input.lock().local_addr()?);

    let mut rtp_decoder = RtpDecoder::new(
        RtpDecoderConfig {
            timing: TimingConfig {
                initial_offset: MediaTime::from_millis(config.initial_offset_ms as i64),
                max_offset: MediaTime::from_millis(config.max_offset_ms as i64),
            },
            reassembly_window: config.reassembly_window,
            ..Default::default()
        },
        clock,
    )?;
    rtp_decoder.register_decoder(
        config.payload_type,
        Box::new(L16Decoder::new(config.sample_rate, config.channels)),
    );
    rtp_decoder.set_synchronizer(Some(RtpSynchronizer::new()));
    let decoder = shared(rtp_decoder);

    let mixer = shared(AudioMixer::new(AudioMixerConfig {
        sample_rate: config.sample_rate,
        channels: config.channels,
        block_duration: block,
        ..Default::default()
    })?);
    let writer = shared(PcmFileWriter::create("pcm-writer", &config.output)?);

    let (observer, exits) = ChannelObserver::new();
    let mut chain = Chain::new("receiver").with_observer(Arc::new(observer));
    chain.set_chain_start(timer.clone())?;
    chain.add_connection(
        timer.clone(),
        input.clone(),
        false,
        MessageFilter::types(message_type::SYSTEM),
    )?;
    chain.add_connection(
        input.clone(),
        decoder.clone(),
        false,
        MessageFilter::types(message_type::RTP),
    )?;
    chain.add_connection(
        decoder.clone(),
        mixer.clone(),
        true,
        MessageFilter::types(message_type::AUDIO_RAW),
    )?;
    chain.add_connection(
        mixer.clone(),
        writer.clone(),
        false,
        MessageFilter::types(message_type::AUDIO_RAW),
    )?;
    chain.start()?;

    tracing::info!(
        "Writing {} ({} Hz, {} ch, payload type {})",
        config.output,
        config.sample_rate,
        config.channels,
        config.payload_type
    );

    let start = Instant::now();
    let deadline = args.duration.map(|secs| start + Duration::from_secs(secs));
    let mut last_stats = start;
    let exit = loop {
        match exits.recv_timeout(POLL_INTERVAL) {
            Ok(exit) => break Some(exit),
            Err(RecvTimeoutError::Disconnected) => break None,
            Err(RecvTimeoutError::Timeout) => {}
        }

        if last_stats.elapsed() >= config.stats_interval() {
            last_stats = Instant::now();
            // One lock at a time; the chain thread takes pairs in address order
            let (decoder_stats, offsets) = {
                let decoder = decoder.lock();
                (decoder.stats(), decoder.source_offsets())
            };
            let input_stats = input.lock().stats();
            let mixer_stats = mixer.lock().stats();
            let snapshot = ReceiverSnapshot {
                input: input_stats,
                decoder: decoder_stats,
                mixer: mixer_stats,
                offsets,
            };
            display_receiver_stats(&snapshot, start.elapsed());
        }

        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            chain.stop()?;
            break exits.recv_timeout(POLL_INTERVAL).ok();
        }
    };
    println!();

    writer.lock().flush()?;
    if let Some(failure) = exit.and_then(|exit| exit.failure) {
        anyhow::bail!("component '{}' failed: {}", failure.component, failure.error);
    }

    tracing::info!("Wrote {} frames", writer.lock().frames_written());
    Ok(())
}
