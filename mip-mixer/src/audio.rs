//! Audio mixer
//!
//! Incoming raw audio is placed on a sample-accurate timeline, one queue of
//! fixed-size blocks per source. Each iteration the next block of every
//! source is summed into one output block; missing audio is silence.

use mip_core::{
    AudioFrame, ChainContext, Component, ComponentError, Feedback, IterationQueue, MediaTime,
    Message, MessageRef,
};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct AudioMixerConfig {
    pub name: String,
    pub sample_rate: u32,
    pub channels: u16,
    /// Length of one output block (one chain iteration)
    pub block_duration: MediaTime,
    /// How far ahead of the playback time input is accepted
    pub max_buffer: MediaTime,
    /// Playback time of the first output block
    pub start_time: MediaTime,
    /// Source id stamped on mixed blocks
    pub output_source_id: u64,
}

impl Default for AudioMixerConfig {
    fn default() -> Self {
        AudioMixerConfig {
            name: "audio-mixer".to_string(),
            sample_rate: 8000,
            channels: 1,
            block_duration: MediaTime::from_millis(20),
            max_buffer: MediaTime::from_secs(5),
            start_time: MediaTime::ZERO,
            output_source_id: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AudioMixerStats {
    pub frames_in: u64,
    pub blocks_out: u64,
    /// Input that ended before the current playback time
    pub late_dropped: u64,
    /// Input starting beyond the buffering horizon
    pub early_dropped: u64,
    /// Input with the wrong sample rate or channel layout
    pub mismatched_dropped: u64,
}

#[derive(Debug, Default)]
struct SourceQueue {
    /// Partially filled blocks by block index
    blocks: BTreeMap<i64, Vec<f32>>,
}

pub struct AudioMixer {
    config: AudioMixerConfig,
    block_frames: usize,
    next_block: i64,
    sources: HashMap<u64, SourceQueue>,
    mixed_iteration: Option<u64>,
    queue: IterationQueue,
    stats: AudioMixerStats,
}

impl AudioMixer {
    pub fn new(config: AudioMixerConfig) -> Result<Self, ComponentError> {
        if config.sample_rate == 0 || config.channels == 0 {
            return Err(ComponentError::Init(format!(
                "invalid audio format: {} Hz, {} channels",
                config.sample_rate, config.channels
            )));
        }
        let block_frames = frame_position(config.block_duration, config.sample_rate);
        if block_frames <= 0 {
            return Err(ComponentError::Init(format!(
                "block duration {} holds no samples",
                config.block_duration
            )));
        }
        let next_block = frame_position(config.start_time, config.sample_rate).div_euclid(block_frames);

        Ok(AudioMixer {
            config,
            block_frames: block_frames as usize,
            next_block,
            sources: HashMap::new(),
            mixed_iteration: None,
            queue: IterationQueue::new(),
            stats: AudioMixerStats::default(),
        })
    }

    /// Start of the next block to be mixed
    pub fn playback_time(&self) -> MediaTime {
        self.block_start(self.next_block)
    }

    /// Sample frames per output block
    pub fn block_frames(&self) -> usize {
        self.block_frames
    }

    pub fn stats(&self) -> AudioMixerStats {
        self.stats
    }

    /// Sources with buffered audio
    pub fn active_sources(&self) -> usize {
        self.sources.len()
    }

    fn block_start(&self, index: i64) -> MediaTime {
        let frames = index as i128 * self.block_frames as i128;
        MediaTime::from_micros((frames * 1_000_000 / self.config.sample_rate as i128) as i64)
    }

    fn accept(&mut self, frame: &AudioFrame) {
        let channels = self.config.channels as usize;
        if frame.sample_rate != self.config.sample_rate
            || frame.channels != self.config.channels
            || frame.samples.len() % channels != 0
        {
            self.stats.mismatched_dropped += 1;
            debug!(
                mixer = %self.config.name,
                source = frame.source_id,
                rate = frame.sample_rate,
                channels = frame.channels,
                "dropping audio with mismatched format"
            );
            return;
        }

        let block = self.block_frames as i64;
        let start = frame_position(frame.time, self.config.sample_rate);
        let end = start + frame.frames() as i64;
        let first_live = self.next_block * block;
        let horizon = first_live + frame_position(self.config.max_buffer, self.config.sample_rate);

        if end <= first_live {
            self.stats.late_dropped += 1;
            debug!(mixer = %self.config.name, source = frame.source_id, time = %frame.time, "late audio dropped");
            return;
        }
        if start >= horizon {
            self.stats.early_dropped += 1;
            debug!(mixer = %self.config.name, source = frame.source_id, time = %frame.time, "audio too far ahead");
            return;
        }

        let queue = self.sources.entry(frame.source_id).or_default();
        for (i, samples) in frame.samples.chunks_exact(channels).enumerate() {
            let position = start + i as i64;
            if position < first_live || position >= horizon {
                continue;
            }
            let offset = position.rem_euclid(block) as usize * channels;
            let buffer = queue
                .blocks
                .entry(position.div_euclid(block))
                .or_insert_with(|| vec![0.0; block as usize * channels]);
            for (slot, sample) in buffer[offset..offset + channels].iter_mut().zip(samples) {
                *slot += *sample;
            }
        }
        self.stats.frames_in += 1;
    }

    fn mix_next(&mut self) -> AudioFrame {
        let index = self.next_block;
        let mut samples = vec![0.0f32; self.block_frames * self.config.channels as usize];

        for queue in self.sources.values_mut() {
            // Anything older than this block can no longer play
            queue.blocks = queue.blocks.split_off(&index);
            if let Some(block) = queue.blocks.remove(&index) {
                for (out, sample) in samples.iter_mut().zip(&block) {
                    *out += *sample;
                }
            }
        }
        self.sources.retain(|_, queue| !queue.blocks.is_empty());

        for sample in samples.iter_mut() {
            *sample = sample.clamp(-1.0, 1.0);
        }
        self.next_block += 1;

        AudioFrame {
            sample_rate: self.config.sample_rate,
            channels: self.config.channels,
            samples,
            time: self.block_start(index),
            source_id: self.config.output_source_id,
        }
    }
}

/// Sample frame index of `time` on a timeline starting at zero
fn frame_position(time: MediaTime, sample_rate: u32) -> i64 {
    let scaled = time.as_micros() as i128 * sample_rate as i128;
    // Round to nearest, away from zero on ties
    let rounded = if scaled >= 0 {
        (scaled + 500_000) / 1_000_000
    } else {
        (scaled - 500_000) / 1_000_000
    };
    rounded as i64
}

impl Component for AudioMixer {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn push(
        &mut self,
        _chain: &ChainContext,
        _iteration: u64,
        message: &MessageRef,
    ) -> Result<(), ComponentError> {
        match message.as_ref() {
            Message::AudioRaw(frame) => {
                self.accept(frame);
                Ok(())
            }
            other => Err(ComponentError::unexpected("raw audio", other)),
        }
    }

    /// The first pull of an iteration mixes the next block
    fn pull(
        &mut self,
        _chain: &ChainContext,
        iteration: u64,
    ) -> Result<Option<MessageRef>, ComponentError> {
        if self.mixed_iteration != Some(iteration) {
            self.mixed_iteration = Some(iteration);
            self.queue.begin(iteration);
            let block = self.mix_next();
            self.queue.push(Message::AudioRaw(block).into_ref());
            self.stats.blocks_out += 1;
        }
        Ok(self.queue.next())
    }

    fn process_feedback(
        &mut self,
        _chain: &ChainContext,
        feedback: &mut Feedback,
    ) -> Result<(), ComponentError> {
        feedback.playback_stream_time = Some(self.playback_time());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mixer() -> AudioMixer {
        AudioMixer::new(AudioMixerConfig {
            sample_rate: 1000,
            block_duration: MediaTime::from_millis(10),
            ..Default::default()
        })
        .unwrap()
    }

    fn audio(source_id: u64, time_ms: i64, samples: Vec<f32>) -> MessageRef {
        Message::AudioRaw(AudioFrame {
            sample_rate: 1000,
            channels: 1,
            samples,
            time: MediaTime::from_millis(time_ms),
            source_id,
        })
        .into_ref()
    }

    fn block(mixer: &mut AudioMixer, ctx: &ChainContext, iteration: u64) -> AudioFrame {
        let message = mixer.pull(ctx, iteration).unwrap().unwrap();
        assert!(mixer.pull(ctx, iteration).unwrap().is_none());
        match message.as_ref() {
            Message::AudioRaw(frame) => frame.clone(),
            other => panic!("unexpected {}", other.kind_name()),
        }
    }

    #[test]
    fn test_silence_when_idle() {
        let mut mixer = mixer();
        let ctx = ChainContext::new("test");
        let first = block(&mut mixer, &ctx, 1);
        assert_eq!(first.samples, vec![0.0; 10]);
        assert_eq!(first.time, MediaTime::ZERO);

        // Same iteration: the same block again
        let again = mixer.pull(&ctx, 1).unwrap().unwrap();
        assert_eq!(again.time(), Some(MediaTime::ZERO));

        assert_eq!(block(&mut mixer, &ctx, 2).time, MediaTime::from_millis(10));
        assert_eq!(mixer.stats().blocks_out, 2);
    }

    #[test]
    fn test_sources_are_summed_and_split() {
        let mut mixer = mixer();
        let ctx = ChainContext::new("test");
        mixer.push(&ctx, 1, &audio(1, 0, vec![0.25; 10])).unwrap();
        // Spans the first two blocks
        mixer.push(&ctx, 1, &audio(2, 5, vec![0.5; 10])).unwrap();
        assert_eq!(mixer.active_sources(), 2);

        let first = block(&mut mixer, &ctx, 1);
        assert_eq!(&first.samples[..5], &[0.25; 5]);
        assert_eq!(&first.samples[5..], &[0.75; 5]);

        let second = block(&mut mixer, &ctx, 2);
        assert_eq!(&second.samples[..5], &[0.5; 5]);
        assert_eq!(&second.samples[5..], &[0.0; 5]);
        assert_eq!(mixer.active_sources(), 0);
    }

    #[test]
    fn test_output_is_clipped() {
        let mut mixer = mixer();
        let ctx = ChainContext::new("test");
        mixer.push(&ctx, 1, &audio(1, 0, vec![0.8; 10])).unwrap();
        mixer.push(&ctx, 1, &audio(2, 0, vec![0.8; 10])).unwrap();
        assert_eq!(block(&mut mixer, &ctx, 1).samples, vec![1.0; 10]);
    }

    #[test]
    fn test_late_early_and_mismatched_input_dropped() {
        let mut mixer = mixer();
        let ctx = ChainContext::new("test");
        block(&mut mixer, &ctx, 1);
        block(&mut mixer, &ctx, 2);

        mixer.push(&ctx, 3, &audio(1, 0, vec![0.1; 10])).unwrap();
        mixer.push(&ctx, 3, &audio(1, 60_000, vec![0.1; 10])).unwrap();
        let stereo = Message::AudioRaw(AudioFrame {
            sample_rate: 1000,
            channels: 2,
            samples: vec![0.1; 20],
            time: MediaTime::from_millis(20),
            source_id: 1,
        })
        .into_ref();
        mixer.push(&ctx, 3, &stereo).unwrap();

        let stats = mixer.stats();
        assert_eq!(stats.late_dropped, 1);
        assert_eq!(stats.early_dropped, 1);
        assert_eq!(stats.mismatched_dropped, 1);
        assert_eq!(stats.frames_in, 0);
    }

    #[test]
    fn test_partially_late_input_keeps_the_rest() {
        let mut mixer = mixer();
        let ctx = ChainContext::new("test");
        block(&mut mixer, &ctx, 1);

        mixer.push(&ctx, 2, &audio(1, 5, vec![0.5; 10])).unwrap();
        let out = block(&mut mixer, &ctx, 2);
        assert_eq!(out.time, MediaTime::from_millis(10));
        assert_eq!(&out.samples[..5], &[0.5; 5]);
    }

    #[test]
    fn test_feedback_reports_playback_time() {
        let mut mixer = mixer();
        let ctx = ChainContext::new("test");
        block(&mut mixer, &ctx, 1);

        let mut feedback = Feedback::new(0);
        mixer.process_feedback(&ctx, &mut feedback).unwrap();
        assert_eq!(feedback.playback_stream_time, Some(MediaTime::from_millis(10)));
    }

    #[test]
    fn test_rejects_other_messages() {
        let mut mixer = mixer();
        let ctx = ChainContext::new("test");
        let tick = Message::System(mip_core::SystemMessage::IsTime).into_ref();
        assert!(mixer.push(&ctx, 1, &tick).is_err());
        assert!(AudioMixer::new(AudioMixerConfig {
            sample_rate: 0,
            ..Default::default()
        })
        .is_err());
    }
}
