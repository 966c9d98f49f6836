//! Video mixer
//!
//! Keeps a short time-ordered queue of pictures per source. Each iteration
//! the playback time advances by one frame interval and every source emits
//! its latest picture that is due; older due pictures are skipped.

use mip_core::{
    ChainContext, Component, ComponentError, Feedback, IterationQueue, MediaTime, Message,
    MessageRef,
};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct VideoMixerConfig {
    pub name: String,
    /// Playback advance per iteration
    pub frame_interval: MediaTime,
    /// Pictures buffered per source before the oldest is discarded
    pub max_queued_frames: usize,
    /// Playback time of the first iteration
    pub start_time: MediaTime,
    /// Idle time after which a source without pending pictures is forgotten
    pub source_timeout: MediaTime,
}

impl Default for VideoMixerConfig {
    fn default() -> Self {
        VideoMixerConfig {
            name: "video-mixer".to_string(),
            frame_interval: MediaTime::from_millis(40),
            max_queued_frames: 32,
            start_time: MediaTime::ZERO,
            source_timeout: MediaTime::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VideoMixerStats {
    pub frames_in: u64,
    pub frames_out: u64,
    /// Due pictures replaced by a newer due picture
    pub skipped: u64,
    /// Pictures older than the last one shown for their source
    pub late_dropped: u64,
    /// Pictures discarded because the source queue was full
    pub overflow_dropped: u64,
}

#[derive(Debug, Default)]
struct SourceFrames {
    pending: BTreeMap<MediaTime, MessageRef>,
    last_shown: Option<MediaTime>,
}

pub struct VideoMixer {
    config: VideoMixerConfig,
    playback_time: MediaTime,
    sources: HashMap<u64, SourceFrames>,
    mixed_iteration: Option<u64>,
    queue: IterationQueue,
    stats: VideoMixerStats,
}

impl VideoMixer {
    pub fn new(config: VideoMixerConfig) -> Result<Self, ComponentError> {
        if config.frame_interval <= MediaTime::ZERO || config.max_queued_frames == 0 {
            return Err(ComponentError::Init(
                "frame interval and queue length must be positive".to_string(),
            ));
        }
        Ok(VideoMixer {
            playback_time: config.start_time,
            config,
            sources: HashMap::new(),
            mixed_iteration: None,
            queue: IterationQueue::new(),
            stats: VideoMixerStats::default(),
        })
    }

    /// Playback time of the next iteration
    pub fn playback_time(&self) -> MediaTime {
        self.playback_time
    }

    pub fn stats(&self) -> VideoMixerStats {
        self.stats
    }

    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    fn accept(&mut self, message: &MessageRef, time: MediaTime, source_id: u64) {
        let source = self.sources.entry(source_id).or_default();
        if source.last_shown.is_some_and(|shown| time <= shown) {
            self.stats.late_dropped += 1;
            debug!(mixer = %self.config.name, source = source_id, time = %time, "late picture dropped");
            return;
        }
        source.pending.insert(time, message.clone());
        while source.pending.len() > self.config.max_queued_frames {
            source.pending.pop_first();
            self.stats.overflow_dropped += 1;
        }
        self.stats.frames_in += 1;
    }

    fn emit_due(&mut self) {
        let now = self.playback_time;
        let mut sources: Vec<_> = self.sources.iter_mut().collect();
        // Stable output order across iterations
        sources.sort_unstable_by_key(|(id, _)| **id);

        for (_, source) in sources {
            let later = source.pending.split_off(&(now + MediaTime::from_micros(1)));
            let due = std::mem::replace(&mut source.pending, later);
            let count = due.len() as u64;
            if let Some((time, picture)) = due.into_iter().next_back() {
                self.stats.skipped += count - 1;
                self.stats.frames_out += 1;
                source.last_shown = Some(time);
                self.queue.push(picture);
            }
        }

        let timeout = self.config.source_timeout;
        self.sources.retain(|_, source| {
            !source.pending.is_empty() || source.last_shown.is_some_and(|shown| now - shown < timeout)
        });
    }
}

impl Component for VideoMixer {
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
            Message::VideoRaw(frame) => self.accept(message, frame.time, frame.source_id),
            Message::VideoEncoded(frame) => self.accept(message, frame.time, frame.source_id),
            other => return Err(ComponentError::unexpected("video", other)),
        }
        Ok(())
    }

    fn pull(
        &mut self,
        _chain: &ChainContext,
        iteration: u64,
    ) -> Result<Option<MessageRef>, ComponentError> {
        if self.mixed_iteration != Some(iteration) {
            self.mixed_iteration = Some(iteration);
            self.queue.begin(iteration);
            self.emit_due();
            self.playback_time += self.config.frame_interval;
        }
        Ok(self.queue.next())
    }

    fn process_feedback(
        &mut self,
        _chain: &ChainContext,
        feedback: &mut Feedback,
    ) -> Result<(), ComponentError> {
        feedback.playback_stream_time = Some(self.playback_time);
        Ok(())
    }
}
