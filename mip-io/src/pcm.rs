//! Raw PCM file components
//!
//! Files hold interleaved signed 16-bit little-endian samples with no header.

use mip_core::{
    AudioFrame, ChainContext, Component, ComponentError, IterationQueue, MediaTime, Message,
    MessageRef,
};
use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const BYTES_PER_SAMPLE: usize = 2;

#[derive(Debug, Clone)]
pub struct PcmFileConfig {
    pub sample_rate: u32,
    pub channels: u16,
    /// Audio read per timer tick
    pub block_duration: MediaTime,
    /// Rewind at end of file instead of stopping
    pub looping: bool,
    pub source_id: u64,
}

impl Default for PcmFileConfig {
    fn default() -> Self {
        PcmFileConfig {
            sample_rate: 8000,
            channels: 1,
            block_duration: MediaTime::from_millis(20),
            looping: false,
            source_id: 0,
        }
    }
}

impl PcmFileConfig {
    fn block_frames(&self) -> usize {
        (self.block_duration.as_micros() * self.sample_rate as i64 / 1_000_000).max(0) as usize
    }
}

/// Reads one block of audio per system message
pub struct PcmFileReader {
    name: String,
    path: PathBuf,
    config: PcmFileConfig,
    reader: BufReader<File>,
    block: Vec<u8>,
    frames_read: u64,
    finished: bool,
    queue: IterationQueue,
}

impl PcmFileReader {
    pub fn open(
        name: impl Into<String>,
        path: impl AsRef<Path>,
        config: PcmFileConfig,
    ) -> Result<Self, ComponentError> {
        let frames = config.block_frames();
        if config.channels == 0 || frames == 0 {
            return Err(ComponentError::Init(
                "channels and block length must be positive".to_string(),
            ));
        }
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        Ok(PcmFileReader {
            name: name.into(),
            path,
            block: vec![0u8; frames * config.channels as usize * BYTES_PER_SAMPLE],
            config,
            reader: BufReader::new(file),
            frames_read: 0,
            finished: false,
            queue: IterationQueue::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// End of file reached with looping disabled
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn frames_read(&self) -> u64 {
        self.frames_read
    }

    /// Fill as much of the block as the file allows
    fn fill(&mut self) -> Result<usize, ComponentError> {
        let mut filled = 0;
        let mut rewound = false;
        while filled < self.block.len() {
            match self.reader.read(&mut self.block[filled..]) {
                Ok(0) => {
                    // An empty file would rewind forever
                    if !self.config.looping || (rewound && filled == 0) {
                        break;
                    }
                    self.reader.seek(SeekFrom::Start(0))?;
                    rewound = true;
                }
                Ok(n) => filled += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(filled)
    }

    fn read_block(&mut self) -> Result<(), ComponentError> {
        if self.finished {
            return Ok(());
        }
        let frame_bytes = self.config.channels as usize * BYTES_PER_SAMPLE;
        let filled = self.fill()?;
        let usable = filled - filled % frame_bytes;
        if usable < self.block.len() {
            self.finished = true;
            tracing::info!(reader = %self.name, path = %self.path.display(), "end of file");
        }
        if usable == 0 {
            return Ok(());
        }

        let samples: Vec<f32> = self.block[..usable]
            .chunks_exact(BYTES_PER_SAMPLE)
            .map(|s| i16::from_le_bytes([s[0], s[1]]) as f32 / 32768.0)
            .collect();
        let frames = (usable / frame_bytes) as u64;
        let time = MediaTime::from_micros(
            (self.frames_read as i128 * 1_000_000 / self.config.sample_rate as i128) as i64,
        );
        self.frames_read += frames;

        self.queue.push(
            Message::AudioRaw(AudioFrame {
                sample_rate: self.config.sample_rate,
                channels: self.config.channels,
                samples,
                time,
                source_id: self.config.source_id,
            })
            .into_ref(),
        );
        Ok(())
    }
}

impl Component for PcmFileReader {
    fn name(&self) -> &str {
        &self.name
    }

    fn push(
        &mut self,
        _chain: &ChainContext,
        iteration: u64,
        message: &MessageRef,
    ) -> Result<(), ComponentError> {
        if !message.is_system() {
            return Err(ComponentError::unexpected("system", message));
        }
        self.queue.begin(iteration);
        self.read_block()
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

/// Appends raw audio to a file
pub struct PcmFileWriter {
    name: String,
    writer: BufWriter<File>,
    frames_written: u64,
    format: Option<(u32, u16)>,
    mismatched: u64,
}

impl PcmFileWriter {
    pub fn create(name: impl Into<String>, path: impl AsRef<Path>) -> Result<Self, ComponentError> {
        let file = File::create(path)?;
        Ok(PcmFileWriter {
            name: name.into(),
            writer: BufWriter::new(file),
            frames_written: 0,
            format: None,
            mismatched: 0,
        })
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    /// Blocks dropped because their format differed from the first block
    pub fn mismatched(&self) -> u64 {
        self.mismatched
    }

    pub fn flush(&mut self) -> Result<(), ComponentError> {
        self.writer.flush()?;
        Ok(())
    }

    fn write_frame(&mut self, frame: &AudioFrame) -> Result<(), ComponentError> {
        let format = (frame.sample_rate, frame.channels);
        if *self.format.get_or_insert(format) != format {
            self.mismatched += 1;
            tracing::debug!(writer = %self.name, "audio format changed, block dropped");
            return Ok(());
        }
        for sample in &frame.samples {
            let value = (sample.clamp(-1.0, 1.0) * 32767.0).round() as i16;
            self.writer.write_all(&value.to_le_bytes())?;
        }
        self.frames_written += frame.frames() as u64;
        Ok(())
    }
}

impl Component for PcmFileWriter {
    fn name(&self) -> &str {
        &self.name
    }

    fn push(
        &mut self,
        _chain: &ChainContext,
        _iteration: u64,
        message: &MessageRef,
    ) -> Result<(), ComponentError> {
        match message.as_ref() {
            Message::AudioRaw(frame) => self.write_frame(frame),
            other => Err(ComponentError::unexpected("raw audio", other)),
        }
    }

    fn pull(
        &mut self,
        _chain: &ChainContext,
        _iteration: u64,
    ) -> Result<Option<MessageRef>, ComponentError> {
        Ok(None)
    }
}

impl Drop for PcmFileWriter {
    fn drop(&mut self) {
        if let Err(err) = self.writer.flush() {
            tracing::warn!(writer = %self.name, "flush on close failed: {}", err);
        }
    }
}
