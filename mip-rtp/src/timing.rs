//! Per-source playout timing
//!
//! Each SSRC gets a [`SourceTiming`] that turns RTP timestamps into playout
//! times on the receiver's playback timeline:
//!
//! ```text
//! playout = origin + (extended - base) * unit + playback offset + sync offset
//! ```
//!
//! The playback offset is a jitter buffer depth driven by a control loop
//! ([`JitterController`]) that watches how early packets arrive relative to
//! the global playback time reported by the consumer.

use crate::rtcp::{SenderReport, UnitEstimator};
use crate::sync::{RtpSynchronizer, SyncRegistration};
use crate::timestamp::{TimestampUnwrapper, TimestampUpdate};
use mip_core::{MediaTime, Timer};
use std::collections::VecDeque;
use std::sync::Arc;

/// Insert diffs kept for the offset statistics
pub const HISTORY_LEN: usize = 16;

/// Margin the offset keeps above the expected worst-case arrival
pub const GUARD: MediaTime = MediaTime::from_micros(5);

/// Offset adjustment granularity
pub const ADJUST_STEP: MediaTime = MediaTime::from_millis(5);

/// Minimum spacing of offset increases
pub const INCREASE_INTERVAL: MediaTime = MediaTime::from_millis(200);

/// Decrease cooldown when the measured slack is large
pub const MIN_DECREASE_COOLDOWN: MediaTime = MediaTime::from_secs(5);

/// Decrease cooldown when the measured slack is barely above one step
pub const MAX_DECREASE_COOLDOWN: MediaTime = MediaTime::from_secs(60);

/// Slack at which the decrease cooldown reaches its minimum
pub const DECREASE_SLACK_SCALE: MediaTime = MediaTime::from_millis(100);

/// Spacing of cross-stream synchronization updates
pub const SYNC_INTERVAL: MediaTime = MediaTime::from_secs(2);

/// Idle time after which a source is forgotten
pub const SOURCE_TIMEOUT: MediaTime = MediaTime::from_secs(60);

/// Minimum spacing of source table sweeps
pub const SWEEP_INTERVAL: MediaTime = MediaTime::from_secs(60);

/// Playback offset bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimingConfig {
    pub initial_offset: MediaTime,
    pub max_offset: MediaTime,
}

impl Default for TimingConfig {
    fn default() -> Self {
        TimingConfig {
            initial_offset: MediaTime::from_millis(50),
            max_offset: MediaTime::from_secs(1),
        }
    }
}

/// Adaptive playback offset
#[derive(Debug, Clone)]
pub struct JitterController {
    offset: MediaTime,
    max_offset: MediaTime,
    history: VecDeque<MediaTime>,
    last_increase: Option<MediaTime>,
    last_change: MediaTime,
}

impl JitterController {
    pub fn new(config: &TimingConfig, now: MediaTime) -> Self {
        let max_offset = config.max_offset.clamp(MediaTime::ZERO, MediaTime::from_secs(3600));
        JitterController {
            offset: config.initial_offset.clamp(MediaTime::ZERO, max_offset),
            max_offset,
            history: VecDeque::with_capacity(HISTORY_LEN),
            last_increase: None,
            last_change: now,
        }
    }

    /// Current playback offset, never negative
    pub fn offset(&self) -> MediaTime {
        self.offset
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
    }

    /// Mean minus three standard deviations of the history
    pub fn target(&self) -> Option<MediaTime> {
        if self.history.len() < HISTORY_LEN {
            return None;
        }
        let n = self.history.len() as f64;
        let mean = self.history.iter().map(|d| d.as_micros() as f64).sum::<f64>() / n;
        let variance = self
            .history
            .iter()
            .map(|d| {
                let x = d.as_micros() as f64 - mean;
                x * x
            })
            .sum::<f64>()
            / n;
        Some(MediaTime::from_micros((mean - 3.0 * variance.sqrt()) as i64))
    }

    /// Record one insert diff; returns the signed offset change, if any
    pub fn record(&mut self, insert_diff: MediaTime, now: MediaTime) -> Option<MediaTime> {
        if self.history.len() == HISTORY_LEN {
            self.history.pop_front();
        }
        self.history.push_back(insert_diff);

        let target = self.target()?;
        let delta = if target < GUARD {
            let due = self
                .last_increase
                .map_or(true, |last| now - last >= INCREASE_INTERVAL);
            if !due || self.offset >= self.max_offset {
                return None;
            }
            self.last_increase = Some(now);
            ADJUST_STEP.clamp(MediaTime::ZERO, self.max_offset - self.offset)
        } else if target - ADJUST_STEP >= GUARD && self.offset > MediaTime::ZERO {
            if now - self.last_change < decrease_cooldown(target - GUARD) {
                return None;
            }
            -ADJUST_STEP.clamp(MediaTime::ZERO, self.offset)
        } else {
            return None;
        };

        self.offset += delta;
        self.last_change = now;
        // Past samples were measured with the old offset
        for diff in self.history.iter_mut() {
            *diff += delta;
        }
        Some(delta)
    }
}

/// Cooldown before shrinking the offset; shorter for larger slack
pub fn decrease_cooldown(slack: MediaTime) -> MediaTime {
    let ratio = (slack.as_micros() as f64 / DECREASE_SLACK_SCALE.as_micros() as f64).clamp(0.0, 1.0);
    let range = (MAX_DECREASE_COOLDOWN - MIN_DECREASE_COOLDOWN).as_micros() as f64;
    MAX_DECREASE_COOLDOWN - MediaTime::from_micros((range * ratio) as i64)
}

/// Timing state of one synchronization source
#[derive(Debug)]
pub struct SourceTiming {
    unwrapper: Option<TimestampUnwrapper>,
    timestamp_unit: Option<f64>,
    /// Playback time of the base timestamp
    origin: MediaTime,
    /// `origin` was taken from a reported playback time
    anchored: bool,
    jitter: JitterController,
    last_access: MediaTime,
    estimator: UnitEstimator,
    registration: Option<SyncRegistration>,
    sync_timer: Timer,
    sync_offset: MediaTime,
}

impl SourceTiming {
    pub fn new(config: &TimingConfig, now: MediaTime) -> Self {
        SourceTiming {
            unwrapper: None,
            timestamp_unit: None,
            origin: MediaTime::ZERO,
            anchored: false,
            jitter: JitterController::new(config, now),
            last_access: now,
            estimator: UnitEstimator::new(),
            registration: None,
            sync_timer: Timer::new(SYNC_INTERVAL),
            sync_offset: MediaTime::ZERO,
        }
    }

    pub fn touch(&mut self, now: MediaTime) {
        self.last_access = now;
    }

    pub fn last_access(&self) -> MediaTime {
        self.last_access
    }

    /// Seconds per timestamp tick
    pub fn timestamp_unit(&self) -> Option<f64> {
        self.timestamp_unit
    }

    pub fn set_timestamp_unit(&mut self, unit: f64) {
        if unit > 0.0 && unit.is_finite() {
            self.timestamp_unit = Some(unit);
        }
    }

    pub fn playback_offset(&self) -> MediaTime {
        self.jitter.offset()
    }

    pub fn sync_offset(&self) -> MediaTime {
        self.sync_offset
    }

    pub fn is_tracking(&self) -> bool {
        self.unwrapper.is_some()
    }

    /// Feed the timestamp of an accepted packet
    ///
    /// The first timestamp (and any restart) becomes the base and is mapped
    /// to `playback_time`, or to zero when no playback time is known.
    pub fn register_timestamp(
        &mut self,
        timestamp: u32,
        playback_time: Option<MediaTime>,
    ) -> TimestampUpdate {
        let update = match self.unwrapper.as_mut() {
            Some(unwrapper) => unwrapper.unwrap(timestamp),
            None => {
                let unwrapper = TimestampUnwrapper::new(timestamp);
                let extended = unwrapper.base();
                self.unwrapper = Some(unwrapper);
                TimestampUpdate {
                    extended,
                    reset: true,
                }
            }
        };
        if update.reset {
            self.origin = playback_time.unwrap_or(MediaTime::ZERO);
            self.anchored = playback_time.is_some();
            self.jitter.clear_history();
        }
        update
    }

    /// Extend a timestamp without advancing state
    pub fn extend(&self, timestamp: u32) -> Option<u64> {
        self.unwrapper.as_ref()?.peek(timestamp)
    }

    /// Time since the base timestamp
    pub fn stream_time(&self, extended: u64) -> Option<MediaTime> {
        let unit = self.timestamp_unit?;
        let base = self.unwrapper.as_ref()?.base();
        let ticks = extended.checked_sub(base)?;
        Some(MediaTime::from_secs_f64(ticks as f64 * unit))
    }

    /// Playout time on the receiver timeline
    pub fn playout_time(&self, extended: u64) -> Option<MediaTime> {
        Some(self.origin + self.stream_time(extended)? + self.jitter.offset() + self.sync_offset)
    }

    /// Run the offset control loop for one packet
    ///
    /// Returns the signed offset change, if one was made.
    pub fn adapt(
        &mut self,
        extended: u64,
        playback_time: MediaTime,
        now: MediaTime,
    ) -> Option<MediaTime> {
        let stream_time = self.stream_time(extended)?;
        if !self.anchored {
            self.origin = playback_time - stream_time;
            self.anchored = true;
            self.jitter.clear_history();
            return None;
        }
        let insert_diff = self.origin + stream_time + self.jitter.offset() - playback_time;
        self.jitter.record(insert_diff, now)
    }

    /// Feed a sender report of this source
    pub fn record_sender_report(&mut self, report: &SenderReport) -> Option<f64> {
        self.estimator.update(report)
    }

    /// Timestamp unit derived from sender reports
    pub fn unit_estimate(&self) -> Option<f64> {
        self.estimator.estimate()
    }

    pub fn cname(&self) -> Option<&str> {
        self.registration.as_ref().map(SyncRegistration::cname)
    }

    /// Join the synchronization group of `cname`
    pub fn set_cname(&mut self, cname: &str, synchronizer: &Arc<RtpSynchronizer>) {
        if self.cname() == Some(cname) {
            return;
        }
        // Leave the old group first
        self.registration = None;
        self.sync_offset = MediaTime::ZERO;
        self.registration = Some(synchronizer.register(cname));
    }

    /// Refresh the cross-stream offset if the sync interval has passed
    ///
    /// Returns true if the offset changed.
    pub fn update_sync(&mut self, now: MediaTime) -> bool {
        if self.registration.is_none() || !self.sync_timer.try_fire(now) {
            return false;
        }
        let Some(report) = self.estimator.last_report().copied() else {
            return false;
        };
        let Some(local) = self
            .extend(report.rtp_timestamp)
            .and_then(|extended| self.stream_time(extended))
            .map(|stream_time| self.origin + stream_time + self.jitter.offset())
        else {
            return false;
        };
        let Some(registration) = &self.registration else {
            return false;
        };

        let offset = registration
            .update(local - report.ntp_timestamp.as_media_time())
            .clamp(MediaTime::ZERO, MediaTime::from_secs(60));
        let changed = offset != self.sync_offset;
        self.sync_offset = offset;
        changed
    }
}
