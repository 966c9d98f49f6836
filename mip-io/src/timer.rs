//! Pacing timer component
//!
//! Sits at the start of a chain. Each `WaitTime` it receives blocks until the
//! next tick is due and then emits `IsTime`; an `IsTime` input is passed on
//! at once. Sleeping happens in short slices so a chain stop request is
//! noticed within one slice.

use mip_core::{
    ChainContext, Component, ComponentError, IterationQueue, Message, MessageRef, SystemMessage,
};
use std::time::{Duration, Instant};

/// Longest uninterrupted sleep
const SLEEP_SLICE: Duration = Duration::from_millis(10);

/// Ticks the timer may fall behind before it drops them
const MAX_LAG_TICKS: u32 = 10;

pub struct PacingTimer {
    name: String,
    interval: Duration,
    next_tick: Option<Instant>,
    tick: MessageRef,
    queue: IterationQueue,
    ticks: u64,
    skipped: u64,
}

impl PacingTimer {
    pub fn new(name: impl Into<String>, interval: Duration) -> Result<Self, ComponentError> {
        if interval.is_zero() {
            return Err(ComponentError::Init("timer interval must be positive".to_string()));
        }
        Ok(PacingTimer {
            name: name.into(),
            interval,
            next_tick: None,
            tick: Message::System(SystemMessage::IsTime).into_ref(),
            queue: IterationQueue::new(),
            ticks: 0,
            skipped: 0,
        })
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Ticks emitted so far
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Ticks dropped after falling too far behind
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    fn wait(&mut self, chain: &ChainContext) {
        let now = Instant::now();
        let deadline = *self.next_tick.get_or_insert(now);

        let mut current = now;
        while current < deadline && !chain.is_stopping() {
            std::thread::sleep((deadline - current).min(SLEEP_SLICE));
            current = Instant::now();
        }

        let mut next = deadline + self.interval;
        if current > deadline + self.interval * MAX_LAG_TICKS {
            // Too far behind to catch up; restart the schedule
            let lag = current.duration_since(deadline);
            let dropped = (lag.as_nanos() / self.interval.as_nanos()) as u64;
            self.skipped += dropped;
            tracing::warn!(timer = %self.name, dropped, "timer fell behind, skipping ticks");
            next = current + self.interval;
        }
        self.next_tick = Some(next);
    }
}

impl Component for PacingTimer {
    fn name(&self) -> &str {
        &self.name
    }

    fn push(
        &mut self,
        chain: &ChainContext,
        iteration: u64,
        message: &MessageRef,
    ) -> Result<(), ComponentError> {
        self.queue.begin(iteration);
        match message.as_ref() {
            Message::System(SystemMessage::WaitTime) => self.wait(chain),
            Message::System(SystemMessage::IsTime) => {}
            other => return Err(ComponentError::unexpected("system", other)),
        }
        self.ticks += 1;
        self.queue.push(self.tick.clone());
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
