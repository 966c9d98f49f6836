//! Timestamp and Sequence Number Unwrapping
//!
//! RTP timestamps are 32-bit and sequence numbers 16-bit; both wrap. The
//! unwrappers here extend them to 64 bits so that later stages can compute
//! differences without caring about wraparound.
//!
//! Timestamps use a 2^28 plausibility window: a jump larger than that in
//! either direction is treated as a stream restart rather than progress.

/// Largest timestamp distance treated as plausible progress
pub const WRAP_THRESHOLD: u32 = 1 << 28;

/// Result of feeding one timestamp to a [`TimestampUnwrapper`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimestampUpdate {
    /// 64-bit extended timestamp
    pub extended: u64,
    /// The stream restarted; `extended` is the new base
    pub reset: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Classification {
    /// Same cycle as `prev` or the cycle after it
    Forward { extended: u64, cycles: u64 },
    /// Older than `prev`; state does not move
    Late(u64),
    Reset,
}

/// Extends 32-bit RTP timestamps of one source
#[derive(Debug, Clone)]
pub struct TimestampUnwrapper {
    base: u64,
    prev: u32,
    cycles: u64,
}

impl TimestampUnwrapper {
    /// Start tracking with `first` as the base timestamp
    pub fn new(first: u32) -> Self {
        TimestampUnwrapper {
            base: first as u64,
            prev: first,
            cycles: 0,
        }
    }

    /// Extended value of the base timestamp
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Most recent extended timestamp
    pub fn last(&self) -> u64 {
        extend(self.cycles, self.prev)
    }

    /// Number of completed wraps
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Extend `ts`, advancing the tracking state
    pub fn unwrap(&mut self, ts: u32) -> TimestampUpdate {
        match self.classify(ts) {
            Classification::Forward { extended, cycles } => {
                self.prev = ts;
                self.cycles = cycles;
                TimestampUpdate {
                    extended,
                    reset: false,
                }
            }
            Classification::Late(extended) => TimestampUpdate {
                extended,
                reset: false,
            },
            Classification::Reset => {
                *self = TimestampUnwrapper::new(ts);
                TimestampUpdate {
                    extended: self.base,
                    reset: true,
                }
            }
        }
    }

    /// Extend `ts` without changing state
    ///
    /// Returns `None` where [`unwrap`](Self::unwrap) would reset.
    pub fn peek(&self, ts: u32) -> Option<u64> {
        match self.classify(ts) {
            Classification::Forward { extended, .. } | Classification::Late(extended) => {
                Some(extended)
            }
            Classification::Reset => None,
        }
    }

    fn classify(&self, ts: u32) -> Classification {
        let forward = ts.wrapping_sub(self.prev);
        let backward = self.prev.wrapping_sub(ts);

        if forward < WRAP_THRESHOLD {
            let cycles = if ts < self.prev {
                self.cycles + 1
            } else {
                self.cycles
            };
            return Classification::Forward {
                extended: extend(cycles, ts),
                cycles,
            };
        }

        if backward < WRAP_THRESHOLD {
            let extended = if ts > self.prev {
                // Late packet from before the last wrap
                if self.cycles == 0 {
                    return Classification::Reset;
                }
                extend(self.cycles - 1, ts)
            } else {
                extend(self.cycles, ts)
            };
            if extended < self.base {
                return Classification::Reset;
            }
            return Classification::Late(extended);
        }

        Classification::Reset
    }
}

/// Extends 16-bit RTP sequence numbers of one source
///
/// Extended values start one cycle in, so packets reordered ahead of the
/// first received one still map below it.
#[derive(Debug, Clone)]
pub struct SequenceUnwrapper {
    prev: u16,
    cycles: u64,
}

impl SequenceUnwrapper {
    const HALF_SPACE: u16 = 1 << 15;

    pub fn new(first: u16) -> Self {
        SequenceUnwrapper {
            prev: first,
            cycles: 1,
        }
    }

    /// Extend `seq`, advancing on forward progress
    pub fn unwrap(&mut self, seq: u16) -> u64 {
        let forward = seq.wrapping_sub(self.prev);
        if forward < Self::HALF_SPACE {
            if seq < self.prev {
                self.cycles += 1;
            }
            self.prev = seq;
            extend16(self.cycles, seq)
        } else if seq > self.prev {
            extend16(self.cycles - 1, seq)
        } else {
            extend16(self.cycles, seq)
        }
    }
}

fn extend(cycles: u64, ts: u32) -> u64 {
    (cycles << 32) | ts as u64
}

fn extend16(cycles: u64, seq: u16) -> u64 {
    (cycles << 16) | seq as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_progress() {
        let mut unwrapper = TimestampUnwrapper::new(1000);
        assert_eq!(unwrapper.base(), 1000);
        assert_eq!(unwrapper.unwrap(1160).extended, 1160);
        assert_eq!(unwrapper.unwrap(1320).extended, 1320);
        assert_eq!(unwrapper.cycles(), 0);
    }

    #[test]
    fn test_repeat_is_idempotent() {
        let mut unwrapper = TimestampUnwrapper::new(0xFFFF_FFF0);
        let first = unwrapper.unwrap(0x0000_0002);
        let second = unwrapper.unwrap(0x0000_0002);
        assert_eq!(first, second);
        assert!(!first.reset);
    }

    #[test]
    fn test_wraparound_is_monotonic() {
        let mut unwrapper = TimestampUnwrapper::new(0xFFFF_FFF0);
        let a = unwrapper.unwrap(0xFFFF_FFF0).extended;
        let b = unwrapper.unwrap(0xFFFF_FFF8).extended;
        let c = unwrapper.unwrap(0x0000_0002).extended;
        assert!(a < b && b < c);
        assert_eq!(c, (1 << 32) | 2);
        assert_eq!(unwrapper.cycles(), 1);
    }

    #[test]
    fn test_late_packet_across_wrap() {
        let mut unwrapper = TimestampUnwrapper::new(0xFFFF_FF00);
        unwrapper.unwrap(0x0000_0010);

        let late = unwrapper.unwrap(0xFFFF_FF80);
        assert!(!late.reset);
        assert_eq!(late.extended, 0xFFFF_FF80);
        // State did not move backwards
        assert_eq!(unwrapper.last(), (1 << 32) | 0x10);
    }

    #[test]
    fn test_late_packet_before_base_resets() {
        let mut unwrapper = TimestampUnwrapper::new(5000);
        let update = unwrapper.unwrap(4000);
        assert!(update.reset);
        assert_eq!(unwrapper.base(), 4000);
    }

    #[test]
    fn test_large_jump_resets() {
        let mut unwrapper = TimestampUnwrapper::new(1000);
        unwrapper.unwrap(2000);

        let update = unwrapper.unwrap(2000 + WRAP_THRESHOLD + 1);
        assert!(update.reset);
        assert_eq!(update.extended, (2000 + WRAP_THRESHOLD + 1) as u64);
        assert_eq!(unwrapper.cycles(), 0);
    }

    #[test]
    fn test_peek_does_not_advance() {
        let mut unwrapper = TimestampUnwrapper::new(100);
        unwrapper.unwrap(200);
        assert_eq!(unwrapper.peek(300), Some(300));
        assert_eq!(unwrapper.last(), 200);
        assert_eq!(unwrapper.peek(200 + WRAP_THRESHOLD + 5), None);
    }

    #[test]
    fn test_sequence_wrap_and_reorder() {
        let mut seq = SequenceUnwrapper::new(65534);
        let a = seq.unwrap(65534);
        let b = seq.unwrap(65535);
        let d = seq.unwrap(1);
        let c = seq.unwrap(0);
        assert_eq!(b, a + 1);
        assert_eq!(c, a + 2);
        assert_eq!(d, a + 3);
    }

    #[test]
    fn test_sequence_reordered_before_first() {
        let mut seq = SequenceUnwrapper::new(0);
        let first = seq.unwrap(0);
        let earlier = seq.unwrap(65535);
        assert_eq!(earlier + 1, first);
    }
}
