//! Fragment reassembly
//!
//! A circular window of slots indexed by extended sequence number collects
//! the packets of fragmented frames. A frame is complete once a contiguous
//! run of same-timestamp fragments is bounded at both ends:
//!
//! - the end by a marker bit, or by a following packet with another timestamp
//! - the start by a first-fragment flag, or by a preceding packet with another
//!   timestamp (or a marker-terminated predecessor)
//!
//! The window re-centers when a packet arrives past two thirds of it;
//! fragments scrolling out without completing are dropped.

use bytes::{Bytes, BytesMut};
use mip_core::MediaTime;
use std::collections::VecDeque;
use thiserror::Error;

/// Smallest accepted window
pub const MIN_WINDOW_SIZE: usize = 32;

/// Window used when none is configured
pub const DEFAULT_WINDOW_SIZE: usize = 64;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReassemblyError {
    #[error("Window of {0} slots is below the minimum of {}", MIN_WINDOW_SIZE)]
    WindowTooSmall(usize),
}

/// One received packet payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    /// Extended sequence number
    pub sequence: u64,
    pub payload: Bytes,
    pub received_at: MediaTime,
    pub marker: bool,
    /// The codec identified this packet as the start of a frame
    pub first: bool,
}

/// Fragments of one frame in sequence order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReassembledFrame {
    pub timestamp: u32,
    pub fragments: Vec<Fragment>,
}

impl ReassembledFrame {
    /// Frame made of a single unfragmented packet
    pub fn single(timestamp: u32, fragment: Fragment) -> Self {
        ReassembledFrame {
            timestamp,
            fragments: vec![fragment],
        }
    }

    pub fn sequences(&self) -> Vec<u64> {
        self.fragments.iter().map(|f| f.sequence).collect()
    }

    /// Combined payload size
    pub fn payload_len(&self) -> usize {
        self.fragments.iter().map(|f| f.payload.len()).sum()
    }

    /// Payloads concatenated in order
    pub fn concat(&self) -> Bytes {
        if let [only] = self.fragments.as_slice() {
            return only.payload.clone();
        }
        let mut out = BytesMut::with_capacity(self.payload_len());
        for fragment in &self.fragments {
            out.extend_from_slice(&fragment.payload);
        }
        out.freeze()
    }

    /// Receive time of the last fragment to arrive
    pub fn completed_at(&self) -> MediaTime {
        self.fragments
            .iter()
            .map(|f| f.received_at)
            .max()
            .unwrap_or(MediaTime::ZERO)
    }
}

/// Reassembly counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReassemblyStats {
    pub fragments_inserted: u64,
    pub duplicates: u64,
    /// Arrived below the window
    pub too_old: u64,
    pub frames_completed: u64,
    /// Pending fragments dropped when the window moved
    pub fragments_dropped: u64,
}

#[derive(Debug, Clone)]
enum Slot {
    Empty,
    Pending { timestamp: u32, fragment: Fragment },
    Consumed { sequence: u64, timestamp: u32, marker: bool },
}

#[derive(Debug, Clone, Copy)]
enum SlotView {
    Missing,
    Pending { timestamp: u32, marker: bool, first: bool },
    Consumed { timestamp: u32, marker: bool },
}

/// Per-source reassembly window
#[derive(Debug)]
pub struct Reassembler {
    slots: Vec<Slot>,
    /// Lowest sequence number inside the window
    base: Option<u64>,
    ready: VecDeque<ReassembledFrame>,
    stats: ReassemblyStats,
}

impl Reassembler {
    /// Create a window of `window` slots
    pub fn new(window: usize) -> Result<Self, ReassemblyError> {
        if window < MIN_WINDOW_SIZE {
            return Err(ReassemblyError::WindowTooSmall(window));
        }
        Ok(Reassembler {
            slots: vec![Slot::Empty; window],
            base: None,
            ready: VecDeque::new(),
            stats: ReassemblyStats::default(),
        })
    }

    pub fn window_size(&self) -> usize {
        self.slots.len()
    }

    /// Lowest sequence number the window accepts
    pub fn base(&self) -> Option<u64> {
        self.base
    }

    pub fn stats(&self) -> ReassemblyStats {
        self.stats
    }

    /// Completed frames waiting to be taken
    pub fn ready_count(&self) -> usize {
        self.ready.len()
    }

    /// Fragments held that do not yet form a complete frame
    pub fn pending_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| matches!(slot, Slot::Pending { .. }))
            .count()
    }

    /// Take the oldest completed frame
    pub fn pop_frame(&mut self) -> Option<ReassembledFrame> {
        self.ready.pop_front()
    }

    /// Store a fragment and queue any frame it completes
    pub fn insert(&mut self, timestamp: u32, fragment: Fragment) {
        let window = self.slots.len() as u64;
        let sequence = fragment.sequence;
        let base = *self
            .base
            .get_or_insert_with(|| sequence.saturating_sub(window / 3));

        if sequence < base {
            self.stats.too_old += 1;
            return;
        }
        if sequence - base >= 2 * window / 3 {
            self.recenter(sequence - window / 3);
        }

        let index = self.index(sequence);
        match &self.slots[index] {
            Slot::Pending { fragment: held, .. } if held.sequence == sequence => {
                self.stats.duplicates += 1;
                return;
            }
            Slot::Consumed { sequence: held, .. } if *held == sequence => {
                self.stats.duplicates += 1;
                return;
            }
            _ => {}
        }

        self.slots[index] = Slot::Pending {
            timestamp,
            fragment,
        };
        self.stats.fragments_inserted += 1;

        if let Some(before) = sequence.checked_sub(1) {
            self.try_complete(before);
        }
        self.try_complete(sequence);
        self.try_complete(sequence + 1);
    }

    #[inline]
    fn index(&self, sequence: u64) -> usize {
        (sequence % self.slots.len() as u64) as usize
    }

    fn in_window(&self, sequence: u64) -> bool {
        match self.base {
            Some(base) => sequence >= base && sequence - base < self.slots.len() as u64,
            None => false,
        }
    }

    fn recenter(&mut self, new_base: u64) {
        let Some(old_base) = self.base else {
            return;
        };
        let window = self.slots.len() as u64;
        let end = new_base.min(old_base + window);
        for sequence in old_base..end {
            let index = self.index(sequence);
            if let Slot::Pending { .. } = self.slots[index] {
                self.stats.fragments_dropped += 1;
            }
            self.slots[index] = Slot::Empty;
        }
        if new_base >= old_base + window {
            self.slots.iter_mut().for_each(|slot| *slot = Slot::Empty);
        }
        self.base = Some(new_base);
    }

    fn view(&self, sequence: u64) -> SlotView {
        if !self.in_window(sequence) {
            return SlotView::Missing;
        }
        match &self.slots[self.index(sequence)] {
            Slot::Pending {
                timestamp,
                fragment,
            } if fragment.sequence == sequence => SlotView::Pending {
                timestamp: *timestamp,
                marker: fragment.marker,
                first: fragment.first,
            },
            Slot::Consumed {
                sequence: held,
                timestamp,
                marker,
            } if *held == sequence => SlotView::Consumed {
                timestamp: *timestamp,
                marker: *marker,
            },
            _ => SlotView::Missing,
        }
    }

    fn try_complete(&mut self, center: u64) {
        let SlotView::Pending { timestamp, .. } = self.view(center) else {
            return;
        };

        let mut end = center;
        loop {
            match self.view(end) {
                SlotView::Pending {
                    timestamp: ts,
                    marker,
                    ..
                } if ts == timestamp => {
                    if marker {
                        break;
                    }
                    end += 1;
                }
                SlotView::Pending { timestamp: ts, .. } | SlotView::Consumed { timestamp: ts, .. }
                    if ts != timestamp =>
                {
                    end -= 1;
                    break;
                }
                _ => return,
            }
        }

        let mut start = center;
        loop {
            let SlotView::Pending { first, .. } = self.view(start) else {
                return;
            };
            if first {
                break;
            }
            let Some(previous) = start.checked_sub(1) else {
                return;
            };
            match self.view(previous) {
                SlotView::Pending {
                    timestamp: ts,
                    marker,
                    ..
                } => {
                    if ts != timestamp || marker {
                        break;
                    }
                    start = previous;
                }
                SlotView::Consumed { timestamp: ts, marker } => {
                    if ts != timestamp || marker {
                        break;
                    }
                    return;
                }
                SlotView::Missing => return,
            }
        }

        let mut fragments = Vec::with_capacity((end - start + 1) as usize);
        for sequence in start..=end {
            let index = self.index(sequence);
            let slot = std::mem::replace(&mut self.slots[index], Slot::Empty);
            if let Slot::Pending { fragment, .. } = slot {
                self.slots[index] = Slot::Consumed {
                    sequence,
                    timestamp,
                    marker: fragment.marker,
                };
                fragments.push(fragment);
            }
        }

        tracing::trace!(timestamp, start, end, "frame reassembled");
        self.stats.frames_completed += 1;
        self.ready.push_back(ReassembledFrame {
            timestamp,
            fragments,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fragment(sequence: u64, marker: bool, first: bool) -> Fragment {
        Fragment {
            sequence,
            payload: Bytes::from(vec![sequence as u8]),
            received_at: MediaTime::from_millis(sequence as i64),
            marker,
            first,
        }
    }

    #[test]
    fn test_window_minimum() {
        assert_eq!(
            Reassembler::new(16).unwrap_err(),
            ReassemblyError::WindowTooSmall(16)
        );
        assert_eq!(Reassembler::new(32).unwrap().window_size(), 32);
    }

    #[test]
    fn test_in_order_frame_with_marker() {
        let mut r = Reassembler::new(DEFAULT_WINDOW_SIZE).unwrap();
        r.insert(7, fragment(100, false, true));
        r.insert(7, fragment(101, false, false));
        assert!(r.pop_frame().is_none());

        r.insert(7, fragment(102, true, false));
        let frame = r.pop_frame().unwrap();
        assert_eq!(frame.timestamp, 7);
        assert_eq!(frame.sequences(), vec![100, 101, 102]);
        assert_eq!(&frame.concat()[..], &[100, 101, 102]);
        assert_eq!(r.pending_count(), 0);
    }

    #[test]
    fn test_reverse_arrival() {
        let mut r = Reassembler::new(DEFAULT_WINDOW_SIZE).unwrap();
        r.insert(7, fragment(102, true, false));
        r.insert(7, fragment(101, false, false));
        assert!(r.pop_frame().is_none());
        r.insert(7, fragment(100, false, true));

        assert_eq!(r.pop_frame().unwrap().sequences(), vec![100, 101, 102]);
        assert!(r.pop_frame().is_none());
    }

    #[test]
    fn test_start_proven_by_previous_frame() {
        let mut r = Reassembler::new(DEFAULT_WINDOW_SIZE).unwrap();
        r.insert(1, fragment(10, true, true));
        assert_eq!(r.pop_frame().unwrap().sequences(), vec![10]);

        // No first-fragment flags: the consumed marker slot bounds the start
        r.insert(2, fragment(11, false, false));
        r.insert(2, fragment(12, true, false));
        assert_eq!(r.pop_frame().unwrap().sequences(), vec![11, 12]);
    }

    #[test]
    fn test_end_proven_by_timestamp_change() {
        let mut r = Reassembler::new(DEFAULT_WINDOW_SIZE).unwrap();
        r.insert(1, fragment(20, false, true));
        r.insert(1, fragment(21, false, false));
        assert!(r.pop_frame().is_none());

        r.insert(2, fragment(22, false, false));
        assert_eq!(r.pop_frame().unwrap().sequences(), vec![20, 21]);
        assert!(r.pop_frame().is_none());
    }

    #[test]
    fn test_gap_blocks_completion() {
        let mut r = Reassembler::new(DEFAULT_WINDOW_SIZE).unwrap();
        r.insert(1, fragment(30, false, true));
        r.insert(1, fragment(32, true, false));
        assert!(r.pop_frame().is_none());
        assert_eq!(r.pending_count(), 2);
    }

    #[test]
    fn test_duplicates_ignored() {
        let mut r = Reassembler::new(DEFAULT_WINDOW_SIZE).unwrap();
        r.insert(1, fragment(40, true, true));
        r.insert(1, fragment(40, true, true));
        assert_eq!(r.ready_count(), 1);
        assert_eq!(r.stats().duplicates, 1);
    }

    #[test]
    fn test_recentering_drops_stale_fragments() {
        let mut r = Reassembler::new(32).unwrap();
        r.insert(1, fragment(100, false, true));
        // 100 - 10 = 90 is the base; 2/3 of 32 is 21
        assert_eq!(r.base(), Some(90));

        r.insert(2, fragment(200, true, true));
        assert_eq!(r.base(), Some(190));
        assert_eq!(r.stats().fragments_dropped, 1);
        assert_eq!(r.pop_frame().unwrap().sequences(), vec![200]);

        r.insert(1, fragment(101, true, false));
        assert_eq!(r.stats().too_old, 1);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        fn frame_arrivals() -> impl Strategy<Value = (u64, Vec<u64>)> {
            (1u64..12, 0u64..1_000_000).prop_flat_map(|(len, start)| {
                (Just(start), Just((start..start + len).collect::<Vec<_>>()).prop_shuffle())
            })
        }

        proptest! {
            #[test]
            fn prop_one_frame_per_picture((start, order) in frame_arrivals()) {
                let end = start + order.len() as u64 - 1;
                let mut r = Reassembler::new(DEFAULT_WINDOW_SIZE).unwrap();
                for (count, &sequence) in order.iter().enumerate() {
                    prop_assert_eq!(r.ready_count(), 0);
                    prop_assert_eq!(r.pending_count(), count);
                    r.insert(90, fragment(sequence, sequence == end, sequence == start));
                }

                // Late copies of consumed fragments are recognized
                r.insert(90, fragment(order[0], order[0] == end, order[0] == start));
                prop_assert_eq!(r.stats().duplicates, 1);

                let frame = r.pop_frame().unwrap();
                prop_assert_eq!(frame.sequences(), (start..=end).collect::<Vec<_>>());
                prop_assert!(r.pop_frame().is_none());
                prop_assert_eq!(r.pending_count(), 0);
            }
        }
    }
}
