//! Property-based tests for RTP timing and reassembly
//!
//! These use proptest to check timestamp extension across wraps and the
//! arrival-order independence of fragment reassembly.

use bytes::Bytes;
use mip_core::MediaTime;
use mip_rtp::reassembly::DEFAULT_WINDOW_SIZE;
use mip_rtp::timing::JitterController;
use mip_rtp::{Fragment, Reassembler, TimestampUnwrapper, TimingConfig};
use proptest::prelude::*;

fn fragment(sequence: u64, marker: bool, first: bool) -> Fragment {
    Fragment {
        sequence,
        payload: Bytes::from(vec![sequence as u8]),
        received_at: MediaTime::ZERO,
        marker,
        first,
    }
}

#[test]
fn test_wrap_sequence_is_increasing() {
    let mut unwrapper = TimestampUnwrapper::new(0xFFFF_FFF0);
    let a = unwrapper.base();
    let b = unwrapper.unwrap(0xFFFF_FFF8).extended;
    let c = unwrapper.unwrap(0x0000_0002).extended;
    assert!(a < b && b < c);
    assert_eq!(c - a, 0x12);
}

#[test]
fn test_unmarked_frame_released_by_next_timestamp() {
    let mut reassembler = Reassembler::new(DEFAULT_WINDOW_SIZE).unwrap();
    reassembler.insert(1000, fragment(100, false, true));
    reassembler.insert(1000, fragment(101, false, false));
    reassembler.insert(1000, fragment(102, false, false));
    assert!(reassembler.pop_frame().is_none());

    reassembler.insert(4000, fragment(103, false, false));
    let frame = reassembler.pop_frame().unwrap();
    assert_eq!(frame.timestamp, 1000);
    assert_eq!(frame.sequences(), vec![100, 101, 102]);
    assert!(reassembler.pop_frame().is_none());
}

proptest! {
    #[test]
    fn prop_repeated_timestamp_is_idempotent(base in any::<u32>(), steps in proptest::collection::vec(0u32..100_000, 1..50)) {
        let mut unwrapper = TimestampUnwrapper::new(base);
        let mut ts = base;
        for step in steps {
            ts = ts.wrapping_add(step);
            let first = unwrapper.unwrap(ts);
            let second = unwrapper.unwrap(ts);
            prop_assert_eq!(first.extended, second.extended);
            prop_assert!(!second.reset);
        }
    }

    #[test]
    fn prop_forward_progress_is_monotonic(base in any::<u32>(), steps in proptest::collection::vec(1u32..(1 << 27), 1..64)) {
        let mut unwrapper = TimestampUnwrapper::new(base);
        let mut previous = unwrapper.base();
        let mut ts = base;
        for step in steps {
            ts = ts.wrapping_add(step);
            let update = unwrapper.unwrap(ts);
            prop_assert!(!update.reset);
            prop_assert_eq!(update.extended, previous + step as u64);
            previous = update.extended;
        }
    }

    #[test]
    fn prop_large_jump_resets(base in any::<u32>(), jump in (1u32 << 28)..(u32::MAX - (1 << 28))) {
        let mut unwrapper = TimestampUnwrapper::new(base);
        let update = unwrapper.unwrap(base.wrapping_add(jump));
        prop_assert!(update.reset);
        prop_assert_eq!(unwrapper.base(), base.wrapping_add(jump) as u64);
    }

    #[test]
    fn prop_reassembly_is_order_independent(order in Just(vec![100u64, 101, 102]).prop_shuffle()) {
        let mut reassembler = Reassembler::new(DEFAULT_WINDOW_SIZE).unwrap();
        for &sequence in &order {
            prop_assert!(reassembler.pop_frame().is_none());
            reassembler.insert(7, fragment(sequence, sequence == 102, sequence == 100));
        }
        let frame = reassembler.pop_frame().unwrap();
        prop_assert_eq!(frame.sequences(), vec![100, 101, 102]);
        prop_assert_eq!(&frame.concat()[..], &[100u8, 101, 102][..]);
        prop_assert!(reassembler.pop_frame().is_none());
    }

    #[test]
    fn prop_offset_steps_are_bounded(diffs in proptest::collection::vec(-200_000i64..200_000, 16..200)) {
        let config = TimingConfig::default();
        let mut jitter = JitterController::new(&config, MediaTime::ZERO);
        let mut now = MediaTime::ZERO;
        for diff in diffs {
            now += MediaTime::from_millis(20);
            let before = jitter.offset();
            let change = jitter.record(MediaTime::from_micros(diff), now);
            let after = jitter.offset();
            prop_assert!(after >= MediaTime::ZERO);
            prop_assert!(after <= config.max_offset);
            prop_assert!((after - before).abs() <= MediaTime::from_millis(5));
            prop_assert_eq!(change.unwrap_or(MediaTime::ZERO), after - before);
        }
    }
}
