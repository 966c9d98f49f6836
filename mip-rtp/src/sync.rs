//! Cross-stream synchronization
//!
//! Streams from one participant (same RTCP CNAME) are aligned by delaying
//! every stream to match the one with the largest playout lag relative to
//! the sender's wallclock.

use mip_core::MediaTime;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug)]
struct SyncStream {
    cname: String,
    /// Local playout time minus sender wallclock of the latest report
    delta: Option<MediaTime>,
}

#[derive(Debug, Default)]
struct SyncState {
    next_id: u64,
    streams: HashMap<u64, SyncStream>,
}

/// Shared registry of streams grouped by CNAME
///
/// Shared between decoders through an `Arc`; every stream holds a
/// [`SyncRegistration`] that removes it again on drop.
#[derive(Debug, Default)]
pub struct RtpSynchronizer {
    state: Mutex<SyncState>,
}

impl RtpSynchronizer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Add a stream to the group of `cname`
    pub fn register(self: &Arc<Self>, cname: &str) -> SyncRegistration {
        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.streams.insert(
            id,
            SyncStream {
                cname: cname.to_string(),
                delta: None,
            },
        );
        tracing::debug!(cname, id, "stream registered for synchronization");

        SyncRegistration {
            id,
            cname: cname.to_string(),
            synchronizer: Arc::clone(self),
        }
    }

    pub fn stream_count(&self) -> usize {
        self.state.lock().streams.len()
    }

    /// Number of streams registered under `cname`
    pub fn group_size(&self, cname: &str) -> usize {
        self.state
            .lock()
            .streams
            .values()
            .filter(|stream| stream.cname == cname)
            .count()
    }

    fn update(&self, id: u64, delta: MediaTime) -> MediaTime {
        let mut state = self.state.lock();
        let Some(stream) = state.streams.get_mut(&id) else {
            return MediaTime::ZERO;
        };
        stream.delta = Some(delta);
        let cname = stream.cname.clone();

        let slowest = state
            .streams
            .values()
            .filter(|stream| stream.cname == cname)
            .filter_map(|stream| stream.delta)
            .max()
            .unwrap_or(delta);
        slowest - delta
    }

    fn unregister(&self, id: u64) {
        if let Some(stream) = self.state.lock().streams.remove(&id) {
            tracing::debug!(cname = %stream.cname, id, "stream left synchronization");
        }
    }
}

/// A stream's membership in an [`RtpSynchronizer`]
#[derive(Debug)]
pub struct SyncRegistration {
    id: u64,
    cname: String,
    synchronizer: Arc<RtpSynchronizer>,
}

impl SyncRegistration {
    pub fn cname(&self) -> &str {
        &self.cname
    }

    /// Report this stream's playout lag; returns the extra delay to apply
    pub fn update(&self, delta: MediaTime) -> MediaTime {
        self.synchronizer.update(self.id, delta)
    }
}

impl Drop for SyncRegistration {
    fn drop(&mut self) {
        self.synchronizer.unregister(self.id);
    }
}
