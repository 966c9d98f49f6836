//! Notification when a chain's background thread ends

use crossbeam::channel::{self, Receiver, Sender};

/// The component that aborted a chain and why
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainFailure {
    pub component: String,
    pub error: String,
}

/// How a chain thread ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainExit {
    pub chain: String,
    /// Number of completed iterations
    pub iterations: u64,
    /// Set when a component failed; `None` after a requested stop
    pub failure: Option<ChainFailure>,
}

impl ChainExit {
    pub fn had_error(&self) -> bool {
        self.failure.is_some()
    }
}

/// Receives the exit notification of a chain thread
///
/// Called exactly once per started thread, from that thread.
pub trait ChainObserver: Send + Sync {
    fn on_thread_exit(&self, exit: &ChainExit);
}

/// Logs chain exits through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct LogObserver;

impl ChainObserver for LogObserver {
    fn on_thread_exit(&self, exit: &ChainExit) {
        match &exit.failure {
            Some(failure) => tracing::error!(
                chain = %exit.chain,
                component = %failure.component,
                iterations = exit.iterations,
                "chain aborted: {}",
                failure.error
            ),
            None => tracing::info!(
                chain = %exit.chain,
                iterations = exit.iterations,
                "chain stopped"
            ),
        }
    }
}

/// Forwards chain exits over a channel
///
/// Lets a controlling thread block until a chain fails or stops.
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    sender: Sender<ChainExit>,
}

impl ChannelObserver {
    pub fn new() -> (Self, Receiver<ChainExit>) {
        let (sender, receiver) = channel::unbounded();
        (ChannelObserver { sender }, receiver)
    }
}

impl ChainObserver for ChannelObserver {
    fn on_thread_exit(&self, exit: &ChainExit) {
        LogObserver.on_thread_exit(exit);
        // The receiver may already be gone during shutdown
        let _ = self.sender.send(exit.clone());
    }
}
