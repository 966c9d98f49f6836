//! The component contract
//!
//! A component is a node in a chain. The chain pushes messages into it,
//! pulls the messages it produced for the current iteration, and after the
//! forward pass hands it a [`Feedback`] if it sits on a feedback chain.

use crate::feedback::Feedback;
use crate::message::{Message, MessageRef};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Component failures the chain cannot continue past
#[derive(Error, Debug)]
pub enum ComponentError {
    #[error("Unexpected {got} message, expected {expected}")]
    UnexpectedMessage { expected: &'static str, got: &'static str },

    #[error("Initialization failed: {0}")]
    Init(String),

    #[error("Not initialized")]
    NotInitialized,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl ComponentError {
    /// Contract violation for a message routed to the wrong component
    pub fn unexpected(expected: &'static str, got: &Message) -> Self {
        ComponentError::UnexpectedMessage {
            expected,
            got: got.kind_name(),
        }
    }
}

/// Identifier of a running or buildable chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChainId(u64);

impl ChainId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ChainId(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chain-{}", self.0)
    }
}

/// What a component learns about the chain calling it
#[derive(Debug)]
pub struct ChainContext {
    id: ChainId,
    name: String,
    stop: Arc<AtomicBool>,
}

impl ChainContext {
    pub fn new(name: impl Into<String>) -> Self {
        ChainContext {
            id: ChainId::next(),
            name: name.into(),
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> ChainId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// True once a stop has been requested
    ///
    /// Blocking components poll this to cut their waits short.
    pub fn is_stopping(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    pub(crate) fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub(crate) fn clear_stop(&self) {
        self.stop.store(false, Ordering::Release);
    }
}

/// A chain node
///
/// Implementations must tolerate being pushed to and pulled from in any
/// order within an iteration, and must reset their per-iteration state when
/// the iteration number changes.
pub trait Component: Send {
    /// Stable name used in error reports
    fn name(&self) -> &str;

    /// Accept one inbound message
    fn push(
        &mut self,
        chain: &ChainContext,
        iteration: u64,
        message: &MessageRef,
    ) -> Result<(), ComponentError>;

    /// Yield the next outbound message of this iteration
    ///
    /// Returns `Ok(None)` when exhausted and rewinds, so a further round of
    /// pulls in the same iteration yields the same messages again.
    fn pull(
        &mut self,
        chain: &ChainContext,
        iteration: u64,
    ) -> Result<Option<MessageRef>, ComponentError>;

    /// Handle the feedback message of a feedback chain this component is on
    fn process_feedback(
        &mut self,
        _chain: &ChainContext,
        _feedback: &mut Feedback,
    ) -> Result<(), ComponentError> {
        Ok(())
    }
}

/// A component shared between the application and one or more chains
pub type SharedComponent = Arc<Mutex<dyn Component>>;

/// Wrap a component for use in a chain
///
/// Keep the typed handle to inspect the component later; pass a clone to the
/// chain builder, where it coerces to [`SharedComponent`].
pub fn shared<C: Component + 'static>(component: C) -> Arc<Mutex<C>> {
    Arc::new(Mutex::new(component))
}

/// Identity of a shared component (its address)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComponentId(usize);

impl ComponentId {
    pub fn of(component: &SharedComponent) -> Self {
        ComponentId(Arc::as_ptr(component) as *const () as usize)
    }
}
