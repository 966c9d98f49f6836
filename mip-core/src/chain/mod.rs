//! Component chains
//!
//! A [`Chain`] collects connections between components, validates and orders
//! them when started, and drives them from a dedicated background thread
//! until stopped or until a component fails.

mod observer;
mod schedule;
mod topology;

pub use observer::{ChainExit, ChainFailure, ChainObserver, ChannelObserver, LogObserver};
pub use schedule::{FeedbackChain, Schedule, ScheduledConnection};

use crate::component::{ChainContext, ComponentError, ComponentId, SharedComponent};
use crate::message::MessageFilter;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use thiserror::Error;

/// Chain building and control errors
#[derive(Error, Debug)]
pub enum ChainError {
    #[error("No chain start component set")]
    NoChainStart,

    #[error("Chain has no connections")]
    NoConnections,

    #[error("Chain is already running")]
    AlreadyRunning,

    #[error("Chain is not running")]
    NotRunning,

    #[error("Component '{0}' cannot be connected to itself")]
    SelfConnection(String),

    #[error("Connections form a cycle through component '{0}'")]
    CycleDetected(String),

    #[error("{count} connection(s) not reachable from the chain start")]
    UnreachableConnections { count: usize },

    #[error("Component '{0}' would take part in more than one feedback chain")]
    ConflictingFeedback(String),

    #[error("Failed to spawn chain thread: {0}")]
    ThreadSpawn(#[from] std::io::Error),

    #[error("Component '{component}' failed: {source}")]
    ComponentFailed {
        component: String,
        #[source]
        source: ComponentError,
    },
}

/// A declared connection
pub(crate) struct Connection {
    pub source: SharedComponent,
    pub destination: SharedComponent,
    pub feedback: bool,
    pub filter: MessageFilter,
}

/// A graph of components driven by one background thread
pub struct Chain {
    context: Arc<ChainContext>,
    start: Option<SharedComponent>,
    connections: Vec<Connection>,
    observer: Arc<dyn ChainObserver>,
    worker: Option<JoinHandle<()>>,
}

impl Chain {
    pub fn new(name: impl Into<String>) -> Self {
        Chain {
            context: Arc::new(ChainContext::new(name)),
            start: None,
            connections: Vec::new(),
            observer: Arc::new(LogObserver),
            worker: None,
        }
    }

    /// Replace the thread-exit observer
    pub fn with_observer(mut self, observer: Arc<dyn ChainObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn name(&self) -> &str {
        self.context.name()
    }

    pub fn context(&self) -> &ChainContext {
        &self.context
    }

    /// Designate the component that receives the per-iteration `WaitTime`
    pub fn set_chain_start(&mut self, component: SharedComponent) -> Result<(), ChainError> {
        self.ensure_idle()?;
        self.start = Some(component);
        Ok(())
    }

    /// Declare a connection
    ///
    /// Messages pulled from `source` that pass `filter` are pushed into
    /// `destination`. `MessageFilter::NONE` forwards nothing and only
    /// constrains the traversal order. `feedback` puts the connection on a
    /// feedback chain.
    pub fn add_connection(
        &mut self,
        source: SharedComponent,
        destination: SharedComponent,
        feedback: bool,
        filter: MessageFilter,
    ) -> Result<(), ChainError> {
        self.ensure_idle()?;
        if ComponentId::of(&source) == ComponentId::of(&destination) {
            let name = source.lock().name().to_string();
            return Err(ChainError::SelfConnection(name));
        }

        self.connections.push(Connection {
            source,
            destination,
            feedback,
            filter,
        });
        Ok(())
    }

    pub fn clear_connections(&mut self) -> Result<(), ChainError> {
        self.ensure_idle()?;
        self.connections.clear();
        Ok(())
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Validate and order the declared graph without starting a thread
    pub fn build_schedule(&self) -> Result<Schedule, ChainError> {
        Schedule::build(self.context.clone(), self.start.as_ref(), &self.connections)
    }

    /// Validate the graph and start the background thread
    pub fn start(&mut self) -> Result<(), ChainError> {
        self.ensure_idle()?;
        self.reap_worker();

        let schedule = self.build_schedule()?;
        self.context.clear_stop();

        let observer = self.observer.clone();
        let handle = thread::Builder::new()
            .name(format!("mip-chain-{}", self.context.name()))
            .spawn(move || run_chain(schedule, observer))?;

        tracing::info!(
            chain = %self.context.name(),
            connections = self.connections.len(),
            "chain started"
        );
        self.worker = Some(handle);
        Ok(())
    }

    /// Ask the background thread to finish its current iteration and wait for it
    ///
    /// Must not be called from a component running on this chain's thread.
    pub fn stop(&mut self) -> Result<(), ChainError> {
        let handle = self.worker.take().ok_or(ChainError::NotRunning)?;
        self.context.request_stop();
        if handle.join().is_err() {
            tracing::error!(chain = %self.context.name(), "chain thread panicked");
        }
        Ok(())
    }

    /// True while the background thread is alive
    pub fn is_running(&self) -> bool {
        self.worker
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    fn ensure_idle(&self) -> Result<(), ChainError> {
        if self.is_running() {
            Err(ChainError::AlreadyRunning)
        } else {
            Ok(())
        }
    }

    /// Collect a thread that ended on its own
    fn reap_worker(&mut self) {
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Chain {
    fn drop(&mut self) {
        if self.worker.is_some() {
            let _ = self.stop();
        }
    }
}

fn run_chain(schedule: Schedule, observer: Arc<dyn ChainObserver>) {
    let context = schedule.shared_context();
    let mut iteration: u64 = 1;

    let failure = loop {
        if context.is_stopping() {
            break None;
        }
        if let Err(err) = schedule.run_iteration(iteration) {
            break Some(match err {
                ChainError::ComponentFailed { component, source } => ChainFailure {
                    component,
                    error: source.to_string(),
                },
                other => ChainFailure {
                    component: String::new(),
                    error: other.to_string(),
                },
            });
        }
        iteration += 1;
    };

    observer.on_thread_exit(&ChainExit {
        chain: context.name().to_string(),
        iterations: iteration - 1,
        failure,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::{shared, Component};
    use crate::feedback::Feedback;
    use crate::message::{message_type, Message, MessageRef, SystemMessage};
    use crate::queue::IterationQueue;
    use parking_lot::Mutex;
    use std::time::Duration;

    /// Records everything it sees and forwards pushed messages
    #[derive(Default)]
    struct Recorder {
        name: String,
        queue: IterationQueue,
        pushed: Vec<(u64, u32)>,
        feedback: Vec<u64>,
        fail_on_iteration: Option<u64>,
    }

    impl Recorder {
        fn new(name: &str) -> Arc<Mutex<Recorder>> {
            shared(Recorder {
                name: name.to_string(),
                ..Default::default()
            })
        }
    }

    impl Component for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        fn push(
            &mut self,
            _chain: &ChainContext,
            iteration: u64,
            message: &MessageRef,
        ) -> Result<(), ComponentError> {
            if self.fail_on_iteration == Some(iteration) {
                return Err(ComponentError::Other("recorder failure".to_string()));
            }
            self.queue.begin(iteration);
            self.pushed.push((iteration, message.subtype()));
            let forwarded = match message.as_ref() {
                Message::System(SystemMessage::WaitTime) => {
                    Message::System(SystemMessage::IsTime).into_ref()
                }
                _ => message.clone(),
            };
            self.queue.push(forwarded);
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

        fn process_feedback(
            &mut self,
            _chain: &ChainContext,
            feedback: &mut Feedback,
        ) -> Result<(), ComponentError> {
            self.feedback.push(feedback.chain_id());
            Ok(())
        }
    }

    #[test]
    fn test_start_requires_chain_start() {
        let a = Recorder::new("a");
        let b = Recorder::new("b");
        let mut chain = Chain::new("test");
        chain
            .add_connection(a, b, false, MessageFilter::ALL)
            .unwrap();
        assert!(matches!(chain.start(), Err(ChainError::NoChainStart)));
    }

    #[test]
    fn test_start_requires_connections() {
        let a = Recorder::new("a");
        let mut chain = Chain::new("test");
        chain.set_chain_start(a).unwrap();
        assert!(matches!(chain.start(), Err(ChainError::NoConnections)));
    }

    #[test]
    fn test_self_connection_rejected() {
        let a = Recorder::new("a");
        let mut chain = Chain::new("test");
        let result = chain.add_connection(a.clone(), a, false, MessageFilter::ALL);
        assert!(matches!(result, Err(ChainError::SelfConnection(name)) if name == "a"));
    }

    #[test]
    fn test_cycle_rejected() {
        let a = Recorder::new("a");
        let b = Recorder::new("b");
        let c = Recorder::new("c");
        let mut chain = Chain::new("test");
        chain.set_chain_start(a.clone()).unwrap();
        chain.add_connection(a, b.clone(), false, MessageFilter::ALL).unwrap();
        chain.add_connection(b.clone(), c.clone(), false, MessageFilter::ALL).unwrap();
        chain.add_connection(c, b, false, MessageFilter::ALL).unwrap();

        assert!(matches!(chain.build_schedule(), Err(ChainError::CycleDetected(_))));
    }

    #[test]
    fn test_forward_pass_respects_filters() {
        let a = Recorder::new("a");
        let b = Recorder::new("b");
        let c = Recorder::new("c");
        let mut chain = Chain::new("test");
        chain.set_chain_start(a.clone()).unwrap();
        chain
            .add_connection(a.clone(), b.clone(), false, MessageFilter::types(message_type::SYSTEM))
            .unwrap();
        chain
            .add_connection(a.clone(), c.clone(), false, MessageFilter::NONE)
            .unwrap();

        let schedule = chain.build_schedule().unwrap();
        schedule.run_iteration(1).unwrap();
        schedule.run_iteration(2).unwrap();

        assert_eq!(a.lock().pushed.len(), 2);
        assert_eq!(b.lock().pushed.len(), 2);
        assert!(c.lock().pushed.is_empty());
        assert!(b.lock().pushed.iter().all(|&(_, sub)| sub == crate::message::subtype::IS_TIME));
    }

    #[test]
    fn test_feedback_reaches_upstream_once() {
        let a = Recorder::new("a");
        let b = Recorder::new("b");
        let c = Recorder::new("c");
        let mut chain = Chain::new("test");
        chain.set_chain_start(a.clone()).unwrap();
        // Declared in reverse
        chain
            .add_connection(b.clone(), c.clone(), true, MessageFilter::ALL)
            .unwrap();
        chain
            .add_connection(a.clone(), b.clone(), false, MessageFilter::ALL)
            .unwrap();

        let schedule = chain.build_schedule().unwrap();
        assert_eq!(schedule.feedback_chains().len(), 1);
        schedule.run_iteration(1).unwrap();

        assert_eq!(c.lock().pushed.len(), 1);
        assert_eq!(b.lock().feedback, vec![0]);
        assert_eq!(c.lock().feedback, vec![0]);
        assert!(a.lock().feedback.is_empty());
    }

    #[test]
    fn test_thread_runs_until_stopped() {
        let a = Recorder::new("a");
        let b = Recorder::new("b");
        let (observer, exits) = ChannelObserver::new();
        let mut chain = Chain::new("threaded").with_observer(Arc::new(observer));
        chain.set_chain_start(a.clone()).unwrap();
        chain.add_connection(a, b.clone(), false, MessageFilter::ALL).unwrap();

        chain.start().unwrap();
        assert!(matches!(chain.start(), Err(ChainError::AlreadyRunning)));
        std::thread::sleep(Duration::from_millis(20));
        chain.stop().unwrap();

        let exit = exits.recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(!exit.had_error());
        assert!(exit.iterations > 0);
        assert!(!b.lock().pushed.is_empty());
        assert!(matches!(chain.stop(), Err(ChainError::NotRunning)));
    }

    #[test]
    fn test_component_failure_ends_thread() {
        let a = Recorder::new("a");
        let b = Recorder::new("b");
        b.lock().fail_on_iteration = Some(3);
        let (observer, exits) = ChannelObserver::new();
        let mut chain = Chain::new("failing").with_observer(Arc::new(observer));
        chain.set_chain_start(a.clone()).unwrap();
        chain.add_connection(a, b, false, MessageFilter::ALL).unwrap();

        chain.start().unwrap();
        let exit = exits.recv_timeout(Duration::from_secs(5)).unwrap();

        assert!(exit.had_error());
        assert_eq!(exit.iterations, 2);
        let failure = exit.failure.unwrap();
        assert_eq!(failure.component, "b");
        assert_eq!(failure.error, "recorder failure");

        // The thread is gone; the chain may be restarted after reconfiguration
        std::thread::sleep(Duration::from_millis(10));
        assert!(!chain.is_running());
    }
}
