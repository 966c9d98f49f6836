//! A validated, ordered chain ready to run
//!
//! One iteration pushes a `WaitTime` message into the chain start, moves
//! messages across every connection in layered order and finally runs each
//! feedback chain from its terminal back to its origin.

use super::topology::{self, TopologyError};
use super::{ChainError, Connection};
use crate::component::{ChainContext, Component, ComponentError, ComponentId, SharedComponent};
use crate::feedback::Feedback;
use crate::message::{Message, MessageFilter, MessageRef, SystemMessage};
use parking_lot::MutexGuard;
use std::collections::HashMap;
use std::sync::Arc;

/// A connection in execution order
pub struct ScheduledConnection {
    source: SharedComponent,
    destination: SharedComponent,
    filter: MessageFilter,
    feedback: bool,
    layer: usize,
}

impl ScheduledConnection {
    pub fn source_id(&self) -> ComponentId {
        ComponentId::of(&self.source)
    }

    pub fn destination_id(&self) -> ComponentId {
        ComponentId::of(&self.destination)
    }

    pub fn filter(&self) -> MessageFilter {
        self.filter
    }

    pub fn is_feedback(&self) -> bool {
        self.feedback
    }

    /// Layer whose expansion scheduled this connection (0 = chain start)
    pub fn layer(&self) -> usize {
        self.layer
    }
}

/// Components that exchange one feedback message per iteration
pub struct FeedbackChain {
    id: u64,
    /// Origin first, terminal last
    components: Vec<SharedComponent>,
}

impl FeedbackChain {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Member identities, origin first
    pub fn component_ids(&self) -> Vec<ComponentId> {
        self.components.iter().map(ComponentId::of).collect()
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }
}

pub struct Schedule {
    context: Arc<ChainContext>,
    start: SharedComponent,
    connections: Vec<ScheduledConnection>,
    feedback_chains: Vec<FeedbackChain>,
    wait_message: MessageRef,
}

impl Schedule {
    pub(crate) fn build(
        context: Arc<ChainContext>,
        start: Option<&SharedComponent>,
        connections: &[Connection],
    ) -> Result<Self, ChainError> {
        let start = start.ok_or(ChainError::NoChainStart)?.clone();
        if connections.is_empty() {
            return Err(ChainError::NoConnections);
        }

        let mut components: HashMap<ComponentId, SharedComponent> = HashMap::new();
        let mut edges = Vec::with_capacity(connections.len());
        for connection in connections {
            let src = ComponentId::of(&connection.source);
            let dst = ComponentId::of(&connection.destination);
            components.entry(src).or_insert_with(|| connection.source.clone());
            components.entry(dst).or_insert_with(|| connection.destination.clone());
            edges.push((src, dst));
        }
        let name_of = |id: ComponentId| -> String {
            components
                .get(&id)
                .map(|c| c.lock().name().to_string())
                .unwrap_or_else(|| "<unknown>".to_string())
        };
        let map_err = |err: TopologyError| match err {
            TopologyError::Cycle(id) => ChainError::CycleDetected(name_of(id)),
            TopologyError::Unreachable(count) => ChainError::UnreachableConnections { count },
            TopologyError::ConflictingFeedback(id) => ChainError::ConflictingFeedback(name_of(id)),
        };

        if let Some(id) = topology::find_cycle(&edges) {
            return Err(map_err(TopologyError::Cycle(id)));
        }
        let layered =
            topology::layer_connections(ComponentId::of(&start), &edges).map_err(map_err)?;

        let feedback_edges: Vec<_> = connections
            .iter()
            .zip(&edges)
            .filter(|(connection, _)| connection.feedback)
            .map(|(_, &edge)| edge)
            .collect();
        let chains = topology::feedback_chains(&feedback_edges).map_err(map_err)?;

        let scheduled = layered
            .into_iter()
            .map(|edge| {
                let connection = &connections[edge.index];
                ScheduledConnection {
                    source: connection.source.clone(),
                    destination: connection.destination.clone(),
                    filter: connection.filter,
                    feedback: connection.feedback,
                    layer: edge.layer,
                }
            })
            .collect();

        let feedback_chains = chains
            .into_iter()
            .enumerate()
            .map(|(index, ids)| FeedbackChain {
                id: index as u64,
                components: ids.iter().map(|id| components[id].clone()).collect(),
            })
            .collect();

        Ok(Schedule {
            context,
            start,
            connections: scheduled,
            feedback_chains,
            wait_message: Message::System(SystemMessage::WaitTime).into_ref(),
        })
    }

    pub fn context(&self) -> &ChainContext {
        &self.context
    }

    pub(crate) fn shared_context(&self) -> Arc<ChainContext> {
        self.context.clone()
    }

    pub fn start_id(&self) -> ComponentId {
        ComponentId::of(&self.start)
    }

    /// Connections in execution order
    pub fn connections(&self) -> &[ScheduledConnection] {
        &self.connections
    }

    pub fn feedback_chains(&self) -> &[FeedbackChain] {
        &self.feedback_chains
    }

    /// Run one forward pass and one feedback pass
    ///
    /// Stops at the first component failure; the rest of the iteration is
    /// skipped.
    pub fn run_iteration(&self, iteration: u64) -> Result<(), ChainError> {
        let context = self.context.as_ref();

        {
            let mut start = self.start.lock();
            start
                .push(context, iteration, &self.wait_message)
                .map_err(|err| failed(&*start, err))?;
        }

        for connection in &self.connections {
            self.transfer(connection, iteration)?;
        }

        for chain in &self.feedback_chains {
            let mut feedback = Feedback::new(chain.id);
            for component in chain.components.iter().rev() {
                let mut component = component.lock();
                component
                    .process_feedback(context, &mut feedback)
                    .map_err(|err| failed(&*component, err))?;
            }
        }

        Ok(())
    }

    fn transfer(&self, connection: &ScheduledConnection, iteration: u64) -> Result<(), ChainError> {
        let context = self.context.as_ref();
        let (mut source, mut destination) =
            lock_pair(&connection.source, &connection.destination);

        while let Some(message) = source
            .pull(context, iteration)
            .map_err(|err| failed(&*source, err))?
        {
            if connection.filter.matches(&message) {
                destination
                    .push(context, iteration, &message)
                    .map_err(|err| failed(&*destination, err))?;
            }
        }
        Ok(())
    }
}

fn failed(component: &dyn Component, source: ComponentError) -> ChainError {
    ChainError::ComponentFailed {
        component: component.name().to_string(),
        source,
    }
}

/// Lock two distinct components in address order
fn lock_pair<'a>(
    a: &'a SharedComponent,
    b: &'a SharedComponent,
) -> (
    MutexGuard<'a, dyn Component>,
    MutexGuard<'a, dyn Component>,
) {
    if ComponentId::of(a) < ComponentId::of(b) {
        let first = a.lock();
        let second = b.lock();
        (first, second)
    } else {
        let second = b.lock();
        let first = a.lock();
        (first, second)
    }
}
