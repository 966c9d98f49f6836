//! Graph analysis for chain building
//!
//! Pure functions over component identities: the layered traversal order,
//! cycle detection and feedback chain extraction. The scheduler maps the
//! identities back to components and names.

use crate::component::ComponentId;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TopologyError {
    Cycle(ComponentId),
    Unreachable(usize),
    ConflictingFeedback(ComponentId),
}

/// Position of a declared connection in the traversal order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LayeredEdge {
    /// Index into the declared connection list
    pub index: usize,
    /// Layer whose expansion scheduled this connection (0 = chain start)
    pub layer: usize,
}

/// Order connections layer by layer starting from `start`
///
/// Each pass moves every pending connection whose source is in the current
/// layer to the output, in declaration order, and collects the destinations
/// as the next layer.
pub(crate) fn layer_connections(
    start: ComponentId,
    edges: &[(ComponentId, ComponentId)],
) -> Result<Vec<LayeredEdge>, TopologyError> {
    let mut pending: Vec<usize> = (0..edges.len()).collect();
    let mut ordered = Vec::with_capacity(edges.len());
    let mut current = vec![start];
    let mut layer = 0;

    while !pending.is_empty() {
        let mut next: Vec<ComponentId> = Vec::new();

        pending.retain(|&index| {
            let (src, dst) = edges[index];
            if current.contains(&src) {
                ordered.push(LayeredEdge { index, layer });
                if !next.contains(&dst) {
                    next.push(dst);
                }
                false
            } else {
                true
            }
        });

        if next.is_empty() {
            break;
        }
        current = next;
        layer += 1;
    }

    if !pending.is_empty() {
        return Err(TopologyError::Unreachable(pending.len()));
    }
    Ok(ordered)
}

/// Find a component that lies on a directed cycle, if any
pub(crate) fn find_cycle(edges: &[(ComponentId, ComponentId)]) -> Option<ComponentId> {
    #[derive(Clone, Copy, PartialEq, Eq)]
    enum Mark {
        Visiting,
        Done,
    }

    let mut adjacency: HashMap<ComponentId, Vec<ComponentId>> = HashMap::new();
    let mut nodes = Vec::new();
    for &(src, dst) in edges {
        adjacency.entry(src).or_default().push(dst);
        if !nodes.contains(&src) {
            nodes.push(src);
        }
    }

    let mut marks: HashMap<ComponentId, Mark> = HashMap::new();

    for &root in &nodes {
        if marks.contains_key(&root) {
            continue;
        }

        // Iterative depth-first search; the stack holds (node, next child index)
        let mut stack = vec![(root, 0usize)];
        marks.insert(root, Mark::Visiting);

        while let Some(top) = stack.last_mut() {
            let node = top.0;
            let children = adjacency.get(&node).map(Vec::as_slice).unwrap_or(&[]);
            if let Some(&next) = children.get(top.1) {
                top.1 += 1;
                match marks.get(&next) {
                    Some(Mark::Visiting) => return Some(next),
                    Some(Mark::Done) => {}
                    None => {
                        marks.insert(next, Mark::Visiting);
                        stack.push((next, 0));
                    }
                }
            } else {
                marks.insert(node, Mark::Done);
                stack.pop();
            }
        }
    }

    None
}

/// Split the feedback connections into chains
///
/// `edges` are the feedback-flagged connections in declaration order. Each
/// returned chain lists its components from origin to terminal. Chains may
/// share a terminal, but no other component may sit on two chains.
pub(crate) fn feedback_chains(
    edges: &[(ComponentId, ComponentId)],
) -> Result<Vec<Vec<ComponentId>>, TopologyError> {
    let mut outgoing: HashMap<ComponentId, ComponentId> = HashMap::new();
    let mut has_incoming: HashSet<ComponentId> = HashSet::new();

    for &(src, dst) in edges {
        if outgoing.insert(src, dst).is_some() {
            // Feedback would have to split towards two consumers
            return Err(TopologyError::ConflictingFeedback(src));
        }
        has_incoming.insert(dst);
    }

    let mut chains = Vec::new();
    let mut interior: HashSet<ComponentId> = HashSet::new();
    let mut covered = 0;

    for &(origin, _) in edges {
        if has_incoming.contains(&origin) || interior.contains(&origin) {
            continue;
        }

        let mut chain = vec![origin];
        let mut current = origin;
        while let Some(&next) = outgoing.get(&current) {
            if chain.contains(&next) || chain.len() > edges.len() {
                return Err(TopologyError::Cycle(next));
            }
            chain.push(next);
            current = next;
        }

        for &member in &chain[..chain.len() - 1] {
            if !interior.insert(member) {
                return Err(TopologyError::ConflictingFeedback(member));
            }
        }
        covered += chain.len() - 1;
        chains.push(chain);
    }

    if covered != edges.len() {
        // Edges left over belong to a loop with no origin
        let stray = edges
            .iter()
            .map(|&(src, _)| src)
            .find(|src| !interior.contains(src))
            .unwrap_or(edges[0].0);
        return Err(TopologyError::Cycle(stray));
    }

    Ok(chains)
}
