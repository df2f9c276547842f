//! Load-balancing strategies.

use std::sync::Arc;

use parking_lot::Mutex;
use rand::Rng;

use super::Next;
use crate::registry::{Node, Service};
use crate::Error;

fn flatten(services: &[Service]) -> Vec<Node> {
    services
        .iter()
        .flat_map(|s| s.nodes.iter().cloned())
        .collect()
}

/// Uniformly random node on every call.
pub fn random(services: &[Service]) -> Next {
    let nodes = flatten(services);
    Arc::new(move || {
        if nodes.is_empty() {
            return Err(Error::NoneAvailable);
        }
        let i = rand::thread_rng().gen_range(0..nodes.len());
        Ok(nodes[i].clone())
    })
}

/// Nodes in cyclic order, starting from a random offset.
pub fn round_robin(services: &[Service]) -> Next {
    let nodes = flatten(services);
    let counter = Mutex::new(rand::thread_rng().gen_range(0..usize::MAX / 2));
    Arc::new(move || {
        if nodes.is_empty() {
            return Err(Error::NoneAvailable);
        }
        let mut i = counter.lock();
        let node = nodes[*i % nodes.len()].clone();
        *i = i.wrapping_add(1);
        Ok(node)
    })
}
