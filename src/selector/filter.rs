//! Service filters applied before a strategy.

use std::sync::Arc;

use super::Filter;
use crate::registry::Service;

/// Keep services exposing the endpoint `name`.
pub fn endpoint(name: impl Into<String>) -> Filter {
    let name = name.into();
    Arc::new(move |services: &[Service]| {
        services
            .iter()
            .filter(|s| s.endpoints.iter().any(|e| e.name == name))
            .cloned()
            .collect()
    })
}

/// Keep nodes whose metadata has `key` set to `value`.
///
/// Services left without nodes are dropped.
pub fn label(key: impl Into<String>, value: impl Into<String>) -> Filter {
    let key = key.into();
    let value = value.into();
    Arc::new(move |services: &[Service]| {
        services
            .iter()
            .filter_map(|s| {
                let nodes: Vec<_> = s
                    .nodes
                    .iter()
                    .filter(|n| n.metadata.get(&key) == Some(&value))
                    .cloned()
                    .collect();
                (!nodes.is_empty()).then(|| Service {
                    name: s.name.clone(),
                    version: s.version.clone(),
                    endpoints: s.endpoints.clone(),
                    nodes,
                })
            })
            .collect()
    })
}

/// Keep services with exactly `version`.
pub fn version(version: impl Into<String>) -> Filter {
    let version = version.into();
    Arc::new(move |services: &[Service]| {
        services
            .iter()
            .filter(|s| s.version == version)
            .cloned()
            .collect()
    })
}
