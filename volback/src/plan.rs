//! Container execution order.
//!
//! `depends_on` edges form a directed graph. Dependencies run before their
//! dependents, otherwise configuration order is preserved. Cycles and unknown
//! dependencies are rejected before anything runs.

use crate::config::ContainerConfig;
use crate::utils::{Result, VolbackError};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::DfsPostOrder;
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    order: Vec<ContainerConfig>,
}

impl ExecutionPlan {
    /// Containers in the order they must be processed.
    pub fn order(&self) -> &[ContainerConfig] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

pub fn build_plan(configs: &[ContainerConfig]) -> Result<ExecutionPlan> {
    // Edges point from a container to each of its dependencies
    let mut graph: DiGraph<usize, ()> = DiGraph::new();
    let mut nodes: HashMap<&str, NodeIndex> = HashMap::new();

    for (i, config) in configs.iter().enumerate() {
        let node = graph.add_node(i);
        if nodes.insert(config.container.as_str(), node).is_some() {
            return Err(VolbackError::Config(format!(
                "container {} is configured more than once",
                config.container
            )));
        }
    }

    for config in configs {
        let from = nodes[config.container.as_str()];
        for dep in &config.depends_on {
            let to = nodes
                .get(dep.as_str())
                .copied()
                .ok_or_else(|| VolbackError::UnknownDependency {
                    container: config.container.clone(),
                    dependency: dep.clone(),
                })?;
            graph.add_edge(from, to, ());
        }
    }

    if let Err(cycle) = toposort(&graph, None) {
        let name = &configs[graph[cycle.node_id()]].container;
        return Err(VolbackError::DependencyCycle(name.clone()));
    }

    // Post-order from each container in configuration order emits dependencies first
    let mut order = Vec::with_capacity(configs.len());
    let mut dfs = DfsPostOrder::empty(&graph);
    for config in configs {
        dfs.move_to(nodes[config.container.as_str()]);
        while let Some(node) = dfs.next(&graph) {
            order.push(configs[graph[node]].clone());
        }
    }

    Ok(ExecutionPlan { order })
}
