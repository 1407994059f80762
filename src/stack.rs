//! Stack Reconciler (C8): deploys/destroys a declared, acyclic set of
//! named VMs with dependency order and partial-failure recovery.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use log::{info, warn};
use serde::Deserialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::{GlobalConfig, VMSpec};
use crate::environment::Environment;
use crate::error::DockvmError;
use crate::hypervisor::subprocess::Runner;
use crate::hypervisor::Context as HvContext;
use crate::lifecycle;

/// One entry in a stack declaration: a VMSpec-shaped key/value map plus
/// an optional list of node names it depends on.
#[derive(Debug, Clone, Deserialize)]
pub struct StackNode {
    pub name: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(flatten)]
    pub values: HashMap<String, serde_yaml::Value>,
}

/// A parsed, not-yet-validated stack declaration.
#[derive(Debug, Clone, Deserialize)]
pub struct StackDecl {
    pub nodes: Vec<StackNode>,
}

impl StackDecl {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read stack declaration {}", path.display()))?;
        let decl: Self = serde_yaml::from_str(&content)
            .with_context(|| format!("failed to parse stack declaration {}", path.display()))?;
        decl.validate()?;
        Ok(decl)
    }

    /// Validates unique names and acyclic dependencies, and computes a
    /// level-ordered topological grouping (nodes in the same level have
    /// no dependency relation to each other and may run concurrently).
    fn validate(&self) -> Result<(), DockvmError> {
        self.levels()?;
        Ok(())
    }

    fn levels(&self) -> Result<Vec<Vec<String>>, DockvmError> {
        let mut seen = HashSet::new();
        for node in &self.nodes {
            if !seen.insert(node.name.clone()) {
                return Err(DockvmError::config_invalid(
                    "duplicate node name in stack declaration",
                    node.name.clone(),
                ));
            }
        }

        let names: HashSet<&str> = self.nodes.iter().map(|n| n.name.as_str()).collect();
        for node in &self.nodes {
            for dep in &node.depends_on {
                if !names.contains(dep.as_str()) {
                    return Err(DockvmError::config_invalid(
                        format!("node '{}' depends on undeclared node '{}'", node.name, dep),
                        dep.clone(),
                    ));
                }
            }
        }

        let mut indegree: HashMap<&str, usize> =
            self.nodes.iter().map(|n| (n.name.as_str(), n.depends_on.len())).collect();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for node in &self.nodes {
            for dep in &node.depends_on {
                dependents.entry(dep.as_str()).or_default().push(node.name.as_str());
            }
        }

        let mut levels = Vec::new();
        let mut remaining = self.nodes.len();
        let mut frontier: VecDeque<&str> = indegree
            .iter()
            .filter(|(_, &d)| d == 0)
            .map(|(&n, _)| n)
            .collect();

        while !frontier.is_empty() {
            let level: Vec<String> = frontier.iter().map(|s| s.to_string()).collect();
            remaining -= level.len();
            let mut next_frontier = VecDeque::new();
            for &node in &frontier {
                if let Some(deps) = dependents.get(node) {
                    for &dependent in deps {
                        let entry = indegree.get_mut(dependent).unwrap();
                        *entry -= 1;
                        if *entry == 0 {
                            next_frontier.push_back(dependent);
                        }
                    }
                }
            }
            levels.push(level);
            frontier = next_frontier;
        }

        if remaining != 0 {
            return Err(DockvmError::config_invalid(
                "stack declaration has a dependency cycle",
                "depends_on",
            ));
        }

        Ok(levels)
    }

    fn transitive_dependents(&self, failed: &str) -> HashSet<String> {
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for node in &self.nodes {
            for dep in &node.depends_on {
                dependents.entry(dep.as_str()).or_default().push(node.name.as_str());
            }
        }

        let mut out = HashSet::new();
        let mut queue = VecDeque::new();
        queue.push_back(failed);
        while let Some(name) = queue.pop_front() {
            if let Some(deps) = dependents.get(name) {
                for &dependent in deps {
                    if out.insert(dependent.to_string()) {
                        queue.push_back(dependent);
                    }
                }
            }
        }
        out
    }

    fn resolve_node(&self, node: &StackNode, global: &GlobalConfig) -> Result<VMSpec, DockvmError> {
        let mut values: HashMap<String, String> = node
            .values
            .iter()
            .map(|(k, v)| (k.clone(), yaml_scalar_to_string(v)))
            .collect();
        values.insert("name".to_string(), node.name.clone());
        VMSpec::resolve(global, &values, &HashMap::new())
    }
}

fn yaml_scalar_to_string(value: &serde_yaml::Value) -> String {
    match value {
        serde_yaml::Value::String(s) => s.clone(),
        serde_yaml::Value::Number(n) => n.to_string(),
        serde_yaml::Value::Bool(b) => b.to_string(),
        other => serde_yaml::to_string(other).unwrap_or_default().trim().to_string(),
    }
}

/// Per-node outcome of a `deploy`/`destroy` run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeStatus {
    Running,
    Failed(String),
    Skipped,
}

const MAX_PARALLELISM: usize = 4;

/// Deploys every node in dependency order, with bounded parallelism
/// across nodes that have no dependency relation. A node's failure
/// marks all of its transitive dependents `Skipped` without attempting
/// them; nodes that already reached Running are left alone (no
/// rollback on partial failure).
pub async fn deploy(
    env: &Environment,
    runner: Arc<dyn Runner>,
    hv_context: HvContext,
    global: &GlobalConfig,
    decl: &StackDecl,
    token: &CancellationToken,
) -> Result<HashMap<String, NodeStatus>, DockvmError> {
    let levels = decl.levels()?;
    let mut status: HashMap<String, NodeStatus> = HashMap::new();
    let semaphore = Arc::new(Semaphore::new(MAX_PARALLELISM.min(decl.nodes.len().max(1))));

    for level in levels {
        let mut join_set: JoinSet<(String, NodeStatus)> = JoinSet::new();
        for name in &level {
            if status.contains_key(name) {
                // Already marked Skipped by an earlier failure.
                continue;
            }
            let node = decl.nodes.iter().find(|n| &n.name == name).unwrap().clone();
            let spec = match decl.resolve_node(&node, global) {
                Ok(spec) => spec,
                Err(e) => {
                    status.insert(name.clone(), NodeStatus::Failed(e.to_string()));
                    for dependent in decl.transitive_dependents(name) {
                        status.entry(dependent).or_insert(NodeStatus::Skipped);
                    }
                    continue;
                }
            };

            let env = env.clone();
            let runner = Arc::clone(&runner);
            let semaphore = Arc::clone(&semaphore);
            let token = token.clone();
            let name_owned = name.clone();
            let global = global.clone();

            join_set.spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
                let result = lifecycle::up(&env, runner.as_ref(), hv_context, &global, &spec, &token).await;
                match result {
                    Ok(outcome) => {
                        info!("stack node '{name_owned}' reached {:?}", outcome.state);
                        (name_owned, NodeStatus::Running)
                    }
                    Err(e) => {
                        warn!("stack node '{name_owned}' failed: {e}");
                        (name_owned, NodeStatus::Failed(e.to_string()))
                    }
                }
            });
        }

        while let Some(joined) = join_set.join_next().await {
            let (name, node_status) = joined.map_err(|e| {
                DockvmError::domain_create("stack", format!("deploy task panicked: {e}"))
            })?;
            if let NodeStatus::Failed(_) = &node_status {
                for dependent in decl.transitive_dependents(&name) {
                    status.entry(dependent).or_insert(NodeStatus::Skipped);
                }
            }
            status.insert(name, node_status);
        }
    }

    Ok(status)
}

/// Destroys every node in reverse dependency order.
pub fn destroy(
    env: &Environment,
    runner: &dyn Runner,
    hv_context: HvContext,
    decl: &StackDecl,
) -> Result<HashMap<String, NodeStatus>, DockvmError> {
    let mut levels = decl.levels()?;
    levels.reverse();
    let mut status = HashMap::new();
    for level in levels {
        for name in level {
            match lifecycle::down(env, runner, hv_context, &name) {
                Ok(()) => {
                    status.insert(name, NodeStatus::Running);
                }
                Err(e) => {
                    status.insert(name, NodeStatus::Failed(e.to_string()));
                }
            }
        }
    }
    Ok(status)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str, depends_on: &[&str]) -> StackNode {
        StackNode {
            name: name.to_string(),
            depends_on: depends_on.iter().map(|s| s.to_string()).collect(),
            values: HashMap::new(),
        }
    }

    #[test]
    fn levels_orders_independent_nodes_together() {
        let decl = StackDecl {
            nodes: vec![node("db", &[]), node("api", &["db"]), node("web", &["api"])],
        };
        let levels = decl.levels().unwrap();
        assert_eq!(levels, vec![vec!["db".to_string()], vec!["api".to_string()], vec!["web".to_string()]]);
    }

    #[test]
    fn independent_nodes_share_a_level() {
        let decl = StackDecl {
            nodes: vec![node("a", &[]), node("b", &[]), node("c", &["a", "b"])],
        };
        let levels = decl.levels().unwrap();
        assert_eq!(levels.len(), 2);
        assert_eq!(levels[0].len(), 2);
    }

    #[test]
    fn cycle_is_rejected() {
        let decl = StackDecl {
            nodes: vec![node("a", &["b"]), node("b", &["a"])],
        };
        assert!(decl.levels().is_err());
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let decl = StackDecl {
            nodes: vec![node("a", &[]), node("a", &[])],
        };
        assert!(decl.validate().is_err());
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let decl = StackDecl {
            nodes: vec![node("a", &["ghost"])],
        };
        assert!(decl.validate().is_err());
    }

    #[test]
    fn transitive_dependents_follows_the_chain() {
        let decl = StackDecl {
            nodes: vec![node("db", &[]), node("api", &["db"]), node("web", &["api"])],
        };
        let dependents = decl.transitive_dependents("db");
        assert!(dependents.contains("api"));
        assert!(dependents.contains("web"));
    }
}
