//! Task dependency graph
//!
//! Submitted task batches are validated here before any task is enqueued:
//! self-dependencies, references to unknown tasks and cycles are rejected.

use std::collections::{HashMap, HashSet, VecDeque};
use thiserror::Error;

/// Error types for dependency validation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DependencyValidationError {
    #[error("Cycle detected: {}", .0.join(" -> "))]
    CycleDetected(Vec<String>),

    #[error("Task '{from}' depends on unknown task '{to}'")]
    MissingDependency { from: String, to: String },

    #[error("Task '{0}' cannot depend on itself")]
    SelfDependency(String),
}

/// Directed graph of `task -> tasks it depends on`
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: Vec<String>,
    depends_on: HashMap<String, Vec<String>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node; insertion order is the tie-breaker for `execution_order`
    pub fn add_node(&mut self, id: &str) {
        if !self.depends_on.contains_key(id) {
            self.nodes.push(id.to_string());
            self.depends_on.insert(id.to_string(), Vec::new());
        }
    }

    /// Add a dependency: `id` depends on `depends_on_id`
    pub fn add_dependency(
        &mut self,
        id: &str,
        depends_on_id: &str,
    ) -> Result<(), DependencyValidationError> {
        if id == depends_on_id {
            return Err(DependencyValidationError::SelfDependency(id.to_string()));
        }

        self.add_node(id);
        if let Some(deps) = self.depends_on.get_mut(id) {
            if !deps.iter().any(|d| d == depends_on_id) {
                deps.push(depends_on_id.to_string());
            }
        }
        Ok(())
    }

    pub fn dependencies(&self, id: &str) -> &[String] {
        self.depends_on.get(id).map(|d| d.as_slice()).unwrap_or(&[])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.depends_on.contains_key(id)
    }

    /// Validate references and acyclicity.
    /// `is_external` answers whether an id outside the graph refers to an existing task.
    pub fn validate<F>(&self, is_external: F) -> Result<(), DependencyValidationError>
    where
        F: Fn(&str) -> bool,
    {
        for node in &self.nodes {
            for dep in self.dependencies(node) {
                if !self.contains(dep) && !is_external(dep) {
                    return Err(DependencyValidationError::MissingDependency {
                        from: node.clone(),
                        to: dep.clone(),
                    });
                }
            }
        }

        let mut visited: HashSet<&str> = HashSet::new();
        let mut in_path: HashSet<&str> = HashSet::new();
        let mut path: Vec<&str> = Vec::new();

        for node in &self.nodes {
            if !visited.contains(node.as_str()) {
                if let Some(cycle) =
                    self.dfs_cycle_detect(node, &mut visited, &mut in_path, &mut path)
                {
                    return Err(DependencyValidationError::CycleDetected(cycle));
                }
            }
        }

        Ok(())
    }

    fn dfs_cycle_detect<'a>(
        &'a self,
        node: &'a str,
        visited: &mut HashSet<&'a str>,
        in_path: &mut HashSet<&'a str>,
        path: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        visited.insert(node);
        in_path.insert(node);
        path.push(node);

        for dep in self.dependencies(node) {
            let dep = dep.as_str();
            if in_path.contains(dep) {
                let start = path.iter().position(|&n| n == dep).unwrap_or(0);
                let mut cycle: Vec<String> = path[start..].iter().map(|s| s.to_string()).collect();
                cycle.push(dep.to_string());
                return Some(cycle);
            }

            // External ids have no outgoing edges inside this graph
            if self.contains(dep) && !visited.contains(dep) {
                if let Some(cycle) = self.dfs_cycle_detect(dep, visited, in_path, path) {
                    return Some(cycle);
                }
            }
        }

        in_path.remove(node);
        path.pop();
        None
    }

    /// Topological order (dependencies first) using Kahn's algorithm
    pub fn execution_order(&self) -> Result<Vec<String>, DependencyValidationError> {
        self.validate(|_| true)?;

        let mut in_degree: HashMap<&str, usize> = HashMap::new();
        let mut blocks: HashMap<&str, Vec<&str>> = HashMap::new();
        for node in &self.nodes {
            let internal: Vec<&str> = self
                .dependencies(node)
                .iter()
                .map(|d| d.as_str())
                .filter(|d| self.contains(d))
                .collect();
            in_degree.insert(node.as_str(), internal.len());
            for dep in internal {
                blocks.entry(dep).or_default().push(node.as_str());
            }
        }

        let mut queue: VecDeque<&str> = self
            .nodes
            .iter()
            .map(|n| n.as_str())
            .filter(|n| in_degree.get(n).copied().unwrap_or(0) == 0)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(node) = queue.pop_front() {
            order.push(node.to_string());
            if let Some(blocked) = blocks.get(node) {
                for &next in blocked {
                    if let Some(degree) = in_degree.get_mut(next) {
                        *degree -= 1;
                        if *degree == 0 {
                            queue.push_back(next);
                        }
                    }
                }
            }
        }

        Ok(order)
    }
}
