//! Workflow definitions: small node graphs submitted by clients.
//!
//! A definition is validated up front (ids, references, acyclicity) before
//! any execution is scheduled, so the executor can assume a well-formed
//! graph.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

/// A client-submitted workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,
    #[serde(default)]
    pub nodes: Vec<DefinitionNode>,
    #[serde(default)]
    pub connections: Vec<Connection>,
}

/// One node in a definition graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefinitionNode {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: String,
    pub name: String,
    #[serde(default)]
    pub config: serde_json::Value,
}

/// A directed edge between two node ids.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    pub from: String,
    pub to: String,
}

/// Outcome of validating a definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
}

impl WorkflowDefinition {
    /// Validate the definition. Collects every problem rather than stopping
    /// at the first one.
    pub fn validate(&self) -> ValidationReport {
        let mut errors = Vec::new();

        if self.name.trim().is_empty() {
            errors.push("Workflow name must not be empty".to_string());
        }
        if self.nodes.is_empty() {
            errors.push("Workflow must contain at least one node".to_string());
        }

        let mut seen = HashSet::new();
        for node in &self.nodes {
            if node.id.trim().is_empty() {
                errors.push("Node id must not be empty".to_string());
            } else if !seen.insert(node.id.as_str()) {
                errors.push(format!("Duplicate node id: {}", node.id));
            }
            if node.node_type.trim().is_empty() {
                errors.push(format!("Node '{}' has an empty type", node.id));
            }
            if node.name.trim().is_empty() {
                errors.push(format!("Node '{}' has an empty name", node.id));
            }
        }

        let ids: HashSet<&str> = self.nodes.iter().map(|n| n.id.as_str()).collect();
        for conn in &self.connections {
            if !ids.contains(conn.from.as_str()) {
                errors.push(format!("Connection references unknown node: {}", conn.from));
            }
            if !ids.contains(conn.to.as_str()) {
                errors.push(format!("Connection references unknown node: {}", conn.to));
            }
        }

        if errors.is_empty() {
            if let Some(node_id) = self.find_cycle() {
                errors.push(format!(
                    "Workflow contains a cyclic dependency involving node: {}",
                    node_id
                ));
            }
        }

        ValidationReport {
            valid: errors.is_empty(),
            errors,
        }
    }

    /// Compute an execution order with Kahn's algorithm.
    ///
    /// Falls back to declaration order when the topological sort cannot
    /// cover every node, so a caller that skipped validation still gets a
    /// deterministic order.
    pub fn execution_order(&self) -> Vec<String> {
        let mut in_degree: HashMap<&str, usize> =
            self.nodes.iter().map(|n| (n.id.as_str(), 0)).collect();
        let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();

        for conn in &self.connections {
            if !in_degree.contains_key(conn.from.as_str())
                || !in_degree.contains_key(conn.to.as_str())
            {
                continue;
            }
            adjacency
                .entry(conn.from.as_str())
                .or_default()
                .push(conn.to.as_str());
            if let Some(d) = in_degree.get_mut(conn.to.as_str()) {
                *d += 1;
            }
        }

        // Seed the queue in declaration order so independent nodes keep a
        // stable relative order.
        let mut queue: VecDeque<&str> = self
            .nodes
            .iter()
            .filter(|n| in_degree.get(n.id.as_str()) == Some(&0))
            .map(|n| n.id.as_str())
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(id) = queue.pop_front() {
            order.push(id.to_string());
            for &next in adjacency.get(id).into_iter().flatten() {
                if let Some(d) = in_degree.get_mut(next) {
                    *d -= 1;
                    if *d == 0 {
                        queue.push_back(next);
                    }
                }
            }
        }

        if order.len() != self.nodes.len() {
            return self.nodes.iter().map(|n| n.id.clone()).collect();
        }
        order
    }

    /// DFS cycle detection. Returns a node id on any cycle, if one exists.
    fn find_cycle(&self) -> Option<String> {
        let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
        for conn in &self.connections {
            adjacency
                .entry(conn.from.as_str())
                .or_default()
                .push(conn.to.as_str());
        }

        let mut visited = HashSet::new();
        let mut in_path = HashSet::new();

        for node in &self.nodes {
            if let Some(found) =
                Self::dfs(node.id.as_str(), &adjacency, &mut visited, &mut in_path)
            {
                return Some(found.to_string());
            }
        }
        None
    }

    fn dfs<'a>(
        id: &'a str,
        adjacency: &HashMap<&str, Vec<&'a str>>,
        visited: &mut HashSet<&'a str>,
        in_path: &mut HashSet<&'a str>,
    ) -> Option<&'a str> {
        if in_path.contains(id) {
            return Some(id);
        }
        if !visited.insert(id) {
            return None;
        }

        in_path.insert(id);
        for &next in adjacency.get(id).into_iter().flatten() {
            if let Some(found) = Self::dfs(next, adjacency, visited, in_path) {
                return Some(found);
            }
        }
        in_path.remove(id);
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, node_type: &str) -> DefinitionNode {
        DefinitionNode {
            id: id.to_string(),
            node_type: node_type.to_string(),
            name: format!("{} node", id),
            config: serde_json::Value::Null,
        }
    }

    fn edge(from: &str, to: &str) -> Connection {
        Connection {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    #[test]
    fn test_valid_definition() {
        let def = WorkflowDefinition {
            name: "pipeline".to_string(),
            nodes: vec![node("a", "data"), node("b", "analysis")],
            connections: vec![edge("a", "b")],
        };
        let report = def.validate();
        assert!(report.valid, "{:?}", report.errors);
    }

    #[test]
    fn test_duplicate_and_dangling_are_reported_together() {
        let def = WorkflowDefinition {
            name: "bad".to_string(),
            nodes: vec![node("a", "data"), node("a", "data")],
            connections: vec![edge("a", "ghost")],
        };
        let report = def.validate();
        assert!(!report.valid);
        assert!(report.errors.iter().any(|e| e.contains("Duplicate node id")));
        assert!(report.errors.iter().any(|e| e.contains("unknown node: ghost")));
    }

    #[test]
    fn test_cycle_is_reported_as_validation_error() {
        let def = WorkflowDefinition {
            name: "loop".to_string(),
            nodes: vec![node("a", "data"), node("b", "analysis"), node("c", "output")],
            connections: vec![edge("a", "b"), edge("b", "c"), edge("c", "a")],
        };
        let report = def.validate();
        assert!(!report.valid);
        assert!(report
            .errors
            .iter()
            .any(|e| e.contains("cyclic dependency")));
    }

    #[test]
    fn test_self_loop_detected() {
        let def = WorkflowDefinition {
            name: "loop".to_string(),
            nodes: vec![node("a", "data")],
            connections: vec![edge("a", "a")],
        };
        assert!(!def.validate().valid);
    }

    #[test]
    fn test_execution_order_respects_edges() {
        let def = WorkflowDefinition {
            name: "diamond".to_string(),
            nodes: vec![
                node("d", "output"),
                node("b", "analysis"),
                node("c", "risk"),
                node("a", "data"),
            ],
            connections: vec![edge("a", "b"), edge("a", "c"), edge("b", "d"), edge("c", "d")],
        };
        let order = def.execution_order();
        assert_eq!(order.len(), 4);

        let pos = |id: &str| order.iter().position(|n| n == id).unwrap();
        assert!(pos("a") < pos("b"));
        assert!(pos("a") < pos("c"));
        assert!(pos("b") < pos("d"));
        assert!(pos("c") < pos("d"));
    }

    #[test]
    fn test_execution_order_falls_back_to_declaration_order_on_cycle() {
        let def = WorkflowDefinition {
            name: "loop".to_string(),
            nodes: vec![node("x", "data"), node("y", "analysis")],
            connections: vec![edge("x", "y"), edge("y", "x")],
        };
        // Topological sort cannot cover a cycle, so the declared order wins.
        assert_eq!(def.execution_order(), vec!["x", "y"]);
    }

    #[test]
    fn test_independent_nodes_keep_declaration_order() {
        let def = WorkflowDefinition {
            name: "flat".to_string(),
            nodes: vec![node("n3", "a"), node("n1", "b"), node("n2", "c")],
            connections: vec![],
        };
        assert_eq!(def.execution_order(), vec!["n3", "n1", "n2"]);
    }
}
