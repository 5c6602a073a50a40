//! Immutable context snapshots
//!
//! A `ContextSnapshot` holds every node output and variable visible at one
//! point of a run. Writes never modify a snapshot in place: each returns a
//! new value and earlier snapshots stay valid, so a replayed run observes
//! exactly the same values. Maps are shared between snapshots and copied
//! on write.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::NodeId;

/// Reserved variable for a single (non-nested) loop
pub const LOOP_VARIABLE: &str = "loop";
/// Reserved variable for the outer level of a nested loop
pub const OUTER_LOOP_VARIABLE: &str = "outerLoop";
/// Reserved variable for the inner level of a nested loop
pub const INNER_LOOP_VARIABLE: &str = "innerLoop";
/// Prefix of the per-branch identity variable written on fan-out
pub const PARALLEL_VARIABLE_PREFIX: &str = "parallel_";

/// Whether a variable name belongs to an engine-reserved namespace
pub fn is_reserved_variable(name: &str) -> bool {
    name == LOOP_VARIABLE
        || name == OUTER_LOOP_VARIABLE
        || name == INNER_LOOP_VARIABLE
        || name.starts_with("loop_")
        || name.starts_with(PARALLEL_VARIABLE_PREFIX)
}

/// Immutable snapshot of node outputs and variables
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextSnapshot {
    node_outputs: Arc<BTreeMap<NodeId, Value>>,
    variables: Arc<BTreeMap<String, Value>>,
}

/// Create a fresh snapshot seeded with the given variables
pub fn create_context<I, K>(initial_variables: I) -> ContextSnapshot
where
    I: IntoIterator<Item = (K, Value)>,
    K: Into<String>,
{
    ContextSnapshot::new(initial_variables)
}

impl ContextSnapshot {
    /// Create a fresh snapshot seeded with the given variables
    pub fn new<I, K>(initial_variables: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let variables = initial_variables
            .into_iter()
            .map(|(k, v)| (k.into(), v))
            .collect();
        Self {
            node_outputs: Arc::new(BTreeMap::new()),
            variables: Arc::new(variables),
        }
    }

    /// Store a node output. Last write wins.
    pub fn store_node_output(&self, node_id: impl Into<NodeId>, output: Value) -> Self {
        let mut next = self.clone();
        Arc::make_mut(&mut next.node_outputs).insert(node_id.into(), output);
        next
    }

    /// Get the output stored for a node
    pub fn get_node_output(&self, node_id: &str) -> Option<&Value> {
        self.node_outputs.get(node_id)
    }

    /// Check whether a node has stored an output
    pub fn has_node_output(&self, node_id: &str) -> bool {
        self.node_outputs.contains_key(node_id)
    }

    /// Set a variable
    pub fn set_variable(&self, name: impl Into<String>, value: Value) -> Self {
        let mut next = self.clone();
        Arc::make_mut(&mut next.variables).insert(name.into(), value);
        next
    }

    /// Get a variable
    pub fn get_variable(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    /// Remove a variable
    pub fn remove_variable(&self, name: &str) -> Self {
        if !self.variables.contains_key(name) {
            return self.clone();
        }
        let mut next = self.clone();
        Arc::make_mut(&mut next.variables).remove(name);
        next
    }

    /// Set several variables at once
    pub fn with_variables<I, K>(&self, values: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let mut next = self.clone();
        let vars = Arc::make_mut(&mut next.variables);
        for (k, v) in values {
            vars.insert(k.into(), v);
        }
        next
    }

    /// All node outputs
    pub fn node_outputs(&self) -> &BTreeMap<NodeId, Value> {
        &self.node_outputs
    }

    /// All variables, reserved namespaces included
    pub fn variables(&self) -> &BTreeMap<String, Value> {
        &self.variables
    }

    /// Resolve a dotted path such as `fetch.body.items.0`.
    ///
    /// The first segment names a node output, falling back to a variable.
    /// Remaining segments index objects by key and arrays by position.
    pub fn resolve_path(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.').filter(|s| !s.is_empty());
        let head = segments.next()?;
        let mut current = self
            .node_outputs
            .get(head)
            .or_else(|| self.variables.get(head))?;
        for segment in segments {
            current = match current {
                Value::Object(map) => map.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Collect the outputs of the given nodes (missing outputs are omitted)
    pub fn final_outputs<'a, I>(&self, node_ids: I) -> BTreeMap<NodeId, Value>
    where
        I: IntoIterator<Item = &'a NodeId>,
    {
        node_ids
            .into_iter()
            .filter_map(|id| self.node_outputs.get(id).map(|v| (id.clone(), v.clone())))
            .collect()
    }

    /// Apply to `self` every entry that `updated` changed relative to `base`.
    ///
    /// Used to fold the result of work that ran against an older snapshot
    /// back into the current one without clobbering unrelated writes.
    pub fn overlay_changes(&self, base: &ContextSnapshot, updated: &ContextSnapshot) -> Self {
        let mut next = self.clone();
        let changed_outputs: Vec<(NodeId, Value)> = updated
            .node_outputs
            .iter()
            .filter(|(k, v)| base.node_outputs.get(*k) != Some(*v))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if !changed_outputs.is_empty() {
            Arc::make_mut(&mut next.node_outputs).extend(changed_outputs);
        }
        let changed_vars: Vec<(String, Value)> = updated
            .variables
            .iter()
            .filter(|(k, v)| base.variables.get(*k) != Some(*v))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if !changed_vars.is_empty() {
            Arc::make_mut(&mut next.variables).extend(changed_vars);
        }
        next
    }
}
