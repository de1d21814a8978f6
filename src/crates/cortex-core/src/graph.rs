//! Action graph construction and validation
//!
//! Takes the actions emitted by the parser for one iteration and produces a
//! validated, executable dependency graph. Validation rejects duplicate ids,
//! oversized graphs, dangling dependencies, dependencies on fire-and-forget
//! actions, duplicate output keys, and cycles (Kahn's algorithm). After
//! validation the graph carries a wave assignment — the depth of each action
//! in the DAG — used for diagnostics and for fair-scheduling tie-breaks; it
//! is an upper bound, not an execution boundary.

use crate::action::Action;
use crate::error::ValidationError;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};

/// Most actions one iteration may declare before the scheduler refuses the
/// graph.
pub const MAX_GRAPH_ACTIONS: usize = 1024;

/// A validated, executable dependency graph for one iteration
#[derive(Debug, Clone, Serialize)]
#[serde(transparent)]
pub struct ActionGraph {
    /// Canonical parse (closing-tag) order
    actions: Vec<Action>,

    #[serde(skip)]
    index: HashMap<String, usize>,

    /// Reverse edges: id -> ids that depend on it
    #[serde(skip)]
    dependents: HashMap<String, Vec<String>>,

    /// wave(v) = 1 + max(wave(deps)); roots are wave 1
    #[serde(skip)]
    waves: HashMap<String, u32>,
}

impl<'de> Deserialize<'de> for ActionGraph {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let actions = Vec::<Action>::deserialize(deserializer)?;
        ActionGraph::build(actions).map_err(serde::de::Error::custom)
    }
}

impl ActionGraph {
    /// Validate the action list and compute the wave partition.
    pub fn build(mut actions: Vec<Action>) -> Result<Self, ValidationError> {
        if actions.len() > MAX_GRAPH_ACTIONS {
            return Err(ValidationError::GraphTooLarge {
                size: actions.len(),
                limit: MAX_GRAPH_ACTIONS,
            });
        }

        // Duplicate dependency declarations are harmless; treat the list as
        // a set.
        for action in &mut actions {
            let mut seen = HashSet::new();
            action.depends_on.retain(|dep| seen.insert(dep.clone()));
        }

        let mut index = HashMap::with_capacity(actions.len());
        for (i, action) in actions.iter().enumerate() {
            if index.insert(action.id.clone(), i).is_some() {
                return Err(ValidationError::DuplicateId(action.id.clone()));
            }
        }

        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
        for action in &actions {
            for dep in &action.depends_on {
                let Some(&dep_idx) = index.get(dep) else {
                    return Err(ValidationError::DanglingDependency {
                        action_id: action.id.clone(),
                        missing: dep.clone(),
                    });
                };
                if actions[dep_idx].mode.is_fire_and_forget() {
                    return Err(ValidationError::DependsOnFireAndForget {
                        action_id: action.id.clone(),
                        dependency: dep.clone(),
                    });
                }
                dependents
                    .entry(dep.clone())
                    .or_default()
                    .push(action.id.clone());
            }
        }

        let mut output_keys = HashSet::new();
        for action in &actions {
            if let Some(key) = &action.output_key {
                if !output_keys.insert(key.clone()) {
                    return Err(ValidationError::DuplicateOutputKey(key.clone()));
                }
            }
        }

        let waves = compute_waves(&actions, &index, &dependents)?;

        Ok(Self {
            actions,
            index,
            dependents,
            waves,
        })
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Actions in canonical parse order.
    pub fn actions(&self) -> &[Action] {
        &self.actions
    }

    pub fn get(&self, id: &str) -> Option<&Action> {
        self.index.get(id).map(|&i| &self.actions[i])
    }

    /// Position of the action in the canonical order.
    pub fn ordinal(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    /// Ids that directly depend on `id`.
    pub fn dependents_of(&self, id: &str) -> &[String] {
        self.dependents.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Dependency depth; roots are wave 1.
    pub fn wave_of(&self, id: &str) -> Option<u32> {
        self.waves.get(id).copied()
    }

    /// All ids transitively depending on `id` (excluding `id` itself).
    pub fn transitive_dependents(&self, id: &str) -> HashSet<String> {
        let mut seen = HashSet::new();
        let mut queue: VecDeque<&str> = self.dependents_of(id).iter().map(String::as_str).collect();
        while let Some(next) = queue.pop_front() {
            if seen.insert(next.to_string()) {
                queue.extend(self.dependents_of(next).iter().map(String::as_str));
            }
        }
        seen
    }
}

/// Kahn's algorithm: topological waves, or the set of actions stuck on a
/// cycle.
fn compute_waves(
    actions: &[Action],
    index: &HashMap<String, usize>,
    dependents: &HashMap<String, Vec<String>>,
) -> Result<HashMap<String, u32>, ValidationError> {
    let mut indegree: HashMap<&str, usize> = actions
        .iter()
        .map(|a| (a.id.as_str(), a.depends_on.len()))
        .collect();

    let mut waves: HashMap<String, u32> = HashMap::with_capacity(actions.len());
    let mut queue: VecDeque<&str> = actions
        .iter()
        .filter(|a| a.depends_on.is_empty())
        .map(|a| a.id.as_str())
        .collect();
    for id in &queue {
        waves.insert((*id).to_string(), 1);
    }

    let mut processed = 0;
    while let Some(id) = queue.pop_front() {
        processed += 1;
        let wave = waves[id];
        if let Some(deps) = dependents.get(id) {
            for dependent in deps {
                let entry = waves.entry(dependent.clone()).or_insert(0);
                *entry = (*entry).max(wave + 1);
                let remaining = indegree
                    .get_mut(dependent.as_str())
                    .expect("dependent is indexed");
                *remaining -= 1;
                if *remaining == 0 {
                    let i = index[dependent.as_str()];
                    queue.push_back(actions[i].id.as_str());
                }
            }
        }
    }

    if processed < actions.len() {
        let mut participating: Vec<String> = indegree
            .iter()
            .filter(|(_, &remaining)| remaining > 0)
            .map(|(id, _)| (*id).to_string())
            .collect();
        participating.sort();
        return Err(ValidationError::Cycle { participating });
    }

    Ok(waves)
}
