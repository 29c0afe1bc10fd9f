//! Combining context fragments contributed by several agents.
//!
//! [`ContextMerger::merge`] folds a list of [`ContextContribution`]s into a base
//! context according to a [`MergeStrategy`]. Disagreements are surfaced as
//! [`Conflict`]s instead of being dropped.
//!
//! | Strategy       | Key collision with different values                     |
//! |----------------|---------------------------------------------------------|
//! | `Union`        | first value kept, one unresolved `DataMismatch` per path |
//! | `Intersection` | field dropped                                           |
//! | `Priority`     | later contribution wins, nothing recorded              |
//! | `Expert`       | as `Union`, then offered to the expert's resolver      |
//!
//! Paths are lists of object keys from the root; arrays and scalars are leaves.
//!
//! # Example
//!
//! ```rust
//! use nero::context_merger::{ContextContribution, ContextMerger, MergeStrategy};
//! use serde_json::json;
//!
//! let merger = ContextMerger::new();
//! let merged = merger.merge(
//!     &json!({"phase": "draft"}),
//!     &[
//!         ContextContribution::new("monitor", json!({"artifacts": {"a": 1}})),
//!         ContextContribution::new("permit", json!({"artifacts": {"b": 2}})),
//!     ],
//!     MergeStrategy::Union,
//! );
//! assert_eq!(merged.context["artifacts"], json!({"a": 1, "b": 2}));
//! assert_eq!(merged.sources.len(), 2);
//! assert!(merged.conflicts.is_empty());
//! ```

use crate::nero::session::ContextMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::Arc;

const BASE_SOURCE: &str = "base";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "lowercase")]
pub enum MergeStrategy {
    Union,
    Intersection,
    Priority,
    Expert { expert_id: String },
}

/// A context fragment offered by one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextContribution {
    pub agent_id: String,
    pub context: ContextMap,
    pub reasoning: Option<String>,
    pub confidence: Option<f32>,
    pub contributed_at: DateTime<Utc>,
}

impl ContextContribution {
    /// A non-object `context` contributes nothing.
    pub fn new(agent_id: impl Into<String>, context: JsonValue) -> Self {
        Self {
            agent_id: agent_id.into(),
            context: into_map(context),
            reasoning: None,
            confidence: None,
            contributed_at: Utc::now(),
        }
    }

    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = Some(reasoning.into());
        self
    }

    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = Some(confidence.clamp(0.0, 1.0));
        self
    }
}

/// Provenance of one contribution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextSource {
    pub agent_id: String,
    pub contributed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictKind {
    DataMismatch,
    OpinionDifference,
    CitationConflict,
}

/// One side of a conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictPosition {
    pub agent_id: String,
    pub value: JsonValue,
    pub reasoning: Option<String>,
    pub confidence: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictResolution {
    pub resolved_by: String,
    pub chosen_value: JsonValue,
    pub reasoning: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub kind: ConflictKind,
    pub path: Vec<String>,
    pub description: String,
    /// In the order the values were encountered; the first is the one kept.
    pub positions: Vec<ConflictPosition>,
    pub resolution: Option<ConflictResolution>,
}

impl Conflict {
    /// The path joined with `.`.
    pub fn dotted_path(&self) -> String {
        self.path.join(".")
    }

    pub fn is_resolved(&self) -> bool {
        self.resolution.is_some()
    }

    pub fn position_of(&self, agent_id: &str) -> Option<&ConflictPosition> {
        self.positions.iter().find(|p| p.agent_id == agent_id)
    }

    fn describe(&mut self) {
        self.description = format!(
            "{} sources disagree on '{}'",
            self.positions.len(),
            self.dotted_path()
        );
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedContext {
    pub context: ContextMap,
    pub sources: Vec<ContextSource>,
    pub conflicts: Vec<Conflict>,
    pub strategy: MergeStrategy,
    pub merged_at: DateTime<Utc>,
}

impl MergedContext {
    pub fn unresolved_conflicts(&self) -> impl Iterator<Item = &Conflict> {
        self.conflicts.iter().filter(|c| !c.is_resolved())
    }
}

/// Decides a conflict on behalf of an expert agent.
///
/// Returning `None` leaves the conflict unresolved.
pub trait ConflictResolver: Send + Sync {
    fn resolve(&self, expert_id: &str, conflict: &Conflict) -> Option<ConflictResolution>;
}

impl<F> ConflictResolver for F
where
    F: Fn(&str, &Conflict) -> Option<ConflictResolution> + Send + Sync,
{
    fn resolve(&self, expert_id: &str, conflict: &Conflict) -> Option<ConflictResolution> {
        self(expert_id, conflict)
    }
}

/// Resolves a conflict to the expert's own position, if the expert took one.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExpertPreference;

impl ConflictResolver for ExpertPreference {
    fn resolve(&self, expert_id: &str, conflict: &Conflict) -> Option<ConflictResolution> {
        let position = conflict.position_of(expert_id)?;
        Some(ConflictResolution {
            resolved_by: expert_id.to_string(),
            chosen_value: position.value.clone(),
            reasoning: position
                .reasoning
                .clone()
                .unwrap_or_else(|| format!("{} keeps its own value", expert_id)),
        })
    }
}

/// Stateless apart from the registered expert resolvers.
#[derive(Default)]
pub struct ContextMerger {
    resolvers: HashMap<String, Arc<dyn ConflictResolver>>,
}

impl ContextMerger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolver consulted when merging with `MergeStrategy::Expert { expert_id }`.
    pub fn with_resolver(
        mut self,
        expert_id: impl Into<String>,
        resolver: Arc<dyn ConflictResolver>,
    ) -> Self {
        self.resolvers.insert(expert_id.into(), resolver);
        self
    }

    /// Merge `contributions` into `base`. A non-object `base` counts as empty.
    pub fn merge(
        &self,
        base: &JsonValue,
        contributions: &[ContextContribution],
        strategy: MergeStrategy,
    ) -> MergedContext {
        let base = into_map(base.clone());
        let (context, conflicts) = match &strategy {
            MergeStrategy::Union => union(base, contributions),
            MergeStrategy::Intersection => (intersection(base, contributions), Vec::new()),
            MergeStrategy::Priority => {
                let mut context = base;
                for contribution in contributions {
                    overwrite(&mut context, &contribution.context);
                }
                (context, Vec::new())
            }
            MergeStrategy::Expert { expert_id } => {
                let (mut context, mut conflicts) = union(base, contributions);
                self.resolve_for_expert(expert_id, &mut context, &mut conflicts);
                (context, conflicts)
            }
        };

        let merged = MergedContext {
            context,
            sources: contributions
                .iter()
                .map(|c| ContextSource {
                    agent_id: c.agent_id.clone(),
                    contributed_at: c.contributed_at,
                })
                .collect(),
            conflicts,
            strategy,
            merged_at: Utc::now(),
        };
        log::debug!(
            "nero::context_merger: merged {} contributions with {:?}, {} conflicts ({} unresolved)",
            merged.sources.len(),
            merged.strategy,
            merged.conflicts.len(),
            merged.unresolved_conflicts().count()
        );
        merged
    }

    fn resolve_for_expert(
        &self,
        expert_id: &str,
        context: &mut ContextMap,
        conflicts: &mut [Conflict],
    ) {
        let resolver = match self.resolvers.get(expert_id) {
            Some(resolver) => resolver,
            None => {
                if !conflicts.is_empty() {
                    log::warn!(
                        "nero::context_merger: no resolver for expert '{}', {} conflicts left open",
                        expert_id,
                        conflicts.len()
                    );
                }
                return;
            }
        };
        for conflict in conflicts.iter_mut() {
            if let Some(resolution) = resolver.resolve(expert_id, conflict) {
                set_path(context, &conflict.path, resolution.chosen_value.clone());
                conflict.resolution = Some(resolution);
            }
        }
    }
}

fn into_map(value: JsonValue) -> ContextMap {
    match value {
        JsonValue::Object(map) => map,
        _ => ContextMap::new(),
    }
}

struct UnionState<'a> {
    /// Who wrote each path; lookups fall back to the nearest written prefix.
    owners: HashMap<Vec<String>, &'a ContextContribution>,
    conflict_index: HashMap<Vec<String>, usize>,
    conflicts: Vec<Conflict>,
}

impl<'a> UnionState<'a> {
    fn owner_position(&self, path: &[String], value: &JsonValue) -> ConflictPosition {
        let owner = (1..=path.len())
            .rev()
            .find_map(|len| self.owners.get(&path[..len]));
        match owner {
            Some(contribution) => position(contribution, value),
            None => ConflictPosition {
                agent_id: BASE_SOURCE.to_string(),
                value: value.clone(),
                reasoning: None,
                confidence: None,
            },
        }
    }
}

fn position(contribution: &ContextContribution, value: &JsonValue) -> ConflictPosition {
    ConflictPosition {
        agent_id: contribution.agent_id.clone(),
        value: value.clone(),
        reasoning: contribution.reasoning.clone(),
        confidence: contribution.confidence,
    }
}

fn union(base: ContextMap, contributions: &[ContextContribution]) -> (ContextMap, Vec<Conflict>) {
    let mut context = base;
    let mut state = UnionState {
        owners: HashMap::new(),
        conflict_index: HashMap::new(),
        conflicts: Vec::new(),
    };
    for contribution in contributions {
        let mut path = Vec::new();
        union_into(&mut context, &contribution.context, contribution, &mut path, &mut state);
    }
    (context, state.conflicts)
}

fn union_into<'a>(
    target: &mut ContextMap,
    incoming: &ContextMap,
    contribution: &'a ContextContribution,
    path: &mut Vec<String>,
    state: &mut UnionState<'a>,
) {
    for (key, value) in incoming {
        path.push(key.clone());
        match target.get_mut(key) {
            None => {
                target.insert(key.clone(), value.clone());
                state.owners.insert(path.clone(), contribution);
            }
            Some(JsonValue::Object(existing)) if value.is_object() => {
                if let JsonValue::Object(nested) = value {
                    union_into(existing, nested, contribution, path, state);
                }
            }
            Some(existing) => {
                if let Some(&index) = state.conflict_index.get(path.as_slice()) {
                    let conflict = &mut state.conflicts[index];
                    conflict.positions.push(position(contribution, value));
                    conflict.describe();
                } else if existing != value {
                    let first = state.owner_position(path, existing);
                    let mut conflict = Conflict {
                        kind: ConflictKind::DataMismatch,
                        path: path.clone(),
                        description: String::new(),
                        positions: vec![first, position(contribution, value)],
                        resolution: None,
                    };
                    conflict.describe();
                    state.conflict_index.insert(path.clone(), state.conflicts.len());
                    state.conflicts.push(conflict);
                }
            }
        }
        path.pop();
    }
}

fn intersection(base: ContextMap, contributions: &[ContextContribution]) -> ContextMap {
    contributions
        .iter()
        .fold(base, |kept, contribution| intersect(&kept, &contribution.context))
}

fn intersect(left: &ContextMap, right: &ContextMap) -> ContextMap {
    let mut kept = ContextMap::new();
    for (key, value) in left {
        let other = match right.get(key) {
            Some(other) => other,
            None => continue,
        };
        match (value, other) {
            _ if value == other => {
                kept.insert(key.clone(), value.clone());
            }
            (JsonValue::Object(a), JsonValue::Object(b)) => {
                let nested = intersect(a, b);
                if !nested.is_empty() {
                    kept.insert(key.clone(), JsonValue::Object(nested));
                }
            }
            _ => {}
        }
    }
    kept
}

fn overwrite(target: &mut ContextMap, incoming: &ContextMap) {
    for (key, value) in incoming {
        if let (Some(JsonValue::Object(existing)), JsonValue::Object(nested)) =
            (target.get_mut(key), value)
        {
            overwrite(existing, nested);
            continue;
        }
        target.insert(key.clone(), value.clone());
    }
}

fn set_path(target: &mut ContextMap, path: &[String], value: JsonValue) {
    let (last, parents) = match path.split_last() {
        Some(split) => split,
        None => return,
    };
    let mut current = target;
    for key in parents {
        let entry = current
            .entry(key.clone())
            .or_insert_with(|| JsonValue::Object(ContextMap::new()));
        if !entry.is_object() {
            *entry = JsonValue::Object(ContextMap::new());
        }
        current = match entry {
            JsonValue::Object(map) => map,
            _ => return,
        };
    }
    current.insert(last.clone(), value);
}
