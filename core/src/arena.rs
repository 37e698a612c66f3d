//! Tree Arena - Steps and Branches as Id-Linked Records
//!
//! The flow tree is stored as two flat arenas addressed by opaque ids.
//! Parent/child relationships (Step -> nested Branch -> origin Step)
//! are id links, never owning references, so the back-referencing
//! structure carries no cycles.
//!
//! Branches are append-only and never deleted: once grown, every step
//! stays reachable for the remainder of the session (monotonic growth).

use crate::element::Element;
use crate::error::ValidationFailure;
use crate::phase::{BranchSpec, GrowthFn, GrowthInput, PhaseTable, StepSpec};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

/// Opaque arena index of a [`Step`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StepId(u32);

/// Opaque arena index of a [`Branch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BranchId(u32);

impl std::fmt::Display for StepId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "s{}", self.0)
    }
}

impl StepId {
    /// Parse the token produced by `Display` (used by the HTTP layer to
    /// detect stale submissions).
    pub fn parse(token: &str) -> Option<StepId> {
        token.strip_prefix('s')?.parse().ok().map(StepId)
    }
}

/// HTTP verb of the last interaction, kept protocol-agnostic here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verb {
    Get,
    Post,
}

/// Direction requested by a submission.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    #[default]
    Forward,
    Back,
}

/// The markup last served for a step, replayed verbatim on refresh and
/// on stale submissions.
#[derive(Debug, Clone)]
pub struct CachedView {
    pub step: StepId,
    pub markup: String,
}

/// An ordered, append-only run of steps. `origin` is the step whose
/// growth function produced this branch (`None` for the root).
#[derive(Debug, Clone)]
pub struct Branch {
    pub id: BranchId,
    pub origin: Option<StepId>,
    pub steps: Vec<StepId>,
}

/// One unit of user-facing interaction.
#[derive(Debug, Clone)]
pub struct Step {
    pub id: StepId,
    /// Owning branch.
    pub branch: BranchId,
    /// Position within the owning branch.
    pub ordinal: usize,
    pub label: String,
    /// Explicit forward jump; wins over structural traversal.
    pub next_override: Option<StepId>,
    /// Explicit backward jump; wins over structural traversal.
    pub prev_override: Option<StepId>,
    /// Nested branch, present once the growth function has run.
    pub children: Option<BranchId>,
    pub terminal: bool,
    pub elements: Vec<Element>,
    pub phases: PhaseTable,
    pub growth: Option<GrowthFn>,
    /// Direction of the move that last put the cursor here.
    pub entered_from: Option<Direction>,
    /// Outstanding validation feedback to render with the step.
    pub feedback: Option<ValidationFailure>,
}

impl Step {
    fn from_spec(id: StepId, branch: BranchId, ordinal: usize, spec: StepSpec) -> Self {
        Self {
            id,
            branch,
            ordinal,
            label: spec.label,
            next_override: None,
            prev_override: None,
            children: None,
            terminal: spec.terminal,
            elements: spec.elements,
            phases: spec.phases,
            growth: spec.growth,
            entered_from: None,
            feedback: None,
        }
    }

    pub fn element(&self, name: &str) -> Option<&Element> {
        self.elements
            .iter()
            .find(|el| el.name.as_deref() == Some(name))
    }

    pub fn element_mut(&mut self, name: &str) -> Option<&mut Element> {
        self.elements
            .iter_mut()
            .find(|el| el.name.as_deref() == Some(name))
    }
}

/// The ever-growing nested structure of one flow for one session, plus
/// the single movable cursor.
#[derive(Debug, Clone)]
pub struct Tree {
    pub id: Uuid,
    steps: Vec<Step>,
    branches: Vec<Branch>,
    root: BranchId,
    cursor: StepId,
    /// Re-entrancy latch; set while an interaction (or an offloaded
    /// phase spanning interactions) is in flight.
    pub busy: bool,
    pub last_verb: Option<Verb>,
    pub cached: Option<CachedView>,
}

impl Tree {
    /// Build a tree from its root branch. The root must contain at
    /// least one step for the cursor to point at.
    pub fn new(root: BranchSpec) -> Result<Self, EmptyRoot> {
        if root.is_empty() {
            return Err(EmptyRoot);
        }
        let mut tree = Self {
            id: Uuid::new_v4(),
            steps: Vec::new(),
            branches: Vec::new(),
            root: BranchId(0),
            cursor: StepId(0),
            busy: false,
            last_verb: None,
            cached: None,
        };
        let root_id = tree.alloc_branch(None, root);
        tree.root = root_id;
        tree.cursor = tree.branch(root_id).steps[0];
        Ok(tree)
    }

    fn alloc_branch(&mut self, origin: Option<StepId>, spec: BranchSpec) -> BranchId {
        let branch_id = BranchId(self.branches.len() as u32);
        let mut step_ids = Vec::with_capacity(spec.steps.len());
        for (ordinal, step_spec) in spec.steps.into_iter().enumerate() {
            let step_id = StepId(self.steps.len() as u32);
            self.steps
                .push(Step::from_spec(step_id, branch_id, ordinal, step_spec));
            step_ids.push(step_id);
        }
        self.branches.push(Branch {
            id: branch_id,
            origin,
            steps: step_ids,
        });
        branch_id
    }

    /// Attach a grown branch as `step`'s children. Idempotent: if the
    /// step already has children the existing branch is returned and
    /// `spec` is discarded, so a re-delivered growth result never
    /// duplicates steps or elements.
    pub fn attach_children(&mut self, step: StepId, spec: BranchSpec) -> BranchId {
        if let Some(existing) = self.step(step).children {
            return existing;
        }
        let branch = self.alloc_branch(Some(step), spec);
        self.step_mut(step).children = Some(branch);
        branch
    }

    pub fn root(&self) -> BranchId {
        self.root
    }

    pub fn cursor(&self) -> StepId {
        self.cursor
    }

    /// Relocate the cursor. The id necessarily references a step in
    /// this arena, so the reachability invariant holds by construction.
    pub fn set_cursor(&mut self, step: StepId) {
        self.cursor = step;
    }

    pub fn current(&self) -> &Step {
        self.step(self.cursor)
    }

    pub fn current_mut(&mut self) -> &mut Step {
        let cursor = self.cursor;
        self.step_mut(cursor)
    }

    pub fn step(&self, id: StepId) -> &Step {
        &self.steps[id.0 as usize]
    }

    pub fn step_mut(&mut self, id: StepId) -> &mut Step {
        &mut self.steps[id.0 as usize]
    }

    pub fn branch(&self, id: BranchId) -> &Branch {
        &self.branches[id.0 as usize]
    }

    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    /// Explicit forward jump from `step` to `target`, skipping the
    /// structural traversal.
    pub fn set_next_override(&mut self, step: StepId, target: StepId) {
        self.step_mut(step).next_override = Some(target);
    }

    /// Explicit backward jump from `step` to `target`.
    pub fn set_prev_override(&mut self, step: StepId, target: StepId) {
        self.step_mut(step).prev_override = Some(target);
    }

    /// Dot-separated path of 1-based ordinals from the root to `step`.
    /// Read-only; useful for display and debugging.
    pub fn position(&self, step: StepId) -> String {
        let mut parts = Vec::new();
        let mut at = step;
        loop {
            parts.push((self.step(at).ordinal + 1).to_string());
            match self.branch(self.step(at).branch).origin {
                Some(origin) => at = origin,
                None => break,
            }
        }
        parts.reverse();
        parts.join(".")
    }

    /// Latest value per variable name in pre-order, the snapshot growth
    /// functions branch on.
    pub fn values(&self) -> HashMap<String, Value> {
        let mut out = HashMap::new();
        self.collect_values(self.root, &mut out);
        out
    }

    fn collect_values(&self, branch: BranchId, out: &mut HashMap<String, Value>) {
        for &step_id in &self.branch(branch).steps {
            let step = self.step(step_id);
            for el in &step.elements {
                if let Some(name) = &el.name {
                    out.insert(name.clone(), el.value.clone());
                }
            }
            if let Some(children) = step.children {
                self.collect_values(children, out);
            }
        }
    }

    /// Snapshot handed to `step`'s growth function.
    pub fn growth_input(&self, step: StepId) -> GrowthInput {
        GrowthInput {
            position: self.position(step),
            values: self.values(),
        }
    }
}

/// A flow's root branch contained no steps.
#[derive(Debug, thiserror::Error)]
#[error("flow root branch must contain at least one step")]
pub struct EmptyRoot;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::StepSpec;

    fn linear(labels: &[&str]) -> BranchSpec {
        labels
            .iter()
            .fold(BranchSpec::new(), |b, l| b.step(StepSpec::new(*l)))
    }

    #[test]
    fn cursor_starts_at_first_root_step() {
        let tree = Tree::new(linear(&["a", "b"])).unwrap();
        assert_eq!(tree.current().label, "a");
        assert_eq!(tree.position(tree.cursor()), "1");
    }

    #[test]
    fn attach_children_is_idempotent() {
        let mut tree = Tree::new(linear(&["a"])).unwrap();
        let origin = tree.cursor();
        let first = tree.attach_children(origin, linear(&["x", "y"]));
        let second = tree.attach_children(origin, linear(&["p", "q", "r"]));
        assert_eq!(first, second);
        assert_eq!(tree.branch(first).steps.len(), 2);
        assert_eq!(tree.step_count(), 3);
    }

    #[test]
    fn position_reflects_nesting() {
        let mut tree = Tree::new(linear(&["a", "b"])).unwrap();
        let b = tree.branch(tree.root()).steps[1];
        let nested = tree.attach_children(b, linear(&["x", "y"]));
        let y = tree.branch(nested).steps[1];
        assert_eq!(tree.position(y), "2.2");
    }

    #[test]
    fn empty_root_is_rejected() {
        assert!(Tree::new(BranchSpec::new()).is_err());
    }
}
