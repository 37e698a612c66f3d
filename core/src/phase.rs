//! Phase Functions and Growth Functions
//!
//! Each step carries ordered lists of tagged closures with a uniform
//! `(&mut Step) -> Result` signature, one list per lifecycle phase.
//! A growth function is the lazy producer of a step's nested branch:
//! it sees a pure snapshot of the answers collected so far and returns
//! the specification of the branch to attach.

use crate::arena::Step;
use crate::element::Element;
use crate::error::{PhaseError, ValidationFailure};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

pub type PhaseResult = Result<(), PhaseError>;

/// Lifecycle phase a function list belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseKind {
    Compile,
    Validate,
    Submit,
    Navigate,
}

impl fmt::Display for PhaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PhaseKind::Compile => "compile",
            PhaseKind::Validate => "validate",
            PhaseKind::Submit => "submit",
            PhaseKind::Navigate => "navigate",
        };
        f.write_str(s)
    }
}

/// A tagged phase closure. `heavy` functions are offloaded to the job
/// runner instead of running on the request path; they may only mutate
/// their own step's elements and feedback.
#[derive(Clone)]
pub struct PhaseFn {
    pub name: String,
    pub heavy: bool,
    run: Arc<dyn Fn(&mut Step) -> PhaseResult + Send + Sync>,
}

impl PhaseFn {
    pub fn new<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&mut Step) -> PhaseResult + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            heavy: false,
            run: Arc::new(f),
        }
    }

    pub fn heavy<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&mut Step) -> PhaseResult + Send + Sync + 'static,
    {
        Self {
            heavy: true,
            ..Self::new(name, f)
        }
    }

    pub fn call(&self, step: &mut Step) -> PhaseResult {
        (self.run)(step)
    }
}

impl fmt::Debug for PhaseFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhaseFn")
            .field("name", &self.name)
            .field("heavy", &self.heavy)
            .finish()
    }
}

/// A validation closure. Failures are recoverable and re-rendered as
/// feedback; they never escalate past the step.
#[derive(Clone)]
pub struct ValidateFn {
    pub name: String,
    run: Arc<dyn Fn(&Step) -> Result<(), ValidationFailure> + Send + Sync>,
}

impl ValidateFn {
    pub fn new<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Step) -> Result<(), ValidationFailure> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            run: Arc::new(f),
        }
    }

    pub fn call(&self, step: &Step) -> Result<(), ValidationFailure> {
        (self.run)(step)
    }
}

impl fmt::Debug for ValidateFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValidateFn").field("name", &self.name).finish()
    }
}

/// The per-step phase lists, executed in declared order.
#[derive(Debug, Clone, Default)]
pub struct PhaseTable {
    pub compile: Vec<PhaseFn>,
    pub validate: Vec<ValidateFn>,
    pub submit: Vec<PhaseFn>,
    pub navigate: Vec<PhaseFn>,
}

/// Pure snapshot handed to a growth function.
///
/// Growth functions never see the tree itself; this keeps them
/// re-runnable (at-least-once job delivery) and lock-free when heavy.
#[derive(Debug, Clone)]
pub struct GrowthInput {
    /// Dot-path of the origin step.
    pub position: String,
    /// Latest value per variable name, pre-order across the tree.
    pub values: HashMap<String, Value>,
}

impl GrowthInput {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }
}

/// Lazily produces the nested branch of a step the first time the
/// cursor moves forward through it. Attachment is idempotent, so a
/// growth function observed twice (retry, replay) grows exactly one
/// branch.
#[derive(Clone)]
pub struct GrowthFn {
    pub heavy: bool,
    run: Arc<dyn Fn(&GrowthInput) -> Result<BranchSpec, PhaseError> + Send + Sync>,
}

impl GrowthFn {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&GrowthInput) -> Result<BranchSpec, PhaseError> + Send + Sync + 'static,
    {
        Self {
            heavy: false,
            run: Arc::new(f),
        }
    }

    pub fn heavy<F>(f: F) -> Self
    where
        F: Fn(&GrowthInput) -> Result<BranchSpec, PhaseError> + Send + Sync + 'static,
    {
        Self {
            heavy: true,
            ..Self::new(f)
        }
    }

    pub fn call(&self, input: &GrowthInput) -> Result<BranchSpec, PhaseError> {
        (self.run)(input)
    }
}

impl fmt::Debug for GrowthFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GrowthFn").field("heavy", &self.heavy).finish()
    }
}

/// Author-facing builder for one step.
#[derive(Debug, Clone, Default)]
pub struct StepSpec {
    pub label: String,
    pub terminal: bool,
    pub elements: Vec<Element>,
    pub phases: PhaseTable,
    pub growth: Option<GrowthFn>,
}

impl StepSpec {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ..Self::default()
        }
    }

    pub fn terminal(mut self) -> Self {
        self.terminal = true;
        self
    }

    pub fn element(mut self, element: Element) -> Self {
        self.elements.push(element);
        self
    }

    pub fn compile(mut self, f: PhaseFn) -> Self {
        self.phases.compile.push(f);
        self
    }

    pub fn validate(mut self, f: ValidateFn) -> Self {
        self.phases.validate.push(f);
        self
    }

    pub fn submit(mut self, f: PhaseFn) -> Self {
        self.phases.submit.push(f);
        self
    }

    pub fn navigate(mut self, f: PhaseFn) -> Self {
        self.phases.navigate.push(f);
        self
    }

    pub fn grow(mut self, growth: GrowthFn) -> Self {
        self.growth = Some(growth);
        self
    }
}

/// An ordered run of step specs; what a growth function returns and
/// what a flow's root is authored as.
#[derive(Debug, Clone, Default)]
pub struct BranchSpec {
    pub steps: Vec<StepSpec>,
}

impl BranchSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn step(mut self, spec: StepSpec) -> Self {
        self.steps.push(spec);
        self
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}
