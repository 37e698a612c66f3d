//! Trellis Core - Lazily Grown Flow Trees
//!
//! Protocol-agnostic data model and navigation for session-scoped
//! flows: the step/branch arena, phase and growth functions, cursor
//! movement, and tabular aggregation. Everything transport-shaped
//! lives in trellis-runtime and trellis-http.

pub mod arena;
pub mod element;
pub mod error;
pub mod nav;
pub mod phase;
pub mod session;
pub mod table;
pub mod telemetry;

pub use arena::{Branch, BranchId, CachedView, Direction, Step, StepId, Tree, Verb};
pub use element::{Element, ElementKind};
pub use error::{NavigationError, PhaseError, ValidationFailure};
pub use nav::{advance, retreat};
pub use phase::{BranchSpec, GrowthFn, GrowthInput, PhaseFn, PhaseKind, StepSpec, ValidateFn};
pub use session::Session;
pub use table::Table;

pub mod prelude {
    pub use crate::arena::{Direction, StepId, Tree, Verb};
    pub use crate::element::{Element, ElementKind};
    pub use crate::error::{NavigationError, PhaseError, ValidationFailure};
    pub use crate::nav::{advance, retreat};
    pub use crate::phase::{
        BranchSpec, GrowthFn, GrowthInput, PhaseFn, PhaseKind, StepSpec, ValidateFn,
    };
    pub use crate::session::Session;
    pub use crate::table::Table;
}
