//! Trellis Runtime - The Lifecycle Engine
//!
//! Turns one HTTP interaction into a sequence of named phases over a
//! session's flow tree, suspending transparently across the job runner
//! when a phase function is heavy.

pub mod config;
pub mod lifecycle;
mod offload;
pub mod render;
pub mod store;

pub use config::EngineConfig;
pub use lifecycle::{Engine, EngineError, FormData, Interaction, View};
pub use render::{BasicRenderer, Renderer};
pub use store::{MemoryStore, SessionHandle, SessionStore, StoreError};
