//! Trellis HTTP - Hyper 1.0 Ingress for Flow Trees
//!
//! One GET/POST pair per flow entry point, wired to the lifecycle
//! engine, plus a per-session `/data` export. This crate is transport
//! only; flow semantics live in trellis-core and trellis-runtime.

pub mod ingress;
mod service;

pub use ingress::{FlowDef, HttpIngress, Trellis};
