//! Session - One End User's State Across All Flows
//!
//! Created on first contact, mutated on every interaction, never
//! deleted during a run. Completion and failure are flags, not
//! deletions, so aggregation over a finished or failed session keeps
//! working.

use crate::arena::Tree;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug)]
pub struct Session {
    pub id: Uuid,
    pub created: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    /// The user reached a terminal step and submitted it.
    pub finished: bool,
    /// Author code failed; the session serves a fixed error view until
    /// the flow is fixed and retried from the preserved cursor.
    pub failed: bool,
    pub client_addr: Option<String>,
    /// Arbitrary author-managed key/value pairs.
    pub metadata: HashMap<String, String>,
    /// One tree per flow entry point this session has visited.
    pub trees: HashMap<String, Tree>,
}

impl Session {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            created: now,
            last_active: now,
            finished: false,
            failed: false,
            client_addr: None,
            metadata: HashMap::new(),
            trees: HashMap::new(),
        }
    }

    pub fn touch(&mut self) {
        self.last_active = Utc::now();
    }

    pub fn tree(&self, entry: &str) -> Option<&Tree> {
        self.trees.get(entry)
    }

    pub fn tree_mut(&mut self, entry: &str) -> Option<&mut Tree> {
        self.trees.get_mut(entry)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.metadata.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}
