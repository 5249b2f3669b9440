//! Registry configuration.

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Settings shared by a registry and every cell it creates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Label attached to every log event from this registry.
    pub name: String,

    /// Maximum nesting of synchronous broadcasts on one thread, if any. A
    /// notification beyond it is dropped and logged. Unbounded by default,
    /// so acyclic chains of any length propagate fully.
    pub max_dispatch_depth: Option<usize>,

    /// How many times one cell may appear on the dispatch stack of one
    /// thread, and how many deferred values one listener may be handed after
    /// a single call. Only a cycle in the graph reaches either bound.
    pub max_reentries: usize,
}

impl RegistryConfig {
    /// Parse a configuration from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_max_dispatch_depth(mut self, depth: usize) -> Self {
        self.max_dispatch_depth = Some(depth);
        self
    }

    pub fn with_max_reentries(mut self, reentries: usize) -> Self {
        self.max_reentries = reentries;
        self
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            name: "tether".to_owned(),
            max_dispatch_depth: None,
            max_reentries: 16,
        }
    }
}
