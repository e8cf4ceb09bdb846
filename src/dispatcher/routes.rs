//! Method-to-worker routing, fixed once at startup.

use std::collections::HashSet;

use crate::worker::protocol::WorkerTag;

/// Methods the accelerator declared at startup. Anything else goes to
/// the main worker. Immutable once built.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    accelerator: HashSet<String>,
}

impl RouteTable {
    pub fn new(accelerator_methods: impl IntoIterator<Item = String>) -> Self {
        Self {
            accelerator: accelerator_methods.into_iter().collect(),
        }
    }

    pub fn resolve(&self, method: &str) -> WorkerTag {
        if self.accelerator.contains(method) {
            WorkerTag::Accelerator
        } else {
            WorkerTag::Main
        }
    }

    /// Accelerator-routed names, sorted.
    pub fn accelerator_methods(&self) -> Vec<&str> {
        let mut methods: Vec<&str> = self.accelerator.iter().map(String::as_str).collect();
        methods.sort_unstable();
        methods
    }

    pub fn len(&self) -> usize {
        self.accelerator.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accelerator.is_empty()
    }
}
