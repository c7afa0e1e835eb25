//! Explicit registries for workflows, tools, and flows.
//!
//! These replace process-wide mutable maps: each registry is a plain object
//! owned by the process entry point and injected into the coordinator.
//! `register` is strict (duplicate names fail), `upsert` replaces, and
//! `reset` exists for tests only.

use miette::Diagnostic;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum RegistryError {
    #[error("{registry} {name:?} already registered")]
    #[diagnostic(
        code(runloom::registry::duplicate),
        help("Use upsert to replace an existing entry.")
    )]
    Duplicate { registry: &'static str, name: String },

    #[error("{registry} name is required")]
    #[diagnostic(code(runloom::registry::empty_name))]
    EmptyName { registry: &'static str },
}

/// Name-keyed registry with strict and replacing insertion.
pub struct Registry<T> {
    kind: &'static str,
    entries: RwLock<FxHashMap<String, T>>,
}

impl<T: Clone> Registry<T> {
    /// `kind` names the registry in error messages ("workflow", "tool", …).
    #[must_use]
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            entries: RwLock::new(FxHashMap::default()),
        }
    }

    /// Strict insertion: a duplicate name fails.
    pub fn register(&self, name: impl Into<String>, value: T) -> Result<(), RegistryError> {
        let name = name.into();
        if name.is_empty() {
            return Err(RegistryError::EmptyName {
                registry: self.kind,
            });
        }
        let mut entries = self.entries.write();
        if entries.contains_key(&name) {
            return Err(RegistryError::Duplicate {
                registry: self.kind,
                name,
            });
        }
        entries.insert(name, value);
        Ok(())
    }

    /// Insert or replace. Idempotent by construction.
    pub fn upsert(&self, name: impl Into<String>, value: T) -> Result<(), RegistryError> {
        let name = name.into();
        if name.is_empty() {
            return Err(RegistryError::EmptyName {
                registry: self.kind,
            });
        }
        self.entries.write().insert(name, value);
        Ok(())
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<T> {
        self.entries.read().get(name).cloned()
    }

    /// All registered names, sorted alphabetically.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// All entries, sorted by name.
    #[must_use]
    pub fn list(&self) -> Vec<T> {
        let entries = self.entries.read();
        let mut keys: Vec<&String> = entries.keys().collect();
        keys.sort();
        keys.iter().filter_map(|k| entries.get(*k).cloned()).collect()
    }

    /// Remove an entry, reporting whether it existed.
    pub fn remove(&self, name: &str) -> bool {
        self.entries.write().remove(name).is_some()
    }

    /// Clear the registry. Intended for tests only.
    pub fn reset(&self) {
        self.entries.write().clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

/// A named, reusable agent configuration that can be discovered and
/// submitted by name.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_example: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_is_strict_and_upsert_replaces() {
        let registry: Registry<u32> = Registry::new("number");
        registry.register("one", 1).unwrap();
        let err = registry.register("one", 11).unwrap_err();
        assert!(matches!(err, RegistryError::Duplicate { .. }));
        assert_eq!(registry.get("one"), Some(1));

        registry.upsert("one", 11).unwrap();
        assert_eq!(registry.get("one"), Some(11));
    }

    #[test]
    fn names_are_sorted() {
        let registry: Registry<u32> = Registry::new("number");
        registry.register("zeta", 1).unwrap();
        registry.register("alpha", 2).unwrap();
        assert_eq!(registry.names(), vec!["alpha", "zeta"]);
    }

    #[test]
    fn reset_clears_everything() {
        let registry: Registry<u32> = Registry::new("number");
        registry.register("one", 1).unwrap();
        registry.reset();
        assert!(registry.is_empty());
        assert!(!registry.remove("one"));
    }
}
