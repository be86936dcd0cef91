//! System characteristics: the collected result for one object within one
//! evaluation session.
//!
//! A [`Syschar`] is created on first query of an object id with flag
//! `Unknown`; the flag transitions exactly once to a terminal value per
//! query cycle. The session-scoped [`SyscharModel`] owns every instance
//! and is the sole mutator — once a syschar is terminal, subsequent
//! queries return the cached record without re-invoking the probe.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Collection flags
// ---------------------------------------------------------------------------

/// Outcome of collecting an object (or resolving a variable).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CollectionFlag {
    /// Not yet collected; the only non-terminal value.
    Unknown,
    Complete,
    Incomplete,
    Error,
    NotCollected,
}

impl CollectionFlag {
    /// Whether this flag is a terminal value.
    pub fn is_terminal(self) -> bool {
        !matches!(self, CollectionFlag::Unknown)
    }

    /// Merge flags from multiple sources into the weakest one.
    ///
    /// `Error` dominates, then `NotCollected`, then `Incomplete`;
    /// `Unknown` combined with anything stays `Unknown` since some source
    /// has not been resolved yet.
    pub fn combine(self, other: CollectionFlag) -> CollectionFlag {
        use CollectionFlag::*;
        match (self, other) {
            (Unknown, _) | (_, Unknown) => Unknown,
            (Error, _) | (_, Error) => Error,
            (NotCollected, _) | (_, NotCollected) => NotCollected,
            (Incomplete, _) | (_, Incomplete) => Incomplete,
            (Complete, Complete) => Complete,
        }
    }
}

impl std::fmt::Display for CollectionFlag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            CollectionFlag::Unknown => "unknown",
            CollectionFlag::Complete => "complete",
            CollectionFlag::Incomplete => "incomplete",
            CollectionFlag::Error => "error",
            CollectionFlag::NotCollected => "not collected",
        };
        f.write_str(text)
    }
}

/// Severity of a message attached to a syschar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// Items and bindings
// ---------------------------------------------------------------------------

/// One collected item: an ordered list of (field name, value) pairs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Item {
    pub fields: Vec<(String, String)>,
}

impl Item {
    pub fn new(fields: Vec<(String, String)>) -> Self {
        Self { fields }
    }

    /// Value of the named field, if present.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Content hash used by the worker's item cache for deduplication.
    pub fn content_hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.hash(&mut hasher);
        hasher.finish()
    }
}

/// A variable associated with the ordered values it resolved to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableBinding {
    pub variable_id: String,
    pub values: Vec<String>,
}

// ---------------------------------------------------------------------------
// Syschar
// ---------------------------------------------------------------------------

/// Collected characteristics for one object id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Syschar {
    pub object_id: String,
    pub flag: CollectionFlag,
    pub items: Vec<Item>,
    pub messages: Vec<(String, Severity)>,
    pub variable_bindings: Vec<VariableBinding>,
}

impl Syschar {
    pub fn new(object_id: impl Into<String>) -> Self {
        Self {
            object_id: object_id.into(),
            flag: CollectionFlag::Unknown,
            items: Vec::new(),
            messages: Vec::new(),
            variable_bindings: Vec::new(),
        }
    }

    pub fn add_message(&mut self, text: impl Into<String>, severity: Severity) {
        self.messages.push((text.into(), severity));
    }

    pub fn add_binding(&mut self, binding: VariableBinding) {
        self.variable_bindings.push(binding);
    }
}

/// Host identification produced by the system-info probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sysinfo {
    pub os_name: String,
    pub os_version: String,
    pub architecture: String,
    pub primary_host_name: String,
}

// ---------------------------------------------------------------------------
// Session-scoped syschar table
// ---------------------------------------------------------------------------

/// Owns all [`Syschar`] instances of one session.
///
/// Readers receive clones; mutation goes through [`SyscharModel::update`]
/// so the at-most-one-probe-invocation invariant has a single enforcement
/// point.
#[derive(Debug, Default)]
pub struct SyscharModel {
    table: DashMap<String, Syschar>,
}

impl SyscharModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current snapshot for an object id, if one exists.
    pub fn get(&self, object_id: &str) -> Option<Syschar> {
        self.table.get(object_id).map(|r| r.value().clone())
    }

    /// Look up or create the syschar for an object id (flag `Unknown` on
    /// creation).
    pub fn get_or_create(&self, object_id: &str) -> Syschar {
        self.table
            .entry(object_id.to_string())
            .or_insert_with(|| Syschar::new(object_id))
            .value()
            .clone()
    }

    /// Mutate the owned record in place.
    pub fn update<F: FnOnce(&mut Syschar)>(&self, object_id: &str, f: F) {
        if let Some(mut entry) = self.table.get_mut(object_id) {
            f(entry.value_mut());
        }
    }

    /// Discard a record so the next query re-invokes the probe.
    pub fn reset(&self, object_id: &str) {
        self.table.remove(object_id);
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combine_lattice() {
        use CollectionFlag::*;
        assert_eq!(Complete.combine(Complete), Complete);
        assert_eq!(Complete.combine(Incomplete), Incomplete);
        assert_eq!(Incomplete.combine(Error), Error);
        assert_eq!(NotCollected.combine(Complete), NotCollected);
        assert_eq!(Error.combine(NotCollected), Error);
        assert_eq!(Unknown.combine(Complete), Unknown);
    }

    #[test]
    fn item_field_lookup_and_hash() {
        let a = Item::new(vec![
            ("path".into(), "/etc/passwd".into()),
            ("mode".into(), "0644".into()),
        ]);
        assert_eq!(a.field("mode"), Some("0644"));
        assert_eq!(a.field("owner"), None);

        let b = a.clone();
        assert_eq!(a.content_hash(), b.content_hash());

        let c = Item::new(vec![("path".into(), "/etc/shadow".into())]);
        assert_ne!(a.content_hash(), c.content_hash());
    }

    #[test]
    fn model_creates_once_and_updates_in_place() {
        let model = SyscharModel::new();
        let first = model.get_or_create("obj:1");
        assert_eq!(first.flag, CollectionFlag::Unknown);

        model.update("obj:1", |sc| sc.flag = CollectionFlag::Complete);
        let again = model.get_or_create("obj:1");
        assert_eq!(again.flag, CollectionFlag::Complete);
        assert_eq!(model.len(), 1);
    }

    #[test]
    fn reset_discards_record() {
        let model = SyscharModel::new();
        model.get_or_create("obj:1");
        model.update("obj:1", |sc| sc.flag = CollectionFlag::Error);
        model.reset("obj:1");
        assert_eq!(model.get_or_create("obj:1").flag, CollectionFlag::Unknown);
    }
}
