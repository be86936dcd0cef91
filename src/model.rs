//! In-memory definition document graph.
//!
//! The model is an already-parsed snapshot of an assessment document:
//! definitions with their criteria trees, tests, objects, states, and
//! variables, all cross-referenced by string id. Criteria nodes live in an
//! arena addressed by [`NodeId`] rather than owning pointers, so
//! extend-definition references may legally form cycles in a malformed
//! document without the type system getting in the way — the evaluator
//! detects and rejects them at query time.
//!
//! On-disk/wire parsing of documents is out of scope; tests and the demo
//! CLI build models through the `add_*` constructors.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Numeric identifier of an object subtype (e.g. file, process, rpminfo).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubtypeId(pub u32);

impl SubtypeId {
    /// Sentinel for names no probe is registered under.
    pub const UNKNOWN: SubtypeId = SubtypeId(0);
}

impl std::fmt::Display for SubtypeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Index of a criteria node in the model's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub usize);

// ---------------------------------------------------------------------------
// Criteria tree
// ---------------------------------------------------------------------------

/// One node of a definition's criteria tree.
#[derive(Debug, Clone)]
pub enum CriteriaNode {
    /// Leaf: references a test.
    Criterion { test_ref: String },
    /// Grouping node; children are evaluated in document order.
    Criteria { children: Vec<NodeId> },
    /// Cross-reference into another definition's criteria.
    ExtendDefinition { definition_ref: String },
    /// Parser produced something unrecognizable.
    Unknown,
}

/// A definition: the evaluation root.
#[derive(Debug, Clone)]
pub struct Definition {
    pub id: String,
    pub title: String,
    pub criteria: Option<NodeId>,
}

/// A test binds an object to zero or more states.
#[derive(Debug, Clone)]
pub struct Test {
    pub id: String,
    pub object_ref: Option<String>,
    pub state_refs: Vec<String>,
}

// ---------------------------------------------------------------------------
// Objects, states, entities
// ---------------------------------------------------------------------------

/// Where an entity's value comes from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EntityValue {
    Literal(String),
    /// The entity's value is supplied by a variable.
    VarRef(String),
}

/// A named entity inside an object or state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub name: String,
    pub value: EntityValue,
}

impl Entity {
    pub fn literal(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: EntityValue::Literal(value.into()),
        }
    }

    pub fn var_ref(name: impl Into<String>, var_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: EntityValue::VarRef(var_id.into()),
        }
    }
}

/// A set construct inside an object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SetObject {
    /// Set built from other sets.
    Aggregate { subsets: Vec<SetObject> },
    /// Set built from member objects, filtered by states.
    Collective {
        object_refs: Vec<String>,
        /// State ids acting as filters.
        filter_refs: Vec<String>,
    },
}

/// One content element of an object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ObjectContent {
    Entity(Entity),
    Set(SetObject),
}

/// A description of a data item to collect from the target host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Object {
    pub id: String,
    pub subtype: SubtypeId,
    pub contents: Vec<ObjectContent>,
}

/// A set of expected entity values used to filter collected items.
#[derive(Debug, Clone)]
pub struct State {
    pub id: String,
    pub contents: Vec<Entity>,
}

// ---------------------------------------------------------------------------
// Variables and components
// ---------------------------------------------------------------------------

/// Arithmetic operation for the arithmetic component function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithmeticOp {
    Add,
    Multiply,
}

/// A component expression producing a sequence of text values.
#[derive(Debug, Clone)]
pub enum Component {
    /// Constant value.
    Literal(String),
    /// Values of a named item field collected for the referenced object.
    ObjectRef { object_ref: String, item_field: String },
    /// Values of another variable.
    VarRef(String),
    /// Combine child values arithmetically.
    Arithmetic { op: ArithmeticOp, components: Vec<Component> },
    /// Prepend a prefix to each value unless already present.
    Begin { prefix: String, component: Box<Component> },
    /// Cartesian-product concatenation of child value sequences.
    Concat(Vec<Component>),
    /// Append a suffix to each value unless already present.
    End { suffix: String, component: Box<Component> },
    /// Escape regex metacharacters in each value.
    EscapeRegex(Box<Component>),
    /// First capture group of the pattern applied to each value.
    RegexCapture { pattern: String, component: Box<Component> },
    /// Split each value on a delimiter.
    Split { delimiter: String, component: Box<Component> },
    /// Substring of each value.
    Substring { start: usize, length: usize, component: Box<Component> },
    /// Pairwise difference in seconds between two epoch-second sequences.
    TimeDiff(Vec<Component>),
}

/// How a variable obtains its values.
#[derive(Debug, Clone)]
pub enum VariableKind {
    /// Externally supplied (or constant) value set.
    External { values: Vec<String> },
    /// Locally computed from a component expression tree.
    Local { component: Component },
}

/// A named value source.
#[derive(Debug, Clone)]
pub struct Variable {
    pub id: String,
    pub kind: VariableKind,
}

impl Variable {
    pub fn is_local(&self) -> bool {
        matches!(self.kind, VariableKind::Local { .. })
    }
}

// ---------------------------------------------------------------------------
// The model
// ---------------------------------------------------------------------------

/// The parsed document graph a session walks.
///
/// All lookups are by string id. The criteria arena is append-only; a
/// [`NodeId`] stays valid for the lifetime of the model.
#[derive(Debug, Default)]
pub struct DefinitionModel {
    definitions: HashMap<String, Definition>,
    tests: HashMap<String, Test>,
    objects: HashMap<String, Object>,
    states: HashMap<String, State>,
    variables: HashMap<String, Variable>,
    criteria: Vec<CriteriaNode>,
}

impl DefinitionModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a criteria node to the arena.
    pub fn add_node(&mut self, node: CriteriaNode) -> NodeId {
        self.criteria.push(node);
        NodeId(self.criteria.len() - 1)
    }

    pub fn add_definition(&mut self, def: Definition) {
        self.definitions.insert(def.id.clone(), def);
    }

    pub fn add_test(&mut self, test: Test) {
        self.tests.insert(test.id.clone(), test);
    }

    pub fn add_object(&mut self, object: Object) {
        self.objects.insert(object.id.clone(), object);
    }

    pub fn add_state(&mut self, state: State) {
        self.states.insert(state.id.clone(), state);
    }

    pub fn add_variable(&mut self, var: Variable) {
        self.variables.insert(var.id.clone(), var);
    }

    pub fn definition(&self, id: &str) -> Option<&Definition> {
        self.definitions.get(id)
    }

    pub fn test(&self, id: &str) -> Option<&Test> {
        self.tests.get(id)
    }

    pub fn object(&self, id: &str) -> Option<&Object> {
        self.objects.get(id)
    }

    pub fn state(&self, id: &str) -> Option<&State> {
        self.states.get(id)
    }

    pub fn variable(&self, id: &str) -> Option<&Variable> {
        self.variables.get(id)
    }

    pub fn node(&self, id: NodeId) -> Option<&CriteriaNode> {
        self.criteria.get(id.0)
    }

    pub fn definition_count(&self) -> usize {
        self.definitions.len()
    }
}
