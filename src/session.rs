//! Probe session: object/sysinfo/variable querying and the recursive
//! criteria evaluator for one definition-evaluation run.
//!
//! The session owns the system-characteristics model, routes object
//! queries to registered probe handlers, resolves variables transitively
//! (re-entering object querying through local-variable component chains),
//! and attaches variable bindings to the syschars it produces.
//!
//! Outcome model: a query returns `Ok(QueryStatus::Success)`,
//! `Ok(QueryStatus::Warning)` (degraded, caller may continue), or
//! `Err(SessionError)` (hard error, aborts the whole evaluation — the
//! first hard error wins, nothing is aggregated).

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use bitflags::bitflags;

use crate::error::{ProbeError, SessionError};
use crate::model::{
    ArithmeticOp, Component, CriteriaNode, DefinitionModel, EntityValue, NodeId, Object,
    SubtypeId, Variable, VariableKind,
};
use crate::registry::SUBTYPE_SYSINFO;
use crate::syschar::{CollectionFlag, Severity, Syschar, SyscharModel, Sysinfo};
use crate::varref::{self, VarRefMap};

bitflags! {
    /// Flags modifying a single object query.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct QueryFlags: u32 {
        /// Caller does not need the collected reply; skip binding
        /// attachment and accept any cached syschar as-is.
        const NO_REPLY = 0x0001;
        /// Re-query even if a terminal syschar exists.
        const FORCE = 0x0002;
    }
}

/// Non-error outcome of a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
    Success,
    /// Something was skipped (e.g. unsupported object subtype); evaluation
    /// may continue at reduced fidelity.
    Warning,
}

/// A probe handler: in-process function or bridge to an external worker.
///
/// `evaluate` fills the syschar (items, messages, final flag) for an
/// object of a subtype the handler was registered under. `sysinfo` is only
/// meaningful for the system-info handler; the default rejects it.
pub trait ProbeHandler: Send + Sync {
    fn evaluate(
        &self,
        subtype: SubtypeId,
        object: &Object,
        syschar: &mut Syschar,
        flags: QueryFlags,
    ) -> Result<(), ProbeError>;

    fn sysinfo(&self) -> Result<Sysinfo, ProbeError> {
        Err(ProbeError::UnsupportedAction {
            name: "object probe".into(),
        })
    }
}

/// Per-session resolution state of one variable.
#[derive(Debug, Clone, Default)]
struct VariableState {
    flag: Option<CollectionFlag>,
    values: Vec<String>,
}

/// Orchestrates evaluation for one definition-evaluation run.
pub struct ProbeSession {
    model: Arc<DefinitionModel>,
    syschars: SyscharModel,
    handlers: HashMap<SubtypeId, Arc<dyn ProbeHandler>>,
    // Variable resolution is re-entrant through component chains, so the
    // state table sits behind its own lock rather than &mut self.
    variables: Mutex<HashMap<String, VariableState>>,
    // Variables currently being resolved on this call path; a repeat is a
    // reference cycle in the document.
    resolving: Mutex<HashSet<String>>,
}

impl ProbeSession {
    pub fn new(model: Arc<DefinitionModel>) -> Self {
        Self {
            model,
            syschars: SyscharModel::new(),
            handlers: HashMap::new(),
            variables: Mutex::new(HashMap::new()),
            resolving: Mutex::new(HashSet::new()),
        }
    }

    /// Register a handler for an object subtype.
    pub fn register_handler(&mut self, subtype: SubtypeId, handler: Arc<dyn ProbeHandler>) {
        self.handlers.insert(subtype, handler);
    }

    pub fn model(&self) -> &DefinitionModel {
        &self.model
    }

    pub fn syschars(&self) -> &SyscharModel {
        &self.syschars
    }

    /// Resolved values of a variable, empty if unresolved.
    pub fn variable_values(&self, var_id: &str) -> Vec<String> {
        let vars = self.variables.lock().unwrap_or_else(|e| e.into_inner());
        vars.get(var_id).map(|s| s.values.clone()).unwrap_or_default()
    }

    fn variable_flag(&self, var_id: &str) -> Option<CollectionFlag> {
        let vars = self.variables.lock().unwrap_or_else(|e| e.into_inner());
        vars.get(var_id).and_then(|s| s.flag)
    }

    fn set_variable_state(&self, var_id: &str, flag: CollectionFlag, values: Vec<String>) {
        let mut vars = self.variables.lock().unwrap_or_else(|e| e.into_inner());
        vars.insert(var_id.to_string(), VariableState { flag: Some(flag), values });
    }

    // -----------------------------------------------------------------------
    // Object / sysinfo queries
    // -----------------------------------------------------------------------

    /// Query one object, consulting and updating the syschar table.
    ///
    /// At most one real probe invocation happens per object id per session
    /// unless `FORCE` is passed. A missing probe registration is a
    /// warning, not an error: the syschar gets a message and the
    /// `NotCollected` flag, and evaluation continues degraded.
    pub fn query_object(
        &self,
        object_id: &str,
        flags: QueryFlags,
    ) -> Result<(QueryStatus, Syschar), SessionError> {
        let object = self
            .model
            .object(object_id)
            .ok_or_else(|| SessionError::DanglingRef {
                kind: "object",
                id: object_id.to_string(),
            })?;

        tracing::debug!(object = object_id, ?flags, "querying object");

        if let Some(existing) = self.syschars.get(object_id) {
            tracing::debug!(object = object_id, flag = %existing.flag, "syschar already exists");
            let reusable = existing.flag.is_terminal() || flags.contains(QueryFlags::NO_REPLY);
            if reusable && !flags.contains(QueryFlags::FORCE) {
                return Ok((QueryStatus::Success, existing));
            }
            if flags.contains(QueryFlags::FORCE) {
                self.syschars.reset(object_id);
            }
        }
        let _ = self.syschars.get_or_create(object_id);

        let Some(handler) = self.handlers.get(&object.subtype) else {
            tracing::warn!(object = object_id, subtype = %object.subtype, "object not supported");
            self.syschars.update(object_id, |sc| {
                sc.add_message("object not supported", Severity::Warning);
                sc.flag = CollectionFlag::NotCollected;
            });
            return Ok((
                QueryStatus::Warning,
                self.syschars.get_or_create(object_id),
            ));
        };

        let mut working = self.syschars.get_or_create(object_id);
        handler
            .evaluate(object.subtype, object, &mut working, flags)
            .map_err(|e| SessionError::ProbeFailure {
                subtype: object.subtype.0,
                message: e.to_string(),
            })?;

        if !flags.contains(QueryFlags::NO_REPLY) {
            let mut refs = VarRefMap::new();
            varref::collect_object(&self.model, object, &mut refs);
            for binding in varref::bindings_for(&refs, &|id| self.variable_values(id)) {
                working.add_binding(binding);
            }
        }

        self.syschars.update(object_id, |sc| *sc = working.clone());
        Ok((QueryStatus::Success, working))
    }

    /// Query the singleton system-info probe.
    ///
    /// Unlike object queries, a missing or malformed sysinfo registration
    /// is a hard error: no evaluation can proceed without host identity.
    pub fn query_sysinfo(&self) -> Result<Sysinfo, SessionError> {
        let handler = self
            .handlers
            .get(&SUBTYPE_SYSINFO)
            .ok_or(SessionError::MissingSysinfo)?;
        handler.sysinfo().map_err(|_| SessionError::MissingSysinfo)
    }

    // -----------------------------------------------------------------------
    // Variable resolution
    // -----------------------------------------------------------------------

    /// Resolve a variable if its collection flag is not yet terminal, then
    /// return the flag.
    ///
    /// Local variables are resolved by evaluating their component tree;
    /// object-ref components re-enter [`Self::query_object`]. Hard errors
    /// from nested object queries propagate; evaluation-level failures
    /// (bad arithmetic, unresolvable field, a variable-reference cycle)
    /// terminate the variable with the `Error` flag instead.
    pub fn query_variable(&self, var_id: &str) -> Result<CollectionFlag, SessionError> {
        if let Some(flag) = self.variable_flag(var_id) {
            return Ok(flag);
        }

        let var = self
            .model
            .variable(var_id)
            .ok_or_else(|| SessionError::DanglingRef {
                kind: "variable",
                id: var_id.to_string(),
            })?;

        {
            let mut resolving = self.resolving.lock().unwrap_or_else(|e| e.into_inner());
            if !resolving.insert(var_id.to_string()) {
                // Already on the resolution path: the document's variable
                // references form a cycle through this id.
                tracing::warn!(variable = var_id, "variable reference cycle");
                return Ok(CollectionFlag::Error);
            }
        }
        let resolved = self.resolve_variable(var);
        self.resolving
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(var_id);

        let (flag, values) = resolved?;
        tracing::debug!(variable = var_id, %flag, count = values.len(), "variable resolved");
        self.set_variable_state(var_id, flag, values.clone());
        Ok(flag)
    }

    fn resolve_variable(
        &self,
        var: &Variable,
    ) -> Result<(CollectionFlag, Vec<String>), SessionError> {
        match &var.kind {
            VariableKind::External { values } => Ok((CollectionFlag::Complete, values.clone())),
            VariableKind::Local { component } => self.eval_component(component),
        }
    }

    /// Evaluate a component tree to (flag, values).
    fn eval_component(
        &self,
        comp: &Component,
    ) -> Result<(CollectionFlag, Vec<String>), SessionError> {
        match comp {
            Component::Literal(text) => Ok((CollectionFlag::Complete, vec![text.clone()])),

            Component::ObjectRef { object_ref, item_field } => {
                let (_, syschar) = self.query_object(object_ref, QueryFlags::empty())?;
                let values: Vec<String> = syschar
                    .items
                    .iter()
                    .filter_map(|item| item.field(item_field).map(str::to_string))
                    .collect();
                let flag = match syschar.flag {
                    CollectionFlag::Unknown => CollectionFlag::Error,
                    other => other,
                };
                Ok((flag, values))
            }

            Component::VarRef(var_id) => {
                let flag = self.query_variable(var_id)?;
                Ok((flag, self.variable_values(var_id)))
            }

            Component::Arithmetic { op, components } => {
                let mut flag = CollectionFlag::Complete;
                let mut acc: i64 = match op {
                    ArithmeticOp::Add => 0,
                    ArithmeticOp::Multiply => 1,
                };
                for c in components {
                    let (f, values) = self.eval_component(c)?;
                    flag = flag.combine(f);
                    for v in &values {
                        let Ok(n) = v.trim().parse::<i64>() else {
                            return Ok((CollectionFlag::Error, Vec::new()));
                        };
                        match op {
                            ArithmeticOp::Add => acc += n,
                            ArithmeticOp::Multiply => acc *= n,
                        }
                    }
                }
                Ok((flag, vec![acc.to_string()]))
            }

            Component::Concat(components) => {
                // Cartesian product across child value sequences.
                let mut flag = CollectionFlag::Complete;
                let mut acc: Vec<String> = vec![String::new()];
                for c in components {
                    let (f, values) = self.eval_component(c)?;
                    flag = flag.combine(f);
                    if values.is_empty() {
                        return Ok((flag, Vec::new()));
                    }
                    let mut next = Vec::with_capacity(acc.len() * values.len());
                    for prefix in &acc {
                        for v in &values {
                            next.push(format!("{prefix}{v}"));
                        }
                    }
                    acc = next;
                }
                Ok((flag, acc))
            }

            Component::Begin { prefix, component } => {
                let (flag, values) = self.eval_component(component)?;
                let values = values
                    .into_iter()
                    .map(|v| {
                        if v.starts_with(prefix.as_str()) {
                            v
                        } else {
                            format!("{prefix}{v}")
                        }
                    })
                    .collect();
                Ok((flag, values))
            }

            Component::End { suffix, component } => {
                let (flag, values) = self.eval_component(component)?;
                let values = values
                    .into_iter()
                    .map(|v| {
                        if v.ends_with(suffix.as_str()) {
                            v
                        } else {
                            format!("{v}{suffix}")
                        }
                    })
                    .collect();
                Ok((flag, values))
            }

            Component::EscapeRegex(component) => {
                let (flag, values) = self.eval_component(component)?;
                Ok((flag, values.iter().map(|v| regex::escape(v)).collect()))
            }

            Component::RegexCapture { pattern, component } => {
                let (flag, values) = self.eval_component(component)?;
                let Ok(re) = regex::Regex::new(pattern) else {
                    return Ok((CollectionFlag::Error, Vec::new()));
                };
                let captured = values
                    .iter()
                    .map(|v| {
                        re.captures(v)
                            .and_then(|c| c.get(1))
                            .map(|m| m.as_str().to_string())
                            .unwrap_or_default()
                    })
                    .collect();
                Ok((flag, captured))
            }

            Component::Split { delimiter, component } => {
                let (flag, values) = self.eval_component(component)?;
                let split = values
                    .iter()
                    .flat_map(|v| v.split(delimiter.as_str()).map(str::to_string))
                    .collect();
                Ok((flag, split))
            }

            Component::Substring { start, length, component } => {
                let (flag, values) = self.eval_component(component)?;
                let cut = values
                    .iter()
                    .map(|v| v.chars().skip(*start).take(*length).collect::<String>())
                    .collect();
                Ok((flag, cut))
            }

            Component::TimeDiff(components) => {
                let mut flag = CollectionFlag::Complete;
                let mut seqs: Vec<Vec<i64>> = Vec::new();
                for c in components {
                    let (f, values) = self.eval_component(c)?;
                    flag = flag.combine(f);
                    let mut parsed = Vec::with_capacity(values.len());
                    for v in &values {
                        let Ok(n) = v.trim().parse::<i64>() else {
                            return Ok((CollectionFlag::Error, Vec::new()));
                        };
                        parsed.push(n);
                    }
                    seqs.push(parsed);
                }
                if seqs.len() != 2 || seqs[0].len() != seqs[1].len() {
                    return Ok((CollectionFlag::Error, Vec::new()));
                }
                let diffs = seqs[0]
                    .iter()
                    .zip(&seqs[1])
                    .map(|(a, b)| (a - b).to_string())
                    .collect();
                Ok((flag, diffs))
            }
        }
    }

    // -----------------------------------------------------------------------
    // Criteria evaluation
    // -----------------------------------------------------------------------

    /// Evaluate the definition with the given id.
    pub fn query_definition(&self, id: &str) -> Result<QueryStatus, SessionError> {
        let definition = self
            .model
            .definition(id)
            .ok_or_else(|| SessionError::DefinitionNotFound { id: id.to_string() })?;

        let root = definition
            .criteria
            .ok_or_else(|| SessionError::NoCriteria { id: id.to_string() })?;

        let mut on_path = HashSet::new();
        on_path.insert(id.to_string());
        self.query_criteria(root, &mut on_path)
    }

    fn query_criteria(
        &self,
        node_id: NodeId,
        on_path: &mut HashSet<String>,
    ) -> Result<QueryStatus, SessionError> {
        let node = self.model.node(node_id).ok_or(SessionError::UnknownNode)?;

        match node {
            CriteriaNode::Criterion { test_ref } => self.query_criterion(test_ref),

            CriteriaNode::Criteria { children } => {
                for child in children {
                    let status = self.query_criteria(*child, on_path)?;
                    if status != QueryStatus::Success {
                        // First non-success wins; remaining children are
                        // not evaluated.
                        return Ok(status);
                    }
                }
                Ok(QueryStatus::Success)
            }

            CriteriaNode::ExtendDefinition { definition_ref } => {
                if !on_path.insert(definition_ref.clone()) {
                    return Err(SessionError::ExtendCycle {
                        id: definition_ref.clone(),
                    });
                }
                let definition = self.model.definition(definition_ref).ok_or_else(|| {
                    SessionError::DefinitionNotFound {
                        id: definition_ref.clone(),
                    }
                })?;
                let root = definition.criteria.ok_or_else(|| SessionError::NoCriteria {
                    id: definition_ref.clone(),
                })?;
                let status = self.query_criteria(root, on_path);
                on_path.remove(definition_ref);
                status
            }

            CriteriaNode::Unknown => Err(SessionError::UnknownNode),
        }
    }

    fn query_criterion(&self, test_ref: &str) -> Result<QueryStatus, SessionError> {
        let Some(test) = self.model.test(test_ref) else {
            return Ok(QueryStatus::Success);
        };
        let Some(object_ref) = &test.object_ref else {
            // A test without an object has nothing to query.
            return Ok(QueryStatus::Success);
        };

        // An unsupported object is already downgraded to a warning inside
        // query_object; the criterion itself still succeeds.
        let _ = self.query_object(object_ref, QueryFlags::empty())?;

        // Objects referenced as test -> state -> variable -> object.
        for state_ref in &test.state_refs {
            let Some(state) = self.model.state(state_ref) else {
                continue;
            };
            for entity in &state.contents {
                let EntityValue::VarRef(var_id) = &entity.value else {
                    continue;
                };
                let flag = self.query_variable(var_id)?;
                match flag {
                    CollectionFlag::Complete | CollectionFlag::Incomplete => {}
                    _ => {
                        // Fail open: the variable could not be collected,
                        // so report what was gathered and stop inspecting
                        // the remaining states of this criterion.
                        return Ok(QueryStatus::Success);
                    }
                }
            }
        }

        Ok(QueryStatus::Success)
    }
}

impl std::fmt::Debug for ProbeSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProbeSession")
            .field("handlers", &self.handlers.len())
            .field("syschars", &self.syschars.len())
            .finish()
    }
}
