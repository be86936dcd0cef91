//! Transitive variable-reference collection.
//!
//! Pure traversal over the read-only document graph: given an object,
//! state, or component, accumulate the closure of variables it depends on
//! into a caller-supplied map. Insertion is idempotent — a variable
//! reached via two paths contributes one entry — and the `BTreeMap` keeps
//! the output order deterministic. Binding construction never triggers
//! evaluation; it reads whatever values the session has already resolved.

use std::collections::BTreeMap;

use crate::model::{
    Component, DefinitionModel, Entity, EntityValue, Object, ObjectContent, SetObject, State,
    Variable, VariableKind,
};
use crate::syschar::VariableBinding;

/// Accumulated closure: variable id → variable.
pub type VarRefMap<'a> = BTreeMap<String, &'a Variable>;

/// Collect every variable the object transitively depends on.
pub fn collect_object<'m>(model: &'m DefinitionModel, object: &Object, out: &mut VarRefMap<'m>) {
    for content in &object.contents {
        match content {
            ObjectContent::Entity(ent) => collect_entity(model, ent, out),
            ObjectContent::Set(set) => collect_set(model, set, out),
        }
    }
}

/// Collect the variable references of every entity a state defines.
pub fn collect_state<'m>(model: &'m DefinitionModel, state: &State, out: &mut VarRefMap<'m>) {
    for ent in &state.contents {
        collect_entity(model, ent, out);
    }
}

/// Collect a variable and, for a local variable, its component closure.
pub fn collect_variable<'m>(model: &'m DefinitionModel, var: &'m Variable, out: &mut VarRefMap<'m>) {
    if out.insert(var.id.clone(), var).is_some() {
        // Already visited via another path; its closure is in the map.
        return;
    }
    if let VariableKind::Local { component } = &var.kind {
        collect_component(model, component, out);
    }
}

fn collect_entity<'m>(model: &'m DefinitionModel, ent: &Entity, out: &mut VarRefMap<'m>) {
    if let EntityValue::VarRef(var_id) = &ent.value {
        if let Some(var) = model.variable(var_id) {
            collect_variable(model, var, out);
        }
    }
}

fn collect_set<'m>(model: &'m DefinitionModel, set: &SetObject, out: &mut VarRefMap<'m>) {
    match set {
        SetObject::Aggregate { subsets } => {
            for subset in subsets {
                collect_set(model, subset, out);
            }
        }
        SetObject::Collective {
            object_refs,
            filter_refs,
        } => {
            for obj_id in object_refs {
                if let Some(obj) = model.object(obj_id) {
                    collect_object(model, obj, out);
                }
            }
            for state_id in filter_refs {
                if let Some(state) = model.state(state_id) {
                    collect_state(model, state, out);
                }
            }
        }
    }
}

fn collect_component<'m>(model: &'m DefinitionModel, comp: &Component, out: &mut VarRefMap<'m>) {
    match comp {
        Component::Literal(_) => {}
        Component::ObjectRef { object_ref, .. } => {
            if let Some(obj) = model.object(object_ref) {
                collect_object(model, obj, out);
            }
        }
        Component::VarRef(var_id) => {
            if let Some(var) = model.variable(var_id) {
                collect_variable(model, var, out);
            }
        }
        Component::Arithmetic { components, .. }
        | Component::Concat(components)
        | Component::TimeDiff(components) => {
            for c in components {
                collect_component(model, c, out);
            }
        }
        Component::Begin { component, .. }
        | Component::End { component, .. }
        | Component::EscapeRegex(component)
        | Component::RegexCapture { component, .. }
        | Component::Split { component, .. }
        | Component::Substring { component, .. } => {
            collect_component(model, component, out);
        }
    }
}

/// Convert a collected map into bindings, taking each variable's values
/// from `resolved` (values must already be resolved by the session).
pub fn bindings_for(
    refs: &VarRefMap<'_>,
    resolved: &dyn Fn(&str) -> Vec<String>,
) -> Vec<VariableBinding> {
    refs.keys()
        .map(|id| VariableBinding {
            variable_id: id.clone(),
            values: resolved(id),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ArithmeticOp, SubtypeId, Test};

    fn model_with_chain() -> DefinitionModel {
        // obj:1 references v1 and v2; v1 is local, defined over obj:2;
        // obj:2 references v3.
        let mut model = DefinitionModel::new();
        model.add_object(Object {
            id: "obj:1".into(),
            subtype: SubtypeId(30),
            contents: vec![
                ObjectContent::Entity(Entity::var_ref("path", "var:1")),
                ObjectContent::Entity(Entity::var_ref("filename", "var:2")),
            ],
        });
        model.add_object(Object {
            id: "obj:2".into(),
            subtype: SubtypeId(12),
            contents: vec![ObjectContent::Entity(Entity::var_ref("name", "var:3"))],
        });
        model.add_variable(Variable {
            id: "var:1".into(),
            kind: VariableKind::Local {
                component: Component::ObjectRef {
                    object_ref: "obj:2".into(),
                    item_field: "value".into(),
                },
            },
        });
        model.add_variable(Variable {
            id: "var:2".into(),
            kind: VariableKind::External {
                values: vec!["passwd".into()],
            },
        });
        model.add_variable(Variable {
            id: "var:3".into(),
            kind: VariableKind::External {
                values: vec!["HOME".into()],
            },
        });
        model.add_test(Test {
            id: "tst:1".into(),
            object_ref: Some("obj:1".into()),
            state_refs: vec![],
        });
        model
    }

    #[test]
    fn transitive_closure_through_local_variable() {
        let model = model_with_chain();
        let mut out = VarRefMap::new();
        collect_object(&model, model.object("obj:1").unwrap(), &mut out);

        let ids: Vec<&str> = out.keys().map(String::as_str).collect();
        assert_eq!(ids, vec!["var:1", "var:2", "var:3"]);
    }

    #[test]
    fn revisits_contribute_once() {
        let mut model = model_with_chain();
        // A second entity on obj:1 referencing var:3 directly — var:3 is now
        // reachable both directly and through var:1's component chain.
        model.add_object(Object {
            id: "obj:1".into(),
            subtype: SubtypeId(30),
            contents: vec![
                ObjectContent::Entity(Entity::var_ref("path", "var:1")),
                ObjectContent::Entity(Entity::var_ref("filename", "var:3")),
            ],
        });

        let mut out = VarRefMap::new();
        collect_object(&model, model.object("obj:1").unwrap(), &mut out);
        // var:1 and var:3, with var:3 reached twice but present once.
        assert_eq!(out.len(), 2);
        assert!(out.contains_key("var:3"));
    }

    #[test]
    fn function_components_recurse_into_children() {
        let mut model = DefinitionModel::new();
        model.add_variable(Variable {
            id: "var:a".into(),
            kind: VariableKind::External { values: vec![] },
        });
        model.add_variable(Variable {
            id: "var:b".into(),
            kind: VariableKind::External { values: vec![] },
        });
        model.add_variable(Variable {
            id: "var:sum".into(),
            kind: VariableKind::Local {
                component: Component::Arithmetic {
                    op: ArithmeticOp::Add,
                    components: vec![
                        Component::VarRef("var:a".into()),
                        Component::Split {
                            delimiter: ":".into(),
                            component: Box::new(Component::VarRef("var:b".into())),
                        },
                    ],
                },
            },
        });

        let mut out = VarRefMap::new();
        let var = model.variable("var:sum").unwrap();
        collect_variable(&model, var, &mut out);
        let ids: Vec<&str> = out.keys().map(String::as_str).collect();
        assert_eq!(ids, vec!["var:a", "var:b", "var:sum"]);
    }

    #[test]
    fn set_contents_contribute_members_and_filters() {
        let mut model = model_with_chain();
        model.add_state(State {
            id: "ste:1".into(),
            contents: vec![Entity::var_ref("value", "var:2")],
        });
        model.add_object(Object {
            id: "obj:set".into(),
            subtype: SubtypeId(30),
            contents: vec![ObjectContent::Set(SetObject::Aggregate {
                subsets: vec![SetObject::Collective {
                    object_refs: vec!["obj:2".into()],
                    filter_refs: vec!["ste:1".into()],
                }],
            })],
        });

        let mut out = VarRefMap::new();
        collect_object(&model, model.object("obj:set").unwrap(), &mut out);
        let ids: Vec<&str> = out.keys().map(String::as_str).collect();
        assert_eq!(ids, vec!["var:2", "var:3"]);
    }

    #[test]
    fn literal_entities_contribute_nothing() {
        let mut model = DefinitionModel::new();
        model.add_object(Object {
            id: "obj:lit".into(),
            subtype: SubtypeId(30),
            contents: vec![ObjectContent::Entity(Entity::literal("path", "/etc"))],
        });
        let mut out = VarRefMap::new();
        collect_object(&model, model.object("obj:lit").unwrap(), &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn bindings_take_resolved_values_in_order() {
        let model = model_with_chain();
        let mut out = VarRefMap::new();
        collect_object(&model, model.object("obj:1").unwrap(), &mut out);

        let bindings = bindings_for(&out, &|id| {
            if id == "var:2" {
                vec!["passwd".into()]
            } else {
                vec![]
            }
        });
        assert_eq!(bindings.len(), 3);
        let v2 = bindings.iter().find(|b| b.variable_id == "var:2").unwrap();
        assert_eq!(v2.values, vec!["passwd".to_string()]);
    }
}
