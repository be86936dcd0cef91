//! End-to-end integration tests for the defscan engine.
//!
//! These tests run a real worker behind the IPC channel and drive it
//! through a probe session, validating that dispatch, caching, variable
//! resolution, and criteria evaluation all work together.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use defscan::error::ProbeError;
use defscan::model::{
    Component, CriteriaNode, Definition, DefinitionModel, Entity, Object, ObjectContent, State,
    SubtypeId, Test, Variable, VariableKind,
};
use defscan::registry::SUBTYPE_SYSINFO;
use defscan::session::{ProbeHandler, ProbeSession, QueryFlags, QueryStatus};
use defscan::syschar::{CollectionFlag, Item, Sysinfo};
use defscan::worker::{self, IpcProbeHandler, WorkerOptions, WorkerProbe, channel_pair};

/// Worker backend producing one item per object and counting invocations.
struct RecordingProbe {
    collections: AtomicUsize,
}

impl RecordingProbe {
    fn new() -> Arc<Self> {
        Arc::new(Self { collections: AtomicUsize::new(0) })
    }
}

impl WorkerProbe for RecordingProbe {
    fn evaluate(&self, _: SubtypeId, object: &Object) -> Result<Vec<Item>, ProbeError> {
        self.collections.fetch_add(1, Ordering::SeqCst);
        Ok(vec![Item::new(vec![
            ("id".into(), object.id.clone()),
            ("value".into(), "collected".into()),
        ])])
    }

    fn sysinfo(&self) -> Result<Sysinfo, ProbeError> {
        Ok(Sysinfo {
            os_name: "Linux".into(),
            os_version: "6.1".into(),
            architecture: "x86_64".into(),
            primary_host_name: "integration-host".into(),
        })
    }
}

struct Harness {
    session: ProbeSession,
    probe: Arc<RecordingProbe>,
    worker: std::thread::JoinHandle<Result<i32, defscan::error::WorkerError>>,
}

impl Harness {
    fn new(model: DefinitionModel, subtypes: &[SubtypeId]) -> Self {
        let probe = RecordingProbe::new();
        let (session_end, worker_end) = channel_pair();
        let backend = Arc::clone(&probe);
        let worker = std::thread::spawn(move || {
            worker::run(worker_end, backend, WorkerOptions::default())
        });

        let mut session = ProbeSession::new(Arc::new(model));
        let handler: Arc<dyn ProbeHandler> = Arc::new(IpcProbeHandler::new(session_end));
        for subtype in subtypes {
            session.register_handler(*subtype, Arc::clone(&handler));
        }
        session.register_handler(SUBTYPE_SYSINFO, handler);

        Self { session, probe, worker }
    }

    fn finish(self) -> i32 {
        drop(self.session);
        self.worker.join().unwrap().unwrap()
    }
}

fn file_object(id: &str, path: &str) -> Object {
    Object {
        id: id.into(),
        subtype: SubtypeId(30),
        contents: vec![ObjectContent::Entity(Entity::literal("path", path))],
    }
}

fn single_criterion_model() -> DefinitionModel {
    let mut model = DefinitionModel::new();
    model.add_object(file_object("obj:1", "/etc/passwd"));
    model.add_test(Test {
        id: "tst:1".into(),
        object_ref: Some("obj:1".into()),
        state_refs: vec![],
    });
    let leaf = model.add_node(CriteriaNode::Criterion { test_ref: "tst:1".into() });
    let root = model.add_node(CriteriaNode::Criteria { children: vec![leaf] });
    model.add_definition(Definition {
        id: "def:1".into(),
        title: "file present".into(),
        criteria: Some(root),
    });
    model
}

#[test]
fn end_to_end_definition_through_worker() {
    let harness = Harness::new(single_criterion_model(), &[SubtypeId(30)]);

    let info = harness.session.query_sysinfo().unwrap();
    assert_eq!(info.primary_host_name, "integration-host");

    let status = harness.session.query_definition("def:1").unwrap();
    assert_eq!(status, QueryStatus::Success);

    let syschar = harness.session.syschars().get("obj:1").unwrap();
    assert_eq!(syschar.flag, CollectionFlag::Complete);
    assert_eq!(syschar.items[0].field("id"), Some("obj:1"));

    // A second evaluation reuses the session-side cache; the worker is
    // not asked again.
    harness.session.query_definition("def:1").unwrap();
    assert_eq!(harness.probe.collections.load(Ordering::SeqCst), 1);

    assert_eq!(harness.finish(), 0);
}

#[test]
fn worker_result_cache_answers_forced_requery() {
    let harness = Harness::new(single_criterion_model(), &[SubtypeId(30)]);

    harness
        .session
        .query_object("obj:1", QueryFlags::empty())
        .unwrap();
    // FORCE bypasses the session cache; the worker's result cache still
    // answers without re-collecting (same object id, same flags).
    harness
        .session
        .query_object("obj:1", QueryFlags::FORCE)
        .unwrap();
    assert_eq!(harness.probe.collections.load(Ordering::SeqCst), 1);

    harness.finish();
}

#[test]
fn unsupported_subtype_degrades_not_fails() {
    let mut model = single_criterion_model();
    model.add_object(Object {
        id: "obj:exotic".into(),
        subtype: SubtypeId(777),
        contents: vec![],
    });
    let harness = Harness::new(model, &[SubtypeId(30)]);

    let (status, syschar) = harness
        .session
        .query_object("obj:exotic", QueryFlags::empty())
        .unwrap();
    assert_eq!(status, QueryStatus::Warning);
    assert_eq!(syschar.flag, CollectionFlag::NotCollected);
    // The supported object still evaluates normally afterwards.
    assert_eq!(
        harness.session.query_definition("def:1").unwrap(),
        QueryStatus::Success
    );

    harness.finish();
}

#[test]
fn variable_chain_resolves_through_worker() {
    let mut model = single_criterion_model();
    model.add_variable(Variable {
        id: "var:collected".into(),
        kind: VariableKind::Local {
            component: Component::ObjectRef {
                object_ref: "obj:1".into(),
                item_field: "value".into(),
            },
        },
    });
    model.add_variable(Variable {
        id: "var:tagged".into(),
        kind: VariableKind::Local {
            component: Component::Concat(vec![
                Component::Literal("tag-".into()),
                Component::VarRef("var:collected".into()),
            ]),
        },
    });
    let harness = Harness::new(model, &[SubtypeId(30)]);

    let flag = harness.session.query_variable("var:tagged").unwrap();
    assert_eq!(flag, CollectionFlag::Complete);
    assert_eq!(
        harness.session.variable_values("var:tagged"),
        vec!["tag-collected".to_string()]
    );
    // The chained resolution collected obj:1 exactly once.
    assert_eq!(harness.probe.collections.load(Ordering::SeqCst), 1);

    harness.finish();
}

#[test]
fn criterion_tolerates_uncollectable_state_variable() {
    let mut model = single_criterion_model();
    model.add_variable(Variable {
        id: "var:broken".into(),
        kind: VariableKind::Local {
            component: Component::Split {
                delimiter: ":".into(),
                component: Box::new(Component::ObjectRef {
                    object_ref: "obj:unsupported".into(),
                    item_field: "value".into(),
                }),
            },
        },
    });
    model.add_object(Object {
        id: "obj:unsupported".into(),
        subtype: SubtypeId(888),
        contents: vec![],
    });
    model.add_state(State {
        id: "ste:1".into(),
        contents: vec![Entity::var_ref("value", "var:broken")],
    });
    model.add_test(Test {
        id: "tst:1".into(),
        object_ref: Some("obj:1".into()),
        state_refs: vec!["ste:1".into()],
    });
    let harness = Harness::new(model, &[SubtypeId(30)]);

    // The variable's backing object is unsupported, so the variable ends
    // NotCollected; the criterion reports success with what it has.
    let status = harness.session.query_definition("def:1").unwrap();
    assert_eq!(status, QueryStatus::Success);
    assert_eq!(
        harness.session.query_variable("var:broken").unwrap(),
        CollectionFlag::NotCollected
    );

    harness.finish();
}

#[test]
fn worker_reset_clears_result_cache() {
    let (session_end, worker_end) = channel_pair();
    let probe = RecordingProbe::new();
    let backend = Arc::clone(&probe);
    let worker =
        std::thread::spawn(move || worker::run(worker_end, backend, WorkerOptions::default()));

    let handler = Arc::new(IpcProbeHandler::new(session_end));
    let mut session = ProbeSession::new(Arc::new(single_criterion_model()));
    session.register_handler(SubtypeId(30), handler.clone());

    // Without a reset, a forced requery is answered from the worker's
    // result cache; after a reset it collects again.
    session.query_object("obj:1", QueryFlags::empty()).unwrap();
    session.query_object("obj:1", QueryFlags::FORCE).unwrap();
    assert_eq!(probe.collections.load(Ordering::SeqCst), 1);

    handler.endpoint().reset().unwrap();
    session.query_object("obj:1", QueryFlags::FORCE).unwrap();
    assert_eq!(probe.collections.load(Ordering::SeqCst), 2);

    drop(session);
    drop(handler);
    worker.join().unwrap().unwrap();
}

#[test]
fn extend_definition_cycle_aborts_evaluation() {
    let mut model = DefinitionModel::new();
    let a = model.add_node(CriteriaNode::ExtendDefinition { definition_ref: "def:b".into() });
    let b = model.add_node(CriteriaNode::ExtendDefinition { definition_ref: "def:a".into() });
    model.add_definition(Definition {
        id: "def:a".into(),
        title: "a".into(),
        criteria: Some(a),
    });
    model.add_definition(Definition {
        id: "def:b".into(),
        title: "b".into(),
        criteria: Some(b),
    });
    let harness = Harness::new(model, &[]);

    let err = harness.session.query_definition("def:a").unwrap_err();
    assert!(matches!(
        err,
        defscan::error::SessionError::ExtendCycle { .. }
    ));

    harness.finish();
}
