//! Worker input dispatch.
//!
//! The dispatch loop pulls requests off the endpoint and answers them:
//! resets synchronously, evaluations on one thread per request. An
//! in-flight table keyed by request id guards against duplicate ids; a
//! completion channel lets the teardown path wait for stragglers with a
//! bound instead of joining blindly.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender, channel};
use std::sync::{Arc, Barrier};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use super::cache::{CacheSet, CacheSnapshot};
use super::ipc::{Request, Response, WorkerEndpoint};
use super::{WorkerOptions, WorkerProbe};
use crate::error::WorkerError;
use crate::model::{EntityValue, Object, ObjectContent, SubtypeId};
use crate::syschar::{CollectionFlag, Item, Syschar};

/// How long teardown waits for in-flight request threads.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(3);

/// How often the loop re-checks the shutdown flag while idle.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

struct DispatchState {
    probe: Arc<dyn WorkerProbe>,
    caches: Arc<CacheSet>,
    options: WorkerOptions,
    responses: Sender<Response>,
    in_flight: DashMap<u64, ()>,
    completions: Sender<u64>,
}

/// Spawn the dispatch thread.
pub fn spawn(
    ready: Arc<Barrier>,
    shutdown: Arc<AtomicBool>,
    endpoint: WorkerEndpoint,
    probe: Arc<dyn WorkerProbe>,
    caches: Arc<CacheSet>,
    options: WorkerOptions,
) -> Result<JoinHandle<()>, WorkerError> {
    std::thread::Builder::new()
        .name("dispatch".into())
        .spawn(move || {
            ready.wait();
            dispatch_loop(shutdown, endpoint, probe, caches, options);
        })
        .map_err(|source| WorkerError::Initialization {
            call: "thread spawn",
            source,
        })
}

fn dispatch_loop(
    shutdown: Arc<AtomicBool>,
    endpoint: WorkerEndpoint,
    probe: Arc<dyn WorkerProbe>,
    caches: Arc<CacheSet>,
    options: WorkerOptions,
) {
    let (completions, completed) = channel();
    let state = Arc::new(DispatchState {
        probe,
        caches,
        options,
        responses: endpoint.responses.clone(),
        in_flight: DashMap::new(),
        completions,
    });
    let mut handles: HashMap<u64, JoinHandle<()>> = HashMap::new();

    loop {
        if shutdown.load(Ordering::SeqCst) {
            tracing::info!("dispatch loop stopping on shutdown flag");
            break;
        }
        let request = match endpoint.requests.recv_timeout(POLL_INTERVAL) {
            Ok(request) => request,
            Err(RecvTimeoutError::Timeout) => {
                reap_completed(&completed, &mut handles);
                continue;
            }
            Err(RecvTimeoutError::Disconnected) => {
                tracing::debug!("request channel closed");
                break;
            }
        };
        reap_completed(&completed, &mut handles);

        match request {
            Request::Reset { id } => {
                // Reset waits for nothing: in-flight requests keep their
                // snapshots, later requests see fresh caches.
                state.caches.reset();
                let _ = state.responses.send(Response::ResetDone { id });
            }
            Request::EvalSysinfo { id } => {
                let response = match state.probe.sysinfo() {
                    Ok(sysinfo) => Response::Sysinfo { id, sysinfo },
                    Err(e) => Response::Failure { id, message: e.to_string() },
                };
                let _ = state.responses.send(response);
            }
            Request::EvalObject { id, subtype, flags, object } => {
                if state.in_flight.insert(id, ()).is_some() {
                    tracing::warn!(id, "duplicate request id, dropping");
                    continue;
                }
                let task_state = Arc::clone(&state);
                let spawned = std::thread::Builder::new()
                    .name(format!("eval-{id}"))
                    .spawn(move || {
                        let response = eval_object(&task_state, id, subtype, flags, &object);
                        let _ = task_state.responses.send(response);
                        task_state.in_flight.remove(&id);
                        let _ = task_state.completions.send(id);
                    });
                match spawned {
                    Ok(handle) => {
                        handles.insert(id, handle);
                    }
                    Err(e) => {
                        state.in_flight.remove(&id);
                        let _ = state.responses.send(Response::Failure {
                            id,
                            message: format!("cannot spawn evaluation thread: {e}"),
                        });
                    }
                }
            }
        }
    }

    drain(&state, &completed, handles);
}

fn reap_completed(completed: &Receiver<u64>, handles: &mut HashMap<u64, JoinHandle<()>>) {
    while let Ok(id) = completed.try_recv() {
        if let Some(handle) = handles.remove(&id) {
            if handle.join().is_err() {
                tracing::error!(id, "evaluation thread panicked");
            }
        }
    }
}

/// Wait for in-flight requests with a deadline; stragglers are abandoned
/// with a warning rather than blocking teardown.
fn drain(
    state: &DispatchState,
    completed: &Receiver<u64>,
    mut handles: HashMap<u64, JoinHandle<()>>,
) {
    let deadline = Instant::now() + DRAIN_TIMEOUT;
    while !handles.is_empty() {
        let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
            break;
        };
        match completed.recv_timeout(remaining) {
            Ok(id) => {
                if let Some(handle) = handles.remove(&id) {
                    if handle.join().is_err() {
                        tracing::error!(id, "evaluation thread panicked");
                    }
                }
            }
            Err(_) => break,
        }
    }
    if !handles.is_empty() {
        tracing::warn!(
            abandoned = handles.len(),
            in_flight = state.in_flight.len(),
            "teardown deadline passed with requests still running"
        );
    }
}

// ---------------------------------------------------------------------------
// Per-request evaluation
// ---------------------------------------------------------------------------

/// First entity whose variable reference the worker will not handle,
/// either because handling is off or because the entity name is excluded.
fn unhandled_var_ref<'o>(object: &'o Object, options: &WorkerOptions) -> Option<&'o str> {
    for content in &object.contents {
        let ObjectContent::Entity(entity) = content else {
            continue;
        };
        if !matches!(entity.value, EntityValue::VarRef(_)) {
            continue;
        }
        if !options.varref_handling
            || options.varref_exclusions.binary_search(&entity.name).is_ok()
        {
            return Some(&entity.name);
        }
    }
    None
}

fn eval_object(
    state: &DispatchState,
    id: u64,
    subtype: SubtypeId,
    flags: u32,
    object: &Object,
) -> Response {
    let snapshot: CacheSnapshot = state.caches.snapshot();

    if let Some(entity_name) = unhandled_var_ref(object, &state.options) {
        tracing::debug!(object = %object.id, entity = entity_name, "variable reference not handled");
        return Response::Failure {
            id,
            message: format!(
                "object {} carries an unhandled variable reference on entity {entity_name}",
                object.id
            ),
        };
    }

    if state.options.result_caching {
        if let Some(cached) = snapshot.results.get(&object.id, flags) {
            tracing::debug!(object = %object.id, flags, "result cache hit");
            let mut sc = Syschar::new(&object.id);
            sc.flag = CollectionFlag::Complete;
            sc.items = cached.iter().map(|i| (**i).clone()).collect();
            return Response::Object { id, syschar: sc };
        }
    }

    let items = match state.probe.evaluate(subtype, object) {
        Ok(items) => items,
        Err(e) => return Response::Failure { id, message: e.to_string() },
    };

    let mut shared: Vec<Arc<Item>> = Vec::with_capacity(items.len());
    for item in items {
        for (name, _) in &item.fields {
            snapshot.names.intern(name);
        }
        shared.push(snapshot.items.dedup(item));
    }
    if state.options.result_caching {
        snapshot.results.put(&object.id, flags, shared.clone());
    }

    let mut sc = Syschar::new(&object.id);
    sc.flag = CollectionFlag::Complete;
    sc.items = shared.iter().map(|i| (**i).clone()).collect();
    Response::Object { id, syschar: sc }
}
