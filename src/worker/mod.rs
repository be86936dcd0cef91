//! Probe worker: the process (or in-process harness) that actually
//! collects items.
//!
//! A worker is three threads around a shared cache set: the signal
//! thread, the dispatch thread, and the controlling [`run`] call. All
//! three meet at a startup barrier so no request is consumed before the
//! signal mask is installed. Teardown order is fixed: stop accepting
//! input, drain in-flight evaluations with a bound, close the signal
//! iterator, then join.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};

use crate::error::{ProbeError, WorkerError};
use crate::model::{Object, SubtypeId};
use crate::syschar::{Item, Sysinfo};

pub mod cache;
pub mod input;
pub mod ipc;
pub mod signal;

pub use cache::CacheSet;
pub use ipc::{IpcProbeHandler, Request, Response, SessionEndpoint, WorkerEndpoint, channel_pair};

/// The collection backend a worker hosts.
///
/// Implementations inspect the target host; the worker owns caching,
/// threading, and the wire protocol around them.
pub trait WorkerProbe: Send + Sync {
    /// Collect the items described by `object`.
    fn evaluate(&self, subtype: SubtypeId, object: &Object) -> Result<Vec<Item>, ProbeError>;

    /// Report host identification.
    fn sysinfo(&self) -> Result<Sysinfo, ProbeError>;

    /// Release backend resources at teardown; the return value becomes
    /// the worker's exit code.
    fn shutdown(&self) -> i32 {
        0
    }
}

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Accept objects that still carry variable references. When off,
    /// such objects are rejected with a failure response.
    pub varref_handling: bool,
    /// Memoize collected item sets per (object id, flags) pair.
    pub result_caching: bool,
    /// Entity names exempt from variable-reference handling; an object
    /// whose variable reference sits on one of these entities is rejected
    /// even when handling is otherwise on. Kept sorted for binary search.
    pub varref_exclusions: Vec<String>,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            varref_handling: true,
            result_caching: true,
            varref_exclusions: Vec::new(),
        }
    }
}

impl WorkerOptions {
    /// Build options with an entity-name exclusion list (sorted here,
    /// order of the input does not matter).
    pub fn with_exclusions(mut excluded: Vec<String>) -> Self {
        excluded.sort();
        Self {
            varref_exclusions: excluded,
            ..Self::default()
        }
    }
}

/// Run a worker over the given endpoint until the session hangs up or a
/// termination signal arrives. Returns the process exit code.
pub fn run(
    endpoint: WorkerEndpoint,
    probe: Arc<dyn WorkerProbe>,
    options: WorkerOptions,
) -> Result<i32, WorkerError> {
    let caches = Arc::new(CacheSet::new());
    let shutdown = Arc::new(AtomicBool::new(false));
    // Signal thread + dispatch thread + this call.
    let ready = Arc::new(Barrier::new(3));

    let (signal_thread, signal_handle) =
        signal::spawn(Arc::clone(&ready), Arc::clone(&shutdown))?;
    let dispatch_thread = input::spawn(
        Arc::clone(&ready),
        Arc::clone(&shutdown),
        endpoint,
        Arc::clone(&probe),
        caches,
        options,
    )?;

    ready.wait();
    tracing::info!("worker running");

    // The dispatch thread owns the lifetime: it exits when the request
    // channel closes or the shutdown flag is set, draining in-flight
    // evaluations itself.
    if dispatch_thread.join().is_err() {
        tracing::error!("dispatch thread panicked");
        signal_handle.close();
        let _ = signal_thread.join();
        return Ok(1);
    }

    signal_handle.close();
    if signal_thread.join().is_err() {
        tracing::error!("signal thread panicked");
        return Ok(1);
    }

    let code = probe.shutdown();
    tracing::info!(
        code,
        signaled = shutdown.load(Ordering::SeqCst),
        "worker stopped"
    );
    Ok(code)
}
