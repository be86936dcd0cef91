//! Session/worker IPC: the request/response wire protocol, in-process
//! channel transport, and the stdio line-delimited JSON bridge used when
//! the worker runs as a separate process.
//!
//! Every request carries a correlation id assigned by the session side;
//! responses echo it back so the worker can answer out of order.

use std::io::{BufRead, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, Sender, channel};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::error::ProbeError;
use crate::model::{Object, SubtypeId};
use crate::session::{ProbeHandler, QueryFlags};
use crate::syschar::{Syschar, Sysinfo};

// ---------------------------------------------------------------------------
// Wire protocol
// ---------------------------------------------------------------------------

/// A request the session sends to the worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    /// Discard the worker's volatile caches.
    Reset { id: u64 },
    /// Collect items for one object.
    EvalObject {
        id: u64,
        subtype: SubtypeId,
        flags: u32,
        object: Object,
    },
    /// Report host identification.
    EvalSysinfo { id: u64 },
}

impl Request {
    pub fn id(&self) -> u64 {
        match self {
            Request::Reset { id }
            | Request::EvalObject { id, .. }
            | Request::EvalSysinfo { id } => *id,
        }
    }
}

/// A worker's answer, correlated by request id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    Object { id: u64, syschar: Syschar },
    Sysinfo { id: u64, sysinfo: Sysinfo },
    /// Reset acknowledged.
    ResetDone { id: u64 },
    Failure { id: u64, message: String },
}

impl Response {
    pub fn id(&self) -> u64 {
        match self {
            Response::Object { id, .. }
            | Response::Sysinfo { id, .. }
            | Response::ResetDone { id }
            | Response::Failure { id, .. } => *id,
        }
    }
}

// ---------------------------------------------------------------------------
// In-process transport
// ---------------------------------------------------------------------------

/// Session side of an in-process worker channel.
///
/// Round trips are serialized behind a mutex: the std mpsc pair gives no
/// per-request routing, so one outstanding request at a time keeps
/// responses matched to their senders.
pub struct SessionEndpoint {
    inner: Mutex<(Sender<Request>, Receiver<Response>)>,
    next_id: AtomicU64,
}

impl SessionEndpoint {
    fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Send a request and wait for its response.
    pub fn round_trip(&self, build: impl FnOnce(u64) -> Request) -> Result<Response, ProbeError> {
        let guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let id = self.allocate_id();
        let request = build(id);
        guard.0.send(request).map_err(|_| ProbeError::Ipc {
            message: "worker hung up before request".into(),
        })?;
        loop {
            let response = guard.1.recv().map_err(|_| ProbeError::Ipc {
                message: "worker hung up before response".into(),
            })?;
            if response.id() == id {
                return Ok(response);
            }
            tracing::warn!(
                got = response.id(),
                want = id,
                "dropping stale worker response"
            );
        }
    }

    /// Ask the worker to drop its volatile caches.
    pub fn reset(&self) -> Result<(), ProbeError> {
        match self.round_trip(|id| Request::Reset { id })? {
            Response::ResetDone { .. } => Ok(()),
            Response::Failure { message, .. } => Err(ProbeError::Ipc { message }),
            other => Err(ProbeError::Ipc {
                message: format!("unexpected reset response: {other:?}"),
            }),
        }
    }
}

/// Worker side of an in-process channel.
pub struct WorkerEndpoint {
    pub requests: Receiver<Request>,
    pub responses: Sender<Response>,
}

/// Create a connected session/worker endpoint pair.
pub fn channel_pair() -> (SessionEndpoint, WorkerEndpoint) {
    let (req_tx, req_rx) = channel();
    let (resp_tx, resp_rx) = channel();
    (
        SessionEndpoint {
            inner: Mutex::new((req_tx, resp_rx)),
            next_id: AtomicU64::new(1),
        },
        WorkerEndpoint {
            requests: req_rx,
            responses: resp_tx,
        },
    )
}

// ---------------------------------------------------------------------------
// Probe handler over IPC
// ---------------------------------------------------------------------------

/// [`ProbeHandler`] that forwards queries to a worker endpoint.
pub struct IpcProbeHandler {
    endpoint: SessionEndpoint,
}

impl IpcProbeHandler {
    pub fn new(endpoint: SessionEndpoint) -> Self {
        Self { endpoint }
    }

    pub fn endpoint(&self) -> &SessionEndpoint {
        &self.endpoint
    }
}

impl ProbeHandler for IpcProbeHandler {
    fn evaluate(
        &self,
        subtype: SubtypeId,
        object: &Object,
        syschar: &mut Syschar,
        flags: QueryFlags,
    ) -> Result<(), ProbeError> {
        let object = object.clone();
        // Forcing bypasses the session-side syschar cache only; the wire
        // flags stay stable so the worker's result cache keys match.
        let wire_flags = flags.difference(QueryFlags::FORCE).bits();
        let response = self.endpoint.round_trip(|id| Request::EvalObject {
            id,
            subtype,
            flags: wire_flags,
            object,
        })?;
        match response {
            Response::Object { syschar: collected, .. } => {
                *syschar = collected;
                Ok(())
            }
            Response::Failure { message, .. } => Err(ProbeError::Collect { message }),
            other => Err(ProbeError::Ipc {
                message: format!("unexpected object response: {other:?}"),
            }),
        }
    }

    fn sysinfo(&self) -> Result<Sysinfo, ProbeError> {
        match self.endpoint.round_trip(|id| Request::EvalSysinfo { id })? {
            Response::Sysinfo { sysinfo, .. } => Ok(sysinfo),
            Response::Failure { message, .. } => Err(ProbeError::Collect { message }),
            other => Err(ProbeError::Ipc {
                message: format!("unexpected sysinfo response: {other:?}"),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Stdio bridge
// ---------------------------------------------------------------------------

/// Read line-delimited JSON requests from `input` into `sink` until EOF.
///
/// Malformed lines are logged and skipped rather than terminating the
/// worker.
pub fn pump_requests(
    input: impl BufRead,
    sink: &Sender<Request>,
) -> Result<(), ProbeError> {
    for line in input.lines() {
        let line = line.map_err(|e| ProbeError::Ipc { message: e.to_string() })?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Request>(&line) {
            Ok(request) => {
                if sink.send(request).is_err() {
                    // Dispatch loop already gone; stop reading.
                    return Ok(());
                }
            }
            Err(e) => tracing::warn!(error = %e, "discarding malformed request line"),
        }
    }
    Ok(())
}

/// Drain responses from `source` to `output` as line-delimited JSON.
pub fn pump_responses(
    source: &Receiver<Response>,
    mut output: impl Write,
) -> Result<(), ProbeError> {
    while let Ok(response) = source.recv() {
        let line = serde_json::to_string(&response)
            .map_err(|e| ProbeError::Ipc { message: e.to_string() })?;
        writeln!(output, "{line}").map_err(|e| ProbeError::Ipc { message: e.to_string() })?;
        output
            .flush()
            .map_err(|e| ProbeError::Ipc { message: e.to_string() })?;
    }
    Ok(())
}
