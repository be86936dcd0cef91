//! Rich diagnostic error types for the defscan engine.
//!
//! Each subsystem defines its own error type with miette `#[diagnostic]` derives,
//! providing error codes, help text, and source chains. Conditions the engine is
//! designed to survive (an unsupported object subtype, a malformed directive
//! attribute) are *not* errors here — they are recorded as warnings on the
//! affected syschar or parse report and evaluation continues degraded.

use miette::Diagnostic;
use thiserror::Error;

/// Top-level error type for the defscan engine.
///
/// Each variant wraps a subsystem-specific error, preserving the full diagnostic
/// chain (error codes, help text, sources) through to the user.
#[derive(Debug, Error, Diagnostic)]
pub enum DefscanError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Probe(#[from] ProbeError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Directive(#[from] DirectiveError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Worker(#[from] WorkerError),
}

// ---------------------------------------------------------------------------
// Session errors
// ---------------------------------------------------------------------------

/// Hard errors raised while evaluating a definition. These unwind the
/// recursive evaluator immediately; the first one wins.
#[derive(Debug, Error, Diagnostic)]
pub enum SessionError {
    #[error("probe for subtype {subtype} failed: {message}")]
    #[diagnostic(
        code(defscan::session::probe_failure),
        help(
            "The probe handler returned a failure while collecting the object. \
             Check the probe's log output; the object's syschar carries any \
             messages the probe attached before failing."
        )
    )]
    ProbeFailure { subtype: u32, message: String },

    #[error("no system-info probe is registered, or its registration is malformed")]
    #[diagnostic(
        code(defscan::session::missing_sysinfo),
        help(
            "Definition evaluation requires host identification. Register a \
             handler for the system-info subtype before querying sysinfo."
        )
    )]
    MissingSysinfo,

    #[error("no definition with id \"{id}\" in the definition model")]
    #[diagnostic(
        code(defscan::session::definition_not_found),
        help("Verify the definition id against the loaded document.")
    )]
    DefinitionNotFound { id: String },

    #[error("definition \"{id}\" has no criteria")]
    #[diagnostic(
        code(defscan::session::no_criteria),
        help(
            "A definition without a criteria tree cannot be evaluated. \
             The source document is likely truncated or malformed."
        )
    )]
    NoCriteria { id: String },

    #[error("extend-definition cycle detected at \"{id}\"")]
    #[diagnostic(
        code(defscan::session::extend_cycle),
        help(
            "The criteria tree re-enters a definition already on the current \
             evaluation path. The document's extend_definition references \
             form a cycle; fix the document."
        )
    )]
    ExtendCycle { id: String },

    #[error("criteria tree contains an unknown node kind")]
    #[diagnostic(
        code(defscan::session::unknown_node),
        help("The document parser produced a node the evaluator cannot handle.")
    )]
    UnknownNode,

    #[error("dangling reference: {kind} \"{id}\"")]
    #[diagnostic(
        code(defscan::session::dangling_ref),
        help("The document references an entity that is not present in the model.")
    )]
    DanglingRef { kind: &'static str, id: String },
}

// ---------------------------------------------------------------------------
// Probe errors
// ---------------------------------------------------------------------------

/// Errors produced by a probe handler or the worker-side probe implementation.
#[derive(Debug, Error, Diagnostic)]
pub enum ProbeError {
    #[error("probe collection failed: {message}")]
    #[diagnostic(
        code(defscan::probe::collect),
        help("The probe could not sample the requested data from the host.")
    )]
    Collect { message: String },

    #[error("probe \"{name}\" does not implement the requested action")]
    #[diagnostic(
        code(defscan::probe::unsupported_action),
        help(
            "Only the system-info probe answers sysinfo requests; object \
             probes answer evaluate requests."
        )
    )]
    UnsupportedAction { name: String },

    #[error("IPC round-trip failed: {message}")]
    #[diagnostic(
        code(defscan::probe::ipc),
        help(
            "The worker process closed its endpoint or returned a failure \
             response. Check whether the worker is still alive."
        )
    )]
    Ipc { message: String },
}

// ---------------------------------------------------------------------------
// Directive errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum DirectiveError {
    #[error("directive XML is not well-formed: {message}")]
    #[diagnostic(
        code(defscan::directive::xml),
        help(
            "The directives element could not be read at all. Unrecognized \
             attribute values are tolerated as warnings; this error means \
             the XML itself is broken."
        )
    )]
    Xml { message: String },
}

// ---------------------------------------------------------------------------
// Worker errors
// ---------------------------------------------------------------------------

/// Errors from the probe worker process. Initialization failures are fatal:
/// a half-initialized worker cannot safely serve requests.
#[derive(Debug, Error, Diagnostic)]
pub enum WorkerError {
    #[error("worker initialization failed in {call}: {source}")]
    #[diagnostic(
        code(defscan::worker::init),
        help(
            "Thread, barrier, or endpoint setup failed. The worker process \
             aborts; it never serves requests in this state."
        )
    )]
    Initialization {
        call: &'static str,
        #[source]
        source: std::io::Error,
    },
}

/// Convenience alias for functions returning defscan results.
pub type DefscanResult<T> = std::result::Result<T, DefscanError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_error_converts_to_defscan_error() {
        let err = SessionError::DefinitionNotFound { id: "def:1".into() };
        let top: DefscanError = err.into();
        assert!(matches!(
            top,
            DefscanError::Session(SessionError::DefinitionNotFound { .. })
        ));
    }

    #[test]
    fn error_display_carries_identifiers() {
        let err = SessionError::ExtendCycle { id: "def:9".into() };
        let msg = format!("{err}");
        assert!(msg.contains("def:9"));

        let err = SessionError::ProbeFailure {
            subtype: 13,
            message: "boom".into(),
        };
        let msg = format!("{err}");
        assert!(msg.contains("13"));
        assert!(msg.contains("boom"));
    }

    #[test]
    fn worker_init_error_keeps_source() {
        let err = WorkerError::Initialization {
            call: "spawn(signal-handler)",
            source: std::io::Error::other("no threads left"),
        };
        let msg = format!("{err}");
        assert!(msg.contains("spawn(signal-handler)"));
    }
}
