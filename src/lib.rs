//! # defscan
//!
//! An assessment definition evaluator: given a parsed definition document
//! (definitions, criteria trees, tests, objects, states, variables), it
//! dispatches collection to probes, caches what they return, resolves
//! variables transitively, and walks criteria recursively to an outcome.
//!
//! ## Architecture
//!
//! - **Document model** (`model`): the parsed definition graph, criteria
//!   nodes in an arena
//! - **System characteristics** (`syschar`): collected items and flags,
//!   session-scoped and cached
//! - **Probe registry** (`registry`): static subtype/name/probe table with
//!   lazily built lock-free indices
//! - **Variable references** (`varref`): transitive closure collection over
//!   objects, states, and component chains
//! - **Session** (`session`): object/variable/definition querying, the
//!   recursive criteria evaluator
//! - **Directives** (`directives`): per-result-category reporting table
//!   with an XML round trip
//! - **Worker** (`worker`): the collection process — signal thread,
//!   dispatch loop, per-request threads, resettable caches
//!
//! ## Library usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use defscan::model::DefinitionModel;
//! use defscan::session::ProbeSession;
//!
//! let model = Arc::new(DefinitionModel::new());
//! let session = ProbeSession::new(model);
//! let status = session.query_definition("oval:example:def:1").unwrap();
//! println!("{status:?}");
//! ```

pub mod directives;
pub mod error;
pub mod model;
pub mod registry;
pub mod session;
pub mod syschar;
pub mod varref;
pub mod worker;
