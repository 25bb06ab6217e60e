//! # Prometheus Flow Runtime
//!
//! A concurrent execution engine for continuation flow graphs: units of work
//! linked by successor edges and escalation edges, running on pluggable
//! worker pools, gated on resources whose lifecycles are asynchronous.
//!
//! ## Core Problem Solved
//!
//! Work that touches slow resources (connections, models, sessions) should
//! never hold a worker thread while the resource is being constructed or is
//! busy with an in-flight operation. Here a unit that cannot proceed
//! registers itself with the resource's waiter list and returns; the
//! resource re-queues it on its pool when the state changes.
//!
//! ## Key Features
//!
//! - **Worker pools**: dedicated, fixed thread pool, thread-per-unit,
//!   passive (inline), thread-affinity lanes, and tokio blocking pools
//! - **Resource containers**: at-most-once loading per scope, `Busy` gating
//!   around async operations, dependents-first teardown
//! - **Oversight**: activate/enforce/disregard governance over the resources
//!   a flow loads, resolved exactly once per flow
//! - **Administration**: ordered pre/post duties around a node body
//! - **Escalation**: failures route by kind specificity through node, flow
//!   and process tables, then a default handler
//! - **Scopes**: invocation, thread (flow) and process lifetimes
//!
//! ## Example
//!
//! ```rust,ignore
//! use prometheus_flow_runtime::core::{Failure, FlowGraph, FnWork, ScopeKind, SyncSource};
//! use prometheus_flow_runtime::runtime::Runtime;
//! use serde_json::json;
//!
//! let mut graph = FlowGraph::builder();
//! let db = graph.resource("db", ScopeKind::Process, SyncSource::new(|| Ok(Db::connect())));
//! graph
//!     .node("load", FnWork::new(move |cx| {
//!         let db = cx.instance::<Db>(db).ok_or_else(|| Failure::runtime("db not ready"))?;
//!         Ok(json!(db.fetch()))
//!     }))
//!     .requires(db)
//!     .next("render");
//! graph.node("render", FnWork::new(|cx| Ok(cx.parameter().clone())));
//!
//! let runtime = Runtime::builder(graph.build()?).build()?;
//! let process = runtime.open_process_scope();
//! runtime.invoke(&process, "load", json!(null))?;
//! runtime.close_process_scope(&process)?;
//! ```
//!
//! For complete scenarios, see:
//! - `tests/escalation_test.rs` - failure routing
//! - `tests/resource_container_test.rs` - concurrent loading and teardown

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Core execution abstractions.
pub mod core;
/// Configuration models for pools and the runtime.
pub mod config;
/// Builders to construct runtime components from configuration.
pub mod builders;
/// Runtime handle, control surface and tokio adapters.
pub mod runtime;
/// Shared utilities.
pub mod util;
