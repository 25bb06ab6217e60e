//! Core execution abstractions: units and pools, resources, oversight,
//! administration, the flow graph and scope containers.

pub mod administration;
pub mod audit;
pub(crate) mod engine;
pub mod error;
pub mod failure;
pub mod flow;
pub mod oversight;
pub mod resource;
pub mod scope;
pub mod unit;
pub mod worker_pool;

pub use administration::{Administration, Duty, DutyContext, DutyId, FnDuty};
pub use audit::{build_audit_event, AuditEvent, AuditSink, InMemoryAuditSink, NoopAuditSink};
pub use engine::DefaultHandler;
pub use error::{AppResult, RuntimeError};
pub use failure::{Failure, FailureKinds, FailureOrigin, KindId};
pub use flow::{FlowGraph, FlowGraphBuilder, FnWork, NodeBuilder, NodeId, Work, WorkContext};
pub use oversight::{Governance, OversightId, OversightManager};
pub use resource::{
    Facet, Instance, LoadNotifier, OperationNotifier, ResourceContainer, ResourceDef, ResourceKey,
    ResourceRegistry, ResourceSource, ResourceState, ScopeKind, SyncSource,
};
pub use scope::{FlowCallback, FlowOutcome, ProcessReport, ProcessScope, ThreadScope};
pub use unit::{Activation, Affinity, Job, JobContext, JobStatus, Unit};
pub use worker_pool::{
    AffinityPool, PassivePool, PoolError, PoolStats, ThreadPerUnitPool, ThreadPool, WorkerPool,
};
