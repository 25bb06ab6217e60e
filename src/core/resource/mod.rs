//! Resource lifecycle: sources, per-scope containers, and registries.

mod container;
mod registry;
mod source;

pub use container::{LoadNotifier, OperationNotifier, ResourceContainer, ResourceState};
pub(crate) use container::OperationDone;
pub use registry::{ResourceRegistry, ResourceResolver, ScopeChain};
pub use source::{Facet, Instance, ResourceDef, ResourceKey, ResourceSource, ScopeKind, SyncSource};
