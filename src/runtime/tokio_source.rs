//! Async resource construction on a tokio runtime.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::runtime::Handle;
use tracing::debug;

use crate::core::failure::Failure;
use crate::core::resource::{Facet, Instance, LoadNotifier, OperationNotifier, ResourceKey, ResourceSource};

/// A resource whose construction and release are async.
#[async_trait]
pub trait AsyncResourceSource: Send + Sync + 'static {
    /// Construct an instance.
    async fn load(&self) -> Result<Instance, Failure>;

    /// Resources the loaded instance depends on.
    fn dependencies(&self, _instance: &Instance) -> Vec<ResourceKey> {
        Vec::new()
    }

    /// Extension facet exposed to oversight and duties.
    fn facet(&self, instance: &Instance) -> Option<Facet> {
        Some(Arc::clone(instance))
    }

    /// Release the instance.
    async fn release(&self, _instance: Instance) {}
}

/// Adapts an [`AsyncResourceSource`] to the container's callback contract by
/// spawning its futures on a runtime handle.
pub struct TokioResourceSource<S> {
    source: Arc<S>,
    handle: Handle,
}

impl<S: AsyncResourceSource> TokioResourceSource<S> {
    /// Run `source` on `handle`.
    pub fn new(source: S, handle: Handle) -> Self {
        Self {
            source: Arc::new(source),
            handle,
        }
    }
}

impl<S: AsyncResourceSource> ResourceSource for TokioResourceSource<S> {
    fn start_load(&self, notifier: LoadNotifier) {
        let source = Arc::clone(&self.source);
        self.handle.spawn(async move {
            debug!(resource = notifier.resource(), "async load started");
            match source.load().await {
                Ok(instance) => notifier.loaded(instance),
                Err(failure) => notifier.failed(failure),
            }
        });
    }

    fn dependencies(&self, instance: &Instance) -> Vec<ResourceKey> {
        self.source.dependencies(instance)
    }

    fn facet(&self, instance: &Instance) -> Option<Facet> {
        self.source.facet(instance)
    }

    fn release(&self, instance: Instance) {
        let source = Arc::clone(&self.source);
        self.handle.spawn(async move { source.release(instance).await });
    }
}

/// Drive an async operation to completion on `handle`, reporting its result
/// through `notifier`.
pub fn spawn_operation<F>(handle: &Handle, notifier: OperationNotifier, operation: F)
where
    F: Future<Output = Result<(), Failure>> + Send + 'static,
{
    handle.spawn(async move {
        match operation.await {
            Ok(()) => notifier.complete(),
            Err(failure) => notifier.fail(failure),
        }
    });
}
