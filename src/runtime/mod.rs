//! Runtime handle, control surface and tokio adapters.

pub mod api;
#[cfg(feature = "tokio-runtime")]
pub mod tokio_pool;
#[cfg(feature = "tokio-runtime")]
pub mod tokio_source;

pub use api::{ProcessHandle, Runtime, RuntimeBuilder, DEFAULT_POOL};
#[cfg(feature = "tokio-runtime")]
pub use tokio_pool::TokioPool;
#[cfg(feature = "tokio-runtime")]
pub use tokio_source::{spawn_operation, AsyncResourceSource, TokioResourceSource};
