/// Engine configuration document handling
///
/// Adapts the declarative engine document before start-up and classifies
/// start failures that call for a degraded retry.
pub mod adapter;
pub mod failure;

pub use adapter::{degrade, AdaptError, AdaptedConfig, ConfigAdapter, CACHE_FILE_NAME};
pub use failure::{classify, is_cache_failure_signature, FailureKind};
