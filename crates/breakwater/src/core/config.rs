//! Configuration contract shared by the primitives

use super::error::ConfigResult;

/// A validated, immutable primitive configuration.
///
/// Every primitive's `…Config` implements this so registries can check
/// configurations once, at registration time, instead of on every
/// instance construction.
pub trait ResilienceConfig: Clone + Send + Sync {
    /// Check field ranges.
    fn validate(&self) -> ConfigResult<()>;
}
