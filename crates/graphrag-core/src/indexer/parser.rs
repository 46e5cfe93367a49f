//! Source parser seam used by extraction passes.

use crate::errors::GraphResult;
use crate::models::EntityFacts;

/// Turns one file's bytes into entity facts.  Implementations must be
/// shareable across the parse worker pool.
pub trait SourceParser: Send + Sync {
    /// `path` is repository-relative and ends up in identity keys.
    fn parse(&self, path: &str, source: &[u8]) -> GraphResult<Vec<EntityFacts>>;
}
