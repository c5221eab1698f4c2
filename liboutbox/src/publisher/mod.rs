//! Publish adapter boundary
//!
//! One trait per provider integration. The pipeline takes the adapter
//! as a constructor argument, so a missing integration fails at
//! startup, never at dispatch time.

use async_trait::async_trait;

use crate::error::Result;

pub mod linkedin;

// Mock adapter is available for all builds (not just tests) to support
// integration tests
pub mod mock;

/// A provider integration capable of publishing one post.
///
/// Implementations classify provider failures into `PublishError`
/// variants; the dispatcher decides retry behavior from that
/// classification, not from provider-specific knowledge.
#[async_trait]
pub trait PublishAdapter: Send + Sync {
    /// Publish a post on behalf of `author_id` (the provider-side
    /// identity, e.g. a member URN).
    ///
    /// Returns the provider's post id on success.
    ///
    /// # Errors
    ///
    /// Returns `OutboxError::Publish` with a transient variant
    /// (timeout, connection, rate limit, server error) or a permanent
    /// one (auth, rejection, protocol).
    async fn publish(
        &self,
        access_token: &str,
        author_id: &str,
        content: &str,
        image_ref: Option<&str>,
    ) -> Result<String>;

    /// Lowercase provider identifier (e.g. "linkedin")
    fn name(&self) -> &str;
}
