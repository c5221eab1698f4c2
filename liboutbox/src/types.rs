//! Core types for Outbox

use serde::{Deserialize, Serialize};

/// Lifecycle state of a scheduled post.
///
/// Transitions are monotonic: `Pending` moves to exactly one of
/// `Published` or `Failed`, and terminal states are never re-entered.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PostStatus {
    Pending,
    Published,
    Failed,
}

impl PostStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PostStatus::Pending => "pending",
            PostStatus::Published => "published",
            PostStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(PostStatus::Pending),
            "published" => Some(PostStatus::Published),
            "failed" => Some(PostStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for PostStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A post queued for future publication
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledPost {
    pub id: i64,
    pub tenant_id: String,
    pub content: String,
    pub image_ref: Option<String>,
    /// Unix timestamp (UTC seconds) at which the post becomes due
    pub scheduled_time: i64,
    pub status: PostStatus,
    pub error_message: Option<String>,
    pub provider_post_id: Option<String>,
    pub created_at: i64,
    pub published_at: Option<i64>,
}

/// OAuth credential for one (tenant, provider) pair.
///
/// Token fields hold plaintext once read through the vault; at rest they
/// may be encrypted (see `crypto`). `is_encrypted` reflects the storage
/// state of the row this value was read from.
#[derive(Debug, Clone)]
pub struct Credential {
    pub tenant_id: String,
    pub provider: String,
    /// Provider-side identity (e.g. a LinkedIn member URN)
    pub external_id: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// Unix timestamp after which the access token is no longer valid
    pub expires_at: Option<i64>,
    pub scopes: Option<String>,
    pub is_encrypted: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_post_status_round_trip() {
        for status in [PostStatus::Pending, PostStatus::Published, PostStatus::Failed] {
            assert_eq!(PostStatus::parse(status.as_str()), Some(status));
        }
    }

    #[test]
    fn test_post_status_parse_unknown() {
        assert_eq!(PostStatus::parse("draft"), None);
        assert_eq!(PostStatus::parse(""), None);
        assert_eq!(PostStatus::parse("PENDING"), None);
    }

    #[test]
    fn test_post_status_display() {
        assert_eq!(PostStatus::Pending.to_string(), "pending");
        assert_eq!(PostStatus::Published.to_string(), "published");
        assert_eq!(PostStatus::Failed.to_string(), "failed");
    }

    #[test]
    fn test_scheduled_post_serialization() {
        let post = ScheduledPost {
            id: 7,
            tenant_id: "tenant-1".to_string(),
            content: "Shipping day".to_string(),
            image_ref: None,
            scheduled_time: 1_700_000_000,
            status: PostStatus::Pending,
            error_message: None,
            provider_post_id: None,
            created_at: 1_699_999_000,
            published_at: None,
        };

        let json = serde_json::to_string(&post).unwrap();
        let deserialized: ScheduledPost = serde_json::from_str(&json).unwrap();

        assert_eq!(deserialized.id, post.id);
        assert_eq!(deserialized.tenant_id, post.tenant_id);
        assert_eq!(deserialized.scheduled_time, post.scheduled_time);
        assert_eq!(deserialized.status, post.status);
    }
}
