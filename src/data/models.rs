//! Data models
//!
//! Rust structs representing database entities.
//! Tokens use ULID and timestamps use chrono.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::federation::{InstancePath, PathType, Priority};

// =============================================================================
// Delivery token
// =============================================================================

/// Correlates every queue row produced by one `request()` call.
///
/// Example: "01ARZ3NDEKTSV4RRFFQ69G5FAV"
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeliveryToken(pub String);

impl DeliveryToken {
    /// Generate a new ULID token
    pub fn new() -> Self {
        Self(ulid::Ulid::new().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for DeliveryToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DeliveryToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for DeliveryToken {
    fn from(value: String) -> Self {
        Self(value)
    }
}

// =============================================================================
// Delivery queue
// =============================================================================

/// Lifecycle state of a queue row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Standby,
    Running,
    Success,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Standby => "standby",
            Self::Running => "running",
            Self::Success => "success",
        }
    }
}

impl FromStr for QueueStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "standby" => Ok(Self::Standby),
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            other => Err(AppError::Validation(format!("Unknown queue status: {}", other))),
        }
    }
}

/// One durable delivery: a payload bound for a single destination.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueItem {
    pub id: i64,
    pub token: DeliveryToken,
    /// Actor URI whose key signs the delivery
    pub author: String,
    /// Serialized activity JSON
    pub activity: String,
    pub instance: InstancePath,
    pub priority: Priority,
    pub status: QueueStatus,
    pub tries: u32,
    /// Time of the last attempt (creation time until the first attempt)
    pub last: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Raw `delivery_queue` row
#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct QueueRow {
    pub id: i64,
    pub token: String,
    pub author: String,
    pub activity: String,
    pub uri: String,
    pub address: String,
    pub path: String,
    pub path_type: String,
    pub priority: String,
    pub status: String,
    pub tries: i64,
    pub last: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<QueueRow> for QueueItem {
    type Error = AppError;

    fn try_from(row: QueueRow) -> Result<Self, Self::Error> {
        let priority: Priority = row.priority.parse()?;
        let path_type: PathType = row.path_type.parse()?;

        Ok(Self {
            id: row.id,
            token: DeliveryToken(row.token),
            author: row.author,
            activity: row.activity,
            instance: InstancePath {
                uri: row.uri,
                address: row.address,
                path: row.path,
                path_type,
                priority,
            },
            priority,
            status: row.status.parse()?,
            tries: u32::try_from(row.tries).unwrap_or(u32::MAX),
            last: row.last,
            created_at: row.created_at,
        })
    }
}

// =============================================================================
// Collaborator records
// =============================================================================

/// An accepted follower of a local followers collection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct FollowerRecord {
    /// Followers collection (follow id) this follower belongs to
    pub follow_id: String,
    pub follower_uri: String,
    pub inbox_uri: String,
    pub shared_inbox_uri: Option<String>,
}

impl FollowerRecord {
    /// Shared inbox when advertised, personal inbox otherwise.
    pub fn delivery_inbox(&self) -> &str {
        self.shared_inbox_uri.as_deref().unwrap_or(&self.inbox_uri)
    }
}

/// A local actor with signing material
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct LocalActor {
    pub uri: String,
    /// RSA private key (PKCS#8 PEM)
    pub private_key_pem: String,
    /// RSA public key (SPKI PEM)
    pub public_key_pem: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_status_parses_stored_values() {
        for status in [QueueStatus::Standby, QueueStatus::Running, QueueStatus::Success] {
            assert_eq!(status.as_str().parse::<QueueStatus>().unwrap(), status);
        }
        assert!("failed".parse::<QueueStatus>().is_err());
    }

    #[test]
    fn delivery_tokens_are_unique() {
        assert_ne!(DeliveryToken::new(), DeliveryToken::new());
    }

    #[test]
    fn follower_prefers_shared_inbox() {
        let mut follower = FollowerRecord {
            follow_id: "https://local.example/users/alice/followers".to_string(),
            follower_uri: "https://remote.example/users/bob".to_string(),
            inbox_uri: "https://remote.example/users/bob/inbox".to_string(),
            shared_inbox_uri: Some("https://remote.example/inbox".to_string()),
        };
        assert_eq!(follower.delivery_inbox(), "https://remote.example/inbox");

        follower.shared_inbox_uri = None;
        assert_eq!(follower.delivery_inbox(), "https://remote.example/users/bob/inbox");
    }
}
