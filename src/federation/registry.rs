//! Collaborator interfaces consumed by the delivery pipeline
//!
//! The dispatcher never reaches for global state: everything it needs from
//! the rest of the system arrives through a `FederationRegistry` built at
//! startup and passed in explicitly.

use std::sync::Arc;

use async_trait::async_trait;

use super::activity::OutboundActivity;
use crate::data::FollowerRecord;
use crate::error::AppError;

/// Persists an activity's own object graph before it is delivered.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ActivityStore: Send + Sync {
    /// Must be idempotent.
    async fn save(&self, activity: &OutboundActivity) -> Result<(), AppError>;
}

/// Resolves a followers collection into its accepted followers.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FollowerDirectory: Send + Sync {
    async fn get_followers_by_follow_id(&self, uri: &str)
    -> Result<Vec<FollowerRecord>, AppError>;
}

/// Private keys of local actors, used for outbound signing.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SigningKeyStore: Send + Sync {
    /// PKCS#8 PEM private key, or `None` when the actor has no key.
    async fn get_private_key(&self, actor_uri: &str) -> Result<Option<String>, AppError>;
}

/// Public keys of remote actors, used for inbound verification.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait KeyResolver: Send + Sync {
    /// PEM public key for `actor_uri`.
    async fn get_public_key(&self, actor_uri: &str) -> Result<String, AppError>;
}

/// The set of collaborators a dispatcher is constructed with.
#[derive(Clone)]
pub struct FederationRegistry {
    pub activities: Arc<dyn ActivityStore>,
    pub followers: Arc<dyn FollowerDirectory>,
    pub signing_keys: Arc<dyn SigningKeyStore>,
}

impl FederationRegistry {
    pub fn new(
        activities: Arc<dyn ActivityStore>,
        followers: Arc<dyn FollowerDirectory>,
        signing_keys: Arc<dyn SigningKeyStore>,
    ) -> Self {
        Self {
            activities,
            followers,
            signing_keys,
        }
    }

    /// Activity store, follower directory and signing keys all backed by `db`.
    pub fn from_database(db: Arc<crate::data::Database>) -> Self {
        Self::new(db.clone(), db.clone(), db)
    }
}
