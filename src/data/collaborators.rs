//! Database-backed implementations of the federation collaborator traits

use async_trait::async_trait;

use super::database::Database;
use super::models::FollowerRecord;
use crate::error::AppError;
use crate::federation::{ActivityStore, FollowerDirectory, OutboundActivity, SigningKeyStore};

#[async_trait]
impl ActivityStore for Database {
    async fn save(&self, activity: &OutboundActivity) -> Result<(), AppError> {
        self.save_activity(&activity.id, &activity.author, &activity.payload)
            .await
    }
}

#[async_trait]
impl FollowerDirectory for Database {
    async fn get_followers_by_follow_id(
        &self,
        uri: &str,
    ) -> Result<Vec<FollowerRecord>, AppError> {
        Database::get_followers_by_follow_id(self, uri).await
    }
}

#[async_trait]
impl SigningKeyStore for Database {
    async fn get_private_key(&self, actor_uri: &str) -> Result<Option<String>, AppError> {
        Ok(self
            .get_local_actor(actor_uri)
            .await?
            .map(|actor| actor.private_key_pem)
            .filter(|pem| !pem.trim().is_empty()))
    }
}
