//! SQLite database operations
//!
//! All database access goes through this module.
//! Queue state transitions are single conditional `UPDATE`s so that
//! concurrent workers can never both own the same row.

use chrono::{DateTime, Utc};
use sqlx::{Pool, QueryBuilder, Sqlite, SqlitePool};
use std::path::Path;
use std::time::Duration;

use super::models::*;
use crate::error::AppError;
use crate::federation::{InstancePath, is_eligible};

const QUEUE_COLUMNS: &str = "id, token, author, activity, uri, address, path, path_type, \
                             priority, status, tries, last, created_at";

/// Database connection pool wrapper.
pub struct Database {
    pool: Pool<Sqlite>,
}

impl Database {
    /// Connect to SQLite database
    ///
    /// Creates the database file if it doesn't exist.
    /// Runs pending migrations automatically.
    ///
    /// # Arguments
    /// * `path` - Path to SQLite database file
    ///
    /// # Errors
    /// Returns error if connection or migration fails
    pub async fn connect(path: &Path) -> Result<Self, AppError> {
        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| AppError::Database(sqlx::Error::Io(e)))?;
        }

        // Create connection string
        let connection_string = format!("sqlite:{}?mode=rwc", path.display());

        // Create connection pool
        let pool = SqlitePool::connect(&connection_string).await?;

        // Run migrations
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| {
                tracing::error!("Migration failed: {}", e);
                AppError::Internal(anyhow::anyhow!("Migration failed: {}", e))
            })?;

        tracing::info!("Database connected and migrated successfully");

        Ok(Self { pool })
    }

    // =========================================================================
    // Delivery queue
    // =========================================================================

    /// Insert one STANDBY row per target, all sharing a fresh token.
    ///
    /// Rows are written in a single transaction so a token's fan-out is
    /// either fully queued or not queued at all.
    pub async fn enqueue(
        &self,
        targets: &[InstancePath],
        payload: &str,
        author: &str,
    ) -> Result<DeliveryToken, AppError> {
        let token = DeliveryToken::new();
        let now = Utc::now();

        let mut tx = self.pool.begin().await?;
        for target in targets {
            sqlx::query(
                r#"
                INSERT INTO delivery_queue (
                    token, author, activity, uri, address, path, path_type,
                    priority, status, tries, last, created_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'standby', 0, ?, ?)
                "#,
            )
            .bind(token.as_str())
            .bind(author)
            .bind(payload)
            .bind(&target.uri)
            .bind(&target.address)
            .bind(&target.path)
            .bind(target.path_type.as_str())
            .bind(target.priority.as_str())
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        tracing::debug!(token = %token, rows = targets.len(), "Enqueued delivery targets");
        Ok(token)
    }

    /// Move a row from STANDBY to RUNNING.
    ///
    /// # Errors
    /// `AppError::QueueConflict` when the row is no longer STANDBY.
    pub async fn claim(&self, item: &QueueItem) -> Result<(), AppError> {
        let result = sqlx::query(
            "UPDATE delivery_queue SET status = 'running', last = ? WHERE id = ? AND status = 'standby'",
        )
        .bind(Utc::now())
        .bind(item.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::QueueConflict);
        }
        Ok(())
    }

    /// Finish a RUNNING row.
    ///
    /// Success is terminal. Failure returns the row to STANDBY with one more
    /// try and a fresh `last` timestamp.
    ///
    /// # Errors
    /// `AppError::QueueConflict` when the row was not RUNNING.
    pub async fn complete(&self, item: &QueueItem, success: bool) -> Result<(), AppError> {
        let query = if success {
            "UPDATE delivery_queue SET status = 'success', last = ? WHERE id = ? AND status = 'running'"
        } else {
            "UPDATE delivery_queue SET status = 'standby', tries = tries + 1, last = ? \
             WHERE id = ? AND status = 'running'"
        };

        let result = sqlx::query(query)
            .bind(Utc::now())
            .bind(item.id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::QueueConflict);
        }
        Ok(())
    }

    /// Permanently remove a row (target confirmed gone).
    pub async fn delete_queue_item(&self, item: &QueueItem) -> Result<(), AppError> {
        sqlx::query("DELETE FROM delivery_queue WHERE id = ?")
            .bind(item.id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Get a single row by id
    pub async fn get_queue_item(&self, id: i64) -> Result<Option<QueueItem>, AppError> {
        let row = sqlx::query_as::<_, QueueRow>(&format!(
            "SELECT {} FROM delivery_queue WHERE id = ?",
            QUEUE_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(QueueItem::try_from).transpose()
    }

    /// Rows for a token in insertion order, optionally filtered by status.
    pub async fn list_by_token(
        &self,
        token: &DeliveryToken,
        status: Option<QueueStatus>,
    ) -> Result<Vec<QueueItem>, AppError> {
        let mut query = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {} FROM delivery_queue WHERE token = ",
            QUEUE_COLUMNS
        ));
        query.push_bind(token.as_str());
        if let Some(status) = status {
            query.push(" AND status = ");
            query.push_bind(status.as_str());
        }
        query.push(" ORDER BY id ASC");

        let rows = query
            .build_query_as::<QueueRow>()
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(QueueItem::try_from).collect()
    }

    /// STANDBY rows whose backoff has elapsed at `now`, oldest first.
    pub async fn list_eligible_standby(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<QueueItem>, AppError> {
        let rows = sqlx::query_as::<_, QueueRow>(&format!(
            "SELECT {} FROM delivery_queue WHERE status = 'standby' ORDER BY id ASC",
            QUEUE_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        let mut eligible = Vec::new();
        for row in rows {
            let item = QueueItem::try_from(row)?;
            if is_eligible(&item, now) {
                eligible.push(item);
            }
        }
        Ok(eligible)
    }

    /// Return RUNNING rows whose claim is older than `older_than` to STANDBY.
    ///
    /// Each row is released with a compare-and-set on its claim timestamp, so a
    /// row that completes concurrently is left alone.
    pub async fn release_stale(&self, older_than: Duration) -> Result<u64, AppError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(older_than)
                .map_err(|e| AppError::Internal(anyhow::anyhow!("invalid stale window: {}", e)))?;

        let running = sqlx::query_as::<_, (i64, String)>(
            "SELECT id, last FROM delivery_queue WHERE status = 'running'",
        )
        .fetch_all(&self.pool)
        .await?;

        let stale = running.into_iter().filter(|(_, last)| {
            DateTime::parse_from_rfc3339(last)
                .map(|parsed| parsed.with_timezone(&Utc) < cutoff)
                .unwrap_or(true)
        });

        let mut released = 0;
        for (id, last) in stale {
            let result = sqlx::query(
                "UPDATE delivery_queue SET status = 'standby', tries = tries + 1, last = ? \
                 WHERE id = ? AND status = 'running' AND last = ?",
            )
            .bind(Utc::now())
            .bind(id)
            .bind(last)
            .execute(&self.pool)
            .await?;
            released += result.rows_affected();
        }

        if released > 0 {
            tracing::warn!(released, "Released stale RUNNING delivery rows");
        }
        Ok(released)
    }

    /// Count rows by status
    pub async fn count_by_status(&self, status: QueueStatus) -> Result<i64, AppError> {
        let count =
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM delivery_queue WHERE status = ?")
                .bind(status.as_str())
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    // =========================================================================
    // Activities
    // =========================================================================

    /// Store an activity payload; saving the same id twice is a no-op.
    pub async fn save_activity(
        &self,
        id: &str,
        actor: &str,
        payload: &serde_json::Value,
    ) -> Result<(), AppError> {
        let payload = serde_json::to_string(payload)
            .map_err(|e| AppError::Validation(format!("Failed to serialize activity: {}", e)))?;

        sqlx::query(
            "INSERT INTO activities (id, actor, payload, created_at) VALUES (?, ?, ?, ?) \
             ON CONFLICT(id) DO NOTHING",
        )
        .bind(id)
        .bind(actor)
        .bind(payload)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Get a stored activity payload
    pub async fn get_activity(&self, id: &str) -> Result<Option<serde_json::Value>, AppError> {
        let raw = sqlx::query_scalar::<_, String>("SELECT payload FROM activities WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(raw.and_then(|raw| serde_json::from_str(&raw).ok()))
    }

    // =========================================================================
    // Local actors
    // =========================================================================

    /// Insert or replace a local actor's key pair
    pub async fn upsert_local_actor(&self, actor: &LocalActor) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO local_actors (uri, private_key_pem, public_key_pem, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(uri) DO UPDATE SET
                private_key_pem = excluded.private_key_pem,
                public_key_pem = excluded.public_key_pem
            "#,
        )
        .bind(&actor.uri)
        .bind(&actor.private_key_pem)
        .bind(&actor.public_key_pem)
        .bind(actor.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Get a local actor by URI
    pub async fn get_local_actor(&self, uri: &str) -> Result<Option<LocalActor>, AppError> {
        let actor = sqlx::query_as::<_, LocalActor>(
            "SELECT uri, private_key_pem, public_key_pem, created_at FROM local_actors WHERE uri = ?",
        )
        .bind(uri)
        .fetch_optional(&self.pool)
        .await?;
        Ok(actor)
    }

    // =========================================================================
    // Followers
    // =========================================================================

    /// Record a follower (pending until accepted)
    pub async fn insert_follower(&self, follower: &FollowerRecord) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO followers (follow_id, follower_uri, inbox_uri, shared_inbox_uri, accepted, created_at)
            VALUES (?, ?, ?, ?, 0, ?)
            ON CONFLICT(follow_id, follower_uri) DO UPDATE SET
                inbox_uri = excluded.inbox_uri,
                shared_inbox_uri = excluded.shared_inbox_uri
            "#,
        )
        .bind(&follower.follow_id)
        .bind(&follower.follower_uri)
        .bind(&follower.inbox_uri)
        .bind(&follower.shared_inbox_uri)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Mark a follower as accepted
    pub async fn accept_follower(
        &self,
        follow_id: &str,
        follower_uri: &str,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            "UPDATE followers SET accepted = 1 WHERE follow_id = ? AND follower_uri = ?",
        )
        .bind(follow_id)
        .bind(follower_uri)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Remove a follower
    pub async fn delete_follower(&self, follow_id: &str, follower_uri: &str) -> Result<(), AppError> {
        sqlx::query("DELETE FROM followers WHERE follow_id = ? AND follower_uri = ?")
            .bind(follow_id)
            .bind(follower_uri)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Accepted followers of a followers collection
    pub async fn get_followers_by_follow_id(
        &self,
        follow_id: &str,
    ) -> Result<Vec<FollowerRecord>, AppError> {
        let followers = sqlx::query_as::<_, FollowerRecord>(
            r#"
            SELECT follow_id, follower_uri, inbox_uri, shared_inbox_uri
            FROM followers
            WHERE follow_id = ? AND accepted = 1
            ORDER BY created_at ASC, follower_uri ASC
            "#,
        )
        .bind(follow_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(followers)
    }
}
