//! Delivery dispatcher
//!
//! One `request()` call turns an outbound activity into queued delivery rows:
//! followers collections are expanded into per-host shared inboxes, every
//! resolved target is enqueued under one token, a single fast-path delivery
//! is attempted inline and whatever remains is handed to the worker pool.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use super::activity::OutboundActivity;
use super::instance::{InstancePath, PathType, Priority};
use super::registry::{FederationRegistry, FollowerDirectory};
use super::scheduler::{HostFailures, RetryScheduler};
use super::worker::DeliveryTrigger;
use crate::data::{Database, DeliveryToken, QueueItem, QueueStatus};
use crate::error::AppError;
use crate::metrics::{DELIVERY_ENQUEUED_TOTAL, DELIVERY_FAST_PATH_TOTAL};

/// Expand FOLLOWERS paths into one target per distinct delivery inbox.
///
/// Followers with a shared inbox collapse into a single GLOBAL path for
/// that inbox; followers without one keep their personal inbox as an INBOX
/// path. Expanded paths inherit the collection's priority. An inbox that is
/// already a declared target, or is reached through several collections,
/// is only emitted once. Other path types pass through unchanged.
pub async fn resolve_targets(
    followers: &dyn FollowerDirectory,
    targets: &[InstancePath],
) -> Result<Vec<InstancePath>, AppError> {
    let mut resolved = Vec::new();
    let mut seen_inboxes: HashSet<String> = targets
        .iter()
        .filter(|t| t.path_type != PathType::Followers)
        .map(|t| t.uri.clone())
        .collect();

    for target in targets {
        if target.path_type != PathType::Followers {
            resolved.push(target.clone());
            continue;
        }

        let records = followers.get_followers_by_follow_id(&target.uri).await?;
        let total = records.len();

        for record in records {
            let inbox = record.delivery_inbox();
            let path_type = if record.shared_inbox_uri.is_some() {
                PathType::Global
            } else {
                PathType::Inbox
            };

            let path = match InstancePath::new(inbox, path_type, target.priority) {
                Ok(path) => path,
                Err(e) => {
                    tracing::warn!(
                        follower = %record.follower_uri,
                        inbox = %inbox,
                        error = %e,
                        "Skipping follower with unusable inbox"
                    );
                    continue;
                }
            };

            // Compared on the normalized URI
            if seen_inboxes.insert(path.uri.clone()) {
                resolved.push(path);
            }
        }

        tracing::debug!(
            collection = %target.uri,
            followers = total,
            "Expanded followers collection"
        );
    }

    Ok(resolved)
}

/// Pick the single row a `request()` may deliver inline.
///
/// Rows are ranked by priority, highest first, then by insertion order.
/// The top-ranked row qualifies when it is:
/// - TOP, always
/// - HIGH, when it is alone or the next row is below HIGH
/// - MEDIUM, when it is alone
///
/// LOW never qualifies.
pub fn select_fast_path(rows: &[QueueItem]) -> Option<&QueueItem> {
    let mut ranked: Vec<&QueueItem> = rows
        .iter()
        .filter(|row| row.status == QueueStatus::Standby)
        .collect();
    ranked.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));

    let first = *ranked.first()?;
    let next = ranked.get(1).map(|row| row.priority);

    let qualifies = match first.priority {
        Priority::Top => true,
        Priority::High => next.is_none_or(|p| p < Priority::High),
        Priority::Medium => next.is_none(),
        Priority::Low => false,
    };

    qualifies.then_some(first)
}

/// Delivery dispatcher
#[derive(Clone)]
pub struct DeliveryDispatcher {
    registry: FederationRegistry,
    db: Arc<Database>,
    scheduler: RetryScheduler,
    trigger: DeliveryTrigger,
    fast_path_timeout: Duration,
}

impl DeliveryDispatcher {
    pub fn new(
        registry: FederationRegistry,
        db: Arc<Database>,
        scheduler: RetryScheduler,
        trigger: DeliveryTrigger,
        fast_path_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            db,
            scheduler,
            trigger,
            fast_path_timeout,
        }
    }

    /// Queue an activity for delivery
    ///
    /// # Returns
    /// The token shared by every queued row. A failed or skipped fast path
    /// still returns a token.
    ///
    /// # Errors
    /// - `Validation` if the activity declares no targets
    /// - `KeyUnavailable` if the author has no private key
    /// - storage failures while saving or enqueueing
    pub async fn request(&self, activity: &OutboundActivity) -> Result<DeliveryToken, AppError> {
        if activity.targets.is_empty() {
            return Err(AppError::Validation(format!(
                "Activity {} has no delivery targets",
                activity.id
            )));
        }

        self.registry.activities.save(activity).await?;

        if self
            .registry
            .signing_keys
            .get_private_key(&activity.author)
            .await?
            .is_none()
        {
            return Err(AppError::KeyUnavailable(format!(
                "No private key for {}",
                activity.author
            )));
        }

        let targets = resolve_targets(self.registry.followers.as_ref(), &activity.targets).await?;
        let payload = serde_json::to_string(&activity.payload)
            .map_err(|e| AppError::Validation(format!("Failed to serialize activity: {}", e)))?;

        let token = self.db.enqueue(&targets, &payload, &activity.author).await?;
        DELIVERY_ENQUEUED_TOTAL.inc_by(targets.len() as u64);

        tracing::info!(
            token = %token,
            activity = %activity.id,
            declared = activity.targets.len(),
            queued = targets.len(),
            "Activity queued for delivery"
        );

        let rows = self.db.list_by_token(&token, None).await?;
        self.fast_path(&token, &rows).await;

        let pending = self
            .db
            .list_by_token(&token, Some(QueueStatus::Standby))
            .await?;
        if !pending.is_empty() {
            self.trigger.trigger(token.clone());
        }

        Ok(token)
    }

    async fn fast_path(&self, token: &DeliveryToken, rows: &[QueueItem]) {
        let Some(item) = select_fast_path(rows) else {
            tracing::debug!(token = %token, rows = rows.len(), "No row qualifies for fast path");
            DELIVERY_FAST_PATH_TOTAL.with_label_values(&["none"]).inc();
            return;
        };

        let mut failures = HostFailures::new();
        match self
            .scheduler
            .attempt(item, &mut failures, Some(self.fast_path_timeout))
            .await
        {
            Ok(outcome) => {
                DELIVERY_FAST_PATH_TOTAL
                    .with_label_values(&[outcome.as_str()])
                    .inc();
                tracing::debug!(token = %token, item_id = item.id, ?outcome, "Fast path finished");
            }
            Err(e) => {
                DELIVERY_FAST_PATH_TOTAL.with_label_values(&["error"]).inc();
                tracing::warn!(token = %token, item_id = item.id, error = %e, "Fast path failed");
            }
        }
    }

    /// Every row of a token, in insertion order.
    pub async fn get_queue_status(&self, token: &DeliveryToken) -> Result<Vec<QueueItem>, AppError> {
        self.db.list_by_token(token, None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::FollowerRecord;
    use crate::federation::registry::MockFollowerDirectory;
    use chrono::Utc;

    fn row(id: i64, priority: Priority) -> QueueItem {
        QueueItem {
            id,
            token: DeliveryToken("T".to_string()),
            author: "https://local.example/users/alice".to_string(),
            activity: "{}".to_string(),
            instance: InstancePath::inbox(&format!("https://host{}.example/inbox", id), priority)
                .unwrap(),
            priority,
            status: QueueStatus::Standby,
            tries: 0,
            last: Utc::now(),
            created_at: Utc::now(),
        }
    }

    /// Reference rule for the ranked rows.
    fn expected(ranked: &[Priority]) -> bool {
        match ranked[0] {
            Priority::Top => true,
            Priority::High => ranked.len() == 1 || ranked[1] < Priority::High,
            Priority::Medium => ranked.len() == 1,
            Priority::Low => false,
        }
    }

    #[test]
    fn fast_path_selection_matches_tie_break_table() {
        let all = [Priority::Top, Priority::High, Priority::Medium, Priority::Low];

        let mut combinations: Vec<Vec<Priority>> = Vec::new();
        for a in all {
            combinations.push(vec![a]);
            for b in all {
                combinations.push(vec![a, b]);
                for c in all {
                    combinations.push(vec![a, b, c]);
                }
            }
        }
        assert_eq!(combinations.len(), 4 + 16 + 64);

        for priorities in combinations {
            let rows: Vec<QueueItem> = priorities
                .iter()
                .enumerate()
                .map(|(i, p)| row(i as i64 + 1, *p))
                .collect();

            let mut ranked = priorities.clone();
            ranked.sort_by(|a, b| b.cmp(a));

            let selected = select_fast_path(&rows);
            assert_eq!(selected.is_some(), expected(&ranked), "rows={priorities:?}");
            if let Some(selected) = selected {
                assert_eq!(selected.priority, ranked[0], "rows={priorities:?}");
            }
        }
    }

    #[test]
    fn fast_path_prefers_earliest_row_among_equals() {
        let rows = vec![row(3, Priority::Medium), row(1, Priority::Top), row(2, Priority::Top)];
        assert_eq!(select_fast_path(&rows).map(|r| r.id), Some(1));
    }

    #[test]
    fn fast_path_ignores_rows_that_are_not_standby() {
        let mut done = row(1, Priority::Top);
        done.status = QueueStatus::Success;
        let rows = vec![done, row(2, Priority::Low)];
        assert!(select_fast_path(&rows).is_none());
        assert!(select_fast_path(&[]).is_none());
    }

    fn follower(uri: &str, inbox: &str, shared: Option<&str>) -> FollowerRecord {
        FollowerRecord {
            follow_id: "https://local.example/users/alice/followers".to_string(),
            follower_uri: uri.to_string(),
            inbox_uri: inbox.to_string(),
            shared_inbox_uri: shared.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn followers_on_two_hosts_collapse_to_two_global_targets() {
        let mut directory = MockFollowerDirectory::new();
        directory.expect_get_followers_by_follow_id().returning(|_| {
            Ok(vec![
                follower("https://a.example/u/1", "https://a.example/u/1/inbox", Some("https://a.example/inbox")),
                follower("https://a.example/u/2", "https://a.example/u/2/inbox", Some("https://a.example/inbox")),
                follower("https://a.example/u/3", "https://a.example/u/3/inbox", Some("https://a.example/inbox")),
                follower("https://b.example/u/4", "https://b.example/u/4/inbox", Some("https://b.example/inbox")),
                follower("https://b.example/u/5", "https://b.example/u/5/inbox", Some("https://b.example/inbox")),
            ])
        });

        let targets = vec![
            InstancePath::followers("https://local.example/users/alice/followers", Priority::High)
                .unwrap(),
        ];
        let resolved = resolve_targets(&directory, &targets).await.unwrap();

        assert_eq!(resolved.len(), 2);
        assert!(resolved.iter().all(|p| p.path_type == PathType::Global));
        assert!(resolved.iter().all(|p| p.priority == Priority::High));
        assert_eq!(resolved[0].uri, "https://a.example/inbox");
        assert_eq!(resolved[1].uri, "https://b.example/inbox");
    }

    #[tokio::test]
    async fn followers_without_shared_inbox_keep_personal_inbox() {
        let mut directory = MockFollowerDirectory::new();
        directory.expect_get_followers_by_follow_id().returning(|_| {
            Ok(vec![follower(
                "https://solo.example/users/carol",
                "https://solo.example/users/carol/inbox",
                None,
            )])
        });

        let targets = vec![
            InstancePath::followers("https://local.example/users/alice/followers", Priority::Medium)
                .unwrap(),
        ];
        let resolved = resolve_targets(&directory, &targets).await.unwrap();

        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].path_type, PathType::Inbox);
        assert_eq!(resolved[0].priority, Priority::Medium);
    }

    #[tokio::test]
    async fn non_follower_targets_pass_through_and_empty_collections_add_nothing() {
        let mut directory = MockFollowerDirectory::new();
        directory
            .expect_get_followers_by_follow_id()
            .returning(|_| Ok(Vec::new()));

        let inbox = InstancePath::inbox("https://remote.example/users/bob/inbox", Priority::Top)
            .unwrap();
        let targets = vec![
            inbox.clone(),
            InstancePath::followers("https://local.example/users/alice/followers", Priority::High)
                .unwrap(),
        ];
        let resolved = resolve_targets(&directory, &targets).await.unwrap();

        assert_eq!(resolved, vec![inbox]);
    }

    #[tokio::test]
    async fn declared_shared_inbox_is_not_duplicated_by_followers() {
        let mut directory = MockFollowerDirectory::new();
        directory.expect_get_followers_by_follow_id().returning(|_| {
            Ok(vec![
                follower("https://a.example/u/1", "https://a.example/u/1/inbox", Some("https://a.example/inbox")),
                follower("https://b.example/u/2", "https://b.example/u/2/inbox", Some("https://b.example/inbox")),
            ])
        });

        let declared = InstancePath::global("https://a.example/inbox", Priority::Top).unwrap();
        let targets = vec![
            declared.clone(),
            InstancePath::followers("https://local.example/users/alice/followers", Priority::High)
                .unwrap(),
        ];
        let resolved = resolve_targets(&directory, &targets).await.unwrap();

        assert_eq!(resolved.len(), 2);
        assert_eq!(resolved[0], declared);
        assert_eq!(resolved[1].uri, "https://b.example/inbox");
        assert_eq!(resolved[1].priority, Priority::High);
    }
}
