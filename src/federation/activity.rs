//! Outbound activities
//!
//! An `OutboundActivity` is what the dispatcher delivers: the JSON-LD payload,
//! its author and the declared delivery targets. `ActivityFactory` builds the
//! common activity kinds with their default delivery priorities.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::instance::{InstancePath, Priority};
use crate::error::AppError;

pub const PUBLIC_AUDIENCE: &str = "https://www.w3.org/ns/activitystreams#Public";

/// ActivityPub Activity types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityType {
    Create,
    Update,
    Delete,
    Follow,
    Accept,
    Reject,
    Undo,
    Like,
    Announce,
    Block,
}

impl FromStr for ActivityType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Create" => Ok(Self::Create),
            "Update" => Ok(Self::Update),
            "Delete" => Ok(Self::Delete),
            "Follow" => Ok(Self::Follow),
            "Accept" => Ok(Self::Accept),
            "Reject" => Ok(Self::Reject),
            "Undo" => Ok(Self::Undo),
            "Like" => Ok(Self::Like),
            "Announce" => Ok(Self::Announce),
            "Block" => Ok(Self::Block),
            other => Err(AppError::Validation(format!(
                "Unsupported activity type: {}",
                other
            ))),
        }
    }
}

/// An activity ready to hand to the dispatcher
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundActivity {
    /// Activity id (`payload["id"]`)
    pub id: String,
    /// Local actor URI; selects the signing key
    pub author: String,
    pub payload: Value,
    /// Declared targets; FOLLOWERS paths are expanded at dispatch time
    pub targets: Vec<InstancePath>,
}

impl OutboundActivity {
    /// Wrap a caller-built payload.
    ///
    /// # Errors
    /// `AppError::Validation` if the payload has no string `id`.
    pub fn from_payload(
        author: &str,
        payload: Value,
        targets: Vec<InstancePath>,
    ) -> Result<Self, AppError> {
        let id = payload
            .get("id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| AppError::Validation("Activity payload has no id".to_string()))?
            .to_string();

        Ok(Self {
            id,
            author: author.to_string(),
            payload,
            targets,
        })
    }

    /// `type` of the payload, when it is a known activity.
    pub fn activity_type(&self) -> Option<ActivityType> {
        self.payload
            .get("type")
            .and_then(Value::as_str)
            .and_then(|t| t.parse().ok())
    }
}

/// Audience of a post
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Public,
    Unlisted,
    Private,
    Direct,
}

impl FromStr for Visibility {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "public" => Ok(Self::Public),
            "unlisted" => Ok(Self::Unlisted),
            "private" => Ok(Self::Private),
            "direct" => Ok(Self::Direct),
            other => Err(AppError::Validation(format!("Invalid visibility: {}", other))),
        }
    }
}

/// `to` / `cc` for a visibility.
pub fn audience_for_visibility(actor_uri: &str, visibility: Visibility) -> (Vec<String>, Vec<String>) {
    let public_audience = PUBLIC_AUDIENCE.to_string();
    let followers_audience = followers_uri(actor_uri);

    match visibility {
        Visibility::Public => (vec![public_audience], vec![followers_audience]),
        Visibility::Unlisted => (vec![followers_audience], vec![public_audience]),
        Visibility::Private => (vec![followers_audience], Vec::new()),
        Visibility::Direct => (Vec::new(), Vec::new()),
    }
}

/// Followers collection of a local actor.
pub fn followers_uri(actor_uri: &str) -> String {
    format!("{}/followers", actor_uri)
}

/// Builds outbound activities for one local actor.
#[derive(Debug, Clone)]
pub struct ActivityFactory {
    actor_uri: String,
}

impl ActivityFactory {
    pub fn new(actor_uri: impl Into<String>) -> Self {
        Self {
            actor_uri: actor_uri.into(),
        }
    }

    pub fn actor_uri(&self) -> &str {
        &self.actor_uri
    }

    fn next_id(&self, kind: &str) -> String {
        format!("{}/{}/{}", self.actor_uri, kind, ulid::Ulid::new())
    }

    fn followers_target(&self, priority: Priority) -> Result<InstancePath, AppError> {
        InstancePath::followers(&followers_uri(&self.actor_uri), priority)
    }

    fn wrap(&self, payload: Value, targets: Vec<InstancePath>) -> Result<OutboundActivity, AppError> {
        OutboundActivity::from_payload(&self.actor_uri, payload, targets)
    }

    /// Follow a remote actor; delivered straight to their inbox.
    pub fn follow(&self, target_actor: &str, target_inbox: &str) -> Result<OutboundActivity, AppError> {
        let payload = builder::follow(&self.next_id("follow"), &self.actor_uri, target_actor);
        self.wrap(payload, vec![InstancePath::inbox(target_inbox, Priority::Top)?])
    }

    /// Accept a received Follow.
    pub fn accept(
        &self,
        follow_id: &str,
        follower_actor: &str,
        follower_inbox: &str,
    ) -> Result<OutboundActivity, AppError> {
        let payload = builder::accept(
            &self.next_id("accept"),
            &self.actor_uri,
            serde_json::json!({
                "type": "Follow",
                "id": follow_id,
                "actor": follower_actor,
                "object": self.actor_uri,
            }),
        );
        self.wrap(payload, vec![InstancePath::inbox(follower_inbox, Priority::Top)?])
    }

    /// Like a remote object; delivered to its author's inbox.
    pub fn like(&self, object_uri: &str, author_inbox: &str) -> Result<OutboundActivity, AppError> {
        let payload = builder::like(&self.next_id("like"), &self.actor_uri, object_uri);
        self.wrap(payload, vec![InstancePath::inbox(author_inbox, Priority::Top)?])
    }

    /// Publish a note.
    ///
    /// Non-direct notes go to the followers collection; every mentioned
    /// inbox is added as its own target.
    pub fn create_note(
        &self,
        content: &str,
        visibility: Visibility,
        in_reply_to: Option<&str>,
        mention_inboxes: &[&str],
    ) -> Result<OutboundActivity, AppError> {
        let (to, cc) = audience_for_visibility(&self.actor_uri, visibility);
        let to: Vec<&str> = to.iter().map(String::as_str).collect();
        let cc: Vec<&str> = cc.iter().map(String::as_str).collect();
        let published = chrono::Utc::now().to_rfc3339();
        let note_id = self.next_id("notes");

        let note = match in_reply_to {
            Some(in_reply_to) => builder::note_reply(
                &note_id,
                &self.actor_uri,
                content,
                &published,
                in_reply_to,
                to.clone(),
                cc.clone(),
            ),
            None => builder::note(&note_id, &self.actor_uri, content, &published, to.clone(), cc.clone()),
        };
        let payload = builder::create(&self.next_id("create"), &self.actor_uri, note, to, cc);

        let mut targets = Vec::new();
        if visibility != Visibility::Direct {
            targets.push(self.followers_target(Priority::High)?);
        }
        for inbox in mention_inboxes {
            targets.push(InstancePath::inbox(inbox, Priority::High)?);
        }
        self.wrap(payload, targets)
    }

    /// Boost an object to followers, notifying its author when known.
    pub fn announce(
        &self,
        object_uri: &str,
        visibility: Visibility,
        author_inbox: Option<&str>,
    ) -> Result<OutboundActivity, AppError> {
        let (to, cc) = audience_for_visibility(&self.actor_uri, visibility);
        let payload = builder::announce(
            &self.next_id("announce"),
            &self.actor_uri,
            object_uri,
            to.iter().map(String::as_str).collect(),
            cc.iter().map(String::as_str).collect(),
        );

        let mut targets = vec![self.followers_target(Priority::High)?];
        if let Some(inbox) = author_inbox {
            targets.push(InstancePath::inbox(inbox, Priority::High)?);
        }
        self.wrap(payload, targets)
    }

    /// Undo an earlier activity.
    ///
    /// With an inbox the Undo goes there (unfollow, unlike); otherwise to
    /// followers (unboost).
    pub fn undo(
        &self,
        activity_id: &str,
        activity_type: ActivityType,
        activity_object: Option<&str>,
        inbox: Option<&str>,
    ) -> Result<OutboundActivity, AppError> {
        let object = builder::undo_object(activity_id, activity_type, activity_object);
        let payload = builder::undo(&self.next_id("undo"), &self.actor_uri, object);

        let target = match inbox {
            Some(inbox) => InstancePath::inbox(inbox, Priority::Medium)?,
            None => self.followers_target(Priority::Medium)?,
        };
        self.wrap(payload, vec![target])
    }

    /// Delete a local object.
    pub fn delete(&self, object_uri: &str, visibility: Visibility) -> Result<OutboundActivity, AppError> {
        let (to, cc) = audience_for_visibility(&self.actor_uri, visibility);
        let payload = builder::delete(
            &self.next_id("delete"),
            &self.actor_uri,
            object_uri,
            to.iter().map(String::as_str).collect(),
            cc.iter().map(String::as_str).collect(),
        );
        self.wrap(payload, vec![self.followers_target(Priority::Medium)?])
    }
}

/// Build ActivityPub activity JSON
pub mod builder {
    use serde_json::Value;

    use super::ActivityType;

    const CONTEXT: &str = "https://www.w3.org/ns/activitystreams";

    fn activity(kind: &str, id: &str, actor: &str, object: Value) -> Value {
        serde_json::json!({
            "@context": CONTEXT,
            "type": kind,
            "id": id,
            "actor": actor,
            "object": object
        })
    }

    pub fn follow(id: &str, actor: &str, object: &str) -> Value {
        activity("Follow", id, actor, Value::from(object))
    }

    /// `object` is the original activity being accepted (usually a Follow).
    pub fn accept(id: &str, actor: &str, object: Value) -> Value {
        activity("Accept", id, actor, object)
    }

    pub fn like(id: &str, actor: &str, object: &str) -> Value {
        activity("Like", id, actor, Value::from(object))
    }

    pub fn undo(id: &str, actor: &str, object: Value) -> Value {
        activity("Undo", id, actor, object)
    }

    /// Reference to the activity being undone.
    pub fn undo_object(
        activity_id: &str,
        activity_type: ActivityType,
        activity_object: Option<&str>,
    ) -> Value {
        let mut object = serde_json::Map::new();
        object.insert("id".to_string(), serde_json::json!(activity_id));
        object.insert(
            "type".to_string(),
            serde_json::json!(format!("{:?}", activity_type)),
        );
        if let Some(activity_object) = activity_object {
            object.insert("object".to_string(), serde_json::json!(activity_object));
        }
        Value::Object(object)
    }

    /// Build a Create activity
    ///
    /// # Arguments
    /// * `object` - Object being created (usually a Note)
    /// * `to` - Primary recipients
    /// * `cc` - CC recipients
    pub fn create(id: &str, actor: &str, object: Value, to: Vec<&str>, cc: Vec<&str>) -> Value {
        let mut value = activity("Create", id, actor, object);
        value["to"] = serde_json::json!(to);
        value["cc"] = serde_json::json!(cc);
        value["published"] = serde_json::json!(chrono::Utc::now().to_rfc3339());
        value
    }

    /// The deleted object is sent as a Tombstone.
    pub fn delete(id: &str, actor: &str, object: &str, to: Vec<&str>, cc: Vec<&str>) -> Value {
        let mut value = activity(
            "Delete",
            id,
            actor,
            serde_json::json!({ "type": "Tombstone", "id": object }),
        );
        value["to"] = serde_json::json!(to);
        value["cc"] = serde_json::json!(cc);
        value
    }

    pub fn announce(id: &str, actor: &str, object: &str, to: Vec<&str>, cc: Vec<&str>) -> Value {
        let mut value = activity("Announce", id, actor, Value::from(object));
        value["to"] = serde_json::json!(to);
        value["cc"] = serde_json::json!(cc);
        value["published"] = serde_json::json!(chrono::Utc::now().to_rfc3339());
        value
    }

    pub fn note(
        id: &str,
        attributed_to: &str,
        content: &str,
        published: &str,
        to: Vec<&str>,
        cc: Vec<&str>,
    ) -> Value {
        serde_json::json!({
            "type": "Note",
            "id": id,
            "attributedTo": attributed_to,
            "content": content,
            "published": published,
            "to": to,
            "cc": cc,
            "sensitive": false
        })
    }

    pub fn note_reply(
        id: &str,
        attributed_to: &str,
        content: &str,
        published: &str,
        in_reply_to: &str,
        to: Vec<&str>,
        cc: Vec<&str>,
    ) -> Value {
        let mut value = note(id, attributed_to, content, published, to, cc);
        value["inReplyTo"] = serde_json::json!(in_reply_to);
        value
    }
}
