//! Delivery destinations
//!
//! An `InstancePath` is one concrete place an activity is sent to. An
//! `Instance` groups the paths that live on the same host so a batch of
//! deliveries can be handled host by host.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Kind of endpoint an `InstancePath` points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathType {
    /// A single actor's inbox
    Inbox,
    /// A followers collection; expanded into shared inboxes before enqueue
    Followers,
    /// A host-wide shared inbox produced by followers expansion
    Global,
    /// An actor's outbox
    Outbox,
}

impl PathType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inbox => "inbox",
            Self::Followers => "followers",
            Self::Global => "global",
            Self::Outbox => "outbox",
        }
    }
}

impl FromStr for PathType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inbox" => Ok(Self::Inbox),
            "followers" => Ok(Self::Followers),
            "global" | "shared_inbox" => Ok(Self::Global),
            "outbox" => Ok(Self::Outbox),
            other => Err(AppError::Validation(format!("Unknown path type: {}", other))),
        }
    }
}

/// Delivery priority class.
///
/// Variants are declared lowest first so the derived `Ord` gives
/// `Top > High > Medium > Low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
    Top,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Top => "top",
        }
    }
}

impl FromStr for Priority {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "top" => Ok(Self::Top),
            other => Err(AppError::Validation(format!("Unknown priority: {}", other))),
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One delivery destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstancePath {
    /// Full target URI
    pub uri: String,
    /// Host authority (`host` or `host:port`)
    pub address: String,
    /// Path and query component of `uri`
    pub path: String,
    #[serde(rename = "type")]
    pub path_type: PathType,
    pub priority: Priority,
}

impl InstancePath {
    /// Build a path from a target URI.
    ///
    /// # Errors
    /// Returns `AppError::Validation` for non-HTTP(S) or host-less URIs.
    pub fn new(uri: &str, path_type: PathType, priority: Priority) -> Result<Self, AppError> {
        let parsed = url::Url::parse(uri)
            .map_err(|e| AppError::Validation(format!("Invalid target URI {}: {}", uri, e)))?;

        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(AppError::Validation(format!(
                "Unsupported target URI scheme: {}",
                parsed.scheme()
            )));
        }

        let address = authority_of(&parsed)
            .ok_or_else(|| AppError::Validation(format!("Missing host in target URI {}", uri)))?;

        Ok(Self {
            uri: parsed.to_string(),
            address,
            path: path_and_query(&parsed),
            path_type,
            priority,
        })
    }

    pub fn inbox(uri: &str, priority: Priority) -> Result<Self, AppError> {
        Self::new(uri, PathType::Inbox, priority)
    }

    pub fn followers(uri: &str, priority: Priority) -> Result<Self, AppError> {
        Self::new(uri, PathType::Followers, priority)
    }

    pub fn global(uri: &str, priority: Priority) -> Result<Self, AppError> {
        Self::new(uri, PathType::Global, priority)
    }
}

/// Every path that targets the same host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    pub address: String,
    pub paths: Vec<InstancePath>,
}

impl Instance {
    /// Group paths by host, keeping first-seen host order and path order.
    pub fn group(paths: impl IntoIterator<Item = InstancePath>) -> Vec<Instance> {
        let mut instances: Vec<Instance> = Vec::new();

        for path in paths {
            match instances.iter_mut().find(|i| i.address == path.address) {
                Some(instance) => instance.paths.push(path),
                None => instances.push(Instance {
                    address: path.address.clone(),
                    paths: vec![path],
                }),
            }
        }

        instances
    }

    /// Highest priority among this host's paths.
    pub fn priority(&self) -> Option<Priority> {
        self.paths.iter().map(|p| p.priority).max()
    }
}

/// `host` or `host:port` when the port is not the scheme default.
pub(crate) fn authority_of(url: &url::Url) -> Option<String> {
    let host = url.host_str()?.to_ascii_lowercase();
    Some(match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host,
    })
}

pub(crate) fn path_and_query(url: &url::Url) -> String {
    match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_path_splits_address_and_path() {
        let path = InstancePath::inbox("https://Example.org/users/bob/inbox?x=1", Priority::Top)
            .expect("valid uri");
        assert_eq!(path.address, "example.org");
        assert_eq!(path.path, "/users/bob/inbox?x=1");
        assert_eq!(path.path_type, PathType::Inbox);
    }

    #[test]
    fn instance_path_keeps_explicit_port_in_address() {
        let path =
            InstancePath::global("http://127.0.0.1:8081/inbox", Priority::Low).expect("valid uri");
        assert_eq!(path.address, "127.0.0.1:8081");
        assert_eq!(path.path, "/inbox");
    }

    #[test]
    fn instance_path_rejects_non_http_scheme() {
        assert!(InstancePath::inbox("ftp://example.org/inbox", Priority::Low).is_err());
        assert!(InstancePath::inbox("not a url", Priority::Low).is_err());
    }

    #[test]
    fn priority_orders_top_first() {
        let mut priorities = vec![Priority::Low, Priority::Top, Priority::Medium, Priority::High];
        priorities.sort_by(|a, b| b.cmp(a));
        assert_eq!(
            priorities,
            vec![Priority::Top, Priority::High, Priority::Medium, Priority::Low]
        );
    }

    #[test]
    fn path_type_and_priority_round_trip_through_strings() {
        for path_type in [PathType::Inbox, PathType::Followers, PathType::Global, PathType::Outbox] {
            assert_eq!(path_type.as_str().parse::<PathType>().unwrap(), path_type);
        }
        assert_eq!("shared_inbox".parse::<PathType>().unwrap(), PathType::Global);
        assert!("top".parse::<Priority>().is_ok());
        assert!("urgent".parse::<Priority>().is_err());
    }

    #[test]
    fn instance_groups_paths_by_host() {
        let paths = vec![
            InstancePath::inbox("https://a.example/users/1/inbox", Priority::Low).unwrap(),
            InstancePath::inbox("https://b.example/inbox", Priority::High).unwrap(),
            InstancePath::inbox("https://a.example/users/2/inbox", Priority::Top).unwrap(),
        ];

        let instances = Instance::group(paths);
        assert_eq!(instances.len(), 2);
        assert_eq!(instances[0].address, "a.example");
        assert_eq!(instances[0].paths.len(), 2);
        assert_eq!(instances[0].priority(), Some(Priority::Top));
        assert_eq!(instances[1].address, "b.example");
    }
}
