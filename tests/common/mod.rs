//! Common test utilities for E2E tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use chrono::Utc;
use fedicourier::data::{FollowerRecord, LocalActor};
use fedicourier::error::AppError;
use fedicourier::federation::{HttpTransport, KeyResolver};
use fedicourier::{AppState, config};
use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::sync::mpsc::UnboundedReceiver;

pub const TEST_DOMAIN: &str = "test.example.com";

/// Public keys served from memory; the production cache refuses loopback hosts.
#[derive(Default)]
pub struct StaticKeyResolver {
    keys: std::sync::Mutex<HashMap<String, String>>,
}

impl StaticKeyResolver {
    pub fn insert(&self, actor_uri: &str, public_key_pem: &str) {
        self.keys
            .lock()
            .unwrap()
            .insert(actor_uri.to_string(), public_key_pem.to_string());
    }
}

#[async_trait]
impl KeyResolver for StaticKeyResolver {
    async fn get_public_key(&self, actor_uri: &str) -> Result<String, AppError> {
        self.keys
            .lock()
            .unwrap()
            .get(actor_uri)
            .cloned()
            .ok_or(AppError::NotFound)
    }
}

/// Generate an RSA key pair as (PKCS#8 private PEM, SPKI public PEM).
pub fn generate_keypair() -> (String, String) {
    let mut rng = rand::thread_rng();
    let private_key = RsaPrivateKey::new(&mut rng, 1024).unwrap();
    let public_key = RsaPublicKey::from(&private_key);

    let private_pem = private_key
        .to_pkcs8_pem(LineEnding::LF)
        .unwrap()
        .to_string();
    let public_pem = public_key.to_public_key_pem(LineEnding::LF).unwrap();
    (private_pem, public_pem)
}

pub fn test_config(db_path: std::path::PathBuf, api_token: Option<&str>) -> config::AppConfig {
    config::AppConfig {
        server: config::ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0, // Let OS assign port
            domain: TEST_DOMAIN.to_string(),
            protocol: "https".to_string(),
            api_token: api_token.map(str::to_string),
        },
        database: config::DatabaseConfig { path: db_path },
        delivery: config::DeliveryConfig {
            connect_timeout_secs: 2,
            timeout_secs: 5,
            fast_path_timeout_secs: 2,
            workers: 2,
            sweep_interval_secs: 3600,
            stale_running_secs: 300,
            user_agent: "FediCourier-Test".to_string(),
        },
        federation: config::FederationConfig::default(),
        logging: config::LoggingConfig {
            level: "info".to_string(),
            format: "pretty".to_string(),
        },
    }
}

/// Test server instance
pub struct TestServer {
    pub addr: String,
    pub state: AppState,
    pub keys: Arc<StaticKeyResolver>,
    pub client: reqwest::Client,
    pub _temp_dir: TempDir,
    /// Held so triggers succeed while no worker drains the channel
    _jobs: Option<UnboundedReceiver<fedicourier::federation::DeliveryJob>>,
}

impl TestServer {
    /// Server without background workers: queued rows only move when a
    /// test drives the scheduler.
    pub async fn new() -> Self {
        Self::build(None, false).await
    }

    pub async fn with_api_token(token: &str) -> Self {
        Self::build(Some(token), false).await
    }

    /// Server with the worker pool running.
    pub async fn with_workers() -> Self {
        Self::build(None, true).await
    }

    async fn build(api_token: Option<&str>, workers: bool) -> Self {
        // Create temporary directory for test database
        let temp_dir = TempDir::new().unwrap();
        let config = test_config(temp_dir.path().join("test.db"), api_token);

        let keys = Arc::new(StaticKeyResolver::default());
        let transport = HttpTransport::new(&config.delivery).unwrap();
        let (state, jobs) = AppState::with_key_resolver(config, transport, keys.clone())
            .await
            .unwrap();

        let jobs = if workers {
            state.start_background_tasks(jobs);
            None
        } else {
            Some(jobs)
        };

        // Create HTTP client
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .unwrap();

        // Bind to random port
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let app = fedicourier::build_router(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr: format!("http://{}", addr),
            state,
            keys,
            client,
            _temp_dir: temp_dir,
            _jobs: jobs,
        }
    }

    /// Get base URL for API requests
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.addr, path)
    }

    pub fn actor_uri(&self, username: &str) -> String {
        format!("https://{}/users/{}", TEST_DOMAIN, username)
    }

    /// Create a local actor with a fresh key pair
    pub async fn create_local_actor(&self, username: &str) -> LocalActor {
        let (private_key_pem, public_key_pem) = generate_keypair();
        let actor = LocalActor {
            uri: self.actor_uri(username),
            private_key_pem,
            public_key_pem,
            created_at: Utc::now(),
        };
        self.state.db.upsert_local_actor(&actor).await.unwrap();
        actor
    }

    /// Add an accepted follower to a followers collection
    pub async fn add_follower(
        &self,
        followers_uri: &str,
        follower_uri: &str,
        inbox_uri: &str,
        shared_inbox_uri: Option<&str>,
    ) {
        let record = FollowerRecord {
            follow_id: followers_uri.to_string(),
            follower_uri: follower_uri.to_string(),
            inbox_uri: inbox_uri.to_string(),
            shared_inbox_uri: shared_inbox_uri.map(str::to_string),
        };
        self.state.db.insert_follower(&record).await.unwrap();
        assert!(
            self.state
                .db
                .accept_follower(followers_uri, follower_uri)
                .await
                .unwrap()
        );
    }
}

/// A delivery received by a fake remote inbox
#[derive(Debug, Clone)]
pub struct ReceivedDelivery {
    pub path: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Clone)]
struct InboxState {
    status: StatusCode,
    received: Arc<Mutex<Vec<ReceivedDelivery>>>,
}

/// Fake remote server answering every inbox POST with a fixed status
pub struct FakeInbox {
    pub base: String,
    received: Arc<Mutex<Vec<ReceivedDelivery>>>,
}

impl FakeInbox {
    pub async fn start(status: StatusCode) -> Self {
        let received = Arc::new(Mutex::new(Vec::new()));
        let state = InboxState {
            status,
            received: received.clone(),
        };

        let app = Router::new()
            .route("/inbox", post(record_delivery))
            .route("/users/:name/inbox", post(record_delivery))
            .with_state(state);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base: format!("http://{}", addr),
            received,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    pub async fn received(&self) -> Vec<ReceivedDelivery> {
        self.received.lock().await.clone()
    }
}

async fn record_delivery(
    State(state): State<InboxState>,
    uri: axum::http::Uri,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    state.received.lock().await.push(ReceivedDelivery {
        path: uri.path().to_string(),
        headers,
        body,
    });
    state.status
}

/// Poll `check` until it returns true or two seconds pass.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..40 {
        if check().await {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
    false
}
