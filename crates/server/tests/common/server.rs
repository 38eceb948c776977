//! Server test utilities.

use super::fixtures::{sample_manifest, test_signing_pem};
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use otter_core::config::{AppConfig, MetadataConfig};
use otter_metadata::models::{EscalationRow, TokenRow};
use otter_metadata::{MetadataStore, SqliteStore};
use otter_server::auth::hash_token;
use otter_server::bootstrap::ensure_admin_token;
use otter_server::error::FleetResult;
use otter_server::notify::Notifier;
use otter_server::{AppState, MemoryBus, create_router};
use otter_signer::ManifestSigner;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use time::OffsetDateTime;
use tower::ServiceExt;
use uuid::Uuid;

/// Plaintext of the bootstrap admin token configured by `AdminConfig::for_testing`.
#[allow(dead_code)]
pub const ADMIN_TOKEN: &str = "test-admin-token";

/// Notifier that remembers every escalation it was handed.
#[derive(Default)]
pub struct RecordingNotifier {
    pub delivered: Mutex<Vec<EscalationRow>>,
}

#[allow(dead_code)]
impl RecordingNotifier {
    pub fn count(&self) -> usize {
        self.delivered.lock().expect("notifier lock").len()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, escalation: &EscalationRow) -> FleetResult<()> {
        self.delivered
            .lock()
            .expect("notifier lock")
            .push(escalation.clone());
        Ok(())
    }
}

/// A test server wrapper with all dependencies.
/// Note: #[allow(dead_code)] because each test file compiles common/ separately.
#[allow(dead_code)]
pub struct TestServer {
    pub router: axum::Router,
    pub state: AppState,
    pub bus: Arc<MemoryBus>,
    pub notifier: Arc<RecordingNotifier>,
    _temp_dir: TempDir,
}

#[allow(dead_code)]
impl TestServer {
    /// Create a test server with a signing key and default rollout settings.
    pub async fn new() -> Self {
        Self::build(true, |_| {}).await
    }

    /// Create a test server without a signing key.
    pub async fn without_signer() -> Self {
        Self::build(false, |_| {}).await
    }

    /// Create a test server with custom config modifications.
    pub async fn with_config<F>(modifier: F) -> Self
    where
        F: FnOnce(&mut AppConfig),
    {
        Self::build(true, modifier).await
    }

    async fn build<F>(with_signer: bool, modifier: F) -> Self
    where
        F: FnOnce(&mut AppConfig),
    {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");

        let db_path = temp_dir.path().join("fleet.db");
        let metadata: Arc<dyn MetadataStore> = Arc::new(
            SqliteStore::new(&db_path, None)
                .await
                .expect("Failed to create metadata store"),
        );

        let mut config = AppConfig::for_testing();
        config.metadata = MetadataConfig {
            path: db_path,
            query_timeout_secs: None,
        };
        config.server.public_url = "https://fleet.test".to_string();
        modifier(&mut config);

        ensure_admin_token(metadata.as_ref(), &config.admin)
            .await
            .expect("Failed to bootstrap admin token");

        let signer = with_signer.then(|| {
            ManifestSigner::from_pkcs8_pem("fleet-test", test_signing_pem())
                .expect("Failed to load test signing key")
        });

        let bus = Arc::new(MemoryBus::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let state = AppState::new(config, metadata, signer, bus.clone(), notifier.clone());
        let router = create_router(state.clone());

        Self {
            router,
            state,
            bus,
            notifier,
            _temp_dir: temp_dir,
        }
    }

    /// Get access to the underlying metadata.
    pub fn metadata(&self) -> Arc<dyn MetadataStore> {
        self.state.metadata.clone()
    }

    /// Send a JSON request and decode the JSON response (Null when empty).
    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        token: Option<&str>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string())),
            None => builder.body(Body::empty()),
        }
        .expect("Failed to build request");

        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("Router failed");
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("Failed to read body");
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
        };
        (status, value)
    }

    pub async fn admin(&self, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        self.request(method, uri, body, Some(ADMIN_TOKEN)).await
    }

    /// Insert a gateway-bound token and return its plaintext.
    pub async fn gateway_token(&self, gateway_id: &str) -> String {
        let secret = format!("gw-secret-{gateway_id}-{}", Uuid::new_v4().simple());
        let row = TokenRow {
            token_id: Uuid::new_v4(),
            gateway_id: Some(gateway_id.to_string()),
            token_hash: hash_token(&secret),
            scopes: r#"["fleet:gateway"]"#.to_string(),
            expires_at: None,
            revoked_at: None,
            created_at: OffsetDateTime::now_utc(),
            last_used_at: None,
            description: Some(format!("gateway {gateway_id}")),
        };
        self.metadata()
            .create_token(&row)
            .await
            .expect("Failed to create gateway token");
        secret
    }

    /// Create a draft manifest and return its id.
    pub async fn create_manifest(&self, version: &str) -> String {
        let (status, body) = self
            .admin(Method::POST, "/v1/manifests", Some(sample_manifest(version)))
            .await;
        assert_eq!(status, StatusCode::CREATED, "create manifest: {body}");
        body["manifest_id"]
            .as_str()
            .expect("manifest_id")
            .to_string()
    }

    /// Create, publish and promote a manifest to `staged`.
    pub async fn staged_manifest(&self, version: &str) -> String {
        let id = self.create_manifest(version).await;
        let (status, body) = self
            .admin(Method::POST, &format!("/v1/manifests/{id}/publish"), None)
            .await;
        assert_eq!(status, StatusCode::OK, "publish: {body}");
        let (status, body) = self
            .admin(
                Method::POST,
                &format!("/v1/manifests/{id}/promote"),
                Some(serde_json::json!({"status": "staged"})),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "promote: {body}");
        id
    }

    /// Roll a staged manifest out to every listed gateway.
    pub async fn rollout(&self, manifest_id: &str, targets: &[&str], percentage: u8) -> Value {
        let (status, body) = self
            .admin(
                Method::POST,
                &format!("/v1/manifests/{manifest_id}/rollout"),
                Some(serde_json::json!({"targets": targets, "percentage": percentage})),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "rollout: {body}");
        body
    }

    /// Poll `/updates/check` as a gateway.
    pub async fn check(&self, gateway_id: &str, token: &str, current_version: &str) -> (StatusCode, Value) {
        self.request(
            Method::GET,
            &format!("/updates/check?gateway_id={gateway_id}&current_version={current_version}"),
            None,
            Some(token),
        )
        .await
    }

    /// Report a progress step as a gateway.
    pub async fn progress(
        &self,
        gateway_id: &str,
        token: &str,
        update_id: &str,
        state: &str,
        percentage: u8,
    ) -> (StatusCode, Value) {
        self.request(
            Method::POST,
            "/updates/progress",
            Some(serde_json::json!({
                "gateway_id": gateway_id,
                "update_id": update_id,
                "state": state,
                "progress_percentage": percentage,
                "current_step": state,
                "log": format!("{state} step"),
            })),
            Some(token),
        )
        .await
    }

    /// Walk an update through every pre-apply step up to `applying`.
    pub async fn drive_to_applying(&self, gateway_id: &str, token: &str, update_id: &str) {
        for (state, pct) in [
            ("downloading", 10),
            ("verifying", 25),
            ("backing_up", 40),
            ("applying", 60),
        ] {
            let (status, body) = self.progress(gateway_id, token, update_id, state, pct).await;
            assert_eq!(status, StatusCode::OK, "{state}: {body}");
        }
    }
}
