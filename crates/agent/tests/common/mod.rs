//! Shared agent test harness: a scratch gateway layout, a signed artifact
//! server and scripted runtime/reporter doubles.

#![allow(dead_code)]

use async_trait::async_trait;
use httpmock::Method::GET;
use httpmock::MockServer;
use otter_agent::{Agent, AgentError, AgentResult, ApiClient, Reporter, ServiceRuntime};
use otter_core::config::AgentConfig;
use otter_core::{
    CommandKind, CommandMessage, FailureKind, GatewayId, ManifestDocument, ProgressMessage,
    UpdateId, UpdateState,
};
use otter_signer::ManifestSigner;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock};
use tempfile::TempDir;

pub const INSTALLED: &str = "1.4.0";
pub const DATASTORE_BEFORE: &str = "readings:v1";
pub const DATASTORE_AFTER: &str = "readings:v2";

pub fn can_bind_localhost() -> bool {
    TcpListener::bind("127.0.0.1:0").is_ok()
}

/// Small RSA signer, generated once per test binary.
pub fn signer() -> &'static ManifestSigner {
    static SIGNER: OnceLock<ManifestSigner> = OnceLock::new();
    SIGNER.get_or_init(|| ManifestSigner::generate("fleet-test", 1024).expect("keygen"))
}

/// A release touching every apply step, compatible with 1.0.0 through 1.5.0.
pub fn manifest(version: &str) -> ManifestDocument {
    serde_json::from_value(json!({
        "version": version,
        "description": "sensor pipeline release",
        "docker_images": {"api": format!("registry.local/api:{version}")},
        "config_changes": [
            {"file": "api/settings.json", "action": "json_merge", "content": {"log_level": "info"}}
        ],
        "migrations": ["sqlite3 app.db 'ALTER TABLE readings ADD unit TEXT'"],
        "rollback_commands": ["docker-compose exec api migrate --down"],
        "min_gateway_version": "1.0.0",
        "max_gateway_version": "1.5.0",
        "rollback_safe": true
    }))
    .expect("valid manifest")
}

/// Service runtime double. Records every call; the `api` service state is
/// scripted per health check (the last entry repeats).
pub struct MockRuntime {
    calls: Mutex<Vec<String>>,
    api_states: Mutex<Vec<&'static str>>,
    failing_program: Mutex<Option<String>>,
    datastore: PathBuf,
}

impl MockRuntime {
    pub fn new(datastore: PathBuf) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            api_states: Mutex::new(vec!["running"]),
            failing_program: Mutex::new(None),
            datastore,
        }
    }

    pub fn script_api_states(&self, states: &[&'static str]) {
        *self.api_states.lock().unwrap() = states.to_vec();
    }

    pub fn fail_program(&self, program: &str) {
        *self.failing_program.lock().unwrap() = Some(program.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl ServiceRuntime for MockRuntime {
    async fn pull(&self, image: &str) -> AgentResult<()> {
        self.record(format!("pull {image}"));
        Ok(())
    }

    async fn stop(&self) -> AgentResult<()> {
        self.record("stop".to_string());
        Ok(())
    }

    async fn start(&self) -> AgentResult<()> {
        self.record("start".to_string());
        Ok(())
    }

    async fn service_states(&self) -> AgentResult<BTreeMap<String, String>> {
        self.record("states".to_string());
        let mut script = self.api_states.lock().unwrap();
        let state = if script.len() > 1 {
            script.remove(0)
        } else {
            script.first().copied().unwrap_or("running")
        };
        Ok(BTreeMap::from([("api".to_string(), state.to_string())]))
    }

    async fn exec(&self, program: &str, args: &[String]) -> AgentResult<()> {
        self.record(format!("exec {program} {}", args.join(" ")));
        if self.failing_program.lock().unwrap().as_deref() == Some(program) {
            return Err(AgentError::Runtime(format!("{program} exited with status 1")));
        }
        // Migrations rewrite the datastore so restores can be observed.
        if program == "sqlite3" {
            std::fs::write(&self.datastore, DATASTORE_AFTER)?;
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingReporter {
    pub progress: Mutex<Vec<ProgressMessage>>,
    pub successes: Mutex<Vec<(String, Option<String>)>>,
    pub failures: Mutex<Vec<(String, FailureKind, String)>>,
}

impl RecordingReporter {
    pub fn states(&self) -> Vec<UpdateState> {
        self.progress.lock().unwrap().iter().map(|m| m.state).collect()
    }

    pub fn failure_kinds(&self) -> Vec<FailureKind> {
        self.failures.lock().unwrap().iter().map(|f| f.1).collect()
    }

    pub fn success_logs(&self) -> Vec<String> {
        self.successes
            .lock()
            .unwrap()
            .iter()
            .map(|s| s.1.clone().unwrap_or_default())
            .collect()
    }
}

#[async_trait]
impl Reporter for RecordingReporter {
    async fn progress(&self, message: &ProgressMessage) {
        self.progress.lock().unwrap().push(message.clone());
    }

    async fn success(&self, version: &str, _update_id: Option<UpdateId>, log: Option<String>) {
        self.successes
            .lock()
            .unwrap()
            .push((version.to_string(), log));
    }

    async fn failure(&self, version: &str, _update_id: Option<UpdateId>, error: &AgentError) {
        self.failures.lock().unwrap().push((
            version.to_string(),
            error.failure_kind(),
            error.to_string(),
        ));
    }
}

/// A scratch gateway at version [`INSTALLED`] plus an artifact server.
pub struct Harness {
    pub temp: TempDir,
    pub config: AgentConfig,
    pub server: MockServer,
    pub runtime: Arc<MockRuntime>,
    pub reporter: Arc<RecordingReporter>,
}

impl Harness {
    pub async fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let server = MockServer::start_async().await;

        let mut config = AgentConfig::for_testing(temp.path());
        config.api_url = server.base_url();
        config.health.required_services = vec!["api".to_string()];

        std::fs::write(
            &config.compose_file,
            serde_json::to_vec_pretty(&json!({
                "services": {
                    "api": {"image": format!("registry.local/api:{INSTALLED}"), "restart": "always"}
                }
            }))
            .unwrap(),
        )
        .unwrap();
        std::fs::create_dir_all(config.config_root.join("api")).unwrap();
        std::fs::write(
            config.config_root.join("api/settings.json"),
            r#"{"log_level":"debug"}"#,
        )
        .unwrap();
        std::fs::create_dir_all(config.datastore_path.parent().unwrap()).unwrap();
        std::fs::write(&config.datastore_path, DATASTORE_BEFORE).unwrap();
        std::fs::write(
            &config.public_key_path,
            signer().public_key().to_pem().unwrap(),
        )
        .unwrap();

        let harness = Self {
            runtime: Arc::new(MockRuntime::new(config.datastore_path.clone())),
            reporter: Arc::new(RecordingReporter::default()),
            temp,
            config,
            server,
        };
        harness.set_installed(INSTALLED);
        harness
    }

    pub fn set_installed(&self, version: &str) {
        std::fs::create_dir_all(&self.config.state_dir).unwrap();
        std::fs::write(self.config.version_file(), format!("{version}\n")).unwrap();
    }

    pub fn installed(&self) -> String {
        std::fs::read_to_string(self.config.version_file())
            .unwrap()
            .trim()
            .to_string()
    }

    pub fn api_image(&self) -> String {
        let doc: Value =
            serde_json::from_slice(&std::fs::read(&self.config.compose_file).unwrap()).unwrap();
        doc["services"]["api"]["image"].as_str().unwrap().to_string()
    }

    pub fn settings(&self) -> Value {
        serde_json::from_slice(
            &std::fs::read(self.config.config_root.join("api/settings.json")).unwrap(),
        )
        .unwrap()
    }

    pub fn datastore(&self) -> String {
        std::fs::read_to_string(&self.config.datastore_path).unwrap()
    }

    pub fn agent(&self) -> Agent {
        let client = ApiClient::new(
            &self.config.api_url,
            None,
            GatewayId::parse(&self.config.gateway_id).unwrap(),
            self.config.download.clone(),
        )
        .unwrap();
        let public_key = otter_signer::PublicKey::load(&self.config.public_key_path).unwrap();
        Agent::new(
            self.config.clone(),
            client,
            public_key,
            self.runtime.clone(),
            self.reporter.clone(),
        )
    }

    /// Serve a signed manifest and return the update command for it.
    pub async fn publish(&self, document: &ManifestDocument) -> CommandMessage {
        let bytes = document.to_json().unwrap();
        let signature = signer().sign_hex(&bytes).unwrap();
        self.serve(&document.version, bytes, signature).await
    }

    /// Serve a manifest whose bytes differ from the signed ones by one byte.
    pub async fn publish_tampered(&self, document: &ManifestDocument) -> CommandMessage {
        let bytes = document.to_json().unwrap();
        let signature = signer().sign_hex(&bytes).unwrap();
        let mut tampered = bytes.clone();
        let at = tampered
            .windows(b"sensor".len())
            .position(|w| w == b"sensor")
            .unwrap();
        tampered[at] = b'S';
        self.serve(&document.version, tampered, signature).await
    }

    async fn serve(&self, version: &str, manifest: Vec<u8>, signature: String) -> CommandMessage {
        let manifest_path = format!("/artifacts/{version}/manifest.json");
        let signature_path = format!("/artifacts/{version}/manifest.sig");
        self.server
            .mock_async(|when, then| {
                when.method(GET).path(manifest_path.clone());
                then.status(200).body(manifest.clone());
            })
            .await;
        self.server
            .mock_async(|when, then| {
                when.method(GET).path(signature_path.clone());
                then.status(200).body(signature.clone());
            })
            .await;

        CommandMessage {
            command: CommandKind::Update,
            version: version.to_string(),
            manifest_url: self.server.url(&manifest_path),
            signature_url: self.server.url(&signature_path),
            update_id: UpdateId::new(),
        }
    }

    pub fn bundle_names(&self) -> Vec<String> {
        otter_agent::BackupStore::new(&self.config).list().unwrap()
    }
}
