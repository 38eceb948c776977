//! Test fixtures: manifest documents, gateway ids and hashing helpers.

use otter_core::{GatewayId, ManifestDocument};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use std::sync::OnceLock;

/// A valid, rollback-safe release compatible with agents 1.0.0 through 1.5.0.
#[allow(dead_code)]
pub fn sample_manifest(version: &str) -> Value {
    json!({
        "version": version,
        "description": "sensor pipeline release",
        "docker_images": {
            "api": format!("registry.local/api:{version}"),
            "worker": format!("registry.local/worker:{version}")
        },
        "config_changes": [
            {"file": "api/settings.json", "action": "json_merge", "content": {"log_level": "info"}}
        ],
        "migrations": ["sqlite3 app.db 'ALTER TABLE readings ADD unit TEXT'"],
        "min_gateway_version": "1.0.0",
        "max_gateway_version": "1.5.0",
        "critical": false,
        "rollback_safe": true,
        "requires_reboot": false
    })
}

#[allow(dead_code)]
pub fn sample_document(version: &str) -> ManifestDocument {
    serde_json::from_value(sample_manifest(version)).expect("sample manifest is valid")
}

#[allow(dead_code)]
pub fn gateway(id: &str) -> GatewayId {
    GatewayId::parse(id).expect("valid gateway id")
}

#[allow(dead_code)]
pub fn gateways(ids: &[&str]) -> Vec<GatewayId> {
    ids.iter().map(|id| gateway(id)).collect()
}

/// SHA-256 of data as lowercase hex.
#[allow(dead_code)]
pub fn sha256_hash(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// PKCS#8 PEM of a small RSA key, generated once per test binary.
#[allow(dead_code)]
pub fn test_signing_pem() -> &'static str {
    static PEM: OnceLock<String> = OnceLock::new();
    PEM.get_or_init(|| {
        let keypair = otter_signer::KeyPair::generate("fleet-test", 1024).expect("keygen");
        keypair.secret.to_pkcs8_pem().expect("encode key")
    })
}
