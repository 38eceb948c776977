//! Fleet control plane binary.

use anyhow::{Context, Result};
use clap::Parser;
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use otter_core::config::{AppConfig, PrivateKeyConfig, SigningConfig};
use otter_server::background::{spawn_progress_listener, spawn_sweeper};
use otter_server::bootstrap::ensure_admin_token;
use otter_server::bus::{Bus, DEFAULT_BUS_CAPACITY, MemoryBus};
use otter_server::{AppState, create_router};
use otter_signer::ManifestSigner;
use otter_signer::key::DEFAULT_KEY_BITS;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Otter - fleet update control plane
#[derive(Parser, Debug)]
#[command(name = "otterd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "OTTER_CONFIG", default_value = "config/server.toml")]
    config: String,
}

/// Merge the optional config file with `OTTER_` environment overrides.
fn load_config(path: &str) -> Result<AppConfig> {
    let mut figment = Figment::new();
    let has_config_file = std::path::Path::new(path).exists();
    if has_config_file {
        tracing::info!(config_path = %path, "Loading configuration from file");
        figment = figment.merge(Toml::file(path));
    } else {
        tracing::debug!("No config file found at {}", path);
    }

    let has_env_config =
        std::env::vars().any(|(key, _)| key.starts_with("OTTER_") && key != "OTTER_CONFIG");
    if !has_config_file && !has_env_config {
        anyhow::bail!(
            "No configuration provided.\n\n\
             Provide configuration via one of:\n  \
             1. Config file: otterd --config /path/to/server.toml\n  \
             2. Environment variables: OTTER_SERVER__BIND=0.0.0.0:8080 \
             OTTER_ADMIN__TOKEN_HASH=sha256:YOUR_TOKEN_HASH_HERE otterd"
        );
    }

    let config: AppConfig = figment
        .merge(Env::prefixed("OTTER_").split("__"))
        .extract()
        .context("failed to load configuration")?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Otter v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&args.config)?;

    otter_server::metrics::register_metrics();

    let metadata = otter_metadata::from_config(&config.metadata)
        .await
        .context("failed to initialize metadata store")?;
    metadata
        .health_check()
        .await
        .context("metadata health check failed")?;
    tracing::info!("Metadata store initialized");

    ensure_admin_token(metadata.as_ref(), &config.admin).await?;

    let signer = match &config.signing {
        Some(signing) => Some(load_signer(signing).await?),
        None => None,
    };

    let notifier = otter_server::notify::from_config(&config.notify)
        .context("failed to initialize escalation notifier")?;
    let bus: Arc<dyn Bus> = Arc::new(MemoryBus::new(DEFAULT_BUS_CAPACITY));

    let state = AppState::new(config.clone(), metadata, signer, bus, notifier);

    let _sweeper = spawn_sweeper(state.clone());
    let _listener = spawn_progress_listener(state.clone())?;

    let app = create_router(state);
    let addr: SocketAddr = config.server.bind.parse().context("invalid bind address")?;
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind to {}", addr))?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn parse_pem(config: &SigningConfig, pem: &str) -> Result<ManifestSigner> {
    ManifestSigner::from_pkcs8_pem(config.key_id.clone(), pem)
        .context("failed to parse signing key")
}

/// Load the manifest signer from configuration.
async fn load_signer(config: &SigningConfig) -> Result<ManifestSigner> {
    let signer = match &config.private_key {
        PrivateKeyConfig::File { path } => {
            let pem = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("failed to read key file: {}", path.display()))?;
            parse_pem(config, &pem)?
        }
        PrivateKeyConfig::Env { var } => {
            let pem = std::env::var(var)
                .with_context(|| format!("signing key env var not set: {var}"))?;
            parse_pem(config, &pem)?
        }
        PrivateKeyConfig::Value { key } => {
            tracing::warn!("Using inline signing key (not recommended for production)");
            parse_pem(config, key)?
        }
        PrivateKeyConfig::Generate => {
            tracing::warn!("Generating ephemeral signing key (not suitable for production)");
            let key_id = config.key_id.clone();
            let signer = tokio::task::spawn_blocking(move || {
                ManifestSigner::generate(key_id, DEFAULT_KEY_BITS)
            })
            .await
            .context("key generation task failed")?
            .context("failed to generate signing key")?;
            let public_pem = signer
                .public_key()
                .to_pem()
                .context("failed to encode public key")?;
            tracing::info!("Public key for agents:\n{}", public_pem);
            signer
        }
    };

    tracing::info!(
        key_id = %signer.key_id(),
        fingerprint = %signer.public_key().fingerprint(),
        "Loaded signing key"
    );
    Ok(signer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use otter_signer::KeyPair;
    use tempfile::tempdir;

    fn test_key_pem() -> (String, String) {
        let keypair = KeyPair::generate("fleet-test", 1024).unwrap();
        let fingerprint = keypair.public.fingerprint();
        (keypair.secret.to_pkcs8_pem().unwrap(), fingerprint)
    }

    #[tokio::test]
    async fn load_signer_from_file() {
        let (pem, fingerprint) = test_key_pem();
        let temp = tempdir().unwrap();
        let key_path = temp.path().join("signing.pem");
        tokio::fs::write(&key_path, pem).await.unwrap();

        let config = SigningConfig {
            key_id: "fleet-test".to_string(),
            private_key: PrivateKeyConfig::File { path: key_path },
        };

        let loaded = load_signer(&config).await.unwrap();
        assert_eq!(loaded.key_id(), "fleet-test");
        assert_eq!(loaded.public_key().fingerprint(), fingerprint);
    }

    #[tokio::test]
    async fn load_signer_from_value() {
        let (pem, fingerprint) = test_key_pem();
        let config = SigningConfig {
            key_id: "inline".to_string(),
            private_key: PrivateKeyConfig::Value { key: pem },
        };

        let loaded = load_signer(&config).await.unwrap();
        assert_eq!(loaded.key_id(), "inline");
        assert_eq!(loaded.public_key().fingerprint(), fingerprint);
    }

    #[tokio::test]
    async fn load_signer_from_env() {
        let (pem, _) = test_key_pem();
        let prev = std::env::var("OTTER_TEST_SIGNING_KEY").ok();
        // SAFETY: only this test touches this variable.
        unsafe { std::env::set_var("OTTER_TEST_SIGNING_KEY", &pem) };

        let config = SigningConfig {
            key_id: "from-env".to_string(),
            private_key: PrivateKeyConfig::Env {
                var: "OTTER_TEST_SIGNING_KEY".to_string(),
            },
        };
        let loaded = load_signer(&config).await.unwrap();
        assert_eq!(loaded.key_id(), "from-env");

        // SAFETY: only this test touches this variable.
        unsafe {
            match prev {
                Some(value) => std::env::set_var("OTTER_TEST_SIGNING_KEY", value),
                None => std::env::remove_var("OTTER_TEST_SIGNING_KEY"),
            }
        }
    }

    #[tokio::test]
    async fn load_signer_rejects_garbage() {
        let config = SigningConfig {
            key_id: "bad".to_string(),
            private_key: PrivateKeyConfig::Value {
                key: "not a pem".to_string(),
            },
        };
        assert!(load_signer(&config).await.is_err());
    }

    #[test]
    fn load_config_from_file() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("server.toml");
        std::fs::write(
            &path,
            r#"
[server]
bind = "127.0.0.1:9090"
public_url = "https://fleet.example.com"

[admin]
token_hash = "sha256:17d6bfe05d1b1fb7bc499f8e3f639c7b3eda4c40f321eef8887a0c04c89a99c5"

[rollout]
apply_timeout_secs = 600
"#,
        )
        .unwrap();

        let config = load_config(path.to_str().unwrap()).unwrap();
        assert_eq!(config.server.bind, "127.0.0.1:9090");
        assert_eq!(config.rollout.apply_timeout_secs, 600);
        assert!(config.signing.is_none());
    }
}
