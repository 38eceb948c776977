//! Edge update agent CLI.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use otter_agent::{
    Agent, AgentError, ApiClient, ChannelReporter, DockerCompose, Reporter, ServiceRuntime,
    version_file,
};
use otter_core::config::AgentConfig;
use otter_core::{CommandKind, GatewayId};
use otter_signer::PublicKey;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Exit code when the gateway is already at the requested version or no
/// update is offered.
const EXIT_NOTHING_TO_DO: u8 = 2;

#[derive(Parser)]
#[command(name = "otter-agent")]
#[command(about = "Fleet update agent")]
#[command(version)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct GlobalArgs {
    /// Agent config file path
    #[arg(long, global = true, env = "OTTER_AGENT_CONFIG")]
    config: Option<PathBuf>,

    /// Gateway id (overrides config)
    #[arg(long, global = true, env = "GATEWAY_ID")]
    gateway_id: Option<String>,

    /// Control plane URL (overrides config)
    #[arg(long, global = true, env = "API_URL")]
    api_url: Option<String>,

    /// Pinned manifest public key (overrides config)
    #[arg(long, global = true, env = "OTTER_PUBLIC_KEY")]
    public_key: Option<PathBuf>,

    /// Bearer token (overrides config)
    #[arg(long, global = true, env = "OTTER_AGENT_TOKEN", hide_env_values = true)]
    token: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Ask the control plane whether an update is available
    Check,
    /// Download, verify and apply the offered update
    Update {
        /// Only apply this version
        #[arg(long)]
        version: Option<String>,
        /// Re-apply even if already at the offered version
        #[arg(long, default_value_t = false)]
        force: bool,
    },
    /// Restore the latest local backup bundle
    Rollback,
    /// Poll for commands until interrupted
    Run,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let Cli { global, command } = Cli::parse();

    match run(global, command).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(global: GlobalArgs, command: Commands) -> Result<ExitCode> {
    let config = load_config(&global)?;

    match command {
        Commands::Check => handle_check(&config).await,
        Commands::Update { version, force } => {
            handle_update(&config, version.as_deref(), force).await
        }
        Commands::Rollback => handle_rollback(&config).await,
        Commands::Run => handle_run(&config).await,
    }
}

/// Merge the optional config file, `OTTER_AGENT_` env vars and CLI overrides.
fn load_config(global: &GlobalArgs) -> Result<AgentConfig> {
    let mut figment = Figment::new();
    if let Some(path) = &global.config {
        if !path.exists() {
            anyhow::bail!("config file {} does not exist", path.display());
        }
        tracing::debug!(config_path = %path.display(), "Loading configuration from file");
        figment = figment.merge(Toml::file(path));
    }

    let mut config: AgentConfig = figment
        .merge(Env::prefixed("OTTER_AGENT_").split("__").ignore(&["config"]))
        .extract()
        .context("failed to load agent configuration")?;

    if let Some(gateway_id) = &global.gateway_id {
        config.gateway_id = gateway_id.clone();
    }
    if let Some(api_url) = &global.api_url {
        config.api_url = api_url.clone();
    }
    if let Some(public_key) = &global.public_key {
        config.public_key_path = public_key.clone();
    }
    if let Some(token) = &global.token {
        config.token = Some(token.clone());
    }

    config
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;
    Ok(config)
}

fn api_client(config: &AgentConfig) -> Result<ApiClient> {
    let gateway_id = GatewayId::parse(&config.gateway_id)?;
    Ok(ApiClient::new(
        &config.api_url,
        config.token.as_deref(),
        gateway_id,
        config.download.clone(),
    )?)
}

fn build_agent(config: &AgentConfig) -> Result<Agent> {
    let client = api_client(config)?;
    let reporter: Arc<dyn Reporter> = Arc::new(client.clone());
    assemble_agent(config, client, reporter)
}

fn assemble_agent(
    config: &AgentConfig,
    client: ApiClient,
    reporter: Arc<dyn Reporter>,
) -> Result<Agent> {
    let public_key = load_public_key(&config.public_key_path)?;
    let runtime: Arc<dyn ServiceRuntime> = Arc::new(DockerCompose::new(
        config.compose_file.clone(),
        config.command_timeout(),
    ));
    Ok(Agent::new(
        config.clone(),
        client,
        public_key,
        runtime,
        reporter,
    ))
}

fn load_public_key(path: &Path) -> Result<PublicKey> {
    PublicKey::load(path)
        .with_context(|| format!("failed to load public key {}", path.display()))
}

async fn handle_check(config: &AgentConfig) -> Result<ExitCode> {
    let client = api_client(config)?;
    let current = version_file::read(&config.version_file(), &config.initial_version)?;

    match client.check(&current.to_string()).await? {
        None => println!("No update available (current version {current})"),
        Some(command) => match command.command {
            CommandKind::Update => println!(
                "Update available: {current} -> {} (update {})",
                command.version, command.update_id
            ),
            CommandKind::Rollback => println!(
                "Rollback requested for {} (update {})",
                command.version, command.update_id
            ),
        },
    }
    Ok(ExitCode::SUCCESS)
}

async fn handle_update(
    config: &AgentConfig,
    version: Option<&str>,
    force: bool,
) -> Result<ExitCode> {
    let agent = build_agent(config)?;
    let current = agent.current_version()?;

    let Some(command) = agent.check().await.context("update check failed")? else {
        if version.is_some_and(|v| v == current.to_string()) {
            println!("Already at version {current}");
        } else {
            println!("No update available (current version {current})");
        }
        return Ok(ExitCode::from(EXIT_NOTHING_TO_DO));
    };

    if command.command == CommandKind::Rollback {
        agent.handle(&command, force).await?;
        println!("Rolled back update {}", command.update_id);
        return Ok(ExitCode::SUCCESS);
    }

    if let Some(wanted) = version
        && wanted != command.version
    {
        anyhow::bail!(
            "version {wanted} requested but the control plane offers {}",
            command.version
        );
    }

    match agent.update(&command, force).await {
        Ok(outcome) => {
            println!(
                "Updated {} -> {} (backup {})",
                outcome.previous_version, outcome.version, outcome.bundle
            );
            if !outcome.skipped_commands.is_empty() {
                println!(
                    "Skipped {} disallowed command(s):",
                    outcome.skipped_commands.len()
                );
                for line in &outcome.skipped_commands {
                    println!("  {line}");
                }
            }
            if outcome.reboot_required {
                println!("A reboot is required to complete this update");
            }
            Ok(ExitCode::SUCCESS)
        }
        Err(AgentError::AlreadyCurrent(version)) => {
            println!("Already at version {version}");
            Ok(ExitCode::from(EXIT_NOTHING_TO_DO))
        }
        Err(e) => Err(e.into()),
    }
}

async fn handle_rollback(config: &AgentConfig) -> Result<ExitCode> {
    let agent = build_agent(config)?;
    let bundle = agent
        .rollback_latest()
        .await
        .context("rollback failed")?;
    println!(
        "Restored {} from backup {}",
        bundle.metadata.version,
        bundle.name()
    );
    Ok(ExitCode::SUCCESS)
}

async fn handle_run(config: &AgentConfig) -> Result<ExitCode> {
    let client = api_client(config)?;
    let live = Arc::new(ChannelReporter::new(client.clone()));
    let agent = assemble_agent(config, client, live.clone())?;
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
    };
    let channel = config.use_channel.then_some(live.as_ref());
    otter_agent::poll::run(&agent, channel, shutdown).await?;
    Ok(ExitCode::SUCCESS)
}
