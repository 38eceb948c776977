//! Long-running mode: take commands from the live channel and from polling,
//! handling each one once.

use crate::channel::GatewayChannel;
use crate::error::{AgentError, AgentResult};
use crate::pipeline::{Agent, CommandOutcome};
use crate::reporter::ChannelReporter;
use otter_core::{CommandKind, CommandMessage, UpdateId};
use std::collections::HashSet;
use std::future::Future;

/// Run until `shutdown` resolves.
///
/// With `live`, a command channel is (re)connected at every poll tick and
/// progress goes over it while it is up; commands pushed on it are handled
/// as they arrive. Polling `/updates/check` continues regardless.
///
/// A command is handled at most once per process; a redelivered command for
/// an update that already finished here is ignored. A command rejected
/// because another pipeline held the lock is retried on the next poll.
pub async fn run<F>(agent: &Agent, live: Option<&ChannelReporter>, shutdown: F) -> AgentResult<()>
where
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);
    let mut handled: HashSet<(CommandKind, UpdateId)> = HashSet::new();
    let mut channel: Option<GatewayChannel> = None;

    tracing::info!(
        gateway_id = %agent.config().gateway_id,
        interval_secs = agent.config().poll_interval_secs,
        channel = live.is_some(),
        "Waiting for updates"
    );

    loop {
        if let Some(reporter) = live
            && channel.is_none()
        {
            match GatewayChannel::connect(agent.client()).await {
                Ok(opened) => {
                    reporter.attach(opened.progress_sender());
                    channel = Some(opened);
                }
                Err(e) => tracing::warn!(error = %e, "Command channel unavailable, polling only"),
            }
        }

        match agent.check().await {
            Ok(Some(command)) => handle_once(agent, &mut handled, &command).await,
            Ok(None) => tracing::debug!("No update offered"),
            Err(e) => tracing::warn!(error = %e, "Update check failed"),
        }

        let tick = tokio::time::sleep(agent.config().poll_interval());
        tokio::pin!(tick);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("Shutdown requested, stopping");
                    return Ok(());
                }
                _ = &mut tick => break,
                pushed = next_pushed(&mut channel) => match pushed {
                    Some(command) => handle_once(agent, &mut handled, &command).await,
                    None => {
                        channel = None;
                        if let Some(reporter) = live {
                            reporter.detach();
                        }
                        tracing::warn!("Command channel lost, polling only");
                    }
                },
            }
        }
    }
}

async fn next_pushed(channel: &mut Option<GatewayChannel>) -> Option<CommandMessage> {
    match channel {
        Some(channel) => channel.next_command().await,
        None => std::future::pending().await,
    }
}

async fn handle_once(
    agent: &Agent,
    handled: &mut HashSet<(CommandKind, UpdateId)>,
    command: &CommandMessage,
) {
    let key = (command.command, command.update_id);
    if handled.contains(&key) {
        tracing::debug!(update_id = %command.update_id, "Command already handled");
        return;
    }
    match agent.handle(command, false).await {
        Err(AgentError::Busy) => {
            tracing::info!(update_id = %command.update_id, "Update in progress elsewhere");
        }
        result => {
            log_result(&result);
            handled.insert(key);
        }
    }
}

fn log_result(result: &AgentResult<CommandOutcome>) {
    match result {
        Ok(CommandOutcome::Updated(outcome)) => {
            tracing::info!(version = %outcome.version, bundle = %outcome.bundle, "Update finished");
        }
        Ok(CommandOutcome::RolledBack { restored }) => {
            tracing::info!(restored, "Rollback finished");
        }
        Err(AgentError::AlreadyCurrent(version)) => {
            tracing::info!(%version, "Already current");
        }
        // Failures were already logged and reported by the pipeline.
        Err(_) => {}
    }
}
