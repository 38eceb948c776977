//! The update pipeline.
//!
//! Strictly sequential per gateway: download, verify, back up, apply, health
//! check. Verification happens before anything on disk or in the runtime is
//! touched, and apply never starts without a bundle on disk. Apply and
//! health-check failures restore the bundle automatically; a failed restore
//! is escalated and never retried.

use crate::api_client::ApiClient;
use crate::apply::{CommandRunner, apply_config_changes};
use crate::backup::{BackupStore, Bundle, BundleRequest};
use crate::descriptor::ServiceDescriptor;
use crate::error::{AgentError, AgentResult};
use crate::health;
use crate::lock::UpdateLock;
use crate::reporter::Reporter;
use crate::runtime::ServiceRuntime;
use crate::version_file;
use otter_core::config::AgentConfig;
use otter_core::{
    CommandKind, CommandMessage, ManifestDocument, ProgressMessage, SemVersion, UpdateId,
    UpdateState, is_compatible,
};
use otter_signer::{PublicKey, verify_manifest};
use std::sync::Arc;

/// Result of a completed update.
#[derive(Debug, Clone)]
pub struct UpdateOutcome {
    pub previous_version: String,
    pub version: String,
    pub bundle: String,
    pub reboot_required: bool,
    /// Command lines that were not on the allow-list.
    pub skipped_commands: Vec<String>,
}

impl UpdateOutcome {
    fn log_line(&self) -> String {
        let mut line = format!("updated {} -> {}", self.previous_version, self.version);
        if !self.skipped_commands.is_empty() {
            line.push_str(&format!(
                "; skipped {} disallowed command(s)",
                self.skipped_commands.len()
            ));
        }
        if self.reboot_required {
            line.push_str("; reboot required");
        }
        line
    }
}

/// What handling a command did.
#[derive(Debug)]
pub enum CommandOutcome {
    Updated(UpdateOutcome),
    /// A rollback command; `restored` is false when there was nothing left
    /// to restore locally.
    RolledBack { restored: bool },
}

pub struct Agent {
    config: AgentConfig,
    client: ApiClient,
    public_key: PublicKey,
    runtime: Arc<dyn ServiceRuntime>,
    reporter: Arc<dyn Reporter>,
    backups: BackupStore,
}

impl Agent {
    pub fn new(
        config: AgentConfig,
        client: ApiClient,
        public_key: PublicKey,
        runtime: Arc<dyn ServiceRuntime>,
        reporter: Arc<dyn Reporter>,
    ) -> Self {
        let backups = BackupStore::new(&config);
        Self {
            config,
            client,
            public_key,
            runtime,
            reporter,
            backups,
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn client(&self) -> &ApiClient {
        &self.client
    }

    pub fn backups(&self) -> &BackupStore {
        &self.backups
    }

    /// Installed version according to the local `VERSION` file.
    pub fn current_version(&self) -> AgentResult<SemVersion> {
        version_file::read(&self.config.version_file(), &self.config.initial_version)
    }

    /// Ask the control plane for the next command.
    pub async fn check(&self) -> AgentResult<Option<CommandMessage>> {
        let current = self.current_version()?;
        self.client.check(&current.to_string()).await
    }

    pub async fn handle(
        &self,
        command: &CommandMessage,
        force: bool,
    ) -> AgentResult<CommandOutcome> {
        match command.command {
            CommandKind::Update => self
                .update(command, force)
                .await
                .map(CommandOutcome::Updated),
            CommandKind::Rollback => self
                .rollback(command)
                .await
                .map(|restored| CommandOutcome::RolledBack { restored }),
        }
    }

    async fn progress(&self, update_id: UpdateId, state: UpdateState, pct: u8, log: &str) {
        tracing::info!(update_id = %update_id, state = %state, "{log}");
        let message = ProgressMessage::new(update_id, state, pct).with_log(log);
        self.reporter.progress(&message).await;
    }

    /// Run the full pipeline for an update command.
    ///
    /// With `force`, a release matching the installed version is applied
    /// again instead of being reported as already current.
    pub async fn update(
        &self,
        command: &CommandMessage,
        force: bool,
    ) -> AgentResult<UpdateOutcome> {
        let _lock = UpdateLock::acquire(&self.config.lock_file())?;
        let current = self.current_version()?;
        let target = SemVersion::parse(&command.version)?;

        if current == target && !force {
            tracing::info!(version = %target, "Already at target version");
            self.reporter
                .success(
                    &command.version,
                    Some(command.update_id),
                    Some(format!("already at {target}")),
                )
                .await;
            return Err(AgentError::AlreadyCurrent(target.to_string()));
        }

        match self.run_pipeline(command, &current).await {
            Ok(outcome) => {
                tracing::info!(
                    update_id = %command.update_id,
                    from = %outcome.previous_version,
                    to = %outcome.version,
                    reboot_required = outcome.reboot_required,
                    "Update applied"
                );
                self.reporter
                    .success(
                        &command.version,
                        Some(command.update_id),
                        Some(outcome.log_line()),
                    )
                    .await;
                Ok(outcome)
            }
            Err(e) => {
                if matches!(e, AgentError::Restore(_)) {
                    tracing::error!(
                        critical = true,
                        update_id = %command.update_id,
                        version = %command.version,
                        error = %e,
                        "Restore failed; manual intervention required"
                    );
                } else {
                    tracing::error!(
                        update_id = %command.update_id,
                        version = %command.version,
                        kind = %e.failure_kind(),
                        error = %e,
                        "Update failed"
                    );
                }
                self.reporter
                    .failure(&command.version, Some(command.update_id), &e)
                    .await;
                Err(e)
            }
        }
    }

    async fn run_pipeline(
        &self,
        command: &CommandMessage,
        current: &SemVersion,
    ) -> AgentResult<UpdateOutcome> {
        let id = command.update_id;

        self.progress(id, UpdateState::Downloading, 10, "downloading manifest and signature")
            .await;
        let manifest_bytes = self.client.fetch_artifact(&command.manifest_url).await?;
        let signature_bytes = self.client.fetch_artifact(&command.signature_url).await?;

        self.progress(id, UpdateState::Verifying, 25, "verifying signature")
            .await;
        let document = self.verify(&manifest_bytes, &signature_bytes, command, current)?;

        self.progress(id, UpdateState::BackingUp, 40, "creating backup bundle")
            .await;
        let bundle = self.create_bundle(current, &document, id).await?;

        let message = ProgressMessage::new(id, UpdateState::Applying, 60)
            .with_log(format!("applying {}", document.version))
            .with_backup_path(bundle.path.display().to_string());
        tracing::info!(update_id = %id, bundle = %bundle.name(), "Applying release");
        self.reporter.progress(&message).await;

        let skipped_commands = match self.apply_release(&document).await {
            Ok(skipped) => skipped,
            Err(e) => {
                let e = if e.needs_restore() {
                    e
                } else {
                    AgentError::Apply(e.to_string())
                };
                tracing::warn!(error = %e, bundle = %bundle.name(), "Apply failed, restoring backup");
                self.restore(&bundle).await?;
                return Err(e);
            }
        };

        version_file::write(&self.config.version_file(), &document.semver()?)?;

        Ok(UpdateOutcome {
            previous_version: current.to_string(),
            version: document.version.clone(),
            bundle: bundle.name(),
            reboot_required: document.requires_reboot,
            skipped_commands,
        })
    }

    /// Check the signature over the exact downloaded bytes, then parse.
    fn verify(
        &self,
        manifest_bytes: &[u8],
        signature_bytes: &[u8],
        command: &CommandMessage,
        current: &SemVersion,
    ) -> AgentResult<ManifestDocument> {
        let signature = std::str::from_utf8(signature_bytes)
            .map_err(|_| AgentError::Verification("signature is not text".to_string()))?;
        verify_manifest(manifest_bytes, signature, &self.public_key)
            .map_err(|e| AgentError::Verification(e.to_string()))?;

        let document = ManifestDocument::from_json(manifest_bytes)
            .map_err(|e| AgentError::Verification(e.to_string()))?;
        document
            .validate()
            .map_err(|e| AgentError::Verification(e.to_string()))?;
        if document.version != command.version {
            return Err(AgentError::Verification(format!(
                "manifest is for {}, command is for {}",
                document.version, command.version
            )));
        }

        let range = document.compatibility()?;
        if !is_compatible(current, &range) {
            return Err(AgentError::Incompatible {
                current: current.to_string(),
                min: range.min().to_string(),
                max: range.max().to_string(),
            });
        }
        Ok(document)
    }

    async fn create_bundle(
        &self,
        current: &SemVersion,
        document: &ManifestDocument,
        update_id: UpdateId,
    ) -> AgentResult<Bundle> {
        let request = BundleRequest {
            version: current.to_string(),
            target_version: document.version.clone(),
            update_id: Some(update_id),
            rollback_commands: document.rollback_commands.clone(),
        };
        self.backups.create(&request).await
    }

    async fn apply_release(&self, document: &ManifestDocument) -> AgentResult<Vec<String>> {
        let runtime = self.runtime.as_ref();
        let runner = CommandRunner::new(
            runtime,
            &self.config.compose_file,
            &self.config.datastore_path,
        );
        let mut skipped = Vec::new();

        for (service, image) in &document.docker_images {
            tracing::info!(service = %service, image = %image, "Pulling image");
            runtime
                .pull(image)
                .await
                .map_err(|e| AgentError::Apply(format!("pull {image}: {e}")))?;
        }
        skipped.extend(runner.run("pre_update_hooks", &document.pre_update_hooks).await?);

        runtime
            .stop()
            .await
            .map_err(|e| AgentError::Apply(format!("stop services: {e}")))?;

        if !document.docker_images.is_empty() {
            let mut descriptor = ServiceDescriptor::load(&self.config.compose_file)?;
            for (service, image) in &document.docker_images {
                descriptor.set_image(service, image)?;
            }
            descriptor.save()?;
        }
        apply_config_changes(&self.config.config_root, &document.config_changes)?;
        skipped.extend(runner.run("migrations", &document.migrations).await?);

        runtime
            .start()
            .await
            .map_err(|e| AgentError::Apply(format!("start services: {e}")))?;
        skipped.extend(runner.run("post_update_hooks", &document.post_update_hooks).await?);

        tokio::time::sleep(self.config.settle_interval()).await;
        health::check(runtime, &self.config.health).await?;

        Ok(skipped)
    }

    /// Put a bundle back: stop, restore files, run the release's rollback
    /// commands, start, and health-check again. Any failure is a
    /// [`AgentError::Restore`].
    async fn restore(&self, bundle: &Bundle) -> AgentResult<()> {
        self.restore_inner(bundle).await.map_err(|e| match e {
            AgentError::Restore(_) => e,
            other => AgentError::Restore(other.to_string()),
        })?;
        tracing::info!(bundle = %bundle.name(), version = %bundle.metadata.version, "Backup restored");
        Ok(())
    }

    async fn restore_inner(&self, bundle: &Bundle) -> AgentResult<()> {
        let runtime = self.runtime.as_ref();
        runtime.stop().await?;

        let store = self.backups.clone();
        let restored = bundle.clone();
        tokio::task::spawn_blocking(move || store.restore_files(&restored))
            .await
            .map_err(|e| AgentError::Restore(format!("restore task failed: {e}")))??;

        let runner = CommandRunner::new(
            runtime,
            &self.config.compose_file,
            &self.config.datastore_path,
        );
        runner
            .run("rollback_commands", &bundle.metadata.rollback_commands)
            .await?;

        runtime.start().await?;
        tokio::time::sleep(self.config.settle_interval()).await;
        health::check(runtime, &self.config.health).await?;

        let version = SemVersion::parse(&bundle.metadata.version)?;
        version_file::write(&self.config.version_file(), &version)
    }

    /// Handle a rollback command from the control plane.
    ///
    /// Restores the latest bundle only while the installed version is the
    /// one being rolled back; otherwise the earlier automatic restore already
    /// did the work. Either way the update is reported as rolled back.
    pub async fn rollback(&self, command: &CommandMessage) -> AgentResult<bool> {
        let _lock = UpdateLock::acquire(&self.config.lock_file())?;
        let current = self.current_version()?;

        let restored = if current.to_string() == command.version {
            let bundle = self.backups.latest()?.ok_or(AgentError::NoBackup)?;
            if let Err(e) = self.restore(&bundle).await {
                tracing::error!(
                    critical = true,
                    update_id = %command.update_id,
                    error = %e,
                    "Rollback restore failed; manual intervention required"
                );
                return Err(e);
            }
            true
        } else {
            false
        };

        let log = if restored {
            format!("restored {current} from backup")
        } else {
            format!("already restored, running {current}")
        };
        self.progress(command.update_id, UpdateState::RolledBack, 100, &log)
            .await;
        Ok(restored)
    }

    /// Restore the latest local bundle without a control plane command.
    pub async fn rollback_latest(&self) -> AgentResult<Bundle> {
        let _lock = UpdateLock::acquire(&self.config.lock_file())?;
        let bundle = self.backups.latest()?.ok_or(AgentError::NoBackup)?;
        self.restore(&bundle).await?;
        Ok(bundle)
    }
}
