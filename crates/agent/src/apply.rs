//! Release application steps: config changes and allow-listed commands.

use crate::error::{AgentError, AgentResult};
use crate::runtime::ServiceRuntime;
use otter_core::{ConfigAction, ConfigChange, MigrationCommand, Program};
use serde_json::Value;
use std::path::{Component, Path, PathBuf};

/// Apply config changes in declared order. Reapplying the same list is a
/// no-op.
pub fn apply_config_changes(config_root: &Path, changes: &[ConfigChange]) -> AgentResult<()> {
    for (index, change) in changes.iter().enumerate() {
        apply_config_change(config_root, change).map_err(|e| {
            AgentError::Apply(format!("config_changes[{index}] ({}): {e}", change.file))
        })?;
    }
    Ok(())
}

fn apply_config_change(config_root: &Path, change: &ConfigChange) -> AgentResult<()> {
    let target = config_root.join(&change.file);
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }

    match change.action {
        ConfigAction::Replace => {
            let content = content_str(change)?;
            if std::fs::read_to_string(&target).ok().as_deref() != Some(content) {
                std::fs::write(&target, content)?;
            }
        }
        ConfigAction::Append => {
            let content = content_str(change)?;
            let existing = match std::fs::read_to_string(&target) {
                Ok(existing) => existing,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
                Err(e) => return Err(e.into()),
            };
            if !existing.ends_with(content) {
                std::fs::write(&target, existing + content)?;
            }
        }
        ConfigAction::JsonMerge => {
            let mut document = match std::fs::read(&target) {
                Ok(raw) if raw.iter().all(u8::is_ascii_whitespace) => {
                    Value::Object(Default::default())
                }
                Ok(raw) => serde_json::from_slice(&raw)?,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    Value::Object(Default::default())
                }
                Err(e) => return Err(e.into()),
            };
            merge(&mut document, &change.content);
            std::fs::write(&target, serde_json::to_vec_pretty(&document)?)?;
        }
    }
    Ok(())
}

fn content_str(change: &ConfigChange) -> AgentResult<&str> {
    change
        .content
        .as_str()
        .ok_or_else(|| AgentError::Apply("content must be a string".to_string()))
}

/// Deep merge: objects merge key by key, anything else is replaced.
fn merge(base: &mut Value, patch: &Value) {
    match (base, patch) {
        (Value::Object(base), Value::Object(patch)) => {
            for (key, value) in patch {
                merge(base.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
        (base, patch) => *base = patch.clone(),
    }
}

/// Runs manifest command lists through the allow-list.
pub struct CommandRunner<'a> {
    runtime: &'a dyn ServiceRuntime,
    compose_file: &'a Path,
    datastore_dir: PathBuf,
}

impl<'a> CommandRunner<'a> {
    pub fn new(
        runtime: &'a dyn ServiceRuntime,
        compose_file: &'a Path,
        datastore_path: &Path,
    ) -> Self {
        let datastore_dir = datastore_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        Self {
            runtime,
            compose_file,
            datastore_dir,
        }
    }

    /// Run each allowed line in order. Lines that fail validation are skipped
    /// and returned; a failing allowed command is an error.
    pub async fn run(&self, phase: &str, lines: &[String]) -> AgentResult<Vec<String>> {
        let mut skipped = Vec::new();
        for line in lines {
            let parsed = MigrationCommand::parse(line)
                .and_then(|cmd| self.argv(&cmd).map(|args| (cmd.executable(), args)));
            let (program, args) = match parsed {
                Ok(parsed) => parsed,
                Err(e) => {
                    tracing::warn!(phase, command = %line, error = %e, "Skipping disallowed command");
                    skipped.push(line.clone());
                    continue;
                }
            };

            tracing::info!(phase, command = %line, "Running command");
            self.runtime
                .exec(program, &args)
                .await
                .map_err(|e| AgentError::Apply(format!("{phase}: {e}")))?;
        }
        Ok(skipped)
    }

    fn argv(&self, cmd: &MigrationCommand) -> otter_core::Result<Vec<String>> {
        match cmd.program() {
            Program::Sqlite3 => {
                let database = cmd.sqlite_database().ok_or_else(|| {
                    otter_core::Error::CommandRejected("sqlite3 without a database".to_string())
                })?;
                let resolved = self.resolve_database(database)?;
                let mut args = vec!["-safe".to_string(), resolved.display().to_string()];
                args.extend(cmd.args().iter().skip(1).cloned());
                Ok(args)
            }
            Program::DockerCompose => Ok(cmd.argv(Some(self.compose_file))),
            Program::Docker | Program::Systemctl => Ok(cmd.argv(None)),
        }
    }

    /// sqlite3 may only touch databases inside the datastore directory.
    fn resolve_database(&self, database: &Path) -> otter_core::Result<PathBuf> {
        let resolved = if database.is_absolute() {
            database.to_path_buf()
        } else {
            self.datastore_dir.join(database)
        };
        let escapes = resolved
            .components()
            .any(|c| matches!(c, Component::ParentDir));
        if escapes || !resolved.starts_with(&self.datastore_dir) {
            return Err(otter_core::Error::CommandRejected(format!(
                "database {} is outside {}",
                database.display(),
                self.datastore_dir.display()
            )));
        }
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<(String, Vec<String>)>>,
    }

    #[async_trait]
    impl ServiceRuntime for Recorder {
        async fn pull(&self, _image: &str) -> AgentResult<()> {
            Ok(())
        }
        async fn stop(&self) -> AgentResult<()> {
            Ok(())
        }
        async fn start(&self) -> AgentResult<()> {
            Ok(())
        }
        async fn service_states(&self) -> AgentResult<BTreeMap<String, String>> {
            Ok(BTreeMap::new())
        }
        async fn exec(&self, program: &str, args: &[String]) -> AgentResult<()> {
            self.calls
                .lock()
                .unwrap()
                .push((program.to_string(), args.to_vec()));
            Ok(())
        }
    }

    fn change(file: &str, action: ConfigAction, content: Value) -> ConfigChange {
        ConfigChange {
            file: file.to_string(),
            action,
            content,
        }
    }

    #[test]
    fn test_config_changes_are_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("api")).unwrap();
        std::fs::write(
            root.join("api/settings.json"),
            r#"{"log_level":"debug","db":{"path":"app.db","pool":4}}"#,
        )
        .unwrap();

        let changes = vec![
            change("mqtt/broker.conf", ConfigAction::Replace, json!("listener 1883\n")),
            change("mqtt/broker.conf", ConfigAction::Append, json!("allow_anonymous false\n")),
            change(
                "api/settings.json",
                ConfigAction::JsonMerge,
                json!({"log_level": "info", "db": {"pool": 8}}),
            ),
        ];

        apply_config_changes(root, &changes).unwrap();
        apply_config_changes(root, &changes).unwrap();

        // The replace runs again on reapply, then the append re-adds its line once.
        assert_eq!(
            std::fs::read_to_string(root.join("mqtt/broker.conf")).unwrap(),
            "listener 1883\nallow_anonymous false\n"
        );
        let settings: Value =
            serde_json::from_slice(&std::fs::read(root.join("api/settings.json")).unwrap()).unwrap();
        assert_eq!(
            settings,
            json!({"log_level": "info", "db": {"path": "app.db", "pool": 8}})
        );
    }

    #[test]
    fn test_append_only_once() {
        let dir = tempfile::tempdir().unwrap();
        let changes = vec![change("hosts", ConfigAction::Append, json!("10.0.0.5 broker\n"))];
        for _ in 0..3 {
            apply_config_changes(dir.path(), &changes).unwrap();
        }
        assert_eq!(
            std::fs::read_to_string(dir.path().join("hosts")).unwrap(),
            "10.0.0.5 broker\n"
        );
    }

    #[tokio::test]
    async fn test_disallowed_lines_are_skipped() {
        let recorder = Recorder::default();
        let compose = PathBuf::from("/etc/otter/compose.json");
        let datastore = Path::new("/var/lib/otter/data/gateway.db");
        let runner = CommandRunner::new(&recorder, &compose, datastore);

        let lines = vec![
            "rm -rf /".to_string(),
            "sqlite3 app.db 'ALTER TABLE readings ADD unit TEXT'".to_string(),
            "sqlite3 /etc/shadow 'select 1'".to_string(),
            "docker-compose exec api migrate".to_string(),
            "systemctl restart mosquitto.service".to_string(),
        ];
        let skipped = runner.run("migrations", &lines).await.unwrap();
        assert_eq!(skipped, vec![lines[0].clone(), lines[2].clone()]);

        let calls = recorder.calls.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec![
                (
                    "sqlite3".to_string(),
                    vec![
                        "-safe".to_string(),
                        "/var/lib/otter/data/app.db".to_string(),
                        "ALTER TABLE readings ADD unit TEXT".to_string()
                    ]
                ),
                (
                    "docker".to_string(),
                    vec![
                        "compose".to_string(),
                        "-f".to_string(),
                        "/etc/otter/compose.json".to_string(),
                        "exec".to_string(),
                        "api".to_string(),
                        "migrate".to_string()
                    ]
                ),
                (
                    "systemctl".to_string(),
                    vec!["restart".to_string(), "mosquitto.service".to_string()]
                ),
            ]
        );
    }
}
