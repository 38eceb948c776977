//! Local backup bundles.
//!
//! A bundle is an immutable directory `backups/{timestamp}-{version}` holding
//! the service descriptor, the config tree, a snapshot of the local datastore
//! and `metadata.json`. Bundles are staged in a hidden temp directory and renamed
//! into place, so a crash never leaves a half-written bundle under a real
//! name. `backups/LATEST` names the bundle a restore uses.

use crate::error::{AgentError, AgentResult};
use otter_core::UpdateId;
use otter_core::config::AgentConfig;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{ConnectOptions, Connection};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::time::Duration;
use time::OffsetDateTime;
use time::macros::format_description;

pub const LATEST_FILE: &str = "LATEST";
const METADATA_FILE: &str = "metadata.json";
const COMPOSE_FILE: &str = "compose.json";
const CONFIG_DIR: &str = "config";
const DATASTORE_FILE: &str = "datastore.db";
const SQLITE_HEADER: &[u8; 16] = b"SQLite format 3\0";
/// Files SQLite keeps next to a database while it is open.
const SQLITE_SIDECARS: [&str; 3] = ["-wal", "-shm", "-journal"];

/// Contents of `metadata.json`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleMetadata {
    /// Version installed when the bundle was taken (what a restore returns to).
    pub version: String,
    /// Version the update was moving to.
    pub target_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_id: Option<UpdateId>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub has_compose: bool,
    pub has_config: bool,
    pub has_datastore: bool,
    /// The target release's rollback commands, run during restore.
    #[serde(default)]
    pub rollback_commands: Vec<String>,
}

/// A bundle on disk.
#[derive(Clone, Debug)]
pub struct Bundle {
    pub path: PathBuf,
    pub metadata: BundleMetadata,
}

impl Bundle {
    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// What a new bundle is for.
#[derive(Clone, Debug)]
pub struct BundleRequest {
    pub version: String,
    pub target_version: String,
    pub update_id: Option<UpdateId>,
    pub rollback_commands: Vec<String>,
}

/// Bundle directory plus the live paths it snapshots.
#[derive(Clone, Debug)]
pub struct BackupStore {
    dir: PathBuf,
    compose_file: PathBuf,
    config_root: PathBuf,
    datastore_path: PathBuf,
    keep: usize,
}

impl BackupStore {
    pub fn new(config: &AgentConfig) -> Self {
        Self {
            dir: config.backups_dir(),
            compose_file: config.compose_file.clone(),
            config_root: config.config_root.clone(),
            datastore_path: config.datastore_path.clone(),
            keep: config.backup.keep.max(1),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Snapshot the live files into a new bundle and make it the latest.
    pub async fn create(&self, request: &BundleRequest) -> AgentResult<Bundle> {
        self.create_inner(request)
            .await
            .map_err(|e| AgentError::Backup(e.to_string()))
    }

    async fn create_inner(&self, request: &BundleRequest) -> io::Result<Bundle> {
        std::fs::create_dir_all(&self.dir)?;

        let created_at = OffsetDateTime::now_utc();
        let stamp = created_at
            .format(format_description!(
                "[year][month][day]T[hour][minute][second][subsecond digits:3]Z"
            ))
            .map_err(|e| io::Error::other(e.to_string()))?;
        let name = format!("{stamp}-{}", request.version);
        let final_path = self.dir.join(&name);
        if final_path.exists() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("bundle {name} already exists"),
            ));
        }

        let staging = self.dir.join(format!(".tmp-{name}"));
        if staging.exists() {
            std::fs::remove_dir_all(&staging)?;
        }
        std::fs::create_dir_all(&staging)?;

        let has_compose = copy_if_exists(&self.compose_file, &staging.join(COMPOSE_FILE))?;
        let has_config = copy_if_exists(&self.config_root, &staging.join(CONFIG_DIR))?;
        let has_datastore =
            snapshot_datastore(&self.datastore_path, &staging.join(DATASTORE_FILE)).await?;

        let metadata = BundleMetadata {
            version: request.version.clone(),
            target_version: request.target_version.clone(),
            update_id: request.update_id,
            created_at,
            has_compose,
            has_config,
            has_datastore,
            rollback_commands: request.rollback_commands.clone(),
        };
        let json = serde_json::to_vec_pretty(&metadata).map_err(io::Error::other)?;
        std::fs::write(staging.join(METADATA_FILE), json)?;

        set_read_only(&staging)?;
        std::fs::rename(&staging, &final_path)?;
        write_atomic(&self.dir.join(LATEST_FILE), name.as_bytes())?;

        tracing::info!(bundle = %name, "Backup bundle created");
        self.prune(&name)?;

        Ok(Bundle {
            path: final_path,
            metadata,
        })
    }

    /// Bundle names, oldest first.
    pub fn list(&self) -> AgentResult<Vec<String>> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with('.') && entry.file_type()?.is_dir() {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    /// The bundle named by `LATEST`, if any.
    pub fn latest(&self) -> AgentResult<Option<Bundle>> {
        let name = match std::fs::read_to_string(self.dir.join(LATEST_FILE)) {
            Ok(name) => name.trim().to_string(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if name.is_empty() {
            return Ok(None);
        }
        self.open(&name).map(Some)
    }

    pub fn open(&self, name: &str) -> AgentResult<Bundle> {
        let path = self.dir.join(name);
        let raw = std::fs::read(path.join(METADATA_FILE))?;
        let metadata = serde_json::from_slice(&raw)?;
        Ok(Bundle { path, metadata })
    }

    /// Put the bundle's files back over the live paths.
    pub fn restore_files(&self, bundle: &Bundle) -> AgentResult<()> {
        let meta = &bundle.metadata;
        restore_path(
            &bundle.path.join(COMPOSE_FILE),
            &self.compose_file,
            meta.has_compose,
        )
        .and_then(|_| {
            restore_path(&bundle.path.join(CONFIG_DIR), &self.config_root, meta.has_config)
        })
        .and_then(|_| remove_sidecars(&self.datastore_path))
        .and_then(|_| {
            restore_path(
                &bundle.path.join(DATASTORE_FILE),
                &self.datastore_path,
                meta.has_datastore,
            )
        })
        .map_err(|e| AgentError::Restore(format!("bundle {}: {e}", bundle.name())))
    }

    /// Drop bundles beyond `keep`. The latest is never removed.
    fn prune(&self, latest: &str) -> io::Result<()> {
        let names = self
            .list()
            .map_err(|e| io::Error::other(e.to_string()))?;
        let excess = names.len().saturating_sub(self.keep);
        for name in names.iter().take(excess).filter(|n| n.as_str() != latest) {
            tracing::debug!(bundle = %name, "Pruning old backup bundle");
            std::fs::remove_dir_all(self.dir.join(name))?;
        }
        Ok(())
    }
}

fn copy_if_exists(from: &Path, to: &Path) -> io::Result<bool> {
    match std::fs::metadata(from) {
        Ok(meta) if meta.is_dir() => {
            copy_dir(from, to)?;
            Ok(true)
        }
        Ok(_) => {
            std::fs::copy(from, to)?;
            Ok(true)
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Copy the datastore into `to` as one self-contained file.
///
/// An SQLite database is read through SQLite with `VACUUM INTO`, so pages
/// still in its write-ahead log are included and a concurrent writer cannot
/// tear the copy. Any other file is copied as-is.
async fn snapshot_datastore(from: &Path, to: &Path) -> io::Result<bool> {
    if !is_sqlite(from)? {
        return copy_if_exists(from, to);
    }

    let mut conn = SqliteConnectOptions::new()
        .filename(from)
        .create_if_missing(false)
        .busy_timeout(Duration::from_secs(30))
        .connect()
        .await
        .map_err(io::Error::other)?;
    sqlx::query("VACUUM INTO ?")
        .bind(to.to_string_lossy().into_owned())
        .execute(&mut conn)
        .await
        .map_err(|e| io::Error::other(format!("snapshot {}: {e}", from.display())))?;
    conn.close().await.map_err(io::Error::other)?;
    Ok(true)
}

fn is_sqlite(path: &Path) -> io::Result<bool> {
    let mut file = match std::fs::File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };
    if file.metadata()?.is_dir() {
        return Ok(false);
    }
    let mut header = [0u8; 16];
    match file.read_exact(&mut header) {
        Ok(()) => Ok(&header == SQLITE_HEADER),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

fn sidecar(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// A WAL or journal left next to a restored database would be replayed over it.
fn remove_sidecars(path: &Path) -> io::Result<()> {
    for suffix in SQLITE_SIDECARS {
        match std::fs::remove_file(sidecar(path, suffix)) {
            Ok(()) => tracing::debug!(path = %path.display(), suffix, "Removed stale datastore file"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn copy_dir(from: &Path, to: &Path) -> io::Result<()> {
    std::fs::create_dir_all(to)?;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

fn restore_path(from: &Path, to: &Path, present: bool) -> io::Result<()> {
    match std::fs::metadata(to) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(to)?,
        Ok(_) => std::fs::remove_file(to)?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    if !present {
        return Ok(());
    }
    if let Some(parent) = to.parent() {
        std::fs::create_dir_all(parent)?;
    }
    copy_if_exists(from, to)?;
    set_writable(to)
}

#[cfg(unix)]
fn set_mode_files(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    if std::fs::metadata(path)?.is_dir() {
        for entry in std::fs::read_dir(path)? {
            set_mode_files(&entry?.path(), mode)?;
        }
        Ok(())
    } else {
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
    }
}

#[cfg(unix)]
fn set_read_only(path: &Path) -> io::Result<()> {
    set_mode_files(path, 0o444)
}

#[cfg(unix)]
fn set_writable(path: &Path) -> io::Result<()> {
    set_mode_files(path, 0o644)
}

#[cfg(not(unix))]
fn set_read_only(_path: &Path) -> io::Result<()> {
    Ok(())
}

#[cfg(not(unix))]
fn set_writable(_path: &Path) -> io::Result<()> {
    Ok(())
}

fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, contents)?;
    std::fs::rename(&tmp, path)
}
