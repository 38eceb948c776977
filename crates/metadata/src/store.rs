//! Metadata store trait and the SQLite implementation.

use crate::error::{MetadataError, MetadataResult};
use crate::repos::{
    BackupRepo, BootstrapRepo, EscalationRepo, GatewayUpdateRepo, ManifestRepo, TokenRepo,
};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::time::{Duration, Instant};

/// Combined metadata store trait.
#[async_trait]
pub trait MetadataStore:
    ManifestRepo
    + GatewayUpdateRepo
    + BackupRepo
    + TokenRepo
    + BootstrapRepo
    + EscalationRepo
    + Send
    + Sync
{
    /// Run database migrations.
    async fn migrate(&self) -> MetadataResult<()>;

    /// Check database connectivity and health.
    async fn health_check(&self) -> MetadataResult<()>;
}

/// SQLite-based metadata store.
pub struct SqliteStore {
    pool: Pool<Sqlite>,
    slow_query_threshold: Duration,
}

impl SqliteStore {
    /// Create a new SQLite store and apply the schema.
    ///
    /// `query_timeout_secs` is advisory: SQLite cannot cancel statements, so
    /// operations exceeding it are only logged.
    pub async fn new(
        path: impl AsRef<Path>,
        query_timeout_secs: Option<u64>,
    ) -> MetadataResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true)
            // Prevent transient "database is locked" errors under concurrent access.
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            // One writer at a time; also makes every transaction below serializable.
            .max_connections(1)
            .connect_with(opts)
            .await?;

        let store = Self {
            pool,
            slow_query_threshold: Duration::from_secs(query_timeout_secs.unwrap_or(30)),
        };
        store.migrate().await?;

        Ok(store)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    fn warn_if_slow(&self, operation: &'static str, started: Instant) {
        let elapsed = started.elapsed();
        if elapsed > self.slow_query_threshold {
            tracing::warn!(
                operation,
                elapsed_ms = elapsed.as_millis() as u64,
                threshold_ms = self.slow_query_threshold.as_millis() as u64,
                "slow metadata operation"
            );
        }
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => {
            db_err.is_unique_violation() || db_err.message().contains("UNIQUE constraint")
        }
        _ => false,
    }
}

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn migrate(&self) -> MetadataResult<()> {
        sqlx::query(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        let started = Instant::now();
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        self.warn_if_slow("health_check", started);
        Ok(())
    }
}

// Implement all the repository traits for SqliteStore
mod sqlite_impl {
    use super::*;
    use crate::models::*;
    use crate::repos::PublishedArtifacts;
    use time::OffsetDateTime;
    use uuid::Uuid;

    #[async_trait]
    impl ManifestRepo for SqliteStore {
        async fn create_manifest(&self, manifest: &ManifestRow) -> MetadataResult<()> {
            let result = sqlx::query(
                r#"
                INSERT INTO manifests (
                    manifest_id, version, description, document, status,
                    critical, rollback_safe, requires_reboot,
                    min_gateway_version, max_gateway_version,
                    content_hash, signature_hex, manifest_url, signature_url,
                    rollout_percentage, total_count, updated_count, failed_count,
                    created_at, updated_at, published_at, completed_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(manifest.manifest_id)
            .bind(&manifest.version)
            .bind(&manifest.description)
            .bind(&manifest.document)
            .bind(&manifest.status)
            .bind(manifest.critical)
            .bind(manifest.rollback_safe)
            .bind(manifest.requires_reboot)
            .bind(&manifest.min_gateway_version)
            .bind(&manifest.max_gateway_version)
            .bind(&manifest.content_hash)
            .bind(&manifest.signature_hex)
            .bind(&manifest.manifest_url)
            .bind(&manifest.signature_url)
            .bind(manifest.rollout_percentage)
            .bind(manifest.total_count)
            .bind(manifest.updated_count)
            .bind(manifest.failed_count)
            .bind(manifest.created_at)
            .bind(manifest.updated_at)
            .bind(manifest.published_at)
            .bind(manifest.completed_at)
            .execute(&self.pool)
            .await;

            match result {
                Ok(_) => Ok(()),
                Err(e) if is_unique_violation(&e) => Err(MetadataError::AlreadyExists(format!(
                    "manifest version {}",
                    manifest.version
                ))),
                Err(e) => Err(e.into()),
            }
        }

        async fn get_manifest(&self, manifest_id: Uuid) -> MetadataResult<Option<ManifestRow>> {
            let row =
                sqlx::query_as::<_, ManifestRow>("SELECT * FROM manifests WHERE manifest_id = ?")
                    .bind(manifest_id)
                    .fetch_optional(&self.pool)
                    .await?;
            Ok(row)
        }

        async fn get_manifest_by_version(
            &self,
            version: &str,
        ) -> MetadataResult<Option<ManifestRow>> {
            let row = sqlx::query_as::<_, ManifestRow>("SELECT * FROM manifests WHERE version = ?")
                .bind(version)
                .fetch_optional(&self.pool)
                .await?;
            Ok(row)
        }

        async fn get_manifest_by_content_hash(
            &self,
            content_hash: &str,
        ) -> MetadataResult<Option<ManifestRow>> {
            let row = sqlx::query_as::<_, ManifestRow>(
                "SELECT * FROM manifests WHERE content_hash = ?",
            )
            .bind(content_hash)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn list_manifests(&self) -> MetadataResult<Vec<ManifestRow>> {
            let rows =
                sqlx::query_as::<_, ManifestRow>("SELECT * FROM manifests ORDER BY created_at")
                    .fetch_all(&self.pool)
                    .await?;
            Ok(rows)
        }

        async fn publish_manifest(
            &self,
            manifest_id: Uuid,
            artifacts: &PublishedArtifacts,
            published_at: OffsetDateTime,
        ) -> MetadataResult<bool> {
            let result = sqlx::query(
                r#"
                UPDATE manifests
                SET content_hash = ?, signature_hex = ?, manifest_url = ?, signature_url = ?,
                    published_at = ?, updated_at = ?
                WHERE manifest_id = ? AND manifest_url IS NULL
                "#,
            )
            .bind(&artifacts.content_hash)
            .bind(&artifacts.signature_hex)
            .bind(&artifacts.manifest_url)
            .bind(&artifacts.signature_url)
            .bind(published_at)
            .bind(published_at)
            .bind(manifest_id)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() > 0)
        }

        async fn update_manifest_status(
            &self,
            manifest_id: Uuid,
            expected: &str,
            status: &str,
            updated_at: OffsetDateTime,
        ) -> MetadataResult<bool> {
            let result = sqlx::query(
                "UPDATE manifests SET status = ?, updated_at = ? WHERE manifest_id = ? AND status = ?",
            )
            .bind(status)
            .bind(updated_at)
            .bind(manifest_id)
            .bind(expected)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() > 0)
        }

        async fn raise_rollout_percentage(
            &self,
            manifest_id: Uuid,
            percentage: i64,
            updated_at: OffsetDateTime,
        ) -> MetadataResult<()> {
            sqlx::query(
                r#"
                UPDATE manifests
                SET rollout_percentage = MAX(rollout_percentage, ?), updated_at = ?
                WHERE manifest_id = ?
                "#,
            )
            .bind(percentage)
            .bind(updated_at)
            .bind(manifest_id)
            .execute(&self.pool)
            .await?;
            Ok(())
        }

        async fn recount_manifest(&self, manifest_id: Uuid) -> MetadataResult<ManifestCounts> {
            let started = Instant::now();
            let mut tx = self.pool.begin().await?;

            let (total, updated, failed): (i64, i64, i64) = sqlx::query_as(
                r#"
                SELECT
                    COUNT(*),
                    COALESCE(SUM(CASE WHEN state = 'success' THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN state IN ('failed', 'rolled_back') THEN 1 ELSE 0 END), 0)
                FROM gateway_updates
                WHERE manifest_id = ?
                "#,
            )
            .bind(manifest_id)
            .fetch_one(&mut *tx)
            .await?;

            let result = sqlx::query(
                r#"
                UPDATE manifests
                SET total_count = ?, updated_count = ?, failed_count = ?, updated_at = ?
                WHERE manifest_id = ?
                "#,
            )
            .bind(total)
            .bind(updated)
            .bind(failed)
            .bind(OffsetDateTime::now_utc())
            .bind(manifest_id)
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() == 0 {
                return Err(MetadataError::NotFound(format!("manifest {manifest_id}")));
            }

            tx.commit().await?;
            self.warn_if_slow("recount_manifest", started);

            Ok(ManifestCounts {
                total,
                updated,
                failed,
            })
        }

        async fn complete_manifest_if_done(
            &self,
            manifest_id: Uuid,
            completed_at: OffsetDateTime,
        ) -> MetadataResult<bool> {
            let result = sqlx::query(
                r#"
                UPDATE manifests
                SET status = 'completed', completed_at = ?, updated_at = ?
                WHERE manifest_id = ?
                  AND status = 'rolling_out'
                  AND total_count > 0
                  AND updated_count + failed_count = total_count
                "#,
            )
            .bind(completed_at)
            .bind(completed_at)
            .bind(manifest_id)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() > 0)
        }
    }

    #[async_trait]
    impl GatewayUpdateRepo for SqliteStore {
        async fn dispatch_update(&self, row: &GatewayUpdateRow) -> MetadataResult<DispatchSlot> {
            let started = Instant::now();
            // Check-then-insert inside one transaction; the partial unique index on
            // active rows backs this up if another writer slips in.
            let mut tx = self.pool.begin().await?;

            let existing = sqlx::query_as::<_, GatewayUpdateRow>(
                "SELECT * FROM gateway_updates WHERE gateway_id = ? AND manifest_id = ?",
            )
            .bind(&row.gateway_id)
            .bind(row.manifest_id)
            .fetch_optional(&mut *tx)
            .await?;

            if let Some(existing) = existing {
                tx.commit().await?;
                return Ok(DispatchSlot::Existing(existing));
            }

            let active = sqlx::query_as::<_, GatewayUpdateRow>(
                r#"
                SELECT * FROM gateway_updates
                WHERE gateway_id = ?
                  AND state IN ('pending', 'downloading', 'verifying', 'backing_up', 'applying')
                "#,
            )
            .bind(&row.gateway_id)
            .fetch_optional(&mut *tx)
            .await?;

            if let Some(active) = active {
                tx.commit().await?;
                return Ok(DispatchSlot::Blocked(active));
            }

            let inserted = sqlx::query(
                r#"
                INSERT INTO gateway_updates (
                    update_id, gateway_id, manifest_id, version, state,
                    progress_percentage, current_step, logs, last_event_digest,
                    retry_count, error, error_kind, dispatched_at, updated_at,
                    applying_started_at, rollback_requested_at, completed_at, duration_ms
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(row.update_id)
            .bind(&row.gateway_id)
            .bind(row.manifest_id)
            .bind(&row.version)
            .bind(&row.state)
            .bind(row.progress_percentage)
            .bind(&row.current_step)
            .bind(&row.logs)
            .bind(&row.last_event_digest)
            .bind(row.retry_count)
            .bind(&row.error)
            .bind(&row.error_kind)
            .bind(row.dispatched_at)
            .bind(row.updated_at)
            .bind(row.applying_started_at)
            .bind(row.rollback_requested_at)
            .bind(row.completed_at)
            .bind(row.duration_ms)
            .execute(&mut *tx)
            .await;

            match inserted {
                Ok(_) => {}
                Err(e) if is_unique_violation(&e) => {
                    return Err(MetadataError::AlreadyExists(format!(
                        "gateway {} already has an active update",
                        row.gateway_id
                    )));
                }
                Err(e) => return Err(e.into()),
            }

            tx.commit().await?;
            self.warn_if_slow("dispatch_update", started);
            Ok(DispatchSlot::Created(row.clone()))
        }

        async fn get_update(&self, update_id: Uuid) -> MetadataResult<Option<GatewayUpdateRow>> {
            let row = sqlx::query_as::<_, GatewayUpdateRow>(
                "SELECT * FROM gateway_updates WHERE update_id = ?",
            )
            .bind(update_id)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn get_update_for(
            &self,
            gateway_id: &str,
            manifest_id: Uuid,
        ) -> MetadataResult<Option<GatewayUpdateRow>> {
            let row = sqlx::query_as::<_, GatewayUpdateRow>(
                "SELECT * FROM gateway_updates WHERE gateway_id = ? AND manifest_id = ?",
            )
            .bind(gateway_id)
            .bind(manifest_id)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn get_active_update(
            &self,
            gateway_id: &str,
        ) -> MetadataResult<Option<GatewayUpdateRow>> {
            let row = sqlx::query_as::<_, GatewayUpdateRow>(
                r#"
                SELECT * FROM gateway_updates
                WHERE gateway_id = ?
                  AND state IN ('pending', 'downloading', 'verifying', 'backing_up', 'applying')
                "#,
            )
            .bind(gateway_id)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn find_update_by_version(
            &self,
            gateway_id: &str,
            version: &str,
        ) -> MetadataResult<Option<GatewayUpdateRow>> {
            let row = sqlx::query_as::<_, GatewayUpdateRow>(
                r#"
                SELECT * FROM gateway_updates
                WHERE gateway_id = ? AND version = ?
                ORDER BY dispatched_at DESC
                LIMIT 1
                "#,
            )
            .bind(gateway_id)
            .bind(version)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn list_updates_for_manifest(
            &self,
            manifest_id: Uuid,
        ) -> MetadataResult<Vec<GatewayUpdateRow>> {
            let rows = sqlx::query_as::<_, GatewayUpdateRow>(
                "SELECT * FROM gateway_updates WHERE manifest_id = ? ORDER BY gateway_id",
            )
            .bind(manifest_id)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn list_updates_for_gateway(
            &self,
            gateway_id: &str,
        ) -> MetadataResult<Vec<GatewayUpdateRow>> {
            let rows = sqlx::query_as::<_, GatewayUpdateRow>(
                "SELECT * FROM gateway_updates WHERE gateway_id = ? ORDER BY dispatched_at DESC",
            )
            .bind(gateway_id)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn apply_progress(
            &self,
            update_id: Uuid,
            expected: &str,
            change: &ProgressChange,
        ) -> MetadataResult<bool> {
            let mut tx = self.pool.begin().await?;

            // Each event is applied at most once per row, whatever arrived in between.
            let recorded = sqlx::query(
                "INSERT OR IGNORE INTO update_events (update_id, digest, received_at) VALUES (?, ?, ?)",
            )
            .bind(update_id)
            .bind(&change.event_digest)
            .bind(change.at)
            .execute(&mut *tx)
            .await?;
            if recorded.rows_affected() == 0 {
                tx.rollback().await?;
                return Ok(false);
            }

            let result = sqlx::query(
                r#"
                UPDATE gateway_updates
                SET state = ?,
                    progress_percentage = MAX(progress_percentage, ?),
                    current_step = ?,
                    logs = CASE
                        WHEN ? IS NULL THEN logs
                        WHEN logs = '' THEN ?
                        ELSE logs || char(10) || ?
                    END,
                    last_event_digest = ?,
                    applying_started_at = COALESCE(?, applying_started_at),
                    updated_at = ?
                WHERE update_id = ? AND state = ?
                "#,
            )
            .bind(&change.state)
            .bind(change.progress_percentage)
            .bind(&change.current_step)
            .bind(&change.log_line)
            .bind(&change.log_line)
            .bind(&change.log_line)
            .bind(&change.event_digest)
            .bind(change.applying_started_at)
            .bind(change.at)
            .bind(update_id)
            .bind(expected)
            .execute(&mut *tx)
            .await?;
            if result.rows_affected() == 0 {
                tx.rollback().await?;
                return Ok(false);
            }

            tx.commit().await?;
            Ok(true)
        }

        async fn has_event(&self, update_id: Uuid, digest: &str) -> MetadataResult<bool> {
            let found: Option<(i64,)> = sqlx::query_as(
                "SELECT 1 FROM update_events WHERE update_id = ? AND digest = ?",
            )
            .bind(update_id)
            .bind(digest)
            .fetch_optional(&self.pool)
            .await?;
            Ok(found.is_some())
        }

        async fn apply_terminal(
            &self,
            update_id: Uuid,
            expected: &str,
            change: &TerminalChange,
        ) -> MetadataResult<bool> {
            let result = sqlx::query(
                r#"
                UPDATE gateway_updates
                SET state = ?,
                    progress_percentage = CASE
                        WHEN ? = 'success' THEN 100
                        ELSE progress_percentage
                    END,
                    error = COALESCE(?, error),
                    error_kind = COALESCE(?, error_kind),
                    logs = CASE
                        WHEN ? IS NULL THEN logs
                        WHEN logs = '' THEN ?
                        ELSE logs || char(10) || ?
                    END,
                    last_event_digest = ?,
                    completed_at = ?,
                    duration_ms = ?,
                    updated_at = ?
                WHERE update_id = ? AND state = ?
                "#,
            )
            .bind(&change.state)
            .bind(&change.state)
            .bind(&change.error)
            .bind(&change.error_kind)
            .bind(&change.log_line)
            .bind(&change.log_line)
            .bind(&change.log_line)
            .bind(&change.event_digest)
            .bind(change.completed_at)
            .bind(change.duration_ms)
            .bind(change.completed_at)
            .bind(update_id)
            .bind(expected)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() > 0)
        }

        async fn mark_rollback_requested(
            &self,
            update_id: Uuid,
            requested_at: OffsetDateTime,
        ) -> MetadataResult<bool> {
            let result = sqlx::query(
                r#"
                UPDATE gateway_updates
                SET rollback_requested_at = ?, updated_at = ?
                WHERE update_id = ? AND state = 'failed' AND rollback_requested_at IS NULL
                "#,
            )
            .bind(requested_at)
            .bind(requested_at)
            .bind(update_id)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() > 0)
        }

        async fn list_pending_rollbacks(
            &self,
            gateway_id: &str,
        ) -> MetadataResult<Vec<GatewayUpdateRow>> {
            let rows = sqlx::query_as::<_, GatewayUpdateRow>(
                r#"
                SELECT * FROM gateway_updates
                WHERE gateway_id = ? AND state = 'failed' AND rollback_requested_at IS NOT NULL
                ORDER BY rollback_requested_at
                "#,
            )
            .bind(gateway_id)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn list_stale_applying(
            &self,
            started_before: OffsetDateTime,
        ) -> MetadataResult<Vec<GatewayUpdateRow>> {
            let started = Instant::now();
            let rows = sqlx::query_as::<_, GatewayUpdateRow>(
                r#"
                SELECT * FROM gateway_updates
                WHERE state = 'applying'
                  AND applying_started_at IS NOT NULL
                  AND julianday(applying_started_at) < julianday(?)
                ORDER BY applying_started_at
                "#,
            )
            .bind(started_before)
            .fetch_all(&self.pool)
            .await?;
            self.warn_if_slow("list_stale_applying", started);
            Ok(rows)
        }

        async fn list_stale_pending(
            &self,
            idle_since: OffsetDateTime,
            max_retries: i64,
        ) -> MetadataResult<Vec<GatewayUpdateRow>> {
            let started = Instant::now();
            let rows = sqlx::query_as::<_, GatewayUpdateRow>(
                r#"
                SELECT * FROM gateway_updates
                WHERE state = 'pending'
                  AND retry_count < ?
                  AND julianday(updated_at) < julianday(?)
                ORDER BY updated_at
                "#,
            )
            .bind(max_retries)
            .bind(idle_since)
            .fetch_all(&self.pool)
            .await?;
            self.warn_if_slow("list_stale_pending", started);
            Ok(rows)
        }

        async fn record_redelivery(
            &self,
            update_id: Uuid,
            max_retries: i64,
            at: OffsetDateTime,
        ) -> MetadataResult<bool> {
            let result = sqlx::query(
                r#"
                UPDATE gateway_updates
                SET retry_count = retry_count + 1, updated_at = ?
                WHERE update_id = ? AND state = 'pending' AND retry_count < ?
                "#,
            )
            .bind(at)
            .bind(update_id)
            .bind(max_retries)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() > 0)
        }
    }

    #[async_trait]
    impl BackupRepo for SqliteStore {
        async fn create_backup(&self, backup: &GatewayBackupRow) -> MetadataResult<bool> {
            let result = sqlx::query(
                r#"
                INSERT OR IGNORE INTO gateway_backups (
                    backup_id, gateway_id, manifest_id, update_id, bundle_path,
                    confirmed, created_at, confirmed_at, retain_until
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(backup.backup_id)
            .bind(&backup.gateway_id)
            .bind(backup.manifest_id)
            .bind(backup.update_id)
            .bind(&backup.bundle_path)
            .bind(backup.confirmed)
            .bind(backup.created_at)
            .bind(backup.confirmed_at)
            .bind(backup.retain_until)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() > 0)
        }

        async fn get_backup(
            &self,
            gateway_id: &str,
            manifest_id: Uuid,
        ) -> MetadataResult<Option<GatewayBackupRow>> {
            let row = sqlx::query_as::<_, GatewayBackupRow>(
                "SELECT * FROM gateway_backups WHERE gateway_id = ? AND manifest_id = ?",
            )
            .bind(gateway_id)
            .bind(manifest_id)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn confirm_backup(
            &self,
            gateway_id: &str,
            manifest_id: Uuid,
            bundle_path: Option<&str>,
            confirmed_at: OffsetDateTime,
        ) -> MetadataResult<bool> {
            let result = sqlx::query(
                r#"
                UPDATE gateway_backups
                SET confirmed = 1,
                    bundle_path = COALESCE(?, bundle_path),
                    confirmed_at = COALESCE(confirmed_at, ?)
                WHERE gateway_id = ? AND manifest_id = ?
                "#,
            )
            .bind(bundle_path)
            .bind(confirmed_at)
            .bind(gateway_id)
            .bind(manifest_id)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() > 0)
        }

        async fn purge_expired_backups(&self, now: OffsetDateTime) -> MetadataResult<u64> {
            let result = sqlx::query(
                "DELETE FROM gateway_backups WHERE julianday(retain_until) < julianday(?)",
            )
            .bind(now)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected())
        }
    }

    #[async_trait]
    impl TokenRepo for SqliteStore {
        async fn create_token(&self, token: &TokenRow) -> MetadataResult<()> {
            let result = sqlx::query(
                r#"
                INSERT INTO tokens (
                    token_id, gateway_id, token_hash, scopes, expires_at,
                    revoked_at, created_at, last_used_at, description
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(token.token_id)
            .bind(&token.gateway_id)
            .bind(&token.token_hash)
            .bind(&token.scopes)
            .bind(token.expires_at)
            .bind(token.revoked_at)
            .bind(token.created_at)
            .bind(token.last_used_at)
            .bind(&token.description)
            .execute(&self.pool)
            .await;

            match result {
                Ok(_) => Ok(()),
                Err(e) if is_unique_violation(&e) => {
                    Err(MetadataError::AlreadyExists("token hash".to_string()))
                }
                Err(e) => Err(e.into()),
            }
        }

        async fn get_token_by_hash(&self, token_hash: &str) -> MetadataResult<Option<TokenRow>> {
            let row = sqlx::query_as::<_, TokenRow>("SELECT * FROM tokens WHERE token_hash = ?")
                .bind(token_hash)
                .fetch_optional(&self.pool)
                .await?;
            Ok(row)
        }

        async fn get_token(&self, token_id: Uuid) -> MetadataResult<Option<TokenRow>> {
            let row = sqlx::query_as::<_, TokenRow>("SELECT * FROM tokens WHERE token_id = ?")
                .bind(token_id)
                .fetch_optional(&self.pool)
                .await?;
            Ok(row)
        }

        async fn touch_token(&self, token_id: Uuid, used_at: OffsetDateTime) -> MetadataResult<()> {
            sqlx::query("UPDATE tokens SET last_used_at = ? WHERE token_id = ?")
                .bind(used_at)
                .bind(token_id)
                .execute(&self.pool)
                .await?;
            Ok(())
        }

        async fn revoke_token(
            &self,
            token_id: Uuid,
            revoked_at: OffsetDateTime,
        ) -> MetadataResult<bool> {
            let result = sqlx::query(
                "UPDATE tokens SET revoked_at = ? WHERE token_id = ? AND revoked_at IS NULL",
            )
            .bind(revoked_at)
            .bind(token_id)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() > 0)
        }

        async fn list_tokens(&self, gateway_id: Option<&str>) -> MetadataResult<Vec<TokenRow>> {
            let rows = match gateway_id {
                Some(id) => {
                    sqlx::query_as::<_, TokenRow>(
                        "SELECT * FROM tokens WHERE gateway_id = ? ORDER BY created_at DESC",
                    )
                    .bind(id)
                    .fetch_all(&self.pool)
                    .await?
                }
                None => {
                    sqlx::query_as::<_, TokenRow>("SELECT * FROM tokens ORDER BY created_at DESC")
                        .fetch_all(&self.pool)
                        .await?
                }
            };
            Ok(rows)
        }
    }

    #[async_trait]
    impl BootstrapRepo for SqliteStore {
        async fn get_bootstrap_token_id(&self) -> MetadataResult<Option<Uuid>> {
            let value: Option<Option<Uuid>> =
                sqlx::query_scalar("SELECT bootstrap_token_id FROM bootstrap_state WHERE id = 1")
                    .fetch_optional(&self.pool)
                    .await?;
            Ok(value.flatten())
        }

        async fn set_bootstrap_token_id(&self, token_id: Uuid) -> MetadataResult<()> {
            sqlx::query(
                r#"
                INSERT INTO bootstrap_state (id, bootstrap_token_id)
                VALUES (1, ?)
                ON CONFLICT(id) DO UPDATE
                SET bootstrap_token_id = excluded.bootstrap_token_id
                "#,
            )
            .bind(token_id)
            .execute(&self.pool)
            .await?;
            Ok(())
        }
    }

    #[async_trait]
    impl EscalationRepo for SqliteStore {
        async fn create_escalation(&self, escalation: &EscalationRow) -> MetadataResult<bool> {
            let result = sqlx::query(
                r#"
                INSERT OR IGNORE INTO escalations (
                    escalation_id, gateway_id, manifest_id, update_id, severity,
                    message, created_at, acknowledged_at, acknowledged_by, note
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(escalation.escalation_id)
            .bind(&escalation.gateway_id)
            .bind(escalation.manifest_id)
            .bind(escalation.update_id)
            .bind(&escalation.severity)
            .bind(&escalation.message)
            .bind(escalation.created_at)
            .bind(escalation.acknowledged_at)
            .bind(&escalation.acknowledged_by)
            .bind(&escalation.note)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() > 0)
        }

        async fn get_escalation(
            &self,
            escalation_id: Uuid,
        ) -> MetadataResult<Option<EscalationRow>> {
            let row = sqlx::query_as::<_, EscalationRow>(
                "SELECT * FROM escalations WHERE escalation_id = ?",
            )
            .bind(escalation_id)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn list_escalations(&self, open_only: bool) -> MetadataResult<Vec<EscalationRow>> {
            let rows = if open_only {
                sqlx::query_as::<_, EscalationRow>(
                    "SELECT * FROM escalations WHERE acknowledged_at IS NULL ORDER BY created_at DESC",
                )
                .fetch_all(&self.pool)
                .await?
            } else {
                sqlx::query_as::<_, EscalationRow>(
                    "SELECT * FROM escalations ORDER BY created_at DESC",
                )
                .fetch_all(&self.pool)
                .await?
            };
            Ok(rows)
        }

        async fn acknowledge_escalation(
            &self,
            escalation_id: Uuid,
            acknowledged_by: &str,
            note: &str,
            acknowledged_at: OffsetDateTime,
        ) -> MetadataResult<bool> {
            let result = sqlx::query(
                r#"
                UPDATE escalations
                SET acknowledged_at = ?, acknowledged_by = ?, note = ?
                WHERE escalation_id = ? AND acknowledged_at IS NULL
                "#,
            )
            .bind(acknowledged_at)
            .bind(acknowledged_by)
            .bind(note)
            .bind(escalation_id)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() > 0)
        }
    }
}

const SCHEMA_SQL: &str = r#"
-- Release manifests
CREATE TABLE IF NOT EXISTS manifests (
    manifest_id BLOB PRIMARY KEY,
    version TEXT NOT NULL UNIQUE,
    description TEXT NOT NULL DEFAULT '',
    document TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'draft',
    critical INTEGER NOT NULL DEFAULT 0,
    rollback_safe INTEGER NOT NULL DEFAULT 0,
    requires_reboot INTEGER NOT NULL DEFAULT 0,
    min_gateway_version TEXT NOT NULL,
    max_gateway_version TEXT NOT NULL,
    content_hash TEXT UNIQUE,
    signature_hex TEXT,
    manifest_url TEXT,
    signature_url TEXT,
    rollout_percentage INTEGER NOT NULL DEFAULT 0,
    total_count INTEGER NOT NULL DEFAULT 0,
    updated_count INTEGER NOT NULL DEFAULT 0,
    failed_count INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    published_at TEXT,
    completed_at TEXT,
    CHECK (updated_count + failed_count <= total_count)
);
CREATE INDEX IF NOT EXISTS idx_manifests_status ON manifests(status);

-- One row per (gateway, manifest)
CREATE TABLE IF NOT EXISTS gateway_updates (
    update_id BLOB PRIMARY KEY,
    gateway_id TEXT NOT NULL,
    manifest_id BLOB NOT NULL REFERENCES manifests(manifest_id),
    version TEXT NOT NULL,
    state TEXT NOT NULL DEFAULT 'pending',
    progress_percentage INTEGER NOT NULL DEFAULT 0,
    current_step TEXT NOT NULL DEFAULT '',
    logs TEXT NOT NULL DEFAULT '',
    last_event_digest TEXT,
    retry_count INTEGER NOT NULL DEFAULT 0,
    error TEXT,
    error_kind TEXT,
    dispatched_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    applying_started_at TEXT,
    rollback_requested_at TEXT,
    completed_at TEXT,
    duration_ms INTEGER,
    UNIQUE(gateway_id, manifest_id)
);
CREATE INDEX IF NOT EXISTS idx_gateway_updates_manifest ON gateway_updates(manifest_id);
CREATE INDEX IF NOT EXISTS idx_gateway_updates_state ON gateway_updates(state);
-- At most one in-flight update per gateway
CREATE UNIQUE INDEX IF NOT EXISTS idx_gateway_updates_active
ON gateway_updates(gateway_id)
WHERE state IN ('pending', 'downloading', 'verifying', 'backing_up', 'applying');

-- Digests of every progress event applied to a row
CREATE TABLE IF NOT EXISTS update_events (
    update_id BLOB NOT NULL,
    digest TEXT NOT NULL,
    received_at TEXT NOT NULL,
    PRIMARY KEY (update_id, digest)
);

-- Backup references created at backing_up
CREATE TABLE IF NOT EXISTS gateway_backups (
    backup_id BLOB PRIMARY KEY,
    gateway_id TEXT NOT NULL,
    manifest_id BLOB NOT NULL REFERENCES manifests(manifest_id),
    update_id BLOB NOT NULL,
    bundle_path TEXT,
    confirmed INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    confirmed_at TEXT,
    retain_until TEXT NOT NULL,
    UNIQUE(gateway_id, manifest_id)
);
CREATE INDEX IF NOT EXISTS idx_gateway_backups_retention ON gateway_backups(retain_until);

-- API tokens
CREATE TABLE IF NOT EXISTS tokens (
    token_id BLOB PRIMARY KEY,
    gateway_id TEXT,
    token_hash TEXT NOT NULL UNIQUE,
    scopes TEXT NOT NULL,
    expires_at TEXT,
    revoked_at TEXT,
    created_at TEXT NOT NULL,
    last_used_at TEXT,
    description TEXT
);
CREATE INDEX IF NOT EXISTS idx_tokens_gateway ON tokens(gateway_id);

-- Bootstrap admin token marker (single row)
CREATE TABLE IF NOT EXISTS bootstrap_state (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    bootstrap_token_id BLOB
);

-- Human-actionable failures
CREATE TABLE IF NOT EXISTS escalations (
    escalation_id BLOB PRIMARY KEY,
    gateway_id TEXT NOT NULL,
    manifest_id BLOB NOT NULL,
    update_id BLOB NOT NULL UNIQUE,
    severity TEXT NOT NULL,
    message TEXT NOT NULL,
    created_at TEXT NOT NULL,
    acknowledged_at TEXT,
    acknowledged_by TEXT,
    note TEXT
);
CREATE INDEX IF NOT EXISTS idx_escalations_open ON escalations(acknowledged_at);
"#;
