//! Operator token provisioning at startup.

use anyhow::{Context, Result, bail};
use otter_core::config::AdminConfig;
use otter_core::token::TokenScope;
use otter_metadata::MetadataStore;
use otter_metadata::models::TokenRow;
use time::OffsetDateTime;
use uuid::Uuid;

/// Canonical form of a configured token hash: lowercase hex, optional
/// `sha256:` prefix removed.
pub fn normalize_token_hash(configured: &str) -> Result<String> {
    let hash = configured
        .trim()
        .strip_prefix("sha256:")
        .unwrap_or(configured.trim())
        .to_ascii_lowercase();
    if hash.len() != 64 || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
        bail!("invalid admin token_hash: expected 64 hex chars");
    }
    Ok(hash)
}

/// Make sure the configured operator token exists.
///
/// When the configured hash changes between restarts, the token created for
/// the old hash is revoked before the new one is stored.
pub async fn ensure_admin_token(metadata: &dyn MetadataStore, config: &AdminConfig) -> Result<()> {
    let hash = normalize_token_hash(&config.token_hash)?;
    let now = OffsetDateTime::now_utc();

    if let Some(existing) = metadata.get_token_by_hash(&hash).await? {
        if existing.revoked_at.is_some() {
            bail!(
                "admin token hash belongs to revoked token {}; configure a new token",
                existing.token_id
            );
        }
        if existing.expires_at.is_some_and(|at| at <= now) {
            bail!(
                "admin token hash belongs to expired token {}; configure a new token",
                existing.token_id
            );
        }
        metadata.set_bootstrap_token_id(existing.token_id).await?;
        tracing::debug!(token_id = %existing.token_id, "Admin token present");
        return Ok(());
    }

    if let Some(previous) = metadata.get_bootstrap_token_id().await? {
        metadata.revoke_token(previous, now).await?;
        tracing::info!(token_id = %previous, "Rotated out previous admin token");
    }

    let scopes = config
        .token_scopes
        .clone()
        .unwrap_or_else(|| vec![TokenScope::FleetAdmin.as_str().to_string()]);
    for scope in &scopes {
        TokenScope::parse(scope).with_context(|| format!("invalid admin scope: {scope}"))?;
    }

    let row = TokenRow {
        token_id: Uuid::new_v4(),
        gateway_id: None,
        token_hash: hash,
        scopes: serde_json::to_string(&scopes)?,
        expires_at: None,
        revoked_at: None,
        created_at: now,
        last_used_at: None,
        description: config
            .token_description
            .clone()
            .or_else(|| Some("fleet operator".to_string())),
    };
    metadata.create_token(&row).await?;
    metadata.set_bootstrap_token_id(row.token_id).await?;
    tracing::info!(token_id = %row.token_id, "Admin token created");

    Ok(())
}
