//! Manifest registry: authoring, validation, signing and publication.

use crate::context::RequestContext;
use crate::error::{FleetError, FleetResult};
use crate::metrics;
use otter_core::config::ServerConfig;
use otter_core::{
    CompatibilityRange, ContentHash, ManifestDocument, ManifestStatus, SemVersion, is_compatible,
};
use otter_metadata::MetadataError;
use otter_metadata::MetadataStore;
use otter_metadata::models::ManifestRow;
use otter_metadata::repos::PublishedArtifacts;
use otter_signer::Signer;
use std::cmp::Ordering;
use std::sync::Arc;
use time::OffsetDateTime;
use uuid::Uuid;

/// Which published document to serve.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArtifactKind {
    Manifest,
    Signature,
}

impl ArtifactKind {
    pub fn from_file_name(name: &str) -> Option<Self> {
        match name {
            "manifest.json" => Some(Self::Manifest),
            "manifest.sig" => Some(Self::Signature),
            _ => None,
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Manifest => "application/json",
            Self::Signature => "text/plain; charset=utf-8",
        }
    }
}

#[derive(Clone)]
pub struct Registry {
    metadata: Arc<dyn MetadataStore>,
    signer: Option<Arc<dyn Signer>>,
    server: ServerConfig,
}

impl Registry {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        signer: Option<Arc<dyn Signer>>,
        server: ServerConfig,
    ) -> Self {
        Self {
            metadata,
            signer,
            server,
        }
    }

    /// Store a new draft manifest.
    ///
    /// Returns the stored row and authoring warnings for entries agents will
    /// skip (non-allow-listed commands).
    pub async fn create(
        &self,
        ctx: &RequestContext,
        document: ManifestDocument,
    ) -> FleetResult<(ManifestRow, Vec<String>)> {
        let version = document.semver()?;
        let warnings = document.validate()?;

        if self
            .metadata
            .get_manifest_by_version(&document.version)
            .await?
            .is_some()
        {
            return Err(FleetError::DuplicateVersion(document.version));
        }

        let canonical = String::from_utf8(document.to_json()?)
            .map_err(|e| FleetError::InvalidManifest(format!("non UTF-8 document: {e}")))?;

        let now = OffsetDateTime::now_utc();
        let row = ManifestRow {
            manifest_id: Uuid::new_v4(),
            version: document.version.clone(),
            description: document.description.clone(),
            document: canonical,
            status: ManifestStatus::Draft.as_str().to_string(),
            critical: document.critical,
            rollback_safe: document.rollback_safe,
            requires_reboot: document.requires_reboot,
            min_gateway_version: document.min_gateway_version.clone(),
            max_gateway_version: document.max_gateway_version.clone(),
            content_hash: None,
            signature_hex: None,
            manifest_url: None,
            signature_url: None,
            rollout_percentage: 0,
            total_count: 0,
            updated_count: 0,
            failed_count: 0,
            created_at: now,
            updated_at: now,
            published_at: None,
            completed_at: None,
        };

        match self.metadata.create_manifest(&row).await {
            Ok(()) => {}
            Err(MetadataError::AlreadyExists(_)) => {
                return Err(FleetError::DuplicateVersion(row.version));
            }
            Err(e) => return Err(e.into()),
        }

        for warning in &warnings {
            tracing::warn!(version = %version, warning = %warning, "Manifest authoring warning");
        }
        tracing::info!(
            trace_id = %ctx.trace_id,
            actor = %ctx.actor,
            manifest_id = %row.manifest_id,
            version = %version,
            "Manifest created"
        );
        metrics::MANIFESTS_CREATED.inc();

        Ok((row, warnings))
    }

    pub async fn get(&self, manifest_id: Uuid) -> FleetResult<ManifestRow> {
        self.metadata
            .get_manifest(manifest_id)
            .await?
            .ok_or_else(|| FleetError::NotFound(format!("manifest {manifest_id}")))
    }

    /// All manifests, newest semantic version first.
    pub async fn list(&self) -> FleetResult<Vec<ManifestRow>> {
        let mut rows = self.metadata.list_manifests().await?;
        rows.sort_by(|a, b| compare_versions_desc(&a.version, &b.version));
        Ok(rows)
    }

    /// Move a manifest forward in its lifecycle.
    pub async fn promote(
        &self,
        ctx: &RequestContext,
        manifest_id: Uuid,
        to: ManifestStatus,
    ) -> FleetResult<ManifestRow> {
        let row = self.get(manifest_id).await?;
        let current = ManifestStatus::parse(&row.status)?;
        let next = current.advance(to)?;
        if next == current {
            return Ok(row);
        }
        if next.accepts_rollout() && !row.is_published() {
            return Err(FleetError::NotPublished(row.version));
        }

        let changed = self
            .metadata
            .update_manifest_status(
                manifest_id,
                current.as_str(),
                next.as_str(),
                OffsetDateTime::now_utc(),
            )
            .await?;
        if !changed {
            return Err(FleetError::StatusTransition(format!(
                "{current} -> {next} (status changed concurrently)"
            )));
        }

        tracing::info!(
            trace_id = %ctx.trace_id,
            actor = %ctx.actor,
            manifest_id = %manifest_id,
            from = %current,
            to = %next,
            "Manifest promoted"
        );
        self.get(manifest_id).await
    }

    /// Sign the stored document and record its content-addressed URLs.
    ///
    /// Publishing twice returns the first publication unchanged.
    pub async fn publish(&self, ctx: &RequestContext, manifest_id: Uuid) -> FleetResult<ManifestRow> {
        let row = self.get(manifest_id).await?;
        if row.is_published() {
            return Ok(row);
        }
        let signer = self.signer.as_ref().ok_or(FleetError::SigningUnavailable)?;

        let bytes = row.document.as_bytes();
        let hash = ContentHash::compute(bytes);
        let artifacts = PublishedArtifacts {
            content_hash: hash.to_hex(),
            signature_hex: signer.sign_hex(bytes)?,
            manifest_url: self.server.artifact_url(&hash.manifest_path()),
            signature_url: self.server.artifact_url(&hash.signature_path()),
        };

        let published = self
            .metadata
            .publish_manifest(manifest_id, &artifacts, OffsetDateTime::now_utc())
            .await?;

        if published {
            tracing::info!(
                trace_id = %ctx.trace_id,
                actor = %ctx.actor,
                manifest_id = %manifest_id,
                version = %row.version,
                key_id = %signer.key_id(),
                content_hash = %artifacts.content_hash,
                "Manifest published"
            );
            metrics::MANIFESTS_PUBLISHED.inc();
        }

        self.get(manifest_id).await
    }

    /// Bytes of a published document, exactly as signed.
    pub async fn artifact(&self, content_hash: &str, kind: ArtifactKind) -> FleetResult<Vec<u8>> {
        let hash = ContentHash::from_hex(content_hash)?;
        let row = self
            .metadata
            .get_manifest_by_content_hash(&hash.to_hex())
            .await?
            .ok_or_else(|| FleetError::NotFound(format!("artifact {content_hash}")))?;

        match kind {
            ArtifactKind::Manifest => Ok(row.document.into_bytes()),
            ArtifactKind::Signature => row
                .signature_hex
                .map(String::into_bytes)
                .ok_or_else(|| FleetError::NotFound(format!("signature {content_hash}"))),
        }
    }
}

/// Parse the stored document of a manifest row.
pub fn document_of(row: &ManifestRow) -> FleetResult<ManifestDocument> {
    Ok(ManifestDocument::from_json(row.document.as_bytes())?)
}

/// Compatibility range stored on a manifest row.
pub fn range_of(row: &ManifestRow) -> FleetResult<CompatibilityRange> {
    Ok(CompatibilityRange::parse(
        &row.min_gateway_version,
        &row.max_gateway_version,
    )?)
}

/// Whether an agent reporting `agent_version` may install `row`.
pub fn agent_is_compatible(agent_version: &str, row: &ManifestRow) -> FleetResult<bool> {
    let agent = SemVersion::parse(agent_version)?;
    Ok(is_compatible(&agent, &range_of(row)?))
}

/// Descending semantic-version order; unparseable versions sort last.
fn compare_versions_desc(a: &str, b: &str) -> Ordering {
    match (SemVersion::parse(a), SemVersion::parse(b)) {
        (Ok(a), Ok(b)) => b.cmp(&a),
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_versions_sort_semantically() {
        let mut versions = vec!["1.9.0", "1.10.0", "bogus", "1.2.0", "2.0.0-rc.1", "2.0.0"];
        versions.sort_by(|a, b| compare_versions_desc(a, b));
        assert_eq!(
            versions,
            vec!["2.0.0", "2.0.0-rc.1", "1.10.0", "1.9.0", "1.2.0", "bogus"]
        );
    }

    #[test]
    fn test_artifact_kind_from_file_name() {
        assert_eq!(
            ArtifactKind::from_file_name("manifest.json"),
            Some(ArtifactKind::Manifest)
        );
        assert_eq!(
            ArtifactKind::from_file_name("manifest.sig"),
            Some(ArtifactKind::Signature)
        );
        assert_eq!(ArtifactKind::from_file_name("other"), None);
    }
}
