//! Release manifest document.
//!
//! The document is what gets signed and served at `manifest_url`. Agents
//! verify the detached signature over the exact bytes they downloaded and only
//! then parse them with [`ManifestDocument::from_json`].

use crate::hash::ContentHash;
use crate::migration::MigrationCommand;
use crate::version::{CompatibilityRange, SemVersion};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Component, Path};

/// How a config change is written to its target file.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigAction {
    /// Overwrite the file with `content` (a string).
    Replace,
    /// Append `content` (a string) unless the file already ends with it.
    Append,
    /// Deep-merge `content` (a JSON object) into the file's JSON document.
    JsonMerge,
}

/// One ordered change to a file under the gateway's config root.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConfigChange {
    /// Path relative to the config root.
    pub file: String,
    pub action: ConfigAction,
    pub content: serde_json::Value,
}

impl ConfigChange {
    fn validate(&self, index: usize) -> crate::Result<()> {
        let invalid = |msg: String| {
            crate::Error::InvalidManifest(format!("config_changes[{index}]: {msg}"))
        };

        if self.file.is_empty() {
            return Err(invalid("file is empty".to_string()));
        }
        let path = Path::new(&self.file);
        for component in path.components() {
            match component {
                Component::Normal(_) | Component::CurDir => {}
                Component::ParentDir => {
                    return Err(invalid(format!("{:?} escapes the config root", self.file)));
                }
                Component::RootDir | Component::Prefix(_) => {
                    return Err(invalid(format!("{:?} must be relative", self.file)));
                }
            }
        }

        match (self.action, &self.content) {
            (ConfigAction::Replace | ConfigAction::Append, serde_json::Value::String(_)) => Ok(()),
            (ConfigAction::JsonMerge, serde_json::Value::Object(_)) => Ok(()),
            (ConfigAction::JsonMerge, _) => {
                Err(invalid("json_merge content must be an object".to_string()))
            }
            _ => Err(invalid("replace/append content must be a string".to_string())),
        }
    }
}

/// A signed, versioned description of one fleet release.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ManifestDocument {
    pub version: String,
    #[serde(default)]
    pub description: String,
    /// Service name to image reference.
    #[serde(default)]
    pub docker_images: BTreeMap<String, String>,
    #[serde(default)]
    pub config_changes: Vec<ConfigChange>,
    #[serde(default)]
    pub migrations: Vec<String>,
    #[serde(default)]
    pub pre_update_hooks: Vec<String>,
    #[serde(default)]
    pub post_update_hooks: Vec<String>,
    #[serde(default)]
    pub rollback_commands: Vec<String>,
    pub min_gateway_version: String,
    pub max_gateway_version: String,
    #[serde(default)]
    pub critical: bool,
    #[serde(default)]
    pub rollback_safe: bool,
    #[serde(default)]
    pub requires_reboot: bool,
}

impl ManifestDocument {
    /// Parse the release version.
    pub fn semver(&self) -> crate::Result<SemVersion> {
        SemVersion::parse(&self.version)
    }

    /// Parse the agent compatibility range.
    pub fn compatibility(&self) -> crate::Result<CompatibilityRange> {
        CompatibilityRange::parse(&self.min_gateway_version, &self.max_gateway_version)
    }

    /// Validate the document for publication.
    ///
    /// Hard errors reject the manifest. Command lines that are not on the
    /// allow-list are accepted but reported back as warnings, since the
    /// agent skips them at apply time.
    pub fn validate(&self) -> crate::Result<Vec<String>> {
        self.semver()?;
        self.compatibility()?;

        for (service, image) in &self.docker_images {
            if service.is_empty() || image.is_empty() {
                return Err(crate::Error::InvalidManifest(
                    "docker_images entries need a service name and an image".to_string(),
                ));
            }
            if image.chars().any(char::is_whitespace) {
                return Err(crate::Error::InvalidManifest(format!(
                    "docker_images.{service}: image reference contains whitespace"
                )));
            }
        }

        for (index, change) in self.config_changes.iter().enumerate() {
            change.validate(index)?;
        }

        let mut warnings = Vec::new();
        for (field, commands) in self.command_lists() {
            for (index, line) in commands.iter().enumerate() {
                if let Err(e) = MigrationCommand::parse(line) {
                    warnings.push(format!("{field}[{index}] will be skipped: {e}"));
                }
            }
        }
        Ok(warnings)
    }

    fn command_lists(&self) -> [(&'static str, &[String]); 4] {
        [
            ("pre_update_hooks", &self.pre_update_hooks),
            ("migrations", &self.migrations),
            ("post_update_hooks", &self.post_update_hooks),
            ("rollback_commands", &self.rollback_commands),
        ]
    }

    /// Serialize to the canonical byte form that is hashed and signed.
    pub fn to_json(&self) -> crate::Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| crate::Error::Serialization(e.to_string()))
    }

    /// Deserialize from JSON bytes.
    pub fn from_json(bytes: &[u8]) -> crate::Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| crate::Error::Serialization(e.to_string()))
    }

    /// Content hash of the canonical bytes.
    pub fn content_hash(&self) -> crate::Result<ContentHash> {
        Ok(ContentHash::compute(&self.to_json()?))
    }
}
