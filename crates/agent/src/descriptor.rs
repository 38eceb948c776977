//! Service descriptor (JSON compose document).
//!
//! Image tags are changed by editing `services.<name>.image` in the parsed
//! document, never by text substitution.

use crate::error::{AgentError, AgentResult};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct ServiceDescriptor {
    path: PathBuf,
    document: Value,
}

impl ServiceDescriptor {
    pub fn load(path: &Path) -> AgentResult<Self> {
        let raw = std::fs::read(path).map_err(|e| {
            AgentError::Apply(format!("cannot read service descriptor {}: {e}", path.display()))
        })?;
        let document: Value = serde_json::from_slice(&raw).map_err(|e| {
            AgentError::Apply(format!("service descriptor {} is not JSON: {e}", path.display()))
        })?;
        if !document.get("services").is_some_and(Value::is_object) {
            return Err(AgentError::Apply(format!(
                "service descriptor {} has no services object",
                path.display()
            )));
        }
        Ok(Self {
            path: path.to_path_buf(),
            document,
        })
    }

    /// Current image per service.
    pub fn images(&self) -> BTreeMap<String, String> {
        self.document["services"]
            .as_object()
            .map(|services| {
                services
                    .iter()
                    .filter_map(|(name, svc)| {
                        svc.get("image")
                            .and_then(Value::as_str)
                            .map(|image| (name.clone(), image.to_string()))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Point a declared service at a new image.
    pub fn set_image(&mut self, service: &str, image: &str) -> AgentResult<()> {
        let entry = self
            .document
            .get_mut("services")
            .and_then(|services| services.get_mut(service))
            .and_then(Value::as_object_mut)
            .ok_or_else(|| {
                AgentError::Apply(format!("service {service:?} is not in the descriptor"))
            })?;
        entry.insert("image".to_string(), Value::String(image.to_string()));
        Ok(())
    }

    /// Write back atomically.
    pub fn save(&self) -> AgentResult<()> {
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(&self.document)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn write(dir: &Path, doc: &Value) -> PathBuf {
        let path = dir.join("compose.json");
        std::fs::write(&path, serde_json::to_vec(doc).unwrap()).unwrap();
        path
    }

    #[test]
    fn test_set_image_keeps_other_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            &json!({
                "services": {
                    "api": {"image": "registry.local/api:1.4.0", "ports": ["8080:8080"]},
                    "worker": {"image": "registry.local/worker:1.4.0"}
                }
            }),
        );

        let mut descriptor = ServiceDescriptor::load(&path).unwrap();
        descriptor.set_image("api", "registry.local/api:1.5.0").unwrap();
        descriptor.save().unwrap();

        let reloaded: Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(reloaded["services"]["api"]["image"], "registry.local/api:1.5.0");
        assert_eq!(reloaded["services"]["api"]["ports"], json!(["8080:8080"]));
        assert_eq!(reloaded["services"]["worker"]["image"], "registry.local/worker:1.4.0");
    }

    #[test]
    fn test_unknown_service_is_an_apply_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), &json!({"services": {"api": {"image": "a:1"}}}));
        let mut descriptor = ServiceDescriptor::load(&path).unwrap();
        assert!(matches!(
            descriptor.set_image("db", "postgres:16"),
            Err(AgentError::Apply(_))
        ));
    }

    #[test]
    fn test_descriptor_needs_services() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), &json!({"version": "3"}));
        assert!(ServiceDescriptor::load(&path).is_err());
    }
}
