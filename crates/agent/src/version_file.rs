//! The local `VERSION` file: the authoritative record of what is installed.

use crate::error::{AgentError, AgentResult};
use otter_core::SemVersion;
use std::path::Path;

/// Read the installed version, falling back to `initial` when the file does
/// not exist yet.
pub fn read(path: &Path, initial: &str) -> AgentResult<SemVersion> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => initial.to_string(),
        Err(e) => return Err(e.into()),
    };
    SemVersion::parse(raw.trim()).map_err(|e| {
        AgentError::Config(format!("{} holds an invalid version: {e}", path.display()))
    })
}

/// Replace the file atomically (write a sibling temp file, then rename).
pub fn write(path: &Path, version: &SemVersion) -> AgentResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, format!("{version}\n"))?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_uses_initial_version() {
        let dir = tempfile::tempdir().unwrap();
        let version = read(&dir.path().join("VERSION"), "1.0.0").unwrap();
        assert_eq!(version.to_string(), "1.0.0");
    }

    #[test]
    fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("VERSION");
        write(&path, &SemVersion::parse("1.4.0").unwrap()).unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "1.4.0\n");
        assert_eq!(read(&path, "0.0.0").unwrap().to_string(), "1.4.0");
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_garbage_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("VERSION");
        std::fs::write(&path, "latest").unwrap();
        assert!(matches!(read(&path, "0.0.0"), Err(AgentError::Config(_))));
    }
}
