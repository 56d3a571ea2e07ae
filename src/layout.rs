//! Resolves safe on-disk paths for `<root>/<fork>/<version>/<file>`.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;

use crate::error::LayoutError;

/// Forks and versions match `[A-Za-z0-9_-][A-Za-z0-9_.-]*`.
static NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-][A-Za-z0-9_.-]*$").expect("valid regex"));

/// Validates a fork or version name against `[A-Za-z0-9_-][A-Za-z0-9_.-]*`.
pub fn validate_name(name: &str) -> bool {
    NAME_RE.is_match(name)
}

/// Resolves absolute on-disk paths under a build root, rejecting any
/// traversal outside of `<root>/<fork>/<version>`.
#[derive(Debug, Clone)]
pub struct BuildLayout {
    root: PathBuf,
}

impl BuildLayout {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The directory holding a fork's version subdirectories.
    pub fn fork_dir(&self, fork: &str) -> Result<PathBuf, LayoutError> {
        if !validate_name(fork) {
            return Err(LayoutError::InvalidFork(fork.to_string()));
        }
        Ok(self.root.join(fork))
    }

    /// `<root>/<fork>/<version>`.
    pub fn version_dir(&self, fork: &str, version: &str) -> Result<PathBuf, LayoutError> {
        if !validate_name(version) {
            return Err(LayoutError::InvalidVersion(version.to_string()));
        }
        Ok(self.fork_dir(fork)?.join(version))
    }

    /// `<root>/<fork>/<version>/<file>`, rejecting `file` names that contain
    /// `/`, `..`, or are exactly `.`.
    pub fn artifact_path(&self, fork: &str, version: &str, file: &str) -> Result<PathBuf, LayoutError> {
        validate_file_component(file)?;
        Ok(self.version_dir(fork, version)?.join(file))
    }

    /// Lists immediate subdirectory names under the fork's build root.
    pub fn list_version_dirs(&self, fork: &str) -> Result<Vec<(PathBuf, std::time::SystemTime)>, LayoutError> {
        let dir = self.fork_dir(fork)?;
        let mut out = Vec::new();
        let Ok(read) = std::fs::read_dir(&dir) else {
            return Ok(out);
        };
        for entry in read.flatten() {
            let Ok(meta) = entry.metadata() else { continue };
            if !meta.is_dir() {
                continue;
            }
            let modified = meta.modified().unwrap_or(std::time::SystemTime::UNIX_EPOCH);
            out.push((entry.path(), modified));
        }
        Ok(out)
    }
}

/// Rejects file-name components containing `/`, `..`, or equal to `.`.
pub fn validate_file_component(file: &str) -> Result<(), LayoutError> {
    if file.is_empty() || file == "." || file == ".." || file.contains('/') || file.contains('\\') {
        return Err(LayoutError::InvalidFile(file.to_string()));
    }
    Ok(())
}

/// File-name components for uploaded publish artifacts additionally match
/// `[A-Za-z0-9_-][A-Za-z0-9_.-]*` (spec.md 4.5).
pub fn validate_publish_file_name(file: &str) -> Result<(), LayoutError> {
    if !validate_name(file) {
        return Err(LayoutError::InvalidFile(file.to_string()));
    }
    Ok(())
}

#[must_use]
pub fn exists(path: &Path) -> bool {
    path.exists()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_simple_names() {
        assert!(validate_name("wow"));
        assert!(validate_name("1.2.3"));
        assert!(validate_name("my-fork_v2"));
    }

    #[test]
    fn rejects_dots_and_slashes_at_start() {
        assert!(!validate_name(".hidden"));
        assert!(!validate_name("/etc"));
        assert!(!validate_name(""));
    }

    #[test]
    fn artifact_path_rejects_traversal() {
        let layout = BuildLayout::new("/srv/builds");
        assert!(layout.artifact_path("wow", "1.0.0", "../../etc/passwd").is_err());
        assert!(layout.artifact_path("wow", "1.0.0", "..").is_err());
        assert!(layout.artifact_path("wow", "1.0.0", "sub/dir").is_err());
        assert!(layout.artifact_path("wow", "1.0.0", "client.zip").is_ok());
    }

    #[test]
    fn fork_and_version_validated_before_join() {
        let layout = BuildLayout::new("/srv/builds");
        assert!(layout.version_dir("..", "1.0.0").is_err());
        assert!(layout.version_dir("wow", "..").is_err());
    }

    #[test]
    fn resolves_expected_path() {
        let layout = BuildLayout::new("/srv/builds");
        let p = layout.artifact_path("wow", "1.0.0", "client.zip").unwrap();
        assert_eq!(p, Path::new("/srv/builds/wow/1.0.0/client.zip"));
    }
}
