//! Content-addressed artifact store: one directory per build id.
//!
//! Security guarantees:
//! - Build ids are validated before any path is formed (no traversal)
//! - Served artifact paths are joined component-wise and re-checked
//! - Mutable records are written via write-temp-then-rename, so readers
//!   observe either the old or the new file, never a partial write

use crate::error::{PipelineError, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};

/// Entry document served to the browser.
pub const ENTRY_HTML: &str = "index.html";
/// Bundled module output.
pub const BUNDLE_JS: &str = "app.js";
/// Submitted source, kept verbatim for post-mortem diagnosis.
pub const SOURCE_FILE: &str = "source.tsx";
/// Network policy + declared domains, written by the build step.
pub const MANIFEST_FILE: &str = "manifest.json";
/// Opt-in permissions policy, written by the build step.
pub const POLICY_FILE: &str = "policy.json";
/// Preview screenshot.
pub const PREVIEW_PNG: &str = "preview.png";
/// Full captured install+build output.
pub const BUILD_LOG: &str = "build.log";

/// Files every completed build is expected to have.
const EXPECTED_FILES: &[&str] = &[ENTRY_HTML, BUNDLE_JS, MANIFEST_FILE, POLICY_FILE, PREVIEW_PNG, BUILD_LOG];

/// Read-only view of a build's on-disk artifacts, computed on demand.
#[derive(Debug, Clone)]
pub struct ArtifactSet {
    pub build_dir: PathBuf,
    /// Expected files that are present.
    pub files: BTreeSet<String>,
    /// Expected files that are absent.
    pub missing: Vec<String>,
    pub preview_exists: bool,
    pub bundle_entry_exists: bool,
}

impl ArtifactSet {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }
}

/// Filesystem-backed artifact store rooted at `<root>/builds/`.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Validate a build id as a single safe path component.
    pub fn validate_build_id(id: &str) -> Result<()> {
        let ok = !id.is_empty()
            && !id.starts_with('.')
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if ok {
            Ok(())
        } else {
            Err(PipelineError::InvalidBuildId(id.to_string()))
        }
    }

    /// Directory holding every artifact of one build.
    pub fn build_dir(&self, id: &str) -> Result<PathBuf> {
        Self::validate_build_id(id)?;
        Ok(self.root.join("builds").join(id))
    }

    /// Create the build directory if needed and return it.
    pub fn ensure_build_dir(&self, id: &str) -> Result<PathBuf> {
        let dir = self.build_dir(id)?;
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    pub fn build_dir_exists(&self, id: &str) -> Result<bool> {
        Ok(self.build_dir(id)?.is_dir())
    }

    /// Path of one named artifact of a build.
    pub fn artifact_path(&self, id: &str, name: &str) -> Result<PathBuf> {
        Ok(self.build_dir(id)?.join(name))
    }

    /// Resolve a relative artifact path for serving.
    ///
    /// Defense in depth: the build id is validated and every component of the
    /// relative path must be a normal component (no `..`, no absolute parts).
    pub fn resolve_serve_path(&self, id: &str, rel: &str) -> Result<PathBuf> {
        let dir = self.build_dir(id)?;
        let mut out = dir;
        for comp in Path::new(rel).components() {
            match comp {
                Component::Normal(c) => out.push(c),
                _ => return Err(PipelineError::InvalidBuildId(format!("{id}/{rel}"))),
            }
        }
        Ok(out)
    }

    /// Probe the fixed set of expected filenames and report what is present.
    pub fn artifact_set(&self, id: &str) -> Result<ArtifactSet> {
        let dir = self.build_dir(id)?;
        let mut files = BTreeSet::new();
        let mut missing = Vec::new();
        for name in EXPECTED_FILES {
            if dir.join(name).is_file() {
                files.insert((*name).to_string());
            } else {
                missing.push((*name).to_string());
            }
        }
        Ok(ArtifactSet {
            preview_exists: files.contains(PREVIEW_PNG),
            bundle_entry_exists: files.contains(BUNDLE_JS),
            build_dir: dir,
            files,
            missing,
        })
    }

    /// Names of every expected artifact, for `ARTIFACTS_MISSING` reporting.
    pub fn expected_files() -> Vec<String> {
        EXPECTED_FILES.iter().map(|s| s.to_string()).collect()
    }
}

/// Crash-safe whole-file write: temp file in the target directory, then rename.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| PipelineError::NotFound(path.display().to_string()))?;
    fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.flush()?;
    tmp.persist(path).map_err(|e| PipelineError::Io(e.error))?;
    Ok(())
}

pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    write_atomic(path, &bytes)
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_rejects_traversal_build_ids() {
        for bad in ["", "..", "../x", "a/b", ".hidden", "a\\b"] {
            assert!(ArtifactStore::validate_build_id(bad).is_err(), "{bad}");
        }
        assert!(ArtifactStore::validate_build_id("b-123_ok.v2").is_ok());
    }

    #[test]
    fn test_serve_path_rejects_parent_components() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        assert!(store.resolve_serve_path("b1", "../other/index.html").is_err());
        assert!(store.resolve_serve_path("b1", "/etc/passwd").is_err());
        let ok = store.resolve_serve_path("b1", "assets/logo.png").unwrap();
        assert!(ok.ends_with("builds/b1/assets/logo.png"));
    }

    #[test]
    fn test_artifact_set_reports_missing() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let build = store.ensure_build_dir("b1").unwrap();
        fs::write(build.join(BUNDLE_JS), "export default 1;").unwrap();
        fs::write(build.join(ENTRY_HTML), "<!doctype html>").unwrap();

        let set = store.artifact_set("b1").unwrap();
        assert!(set.bundle_entry_exists);
        assert!(!set.preview_exists);
        assert!(!set.is_complete());
        assert!(set.missing.contains(&PREVIEW_PNG.to_string()));
    }

    #[test]
    fn test_atomic_json_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rec.json");
        write_json_atomic(&path, &serde_json::json!({"a": 1})).unwrap();
        let v: serde_json::Value = read_json(&path).unwrap();
        assert_eq!(v["a"], 1);
    }
}
