//! Path policy for drafted diffs.
//!
//! A diff may only touch files under the configured source roots, may never
//! climb out of the repository, never touches a dependency manifest, and
//! (once an index exists) may only modify files the index knows about.

use crate::config::PolicyConfig;
use crate::diff::{header_paths, touched_files, TouchedFile};
use crate::index::SourceCatalog;
use crate::util::resolve_repo_path_allow_new;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GuardError {
    #[error("diff touches no recognizable files")]
    NoFiles,
    #[error("path traversal is not allowed: {0}")]
    Traversal(String),
    #[error("absolute paths are not allowed: {0}")]
    AbsolutePath(String),
    #[error("disallowed path root: {path} (allowed roots: {allowed})")]
    DisallowedRoot { path: String, allowed: String },
    #[error("diff touches dependency manifest {0}")]
    ManifestTouched(String),
    #[error("{0} is not indexed; only known source files may be modified")]
    NotIndexed(String),
    #[error("path escapes the repository: {path} ({reason})")]
    EscapesRepo { path: String, reason: String },
    #[error("source index is empty and policy requires one; run `selfpatch reindex`")]
    IndexRequired,
}

/// Allow-list and manifest names, injected from configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardPolicy {
    pub allowed_roots: Vec<String>,
    pub manifest_files: Vec<String>,
    pub require_index: bool,
}

impl From<&PolicyConfig> for GuardPolicy {
    fn from(config: &PolicyConfig) -> Self {
        Self {
            allowed_roots: config.allowed_roots.clone(),
            manifest_files: config.manifest_files.clone(),
            require_index: config.require_index,
        }
    }
}

impl Default for GuardPolicy {
    fn default() -> Self {
        Self::from(&PolicyConfig::default())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardReport {
    pub files: Vec<TouchedFile>,
    pub warnings: Vec<String>,
}

pub struct PathGuard<'a, C: SourceCatalog + ?Sized> {
    repo_root: &'a Path,
    policy: &'a GuardPolicy,
    catalog: &'a C,
}

impl<'a, C: SourceCatalog + ?Sized> PathGuard<'a, C> {
    pub fn new(repo_root: &'a Path, policy: &'a GuardPolicy, catalog: &'a C) -> Self {
        Self {
            repo_root,
            policy,
            catalog,
        }
    }

    pub fn check(&self, diff: &str) -> Result<GuardReport, GuardError> {
        let headers = header_paths(diff);
        for path in &headers {
            if self.is_manifest(path) {
                return Err(GuardError::ManifestTouched(path.clone()));
            }
        }

        let files = touched_files(diff);
        if files.is_empty() {
            return Err(GuardError::NoFiles);
        }

        // Rename and copy sources, and the `a/` side, never show up in
        // `files` but are still written or removed by git apply.
        for path in &headers {
            self.check_path(path)?;
        }

        let mut warnings = Vec::new();
        let catalog_empty = self.catalog.is_empty();
        if catalog_empty && files.iter().any(|f| !f.is_new) {
            if self.policy.require_index {
                return Err(GuardError::IndexRequired);
            }
            let warning =
                "source index is empty; existing files were not checked against it (run `selfpatch reindex`)"
                    .to_string();
            tracing::warn!("{}", warning);
            warnings.push(warning);
        }

        for file in &files {
            self.check_path(&file.path)?;
            if !file.is_new && !catalog_empty && !self.catalog.contains(&file.path) {
                return Err(GuardError::NotIndexed(file.path.clone()));
            }
        }

        Ok(GuardReport { files, warnings })
    }

    fn is_manifest(&self, path: &str) -> bool {
        let name = path.rsplit('/').next().unwrap_or(path);
        self.policy.manifest_files.iter().any(|m| m == name)
    }

    fn check_path(&self, path: &str) -> Result<(), GuardError> {
        if path.starts_with('/') || Path::new(path).is_absolute() || has_drive_prefix(path) {
            return Err(GuardError::AbsolutePath(path.to_string()));
        }
        if path.split('/').any(|segment| segment == "..") {
            return Err(GuardError::Traversal(path.to_string()));
        }

        let mut segments = path.split('/').filter(|s| !s.is_empty() && *s != ".");
        let root = segments.next().unwrap_or("");
        let has_rest = segments.next().is_some();
        if !has_rest || !self.policy.allowed_roots.iter().any(|r| r == root) {
            return Err(GuardError::DisallowedRoot {
                path: path.to_string(),
                allowed: self.policy.allowed_roots.join(", "),
            });
        }

        resolve_repo_path_allow_new(self.repo_root, Path::new(path)).map_err(|reason| {
            GuardError::EscapesRepo {
                path: path.to_string(),
                reason,
            }
        })?;
        Ok(())
    }
}

/// Check every path a diff touches against `policy`.
pub fn guard<C: SourceCatalog + ?Sized>(
    diff: &str,
    repo_root: &Path,
    policy: &GuardPolicy,
    catalog: &C,
) -> Result<GuardReport, GuardError> {
    PathGuard::new(repo_root, policy, catalog).check(diff)
}

fn has_drive_prefix(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}
