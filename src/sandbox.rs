//! Sandbox preflight: prove a diff applies and passes the test suite in a
//! disposable worktree before it is ever stored on a proposal.
//!
//! The real working tree is never touched. The worktree is removed on every
//! exit path, including panics, through [`SandboxWorktree`]'s `Drop`.

use crate::git_ops::{ApplyMode, Git};
use crate::runner::{RunLog, Toolchain};
use crate::util::hash_str;
use anyhow::{Context, Result};
use chrono::Local;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

const SANDBOX_ROOT_DIR: &str = "selfpatch-sandbox";
const PATCH_FILE: &str = "candidate.diff";

static SANDBOX_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SandboxError {
    #[error("required tool not found: {0}")]
    ToolMissing(String),
    #[error("preflight step '{0}' failed")]
    StepFailed(String),
}

impl SandboxError {
    pub fn step(&self) -> &str {
        match self {
            SandboxError::ToolMissing(_) => "tools",
            SandboxError::StepFailed(step) => step,
        }
    }
}

/// Cumulative log plus the verdict of one preflight run.
#[derive(Debug)]
pub struct PreflightReport {
    pub log: RunLog,
    pub result: Result<(), SandboxError>,
}

impl PreflightReport {
    pub fn passed(&self) -> bool {
        self.result.is_ok()
    }
}

/// A detached checkout of HEAD in `$TMPDIR/selfpatch-sandbox/<unique>/worktree`.
#[derive(Debug)]
pub struct SandboxWorktree {
    git: Git,
    source_repo: PathBuf,
    run_root: PathBuf,
    worktree_path: PathBuf,
    cleaned: bool,
}

impl SandboxWorktree {
    pub fn create(git: &Git, source_repo: &Path) -> Result<Self> {
        let source_repo = source_repo.canonicalize().with_context(|| {
            format!("Failed to resolve source repo '{}'", source_repo.display())
        })?;
        let run_root = std::env::temp_dir()
            .join(SANDBOX_ROOT_DIR)
            .join(unique_run_name(&source_repo));
        let worktree_path = run_root.join("worktree");

        std::fs::create_dir_all(&run_root).with_context(|| {
            format!(
                "Failed to create sandbox run directory '{}'",
                run_root.display()
            )
        })?;

        let session = Self {
            git: git.clone(),
            source_repo,
            run_root,
            worktree_path,
            cleaned: false,
        };
        // On failure the Drop below clears the run directory.
        git.worktree_add_detached(&session.source_repo, &session.worktree_path)?;
        Ok(session)
    }

    pub fn path(&self) -> &Path {
        &self.worktree_path
    }

    pub fn run_root(&self) -> &Path {
        &self.run_root
    }

    /// Write the patch next to (not inside) the worktree.
    pub fn write_patch(&self, diff: &str) -> Result<PathBuf> {
        let path = self.run_root.join(PATCH_FILE);
        std::fs::write(&path, diff)
            .with_context(|| format!("Failed to write patch '{}'", path.display()))?;
        Ok(path)
    }

    /// Remove the worktree, prune its metadata and delete the run directory.
    pub fn cleanup(&mut self) -> Result<()> {
        if self.cleaned {
            return Ok(());
        }
        self.cleaned = true;

        let mut first_error = None;
        if self.worktree_path.exists() {
            if let Err(err) = self.git.worktree_remove(&self.source_repo, &self.worktree_path) {
                first_error = Some(err);
            }
        }
        if let Err(err) = self.git.worktree_prune(&self.source_repo) {
            first_error.get_or_insert(err);
        }
        if self.run_root.exists() {
            if let Err(err) = std::fs::remove_dir_all(&self.run_root) {
                first_error.get_or_insert(err.into());
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Drop for SandboxWorktree {
    fn drop(&mut self) {
        if let Err(err) = self.cleanup() {
            tracing::warn!(
                worktree = %self.worktree_path.display(),
                error = %err,
                "sandbox cleanup failed"
            );
        }
    }
}

fn unique_run_name(repo: &Path) -> String {
    let repo_key = hash_str(&repo.to_string_lossy());
    format!(
        "{}-{}-{}-{}",
        &repo_key[..8],
        Local::now().format("%Y%m%d-%H%M%S%.3f"),
        std::process::id(),
        SANDBOX_SEQ.fetch_add(1, Ordering::Relaxed)
    )
}

/// Check, apply and test `diff` against a throwaway checkout of HEAD.
pub fn preflight(repo_root: &Path, diff: &str, tools: &Toolchain) -> PreflightReport {
    let mut log = RunLog::new();
    let result = run_preflight(repo_root, diff, tools, &mut log);
    match &result {
        Ok(()) => tracing::info!(repo = %repo_root.display(), "preflight passed"),
        Err(err) => tracing::warn!(repo = %repo_root.display(), error = %err, "preflight failed"),
    }
    PreflightReport { log, result }
}

fn run_preflight(
    repo_root: &Path,
    diff: &str,
    tools: &Toolchain,
    log: &mut RunLog,
) -> Result<(), SandboxError> {
    tools.check(log).map_err(SandboxError::ToolMissing)?;

    let mut worktree = match SandboxWorktree::create(&tools.git, repo_root) {
        Ok(worktree) => {
            log.note(
                "worktree",
                true,
                format!("detached checkout at {}", worktree.path().display()),
            );
            worktree
        }
        Err(err) => {
            log.note("worktree", false, format!("{:#}", err));
            return Err(SandboxError::StepFailed("worktree".to_string()));
        }
    };

    let outcome = run_in_worktree(&worktree, diff, tools, log);

    match worktree.cleanup() {
        Ok(()) => log.note("cleanup", true, "worktree removed"),
        // Cleanup trouble never changes the verdict.
        Err(err) => {
            tracing::warn!(error = %err, "sandbox cleanup failed");
            log.note("cleanup", true, format!("best-effort cleanup: {:#}", err));
        }
    }
    outcome
}

fn run_in_worktree(
    worktree: &SandboxWorktree,
    diff: &str,
    tools: &Toolchain,
    log: &mut RunLog,
) -> Result<(), SandboxError> {
    let patch = match worktree.write_patch(diff) {
        Ok(path) => path,
        Err(err) => {
            log.note("write patch", false, format!("{:#}", err));
            return Err(SandboxError::StepFailed("write patch".to_string()));
        }
    };

    let steps = [
        tools.git.apply_step(ApplyMode::Check, worktree.path(), &patch),
        tools.git.apply_step(ApplyMode::Apply, worktree.path(), &patch),
        tools.test_step(worktree.path()),
    ];
    for step in &steps {
        if !log.run(step) {
            return Err(SandboxError::StepFailed(step.name.clone()));
        }
    }
    Ok(())
}
