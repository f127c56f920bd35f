//! Transactional apply of a preflighted diff onto the real repository.
//!
//! The runner works on a fresh branch, reruns the test suite there and either
//! commits or puts the repository back exactly as it found it: same branch,
//! same tracked contents, temporary branch deleted. It refuses to start on a
//! dirty tree, so `reset --hard` and `clean` are safe last-resort rollbacks.

use crate::git_ops::{self, ApplyMode, HeadTarget};
use crate::runner::{RunLog, Toolchain};
use crate::util::truncate;
use chrono::Local;
use std::path::Path;
use thiserror::Error;

const COMMIT_TITLE_MAX_CHARS: usize = 60;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApplyError {
    #[error("required tool not found: {0}")]
    ToolMissing(String),
    #[error("working tree is not clean ({}); commit or stash first", .0.join(", "))]
    DirtyTree(Vec<String>),
    #[error("apply setup failed: {0}")]
    Setup(String),
    #[error("apply step '{step}' failed; {}", if *.rolled_back { "changes were rolled back" } else { "ROLLBACK INCOMPLETE, inspect the repository" })]
    StepFailed { step: String, rolled_back: bool },
}

impl ApplyError {
    pub fn step(&self) -> &str {
        match self {
            ApplyError::ToolMissing(_) => "tools",
            ApplyError::DirtyTree(_) => "clean tree",
            ApplyError::Setup(_) => "setup",
            ApplyError::StepFailed { step, .. } => step,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub branch: String,
    /// `None` when the diff turned out to change nothing.
    pub commit: Option<String>,
    pub previous: HeadTarget,
}

#[derive(Debug)]
pub struct ApplyReport {
    pub log: RunLog,
    pub result: Result<ApplyOutcome, ApplyError>,
}

pub fn commit_message(proposal_id: u64, title: &str) -> String {
    let first_line = title.lines().next().unwrap_or("").trim();
    format!(
        "selfpatch: apply proposal #{}: {}",
        proposal_id,
        truncate(first_line, COMMIT_TITLE_MAX_CHARS)
    )
}

/// Apply `diff` on a new branch, test, then commit or roll back.
pub fn apply_patch(
    repo_root: &Path,
    proposal_id: u64,
    title: &str,
    diff: &str,
    tools: &Toolchain,
) -> ApplyReport {
    let mut log = RunLog::new();
    let result = Transaction {
        repo: repo_root,
        tools,
        proposal_id,
    }
    .run(title, diff, &mut log);

    match &result {
        Ok(outcome) => tracing::info!(
            proposal = proposal_id,
            branch = %outcome.branch,
            commit = ?outcome.commit,
            "patch applied"
        ),
        Err(err) => tracing::warn!(proposal = proposal_id, error = %err, "apply failed"),
    }
    ApplyReport { log, result }
}

struct Transaction<'a> {
    repo: &'a Path,
    tools: &'a Toolchain,
    proposal_id: u64,
}

/// What has to be undone if a later step fails.
struct Undo<'a> {
    previous: &'a HeadTarget,
    branch: &'a str,
    patch: &'a Path,
    patch_applied: bool,
}

impl Transaction<'_> {
    fn run(&self, title: &str, diff: &str, log: &mut RunLog) -> Result<ApplyOutcome, ApplyError> {
        self.tools.check(log).map_err(ApplyError::ToolMissing)?;

        let dirty = git_ops::dirty_paths(self.repo).map_err(|e| {
            log.note("clean tree", false, format!("{:#}", e));
            ApplyError::Setup(format!("{:#}", e))
        })?;
        if !dirty.is_empty() {
            log.note(
                "clean tree",
                false,
                format!("{} uncommitted path(s)", dirty.len()),
            );
            return Err(ApplyError::DirtyTree(dirty));
        }
        log.note("clean tree", true, "no uncommitted changes");

        let previous = git_ops::head_target(self.repo).map_err(|e| {
            log.note("record HEAD", false, format!("{:#}", e));
            ApplyError::Setup(format!("{:#}", e))
        })?;
        log.note("record HEAD", true, format!("rollback target {}", previous.label()));

        let branch = git_ops::temp_branch_name(self.proposal_id, Local::now(), |name| {
            git_ops::branch_exists(self.repo, name)
        })
        .map_err(|e| ApplyError::Setup(e.to_string()))?;

        let patch_file = write_patch_file(diff).map_err(|e| {
            log.note("write patch", false, format!("{:#}", e));
            ApplyError::Setup(format!("{:#}", e))
        })?;
        let patch = patch_file.path().to_path_buf();

        let git = &self.tools.git;
        if !log.run(&git.step("create branch", self.repo, &["switch", "-c", &branch])) {
            return Err(ApplyError::StepFailed {
                step: "create branch".to_string(),
                rolled_back: true,
            });
        }

        let mut undo = Undo {
            previous: &previous,
            branch: &branch,
            patch: &patch,
            patch_applied: false,
        };

        for mode in [ApplyMode::Check, ApplyMode::Apply] {
            let step = git.apply_step(mode, self.repo, &patch);
            if !log.run(&step) {
                return Err(self.fail(&step.name, &undo, log));
            }
        }
        undo.patch_applied = true;

        let tests = self.tools.test_step(self.repo);
        if !log.run(&tests) {
            return Err(self.fail(&tests.name, &undo, log));
        }

        if !log.run(&git.step("stage", self.repo, &["add", "-A"])) {
            return Err(self.fail("stage", &undo, log));
        }

        let message = commit_message(self.proposal_id, title);
        let committed = log.run(&git.step("commit", self.repo, &["commit", "-m", &message]));
        let commit = if committed {
            git_ops::head_oid(self.repo).ok()
        } else {
            let output = log
                .steps
                .last()
                .map(|s| s.output_tail.clone())
                .unwrap_or_default();
            if !git_ops::is_nothing_to_commit(&output) {
                return Err(self.fail("commit", &undo, log));
            }
            if let Some(step) = log.steps.last_mut() {
                step.success = true;
                step.note = Some("nothing to commit".to_string());
            }
            None
        };

        Ok(ApplyOutcome {
            branch,
            commit,
            previous,
        })
    }

    fn fail(&self, step: &str, undo: &Undo<'_>, log: &mut RunLog) -> ApplyError {
        let rolled_back = self.rollback(undo, log);
        ApplyError::StepFailed {
            step: step.to_string(),
            rolled_back,
        }
    }

    /// Restore the pre-call branch and contents. Returns whether every step
    /// needed to get there succeeded.
    fn rollback(&self, undo: &Undo<'_>, log: &mut RunLog) -> bool {
        let git = &self.tools.git;
        let mut restored = true;

        if undo.patch_applied {
            let mut reverse = git.apply_step(ApplyMode::Reverse, self.repo, undo.patch);
            reverse.name = "rollback: apply -R".to_string();
            log.run(&reverse);
        }
        // Reverse apply can fail after tests rewrote files; fall back to a hard reset.
        if !git_ops::is_clean(self.repo).unwrap_or(false) {
            restored &= log.run(&git.step(
                "rollback: reset",
                self.repo,
                &["reset", "--hard", "HEAD"],
            ));
            restored &= log.run(&git.step("rollback: clean", self.repo, &["clean", "-fd"]));
        }

        let switch_back = match undo.previous {
            HeadTarget::Branch(name) => {
                git.step("rollback: switch back", self.repo, &["switch", name])
            }
            HeadTarget::Detached(oid) => git.step(
                "rollback: switch back",
                self.repo,
                &["switch", "--detach", oid],
            ),
        };
        if !log.run(&switch_back) {
            return false;
        }

        restored &= log.run(&git.step(
            "rollback: delete branch",
            self.repo,
            &["branch", "-D", undo.branch],
        ));
        restored
    }
}

fn write_patch_file(diff: &str) -> anyhow::Result<tempfile::NamedTempFile> {
    use std::io::Write;
    let mut file = tempfile::Builder::new()
        .prefix("selfpatch-")
        .suffix(".diff")
        .tempfile()?;
    file.write_all(diff.as_bytes())?;
    file.flush()?;
    Ok(file)
}
