//! Operator-facing operations over proposals.
//!
//! `draft` turns notes into a diff that has been sanitized, validated,
//! guarded and proven in a sandbox before it is stored. `apply` re-checks
//! the stored diff and hands it to the transactional runner. Both hold the
//! repository lock for their whole duration.

use crate::apply::{apply_patch, ApplyError};
use crate::config::Config;
use crate::diff::{validate, DiffSyntaxError};
use crate::draft::{draft_with_retry, system_prompt, DraftBackend, DraftOutcome, DraftRequest};
use crate::guard::{guard, GuardError, GuardPolicy};
use crate::index::{ReindexStats, SourceIndex};
use crate::lock::{LockError, RepoLock};
use crate::runner::{RunLog, Toolchain};
use crate::sandbox::{preflight, SandboxError};
use crate::store::{
    FileStore, Proposal, ProposalStatus, ProposalStore, RunKind, RunRecord, StateDir,
};
use chrono::Utc;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Which step failed, with the cumulative log up to and including it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepFailure {
    pub step: String,
    pub detail: String,
    pub log: String,
}

impl fmt::Display for StepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "step '{}' failed: {}", self.step, self.detail)
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("drafting failed: {0}")]
    Drafting(String),
    #[error(transparent)]
    Syntax(#[from] DiffSyntaxError),
    #[error("policy violation: {0}")]
    Policy(#[from] GuardError),
    #[error("sandbox preflight failed, {0}")]
    Sandbox(StepFailure),
    #[error("apply failed, {0}")]
    Apply(StepFailure),
    #[error("required tool not found: {0}")]
    ToolMissing(String),
    #[error("{0}")]
    Busy(String),
    #[error("proposal #{id} is {status}; cannot {action}")]
    InvalidState {
        id: u64,
        status: ProposalStatus,
        action: &'static str,
    },
    #[error("proposal #{0} not found")]
    NotFound(u64),
    #[error("state error: {0:#}")]
    Store(#[from] anyhow::Error),
}

impl From<LockError> for PipelineError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Busy { .. } => PipelineError::Busy(err.to_string()),
            LockError::Io(io) => PipelineError::Store(io.into()),
        }
    }
}

impl PipelineError {
    /// The step log, for failures that ran external steps.
    pub fn log(&self) -> Option<&str> {
        match self {
            PipelineError::Sandbox(failure) | PipelineError::Apply(failure) => {
                Some(&failure.log)
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DraftReport {
    pub diff: String,
    pub attempts: u32,
    pub warnings: Vec<String>,
    pub log: RunLog,
}

#[derive(Debug, Clone)]
pub struct ApplyResult {
    pub branch: String,
    pub commit: Option<String>,
    pub log: RunLog,
}

pub struct Pipeline {
    config: Config,
    repo_root: PathBuf,
    store: FileStore,
    tools: Toolchain,
    policy: GuardPolicy,
    backend: Option<Arc<dyn DraftBackend>>,
}

impl Pipeline {
    /// Open the state directory for `repo_root`, creating it if needed.
    pub fn open(config: Config, repo_root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let repo_root = repo_root.into();
        let state = StateDir::new(config.state.resolve_dir(&repo_root));
        state.ensure(&repo_root)?;
        Ok(Self {
            tools: Toolchain::from_config(&config.tools),
            policy: GuardPolicy::from(&config.policy),
            store: FileStore::new(state),
            repo_root,
            config,
            backend: None,
        })
    }

    pub fn with_backend(mut self, backend: Arc<dyn DraftBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    pub fn store(&self) -> &FileStore {
        &self.store
    }

    pub fn new_proposal(&self, title: &str, notes: &str) -> Result<Proposal, PipelineError> {
        let proposal = self.store.create(title.trim(), notes)?;
        tracing::info!(proposal = proposal.id, title = %proposal.title, "proposal created");
        Ok(proposal)
    }

    pub fn list(&self) -> Result<Vec<Proposal>, PipelineError> {
        Ok(self.store.list()?)
    }

    pub fn show(&self, id: u64) -> Result<Proposal, PipelineError> {
        self.store.get(id)?.ok_or(PipelineError::NotFound(id))
    }

    /// Operator override: allowed from any status, and repeatable.
    pub fn reject(&self, id: u64) -> Result<Proposal, PipelineError> {
        let _lock = self.lock()?;
        let proposal = self.show(id)?;
        if proposal.status != ProposalStatus::Rejected {
            self.store.set_status(id, ProposalStatus::Rejected)?;
            tracing::info!(proposal = id, from = %proposal.status, "proposal rejected");
        }
        self.show(id)
    }

    pub fn reindex(&self) -> Result<ReindexStats, PipelineError> {
        let _lock = self.lock()?;
        let state = self.store.state();
        let mut index = SourceIndex::load(state)?;
        let stats = index.reindex(&self.repo_root)?;
        index.save(state)?;
        tracing::info!(
            indexed = stats.indexed,
            removed = stats.removed,
            with_errors = stats.with_errors,
            "index rebuilt"
        );
        Ok(stats)
    }

    pub fn history(&self, limit: usize) -> Result<Vec<RunRecord>, PipelineError> {
        Ok(self.store.load_recent_runs(limit)?)
    }

    /// Draft a diff for `id` and store it only if it survives every check.
    pub async fn draft(&self, id: u64) -> Result<DraftReport, PipelineError> {
        let _lock =
            RepoLock::acquire_async(&self.repo_root, self.config.state.lock_wait()).await?;
        let proposal = self.show(id)?;
        if proposal.status != ProposalStatus::Proposed {
            return Err(PipelineError::InvalidState {
                id,
                status: proposal.status,
                action: "draft",
            });
        }
        let backend = self
            .backend
            .as_deref()
            .ok_or_else(|| PipelineError::Drafting("no drafting backend configured".to_string()))?;

        let index = SourceIndex::load(self.store.state())?;
        let query = format!("{} {}", proposal.title, proposal.notes);
        let context = index.context_snippet(
            &query,
            self.config.llm.context_files,
            self.config.llm.context_budget_chars,
        );
        let request = DraftRequest {
            title: &proposal.title,
            notes: &proposal.notes,
            context: &context,
        };

        let mut log = RunLog::new();
        let drafted = draft_with_retry(backend, &system_prompt(&self.policy), &request).await;
        let result = match drafted {
            Ok(result) => result,
            Err(err) => {
                let message = format!("{:#}", err);
                log.note("draft", false, message.clone());
                self.record(id, RunKind::Draft, &log, Err(&message));
                return Err(PipelineError::Drafting(message));
            }
        };

        let diff = match result.outcome {
            DraftOutcome::Drafted(diff) => diff,
            DraftOutcome::Empty => {
                let message = format!("no unified diff found after {} attempts", result.attempts);
                log.note("draft", false, message.clone());
                self.record(id, RunKind::Draft, &log, Err(&message));
                return Err(PipelineError::Drafting(message));
            }
            DraftOutcome::Malformed { error, .. } => {
                log.note("syntax", false, error.to_string());
                self.record(id, RunKind::Draft, &log, Err(&error.to_string()));
                return Err(PipelineError::Syntax(error));
            }
        };
        log.note("draft", true, format!("attempts: {}", result.attempts));
        log.note("syntax", true, "hunk lines valid");

        let report = match guard(&diff, &self.repo_root, &self.policy, &index) {
            Ok(report) => report,
            Err(err) => {
                log.note("guard", false, err.to_string());
                self.record(id, RunKind::Draft, &log, Err(&err.to_string()));
                return Err(PipelineError::Policy(err));
            }
        };
        log.note("guard", true, format!("{} file(s) allowed", report.files.len()));

        let repo = self.repo_root.clone();
        let tools = self.tools.clone();
        let candidate = diff.clone();
        let preflight_report =
            tokio::task::spawn_blocking(move || preflight(&repo, &candidate, &tools))
                .await
                .map_err(|e| anyhow::anyhow!("preflight task failed: {}", e))?;
        log.steps.extend(preflight_report.log.steps);

        if let Err(err) = preflight_report.result {
            let message = err.to_string();
            self.record(id, RunKind::Draft, &log, Err(&message));
            return Err(match err {
                SandboxError::ToolMissing(tool) => PipelineError::ToolMissing(tool),
                SandboxError::StepFailed(step) => PipelineError::Sandbox(StepFailure {
                    step,
                    detail: message,
                    log: log.render(),
                }),
            });
        }

        self.store
            .set_diff_and_status(id, &diff, ProposalStatus::Proposed)?;
        self.record(id, RunKind::Draft, &log, Ok((None, None)));
        tracing::info!(proposal = id, attempts = result.attempts, "draft stored");

        Ok(DraftReport {
            diff,
            attempts: result.attempts,
            warnings: report.warnings,
            log,
        })
    }

    /// Re-check the stored diff and apply it on a fresh branch.
    pub fn apply(&self, id: u64) -> Result<ApplyResult, PipelineError> {
        let _lock = self.lock()?;
        let proposal = self.show(id)?;
        if proposal.status != ProposalStatus::Proposed {
            return Err(PipelineError::InvalidState {
                id,
                status: proposal.status,
                action: "apply",
            });
        }
        if proposal.diff.trim().is_empty() {
            return Err(PipelineError::InvalidState {
                id,
                status: proposal.status,
                action: "apply without a drafted diff",
            });
        }

        validate(&proposal.diff)?;
        let index = SourceIndex::load(self.store.state())?;
        guard(&proposal.diff, &self.repo_root, &self.policy, &index)?;

        let report = apply_patch(
            &self.repo_root,
            id,
            &proposal.title,
            &proposal.diff,
            &self.tools,
        );
        let log = report.log;
        let outcome = match report.result {
            Ok(outcome) => outcome,
            Err(err) => {
                let message = err.to_string();
                self.record(id, RunKind::Apply, &log, Err(&message));
                return Err(match err {
                    ApplyError::ToolMissing(tool) => PipelineError::ToolMissing(tool),
                    other => PipelineError::Apply(StepFailure {
                        step: other.step().to_string(),
                        detail: message,
                        log: log.render(),
                    }),
                });
            }
        };

        self.store.set_status(id, ProposalStatus::Applied)?;
        self.record(
            id,
            RunKind::Apply,
            &log,
            Ok((Some(&outcome.branch), outcome.commit.as_deref())),
        );
        Ok(ApplyResult {
            branch: outcome.branch,
            commit: outcome.commit,
            log,
        })
    }

    fn lock(&self) -> Result<RepoLock, PipelineError> {
        Ok(RepoLock::acquire(
            &self.repo_root,
            self.config.state.lock_wait(),
        )?)
    }

    /// Append to run history. A history write failure is logged, not fatal.
    fn record(
        &self,
        proposal_id: u64,
        kind: RunKind,
        log: &RunLog,
        result: Result<(Option<&str>, Option<&str>), &str>,
    ) {
        let (passed, branch, commit, error) = match result {
            Ok((branch, commit)) => (true, branch, commit, None),
            Err(error) => (false, None, None, Some(error.to_string())),
        };
        let record = RunRecord {
            timestamp: Utc::now(),
            proposal_id,
            kind,
            passed,
            failed_step: if passed {
                None
            } else {
                log.last_failed_step().map(str::to_string)
            },
            branch: branch.map(str::to_string),
            commit: commit.map(str::to_string),
            error,
            steps: log.steps.clone(),
        };
        if let Err(err) = self.store.append_run(&record) {
            tracing::warn!(proposal = proposal_id, error = %err, "failed to record run history");
        }
    }
}

#[cfg(test)]
mod tests;
