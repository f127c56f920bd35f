//! File-backed state: proposals, run history and the source index live in
//! one directory guarded by an advisory lock.
//!
//! Writes go through a temp file and a rename so a crash never leaves a
//! half-written `proposals.json`. The directory is added to
//! `.git/info/exclude` so it never shows up as an untracked change.

use crate::runner::StepOutcome;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

pub const PROPOSALS_FILE: &str = "proposals.json";
pub const RUNS_FILE: &str = "runs.jsonl";
const STATE_LOCK_TIMEOUT_SECS: u64 = 5;
const STATE_LOCK_RETRY_MS: u64 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProposalStatus {
    Proposed,
    Applied,
    Rejected,
}

impl fmt::Display for ProposalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ProposalStatus::Proposed => "proposed",
            ProposalStatus::Applied => "applied",
            ProposalStatus::Rejected => "rejected",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    pub id: u64,
    pub title: String,
    /// Empty until a draft passes preflight.
    #[serde(default)]
    pub diff: String,
    #[serde(default)]
    pub notes: String,
    pub status: ProposalStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The persistence boundary the pipeline talks to.
pub trait ProposalStore {
    fn create(&self, title: &str, notes: &str) -> anyhow::Result<Proposal>;
    fn get(&self, id: u64) -> anyhow::Result<Option<Proposal>>;
    fn list(&self) -> anyhow::Result<Vec<Proposal>>;
    fn set_diff_and_status(&self, id: u64, diff: &str, status: ProposalStatus)
        -> anyhow::Result<()>;
    fn set_status(&self, id: u64, status: ProposalStatus) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunKind {
    Draft,
    Apply,
}

/// One row of `runs.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub timestamp: DateTime<Utc>,
    pub proposal_id: u64,
    pub kind: RunKind,
    pub passed: bool,
    #[serde(default)]
    pub failed_step: Option<String>,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub commit: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub steps: Vec<StepOutcome>,
}

/// A directory of state files with atomic writes and an advisory lock.
#[derive(Debug, Clone)]
pub struct StateDir {
    dir: PathBuf,
}

struct StateLock {
    file: fs::File,
}

impl Drop for StateLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

impl StateDir {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Create the directory, and exclude it from git when it sits inside `repo_root`.
    pub fn ensure(&self, repo_root: &Path) -> anyhow::Result<()> {
        if !self.dir.exists() {
            fs::create_dir_all(&self.dir)?;
        }
        let Ok(relative) = self.dir.strip_prefix(repo_root) else {
            return Ok(());
        };
        if relative.as_os_str().is_empty() {
            return Ok(());
        }
        let git_dir = repo_root.join(".git");
        if git_dir.is_dir() {
            let exclude = git_dir.join("info").join("exclude");
            if let Some(parent) = exclude.parent() {
                fs::create_dir_all(parent)?;
            }
            let entry = format!("/{}/", relative.to_string_lossy().replace('\\', "/"));
            append_exclude_entry(&exclude, &entry)?;
        }
        Ok(())
    }

    fn lock(&self, exclusive: bool) -> anyhow::Result<StateLock> {
        if !self.dir.exists() {
            fs::create_dir_all(&self.dir)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.dir.join(".lock"))?;

        let start = Instant::now();
        loop {
            let result = if exclusive {
                FileExt::try_lock_exclusive(&file)
            } else {
                FileExt::try_lock_shared(&file)
            };
            match result {
                Ok(()) => break,
                Err(err) => {
                    if err.kind() != ErrorKind::WouldBlock {
                        return Err(err.into());
                    }
                    if start.elapsed() >= Duration::from_secs(STATE_LOCK_TIMEOUT_SECS) {
                        return Err(anyhow::anyhow!(
                            "Timed out waiting for state lock ({}s)",
                            STATE_LOCK_TIMEOUT_SECS
                        ));
                    }
                    std::thread::sleep(Duration::from_millis(STATE_LOCK_RETRY_MS));
                }
            }
        }

        Ok(StateLock { file })
    }

    pub fn read_json<T: DeserializeOwned>(&self, name: &str) -> anyhow::Result<Option<T>> {
        let path = self.dir.join(name);
        if !path.exists() {
            return Ok(None);
        }
        let _lock = self.lock(false)?;
        let content = fs::read_to_string(&path)?;
        let value = serde_json::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse {}: {}", path.display(), e))?;
        Ok(Some(value))
    }

    pub fn write_json<T: Serialize>(&self, name: &str, value: &T) -> anyhow::Result<()> {
        let _lock = self.lock(true)?;
        let content = serde_json::to_string_pretty(value)?;
        write_atomic(&self.dir.join(name), &content)
    }

    /// Read-modify-write under one exclusive lock.
    pub fn update_json<T, R>(
        &self,
        name: &str,
        f: impl FnOnce(&mut T) -> anyhow::Result<R>,
    ) -> anyhow::Result<R>
    where
        T: Serialize + DeserializeOwned + Default,
    {
        let _lock = self.lock(true)?;
        let path = self.dir.join(name);
        let mut value: T = if path.exists() {
            let content = fs::read_to_string(&path)?;
            serde_json::from_str(&content)
                .map_err(|e| anyhow::anyhow!("Failed to parse {}: {}", path.display(), e))?
        } else {
            T::default()
        };
        let result = f(&mut value)?;
        write_atomic(&path, &serde_json::to_string_pretty(&value)?)?;
        Ok(result)
    }

    pub fn append_jsonl<T: Serialize>(&self, name: &str, record: &T) -> anyhow::Result<()> {
        let _lock = self.lock(true)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join(name))?;
        writeln!(file, "{}", serde_json::to_string(record)?)?;
        Ok(())
    }

    /// Up to `limit` latest rows, newest last. Unreadable rows are skipped.
    pub fn load_recent_jsonl<T: DeserializeOwned>(
        &self,
        name: &str,
        limit: usize,
    ) -> anyhow::Result<Vec<T>> {
        let path = self.dir.join(name);
        if !path.exists() || limit == 0 {
            return Ok(Vec::new());
        }
        let _lock = self.lock(false)?;
        let content = fs::read_to_string(&path)?;
        let mut records: Vec<T> = content
            .lines()
            .filter_map(|line| serde_json::from_str::<T>(line).ok())
            .collect();
        if records.len() > limit {
            let split = records.len() - limit;
            records.drain(0..split);
        }
        Ok(records)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ProposalsDoc {
    next_id: u64,
    proposals: Vec<Proposal>,
}

impl ProposalsDoc {
    fn find_mut(&mut self, id: u64) -> anyhow::Result<&mut Proposal> {
        self.proposals
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or_else(|| anyhow::anyhow!("Proposal #{} not found", id))
    }
}

/// `proposals.json` plus `runs.jsonl` inside a [`StateDir`].
#[derive(Debug, Clone)]
pub struct FileStore {
    state: StateDir,
}

impl FileStore {
    pub fn new(state: StateDir) -> Self {
        Self { state }
    }

    pub fn state(&self) -> &StateDir {
        &self.state
    }

    pub fn append_run(&self, record: &RunRecord) -> anyhow::Result<()> {
        self.state.append_jsonl(RUNS_FILE, record)
    }

    pub fn load_recent_runs(&self, limit: usize) -> anyhow::Result<Vec<RunRecord>> {
        self.state.load_recent_jsonl(RUNS_FILE, limit)
    }
}

impl ProposalStore for FileStore {
    fn create(&self, title: &str, notes: &str) -> anyhow::Result<Proposal> {
        self.state.update_json(PROPOSALS_FILE, |doc: &mut ProposalsDoc| {
            let id = doc.next_id.max(doc.proposals.iter().map(|p| p.id).max().unwrap_or(0)) + 1;
            doc.next_id = id;
            let now = Utc::now();
            let proposal = Proposal {
                id,
                title: title.to_string(),
                diff: String::new(),
                notes: notes.to_string(),
                status: ProposalStatus::Proposed,
                created_at: now,
                updated_at: now,
            };
            doc.proposals.push(proposal.clone());
            Ok(proposal)
        })
    }

    fn get(&self, id: u64) -> anyhow::Result<Option<Proposal>> {
        let doc: Option<ProposalsDoc> = self.state.read_json(PROPOSALS_FILE)?;
        Ok(doc.and_then(|d| d.proposals.into_iter().find(|p| p.id == id)))
    }

    fn list(&self) -> anyhow::Result<Vec<Proposal>> {
        let doc: Option<ProposalsDoc> = self.state.read_json(PROPOSALS_FILE)?;
        let mut proposals = doc.map(|d| d.proposals).unwrap_or_default();
        proposals.sort_by_key(|p| p.id);
        Ok(proposals)
    }

    fn set_diff_and_status(
        &self,
        id: u64,
        diff: &str,
        status: ProposalStatus,
    ) -> anyhow::Result<()> {
        self.state.update_json(PROPOSALS_FILE, |doc: &mut ProposalsDoc| {
            let proposal = doc.find_mut(id)?;
            proposal.diff = diff.to_string();
            proposal.status = status;
            proposal.updated_at = Utc::now();
            Ok(())
        })
    }

    fn set_status(&self, id: u64, status: ProposalStatus) -> anyhow::Result<()> {
        self.state.update_json(PROPOSALS_FILE, |doc: &mut ProposalsDoc| {
            let proposal = doc.find_mut(id)?;
            proposal.status = status;
            proposal.updated_at = Utc::now();
            Ok(())
        })
    }
}

fn append_exclude_entry(path: &Path, entry: &str) -> anyhow::Result<()> {
    let content = fs::read_to_string(path).unwrap_or_default();
    let bare = entry.trim_matches('/');
    let already_present = content.lines().any(|line| {
        let trimmed = line.trim().trim_matches('/');
        trimmed == bare
    });
    if already_present {
        return Ok(());
    }

    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    if !content.trim().is_empty() && !content.ends_with('\n') {
        writeln!(file)?;
    }
    writeln!(file, "# selfpatch state")?;
    writeln!(file, "{}", entry)?;
    Ok(())
}

/// Write through a temp file and rename so readers never see a partial file.
pub(crate) fn write_atomic(path: &Path, content: &str) -> anyhow::Result<()> {
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, content)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = fs::set_permissions(&tmp_path, fs::Permissions::from_mode(0o600));
    }

    #[cfg(windows)]
    {
        if path.exists() {
            let _ = fs::remove_file(path);
        }
    }

    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err.into());
    }
    Ok(())
}
