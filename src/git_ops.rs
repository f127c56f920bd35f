//! Git plumbing for the preflight and apply runners.
//!
//! Anything that mutates a checkout goes through the git CLI (so hooks,
//! attributes and `--recount` behave exactly as a developer would see them).
//! Read-only questions (is the tree clean, where is HEAD) use git2.

use crate::runner::CommandSpec;
use crate::util::run_command_with_timeout;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Local};
use git2::{Repository, StatusOptions};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

const MAX_GIT_REF_LENGTH: usize = 255;
pub const MAX_BRANCH_NAME_CHARS: usize = 60;
pub const BRANCH_PREFIX: &str = "selfpatch";

const APPLY_FLAGS: [&str; 2] = ["--recount", "--whitespace=nowarn"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyMode {
    Check,
    Apply,
    Reverse,
}

/// Where HEAD pointed before we touched anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeadTarget {
    Branch(String),
    Detached(String),
}

impl HeadTarget {
    pub fn label(&self) -> &str {
        match self {
            HeadTarget::Branch(name) => name,
            HeadTarget::Detached(oid) => oid,
        }
    }
}

/// The git executable plus the timeout every call runs under.
#[derive(Debug, Clone)]
pub struct Git {
    program: String,
    timeout: Duration,
}

impl Git {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn env_overrides() -> Vec<(String, String)> {
        vec![
            ("GIT_TERMINAL_PROMPT".to_string(), "0".to_string()),
            ("GIT_EDITOR".to_string(), "true".to_string()),
        ]
    }

    /// A named step for a [`crate::runner::RunLog`].
    pub fn step(&self, name: &str, cwd: &Path, args: &[&str]) -> CommandSpec {
        CommandSpec::new(name, cwd, self.program.clone())
            .args(args)
            .timeout(self.timeout)
            .with_env_overrides(&Self::env_overrides())
    }

    pub fn apply_step(&self, mode: ApplyMode, cwd: &Path, patch: &Path) -> CommandSpec {
        let (name, mode_flags): (&str, &[&str]) = match mode {
            ApplyMode::Check => ("apply --check", &["--check"][..]),
            ApplyMode::Apply => ("apply", &[][..]),
            ApplyMode::Reverse => ("apply -R", &["-R"][..]),
        };
        let patch = patch.to_string_lossy();
        let mut args: Vec<&str> = vec!["apply"];
        args.extend_from_slice(mode_flags);
        args.extend_from_slice(&APPLY_FLAGS);
        args.push(&patch);
        self.step(name, cwd, &args)
    }

    /// Run git for plumbing; stdout on success, stderr in the error otherwise.
    pub fn run(&self, cwd: &Path, args: &[&str]) -> Result<String> {
        let mut cmd = Command::new(&self.program);
        cmd.current_dir(cwd).args(args);
        for (k, v) in Self::env_overrides() {
            cmd.env(k, v);
        }
        let output = run_command_with_timeout(&mut cmd, self.timeout)
            .map_err(|e| anyhow!("Failed to run git command: {}", e))?;

        if output.timed_out {
            return Err(anyhow!(
                "git command timed out after {}s: git {}",
                self.timeout.as_secs(),
                args.join(" ")
            ));
        }
        if output.success() {
            return Ok(output.stdout);
        }
        Err(anyhow!(
            "git {} failed:\nstdout:\n{}\nstderr:\n{}",
            args.join(" "),
            output.stdout.trim_end(),
            output.stderr.trim_end()
        ))
    }

    pub fn show_toplevel(&self, dir: &Path) -> Result<PathBuf> {
        let out = self
            .run(dir, &["rev-parse", "--show-toplevel"])
            .with_context(|| format!("'{}' is not inside a git repository", dir.display()))?;
        let top = out.trim();
        if top.is_empty() {
            return Err(anyhow!("git returned an empty top-level directory"));
        }
        Ok(PathBuf::from(top))
    }

    pub fn worktree_add_detached(&self, repo: &Path, path: &Path) -> Result<()> {
        self.run(
            repo,
            &["worktree", "add", "--detach", &path.to_string_lossy(), "HEAD"],
        )
        .with_context(|| {
            format!(
                "Failed to create detached worktree '{}' from '{}'",
                path.display(),
                repo.display()
            )
        })?;
        Ok(())
    }

    pub fn worktree_remove(&self, repo: &Path, path: &Path) -> Result<()> {
        self.run(
            repo,
            &["worktree", "remove", "--force", &path.to_string_lossy()],
        )
        .with_context(|| format!("Failed to remove worktree '{}'", path.display()))?;
        Ok(())
    }

    pub fn worktree_prune(&self, repo: &Path) -> Result<()> {
        self.run(repo, &["worktree", "prune"])?;
        Ok(())
    }
}

/// Paths that make the working tree dirty, untracked files included.
pub fn dirty_paths(repo_path: &Path) -> Result<Vec<String>> {
    let repo = Repository::open(repo_path)
        .with_context(|| format!("Failed to open repository '{}'", repo_path.display()))?;
    let mut opts = StatusOptions::new();
    opts.include_untracked(true)
        .recurse_untracked_dirs(true)
        .include_ignored(false)
        .exclude_submodules(true);
    let statuses = repo.statuses(Some(&mut opts))?;
    Ok(statuses
        .iter()
        .filter(|e| !e.status().is_ignored())
        .map(|e| e.path().unwrap_or("").to_string())
        .collect())
}

pub fn is_clean(repo_path: &Path) -> Result<bool> {
    Ok(dirty_paths(repo_path)?.is_empty())
}

pub fn head_target(repo_path: &Path) -> Result<HeadTarget> {
    let repo = Repository::open(repo_path)?;
    let head = repo.head().context("Failed to get HEAD")?;
    if head.is_branch() {
        if let Some(name) = head.shorthand() {
            return Ok(HeadTarget::Branch(name.to_string()));
        }
    }
    let oid = head
        .target()
        .ok_or_else(|| anyhow!("HEAD does not point at a commit"))?;
    Ok(HeadTarget::Detached(oid.to_string()))
}

pub fn head_oid(repo_path: &Path) -> Result<String> {
    let repo = Repository::open(repo_path)?;
    let commit = repo
        .head()
        .context("Failed to get HEAD")?
        .peel_to_commit()
        .context("HEAD does not point at a commit")?;
    Ok(commit.id().to_string())
}

pub fn branch_exists(repo_path: &Path, name: &str) -> bool {
    let Ok(repo) = Repository::open(repo_path) else {
        return false;
    };
    let found = repo.find_branch(name, git2::BranchType::Local).is_ok();
    found
}

/// `selfpatch/p<id>-<YYYYmmdd-HHMMSS>`, suffixed with `-N` while `taken`
/// says the name exists, capped at [`MAX_BRANCH_NAME_CHARS`].
pub fn temp_branch_name(
    proposal_id: u64,
    now: DateTime<Local>,
    taken: impl Fn(&str) -> bool,
) -> Result<String> {
    let base = format!(
        "{}/p{}-{}",
        BRANCH_PREFIX,
        proposal_id,
        now.format("%Y%m%d-%H%M%S")
    );
    let base = cap_chars(&base, MAX_BRANCH_NAME_CHARS);

    let mut candidate = base.clone();
    let mut n = 2;
    while taken(&candidate) {
        let suffix = format!("-{}", n);
        let head = cap_chars(&base, MAX_BRANCH_NAME_CHARS - suffix.len());
        candidate = format!("{}{}", head, suffix);
        n += 1;
    }

    if !is_valid_git_ref(&candidate) {
        return Err(anyhow!("Generated invalid branch name '{}'", candidate));
    }
    Ok(candidate)
}

fn cap_chars(s: &str, max: usize) -> String {
    s.chars()
        .take(max)
        .collect::<String>()
        .trim_end_matches(['-', '/', '.'])
        .to_string()
}

pub fn is_valid_git_ref(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_GIT_REF_LENGTH {
        return false;
    }
    if name.starts_with('-') || name.starts_with('.') || name.starts_with('/') {
        return false;
    }
    if name.ends_with('.') || name.ends_with('/') || name.ends_with(".lock") {
        return false;
    }
    if name.contains("..") || name.contains("@{") || name.contains("//") || name.contains("/.") {
        return false;
    }
    !name.chars().any(|c| {
        c.is_control()
            || matches!(
                c,
                ' ' | '~' | '^' | ':' | '?' | '*' | '[' | '\\' | '\'' | '"' | '`' | '$' | '!'
                    | '&' | ';' | '|' | '<' | '>'
            )
    })
}

/// `git commit` reports an empty commit on stdout, not as a distinct exit code.
pub fn is_nothing_to_commit(output: &str) -> bool {
    let lower = output.to_lowercase();
    lower.contains("nothing to commit") || lower.contains("nothing added to commit")
}

#[cfg(test)]
pub(crate) mod test_support {
    use git2::{Repository, Signature};
    use std::path::{Path, PathBuf};

    /// Throwaway repository with a user configured and one commit of `files`.
    pub fn create_repo(files: &[(&str, &str)]) -> (tempfile::TempDir, PathBuf) {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let repo_path = temp_dir.path().join("repo");
        std::fs::create_dir_all(&repo_path).unwrap();

        let repo = Repository::init(&repo_path).expect("Failed to init repo");
        let mut config = repo.config().unwrap();
        config.set_str("user.name", "Test User").unwrap();
        config.set_str("user.email", "test@example.com").unwrap();
        config.set_bool("commit.gpgsign", false).unwrap();

        for (rel, content) in files {
            let full = repo_path.join(rel);
            std::fs::create_dir_all(full.parent().unwrap()).unwrap();
            std::fs::write(&full, content).unwrap();
        }
        commit_all(&repo_path, "Initial commit");
        (temp_dir, repo_path)
    }

    pub fn commit_all(repo_path: &Path, message: &str) {
        let repo = Repository::open(repo_path).unwrap();
        let mut index = repo.index().unwrap();
        index
            .add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)
            .unwrap();
        index.write().unwrap();
        let tree_id = index.write_tree().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();
        let sig = Signature::now("Test User", "test@example.com").unwrap();
        let parent = repo.head().ok().and_then(|h| h.peel_to_commit().ok());
        let parents: Vec<&git2::Commit> = parent.iter().collect();
        repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)
            .unwrap();
    }

    pub fn current_branch(repo_path: &Path) -> String {
        let repo = Repository::open(repo_path).unwrap();
        let head = repo.head().unwrap();
        head.shorthand().unwrap().to_string()
    }

    pub fn local_branches(repo_path: &Path) -> Vec<String> {
        let repo = Repository::open(repo_path).unwrap();
        let mut names: Vec<String> = repo
            .branches(Some(git2::BranchType::Local))
            .unwrap()
            .filter_map(|b| b.ok())
            .filter_map(|(b, _)| b.name().ok().flatten().map(|s| s.to_string()))
            .collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use chrono::TimeZone;

    fn git() -> Git {
        Git::new("git", Duration::from_secs(30))
    }

    #[test]
    fn clean_tree_detection_includes_untracked_files() {
        let (_tmp, repo) = create_repo(&[("cmd/app/main.go", "package main\n")]);
        assert!(is_clean(&repo).unwrap());

        std::fs::write(repo.join("scratch.txt"), "x").unwrap();
        assert_eq!(dirty_paths(&repo).unwrap(), vec!["scratch.txt"]);
        std::fs::remove_file(repo.join("scratch.txt")).unwrap();

        std::fs::write(repo.join("cmd/app/main.go"), "package main // edited\n").unwrap();
        assert!(!is_clean(&repo).unwrap());
    }

    #[test]
    fn excluded_paths_do_not_dirty_the_tree() {
        let (_tmp, repo) = create_repo(&[("cmd/app/main.go", "package main\n")]);
        std::fs::write(repo.join(".git/info/exclude"), "/.selfpatch/\n").unwrap();
        std::fs::create_dir_all(repo.join(".selfpatch")).unwrap();
        std::fs::write(repo.join(".selfpatch/proposals.json"), "{}").unwrap();
        assert!(is_clean(&repo).unwrap());
    }

    #[test]
    fn head_target_reports_branch_or_detached_oid() {
        let (_tmp, repo) = create_repo(&[("cmd/app/main.go", "package main\n")]);
        let branch = current_branch(&repo);
        assert_eq!(head_target(&repo).unwrap(), HeadTarget::Branch(branch));

        let oid = head_oid(&repo).unwrap();
        git().run(&repo, &["switch", "--detach", &oid]).unwrap();
        assert_eq!(head_target(&repo).unwrap(), HeadTarget::Detached(oid));
    }

    #[test]
    fn show_toplevel_finds_root_from_subdirectory() {
        let (_tmp, repo) = create_repo(&[("cmd/app/main.go", "package main\n")]);
        let top = git().show_toplevel(&repo.join("cmd/app")).unwrap();
        assert_eq!(
            top.canonicalize().unwrap(),
            repo.canonicalize().unwrap()
        );

        let not_repo = tempfile::tempdir().unwrap();
        assert!(git().show_toplevel(not_repo.path()).is_err());
    }

    #[test]
    fn temp_branch_name_is_timestamped_and_deduplicated() {
        let now = Local.with_ymd_and_hms(2026, 3, 4, 5, 6, 7).unwrap();
        let name = temp_branch_name(12, now, |_| false).unwrap();
        assert_eq!(name, "selfpatch/p12-20260304-050607");

        let taken = ["selfpatch/p12-20260304-050607", "selfpatch/p12-20260304-050607-2"];
        let name = temp_branch_name(12, now, |n| taken.contains(&n)).unwrap();
        assert_eq!(name, "selfpatch/p12-20260304-050607-3");
    }

    #[test]
    fn temp_branch_name_is_capped() {
        let now = Local.with_ymd_and_hms(2026, 3, 4, 5, 6, 7).unwrap();
        let name = temp_branch_name(u64::MAX, now, |_| false).unwrap();
        assert!(name.chars().count() <= MAX_BRANCH_NAME_CHARS);
        assert!(is_valid_git_ref(&name));
    }

    #[test]
    fn git_ref_validation_rejects_dangerous_names() {
        assert!(is_valid_git_ref("selfpatch/p1-20260101-000000"));
        assert!(!is_valid_git_ref(""));
        assert!(!is_valid_git_ref("-rf"));
        assert!(!is_valid_git_ref("a..b"));
        assert!(!is_valid_git_ref("a b"));
        assert!(!is_valid_git_ref("x.lock"));
        assert!(!is_valid_git_ref("a/.hidden"));
        assert!(!is_valid_git_ref("evil;rm"));
    }

    #[test]
    fn nothing_to_commit_is_recognised() {
        assert!(is_nothing_to_commit(
            "On branch x\nnothing to commit, working tree clean"
        ));
        assert!(!is_nothing_to_commit("error: pathspec did not match"));
    }

    #[test]
    fn apply_step_always_recounts() {
        let step = git().apply_step(ApplyMode::Reverse, Path::new("/repo"), Path::new("/tmp/p.diff"));
        assert_eq!(
            step.args,
            vec!["apply", "-R", "--recount", "--whitespace=nowarn", "/tmp/p.diff"]
        );
        assert_eq!(step.name, "apply -R");
    }
}
