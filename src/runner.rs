//! Step execution and the cumulative, human-readable log every pipeline
//! stage hands back to the operator.

use crate::config::ToolsConfig;
use crate::git_ops::Git;
use crate::util::{resolve_program, run_command_with_timeout, tail_chars};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, Instant};

const OUTPUT_TAIL_MAX_CHARS: usize = 8_000;

#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub name: String,
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub timeout: Duration,
    pub env: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn new(name: impl Into<String>, cwd: impl AsRef<Path>, program: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args: Vec::new(),
            cwd: cwd.as_ref().to_path_buf(),
            timeout: Duration::from_secs(600),
            env: Vec::new(),
        }
    }

    pub fn args<S: AsRef<str>>(mut self, args: &[S]) -> Self {
        self.args = args.iter().map(|s| s.as_ref().to_string()).collect();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_env_overrides(mut self, env: &[(String, String)]) -> Self {
        self.env.extend(env.iter().cloned());
        self
    }

    fn label(&self) -> String {
        format!("{} {}", self.program, self.args.join(" "))
            .trim()
            .to_string()
    }
}

/// Result of one step, kept for the log and for run history.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StepOutcome {
    pub name: String,
    pub command: String,
    pub duration_ms: u64,
    pub success: bool,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub output_tail: String,
    #[serde(default)]
    pub note: Option<String>,
}

impl StepOutcome {
    /// A step that did not shell out (precondition checks, bookkeeping).
    pub fn internal(name: impl Into<String>, success: bool, note: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            success,
            note: Some(note.into()),
            ..Default::default()
        }
    }
}

pub fn run_step(spec: &CommandSpec) -> StepOutcome {
    let mut command = Command::new(&spec.program);
    command.current_dir(&spec.cwd).args(&spec.args);
    for (key, value) in &spec.env {
        command.env(key, value);
    }

    tracing::debug!(step = %spec.name, command = %spec.label(), cwd = %spec.cwd.display(), "running step");
    let start = Instant::now();

    match run_command_with_timeout(&mut command, spec.timeout) {
        Ok(result) => {
            let note = result
                .timed_out
                .then(|| format!("timed out after {}s", spec.timeout.as_secs()));
            StepOutcome {
                name: spec.name.clone(),
                command: spec.label(),
                duration_ms: start.elapsed().as_millis() as u64,
                success: result.success(),
                exit_code: result.status.and_then(|s| s.code()),
                timed_out: result.timed_out,
                output_tail: tail_chars(&result.combined_output(), OUTPUT_TAIL_MAX_CHARS),
                note,
            }
        }
        Err(error) => StepOutcome {
            name: spec.name.clone(),
            command: spec.label(),
            duration_ms: start.elapsed().as_millis() as u64,
            success: false,
            note: Some(error),
            ..Default::default()
        },
    }
}

/// Ordered record of every step attempted in one pipeline call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunLog {
    pub steps: Vec<StepOutcome>,
}

impl RunLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run a step, record it and hand back whether it succeeded.
    pub fn run(&mut self, spec: &CommandSpec) -> bool {
        let outcome = run_step(spec);
        let success = outcome.success;
        if success {
            tracing::info!(step = %outcome.name, ms = outcome.duration_ms, "step passed");
        } else {
            tracing::warn!(step = %outcome.name, exit = ?outcome.exit_code, timed_out = outcome.timed_out, "step failed");
        }
        self.steps.push(outcome);
        success
    }

    pub fn record(&mut self, outcome: StepOutcome) {
        self.steps.push(outcome);
    }

    pub fn note(&mut self, name: &str, success: bool, note: impl Into<String>) {
        self.record(StepOutcome::internal(name, success, note));
    }

    pub fn last_failed_step(&self) -> Option<&str> {
        self.steps
            .iter()
            .rev()
            .find(|s| !s.success)
            .map(|s| s.name.as_str())
    }

    /// Step list followed by the output of the failing step(s).
    pub fn render(&self) -> String {
        let mut out = String::new();
        for step in &self.steps {
            let mark = if step.success { "ok  " } else { "FAIL" };
            let _ = write!(out, "[{}] {}", mark, step.name);
            if !step.command.is_empty() {
                let _ = write!(out, " ({})", step.command);
            }
            if step.duration_ms > 0 {
                let _ = write!(out, " {}ms", step.duration_ms);
            }
            if let Some(note) = &step.note {
                let _ = write!(out, " - {}", note);
            }
            out.push('\n');
        }
        for step in self.steps.iter().filter(|s| !s.success) {
            if step.output_tail.trim().is_empty() {
                continue;
            }
            let _ = writeln!(out, "\n--- output of '{}' ---", step.name);
            out.push_str(step.output_tail.trim_end());
            out.push('\n');
        }
        out
    }
}

/// The two external tools every validation needs: git and the test runner.
#[derive(Debug, Clone)]
pub struct Toolchain {
    pub git: Git,
    pub test_program: String,
    pub test_args: Vec<String>,
    pub test_timeout: Duration,
}

impl Toolchain {
    pub fn from_config(tools: &ToolsConfig) -> Self {
        Self {
            git: Git::new(tools.git.clone(), tools.git_timeout()),
            test_program: tools.test_program().to_string(),
            test_args: tools.test_args().to_vec(),
            test_timeout: tools.test_timeout(),
        }
    }

    pub fn test_step(&self, cwd: &Path) -> CommandSpec {
        CommandSpec::new("tests", cwd, self.test_program.clone())
            .args(&self.test_args)
            .timeout(self.test_timeout)
    }

    /// Programs that cannot be found. Relative paths such as
    /// `./scripts/test.sh` resolve inside the checkout and are not checked here.
    pub fn missing(&self) -> Vec<String> {
        [self.git.program(), self.test_program.as_str()]
            .into_iter()
            .filter(|program| {
                let relative_script = !Path::new(program).is_absolute()
                    && Path::new(program).components().count() > 1;
                !relative_script && resolve_program(program).is_none()
            })
            .map(|program| program.to_string())
            .collect()
    }

    /// Log a `tools` step; `Err` names the first missing program.
    pub fn check(&self, log: &mut RunLog) -> Result<(), String> {
        let missing = self.missing();
        if missing.is_empty() {
            log.note(
                "tools",
                true,
                format!("found {} and {}", self.git.program(), self.test_program),
            );
            return Ok(());
        }
        log.note("tools", false, format!("not found: {}", missing.join(", ")));
        Err(missing[0].clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn run_log_records_failure_output() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = RunLog::new();
        assert!(log.run(&CommandSpec::new("echo", dir.path(), "sh").args(&["-c", "echo fine"])));
        assert!(!log.run(
            &CommandSpec::new("tests", dir.path(), "sh").args(&["-c", "echo boom; exit 3"])
        ));

        assert_eq!(log.last_failed_step(), Some("tests"));
        assert_eq!(log.steps[1].exit_code, Some(3));
        let rendered = log.render();
        assert!(rendered.contains("[ok  ] echo"));
        assert!(rendered.contains("[FAIL] tests"));
        assert!(rendered.contains("--- output of 'tests' ---\nboom"));
    }

    #[test]
    fn missing_program_is_a_failed_step_with_a_note() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = run_step(&CommandSpec::new("ghost", dir.path(), "no-such-program-4242"));
        assert!(!outcome.success);
        assert!(outcome.note.unwrap().contains("Failed to start command"));
    }

    #[test]
    fn toolchain_reports_missing_programs() {
        let tools = ToolsConfig {
            git: "git".to_string(),
            test_command: vec!["no-such-test-runner-4242".to_string()],
            ..ToolsConfig::default()
        };
        let toolchain = Toolchain::from_config(&tools);
        let mut log = RunLog::new();
        assert_eq!(
            toolchain.check(&mut log),
            Err("no-such-test-runner-4242".to_string())
        );
        assert_eq!(log.last_failed_step(), Some("tools"));
    }

    #[test]
    fn relative_test_scripts_are_resolved_later() {
        let tools = ToolsConfig {
            test_command: vec!["./scripts/test.sh".to_string(), "-v".to_string()],
            ..ToolsConfig::default()
        };
        let toolchain = Toolchain::from_config(&tools);
        assert!(toolchain.missing().is_empty());
        assert_eq!(toolchain.test_step(Path::new("/w")).args, vec!["-v"]);
    }

    #[cfg(unix)]
    #[test]
    fn timeout_is_reported_as_failure() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = run_step(
            &CommandSpec::new("slow", dir.path(), "sh")
                .args(&["-c", "sleep 5"])
                .timeout(Duration::from_millis(200)),
        );
        assert!(!outcome.success);
        assert!(outcome.timed_out);
        assert!(outcome.note.unwrap().starts_with("timed out"));
    }
}
