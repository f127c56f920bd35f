use super::*;
use crate::config::{Config, StateConfig, ToolsConfig};
use crate::draft::test_support::ScriptedDrafter;
use crate::git_ops::test_support::{create_repo, current_branch, local_branches};
use crate::git_ops;
use crate::guard::GuardError;
use std::fs;
use std::time::Duration;

const GREET: &str = "package greet\n\nfunc Hello() string {\n\treturn \"hello\"\n}\n";

struct Fixture {
    _tmp: tempfile::TempDir,
    repo: PathBuf,
    drafter: Arc<ScriptedDrafter>,
    pipeline: Pipeline,
}

impl Fixture {
    fn new(responses: &[String]) -> Self {
        Self::with_config(responses, test_config())
    }

    fn with_config(responses: &[String], config: Config) -> Self {
        let (tmp, repo) = create_repo(&[
            ("go.mod", "module example.com/demo\n\ngo 1.22\n"),
            ("internal/greet/greet.go", GREET),
            (
                "run_tests.sh",
                "if grep -rq BROKEN internal cmd 2>/dev/null; then echo 'FAIL: broken marker'; exit 1; fi\necho ok\n",
            ),
        ]);
        let drafter = Arc::new(ScriptedDrafter::new(responses));
        let pipeline = Pipeline::open(config, &repo)
            .unwrap()
            .with_backend(drafter.clone());
        Self {
            _tmp: tmp,
            repo,
            drafter,
            pipeline,
        }
    }

    fn greet(&self) -> String {
        fs::read_to_string(self.repo.join("internal/greet/greet.go")).unwrap()
    }
}

fn test_config() -> Config {
    Config {
        tools: ToolsConfig {
            test_command: vec!["sh".to_string(), "run_tests.sh".to_string()],
            git_timeout_secs: 30,
            test_timeout_secs: 30,
            ..ToolsConfig::default()
        },
        state: StateConfig {
            lock_wait_secs: 0,
            ..StateConfig::default()
        },
        ..Config::default()
    }
}

fn greet_diff(new_value: &str) -> String {
    format!(
        concat!(
            "diff --git a/internal/greet/greet.go b/internal/greet/greet.go\n",
            "--- a/internal/greet/greet.go\n",
            "+++ b/internal/greet/greet.go\n",
            "@@ -1,5 +1,5 @@\n",
            " package greet\n",
            " \n",
            " func Hello() string {{\n",
            "-\treturn \"hello\"\n",
            "+\treturn \"{}\"\n",
            " }}\n",
        ),
        new_value
    )
}

/// The way a chat model tends to answer: prose, a fence and an empty context line.
fn chatty(diff: &str) -> String {
    format!(
        "Sure, here is the patch:\n\n```diff\n{}```\nLet me know if you need more.",
        diff.replace("\n \n", "\n\n")
    )
}

#[tokio::test]
async fn failing_sandbox_tests_leave_the_proposal_undrafted() {
    let fx = Fixture::new(&[greet_diff("BROKEN")]);
    fx.pipeline.reindex().unwrap();
    let proposal = fx.pipeline.new_proposal("Break greeting", "").unwrap();

    let err = fx.pipeline.draft(proposal.id).await.unwrap_err();

    match &err {
        PipelineError::Sandbox(failure) => {
            assert_eq!(failure.step, "tests");
            assert!(failure.log.contains("FAIL: broken marker"));
        }
        other => panic!("expected sandbox failure, got {:?}", other),
    }
    let stored = fx.pipeline.show(proposal.id).unwrap();
    assert_eq!(stored.status, ProposalStatus::Proposed);
    assert!(stored.diff.is_empty());
    assert_eq!(fx.greet(), GREET);
    assert!(git_ops::is_clean(&fx.repo).unwrap());

    let runs = fx.pipeline.history(10).unwrap();
    assert_eq!(runs.len(), 1);
    assert!(!runs[0].passed);
    assert_eq!(runs[0].failed_step.as_deref(), Some("tests"));
}

#[tokio::test]
async fn drafted_and_preflighted_diff_applies_on_a_fresh_branch() {
    let fx = Fixture::new(&[chatty(&greet_diff("hi"))]);
    fx.pipeline.reindex().unwrap();
    let proposal = fx.pipeline.new_proposal("Say hi", "greeting should be hi").unwrap();
    let base = current_branch(&fx.repo);

    let drafted = fx.pipeline.draft(proposal.id).await.unwrap();
    assert_eq!(drafted.attempts, 1);
    assert!(drafted.warnings.is_empty());
    assert_eq!(fx.pipeline.show(proposal.id).unwrap().diff, drafted.diff);
    assert_eq!(fx.greet(), GREET);

    let applied = fx.pipeline.apply(proposal.id).unwrap();

    assert!(applied.branch.starts_with("selfpatch/p1-"));
    assert!(applied.commit.is_some());
    assert_eq!(current_branch(&fx.repo), applied.branch);
    assert_ne!(applied.branch, base);
    assert!(fx.greet().contains("\"hi\""));
    assert!(git_ops::is_clean(&fx.repo).unwrap());
    assert_eq!(
        fx.pipeline.show(proposal.id).unwrap().status,
        ProposalStatus::Applied
    );

    let runs = fx.pipeline.history(10).unwrap();
    assert_eq!(runs.len(), 2);
    assert!(runs.iter().all(|r| r.passed));
    assert_eq!(runs[1].branch.as_deref(), Some(applied.branch.as_str()));
}

#[tokio::test]
async fn context_from_the_index_reaches_the_drafter() {
    let fx = Fixture::new(&[greet_diff("hi")]);
    fx.pipeline.reindex().unwrap();
    let proposal = fx.pipeline.new_proposal("Change greet Hello", "").unwrap();

    fx.pipeline.draft(proposal.id).await.unwrap();

    let prompts = fx.drafter.prompts.lock().unwrap();
    assert!(prompts[0].contains("internal/greet/greet.go"));
}

#[tokio::test]
async fn malformed_draft_gets_exactly_one_retry() {
    let broken = greet_diff("hi").replace(" func Hello", "func Hello");
    let fx = Fixture::new(&[broken.clone(), broken]);
    fx.pipeline.reindex().unwrap();
    let proposal = fx.pipeline.new_proposal("Say hi", "").unwrap();

    let err = fx.pipeline.draft(proposal.id).await.unwrap_err();

    match err {
        PipelineError::Syntax(syntax) => {
            assert_eq!(syntax.line, 7);
            assert_eq!(syntax.content, "func Hello() string {");
        }
        other => panic!("expected syntax error, got {:?}", other),
    }
    assert_eq!(fx.drafter.calls(), 2);
    assert!(fx.pipeline.show(proposal.id).unwrap().diff.is_empty());
}

#[tokio::test]
async fn retry_can_recover_a_bad_first_draft() {
    let fx = Fixture::new(&["I cannot produce a diff.".to_string(), greet_diff("hi")]);
    fx.pipeline.reindex().unwrap();
    let proposal = fx.pipeline.new_proposal("Say hi", "").unwrap();

    let drafted = fx.pipeline.draft(proposal.id).await.unwrap();

    assert_eq!(drafted.attempts, 2);
    assert!(fx.drafter.prompts.lock().unwrap()[1].contains("No unified diff"));
}

#[tokio::test]
async fn policy_violation_is_fatal_to_the_draft() {
    let docs = concat!(
        "diff --git a/docs/readme.md b/docs/readme.md\n",
        "new file mode 100644\n",
        "--- /dev/null\n",
        "+++ b/docs/readme.md\n",
        "@@ -0,0 +1 @@\n",
        "+hello\n",
    );
    let fx = Fixture::new(&[docs.to_string()]);
    let proposal = fx.pipeline.new_proposal("Docs", "").unwrap();

    let err = fx.pipeline.draft(proposal.id).await.unwrap_err();

    assert!(matches!(
        err,
        PipelineError::Policy(GuardError::DisallowedRoot { .. })
    ));
    assert!(err.to_string().contains("disallowed path root"));
    assert_eq!(fx.drafter.calls(), 1);
    let runs = fx.pipeline.history(10).unwrap();
    assert_eq!(runs[0].failed_step.as_deref(), Some("guard"));
}

#[tokio::test]
async fn empty_index_is_permissive_with_a_warning() {
    let fx = Fixture::new(&[greet_diff("hi")]);
    let proposal = fx.pipeline.new_proposal("Say hi", "").unwrap();

    let drafted = fx.pipeline.draft(proposal.id).await.unwrap();

    assert_eq!(drafted.warnings.len(), 1);
}

#[tokio::test]
async fn test_failure_during_apply_rolls_back() {
    let fx = Fixture::new(&[]);
    let proposal = fx.pipeline.new_proposal("Break it", "").unwrap();
    fx.pipeline
        .store()
        .set_diff_and_status(proposal.id, &greet_diff("BROKEN"), ProposalStatus::Proposed)
        .unwrap();
    let base = current_branch(&fx.repo);
    let branches = local_branches(&fx.repo);

    let err = fx.pipeline.apply(proposal.id).unwrap_err();

    match &err {
        PipelineError::Apply(failure) => {
            assert_eq!(failure.step, "tests");
            assert!(failure.log.contains("rollback: switch back"));
        }
        other => panic!("expected apply failure, got {:?}", other),
    }
    assert_eq!(current_branch(&fx.repo), base);
    assert_eq!(local_branches(&fx.repo), branches);
    assert_eq!(fx.greet(), GREET);
    assert_eq!(
        fx.pipeline.show(proposal.id).unwrap().status,
        ProposalStatus::Proposed
    );
}

#[test]
fn apply_requires_a_drafted_proposed_proposal() {
    let fx = Fixture::new(&[]);
    let proposal = fx.pipeline.new_proposal("Nothing yet", "").unwrap();

    assert!(matches!(
        fx.pipeline.apply(proposal.id).unwrap_err(),
        PipelineError::InvalidState { action, .. } if action.contains("without a drafted diff")
    ));

    fx.pipeline
        .store()
        .set_diff_and_status(proposal.id, &greet_diff("hi"), ProposalStatus::Applied)
        .unwrap();
    assert!(matches!(
        fx.pipeline.apply(proposal.id).unwrap_err(),
        PipelineError::InvalidState {
            status: ProposalStatus::Applied,
            ..
        }
    ));
    assert!(matches!(
        fx.pipeline.apply(99).unwrap_err(),
        PipelineError::NotFound(99)
    ));
}

#[test]
fn stored_diff_is_guarded_again_before_apply() {
    let fx = Fixture::new(&[]);
    let proposal = fx.pipeline.new_proposal("Sneaky", "").unwrap();
    let manifest = concat!(
        "diff --git a/go.mod b/go.mod\n",
        "--- a/go.mod\n",
        "+++ b/go.mod\n",
        "@@ -1 +1 @@\n",
        "-module example.com/demo\n",
        "+module example.com/other\n",
    );
    fx.pipeline
        .store()
        .set_diff_and_status(proposal.id, manifest, ProposalStatus::Proposed)
        .unwrap();

    assert!(matches!(
        fx.pipeline.apply(proposal.id).unwrap_err(),
        PipelineError::Policy(GuardError::ManifestTouched(_))
    ));
    assert!(local_branches(&fx.repo).len() == 1);
}

#[tokio::test]
async fn rejected_proposals_cannot_be_drafted_and_reject_is_idempotent() {
    let fx = Fixture::new(&[greet_diff("hi")]);
    let proposal = fx.pipeline.new_proposal("Say hi", "").unwrap();

    assert_eq!(
        fx.pipeline.reject(proposal.id).unwrap().status,
        ProposalStatus::Rejected
    );
    assert_eq!(
        fx.pipeline.reject(proposal.id).unwrap().status,
        ProposalStatus::Rejected
    );

    let err = fx.pipeline.draft(proposal.id).await.unwrap_err();
    assert!(matches!(
        err,
        PipelineError::InvalidState {
            action: "draft",
            ..
        }
    ));
    assert_eq!(fx.drafter.calls(), 0);
}

#[test]
fn second_operation_on_the_same_repo_is_busy() {
    let fx = Fixture::new(&[]);
    let proposal = fx.pipeline.new_proposal("Say hi", "").unwrap();
    fx.pipeline
        .store()
        .set_diff_and_status(proposal.id, &greet_diff("hi"), ProposalStatus::Proposed)
        .unwrap();

    let _held = RepoLock::acquire(&fx.repo, Duration::ZERO).unwrap();

    assert!(matches!(
        fx.pipeline.apply(proposal.id).unwrap_err(),
        PipelineError::Busy(_)
    ));
    assert_eq!(fx.greet(), GREET);
}

#[test]
fn apply_refuses_a_stored_rename_out_of_a_disallowed_root() {
    let fx = Fixture::new(&[]);
    let proposal = fx.pipeline.new_proposal("Move the test script", "").unwrap();
    let rename = concat!(
        "diff --git a/run_tests.sh b/internal/run_tests.sh\n",
        "similarity index 100%\n",
        "rename from run_tests.sh\n",
        "rename to internal/run_tests.sh\n",
    );
    fx.pipeline
        .store()
        .set_diff_and_status(proposal.id, rename, ProposalStatus::Proposed)
        .unwrap();

    match fx.pipeline.apply(proposal.id).unwrap_err() {
        PipelineError::Policy(GuardError::DisallowedRoot { path, .. }) => {
            assert_eq!(path, "run_tests.sh")
        }
        other => panic!("expected policy violation, got {:?}", other),
    }
    assert!(fx.repo.join("run_tests.sh").exists());
    assert!(git_ops::is_clean(&fx.repo).unwrap());
}

#[tokio::test]
async fn draft_waits_for_the_lock_without_blocking_the_runtime() {
    let mut config = test_config();
    config.state.lock_wait_secs = 5;
    let fx = Fixture::with_config(&[greet_diff("hi")], config);
    fx.pipeline.reindex().unwrap();
    let proposal = fx.pipeline.new_proposal("Say hi", "").unwrap();

    let held = RepoLock::acquire(&fx.repo, Duration::ZERO).unwrap();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        drop(held);
    });

    let drafted = fx.pipeline.draft(proposal.id).await.unwrap();
    assert_eq!(drafted.attempts, 1);
}

#[tokio::test]
async fn draft_is_busy_while_another_operation_holds_the_lock() {
    let fx = Fixture::new(&[greet_diff("hi")]);
    let proposal = fx.pipeline.new_proposal("Say hi", "").unwrap();
    let _held = RepoLock::acquire(&fx.repo, Duration::ZERO).unwrap();

    assert!(matches!(
        fx.pipeline.draft(proposal.id).await.unwrap_err(),
        PipelineError::Busy(_)
    ));
    assert_eq!(fx.drafter.calls(), 0);
}

#[test]
fn state_directory_does_not_dirty_the_tree() {
    let fx = Fixture::new(&[]);
    fx.pipeline.new_proposal("Anything", "").unwrap();
    fx.pipeline.reindex().unwrap();

    assert!(fx.repo.join(".selfpatch/proposals.json").exists());
    assert!(git_ops::is_clean(&fx.repo).unwrap());
}
