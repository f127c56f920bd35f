//! Drafting: ask the backend for a diff, classify what came back, and give
//! it exactly one chance to correct itself.

mod client;
mod prompts;

pub use client::OpenRouterClient;
pub use prompts::{correction_prompt, system_prompt, user_prompt, DraftRequest};

use crate::diff::{sanitize, validate, DiffSyntaxError};
use async_trait::async_trait;

/// Anything that turns a system + user prompt into free text.
#[async_trait]
pub trait DraftBackend: Send + Sync {
    async fn complete(&self, system: &str, user: &str) -> anyhow::Result<String>;
}

/// What a single drafting response amounted to after sanitizing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DraftOutcome {
    Drafted(String),
    /// No diff header anywhere in the response.
    Empty,
    Malformed {
        diff: String,
        error: DiffSyntaxError,
    },
}

impl DraftOutcome {
    pub fn classify(raw: &str) -> Self {
        let diff = sanitize(raw);
        if diff.trim().is_empty() {
            return DraftOutcome::Empty;
        }
        match validate(&diff) {
            Ok(()) => DraftOutcome::Drafted(diff),
            Err(error) => DraftOutcome::Malformed { diff, error },
        }
    }

    pub fn needs_retry(&self) -> bool {
        !matches!(self, DraftOutcome::Drafted(_))
    }
}

/// Final outcome plus how many backend calls it took (1 or 2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DraftResult {
    pub outcome: DraftOutcome,
    pub attempts: u32,
}

/// Draft once; on an empty or malformed response ask exactly once more with
/// the problem spelled out. Backend errors are not retried here.
pub async fn draft_with_retry(
    backend: &dyn DraftBackend,
    system: &str,
    request: &DraftRequest<'_>,
) -> anyhow::Result<DraftResult> {
    let user = user_prompt(request);
    let raw = backend.complete(system, &user).await?;
    let first = DraftOutcome::classify(&raw);
    if !first.needs_retry() {
        return Ok(DraftResult {
            outcome: first,
            attempts: 1,
        });
    }

    tracing::info!(outcome = ?outcome_kind(&first), "draft rejected, asking for one correction");
    let correction = correction_prompt(&user, &raw, &first);
    let raw = backend.complete(system, &correction).await?;
    Ok(DraftResult {
        outcome: DraftOutcome::classify(&raw),
        attempts: 2,
    })
}

fn outcome_kind(outcome: &DraftOutcome) -> &'static str {
    match outcome {
        DraftOutcome::Drafted(_) => "drafted",
        DraftOutcome::Empty => "empty",
        DraftOutcome::Malformed { .. } => "malformed",
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::DraftBackend;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays canned responses in order and records every user prompt.
    #[derive(Default)]
    pub struct ScriptedDrafter {
        responses: Mutex<VecDeque<String>>,
        pub prompts: Mutex<Vec<String>>,
    }

    impl ScriptedDrafter {
        pub fn new<S: AsRef<str>>(responses: &[S]) -> Self {
            Self {
                responses: Mutex::new(responses.iter().map(|r| r.as_ref().to_string()).collect()),
                prompts: Mutex::new(Vec::new()),
            }
        }

        pub fn calls(&self) -> usize {
            self.prompts.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl DraftBackend for ScriptedDrafter {
        async fn complete(&self, _system: &str, user: &str) -> anyhow::Result<String> {
            self.prompts.lock().unwrap().push(user.to_string());
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| anyhow::anyhow!("scripted drafter ran out of responses"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::ScriptedDrafter;
    use super::*;

    const GOOD: &str = concat!(
        "Here is the change:\n",
        "```diff\n",
        "diff --git a/cmd/app/main.go b/cmd/app/main.go\n",
        "--- a/cmd/app/main.go\n",
        "+++ b/cmd/app/main.go\n",
        "@@ -1,3 +1,3 @@\n",
        " package main\n",
        "\n",
        "-var x = 1\n",
        "+var x = 2\n",
        "```\n",
    );

    const BROKEN: &str = concat!(
        "diff --git a/cmd/app/main.go b/cmd/app/main.go\n",
        "--- a/cmd/app/main.go\n",
        "+++ b/cmd/app/main.go\n",
        "@@ -1,3 +1,3 @@\n",
        " package main\n",
        "var x = 1\n",
    );

    fn request() -> DraftRequest<'static> {
        DraftRequest {
            title: "Bump x",
            notes: "x should be 2",
            context: "",
        }
    }

    #[test]
    fn classify_distinguishes_the_three_outcomes() {
        match DraftOutcome::classify(GOOD) {
            DraftOutcome::Drafted(diff) => {
                assert!(diff.starts_with("diff --git"));
                assert!(diff.contains("\n \n"));
            }
            other => panic!("expected drafted, got {:?}", other),
        }
        assert_eq!(DraftOutcome::classify("I could not do it."), DraftOutcome::Empty);
        match DraftOutcome::classify(BROKEN) {
            DraftOutcome::Malformed { error, .. } => assert_eq!(error.line, 6),
            other => panic!("expected malformed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn good_first_draft_needs_one_call() {
        let backend = ScriptedDrafter::new(&[GOOD]);
        let result = draft_with_retry(&backend, "system", &request()).await.unwrap();
        assert_eq!(result.attempts, 1);
        assert!(matches!(result.outcome, DraftOutcome::Drafted(_)));
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test]
    async fn malformed_draft_is_retried_once_with_the_error() {
        let backend = ScriptedDrafter::new(&[BROKEN, GOOD]);
        let result = draft_with_retry(&backend, "system", &request()).await.unwrap();
        assert_eq!(result.attempts, 2);
        assert!(matches!(result.outcome, DraftOutcome::Drafted(_)));

        let prompts = backend.prompts.lock().unwrap();
        assert!(prompts[1].contains("line 6"));
        assert!(prompts[1].contains("var x = 1"));
    }

    #[tokio::test]
    async fn second_failure_is_final() {
        let backend = ScriptedDrafter::new(&["no diff here", "still nothing", GOOD]);
        let result = draft_with_retry(&backend, "system", &request()).await.unwrap();
        assert_eq!(result.attempts, 2);
        assert_eq!(result.outcome, DraftOutcome::Empty);
        assert_eq!(backend.calls(), 2);
    }

    #[tokio::test]
    async fn backend_errors_propagate_without_retry() {
        let backend = ScriptedDrafter::new::<&str>(&[]);
        assert!(draft_with_retry(&backend, "system", &request()).await.is_err());
        assert_eq!(backend.calls(), 1);
    }
}
