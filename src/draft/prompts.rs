use super::DraftOutcome;
use crate::guard::GuardPolicy;
use crate::util::truncate;

/// Cap on how much of a rejected response is echoed back in the correction.
const MAX_ECHO_CHARS: usize = 4000;

/// Drafting instructions with the path policy spelled out.
pub fn system_prompt(policy: &GuardPolicy) -> String {
    let roots = policy
        .allowed_roots
        .iter()
        .map(|r| format!("{}/", r))
        .collect::<Vec<_>>()
        .join(" or ");
    let manifests = policy.manifest_files.join(" or ");
    format!(
        r#"You are a careful engineer changing a Go codebase.

OUTPUT FORMAT:
- Reply with ONE unified diff (git diff format) and nothing else
- Start every file with a `diff --git a/<path> b/<path>` header, then `---` and `+++` lines
- Every line inside a hunk starts with a space (context), `+` (added) or `-` (removed)
- Blank context lines are a single space, never an empty line
- Mark new files with `new file mode 100644` and `--- /dev/null`

RULES:
- Only modify files under {}
- Never touch {}
- Keep the change minimal and make sure the test suite still passes
- Include at least three lines of unchanged context around each change"#,
        roots, manifests
    )
}

/// Everything the drafting call gets to see about one proposal.
#[derive(Debug, Clone, Copy)]
pub struct DraftRequest<'a> {
    pub title: &'a str,
    pub notes: &'a str,
    /// Index summary of the most relevant source files; may be empty.
    pub context: &'a str,
}

pub fn user_prompt(request: &DraftRequest<'_>) -> String {
    let mut prompt = format!("CHANGE: {}\n", request.title.trim());
    if !request.notes.trim().is_empty() {
        prompt.push_str("\nDETAILS:\n");
        prompt.push_str(request.notes.trim());
        prompt.push('\n');
    }
    if !request.context.trim().is_empty() {
        prompt.push_str("\nRELEVANT FILES:\n");
        prompt.push_str(request.context.trim_end());
        prompt.push('\n');
    }
    prompt.push_str("\nReturn the unified diff now.");
    prompt
}

/// Follow-up for the single retry: the original ask plus what was wrong.
pub fn correction_prompt(original: &str, previous_response: &str, outcome: &DraftOutcome) -> String {
    let problem = match outcome {
        DraftOutcome::Empty => {
            "No unified diff was found in your reply. It must contain a `diff --git` header."
                .to_string()
        }
        DraftOutcome::Malformed { error, .. } => format!(
            "Your diff is invalid at line {}: {}.\nOffending line: {:?}",
            error.line, error.reason, error.content
        ),
        DraftOutcome::Drafted(_) => "Your previous reply was not accepted.".to_string(),
    };
    format!(
        "{}\n\nYOUR PREVIOUS REPLY:\n{}\n\nPROBLEM:\n{}\n\nReply again with ONLY the corrected unified diff.",
        original,
        truncate(previous_response, MAX_ECHO_CHARS),
        problem
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_prompt_skips_empty_sections() {
        let prompt = user_prompt(&DraftRequest {
            title: "Add retries",
            notes: "  ",
            context: "",
        });
        assert!(prompt.starts_with("CHANGE: Add retries"));
        assert!(!prompt.contains("DETAILS"));
        assert!(!prompt.contains("RELEVANT FILES"));
    }

    #[test]
    fn user_prompt_includes_notes_and_context() {
        let prompt = user_prompt(&DraftRequest {
            title: "Add retries",
            notes: "retry twice",
            context: "- internal/net/client.go (package net)\n",
        });
        assert!(prompt.contains("DETAILS:\nretry twice"));
        assert!(prompt.contains("RELEVANT FILES:\n- internal/net/client.go"));
    }

    #[test]
    fn system_prompt_names_configured_roots_and_manifests() {
        let prompt = system_prompt(&GuardPolicy::default());
        assert!(prompt.contains("Only modify files under cmd/ or internal/"));
        assert!(prompt.contains("Never touch go.mod or go.sum"));
    }

    #[test]
    fn correction_for_empty_reply_asks_for_a_header() {
        let text = correction_prompt("CHANGE: x", "sorry", &DraftOutcome::Empty);
        assert!(text.contains("No unified diff"));
        assert!(text.contains("YOUR PREVIOUS REPLY:\nsorry"));
    }
}
