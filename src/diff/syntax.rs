use super::{is_file_header, is_hunk_header, HUNK_LINE_PREFIXES};
use regex::Regex;
use std::sync::OnceLock;
use thiserror::Error;

fn hunk_header_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^@@ -\d+(,\d+)? \+\d+(,\d+)? @@").expect("hunk header pattern is valid")
    })
}

/// First hunk line that breaks the unified diff prefix rule.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid diff syntax at line {line}: {reason}: {content:?}")]
pub struct DiffSyntaxError {
    /// 1-based line number within the diff.
    pub line: usize,
    pub content: String,
    pub reason: String,
}

/// Check that every non-empty line inside a hunk carries a unified-diff prefix.
pub fn validate(diff: &str) -> Result<(), DiffSyntaxError> {
    let mut in_hunk = false;
    for (idx, line) in diff.lines().enumerate() {
        if is_file_header(line) {
            in_hunk = false;
            continue;
        }
        if is_hunk_header(line) {
            if !hunk_header_re().is_match(line) {
                return Err(DiffSyntaxError {
                    line: idx + 1,
                    content: line.to_string(),
                    reason: "malformed hunk header".to_string(),
                });
            }
            in_hunk = true;
            continue;
        }
        if !in_hunk || line.is_empty() {
            continue;
        }
        if !line.starts_with(HUNK_LINE_PREFIXES) {
            return Err(DiffSyntaxError {
                line: idx + 1,
                content: line.to_string(),
                reason: "hunk line must start with ' ', '+', '-' or '\\'".to_string(),
            });
        }
    }
    Ok(())
}
