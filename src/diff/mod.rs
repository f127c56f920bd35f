//! Unified diff handling for drafted patches
//!
//! Drafted text goes through [`sanitize`] (fence/prose stripping and hunk
//! normalization), then [`validate`] (hunk-line prefix rules), then
//! [`touched_files`] feeds the path guard.

mod files;
mod sanitize;
mod syntax;

pub use files::{header_paths, touched_files, TouchedFile};
pub use sanitize::sanitize;
pub use syntax::{validate, DiffSyntaxError};

/// Prefixes a line inside a hunk body may start with.
pub(crate) const HUNK_LINE_PREFIXES: [char; 4] = [' ', '+', '-', '\\'];

pub(crate) fn is_file_header(line: &str) -> bool {
    line.starts_with("diff --git ")
}

pub(crate) fn is_hunk_header(line: &str) -> bool {
    line.starts_with("@@")
}

/// Count of added and removed lines, for display.
pub fn stats(diff: &str) -> (usize, usize) {
    let mut in_hunk = false;
    let mut added = 0;
    let mut removed = 0;
    for line in diff.lines() {
        if is_file_header(line) {
            in_hunk = false;
        } else if is_hunk_header(line) {
            in_hunk = true;
        } else if in_hunk {
            if line.starts_with("+++ ") || line.starts_with("--- ") {
                continue;
            }
            if line.starts_with('+') {
                added += 1;
            } else if line.starts_with('-') {
                removed += 1;
            }
        }
    }
    (added, removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_counts_hunk_changes_only() {
        let diff = "diff --git a/cmd/a.go b/cmd/a.go\n--- a/cmd/a.go\n+++ b/cmd/a.go\n@@ -1,2 +1,2 @@\n package main\n-var x = 1\n+var x = 2\n+var y = 3\n";
        assert_eq!(stats(diff), (2, 1));
    }
}
