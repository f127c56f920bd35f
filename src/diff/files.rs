use super::{is_file_header, is_hunk_header};

/// A file a diff touches. Rebuilt on every validation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TouchedFile {
    /// Repository-relative, slash-separated.
    pub path: String,
    pub is_new: bool,
}

/// Every header path mentioned by the diff, including the `a/` side and
/// rename/copy sources. Used for checks that must see both sides.
pub fn header_paths(diff: &str) -> Vec<String> {
    let mut paths = Vec::new();
    for line in diff.lines() {
        if let Some(rest) = line.strip_prefix("diff --git ") {
            if let Some((a, b)) = split_git_header(rest) {
                paths.push(a);
                paths.push(b);
            }
        } else if let Some(rest) = line
            .strip_prefix("--- ")
            .or_else(|| line.strip_prefix("+++ "))
        {
            let path = clean_path(rest);
            if path != "/dev/null" {
                paths.push(path);
            }
        } else if let Some(rest) = ["rename from ", "rename to ", "copy from ", "copy to "]
            .iter()
            .find_map(|prefix| line.strip_prefix(prefix))
        {
            paths.push(clean_path(rest));
        }
    }
    paths.retain(|p| !p.is_empty());
    paths
}

/// Files touched by a diff, `b/` side preferred.
///
/// `diff --git` headers are authoritative; bare `---`/`+++` pairs are
/// understood for diffs drafted without git headers.
pub fn touched_files(diff: &str) -> Vec<TouchedFile> {
    let lines: Vec<&str> = diff.lines().collect();
    let mut files: Vec<TouchedFile> = Vec::new();
    let mut in_hunk = false;
    // True while between a `diff --git` header and its first hunk.
    let mut git_header_open = false;
    let mut i = 0;

    while i < lines.len() {
        let line = lines[i];

        if let Some(rest) = line.strip_prefix("diff --git ") {
            in_hunk = false;
            git_header_open = false;
            if let Some((_, b)) = split_git_header(rest) {
                push_unique(&mut files, TouchedFile { path: b, is_new: false });
                git_header_open = true;
            }
            i += 1;
            continue;
        }

        if is_hunk_header(line) {
            in_hunk = true;
            git_header_open = false;
            i += 1;
            continue;
        }

        let next = lines.get(i + 1).copied().unwrap_or("");
        let unified_pair = line.starts_with("--- ") && next.starts_with("+++ ");

        if git_header_open {
            if line.starts_with("new file mode") || line.trim_end() == "--- /dev/null" {
                if let Some(last) = files.last_mut() {
                    last.is_new = true;
                }
            }
        } else if unified_pair && (!in_hunk || looks_like_hunk_follows(&lines, i + 2)) {
            let old = clean_path(&line[4..]);
            let new = clean_path(&next[4..]);
            let is_new = old == "/dev/null";
            let path = if new == "/dev/null" { old } else { new };
            if !path.is_empty() && path != "/dev/null" {
                push_unique(&mut files, TouchedFile { path, is_new });
            }
            in_hunk = false;
            i += 2;
            continue;
        }

        i += 1;
    }

    files
}

fn looks_like_hunk_follows(lines: &[&str], idx: usize) -> bool {
    lines
        .get(idx)
        .map(|l| is_hunk_header(l) || is_file_header(l))
        .unwrap_or(false)
}

fn push_unique(files: &mut Vec<TouchedFile>, file: TouchedFile) {
    if let Some(existing) = files.iter_mut().find(|f| f.path == file.path) {
        existing.is_new |= file.is_new;
    } else {
        files.push(file);
    }
}

/// Split `a/<p> b/<q>`; paths may contain spaces, so split on the last ` b/`.
fn split_git_header(rest: &str) -> Option<(String, String)> {
    let rest = rest.trim_end();
    let idx = rest.rfind(" b/").or_else(|| rest.rfind(" \"b/"))?;
    let a = clean_path(&rest[..idx]);
    let b = clean_path(&rest[idx + 1..]);
    if b.is_empty() {
        return None;
    }
    Some((a, b))
}

fn clean_path(raw: &str) -> String {
    let raw = raw.split('\t').next().unwrap_or(raw).trim();
    let raw = raw.trim_matches('"');
    if raw == "/dev/null" {
        return raw.to_string();
    }
    raw.strip_prefix("a/")
        .or_else(|| raw.strip_prefix("b/"))
        .unwrap_or(raw)
        .replace('\\', "/")
}
