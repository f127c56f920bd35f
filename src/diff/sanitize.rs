use super::{is_file_header, is_hunk_header};

const FENCE: &str = "```";

/// Best-effort cleanup of drafted text into a unified diff.
///
/// Takes the first fenced block (or everything after an unterminated
/// fence), drops prose before the first file header, and rewrites empty
/// lines inside hunks to a single-space context line. Returns an empty
/// string when no diff header is present at all.
pub fn sanitize(raw: &str) -> String {
    let text = raw.replace("\r\n", "\n");
    let unfenced = strip_fence(&text);
    let body = drop_leading_prose(unfenced);
    normalize_hunks(body)
}

fn strip_fence(text: &str) -> &str {
    let mut offset = 0;
    let mut body_start = None;

    for line in text.split_inclusive('\n') {
        let line_end = offset + line.len();
        if line.starts_with(FENCE) {
            match body_start {
                None => body_start = Some(line_end),
                Some(start) => return &text[start..offset],
            }
        }
        offset = line_end;
    }

    match body_start {
        Some(start) => &text[start..],
        None => text,
    }
}

fn drop_leading_prose(text: &str) -> &str {
    let mut offset = 0;
    let mut lines = text.split_inclusive('\n').peekable();
    while let Some(line) = lines.next() {
        let unified_pair = line.starts_with("--- ")
            && lines.peek().map(|next| next.starts_with("+++ ")).unwrap_or(false);
        if is_file_header(line) || unified_pair {
            return &text[offset..];
        }
        offset += line.len();
    }
    ""
}

fn normalize_hunks(body: &str) -> String {
    let mut lines: Vec<&str> = body.lines().collect();
    let mut trailing_blank = 0;
    while lines.last().map(|l| l.is_empty()).unwrap_or(false) {
        lines.pop();
        trailing_blank += 1;
    }
    if lines.is_empty() {
        return String::new();
    }

    let mut out = String::with_capacity(body.len() + 16);
    // Old and new lines the current hunk header still promises.
    let mut owed: Option<(usize, usize)> = None;
    for line in lines {
        if is_file_header(line) {
            owed = None;
        } else if is_hunk_header(line) {
            owed = Some(hunk_counts(line));
            out.push_str(line);
            out.push('\n');
            continue;
        }

        match owed.as_mut() {
            Some((old, new)) => {
                match line.chars().next() {
                    None | Some(' ') => {
                        *old = old.saturating_sub(1);
                        *new = new.saturating_sub(1);
                    }
                    Some('-') => *old = old.saturating_sub(1),
                    Some('+') => *new = new.saturating_sub(1),
                    _ => {}
                }
                out.push_str(if line.is_empty() { " " } else { line });
            }
            None => out.push_str(line),
        }
        out.push('\n');
    }

    // A blank context line at the very end of the last hunk looks like
    // trailing whitespace; keep as many as the header still owes.
    if let Some((mut old, mut new)) = owed {
        while trailing_blank > 0 && old > 0 && new > 0 {
            out.push_str(" \n");
            old -= 1;
            new -= 1;
            trailing_blank -= 1;
        }
    }
    out
}

/// `(old_count, new_count)` from `@@ -a[,b] +c[,d] @@`; an omitted count is 1.
fn hunk_counts(header: &str) -> (usize, usize) {
    let mut old = 1;
    let mut new = 1;
    for token in header.split_whitespace().skip(1).take(2) {
        let count = token
            .split_once(',')
            .map(|(_, n)| n.parse().unwrap_or(0))
            .unwrap_or(1);
        if token.starts_with('-') {
            old = count;
        } else if token.starts_with('+') {
            new = count;
        }
    }
    (old, new)
}
