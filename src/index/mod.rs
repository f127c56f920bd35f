//! Structural source index
//!
//! Walks the repository's Go sources, records each file's package and
//! top-level symbols, and answers two questions: "is this path a known
//! source file?" (for the path guard) and "which files matter for this
//! request?" (for drafting context).

pub mod parser;

use crate::store::StateDir;
use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub const INDEX_FILE: &str = "index.json";

const SKIPPED_DIRS: [&str; 4] = [".git", "vendor", "node_modules", "testdata"];
const MAX_SYMBOLS_IN_CONTEXT: usize = 12;

/// Read side of the index, as seen by the path guard.
pub trait SourceCatalog {
    fn is_empty(&self) -> bool;
    fn contains(&self, path: &str) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceIndexEntry {
    /// Repository-relative, slash-separated.
    pub path: String,
    pub package: String,
    pub summary: String,
    #[serde(default)]
    pub funcs: Vec<String>,
    #[serde(default)]
    pub types: Vec<String>,
    #[serde(default)]
    pub vars: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchHit {
    pub path: String,
    pub summary: String,
    pub score: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReindexStats {
    pub indexed: usize,
    pub removed: usize,
    pub with_errors: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceIndex {
    entries: BTreeMap<String, SourceIndexEntry>,
    #[serde(default)]
    pub indexed_at: Option<DateTime<Utc>>,
}

impl SourceCatalog for SourceIndex {
    fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }
}

impl SourceIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the persisted index; a missing file is an empty index.
    pub fn load(state: &StateDir) -> anyhow::Result<Self> {
        Ok(state.read_json(INDEX_FILE)?.unwrap_or_default())
    }

    pub fn save(&self, state: &StateDir) -> anyhow::Result<()> {
        state.write_json(INDEX_FILE, self)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn lookup(&self, path: &str) -> Option<&SourceIndexEntry> {
        self.entries.get(path)
    }

    pub fn upsert(&mut self, entry: SourceIndexEntry) {
        self.entries.insert(entry.path.clone(), entry);
    }

    /// Rescan `root`, upserting every parsed file and dropping entries whose
    /// files are gone.
    pub fn reindex(&mut self, root: &Path) -> anyhow::Result<ReindexStats> {
        let files = collect_go_files(root);
        tracing::info!(root = %root.display(), files = files.len(), "indexing sources");

        let parsed: Vec<Option<(SourceIndexEntry, bool)>> = files
            .par_iter()
            .map(|(abs, rel)| match index_file(abs, rel) {
                Ok(result) => Some(result),
                Err(err) => {
                    tracing::warn!(path = %rel, error = %err, "skipping unreadable source file");
                    None
                }
            })
            .collect();

        let mut stats = ReindexStats::default();
        let mut seen = HashSet::new();
        for item in parsed {
            match item {
                Some((entry, has_errors)) => {
                    if has_errors {
                        stats.with_errors += 1;
                    }
                    seen.insert(entry.path.clone());
                    self.upsert(entry);
                    stats.indexed += 1;
                }
                None => stats.skipped += 1,
            }
        }

        let before = self.entries.len();
        self.entries.retain(|path, _| seen.contains(path));
        stats.removed = before - self.entries.len();
        self.indexed_at = Some(Utc::now());
        Ok(stats)
    }

    /// Case-insensitive keyword search over path, package, symbols and
    /// summary. Highest score first, ties by path.
    pub fn search<S: AsRef<str>>(&self, keywords: &[S], limit: usize) -> Vec<SearchHit> {
        let keywords: Vec<String> = keywords
            .iter()
            .map(|k| k.as_ref().trim().to_lowercase())
            .filter(|k| !k.is_empty())
            .collect();
        if keywords.is_empty() || limit == 0 {
            return Vec::new();
        }

        let mut hits: Vec<SearchHit> = self
            .entries
            .values()
            .filter_map(|entry| {
                let score = score_entry(entry, &keywords);
                (score > 0).then(|| SearchHit {
                    path: entry.path.clone(),
                    summary: entry.summary.clone(),
                    score,
                })
            })
            .collect();

        hits.sort_by(|a, b| b.score.cmp(&a.score).then_with(|| a.path.cmp(&b.path)));
        hits.truncate(limit);
        hits
    }

    /// Drafting context: the best matches for `query`, with their symbols,
    /// capped at `budget_chars`.
    pub fn context_snippet(&self, query: &str, limit: usize, budget_chars: usize) -> String {
        let words = keywords(query);
        let mut out = String::new();
        for hit in self.search(&words, limit) {
            let Some(entry) = self.lookup(&hit.path) else {
                continue;
            };
            let block = format_entry(entry);
            if out.len() + block.len() > budget_chars {
                break;
            }
            out.push_str(&block);
        }
        out
    }
}

/// Split free text into lowercase search terms, dropping noise words.
pub fn keywords(text: &str) -> Vec<String> {
    const STOP_WORDS: [&str; 16] = [
        "the", "and", "for", "with", "this", "that", "from", "into", "add", "make", "should",
        "when", "then", "use", "not", "all",
    ];
    let mut seen = HashSet::new();
    text.split(|c: char| !c.is_alphanumeric() && c != '_')
        .map(|w| w.to_lowercase())
        .filter(|w| w.chars().count() >= 3 && !STOP_WORDS.contains(&w.as_str()))
        .filter(|w| seen.insert(w.clone()))
        .collect()
}

fn score_entry(entry: &SourceIndexEntry, keywords: &[String]) -> u32 {
    let path = entry.path.to_lowercase();
    let package = entry.package.to_lowercase();
    let summary = entry.summary.to_lowercase();
    let mut score = 0;
    for kw in keywords {
        if path.contains(kw.as_str()) {
            score += 3;
        }
        if package == *kw {
            score += 3;
        }
        let symbol_hits = entry
            .funcs
            .iter()
            .chain(&entry.types)
            .chain(&entry.vars)
            .filter(|s| s.to_lowercase().contains(kw.as_str()))
            .count() as u32;
        score += 2 * symbol_hits.min(3);
        if summary.contains(kw.as_str()) {
            score += 1;
        }
    }
    score
}

fn format_entry(entry: &SourceIndexEntry) -> String {
    let mut block = format!("- {} (package {})\n  {}\n", entry.path, entry.package, entry.summary);
    let symbols = |label: &str, names: &[String]| -> String {
        if names.is_empty() {
            return String::new();
        }
        let shown: Vec<&str> = names
            .iter()
            .take(MAX_SYMBOLS_IN_CONTEXT)
            .map(|s| s.as_str())
            .collect();
        let more = names.len().saturating_sub(shown.len());
        if more > 0 {
            format!("  {}: {} (+{} more)\n", label, shown.join(", "), more)
        } else {
            format!("  {}: {}\n", label, shown.join(", "))
        }
    };
    block.push_str(&symbols("funcs", &entry.funcs));
    block.push_str(&symbols("types", &entry.types));
    block.push_str(&symbols("vars", &entry.vars));
    block
}

fn collect_go_files(root: &Path) -> Vec<(PathBuf, String)> {
    let mut files: Vec<(PathBuf, String)> = WalkDir::new(root)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !is_skipped(e))
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| e.path().extension().and_then(|x| x.to_str()) == Some("go"))
        .map(|e| {
            let rel = e.path().strip_prefix(root).unwrap_or(e.path());
            (e.path().to_path_buf(), slash_path(rel))
        })
        .collect();
    files.sort_by(|a, b| a.1.cmp(&b.1));
    files
}

fn is_skipped(entry: &walkdir::DirEntry) -> bool {
    let name = entry.file_name().to_str().unwrap_or("");
    entry.file_type().is_dir() && (SKIPPED_DIRS.contains(&name) || name.starts_with('.'))
}

fn slash_path(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn index_file(abs: &Path, rel: &str) -> anyhow::Result<(SourceIndexEntry, bool)> {
    let content = std::fs::read_to_string(abs)?;
    let parsed = parser::parse_go(&content)?;
    let summary = match &parsed.doc {
        Some(doc) => first_sentence(doc),
        None => infer_summary(rel, &parsed),
    };
    let entry = SourceIndexEntry {
        path: rel.to_string(),
        package: parsed.package,
        summary,
        funcs: parsed.funcs,
        types: parsed.types,
        vars: parsed.vars,
    };
    Ok((entry, parsed.has_errors))
}

fn first_sentence(doc: &str) -> String {
    let end = doc.find(". ").map(|i| i + 1).unwrap_or(doc.len());
    crate::util::truncate(doc[..end].trim(), 160)
}

/// One-line description from the file name and exported symbols.
fn infer_summary(rel: &str, file: &parser::GoFile) -> String {
    let path = Path::new(rel);
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("");

    let mut parts = Vec::new();
    if stem.ends_with("_test") {
        parts.push(format!("Tests for package {}", file.package));
    } else {
        match stem {
            "main" => parts.push("Command entry point".to_string()),
            "doc" => parts.push(format!("Documentation for package {}", file.package)),
            "types" => parts.push("Type definitions".to_string()),
            "config" => parts.push("Configuration handling".to_string()),
            "errors" => parts.push("Error definitions".to_string()),
            _ => {}
        }
    }

    let exported = |names: &[String]| -> Vec<String> {
        names
            .iter()
            .filter(|n| is_exported(n))
            .cloned()
            .collect()
    };
    let types = exported(&file.types);
    let funcs = exported(&file.funcs);

    if !types.is_empty() {
        parts.push(describe_list("Defines", &types, "type", "types"));
    }
    if !funcs.is_empty() {
        parts.push(describe_list("Provides", &funcs, "function", "functions"));
    }

    if parts.is_empty() {
        let count = file.funcs.len() + file.types.len() + file.vars.len();
        return if count == 0 {
            format!("Package {} file {} (no declarations)", file.package, stem)
        } else {
            format!("Package {} internals ({} declarations)", file.package, count)
        };
    }
    parts.join(". ")
}

fn describe_list(verb: &str, names: &[String], one: &str, many: &str) -> String {
    match names.len() {
        1 => format!("{} {} {}", verb, names[0], one),
        2..=3 => format!("{} {} {}", verb, names.join(", "), many),
        n => format!("{} {} and {} other {}", verb, names[..2].join(", "), n - 2, many),
    }
}

/// Go exports by capitalisation; for methods the method name decides.
fn is_exported(name: &str) -> bool {
    let last = name.rsplit('.').next().unwrap_or(name);
    last.chars().next().map(|c| c.is_uppercase()).unwrap_or(false)
}
