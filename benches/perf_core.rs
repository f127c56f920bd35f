use criterion::{black_box, criterion_group, criterion_main, Criterion};
use selfpatch::diff::{sanitize, validate};
use selfpatch::guard::{guard, GuardPolicy};
use selfpatch::index::{keywords, SourceIndex, SourceIndexEntry};

fn synthetic_index(file_count: usize) -> SourceIndex {
    let mut index = SourceIndex::new();
    for i in 0..file_count {
        let package = format!("feature{:03}", i % 120);
        index.upsert(SourceIndexEntry {
            path: format!("internal/{}/file_{:05}.go", package, i),
            package,
            summary: format!("Handlers and helpers for request kind {}", i % 37),
            funcs: vec![format!("Handle{}", i), format!("parse{}", i)],
            types: vec![format!("Request{}", i % 50)],
            vars: vec!["defaultTimeout".to_string()],
        });
    }
    index
}

/// A chatty multi-file draft: prose, a fence, and blank context lines.
fn synthetic_draft(file_count: usize) -> String {
    let mut out = String::from("Here is the patch you asked for:\n\n```diff\n");
    for i in 0..file_count {
        let path = format!("internal/feature{:03}/file_{:05}.go", i % 120, i);
        out.push_str(&format!("diff --git a/{p} b/{p}\n--- a/{p}\n+++ b/{p}\n", p = path));
        out.push_str("@@ -1,6 +1,6 @@\n package feature\n\n func Handle() int {\n");
        out.push_str(&format!("-\treturn {}\n+\treturn {}\n", i, i + 1));
        out.push_str(" }\n\n");
    }
    out.push_str("```\nLet me know if anything else is needed.\n");
    out
}

fn bench_sanitize_validate(c: &mut Criterion) {
    let raw = synthetic_draft(200);
    c.bench_function("sanitize_200_files", |b| {
        b.iter(|| black_box(sanitize(black_box(&raw))));
    });

    let clean = sanitize(&raw);
    c.bench_function("validate_200_files", |b| {
        b.iter(|| black_box(validate(black_box(&clean)).is_ok()));
    });
}

fn bench_guard(c: &mut Criterion) {
    let repo = tempfile::tempdir().expect("tempdir");
    let index = synthetic_index(5_000);
    let diff = sanitize(&synthetic_draft(50));
    let policy = GuardPolicy::default();
    c.bench_function("guard_50_files", |b| {
        b.iter(|| black_box(guard(black_box(&diff), repo.path(), &policy, &index).is_ok()));
    });
}

fn bench_index_search(c: &mut Criterion) {
    let index = synthetic_index(10_000);
    let words = keywords("retry request handling for feature040 timeouts");
    c.bench_function("index_search_10k", |b| {
        b.iter(|| black_box(index.search(black_box(&words), 8)));
    });
}

criterion_group!(perf_core, bench_sanitize_validate, bench_guard, bench_index_search);
criterion_main!(perf_core);
