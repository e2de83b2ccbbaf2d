use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use phasegate::core::chunker::{self, DEFAULT_MAX_TOKENS};
use phasegate::core::index::IndexBuilder;
use phasegate::core::rag::{RagEngine, SearchFilters};
use std::fs;
use std::path::Path;
use tempfile::TempDir;

fn standards_doc(topic: usize) -> String {
    let mut doc = format!("# Standard {topic}\n\nGuidance for area {topic}.\n");
    for section in 0..8 {
        doc.push_str(&format!(
            "\n## Section {section}\nPrefer small functions, explicit errors and tests that describe behavior. \
             Mock at the boundary for topic {topic}.\n\n```bash\ncargo test -- topic_{topic}\n```\n"
        ));
    }
    doc
}

fn seed_corpus(base: &Path, files: usize) {
    let standards = base.join("standards");
    fs::create_dir_all(&standards).unwrap();
    for i in 0..files {
        fs::write(standards.join(format!("standard-{i}.md")), standards_doc(i)).unwrap();
    }
    for phase in 1..=4 {
        let dir = base.join(format!("workflows/bench_v1/phases/{phase}"));
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("phase.md"),
            format!("# Phase {phase}\n\nCount the functions and record the evidence.\n"),
        )
        .unwrap();
    }
}

/// Benchmark markdown chunking
fn bench_chunking(c: &mut Criterion) {
    let mut group = c.benchmark_group("chunking");
    for sections in [1usize, 10, 50] {
        let doc = standards_doc(0).repeat(sections);
        group.bench_with_input(BenchmarkId::from_parameter(sections), &doc, |b, doc| {
            b.iter(|| chunker::chunk_markdown("standards/x.md", "standards", black_box(doc), DEFAULT_MAX_TOKENS));
        });
    }
    group.finish();
}

/// Benchmark repeated queries, which hit the result cache after the first call
fn bench_search(c: &mut Criterion) {
    let mut group = c.benchmark_group("search");
    for files in [10usize, 100] {
        let temp_dir = TempDir::new().unwrap();
        let base = temp_dir.path().join(".agent-os");
        seed_corpus(&base, files);
        let index_path = base.join(".cache/index");
        IndexBuilder::new(
            &index_path,
            vec![
                ("standards".to_string(), base.join("standards")),
                ("workflows".to_string(), base.join("workflows")),
            ],
        )
        .build_index(true, false)
        .unwrap();
        let rag = RagEngine::open(&index_path).unwrap();

        group.bench_with_input(BenchmarkId::new("cached_unfiltered", files), &rag, |b, rag| {
            b.iter(|| rag.search(black_box("mock boundary errors"), 5, &SearchFilters::default()).unwrap());
        });
        group.bench_with_input(BenchmarkId::new("cached_workflow_phase", files), &rag, |b, rag| {
            let filters = SearchFilters::for_workflow("bench_v1", 2);
            b.iter(|| rag.search(black_box("functions evidence"), 5, &filters).unwrap());
        });
    }
    group.finish();
}

fn bench_index_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("index_build");
    group.sample_size(10);
    let temp_dir = TempDir::new().unwrap();
    let base = temp_dir.path().join(".agent-os");
    seed_corpus(&base, 50);
    let builder = IndexBuilder::new(
        &base.join(".cache/index"),
        vec![("standards".to_string(), base.join("standards"))],
    );

    group.bench_function("full", |b| {
        b.iter(|| builder.build_index(true, false).unwrap());
    });
    group.bench_function("unchanged", |b| {
        b.iter(|| builder.build_index(false, true).unwrap());
    });
    group.finish();
}

criterion_group!(benches, bench_chunking, bench_search, bench_index_build);
criterion_main!(benches);
