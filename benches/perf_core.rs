use criterion::{black_box, criterion_group, criterion_main, Criterion};
use patchloom::config::Config;
use patchloom::consistency::ConsistencyChecker;
use patchloom::files::FileSet;
use patchloom::graph::DependencyGraph;
use patchloom::patch::{self, Hunk, Patch};

fn synthetic_source(line_count: usize) -> String {
    (0..line_count)
        .map(|i| format!("export const value_{i:05} = compute({i});\n"))
        .collect()
}

/// One replacement every `stride` lines, with context so moved content can be found
fn synthetic_patch(content: &str, stride: usize) -> Patch {
    let lines: Vec<&str> = content.lines().collect();
    let hunks = (stride..lines.len().saturating_sub(3))
        .step_by(stride)
        .map(|idx| {
            Hunk::new(
                idx + 1,
                vec![lines[idx].to_string()],
                vec![lines[idx].replace("compute", "computeCached")],
            )
            .with_context(
                lines[idx - 3..idx].iter().map(|l| l.to_string()).collect(),
                lines[idx + 1..idx + 3].iter().map(|l| l.to_string()).collect(),
            )
        })
        .collect();
    Patch::new("src/values.ts", "cache computations", hunks)
}

fn synthetic_project(file_count: usize) -> FileSet {
    FileSet::from_pairs((0..file_count).map(|i| {
        let next = (i + 1) % file_count;
        let skip = (i * 7 + 3) % file_count;
        let content = format!(
            "import {{ f{next} }} from \"./mod_{next:04}\";\nimport {{ f{skip} }} from \"./mod_{skip:04}\";\nexport function f{i}() {{ return f{next}() + f{skip}(); }}\n"
        );
        (format!("src/mod_{i:04}.ts"), content)
    }))
}

fn bench_apply(c: &mut Criterion) {
    let content = synthetic_source(5_000);
    let patch = synthetic_patch(&content, 50);

    c.bench_function("apply_exact", |b| {
        b.iter(|| black_box(patch::apply(black_box(&patch), black_box(&content))));
    });

    // Shift every line so each hunk falls back to the context search
    let shifted = format!("// header\n// header\n{content}");
    c.bench_function("apply_fuzzy_shifted", |b| {
        b.iter(|| black_box(patch::apply(black_box(&patch), black_box(&shifted))));
    });
}

fn bench_find_by_context(c: &mut Criterion) {
    let content = synthetic_source(10_000);
    let lines: Vec<&str> = content.lines().collect();
    let before: Vec<String> = lines[9_000..9_003].iter().map(|l| l.to_string()).collect();
    let target = vec![lines[9_003].to_string()];

    c.bench_function("find_by_context_10k", |b| {
        b.iter(|| black_box(patch::find_by_context(black_box(&lines), &before, &target)));
    });
}

fn bench_graph(c: &mut Criterion) {
    let files = synthetic_project(2_000);
    let resolver = Config::default().resolver.resolver();

    c.bench_function("graph_build_2k", |b| {
        b.iter(|| black_box(DependencyGraph::build(black_box(&files), &resolver)));
    });

    let graph = DependencyGraph::build(&files, &resolver);
    c.bench_function("find_cycles_2k", |b| {
        b.iter(|| black_box(graph.find_cycles()));
    });
}

fn bench_consistency(c: &mut Criterion) {
    let files = synthetic_project(500);
    let checker = ConsistencyChecker::new(Config::default().resolver.resolver());
    let patch = Patch::new(
        "src/mod_0000.ts",
        "rename f0",
        vec![Hunk::new(
            3,
            vec!["export function f0() { return f1() + f3(); }".to_string()],
            vec!["export function g0() { return f1() + f3(); }".to_string()],
        )],
    );

    c.bench_function("check_batch_500", |b| {
        b.iter(|| black_box(checker.check_batch(std::slice::from_ref(&patch), black_box(&files))));
    });
}

criterion_group!(
    perf_core,
    bench_apply,
    bench_find_by_context,
    bench_graph,
    bench_consistency
);
criterion_main!(perf_core);
