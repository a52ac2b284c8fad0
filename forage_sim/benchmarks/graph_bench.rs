use criterion::{criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};
use forage_proto::Fingerprint;
use forage_sim::{execute, ArtifactCache, ExecutorOptions, TaskGraph, TaskSpec};

/// A layered graph: `width` independent chains of `depth` nodes each.
fn layered(width: usize, depth: usize) -> TaskGraph<u64> {
    let mut graph = TaskGraph::new();
    for chain in 0..width {
        let root = format!("seed/{chain}");
        graph.seed(root.as_str(), Fingerprint::of_bytes(root.as_bytes()), Some(chain as u64));
        let mut previous = root;
        for level in 0..depth {
            let key = format!("value/{chain}/{level}");
            let input = previous.clone();
            graph.add_task(
                TaskSpec::new(format!("add/{chain}/{level}"), "add")
                    .input(input.as_str())
                    .output(key.as_str())
                    .run(move |inputs| {
                        let value = inputs.get(&input.as_str().into())?;
                        Ok(vec![value.wrapping_mul(31).wrapping_add(7)])
                    }),
            );
            previous = key;
        }
    }
    graph
}

fn bench_graph(c: &mut Criterion) {
    let mut group = c.benchmark_group("taskgraph");

    for width in [16usize, 64, 256] {
        group.bench_with_input(BenchmarkId::new("execute", width), &width, |b, &width| {
            b.iter_batched(
                || (layered(width, 8).plan().expect("plan"), ArtifactCache::<u64>::in_memory()),
                |(plan, cache)| {
                    execute(&plan, &cache, &ExecutorOptions::default()).expect("execute")
                },
                BatchSize::SmallInput,
            )
        });
    }

    group.finish();
}

criterion_group!(graph_benches, bench_graph);
criterion_main!(graph_benches);
