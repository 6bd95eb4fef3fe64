//! Benchmarks for the hot paths of a dispatch tick using criterion.
//!
//! - Runner selection over growing candidate sets
//! - Workspace memory admission and release
//! - Candidate lookup in a populated registry

#![allow(missing_docs)]

use std::sync::Arc;

use chrono::{Duration, Utc};
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use runq::*;
use runq_testkit::{FakeRunner, FakeRunnerServerClient, StaticConfigProvider};
use tokio::runtime::Runtime;

/// Creates a tokio runtime for async benchmarks.
fn create_runtime() -> Runtime {
    Runtime::new().expect("Failed to create tokio runtime")
}

fn candidates(count: usize) -> Vec<RunnerCandidate> {
    let now = Utc::now();
    (0..count)
        .map(|i| {
            let environment = if i % 2 == 0 { "tomcat7" } else { "jetty9" };
            let location = format!("http://runner-{i}:8080");
            let runner = FakeRunner::new(
                location.clone(),
                RunnerDescriptor::new("java/web").with_environment(environment),
            );
            RunnerCandidate {
                location,
                runner: runner.handle(),
                registration_order: (i as u64, 0),
                last_used_at: (i % 3 != 0).then(|| now - Duration::seconds(i as i64)),
            }
        })
        .collect()
}

/// Benchmark: pick a runner out of N candidates.
fn bench_selection(c: &mut Criterion) {
    let mut group = c.benchmark_group("selection");
    let environment = EnvironmentId::System("tomcat7".into());

    for count in [10, 100, 1_000] {
        let candidates = candidates(count);
        group.throughput(Throughput::Elements(count as u64));

        group.bench_with_input(
            BenchmarkId::new("least_recently_used", count),
            &candidates,
            |b, candidates| {
                b.iter(|| LeastRecentlyUsed.choose(&environment, candidates));
            },
        );
        group.bench_with_input(
            BenchmarkId::new("first_registered", count),
            &candidates,
            |b, candidates| {
                b.iter(|| FirstRegistered.choose(&environment, candidates));
            },
        );
    }

    group.finish();
}

/// Benchmark: reserve and release workspace memory.
fn bench_admission(c: &mut Criterion) {
    let rt = create_runtime();

    let mut group = c.benchmark_group("admission");
    group.sample_size(100);

    group.bench_function("check_memory_release", |b| {
        let provider =
            StaticConfigProvider::new().with_workspace("ws1", WorkspaceConfig::new(1_000_000));
        let admission = ResourceAdmissionChecker::new(Arc::new(provider), 0.95);

        b.to_async(&rt).iter(|| async {
            let reservation = admission
                .check_memory("ws1", 256)
                .await
                .expect("reservation should fit");
            admission.release(&reservation);
        });
    });

    group.finish();
}

/// Benchmark: look up candidates with many servers registered.
fn bench_registry_candidates(c: &mut Criterion) {
    let rt = create_runtime();

    let mut group = c.benchmark_group("registry_candidates");

    for servers in [10, 100] {
        let client = FakeRunnerServerClient::new();
        let registry = RunnerServerRegistry::new(
            Arc::new(client.clone()),
            std::time::Duration::from_secs(1),
            3,
        );
        rt.block_on(async {
            for i in 0..servers {
                let location = format!("http://runner-{i}:8080");
                client.add_server(
                    location.clone(),
                    vec![FakeRunner::new(
                        location.clone(),
                        RunnerDescriptor::new("java/web").with_environment("tomcat7"),
                    )],
                );
                let criteria = if i % 2 == 0 {
                    AccessCriteria::infra("community")
                } else {
                    AccessCriteria::workspace("community", format!("ws{i}"))
                };
                registry
                    .register(&location, criteria)
                    .await
                    .expect("registration should succeed");
            }
        });

        group.throughput(Throughput::Elements(servers as u64));
        group.bench_with_input(BenchmarkId::from_parameter(servers), &registry, |b, registry| {
            b.iter(|| registry.candidates("community", "ws1", "/app"));
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_selection,
    bench_admission,
    bench_registry_candidates
);
criterion_main!(benches);
