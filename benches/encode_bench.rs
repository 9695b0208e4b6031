use std::hint::black_box;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

use pg_engine::messages::frontend::FrontendSink;

fn bench_put_query(c: &mut Criterion) {
    let mut group = c.benchmark_group("put_query");

    let queries = vec![
        ("short", "SELECT 1"),
        (
            "medium",
            "SELECT * FROM users WHERE id = 1 AND status = 'active'",
        ),
        (
            "long",
            "SELECT u.id, u.name, u.email, o.order_id, o.total FROM users u JOIN orders o ON u.id = o.user_id WHERE u.created_at > '2024-01-01' AND o.status IN ('pending', 'completed') ORDER BY o.created_at DESC LIMIT 100",
        ),
    ];

    for (name, query) in queries {
        group.bench_with_input(BenchmarkId::from_parameter(name), &query, |b, &query| {
            b.iter(|| {
                let mut sink = FrontendSink::new();
                sink.put_query(black_box(query.as_bytes()));
                sink.take()
            });
        });
    }

    group.finish();
}

fn bench_extended_pipeline(c: &mut Criterion) {
    let mut group = c.benchmark_group("extended_pipeline");

    let param_sets: Vec<(&str, Vec<Option<Vec<u8>>>)> = vec![
        ("no_params", vec![]),
        ("three_params", vec![
            Some(b"42".to_vec()),
            Some(b"hello".to_vec()),
            None,
        ]),
        (
            "ten_params",
            (0..10).map(|i| Some(format!("param-{i}").into_bytes())).collect(),
        ),
    ];

    for (name, params) in param_sets {
        group.bench_with_input(BenchmarkId::from_parameter(name), &params, |b, params| {
            b.iter(|| {
                let mut sink = FrontendSink::new();
                sink.put_parse(b"", black_box(b"SELECT * FROM t WHERE a = $1"), &[])
                    .put_bind(b"", b"", black_box(params))
                    .put_describe(b'P', b"")
                    .put_execute(b"", 0)
                    .put_close(b'S', b"")
                    .put_sync();
                sink.take()
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_put_query, bench_extended_pipeline);
criterion_main!(benches);
