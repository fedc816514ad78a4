//! Statement Helper Benchmarks
//!
//! These run on every `execute` call before any I/O:
//! - Write classification (with leading comments)
//! - Multi-statement detection
//! - `LIMIT` / `TOP` injection
//! - SQL Server placeholder rewriting
//! - Client-side `LIKE` matching (Hive/Impala discovery)

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use dbrelay::capability::{
    has_multiple_statements, inject_limit, inject_top, is_write_statement, like_match,
    rewrite_mssql_placeholders,
};

const SELECT: &str = "/* dashboard */ -- weekly\nSELECT o.id, c.name, o.total FROM orders o \
                      JOIN customers c ON c.id = o.customer_id WHERE c.note <> 'update; later' ORDER BY o.id";

fn bench_classification(c: &mut Criterion) {
    c.bench_function("is_write_statement", |b| b.iter(|| is_write_statement(black_box(SELECT))));
    c.bench_function("has_multiple_statements", |b| b.iter(|| has_multiple_statements(black_box(SELECT))));
}

fn bench_row_limits(c: &mut Criterion) {
    c.bench_function("inject_limit", |b| b.iter(|| inject_limit(black_box(SELECT), black_box(1001))));
    c.bench_function("inject_top", |b| {
        b.iter(|| inject_top(black_box("SELECT DISTINCT name FROM sys.tables WHERE name LIKE @p0"), 1001));
    });
}

fn bench_placeholders(c: &mut Criterion) {
    let sql = "SELECT * FROM t WHERE a = @p0 AND b = @p1 AND c IN (@p2, @p3, @p4) AND d = '@p9' AND @@ROWCOUNT > 0";
    c.bench_function("rewrite_mssql_placeholders", |b| {
        b.iter(|| rewrite_mssql_placeholders(black_box(sql)));
    });
}

fn bench_like(c: &mut Criterion) {
    let names: Vec<String> = (0..500).map(|i| format!("fact_sales_{i:04}_daily")).collect();
    c.bench_function("like_match_500_tables", |b| {
        b.iter(|| names.iter().filter(|name| like_match(black_box("FACT_%_00_1_daily"), name)).count());
    });
}

criterion_group!(benches, bench_classification, bench_row_limits, bench_placeholders, bench_like);
criterion_main!(benches);
