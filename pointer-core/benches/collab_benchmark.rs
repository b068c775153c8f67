use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use pointer_core::{Node, ReplicatedDocument, Snapshot};
use std::hint::black_box;

fn sample_snapshot(blocks: usize) -> Snapshot {
    let paragraphs: Vec<String> = (0..blocks)
        .map(|i| format!("Paragraph {i} with a little bit of text in it"))
        .collect();
    let refs: Vec<&str> = paragraphs.iter().map(String::as_str).collect();
    Snapshot::from_paragraphs(&refs)
}

fn bench_content_hash(c: &mut Criterion) {
    let mut group = c.benchmark_group("Snapshot");
    group.throughput(Throughput::Elements(1));

    let snapshot = sample_snapshot(200);
    group.bench_function("content_hash_200_blocks", |b| {
        b.iter(|| black_box(snapshot.content_hash()))
    });

    group.finish();
}

fn bench_local_edit(c: &mut Criterion) {
    let mut group = c.benchmark_group("CRDT Operations");
    group.throughput(Throughput::Elements(1));

    group.bench_function("insert_text", |b| {
        // Measures typing into a document that keeps growing.
        let doc = ReplicatedDocument::new();
        doc.append_block(&Node::paragraph("start")).unwrap();
        b.iter(|| {
            doc.insert_text(0, 0, black_box("x")).unwrap();
        })
    });

    group.finish();
}

fn bench_apply_remote(c: &mut Criterion) {
    let mut group = c.benchmark_group("CRDT Operations");
    group.throughput(Throughput::Elements(1));

    let source = ReplicatedDocument::new();
    let seed = source.seed(&sample_snapshot(50)).unwrap();

    group.bench_function("apply_remote_seed_50_blocks", |b| {
        // Re-applying the same update is idempotent.
        let dest = ReplicatedDocument::new();
        b.iter(|| {
            dest.apply_remote(black_box(&seed)).unwrap();
        })
    });

    group.bench_function("snapshot_50_blocks", |b| {
        b.iter(|| black_box(source.snapshot().unwrap()))
    });

    group.finish();
}

criterion_group!(benches, bench_content_hash, bench_local_edit, bench_apply_remote);
criterion_main!(benches);
