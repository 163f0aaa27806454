use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;
use tandem_core::{decode_update, diff_since, encode_update, Document, ReplicaId, StateVector};

fn editor_buffer(chars: usize) -> Document {
    let mut doc = Document::with_replica(ReplicaId(1));
    let line = "console.log(\"hello\");\n";
    while doc.visible_len() < chars {
        doc.insert_at(doc.visible_len(), line);
    }
    doc
}

fn bench_local_keystroke(c: &mut Criterion) {
    let mut doc = editor_buffer(4_000);
    let middle = doc.visible_len() / 2;

    c.bench_function("keystroke_insert_4k_doc", |b| {
        b.iter(|| {
            black_box(doc.insert_at(black_box(middle), "x"));
        })
    });
}

fn bench_merge_remote_run(c: &mut Criterion) {
    let base = editor_buffer(4_000);
    let mut author = Document::with_replica(ReplicaId(2));
    author.merge_update(&base.snapshot());
    let paste = author.insert_at(100, &"let value = compute();\n".repeat(10));

    c.bench_function("merge_paste_into_4k_doc", |b| {
        b.iter(|| {
            let mut replica = base.clone();
            black_box(replica.merge_update(black_box(&paste)));
        })
    });
}

fn bench_snapshot_encode(c: &mut Criterion) {
    let doc = editor_buffer(4_000);
    let snapshot = doc.snapshot();

    c.bench_function("snapshot_encode_4k", |b| {
        b.iter(|| black_box(encode_update(black_box(&snapshot)).unwrap()))
    });
}

fn bench_snapshot_decode(c: &mut Criterion) {
    let doc = editor_buffer(4_000);
    let bytes = encode_update(&doc.snapshot()).unwrap();

    c.bench_function("snapshot_decode_4k", |b| {
        b.iter(|| black_box(decode_update(black_box(&bytes)).unwrap()))
    });
}

fn bench_diff_since(c: &mut Criterion) {
    let doc = editor_buffer(4_000);
    let empty = StateVector::new();

    c.bench_function("diff_since_empty_vector_4k", |b| {
        b.iter(|| black_box(diff_since(black_box(&doc), black_box(&empty))))
    });
}

criterion_group!(
    benches,
    bench_local_keystroke,
    bench_merge_remote_run,
    bench_snapshot_encode,
    bench_snapshot_decode,
    bench_diff_since,
);
criterion_main!(benches);
