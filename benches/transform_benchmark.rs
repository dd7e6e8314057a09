use criterion::{black_box, criterion_group, criterion_main, Criterion};

use chrono::Utc;
use collabdocs_engine::op::{OpKind, Operation};
use collabdocs_engine::protocol::ServerEvent;
use collabdocs_engine::revlog::Revision;
use collabdocs_engine::transform;
use uuid::Uuid;

fn insert_op(author: Uuid, position: u64, content: &str) -> Operation {
    Operation {
        document_id: Uuid::nil(),
        author_session_id: author,
        base_revision: 0,
        kind: OpKind::Insert { position, content: content.into() },
        client_op_id: Uuid::new_v4(),
    }
}

fn delete_op(author: Uuid, position: u64, length: u64) -> Operation {
    Operation {
        document_id: Uuid::nil(),
        author_session_id: author,
        base_revision: 0,
        kind: OpKind::Delete { position, length },
        client_op_id: Uuid::new_v4(),
    }
}

fn bench_transform_insert_insert(c: &mut Criterion) {
    let a = insert_op(Uuid::new_v4(), 120, "hello");
    let b = insert_op(Uuid::new_v4(), 40, "world");

    c.bench_function("transform_insert_insert", |bench| {
        bench.iter(|| black_box(transform::transform(black_box(&a), black_box(&b))))
    });
}

fn bench_transform_delete_split(c: &mut Criterion) {
    // Worst single-pair case: the delete splits into a composite.
    let a = delete_op(Uuid::new_v4(), 10, 50);
    let b = insert_op(Uuid::new_v4(), 30, "interleaved");

    c.bench_function("transform_delete_split", |bench| {
        bench.iter(|| black_box(transform::transform(black_box(&a), black_box(&b))))
    });
}

fn bench_compose_over_100_revisions(c: &mut Criterion) {
    // Catch-up cost for a client 100 revisions behind.
    let doc = Uuid::nil();
    let intervening: Vec<Revision> = (1..=100u64)
        .map(|n| Revision {
            document_id: doc,
            revision_number: n,
            operation: insert_op(Uuid::new_v4(), n * 3, "edit"),
            applied_at: Utc::now(),
        })
        .collect();
    let op = insert_op(Uuid::new_v4(), 5, "late arrival");

    c.bench_function("compose_100_revisions", |bench| {
        bench.iter(|| black_box(transform::compose(black_box(&op), black_box(&intervening))))
    });
}

fn bench_apply_middle_of_large_doc(c: &mut Criterion) {
    let content = "lorem ipsum dolor sit amet ".repeat(2000); // ~54KB
    let kind = OpKind::Insert { position: 27_000, content: "cursor here".into() };

    c.bench_function("apply_insert_54KB_doc", |bench| {
        bench.iter(|| black_box(transform::apply(black_box(&content), black_box(&kind))))
    });
}

fn bench_operation_applied_encode(c: &mut Criterion) {
    let revision = Revision {
        document_id: Uuid::new_v4(),
        revision_number: 42,
        operation: insert_op(Uuid::new_v4(), 7, "typical keystroke batch"),
        applied_at: Utc::now(),
    };

    c.bench_function("operation_applied_encode", |bench| {
        bench.iter(|| {
            let event = ServerEvent::operation_applied(black_box(&revision));
            black_box(event.encode().unwrap());
        })
    });
}

criterion_group!(
    benches,
    bench_transform_insert_insert,
    bench_transform_delete_split,
    bench_compose_over_100_revisions,
    bench_apply_middle_of_large_doc,
    bench_operation_applied_encode,
);
criterion_main!(benches);
