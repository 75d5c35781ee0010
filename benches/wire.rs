use bson::doc;
use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use zaguan::wire::reply::Reply;
use zaguan::wire::request::{QueryFlags, QueryMessage};
use zaguan::wire::{encode_frame, OpCode};

fn reply_frame(documents: &[bson::Document]) -> Vec<u8> {
    let mut body = Vec::new();
    for document in documents {
        body.extend_from_slice(&bson::to_vec(document).unwrap());
    }

    let total = 36 + body.len();
    let mut frame = Vec::with_capacity(total);
    frame.extend_from_slice(&(total as i32).to_le_bytes());
    frame.extend_from_slice(&1i32.to_le_bytes());
    frame.extend_from_slice(&1i32.to_le_bytes());
    frame.extend_from_slice(&(OpCode::Reply as i32).to_le_bytes());
    frame.extend_from_slice(&0i32.to_le_bytes());
    frame.extend_from_slice(&99i64.to_le_bytes());
    frame.extend_from_slice(&0i32.to_le_bytes());
    frame.extend_from_slice(&(documents.len() as i32).to_le_bytes());
    frame.extend_from_slice(&body);
    frame
}

fn bench_encode_query(c: &mut Criterion) {
    let spec = doc! {
        "status": "active",
        "age": { "$gte": 21i32 },
        "tags": { "$in": ["alpha", "beta", "gamma"] },
    };

    c.bench_function("encode_query_frame", |b| {
        b.iter(|| {
            let message = QueryMessage {
                flags: QueryFlags::NONE,
                full_collection_name: "app.users",
                number_to_skip: 0,
                number_to_return: 100,
                query: black_box(&spec),
                field_selector: None,
            };
            encode_frame(&message).unwrap()
        })
    });
}

fn bench_decode_reply(c: &mut Criterion) {
    let documents: Vec<bson::Document> = (0..64)
        .map(|n| {
            doc! {
                "n": n as i32,
                "name": format!("item-{}", n),
                "active": n % 2 == 0,
            }
        })
        .collect();
    let frame = reply_frame(&documents);

    c.bench_function("decode_reply_64_documents", |b| {
        b.iter(|| Reply::decode(Bytes::from(black_box(frame.clone()))).unwrap())
    });
}

criterion_group!(benches, bench_encode_query, bench_decode_reply);
criterion_main!(benches);
