//! Codec throughput benchmarks: a representative RPC-message-shaped value
//! through both codecs, both directions.

use std::collections::BTreeMap;

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use shv_core::{chainpack, cpon};
use shv_core::{DateTime, Decimal, RpcValue};

fn sample_message() -> RpcValue {
    let mut track: Vec<RpcValue> = Vec::new();
    for i in 0..16 {
        let mut point = BTreeMap::new();
        point.insert("value".to_string(), RpcValue::from(Decimal::new(i * 25, -1)));
        point.insert(
            "timestamp".to_string(),
            RpcValue::from(DateTime::from_epoch_msec(1_600_000_000_000 + i * 1000)),
        );
        point.insert("valid".to_string(), RpcValue::from(i % 3 != 0));
        track.push(RpcValue::from(point));
    }
    let mut body = BTreeMap::new();
    body.insert(1i64, RpcValue::from(track));
    let mut msg = RpcValue::from(body);
    msg.meta_mut().insert(1i64, 1i64);
    msg.meta_mut().insert(8i64, 42i64);
    msg.meta_mut().insert(9i64, "test/device/track");
    msg.meta_mut().insert(10i64, "get");
    msg
}

fn bench_chainpack(c: &mut Criterion) {
    let value = sample_message();
    let bytes = chainpack::pack(&value);

    c.bench_function("chainpack_pack", |b| b.iter(|| chainpack::pack(black_box(&value))));
    c.bench_function("chainpack_unpack", |b| {
        b.iter(|| chainpack::unpack(black_box(&bytes)).expect("well-formed input"))
    });
}

fn bench_cpon(c: &mut Criterion) {
    let value = sample_message();
    let text = cpon::pack(&value);

    c.bench_function("cpon_pack", |b| b.iter(|| cpon::pack(black_box(&value))));
    c.bench_function("cpon_unpack", |b| {
        b.iter(|| cpon::unpack(black_box(&text)).expect("well-formed input"))
    });
}

criterion_group!(benches, bench_chainpack, bench_cpon);
criterion_main!(benches);
