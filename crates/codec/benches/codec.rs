use criterion::{Criterion, Throughput, criterion_group, criterion_main};

use atp_codec::{
    frame::{self, Control, Header},
    message::{Message, MessageEncoder, TransactionId, attributes::XorMappedAddress, methods::Method},
};
use bytes::BytesMut;

fn criterion_benchmark(c: &mut Criterion) {
    let mut segment = BytesMut::new();
    frame::encode(
        &Header {
            seq_num: 1,
            ack_num: 2,
            control: Control::DATA | Control::ACK,
            window: 4096,
        },
        &[0u8; frame::MAX_PAYLOAD],
        &mut segment,
    )
    .unwrap();

    let mut binding = BytesMut::new();
    let mut encoder = MessageEncoder::new(
        Method::BindingResponse,
        &TransactionId::from(*b"atp-trans-id"),
        &mut binding,
    );
    encoder.append::<XorMappedAddress>("203.0.113.5:40000".parse().unwrap());
    encoder.flush();

    let mut group = c.benchmark_group("codec");
    group.throughput(Throughput::Elements(1));

    group.bench_function("decode_segment", |bencher| {
        bencher.iter(|| {
            frame::decode(&segment).unwrap();
        })
    });

    group.bench_function("decode_binding_response", |bencher| {
        bencher.iter(|| {
            Message::decode(&binding).unwrap();
        })
    });

    group.finish();
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
