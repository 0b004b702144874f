use bytes::BytesMut;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use driftrpc_common::codec::PostcardSerializer;
use driftrpc_common::frame::{
    RequestHeader, ResponseHeader, REQUEST_HEADER_WITH_TIMEOUT_SIZE, RESPONSE_HEADER_SIZE,
};
use driftrpc_common::marshal::{marshal_args, unmarshal_args};

fn bench_request_encode(c: &mut Criterion) {
    let ser = PostcardSerializer;

    c.bench_function("encode_request_frame", |b| {
        b.iter(|| {
            let mut buf =
                marshal_args(&ser, REQUEST_HEADER_WITH_TIMEOUT_SIZE, &(black_box(41i64),))
                    .unwrap();
            let payload_len = (buf.len() - REQUEST_HEADER_WITH_TIMEOUT_SIZE) as u32;
            let header = RequestHeader {
                expiration_ms: 0,
                msg_type: 1,
                msg_id: 7,
                payload_len,
            };
            header.encode_into(&mut buf[..REQUEST_HEADER_WITH_TIMEOUT_SIZE]);
            black_box(buf);
        })
    });
}

fn bench_request_decode(c: &mut Criterion) {
    let ser = PostcardSerializer;
    let buf = marshal_args(&ser, 0, &(41i64, "payload".to_string())).unwrap();

    c.bench_function("decode_request_args", |b| {
        b.iter(|| {
            let decoded: (i64, String) = unmarshal_args(&ser, black_box(&buf)).unwrap();
            black_box(decoded);
        })
    });
}

fn bench_response_header(c: &mut Criterion) {
    c.bench_function("response_header_roundtrip", |b| {
        b.iter(|| {
            let mut buf = BytesMut::zeroed(RESPONSE_HEADER_SIZE);
            let header = ResponseHeader { msg_id: black_box(99), payload_len: 512 };
            header.encode_into(&mut buf[..]);
            black_box(ResponseHeader::decode(&buf));
        })
    });
}

criterion_group!(
    benches,
    bench_request_encode,
    bench_request_decode,
    bench_response_header
);
criterion_main!(benches);
