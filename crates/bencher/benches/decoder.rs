use std::hint::black_box;

use bencher::{TestCase, TestFile};
use bytes::BytesMut;
use criterion::{BatchSize, BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use tokio_util::codec::Decoder;
use webserv_http::codec::{HeaderDecoder, PayloadDecoder, parse_payload};
use webserv_http::protocol::PayloadItem;

static SMALL_HEADER: TestFile = TestFile::new("get_small.txt", include_str!("../resources/request/get_small.txt"));
static LARGE_HEADER: TestFile = TestFile::new("get_large.txt", include_str!("../resources/request/get_large.txt"));
static CHUNKED_POST: TestFile = TestFile::new("post_chunked.txt", include_str!("../resources/request/post_chunked.txt"));

fn benchmark_header_decoder(criterion: &mut Criterion) {
    let cases = [TestCase::new("small_header", SMALL_HEADER), TestCase::new("large_header", LARGE_HEADER)];
    let mut group = criterion.benchmark_group("header_decoder");

    for case in cases {
        group.throughput(Throughput::Bytes(case.len()));
        group.bench_with_input(BenchmarkId::from_parameter(case.name()), &case, |b, case| {
            b.iter_batched_ref(
                || BytesMut::from(case.file().content()),
                |bytes_mut| {
                    let header = HeaderDecoder.decode(bytes_mut).expect("input should be a valid request head").unwrap();
                    black_box(header);
                },
                BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

fn benchmark_chunked_body(criterion: &mut Criterion) {
    let case = TestCase::new("chunked_16k", CHUNKED_POST);
    let mut group = criterion.benchmark_group("payload_decoder");
    group.throughput(Throughput::Bytes(case.len()));

    group.bench_with_input(BenchmarkId::from_parameter(case.name()), &case, |b, case| {
        b.iter_batched_ref(
            || BytesMut::from(case.file().content()),
            |bytes_mut| {
                let header = HeaderDecoder.decode(bytes_mut).expect("input should be a valid request head").unwrap();
                let payload_size = parse_payload(&header, None).expect("input should have valid framing");
                let mut decoder = PayloadDecoder::from_payload_size(payload_size, None);

                let mut total = 0;
                loop {
                    match decoder.decode(bytes_mut).expect("input should be a valid chunked body") {
                        Some(PayloadItem::Chunk(bytes)) => total += bytes.len(),
                        Some(PayloadItem::Eof) | None => break,
                    }
                }
                black_box(total);
            },
            BatchSize::SmallInput,
        );
    });

    group.finish();
}

criterion_group!(decoder, benchmark_header_decoder, benchmark_chunked_body);
criterion_main!(decoder);
