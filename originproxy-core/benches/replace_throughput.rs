use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use originproxy_core::replace::ReplacingReader;
use std::hint::black_box;
use tokio::io::AsyncReadExt;
use tokio::runtime::Runtime;

const FILL_SIZE: usize = 32 * 1024;

fn make_input(size: usize) -> Vec<u8> {
    let mut input = Vec::with_capacity(size);
    while input.len() < size {
        input.extend_from_slice(b"the quick brown fox jumps over the lazy dog 456 ");
    }
    input.truncate(size);
    input
}

fn bench_replace_throughput(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("replace_throughput");

    for size in [64 * 1024, 512 * 1024, 4 * 1024 * 1024] {
        let input = make_input(size);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("equal_length", size), &input, |b, input| {
            b.iter(|| {
                rt.block_on(async {
                    let mut reader =
                        ReplacingReader::new(black_box(input.as_slice()), b"456".to_vec(), b"ABC".to_vec(), FILL_SIZE)
                            .unwrap();
                    let mut out = Vec::with_capacity(input.len());
                    reader.read_to_end(&mut out).await.unwrap();
                    black_box(out);
                });
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_replace_throughput);
criterion_main!(benches);
