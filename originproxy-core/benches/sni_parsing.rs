use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use originproxy_core::sni::extract_sni;
use std::hint::black_box;

/// Builds a minimal but valid TLS ClientHello record carrying an SNI
/// extension for `domain`.
fn build_client_hello_with_sni(domain: &str) -> Vec<u8> {
    let domain_bytes = domain.as_bytes();
    let domain_len = domain_bytes.len() as u16;

    let sni_list_len = 3 + domain_len;
    let sni_ext_len = 2 + sni_list_len;
    let extensions_len = 4 + sni_ext_len;
    let handshake_len = 2 + 32 + 1 + 2 + 2 + 2 + 2 + extensions_len;
    let record_len = 4 + handshake_len;

    let mut record = vec![
        0x16,
        0x03,
        0x03,
        (record_len >> 8) as u8,
        (record_len & 0xff) as u8,
        0x01,
        ((handshake_len as u32) >> 16) as u8,
        (handshake_len >> 8) as u8,
        (handshake_len & 0xff) as u8,
        0x03,
        0x03,
    ];
    record.extend_from_slice(&[0; 32]);
    record.extend_from_slice(&[
        0x00,
        0x00,
        0x02,
        0x00,
        0x00,
        0x01,
        0x00,
        (extensions_len >> 8) as u8,
        (extensions_len & 0xff) as u8,
        0x00,
        0x00,
        (sni_ext_len >> 8) as u8,
        (sni_ext_len & 0xff) as u8,
        (sni_list_len >> 8) as u8,
        (sni_list_len & 0xff) as u8,
        0x00,
        (domain_len >> 8) as u8,
        (domain_len & 0xff) as u8,
    ]);
    record.extend_from_slice(domain_bytes);
    record
}

fn bench_sni_extraction(c: &mut Criterion) {
    let mut group = c.benchmark_group("sni_extraction");

    for domain in &[
        "example.com",
        "subdomain.example.com",
        "very.long.subdomain.example.com",
    ] {
        let record = build_client_hello_with_sni(domain);
        group.bench_with_input(BenchmarkId::from_parameter(domain), &record, |b, record| {
            b.iter(|| extract_sni(black_box(record)).unwrap());
        });
    }

    group.finish();
}

fn bench_sni_with_large_record(c: &mut Criterion) {
    let domain = "production.api.service.company.example.com";
    let record = build_client_hello_with_sni(domain);

    c.bench_function("sni_large_record", |b| {
        b.iter(|| extract_sni(black_box(&record)));
    });
}

fn bench_error_cases(c: &mut Criterion) {
    let mut group = c.benchmark_group("error_handling");

    let truncated = vec![0x16, 0x03, 0x01];
    group.bench_function("truncated_record", |b| {
        b.iter(|| {
            let _ = extract_sni(black_box(&truncated));
        });
    });

    let invalid = vec![0x16, 0x02, 0x01, 0x00, 0x05, 0x01, 0x00, 0x00, 0x00];
    group.bench_function("invalid_version", |b| {
        b.iter(|| {
            let _ = extract_sni(black_box(&invalid));
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_sni_extraction,
    bench_sni_with_large_record,
    bench_error_cases
);
criterion_main!(benches);
