//! Marshaling hot-path benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use lib_llm_ffi::marshal::{read_growable, TextArg, TokenArg, Utf8Assembler};
use lib_types::TokenId;

fn bench_token_buffers(c: &mut Criterion) {
    let mut group = c.benchmark_group("token_buffers");

    for len in [32usize, 512, 4096].iter() {
        let tokens: Vec<TokenId> = (0..*len as u32).map(|i| TokenId(i % 32_000)).collect();

        group.bench_with_input(BenchmarkId::new("to_c", len), &tokens, |b, t| {
            b.iter(|| TokenArg::new(black_box(t)).unwrap());
        });

        let arg = TokenArg::new(&tokens).unwrap();
        group.bench_with_input(BenchmarkId::new("to_host", len), &arg, |b, a| {
            b.iter(|| a.to_host("bench").unwrap());
        });
    }

    group.finish();
}

fn bench_growable_read(c: &mut Criterion) {
    let source: Vec<i32> = (0..1024).collect();
    c.bench_function("read_growable_retry", |b| {
        b.iter(|| {
            read_growable::<i32, _>(16, "bench", |buf, cap| {
                if (cap as usize) < source.len() {
                    return -(source.len() as i32);
                }
                // SAFETY: buf holds cap >= source.len() elements
                unsafe { std::ptr::copy_nonoverlapping(source.as_ptr(), buf, source.len()) };
                source.len() as i32
            })
            .unwrap()
        });
    });
}

fn bench_utf8_assembly(c: &mut Criterion) {
    let text = "Grüße, 世界! 🦀 ".repeat(64);
    let bytes = text.as_bytes();

    c.bench_function("utf8_assembler_bytewise", |b| {
        b.iter(|| {
            let mut asm = Utf8Assembler::new();
            let mut out = String::with_capacity(bytes.len());
            for byte in bytes.chunks(1) {
                out.push_str(&asm.push(black_box(byte)));
            }
            out
        });
    });

    c.bench_function("text_arg", |b| {
        b.iter(|| TextArg::new(black_box(&text)).unwrap().len());
    });
}

criterion_group!(benches, bench_token_buffers, bench_growable_read, bench_utf8_assembly);
criterion_main!(benches);
