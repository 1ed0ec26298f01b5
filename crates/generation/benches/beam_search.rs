use candle_core::{Device, Tensor};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use generation::{beam_search, BeamSearchConfig, DecodeRequest};
use rand::{rngs::StdRng, Rng, SeedableRng};

const VOCAB: usize = 512;

fn transition_table() -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(42);
    (0..VOCAB * VOCAB).map(|_| rng.gen_range(-4.0f32..4.0)).collect()
}

fn bench_beam_sizes(c: &mut Criterion) {
    let device = Device::Cpu;
    let table = Tensor::from_vec(transition_table(), (VOCAB, VOCAB), &device).expect("table");
    let mut group = c.benchmark_group("beam_search");
    for &beam_size in &[1usize, 4, 8] {
        let config = BeamSearchConfig::new(beam_size, 0.6, 32, 2);
        let request = DecodeRequest::new(1, 8, VOCAB, &device);
        group.bench_with_input(BenchmarkId::from_parameter(beam_size), &config, |b, config| {
            b.iter(|| {
                let output = beam_search(
                    |tokens, _, _: &mut ()| table.index_select(&tokens.flatten_all()?, 0),
                    &mut (),
                    &request,
                    config,
                )
                .expect("decode");
                black_box(output)
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_beam_sizes);
criterion_main!(benches);
