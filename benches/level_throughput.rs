use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use levelflow::components::{Energy, Framer, NullSink, WaveSource};
use levelflow::level::{Block, Index, Level, LevelConfig};
use levelflow::pipeline::{Pipeline, PipelineConfig};
use std::hint::black_box;
use std::time::Duration;

const FRAMES: usize = 160_000;

/// Pushes `FRAMES` single-element frames through a ring level in blocks of
/// `block`, reading each block straight back.
fn write_read_ring(block: usize) {
    let level = Level::new("bench", LevelConfig::default());
    level.add_field("x", 1).expect("Failed to add field");
    let reader = level.register_reader().expect("Failed to register reader");
    level
        .set_reader_block(reader, block)
        .expect("Failed to set reader block");
    level.finalize(block * 4).expect("Failed to finalize level");
    let data = Block::from_samples(&vec![0.25; block]);
    for _ in 0..FRAMES / block {
        level
            .set_block(Index::CurrentWrite, &data)
            .expect("Write failed");
        let read = level
            .get_block(Index::CurrentRead, block, Some(reader))
            .expect("Read failed");
        black_box(read);
    }
}

fn energy_pipeline(samples: &[f32]) {
    let mut pipeline = Pipeline::new(PipelineConfig::default());
    pipeline
        .add(WaveSource::from_samples("wave", samples.to_vec(), 16_000))
        .expect("Failed to add source");
    pipeline
        .add(
            Framer::new("framer", "pcm", "frames")
                .with_frame_size(Duration::from_millis(25))
                .with_frame_step(Duration::from_millis(10)),
        )
        .expect("Failed to add framer");
    pipeline
        .add(Energy::new("energy", "frames", "energy"))
        .expect("Failed to add energy");
    pipeline
        .add(NullSink::new("null", "energy"))
        .expect("Failed to add sink");
    black_box(pipeline.run().expect("Pipeline failed"));
}

fn criterion_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("level_ring");
    group.throughput(Throughput::Elements(FRAMES as u64));
    for block in [1usize, 16, 256, 1024] {
        group.bench_with_input(BenchmarkId::from_parameter(block), &block, |b, &block| {
            b.iter(|| write_read_ring(block));
        });
    }
    group.finish();

    // Ten seconds of 16 kHz audio.
    let samples: Vec<f32> = (0..160_000)
        .map(|i| (i as f32 * 0.05).sin() * 0.3)
        .collect();
    let mut group = c.benchmark_group("pipeline");
    group.sample_size(20);
    group.throughput(Throughput::Elements(samples.len() as u64));
    group.bench_function("energy_10s", |b| b.iter(|| energy_pipeline(&samples)));
    group.finish();
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
