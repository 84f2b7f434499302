//! Benchmarks for request latency.
//!
//! Run with: cargo bench --bench pipeline_bench

use std::io::Cursor;
use std::sync::Arc;

use burn::prelude::*;
use burn_autodiff::Autodiff;
use burn_ndarray::NdArray;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use image::{DynamicImage, ImageOutputFormat, Rgb, RgbImage};
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;

use cxr::all::*;

type BenchBackend = Autodiff<NdArray>;

fn small_config() -> EfficientNetConfig {
    EfficientNetConfig::b0(2)
        .with_stem_channels(16)
        .with_stages(vec![
            MbConvStageConfig::new(1, 3, 1, 16, 16, 1),
            MbConvStageConfig::new(4, 3, 2, 16, 24, 2),
            MbConvStageConfig::new(4, 5, 2, 24, 40, 2),
        ])
        .with_head_channels(64)
}

/// Synthetic radiograph-like image: smooth gradient plus seeded noise.
fn synthetic_image(size: u32) -> Vec<u8> {
    let mut rng = ChaCha8Rng::seed_from_u64(42);
    let image = RgbImage::from_fn(size, size, |x, y| {
        let base = ((x + y) * 255 / (2 * size)) as u8;
        let v = base.saturating_add(rng.gen_range(0..32));
        Rgb([v, v, v])
    });

    let mut cursor = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(image)
        .write_to(&mut cursor, ImageOutputFormat::Png)
        .unwrap();
    cursor.into_inner()
}

fn bench_preprocess(c: &mut Criterion) {
    let mut group = c.benchmark_group("preprocess");

    for source in [256u32, 1024] {
        let bytes = synthetic_image(source);
        let preprocessor = Preprocessor::new(PreprocessConfig::new(224));

        group.bench_with_input(BenchmarkId::new("prepare", source), &bytes, |b, bytes| {
            b.iter(|| black_box(preprocessor.prepare(bytes).unwrap()))
        });
    }

    group.finish();
}

fn bench_pipeline(c: &mut Criterion) {
    let mut group = c.benchmark_group("pipeline");
    group.sample_size(10);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bench.mpk");
    let model: EfficientNet<BenchBackend> = small_config().init(&Default::default());
    save_model::<BenchBackend, _>(&model, &path).unwrap();

    for size in [64usize, 128] {
        let options = LoadOptions::default()
            .with_image_size(size)
            .with_architecture(small_config());
        let registry = Arc::new(ModelRegistry::<BenchBackend>::new(&path, options));
        registry.reload().unwrap();

        let bytes = synthetic_image(size as u32);
        let pipeline = Pipeline::new(registry.clone());

        group.bench_with_input(BenchmarkId::new("run", size), &bytes, |b, bytes| {
            b.iter(|| black_box(pipeline.run(bytes).unwrap()))
        });

        let state = registry.current().unwrap();
        let input = Preprocessor::new(PreprocessConfig::new(size))
            .prepare(&bytes)
            .unwrap();
        let handle = state.handle().no_grad();
        group.bench_with_input(BenchmarkId::new("classify", size), &input, |b, input| {
            b.iter(|| {
                black_box(
                    classify::<BenchBackend, _>(&handle, state.labels(), input, state.device())
                        .unwrap(),
                )
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_preprocess, bench_pipeline);
criterion_main!(benches);
