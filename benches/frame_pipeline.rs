//! Frame Pipeline Benchmarks
//!
//! Measures per-frame processing cost at common camera resolutions and the
//! cost of buffer pushes under eviction pressure.

use bytes::Bytes;
use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use image::{Rgb, RgbImage};
use std::sync::Arc;

use vigil_server::buffer::{FrameBuffer, FrameBufferConfig};
use vigil_server::events::{EventLog, EventSink};
use vigil_server::frame::Frame;
use vigil_server::performance::PipelineTuning;
use vigil_server::processor::{analyze, stamp, FrameProcessor, ProcessorConfig};

/// Gradient test image
fn generate_image(width: u32, height: u32) -> RgbImage {
    RgbImage::from_fn(width, height, |x, y| {
        Rgb([
            ((x * 255) / width.max(1)) as u8,
            ((y * 255) / height.max(1)) as u8,
            ((x ^ y) & 0xff) as u8,
        ])
    })
}

fn generate_jpeg(width: u32, height: u32) -> Bytes {
    let img = generate_image(width, height);
    let mut out = Vec::new();
    image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, 85)
        .encode(img.as_raw(), width, height, image::ExtendedColorType::Rgb8)
        .expect("encode test jpeg");
    Bytes::from(out)
}

const RESOLUTIONS: [(u32, u32, &str); 3] = [(320, 240, "QVGA"), (640, 480, "VGA"), (1280, 720, "720p")];

/// Full pipeline: decode, resize, score, stamp, re-encode
fn bench_process(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_process");
    group.sample_size(30);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("bench runtime");
    let events: Arc<dyn EventSink> = Arc::new(EventLog::new(16));
    let processor = FrameProcessor::new(
        ProcessorConfig::default(),
        Arc::new(PipelineTuning::new(70)),
        events,
    );

    for (width, height, name) in RESOLUTIONS {
        let payload = generate_jpeg(width, height);
        group.throughput(Throughput::Bytes(payload.len() as u64));

        group.bench_with_input(BenchmarkId::new("jpeg", name), &payload, |b, payload| {
            b.iter(|| runtime.block_on(processor.process(black_box(payload.clone()), Utc::now())))
        });
    }

    group.finish();
}

/// Quality scoring alone
fn bench_analyze(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_analyze");

    for (width, height, name) in RESOLUTIONS {
        let img = generate_image(width, height);
        group.throughput(Throughput::Elements((width * height) as u64));
        group.bench_with_input(BenchmarkId::new("rgb", name), &img, |b, img| {
            b.iter(|| black_box(analyze(black_box(img))))
        });
    }

    group.finish();
}

/// Timestamp burn-in
fn bench_stamp(c: &mut Criterion) {
    let img = generate_image(640, 480);
    c.bench_function("frame_stamp_vga", |b| {
        b.iter_batched(
            || img.clone(),
            |mut img| {
                stamp(&mut img, Utc::now());
                img
            },
            criterion::BatchSize::SmallInput,
        )
    });
}

/// Buffer push at capacity, so every batch evicts
fn bench_buffer_push(c: &mut Criterion) {
    let mut group = c.benchmark_group("buffer_push");

    for capacity in [30usize, 150, 600] {
        let buffer = FrameBuffer::new(FrameBufferConfig {
            capacity,
            drop_ratio: 0.1,
        });
        let payload = Bytes::from(vec![0u8; 32 * 1024]);
        let mut sequence = 0u64;

        group.bench_with_input(BenchmarkId::from_parameter(capacity), &capacity, |b, _| {
            b.iter(|| {
                sequence += 1;
                let frame = Arc::new(Frame::pass_through(payload.clone(), Utc::now(), sequence));
                black_box(buffer.push(frame))
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_process, bench_analyze, bench_stamp, bench_buffer_push);
criterion_main!(benches);
