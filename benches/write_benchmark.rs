use criterion::{black_box, criterion_group, criterion_main, Criterion};
use ndarray::Array2;
use nwb_exporter::ecephys::add_electrical_series;
use nwb_exporter::metadata::{Metadata, NwbFileMetadata};
use nwb_exporter::{BinaryRecording, DType, InMemoryRecording, NwbFile, WriteOptions};

fn synthetic_traces(frames: usize, channels: usize) -> Array2<i16> {
    Array2::from_shape_fn((frames, channels), |(f, c)| ((f * 7 + c * 13) % 2000) as i16 - 1000)
}

pub fn bench_per_channel_write(c: &mut Criterion) {
    // In-memory sources are copied one channel at a time
    let recording = InMemoryRecording::new(synthetic_traces(30_000, 32), 30_000.0);

    c.bench_function("write_series_per_channel", |b| {
        b.iter(|| {
            let mut nwbfile = NwbFile::new(&NwbFileMetadata::default()).unwrap();
            let result = add_electrical_series(&recording, &mut nwbfile, &Metadata::new(), &WriteOptions::default());
            black_box(result.is_ok())
        });
    });
}

pub fn bench_buffered_write(c: &mut Criterion) {
    // Binary sources take the buffered path
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("traces.bin");
    BinaryRecording::write_traces(&path, &synthetic_traces(30_000, 32).into()).unwrap();
    let recording = BinaryRecording::open(&path, 32, 30_000.0, DType::Int16).unwrap();

    c.bench_function("write_series_buffered", |b| {
        b.iter(|| {
            let mut nwbfile = NwbFile::new(&NwbFileMetadata::default()).unwrap();
            let result = add_electrical_series(&recording, &mut nwbfile, &Metadata::new(), &WriteOptions::default());
            black_box(result.is_ok())
        });
    });
}

criterion_group!(benches, bench_per_channel_write, bench_buffered_write);
criterion_main!(benches);
