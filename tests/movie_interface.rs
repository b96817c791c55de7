use ndarray::Array4;
use nwb_exporter::nwbfile::{DataInterface, TimeSeries};
use nwb_exporter::{read, InMemoryMovie, MovieInterface, MovieSource, NwbConverter};
use serde_json::json;
use std::path::Path;

const FRAMES: usize = 50;

fn movie_converter() -> NwbConverter {
    let make = |path: &str, seed: usize| {
        let frames = Array4::from_shape_fn((FRAMES, 24, 32, 3), |(f, y, x, c)| ((f * seed + y * x + c) % 255) as u8);
        Box::new(InMemoryMovie::new(path, 25.0, frames)) as Box<dyn MovieSource>
    };
    let mut converter = NwbConverter::new();
    converter
        .add_interface(
            "Movie",
            Box::new(MovieInterface::new(vec![make("/tmp/movies/test1.avi", 1), make("/tmp/movies/test2.avi", 3)])),
        )
        .unwrap();
    converter
}

fn movie_names(converter: &NwbConverter) -> Vec<String> {
    converter
        .get_metadata()
        .get("Behavior", "Movies")
        .and_then(|v| v.as_array())
        .unwrap()
        .iter()
        .map(|m| m["name"].as_str().unwrap().to_string())
        .collect()
}

#[test]
fn movie_starting_times() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("movies.nwb");
    let converter = movie_converter();
    let starting_times = [12.0, 145.0];
    let options = json!({"Movie": {"starting_times": starting_times, "external_mode": false}});
    converter.run_conversion(&path, true, None, &options).unwrap();

    let nwbfile = read(&path).unwrap();
    for (name, expected) in movie_names(&converter).iter().zip(starting_times) {
        let series = nwbfile
            .get_acquisition(name)
            .and_then(TimeSeries::as_image_series)
            .unwrap();
        assert_eq!(series.starting_time(), Some(expected));
        assert_eq!(series.data.as_ref().unwrap().shape(), &[FRAMES, 24, 32, 3]);
    }
}

#[test]
fn movie_custom_module() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("movies.nwb");
    let options = json!({"Movie": {
        "starting_times": [0.0, 1.0],
        "external_mode": false,
        "module_name": "TestModule",
        "module_description": "This is a test module."
    }});
    movie_converter().run_conversion(&path, true, None, &options).unwrap();

    let nwbfile = read(&path).unwrap();
    let module = nwbfile.processing_module("TestModule").unwrap();
    assert_eq!(module.description, "This is a test module.");
    assert!(matches!(module.get("Video: test1"), Some(DataInterface::ImageSeries(_))));
    assert!(nwbfile.acquisition.is_empty());
}

#[test]
fn movie_chunking() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("movies.nwb");
    let converter = movie_converter();
    for chunk_data in [true, false] {
        let options = json!({"Movie": {
            "starting_times": [0.0, 0.0],
            "external_mode": false,
            "stub_test": true,
            "chunk_data": chunk_data
        }});
        converter.run_conversion(&path, true, None, &options).unwrap();

        let nwbfile = read(&path).unwrap();
        for name in movie_names(&converter) {
            let data = nwbfile
                .get_acquisition(&name)
                .and_then(TimeSeries::as_image_series)
                .and_then(|s| s.data.as_ref())
                .unwrap();
            assert_eq!(data.shape()[0], 10);
            let chunks = data.chunks.as_ref().unwrap();
            if chunk_data {
                assert_eq!(chunks, &vec![1, 24, 32, 3]);
            } else {
                assert_eq!(chunks, &vec![10, 24, 32, 3]);
            }
        }
    }
}

#[test]
fn movie_external_mode() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("movies.nwb");
    let options = json!({"Movie": {"starting_times": [0.0, 5.0], "external_mode": true}});
    let converter = movie_converter();
    converter.run_conversion(&path, true, None, &options).unwrap();

    let nwbfile = read(&path).unwrap();
    let expected = [Path::new("/tmp/movies/test1.avi"), Path::new("/tmp/movies/test2.avi")];
    for (name, file) in movie_names(&converter).iter().zip(expected) {
        let series = nwbfile
            .get_acquisition(name)
            .and_then(TimeSeries::as_image_series)
            .unwrap();
        assert_eq!(series.format, "external");
        assert_eq!(Path::new(&series.external_file.as_ref().unwrap()[0]), file);
        assert!(series.data.is_none());
    }
}

#[test]
fn metadata_overrides_movie_names() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("movies.nwb");
    let converter = movie_converter();
    let metadata = nwb_exporter::Metadata::from_value(json!({
        "Behavior": {"Movies": [{"name": "Video: test1", "description": "left camera"}]}
    }))
    .unwrap();
    let options = json!({"Movie": {"starting_times": [0.0, 0.0]}});
    converter.run_conversion(&path, true, Some(&metadata), &options).unwrap();

    let nwbfile = read(&path).unwrap();
    let series = nwbfile
        .get_acquisition("Video: test1")
        .and_then(TimeSeries::as_image_series)
        .unwrap();
    assert_eq!(series.description, "left camera");
}
