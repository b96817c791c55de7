//! Behavioural movies written as image series.

use ndarray::{s, Array3, Array4};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::dataset::{Compression, Dataset};
use crate::error::{NwbError, Result};
use crate::iterator::{guess_chunk_shape, write_dataset, DataChunkIterator};
use crate::metadata::{Metadata, MovieMetadata, BEHAVIOR};
use crate::nwbfile::{DataInterface, ImageSeries, NwbFile, TimeSeries, Timing};

/// Number of frames copied when `stub_test` is set.
const STUB_FRAMES: usize = 10;

/// A decoded video file.
pub trait MovieSource {
    fn file_path(&self) -> &Path;

    /// Frames per second
    fn fps(&self) -> f64;

    fn frame_count(&self) -> usize;

    /// (height, width, colour channels) of every frame
    fn frame_shape(&self) -> (usize, usize, usize);

    fn read_frame(&self, index: usize) -> Result<Array3<u8>>;
}

/// Movie frames held in memory, stored as (frames, height, width, colours).
#[derive(Debug, Clone)]
pub struct InMemoryMovie {
    path: PathBuf,
    fps: f64,
    frames: Array4<u8>,
}

impl InMemoryMovie {
    pub fn new<P: AsRef<Path>>(path: P, fps: f64, frames: Array4<u8>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            fps,
            frames,
        }
    }
}

impl MovieSource for InMemoryMovie {
    fn file_path(&self) -> &Path {
        &self.path
    }

    fn fps(&self) -> f64 {
        self.fps
    }

    fn frame_count(&self) -> usize {
        self.frames.shape()[0]
    }

    fn frame_shape(&self) -> (usize, usize, usize) {
        let (_, height, width, colors) = self.frames.dim();
        (height, width, colors)
    }

    fn read_frame(&self, index: usize) -> Result<Array3<u8>> {
        if index >= self.frame_count() {
            return Err(NwbError::InvalidArgument(format!(
                "frame {} out of range for a movie of {} frames",
                index,
                self.frame_count()
            )));
        }
        Ok(self.frames.slice(s![index, .., .., ..]).to_owned())
    }
}

/// Options of [`add_movies`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MovieOptions {
    /// Starting time of each movie, in source order
    pub starting_times: Option<Vec<f64>>,
    /// Reference the video files instead of copying their frames
    pub external_mode: bool,
    /// One frame per chunk instead of a size heuristic
    pub chunk_data: bool,
    /// Copy only the first few frames
    pub stub_test: bool,
    /// Processing module receiving the series instead of acquisition
    pub module_name: Option<String>,
    pub module_description: Option<String>,
}

impl Default for MovieOptions {
    fn default() -> Self {
        Self {
            starting_times: None,
            external_mode: true,
            chunk_data: true,
            stub_test: false,
            module_name: None,
            module_description: None,
        }
    }
}

fn movie_name(path: &Path) -> String {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    format!("Video: {}", stem)
}

/// Default `Behavior.Movies` entries, one per source.
pub fn get_movie_metadata(sources: &[&dyn MovieSource]) -> Metadata {
    let movies: Vec<serde_json::Value> = sources
        .iter()
        .map(|source| {
            serde_json::json!({
                "name": movie_name(source.file_path()),
                "description": "Video recorded by camera.",
                "unit": "Frames"
            })
        })
        .collect();
    let mut metadata = Metadata::new();
    metadata.set(BEHAVIOR, "Movies", serde_json::Value::Array(movies));
    metadata
}

/// Adds one image series per movie source.
///
/// `Behavior.Movies` entries override the defaults of the source at the same
/// position.
pub fn add_movies(
    sources: &[&dyn MovieSource],
    nwbfile: &mut NwbFile,
    metadata: &Metadata,
    options: &MovieOptions,
) -> Result<()> {
    let starting_times = match &options.starting_times {
        Some(times) if times.len() == sources.len() => times.clone(),
        Some(times) => {
            return Err(NwbError::InvalidArgument(format!(
                "{} starting times given for {} movies",
                times.len(),
                sources.len()
            )))
        }
        None if sources.len() == 1 => vec![0.0],
        None => {
            return Err(NwbError::InvalidArgument(
                "starting_times must be given when writing more than one movie".to_string(),
            ))
        }
    };
    let overrides = metadata
        .entries::<MovieMetadata>(BEHAVIOR, "Movies")?
        .unwrap_or_default();

    for (index, (&source, starting_time)) in sources.iter().zip(starting_times).enumerate() {
        let entry = overrides.get(index).cloned().unwrap_or_default();
        let name = entry
            .name
            .unwrap_or_else(|| movie_name(source.file_path()));
        let description = entry
            .description
            .unwrap_or_else(|| "Video recorded by camera.".to_string());
        let unit = entry.unit.unwrap_or_else(|| "Frames".to_string());

        let name_taken = match &options.module_name {
            None => nwbfile.get_acquisition(&name).is_some(),
            Some(module) => nwbfile
                .processing_module(module)
                .map_or(false, |m| m.contains(&name)),
        };
        if name_taken {
            return Err(NwbError::DuplicateName {
                kind: "ImageSeries",
                name,
            });
        }

        let timing = Timing::Rate {
            starting_time,
            rate: source.fps(),
        };
        let series = if options.external_mode {
            ImageSeries {
                name,
                description,
                unit,
                format: "external".to_string(),
                data: None,
                external_file: Some(vec![source.file_path().to_string_lossy().into_owned()]),
                starting_frame: Some(vec![0]),
                timing,
            }
        } else {
            let num_frames = if options.stub_test {
                source.frame_count().min(STUB_FRAMES)
            } else {
                source.frame_count()
            };
            info!(name = %name, frames = num_frames, "copying movie frames");
            let iterator = DataChunkIterator::movie_frames(source, num_frames);
            let chunks = if options.chunk_data {
                iterator.chunk_shape().to_vec()
            } else {
                guess_chunk_shape(iterator.maxshape(), 1)
            };
            let data: Dataset = write_dataset(iterator, Some(Compression::default()))?.with_chunks(chunks);
            ImageSeries {
                name,
                description,
                unit,
                format: "raw".to_string(),
                data: Some(data),
                external_file: None,
                starting_frame: None,
                timing,
            }
        };

        match &options.module_name {
            None => nwbfile.add_acquisition(TimeSeries::ImageSeries(series))?,
            Some(module) => nwbfile
                .check_module(module, options.module_description.as_deref())
                .add(DataInterface::ImageSeries(series))?,
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::NwbFileMetadata;

    fn movie(path: &str, frames: usize) -> InMemoryMovie {
        let data = Array4::from_shape_fn((frames, 4, 6, 3), |(f, y, x, c)| (f + y + x + c) as u8);
        InMemoryMovie::new(path, 25.0, data)
    }

    fn empty_file() -> NwbFile {
        NwbFile::new(&NwbFileMetadata::default()).unwrap()
    }

    #[test]
    fn metadata_names_movies_after_their_files() {
        let m = movie("/data/test1.avi", 2);
        let metadata = get_movie_metadata(&[&m]);
        let entries = metadata.entries::<MovieMetadata>(BEHAVIOR, "Movies").unwrap().unwrap();
        assert_eq!(entries[0].name.as_deref(), Some("Video: test1"));
        assert_eq!(entries[0].unit.as_deref(), Some("Frames"));
    }

    #[test]
    fn frames_are_copied_with_starting_time() {
        let m = movie("a.avi", 12);
        let mut file = empty_file();
        let options = MovieOptions {
            external_mode: false,
            starting_times: Some(vec![3.0]),
            ..Default::default()
        };
        add_movies(&[&m], &mut file, &Metadata::new(), &options).unwrap();

        let series = file
            .get_acquisition("Video: a")
            .and_then(TimeSeries::as_image_series)
            .unwrap();
        assert_eq!(series.starting_time(), Some(3.0));
        let data = series.data.as_ref().unwrap();
        assert_eq!(data.shape(), &[12, 4, 6, 3]);
        assert_eq!(data.chunks, Some(vec![1, 4, 6, 3]));
    }

    #[test]
    fn stub_and_heuristic_chunks() {
        let m = movie("a.avi", 12);
        let mut file = empty_file();
        let options = MovieOptions {
            external_mode: false,
            stub_test: true,
            chunk_data: false,
            ..Default::default()
        };
        add_movies(&[&m], &mut file, &Metadata::new(), &options).unwrap();
        let data = file
            .get_acquisition("Video: a")
            .and_then(TimeSeries::as_image_series)
            .and_then(|s| s.data.as_ref())
            .unwrap();
        assert_eq!(data.shape()[0], STUB_FRAMES);
        assert_eq!(data.chunks, Some(vec![STUB_FRAMES, 4, 6, 3]));
    }

    #[test]
    fn external_mode_references_the_file() {
        let m = movie("/videos/cam.avi", 3);
        let mut file = empty_file();
        add_movies(&[&m], &mut file, &Metadata::new(), &MovieOptions::default()).unwrap();
        let series = file
            .get_acquisition("Video: cam")
            .and_then(TimeSeries::as_image_series)
            .unwrap();
        assert_eq!(series.format, "external");
        assert!(series.data.is_none());
        assert_eq!(series.external_file.as_ref().unwrap()[0], "/videos/cam.avi");
        assert_eq!(series.starting_frame, Some(vec![0]));
    }

    #[test]
    fn several_movies_need_starting_times() {
        let (a, b) = (movie("a.avi", 1), movie("b.avi", 1));
        let mut file = empty_file();
        assert!(add_movies(&[&a, &b], &mut file, &Metadata::new(), &MovieOptions::default()).is_err());
        let options = MovieOptions {
            starting_times: Some(vec![1.0]),
            ..Default::default()
        };
        assert!(add_movies(&[&a, &b], &mut file, &Metadata::new(), &options).is_err());
    }

    #[test]
    fn custom_module_and_duplicates() {
        let m = movie("a.avi", 2);
        let mut file = empty_file();
        let options = MovieOptions {
            module_name: Some("TestModule".into()),
            module_description: Some("This is a test module.".into()),
            ..Default::default()
        };
        add_movies(&[&m], &mut file, &Metadata::new(), &options).unwrap();
        let module = file.processing_module("TestModule").unwrap();
        assert_eq!(module.description, "This is a test module.");
        assert!(module.contains("Video: a"));
        assert!(matches!(
            add_movies(&[&m], &mut file, &Metadata::new(), &options),
            Err(NwbError::DuplicateName { .. })
        ));
    }
}
