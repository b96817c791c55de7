//! Multi-source conversion.
//!
//! An [`NwbConverter`] combines several data interfaces, each wrapping one
//! source, and writes them into a single container in one pass.

use serde::de::DeserializeOwned;
use serde_json::Value;
use std::path::Path;
use tracing::info;

use crate::behavior::{add_movies, get_movie_metadata, MovieOptions, MovieSource};
use crate::ecephys::{add_all_to_nwbfile, WriteOptions};
use crate::error::{NwbError, Result};
use crate::metadata::{default_nwbfile_metadata, get_nwb_metadata, Metadata, NWBFILE};
use crate::nwbfile::NwbFile;
use crate::ophys::{add_segmentation, get_default_ophys_metadata, SegmentationExtractor, SegmentationOptions};
use crate::recording::Recording;
use crate::writer::{with_nwbfile, Destination};

/// One source that can describe itself and add itself to a file.
pub trait ConversionInterface {
    /// Metadata this source can fill in by itself.
    fn get_metadata(&self) -> Metadata;

    /// Adds the source to `nwbfile`. `options` is the interface's entry of the
    /// conversion options, `null` when none was given.
    fn add_to_nwbfile(&self, nwbfile: &mut NwbFile, metadata: &Metadata, options: &Value) -> Result<()>;
}

/// Deserializes interface options, defaulting on `null`.
fn parse_options<T: DeserializeOwned + Default>(options: &Value) -> Result<T> {
    if options.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(options.clone())
        .map_err(|e| NwbError::InvalidArgument(format!("invalid conversion options: {}", e)))
}

/// Converts an electrophysiology recording.
pub struct RecordingInterface<R: Recording> {
    recording: R,
}

impl<R: Recording> RecordingInterface<R> {
    pub fn new(recording: R) -> Self {
        Self { recording }
    }

    pub fn recording(&self) -> &R {
        &self.recording
    }
}

impl<R: Recording> ConversionInterface for RecordingInterface<R> {
    fn get_metadata(&self) -> Metadata {
        let defaults = get_nwb_metadata(&self.recording);
        match self.recording.nwb_metadata() {
            Some(attached) => defaults.merged(&attached),
            None => defaults,
        }
    }

    fn add_to_nwbfile(&self, nwbfile: &mut NwbFile, metadata: &Metadata, options: &Value) -> Result<()> {
        let options: WriteOptions = parse_options(options)?;
        add_all_to_nwbfile(&self.recording, nwbfile, metadata, &options)
    }
}

/// Converts a cell segmentation.
pub struct SegmentationInterface<S: SegmentationExtractor> {
    segmentation: S,
}

impl<S: SegmentationExtractor> SegmentationInterface<S> {
    pub fn new(segmentation: S) -> Self {
        Self { segmentation }
    }
}

impl<S: SegmentationExtractor> ConversionInterface for SegmentationInterface<S> {
    fn get_metadata(&self) -> Metadata {
        get_default_ophys_metadata()
    }

    fn add_to_nwbfile(&self, nwbfile: &mut NwbFile, metadata: &Metadata, options: &Value) -> Result<()> {
        let options: SegmentationOptions = parse_options(options)?;
        add_segmentation(&self.segmentation, nwbfile, metadata, &options)
    }
}

/// Converts one or more behavioural movies.
pub struct MovieInterface {
    sources: Vec<Box<dyn MovieSource>>,
}

impl MovieInterface {
    pub fn new(sources: Vec<Box<dyn MovieSource>>) -> Self {
        Self { sources }
    }

    /// Paths of the wrapped movies, in order.
    pub fn file_paths(&self) -> Vec<&Path> {
        self.sources.iter().map(|s| s.file_path()).collect()
    }

    fn source_refs(&self) -> Vec<&dyn MovieSource> {
        self.sources.iter().map(|s| s.as_ref()).collect()
    }
}

impl ConversionInterface for MovieInterface {
    fn get_metadata(&self) -> Metadata {
        get_movie_metadata(&self.source_refs())
    }

    fn add_to_nwbfile(&self, nwbfile: &mut NwbFile, metadata: &Metadata, options: &Value) -> Result<()> {
        let options: MovieOptions = parse_options(options)?;
        add_movies(&self.source_refs(), nwbfile, metadata, &options)
    }
}

/// A named collection of interfaces written together.
#[derive(Default)]
pub struct NwbConverter {
    interfaces: Vec<(String, Box<dyn ConversionInterface>)>,
}

impl NwbConverter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_interface(&mut self, name: &str, interface: Box<dyn ConversionInterface>) -> Result<()> {
        if self.interfaces.iter().any(|(n, _)| n == name) {
            return Err(NwbError::DuplicateName {
                kind: "Data interface",
                name: name.to_string(),
            });
        }
        self.interfaces.push((name.to_string(), interface));
        Ok(())
    }

    pub fn interface_names(&self) -> Vec<&str> {
        self.interfaces.iter().map(|(n, _)| n.as_str()).collect()
    }

    /// File defaults merged with the metadata of every interface, in order.
    pub fn get_metadata(&self) -> Metadata {
        let mut metadata = Metadata::new();
        metadata.set_section(NWBFILE, default_nwbfile_metadata());
        for (_, interface) in &self.interfaces {
            metadata.merge(&interface.get_metadata());
        }
        metadata
    }

    /// Writes every interface into the file at `path`.
    ///
    /// `conversion_options` maps interface names to their options. `metadata`
    /// is merged over [`NwbConverter::get_metadata`].
    pub fn run_conversion<P: AsRef<Path>>(
        &self,
        path: P,
        overwrite: bool,
        metadata: Option<&Metadata>,
        conversion_options: &Value,
    ) -> Result<()> {
        let defaults = self.get_metadata();
        let metadata = match metadata {
            Some(user) => defaults.merged(user),
            None => defaults,
        };
        let destination = Destination::path(path.as_ref(), overwrite);
        with_nwbfile(destination, &metadata, |nwbfile| {
            for (name, interface) in &self.interfaces {
                info!(interface = %name, "running conversion");
                let options = conversion_options.get(name).unwrap_or(&Value::Null);
                interface.add_to_nwbfile(nwbfile, &metadata, options)?;
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::behavior::InMemoryMovie;
    use ndarray::Array4;
    use serde_json::json;

    fn movie_converter() -> NwbConverter {
        let movies: Vec<Box<dyn MovieSource>> = vec![
            Box::new(InMemoryMovie::new("test1.avi", 25.0, Array4::zeros((3, 2, 2, 3)))),
            Box::new(InMemoryMovie::new("test2.avi", 25.0, Array4::zeros((3, 2, 2, 3)))),
        ];
        let mut converter = NwbConverter::new();
        converter
            .add_interface("Movie", Box::new(MovieInterface::new(movies)))
            .unwrap();
        converter
    }

    #[test]
    fn metadata_combines_file_defaults_and_interfaces() {
        let metadata = movie_converter().get_metadata();
        assert!(metadata.contains(NWBFILE, "identifier"));
        let movies = metadata.get("Behavior", "Movies").unwrap().as_array().unwrap();
        assert_eq!(movies.len(), 2);
        assert_eq!(movies[1]["name"], "Video: test2");
    }

    #[test]
    fn interface_names_are_unique() {
        let mut converter = movie_converter();
        let again = MovieInterface::new(Vec::new());
        assert!(converter.add_interface("Movie", Box::new(again)).is_err());
        assert_eq!(converter.interface_names(), vec!["Movie"]);
    }

    #[test]
    fn bad_options_are_reported() {
        let converter = movie_converter();
        let dir = tempfile::tempdir().unwrap();
        let options = json!({"Movie": {"starting_times": "soon"}});
        assert!(matches!(
            converter.run_conversion(dir.path().join("x.nwb"), true, None, &options),
            Err(NwbError::InvalidArgument(_))
        ));
    }
}
