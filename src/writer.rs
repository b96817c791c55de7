//! Top-level entry points writing a whole source into a container.

use std::path::PathBuf;
use tracing::info;

use crate::ecephys::{add_all_to_nwbfile, WriteOptions};
use crate::error::Result;
use crate::io::{IoMode, NwbIo};
use crate::metadata::{get_nwb_metadata, Metadata};
use crate::nwbfile::NwbFile;
use crate::ophys::{add_segmentation, get_default_ophys_metadata, SegmentationExtractor, SegmentationOptions};
use crate::recording::Recording;

/// Where a writer puts its output.
#[derive(Debug)]
pub enum Destination<'a> {
    /// A container file. An existing file is appended to unless `overwrite` is set.
    Path { path: PathBuf, overwrite: bool },
    /// An in-memory file the caller persists itself
    File(&'a mut NwbFile),
}

impl Destination<'_> {
    pub fn path<P: Into<PathBuf>>(path: P, overwrite: bool) -> Self {
        Destination::Path {
            path: path.into(),
            overwrite,
        }
    }
}

/// Creates an empty file from the `NWBFile` section of `metadata`.
pub fn new_nwbfile(metadata: &Metadata) -> Result<NwbFile> {
    NwbFile::new(&metadata.nwbfile()?)
}

/// Runs `build` on the file behind `destination` and persists the result.
pub(crate) fn with_nwbfile<F>(destination: Destination<'_>, metadata: &Metadata, build: F) -> Result<()>
where
    F: FnOnce(&mut NwbFile) -> Result<()>,
{
    match destination {
        Destination::File(nwbfile) => build(nwbfile),
        Destination::Path { path, overwrite } => {
            let mode = if path.is_file() && !overwrite {
                IoMode::Append
            } else {
                IoMode::Write
            };
            info!(path = %path.display(), ?mode, "writing container");
            let io = NwbIo::open(&path, mode)?;
            let mut nwbfile = match mode {
                IoMode::Append => io.read()?,
                _ => new_nwbfile(metadata)?,
            };
            build(&mut nwbfile)?;
            io.write(&nwbfile)
        }
    }
}

/// Writes `recording` with its electrodes, traces and epochs.
///
/// Metadata attached to the recording is merged under `metadata`. Without
/// either, defaults are derived from the recording.
pub fn write_recording(
    recording: &dyn Recording,
    destination: Destination<'_>,
    metadata: Option<&Metadata>,
    options: &WriteOptions,
) -> Result<()> {
    let metadata = match (recording.nwb_metadata(), metadata) {
        (Some(base), Some(user)) => base.merged(user),
        (Some(base), None) => base,
        (None, Some(user)) => user.clone(),
        (None, None) => get_nwb_metadata(recording),
    };
    with_nwbfile(destination, &metadata, |nwbfile| {
        add_all_to_nwbfile(recording, nwbfile, &metadata, options)
    })
}

/// Writes `segmentation` with its imaging plane, ROIs, traces and images.
pub fn write_segmentation(
    segmentation: &dyn SegmentationExtractor,
    destination: Destination<'_>,
    metadata: Option<&Metadata>,
    options: &SegmentationOptions,
) -> Result<()> {
    let defaults = get_default_ophys_metadata();
    let metadata = match metadata {
        Some(user) => defaults.merged(user),
        None => defaults,
    };
    with_nwbfile(destination, &metadata, |nwbfile| {
        add_segmentation(segmentation, nwbfile, &metadata, options)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::NwbFileMetadata;
    use crate::recording::InMemoryRecording;
    use ndarray::Array2;
    use serde_json::json;

    #[test]
    fn in_memory_destination_is_filled() {
        let recording = InMemoryRecording::new(Array2::<i16>::zeros((5, 2)), 100.0);
        let mut file = NwbFile::new(&NwbFileMetadata::default()).unwrap();
        write_recording(&recording, Destination::File(&mut file), None, &WriteOptions::default())
            .unwrap();
        assert!(file.get_acquisition("ElectricalSeries_raw").is_some());
        assert_eq!(file.device("Device").unwrap().description.as_deref(), Some("no description"));
    }

    #[test]
    fn recording_metadata_sits_under_user_metadata() {
        let attached = Metadata::from_value(json!({
            "Ecephys": {"Device": [{"name": "Probe", "description": "attached"}]}
        }))
        .unwrap();
        let user = Metadata::from_value(json!({
            "Ecephys": {"Device": [{"name": "Probe", "description": "user"}]}
        }))
        .unwrap();
        let recording =
            InMemoryRecording::new(Array2::<i16>::zeros((5, 2)), 100.0).with_nwb_metadata(attached);
        let mut file = NwbFile::new(&NwbFileMetadata::default()).unwrap();
        write_recording(&recording, Destination::File(&mut file), Some(&user), &WriteOptions::default())
            .unwrap();
        assert_eq!(file.device("Probe").unwrap().description.as_deref(), Some("user"));
    }
}
