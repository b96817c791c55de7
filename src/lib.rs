//! Conversion of neurophysiology recordings into an NWB container.
//!
//! Sources are reached through the [`Recording`], [`SegmentationExtractor`]
//! and [`MovieSource`] traits. Builders add their content to an [`NwbFile`]
//! and reuse anything the file already holds, so a container can be filled
//! in several passes.

mod binary;
pub mod behavior;
pub mod converter;
pub mod dataset;
pub mod ecephys;
mod error;
pub mod io;
pub mod iterator;
pub mod metadata;
pub mod nwbfile;
pub mod ophys;
pub mod recording;
pub mod table;
pub mod types;
pub mod writer;

use std::path::Path;

// Re-export the main entry points
pub use behavior::{InMemoryMovie, MovieOptions, MovieSource};
pub use binary::BinaryRecording;
pub use converter::{ConversionInterface, MovieInterface, NwbConverter, RecordingInterface, SegmentationInterface};
pub use ecephys::{WriteAs, WriteOptions};
pub use error::{NwbError, Result};
pub use io::{IoMode, NwbIo};
pub use metadata::Metadata;
pub use nwbfile::NwbFile;
pub use ophys::{InMemorySegmentation, SegmentationExtractor, SegmentationOptions};
pub use recording::{InMemoryRecording, Recording};
pub use types::*;
pub use writer::{write_recording, write_segmentation, Destination};

/// Reads a container previously written by this crate
///
/// # Examples
///
/// ```no_run
/// use nwb_exporter::read;
///
/// match read("path/to/session.nwb") {
///     Ok(nwbfile) => println!("Session: {}", nwbfile.session_description),
///     Err(e) => println!("Error reading file: {}", e),
/// }
/// ```
pub fn read<P: AsRef<Path>>(path: P) -> Result<NwbFile> {
    NwbIo::open(path, IoMode::Read)?.read()
}
