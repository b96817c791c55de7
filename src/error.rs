use std::io;

use crate::types::DType;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, NwbError>;

/// Errors raised while building or persisting an NWB container.
///
/// Structural problems (bad metadata, duplicate names, unknown rows) fail
/// immediately. Inconsistencies that can be repaired automatically are logged
/// as warnings instead and never surface here.
#[derive(Debug, thiserror::Error)]
pub enum NwbError {
    /// An I/O error occurred while reading a source or the container file
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// The container document or a metadata file could not be (de)serialized
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// An array could not be reshaped or sliced
    #[error("Shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),

    /// A session start time string could not be parsed
    #[error("Invalid session start time: {0}")]
    Timestamp(#[from] chrono::ParseError),

    /// Metadata was present but malformed
    #[error("Invalid metadata: {0}")]
    InvalidMetadata(String),

    /// A metadata key required by the caller was not found
    #[error("metadata['{section}'] does not contain key '{key}'")]
    MissingMetadataKey { section: String, key: String },

    /// An object with the same name already exists at the destination
    #[error("{kind} '{name}' is already written in the NWBFile!")]
    DuplicateName { kind: &'static str, name: String },

    /// A referenced object (device, group, module, interface) does not exist
    #[error("{kind} '{name}' not found in the NWBFile")]
    NotFound { kind: &'static str, name: String },

    /// A row id was not present in a dynamic table
    #[error("Row id {0} is not present in the table")]
    UnknownRowId(i64),

    /// A channel id was not present in the recording or the electrode table
    #[error("Channel {0} not found")]
    ChannelNotFound(i64),

    /// An electrode column was declared without data and has no default
    #[error("no data for electrode column {0}")]
    MissingColumnData(String),

    /// No electrode rows could be created
    #[error("Unable to form electrode table! Check device, electrode group, and electrode metadata.")]
    EmptyElectrodeTable,

    /// Channel offsets cannot be expressed as whole multiples of the gain
    #[error(
        "Unable to coerce underlying unsigned data type to signed type, which is currently \
         required for NWB Schema v2.2.5! Please specify 'write_scaled=True'."
    )]
    OffsetCoercion,

    /// A value left the representable range while re-basing to a signed type
    #[error("Value {value} does not fit into {dtype} after re-basing")]
    Overflow { value: i64, dtype: DType },

    /// Two arrays that must share a dtype did not
    #[error("Data type mismatch: expected {expected}, got {actual}")]
    DtypeMismatch { expected: DType, actual: DType },

    /// A caller-supplied argument was out of range or inconsistent
    #[error("{0}")]
    InvalidArgument(String),
}
