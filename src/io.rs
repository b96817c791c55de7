use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::{NwbError, Result};
use crate::nwbfile::NwbFile;

/// Identifies container documents written by this crate.
pub const DOCUMENT_FORMAT: &str = "nwb-json";
pub const DOCUMENT_VERSION: u32 = 1;

/// How a container file is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoMode {
    /// Read only; the file must exist
    Read,
    /// Read, modify and write back; the file must exist
    Append,
    /// Create or truncate
    Write,
}

#[derive(Serialize)]
struct DocumentRef<'a> {
    format: &'a str,
    version: u32,
    nwbfile: &'a NwbFile,
}

#[derive(Deserialize)]
struct Document {
    format: String,
    version: u32,
    nwbfile: NwbFile,
}

/// Handle on a container file on disk.
#[derive(Debug, Clone)]
pub struct NwbIo {
    path: PathBuf,
    mode: IoMode,
}

impl NwbIo {
    pub fn open<P: AsRef<Path>>(path: P, mode: IoMode) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if matches!(mode, IoMode::Read | IoMode::Append) && !path.is_file() {
            return Err(NwbError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{} does not exist", path.display()),
            )));
        }
        debug!(path = %path.display(), ?mode, "opened container");
        Ok(Self { path, mode })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> IoMode {
        self.mode
    }

    pub fn read(&self) -> Result<NwbFile> {
        if self.mode == IoMode::Write {
            return Err(NwbError::InvalidArgument(format!(
                "{} was opened for writing and cannot be read",
                self.path.display()
            )));
        }
        let reader = BufReader::new(File::open(&self.path)?);
        let document: Document = serde_json::from_reader(reader)?;
        if document.format != DOCUMENT_FORMAT || document.version > DOCUMENT_VERSION {
            return Err(NwbError::InvalidArgument(format!(
                "{} is a '{}' v{} document, expected '{}' up to v{}",
                self.path.display(),
                document.format,
                document.version,
                DOCUMENT_FORMAT,
                DOCUMENT_VERSION
            )));
        }
        Ok(document.nwbfile)
    }

    pub fn write(&self, nwbfile: &NwbFile) -> Result<()> {
        if self.mode == IoMode::Read {
            return Err(NwbError::InvalidArgument(format!(
                "{} was opened read-only",
                self.path.display()
            )));
        }
        let mut writer = BufWriter::new(File::create(&self.path)?);
        serde_json::to_writer(
            &mut writer,
            &DocumentRef {
                format: DOCUMENT_FORMAT,
                version: DOCUMENT_VERSION,
                nwbfile,
            },
        )?;
        writer.flush()?;
        info!(path = %self.path.display(), "container written");
        Ok(())
    }
}
