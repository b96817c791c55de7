use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::{DType, DataArray};

/// Compression filter recorded for a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "filter", rename_all = "lowercase")]
pub enum Compression {
    Gzip { level: u8 },
}

impl Default for Compression {
    fn default() -> Self {
        Compression::Gzip { level: 4 }
    }
}

/// An array written into the container, with its storage layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub object_id: String,
    pub data: DataArray,
    pub maxshape: Vec<usize>,
    /// Chunk shape used while copying, `None` for contiguous data
    pub chunks: Option<Vec<usize>>,
    pub compression: Option<Compression>,
}

impl Dataset {
    /// Wraps an in-memory array as a contiguous, uncompressed dataset.
    pub fn new(data: impl Into<DataArray>) -> Self {
        let data = data.into();
        Self {
            object_id: uuid::Uuid::new_v4().to_string(),
            maxshape: data.shape().to_vec(),
            data,
            chunks: None,
            compression: None,
        }
    }

    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = Some(compression);
        self
    }

    pub fn with_chunks(mut self, chunks: Vec<usize>) -> Self {
        self.chunks = Some(chunks);
        self
    }

    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    pub fn dtype(&self) -> DType {
        self.data.dtype()
    }

    /// Summary of this dataset at `location` inside the file.
    pub fn info(&self, location: &str) -> DatasetInfo {
        DatasetInfo {
            object_id: self.object_id.clone(),
            location: location.to_string(),
            full_shape: self.maxshape.clone(),
            dtype: self.dtype(),
        }
    }
}

/// Identity, location and shape of one dataset in a file.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct DatasetInfo {
    pub object_id: String,
    pub location: String,
    pub full_shape: Vec<usize>,
    pub dtype: DType,
}

fn shape_tuple(shape: &[usize]) -> String {
    match shape {
        [single] => format!("({},)", single),
        _ => format!(
            "({})",
            shape
                .iter()
                .map(|d| d.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ),
    }
}

impl fmt::Display for DatasetInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f)?;
        writeln!(f, "{}", self.location)?;
        writeln!(f, "{}", "-".repeat(self.location.chars().count()))?;
        writeln!(f, "  maxshape: {}", shape_tuple(&self.full_shape))?;
        writeln!(f, "  dtype: {}", self.dtype)
    }
}

impl fmt::Debug for DatasetInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "DatasetInfo(object_id='{}', location='{}', full_shape={}, dtype=dtype('{}'))",
            self.object_id,
            self.location,
            shape_tuple(&self.full_shape),
            self.dtype
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn mock_info() -> DatasetInfo {
        DatasetInfo {
            object_id: "abc123".to_string(),
            location: "TestParent/data".to_string(),
            full_shape: vec![2, 4],
            dtype: DType::Int16,
        }
    }

    #[test]
    fn display_is_an_underlined_summary() {
        let expected = "\nTestParent/data\n---------------\n  maxshape: (2, 4)\n  dtype: int16\n";
        assert_eq!(mock_info().to_string(), expected);
    }

    #[test]
    fn debug_is_dataclass_like() {
        assert_eq!(
            format!("{:?}", mock_info()),
            "DatasetInfo(object_id='abc123', location='TestParent/data', full_shape=(2, 4), dtype=dtype('int16'))"
        );
    }

    #[test]
    fn info_is_hashable() {
        let mut seen = HashMap::new();
        seen.insert(mock_info(), true);
        assert_eq!(seen.get(&mock_info()), Some(&true));
    }

    #[test]
    fn one_dimensional_shapes_keep_trailing_comma() {
        assert_eq!(shape_tuple(&[5]), "(5,)");
    }
}
