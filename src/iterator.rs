//! Chunked copying of large arrays into datasets.
//!
//! A [`DataChunkIterator`] yields blocks of a larger array together with
//! their position, so a source never has to be materialised in one piece.

use ndarray::Axis;

use crate::behavior::MovieSource;
use crate::dataset::{Compression, Dataset};
use crate::error::Result;
use crate::recording::Recording;
use crate::types::{ChannelId, DType, DataArray};

/// Target size of a heuristic chunk in bytes
const TARGET_CHUNK_BYTES: usize = 1_000_000;

/// A block of data and the offset of its first element in the full array.
#[derive(Debug, Clone, PartialEq)]
pub struct DataChunk {
    pub offset: Vec<usize>,
    pub data: DataArray,
}

/// Iterator over the chunks of an array of known final shape and type.
pub struct DataChunkIterator<'a> {
    chunks: Box<dyn Iterator<Item = Result<DataChunk>> + 'a>,
    dtype: DType,
    maxshape: Vec<usize>,
    chunk_shape: Vec<usize>,
}

impl<'a> DataChunkIterator<'a> {
    /// Reads `buffer_frames` frames of every channel at a time.
    pub fn buffered(
        recording: &'a dyn Recording,
        channel_ids: Vec<ChannelId>,
        buffer_frames: usize,
        return_scaled: bool,
    ) -> Self {
        let num_frames = recording.num_frames();
        let num_channels = channel_ids.len();
        let step = buffer_frames.max(1);
        let dtype = if return_scaled {
            DType::Float32
        } else {
            recording.dtype()
        };

        let chunks = (0..num_frames).step_by(step).map(move |start| {
            let end = (start + step).min(num_frames);
            tracing::debug!(start, end, "reading buffered trace block");
            recording
                .traces(&channel_ids, start, end, return_scaled)
                .map(|data| DataChunk {
                    offset: vec![start, 0],
                    data,
                })
        });

        Self {
            chunks: Box::new(chunks),
            dtype,
            maxshape: vec![num_frames, num_channels],
            chunk_shape: vec![step.min(num_frames.max(1)), num_channels],
        }
    }

    /// Reads one full channel at a time.
    ///
    /// When any entry of `coercions` is nonzero, unscaled data is shifted by
    /// the channel's entry and converted to the signed type of the same
    /// width. Otherwise the native type is kept, as on the buffered path.
    pub fn per_channel(
        recording: &'a dyn Recording,
        channel_ids: Vec<ChannelId>,
        coercions: Vec<i64>,
        return_scaled: bool,
    ) -> Self {
        let num_frames = recording.num_frames();
        let num_channels = channel_ids.len();
        let rebase = !return_scaled && coercions.iter().any(|&c| c != 0);
        let dtype = if return_scaled {
            DType::Float32
        } else if rebase {
            recording.dtype().signed()
        } else {
            recording.dtype()
        };

        let chunks = channel_ids
            .into_iter()
            .enumerate()
            .map(move |(index, channel_id)| -> Result<DataChunk> {
                tracing::debug!(channel_id, "reading channel traces");
                let data = recording.traces(&[channel_id], 0, num_frames, return_scaled)?;
                let data = if rebase {
                    data.rebase_signed(coercions.get(index).copied().unwrap_or(0))?
                } else {
                    data
                };
                Ok(DataChunk {
                    offset: vec![0, index],
                    data,
                })
            });

        Self {
            chunks: Box::new(chunks),
            dtype,
            maxshape: vec![num_frames, num_channels],
            chunk_shape: vec![num_frames, 1],
        }
    }

    /// Reads one movie frame at a time.
    pub fn movie_frames(source: &'a dyn MovieSource, num_frames: usize) -> Self {
        let (height, width, colors) = source.frame_shape();
        let chunks = (0..num_frames).map(move |index| -> Result<DataChunk> {
            let frame = source.read_frame(index)?;
            Ok(DataChunk {
                offset: vec![index, 0, 0, 0],
                data: DataArray::from(frame.insert_axis(Axis(0))),
            })
        });

        Self {
            chunks: Box::new(chunks),
            dtype: DType::UInt8,
            maxshape: vec![num_frames, height, width, colors],
            chunk_shape: vec![1, height, width, colors],
        }
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn maxshape(&self) -> &[usize] {
        &self.maxshape
    }

    pub fn chunk_shape(&self) -> &[usize] {
        &self.chunk_shape
    }
}

impl Iterator for DataChunkIterator<'_> {
    type Item = Result<DataChunk>;

    fn next(&mut self) -> Option<Self::Item> {
        self.chunks.next()
    }
}

/// Drains `iterator` into a freshly allocated dataset of its full shape.
pub fn write_dataset(
    iterator: DataChunkIterator<'_>,
    compression: Option<Compression>,
) -> Result<Dataset> {
    let maxshape = iterator.maxshape.clone();
    let chunk_shape = iterator.chunk_shape.clone();
    let mut data = DataArray::zeros(iterator.dtype, &maxshape);

    let mut num_chunks = 0usize;
    for chunk in iterator {
        let chunk = chunk?;
        data.assign_at(&chunk.offset, &chunk.data)?;
        num_chunks += 1;
    }
    tracing::debug!(num_chunks, ?maxshape, "dataset written");

    let mut dataset = Dataset::new(data).with_chunks(chunk_shape);
    dataset.compression = compression;
    Ok(dataset)
}

/// Chunk shape of roughly one megabyte that keeps trailing axes whole.
pub fn guess_chunk_shape(shape: &[usize], itemsize: usize) -> Vec<usize> {
    let Some((&leading, rest)) = shape.split_first() else {
        return Vec::new();
    };
    let row_bytes = rest.iter().product::<usize>().max(1) * itemsize.max(1);
    let rows = (TARGET_CHUNK_BYTES / row_bytes).clamp(1, leading.max(1));
    let mut chunk = vec![rows];
    chunk.extend_from_slice(rest);
    chunk
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::InMemoryRecording;
    use ndarray::{array, Array2};

    #[test]
    fn buffered_chunks_cover_every_frame() {
        let traces = Array2::from_shape_fn((10, 2), |(f, c)| (f * 10 + c) as i16);
        let recording = InMemoryRecording::new(traces.clone(), 100.0);
        let iterator = DataChunkIterator::buffered(&recording, vec![0, 1], 4, false);
        assert_eq!(iterator.chunk_shape(), &[4, 2]);
        let offsets: Vec<usize> = DataChunkIterator::buffered(&recording, vec![0, 1], 4, false)
            .map(|c| c.unwrap().offset[0])
            .collect();
        assert_eq!(offsets, vec![0, 4, 8]);

        let dataset = write_dataset(iterator, Some(Compression::default())).unwrap();
        assert_eq!(dataset.data, DataArray::from(traces));
        assert_eq!(dataset.chunks, Some(vec![4, 2]));
    }

    #[test]
    fn per_channel_chunks_rebase_to_signed() {
        let recording = InMemoryRecording::new(array![[0u16, 10], [65535, 20]], 100.0);
        let iterator = DataChunkIterator::per_channel(&recording, vec![0, 1], vec![-32768, 0], false);
        assert_eq!(iterator.dtype(), DType::Int16);
        let dataset = write_dataset(iterator, None).unwrap();
        assert_eq!(dataset.data, DataArray::from(array![[-32768i16, 10], [32767, 20]]));
        assert_eq!(dataset.chunks, Some(vec![2, 1]));
    }

    #[test]
    fn per_channel_without_offsets_keeps_native_type() {
        let traces = array![[40000u16, 1], [2, 65535]];
        let recording = InMemoryRecording::new(traces.clone(), 100.0);
        let per_channel = write_dataset(
            DataChunkIterator::per_channel(&recording, vec![0, 1], vec![0, 0], false),
            None,
        )
        .unwrap();
        let buffered =
            write_dataset(DataChunkIterator::buffered(&recording, vec![0, 1], 8, false), None).unwrap();
        assert_eq!(per_channel.dtype(), DType::UInt16);
        assert_eq!(per_channel.data, DataArray::from(traces));
        assert_eq!(per_channel.data, buffered.data);
    }

    #[test]
    fn empty_recordings_produce_empty_datasets() {
        let recording = InMemoryRecording::new(Array2::<i16>::zeros((0, 3)), 100.0);
        let dataset =
            write_dataset(DataChunkIterator::buffered(&recording, vec![0, 1, 2], 8, false), None)
                .unwrap();
        assert_eq!(dataset.shape(), &[0, 3]);
        assert_eq!(dataset.dtype(), DType::Int16);
    }

    #[test]
    fn chunk_guess_keeps_frames_whole() {
        assert_eq!(guess_chunk_shape(&[50, 640, 480, 3], 1), vec![1, 640, 480, 3]);
        assert_eq!(guess_chunk_shape(&[5, 10, 10, 3], 1), vec![5, 10, 10, 3]);
    }
}
