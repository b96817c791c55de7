use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use ndarray::Array2;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{NwbError, Result};
use crate::recording::{
    channel_columns, check_channel_len, scale_traces, select_columns, EpochInfo, Recording,
};
use crate::types::{CellValue, ChannelId, DType, DataArray};

// 64KB, same as the other buffered readers in this crate
const READ_BUFFER_CAPACITY: usize = 65536;
// Upper bound on the all-channel block held while selecting columns
const MAX_BLOCK_BYTES: usize = 8 * 1024 * 1024;

/// A recording stored as a raw, interleaved, little-endian binary file.
///
/// Samples are laid out frame by frame: all channels of frame 0, then all
/// channels of frame 1, and so on, optionally preceded by a fixed-size
/// header. Reads seek straight to the requested frame window so any slice
/// can be fetched without loading the whole file.
#[derive(Debug, Clone)]
pub struct BinaryRecording {
    path: PathBuf,
    dtype: DType,
    sampling_frequency: f64,
    num_frames: usize,
    file_offset: u64,
    channel_ids: Vec<ChannelId>,
    gains: Vec<f64>,
    offsets: Vec<f64>,
    properties: BTreeMap<ChannelId, BTreeMap<String, CellValue>>,
    epochs: Vec<(String, EpochInfo)>,
}

impl BinaryRecording {
    /// Opens a binary file with no header.
    pub fn open<P: AsRef<Path>>(
        path: P,
        num_channels: usize,
        sampling_frequency: f64,
        dtype: DType,
    ) -> Result<Self> {
        Self::open_with_offset(path, num_channels, sampling_frequency, dtype, 0)
    }

    /// Opens a binary file whose samples start `file_offset` bytes in.
    pub fn open_with_offset<P: AsRef<Path>>(
        path: P,
        num_channels: usize,
        sampling_frequency: f64,
        dtype: DType,
        file_offset: u64,
    ) -> Result<Self> {
        if num_channels == 0 {
            return Err(NwbError::InvalidArgument(
                "a binary recording needs at least one channel".to_string(),
            ));
        }
        let file_size = File::open(path.as_ref())?.metadata()?.len();
        let bytes_remaining = file_size.checked_sub(file_offset).ok_or_else(|| {
            NwbError::InvalidArgument(format!(
                "file offset {} is past the end of a {} byte file",
                file_offset, file_size
            ))
        })?;

        let bytes_per_frame = (num_channels * dtype.itemsize()) as u64;
        if bytes_remaining % bytes_per_frame != 0 {
            return Err(NwbError::InvalidArgument(format!(
                "{} data bytes is not a whole number of {}-byte frames",
                bytes_remaining, bytes_per_frame
            )));
        }
        let num_frames = (bytes_remaining / bytes_per_frame) as usize;

        tracing::debug!(
            path = %path.as_ref().display(),
            num_channels,
            num_frames,
            %dtype,
            "opened binary recording"
        );

        Ok(Self {
            path: path.as_ref().to_path_buf(),
            dtype,
            sampling_frequency,
            num_frames,
            file_offset,
            channel_ids: (0..num_channels as ChannelId).collect(),
            gains: vec![1.0; num_channels],
            offsets: vec![0.0; num_channels],
            properties: BTreeMap::new(),
            epochs: Vec::new(),
        })
    }

    pub fn with_channel_ids(mut self, channel_ids: Vec<ChannelId>) -> Result<Self> {
        if channel_ids.len() != self.channel_ids.len() {
            return Err(NwbError::InvalidArgument(format!(
                "expected {} channel ids, got {}",
                self.channel_ids.len(),
                channel_ids.len()
            )));
        }
        self.channel_ids = channel_ids;
        Ok(self)
    }

    pub fn with_gains(mut self, gains: Vec<f64>) -> Result<Self> {
        check_channel_len("gains", &gains, self.channel_ids.len())?;
        self.gains = gains;
        Ok(self)
    }

    pub fn with_offsets(mut self, offsets: Vec<f64>) -> Result<Self> {
        check_channel_len("offsets", &offsets, self.channel_ids.len())?;
        self.offsets = offsets;
        Ok(self)
    }

    pub fn with_property(
        mut self,
        channel_id: ChannelId,
        name: &str,
        value: impl Into<CellValue>,
    ) -> Self {
        self.properties
            .entry(channel_id)
            .or_default()
            .insert(name.to_string(), value.into());
        self
    }

    pub fn with_epoch(mut self, name: &str, start_frame: i64, end_frame: i64) -> Self {
        self.epochs.push((
            name.to_string(),
            EpochInfo {
                start_frame,
                end_frame,
            },
        ));
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes a (frames, channels) array as an interleaved binary file.
    pub fn write_traces<P: AsRef<Path>>(path: P, traces: &DataArray) -> Result<()> {
        let mut writer = BufWriter::with_capacity(READ_BUFFER_CAPACITY, File::create(path)?);
        match traces {
            DataArray::Int8(a) => a.iter().try_for_each(|&v| writer.write_i8(v))?,
            DataArray::UInt8(a) => a.iter().try_for_each(|&v| writer.write_u8(v))?,
            DataArray::Int16(a) => a
                .iter()
                .try_for_each(|&v| writer.write_i16::<LittleEndian>(v))?,
            DataArray::UInt16(a) => a
                .iter()
                .try_for_each(|&v| writer.write_u16::<LittleEndian>(v))?,
            DataArray::Int32(a) => a
                .iter()
                .try_for_each(|&v| writer.write_i32::<LittleEndian>(v))?,
            DataArray::UInt32(a) => a
                .iter()
                .try_for_each(|&v| writer.write_u32::<LittleEndian>(v))?,
            DataArray::Int64(a) => a
                .iter()
                .try_for_each(|&v| writer.write_i64::<LittleEndian>(v))?,
            DataArray::Float32(a) => a
                .iter()
                .try_for_each(|&v| writer.write_f32::<LittleEndian>(v))?,
            DataArray::Float64(a) => a
                .iter()
                .try_for_each(|&v| writer.write_f64::<LittleEndian>(v))?,
        }
        writer.flush()?;
        Ok(())
    }

    /// Reads the given columns for a frame window.
    ///
    /// The window is read `block_frames` frames at a time and only the
    /// selected columns of each block are kept, so a single-channel read
    /// holds at most one block of the other channels.
    fn read_columns(
        &self,
        columns: &[usize],
        start_frame: usize,
        end_frame: usize,
        block_frames: usize,
    ) -> Result<DataArray> {
        if start_frame > end_frame || end_frame > self.num_frames {
            return Err(NwbError::InvalidArgument(format!(
                "frame window {}..{} is outside 0..{}",
                start_frame, end_frame, self.num_frames
            )));
        }
        let num_channels = self.channel_ids.len();
        let bytes_per_frame = (num_channels * self.dtype.itemsize()) as u64;
        let num_frames = end_frame - start_frame;
        let mut out = DataArray::zeros(self.dtype, &[num_frames, columns.len()]);
        if num_frames == 0 || columns.is_empty() {
            return Ok(out);
        }

        let file = File::open(&self.path)?;
        let mut reader = BufReader::with_capacity(READ_BUFFER_CAPACITY, file);
        reader.seek(SeekFrom::Start(
            self.file_offset + start_frame as u64 * bytes_per_frame,
        ))?;

        let block_frames = block_frames.max(1);
        let mut done = 0;
        while done < num_frames {
            let frames = block_frames.min(num_frames - done);
            let block = read_block(&mut reader, self.dtype, (frames, num_channels))?;
            out.assign_at(&[done, 0], &block.select_window(0, frames, columns)?)?;
            done += frames;
        }
        Ok(out)
    }

    fn block_frames(&self) -> usize {
        let bytes_per_frame = self.channel_ids.len() * self.dtype.itemsize();
        (MAX_BLOCK_BYTES / bytes_per_frame.max(1)).max(1)
    }
}

/// Reads `shape.0 * shape.1` little-endian values into a (frames, channels) array.
fn read_block<R: Read>(reader: &mut R, dtype: DType, shape: (usize, usize)) -> Result<DataArray> {
    let count = shape.0 * shape.1;
    Ok(match dtype {
        DType::Int8 => {
            let mut buf = vec![0i8; count];
            reader.read_i8_into(&mut buf)?;
            DataArray::from(Array2::from_shape_vec(shape, buf)?)
        }
        DType::UInt8 => {
            let mut buf = vec![0u8; count];
            reader.read_exact(&mut buf)?;
            DataArray::from(Array2::from_shape_vec(shape, buf)?)
        }
        DType::Int16 => {
            let mut buf = vec![0i16; count];
            reader.read_i16_into::<LittleEndian>(&mut buf)?;
            DataArray::from(Array2::from_shape_vec(shape, buf)?)
        }
        DType::UInt16 => {
            let mut buf = vec![0u16; count];
            reader.read_u16_into::<LittleEndian>(&mut buf)?;
            DataArray::from(Array2::from_shape_vec(shape, buf)?)
        }
        DType::Int32 => {
            let mut buf = vec![0i32; count];
            reader.read_i32_into::<LittleEndian>(&mut buf)?;
            DataArray::from(Array2::from_shape_vec(shape, buf)?)
        }
        DType::UInt32 => {
            let mut buf = vec![0u32; count];
            reader.read_u32_into::<LittleEndian>(&mut buf)?;
            DataArray::from(Array2::from_shape_vec(shape, buf)?)
        }
        DType::Int64 => {
            let mut buf = vec![0i64; count];
            reader.read_i64_into::<LittleEndian>(&mut buf)?;
            DataArray::from(Array2::from_shape_vec(shape, buf)?)
        }
        DType::Float32 => {
            let mut buf = vec![0f32; count];
            reader.read_f32_into::<LittleEndian>(&mut buf)?;
            DataArray::from(Array2::from_shape_vec(shape, buf)?)
        }
        DType::Float64 => {
            let mut buf = vec![0f64; count];
            reader.read_f64_into::<LittleEndian>(&mut buf)?;
            DataArray::from(Array2::from_shape_vec(shape, buf)?)
        }
    })
}

impl Recording for BinaryRecording {
    fn channel_ids(&self) -> Vec<ChannelId> {
        self.channel_ids.clone()
    }

    fn sampling_frequency(&self) -> f64 {
        self.sampling_frequency
    }

    fn num_frames(&self) -> usize {
        self.num_frames
    }

    fn dtype(&self) -> DType {
        self.dtype
    }

    fn channel_property_names(&self, channel_id: ChannelId) -> Vec<String> {
        self.properties
            .get(&channel_id)
            .map(|props| props.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn channel_property(&self, channel_id: ChannelId, name: &str) -> Option<CellValue> {
        self.properties
            .get(&channel_id)
            .and_then(|props| props.get(name))
            .cloned()
    }

    fn channel_gains(&self) -> Vec<f64> {
        self.gains.clone()
    }

    fn channel_offsets(&self) -> Vec<f64> {
        self.offsets.clone()
    }

    fn traces(
        &self,
        channel_ids: &[ChannelId],
        start_frame: usize,
        end_frame: usize,
        return_scaled: bool,
    ) -> Result<DataArray> {
        let columns = channel_columns(&self.channel_ids, channel_ids)?;
        let raw = self.read_columns(&columns, start_frame, end_frame, self.block_frames())?;
        if !return_scaled {
            return Ok(raw);
        }
        let gains = select_columns("gains", &self.gains, &columns)?;
        let offsets = select_columns("offsets", &self.offsets, &columns)?;
        Ok(scale_traces(&raw, &gains, &offsets))
    }

    fn is_memory_mapped(&self) -> bool {
        true
    }

    fn epoch_names(&self) -> Vec<String> {
        self.epochs.iter().map(|(name, _)| name.clone()).collect()
    }

    fn epoch_info(&self, name: &str) -> Option<EpochInfo> {
        self.epochs
            .iter()
            .find(|(candidate, _)| candidate == name)
            .map(|(_, info)| *info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn reads_back_written_frames() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("traces.dat");
        let traces = DataArray::from(array![[1i16, -2, 3], [4, 5, -6], [7, 8, 9]]);
        BinaryRecording::write_traces(&path, &traces).unwrap();

        let recording = BinaryRecording::open(&path, 3, 30000.0, DType::Int16).unwrap();
        assert_eq!(recording.num_frames(), 3);
        assert!(recording.is_memory_mapped());
        let window = recording.traces(&[2, 0], 1, 3, false).unwrap();
        assert_eq!(window, DataArray::from(array![[-6i16, 4], [9, 7]]));
    }

    #[test]
    fn honours_header_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("with_header.dat");
        {
            let mut file = File::create(&path).unwrap();
            file.write_all(&[0xAA; 8]).unwrap();
            file.write_u16::<LittleEndian>(100).unwrap();
            file.write_u16::<LittleEndian>(200).unwrap();
        }
        let recording =
            BinaryRecording::open_with_offset(&path, 2, 1000.0, DType::UInt16, 8).unwrap();
        assert_eq!(recording.num_frames(), 1);
        assert_eq!(
            recording.traces(&[0, 1], 0, 1, false).unwrap(),
            DataArray::from(array![[100u16, 200]])
        );
    }

    #[test]
    fn column_reads_span_several_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blocks.dat");
        let traces = Array2::from_shape_fn((5, 3), |(f, c)| (f * 10 + c) as i32);
        BinaryRecording::write_traces(&path, &DataArray::from(traces)).unwrap();

        let recording = BinaryRecording::open(&path, 3, 1000.0, DType::Int32).unwrap();
        let column = recording.read_columns(&[1], 0, 5, 2).unwrap();
        assert_eq!(column, DataArray::from(array![[1i32], [11], [21], [31], [41]]));
        let window = recording.read_columns(&[2, 0], 1, 4, 2).unwrap();
        assert_eq!(window, DataArray::from(array![[12i32, 10], [22, 20], [32, 30]]));
        assert_eq!(recording.read_columns(&[0], 2, 2, 2).unwrap().shape(), &[0, 1]);
        assert!(recording.read_columns(&[0], 3, 6, 2).is_err());
    }

    #[test]
    fn calibration_lengths_are_checked() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("calibrated.dat");
        BinaryRecording::write_traces(&path, &DataArray::from(array![[1i16, 2]])).unwrap();
        let recording = BinaryRecording::open(&path, 2, 1000.0, DType::Int16).unwrap();
        assert!(recording.clone().with_gains(vec![0.195]).is_err());
        assert!(recording.clone().with_offsets(vec![0.0; 3]).is_err());
        let scaled = recording
            .with_gains(vec![2.0, 0.5])
            .unwrap()
            .traces(&[1, 0], 0, 1, true)
            .unwrap();
        assert_eq!(scaled, DataArray::from(array![[1.0f32, 2.0]]));
    }

    #[test]
    fn rejects_truncated_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("truncated.dat");
        std::fs::write(&path, [0u8; 5]).unwrap();
        assert!(BinaryRecording::open(&path, 2, 1000.0, DType::Int16).is_err());
    }
}
