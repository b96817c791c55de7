use ndarray::{ArrayD, Axis};
use std::collections::BTreeMap;

use crate::error::{NwbError, Result};
use crate::metadata::Metadata;
use crate::types::{CellValue, ChannelId, DType, DataArray};

/// Start and end frame of a named epoch (end exclusive).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpochInfo {
    pub start_frame: i64,
    pub end_frame: i64,
}

/// A multi-channel electrophysiology recording.
///
/// This is the only view the writers have of a vendor dataset. Traces are
/// returned as (frames, channels), time being the first axis as in NWB.
pub trait Recording {
    fn channel_ids(&self) -> Vec<ChannelId>;

    fn num_channels(&self) -> usize {
        self.channel_ids().len()
    }

    /// Sampling frequency in Hz
    fn sampling_frequency(&self) -> f64;

    fn num_frames(&self) -> usize;

    /// Element type of unscaled traces
    fn dtype(&self) -> DType;

    fn channel_property_names(&self, channel_id: ChannelId) -> Vec<String>;

    fn channel_property(&self, channel_id: ChannelId, name: &str) -> Option<CellValue>;

    /// Channel group, read from the `group` property and 0 when unset.
    fn channel_group(&self, channel_id: ChannelId) -> i64 {
        match self.channel_property(channel_id, "group") {
            Some(CellValue::Int(group)) => group,
            Some(CellValue::Float(group)) if group.fract() == 0.0 => group as i64,
            Some(CellValue::Text(text)) => text.trim().parse().unwrap_or(0),
            _ => 0,
        }
    }

    /// Per-channel gains that convert raw values to microvolts.
    fn channel_gains(&self) -> Vec<f64> {
        vec![1.0; self.num_channels()]
    }

    /// Per-channel offsets in microvolts.
    fn channel_offsets(&self) -> Vec<f64> {
        vec![0.0; self.num_channels()]
    }

    /// Planar probe position of a channel, if known.
    fn channel_location(&self, _channel_id: ChannelId) -> Option<[f64; 2]> {
        None
    }

    /// Reads traces for `channel_ids` over `start_frame..end_frame`.
    ///
    /// With `return_scaled` the values are converted to microvolts and
    /// returned as float32.
    fn traces(
        &self,
        channel_ids: &[ChannelId],
        start_frame: usize,
        end_frame: usize,
        return_scaled: bool,
    ) -> Result<DataArray>;

    fn frame_to_time(&self, frame: i64) -> f64 {
        frame as f64 / self.sampling_frequency()
    }

    /// True when traces can be read in bulk without per-channel copies.
    fn is_memory_mapped(&self) -> bool {
        false
    }

    fn epoch_names(&self) -> Vec<String> {
        Vec::new()
    }

    fn epoch_info(&self, _name: &str) -> Option<EpochInfo> {
        None
    }

    /// Metadata attached to the source itself, merged under user metadata.
    fn nwb_metadata(&self) -> Option<Metadata> {
        None
    }
}

/// Sorted, de-duplicated channel groups of a recording.
pub fn unique_channel_groups(recording: &dyn Recording) -> Vec<i64> {
    let mut groups: Vec<i64> = recording
        .channel_ids()
        .into_iter()
        .map(|id| recording.channel_group(id))
        .collect();
    groups.sort_unstable();
    groups.dedup();
    groups
}

/// Maps channel ids to their column positions in `all_ids`.
pub(crate) fn channel_columns(all_ids: &[ChannelId], wanted: &[ChannelId]) -> Result<Vec<usize>> {
    wanted
        .iter()
        .map(|id| {
            all_ids
                .iter()
                .position(|candidate| candidate == id)
                .ok_or(NwbError::ChannelNotFound(*id))
        })
        .collect()
}

/// Fails unless `values` holds one `what` entry per channel.
pub(crate) fn check_channel_len(what: &str, values: &[f64], num_channels: usize) -> Result<()> {
    if values.len() != num_channels {
        return Err(NwbError::InvalidArgument(format!(
            "expected {num_channels} channel {what}, got {}",
            values.len()
        )));
    }
    Ok(())
}

/// Picks the entries of a per-channel vector for the given columns.
pub(crate) fn select_columns(what: &str, values: &[f64], columns: &[usize]) -> Result<Vec<f64>> {
    columns
        .iter()
        .map(|&c| {
            values.get(c).copied().ok_or_else(|| {
                NwbError::InvalidArgument(format!("no channel {what} for column {c}"))
            })
        })
        .collect()
}

/// Converts raw traces to microvolts: `raw * gain + offset`, column by column.
pub(crate) fn scale_traces(raw: &DataArray, gains: &[f64], offsets: &[f64]) -> DataArray {
    let mut scaled: ArrayD<f64> = raw.to_f64();
    for (column, mut lane) in scaled.axis_iter_mut(Axis(1)).enumerate() {
        let gain = gains.get(column).copied().unwrap_or(1.0);
        let offset = offsets.get(column).copied().unwrap_or(0.0);
        lane.mapv_inplace(|v| v * gain + offset);
    }
    DataArray::Float32(scaled.mapv(|v| v as f32))
}

/// A recording held entirely in memory.
///
/// Mostly useful for tests and for sources that have already been decoded.
#[derive(Debug, Clone)]
pub struct InMemoryRecording {
    traces: DataArray,
    sampling_frequency: f64,
    channel_ids: Vec<ChannelId>,
    properties: BTreeMap<ChannelId, BTreeMap<String, CellValue>>,
    gains: Option<Vec<f64>>,
    offsets: Option<Vec<f64>>,
    locations: BTreeMap<ChannelId, [f64; 2]>,
    epochs: Vec<(String, EpochInfo)>,
    metadata: Option<Metadata>,
}

impl InMemoryRecording {
    /// Wraps a (frames, channels) array; channel ids default to `0..n`.
    pub fn new(traces: impl Into<DataArray>, sampling_frequency: f64) -> Self {
        let traces = traces.into();
        let num_channels = traces.shape().get(1).copied().unwrap_or(0);
        Self {
            traces,
            sampling_frequency,
            channel_ids: (0..num_channels as ChannelId).collect(),
            properties: BTreeMap::new(),
            gains: None,
            offsets: None,
            locations: BTreeMap::new(),
            epochs: Vec::new(),
            metadata: None,
        }
    }

    pub fn with_channel_ids(mut self, channel_ids: Vec<ChannelId>) -> Self {
        self.channel_ids = channel_ids;
        self
    }

    pub fn with_property(
        mut self,
        channel_id: ChannelId,
        name: &str,
        value: impl Into<CellValue>,
    ) -> Self {
        self.set_property(channel_id, name, value);
        self
    }

    pub fn set_property(&mut self, channel_id: ChannelId, name: &str, value: impl Into<CellValue>) {
        self.properties
            .entry(channel_id)
            .or_default()
            .insert(name.to_string(), value.into());
    }

    pub fn with_gains(mut self, gains: Vec<f64>) -> Result<Self> {
        check_channel_len("gains", &gains, self.channel_ids.len())?;
        self.gains = Some(gains);
        Ok(self)
    }

    pub fn with_offsets(mut self, offsets: Vec<f64>) -> Result<Self> {
        check_channel_len("offsets", &offsets, self.channel_ids.len())?;
        self.offsets = Some(offsets);
        Ok(self)
    }

    pub fn with_location(mut self, channel_id: ChannelId, location: [f64; 2]) -> Self {
        self.locations.insert(channel_id, location);
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

    pub fn with_nwb_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

impl Recording for InMemoryRecording {
    fn channel_ids(&self) -> Vec<ChannelId> {
        self.channel_ids.clone()
    }

    fn sampling_frequency(&self) -> f64 {
        self.sampling_frequency
    }

    fn num_frames(&self) -> usize {
        self.traces.shape().first().copied().unwrap_or(0)
    }

    fn dtype(&self) -> DType {
        self.traces.dtype()
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
        self.gains
            .clone()
            .unwrap_or_else(|| vec![1.0; self.channel_ids.len()])
    }

    fn channel_offsets(&self) -> Vec<f64> {
        self.offsets
            .clone()
            .unwrap_or_else(|| vec![0.0; self.channel_ids.len()])
    }

    fn channel_location(&self, channel_id: ChannelId) -> Option<[f64; 2]> {
        self.locations
            .get(&channel_id)
            .copied()
            .filter(|loc| loc.iter().all(|v| !v.is_nan()))
    }

    fn traces(
        &self,
        channel_ids: &[ChannelId],
        start_frame: usize,
        end_frame: usize,
        return_scaled: bool,
    ) -> Result<DataArray> {
        let columns = channel_columns(&self.channel_ids, channel_ids)?;
        let raw = self.traces.select_window(start_frame, end_frame, &columns)?;
        if !return_scaled {
            return Ok(raw);
        }
        let gains = select_columns("gains", &self.channel_gains(), &columns)?;
        let offsets = select_columns("offsets", &self.channel_offsets(), &columns)?;
        Ok(scale_traces(&raw, &gains, &offsets))
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

    fn nwb_metadata(&self) -> Option<Metadata> {
        self.metadata.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn traces_follow_requested_channel_order() {
        let recording = InMemoryRecording::new(array![[1i16, 2, 3], [4, 5, 6]], 100.0)
            .with_channel_ids(vec![10, 11, 12]);
        let traces = recording.traces(&[12, 10], 0, 2, false).unwrap();
        assert_eq!(traces, DataArray::from(array![[3i16, 1], [6, 4]]));
        assert!(matches!(
            recording.traces(&[99], 0, 2, false),
            Err(NwbError::ChannelNotFound(99))
        ));
    }

    #[test]
    fn scaled_traces_apply_gain_and_offset() {
        let recording = InMemoryRecording::new(array![[10u16, 20]], 100.0)
            .with_gains(vec![0.5, 2.0])
            .unwrap()
            .with_offsets(vec![-1.0, 0.0])
            .unwrap();
        let traces = recording.traces(&[0, 1], 0, 1, true).unwrap();
        assert_eq!(traces, DataArray::from(array![[4.0f32, 40.0]]));
    }

    #[test]
    fn calibration_needs_one_entry_per_channel() {
        let recording = InMemoryRecording::new(array![[1i16, 2, 3]], 100.0);
        assert!(matches!(
            recording.clone().with_gains(vec![0.195; 2]),
            Err(NwbError::InvalidArgument(_))
        ));
        assert!(matches!(
            recording.with_offsets(vec![0.0; 4]),
            Err(NwbError::InvalidArgument(_))
        ));
        assert!(matches!(
            select_columns("gains", &[1.0], &[0, 1]),
            Err(NwbError::InvalidArgument(_))
        ));
    }

    #[test]
    fn groups_are_read_from_properties() {
        let recording = InMemoryRecording::new(ndarray::Array2::<i16>::zeros((1, 3)), 100.0)
            .with_property(0, "group", 2i64)
            .with_property(1, "group", "1");
        assert_eq!(recording.channel_group(0), 2);
        assert_eq!(recording.channel_group(1), 1);
        assert_eq!(recording.channel_group(2), 0);
        assert_eq!(unique_channel_groups(&recording), vec![0, 1, 2]);
    }

    #[test]
    fn frame_to_time_uses_sampling_frequency() {
        let recording = InMemoryRecording::new(ndarray::Array2::<i16>::zeros((1, 1)), 250.0);
        assert_eq!(recording.frame_to_time(500), 2.0);
    }
}
