//! Builders that add extracellular electrophysiology to an [`NwbFile`].
//!
//! Every builder is idempotent with respect to names: objects that already
//! exist in the file are reused, never duplicated. Inconsistent metadata that
//! can be repaired (a group pointing at a missing device, a channel without a
//! group) is repaired with a warning.

use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{info, warn};

use crate::dataset::{Compression, Dataset};
use crate::error::{NwbError, Result};
use crate::iterator::{write_dataset, DataChunkIterator};
use crate::metadata::{
    DeviceMetadata, ElectricalSeriesMetadata, ElectrodeColumnMetadata, ElectrodeGroupMetadata,
    Metadata, ECEPHYS,
};
use crate::nwbfile::{
    DataInterface, Device, ElectricalSeries, ElectrodeGroup, NwbFile, TimeSeries, Timing,
};
use crate::recording::{check_channel_len, unique_channel_groups, Recording};
use crate::types::{CellValue, ChannelId};

pub const DEFAULT_DEVICE_NAME: &str = "Device";
pub const DEFAULT_DEVICE_DESCRIPTION: &str = "Ecephys probe.";
pub const ECEPHYS_MODULE: &str = "ecephys";
pub const ECEPHYS_MODULE_DESCRIPTION: &str =
    "Intermediate data from extracellular electrophysiology recordings, e.g., LFP.";
const SERIES_COMMENTS: &str = "Generated from SpikeInterface::NwbRecordingExtractor";

/// Channel properties that never become electrode columns.
const EXCLUDED_PROPERTIES: [&str; 4] = ["gain", "offset", "location", "name"];

/// Where an electrical series is placed in the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteAs {
    /// `acquisition`
    #[default]
    Raw,
    /// `processing/ecephys/Processed`
    Processed,
    /// `processing/ecephys/LFP`
    Lfp,
}

impl WriteAs {
    fn default_name(self) -> &'static str {
        match self {
            WriteAs::Raw => "ElectricalSeries_raw",
            WriteAs::Processed => "ElectricalSeries_processed",
            WriteAs::Lfp => "ElectricalSeries_lfp",
        }
    }

    fn default_description(self) -> &'static str {
        match self {
            WriteAs::Raw => "Raw acquired data",
            WriteAs::Processed => "Processed data",
            WriteAs::Lfp => "Processed data - LFP",
        }
    }

    fn interface_name(self) -> Option<&'static str> {
        match self {
            WriteAs::Raw => None,
            WriteAs::Processed => Some("Processed"),
            WriteAs::Lfp => Some("LFP"),
        }
    }

    fn kind(self) -> &'static str {
        match self {
            WriteAs::Raw => "Raw ElectricalSeries",
            WriteAs::Processed => "Processed ElectricalSeries",
            WriteAs::Lfp => "LFP ElectricalSeries",
        }
    }
}

/// Options controlling how a recording is written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriteOptions {
    /// Memory budget of one buffered read, in megabytes
    pub buffer_mb: usize,
    /// Store explicit timestamps instead of a starting time and rate
    pub use_times: bool,
    pub write_as: WriteAs,
    /// Key under `Ecephys` holding overrides for the series
    pub es_key: Option<String>,
    /// Write traces in microvolts as float32
    pub write_scaled: bool,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            buffer_mb: 500,
            use_times: false,
            write_as: WriteAs::Raw,
            es_key: None,
            write_scaled: false,
        }
    }
}

fn default_device(name: &str) -> Device {
    Device {
        name: name.to_string(),
        description: Some(DEFAULT_DEVICE_DESCRIPTION.to_string()),
        manufacturer: None,
    }
}

/// Adds the devices listed in `Ecephys.Device`, or a default probe.
pub fn add_devices(nwbfile: &mut NwbFile, metadata: &Metadata) -> Result<()> {
    let entries = metadata
        .entries::<DeviceMetadata>(ECEPHYS, "Device")?
        .unwrap_or_else(|| vec![DeviceMetadata::default()]);

    for entry in entries {
        let name = entry
            .name
            .unwrap_or_else(|| DEFAULT_DEVICE_NAME.to_string());
        if nwbfile.device(&name).is_some() {
            continue;
        }
        nwbfile.create_device(Device {
            name,
            description: Some(
                entry
                    .description
                    .unwrap_or_else(|| DEFAULT_DEVICE_DESCRIPTION.to_string()),
            ),
            manufacturer: entry.manufacturer,
        })?;
    }
    Ok(())
}

/// Adds the groups listed in `Ecephys.ElectrodeGroup`.
///
/// Without that key one group is created per channel group of the
/// recording. Groups attach to the first device unless they name another.
pub fn add_electrode_groups(
    recording: &dyn Recording,
    nwbfile: &mut NwbFile,
    metadata: &Metadata,
) -> Result<()> {
    if nwbfile.devices.is_empty() {
        add_devices(nwbfile, &Metadata::new())?;
    }
    let first_device = nwbfile.devices[0].name.clone();
    let channel_groups = unique_channel_groups(recording);
    let default_name = channel_groups
        .first()
        .map(|g| g.to_string())
        .unwrap_or_else(|| "0".to_string());

    let entries = match metadata.entries::<ElectrodeGroupMetadata>(ECEPHYS, "ElectrodeGroup")? {
        Some(entries) => entries,
        None => channel_groups
            .iter()
            .map(|group| ElectrodeGroupMetadata {
                name: Some(group.to_string()),
                ..Default::default()
            })
            .collect(),
    };

    for entry in entries {
        let name = entry.name.unwrap_or_else(|| default_name.clone());
        if nwbfile.electrode_group(&name).is_some() {
            continue;
        }
        let device = entry.device.unwrap_or_else(|| first_device.clone());
        if nwbfile.device(&device).is_none() {
            warn!(
                device = %device,
                "Device not detected in attempted link to electrode group! Automatically generating."
            );
            nwbfile.create_device(default_device(&device))?;
        }
        nwbfile.create_electrode_group(ElectrodeGroup {
            name,
            description: entry
                .description
                .unwrap_or_else(|| "no description".to_string()),
            location: entry.location.unwrap_or_else(|| "unknown".to_string()),
            device,
        })?;
    }

    if nwbfile.electrode_groups.is_empty() {
        if nwbfile.devices.len() > 1 {
            warn!(
                device = %first_device,
                "More than one device found when adding electrode group via channel properties; \
                 pass the device in the metadata to use another one."
            );
        }
        for group in channel_groups {
            nwbfile.create_electrode_group(ElectrodeGroup {
                name: group.to_string(),
                description: "no description".to_string(),
                location: "unknown".to_string(),
                device: first_device.clone(),
            })?;
        }
    }
    Ok(())
}

/// Default value of each built-in electrode column.
fn electrode_defaults() -> BTreeMap<String, CellValue> {
    BTreeMap::from([
        ("x".to_string(), CellValue::Float(f64::NAN)),
        ("y".to_string(), CellValue::Float(f64::NAN)),
        ("z".to_string(), CellValue::Float(f64::NAN)),
        ("imp".to_string(), CellValue::Float(-1.0)),
        ("location".to_string(), CellValue::from("unknown")),
        ("filtering".to_string(), CellValue::from("none")),
        ("group_name".to_string(), CellValue::from("0")),
    ])
}

struct ElectrodeColumn {
    description: String,
    data: Option<Vec<CellValue>>,
}

fn cell_text(value: &CellValue) -> String {
    match value {
        CellValue::Float(v) if v.fract() == 0.0 => format!("{}", *v as i64),
        other => other.to_string(),
    }
}

/// Creates electrode group `name` on the default device, adding the device if needed.
fn synthesise_electrode_group(nwbfile: &mut NwbFile, name: &str) -> Result<()> {
    if nwbfile.device(DEFAULT_DEVICE_NAME).is_none() {
        warn!(
            device = DEFAULT_DEVICE_NAME,
            "Device not detected in attempted link to electrode group! Automatically generating."
        );
        nwbfile.create_device(default_device(DEFAULT_DEVICE_NAME))?;
    }
    nwbfile.create_electrode_group(ElectrodeGroup {
        name: name.to_string(),
        description: "no description".to_string(),
        location: "unknown".to_string(),
        device: DEFAULT_DEVICE_NAME.to_string(),
    })
}

/// Adds one electrode row per recording channel not yet in the table.
///
/// Channel properties become columns (minus `exclude` and the scaling
/// properties) and `Ecephys.Electrodes` entries add or override columns.
pub fn add_electrodes(
    recording: &dyn Recording,
    nwbfile: &mut NwbFile,
    metadata: &Metadata,
    exclude: &[&str],
) -> Result<()> {
    if nwbfile.electrode_groups.is_empty() {
        add_electrode_groups(recording, nwbfile, metadata)?;
    }

    let metadata_columns = metadata
        .entries::<ElectrodeColumnMetadata>(ECEPHYS, "Electrodes")?
        .unwrap_or_default();
    if metadata_columns.iter().any(|c| c.name == "group") {
        return Err(NwbError::InvalidMetadata(
            "Passing metadata field 'group' is deprecated; pass group_name instead!".to_string(),
        ));
    }
    let group_name_from_metadata = metadata_columns.iter().any(|c| c.name == "group_name");

    let channel_ids = recording.channel_ids();
    let num_channels = channel_ids.len();
    let existing_ids = nwbfile.electrode_ids();
    let defaults = electrode_defaults();

    let property_names: BTreeSet<String> = channel_ids
        .iter()
        .flat_map(|&id| recording.channel_property_names(id))
        .collect();

    let mut columns: BTreeMap<String, ElectrodeColumn> = BTreeMap::new();
    for property in property_names {
        if EXCLUDED_PROPERTIES.contains(&property.as_str()) || exclude.contains(&property.as_str()) {
            continue;
        }
        let values: Vec<Option<CellValue>> = channel_ids
            .iter()
            .map(|&id| recording.channel_property(id, &property))
            .collect();
        let fill = values
            .iter()
            .flatten()
            .next()
            .map(CellValue::fill_for)
            .unwrap_or(CellValue::Float(f64::NAN));
        let data = values
            .into_iter()
            .map(|v| v.unwrap_or_else(|| fill.clone()))
            .collect();

        let name = match property.as_str() {
            "brain_area" => "location".to_string(),
            "group" => "group_name".to_string(),
            _ => property,
        };
        columns.insert(
            name.clone(),
            ElectrodeColumn {
                description: name,
                data: Some(data),
            },
        );
    }

    for entry in metadata_columns {
        if !entry.data.is_empty() && entry.data.len() != num_channels {
            return Err(NwbError::InvalidMetadata(format!(
                "electrode column '{}' has {} values for {} channels",
                entry.name,
                entry.data.len(),
                num_channels
            )));
        }
        let column = columns.entry(entry.name).or_insert(ElectrodeColumn {
            description: String::new(),
            data: None,
        });
        column.description = entry.description;
        if !entry.data.is_empty() {
            column.data = Some(entry.data);
        }
    }

    for (name, column) in &columns {
        if column.data.is_none() && !defaults.contains_key(name) {
            return Err(NwbError::MissingColumnData(name.clone()));
        }
    }
    for (name, column) in &columns {
        if defaults.contains_key(name) {
            continue;
        }
        let fill = column
            .data
            .as_ref()
            .and_then(|data| data.iter().find(|v| !v.is_missing()))
            .map(CellValue::fill_for)
            .unwrap_or(CellValue::Float(f64::NAN));
        nwbfile.add_electrode_column(name, &column.description, fill)?;
    }

    let locations: Vec<Option<[f64; 2]>> = channel_ids
        .iter()
        .map(|&id| recording.channel_location(id).filter(|loc| loc.iter().all(|v| !v.is_nan())))
        .collect();
    if locations.iter().any(Option::is_some) {
        nwbfile.add_electrode_column(
            "rel_x",
            "x position of electrode in electrode group",
            CellValue::Float(f64::NAN),
        )?;
        nwbfile.add_electrode_column(
            "rel_y",
            "y position of electrode in electrode group",
            CellValue::Float(f64::NAN),
        )?;
    }

    for (index, &channel_id) in channel_ids.iter().enumerate() {
        if existing_ids.contains(&channel_id) {
            continue;
        }
        let mut row = defaults.clone();
        if let Some([rel_x, rel_y]) = locations[index] {
            row.insert("rel_x".to_string(), CellValue::Float(rel_x));
            row.insert("rel_y".to_string(), CellValue::Float(rel_y));
        }

        for (name, column) in &columns {
            let Some(data) = &column.data else {
                continue;
            };
            if name == "group_name" {
                if !group_name_from_metadata {
                    continue;
                }
                let group_name = cell_text(&data[index]);
                if nwbfile.electrode_group(&group_name).is_none() {
                    warn!(
                        channel_id,
                        group = %group_name,
                        "Electrode group for electrode was not found in the nwbfile! Automatically adding."
                    );
                    synthesise_electrode_group(nwbfile, &group_name)?;
                }
                row.insert(name.clone(), CellValue::Text(group_name));
            } else {
                row.insert(name.clone(), data[index].clone());
            }
        }

        if !group_name_from_metadata {
            let group_name = recording.channel_group(channel_id).to_string();
            if nwbfile.electrode_group(&group_name).is_none()
                && recording.channel_property(channel_id, "group").is_some()
            {
                warn!(
                    channel_id,
                    group = %group_name,
                    "Electrode group for electrode was not found in the nwbfile! Automatically adding."
                );
                synthesise_electrode_group(nwbfile, &group_name)?;
            } else if nwbfile.electrode_group(&group_name).is_none() {
                warn!(
                    channel_id,
                    group = %group_name,
                    "No metadata was passed specifying the electrode group for electrode, and its \
                     recording channel group is not present as an electrode group in the NWBFile! \
                     Electrode will not be added."
                );
                continue;
            }
            row.insert("group_name".to_string(), CellValue::Text(group_name));
        }

        nwbfile.add_electrode(channel_id, row)?;
    }

    match &nwbfile.electrodes {
        Some(table) if !table.is_empty() => Ok(()),
        _ => Err(NwbError::EmptyElectrodeTable),
    }
}

/// Offset of each channel expressed in gain units.
///
/// Fails unless every offset is a whole multiple of its gain.
fn unsigned_coercions(gains: &[f64], offsets: &[f64]) -> Result<Vec<i64>> {
    let coercions = gains
        .iter()
        .zip(offsets)
        .map(|(&gain, &offset)| {
            let ratio = offset / gain;
            if ratio.is_finite() && ratio.fract() == 0.0 {
                Ok(ratio as i64)
            } else {
                Err(NwbError::OffsetCoercion)
            }
        })
        .collect::<Result<Vec<_>>>()?;
    if coercions.iter().any(|&c| c != 0) {
        warn!(
            "NWB Schema v2.2.5 does not officially support channel offsets. The data will be \
             converted to a signed type that does not use offsets."
        );
    }
    Ok(coercions)
}

/// Adds the traces of `recording` as an electrical series.
///
/// The electrode table is filled first if it is empty. Traces are copied in
/// chunks and stored gzip compressed.
pub fn add_electrical_series(
    recording: &dyn Recording,
    nwbfile: &mut NwbFile,
    metadata: &Metadata,
    options: &WriteOptions,
) -> Result<()> {
    if options.buffer_mb <= 10 {
        return Err(NwbError::InvalidArgument(
            "'buffer_mb' should be at least 10MB to ensure data can be chunked!".to_string(),
        ));
    }
    if nwbfile.electrodes.as_ref().map_or(true, |t| t.is_empty()) {
        add_electrodes(recording, nwbfile, metadata, &[])?;
    }

    let write_as = options.write_as;
    let mut overrides = ElectricalSeriesMetadata::default();
    if let Some(key) = &options.es_key {
        if metadata.section(ECEPHYS).is_some() {
            overrides = metadata
                .entry::<ElectricalSeriesMetadata>(ECEPHYS, key)?
                .ok_or_else(|| NwbError::MissingMetadataKey {
                    section: ECEPHYS.to_string(),
                    key: key.clone(),
                })?;
        }
    }
    let name = overrides
        .name
        .unwrap_or_else(|| write_as.default_name().to_string());

    let name_taken = match write_as.interface_name() {
        None => nwbfile.get_acquisition(&name).is_some(),
        Some(interface) => nwbfile
            .processing_module(ECEPHYS_MODULE)
            .and_then(|m| m.get(interface))
            .and_then(DataInterface::electrical_series)
            .map_or(false, |series| series.iter().any(|s| s.name == name)),
    };
    if name_taken {
        return Err(NwbError::DuplicateName {
            kind: write_as.kind(),
            name,
        });
    }

    let channel_ids: Vec<ChannelId> = recording.channel_ids();
    let electrodes = nwbfile.create_electrode_table_region(&channel_ids, "electrode_table_region")?;

    let gains = recording.channel_gains();
    let offsets = recording.channel_offsets();
    check_channel_len("gains", &gains, channel_ids.len())?;
    check_channel_len("offsets", &offsets, channel_ids.len())?;
    let coercions = if options.write_scaled {
        vec![0; gains.len()]
    } else {
        unsigned_coercions(&gains, &offsets)?
    };
    let (conversion, channel_conversion) = if options.write_scaled {
        (1e-6, None)
    } else if gains.windows(2).all(|pair| pair[0] == pair[1]) {
        (gains.first().copied().unwrap_or(1.0) * 1e-6, None)
    } else {
        (1e-6, Some(gains.clone()))
    };

    info!(name = %name, channels = channel_ids.len(), frames = recording.num_frames(), "writing electrical series");
    let iterator = if recording.is_memory_mapped() && offsets.iter().all(|&o| o == 0.0) {
        let frame_bytes = (channel_ids.len() * recording.dtype().itemsize()).max(1);
        let buffer_frames = options.buffer_mb * 1_000_000 / frame_bytes;
        DataChunkIterator::buffered(recording, channel_ids, buffer_frames, options.write_scaled)
    } else {
        DataChunkIterator::per_channel(recording, channel_ids, coercions, options.write_scaled)
    };
    let data = write_dataset(iterator, Some(Compression::default()))?;

    let timing = if options.use_times {
        let times: Array1<f64> = (0..recording.num_frames())
            .map(|frame| recording.frame_to_time(frame as i64))
            .collect();
        Timing::Timestamps(Dataset::new(times).with_compression(Compression::default()))
    } else {
        Timing::Rate {
            starting_time: recording.frame_to_time(0),
            rate: recording.sampling_frequency(),
        }
    };

    let series = ElectricalSeries {
        name,
        description: overrides
            .description
            .unwrap_or_else(|| write_as.default_description().to_string()),
        comments: overrides
            .comments
            .unwrap_or_else(|| SERIES_COMMENTS.to_string()),
        electrodes,
        data,
        conversion,
        channel_conversion,
        timing,
    };

    match write_as.interface_name() {
        None => nwbfile.add_acquisition(TimeSeries::ElectricalSeries(series)),
        Some(interface_name) => {
            let module = nwbfile.check_module(ECEPHYS_MODULE, Some(ECEPHYS_MODULE_DESCRIPTION));
            if !module.contains(interface_name) {
                let interface = match write_as {
                    WriteAs::Lfp => DataInterface::Lfp {
                        name: interface_name.to_string(),
                        electrical_series: Vec::new(),
                    },
                    _ => DataInterface::FilteredEphys {
                        name: interface_name.to_string(),
                        electrical_series: Vec::new(),
                    },
                };
                module.add(interface)?;
            }
            let container = module
                .get_mut(interface_name)
                .and_then(DataInterface::electrical_series_mut)
                .ok_or_else(|| NwbError::NotFound {
                    kind: "Data interface",
                    name: interface_name.to_string(),
                })?;
            container.push(series);
            Ok(())
        }
    }
}

/// Adds or updates one epoch per named epoch of the recording.
///
/// An epoch whose tag already exists has its times overwritten. The epoch
/// that creates the table stops at its last frame rather than at
/// `end_frame`.
pub fn add_epochs(recording: &dyn Recording, nwbfile: &mut NwbFile) -> Result<()> {
    for epoch_name in recording.epoch_names() {
        let Some(epoch) = recording.epoch_info(&epoch_name) else {
            continue;
        };
        let start_time = recording.frame_to_time(epoch.start_frame);
        let stop_frame = if nwbfile.epochs.is_none() {
            (epoch.end_frame - 1).max(epoch.start_frame)
        } else {
            epoch.end_frame
        };
        let stop_time = recording.frame_to_time(stop_frame);

        let existing = nwbfile
            .epochs
            .as_mut()
            .and_then(|epochs| epochs.find_tag_mut(&epoch_name));
        match existing {
            Some(row) => {
                row.start_time = start_time;
                row.stop_time = stop_time;
            }
            None => nwbfile.add_epoch(start_time, stop_time, vec![epoch_name])?,
        }
    }
    Ok(())
}

/// Adds devices, groups, electrodes, traces and epochs of `recording`.
pub fn add_all_to_nwbfile(
    recording: &dyn Recording,
    nwbfile: &mut NwbFile,
    metadata: &Metadata,
    options: &WriteOptions,
) -> Result<()> {
    add_devices(nwbfile, metadata)?;
    add_electrode_groups(recording, nwbfile, metadata)?;
    add_electrodes(recording, nwbfile, metadata, &[])?;
    add_electrical_series(recording, nwbfile, metadata, options)?;
    add_epochs(recording, nwbfile)
}
