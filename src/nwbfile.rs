use chrono::{DateTime, FixedOffset, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::dataset::{Dataset, DatasetInfo};
use crate::error::{NwbError, Result};
use crate::metadata::{NwbFileMetadata, DEFAULT_SESSION_DESCRIPTION, DEFAULT_SESSION_START_TIME};
use crate::table::DynamicTable;
use crate::types::{nan_as_null, CellValue, ChannelId};

/// NWB schema version the object model follows.
pub const NWB_VERSION: &str = "2.2.5";

/// Columns every electrode table carries, with their descriptions.
pub const REQUIRED_ELECTRODE_COLUMNS: [(&str, &str); 8] = [
    ("x", "x coordinate of the channel location in the brain"),
    ("y", "y coordinate of the channel location in the brain"),
    ("z", "z coordinate of the channel location in the brain"),
    ("imp", "the impedance of the channel"),
    ("location", "the location of channel within the subject e.g. brain region"),
    ("filtering", "description of hardware filtering"),
    ("group", "a reference to the ElectrodeGroup this electrode is a part of"),
    ("group_name", "the name of the ElectrodeGroup this electrode is a part of"),
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub name: String,
    pub description: Option<String>,
    pub manufacturer: Option<String>,
}

/// A physical grouping of electrodes (a shank, a tetrode) on one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElectrodeGroup {
    pub name: String,
    pub description: String,
    pub location: String,
    /// Name of the owning device
    pub device: String,
}

/// A selection of rows of a table, referenced by a time series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableRegion {
    pub table: String,
    pub description: String,
    pub rows: Vec<usize>,
}

/// How the samples of a time series map onto time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Timing {
    Rate { starting_time: f64, rate: f64 },
    Timestamps(Dataset),
}

impl Timing {
    pub fn starting_time(&self) -> Option<f64> {
        match self {
            Timing::Rate { starting_time, .. } => Some(*starting_time),
            Timing::Timestamps(_) => None,
        }
    }

    pub fn rate(&self) -> Option<f64> {
        match self {
            Timing::Rate { rate, .. } => Some(*rate),
            Timing::Timestamps(_) => None,
        }
    }
}

/// Voltage traces of a set of electrodes, stored as (frames, channels).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElectricalSeries {
    pub name: String,
    pub description: String,
    pub comments: String,
    pub electrodes: TableRegion,
    pub data: Dataset,
    /// Multiplier converting stored values to volts
    pub conversion: f64,
    /// Per-channel multiplier applied before `conversion`
    pub channel_conversion: Option<Vec<f64>>,
    pub timing: Timing,
}

/// A movie, either stored inline or referencing external files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageSeries {
    pub name: String,
    pub description: String,
    pub unit: String,
    /// `raw` when frames are stored, `external` for external files
    pub format: String,
    pub data: Option<Dataset>,
    pub external_file: Option<Vec<String>>,
    pub starting_frame: Option<Vec<u64>>,
    pub timing: Timing,
}

impl ImageSeries {
    pub fn starting_time(&self) -> Option<f64> {
        self.timing.starting_time()
    }
}

/// Fluorescence traces of a set of ROIs, stored as (frames, rois).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoiResponseSeries {
    pub name: String,
    pub description: String,
    pub unit: String,
    pub rois: TableRegion,
    pub data: Dataset,
    pub timing: Timing,
}

/// ROI table of one imaging plane, with image masks stored as (rois, height, width).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaneSegmentation {
    pub name: String,
    pub description: String,
    pub imaging_plane: String,
    pub table: DynamicTable,
    pub image_mask: Dataset,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpticalChannel {
    pub name: String,
    pub description: String,
    #[serde(with = "nan_as_null")]
    pub emission_lambda: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImagingPlane {
    pub name: String,
    pub description: String,
    pub device: String,
    #[serde(with = "nan_as_null")]
    pub excitation_lambda: f64,
    pub indicator: String,
    pub location: String,
    #[serde(with = "nan_as_null")]
    pub imaging_rate: f64,
    pub optical_channels: Vec<OpticalChannel>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GrayscaleImage {
    pub name: String,
    pub data: Dataset,
}

/// A time series stored directly under `acquisition`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "neurodata_type")]
pub enum TimeSeries {
    ElectricalSeries(ElectricalSeries),
    ImageSeries(ImageSeries),
}

impl TimeSeries {
    pub fn name(&self) -> &str {
        match self {
            TimeSeries::ElectricalSeries(series) => &series.name,
            TimeSeries::ImageSeries(series) => &series.name,
        }
    }

    pub fn as_electrical_series(&self) -> Option<&ElectricalSeries> {
        match self {
            TimeSeries::ElectricalSeries(series) => Some(series),
            _ => None,
        }
    }

    pub fn as_image_series(&self) -> Option<&ImageSeries> {
        match self {
            TimeSeries::ImageSeries(series) => Some(series),
            _ => None,
        }
    }
}

/// A container held by a processing module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "neurodata_type")]
pub enum DataInterface {
    FilteredEphys {
        name: String,
        electrical_series: Vec<ElectricalSeries>,
    },
    #[serde(rename = "LFP")]
    Lfp {
        name: String,
        electrical_series: Vec<ElectricalSeries>,
    },
    ImageSeries(ImageSeries),
    ImageSegmentation {
        name: String,
        plane_segmentations: Vec<PlaneSegmentation>,
    },
    Fluorescence {
        name: String,
        roi_response_series: Vec<RoiResponseSeries>,
    },
    DfOverF {
        name: String,
        roi_response_series: Vec<RoiResponseSeries>,
    },
    Images {
        name: String,
        description: String,
        images: Vec<GrayscaleImage>,
    },
}

impl DataInterface {
    pub fn name(&self) -> &str {
        match self {
            DataInterface::FilteredEphys { name, .. }
            | DataInterface::Lfp { name, .. }
            | DataInterface::ImageSegmentation { name, .. }
            | DataInterface::Fluorescence { name, .. }
            | DataInterface::DfOverF { name, .. }
            | DataInterface::Images { name, .. } => name,
            DataInterface::ImageSeries(series) => &series.name,
        }
    }

    pub fn electrical_series(&self) -> Option<&[ElectricalSeries]> {
        match self {
            DataInterface::FilteredEphys {
                electrical_series, ..
            }
            | DataInterface::Lfp {
                electrical_series, ..
            } => Some(electrical_series),
            _ => None,
        }
    }

    pub fn electrical_series_mut(&mut self) -> Option<&mut Vec<ElectricalSeries>> {
        match self {
            DataInterface::FilteredEphys {
                electrical_series, ..
            }
            | DataInterface::Lfp {
                electrical_series, ..
            } => Some(electrical_series),
            _ => None,
        }
    }

    pub fn roi_response_series(&self) -> Option<&[RoiResponseSeries]> {
        match self {
            DataInterface::Fluorescence {
                roi_response_series,
                ..
            }
            | DataInterface::DfOverF {
                roi_response_series,
                ..
            } => Some(roi_response_series),
            _ => None,
        }
    }

    pub fn roi_response_series_mut(&mut self) -> Option<&mut Vec<RoiResponseSeries>> {
        match self {
            DataInterface::Fluorescence {
                roi_response_series,
                ..
            }
            | DataInterface::DfOverF {
                roi_response_series,
                ..
            } => Some(roi_response_series),
            _ => None,
        }
    }

    pub fn plane_segmentations(&self) -> Option<&[PlaneSegmentation]> {
        match self {
            DataInterface::ImageSegmentation {
                plane_segmentations,
                ..
            } => Some(plane_segmentations),
            _ => None,
        }
    }
}

/// A named group of processed data interfaces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingModule {
    pub name: String,
    pub description: String,
    pub data_interfaces: Vec<DataInterface>,
}

impl ProcessingModule {
    pub fn new(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            data_interfaces: Vec::new(),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<&DataInterface> {
        self.data_interfaces.iter().find(|i| i.name() == name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut DataInterface> {
        self.data_interfaces.iter_mut().find(|i| i.name() == name)
    }

    pub fn add(&mut self, interface: DataInterface) -> Result<()> {
        if self.contains(interface.name()) {
            return Err(NwbError::DuplicateName {
                kind: "Data interface",
                name: interface.name().to_string(),
            });
        }
        self.data_interfaces.push(interface);
        Ok(())
    }
}

/// One row of the epoch table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Epoch {
    pub id: i64,
    pub start_time: f64,
    pub stop_time: f64,
    pub tags: Vec<String>,
}

/// Interval table keyed by tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeIntervals {
    pub name: String,
    pub description: String,
    pub rows: Vec<Epoch>,
}

impl TimeIntervals {
    pub fn new(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            rows: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// First row whose tags are exactly `[tag]`.
    pub fn find_tag_mut(&mut self, tag: &str) -> Option<&mut Epoch> {
        self.rows
            .iter_mut()
            .find(|row| row.tags.len() == 1 && row.tags[0] == tag)
    }

    pub fn find_tag(&self, tag: &str) -> Option<&Epoch> {
        self.rows
            .iter()
            .find(|row| row.tags.len() == 1 && row.tags[0] == tag)
    }
}

/// In-memory NWB file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NwbFile {
    pub nwb_version: String,
    pub session_description: String,
    pub identifier: String,
    pub session_start_time: DateTime<FixedOffset>,
    pub file_create_date: DateTime<Utc>,
    pub experimenter: Option<Vec<String>>,
    pub institution: Option<String>,
    pub lab: Option<String>,
    pub experiment_description: Option<String>,
    pub session_id: Option<String>,
    pub devices: Vec<Device>,
    pub electrode_groups: Vec<ElectrodeGroup>,
    pub electrodes: Option<DynamicTable>,
    pub acquisition: Vec<TimeSeries>,
    pub processing: Vec<ProcessingModule>,
    pub imaging_planes: Vec<ImagingPlane>,
    pub epochs: Option<TimeIntervals>,
}

/// Parses an ISO 8601 timestamp; a missing offset is read as UTC.
pub fn parse_session_start_time(text: &str) -> Result<DateTime<FixedOffset>> {
    if let Ok(with_offset) = DateTime::parse_from_rfc3339(text) {
        return Ok(with_offset);
    }
    let naive = NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f"))?;
    Ok(naive.and_utc().fixed_offset())
}

impl NwbFile {
    /// Creates an empty file, defaulting every field the metadata leaves out.
    pub fn new(metadata: &NwbFileMetadata) -> Result<Self> {
        let start_time = metadata
            .session_start_time
            .as_deref()
            .unwrap_or(DEFAULT_SESSION_START_TIME);
        Ok(Self {
            nwb_version: NWB_VERSION.to_string(),
            session_description: metadata
                .session_description
                .clone()
                .unwrap_or_else(|| DEFAULT_SESSION_DESCRIPTION.to_string()),
            identifier: metadata
                .identifier
                .clone()
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            session_start_time: parse_session_start_time(start_time)?,
            file_create_date: Utc::now(),
            experimenter: metadata.experimenter.clone(),
            institution: metadata.institution.clone(),
            lab: metadata.lab.clone(),
            experiment_description: metadata.experiment_description.clone(),
            session_id: metadata.session_id.clone(),
            devices: Vec::new(),
            electrode_groups: Vec::new(),
            electrodes: None,
            acquisition: Vec::new(),
            processing: Vec::new(),
            imaging_planes: Vec::new(),
            epochs: None,
        })
    }

    // Devices

    pub fn device(&self, name: &str) -> Option<&Device> {
        self.devices.iter().find(|d| d.name == name)
    }

    pub fn create_device(&mut self, device: Device) -> Result<()> {
        if self.device(&device.name).is_some() {
            return Err(NwbError::DuplicateName {
                kind: "Device",
                name: device.name,
            });
        }
        self.devices.push(device);
        Ok(())
    }

    // Electrode groups

    pub fn electrode_group(&self, name: &str) -> Option<&ElectrodeGroup> {
        self.electrode_groups.iter().find(|g| g.name == name)
    }

    pub fn create_electrode_group(&mut self, group: ElectrodeGroup) -> Result<()> {
        if self.electrode_group(&group.name).is_some() {
            return Err(NwbError::DuplicateName {
                kind: "ElectrodeGroup",
                name: group.name,
            });
        }
        if self.device(&group.device).is_none() {
            return Err(NwbError::NotFound {
                kind: "Device",
                name: group.device,
            });
        }
        self.electrode_groups.push(group);
        Ok(())
    }

    // Electrodes

    /// Electrode table, created with its required columns on first use.
    pub fn electrodes_mut(&mut self) -> &mut DynamicTable {
        self.electrodes.get_or_insert_with(|| {
            let mut table = DynamicTable::new("electrodes", "metadata about extracellular electrodes");
            for (name, description) in REQUIRED_ELECTRODE_COLUMNS {
                let fill = match name {
                    "x" | "y" | "z" | "imp" => CellValue::Float(f64::NAN),
                    _ => CellValue::Text(String::new()),
                };
                table.columns.push(crate::table::VectorData {
                    name: name.to_string(),
                    description: description.to_string(),
                    data: Vec::new(),
                    fill,
                });
            }
            table
        })
    }

    /// Ids of the electrode table rows, in row order.
    pub fn electrode_ids(&self) -> Vec<ChannelId> {
        self.electrodes
            .as_ref()
            .map(|t| t.id.clone())
            .unwrap_or_default()
    }

    /// Adds a custom electrode column if it is not present yet.
    pub fn add_electrode_column(&mut self, name: &str, description: &str, fill: CellValue) -> Result<()> {
        let table = self.electrodes_mut();
        if table.contains_column(name) {
            return Ok(());
        }
        table.add_empty_column(name, description, fill)
    }

    /// Appends an electrode row. `group_name` must name an existing group.
    pub fn add_electrode(&mut self, id: ChannelId, mut values: BTreeMap<String, CellValue>) -> Result<()> {
        let group_name = match values.get("group_name") {
            Some(CellValue::Text(name)) => name.clone(),
            Some(other) => other.to_string(),
            None => {
                return Err(NwbError::InvalidArgument(format!(
                    "electrode {} has no electrode group",
                    id
                )))
            }
        };
        if self.electrode_group(&group_name).is_none() {
            return Err(NwbError::NotFound {
                kind: "ElectrodeGroup",
                name: group_name,
            });
        }
        values.insert("group".to_string(), CellValue::Text(group_name.clone()));
        values.insert("group_name".to_string(), CellValue::Text(group_name));
        self.electrodes_mut().add_row(id, values)
    }

    /// Row indices of `channel_ids` in the electrode table.
    pub fn create_electrode_table_region(
        &self,
        channel_ids: &[ChannelId],
        description: &str,
    ) -> Result<TableRegion> {
        let table = self.electrodes.as_ref().ok_or(NwbError::EmptyElectrodeTable)?;
        let rows = channel_ids
            .iter()
            .map(|&id| table.row_index(id).ok_or(NwbError::ChannelNotFound(id)))
            .collect::<Result<Vec<_>>>()?;
        Ok(TableRegion {
            table: table.name.clone(),
            description: description.to_string(),
            rows,
        })
    }

    // Acquisition

    pub fn get_acquisition(&self, name: &str) -> Option<&TimeSeries> {
        self.acquisition.iter().find(|s| s.name() == name)
    }

    pub fn add_acquisition(&mut self, series: TimeSeries) -> Result<()> {
        if self.get_acquisition(series.name()).is_some() {
            return Err(NwbError::DuplicateName {
                kind: "Acquisition",
                name: series.name().to_string(),
            });
        }
        self.acquisition.push(series);
        Ok(())
    }

    // Processing modules

    pub fn processing_module(&self, name: &str) -> Option<&ProcessingModule> {
        self.processing.iter().find(|m| m.name == name)
    }

    pub fn processing_module_mut(&mut self, name: &str) -> Option<&mut ProcessingModule> {
        self.processing.iter_mut().find(|m| m.name == name)
    }

    pub fn create_processing_module(&mut self, name: &str, description: &str) -> Result<&mut ProcessingModule> {
        if self.processing_module(name).is_some() {
            return Err(NwbError::DuplicateName {
                kind: "ProcessingModule",
                name: name.to_string(),
            });
        }
        self.processing.push(ProcessingModule::new(name, description));
        let index = self.processing.len() - 1;
        Ok(&mut self.processing[index])
    }

    /// Returns the processing module `name`, creating it if needed.
    ///
    /// A new module is described by `description`, or by its name.
    pub fn check_module(&mut self, name: &str, description: Option<&str>) -> &mut ProcessingModule {
        let index = match self.processing.iter().position(|m| m.name == name) {
            Some(index) => index,
            None => {
                self.processing
                    .push(ProcessingModule::new(name, description.unwrap_or(name)));
                self.processing.len() - 1
            }
        };
        &mut self.processing[index]
    }

    // Imaging planes

    pub fn imaging_plane(&self, name: &str) -> Option<&ImagingPlane> {
        self.imaging_planes.iter().find(|p| p.name == name)
    }

    pub fn add_imaging_plane(&mut self, plane: ImagingPlane) -> Result<()> {
        if self.imaging_plane(&plane.name).is_some() {
            return Err(NwbError::DuplicateName {
                kind: "ImagingPlane",
                name: plane.name,
            });
        }
        if self.device(&plane.device).is_none() {
            return Err(NwbError::NotFound {
                kind: "Device",
                name: plane.device,
            });
        }
        self.imaging_planes.push(plane);
        Ok(())
    }

    // Epochs

    pub fn add_epoch(&mut self, start_time: f64, stop_time: f64, tags: Vec<String>) -> Result<()> {
        if stop_time < start_time {
            return Err(NwbError::InvalidArgument(format!(
                "epoch stop time {} precedes start time {}",
                stop_time, start_time
            )));
        }
        let epochs = self
            .epochs
            .get_or_insert_with(|| TimeIntervals::new("epochs", "experimental epochs"));
        let id = epochs.rows.len() as i64;
        epochs.rows.push(Epoch {
            id,
            start_time,
            stop_time,
            tags,
        });
        Ok(())
    }

    /// Every dataset in the file with its path.
    pub fn dataset_infos(&self) -> Vec<DatasetInfo> {
        let mut infos = Vec::new();
        let push_timing = |infos: &mut Vec<DatasetInfo>, path: &str, timing: &Timing| {
            if let Timing::Timestamps(dataset) = timing {
                infos.push(dataset.info(&format!("{}/timestamps", path)));
            }
        };

        for series in &self.acquisition {
            let path = format!("acquisition/{}", series.name());
            match series {
                TimeSeries::ElectricalSeries(es) => {
                    infos.push(es.data.info(&format!("{}/data", path)));
                    push_timing(&mut infos, &path, &es.timing);
                }
                TimeSeries::ImageSeries(is) => {
                    if let Some(data) = &is.data {
                        infos.push(data.info(&format!("{}/data", path)));
                    }
                    push_timing(&mut infos, &path, &is.timing);
                }
            }
        }

        for module in &self.processing {
            for interface in &module.data_interfaces {
                let base = format!("processing/{}/{}", module.name, interface.name());
                match interface {
                    DataInterface::FilteredEphys {
                        electrical_series, ..
                    }
                    | DataInterface::Lfp {
                        electrical_series, ..
                    } => {
                        for es in electrical_series {
                            let path = format!("{}/{}", base, es.name);
                            infos.push(es.data.info(&format!("{}/data", path)));
                            push_timing(&mut infos, &path, &es.timing);
                        }
                    }
                    DataInterface::ImageSeries(is) => {
                        if let Some(data) = &is.data {
                            infos.push(data.info(&format!("{}/data", base)));
                        }
                        push_timing(&mut infos, &base, &is.timing);
                    }
                    DataInterface::ImageSegmentation {
                        plane_segmentations,
                        ..
                    } => {
                        for ps in plane_segmentations {
                            infos.push(ps.image_mask.info(&format!("{}/{}/image_mask", base, ps.name)));
                        }
                    }
                    DataInterface::Fluorescence {
                        roi_response_series,
                        ..
                    }
                    | DataInterface::DfOverF {
                        roi_response_series,
                        ..
                    } => {
                        for rrs in roi_response_series {
                            let path = format!("{}/{}", base, rrs.name);
                            infos.push(rrs.data.info(&format!("{}/data", path)));
                            push_timing(&mut infos, &path, &rrs.timing);
                        }
                    }
                    DataInterface::Images { images, .. } => {
                        for image in images {
                            infos.push(image.data.info(&format!("{}/{}", base, image.name)));
                        }
                    }
                }
            }
        }
        infos
    }
}
