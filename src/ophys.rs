//! Calcium-imaging segmentation: imaging planes, ROI tables, fluorescence
//! traces and summary images.

use ndarray::{Array2, Array3, Axis};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

use crate::dataset::{Compression, Dataset};
use crate::error::{NwbError, Result};
use crate::metadata::{
    DeviceMetadata, ImagingPlaneMetadata, Metadata, NamedEntryMetadata, OPHYS,
};
use crate::nwbfile::{
    DataInterface, Device, GrayscaleImage, ImagingPlane, NwbFile, OpticalChannel, PlaneSegmentation,
    RoiResponseSeries, TableRegion, Timing,
};
use crate::table::DynamicTable;
use crate::types::CellValue;

pub const OPHYS_MODULE: &str = "ophys";
pub const OPHYS_MODULE_DESCRIPTION: &str = "contains optical physiology processed data";
const SUMMARY_IMAGES: &str = "SegmentationImages";

/// Kind of ROI response trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceKind {
    Raw,
    Dff,
    Neuropil,
    Deconvolved,
}

impl TraceKind {
    pub const ALL: [TraceKind; 4] = [
        TraceKind::Raw,
        TraceKind::Dff,
        TraceKind::Neuropil,
        TraceKind::Deconvolved,
    ];

    pub fn key(self) -> &'static str {
        match self {
            TraceKind::Raw => "raw",
            TraceKind::Dff => "dff",
            TraceKind::Neuropil => "neuropil",
            TraceKind::Deconvolved => "deconvolved",
        }
    }

    /// Container the trace is stored in.
    fn container(self) -> &'static str {
        match self {
            TraceKind::Dff => "DfOverF",
            _ => "Fluorescence",
        }
    }
}

/// Kind of summary image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageKind {
    Mean,
    Correlation,
}

impl ImageKind {
    pub const ALL: [ImageKind; 2] = [ImageKind::Mean, ImageKind::Correlation];

    pub fn key(self) -> &'static str {
        match self {
            ImageKind::Mean => "mean",
            ImageKind::Correlation => "correlation",
        }
    }
}

/// The output of a cell segmentation algorithm.
///
/// Traces are (frames, rois) and masks (rois, height, width).
pub trait SegmentationExtractor {
    fn roi_ids(&self) -> Vec<i64>;

    /// (height, width) of the field of view
    fn image_size(&self) -> (usize, usize);

    fn num_frames(&self) -> usize;

    fn sampling_frequency(&self) -> f64;

    fn image_masks(&self) -> Array3<f32>;

    fn traces(&self, kind: TraceKind) -> Option<Array2<f32>>;

    fn accepted_list(&self) -> Vec<i64> {
        self.roi_ids()
    }

    fn rejected_list(&self) -> Vec<i64> {
        Vec::new()
    }

    fn images(&self, kind: ImageKind) -> Option<Array2<f32>>;
}

/// A segmentation held in memory.
#[derive(Debug, Clone)]
pub struct InMemorySegmentation {
    roi_ids: Vec<i64>,
    image_masks: Array3<f32>,
    sampling_frequency: f64,
    traces: BTreeMap<TraceKind, Array2<f32>>,
    images: BTreeMap<ImageKind, Array2<f32>>,
    accepted: Option<Vec<i64>>,
    rejected: Option<Vec<i64>>,
}

impl InMemorySegmentation {
    /// ROI ids default to `0..n` for `n` masks.
    pub fn new(image_masks: Array3<f32>, sampling_frequency: f64) -> Self {
        Self {
            roi_ids: (0..image_masks.shape()[0] as i64).collect(),
            image_masks,
            sampling_frequency,
            traces: BTreeMap::new(),
            images: BTreeMap::new(),
            accepted: None,
            rejected: None,
        }
    }

    pub fn with_roi_ids(mut self, roi_ids: Vec<i64>) -> Self {
        self.roi_ids = roi_ids;
        self
    }

    pub fn with_traces(mut self, kind: TraceKind, traces: Array2<f32>) -> Self {
        self.traces.insert(kind, traces);
        self
    }

    pub fn with_image(mut self, kind: ImageKind, image: Array2<f32>) -> Self {
        self.images.insert(kind, image);
        self
    }

    pub fn with_accepted(mut self, accepted: Vec<i64>, rejected: Vec<i64>) -> Self {
        self.accepted = Some(accepted);
        self.rejected = Some(rejected);
        self
    }
}

impl SegmentationExtractor for InMemorySegmentation {
    fn roi_ids(&self) -> Vec<i64> {
        self.roi_ids.clone()
    }

    fn image_size(&self) -> (usize, usize) {
        let (_, height, width) = self.image_masks.dim();
        (height, width)
    }

    fn num_frames(&self) -> usize {
        self.traces
            .values()
            .next()
            .map(|t| t.len_of(Axis(0)))
            .unwrap_or(0)
    }

    fn sampling_frequency(&self) -> f64 {
        self.sampling_frequency
    }

    fn image_masks(&self) -> Array3<f32> {
        self.image_masks.clone()
    }

    fn traces(&self, kind: TraceKind) -> Option<Array2<f32>> {
        self.traces.get(&kind).cloned()
    }

    fn accepted_list(&self) -> Vec<i64> {
        self.accepted.clone().unwrap_or_else(|| self.roi_ids.clone())
    }

    fn rejected_list(&self) -> Vec<i64> {
        self.rejected.clone().unwrap_or_default()
    }

    fn images(&self, kind: ImageKind) -> Option<Array2<f32>> {
        self.images.get(&kind).cloned()
    }
}

/// Options of [`add_segmentation`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentationOptions {
    pub include_summary_images: bool,
}

impl Default for SegmentationOptions {
    fn default() -> Self {
        Self {
            include_summary_images: true,
        }
    }
}

/// Default `Ophys` section: one microscope imaging one plane.
pub fn get_default_ophys_metadata() -> Metadata {
    let mut metadata = Metadata::new();
    metadata.set(
        OPHYS,
        "Device",
        json!([{ "name": "Microscope", "description": "My two-photon microscope" }]),
    );
    metadata.set(
        OPHYS,
        "ImagingPlane",
        json!([{
            "name": "ImagingPlane",
            "description": "The plane or volume being imaged by the microscope.",
            "device": "Microscope",
            "excitation_lambda": null,
            "indicator": "unknown",
            "location": "unknown",
            "optical_channel": [{
                "name": "OpticalChannel",
                "description": "An optical channel of the microscope.",
                "emission_lambda": null
            }]
        }]),
    );
    metadata.set(
        OPHYS,
        "PlaneSegmentation",
        json!([{ "name": "PlaneSegmentation", "description": "Segmented ROIs" }]),
    );
    metadata.set(
        OPHYS,
        "Fluorescence",
        json!({
            "raw": { "name": "RoiResponseSeries", "description": "Array of raw fluorescence traces." },
            "neuropil": { "name": "Neuropil", "description": "Array of neuropil traces." },
            "deconvolved": { "name": "Deconvolved", "description": "Array of deconvolved traces." }
        }),
    );
    metadata.set(
        OPHYS,
        "DfOverF",
        json!({
            "dff": { "name": "RoiResponseSeries", "description": "Array of df/F traces." }
        }),
    );
    metadata.set(
        OPHYS,
        SUMMARY_IMAGES,
        json!({ "name": SUMMARY_IMAGES, "description": "The summary images of the segmentation." }),
    );
    metadata
}

/// Reads `metadata['Ophys'][key][sub_key]`, defaulting to the built-in entry.
fn nested_entry(metadata: &Metadata, key: &str, sub_key: &str) -> Result<NamedEntryMetadata> {
    let lookup = |md: &Metadata| md.get(OPHYS, key).and_then(|v| v.get(sub_key)).cloned();
    let value = lookup(metadata)
        .or_else(|| lookup(&get_default_ophys_metadata()))
        .unwrap_or(Value::Null);
    if value.is_null() {
        return Ok(NamedEntryMetadata::default());
    }
    serde_json::from_value(value).map_err(|e| {
        NwbError::InvalidMetadata(format!("metadata['{}']['{}']['{}']: {}", OPHYS, key, sub_key, e))
    })
}

/// Adds the microscopes listed in `Ophys.Device`, or the default one.
pub fn add_ophys_devices(nwbfile: &mut NwbFile, metadata: &Metadata) -> Result<()> {
    let entries = match metadata.entries::<DeviceMetadata>(OPHYS, "Device")? {
        Some(entries) => entries,
        None => get_default_ophys_metadata()
            .entries::<DeviceMetadata>(OPHYS, "Device")?
            .unwrap_or_default(),
    };
    for entry in entries {
        let name = entry.name.unwrap_or_else(|| "Microscope".to_string());
        if nwbfile.device(&name).is_some() {
            continue;
        }
        nwbfile.create_device(Device {
            name,
            description: entry.description,
            manufacturer: entry.manufacturer,
        })?;
    }
    Ok(())
}

/// Adds the imaging planes of `Ophys.ImagingPlane` and returns the first one's name.
pub fn add_imaging_plane(
    segmentation: &dyn SegmentationExtractor,
    nwbfile: &mut NwbFile,
    metadata: &Metadata,
) -> Result<String> {
    add_ophys_devices(nwbfile, metadata)?;
    let entries = match metadata.entries::<ImagingPlaneMetadata>(OPHYS, "ImagingPlane")? {
        Some(entries) if !entries.is_empty() => entries,
        _ => get_default_ophys_metadata()
            .entries::<ImagingPlaneMetadata>(OPHYS, "ImagingPlane")?
            .unwrap_or_default(),
    };

    let mut first = None;
    for entry in entries {
        let name = entry.name.unwrap_or_else(|| "ImagingPlane".to_string());
        first.get_or_insert_with(|| name.clone());
        if nwbfile.imaging_plane(&name).is_some() {
            continue;
        }
        let device = match entry.device {
            Some(device) => device,
            None => nwbfile
                .devices
                .first()
                .map(|d| d.name.clone())
                .unwrap_or_else(|| "Microscope".to_string()),
        };
        let optical_channels = entry
            .optical_channel
            .unwrap_or_default()
            .into_iter()
            .map(|c| OpticalChannel {
                name: c.name,
                description: c.description,
                emission_lambda: c.emission_lambda,
            })
            .collect();
        nwbfile.add_imaging_plane(ImagingPlane {
            name,
            description: entry
                .description
                .unwrap_or_else(|| "no description".to_string()),
            device,
            excitation_lambda: entry.excitation_lambda.unwrap_or(f64::NAN),
            indicator: entry.indicator.unwrap_or_else(|| "unknown".to_string()),
            location: entry.location.unwrap_or_else(|| "unknown".to_string()),
            imaging_rate: segmentation.sampling_frequency(),
            optical_channels,
        })?;
    }
    first.ok_or_else(|| NwbError::InvalidMetadata("no imaging plane could be created".to_string()))
}

fn plane_segmentation_entry(metadata: &Metadata) -> Result<NamedEntryMetadata> {
    let entries = metadata
        .entries::<NamedEntryMetadata>(OPHYS, "PlaneSegmentation")?
        .unwrap_or_default();
    Ok(entries.into_iter().next().unwrap_or_default())
}

/// Adds the ROI table of `segmentation` to the `ophys` module.
///
/// Returns the name of the plane segmentation. An existing one is reused.
pub fn add_plane_segmentation(
    segmentation: &dyn SegmentationExtractor,
    nwbfile: &mut NwbFile,
    metadata: &Metadata,
    imaging_plane: &str,
) -> Result<String> {
    let entry = plane_segmentation_entry(metadata)?;
    let name = entry
        .name
        .unwrap_or_else(|| "PlaneSegmentation".to_string());

    let module = nwbfile.check_module(OPHYS_MODULE, Some(OPHYS_MODULE_DESCRIPTION));
    if !module.contains("ImageSegmentation") {
        module.add(DataInterface::ImageSegmentation {
            name: "ImageSegmentation".to_string(),
            plane_segmentations: Vec::new(),
        })?;
    }
    let Some(DataInterface::ImageSegmentation {
        plane_segmentations,
        ..
    }) = module.get_mut("ImageSegmentation")
    else {
        return Err(NwbError::NotFound {
            kind: "ImageSegmentation",
            name: "ImageSegmentation".to_string(),
        });
    };
    if plane_segmentations.iter().any(|p| p.name == name) {
        debug!(name = %name, "plane segmentation already present");
        return Ok(name);
    }

    let roi_ids = segmentation.roi_ids();
    let accepted: BTreeSet<i64> = segmentation.accepted_list().into_iter().collect();
    let rejected: BTreeSet<i64> = segmentation.rejected_list().into_iter().collect();

    let mut table = DynamicTable::new(&name, "ROIs of the imaging plane");
    let flag_description = "1 if ROI was accepted or 0 if rejected as a cell during segmentation operation";
    table.add_empty_column("Accepted", flag_description, CellValue::Int(0))?;
    table.add_empty_column("Rejected", flag_description, CellValue::Int(0))?;
    for &roi_id in &roi_ids {
        table.add_row(
            roi_id,
            BTreeMap::from([
                ("Accepted".to_string(), CellValue::Int(accepted.contains(&roi_id) as i64)),
                ("Rejected".to_string(), CellValue::Int(rejected.contains(&roi_id) as i64)),
            ]),
        )?;
    }

    plane_segmentations.push(PlaneSegmentation {
        name: name.clone(),
        description: entry
            .description
            .unwrap_or_else(|| "Segmented ROIs".to_string()),
        imaging_plane: imaging_plane.to_string(),
        table,
        image_mask: Dataset::new(segmentation.image_masks()).with_compression(Compression::default()),
    });
    Ok(name)
}

/// Adds every available trace of `segmentation` as a ROI response series.
///
/// Raw, neuropil and deconvolved traces go to `Fluorescence`, dF/F to
/// `DfOverF`. Each series references all ROIs of `plane_segmentation`.
pub fn add_fluorescence_traces(
    segmentation: &dyn SegmentationExtractor,
    nwbfile: &mut NwbFile,
    metadata: &Metadata,
    plane_segmentation: &str,
) -> Result<()> {
    let num_rois = segmentation.roi_ids().len();
    let rate = segmentation.sampling_frequency();
    let module = nwbfile.check_module(OPHYS_MODULE, Some(OPHYS_MODULE_DESCRIPTION));

    for kind in TraceKind::ALL {
        let Some(traces) = segmentation.traces(kind) else {
            continue;
        };
        if traces.len_of(Axis(1)) != num_rois {
            return Err(NwbError::InvalidArgument(format!(
                "{} traces have {} columns for {} ROIs",
                kind.key(),
                traces.len_of(Axis(1)),
                num_rois
            )));
        }
        let container = kind.container();
        let entry = nested_entry(metadata, container, kind.key())?;
        let name = entry.name.unwrap_or_else(|| "RoiResponseSeries".to_string());

        if !module.contains(container) {
            let interface = match kind {
                TraceKind::Dff => DataInterface::DfOverF {
                    name: container.to_string(),
                    roi_response_series: Vec::new(),
                },
                _ => DataInterface::Fluorescence {
                    name: container.to_string(),
                    roi_response_series: Vec::new(),
                },
            };
            module.add(interface)?;
        }
        let series_list = module
            .get_mut(container)
            .and_then(DataInterface::roi_response_series_mut)
            .ok_or_else(|| NwbError::NotFound {
                kind: "Data interface",
                name: container.to_string(),
            })?;
        if series_list.iter().any(|s| s.name == name) {
            return Err(NwbError::DuplicateName {
                kind: "RoiResponseSeries",
                name,
            });
        }

        debug!(trace = kind.key(), name = %name, "adding roi response series");
        series_list.push(RoiResponseSeries {
            name,
            description: entry
                .description
                .unwrap_or_else(|| format!("Array of {} traces.", kind.key())),
            unit: "n.a.".to_string(),
            rois: TableRegion {
                table: plane_segmentation.to_string(),
                description: "region for all ROIs".to_string(),
                rows: (0..num_rois).collect(),
            },
            data: Dataset::new(traces).with_compression(Compression::default()),
            timing: Timing::Rate {
                starting_time: 0.0,
                rate,
            },
        });
    }
    Ok(())
}

/// Adds the summary images of `segmentation` to `SegmentationImages`.
pub fn add_summary_images(
    segmentation: &dyn SegmentationExtractor,
    nwbfile: &mut NwbFile,
    metadata: &Metadata,
) -> Result<()> {
    let images: Vec<(ImageKind, Array2<f32>)> = ImageKind::ALL
        .into_iter()
        .filter_map(|kind| segmentation.images(kind).map(|image| (kind, image)))
        .collect();
    if images.is_empty() {
        return Ok(());
    }

    let overrides: NamedEntryMetadata = match metadata.get(OPHYS, SUMMARY_IMAGES) {
        Some(value) => serde_json::from_value(value.clone()).map_err(|e| {
            NwbError::InvalidMetadata(format!("metadata['{}']['{}']: {}", OPHYS, SUMMARY_IMAGES, e))
        })?,
        None => NamedEntryMetadata::default(),
    };
    let name = overrides
        .name
        .unwrap_or_else(|| SUMMARY_IMAGES.to_string());

    let module = nwbfile.check_module(OPHYS_MODULE, Some(OPHYS_MODULE_DESCRIPTION));
    if !module.contains(&name) {
        module.add(DataInterface::Images {
            name: name.clone(),
            description: overrides
                .description
                .unwrap_or_else(|| "The summary images of the segmentation.".to_string()),
            images: Vec::new(),
        })?;
    }
    if let Some(DataInterface::Images { images: stored, .. }) = module.get_mut(&name) {
        for (kind, image) in images {
            if stored.iter().any(|i| i.name == kind.key()) {
                continue;
            }
            stored.push(GrayscaleImage {
                name: kind.key().to_string(),
                data: Dataset::new(image),
            });
        }
    }
    Ok(())
}

/// Adds devices, imaging plane, ROIs, traces and images of `segmentation`.
pub fn add_segmentation(
    segmentation: &dyn SegmentationExtractor,
    nwbfile: &mut NwbFile,
    metadata: &Metadata,
    options: &SegmentationOptions,
) -> Result<()> {
    info!(
        rois = segmentation.roi_ids().len(),
        frames = segmentation.num_frames(),
        "adding segmentation"
    );
    let imaging_plane = add_imaging_plane(segmentation, nwbfile, metadata)?;
    let plane_segmentation = add_plane_segmentation(segmentation, nwbfile, metadata, &imaging_plane)?;
    add_fluorescence_traces(segmentation, nwbfile, metadata, &plane_segmentation)?;
    if options.include_summary_images {
        add_summary_images(segmentation, nwbfile, metadata)?;
    }
    Ok(())
}
