use ndarray::{Array2, Array3};
use nwb_exporter::nwbfile::DataInterface;
use nwb_exporter::ophys::{ImageKind, TraceKind, OPHYS_MODULE};
use nwb_exporter::{
    read, write_recording, write_segmentation, CellValue, DataArray, Destination, InMemoryRecording,
    InMemorySegmentation, Metadata, NwbConverter, NwbError, RecordingInterface, SegmentationInterface,
    SegmentationOptions, WriteOptions,
};
use serde_json::json;

fn segmentation() -> InMemorySegmentation {
    let masks = Array3::from_shape_fn((4, 6, 6), |(r, y, x)| if y / 3 * 2 + x / 3 == r { 1.0 } else { 0.0 });
    let raw = Array2::from_shape_fn((20, 4), |(f, r)| (f + r * 10) as f32);
    let neuropil = Array2::from_elem((20, 4), 0.5f32);
    InMemorySegmentation::new(masks, 15.0)
        .with_roi_ids(vec![1, 2, 3, 4])
        .with_traces(TraceKind::Raw, raw)
        .with_traces(TraceKind::Neuropil, neuropil)
        .with_image(ImageKind::Mean, Array2::from_elem((6, 6), 2.0))
        .with_image(ImageKind::Correlation, Array2::from_elem((6, 6), 0.25))
        .with_accepted(vec![1, 2, 4], vec![3])
}

#[test]
fn segmentation_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ophys.nwb");
    write_segmentation(
        &segmentation(),
        Destination::path(&path, false),
        None,
        &SegmentationOptions::default(),
    )
    .unwrap();

    let nwbfile = read(&path).unwrap();
    assert!(nwbfile.device("Microscope").is_some());
    let plane = nwbfile.imaging_plane("ImagingPlane").unwrap();
    assert_eq!(plane.imaging_rate, 15.0);
    assert!(plane.excitation_lambda.is_nan());

    let module = nwbfile.processing_module(OPHYS_MODULE).unwrap();
    let planes = module
        .get("ImageSegmentation")
        .and_then(DataInterface::plane_segmentations)
        .unwrap();
    let table = &planes[0].table;
    assert_eq!(table.len(), 4);
    assert_eq!(table.get(3, "Rejected"), Some(&CellValue::Int(1)));
    assert_eq!(table.get(4, "Accepted"), Some(&CellValue::Int(1)));
    assert_eq!(planes[0].image_mask.shape(), &[4, 6, 6]);

    let fluorescence = module
        .get("Fluorescence")
        .and_then(DataInterface::roi_response_series)
        .unwrap();
    let names: Vec<&str> = fluorescence.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["RoiResponseSeries", "Neuropil"]);
    assert_eq!(fluorescence[1].data.data, DataArray::from(Array2::from_elem((20, 4), 0.5f32)));
    assert_eq!(fluorescence[0].rois.rows, vec![0, 1, 2, 3]);
    assert!(module.get("DfOverF").is_none());

    match module.get("SegmentationImages") {
        Some(DataInterface::Images { images, .. }) => assert_eq!(images.len(), 2),
        other => panic!("unexpected summary images: {:?}", other),
    }
}

#[test]
fn nan_traces_survive_appending() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ophys.nwb");
    let mut dff = Array2::from_shape_fn((20, 4), |(f, r)| (f + r) as f32 * 0.1);
    dff[[0, 1]] = f32::NAN;
    dff[[7, 3]] = f32::NAN;
    let seg = segmentation().with_traces(TraceKind::Dff, dff);
    write_segmentation(&seg, Destination::path(&path, false), None, &SegmentationOptions::default()).unwrap();

    let ephys = InMemoryRecording::new(Array2::<i16>::zeros((10, 2)), 1000.0);
    write_recording(&ephys, Destination::path(&path, false), None, &WriteOptions::default()).unwrap();

    let nwbfile = read(&path).unwrap();
    assert!(nwbfile.get_acquisition("ElectricalSeries_raw").is_some());
    let dff = nwbfile
        .processing_module(OPHYS_MODULE)
        .and_then(|m| m.get("DfOverF"))
        .and_then(DataInterface::roi_response_series)
        .unwrap();
    let values = dff[0].data.data.to_f64();
    assert!(values[[0, 1]].is_nan());
    assert!(values[[7, 3]].is_nan());
    assert!((values[[2, 2]] - 0.4).abs() < 1e-6);
}

#[test]
fn summary_images_can_be_left_out() {
    let mut nwbfile = nwb_exporter::writer::new_nwbfile(&Metadata::new()).unwrap();
    let options = SegmentationOptions {
        include_summary_images: false,
    };
    write_segmentation(&segmentation(), Destination::File(&mut nwbfile), None, &options).unwrap();
    let module = nwbfile.processing_module(OPHYS_MODULE).unwrap();
    assert!(module.contains("Fluorescence"));
    assert!(!module.contains("SegmentationImages"));
}

#[test]
fn second_segmentation_with_same_names_fails() {
    let mut nwbfile = nwb_exporter::writer::new_nwbfile(&Metadata::new()).unwrap();
    let options = SegmentationOptions::default();
    write_segmentation(&segmentation(), Destination::File(&mut nwbfile), None, &options).unwrap();
    assert!(matches!(
        write_segmentation(&segmentation(), Destination::File(&mut nwbfile), None, &options),
        Err(NwbError::DuplicateName { .. })
    ));
}

#[test]
fn renamed_traces_follow_metadata() {
    let mut nwbfile = nwb_exporter::writer::new_nwbfile(&Metadata::new()).unwrap();
    let metadata = Metadata::from_value(json!({
        "Ophys": {"Fluorescence": {"raw": {"name": "Raw", "description": "suite2p F"}}}
    }))
    .unwrap();
    write_segmentation(
        &segmentation(),
        Destination::File(&mut nwbfile),
        Some(&metadata),
        &SegmentationOptions::default(),
    )
    .unwrap();
    let fluorescence = nwbfile
        .processing_module(OPHYS_MODULE)
        .and_then(|m| m.get("Fluorescence"))
        .and_then(DataInterface::roi_response_series)
        .unwrap();
    assert_eq!(fluorescence[0].name, "Raw");
    assert_eq!(fluorescence[0].description, "suite2p F");
    assert_eq!(fluorescence[1].name, "Neuropil");
}

#[test]
fn converter_writes_ephys_and_ophys_together() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("combined.nwb");
    let traces = Array2::from_shape_fn((50, 2), |(f, c)| (f * 2 + c) as i16);

    let mut converter = NwbConverter::new();
    converter
        .add_interface(
            "Recording",
            Box::new(RecordingInterface::new(InMemoryRecording::new(traces, 1000.0))),
        )
        .unwrap();
    converter
        .add_interface("Segmentation", Box::new(SegmentationInterface::new(segmentation())))
        .unwrap();

    let metadata = Metadata::from_value(json!({"NWBFile": {"session_description": "paired session"}})).unwrap();
    let options = json!({
        "Recording": {"write_as": "raw"},
        "Segmentation": {"include_summary_images": false}
    });
    converter.run_conversion(&path, true, Some(&metadata), &options).unwrap();

    let nwbfile = read(&path).unwrap();
    assert_eq!(nwbfile.session_description, "paired session");
    assert!(nwbfile.get_acquisition("ElectricalSeries_raw").is_some());
    assert_eq!(nwbfile.electrode_ids().len(), 2);
    // Both devices end up in the same file
    assert!(nwbfile.device("Microscope").is_some());
    assert_eq!(nwbfile.devices.len(), 2);
    let module = nwbfile.processing_module(OPHYS_MODULE).unwrap();
    assert!(!module.contains("SegmentationImages"));
}
