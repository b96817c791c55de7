use nwb_exporter::metadata::Metadata;
use nwb_exporter::{read, write_recording, BinaryRecording, DType, Destination, Recording, WriteOptions};
use std::env;
use std::error::Error;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 5 {
        println!("usage: convert_binary <input.bin> <num_channels> <sampling_rate> <output.nwb> [metadata.json]");
        return Ok(());
    }
    let num_channels: usize = args[2].parse()?;
    let sampling_rate: f64 = args[3].parse()?;

    // Raw int16 samples, interleaved by channel
    let recording = BinaryRecording::open(&args[1], num_channels, sampling_rate, DType::Int16)?;
    println!(
        "Input: {} channels, {} frames at {} Hz",
        recording.num_channels(),
        recording.num_frames(),
        recording.sampling_frequency()
    );

    let metadata = match args.get(5) {
        Some(path) => Some(Metadata::from_json_file(path)?),
        None => None,
    };
    write_recording(
        &recording,
        Destination::path(&args[4], true),
        metadata.as_ref(),
        &WriteOptions::default(),
    )?;

    // Read back and list what was stored
    let nwbfile = read(&args[4])?;
    println!("Session: {}", nwbfile.session_description);
    println!("Devices: {}", nwbfile.devices.len());
    println!("Electrode groups: {}", nwbfile.electrode_groups.len());
    for info in nwbfile.dataset_infos() {
        print!("{}", info);
    }

    Ok(())
}
