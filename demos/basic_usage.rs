use ndarray::s;
use neuralynx_importer::*;
use std::error::Error;

fn main() -> std::result::Result<(), Box<dyn Error>> {
    // Single channel, with gaps padded
    let source = load_continuous("data/session/CSC1.ncs", &ContinuousOptions::default())?;
    if let ContinuousSource::Loaded(recording) = &source {
        println!("Packets: {}", recording.packets.len());

        if let Some(reconstruction) = &recording.reconstruction {
            println!("Effective sample rate: {:.3} Hz", reconstruction.sampling_rate);
            println!("Duration: {:.3} seconds", recording.duration());
            println!("Gaps padded: {}", reconstruction.gaps.len());

            for gap in reconstruction.gaps.iter().take(5) {
                println!(
                    "  packet {} at {} μs: {} zero samples",
                    gap.packet_index, gap.timestamp, gap.padding
                );
            }
        } else {
            println!("Sampling rate drifted, no trace was reconstructed");
        }
    }

    // Every channel of the session as one matrix
    let matrix = read_all_channels::<f32, _>("data/session", &AssembleOptions::default())?;
    let [num_channels, num_samples] = matrix.shape();
    println!(
        "\nChannel matrix: {} channels x {} samples",
        num_channels, num_samples
    );
    if num_channels > 0 && num_samples > 0 {
        let data = matrix.to_array();
        let first = data.slice(s![0, ..num_samples.min(5)]);
        println!("  Channel {} starts with {:?}", matrix.channels()[0], first.to_vec());
    }

    // Events
    let events = load_events("data/session/Events.nev", true)?;
    println!("\nEvents: {}", events.events.len());
    if let Some(labels) = &events.labels {
        for (event, label) in events.events.iter().zip(labels).take(5) {
            println!("  {} μs: ttl {} \"{}\"", event.timestamp, event.ttl, label);
        }
    }

    // Raw stream, two channels out of 64
    let channels = vec![0, 1];
    let targets = ExtractionTargets::in_folder("data/session", &channels);
    let options = ExtractionOptions {
        channels,
        ..Default::default()
    };
    let report = extract_raw("data/session/DigitalLynxSXRawDataFile.nrd", &targets, &options)?;
    println!("\nRaw extraction: {} packets, stopped on {:?}", report.packets, report.stop_reason);
    println!("  Garbage bytes: {}", report.garbage_bytes);
    println!("  Faulty buffers: {}", report.total_errors());

    let timestamps = read_extracted(&targets.timestamps, ExtractedKind::Timestamps)?;
    println!("  Timestamps read back: {}", timestamps.len());

    Ok(())
}
