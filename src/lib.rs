pub mod assembler;
pub mod config;
pub mod continuous;
pub mod demux;
pub mod header;
mod reader;
pub mod schema;
pub mod types;

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

// Re-export types
pub use assembler::{list_channel_files, read_all_channels, ChannelMatrix, Sample};
pub use config::*;
pub use continuous::{load_continuous, read_continuous, ContinuousSource, MappedContinuous};
pub use demux::{extract_raw, extract_raw_fast, read_extracted};
pub use header::{Header, HEADER_SIZE};
pub use reader::{read_event, read_spike, write_spike};
pub use types::*;

/// Loads an event (`.nev`) file
///
/// # Examples
///
/// ```no_run
/// use neuralynx_importer::load_events;
///
/// let result = load_events("path/to/Events.nev", true);
/// match result {
///     Ok(events) => println!("{} events", events.events.len()),
///     Err(e) => println!("Error loading file: {}", e),
/// }
/// ```
pub fn load_events<P: AsRef<Path>>(file_path: P, parse_labels: bool) -> Result<EventFile> {
    let mut reader = BufReader::with_capacity(65536, File::open(file_path)?);
    read_event(&mut reader, parse_labels)
}

/// Loads a single-electrode spike (`.nse`) file
///
/// # Examples
///
/// ```no_run
/// use neuralynx_importer::load_spikes;
///
/// let spikes = load_spikes("path/to/SE1.nse").unwrap();
/// println!("First spike at {} μs", spikes.spikes.timestamps[0]);
/// ```
pub fn load_spikes<P: AsRef<Path>>(file_path: P) -> Result<SpikeFile> {
    let mut reader = BufReader::with_capacity(65536, File::open(file_path)?);
    read_spike(&mut reader)
}
