use ndarray::{Array1, Array2};
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

use crate::header::Header;
use crate::schema::{EVENT_LABEL_BYTES, SAMPLES_PER_PACKET};

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, LynxError>;

/// Packets decoded from a continuous-signal (`.ncs`) file.
///
/// Stored column-wise: element `i` of every field belongs to packet `i`.
#[derive(Debug, Clone, PartialEq)]
pub struct ContinuousPackets {
    /// Packet timestamps (μs)
    pub timestamps: Array1<u64>,
    /// Channel id reported by the acquisition system
    pub channels: Array1<u32>,
    /// Nominal sampling rate reported by the device (Hz, rounded to whole Hz)
    pub sampling_rates: Array1<u32>,
    /// Number of meaningful samples at the start of each packet
    pub valid_sample_counts: Array1<u32>,
    /// Raw packet samples
    /// - Shape: [num_packets, 512]
    pub samples: Array2<i16>,
}

impl ContinuousPackets {
    /// Number of packets.
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    /// Concatenates the valid prefix of every packet, dropping device padding.
    pub fn valid_samples(&self) -> Array1<i16> {
        let total: usize = self
            .valid_sample_counts
            .iter()
            .map(|&n| (n as usize).min(SAMPLES_PER_PACKET))
            .sum();
        let mut out = Vec::with_capacity(total);
        for (row, &count) in self.samples.outer_iter().zip(self.valid_sample_counts.iter()) {
            let count = (count as usize).min(SAMPLES_PER_PACKET);
            out.extend(row.iter().take(count));
        }
        Array1::from_vec(out)
    }
}

/// A gap in the record that was filled with zero padding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Gap {
    /// Index of the first packet after the gap
    pub packet_index: usize,
    /// Timestamp of the first packet after the gap (μs)
    pub timestamp: u64,
    /// Number of zero samples inserted before that packet
    pub padding: usize,
}

/// A contiguous, zero-padded trace rebuilt from continuous-signal packets.
#[derive(Debug, Clone, PartialEq)]
pub struct Reconstruction {
    /// Effective sampling rate estimated from packet timestamps (Hz)
    pub sampling_rate: f64,
    /// Concatenated samples with gaps filled by zeros
    pub trace: Array1<i16>,
    /// Timestamp of the first packet (μs)
    pub first_timestamp: u64,
    /// Gaps found between contiguous sections, in order
    pub gaps: Vec<Gap>,
}

/// Complete representation of a continuous-signal file.
///
/// `reconstruction` is `None` when the caller did not ask for a trace, or when
/// the sampling rate drifted and the request was downgraded.
#[derive(Debug, Clone, PartialEq)]
pub struct ContinuousRecording {
    /// Raw file preamble
    pub header: Header,
    /// Packets exactly as read
    pub packets: ContinuousPackets,
    /// Reconstructed trace, if any
    pub reconstruction: Option<Reconstruction>,
}

impl ContinuousRecording {
    /// Effective sampling rate, if a trace was reconstructed.
    pub fn sampling_rate(&self) -> Option<f64> {
        self.reconstruction.as_ref().map(|r| r.sampling_rate)
    }

    /// The samples that represent this channel: the reconstructed trace when
    /// available, otherwise the valid samples of every packet back to back.
    pub fn channel_samples(&self) -> Array1<i16> {
        match &self.reconstruction {
            Some(reconstruction) => reconstruction.trace.clone(),
            None => self.packets.valid_samples(),
        }
    }

    /// Returns the duration of the reconstructed trace in seconds.
    ///
    /// If no trace was reconstructed, returns 0.0.
    pub fn duration(&self) -> f64 {
        match &self.reconstruction {
            Some(r) if r.sampling_rate > 0.0 => r.trace.len() as f64 / r.sampling_rate,
            _ => 0.0,
        }
    }
}

/// One record of an event (`.nev`) file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRecord {
    pub stx: i16,
    pub packet_id: i16,
    pub packet_data_size: i16,
    /// Event timestamp (μs)
    pub timestamp: u64,
    pub event_id: i16,
    /// Value of the TTL port when the event was logged
    pub ttl: u16,
    pub crc: i16,
    pub dummy1: i16,
    pub dummy2: i16,
    pub extra: [i32; 8],
    /// Fixed-width event label, NUL padded
    pub label: [u8; EVENT_LABEL_BYTES],
}

impl EventRecord {
    /// The label with NUL padding and surrounding whitespace removed.
    pub fn label_text(&self) -> String {
        decode_label(&self.label)
    }
}

/// Strips every NUL byte from a fixed-width label and trims whitespace.
pub fn decode_label(raw: &[u8]) -> String {
    let bytes: Vec<u8> = raw.iter().copied().filter(|&b| b != 0).collect();
    String::from_utf8_lossy(&bytes).trim().to_string()
}

/// Contents of an event file.
#[derive(Debug, Clone, PartialEq)]
pub struct EventFile {
    pub header: Header,
    pub events: Vec<EventRecord>,
    /// Decoded labels, one per event (only when requested)
    pub labels: Option<Vec<String>>,
}

/// Records of a single-electrode spike (`.nse`) file, stored column-wise.
#[derive(Debug, Clone, PartialEq)]
pub struct SpikeRecords {
    /// Spike timestamps (μs)
    pub timestamps: Array1<u64>,
    /// Spike acquisition entity number
    pub acquisition_entities: Array1<u32>,
    /// Cell number assigned by the sorter
    pub cell_numbers: Array1<u32>,
    /// Feature vectors
    /// - Shape: [num_spikes, 8]
    pub features: Array2<u32>,
    /// Waveform snippets
    /// - Shape: [num_spikes, 32]
    pub waveforms: Array2<i16>,
}

impl SpikeRecords {
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }
}

/// Contents of a spike file.
#[derive(Debug, Clone, PartialEq)]
pub struct SpikeFile {
    pub header: Header,
    pub spikes: SpikeRecords,
}

/// Why a raw extraction stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopReason {
    /// The whole file was consumed
    #[default]
    EndOfFile,
    /// The requested packet count was reached (possibly overshot by one buffer)
    MaxPacketsReached,
    /// stx + crc + timestamp faults exceeded the caller's error budget
    ErrorBudgetExhausted,
}

/// Diagnostics of a raw extraction run.
///
/// Always returned, whether or not any fault was seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExtractionReport {
    /// Packets written to the output streams
    pub packets: u64,
    /// Bytes skipped while searching for a start-of-frame marker
    pub garbage_bytes: u64,
    /// Buffers truncated on a bad start-of-frame marker
    pub stx_errors: u64,
    /// Buffers truncated on a wrong packet id
    pub packet_id_errors: u64,
    /// Buffers truncated on a wrong packet data size
    pub packet_size_errors: u64,
    /// Buffers truncated on a checksum mismatch
    pub crc_errors: u64,
    /// Buffers truncated on a non-increasing timestamp
    pub timestamp_errors: u64,
    /// Terminal state of the run
    pub stop_reason: StopReason,
}

impl ExtractionReport {
    /// Faults counted against the error budget.
    pub fn budget_errors(&self) -> u64 {
        self.stx_errors + self.crc_errors + self.timestamp_errors
    }

    /// Every fault tallied, of any kind.
    pub fn total_errors(&self) -> u64 {
        self.budget_errors() + self.packet_id_errors + self.packet_size_errors
    }
}

/// Kind of stream written by the raw demultiplexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractedKind {
    /// 64-bit timestamps (μs)
    Timestamps,
    /// 32-bit TTL port values
    Ttl,
    /// 32-bit A/D samples of one channel
    AdData,
}

impl ExtractedKind {
    /// Size in bytes of one element of the stream.
    pub fn element_size(self) -> usize {
        match self {
            ExtractedKind::Timestamps => 8,
            ExtractedKind::Ttl | ExtractedKind::AdData => 4,
        }
    }
}

impl FromStr for ExtractedKind {
    type Err = LynxError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ts" => Ok(ExtractedKind::Timestamps),
            "ttl" => Ok(ExtractedKind::Ttl),
            "addata" => Ok(ExtractedKind::AdData),
            other => Err(LynxError::UnknownExtractedKind(other.to_string())),
        }
    }
}

impl fmt::Display for ExtractedKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ExtractedKind::Timestamps => write!(f, "ts"),
            ExtractedKind::Ttl => write!(f, "ttl"),
            ExtractedKind::AdData => write!(f, "addata"),
        }
    }
}

/// A stream read back from a demultiplexer output file.
#[derive(Debug, Clone, PartialEq)]
pub enum ExtractedData {
    Timestamps(Array1<u64>),
    Ttl(Array1<u32>),
    AdData(Array1<i32>),
}

impl ExtractedData {
    pub fn len(&self) -> usize {
        match self {
            ExtractedData::Timestamps(a) => a.len(),
            ExtractedData::Ttl(a) => a.len(),
            ExtractedData::AdData(a) => a.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Custom error types for the Neuralynx importer.
///
/// Framing faults inside raw files are never raised; they are tallied in
/// [`ExtractionReport`]. Everything here is fatal to the call that hit it.
#[derive(Debug, Error)]
pub enum LynxError {
    /// The file ended before the fixed header was complete
    #[error("Truncated file: expected at least {expected} header bytes, found {found}")]
    TruncatedFile { expected: usize, found: usize },
    /// Header remarks do not fit in the fixed header
    #[error("Header remarks are {len} bytes, the header holds {capacity}")]
    HeaderOverflow { len: usize, capacity: usize },
    /// No continuous-signal files were found in a folder
    #[error("No continuous-signal files found in {}", .folder.display())]
    InconsistentChannelCount { folder: PathBuf },
    /// Memory-mapped or exported output was requested without a destination folder
    #[error("An output folder must be given for memory-mapped or exported data")]
    MissingOutputPath,
    /// A channel file name does not carry a numeric channel index
    #[error("Cannot read a channel index from file name {}", .0.display())]
    InvalidChannelFileName(PathBuf),
    /// A channel trace does not match the length of the first channel
    #[error("Channel {channel} has {found} samples, expected {expected}")]
    RowLengthMismatch {
        channel: u32,
        expected: usize,
        found: usize,
    },
    /// An unrecognized kind was requested from the extracted-stream reader
    #[error("Unrecognized extracted data type '{0}' (expected 'ts', 'ttl' or 'addata')")]
    UnknownExtractedKind(String),
    /// A requested channel does not exist in the system
    #[error("Channel {channel} is out of range for {channel_count} channels")]
    ChannelOutOfRange { channel: usize, channel_count: usize },
    /// The number of channel output paths does not match the channel list
    #[error("{channels} channels requested but {paths} output paths given")]
    ChannelPathMismatch { channels: usize, paths: usize },
    /// An option value is unusable
    #[error("Invalid option: {0}")]
    InvalidOption(String),
    /// A record layout lacks a field the decoder needs
    #[error("Layout '{layout}' has no field '{field}'")]
    MissingField {
        layout: &'static str,
        field: &'static str,
    },
    /// A flat stream is not a whole number of elements
    #[error("File {} is {len} bytes, not a multiple of {element_size}", .path.display())]
    FileSize {
        path: PathBuf,
        len: u64,
        element_size: usize,
    },
    /// An I/O error occurred during reading or writing
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}
