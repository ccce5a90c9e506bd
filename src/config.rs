use std::path::{Path, PathBuf};

use crate::types::*;

/// Options for reading a single continuous-signal file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContinuousOptions {
    /// Rebuild a contiguous trace, assuming a fixed sampling rate
    pub assume_uniform_rate: bool,
    /// Map the file instead of reading it (skips reconstruction)
    pub memory_map: bool,
}

impl Default for ContinuousOptions {
    fn default() -> Self {
        ContinuousOptions {
            assume_uniform_rate: true,
            memory_map: false,
        }
    }
}

/// Export of a channel subset in time-major order, for spike detection tools.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExportOptions {
    /// Row indices to export; all rows when `None`
    pub channels: Option<Vec<usize>>,
    /// Return the exported subset instead of the full matrix
    pub return_subset: bool,
}

/// Options for assembling every channel of a recording folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembleOptions {
    /// Rebuild gap-padded traces for every channel
    pub assume_uniform_rate: bool,
    /// Map the inputs and write the matrix to a disk-backed file
    pub memory_map: bool,
    /// Destination of the disk-backed matrix and of the export
    pub output_folder: Option<PathBuf>,
    /// File name prefix before the channel index (`CSC12.ncs`)
    pub file_prefix: String,
    /// Optional time-major export
    pub export: Option<ExportOptions>,
}

impl Default for AssembleOptions {
    fn default() -> Self {
        AssembleOptions {
            assume_uniform_rate: true,
            memory_map: false,
            output_folder: None,
            file_prefix: "CSC".to_string(),
            export: None,
        }
    }
}

impl AssembleOptions {
    /// The output folder, required whenever something is written to disk.
    pub(crate) fn require_output_folder(&self) -> Result<Option<&Path>> {
        if self.memory_map || self.export.is_some() {
            self.output_folder
                .as_deref()
                .map(Some)
                .ok_or(LynxError::MissingOutputPath)
        } else {
            Ok(self.output_folder.as_deref())
        }
    }
}

/// Options for demultiplexing a raw (`.nrd`) file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionOptions {
    /// Total A/D channels in the acquisition system
    pub channel_count: usize,
    /// A/D channels to write out, in output order
    pub channels: Vec<usize>,
    /// Stop after this many packets (may overshoot by one buffer); all when `None`
    pub max_packets: Option<u64>,
    /// Packets read per buffer
    pub buffer_size: usize,
    /// Stop once stx + crc + timestamp faults exceed this count
    pub error_budget: u64,
}

impl Default for ExtractionOptions {
    fn default() -> Self {
        ExtractionOptions {
            channel_count: 64,
            channels: Vec::new(),
            max_packets: None,
            buffer_size: 10_000,
            error_budget: 1_000_000_000,
        }
    }
}

impl ExtractionOptions {
    /// Checks the options against the output targets before anything is opened.
    pub fn validate(&self, targets: &ExtractionTargets) -> Result<()> {
        if self.buffer_size == 0 {
            return Err(LynxError::InvalidOption(
                "buffer_size must be at least one packet".to_string(),
            ));
        }
        if self.max_packets == Some(0) {
            return Err(LynxError::InvalidOption(
                "max_packets must be at least one packet".to_string(),
            ));
        }
        if self.channels.len() != targets.channels.len() {
            return Err(LynxError::ChannelPathMismatch {
                channels: self.channels.len(),
                paths: targets.channels.len(),
            });
        }
        if let Some(&channel) = self.channels.iter().find(|&&c| c >= self.channel_count) {
            return Err(LynxError::ChannelOutOfRange {
                channel,
                channel_count: self.channel_count,
            });
        }
        Ok(())
    }

    /// Packets per buffer, never more than the packets requested.
    pub(crate) fn effective_buffer_size(&self) -> usize {
        match self.max_packets {
            Some(max) if (self.buffer_size as u64) > max => max as usize,
            _ => self.buffer_size,
        }
    }
}

/// Output files of a raw extraction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionTargets {
    /// 64-bit timestamp stream
    pub timestamps: PathBuf,
    /// 32-bit TTL stream
    pub ttl: PathBuf,
    /// One 32-bit sample stream per requested channel
    pub channels: Vec<PathBuf>,
}

impl ExtractionTargets {
    /// Conventional names inside `folder`: `timestamps.raw`, `ttl.raw`, `chan_<n>.raw`.
    pub fn in_folder<P: AsRef<Path>>(folder: P, channels: &[usize]) -> Self {
        let folder = folder.as_ref();
        ExtractionTargets {
            timestamps: folder.join("timestamps.raw"),
            ttl: folder.join("ttl.raw"),
            channels: channels
                .iter()
                .map(|ch| folder.join(format!("chan_{}.raw", ch)))
                .collect(),
        }
    }
}
