//! Demultiplexing of raw (`.nrd`) packet streams into per-channel files.
//!
//! The strict extractor walks the file one buffer at a time through an
//! explicit state machine:
//!
//! ```text
//! Read -> Validate -> Emit -> [Resync] -> Read ... -> Done
//! ```
//!
//! A buffer is validated packet by packet (start-of-frame marker, packet id,
//! data size, checksum, timestamp order). The prefix before the first bad
//! packet is written out; the reader then rewinds to just past that prefix
//! and scans forward a word at a time for the next start-of-frame marker.
//! Faults are tallied in an [`ExtractionReport`], never raised.

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use ndarray::Array1;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::time::Instant;

use crate::config::{ExtractionOptions, ExtractionTargets};
use crate::header::read_header;
use crate::schema::*;
use crate::types::*;

const PRINT_PROGRESS_STEP: u64 = 10;

/// Raw packets are made of 32-bit words; resync scans in these steps.
const WORD: u64 = 4;
const STX_BYTES: [u8; 4] = RAW_STX.to_le_bytes();

/// Raw packet fields, resolved from the layout once per extraction.
#[derive(Debug, Clone)]
struct RawFields {
    stx: FieldDescriptor,
    packet_id: FieldDescriptor,
    data_size: FieldDescriptor,
    timestamp_high: FieldDescriptor,
    timestamp_low: FieldDescriptor,
    ttl: FieldDescriptor,
    data: FieldDescriptor,
}

impl RawFields {
    fn resolve(layout: &RecordLayout) -> Result<Self> {
        Ok(RawFields {
            stx: layout.field("stx")?.clone(),
            packet_id: layout.field("packet_id")?.clone(),
            data_size: layout.field("packet_data_size")?.clone(),
            timestamp_high: layout.field("timestamp_high")?.clone(),
            timestamp_low: layout.field("timestamp_low")?.clone(),
            ttl: layout.field("ttl")?.clone(),
            data: layout.field("data")?.clone(),
        })
    }

    /// Joins the two timestamp halves into one μs value.
    fn timestamp(&self, packet: &[u8]) -> u64 {
        let high = self.timestamp_high.read_u32(packet, 0) as u64;
        let low = self.timestamp_low.read_u32(packet, 0) as u64;
        (high << 32) | low
    }
}

/// XOR of every 32-bit word of a packet. Zero for an intact packet.
pub fn checksum(packet: &[u8]) -> u32 {
    packet
        .chunks_exact(WORD as usize)
        .fold(0, |acc, word| acc ^ LittleEndian::read_u32(word))
}

/// The first check a raw packet failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketFault {
    StartOfFrame,
    PacketId,
    DataSize,
    Checksum,
    Timestamp,
}

/// Outcome of validating one buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferVerdict {
    /// Packets before the first bad one
    pub good: usize,
    /// What was wrong with the first bad packet, if any
    pub fault: Option<PacketFault>,
    /// Timestamp of the last good packet, or the incoming one if none was good
    pub last_timestamp: Option<u64>,
}

/// Checks raw packets of a system with a fixed channel count.
#[derive(Debug, Clone)]
pub struct PacketValidator {
    fields: RawFields,
    packet_size: usize,
    expected_data_size: i32,
}

impl PacketValidator {
    pub fn new(channel_count: usize) -> Result<Self> {
        let layout = RecordLayout::raw(channel_count);
        Ok(PacketValidator {
            fields: RawFields::resolve(&layout)?,
            packet_size: layout.size(),
            expected_data_size: (RAW_EXTRA_WORDS + channel_count) as i32,
        })
    }

    /// Size of one packet in bytes.
    pub fn packet_size(&self) -> usize {
        self.packet_size
    }

    /// Timestamp of a packet.
    pub fn timestamp(&self, packet: &[u8]) -> u64 {
        self.fields.timestamp(packet)
    }

    /// Runs every check on one packet, returning its timestamp if it passes.
    ///
    /// `previous` is the timestamp of the packet before it; timestamps must
    /// strictly increase.
    pub fn check(&self, packet: &[u8], previous: Option<u64>) -> std::result::Result<u64, PacketFault> {
        if self.fields.stx.read_i32(packet, 0) != RAW_STX as i32 {
            return Err(PacketFault::StartOfFrame);
        }
        if self.fields.packet_id.read_i32(packet, 0) != RAW_PACKET_ID {
            return Err(PacketFault::PacketId);
        }
        if self.fields.data_size.read_i32(packet, 0) != self.expected_data_size {
            return Err(PacketFault::DataSize);
        }
        if checksum(packet) != 0 {
            return Err(PacketFault::Checksum);
        }

        let timestamp = self.fields.timestamp(packet);
        if previous.map_or(false, |p| timestamp <= p) {
            return Err(PacketFault::Timestamp);
        }
        Ok(timestamp)
    }

    /// Finds the good prefix of a buffer of whole packets.
    pub fn validate_buffer(&self, buffer: &[u8], last_timestamp: Option<u64>) -> BufferVerdict {
        let mut previous = last_timestamp;
        for (i, packet) in buffer.chunks_exact(self.packet_size).enumerate() {
            match self.check(packet, previous) {
                Ok(timestamp) => previous = Some(timestamp),
                Err(fault) => {
                    return BufferVerdict {
                        good: i,
                        fault: Some(fault),
                        last_timestamp: previous,
                    }
                }
            }
        }

        BufferVerdict {
            good: buffer.len() / self.packet_size,
            fault: None,
            last_timestamp: previous,
        }
    }
}

/// Skips forward a word at a time until the next start-of-frame marker.
///
/// Leaves the reader on the marker and returns the bytes skipped. At end of
/// file every remaining byte counts as skipped.
pub fn scan_for_frame<R: Read + Seek>(reader: &mut R) -> io::Result<u64> {
    let mut word = [0u8; WORD as usize];
    let mut skipped = 0u64;

    loop {
        let n = fill_buffer(reader, &mut word)?;
        if n < word.len() {
            return Ok(skipped + n as u64);
        }
        if word == STX_BYTES {
            reader.seek(SeekFrom::Current(-(WORD as i64)))?;
            return Ok(skipped);
        }
        skipped += WORD;
    }
}

/// Helper function to read until `buf` is full or the stream ends
fn fill_buffer<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Validation {
    Strict { error_budget: u64 },
    Unchecked,
}

/// States of the extraction loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DemuxState {
    Read,
    Validate { start: u64, read: usize },
    Emit { start: u64, read: usize, good: usize },
    Resync { resume_at: u64 },
    Done(StopReason),
}

impl DemuxState {
    /// Next state once the good prefix of a buffer has been written.
    fn after_emit(
        report: &ExtractionReport,
        max_packets: Option<u64>,
        start: u64,
        read: usize,
        good: usize,
        packet_size: usize,
    ) -> DemuxState {
        if max_packets.map_or(false, |max| report.packets >= max) {
            return DemuxState::Done(StopReason::MaxPacketsReached);
        }
        if good < read {
            // One word past the good prefix, so the bad packet's own marker is not found again.
            return DemuxState::Resync {
                resume_at: start + (good * packet_size) as u64 + WORD,
            };
        }
        DemuxState::Read
    }

    /// Next state once the reader is back on a frame marker.
    fn after_resync(report: &ExtractionReport, policy: Validation) -> DemuxState {
        match policy {
            Validation::Strict { error_budget } if report.budget_errors() > error_budget => {
                DemuxState::Done(StopReason::ErrorBudgetExhausted)
            }
            _ => DemuxState::Read,
        }
    }
}

/// The append-only output streams of an extraction.
struct OutputStreams {
    timestamps: BufWriter<File>,
    ttl: BufWriter<File>,
    channels: Vec<(usize, BufWriter<File>)>,
}

impl OutputStreams {
    fn create(targets: &ExtractionTargets, channels: &[usize]) -> Result<Self> {
        let open = |path: &Path| -> io::Result<BufWriter<File>> {
            Ok(BufWriter::with_capacity(65536, File::create(path)?))
        };

        Ok(OutputStreams {
            timestamps: open(&targets.timestamps)?,
            ttl: open(&targets.ttl)?,
            channels: channels
                .iter()
                .zip(&targets.channels)
                .map(|(&channel, path)| -> io::Result<(usize, BufWriter<File>)> {
                    Ok((channel, open(path)?))
                })
                .collect::<io::Result<Vec<_>>>()?,
        })
    }

    fn write_packet(&mut self, fields: &RawFields, packet: &[u8]) -> io::Result<()> {
        self.timestamps
            .write_u64::<LittleEndian>(fields.timestamp(packet))?;
        self.ttl.write_u32::<LittleEndian>(fields.ttl.read_u32(packet, 0))?;
        for (channel, writer) in &mut self.channels {
            writer.write_i32::<LittleEndian>(fields.data.read_i32(packet, *channel))?;
        }
        Ok(())
    }

    fn finish(mut self) -> io::Result<()> {
        self.timestamps.flush()?;
        self.ttl.flush()?;
        for (_, writer) in &mut self.channels {
            writer.flush()?;
        }
        Ok(())
    }
}

/// Logs progress through the input file in fixed percent steps.
struct Progress {
    total_bytes: u64,
    next_percent: u64,
}

impl Progress {
    fn new(total_bytes: u64) -> Self {
        Progress {
            total_bytes,
            next_percent: PRINT_PROGRESS_STEP,
        }
    }

    fn update(&mut self, position: u64) {
        if self.total_bytes == 0 {
            return;
        }
        let percent = position.min(self.total_bytes) * 100 / self.total_bytes;
        if percent >= self.next_percent {
            log::info!("{}% done...", percent);
            self.next_percent = (percent / PRINT_PROGRESS_STEP + 1) * PRINT_PROGRESS_STEP;
        }
    }
}

/// State carried from one buffer to the next.
struct ExtractionSession<R> {
    reader: R,
    outputs: OutputStreams,
    validator: PacketValidator,
    policy: Validation,
    buffer: Vec<u8>,
    max_packets: Option<u64>,
    last_timestamp: Option<u64>,
    report: ExtractionReport,
    progress: Progress,
}

impl<R: Read + Seek> ExtractionSession<R> {
    fn run(mut self) -> Result<ExtractionReport> {
        let mut state = DemuxState::Read;
        let reason = loop {
            state = match state {
                DemuxState::Read => self.read()?,
                DemuxState::Validate { start, read } => self.validate(start, read),
                DemuxState::Emit { start, read, good } => self.emit(start, read, good)?,
                DemuxState::Resync { resume_at } => self.resync(resume_at)?,
                DemuxState::Done(reason) => break reason,
            };
        };

        if reason == StopReason::ErrorBudgetExhausted {
            log::warn!(
                "Too many errors ({}), stopping early",
                self.report.budget_errors()
            );
        }

        self.report.stop_reason = reason;
        self.outputs.finish()?;
        Ok(self.report)
    }

    fn read(&mut self) -> Result<DemuxState> {
        let start = self.reader.stream_position()?;
        let filled = fill_buffer(&mut self.reader, &mut self.buffer)?;
        let packet_size = self.validator.packet_size();
        let read = filled / packet_size;

        if filled % packet_size != 0 {
            log::warn!(
                "Ignoring {} trailing bytes after the last complete raw packet",
                filled % packet_size
            );
        }
        self.progress.update(start + filled as u64);

        if read == 0 {
            Ok(DemuxState::Done(StopReason::EndOfFile))
        } else {
            Ok(DemuxState::Validate { start, read })
        }
    }

    fn validate(&mut self, start: u64, read: usize) -> DemuxState {
        let packet_size = self.validator.packet_size();
        let packets = &self.buffer[..read * packet_size];

        let verdict = match self.policy {
            Validation::Strict { .. } => self.validator.validate_buffer(packets, self.last_timestamp),
            Validation::Unchecked => BufferVerdict {
                good: read,
                fault: None,
                last_timestamp: Some(self.validator.timestamp(&packets[(read - 1) * packet_size..])),
            },
        };

        if let Some(fault) = verdict.fault {
            let offset = verdict.good * packet_size;
            let bad_timestamp = self.validator.timestamp(&packets[offset..]);
            self.tally(fault, start + offset as u64, bad_timestamp);
        }
        self.last_timestamp = verdict.last_timestamp;

        DemuxState::Emit {
            start,
            read,
            good: verdict.good,
        }
    }

    fn tally(&mut self, fault: PacketFault, position: u64, timestamp: u64) {
        match fault {
            PacketFault::StartOfFrame => self.report.stx_errors += 1,
            PacketFault::PacketId => self.report.packet_id_errors += 1,
            PacketFault::DataSize => self.report.packet_size_errors += 1,
            PacketFault::Checksum => self.report.crc_errors += 1,
            PacketFault::Timestamp => {
                log::info!("Out of order timestamp {}", timestamp);
                self.report.timestamp_errors += 1;
            }
        }
        log::debug!("{:?} fault in packet at byte {}", fault, position);
    }

    fn emit(&mut self, start: u64, read: usize, good: usize) -> Result<DemuxState> {
        let packet_size = self.validator.packet_size();
        for packet in self.buffer[..good * packet_size].chunks_exact(packet_size) {
            self.outputs.write_packet(&self.validator.fields, packet)?;
        }
        self.report.packets += good as u64;

        Ok(DemuxState::after_emit(
            &self.report,
            self.max_packets,
            start,
            read,
            good,
            packet_size,
        ))
    }

    fn resync(&mut self, resume_at: u64) -> Result<DemuxState> {
        self.reader.seek(SeekFrom::Start(resume_at))?;
        let skipped = WORD + scan_for_frame(&mut self.reader)?;
        self.report.garbage_bytes += skipped;
        log::debug!("Skipped {} bytes to the next frame marker", skipped);

        Ok(DemuxState::after_resync(&self.report, self.policy))
    }
}

/// Reads a raw file with every packet checked, writing the selected streams.
///
/// # Arguments
///
/// * `path` - The `.nrd` file
/// * `targets` - Where the timestamp, TTL and channel streams go
/// * `options` - Channel selection, buffer size, packet limit and error budget
///
/// # Returns
///
/// Diagnostics for the run. Framing faults never fail the call; only I/O
/// errors and invalid options do.
pub fn extract_raw<P: AsRef<Path>>(path: P, targets: &ExtractionTargets, options: &ExtractionOptions) -> Result<ExtractionReport> {
    log::info!("Extracting with error checking, every packet is validated");
    extract(
        path.as_ref(),
        targets,
        options,
        Validation::Strict {
            error_budget: options.error_budget,
        },
    )
}

/// Reads a raw file without any checks, writing the selected streams.
///
/// Same outputs as [`extract_raw`] on a clean file, faster. Only use it on
/// recordings the acquisition software reported no dropped or corrupt packets
/// for; `options.error_budget` is ignored.
pub fn extract_raw_fast<P: AsRef<Path>>(path: P, targets: &ExtractionTargets, options: &ExtractionOptions) -> Result<ExtractionReport> {
    log::info!("Extracting without error checking, packets are assumed well formed");
    extract(path.as_ref(), targets, options, Validation::Unchecked)
}

/// Helper function shared by both extraction modes
fn extract(
    path: &Path,
    targets: &ExtractionTargets,
    options: &ExtractionOptions,
    policy: Validation,
) -> Result<ExtractionReport> {
    let tic = Instant::now();
    options.validate(targets)?;
    let validator = PacketValidator::new(options.channel_count)?;

    let file = File::open(path)?;
    let file_size = file.metadata()?.len();
    let mut reader = BufReader::with_capacity(65536, file);

    let header = read_header(&mut reader)?;
    log::info!(
        "File header: {}",
        header.text().lines().next().unwrap_or("")
    );

    let outputs = OutputStreams::create(targets, &options.channels)?;
    let mut report = ExtractionReport::default();
    report.garbage_bytes += scan_for_frame(&mut reader)?;

    let buffer = vec![0u8; options.effective_buffer_size() * validator.packet_size()];
    let session = ExtractionSession {
        reader,
        outputs,
        validator,
        policy,
        buffer,
        max_packets: options.max_packets,
        last_timestamp: None,
        report,
        progress: Progress::new(file_size),
    };
    let report = session.run()?;

    log_report(&report);
    log::info!(
        "Done! Elapsed time: {:.1} seconds",
        tic.elapsed().as_secs_f64()
    );
    Ok(report)
}

/// Helper function to log the diagnostics of a run
fn log_report(report: &ExtractionReport) {
    log::info!("Extracted {} packets", report.packets);
    log::info!("{} garbage bytes", report.garbage_bytes);
    log::info!("{} buffers had a bad stx", report.stx_errors);
    log::info!("{} buffers had a bad packet id", report.packet_id_errors);
    log::info!("{} buffers had a bad packet size", report.packet_size_errors);
    log::info!("{} buffers had a bad crc", report.crc_errors);
    log::info!(
        "{} buffers had out of order timestamps",
        report.timestamp_errors
    );
}

/// Reads back a stream written by [`extract_raw`] or [`extract_raw_fast`].
pub fn read_extracted<P: AsRef<Path>>(path: P, kind: ExtractedKind) -> Result<ExtractedData> {
    let path = path.as_ref();
    let bytes = fs::read(path)?;
    let element_size = kind.element_size();

    if bytes.len() % element_size != 0 {
        return Err(LynxError::FileSize {
            path: path.to_path_buf(),
            len: bytes.len() as u64,
            element_size,
        });
    }
    let n = bytes.len() / element_size;

    let data = match kind {
        ExtractedKind::Timestamps => {
            let mut values = vec![0u64; n];
            LittleEndian::read_u64_into(&bytes, &mut values);
            ExtractedData::Timestamps(Array1::from_vec(values))
        }
        ExtractedKind::Ttl => {
            let mut values = vec![0u32; n];
            LittleEndian::read_u32_into(&bytes, &mut values);
            ExtractedData::Ttl(Array1::from_vec(values))
        }
        ExtractedKind::AdData => {
            let mut values = vec![0i32; n];
            LittleEndian::read_i32_into(&bytes, &mut values);
            ExtractedData::AdData(Array1::from_vec(values))
        }
    };

    Ok(data)
}
