use memmap2::Mmap;
use ndarray::{Array1, Array2};
use std::fs::File;
use std::io::{BufReader, Read};
use std::ops::Range;
use std::path::Path;
use std::time::Instant;

use crate::config::ContinuousOptions;
use crate::header::{read_header, Header, HEADER_SIZE};
use crate::reader::read_record_bytes;
use crate::schema::*;
use crate::types::*;

/// Largest standard deviation of the reported rate still treated as fixed (Hz).
const RATE_TOLERANCE_HZ: f64 = 1e-6;

/// A delta longer than one packet plus one sample marks a gap.
///
/// The nominal rate is rounded to whole Hz, so a plain 512-sample packet
/// duration comes out a microsecond or two short at high rates.
const GAP_THRESHOLD_SAMPLES: f64 = (SAMPLES_PER_PACKET + 1) as f64;

/// Reads a continuous-signal (`.ncs`) stream.
///
/// # Arguments
///
/// * `reader` - Stream positioned at the start of the file
/// * `assume_uniform_rate` - Rebuild a contiguous trace, padding gaps with zeros.
///   Downgraded with a warning if the reported rate changes during the record.
///
/// # Returns
///
/// The header and packets, plus the reconstructed trace when one was built.
pub fn read_continuous<R: Read>(reader: &mut R, assume_uniform_rate: bool) -> Result<ContinuousRecording> {
    let tic = Instant::now();

    let header = read_header(reader)?;
    let layout = RecordLayout::continuous();
    let bytes = read_record_bytes(reader, &layout)?;
    let packets = decode_continuous_packets(&layout, &bytes)?;
    log::info!("Read {} continuous-signal packets", packets.len());

    let mut reconstruct_trace = assume_uniform_rate;
    if reconstruct_trace && !rate_is_uniform(&packets.sampling_rates) {
        log::warn!("Sampling rate is not fixed across the record, not packing packets together");
        reconstruct_trace = false;
    }

    let reconstruction = if reconstruct_trace {
        reconstruct(&packets)
    } else {
        None
    };

    log::info!(
        "Done! Elapsed time: {:.1} seconds",
        tic.elapsed().as_secs_f64()
    );

    Ok(ContinuousRecording {
        header,
        packets,
        reconstruction,
    })
}

/// Decodes continuous-signal records into columns.
pub(crate) fn decode_continuous_packets(layout: &RecordLayout, bytes: &[u8]) -> Result<ContinuousPackets> {
    let timestamp = layout.field("timestamp")?;
    let channel = layout.field("channel")?;
    let rate = layout.field("sampling_rate")?;
    let valid = layout.field("valid_sample_count")?;
    let samples = layout.field("samples")?;

    let size = layout.size();
    let n = bytes.len() / size;
    let record = |i: usize| &bytes[i * size..(i + 1) * size];

    Ok(ContinuousPackets {
        timestamps: Array1::from_shape_fn(n, |i| timestamp.read_u64(record(i), 0)),
        channels: Array1::from_shape_fn(n, |i| channel.read_u32(record(i), 0)),
        sampling_rates: Array1::from_shape_fn(n, |i| rate.read_u32(record(i), 0)),
        valid_sample_counts: Array1::from_shape_fn(n, |i| valid.read_u32(record(i), 0)),
        samples: Array2::from_shape_fn((n, SAMPLES_PER_PACKET), |(i, j)| {
            samples.read_i16(record(i), j)
        }),
    })
}

/// Whether the reported sampling rate stays fixed across all packets.
pub fn rate_is_uniform(rates: &Array1<u32>) -> bool {
    if rates.len() < 2 {
        return true;
    }
    rates.mapv(|r| r as f64).std(0.0) <= RATE_TOLERANCE_HZ
}

/// Rebuilds a contiguous, zero-padded trace from the packets.
///
/// Returns `None` when there is nothing to rebuild from (no packets, or a
/// zero nominal rate).
pub fn reconstruct(packets: &ContinuousPackets) -> Option<Reconstruction> {
    if packets.is_empty() {
        log::warn!("No packets in record, nothing to reconstruct");
        return None;
    }

    let nominal_rate = packets.sampling_rates[0] as f64;
    if nominal_rate <= 0.0 {
        log::warn!("Record reports a sampling rate of 0 Hz, nothing to reconstruct");
        return None;
    }

    let max_delta_us = GAP_THRESHOLD_SAMPLES * 1e6 / nominal_rate;
    let sections = find_sections(&packets.timestamps, max_delta_us);
    if sections.len() > 1 {
        log::debug!("{} gaps in record, padding", sections.len() - 1);
    }

    let sampling_rate = estimate_sampling_rate(packets, &sections).unwrap_or_else(|| {
        log::warn!(
            "No two adjacent packets to estimate the sampling rate from, using the nominal {} Hz",
            nominal_rate
        );
        nominal_rate
    });

    let (trace, gaps) = pad_sections(packets, &sections, sampling_rate);

    Some(Reconstruction {
        sampling_rate,
        trace,
        first_timestamp: packets.timestamps[0],
        gaps,
    })
}

/// Splits packet indices into contiguous sections.
///
/// A new section starts wherever the delta to the previous packet exceeds
/// `max_delta_us`.
fn find_sections(timestamps: &Array1<u64>, max_delta_us: f64) -> Vec<Range<usize>> {
    let mut sections = Vec::new();
    if timestamps.is_empty() {
        return sections;
    }

    let mut start = 0;
    for i in 1..timestamps.len() {
        let delta_us = timestamps[i] as f64 - timestamps[i - 1] as f64;
        if delta_us > max_delta_us {
            sections.push(start..i);
            start = i;
        }
    }
    sections.push(start..timestamps.len());

    sections
}

/// Estimates the effective sampling rate from adjacent packets within sections.
///
/// Each pair contributes `valid_sample_count / elapsed_seconds` of its first
/// packet; the estimate is the mean over all pairs. Pairs whose timestamps do
/// not increase are skipped.
fn estimate_sampling_rate(packets: &ContinuousPackets, sections: &[Range<usize>]) -> Option<f64> {
    let timestamps = &packets.timestamps;
    let mut rate_sum = 0.0;
    let mut pairs = 0usize;

    for section in sections {
        for i in section.start..section.end.saturating_sub(1) {
            let delta_us = timestamps[i + 1] as f64 - timestamps[i] as f64;
            if delta_us <= 0.0 {
                continue;
            }
            rate_sum += packets.valid_sample_counts[i] as f64 / (delta_us / 1e6);
            pairs += 1;
        }
    }

    if pairs == 0 {
        None
    } else {
        Some(rate_sum / pairs as f64)
    }
}

/// Concatenates sections, inserting zeros before every section after the first.
///
/// The padding before a section brings the trace up to the sample index its
/// first timestamp falls on, measured from the first packet of the record.
fn pad_sections(
    packets: &ContinuousPackets,
    sections: &[Range<usize>],
    sampling_rate: f64,
) -> (Array1<i16>, Vec<Gap>) {
    let timestamps = &packets.timestamps;
    let first_timestamp = timestamps[0];
    let mut trace: Vec<i16> = Vec::new();
    let mut gaps = Vec::with_capacity(sections.len().saturating_sub(1));

    for (n, section) in sections.iter().enumerate() {
        if n > 0 {
            let timestamp = timestamps[section.start];
            let elapsed_s = timestamp.saturating_sub(first_timestamp) as f64 / 1e6;
            let target = (elapsed_s * sampling_rate).round() as i64;
            let padding = target - trace.len() as i64;
            let padding = if padding < 0 {
                log::warn!(
                    "Section at packet {} overlaps the previous one by {} samples, not padding",
                    section.start,
                    -padding
                );
                0
            } else {
                padding as usize
            };

            trace.resize(trace.len() + padding, 0);
            gaps.push(Gap {
                packet_index: section.start,
                timestamp,
                padding,
            });
        }

        for i in section.clone() {
            let count = (packets.valid_sample_counts[i] as usize).min(SAMPLES_PER_PACKET);
            trace.extend(packets.samples.row(i).iter().take(count));
        }
    }

    (Array1::from_vec(trace), gaps)
}

/// Per-sample timestamps (μs) for every slot of every packet.
///
/// Samples within a packet are spaced `1e6 / sampling_rate` apart starting at
/// the packet timestamp. With `relative_to_first`, the first sample is time 0.
pub fn time_axis(timestamps: &Array1<u64>, sampling_rate: f64, relative_to_first: bool) -> Array1<u64> {
    let sample_duration_us = 1e6 / sampling_rate;
    let mut time = Array1::<u64>::zeros(timestamps.len() * SAMPLES_PER_PACKET);

    for (packet, &timestamp) in timestamps.iter().enumerate() {
        for slot in 0..SAMPLES_PER_PACKET {
            time[packet * SAMPLES_PER_PACKET + slot] =
                timestamp + (slot as f64 * sample_duration_us) as u64;
        }
    }

    if relative_to_first && !time.is_empty() {
        let first = time[0];
        time.mapv_inplace(|t| t.saturating_sub(first));
    }

    time
}

/// A continuous-signal file mapped into memory.
///
/// Packets are decoded on demand; no trace is reconstructed, since that
/// needs every timestamp in memory anyway.
#[derive(Debug)]
pub struct MappedContinuous {
    header: Header,
    mmap: Mmap,
    layout: RecordLayout,
    num_packets: usize,
}

impl MappedContinuous {
    /// Maps the file at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        // SAFETY: the map is read-only and the crate never writes to recorder files.
        let mmap = unsafe { Mmap::map(&file)? };

        if mmap.len() < HEADER_SIZE {
            return Err(LynxError::TruncatedFile {
                expected: HEADER_SIZE,
                found: mmap.len(),
            });
        }

        let layout = RecordLayout::continuous();
        let data_len = mmap.len() - HEADER_SIZE;
        let num_packets = data_len / layout.size();
        if data_len % layout.size() != 0 {
            log::warn!(
                "Ignoring {} trailing bytes after the last complete continuous record",
                data_len % layout.size()
            );
        }

        Ok(MappedContinuous {
            header: Header::from_bytes(mmap[..HEADER_SIZE].to_vec()),
            mmap,
            layout,
            num_packets,
        })
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    /// Number of complete packets in the file.
    pub fn len(&self) -> usize {
        self.num_packets
    }

    pub fn is_empty(&self) -> bool {
        self.num_packets == 0
    }

    fn record_bytes(&self) -> &[u8] {
        &self.mmap[HEADER_SIZE..HEADER_SIZE + self.num_packets * self.layout.size()]
    }

    fn record(&self, index: usize) -> &[u8] {
        let size = self.layout.size();
        &self.record_bytes()[index * size..(index + 1) * size]
    }

    /// Timestamp of every packet.
    pub fn timestamps(&self) -> Result<Array1<u64>> {
        let timestamp = self.layout.field("timestamp")?;
        Ok(Array1::from_shape_fn(self.num_packets, |i| {
            timestamp.read_u64(self.record(i), 0)
        }))
    }

    /// The valid samples of every packet, back to back.
    pub fn valid_samples(&self) -> Result<Array1<i16>> {
        let valid = self.layout.field("valid_sample_count")?;
        let samples = self.layout.field("samples")?;

        let mut out = Vec::new();
        for i in 0..self.num_packets {
            let record = self.record(i);
            let count = (valid.read_u32(record, 0) as usize).min(SAMPLES_PER_PACKET);
            out.extend((0..count).map(|j| samples.read_i16(record, j)));
        }
        Ok(Array1::from_vec(out))
    }

    /// Decodes every packet into memory.
    pub fn to_packets(&self) -> Result<ContinuousPackets> {
        decode_continuous_packets(&self.layout, self.record_bytes())
    }
}

/// A continuous-signal file, either read in full or mapped.
#[derive(Debug)]
pub enum ContinuousSource {
    Loaded(ContinuousRecording),
    Mapped(MappedContinuous),
}

impl ContinuousSource {
    pub fn header(&self) -> &Header {
        match self {
            ContinuousSource::Loaded(recording) => &recording.header,
            ContinuousSource::Mapped(mapped) => mapped.header(),
        }
    }

    /// The samples that stand for this channel in a channel matrix.
    pub fn channel_samples(&self) -> Result<Array1<i16>> {
        match self {
            ContinuousSource::Loaded(recording) => Ok(recording.channel_samples()),
            ContinuousSource::Mapped(mapped) => mapped.valid_samples(),
        }
    }
}

/// Opens a continuous-signal file the way `options` ask for.
pub fn load_continuous<P: AsRef<Path>>(path: P, options: &ContinuousOptions) -> Result<ContinuousSource> {
    if options.memory_map {
        return Ok(ContinuousSource::Mapped(MappedContinuous::open(path)?));
    }

    let file = File::open(path.as_ref())?;
    let mut reader = BufReader::with_capacity(65536, file);
    let recording = read_continuous(&mut reader, options.assume_uniform_rate)?;
    Ok(ContinuousSource::Loaded(recording))
}
