use byteorder::{LittleEndian, WriteBytesExt};
use ndarray::{Array1, Array2};
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;

use crate::header::{read_header, write_header, Header};
use crate::schema::*;
use crate::types::*;

/// Reads the rest of a stream and returns the bytes of its whole records.
///
/// A trailing partial record is dropped with a warning; recorders leave one
/// behind when acquisition stops mid-write.
pub(crate) fn read_record_bytes<R: Read>(reader: &mut R, layout: &RecordLayout) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    reader.read_to_end(&mut bytes)?;

    let leftover = bytes.len() % layout.size();
    if leftover != 0 {
        log::warn!(
            "Ignoring {} trailing bytes after the last complete {} record",
            leftover,
            layout.kind().name()
        );
        bytes.truncate(bytes.len() - leftover);
    }

    Ok(bytes)
}

/// Reads an event (`.nev`) file.
///
/// # Arguments
///
/// * `reader` - Stream positioned at the start of the file
/// * `parse_labels` - Also decode every label into a trimmed string. Most
///   callers only need timestamps and TTL values, so this is opt-in.
pub fn read_event<R: Read>(reader: &mut R, parse_labels: bool) -> Result<EventFile> {
    let header = read_header(reader)?;
    let layout = RecordLayout::event();
    let bytes = read_record_bytes(reader, &layout)?;
    let events = decode_events(&layout, &bytes)?;
    log::debug!("{} events", events.len());

    let labels = if parse_labels {
        log::info!("Decoding event labels. This makes things slower.");
        Some(events.iter().map(EventRecord::label_text).collect())
    } else {
        None
    };

    Ok(EventFile {
        header,
        events,
        labels,
    })
}

/// Helper function to decode event records
fn decode_events(layout: &RecordLayout, bytes: &[u8]) -> Result<Vec<EventRecord>> {
    let stx = layout.field("stx")?;
    let packet_id = layout.field("packet_id")?;
    let packet_data_size = layout.field("packet_data_size")?;
    let timestamp = layout.field("timestamp")?;
    let event_id = layout.field("event_id")?;
    let ttl = layout.field("ttl")?;
    let crc = layout.field("crc")?;
    let dummy1 = layout.field("dummy1")?;
    let dummy2 = layout.field("dummy2")?;
    let extra = layout.field("extra")?;
    let label = layout.field("label")?;

    let events = bytes
        .chunks_exact(layout.size())
        .map(|record| {
            let mut extra_words = [0i32; EVENT_EXTRA_WORDS];
            for (i, word) in extra_words.iter_mut().enumerate() {
                *word = extra.read_i32(record, i);
            }
            let mut label_bytes = [0u8; EVENT_LABEL_BYTES];
            label_bytes.copy_from_slice(label.bytes(record));

            EventRecord {
                stx: stx.read_i16(record, 0),
                packet_id: packet_id.read_i16(record, 0),
                packet_data_size: packet_data_size.read_i16(record, 0),
                timestamp: timestamp.read_u64(record, 0),
                event_id: event_id.read_i16(record, 0),
                ttl: ttl.read_u16(record, 0),
                crc: crc.read_i16(record, 0),
                dummy1: dummy1.read_i16(record, 0),
                dummy2: dummy2.read_i16(record, 0),
                extra: extra_words,
                label: label_bytes,
            }
        })
        .collect();

    Ok(events)
}

/// Reads a single-electrode spike (`.nse`) file.
pub fn read_spike<R: Read>(reader: &mut R) -> Result<SpikeFile> {
    let header = read_header(reader)?;
    let layout = RecordLayout::spike();
    let bytes = read_record_bytes(reader, &layout)?;
    let spikes = decode_spikes(&layout, &bytes)?;
    log::debug!("{} spikes", spikes.len());

    Ok(SpikeFile { header, spikes })
}

/// Helper function to decode spike records into columns
fn decode_spikes(layout: &RecordLayout, bytes: &[u8]) -> Result<SpikeRecords> {
    let timestamp = layout.field("timestamp")?;
    let entity = layout.field("acquisition_entity")?;
    let cell = layout.field("cell_number")?;
    let features = layout.field("features")?;
    let waveform = layout.field("waveform")?;

    let size = layout.size();
    let n = bytes.len() / size;
    let record = |i: usize| &bytes[i * size..(i + 1) * size];

    Ok(SpikeRecords {
        timestamps: Array1::from_shape_fn(n, |i| timestamp.read_u64(record(i), 0)),
        acquisition_entities: Array1::from_shape_fn(n, |i| entity.read_u32(record(i), 0)),
        cell_numbers: Array1::from_shape_fn(n, |i| cell.read_u32(record(i), 0)),
        features: Array2::from_shape_fn((n, SPIKE_FEATURES), |(i, j)| {
            features.read_u32(record(i), j)
        }),
        waveforms: Array2::from_shape_fn((n, SPIKE_WAVEFORM_SAMPLES), |(i, j)| {
            waveform.read_i16(record(i), j)
        }),
    })
}

/// Writes the given timestamps out as a spike file.
///
/// Meant for building fixtures: `remarks` go into the header, every record
/// gets acquisition entity 1 and cell 1, features and waveforms are zero.
pub fn write_spike<P: AsRef<Path>>(path: P, timestamps: &[u64], remarks: &str) -> Result<()> {
    let header = Header::with_remarks(remarks)?;
    let mut writer = BufWriter::with_capacity(65536, File::create(path.as_ref())?);

    write_header(&mut writer, &header)?;
    for &timestamp in timestamps {
        writer.write_u64::<LittleEndian>(timestamp)?;
        writer.write_u32::<LittleEndian>(1)?;
        writer.write_u32::<LittleEndian>(1)?;
        for _ in 0..SPIKE_FEATURES {
            writer.write_u32::<LittleEndian>(0)?;
        }
        for _ in 0..SPIKE_WAVEFORM_SAMPLES {
            writer.write_i16::<LittleEndian>(0)?;
        }
    }
    writer.flush()?;

    log::debug!(
        "Wrote {} spikes to {}",
        timestamps.len(),
        path.as_ref().display()
    );
    Ok(())
}
