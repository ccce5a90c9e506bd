#![allow(dead_code)]

use byteorder::{LittleEndian, WriteBytesExt};
use neuralynx_importer::header::write_header;
use neuralynx_importer::schema::{RAW_EXTRA_WORDS, RAW_PACKET_ID, RAW_STX, SAMPLES_PER_PACKET};
use neuralynx_importer::Header;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Duration of one full packet at 32 kHz (μs).
pub const PACKET_US_32K: u64 = 16_000;

/// Writes a continuous-signal file with full packets.
///
/// `sample(packet, slot)` gives the value of every sample.
pub fn write_continuous<F>(path: &Path, channel: u32, rates: &[u32], timestamps: &[u64], sample: F)
where
    F: Fn(usize, usize) -> i16,
{
    let mut writer = BufWriter::new(File::create(path).unwrap());
    write_header(&mut writer, &Header::with_remarks("######## Neuralynx Data File Header").unwrap()).unwrap();

    for (i, &timestamp) in timestamps.iter().enumerate() {
        writer.write_u64::<LittleEndian>(timestamp).unwrap();
        writer.write_u32::<LittleEndian>(channel).unwrap();
        writer.write_u32::<LittleEndian>(rates[i % rates.len()]).unwrap();
        writer.write_u32::<LittleEndian>(SAMPLES_PER_PACKET as u32).unwrap();
        for slot in 0..SAMPLES_PER_PACKET {
            writer.write_i16::<LittleEndian>(sample(i, slot)).unwrap();
        }
    }
    writer.flush().unwrap();
}

/// Timestamps of `n` back-to-back 32 kHz packets.
pub fn contiguous_timestamps(first: u64, n: usize) -> Vec<u64> {
    (0..n as u64).map(|i| first + i * PACKET_US_32K).collect()
}

/// One raw packet with a valid checksum.
///
/// The first extra word carries bit 30 so no checksum ever looks like a frame marker.
pub fn raw_packet(timestamp: u64, ttl: u32, data: &[i32]) -> Vec<u8> {
    let mut words: Vec<u32> = vec![
        RAW_STX,
        RAW_PACKET_ID as u32,
        (RAW_EXTRA_WORDS + data.len()) as u32,
        (timestamp >> 32) as u32,
        timestamp as u32,
        0,
        ttl,
    ];
    let mut extra = [0u32; RAW_EXTRA_WORDS];
    extra[0] = 0x4000_0000;
    words.extend(extra);
    words.extend(data.iter().map(|&d| d as u32));
    words.push(words.iter().fold(0, |acc, w| acc ^ w));

    words.iter().flat_map(|w| w.to_le_bytes()).collect()
}

pub const RAW_CHANNELS: usize = 8;
pub const RAW_PACKET_SIZE: usize = 4 * (18 + RAW_CHANNELS);

pub fn raw_timestamp(i: usize) -> u64 {
    1_000_000 + i as u64 * 1_000
}

pub fn raw_sample(channel: usize, i: usize) -> i32 {
    (channel * 1_000 + i + 1) as i32
}

/// The `i`-th packet of the synthetic 8-channel recording.
pub fn nth_raw_packet(i: usize) -> Vec<u8> {
    let data: Vec<i32> = (0..RAW_CHANNELS).map(|ch| raw_sample(ch, i)).collect();
    raw_packet(raw_timestamp(i), (i % 4) as u32, &data)
}

/// Packets of the synthetic recording, one buffer each.
pub fn raw_packets(n: usize) -> Vec<Vec<u8>> {
    (0..n).map(nth_raw_packet).collect()
}

/// Flips a checksum bit, leaving every other word intact.
pub fn corrupt_checksum(packet: &mut [u8]) {
    let last = packet.len() - 4;
    packet[last] ^= 1;
}

/// Writes a header followed by `body`.
pub fn write_raw(path: &Path, body: &[u8]) {
    let mut file = File::create(path).unwrap();
    write_header(&mut file, &Header::with_remarks("######## Neuralynx Raw Data").unwrap()).unwrap();
    file.write_all(body).unwrap();
}
