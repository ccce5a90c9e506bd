mod common;

use common::*;
use neuralynx_importer::*;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

const SELECTED: [usize; 2] = [0, 7];

fn options() -> ExtractionOptions {
    ExtractionOptions {
        channel_count: RAW_CHANNELS,
        channels: SELECTED.to_vec(),
        ..Default::default()
    }
}

fn timestamps(out: &Path) -> Vec<u64> {
    match read_extracted(out.join("timestamps.raw"), ExtractedKind::Timestamps).unwrap() {
        ExtractedData::Timestamps(ts) => ts.to_vec(),
        other => panic!("unexpected stream {:?}", other),
    }
}

fn channel(out: &Path, ch: usize) -> Vec<i32> {
    match read_extracted(out.join(format!("chan_{}.raw", ch)), ExtractedKind::AdData).unwrap() {
        ExtractedData::AdData(data) => data.to_vec(),
        other => panic!("unexpected stream {:?}", other),
    }
}

#[test]
fn clean_file_is_fully_extracted() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("raw.nrd");
    write_raw(&input, &raw_packets(20).concat());

    let targets = ExtractionTargets::in_folder(dir.path(), &SELECTED);
    let report = extract_raw(&input, &targets, &options()).unwrap();

    assert_eq!(report.packets, 20);
    assert_eq!(report.garbage_bytes, 0);
    assert_eq!(report.total_errors(), 0);
    assert_eq!(report.stop_reason, StopReason::EndOfFile);

    assert_eq!(timestamps(dir.path()), (0..20).map(raw_timestamp).collect::<Vec<_>>());
    assert_eq!(channel(dir.path(), 7), (0..20).map(|i| raw_sample(7, i)).collect::<Vec<_>>());

    match read_extracted(&targets.ttl, ExtractedKind::Ttl).unwrap() {
        ExtractedData::Ttl(ttl) => assert_eq!(ttl.to_vec()[..5], [0, 1, 2, 3, 0]),
        other => panic!("unexpected stream {:?}", other),
    }
}

#[test]
fn bad_checksum_drops_one_packet() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("raw.nrd");
    let mut packets = raw_packets(20);
    corrupt_checksum(&mut packets[5]);
    write_raw(&input, &packets.concat());

    let targets = ExtractionTargets::in_folder(dir.path(), &SELECTED);
    let report = extract_raw(&input, &targets, &options()).unwrap();

    assert_eq!(report.packets, 19);
    assert_eq!(report.crc_errors, 1);
    assert_eq!(report.garbage_bytes, RAW_PACKET_SIZE as u64);
    assert_eq!(report.stop_reason, StopReason::EndOfFile);

    let ts = timestamps(dir.path());
    assert_eq!(ts.len(), 19);
    assert!(!ts.contains(&raw_timestamp(5)));
    assert_eq!(channel(dir.path(), 0)[5], raw_sample(0, 6));
}

#[test]
fn repeated_timestamp_is_dropped() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("raw.nrd");
    let mut packets = raw_packets(20);
    let data: Vec<i32> = (0..RAW_CHANNELS).map(|ch| raw_sample(ch, 10)).collect();
    packets[10] = raw_packet(raw_timestamp(9), 2, &data);
    write_raw(&input, &packets.concat());

    let targets = ExtractionTargets::in_folder(dir.path(), &SELECTED);
    let report = extract_raw(&input, &targets, &options()).unwrap();

    assert_eq!(report.timestamp_errors, 1);
    assert_eq!(report.packets, 19);
    let ts = timestamps(dir.path());
    assert!(ts.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn garbage_between_packets_is_skipped() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("raw.nrd");
    let packets = raw_packets(20);

    let mut body = vec![0xEEu8; 8];
    for (i, packet) in packets.iter().enumerate() {
        if i == 4 {
            body.extend([0xFFu8; 12]);
        }
        body.extend(packet);
    }
    write_raw(&input, &body);

    let targets = ExtractionTargets::in_folder(dir.path(), &SELECTED);
    let report = extract_raw(&input, &targets, &options()).unwrap();

    assert_eq!(report.packets, 20);
    assert_eq!(report.stx_errors, 1);
    assert_eq!(report.garbage_bytes, 8 + 12);
    assert_eq!(timestamps(dir.path()).len(), 20);
}

#[test]
fn error_budget_stops_extraction() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("raw.nrd");
    let mut packets = raw_packets(20);
    for i in [2, 5, 8] {
        corrupt_checksum(&mut packets[i]);
    }
    write_raw(&input, &packets.concat());

    let targets = ExtractionTargets::in_folder(dir.path(), &SELECTED);
    let options = ExtractionOptions {
        error_budget: 1,
        ..options()
    };
    let report = extract_raw(&input, &targets, &options).unwrap();

    assert_eq!(report.stop_reason, StopReason::ErrorBudgetExhausted);
    assert_eq!(report.crc_errors, 2);
    assert_eq!(report.packets, 4);
}

#[test]
fn packet_limit_may_overshoot_by_one_buffer() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("raw.nrd");
    write_raw(&input, &raw_packets(20).concat());

    let targets = ExtractionTargets::in_folder(dir.path(), &SELECTED);
    let options = ExtractionOptions {
        buffer_size: 3,
        max_packets: Some(7),
        ..options()
    };
    let report = extract_raw(&input, &targets, &options).unwrap();

    assert_eq!(report.stop_reason, StopReason::MaxPacketsReached);
    assert_eq!(report.packets, 9);
    assert_eq!(timestamps(dir.path()).len(), 9);
}

#[test]
fn fast_mode_matches_strict_mode_on_clean_file() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("raw.nrd");
    write_raw(&input, &raw_packets(25).concat());

    let strict_dir = dir.path().join("strict");
    let fast_dir = dir.path().join("fast");
    fs::create_dir(&strict_dir).unwrap();
    fs::create_dir(&fast_dir).unwrap();

    let options = ExtractionOptions {
        buffer_size: 4,
        ..options()
    };
    let strict = extract_raw(&input, &ExtractionTargets::in_folder(&strict_dir, &SELECTED), &options).unwrap();
    let fast = extract_raw_fast(&input, &ExtractionTargets::in_folder(&fast_dir, &SELECTED), &options).unwrap();
    assert_eq!(strict, fast);

    for name in ["timestamps.raw", "ttl.raw", "chan_0.raw", "chan_7.raw"] {
        assert_eq!(
            fs::read(strict_dir.join(name)).unwrap(),
            fs::read(fast_dir.join(name)).unwrap(),
            "{} differs",
            name
        );
    }
}

#[test]
fn invalid_options_are_rejected_before_reading() {
    let dir = TempDir::new().unwrap();
    let targets = ExtractionTargets::in_folder(dir.path(), &[0]);
    let options = ExtractionOptions {
        buffer_size: 0,
        channels: vec![0],
        ..Default::default()
    };
    assert!(matches!(
        extract_raw(dir.path().join("missing.nrd"), &targets, &options),
        Err(LynxError::InvalidOption(_))
    ));
}

#[test]
fn odd_sized_stream_is_rejected() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("timestamps.raw");
    fs::write(&path, [0u8; 12]).unwrap();

    assert!(matches!(
        read_extracted(&path, ExtractedKind::Timestamps),
        Err(LynxError::FileSize { len: 12, element_size: 8, .. })
    ));
    assert_eq!(read_extracted(&path, ExtractedKind::Ttl).unwrap().len(), 3);
}
