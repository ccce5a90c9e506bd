mod common;

use byteorder::{ByteOrder, LittleEndian};
use common::*;
use neuralynx_importer::*;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// A recording folder with channels 1, 2 and 10, every sample equal to its channel.
fn session(root: &Path) -> PathBuf {
    let folder = root.join("session");
    fs::create_dir(&folder).unwrap();
    for channel in [10u32, 1, 2] {
        write_continuous(
            &folder.join(format!("CSC{}.ncs", channel)),
            channel,
            &[32_000],
            &contiguous_timestamps(0, 4),
            |_, slot| channel as i16 * 100 + (slot % 3) as i16,
        );
    }
    folder
}

#[test]
fn rows_follow_numeric_channel_order() {
    let dir = TempDir::new().unwrap();
    let folder = session(dir.path());

    let matrix = read_all_channels::<i16, _>(&folder, &AssembleOptions::default()).unwrap();
    assert_eq!(matrix.channels(), &[1, 2, 10]);
    assert_eq!(matrix.shape(), [3, 2_048]);
    assert_eq!(matrix.get(0, 0), 100);
    assert_eq!(matrix.get(2, 4), 1_001);
    assert!(matrix.backing_file().is_none());
}

#[test]
fn samples_convert_to_wider_types() {
    let dir = TempDir::new().unwrap();
    let folder = session(dir.path());

    let matrix = read_all_channels::<f64, _>(&folder, &AssembleOptions::default()).unwrap();
    assert_eq!(matrix.to_array()[[1, 2]], 202.0);
}

#[test]
fn memory_mapped_matrix_lands_in_output_folder() {
    let dir = TempDir::new().unwrap();
    let folder = session(dir.path());
    let out = TempDir::new().unwrap();

    let options = AssembleOptions {
        memory_map: true,
        output_folder: Some(out.path().to_path_buf()),
        ..Default::default()
    };
    let matrix = read_all_channels::<i16, _>(&folder, &options).unwrap();

    let expected = out.path().join("session.dat");
    assert_eq!(matrix.backing_file(), Some(expected.as_path()));
    assert_eq!(matrix.row(1)[0], 200);
    drop(matrix);

    let bytes = fs::read(&expected).unwrap();
    assert_eq!(bytes.len(), 3 * 2_048 * 2);
    assert_eq!(LittleEndian::read_i16(&bytes[2 * 2_048 * 2..]), 1_000);
}

#[test]
fn export_writes_time_major_subset() {
    let dir = TempDir::new().unwrap();
    let folder = session(dir.path());
    let out = TempDir::new().unwrap();

    let options = AssembleOptions {
        output_folder: Some(out.path().to_path_buf()),
        export: Some(ExportOptions {
            channels: Some(vec![2, 0]),
            return_subset: true,
        }),
        ..Default::default()
    };
    let matrix = read_all_channels::<i16, _>(&folder, &options).unwrap();
    assert_eq!(matrix.channels(), &[10, 1]);
    assert_eq!(matrix.shape(), [2, 2_048]);

    let bytes = fs::read(out.path().join("spikedetekt_session.dat")).unwrap();
    assert_eq!(bytes.len(), 2 * 2_048 * 2);
    let mut first = [0i16; 4];
    LittleEndian::read_i16_into(&bytes[..8], &mut first);
    assert_eq!(first, [1_000, 100, 1_001, 101]);
}

#[test]
fn export_keeps_full_matrix_unless_asked() {
    let dir = TempDir::new().unwrap();
    let folder = session(dir.path());
    let out = TempDir::new().unwrap();

    let options = AssembleOptions {
        output_folder: Some(out.path().to_path_buf()),
        export: Some(ExportOptions::default()),
        ..Default::default()
    };
    let matrix = read_all_channels::<i32, _>(&folder, &options).unwrap();
    assert_eq!(matrix.num_channels(), 3);

    let bytes = fs::read(out.path().join("spikedetekt_session.dat")).unwrap();
    assert_eq!(bytes.len(), 3 * 2_048 * 4);
}

#[test]
fn disk_output_needs_a_folder() {
    let dir = TempDir::new().unwrap();
    let folder = session(dir.path());

    let options = AssembleOptions {
        export: Some(ExportOptions::default()),
        ..Default::default()
    };
    assert!(matches!(
        read_all_channels::<i16, _>(&folder, &options),
        Err(LynxError::MissingOutputPath)
    ));
}

#[test]
fn empty_folder_is_rejected() {
    let dir = TempDir::new().unwrap();
    assert!(matches!(
        read_all_channels::<i16, _>(dir.path(), &AssembleOptions::default()),
        Err(LynxError::InconsistentChannelCount { .. })
    ));
}

#[test]
fn channels_of_different_length_are_rejected() {
    let dir = TempDir::new().unwrap();
    let folder = session(dir.path());
    write_continuous(
        &folder.join("CSC11.ncs"),
        11,
        &[32_000],
        &contiguous_timestamps(0, 3),
        |_, _| 0,
    );

    assert!(matches!(
        read_all_channels::<i16, _>(&folder, &AssembleOptions::default()),
        Err(LynxError::RowLengthMismatch {
            channel: 11,
            expected: 2_048,
            found: 1_536
        })
    ));
}
