use byteorder::{ByteOrder, LittleEndian};
use memmap2::MmapMut;
use ndarray::{Array1, Array2};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::config::{AssembleOptions, ContinuousOptions};
use crate::continuous::load_continuous;
use crate::types::*;

const PRINT_PROGRESS_STEP: usize = 10;

/// Prefix of the time-major export file.
pub const EXPORT_PREFIX: &str = "spikedetekt_";

/// Element type of an assembled channel matrix.
///
/// Samples are read as `i16` and widened (or kept) on the way in.
pub trait Sample: Copy + Default + Send + Sync + 'static {
    /// Size in bytes of one element on disk.
    const SIZE: usize;

    fn from_i16(value: i16) -> Self;

    /// Writes the little-endian encoding into `out[..Self::SIZE]`.
    fn write_le(self, out: &mut [u8]);

    /// Reads the little-endian encoding from `bytes[..Self::SIZE]`.
    fn read_le(bytes: &[u8]) -> Self;
}

impl Sample for i16 {
    const SIZE: usize = 2;

    fn from_i16(value: i16) -> Self {
        value
    }

    fn write_le(self, out: &mut [u8]) {
        LittleEndian::write_i16(out, self)
    }

    fn read_le(bytes: &[u8]) -> Self {
        LittleEndian::read_i16(bytes)
    }
}

impl Sample for i32 {
    const SIZE: usize = 4;

    fn from_i16(value: i16) -> Self {
        value as i32
    }

    fn write_le(self, out: &mut [u8]) {
        LittleEndian::write_i32(out, self)
    }

    fn read_le(bytes: &[u8]) -> Self {
        LittleEndian::read_i32(bytes)
    }
}

impl Sample for f32 {
    const SIZE: usize = 4;

    fn from_i16(value: i16) -> Self {
        value as f32
    }

    fn write_le(self, out: &mut [u8]) {
        LittleEndian::write_f32(out, self)
    }

    fn read_le(bytes: &[u8]) -> Self {
        LittleEndian::read_f32(bytes)
    }
}

impl Sample for f64 {
    const SIZE: usize = 8;

    fn from_i16(value: i16) -> Self {
        value as f64
    }

    fn write_le(self, out: &mut [u8]) {
        LittleEndian::write_f64(out, self)
    }

    fn read_le(bytes: &[u8]) -> Self {
        LittleEndian::read_f64(bytes)
    }
}

#[derive(Debug)]
enum Storage<T: Sample> {
    InMemory(Array2<T>),
    Mapped {
        path: PathBuf,
        mmap: MmapMut,
        _marker: PhantomData<T>,
    },
}

/// All channels of a recording as a channel × time matrix.
///
/// Rows follow ascending channel index. The matrix either lives in memory or
/// in a flat row-major file of little-endian `T`.
#[derive(Debug)]
pub struct ChannelMatrix<T: Sample> {
    channels: Vec<u32>,
    num_samples: usize,
    storage: Storage<T>,
}

impl<T: Sample> ChannelMatrix<T> {
    /// Allocates a zeroed matrix, backed by `backing` when given.
    fn allocate(channels: Vec<u32>, num_samples: usize, backing: Option<&Path>) -> Result<Self> {
        let rows = channels.len();
        let storage = match backing {
            Some(path) if rows * num_samples > 0 => {
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(path)?;
                file.set_len((rows * num_samples * T::SIZE) as u64)?;
                // SAFETY: the file was just created by this call and is owned by the matrix.
                let mmap = unsafe { MmapMut::map_mut(&file)? };
                log::info!(
                    "Writing {} x {} matrix to {}",
                    rows,
                    num_samples,
                    path.display()
                );
                Storage::Mapped {
                    path: path.to_path_buf(),
                    mmap,
                    _marker: PhantomData,
                }
            }
            Some(path) => {
                log::warn!("Channels hold no samples, {} left empty", path.display());
                File::create(path)?;
                Storage::InMemory(Array2::default((rows, 0)))
            }
            None => Storage::InMemory(Array2::default((rows, num_samples))),
        };

        Ok(ChannelMatrix {
            channels,
            num_samples,
            storage,
        })
    }

    /// Writes one channel's samples into row `row`, flushing mapped rows.
    fn write_row(&mut self, row: usize, samples: &Array1<i16>) -> Result<()> {
        if samples.len() != self.num_samples {
            return Err(LynxError::RowLengthMismatch {
                channel: self.channels[row],
                expected: self.num_samples,
                found: samples.len(),
            });
        }

        match &mut self.storage {
            Storage::InMemory(array) => {
                array
                    .row_mut(row)
                    .assign(&samples.mapv(T::from_i16));
            }
            Storage::Mapped { mmap, .. } => {
                let row_bytes = self.num_samples * T::SIZE;
                let offset = row * row_bytes;
                let target = &mut mmap[offset..offset + row_bytes];
                for (chunk, &value) in target.chunks_exact_mut(T::SIZE).zip(samples.iter()) {
                    T::from_i16(value).write_le(chunk);
                }
                mmap.flush_range(offset, row_bytes)?;
            }
        }
        Ok(())
    }

    /// Channel index of each row.
    pub fn channels(&self) -> &[u32] {
        &self.channels
    }

    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }

    pub fn num_samples(&self) -> usize {
        self.num_samples
    }

    /// `[num_channels, num_samples]`
    pub fn shape(&self) -> [usize; 2] {
        [self.channels.len(), self.num_samples]
    }

    /// The backing file of a memory-mapped matrix.
    pub fn backing_file(&self) -> Option<&Path> {
        match &self.storage {
            Storage::InMemory(_) => None,
            Storage::Mapped { path, .. } => Some(path),
        }
    }

    /// Value at `[row, sample]`.
    pub fn get(&self, row: usize, sample: usize) -> T {
        match &self.storage {
            Storage::InMemory(array) => array[[row, sample]],
            Storage::Mapped { mmap, .. } => {
                let at = (row * self.num_samples + sample) * T::SIZE;
                T::read_le(&mmap[at..at + T::SIZE])
            }
        }
    }

    /// Copy of one row.
    pub fn row(&self, row: usize) -> Array1<T> {
        match &self.storage {
            Storage::InMemory(array) => array.row(row).to_owned(),
            Storage::Mapped { .. } => Array1::from_shape_fn(self.num_samples, |s| self.get(row, s)),
        }
    }

    /// The whole matrix in memory.
    pub fn to_array(&self) -> Array2<T> {
        match &self.storage {
            Storage::InMemory(array) => array.clone(),
            Storage::Mapped { .. } => {
                Array2::from_shape_fn(self.shape(), |(r, s)| self.get(r, s))
            }
        }
    }

    /// In-memory matrix holding only the given rows, in the given order.
    pub fn select(&self, rows: &[usize]) -> Result<ChannelMatrix<T>> {
        check_rows(rows, self.num_channels())?;
        let channels = rows.iter().map(|&r| self.channels[r]).collect();
        let array = Array2::from_shape_fn((rows.len(), self.num_samples), |(i, s)| {
            self.get(rows[i], s)
        });

        Ok(ChannelMatrix {
            channels,
            num_samples: self.num_samples,
            storage: Storage::InMemory(array),
        })
    }

    /// Writes the given rows time-major: every row's sample 0, then sample 1, ...
    pub fn export_time_major<P: AsRef<Path>>(&self, rows: &[usize], path: P) -> Result<()> {
        check_rows(rows, self.num_channels())?;
        let mut writer = BufWriter::with_capacity(65536, File::create(path.as_ref())?);
        let mut buf = vec![0u8; T::SIZE];

        for sample in 0..self.num_samples {
            for &row in rows {
                self.get(row, sample).write_le(&mut buf);
                writer.write_all(&buf)?;
            }
        }
        writer.flush()?;
        Ok(())
    }
}

/// Helper function to check row indices against the matrix height
fn check_rows(rows: &[usize], num_channels: usize) -> Result<()> {
    match rows.iter().find(|&&r| r >= num_channels) {
        Some(&channel) => Err(LynxError::ChannelOutOfRange {
            channel,
            channel_count: num_channels,
        }),
        None => Ok(()),
    }
}

/// Lists `<prefix><index>.ncs` files in a folder, sorted by numeric index.
pub fn list_channel_files<P: AsRef<Path>>(folder: P, prefix: &str) -> Result<Vec<(u32, PathBuf)>> {
    let mut files = Vec::new();

    for entry in fs::read_dir(folder.as_ref())? {
        let path = entry?.path();
        let is_ncs = path
            .extension()
            .map_or(false, |ext| ext.eq_ignore_ascii_case("ncs"));
        if !is_ncs || !path.is_file() {
            continue;
        }

        let index = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .and_then(|stem| stem.strip_prefix(prefix))
            .and_then(|digits| digits.parse::<u32>().ok())
            .ok_or_else(|| LynxError::InvalidChannelFileName(path.clone()))?;
        files.push((index, path));
    }

    files.sort_by_key(|(index, _)| *index);
    Ok(files)
}

/// Reads every continuous-signal file of a folder into one channel × time matrix.
///
/// # Arguments
///
/// * `folder` - Folder holding `CSC<n>.ncs` files (prefix set by `options.file_prefix`)
/// * `options` - Reconstruction, memory mapping and export settings
///
/// # Returns
///
/// The matrix, rows in ascending channel index. With an export that asks for
/// it, only the exported rows.
///
/// The row length is only known once the first channel is decoded (gap
/// padding changes it), so that channel is read before anything is allocated.
pub fn read_all_channels<T: Sample, P: AsRef<Path>>(folder: P, options: &AssembleOptions) -> Result<ChannelMatrix<T>> {
    let tic = Instant::now();
    let folder = folder.as_ref();

    let files = list_channel_files(folder, &options.file_prefix)?;
    if files.is_empty() {
        return Err(LynxError::InconsistentChannelCount {
            folder: folder.to_path_buf(),
        });
    }
    let output_folder = options.require_output_folder()?;

    let base_name = folder
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "channels".to_string());
    let out_name = format!("{}.dat", base_name);

    let continuous_options = ContinuousOptions {
        assume_uniform_rate: options.assume_uniform_rate,
        memory_map: options.memory_map,
    };

    log::info!("Reading {} channels from {}", files.len(), folder.display());

    let (first_channel, first_path) = &files[0];
    let first = load_continuous(first_path, &continuous_options)?.channel_samples()?;
    log::debug!("Channel {}: {} samples", first_channel, first.len());

    let backing = if options.memory_map {
        output_folder.map(|dir| dir.join(&out_name))
    } else {
        None
    };
    let channels = files.iter().map(|(index, _)| *index).collect();
    let mut matrix = ChannelMatrix::<T>::allocate(channels, first.len(), backing.as_deref())?;
    matrix.write_row(0, &first)?;
    drop(first);

    let mut percent_done = PRINT_PROGRESS_STEP;
    for (row, (channel, path)) in files.iter().enumerate().skip(1) {
        let samples = load_continuous(path, &continuous_options)?.channel_samples()?;
        log::debug!("Channel {}: {} samples", channel, samples.len());
        matrix.write_row(row, &samples)?;

        let fraction_done = 100 * (row + 1) / files.len();
        if fraction_done >= percent_done {
            log::info!("{}% done...", percent_done);
            percent_done += PRINT_PROGRESS_STEP;
        }
    }

    let result = match &options.export {
        Some(export) => {
            let rows: Vec<usize> = match &export.channels {
                Some(rows) => rows.clone(),
                None => (0..matrix.num_channels()).collect(),
            };
            // require_output_folder guarantees a folder when exporting
            let dir = output_folder.ok_or(LynxError::MissingOutputPath)?;
            let export_path = dir.join(format!("{}{}", EXPORT_PREFIX, out_name));
            matrix.export_time_major(&rows, &export_path)?;
            log::info!(
                "Exported {} channels to {}",
                rows.len(),
                export_path.display()
            );

            if export.return_subset {
                matrix.select(&rows)?
            } else {
                matrix
            }
        }
        None => matrix,
    };

    log::info!(
        "Done! Elapsed time: {:.1} seconds",
        tic.elapsed().as_secs_f64()
    );
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn samples_round_trip_little_endian() {
        let mut buf = [0u8; 8];
        (-3i16).write_le(&mut buf);
        assert_eq!(i16::read_le(&buf), -3);
        2.5f64.write_le(&mut buf);
        assert_eq!(f64::read_le(&buf), 2.5);
        assert_eq!(f32::from_i16(-7), -7.0);
    }

    #[test]
    fn in_memory_rows_are_checked() {
        let mut matrix = ChannelMatrix::<i32>::allocate(vec![1, 2], 3, None).unwrap();
        matrix.write_row(1, &Array1::from_vec(vec![4, 5, 6])).unwrap();
        assert_eq!(matrix.row(1).to_vec(), vec![4, 5, 6]);
        assert_eq!(matrix.row(0).to_vec(), vec![0, 0, 0]);

        let err = matrix.write_row(0, &Array1::from_vec(vec![1])).unwrap_err();
        assert!(matches!(
            err,
            LynxError::RowLengthMismatch {
                channel: 1,
                expected: 3,
                found: 1
            }
        ));
    }

    #[test]
    fn mapped_matrix_writes_row_major_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("m.dat");
        let mut matrix = ChannelMatrix::<i16>::allocate(vec![3, 4], 2, Some(path.as_path())).unwrap();
        matrix.write_row(0, &Array1::from_vec(vec![1, 2])).unwrap();
        matrix.write_row(1, &Array1::from_vec(vec![3, 4])).unwrap();
        assert_eq!(matrix.backing_file(), Some(path.as_path()));
        drop(matrix);

        let bytes = fs::read(&path).unwrap();
        let values: Vec<i16> = bytes.chunks_exact(2).map(i16::read_le).collect();
        assert_eq!(values, vec![1, 2, 3, 4]);
    }

    #[test]
    fn channel_files_sort_numerically() {
        let dir = TempDir::new().unwrap();
        for name in ["CSC10.ncs", "CSC2.ncs", "CSC1.ncs", "notes.txt"] {
            File::create(dir.path().join(name)).unwrap();
        }
        let files = list_channel_files(dir.path(), "CSC").unwrap();
        let order: Vec<u32> = files.iter().map(|(i, _)| *i).collect();
        assert_eq!(order, vec![1, 2, 10]);
    }

    #[test]
    fn unparsable_channel_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        File::create(dir.path().join("Tetrode.ncs")).unwrap();
        assert!(matches!(
            list_channel_files(dir.path(), "CSC"),
            Err(LynxError::InvalidChannelFileName(_))
        ));
    }
}
