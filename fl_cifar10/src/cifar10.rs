//! Reader for the binary version of CIFAR-10.
//!
//! Every batch file is a sequence of records made of one label byte followed by the 3072
//! pixel bytes of a 32x32 image, channel major (all red, then all green, then all blue).

use std::{
    fs::File,
    io::{self, Read, Seek, SeekFrom},
    ops::Range,
    path::{Path, PathBuf},
};

use federation::{DatasetKind, FederationErr, Result, ShardDescriptor};
use log::debug;
use machine_learning::dataset::{Dataset, shard_range};

pub const CLASSES: usize = 10;
pub const IMAGE_SHAPE: [usize; 3] = [3, 32, 32];
pub const IMAGE_SIZE: usize = 3 * 32 * 32;
pub const RECORD_SIZE: usize = 1 + IMAGE_SIZE;

pub const TRAIN_FILES: [&str; 5] = [
    "data_batch_1.bin",
    "data_batch_2.bin",
    "data_batch_3.bin",
    "data_batch_4.bin",
    "data_batch_5.bin",
];
pub const TEST_FILE: &str = "test_batch.bin";

pub const LABELS: [&str; CLASSES] = [
    "airplane",
    "automobile",
    "bird",
    "cat",
    "deer",
    "dog",
    "frog",
    "horse",
    "ship",
    "truck",
];

const MEAN: f32 = 0.5;
const STD: f32 = 0.5;

/// Maps a pixel byte into `[-1, 1]`.
#[inline]
pub fn normalize(pixel: u8) -> f32 {
    (pixel as f32 / 255. - MEAN) / STD
}

/// Decodes whole CIFAR-10 records into normalized samples and their labels.
///
/// # Returns
/// An error if `bytes` holds a partial record or a label above the class count.
pub fn decode(bytes: &[u8]) -> Result<(Vec<f32>, Vec<u8>)> {
    if bytes.len() % RECORD_SIZE != 0 {
        return Err(invalid_data(format!(
            "{} bytes are not a whole number of {RECORD_SIZE} byte records",
            bytes.len()
        )));
    }

    let records = bytes.len() / RECORD_SIZE;
    let mut samples = Vec::with_capacity(records * IMAGE_SIZE);
    let mut labels = Vec::with_capacity(records);

    for record in bytes.chunks_exact(RECORD_SIZE) {
        let (label, pixels) = (record[0], &record[1..]);

        if label as usize >= CLASSES {
            return Err(invalid_data(format!("label {label} out of {CLASSES} classes")));
        }

        labels.push(label);
        samples.extend(pixels.iter().copied().map(normalize));
    }

    Ok((samples, labels))
}

/// Reads the records `range` out of the concatenation of `files`.
///
/// Only the bytes of the requested records are read, files the range does not touch are
/// never opened past their metadata.
pub fn read_records(
    dir: &Path,
    files: &[&str],
    range: Range<usize>,
) -> Result<(Vec<f32>, Vec<u8>)> {
    let mut samples = Vec::with_capacity(range.len() * IMAGE_SIZE);
    let mut labels = Vec::with_capacity(range.len());
    let mut offset = 0;

    for name in files {
        let path = dir.join(name);
        let records = count_records(&path)?;
        let file_range = offset..offset + records;
        offset += records;

        let start = range.start.max(file_range.start);
        let end = range.end.min(file_range.end);

        if start >= end {
            continue;
        }

        let mut file = File::open(&path)?;
        file.seek(SeekFrom::Start(((start - file_range.start) * RECORD_SIZE) as u64))?;

        let mut bytes = vec![0; (end - start) * RECORD_SIZE];
        file.read_exact(&mut bytes)?;

        let (s, l) = decode(&bytes)?;
        samples.extend(s);
        labels.extend(l);
    }

    Ok((samples, labels))
}

/// The amount of records in the concatenation of `files`.
pub fn total_records(dir: &Path, files: &[&str]) -> Result<usize> {
    files
        .iter()
        .map(|name| count_records(&dir.join(name)))
        .sum()
}

fn count_records(path: &Path) -> Result<usize> {
    let len = std::fs::metadata(path)
        .map_err(|e| io::Error::new(e.kind(), format!("{}: {e}", path.display())))?
        .len() as usize;

    if len % RECORD_SIZE != 0 {
        return Err(invalid_data(format!(
            "{} is not a CIFAR-10 batch, its size is not a multiple of {RECORD_SIZE}",
            path.display()
        )));
    }

    Ok(len / RECORD_SIZE)
}

fn invalid_data(msg: String) -> FederationErr {
    io::Error::new(io::ErrorKind::InvalidData, msg).into()
}

/// A contiguous shard of CIFAR-10 read from the binary batches in a directory.
///
/// The train split is taken from the five data batches and the validation split from the
/// test batch, shard `rank` (1 based) owns the same slice of both.
#[derive(Debug, Clone)]
pub struct Cifar10ShardDescriptor {
    dir: PathBuf,
    rank: usize,
    world_size: usize,
    limit: Option<usize>,
}

impl Cifar10ShardDescriptor {
    /// Creates a new `Cifar10ShardDescriptor`.
    ///
    /// # Arguments
    /// * `dir` - The directory holding `data_batch_{1..5}.bin` and `test_batch.bin`.
    /// * `rank` - The shard to keep, from 1 up to `world_size`.
    /// * `world_size` - The amount of shards the dataset is split into.
    ///
    /// # Returns
    /// An error if `rank` is out of range.
    pub fn new(dir: impl Into<PathBuf>, rank: usize, world_size: usize) -> Result<Self> {
        if rank == 0 || rank > world_size {
            return Err(FederationErr::Config(format!(
                "shard rank {rank} is out of 1..={world_size}"
            )));
        }

        Ok(Self {
            dir: dir.into(),
            rank,
            world_size,
            limit: None,
        })
    }

    /// Keeps at most `limit` samples of each split.
    pub fn with_limit(mut self, limit: Option<usize>) -> Self {
        self.limit = limit;
        self
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    fn split_range(&self, files: &[&str]) -> Result<Range<usize>> {
        let total = total_records(&self.dir, files)?;
        let mut range = shard_range(total, self.rank - 1, self.world_size);

        if let Some(limit) = self.limit {
            range.end = range.end.min(range.start + limit);
        }

        Ok(range)
    }
}

impl ShardDescriptor for Cifar10ShardDescriptor {
    fn get_dataset(&self, kind: DatasetKind) -> Result<Dataset> {
        let files: &[&str] = match kind {
            DatasetKind::Train => &TRAIN_FILES,
            DatasetKind::Valid => &[TEST_FILE],
        };

        let range = self.split_range(files)?;
        let (samples, labels) = read_records(&self.dir, files, range.clone())?;

        debug!(
            rank = self.rank,
            split:? = kind,
            start = range.start,
            end = range.end;
            "loaded cifar-10 shard"
        );

        Ok(Dataset::classification(
            samples,
            &labels,
            IMAGE_SHAPE.to_vec(),
            CLASSES,
        )?)
    }

    fn sample_shape(&self) -> Vec<usize> {
        IMAGE_SHAPE.to_vec()
    }

    fn target_shape(&self) -> Vec<usize> {
        vec![CLASSES]
    }

    fn description(&self) -> String {
        format!(
            "CIFAR-10 shard {} of {} from {}",
            self.rank,
            self.world_size,
            self.dir.display()
        )
    }
}
