use forge_core::job_warn;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

const MAGIC: u32 = 0x4a4f_4246; // "JOBF"
const VERSION: u32 = 1;
const DEFAULT_ESTIMATE_US: f64 = 50.0;

#[derive(Debug, Clone, Copy)]
struct Record {
    mean_us: f64,
    sample_count: u64,
}

/// Running mean of a job's execution time, keyed by `JobMetadata::label`, fed by
/// the monitor's per-job measurements and consulted by the min-load scheduler.
/// Persisted across runs so a freshly started process has useful estimates
/// immediately instead of starting cold.
pub struct ProfileTable {
    records: RwLock<HashMap<u64, Record>>,
    persistence_path: Option<PathBuf>,
}

impl ProfileTable {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            persistence_path: None,
        }
    }

    /// Loads existing profile data from `path` if present. A missing or
    /// unreadable file is a warning, not a fatal error: the table just starts
    /// cold and `path` becomes the target for subsequent `save` calls.
    pub fn with_persistence_file(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let mut table = Self {
            records: RwLock::new(HashMap::new()),
            persistence_path: Some(path.clone()),
        };

        match table.load(&path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                job_warn!("could not load job execution profile from {:?}: {}", path, err);
            }
        }

        table
    }

    fn load(&mut self, path: &Path) -> io::Result<()> {
        let mut reader = BufReader::new(File::open(path)?);

        let mut header = [0u8; 8];
        reader.read_exact(&mut header)?;
        let magic = u32::from_le_bytes(header[0..4].try_into().unwrap());
        let version = u32::from_le_bytes(header[4..8].try_into().unwrap());
        if magic != MAGIC {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "bad profile magic"));
        }
        if version != VERSION {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "unsupported profile version"));
        }

        let mut records = HashMap::new();
        let mut entry = [0u8; 24];
        loop {
            match reader.read_exact(&mut entry) {
                Ok(()) => {
                    let label = u64::from_le_bytes(entry[0..8].try_into().unwrap());
                    let mean_us = f64::from_le_bytes(entry[8..16].try_into().unwrap());
                    let sample_count = u64::from_le_bytes(entry[16..24].try_into().unwrap());
                    records.insert(label, Record { mean_us, sample_count });
                }
                Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(err) => return Err(err),
            }
        }

        *self.records.get_mut() = records;
        Ok(())
    }

    pub fn save(&self) -> io::Result<()> {
        let Some(path) = &self.persistence_path else {
            return Ok(());
        };

        let mut writer = BufWriter::new(File::create(path)?);
        writer.write_all(&MAGIC.to_le_bytes())?;
        writer.write_all(&VERSION.to_le_bytes())?;

        for (&label, record) in self.records.read().iter() {
            writer.write_all(&label.to_le_bytes())?;
            writer.write_all(&record.mean_us.to_le_bytes())?;
            writer.write_all(&record.sample_count.to_le_bytes())?;
        }

        writer.flush()
    }

    /// Returns the current mean execution time estimate for `label`, in
    /// microseconds, or a fixed default for a label with no samples yet.
    pub fn estimate_us(&self, label: u64) -> f64 {
        self.records
            .read()
            .get(&label)
            .map(|record| record.mean_us)
            .unwrap_or(DEFAULT_ESTIMATE_US)
    }

    /// Folds one more measured execution time into `label`'s running mean.
    pub fn record(&self, label: u64, measured_us: u64) {
        let mut records = self.records.write();
        let record = records.entry(label).or_insert(Record {
            mean_us: measured_us as f64,
            sample_count: 0,
        });
        let n = record.sample_count as f64;
        record.mean_us = (record.mean_us * n + measured_us as f64) / (n + 1.0);
        record.sample_count += 1;
    }
}

impl Default for ProfileTable {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ProfileTable {
    fn drop(&mut self) {
        if let Err(err) = self.save() {
            job_warn!("could not persist job execution profile: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unrecorded_label_uses_default_estimate() {
        let table = ProfileTable::new();
        assert_eq!(table.estimate_us(42), DEFAULT_ESTIMATE_US);
    }

    #[test]
    fn record_updates_running_mean() {
        let table = ProfileTable::new();
        table.record(1, 100);
        table.record(1, 200);
        assert_eq!(table.estimate_us(1), 150.0);
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("forge-jobsystem-profile-test-{}.bin", std::process::id()));

        {
            let table = ProfileTable::with_persistence_file(&path);
            table.record(7, 123);
            table.record(7, 321);
            table.save().unwrap();
        }

        let reloaded = ProfileTable::with_persistence_file(&path);
        assert_eq!(reloaded.estimate_us(7), 222.0);

        std::fs::remove_file(&path).ok();
    }
}
