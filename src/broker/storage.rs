use crate::broker::cursor::CursorSnapshot;
use crate::broker::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

const STATE_FILE: &str = "state.json";

/// Persisted broker state: the cursor table and the membership table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub cursors: CursorSnapshot,
    /// `group -> consumer -> last heartbeat` in unix milliseconds.
    pub membership: BTreeMap<String, BTreeMap<String, u64>>,
}

/// Snapshot file inside a state directory.
#[derive(Debug)]
pub struct Storage {
    path: PathBuf,
    tmp_path: PathBuf,
}

impl Storage {
    /// Opens the state directory, creating it if needed.
    ///
    /// # Examples
    ///
    /// ```
    /// use rust_broker_core::broker::storage::{Snapshot, Storage};
    ///
    /// let dir = tempfile::tempdir().unwrap();
    /// let storage = Storage::new(dir.path()).unwrap();
    /// assert!(storage.load().unwrap().is_none());
    /// storage.save(&Snapshot::default()).unwrap();
    /// assert_eq!(storage.load().unwrap(), Some(Snapshot::default()));
    /// ```
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        Ok(Storage {
            path: dir.join(STATE_FILE),
            tmp_path: dir.join(format!("{}.tmp", STATE_FILE)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes the snapshot to a temporary file and renames it over the
    /// previous one, so readers never observe a partial write.
    pub fn save(&self, snapshot: &Snapshot) -> Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.tmp_path)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, snapshot)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        fs::rename(&self.tmp_path, &self.path)?;
        Ok(())
    }

    /// The last saved snapshot, or `None` if nothing was saved yet.
    pub fn load(&self) -> Result<Option<Snapshot>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let reader = BufReader::new(File::open(&self.path)?);
        Ok(Some(serde_json::from_reader(reader)?))
    }
}
