//! Best-effort repair of a corrupted log file.

use std::fs::{self, File, OpenOptions};
use std::io::BufReader;
use std::path::Path;

use crate::log::{LogError, LogIter};

/// What a [`repair`] run did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RepairOutcome {
    /// Entries salvaged into the fresh file.
    pub entries_recovered: usize,

    /// Bytes dropped from the corrupted tail.
    pub bytes_dropped: u64,
}

/// Repair the log at `path` in place.
///
/// The original file is preserved as `<path>.CORRUPTED`, then the valid
/// prefix (every frame up to the first decode failure) is rewritten into a
/// fresh file at `path` and fsynced.
///
/// The caller must not hold the log open: repair takes over the file.
pub fn repair(path: impl AsRef<Path>) -> Result<RepairOutcome, LogError> {
    let path = path.as_ref();

    let corrupted_path = {
        let mut name = path.as_os_str().to_os_string();
        name.push(".CORRUPTED");
        std::path::PathBuf::from(name)
    };

    fs::copy(path, &corrupted_path)?;

    let total_size = fs::metadata(path)?.len();

    // Collect the valid prefix from the preserved copy.
    let reader = BufReader::new(File::open(&corrupted_path)?);
    let mut iter = LogIter::from_reader(reader);

    let mut entries = Vec::new();
    for entry in &mut iter {
        match entry {
            Ok(data) => entries.push(data),
            Err(err) if err.is_corruption() => break,
            Err(err) => return Err(err),
        }
    }

    let valid_prefix = iter.offset();

    // Rewrite atomically: fresh file beside the log, fsync, rename over.
    let tmp_path = {
        let mut name = path.as_os_str().to_os_string();
        name.push(".REPAIR");
        std::path::PathBuf::from(name)
    };

    {
        let mut tmp = crate::Log::create_at(&tmp_path)?;
        for entry in &entries {
            tmp.append(entry)?;
        }
        tmp.close()?;
    }

    fs::rename(&tmp_path, path)?;

    // Fsync the directory so the rename itself is durable.
    if let Some(parent) = path.parent() {
        if let Ok(dir) = OpenOptions::new().read(true).open(parent) {
            let _ = dir.sync_all();
        }
    }

    Ok(RepairOutcome {
        entries_recovered: entries.len(),
        bytes_dropped: total_size - valid_prefix,
    })
}
