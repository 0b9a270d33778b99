use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::compression::Compression;
use crate::destination::DestinationKind;
use crate::error::{Error, IoResultExt, Result};

/// Per-segment delivery record, persisted between retries of the same
/// segment.
///
/// `compressed` maps a compression type to the hex md5 of its produced
/// artifact; `sent` records which destinations already received the
/// segment. A destination listed here is never sent again.
#[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ArchiveState {
    #[serde(default)]
    pub compressed: BTreeMap<Compression, String>,
    #[serde(default)]
    pub sent: BTreeMap<String, BTreeSet<String>>,
}

impl ArchiveState {
    fn file_path(state_dir: &Path, segment: &str) -> PathBuf {
        state_dir.join(segment)
    }

    /// Load the state for `segment`, or an empty record when none exists.
    pub fn load(state_dir: &Path, segment: &str) -> Result<Self> {
        let path = Self::file_path(state_dir, segment);
        if !path.exists() {
            return Ok(Self::default());
        }

        let file = File::open(&path).at(&path)?;
        serde_yaml::from_reader(file)
            .map_err(|e| Error::Precondition(format!("corrupt state file {}: {e}", path.display())))
    }

    /// Persist atomically: the state file is either the previous record or
    /// the new one, never a torn write.
    pub fn save(&self, state_dir: &Path, segment: &str) -> Result<()> {
        fs::create_dir_all(state_dir).at(state_dir)?;
        let path = Self::file_path(state_dir, segment);
        let tmp = path.with_extension("tmp");

        let mut file = File::create(&tmp).at(&tmp)?;
        let serialized = serde_yaml::to_string(self)
            .map_err(|e| Error::Precondition(format!("cannot serialize state: {e}")))?;
        file.write_all(serialized.as_bytes()).at(&tmp)?;
        file.sync_all().at(&tmp)?;
        fs::rename(&tmp, &path).at(&path)?;
        Ok(())
    }

    /// Remove the record after fully successful delivery.
    pub fn delete(state_dir: &Path, segment: &str) -> Result<()> {
        let path = Self::file_path(state_dir, segment);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::io(&path, e)),
        }
    }

    pub fn record_compressed(&mut self, compression: Compression, md5_hex: String) {
        self.compressed.insert(compression, md5_hex);
    }

    /// True when a cached artifact exists on disk and still matches the
    /// checksum recorded for its compression type.
    pub fn artifact_valid(&self, compression: Compression, artifact: &Path) -> bool {
        let Some(expected) = self.compressed.get(&compression) else {
            return false;
        };
        match file_md5(artifact) {
            Ok(actual) => actual == *expected,
            Err(_) => false,
        }
    }

    pub fn mark_sent(&mut self, kind: DestinationKind, path: &str) {
        self.sent
            .entry(kind.as_str().to_string())
            .or_default()
            .insert(path.to_string());
    }

    pub fn is_sent(&self, kind: DestinationKind, path: &str) -> bool {
        self.sent
            .get(kind.as_str())
            .is_some_and(|paths| paths.contains(path))
    }
}

/// Hex md5 of a file, streamed in 64 KiB chunks.
pub fn file_md5(path: &Path) -> Result<String> {
    let mut file = File::open(path).at(path)?;
    let mut hasher = md5::Context::new();
    let mut buf = [0u8; 64 * 1024];

    loop {
        let n = file.read(&mut buf).at(path)?;
        if n == 0 {
            break;
        }
        hasher.consume(&buf[..n]);
    }

    Ok(hex::encode(hasher.compute().0))
}
