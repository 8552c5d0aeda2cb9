use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::models::normalize_channel;

/// Highest processed message id per channel, keyed by `@name`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cursors(BTreeMap<String, i64>);

impl Cursors {
    /// Stored cursor for `channel`, 0 when the channel was never read.
    pub fn get(&self, channel: &str) -> i64 {
        self.0.get(&normalize_channel(channel)).copied().unwrap_or(0)
    }

    /// Moves the cursor forward to `seen`. Never moves it back.
    pub fn advance(&mut self, channel: &str, seen: i64) {
        let entry = self.0.entry(normalize_channel(channel)).or_insert(seen);
        *entry = (*entry).max(seen);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, i64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

impl FromIterator<(String, i64)> for Cursors {
    fn from_iter<T: IntoIterator<Item = (String, i64)>>(iter: T) -> Self {
        let mut cursors = Cursors::default();
        for (channel, seen) in iter {
            cursors.advance(&channel, seen);
        }
        cursors
    }
}

/// Durable home of the cursors between runs.
///
/// `save` replaces everything previously stored, so callers load, modify and
/// save the whole mapping.
#[allow(async_fn_in_trait)]
pub trait CursorStore {
    async fn load(&self) -> Result<Cursors>;
    async fn save(&self, cursors: &Cursors) -> Result<()>;
}

/// Pretty-printed JSON object on disk, e.g. `{ "@acme": 9 }`.
pub struct JsonCursorStore {
    path: PathBuf,
}

impl JsonCursorStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CursorStore for JsonCursorStore {
    async fn load(&self) -> Result<Cursors> {
        if !self.path().exists() {
            info!("No state file at {}, starting fresh", self.path().display());
            return Ok(Cursors::default());
        }

        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read {}", self.path.display()))?;
        let raw: BTreeMap<String, i64> = serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse {}", self.path.display()))?;
        let cursors: Cursors = raw.into_iter().collect();
        debug!("Loaded {} cursors from {}", cursors.len(), self.path.display());
        Ok(cursors)
    }

    async fn save(&self, cursors: &Cursors) -> Result<()> {
        let json = serde_json::to_string_pretty(cursors)?;
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create state directory {}", dir.display()))?;
        }
        write_replacing(&self.path, json.as_bytes())
            .with_context(|| format!("failed to write {}", self.path.display()))?;
        debug!("Saved {} cursors to {}", cursors.len(), self.path.display());
        Ok(())
    }
}

/// Writes a sibling temp file and renames it over `path`, so readers see
/// either the old content or the new one.
pub fn write_replacing(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, contents)?;
    if let Err(e) = fs::rename(&tmp, path) {
        // Leave nothing behind; the old file is still in place.
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    Ok(())
}
