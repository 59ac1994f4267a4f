//! TOML-file implementation of the flat durable store.
//!
//! The file is a single table of `key = value` pairs. Integers come back as
//! `StoreValue::U32`; callers reading a byte field use `as_u8`, which accepts
//! any in-range integer.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use pump_traits::{Store, StoreValue};

/// Write `bytes` to a sibling temp file, fsync, then rename over `path`.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("new");
    {
        let mut f = fs::File::create(&tmp)?;
        f.write_all(bytes)?;
        f.sync_all()?;
    }
    fs::rename(tmp, path)
}

#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    values: BTreeMap<String, StoreValue>,
    dirty: bool,
}

impl FileStore {
    /// Open the store at `path`. A missing file yields an empty store; the
    /// parent directory is created on first commit.
    ///
    /// A file that cannot be read or parsed is logged and the store starts
    /// empty. An unparsable file is moved aside to `<path>.corrupt`.
    pub fn open(path: impl Into<PathBuf>) -> eyre::Result<Self> {
        let path = path.into();
        let values = if path.exists() {
            load_values(&path)
        } else {
            BTreeMap::new()
        };
        Ok(Self {
            path,
            values,
            dirty: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn corrupt_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".corrupt");
    PathBuf::from(name)
}

fn load_values(path: &Path) -> BTreeMap<String, StoreValue> {
    let mut values = BTreeMap::new();
    let text = match fs::read_to_string(path) {
        Ok(t) => t,
        Err(e) => {
            tracing::warn!(path = ?path, error = %e, "could not read state file; using defaults");
            return values;
        }
    };
    let table: toml::Table = match text.parse() {
        Ok(t) => t,
        Err(e) => {
            let aside = corrupt_path(path);
            tracing::warn!(
                path = ?path,
                moved_to = ?aside,
                error = %e,
                "state file is corrupt; using defaults"
            );
            if let Err(e) = fs::rename(path, &aside) {
                tracing::warn!(error = %e, "could not move corrupt state file aside");
            }
            return values;
        }
    };
    for (k, v) in table {
        match decode(&v) {
            Some(sv) => {
                values.insert(k, sv);
            }
            None => tracing::warn!(key = %k, "ignoring unsupported value in state file"),
        }
    }
    values
}

fn decode(v: &toml::Value) -> Option<StoreValue> {
    match v {
        toml::Value::Boolean(b) => Some(StoreValue::Bool(*b)),
        toml::Value::Float(f) => Some(StoreValue::F32(*f as f32)),
        toml::Value::Integer(i) => u32::try_from(*i).ok().map(StoreValue::U32),
        _ => None,
    }
}

fn encode(v: StoreValue) -> toml::Value {
    match v {
        StoreValue::Bool(b) => toml::Value::Boolean(b),
        StoreValue::F32(f) => toml::Value::Float(f64::from(f)),
        StoreValue::U32(u) => toml::Value::Integer(i64::from(u)),
        StoreValue::U8(u) => toml::Value::Integer(i64::from(u)),
    }
}

impl Store for FileStore {
    fn get(&self, key: &str) -> Option<StoreValue> {
        self.values.get(key).copied()
    }

    fn put(&mut self, key: &str, value: StoreValue) {
        if self.values.get(key) != Some(&value) {
            self.values.insert(key.to_string(), value);
            self.dirty = true;
        }
    }

    fn commit(&mut self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        if !self.dirty {
            return Ok(());
        }
        let table: toml::Table = self
            .values
            .iter()
            .map(|(k, v)| (k.clone(), encode(*v)))
            .collect();
        let text = toml::to_string(&table)?;
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        write_atomic(&self.path, text.as_bytes())?;
        self.dirty = false;
        tracing::debug!(path = ?self.path, keys = self.values.len(), "state committed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_opens_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path().join("nope.toml")).unwrap();
        assert!(store.get("enabled").is_none());
    }

    #[test]
    fn commit_then_reopen_restores_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub").join("state.toml");
        let mut store = FileStore::open(&path).unwrap();
        store.put("enabled", StoreValue::Bool(true));
        store.put("total_daily_volume", StoreValue::F32(42.5));
        store.put("last_dosing_time", StoreValue::U32(1_700_000_000));
        store.put("mode", StoreValue::U8(1));
        store.commit().unwrap();

        let reopened = FileStore::open(&path).unwrap();
        assert_eq!(reopened.get("enabled"), Some(StoreValue::Bool(true)));
        assert_eq!(
            reopened.get("total_daily_volume").and_then(StoreValue::as_f32),
            Some(42.5)
        );
        assert_eq!(
            reopened.get("last_dosing_time").and_then(StoreValue::as_u32),
            Some(1_700_000_000)
        );
        assert_eq!(reopened.get("mode").and_then(StoreValue::as_u8), Some(1));
    }

    #[test]
    fn commit_without_changes_does_not_create_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.toml");
        let mut store = FileStore::open(&path).unwrap();
        store.commit().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn corrupt_file_is_moved_aside_and_store_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.toml");
        fs::write(&path, "total_daily_volume = \n").unwrap();

        let mut store = FileStore::open(&path).unwrap();
        assert!(store.get("total_daily_volume").is_none());
        assert!(!path.exists());
        let aside = dir.path().join("state.toml.corrupt");
        assert_eq!(fs::read_to_string(&aside).unwrap(), "total_daily_volume = \n");

        store.put("enabled", StoreValue::Bool(true));
        store.commit().unwrap();
        let reopened = FileStore::open(&path).unwrap();
        assert_eq!(reopened.get("enabled"), Some(StoreValue::Bool(true)));
    }
}
