//! Filesystem-backed store for small string-keyed configuration values.
//!
//! One current version per key: the value lives in `<dir>/<key>` so the
//! layout stays human-readable (and hand-seedable), and the vector clock
//! lives next to it in `<dir>/<key>.version` as hex. A value file without
//! a sidecar reads back with an empty clock, which is how freshly seeded
//! metadata enters the version chain.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{Result, StoreError};
use crate::store::{StorageEngine, Store};
use crate::versioning::{Occurred, Versioned, VectorClock};

pub struct FilesystemStore {
    name: String,
    dir: PathBuf,
    lock: Mutex<()>,
}

impl FilesystemStore {
    pub fn open(name: impl Into<String>, dir: impl Into<PathBuf>) -> Result<FilesystemStore> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(FilesystemStore {
            name: name.into(),
            dir,
            lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn value_path(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty() || key.contains(['/', '\\']) || key == "." || key == ".." {
            return Err(StoreError::InvalidRequest(format!(
                "key `{key}` is not a valid file name"
            )));
        }
        Ok(self.dir.join(key))
    }

    fn version_path(&self, key: &str) -> Result<PathBuf> {
        Ok(self.dir.join(format!("{key}.version")))
    }

    fn read(&self, key: &str) -> Result<Option<Versioned<String>>> {
        let value = match fs::read_to_string(self.value_path(key)?) {
            Ok(value) => value,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let version = match fs::read_to_string(self.version_path(key)?) {
            Ok(hex) => VectorClock::from_bytes(&decode_hex(hex.trim())?)?,
            Err(err) if err.kind() == ErrorKind::NotFound => VectorClock::new(),
            Err(err) => return Err(err.into()),
        };
        Ok(Some(Versioned::new(value, version)))
    }
}

impl Store<String, String> for FilesystemStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&self, key: &String) -> Result<Vec<Versioned<String>>> {
        let _guard = self.lock.lock().expect("fs store mutex poisoned");
        Ok(self.read(key)?.into_iter().collect())
    }

    fn put(&self, key: String, value: Versioned<String>) -> Result<()> {
        let _guard = self.lock.lock().expect("fs store mutex poisoned");
        if let Some(existing) = self.read(&key)? {
            match existing.version.compare(&value.version) {
                Occurred::After | Occurred::Equal => {
                    return Err(StoreError::ObsoleteVersion(format!(
                        "key `{key}`: stored {:?} is not older than incoming {:?}",
                        existing.version, value.version
                    )));
                }
                Occurred::Before | Occurred::Concurrently => {}
            }
        }
        fs::write(self.value_path(&key)?, value.value.as_bytes())?;
        fs::write(
            self.version_path(&key)?,
            encode_hex(&value.version.to_bytes()),
        )?;
        Ok(())
    }

    fn delete(&self, key: &String, version: &VectorClock) -> Result<bool> {
        let _guard = self.lock.lock().expect("fs store mutex poisoned");
        let Some(existing) = self.read(key)? else {
            return Ok(false);
        };
        match existing.version.compare(version) {
            Occurred::Before | Occurred::Equal => {
                fs::remove_file(self.value_path(key)?)?;
                match fs::remove_file(self.version_path(key)?) {
                    Ok(()) => {}
                    Err(err) if err.kind() == ErrorKind::NotFound => {}
                    Err(err) => return Err(err.into()),
                }
                Ok(true)
            }
            Occurred::After | Occurred::Concurrently => Ok(false),
        }
    }
}

impl StorageEngine<String, String> for FilesystemStore {
    fn entries(&self) -> Result<Box<dyn Iterator<Item = (String, Versioned<String>)> + Send>> {
        let _guard = self.lock.lock().expect("fs store mutex poisoned");
        let mut snapshot = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let Some(key) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if key.ends_with(".version") || !entry.metadata()?.is_file() {
                continue;
            }
            if let Some(versioned) = self.read(&key)? {
                snapshot.push((key, versioned));
            }
        }
        Ok(Box::new(snapshot.into_iter()))
    }
}

fn encode_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

fn decode_hex(raw: &str) -> Result<Vec<u8>> {
    if raw.len() % 2 != 0 {
        return Err(StoreError::InvalidRequest(
            "version sidecar has odd hex length".into(),
        ));
    }
    (0..raw.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&raw[i..i + 2], 16).map_err(|_| {
                StoreError::InvalidRequest("version sidecar is not valid hex".into())
            })
        })
        .collect()
}
