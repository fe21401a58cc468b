// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use crate::PersistError;

/// Broker sessions, field is the client id.
pub const KEY_BROKER_SESSION: &str = "mq:ss";

/// Broker retained messages, field is the topic name.
pub const KEY_BROKER_RETAIN: &str = "mq:sr";

/// Client sessions, field is the client id.
pub const KEY_CLIENT_SESSION: &str = "mq:cs";

/// Storage backend for sessions and retained messages.
///
/// Records are opaque byte blobs addressed by `(key, field)`; the reserved
/// keys above partition the namespace. Implementations must be safe to share
/// between connection tasks.
pub trait Persister: Send + Sync {
    /// Store `data` under `(key, field)`, replacing any previous record.
    ///
    /// # Errors
    ///
    /// Returns error if the backend cannot store the record.
    fn save(&self, key: &str, field: &str, data: &[u8]) -> Result<(), PersistError>;

    /// Read the record under `(key, field)`. Absent records read as empty.
    ///
    /// # Errors
    ///
    /// Returns error if the backend fails; "no such record" is not an error.
    fn read(&self, key: &str, field: &str) -> Result<Vec<u8>, PersistError>;

    /// Delete the record under `(key, field)`. Deleting an absent record
    /// is a no-op.
    ///
    /// # Errors
    ///
    /// Returns error if the backend cannot delete the record.
    fn delete(&self, key: &str, field: &str) -> Result<(), PersistError>;

    /// Load every record stored under `key`, as a field to data mapping.
    ///
    /// # Errors
    ///
    /// Returns error if the backend cannot enumerate the records.
    fn load_all(&self, key: &str) -> Result<HashMap<String, Vec<u8>>, PersistError>;
}

/// In-process persister. State dies with the process; used by tests and as
/// the default when durable storage is not configured.
#[derive(Debug, Default)]
pub struct MemoryPersister {
    records: RwLock<HashMap<String, HashMap<String, Vec<u8>>>>,
}

impl MemoryPersister {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with_records<T>(&self, f: impl FnOnce(&HashMap<String, HashMap<String, Vec<u8>>>) -> T) -> T {
        match self.records.read() {
            Ok(guard) => f(&guard),
            Err(poisoned) => f(&poisoned.into_inner()),
        }
    }

    fn with_records_mut<T>(
        &self,
        f: impl FnOnce(&mut HashMap<String, HashMap<String, Vec<u8>>>) -> T,
    ) -> T {
        match self.records.write() {
            Ok(mut guard) => f(&mut guard),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }
}

impl Persister for MemoryPersister {
    fn save(&self, key: &str, field: &str, data: &[u8]) -> Result<(), PersistError> {
        self.with_records_mut(|records| {
            records
                .entry(key.to_string())
                .or_default()
                .insert(field.to_string(), data.to_vec());
        });
        Ok(())
    }

    fn read(&self, key: &str, field: &str) -> Result<Vec<u8>, PersistError> {
        Ok(self.with_records(|records| {
            records
                .get(key)
                .and_then(|fields| fields.get(field))
                .cloned()
                .unwrap_or_default()
        }))
    }

    fn delete(&self, key: &str, field: &str) -> Result<(), PersistError> {
        self.with_records_mut(|records| {
            if let Some(fields) = records.get_mut(key) {
                fields.remove(field);
            }
        });
        Ok(())
    }

    fn load_all(&self, key: &str) -> Result<HashMap<String, Vec<u8>>, PersistError> {
        Ok(self.with_records(|records| records.get(key).cloned().unwrap_or_default()))
    }
}

/// Persister writing one file per `(key, field)` record below a root
/// directory.
///
/// Key and field are base64-url encoded in the path: keys contain `:` and
/// topic fields contain `/`, neither of which belongs in a file name.
#[derive(Debug, Clone)]
pub struct FilePersister {
    root: PathBuf,
}

impl FilePersister {
    /// Create a persister rooted at `root`. The directory is created when
    /// the first record is written.
    #[must_use]
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn key_dir(&self, key: &str) -> PathBuf {
        self.root.join(URL_SAFE_NO_PAD.encode(key))
    }

    fn record_path(&self, key: &str, field: &str) -> PathBuf {
        self.key_dir(key).join(URL_SAFE_NO_PAD.encode(field))
    }
}

impl Persister for FilePersister {
    fn save(&self, key: &str, field: &str, data: &[u8]) -> Result<(), PersistError> {
        let dir = self.key_dir(key);
        fs::create_dir_all(&dir)?;
        fs::write(self.record_path(key, field), data)?;
        Ok(())
    }

    fn read(&self, key: &str, field: &str) -> Result<Vec<u8>, PersistError> {
        match fs::read(self.record_path(key, field)) {
            Ok(data) => Ok(data),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => Err(err.into()),
        }
    }

    fn delete(&self, key: &str, field: &str) -> Result<(), PersistError> {
        match fs::remove_file(self.record_path(key, field)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn load_all(&self, key: &str) -> Result<HashMap<String, Vec<u8>>, PersistError> {
        let dir = self.key_dir(key);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(err) => return Err(err.into()),
        };

        let mut records = HashMap::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            let Ok(field) = URL_SAFE_NO_PAD.decode(name) else {
                log::warn!("persist: Skip stray file in {dir:?}: {name}");
                continue;
            };
            let Ok(field) = String::from_utf8(field) else {
                continue;
            };
            records.insert(field, fs::read(entry.path())?);
        }
        Ok(records)
    }
}
