//! Profile persistence.
//!
//! Profiles are stored as JSON values in a key-value medium under
//! `"profile." + workload_id`, next to one reserved key holding the device
//! identity token. The in-memory cache is the single source of truth for
//! reads within a process lifetime.
//!
//! Persistence is best effort: the first failure of the medium drops the
//! store into in-memory-only mode instead of surfacing an error to the
//! control loop.

use crate::error::StoreError;
use crate::profile::QualityProfile;
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// Prefix of every profile key
pub const PROFILE_KEY_PREFIX: &str = "profile.";

/// Reserved key for the device identity token
pub const DEVICE_IDENTITY_KEY: &str = "device.identity";

/// Key under which a workload's profile is stored.
pub fn profile_key(workload_id: &str) -> String {
    format!("{}{}", PROFILE_KEY_PREFIX, workload_id)
}

/// Byte-oriented key-value persistence medium.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;

    fn remove(&self, key: &str) -> Result<(), StoreError>;

    fn keys(&self) -> Result<Vec<String>, StoreError>;
}

impl<T: KeyValueStore + ?Sized> KeyValueStore for std::sync::Arc<T> {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        (**self).set(key, value)
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        (**self).remove(key)
    }

    fn keys(&self) -> Result<Vec<String>, StoreError> {
        (**self).keys()
    }
}

/// Volatile store; contents vanish with the process.
#[derive(Debug, Default)]
pub struct MemoryKeyValueStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Vec<u8>>>, StoreError> {
        self.entries
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))
    }
}

impl KeyValueStore for MemoryKeyValueStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.lock()?.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.lock()?.remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.lock()?.keys().cloned().collect())
    }
}

/// Directory-backed store, one file per key.
///
/// Writes go to a temporary file that is renamed over the target, so a
/// crash never leaves a half-written value behind.
#[derive(Debug)]
pub struct FileKeyValueStore {
    dir: PathBuf,
}

impl FileKeyValueStore {
    /// Open (creating if needed) a store rooted at `dir`.
    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        fs::create_dir_all(dir).map_err(|e| StoreError::OpenFailed {
            path: dir.display().to_string(),
            source: e,
        })?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    /// Default store directory (~/.local/share/quality-governor/profiles).
    pub fn default_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("quality-governor")
            .join("profiles")
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(encode_key(key))
    }
}

impl KeyValueStore for FileKeyValueStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        match fs::read(self.path_for(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::ReadFailed {
                key: key.to_string(),
                source: e,
            }),
        }
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let write_err = |e: std::io::Error| StoreError::WriteFailed {
            key: key.to_string(),
            source: e,
        };
        let path = self.path_for(key);
        let temp_path = self.dir.join(format!("~{}", encode_key(key)));

        {
            let mut file = fs::File::create(&temp_path).map_err(write_err)?;
            file.write_all(value).map_err(write_err)?;
            file.sync_all().map_err(write_err)?;
        }
        fs::rename(&temp_path, &path).map_err(write_err)
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::WriteFailed {
                key: key.to_string(),
                source: e,
            }),
        }
    }

    fn keys(&self) -> Result<Vec<String>, StoreError> {
        let entries = fs::read_dir(&self.dir).map_err(|e| StoreError::ReadFailed {
            key: "*".to_string(),
            source: e,
        })?;

        Ok(entries
            .flatten()
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().to_string();
                // Leftover temp files from an interrupted write
                if name.starts_with('~') {
                    return None;
                }
                decode_key(&name)
            })
            .collect())
    }
}

/// Escape a key into a portable file name.
fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for (i, byte) in key.bytes().enumerate() {
        match byte {
            // A leading dot would allow "." and ".." as file names
            b'.' if i == 0 => out.push_str("%2E"),
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'.' | b'-' | b'_' => out.push(byte as char),
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

fn decode_key(name: &str) -> Option<String> {
    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = name.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

/// Cached, best-effort profile persistence.
pub struct ProfileStore {
    backend: Box<dyn KeyValueStore>,
    cache: HashMap<String, QualityProfile>,
    persistent: bool,
}

impl ProfileStore {
    /// Open the store and verify the device identity.
    ///
    /// A persisted identity that differs from `device_identity` means the
    /// data came from other hardware; every learned profile is wiped. A
    /// missing identity is a first run and wipes nothing.
    pub fn open(backend: Box<dyn KeyValueStore>, device_identity: &str) -> Self {
        let mut store = Self {
            backend,
            cache: HashMap::new(),
            persistent: true,
        };
        store.verify_identity(device_identity);
        store
    }

    /// Store that never touches a persistence medium.
    pub fn in_memory() -> Self {
        Self {
            backend: Box::new(MemoryKeyValueStore::new()),
            cache: HashMap::new(),
            persistent: false,
        }
    }

    /// Whether writes still reach the persistence medium.
    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    /// Profile for a workload. Never fails: falls back to a fresh
    /// maximum-quality profile which is then cached.
    pub fn load(&mut self, workload_id: &str) -> QualityProfile {
        if let Some(profile) = self.cache.get(workload_id) {
            return profile.clone();
        }

        let profile = self
            .read_persisted(workload_id)
            .unwrap_or_else(|| QualityProfile::new(workload_id));
        self.cache
            .insert(workload_id.to_string(), profile.clone());
        profile
    }

    /// Update the cache and persist.
    pub fn save(&mut self, profile: &QualityProfile) {
        self.cache
            .insert(profile.workload_id.clone(), profile.clone());

        if !self.persistent {
            return;
        }
        let result = serde_json::to_vec(profile)
            .map_err(StoreError::from)
            .and_then(|bytes| self.backend.set(&profile_key(&profile.workload_id), &bytes));
        match result {
            Ok(()) => debug!(
                "Persisted profile {} (rate={:.1}, scale={:.2}, detail={:.2})",
                profile.workload_id, profile.rate, profile.scale, profile.detail
            ),
            Err(e) => self.degrade(e),
        }
    }

    /// Drop a workload from cache and medium.
    pub fn remove(&mut self, workload_id: &str) {
        self.cache.remove(workload_id);
        if self.persistent {
            if let Err(e) = self.backend.remove(&profile_key(workload_id)) {
                self.degrade(e);
            }
        }
    }

    /// Forget cached profiles; the next load reads the medium again.
    pub fn clear_cache(&mut self) {
        self.cache.clear();
    }

    /// Workload ids currently cached.
    pub fn cached_ids(&self) -> Vec<String> {
        self.cache.keys().cloned().collect()
    }

    fn read_persisted(&mut self, workload_id: &str) -> Option<QualityProfile> {
        if !self.persistent {
            return None;
        }
        let bytes = match self.backend.get(&profile_key(workload_id)) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(e) => {
                self.degrade(e);
                return None;
            }
        };

        match serde_json::from_slice::<QualityProfile>(&bytes) {
            Ok(profile) if profile.workload_id == workload_id => Some(profile.sanitized()),
            Ok(profile) => {
                warn!(
                    "Profile stored for {} claims id {}, discarding",
                    workload_id, profile.workload_id
                );
                None
            }
            Err(e) => {
                warn!("Malformed profile for {}: {}, using defaults", workload_id, e);
                None
            }
        }
    }

    fn verify_identity(&mut self, current: &str) {
        let stored = match self.backend.get(DEVICE_IDENTITY_KEY) {
            Ok(stored) => stored,
            Err(e) => {
                self.degrade(e);
                return;
            }
        };

        match stored {
            Some(bytes) if bytes == current.as_bytes() => {
                debug!("Device identity matches persisted profiles");
                return;
            }
            Some(_) => {
                info!("Device identity changed, wiping learned profiles");
                if let Err(e) = self.wipe_profiles() {
                    self.degrade(e);
                    return;
                }
            }
            None => info!("No device identity persisted, treating as first run"),
        }

        if let Err(e) = self.backend.set(DEVICE_IDENTITY_KEY, current.as_bytes()) {
            self.degrade(e);
        }
    }

    fn wipe_profiles(&mut self) -> Result<(), StoreError> {
        let keys = self.backend.keys()?;
        let mut wiped = 0;
        for key in keys.iter().filter(|k| k.starts_with(PROFILE_KEY_PREFIX)) {
            self.backend.remove(key)?;
            wiped += 1;
        }
        self.cache.clear();
        info!("Wiped {} profiles", wiped);
        Ok(())
    }

    fn degrade(&mut self, error: StoreError) {
        if self.persistent {
            warn!(
                "Profile persistence unavailable ({}), continuing in memory only",
                error
            );
        }
        self.persistent = false;
    }
}
