//! Server-side object-pool version storage: `<storage_root>/<client_addr_hex>/<label>.vtp`.
//!
//! Each file begins with the 4-byte magic `"VTP1"` followed by a fixed header (timestamp, size,
//! VT-version, object-count, zero-padded label) and then the raw serialized pool bytes. Writes
//! go to a temp file in the same directory and are renamed into place, so a crash mid-write
//! never leaves a half-written `.vtp` file behind.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::types::{Address, Result};

const MAGIC: &[u8; 4] = b"VTP1";
const LABEL_FIELD_LEN: usize = 8;
const HEADER_LEN: usize = 4 + 8 + 4 + 2 + 1 + LABEL_FIELD_LEN;

/// One stored revision of a client's object pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredPoolVersion {
    pub label: String,
    pub data: Vec<u8>,
    pub created_at_ms: u64,
    pub vt_version: u16,
    pub object_count: u8,
}

impl StoredPoolVersion {
    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.data.len());
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&self.created_at_ms.to_le_bytes());
        out.extend_from_slice(&(self.data.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.vt_version.to_le_bytes());
        out.push(self.object_count);
        let mut label_field = [0u8; LABEL_FIELD_LEN];
        let label_bytes = self.label.as_bytes();
        let copy_len = label_bytes.len().min(LABEL_FIELD_LEN);
        label_field[..copy_len].copy_from_slice(&label_bytes[..copy_len]);
        out.extend_from_slice(&label_field);
        out.extend_from_slice(&self.data);
        out
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN || &bytes[0..4] != MAGIC {
            return Err(crate::error::IsobusError::InvalidArgument(
                "not a valid .vtp file".into(),
            ));
        }
        let created_at_ms = u64::from_le_bytes(bytes[4..12].try_into().unwrap());
        let size = u32::from_le_bytes(bytes[12..16].try_into().unwrap()) as usize;
        let vt_version = u16::from_le_bytes(bytes[16..18].try_into().unwrap());
        let object_count = bytes[18];
        let label_field = &bytes[19..19 + LABEL_FIELD_LEN];
        let label_len = label_field.iter().position(|&b| b == 0).unwrap_or(LABEL_FIELD_LEN);
        let label = String::from_utf8_lossy(&label_field[..label_len]).into_owned();
        let data_start = HEADER_LEN;
        let data_end = data_start + size;
        if bytes.len() < data_end {
            return Err(crate::error::IsobusError::InvalidArgument(
                "truncated .vtp payload".into(),
            ));
        }
        Ok(Self {
            label,
            data: bytes[data_start..data_end].to_vec(),
            created_at_ms,
            vt_version,
            object_count,
        })
    }
}

/// Manages on-disk and in-memory object-pool revisions for every connected client.
pub struct VersionStore {
    storage_root: PathBuf,
    cache: std::collections::HashMap<(Address, String), StoredPoolVersion>,
}

impl VersionStore {
    pub fn new(storage_root: impl AsRef<Path>) -> Self {
        Self {
            storage_root: storage_root.as_ref().to_path_buf(),
            cache: std::collections::HashMap::new(),
        }
    }

    fn client_dir(&self, client_address: Address) -> PathBuf {
        self.storage_root.join(format!("{client_address:02x}"))
    }

    fn file_path(&self, client_address: Address, label: &str) -> PathBuf {
        self.client_dir(client_address).join(format!("{label}.vtp"))
    }

    /// Persist a pool revision, overwriting any prior version under the same label.
    pub fn store_version(&mut self, client_address: Address, version: StoredPoolVersion) -> Result<()> {
        let dir = self.client_dir(client_address);
        fs::create_dir_all(&dir).map_err(io_err)?;
        let final_path = self.file_path(client_address, &version.label);
        let tmp_path = dir.join(format!(".{}.vtp.tmp", version.label));
        fs::write(&tmp_path, version.encode()).map_err(io_err)?;
        fs::rename(&tmp_path, &final_path).map_err(io_err)?;
        self.cache.insert((client_address, version.label.clone()), version);
        Ok(())
    }

    /// Load a version, checking the in-memory cache before falling back to disk.
    pub fn load_version(&mut self, client_address: Address, label: &str) -> Result<StoredPoolVersion> {
        if let Some(cached) = self.cache.get(&(client_address, label.to_string())) {
            return Ok(cached.clone());
        }
        let bytes = fs::read(self.file_path(client_address, label)).map_err(io_err)?;
        let version = StoredPoolVersion::decode(&bytes)?;
        self.cache.insert((client_address, label.to_string()), version.clone());
        Ok(version)
    }

    pub fn delete_version(&mut self, client_address: Address, label: &str) -> Result<()> {
        self.cache.remove(&(client_address, label.to_string()));
        let path = self.file_path(client_address, label);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err(e)),
        }
    }

    /// Populate the in-memory cache from every `.vtp` file under a client's directory.
    pub fn load_all_versions_from_disk(&mut self, client_address: Address) -> Result<Vec<StoredPoolVersion>> {
        let dir = self.client_dir(client_address);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut versions = Vec::new();
        for entry in fs::read_dir(&dir).map_err(io_err)? {
            let entry = entry.map_err(io_err)?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("vtp") {
                continue;
            }
            let bytes = fs::read(&path).map_err(io_err)?;
            let version = StoredPoolVersion::decode(&bytes)?;
            self.cache.insert((client_address, version.label.clone()), version.clone());
            versions.push(version);
        }
        Ok(versions)
    }

    /// Remove every cached and on-disk version older than `max_age_days`, relative to `now_ms`
    /// (both expressed as milliseconds since the same epoch used when storing).
    pub fn cleanup_expired_versions(&mut self, now_ms: u64, max_age_days: u32) -> Result<()> {
        let max_age_ms = u64::from(max_age_days) * 24 * 60 * 60 * 1000;
        let expired: Vec<(Address, String)> = self
            .cache
            .iter()
            .filter(|(_, v)| now_ms.saturating_sub(v.created_at_ms) > max_age_ms)
            .map(|(k, _)| k.clone())
            .collect();
        for (client_address, label) in expired {
            self.delete_version(client_address, &label)?;
        }
        Ok(())
    }

    pub fn storage_root(&self) -> &Path {
        &self.storage_root
    }
}

fn io_err(e: io::Error) -> crate::error::IsobusError {
    crate::error::IsobusError::InvalidState(format!("vtp storage i/o error: {e}"))
}
