//! File-backed aggregate record store.
//!
//! Layout inside the store directory:
//! ```text
//! store.meta.json                      - metadata and schema version
//! records/
//!   <key:016x>.record.cbor.zst         - CBOR+zstd compressed aggregate records
//! integrity/
//!   manifest.json                      - sha256 per record file
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use worldgrid_hlod::{AggregateRecord, AggregateStore};

/// Current record schema version.
const RECORD_SCHEMA_VERSION: u32 = 1;

/// Errors from file-backed persistence operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CBOR serialization error: {0}")]
    CborEncode(String),
    #[error("CBOR deserialization error: {0}")]
    CborDecode(String),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("integrity check failed for {file}: expected {expected}, got {actual}")]
    IntegrityMismatch {
        file: String,
        expected: String,
        actual: String,
    },
    #[error("schema version mismatch: file has v{file_version}, expected v{expected_version}")]
    SchemaMismatch {
        file_version: u32,
        expected_version: u32,
    },
    #[error("record {0:016x} is not checked out")]
    NotCheckedOut(u64),
    #[error("record {0:016x} not found")]
    NotFound(u64),
}

/// Metadata stored in store.meta.json.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreMeta {
    pub record_schema_version: u32,
    pub record_count: u32,
}

/// Integrity manifest: record file name -> sha256 of its bytes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntegrityManifest {
    pub entries: BTreeMap<String, String>,
}

/// Aggregate records persisted one package per file, with schema versioning,
/// checkout tracking and integrity checking.
pub struct AggregatePackageStore {
    root: PathBuf,
    meta: StoreMeta,
    manifest: IntegrityManifest,
    checked_out: BTreeSet<u64>,
}

impl AggregatePackageStore {
    /// Open or create a store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = path.as_ref().to_path_buf();
        std::fs::create_dir_all(root.join("records"))?;
        std::fs::create_dir_all(root.join("integrity"))?;

        let meta_path = root.join("store.meta.json");
        let manifest_path = root.join("integrity").join("manifest.json");

        let (meta, manifest) = if meta_path.exists() {
            let meta: StoreMeta = serde_json::from_reader(std::fs::File::open(&meta_path)?)?;
            if meta.record_schema_version != RECORD_SCHEMA_VERSION {
                return Err(StoreError::SchemaMismatch {
                    file_version: meta.record_schema_version,
                    expected_version: RECORD_SCHEMA_VERSION,
                });
            }
            let manifest: IntegrityManifest = if manifest_path.exists() {
                serde_json::from_reader(std::fs::File::open(&manifest_path)?)?
            } else {
                IntegrityManifest::default()
            };
            (meta, manifest)
        } else {
            let meta = StoreMeta {
                record_schema_version: RECORD_SCHEMA_VERSION,
                record_count: 0,
            };
            let manifest = IntegrityManifest::default();
            serde_json::to_writer_pretty(std::fs::File::create(&meta_path)?, &meta)?;
            serde_json::to_writer_pretty(std::fs::File::create(&manifest_path)?, &manifest)?;
            (meta, manifest)
        };
        tracing::debug!(
            root = %root.display(),
            records = meta.record_count,
            "opened aggregate store"
        );

        Ok(Self {
            root,
            meta,
            manifest,
            checked_out: BTreeSet::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn meta(&self) -> &StoreMeta {
        &self.meta
    }

    pub fn len(&self) -> usize {
        self.manifest.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.manifest.entries.is_empty()
    }

    pub fn is_checked_out(&self, key: u64) -> bool {
        self.checked_out.contains(&key)
    }

    /// Read one record, verifying its bytes against the manifest.
    pub fn read(&self, key: u64) -> Result<AggregateRecord, StoreError> {
        let filename = record_filename(key);
        let expected = self
            .manifest
            .entries
            .get(&filename)
            .ok_or(StoreError::NotFound(key))?;
        let compressed = std::fs::read(self.root.join("records").join(&filename))?;
        let actual = sha256_hex(&compressed);
        if &actual != expected {
            return Err(StoreError::IntegrityMismatch {
                file: filename,
                expected: expected.clone(),
                actual,
            });
        }
        let cbor_bytes = zstd_decompress(&compressed)?;
        cbor_deserialize(&cbor_bytes)
    }

    /// Write a checked-out record and release the checkout.
    pub fn write(&mut self, record: &AggregateRecord) -> Result<(), StoreError> {
        if !self.checked_out.contains(&record.key) {
            return Err(StoreError::NotCheckedOut(record.key));
        }
        let filename = record_filename(record.key);
        let compressed = zstd_compress(&cbor_serialize(record)?)?;
        std::fs::write(self.root.join("records").join(&filename), &compressed)?;
        self.manifest.entries.insert(filename, sha256_hex(&compressed));
        self.checked_out.remove(&record.key);
        self.save_manifest()?;
        Ok(())
    }

    /// Remove a record file and its manifest entry.
    pub fn remove(&mut self, key: u64) -> Result<(), StoreError> {
        let filename = record_filename(key);
        self.checked_out.remove(&key);
        if self.manifest.entries.remove(&filename).is_none() {
            return Err(StoreError::NotFound(key));
        }
        let path = self.root.join("records").join(&filename);
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        self.save_manifest()?;
        Ok(())
    }

    /// Verify every manifest entry against the bytes on disk.
    pub fn verify_integrity(&self) -> Result<(), StoreError> {
        for (filename, expected) in &self.manifest.entries {
            let data = std::fs::read(self.root.join("records").join(filename))?;
            let actual = sha256_hex(&data);
            if &actual != expected {
                return Err(StoreError::IntegrityMismatch {
                    file: filename.clone(),
                    expected: expected.clone(),
                    actual,
                });
            }
        }
        Ok(())
    }

    fn keys(&self) -> Vec<u64> {
        self.manifest
            .entries
            .keys()
            .filter_map(|name| name.strip_suffix(".record.cbor.zst"))
            .filter_map(|hex| u64::from_str_radix(hex, 16).ok())
            .collect()
    }

    fn save_manifest(&mut self) -> Result<(), StoreError> {
        self.meta.record_count = self.manifest.entries.len() as u32;
        let path = self.root.join("integrity").join("manifest.json");
        serde_json::to_writer_pretty(std::fs::File::create(path)?, &self.manifest)?;
        let path = self.root.join("store.meta.json");
        serde_json::to_writer_pretty(std::fs::File::create(path)?, &self.meta)?;
        Ok(())
    }
}

impl AggregateStore for AggregatePackageStore {
    /// Every readable record. Corrupted ones are skipped, so the next pass
    /// treats their cells as new and rebuilds them.
    fn load_all(&mut self) -> Vec<AggregateRecord> {
        let mut records = Vec::new();
        for key in self.keys() {
            match self.read(key) {
                Ok(record) => records.push(record),
                Err(e) => {
                    tracing::warn!(
                        key = format_args!("{key:016x}"),
                        error = %e,
                        "skipping unreadable aggregate record"
                    );
                }
            }
        }
        records
    }

    fn checkout(&mut self, record: &AggregateRecord) -> bool {
        self.checked_out.insert(record.key);
        true
    }

    fn save(&mut self, record: &AggregateRecord) -> bool {
        match self.write(record) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(
                    aggregate = %record.name,
                    error = %e,
                    "failed to save aggregate record"
                );
                false
            }
        }
    }

    fn delete(&mut self, key: u64) -> bool {
        match self.remove(key) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(
                    key = format_args!("{key:016x}"),
                    error = %e,
                    "failed to delete aggregate record"
                );
                false
            }
        }
    }
}

fn record_filename(key: u64) -> String {
    format!("{key:016x}.record.cbor.zst")
}

fn cbor_serialize<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, StoreError> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| StoreError::CborEncode(e.to_string()))?;
    Ok(buf)
}

fn cbor_deserialize<T: for<'de> Deserialize<'de>>(data: &[u8]) -> Result<T, StoreError> {
    ciborium::from_reader(data).map_err(|e| StoreError::CborDecode(e.to_string()))
}

fn zstd_compress(data: &[u8]) -> Result<Vec<u8>, StoreError> {
    let mut encoder = zstd::Encoder::new(Vec::new(), 3)?;
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

fn zstd_decompress(data: &[u8]) -> Result<Vec<u8>, StoreError> {
    let mut decoder = zstd::Decoder::new(data)?;
    let mut buf = Vec::new();
    decoder.read_to_end(&mut buf)?;
    Ok(buf)
}

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}
