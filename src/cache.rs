//! Content-addressed on-disk memoization
//!
//! A `CacheKey` names a function and its arguments; file arguments
//! contribute their full contents. The key is a SHA-256 over
//! length-prefixed fields: the format version, the function name, then
//! each argument name with its little-endian value bytes (or the SHA-256
//! of a file's contents), so digests are stable across builds and
//! platforms. Each entry lives under
//! `<cache dir>/decode_cache/<function>/` as an lz4-compressed payload
//! (`<digest>.bin`) plus JSON metadata (`<digest>.json`) written last.
//!
//! Invalidation: changed inputs produce a different key; entries from
//! another format or crate version, or whose stored description does not
//! match the key, are misses; unreadable entries are misses; `clear`
//! removes everything. Entries never expire on their own.

use crate::structs::{DecodeError, DecodingData, Result};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt::{Debug, Write as _};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Bumped whenever the key scheme or a payload encoding changes
///
/// Version 2 keys are SHA-256 digests of explicit byte encodings.
pub const CACHE_FORMAT_VERSION: u32 = 2;

const CACHE_DIR_NAME: &str = "decode_cache";

/// Values that can be stored in the cache
pub trait CacheEntry: Sized {
    fn encode(&self) -> Vec<u8>;

    /// # Errors
    /// Returns error if `bytes` is not a valid encoding
    fn decode(bytes: &[u8]) -> Result<Self>;
}

/// Argument values with a fixed byte encoding
pub trait KeyArg: Debug {
    fn key_bytes(&self) -> Vec<u8>;
}

macro_rules! le_key_arg {
    ($($t:ty),*) => {
        $(
            impl KeyArg for $t {
                fn key_bytes(&self) -> Vec<u8> {
                    self.to_le_bytes().to_vec()
                }
            }
        )*
    };
}

le_key_arg!(u8, u32, u64, i64, f64);

impl KeyArg for str {
    fn key_bytes(&self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().fold(String::with_capacity(2 * bytes.len()), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}

/// Function identity plus argument values
#[derive(Clone)]
pub struct CacheKey {
    function: String,
    description: String,
    hasher: Sha256,
}

impl CacheKey {
    #[must_use]
    pub fn new(function: &str) -> Self {
        let mut key = Self {
            function: function.to_string(),
            description: function.to_string(),
            hasher: Sha256::new(),
        };
        key.field(&CACHE_FORMAT_VERSION.to_le_bytes());
        key.field(function.as_bytes());
        key
    }

    /// Feed one length-prefixed field into the digest
    fn field(&mut self, bytes: &[u8]) {
        self.hasher.update((bytes.len() as u64).to_le_bytes());
        self.hasher.update(bytes);
    }

    /// Add a named argument value
    #[must_use]
    pub fn arg<T: KeyArg + ?Sized>(mut self, name: &str, value: &T) -> Self {
        self.field(name.as_bytes());
        self.field(&value.key_bytes());
        let _ = write!(self.description, " {name}={value:?}");
        self
    }

    /// Add a named file argument, keyed by the SHA-256 of its contents
    ///
    /// # Errors
    /// Returns error if the file cannot be read
    pub fn file(mut self, name: &str, path: &Path) -> Result<Self> {
        let mut content_hasher = Sha256::new();
        io::copy(&mut File::open(path)?, &mut content_hasher)?;
        let content_digest = content_hasher.finalize();

        self.field(name.as_bytes());
        self.field(&content_digest);
        let _ = write!(
            self.description,
            " {name}={}#{}",
            path.display(),
            to_hex(&content_digest)
        );
        Ok(self)
    }

    /// Hex digest naming the entry on disk
    #[must_use]
    pub fn digest(&self) -> String {
        to_hex(&self.hasher.clone().finalize())
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct CacheMeta {
    format_version: u32,
    crate_version: String,
    function: String,
    description: String,
    payload_bytes: usize,
}

/// Cache rooted in a directory
#[derive(Debug, Clone)]
pub struct DiskCache {
    root: PathBuf,
}

impl DiskCache {
    /// Open (creating if needed) the cache under `dir`
    ///
    /// # Errors
    /// Returns error if the directory cannot be created
    pub fn open(dir: &Path) -> Result<Self> {
        let root = dir.join(CACHE_DIR_NAME);
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_paths(&self, key: &CacheKey) -> (PathBuf, PathBuf) {
        let dir = self.root.join(&key.function);
        let digest = key.digest();
        (
            dir.join(format!("{digest}.bin")),
            dir.join(format!("{digest}.json")),
        )
    }

    /// Look up `key`; stale or unreadable entries are misses
    ///
    /// # Errors
    /// Returns error only for unexpected IO failures on existing entries
    pub fn get<T: CacheEntry>(&self, key: &CacheKey) -> Result<Option<T>> {
        let (bin_path, meta_path) = self.entry_paths(key);
        if !meta_path.exists() || !bin_path.exists() {
            return Ok(None);
        }

        let meta: CacheMeta = match serde_json::from_slice(&fs::read(&meta_path)?) {
            Ok(meta) => meta,
            Err(e) => {
                warn!("Ignoring unreadable cache metadata {}: {e}", meta_path.display());
                return Ok(None);
            }
        };

        if meta.format_version != CACHE_FORMAT_VERSION
            || meta.crate_version != env!("CARGO_PKG_VERSION")
            || meta.function != key.function
            || meta.description != key.description
        {
            debug!("Stale cache entry {}", meta_path.display());
            return Ok(None);
        }

        let compressed = fs::read(&bin_path)?;
        let payload = match lz4_flex::decompress_size_prepended(&compressed) {
            Ok(payload) if payload.len() == meta.payload_bytes => payload,
            Ok(_) => {
                warn!("Cache payload {} has the wrong size", bin_path.display());
                return Ok(None);
            }
            Err(e) => {
                warn!("Corrupt cache payload {}: {e}", bin_path.display());
                return Ok(None);
            }
        };

        match T::decode(&payload) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                warn!("Undecodable cache payload {}: {e}", bin_path.display());
                Ok(None)
            }
        }
    }

    /// Store `value` under `key`, replacing any previous entry
    ///
    /// # Errors
    /// Returns error if the entry cannot be written
    pub fn put<T: CacheEntry>(&self, key: &CacheKey, value: &T) -> Result<()> {
        let (bin_path, meta_path) = self.entry_paths(key);
        if let Some(dir) = bin_path.parent() {
            fs::create_dir_all(dir)?;
        }
        if meta_path.exists() {
            fs::remove_file(&meta_path)?;
        }

        let payload = value.encode();
        fs::write(&bin_path, lz4_flex::compress_prepend_size(&payload))?;

        let meta = CacheMeta {
            format_version: CACHE_FORMAT_VERSION,
            crate_version: env!("CARGO_PKG_VERSION").to_string(),
            function: key.function.clone(),
            description: key.description.clone(),
            payload_bytes: payload.len(),
        };
        fs::write(&meta_path, serde_json::to_string_pretty(&meta)?)?;
        Ok(())
    }

    /// Return the cached value for `key`, computing and storing it on a miss
    ///
    /// # Errors
    /// Returns error if `compute` fails or the entry cannot be written
    pub fn get_or_compute<T, F>(&self, key: &CacheKey, compute: F) -> Result<T>
    where
        T: CacheEntry,
        F: FnOnce() -> Result<T>,
    {
        if let Some(value) = self.get(key)? {
            info!("Cache hit for {} ({})", key.function, key.digest());
            return Ok(value);
        }

        info!("Cache miss for {} ({})", key.function, key.digest());
        let value = compute()?;
        self.put(key, &value)?;
        Ok(value)
    }

    /// Delete every entry; returns how many were removed
    ///
    /// # Errors
    /// Returns error if the cache directory cannot be read or cleaned
    pub fn clear(&self) -> Result<usize> {
        let mut removed = 0;
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            if !path.is_dir() {
                continue;
            }
            for file in fs::read_dir(&path)? {
                if file?.path().extension().is_some_and(|ext| ext == "json") {
                    removed += 1;
                }
            }
            fs::remove_dir_all(&path)?;
        }
        Ok(removed)
    }
}

// ============================================================================
// Payload encodings
// ============================================================================

fn read_u64(bytes: &[u8], offset: usize) -> Result<u64> {
    bytes
        .get(offset..offset + 8)
        .and_then(|chunk| chunk.try_into().ok())
        .map(u64::from_le_bytes)
        .ok_or_else(|| DecodeError::Ml("truncated cache payload".into()))
}

impl CacheEntry for DecodingData {
    fn encode(&self) -> Vec<u8> {
        let n = self.n_samples();
        let p = self.n_features();
        let mut bytes = Vec::with_capacity(16 + 8 * (n * p + 2 * n));

        bytes.extend_from_slice(&(n as u64).to_le_bytes());
        bytes.extend_from_slice(&(p as u64).to_le_bytes());
        for value in &self.x {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        for label in &self.labels {
            bytes.extend_from_slice(&label.to_le_bytes());
        }
        for session in &self.sessions {
            bytes.extend_from_slice(&session.to_le_bytes());
        }
        bytes
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        let n = usize::try_from(read_u64(bytes, 0)?)
            .map_err(|_| DecodeError::Ml("cached sample count overflows".into()))?;
        let p = usize::try_from(read_u64(bytes, 8)?)
            .map_err(|_| DecodeError::Ml("cached feature count overflows".into()))?;

        let cells = n
            .checked_mul(p)
            .and_then(|np| np.checked_add(2 * n))
            .ok_or_else(|| DecodeError::Ml("cached shape overflows".into()))?;
        if bytes.len() != 16 + 8 * cells {
            return Err(DecodeError::Ml(format!(
                "cached payload holds {} bytes, expected {}",
                bytes.len(),
                16 + 8 * cells
            )));
        }

        let mut words = bytes[16..]
            .chunks_exact(8)
            .map(|chunk| <[u8; 8]>::try_from(chunk).unwrap_or([0; 8]));

        let values: Vec<f64> = words.by_ref().take(n * p).map(f64::from_le_bytes).collect();
        let labels: Vec<i64> = words.by_ref().take(n).map(i64::from_le_bytes).collect();
        let sessions: Vec<i64> = words.take(n).map(i64::from_le_bytes).collect();

        let x = Array2::from_shape_vec((n, p), values)
            .map_err(|e| DecodeError::Ml(format!("cached design matrix: {e}")))?;
        Self::new(x, labels, sessions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use std::cell::Cell;
    use tempfile::TempDir;

    fn sample() -> DecodingData {
        DecodingData::new(
            array![[1.0, -2.5, 3.25], [0.0, 7.0, -1.0]],
            vec![1, 2],
            vec![0, 3],
        )
        .expect("aligned")
    }

    #[test]
    fn test_decoding_data_payload() {
        let data = sample();
        let decoded = DecodingData::decode(&data.encode()).expect("decode");
        assert_eq!(decoded, data);

        let mut truncated = data.encode();
        truncated.pop();
        assert!(DecodingData::decode(&truncated).is_err());
    }

    #[test]
    fn test_get_or_compute_memoizes() {
        let dir = TempDir::new().expect("create temp dir");
        let cache = DiskCache::open(dir.path()).expect("open");
        let key = CacheKey::new("preprocess").arg("max_label", &2i64);
        let calls = Cell::new(0);

        for _ in 0..2 {
            let value = cache
                .get_or_compute(&key, || {
                    calls.set(calls.get() + 1);
                    Ok(sample())
                })
                .expect("compute");
            assert_eq!(value, sample());
        }
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_key_depends_on_arguments_and_files() {
        let dir = TempDir::new().expect("create temp dir");
        let input = dir.path().join("input.txt");
        fs::write(&input, "1 0\n").expect("write");

        let base = CacheKey::new("preprocess").arg("max_label", &2i64);
        let other = CacheKey::new("preprocess").arg("max_label", &3i64);
        assert_ne!(base.digest(), other.digest());

        let before = base.clone().file("attributes", &input).expect("hash");
        let same = base.clone().file("attributes", &input).expect("hash");
        assert_eq!(before.digest(), same.digest());

        fs::write(&input, "2 0\n").expect("rewrite");
        let after = base.file("attributes", &input).expect("hash");
        assert_ne!(before.digest(), after.digest());
    }

    #[test]
    fn test_digest_is_fixed_byte_encoding() {
        // SHA-256 of the length-prefixed fields: version 2, "preprocess",
        // "max_label", 2i64, each as little-endian bytes
        let key = CacheKey::new("preprocess").arg("max_label", &2i64);
        assert_eq!(
            key.digest(),
            "0a4c9a02f83f51202408598cd34cb76988b4d0393ad30bc542b1af58e2305b30"
        );

        assert_ne!(
            key.digest(),
            CacheKey::new("preprocess").arg("rest_label", &2i64).digest()
        );
        assert_ne!(key.digest(), CacheKey::new("preprocess").arg("max_label", "2").digest());
    }

    #[test]
    fn test_stale_and_corrupt_entries_are_misses() {
        let dir = TempDir::new().expect("create temp dir");
        let cache = DiskCache::open(dir.path()).expect("open");
        let key = CacheKey::new("preprocess");
        cache.put(&key, &sample()).expect("put");
        assert!(cache.get::<DecodingData>(&key).expect("get").is_some());

        let (bin_path, meta_path) = cache.entry_paths(&key);

        let mut meta: CacheMeta =
            serde_json::from_slice(&fs::read(&meta_path).expect("read")).expect("parse");
        meta.format_version += 1;
        fs::write(&meta_path, serde_json::to_string(&meta).expect("json")).expect("write");
        assert!(cache.get::<DecodingData>(&key).expect("get").is_none());

        cache.put(&key, &sample()).expect("put");
        fs::write(&bin_path, b"not lz4").expect("corrupt");
        assert!(cache.get::<DecodingData>(&key).expect("get").is_none());
    }

    #[test]
    fn test_clear() {
        let dir = TempDir::new().expect("create temp dir");
        let cache = DiskCache::open(dir.path()).expect("open");
        cache.put(&CacheKey::new("preprocess").arg("k", &1u8), &sample()).expect("put");
        cache.put(&CacheKey::new("preprocess").arg("k", &2u8), &sample()).expect("put");

        assert_eq!(cache.clear().expect("clear"), 2);
        assert!(cache
            .get::<DecodingData>(&CacheKey::new("preprocess").arg("k", &1u8))
            .expect("get")
            .is_none());
    }
}
