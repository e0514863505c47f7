//! Banded Locality-Sensitive-Hashing (LSH) index over MinHash signatures.
//!
//! Signatures are split into `b` contiguous bands of `r` rows
//! (`b * r == num_permutations`); each band is hashed to a bucket key with
//! [`ahash`], the way the teacher's `LshIndex` hashes band slices. Two
//! snippets sharing a bucket in any band are candidates for scoring.

use std::collections::HashMap;
use std::fs::{self, File};
use std::hash::{Hash, Hasher};
use std::io::Write as _;
use std::path::Path;

use ahash::AHasher;
use crc::{Crc, CRC_64_XZ};
use tracing::{debug, info, warn};

use crate::core::errors::{ResemblError, Result};
use crate::minhash::MinHashSignature;

/// 4-byte magic at the start of a cache file.
const MAGIC: &[u8; 4] = b"RSMB";
/// Cache file format version.
const VERSION: u16 = 1;
/// Flag bit: generalization was on when the cached signatures were built.
const FLAG_GENERALIZE: u16 = 1 << 0;

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_XZ);

/// A 32-byte content checksum, as produced by [`crate::tokenizer::checksum_bytes`].
pub type Checksum = [u8; 32];

/// Parameters that must agree between a signature and the index admitting it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LshParams {
    /// Signature width.
    pub num_permutations: u32,
    /// Shingle size used to build the signatures.
    pub ngram_size: u32,
    /// Number of bands.
    pub bands: u32,
    /// Rows per band; `bands * rows_per_band == num_permutations`.
    pub rows_per_band: u32,
    /// Whether tokenization generalization was on.
    pub generalize: bool,
}

impl LshParams {
    /// Choose `(bands, rows)` minimising `|1 - (1 - s^r)^b - 0.5|` over the
    /// feasible factorisations of `num_permutations`, at `s = lsh_threshold`.
    pub fn choose(num_permutations: u32, ngram_size: u32, generalize: bool, lsh_threshold: f64) -> Self {
        let p = num_permutations.max(1);
        let mut best = (1u32, p);
        let mut best_score = f64::INFINITY;
        for b in 1..=p {
            if p % b != 0 {
                continue;
            }
            let r = p / b;
            let curve = 1.0 - (1.0 - lsh_threshold.powi(r as i32)).powi(b as i32);
            let score = (curve - 0.5).abs();
            if score < best_score {
                best_score = score;
                best = (b, r);
            }
        }
        Self {
            num_permutations: p,
            ngram_size,
            bands: best.0,
            rows_per_band: best.1,
            generalize,
        }
    }
}

/// Hash one band's row slice into a 64-bit bucket key.
fn hash_band(rows: &[u64]) -> u64 {
    let mut hasher = AHasher::default();
    rows.hash(&mut hasher);
    hasher.finish()
}

/// Compute the b band keys for a signature under `params`.
fn band_keys(values: &[u64], params: &LshParams) -> Vec<u64> {
    let rows = params.rows_per_band as usize;
    (0..params.bands as usize)
        .map(|band| {
            let start = band * rows;
            let end = (start + rows).min(values.len());
            hash_band(&values[start..end])
        })
        .collect()
}

/// In-memory banded LSH index.
#[derive(Debug, Clone)]
pub struct LshIndex {
    params: LshParams,
    /// `(band_index, bucket_key) -> member checksums`.
    buckets: HashMap<(u8, u64), Vec<Checksum>>,
    /// Retained so incremental removal and re-banding never need a DB read.
    signatures: HashMap<Checksum, MinHashSignature>,
}

impl LshIndex {
    /// Build an empty index for the given parameters.
    pub fn new(params: LshParams) -> Self {
        Self {
            params,
            buckets: HashMap::new(),
            signatures: HashMap::new(),
        }
    }

    /// Parameters this index was built with.
    pub fn params(&self) -> LshParams {
        self.params
    }

    /// Number of signatures currently indexed.
    pub fn len(&self) -> usize {
        self.signatures.len()
    }

    /// Whether the index holds no signatures.
    pub fn is_empty(&self) -> bool {
        self.signatures.is_empty()
    }

    /// Insert (or overwrite) a checksum's signature, updating every band
    /// bucket in O(bands).
    pub fn insert(&mut self, checksum: Checksum, signature: MinHashSignature) {
        if let Some(old) = self.signatures.get(&checksum) {
            if old.values != signature.values {
                let old = old.clone();
                self.remove_from_buckets(&checksum, &old);
            }
        }
        let keys = band_keys(&signature.values, &self.params);
        for (band, key) in keys.into_iter().enumerate() {
            self.buckets
                .entry((band as u8, key))
                .or_default()
                .push(checksum);
        }
        self.signatures.insert(checksum, signature);
    }

    /// Remove a checksum's signature from its bucket entries in O(bands).
    pub fn remove(&mut self, checksum: &Checksum) {
        if let Some(signature) = self.signatures.remove(checksum) {
            self.remove_from_buckets(checksum, &signature);
        }
    }

    fn remove_from_buckets(&mut self, checksum: &Checksum, signature: &MinHashSignature) {
        let keys = band_keys(&signature.values, &self.params);
        for (band, key) in keys.into_iter().enumerate() {
            if let Some(members) = self.buckets.get_mut(&(band as u8, key)) {
                members.retain(|c| c != checksum);
                if members.is_empty() {
                    self.buckets.remove(&(band as u8, key));
                }
            }
        }
    }

    /// Query candidate checksums for a signature: the union of bucket
    /// members across all bands. No candidate is dropped pre-ranking.
    pub fn query(&self, signature: &MinHashSignature) -> Vec<Checksum> {
        let keys = band_keys(&signature.values, &self.params);
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for (band, key) in keys.into_iter().enumerate() {
            if let Some(members) = self.buckets.get(&(band as u8, key)) {
                for &checksum in members {
                    if seen.insert(checksum) {
                        out.push(checksum);
                    }
                }
            }
        }
        debug!(candidates = out.len(), "LSH query");
        out
    }

    /// Stored signature for a checksum, if present.
    pub fn signature(&self, checksum: &Checksum) -> Option<&MinHashSignature> {
        self.signatures.get(checksum)
    }

    /// Every checksum currently indexed.
    pub fn checksums(&self) -> impl Iterator<Item = &Checksum> {
        self.signatures.keys()
    }

    /// Fingerprint of `(params, sorted member checksums, count)`, used to
    /// detect staleness against current storage contents.
    pub fn fingerprint(&self) -> u64 {
        let mut members: Vec<&Checksum> = self.signatures.keys().collect();
        members.sort();
        compute_fingerprint(&self.params, &members)
    }

    /// Serialize to the documented on-disk layout, trailer CRC64 included.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(MAGIC);
        body.extend_from_slice(&VERSION.to_le_bytes());
        let flags: u16 = if self.params.generalize {
            FLAG_GENERALIZE
        } else {
            0
        };
        body.extend_from_slice(&flags.to_le_bytes());
        body.extend_from_slice(&self.params.num_permutations.to_le_bytes());
        body.extend_from_slice(&self.params.ngram_size.to_le_bytes());
        body.extend_from_slice(&self.params.bands.to_le_bytes());
        body.extend_from_slice(&self.params.rows_per_band.to_le_bytes());
        body.extend_from_slice(&self.fingerprint().to_le_bytes());

        let mut entries: Vec<(&Checksum, &MinHashSignature)> = self.signatures.iter().collect();
        entries.sort_by_key(|(c, _)| **c);
        body.extend_from_slice(&(entries.len() as u64).to_le_bytes());
        for (checksum, signature) in &entries {
            body.extend_from_slice(checksum.as_slice());
            for v in &signature.values {
                body.extend_from_slice(&v.to_le_bytes());
            }
        }

        let mut bucket_entries: Vec<(&(u8, u64), &Vec<Checksum>)> = self.buckets.iter().collect();
        bucket_entries.sort_by_key(|(k, _)| **k);
        body.extend_from_slice(&(bucket_entries.len() as u64).to_le_bytes());
        for ((band_idx, bucket_key), members) in &bucket_entries {
            body.push(*band_idx);
            body.extend_from_slice(&bucket_key.to_le_bytes());
            body.extend_from_slice(&(members.len() as u32).to_le_bytes());
            let mut sorted_members = (*members).clone();
            sorted_members.sort();
            for checksum in &sorted_members {
                body.extend_from_slice(checksum.as_slice());
            }
        }

        let crc = CRC64.checksum(&body);
        body.extend_from_slice(&crc.to_le_bytes());
        body
    }

    /// Parse the on-disk layout. Any structural problem or CRC mismatch is
    /// reported as [`ResemblError::CorruptCache`]; callers treat that as
    /// "missing" and rebuild.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(bytes);
        let magic = cursor.take(4)?;
        if magic != MAGIC {
            return Err(ResemblError::CorruptCache("bad magic".into()));
        }
        let version = cursor.take_u16()?;
        if version != VERSION {
            return Err(ResemblError::CorruptCache(format!(
                "unsupported cache version {version}"
            )));
        }
        let flags = cursor.take_u16()?;
        let num_permutations = cursor.take_u32()?;
        let ngram_size = cursor.take_u32()?;
        let bands = cursor.take_u32()?;
        let rows_per_band = cursor.take_u32()?;
        if bands.checked_mul(rows_per_band) != Some(num_permutations) {
            return Err(ResemblError::CorruptCache(
                "bands * rows_per_band != num_permutations".into(),
            ));
        }
        let _fingerprint = cursor.take_u64()?;
        let n_entries = cursor.take_u64()?;

        let params = LshParams {
            num_permutations,
            ngram_size,
            bands,
            rows_per_band,
            generalize: flags & FLAG_GENERALIZE != 0,
        };
        let mut index = LshIndex::new(params);

        for _ in 0..n_entries {
            let checksum = cursor.take_checksum()?;
            let mut values = Vec::with_capacity(num_permutations as usize);
            for _ in 0..num_permutations {
                values.push(cursor.take_u64()?);
            }
            index
                .signatures
                .insert(checksum, MinHashSignature { values });
        }

        let n_buckets = cursor.take_u64()?;
        for _ in 0..n_buckets {
            let band_idx = cursor.take_u8()?;
            let bucket_key = cursor.take_u64()?;
            let count = cursor.take_u32()?;
            let mut members = Vec::with_capacity(count as usize);
            for _ in 0..count {
                members.push(cursor.take_checksum()?);
            }
            index.buckets.insert((band_idx, bucket_key), members);
        }

        let body_len = bytes.len().saturating_sub(8);
        let stored_crc = u64::from_le_bytes(
            bytes[body_len..]
                .try_into()
                .map_err(|_| ResemblError::CorruptCache("truncated CRC trailer".into()))?,
        );
        let computed_crc = CRC64.checksum(&bytes[..body_len]);
        if stored_crc != computed_crc {
            return Err(ResemblError::CorruptCache("CRC64 mismatch".into()));
        }

        Ok(index)
    }

    /// Write the index to `path` atomically: write to `<path>.tmp`,
    /// `fsync`, then `rename` into place.
    pub fn write_atomic(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp_path = path.with_extension("tmp");
        let bytes = self.to_bytes();
        {
            let mut file = File::create(&tmp_path)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, path)?;
        info!(path = %path.display(), entries = self.len(), "wrote LSH cache");
        Ok(())
    }

    /// Load an index from `path`. A missing file, a corrupt file, or a
    /// parameter mismatch against `expected` all return `Ok(None)` — the
    /// caller rebuilds; only unexpected I/O failures are an `Err`.
    pub fn read_if_fresh(path: &Path, expected: LshParams) -> Result<Option<Self>> {
        let bytes = match fs::read(path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match Self::from_bytes(&bytes) {
            Ok(index) if index.params == expected => Ok(Some(index)),
            Ok(_) => {
                warn!(path = %path.display(), "cache parameters stale, rebuilding");
                Ok(None)
            }
            Err(ResemblError::CorruptCache(reason)) => {
                warn!(path = %path.display(), reason, "cache corrupt, rebuilding");
                Ok(None)
            }
            Err(other) => Err(other),
        }
    }
}

/// Compute the staleness fingerprint for `(params, sorted checksums)`.
pub fn compute_fingerprint(params: &LshParams, sorted_checksums: &[&Checksum]) -> u64 {
    let mut hasher = AHasher::default();
    params.num_permutations.hash(&mut hasher);
    params.ngram_size.hash(&mut hasher);
    params.bands.hash(&mut hasher);
    params.rows_per_band.hash(&mut hasher);
    params.generalize.hash(&mut hasher);
    sorted_checksums.len().hash(&mut hasher);
    for checksum in sorted_checksums {
        checksum.hash(&mut hasher);
    }
    hasher.finish()
}

/// Minimal byte-cursor over the fixed-layout cache format.
struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn need(&self, n: usize) -> Result<()> {
        if self.pos + n > self.bytes.len() {
            return Err(ResemblError::CorruptCache("truncated cache file".into()));
        }
        Ok(())
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        self.need(n)?;
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn take_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn take_u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn take_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn take_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn take_checksum(&mut self) -> Result<Checksum> {
        let slice = self.take(32)?;
        let mut out = [0u8; 32];
        out.copy_from_slice(slice);
        Ok(out)
    }
}
