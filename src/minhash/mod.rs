//! MinHash signature generation over weighted shingle multisets.
//!
//! A signature is a fixed-length array of `P` 64-bit minima, one per
//! permutation. Weighted shingles are realised by inserting `w` distinct
//! variants of the same shingle text (the shingle plus a counter), which
//! preserves the min-hash Jaccard-estimation guarantee while amplifying
//! the contribution of rare shingles (see [`crate::shingle`]).

use std::hash::{Hash, Hasher};

use xxhash_rust::xxh3::Xxh3;

use crate::core::errors::{ResemblError, Result};
use crate::shingle::Shingle;

/// Default number of permutations (signature width).
pub const DEFAULT_NUM_PERMUTATIONS: u32 = 128;

/// 4-byte magic prefixing a serialized signature.
const MAGIC: &[u8; 4] = b"MHS1";

/// Fixed-width MinHash signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MinHashSignature {
    /// One minimum hash per permutation; length equals `num_permutations`.
    pub values: Vec<u64>,
}

impl MinHashSignature {
    /// Number of permutations (signature width).
    pub fn num_permutations(&self) -> u32 {
        self.values.len() as u32
    }

    /// Estimate of Jaccard similarity: fraction of matching signature slots.
    pub fn jaccard(&self, other: &Self) -> f64 {
        if self.values.is_empty() || other.values.is_empty() {
            return 0.0;
        }
        let matching = self
            .values
            .iter()
            .zip(other.values.iter())
            .filter(|(a, b)| a == b)
            .count();
        matching as f64 / self.values.len() as f64
    }

    /// Serialize to the documented wire format: 4-byte magic, 4-byte `P`,
    /// then `P` little-endian `u64`s.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + self.values.len() * 8);
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&(self.values.len() as u32).to_le_bytes());
        for v in &self.values {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out
    }

    /// Parse the wire format produced by [`Self::to_bytes`]. A `P` that
    /// disagrees with `expected_num_permutations` is a hard error.
    pub fn from_bytes(bytes: &[u8], expected_num_permutations: u32) -> Result<Self> {
        if bytes.len() < 8 {
            return Err(ResemblError::BadInput(
                "minhash signature too short for header".into(),
            ));
        }
        if &bytes[0..4] != MAGIC {
            return Err(ResemblError::BadInput(
                "minhash signature has bad magic".into(),
            ));
        }
        let p = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        if p != expected_num_permutations {
            return Err(ResemblError::StaleIndex(format!(
                "signature has P={p}, index expects P={expected_num_permutations}"
            )));
        }
        let expected_len = 8 + p as usize * 8;
        if bytes.len() != expected_len {
            return Err(ResemblError::BadInput(format!(
                "minhash signature length {} does not match P={p}",
                bytes.len()
            )));
        }
        let mut values = Vec::with_capacity(p as usize);
        for chunk in bytes[8..].chunks_exact(8) {
            values.push(u64::from_le_bytes(chunk.try_into().unwrap()));
        }
        Ok(Self { values })
    }
}

/// Hash `data` with a fixed, documented seed using xxHash3. Determinism
/// across runs follows from `Xxh3`'s seeded construction being pure.
fn hash_with_seed(data: &str, seed: u64) -> u64 {
    let mut hasher = Xxh3::with_seed(seed);
    data.hash(&mut hasher);
    hasher.finish()
}

/// Build a variant string for the `counter`-th logical copy of a shingle.
/// Variant 0 is the shingle itself so unweighted behaviour degrades to
/// plain MinHash.
fn variant(shingle_text: &str, counter: u8) -> String {
    if counter == 0 {
        shingle_text.to_string()
    } else {
        format!("{shingle_text}\u{2}{counter}")
    }
}

/// Compute a MinHash signature over `shingles` at `num_permutations`
/// permutations. Deterministic: identical `(shingles, num_permutations)`
/// always produce bit-identical output.
pub fn compute(shingles: &[Shingle], num_permutations: u32) -> MinHashSignature {
    let p = num_permutations.max(1) as usize;
    let mut values = vec![u64::MAX; p];
    for shingle in shingles {
        for counter in 0..shingle.weight {
            let element = variant(&shingle.text, counter);
            for (i, slot) in values.iter_mut().enumerate() {
                let hash = hash_with_seed(&element, i as u64);
                if hash < *slot {
                    *slot = hash;
                }
            }
        }
    }
    MinHashSignature { values }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shingles(texts: &[&str]) -> Vec<Shingle> {
        texts
            .iter()
            .map(|t| Shingle {
                text: t.to_string(),
                weight: 2,
            })
            .collect()
    }

    #[test]
    fn deterministic_across_runs() {
        let s = shingles(&["MOV REG", "PUSH REG", "RET"]);
        let a = compute(&s, 64);
        let b = compute(&s, 64);
        assert_eq!(a, b);
    }

    #[test]
    fn signature_round_trips_through_bytes() {
        let s = shingles(&["MOV REG", "PUSH REG"]);
        let sig = compute(&s, 32);
        let bytes = sig.to_bytes();
        let parsed = MinHashSignature::from_bytes(&bytes, 32).unwrap();
        assert_eq!(sig, parsed);
    }

    #[test]
    fn mismatched_p_is_hard_error() {
        let s = shingles(&["MOV REG"]);
        let sig = compute(&s, 16);
        let bytes = sig.to_bytes();
        assert!(MinHashSignature::from_bytes(&bytes, 32).is_err());
    }

    #[test]
    fn identical_shingle_sets_have_jaccard_one() {
        let s = shingles(&["MOV REG", "PUSH REG", "RET"]);
        let a = compute(&s, 128);
        let b = compute(&s, 128);
        assert_eq!(a.jaccard(&b), 1.0);
    }

    #[test]
    fn disjoint_shingle_sets_have_low_jaccard() {
        let a = compute(&shingles(&["MOV REG", "PUSH REG"]), 128);
        let b = compute(&shingles(&["SYSCALL", "CPUID"]), 128);
        assert!(a.jaccard(&b) < 0.3);
    }

    #[test]
    fn higher_weight_increases_rare_shingle_influence() {
        // A shares one rare 3-weight shingle with C; B shares common
        // 1-weight shingles with C. Despite B overlapping more tokens,
        // the amplified rare shingle should win on MinHash Jaccard.
        let a = compute(
            &[Shingle {
                text: "CPUID CPUID CPUID".into(),
                weight: 3,
            }],
            256,
        );
        let b = compute(
            &[
                Shingle {
                    text: "MOV REG , REG".into(),
                    weight: 1,
                },
                Shingle {
                    text: "PUSH REG".into(),
                    weight: 1,
                },
            ],
            256,
        );
        let c = compute(
            &[
                Shingle {
                    text: "CPUID CPUID CPUID".into(),
                    weight: 3,
                },
                Shingle {
                    text: "MOV REG , REG".into(),
                    weight: 1,
                },
            ],
            256,
        );
        assert!(a.jaccard(&c) > b.jaccard(&c));
    }
}
