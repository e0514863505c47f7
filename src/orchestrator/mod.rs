//! Search orchestrator: end-to-end `add`/`find`/`compare`/`reindex`
//! pipelines and LSH cache lifecycle, wired the way `valknut-rs` wires its
//! detector pipeline around a config and a pluggable storage trait.
//!
//! Single-writer: every method that mutates storage also reconciles the
//! in-memory LSH index before returning, so an external observer never
//! sees a storage commit without a matching index update (the one
//! exception being the explicit rebuild-from-scratch path in
//! [`Orchestrator::reindex`]).

use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::Utc;
use rayon::prelude::*;
use tracing::{info, warn};

use crate::core::config::ResemblConfig;
use crate::core::errors::{ResemblError, Result};
use crate::lsh::{self, LshIndex, LshParams};
use crate::minhash::{self, MinHashSignature};
use crate::scorer::{self, Comparison};
use crate::shingle;
use crate::storage::{self, Checksum, Snippet, SnippetVersion, StorageBackend, UpsertOutcome};
use crate::tokenizer;

/// One ranked result from [`Orchestrator::find`].
#[derive(Debug, Clone, PartialEq)]
pub struct FindResult {
    pub checksum: Checksum,
    pub names: Vec<String>,
    pub jaccard: f64,
    pub levenshtein: f64,
    pub hybrid: f64,
}

/// Corpus-wide statistics returned by [`Orchestrator::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Stats {
    pub num_snippets: usize,
    pub mean_token_count: f64,
    pub vocabulary_size: usize,
    pub mean_pairwise_jaccard: f64,
}

/// Drives the similarity pipeline over a [`StorageBackend`] and a
/// lazily-built, disk-cached [`LshIndex`].
pub struct Orchestrator<S: StorageBackend> {
    storage: S,
    config: ResemblConfig,
    cache_path: PathBuf,
    index: Mutex<Option<LshIndex>>,
}

impl<S: StorageBackend> Orchestrator<S> {
    pub fn new(storage: S, config: ResemblConfig, cache_path: PathBuf) -> Self {
        Self {
            storage,
            config,
            cache_path,
            index: Mutex::new(None),
        }
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn config(&self) -> &ResemblConfig {
        &self.config
    }

    fn lsh_params(&self) -> LshParams {
        LshParams::choose(
            self.config.num_permutations,
            self.config.ngram_size,
            true,
            self.config.lsh_threshold,
        )
    }

    /// Checksums whose stored minhash parses cleanly under `params`; a
    /// snippet whose minhash was produced under different parameters is
    /// stale and excluded until [`Orchestrator::reindex`] runs.
    fn eligible_checksums(&self, params: &LshParams) -> Vec<Checksum> {
        let mut out: Vec<Checksum> = self
            .storage
            .iter_all()
            .filter(|s| MinHashSignature::from_bytes(&s.minhash, params.num_permutations).is_ok())
            .map(|s| s.checksum)
            .collect();
        out.sort();
        out
    }

    fn expected_fingerprint(&self, params: &LshParams) -> u64 {
        let checksums = self.eligible_checksums(params);
        let refs: Vec<&Checksum> = checksums.iter().collect();
        lsh::compute_fingerprint(params, &refs)
    }

    fn build_index(&self, params: &LshParams) -> LshIndex {
        let mut index = LshIndex::new(*params);
        for snippet in self.storage.iter_all() {
            match MinHashSignature::from_bytes(&snippet.minhash, params.num_permutations) {
                Ok(signature) => index.insert(snippet.checksum, signature),
                Err(_) => warn!(
                    checksum = %storage::to_hex(&snippet.checksum),
                    "stale minhash excluded from index"
                ),
            }
        }
        index
    }

    /// Load the cache if fresh, else rebuild it from storage. Safe to call
    /// repeatedly; a no-op once the in-memory index already matches
    /// storage's current contents.
    fn ensure_index(&self) -> Result<()> {
        let params = self.lsh_params();
        let mut guard = self.index.lock().unwrap();
        if guard.is_none() {
            *guard = LshIndex::read_if_fresh(&self.cache_path, params)?;
        }
        let expected = self.expected_fingerprint(&params);
        let stale = guard
            .as_ref()
            .map(|index| index.fingerprint() != expected)
            .unwrap_or(true);
        if stale {
            let rebuilt = self.build_index(&params);
            rebuilt.write_atomic(&self.cache_path)?;
            info!(entries = rebuilt.len(), "rebuilt LSH index");
            *guard = Some(rebuilt);
        }
        Ok(())
    }

    /// Tokenize, shingle, and MinHash a query string under the active
    /// parameters. `normalize_query` selects whether `query` is raw
    /// assembly text that still needs generalizing (`true`, the common
    /// case) or already-canonical token text that should be tokenized
    /// without re-generalizing (`false`, for callers feeding a
    /// precomputed normalized form).
    fn query_signature(&self, query: &str, normalize_query: bool) -> MinHashSignature {
        let tokens = tokenizer::tokenize(query, normalize_query);
        let shingles = shingle::shingle(&tokens, self.config.ngram_size as usize);
        minhash::compute(&shingles, self.config.num_permutations)
    }

    /// `find(query, top_n, threshold, normalize_query)`: ensure the index,
    /// run the query through the same pipeline that built it, discard
    /// candidates below `threshold`, and return the top `top_n` by hybrid
    /// score (ties broken by Levenshtein, then checksum).
    pub fn find(
        &self,
        query: &str,
        top_n: usize,
        threshold: f64,
        normalize_query: bool,
    ) -> Result<Vec<FindResult>> {
        self.ensure_index()?;
        let query_sig = self.query_signature(query, normalize_query);

        let guard = self.index.lock().unwrap();
        let index = guard.as_ref().expect("ensure_index populated the index");
        let candidates = index.query(&query_sig);

        let mut results = Vec::new();
        for checksum in candidates {
            let Some(signature) = index.signature(&checksum) else {
                continue;
            };
            let jaccard = query_sig.jaccard(signature);
            if jaccard < threshold {
                continue;
            }
            let snippet = self.storage.get_by_checksum(&checksum)?;
            let levenshtein = scorer::levenshtein_ratio(query, &snippet.code);
            let hybrid = scorer::hybrid(jaccard, levenshtein, self.config.jaccard_weight);
            results.push(FindResult {
                checksum,
                names: snippet.names,
                jaccard,
                levenshtein,
                hybrid,
            });
        }

        results.sort_by(|a, b| {
            b.hybrid
                .partial_cmp(&a.hybrid)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    b.levenshtein
                        .partial_cmp(&a.levenshtein)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| a.checksum.cmp(&b.checksum))
        });
        results.truncate(top_n);
        Ok(results)
    }

    /// `compare(a, b)`: look both snippets up by checksum prefix and run
    /// the full scorer over their stored code and signatures.
    pub fn compare(&self, checksum_a: &str, checksum_b: &str) -> Result<Comparison> {
        let params = self.lsh_params();
        let a = self.storage.get_by_checksum_prefix(checksum_a)?;
        let b = self.storage.get_by_checksum_prefix(checksum_b)?;
        let sig_a = MinHashSignature::from_bytes(&a.minhash, params.num_permutations)?;
        let sig_b = MinHashSignature::from_bytes(&b.minhash, params.num_permutations)?;
        Ok(scorer::compare(
            &a.code,
            &b.code,
            &sig_a,
            &sig_b,
            self.config.jaccard_weight,
        ))
    }

    fn commit(
        &self,
        name: &str,
        code: &str,
        checksum: Checksum,
        signature: MinHashSignature,
    ) -> Result<UpsertOutcome> {
        let minhash_bytes = signature.to_bytes();
        let row_existed = self.storage.get_by_checksum(&checksum).is_ok();

        let outcome = match self
            .storage
            .upsert_snippet(checksum, code, &minhash_bytes, name)
        {
            Ok(outcome) => outcome,
            Err(ResemblError::AlreadyExists(_)) => {
                // `name` already points at a different checksum: the code
                // under this alias changed. Land the row under a
                // checksum-derived placeholder (guaranteed free), then
                // move `name` onto it and drop the placeholder.
                let placeholder = format!("__pending_{}", storage::to_hex(&checksum));
                self.storage
                    .upsert_snippet(checksum, code, &minhash_bytes, &placeholder)?;
                let prior = self.storage.rebind_name(name, checksum)?;
                self.storage.remove_name(&checksum, &placeholder)?;
                if let Some(prior_checksum) = prior {
                    if prior_checksum != checksum {
                        self.storage.append_version(SnippetVersion {
                            id: self.storage.next_version_id(),
                            name: name.to_string(),
                            checksum,
                            code: code.to_string(),
                            minhash: minhash_bytes.clone(),
                            created_at: Utc::now(),
                        })?;
                    }
                }
                UpsertOutcome::Aliased
            }
            Err(e) => return Err(e),
        };

        if !row_existed {
            let mut guard = self.index.lock().unwrap();
            if let Some(index) = guard.as_mut() {
                index.insert(checksum, signature);
                index.write_atomic(&self.cache_path)?;
            }
            info!(checksum = %storage::to_hex(&checksum), "added snippet");
        }
        Ok(outcome)
    }

    /// `add(name, code)`: normalize, checksum, fingerprint, and upsert;
    /// incrementally updates the live index when a new row is created.
    pub fn add(&self, name: &str, code: &str) -> Result<UpsertOutcome> {
        let checksum = tokenizer::checksum_bytes(code);
        let tokens = tokenizer::tokenize(code, true);
        let shingles = shingle::shingle(&tokens, self.config.ngram_size as usize);
        let signature = minhash::compute(&shingles, self.config.num_permutations);
        self.commit(name, code, checksum, signature)
    }

    /// Add many snippets at once, computing MinHashes in parallel across a
    /// worker pool before funnelling the commits back through the single
    /// writer. Workers touch only code bytes, never storage or the index.
    pub fn add_batch(&self, items: &[(String, String)]) -> Result<Vec<UpsertOutcome>> {
        let params = self.lsh_params();
        let prepared: Vec<(String, String, Checksum, MinHashSignature)> = items
            .par_iter()
            .map(|(name, code)| {
                let checksum = tokenizer::checksum_bytes(code);
                let tokens = tokenizer::tokenize(code, true);
                let shingles = shingle::shingle(&tokens, params.ngram_size as usize);
                let signature = minhash::compute(&shingles, params.num_permutations);
                (name.clone(), code.clone(), checksum, signature)
            })
            .collect();

        prepared
            .into_iter()
            .map(|(name, code, checksum, signature)| {
                self.commit(&name, &code, checksum, signature)
            })
            .collect()
    }

    /// `reindex()`: recompute every snippet's MinHash under the current
    /// parameters, persist them, then rebuild the LSH cache from scratch.
    pub fn reindex(&self) -> Result<()> {
        let params = self.lsh_params();
        for snippet in self.storage.iter_all() {
            let tokens = tokenizer::tokenize(&snippet.code, true);
            let shingles = shingle::shingle(&tokens, params.ngram_size as usize);
            let signature = minhash::compute(&shingles, params.num_permutations);
            self.storage
                .set_minhash(&snippet.checksum, &signature.to_bytes())?;
        }
        let rebuilt = self.build_index(&params);
        rebuilt.write_atomic(&self.cache_path)?;
        let entries = rebuilt.len();
        *self.index.lock().unwrap() = Some(rebuilt);
        info!(entries, "reindex complete");
        Ok(())
    }

    /// `clean()`: delete the on-disk cache and drop the in-memory index.
    /// Storage vacuuming is a no-op for the in-process backend; a real
    /// transactional store would compact here.
    pub fn clean(&self) -> Result<()> {
        match fs::remove_file(&self.cache_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        *self.index.lock().unwrap() = None;
        info!("cleaned cache");
        Ok(())
    }

    /// `merge(other_db)`: absorb another store's snippets, then invalidate
    /// the index so the next access rebuilds from the merged contents.
    pub fn merge(&self, other: &dyn StorageBackend) -> Result<()> {
        self.storage.merge(other)?;
        *self.index.lock().unwrap() = None;
        info!("merged external storage");
        Ok(())
    }

    /// `stats()`: corpus size, mean token count, vocabulary size, and mean
    /// pairwise Jaccard over a bounded deterministic sample of pairs.
    pub fn stats(&self) -> Stats {
        let snippets: Vec<Snippet> = self.storage.iter_all().collect();
        let num_snippets = snippets.len();
        if num_snippets == 0 {
            return Stats::default();
        }

        let mut vocabulary = HashSet::new();
        let mut total_tokens = 0usize;
        let mut signatures = Vec::with_capacity(num_snippets);
        for snippet in &snippets {
            let tokens = tokenizer::tokenize(&snippet.code, true);
            total_tokens += tokens.len();
            vocabulary.extend(tokens);
            if let Ok(signature) =
                MinHashSignature::from_bytes(&snippet.minhash, self.config.num_permutations)
            {
                signatures.push(signature);
            }
        }

        Stats {
            num_snippets,
            mean_token_count: total_tokens as f64 / num_snippets as f64,
            vocabulary_size: vocabulary.len(),
            mean_pairwise_jaccard: mean_pairwise_jaccard(&signatures, 256),
        }
    }
}

/// Default sample size for [`Orchestrator::stats`]'s pairwise Jaccard mean.
pub const DEFAULT_STATS_SAMPLE_SIZE: usize = 256;

fn mean_pairwise_jaccard(signatures: &[MinHashSignature], sample_size: usize) -> f64 {
    let n = signatures.len();
    if n < 2 {
        return 0.0;
    }
    let total_pairs = n * (n - 1) / 2;
    let pairs = sample_pair_indices(n, sample_size.min(total_pairs));
    if pairs.is_empty() {
        return 0.0;
    }
    let sum: f64 = pairs
        .iter()
        .map(|&(i, j)| signatures[i].jaccard(&signatures[j]))
        .sum();
    sum / pairs.len() as f64
}

/// Fixed seed for the deterministic (non-cryptographic) pair sampler.
const SAMPLE_SEED: u64 = 0x9E3779B97F4A7C15;

/// Deterministically pick `k` distinct pairs from the `n*(n-1)/2` possible
/// unordered pairs over `0..n`, via splitmix64 over a fixed seed.
fn sample_pair_indices(n: usize, k: usize) -> Vec<(usize, usize)> {
    let total = n * (n - 1) / 2;
    if total == 0 {
        return Vec::new();
    }
    if k >= total {
        let mut out = Vec::with_capacity(total);
        for i in 0..n {
            for j in (i + 1)..n {
                out.push((i, j));
            }
        }
        return out;
    }
    let mut seen = HashSet::new();
    let mut state = SAMPLE_SEED;
    let mut out = Vec::with_capacity(k);
    while out.len() < k {
        state = splitmix64(state);
        let linear = (state as usize) % total;
        if seen.insert(linear) {
            out.push(unrank_pair(linear, n));
        }
    }
    out
}

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E3779B97F4A7C15);
    let mut z = x;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
    z ^ (z >> 31)
}

/// Map a linear index over the strict upper triangle back to `(i, j)`.
fn unrank_pair(linear: usize, n: usize) -> (usize, usize) {
    let mut remaining = linear;
    let mut i = 0;
    loop {
        let row_len = n - 1 - i;
        if remaining < row_len {
            return (i, i + 1 + remaining);
        }
        remaining -= row_len;
        i += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStorage;

    fn orchestrator(dir: &tempfile::TempDir) -> Orchestrator<InMemoryStorage> {
        Orchestrator::new(
            InMemoryStorage::new(),
            ResemblConfig::default(),
            dir.path().join("lsh.cache"),
        )
    }

    #[test]
    fn add_then_find_finds_itself() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(&dir);
        let code = "mov eax, ebx\nret";
        orch.add("f1", code).unwrap();

        let results = orch.find(code, 5, 0.0, true).unwrap();
        let checksum = tokenizer::checksum_bytes(code);
        assert!(results.iter().any(|r| r.checksum == checksum));
    }

    #[test]
    fn exact_duplicate_via_formatting_is_aliased() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(&dir);
        assert_eq!(
            orch.add("f1", "mov eax, ebx ; hi\n ret").unwrap(),
            UpsertOutcome::Created
        );
        assert_eq!(
            orch.add("f2", "MOV EAX, EBX\nRET").unwrap(),
            UpsertOutcome::Aliased
        );

        let checksum = tokenizer::checksum_bytes("MOV EAX, EBX\nRET");
        let snippet = orch.storage().get_by_checksum(&checksum).unwrap();
        assert_eq!(snippet.names, vec!["f1".to_string(), "f2".to_string()]);
    }

    #[test]
    fn find_respects_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(&dir);
        orch.add("f1", "cpuid\nrdtsc\nxgetbv").unwrap();
        let results = orch.find("mov eax, ebx\nret", 5, 0.99, true).unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn cache_invalidation_rebuilds_with_identical_results() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(&dir);
        let code = "mov eax, ebx\nret";
        orch.add("f1", code).unwrap();
        let before = orch.find(code, 5, 0.0, true).unwrap();

        std::fs::remove_file(dir.path().join("lsh.cache")).unwrap();
        let after = orch.find(code, 5, 0.0, true).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn reindex_rebuilds_cache_from_scratch() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(&dir);
        orch.add("f1", "mov eax, ebx\nret").unwrap();
        orch.reindex().unwrap();
        let results = orch.find("mov eax, ebx\nret", 5, 0.0, true).unwrap();
        assert_eq!(results.len(), 1);
    }

    #[test]
    fn clean_removes_cache_file() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(&dir);
        orch.add("f1", "mov eax, ebx\nret").unwrap();
        orch.find("mov eax, ebx\nret", 5, 0.0, true).unwrap();
        assert!(dir.path().join("lsh.cache").exists());
        orch.clean().unwrap();
        assert!(!dir.path().join("lsh.cache").exists());
    }

    #[test]
    fn rebind_on_add_logs_a_version() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(&dir);
        orch.add("alpha", "mov eax, ebx").unwrap();
        orch.add("alpha", "mov ecx, edx").unwrap();

        let new_checksum = tokenizer::checksum_bytes("mov ecx, edx");
        let snippet = orch.storage().get_by_checksum(&new_checksum).unwrap();
        assert!(snippet.names.contains(&"alpha".to_string()));
        assert!(!snippet.names.iter().any(|n| n.starts_with("__pending_")));
    }

    #[test]
    fn stats_on_empty_storage_is_zeroed() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(&dir);
        assert_eq!(orch.stats(), Stats::default());
    }

    #[test]
    fn stats_counts_snippets_and_vocabulary() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(&dir);
        orch.add("f1", "mov eax, ebx\nret").unwrap();
        orch.add("f2", "mov ecx, edx\nret").unwrap();
        let stats = orch.stats();
        assert_eq!(stats.num_snippets, 2);
        assert!(stats.vocabulary_size > 0);
        assert!(stats.mean_token_count > 0.0);
    }

    #[test]
    fn add_batch_commits_every_item() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(&dir);
        let items = vec![
            ("a".to_string(), "mov eax, ebx".to_string()),
            ("b".to_string(), "push ebp".to_string()),
        ];
        let outcomes = orch.add_batch(&items).unwrap();
        assert_eq!(outcomes, vec![UpsertOutcome::Created, UpsertOutcome::Created]);
        assert_eq!(orch.stats().num_snippets, 2);
    }

    #[test]
    fn sample_pair_indices_covers_small_corpora_exactly() {
        let pairs = sample_pair_indices(4, 256);
        assert_eq!(pairs.len(), 6);
    }

    #[test]
    fn sample_pair_indices_is_deterministic() {
        let a = sample_pair_indices(50, 10);
        let b = sample_pair_indices(50, 10);
        assert_eq!(a, b);
    }
}
