//! # resembl: local similarity search over assembly-language snippets
//!
//! Content-addressed storage of assembly snippets, MinHash fingerprinting
//! over weighted n-gram shingles, a banded LSH index for sub-linear
//! candidate retrieval, and a hybrid Jaccard/Levenshtein/control-flow
//! scorer, wired together by a single-writer [`orchestrator::Orchestrator`].
//!
//! ## Pipeline
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      Orchestrator                            │
//! ├───────────┬───────────┬──────────┬──────────┬────────────────┤
//! │ tokenizer │  shingle  │ minhash  │   lsh    │  scorer / cfg  │
//! │ normalize │ weighted  │ MinHash  │ banded   │ hybrid score,  │
//! │ generalize│ n-grams   │ signature│ index +  │ CFG similarity │
//! │           │           │          │ cache    │                │
//! └───────────┴───────────┴──────────┴──────────┴────────────────┘
//!                              │
//!                         storage::StorageBackend
//! ```
//!
//! ## Quick start
//!
//! ```rust
//! use resembl::core::config::ResemblConfig;
//! use resembl::orchestrator::Orchestrator;
//! use resembl::storage::InMemoryStorage;
//!
//! let orchestrator = Orchestrator::new(
//!     InMemoryStorage::new(),
//!     ResemblConfig::default(),
//!     std::env::temp_dir().join("resembl-doctest.cache"),
//! );
//! orchestrator.add("memcpy_like", "mov eax, [ebp+8]\nret").unwrap();
//! let hits = orchestrator.find("mov eax, [ebp+8]\nret", 5, 0.0, true).unwrap();
//! assert!(!hits.is_empty());
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::too_many_arguments)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

/// Core cross-cutting types: errors and configuration.
pub mod core {
    //! Error types and the configuration record shared across the crate.

    pub mod config;
    pub mod errors;
}

/// Assembly tokenization and normalization.
pub mod tokenizer;

/// Weighted n-gram shingling over token streams.
pub mod shingle;

/// MinHash signature generation and estimation.
pub mod minhash;

/// Banded Locality-Sensitive Hashing index with on-disk caching.
pub mod lsh;

/// Simplified control-flow-graph extraction and similarity.
pub mod cfg;

/// Hybrid similarity scoring (Jaccard, Levenshtein, CFG, shared tokens).
pub mod scorer;

/// Content-addressed storage model and the `StorageBackend` trait.
pub mod storage;

/// Search orchestrator tying the pipeline together behind `add`/`find`/
/// `compare`/`reindex`/`clean`/`merge`/`stats`.
pub mod orchestrator;

pub use core::errors::{ResemblError, Result};

/// Library version, taken from `Cargo.toml`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
