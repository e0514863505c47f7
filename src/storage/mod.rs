//! Content-addressed storage model: snippets keyed by the SHA-256 of their
//! normalized code, plus alias/tag/collection/version side-tables.
//!
//! [`StorageBackend`] is the abstract repository the orchestrator talks to
//! (see the design note: "two tagged variants carry variation:
//! `TokenizationMode` and `StorageBackend`"). [`InMemoryStorage`] is the
//! local implementation built here; a networked backend behind the same
//! trait is a `DATABASE_URL`-selected concern left to the external
//! collaborator that owns the relational-database dialect.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use crate::core::errors::{ResemblError, Result};

/// 32-byte SHA-256 checksum of normalized code; a snippet's primary key.
pub type Checksum = [u8; 32];

/// Render a checksum as lowercase hex, for prefix matching and display.
pub fn to_hex(checksum: &Checksum) -> String {
    checksum.iter().map(|b| format!("{b:02x}")).collect()
}

/// One stored assembly snippet and its metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snippet {
    /// SHA-256 of `normalize(code)`.
    pub checksum: Checksum,
    /// Original assembly text, preserved verbatim.
    pub code: String,
    /// Ordered, deduplicated human aliases. Never empty after creation.
    pub names: Vec<String>,
    /// Unordered short labels.
    pub tags: BTreeSet<String>,
    /// Serialized MinHash signature bytes, at the index's `num_permutations`.
    pub minhash: Vec<u8>,
    /// Optional collection membership, by collection name.
    pub collection_ref: Option<String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

/// A named grouping of snippets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Collection {
    /// Primary key.
    pub name: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

/// Immutable, append-only record of a name being rebound from one checksum
/// to another (code changed under the same alias).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnippetVersion {
    pub id: u64,
    /// The name that was rebound.
    pub name: String,
    /// The checksum it now points to.
    pub checksum: Checksum,
    pub code: String,
    pub minhash: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

/// Result of [`StorageBackend::upsert_snippet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// No row existed for this checksum; one was inserted.
    Created,
    /// A row already existed; `initial_name` was added to its names.
    Aliased,
}

/// Abstract repository the orchestrator depends on. The core treats this
/// purely as an interface — see the storage contract in the external
/// interfaces section — so a networked implementation can live behind the
/// same trait without the orchestrator changing.
pub trait StorageBackend: Send + Sync {
    /// Insert a new snippet, or add `initial_name` to an existing one at
    /// the same checksum (idempotent if already present).
    fn upsert_snippet(
        &self,
        checksum: Checksum,
        code: &str,
        minhash: &[u8],
        initial_name: &str,
    ) -> Result<UpsertOutcome>;

    /// Look up a snippet by its exact checksum.
    fn get_by_checksum(&self, checksum: &Checksum) -> Result<Snippet>;

    /// Look up a snippet by a hex-checksum prefix. Succeeds only if exactly
    /// one row matches; zero matches is `NotFound`, more than one is
    /// `Ambiguous`.
    fn get_by_checksum_prefix(&self, prefix: &str) -> Result<Snippet>;

    /// Add `name` to the snippet at `checksum`. Fails with `AlreadyExists`
    /// if `name` is already bound to a *different* checksum.
    fn add_name(&self, checksum: &Checksum, name: &str) -> Result<()>;

    /// Remove `name` from the snippet at `checksum`. Fails with
    /// `EmptyAliasSet` if it would leave zero names.
    fn remove_name(&self, checksum: &Checksum, name: &str) -> Result<()>;

    /// Move `name` from whatever checksum it currently points to (if any)
    /// onto `new_checksum`. Returns the prior checksum when a move
    /// actually happened (the name existed and pointed elsewhere).
    ///
    /// If the prior owner is left with zero names, it has no remaining
    /// identity and is deleted along with it (see the open-question
    /// resolution in the grounding ledger for why this, rather than
    /// leaving a nameless orphan, was chosen).
    fn rebind_name(&self, name: &str, new_checksum: Checksum) -> Result<Option<Checksum>>;

    /// Overwrite a snippet's stored MinHash bytes in place, without
    /// touching its checksum, code, names, tags, or collection.
    fn set_minhash(&self, checksum: &Checksum, minhash: &[u8]) -> Result<()>;

    fn add_tag(&self, checksum: &Checksum, tag: &str) -> Result<()>;
    fn remove_tag(&self, checksum: &Checksum, tag: &str) -> Result<()>;

    /// Set or clear a snippet's collection membership.
    fn set_collection(&self, checksum: &Checksum, collection: Option<&str>) -> Result<()>;

    fn create_collection(&self, name: &str, description: &str) -> Result<()>;

    /// Delete a collection, nulling `collection_ref` on its members.
    /// Members themselves are not deleted.
    fn delete_collection(&self, name: &str) -> Result<()>;

    fn delete_snippet(&self, checksum: &Checksum) -> Result<()>;

    fn append_version(&self, version: SnippetVersion) -> Result<()>;

    /// All stored snippets in ascending checksum order. Lazy and
    /// restartable: each call walks from the start; consumers must not
    /// assume the whole set is buffered for them.
    fn iter_all(&self) -> Box<dyn Iterator<Item = Snippet> + '_>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Next auto-assigned version id. Exposed so callers (the
    /// orchestrator) can build a `SnippetVersion` before appending it.
    fn next_version_id(&self) -> u64;

    /// Absorb every snippet in `other` into `self`. On checksum collision,
    /// names and tags are unioned; a name that moves to a new checksum as
    /// part of the merge is logged exactly as `rebind_name` would log it.
    fn merge(&self, other: &dyn StorageBackend) -> Result<()> {
        for snippet in other.iter_all() {
            let first_name = snippet
                .names
                .first()
                .map(String::as_str)
                .unwrap_or_default();
            match self.upsert_snippet(snippet.checksum, &snippet.code, &snippet.minhash, first_name) {
                Ok(_) => {}
                Err(ResemblError::AlreadyExists(_)) => {
                    // `first_name` is bound to a different checksum locally.
                    // Insert under a placeholder, rebind the real name onto
                    // it, then drop the placeholder — same dance the
                    // orchestrator's own commit path uses.
                    let placeholder = format!("__merge_pending_{}", to_hex(&snippet.checksum));
                    self.upsert_snippet(snippet.checksum, &snippet.code, &snippet.minhash, &placeholder)?;
                    let prior = self.rebind_name(first_name, snippet.checksum)?;
                    self.remove_name(&snippet.checksum, &placeholder)?;
                    if let Some(prior_checksum) = prior {
                        if prior_checksum != snippet.checksum {
                            self.append_version(SnippetVersion {
                                id: self.next_version_id(),
                                name: first_name.to_string(),
                                checksum: snippet.checksum,
                                code: snippet.code.clone(),
                                minhash: snippet.minhash.clone(),
                                created_at: Utc::now(),
                            })?;
                        }
                    }
                }
                Err(e) => return Err(e),
            }
            for name in snippet.names.iter().skip(1) {
                match self.add_name(&snippet.checksum, name) {
                    Ok(()) => {}
                    Err(ResemblError::AlreadyExists(_)) => {
                        if let Some(prior) = self.rebind_name(name, snippet.checksum)? {
                            self.append_version(SnippetVersion {
                                id: self.next_version_id(),
                                name: name.clone(),
                                checksum: snippet.checksum,
                                code: snippet.code.clone(),
                                minhash: snippet.minhash.clone(),
                                created_at: Utc::now(),
                            })?;
                            let _ = prior;
                        }
                    }
                    Err(e) => return Err(e),
                }
            }
            for tag in &snippet.tags {
                self.add_tag(&snippet.checksum, tag)?;
            }
            if let Some(collection) = &snippet.collection_ref {
                let _ = self.create_collection(collection, "");
                self.set_collection(&snippet.checksum, Some(collection))?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct State {
    snippets: BTreeMap<Checksum, Snippet>,
    collections: BTreeMap<String, Collection>,
    names_index: HashMap<String, Checksum>,
    versions: Vec<SnippetVersion>,
    next_version_id: u64,
}

/// In-process, in-memory storage backend. Durable persistence is the
/// external collaborator's concern (§1); this exists to give the
/// orchestrator a complete, working repository to drive without a real
/// database dependency.
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    state: Mutex<State>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageBackend for InMemoryStorage {
    fn upsert_snippet(
        &self,
        checksum: Checksum,
        code: &str,
        minhash: &[u8],
        initial_name: &str,
    ) -> Result<UpsertOutcome> {
        let mut state = self.state.lock().unwrap();
        if state.snippets.contains_key(&checksum) {
            let needs_alias = !state.snippets[&checksum]
                .names
                .iter()
                .any(|n| n == initial_name);
            if needs_alias {
                if let Some(other) = state.names_index.get(initial_name) {
                    if other != &checksum {
                        return Err(ResemblError::AlreadyExists(format!(
                            "name '{initial_name}' already bound to a different snippet"
                        )));
                    }
                }
                state
                    .snippets
                    .get_mut(&checksum)
                    .unwrap()
                    .names
                    .push(initial_name.to_string());
                state
                    .names_index
                    .insert(initial_name.to_string(), checksum);
            }
            return Ok(UpsertOutcome::Aliased);
        }
        if let Some(other) = state.names_index.get(initial_name) {
            if other != &checksum {
                return Err(ResemblError::AlreadyExists(format!(
                    "name '{initial_name}' already bound to a different snippet"
                )));
            }
        }
        state.snippets.insert(
            checksum,
            Snippet {
                checksum,
                code: code.to_string(),
                names: vec![initial_name.to_string()],
                tags: BTreeSet::new(),
                minhash: minhash.to_vec(),
                collection_ref: None,
                created_at: Utc::now(),
            },
        );
        state
            .names_index
            .insert(initial_name.to_string(), checksum);
        Ok(UpsertOutcome::Created)
    }

    fn get_by_checksum(&self, checksum: &Checksum) -> Result<Snippet> {
        let state = self.state.lock().unwrap();
        state
            .snippets
            .get(checksum)
            .cloned()
            .ok_or_else(|| ResemblError::NotFound(to_hex(checksum)))
    }

    fn get_by_checksum_prefix(&self, prefix: &str) -> Result<Snippet> {
        let prefix = prefix.to_lowercase();
        let state = self.state.lock().unwrap();
        let mut matches = state
            .snippets
            .values()
            .filter(|s| to_hex(&s.checksum).starts_with(&prefix));
        let first = matches.next().cloned();
        match first {
            None => Err(ResemblError::NotFound(prefix)),
            Some(snippet) => {
                let count = 1 + matches.count();
                if count > 1 {
                    Err(ResemblError::ambiguous(prefix, count))
                } else {
                    Ok(snippet)
                }
            }
        }
    }

    fn add_name(&self, checksum: &Checksum, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(other) = state.names_index.get(name) {
            if other != checksum {
                return Err(ResemblError::AlreadyExists(format!(
                    "name '{name}' already bound to a different snippet"
                )));
            }
            return Ok(());
        }
        let snippet = state
            .snippets
            .get_mut(checksum)
            .ok_or_else(|| ResemblError::NotFound(to_hex(checksum)))?;
        snippet.names.push(name.to_string());
        state.names_index.insert(name.to_string(), *checksum);
        Ok(())
    }

    fn remove_name(&self, checksum: &Checksum, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let snippet = state
            .snippets
            .get_mut(checksum)
            .ok_or_else(|| ResemblError::NotFound(to_hex(checksum)))?;
        if snippet.names.len() <= 1 && snippet.names.iter().any(|n| n == name) {
            return Err(ResemblError::EmptyAliasSet);
        }
        let before = snippet.names.len();
        snippet.names.retain(|n| n != name);
        if snippet.names.len() != before {
            state.names_index.remove(name);
        }
        Ok(())
    }

    fn rebind_name(&self, name: &str, new_checksum: Checksum) -> Result<Option<Checksum>> {
        let mut state = self.state.lock().unwrap();
        let prior = state.names_index.get(name).copied();
        if let Some(prior) = prior {
            if prior == new_checksum {
                return Ok(None);
            }
            if let Some(old_snippet) = state.snippets.get_mut(&prior) {
                old_snippet.names.retain(|n| n != name);
                if old_snippet.names.is_empty() {
                    state.snippets.remove(&prior);
                }
            }
        }
        if let Some(snippet) = state.snippets.get_mut(&new_checksum) {
            if !snippet.names.iter().any(|n| n == name) {
                snippet.names.push(name.to_string());
            }
        } else {
            return Err(ResemblError::NotFound(to_hex(&new_checksum)));
        }
        state.names_index.insert(name.to_string(), new_checksum);
        Ok(prior)
    }

    fn set_minhash(&self, checksum: &Checksum, minhash: &[u8]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let snippet = state
            .snippets
            .get_mut(checksum)
            .ok_or_else(|| ResemblError::NotFound(to_hex(checksum)))?;
        snippet.minhash = minhash.to_vec();
        Ok(())
    }

    fn add_tag(&self, checksum: &Checksum, tag: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let snippet = state
            .snippets
            .get_mut(checksum)
            .ok_or_else(|| ResemblError::NotFound(to_hex(checksum)))?;
        snippet.tags.insert(tag.to_string());
        Ok(())
    }

    fn remove_tag(&self, checksum: &Checksum, tag: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let snippet = state
            .snippets
            .get_mut(checksum)
            .ok_or_else(|| ResemblError::NotFound(to_hex(checksum)))?;
        snippet.tags.remove(tag);
        Ok(())
    }

    fn set_collection(&self, checksum: &Checksum, collection: Option<&str>) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(name) = collection {
            if !state.collections.contains_key(name) {
                return Err(ResemblError::NotFound(format!("collection '{name}'")));
            }
        }
        let snippet = state
            .snippets
            .get_mut(checksum)
            .ok_or_else(|| ResemblError::NotFound(to_hex(checksum)))?;
        snippet.collection_ref = collection.map(String::from);
        Ok(())
    }

    fn create_collection(&self, name: &str, description: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.collections.contains_key(name) {
            return Err(ResemblError::AlreadyExists(format!(
                "collection '{name}'"
            )));
        }
        state.collections.insert(
            name.to_string(),
            Collection {
                name: name.to_string(),
                description: description.to_string(),
                created_at: Utc::now(),
            },
        );
        Ok(())
    }

    fn delete_collection(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.collections.remove(name).is_none() {
            return Err(ResemblError::NotFound(format!("collection '{name}'")));
        }
        for snippet in state.snippets.values_mut() {
            if snippet.collection_ref.as_deref() == Some(name) {
                snippet.collection_ref = None;
            }
        }
        Ok(())
    }

    fn delete_snippet(&self, checksum: &Checksum) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let snippet = state
            .snippets
            .remove(checksum)
            .ok_or_else(|| ResemblError::NotFound(to_hex(checksum)))?;
        for name in &snippet.names {
            state.names_index.remove(name);
        }
        Ok(())
    }

    fn append_version(&self, version: SnippetVersion) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.next_version_id = state.next_version_id.max(version.id + 1);
        state.versions.push(version);
        Ok(())
    }

    fn iter_all(&self) -> Box<dyn Iterator<Item = Snippet> + '_> {
        let state = self.state.lock().unwrap();
        let snapshot: Vec<Snippet> = state.snippets.values().cloned().collect();
        Box::new(snapshot.into_iter())
    }

    fn len(&self) -> usize {
        self.state.lock().unwrap().snippets.len()
    }

    fn next_version_id(&self) -> u64 {
        let mut state = self.state.lock().unwrap();
        let id = state.next_version_id;
        state.next_version_id += 1;
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checksum(byte: u8) -> Checksum {
        let mut c = [0u8; 32];
        c[0] = byte;
        c
    }

    #[test]
    fn upsert_creates_then_aliases() {
        let storage = InMemoryStorage::new();
        let cs = checksum(1);
        assert_eq!(
            storage.upsert_snippet(cs, "mov eax, ebx", b"sig", "f1").unwrap(),
            UpsertOutcome::Created
        );
        assert_eq!(
            storage.upsert_snippet(cs, "mov eax, ebx", b"sig", "f2").unwrap(),
            UpsertOutcome::Aliased
        );
        let snippet = storage.get_by_checksum(&cs).unwrap();
        assert_eq!(snippet.names, vec!["f1".to_string(), "f2".to_string()]);
    }

    #[test]
    fn upsert_aliasing_is_idempotent() {
        let storage = InMemoryStorage::new();
        let cs = checksum(1);
        storage.upsert_snippet(cs, "code", b"sig", "f1").unwrap();
        storage.upsert_snippet(cs, "code", b"sig", "f1").unwrap();
        let snippet = storage.get_by_checksum(&cs).unwrap();
        assert_eq!(snippet.names, vec!["f1".to_string()]);
    }

    #[test]
    fn prefix_lookup_distinguishes_unique_from_ambiguous() {
        let storage = InMemoryStorage::new();
        let mut a = checksum(0xab);
        a[1] = 0x12;
        let mut b = checksum(0xab);
        b[1] = 0x34;
        storage.upsert_snippet(a, "a", b"sig", "a").unwrap();
        storage.upsert_snippet(b, "b", b"sig", "b").unwrap();

        assert!(matches!(
            storage.get_by_checksum_prefix("ab"),
            Err(ResemblError::Ambiguous { count: 2, .. })
        ));
        assert_eq!(
            storage.get_by_checksum_prefix(&to_hex(&a)[..4]).unwrap().checksum,
            a
        );
    }

    #[test]
    fn remove_last_name_is_rejected() {
        let storage = InMemoryStorage::new();
        let cs = checksum(1);
        storage.upsert_snippet(cs, "code", b"sig", "only").unwrap();
        assert!(matches!(
            storage.remove_name(&cs, "only"),
            Err(ResemblError::EmptyAliasSet)
        ));
        assert_eq!(storage.get_by_checksum(&cs).unwrap().names, vec!["only".to_string()]);
    }

    #[test]
    fn add_name_already_bound_elsewhere_is_rejected() {
        let storage = InMemoryStorage::new();
        let a = checksum(1);
        let b = checksum(2);
        storage.upsert_snippet(a, "a", b"sig", "shared").unwrap();
        storage.upsert_snippet(b, "b", b"sig", "other").unwrap();
        assert!(matches!(
            storage.add_name(&b, "shared"),
            Err(ResemblError::AlreadyExists(_))
        ));
    }

    #[test]
    fn rebind_name_moves_alias_and_orphan_is_dropped() {
        let storage = InMemoryStorage::new();
        let a = checksum(1);
        let b = checksum(2);
        storage.upsert_snippet(a, "old code", b"sig", "f").unwrap();
        storage.upsert_snippet(b, "new code", b"sig2", "other").unwrap();

        let prior = storage.rebind_name("f", b).unwrap();
        assert_eq!(prior, Some(a));
        assert!(storage.get_by_checksum(&a).is_err());
        let snippet = storage.get_by_checksum(&b).unwrap();
        assert!(snippet.names.contains(&"f".to_string()));
    }

    #[test]
    fn delete_collection_nulls_member_refs_without_deleting_them() {
        let storage = InMemoryStorage::new();
        let cs = checksum(1);
        storage.upsert_snippet(cs, "code", b"sig", "f").unwrap();
        storage.create_collection("c1", "desc").unwrap();
        storage.set_collection(&cs, Some("c1")).unwrap();
        storage.delete_collection("c1").unwrap();
        let snippet = storage.get_by_checksum(&cs).unwrap();
        assert_eq!(snippet.collection_ref, None);
    }

    #[test]
    fn iter_all_is_lexicographic_by_checksum() {
        let storage = InMemoryStorage::new();
        storage.upsert_snippet(checksum(3), "c", b"s", "n3").unwrap();
        storage.upsert_snippet(checksum(1), "a", b"s", "n1").unwrap();
        storage.upsert_snippet(checksum(2), "b", b"s", "n2").unwrap();
        let order: Vec<Checksum> = storage.iter_all().map(|s| s.checksum).collect();
        assert_eq!(order, vec![checksum(1), checksum(2), checksum(3)]);
    }

    #[test]
    fn merge_unions_names_on_checksum_collision() {
        let local = InMemoryStorage::new();
        let other = InMemoryStorage::new();
        let cs = checksum(1);
        local.upsert_snippet(cs, "code", b"sig", "f1").unwrap();
        other.upsert_snippet(cs, "code", b"sig", "f2").unwrap();

        local.merge(&other).unwrap();
        let snippet = local.get_by_checksum(&cs).unwrap();
        assert!(snippet.names.contains(&"f1".to_string()));
        assert!(snippet.names.contains(&"f2".to_string()));
    }

    #[test]
    fn merge_rebinds_first_name_on_cross_checksum_collision() {
        let local = InMemoryStorage::new();
        let other = InMemoryStorage::new();
        let a = checksum(1);
        let b = checksum(2);
        local.upsert_snippet(a, "old code", b"sig1", "f").unwrap();
        other.upsert_snippet(b, "new code", b"sig2", "f").unwrap();

        // Must not abort with AlreadyExists: "f" is the *first* (and only)
        // name on the incoming snippet, so this exercises the collision
        // path that bypassed rebind_name before the fix.
        local.merge(&other).unwrap();

        let snippet = local.get_by_checksum(&b).unwrap();
        assert_eq!(snippet.names, vec!["f".to_string()]);
        assert!(local.get_by_checksum(&a).is_err());
    }

    #[test]
    fn set_minhash_overwrites_in_place() {
        let storage = InMemoryStorage::new();
        let cs = checksum(1);
        storage.upsert_snippet(cs, "code", b"old", "f").unwrap();
        storage.set_minhash(&cs, b"new").unwrap();
        let snippet = storage.get_by_checksum(&cs).unwrap();
        assert_eq!(snippet.minhash, b"new");
        assert_eq!(snippet.names, vec!["f".to_string()]);
    }

    #[test]
    fn add_name_order_does_not_affect_final_alias_set() {
        let forward = InMemoryStorage::new();
        let cs = checksum(1);
        forward.upsert_snippet(cs, "code", b"sig", "n1").unwrap();
        forward.add_name(&cs, "n2").unwrap();
        forward.add_name(&cs, "n3").unwrap();

        let reverse = InMemoryStorage::new();
        reverse.upsert_snippet(cs, "code", b"sig", "n1").unwrap();
        reverse.add_name(&cs, "n3").unwrap();
        reverse.add_name(&cs, "n2").unwrap();

        let mut a = forward.get_by_checksum(&cs).unwrap().names;
        let mut b = reverse.get_by_checksum(&cs).unwrap().names;
        a.sort();
        b.sort();
        assert_eq!(a, b);
    }

    #[test]
    fn merge_of_identical_stores_is_idempotent() {
        let local = InMemoryStorage::new();
        local.upsert_snippet(checksum(1), "code", b"sig", "f1").unwrap();
        let before: Vec<Snippet> = local.iter_all().collect();

        let clone = InMemoryStorage::new();
        clone.upsert_snippet(checksum(1), "code", b"sig", "f1").unwrap();
        local.merge(&clone).unwrap();

        let after: Vec<Snippet> = local.iter_all().collect();
        assert_eq!(before, after);
    }
}
