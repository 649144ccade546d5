//! The downstream entry cache: the authoritative prefix → identity mapping
//! consumed by datapath programs, with source-precedence guarded writes.
//!
//! Entries written by the legacy direct API carry ownership flags so that the
//! metadata layer can coexist with it: a metadata write over a legacy entry
//! remembers the legacy source, and a full metadata removal restores it so the
//! legacy owner can still delete the entry later.

use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use ipcache_core::{source, NumericIdentity, PrefixCluster, Source};
use std::net::IpAddr;
use std::sync::Arc;
use thiserror::Error;

/// Rejected overwrite: the existing entry was written by a source with higher
/// precedence.
#[derive(Copy, Clone, Debug, Error, PartialEq, Eq)]
#[error("source {new} may not overwrite entry from source {existing}")]
pub struct OverwriteError {
    pub existing: Source,
    pub new: Source,
}

/// Identity and provenance of a cached entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntryIdentity {
    pub id: NumericIdentity,
    pub source: Source,

    /// Set when the legacy direct API has written this entry.
    pub(crate) modified_by_legacy_api: bool,

    /// The legacy source shadowed by a later metadata write, remembered so
    /// full metadata removal can restore it.
    pub(crate) overwritten_legacy_source: Option<Source>,
}

impl EntryIdentity {
    pub fn new(id: NumericIdentity, source: Source) -> Self {
        Self {
            id,
            source,
            modified_by_legacy_api: false,
            overwritten_legacy_source: None,
        }
    }

    pub(crate) fn exclusively_owned_by_legacy_api(&self) -> bool {
        self.modified_by_legacy_api && self.overwritten_legacy_source.is_none()
    }

    pub(crate) fn owned_by_legacy_and_metadata_api(&self) -> bool {
        self.modified_by_legacy_api && self.overwritten_legacy_source.is_some()
    }

    pub(crate) fn exclusively_owned_by_metadata_api(&self) -> bool {
        !self.modified_by_legacy_api
    }
}

/// A cached prefix entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    pub identity: EntryIdentity,
    pub tunnel_peer: Option<IpAddr>,
    pub encrypt_key: u8,
    pub endpoint_flags: u8,
}

impl Entry {
    pub fn new(id: NumericIdentity, source: Source) -> Self {
        Self {
            identity: EntryIdentity::new(id, source),
            tunnel_peer: None,
            encrypt_key: 0,
            endpoint_flags: 0,
        }
    }
}

/// Observes entry changes, e.g. to program datapath maps.
pub trait Listener: Send + Sync {
    fn on_upsert(&self, prefix: &PrefixCluster, entry: &Entry);
    fn on_delete(&self, prefix: &PrefixCluster, entry: &Entry);
}

/// The entry map plus a reverse index from identity to the prefixes using it.
/// The reverse index is updated in the same critical section as every entry
/// mutation.
#[derive(Default)]
pub(crate) struct EntryStore {
    entries: HashMap<PrefixCluster, Entry>,
    identity_to_prefixes: HashMap<NumericIdentity, HashSet<PrefixCluster>>,
    listeners: Vec<Arc<dyn Listener>>,
}

impl EntryStore {
    pub(crate) fn register_listener(&mut self, listener: Arc<dyn Listener>) {
        self.listeners.push(listener);
    }

    pub(crate) fn lookup(&self, prefix: &PrefixCluster) -> Option<Entry> {
        self.entries.get(&prefix.canonical()).cloned()
    }

    /// Number of distinct identities currently referenced by entries.
    pub(crate) fn identity_count(&self) -> usize {
        self.identity_to_prefixes.len()
    }

    pub(crate) fn prefixes_for_identity(&self, id: NumericIdentity) -> Vec<PrefixCluster> {
        self.identity_to_prefixes
            .get(&id)
            .map(|prefixes| prefixes.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Inserts or replaces an entry. Without `force`, the write is rejected
    /// when the existing entry was installed by a higher-precedence source.
    pub(crate) fn upsert(
        &mut self,
        prefix: &PrefixCluster,
        mut entry: Entry,
        force: bool,
        from_legacy_api: bool,
    ) -> Result<(), OverwriteError> {
        let prefix = prefix.canonical();

        if let Some(existing) = self.entries.get(&prefix) {
            if !force && !source::allows_overwrite(existing.identity.source, entry.identity.source)
            {
                return Err(OverwriteError {
                    existing: existing.identity.source,
                    new: entry.identity.source,
                });
            }

            if from_legacy_api {
                entry.identity.modified_by_legacy_api = true;
                if entry.identity.overwritten_legacy_source.is_none() {
                    entry.identity.overwritten_legacy_source =
                        existing.identity.overwritten_legacy_source;
                }
            } else {
                // The metadata layer is writing: the legacy ownership mark
                // survives so the legacy owner's later delete still works.
                entry.identity.modified_by_legacy_api = existing.identity.modified_by_legacy_api;
            }

            if existing.identity.id != entry.identity.id {
                self.unindex(existing.identity.id, &prefix);
            }
        } else if from_legacy_api {
            entry.identity.modified_by_legacy_api = true;
        }

        self.identity_to_prefixes
            .entry(entry.identity.id)
            .or_default()
            .insert(prefix);
        for listener in &self.listeners {
            listener.on_upsert(&prefix, &entry);
        }
        self.entries.insert(prefix, entry);
        Ok(())
    }

    /// Deletes the entry if `src` has sufficient precedence. A delete from a
    /// shadowed legacy source only clears the legacy claim; the entry itself
    /// stays until the metadata layer removes it.
    pub(crate) fn delete(&mut self, prefix: &PrefixCluster, src: Source) -> bool {
        let prefix = prefix.canonical();
        let Some(existing) = self.entries.get_mut(&prefix) else {
            return false;
        };

        if !source::allows_overwrite(existing.identity.source, src) {
            if existing.identity.owned_by_legacy_and_metadata_api()
                && existing.identity.overwritten_legacy_source == Some(src)
            {
                existing.identity.modified_by_legacy_api = false;
                existing.identity.overwritten_legacy_source = None;
                tracing::debug!(%prefix, source = %src, "legacy owner released shadowed entry");
            } else {
                tracing::warn!(
                    %prefix,
                    source = %src,
                    existing = %existing.identity.source,
                    "ignoring delete from lower-precedence source",
                );
            }
            return false;
        }

        let Some(entry) = self.entries.remove(&prefix) else {
            return false;
        };
        self.unindex(entry.identity.id, &prefix);
        for listener in &self.listeners {
            listener.on_delete(&prefix, &entry);
        }
        true
    }

    fn unindex(&mut self, id: NumericIdentity, prefix: &PrefixCluster) {
        if let Some(prefixes) = self.identity_to_prefixes.get_mut(&id) {
            prefixes.remove(prefix);
            if prefixes.is_empty() {
                self.identity_to_prefixes.remove(&id);
            }
        }
    }
}
