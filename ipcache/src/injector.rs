//! The label injector: drains the queue of changed prefixes, resolves their
//! identities, and applies entry and policy-selector updates in the order
//! that keeps traffic flowing.

use crate::entries::{Entry, EntryIdentity};
use crate::resolver;
use crate::IpCache;
use ahash::AHashMap as HashMap;
use anyhow::anyhow;
use ipcache_core::{AllocatorError, Identity, Labels, NumericIdentity, PrefixCluster, LOCAL_CLUSTER_ID};
use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;

/// A chunk that did not complete: `remaining` holds the prefixes that must be
/// queued again for a later attempt.
#[derive(Debug)]
pub(crate) struct ChunkError {
    pub(crate) remaining: Vec<PrefixCluster>,
    pub(crate) error: anyhow::Error,
}

impl IpCache {
    /// One injection tick: waits for the external caches to synchronize,
    /// dequeues the changed prefixes, and injects them in chunks. Chunking
    /// bounds the peak identity watermark, because references are only
    /// released after a chunk's entry writes land.
    pub(crate) async fn handle_label_injection(
        &self,
        ctx: &CancellationToken,
    ) -> anyhow::Result<()> {
        tokio::select! {
            _ = ctx.cancelled() => return Err(anyhow!("label injection cancelled")),
            synced = self.cache_status.synchronized() => {
                if !synced {
                    return Err(anyhow!("cache status signal closed before synchronization"));
                }
            }
        }

        let (mut to_modify, revision) = self.metadata.dequeue();

        // The first revision cannot release any identities, so there is no
        // point in dividing it.
        let chunk_size = if revision == 1 {
            to_modify.len().max(1)
        } else {
            self.config.chunk_size.max(1)
        };

        let mut retry = Vec::new();
        let mut failure = None;
        while !to_modify.is_empty() {
            let take = to_modify.len().min(chunk_size);
            let chunk: Vec<PrefixCluster> = to_modify.drain(..take).collect();
            if let Err(err) = self.inject_chunk(ctx, chunk).await {
                retry.extend(err.remaining);
                failure = Some(err.error);
                break;
            }
        }

        let mut complete = true;
        if !retry.is_empty() {
            self.metadata.enqueue(&retry);
            complete = false;
        }
        if !to_modify.is_empty() {
            self.metadata.enqueue(&to_modify);
            complete = false;
        }
        if complete {
            // Only now are waiters at or below this revision satisfied.
            self.metadata.set_injected_revision(revision);
        }

        self.metrics
            .queue_depth
            .set(self.metadata.queue_len() as i64);
        self.metrics
            .identities
            .set(self.entries.lock().identity_count() as i64);

        match failure {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Applies the metadata changes for one chunk of prefixes.
    ///
    /// Per-prefix decisions come first; the application phase then runs in
    /// strict order: policy selectors learn new identities, entries are
    /// replaced, stale entries are deleted, and only then are identity
    /// references released. Deviating from this order drops traffic.
    async fn inject_chunk(
        &self,
        ctx: &CancellationToken,
        chunk: Vec<PrefixCluster>,
    ) -> Result<(), ChunkError> {
        let Some(allocator) = self.allocator.read().clone() else {
            return Err(ChunkError {
                remaining: chunk,
                error: AllocatorError::Uninitialized.into(),
            });
        };
        if !self.cache_status.is_synchronized() {
            return Err(ChunkError {
                remaining: chunk,
                error: anyhow!("k8s cache not fully synced"),
            });
        }

        // Identities previously attached to prefixes in this chunk, to be
        // released once the new state is applied.
        let mut previously_allocated: HashMap<PrefixCluster, EntryIdentity> = HashMap::default();
        // Identities that must be registered with policy selectors.
        let mut ids_to_add: BTreeMap<NumericIdentity, Labels> = BTreeMap::new();
        let mut entries_to_replace: Vec<(PrefixCluster, Entry, bool)> = Vec::new();
        let mut entries_to_delete: Vec<(PrefixCluster, EntryIdentity)> = Vec::new();
        // Entries that only the legacy direct API still owns; they are
        // force-deleted once their identity is fully released.
        let mut unmanaged: HashMap<PrefixCluster, EntryIdentity> = HashMap::default();
        let mut failed_at: Option<(usize, anyhow::Error)> = None;

        for (i, prefix) in chunk.iter().enumerate() {
            let old_entry = self.entries.lock().lookup(prefix);
            let info = self.metadata.get(prefix);

            if info.is_none() && old_entry.is_none() {
                // Already deleted, no new metadata to associate.
                continue;
            }

            let mut new_identity: Option<Identity> = None;
            let mut scheduled_replace = false;

            if let Some(info) = &info {
                let (identity, is_new) = match resolver::resolve_identity(
                    &self.metadata,
                    allocator.as_ref(),
                    &self.config,
                    prefix,
                    info,
                ) {
                    Ok(resolved) => resolved,
                    Err(error) => {
                        // Stop the chunk here; decisions already made for
                        // earlier prefixes still apply, and their releases
                        // may unblock the retry of the remainder.
                        failed_at = Some((
                            i,
                            anyhow::Error::new(error)
                                .context("failed to allocate new identity during label injection"),
                        ));
                        break;
                    }
                };

                // Remember the source shadowed by this write when the legacy
                // API previously owned the entry, so full metadata removal
                // can restore it.
                let mut overwritten_legacy_source = None;
                if let Some(old) = &old_entry {
                    if old.identity.exclusively_owned_by_legacy_api() {
                        overwritten_legacy_source = Some(old.identity.source);
                    } else if old.identity.owned_by_legacy_and_metadata_api() {
                        overwritten_legacy_source = old.identity.overwritten_legacy_source;
                    }
                }

                let entry = Entry {
                    identity: EntryIdentity {
                        id: identity.id,
                        source: info.source(),
                        // Maintained by the entry store across upserts.
                        modified_by_legacy_api: false,
                        overwritten_legacy_source,
                    },
                    tunnel_peer: info.tunnel_peer(),
                    encrypt_key: info.encrypt_key(),
                    endpoint_flags: info.endpoint_flags(),
                };

                // Checking the identity alone is not sufficient: the source
                // or the datapath attributes may change independently.
                let unchanged = old_entry.as_ref().is_some_and(|old| {
                    old.identity.id == entry.identity.id
                        && old.identity.source == entry.identity.source
                        && old.identity.overwritten_legacy_source
                            == entry.identity.overwritten_legacy_source
                        && old.tunnel_peer == entry.tunnel_peer
                        && old.encrypt_key == entry.encrypt_key
                        && old.endpoint_flags == entry.endpoint_flags
                });

                if !unchanged {
                    if is_new {
                        ids_to_add.insert(identity.id, identity.selector_labels());
                    }
                    // If the old source outranks the new one but the identity
                    // changed, the downgrade must be pushed through the
                    // precedence check.
                    let force = old_entry.as_ref().is_some_and(|old| {
                        info.source() != old.identity.source
                            && old.identity.id != entry.identity.id
                    });
                    entries_to_replace.push((*prefix, entry, force));
                    scheduled_replace = true;
                }
                // When unchanged, the reference just taken by the resolver is
                // balanced by releasing the old identity below.

                new_identity = Some(identity);
            }

            if let Some(old) = &old_entry {
                if old.identity.exclusively_owned_by_legacy_api() && scheduled_replace {
                    // The legacy writer keeps its own reference; this layer
                    // retains the one just allocated so the identity stays
                    // live even if the legacy owner releases theirs.
                    if self.config.debug_logging {
                        tracing::debug!(
                            %prefix,
                            old = %old.identity.id,
                            "acquiring identity reference for legacy entry",
                        );
                    }
                } else {
                    previously_allocated.insert(*prefix, old.identity.clone());
                }

                if info.is_none() {
                    if old.identity.exclusively_owned_by_metadata_api() {
                        entries_to_delete.push((*prefix, old.identity.clone()));
                    } else if old.identity.owned_by_legacy_and_metadata_api() {
                        if let Some(legacy_source) = old.identity.overwritten_legacy_source {
                            // Restore the shadowed legacy source under the
                            // current identity. If releasing that identity
                            // below frees it, the sweep removes the entry;
                            // otherwise the legacy delete still can.
                            let unmanaged_identity = EntryIdentity {
                                id: old.identity.id,
                                source: legacy_source,
                                modified_by_legacy_api: true,
                                overwritten_legacy_source: None,
                            };
                            let restored = Entry {
                                identity: unmanaged_identity.clone(),
                                tunnel_peer: old.tunnel_peer,
                                encrypt_key: old.encrypt_key,
                                endpoint_flags: old.endpoint_flags,
                            };
                            // The restored legacy source is lower precedence.
                            entries_to_replace.push((*prefix, restored, true));
                            unmanaged.insert(*prefix, unmanaged_identity);
                            if self.config.debug_logging {
                                tracing::debug!(
                                    %prefix,
                                    old = %old.identity.id,
                                    "previously managed entry is now unmanaged",
                                );
                            }
                        }
                    } else if old.identity.exclusively_owned_by_legacy_api() {
                        unmanaged.insert(*prefix, old.identity.clone());
                    }
                }
            }

            // The reserved host identity keeps a fixed numeric ID under
            // mutable labels, so its selector update is never elided.
            if let Some(identity) = &new_identity {
                if identity.id == NumericIdentity::HOST {
                    ids_to_add.insert(identity.id, identity.selector_labels());
                }
            }

            // If this prefix stops resolving to the host identity, the host
            // label union must shrink accordingly.
            let lost_host = old_entry
                .as_ref()
                .is_some_and(|old| old.identity.id == NumericIdentity::HOST)
                && new_identity
                    .as_ref()
                    .map_or(true, |id| id.id != NumericIdentity::HOST)
                && prefix.cluster_id() == LOCAL_CLUSTER_ID;
            if lost_host {
                let merged = self
                    .metadata
                    .update_reserved_host_labels(prefix.prefix(), None);
                ids_to_add.insert(NumericIdentity::HOST, merged);
            }
        }

        // Register identities with policy selectors before any entry write,
        // and wait for completion: an entry must never map to an identity the
        // policy engine has not yet admitted. Even an empty batch is pushed,
        // as updates may be in flight from another caller.
        let done = self.updater.update_identities(ids_to_add, BTreeMap::new());
        tokio::select! {
            _ = ctx.cancelled() => {
                return Err(ChunkError {
                    remaining: chunk,
                    error: anyhow!("cancelled while waiting for policy selector update"),
                });
            }
            _ = done => {}
        }

        {
            let mut entries = self.entries.lock();
            for (prefix, entry, force) in &entries_to_replace {
                if let Err(error) = entries.upsert(prefix, entry.clone(), *force, false) {
                    // The same fact may arrive over two paths, for instance
                    // node information propagated both via the kvstore and
                    // the k8s control plane. If precedence rejected the write
                    // but the identity is unchanged, nothing is lost.
                    let benign = previously_allocated
                        .get(prefix)
                        .is_some_and(|old| old.id == entry.identity.id);
                    if !benign {
                        tracing::error!(
                            %prefix,
                            identity = %entry.identity.id,
                            %error,
                            "failed to replace ipcache entry; traffic may be disrupted",
                        );
                    }
                }
            }

            // Deletes revert prefixes to the world identity. They must follow
            // all replaces so the policy engine observes the new state first.
            for (prefix, identity) in &entries_to_delete {
                entries.delete(prefix, identity.source);
            }
        }

        // Release one reference per replaced identity and collect those whose
        // reference count reached zero.
        let ids_to_release: Vec<NumericIdentity> =
            previously_allocated.values().map(|id| id.id).collect();
        let freed = match allocator.release_local_identities(&ids_to_release) {
            Ok(freed) => freed,
            Err(error) => {
                tracing::warn!(%error, "BUG: failed to release local identities");
                Vec::new()
            }
        };

        // A freed identity must not linger in an unmanaged entry that no
        // owner is left to delete.
        {
            let mut entries = self.entries.lock();
            for freed_id in freed {
                for prefix in entries.prefixes_for_identity(freed_id) {
                    if let Some(old) = unmanaged.get(&prefix) {
                        if old.id == freed_id {
                            tracing::debug!(
                                %prefix,
                                identity = %old.id,
                                "force-removing released prefix from the entry cache",
                            );
                            entries.delete(&prefix, old.source);
                        }
                    }
                }
            }
        }

        match failed_at {
            Some((i, error)) => Err(ChunkError {
                remaining: chunk[i..].to_vec(),
                error,
            }),
            None => Ok(()),
        }
    }
}
