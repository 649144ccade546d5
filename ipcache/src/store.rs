//! The metadata store: the mapping from `(prefix, cluster)` to contributions,
//! the per-cluster prefix tries, and the queue of prefixes awaiting label
//! injection.
//!
//! Lock discipline: the metadata lock (`inner`) protects the map and the
//! tries. The queue has its own lock with short critical sections. The
//! reserved-host label map has a third lock, acquired only after the metadata
//! lock when both are needed. If the downstream entry-cache lock is also
//! required, the metadata lock is always taken first.

use crate::resource_info::{IpMetadata, PrefixInfo, ResourceInfo};
use crate::trie::PrefixTrieMap;
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use ipcache_core::{
    labels::{LABEL_KEY_WORLD, LABEL_KEY_WORLD_IPV4, LABEL_KEY_WORLD_IPV6},
    IpNet, Label, LabelSource, Labels, PrefixCluster, ResourceId, Source,
};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

#[derive(Copy, Clone, Debug, Error, PartialEq, Eq)]
pub enum WaitError {
    /// The caller's context was cancelled before the revision was injected.
    #[error("wait for ipcache revision cancelled")]
    Cancelled,

    /// The store was torn down while waiting.
    #[error("ipcache revision channel closed")]
    Closed,
}

pub(crate) struct MetadataStore {
    inner: Mutex<Inner>,

    /// Queue of prefixes whose flattened view may have changed, and the
    /// revision that will cover them once dequeued.
    queue: Mutex<Queue>,

    /// Revision of the queue most recently applied downstream. Waiters
    /// observe updates through the watch channel.
    injected_tx: watch::Sender<u64>,

    /// Labels contributed to the reserved host identity, by prefix.
    reserved_host: Mutex<BTreeMap<IpNet, Labels>>,
}

struct Inner {
    m: HashMap<PrefixCluster, PrefixInfo>,
    prefixes: PrefixTrieMap<()>,
}

struct Queue {
    queued: HashSet<PrefixCluster>,
    queued_revision: u64,
}

impl MetadataStore {
    pub(crate) fn new() -> Self {
        let (injected_tx, _) = watch::channel(0);
        Self {
            inner: Mutex::new(Inner {
                m: HashMap::default(),
                prefixes: PrefixTrieMap::default(),
            }),
            queue: Mutex::new(Queue {
                queued: HashSet::default(),
                queued_revision: 1,
            }),
            injected_tx,
            reserved_host: Mutex::new(BTreeMap::new()),
        }
    }

    /// Merges a contribution for `prefix` from `resource`. Returns the set of
    /// prefixes whose flattened view may have changed: the prefix itself plus
    /// all stored descendants, or nothing when the write was a no-op.
    pub(crate) fn upsert(
        &self,
        prefix: PrefixCluster,
        src: Source,
        resource: &ResourceId,
        items: &[IpMetadata],
    ) -> Vec<PrefixCluster> {
        let prefix = prefix.canonical();
        let mut inner = self.inner.lock();
        let Inner { m, prefixes } = &mut *inner;

        let mut changed = false;
        let info = match m.entry(prefix) {
            std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
            std::collections::hash_map::Entry::Vacant(e) => {
                changed = true;
                prefixes.upsert(prefix.cluster_id(), prefix.prefix(), ());
                e.insert(PrefixInfo::default())
            }
        };

        let rinfo = match info.by_resource.entry(resource.clone()) {
            std::collections::btree_map::Entry::Occupied(e) => e.into_mut(),
            std::collections::btree_map::Entry::Vacant(e) => {
                changed = true;
                e.insert(ResourceInfo {
                    source: src,
                    ..Default::default()
                })
            }
        };
        for item in items {
            changed |= rinfo.apply(item, src);
        }

        // A write that cannot alter the flattened view is invisible
        // downstream; leave the cached view intact and report nothing.
        if !changed || info.flattened.as_ref().is_some_and(|f| f.covers(src, items)) {
            return Vec::new();
        }
        info.flattened = None;

        affected_prefixes(prefixes, prefix)
    }

    /// Subtracts a contribution. Contributions that become empty are dropped;
    /// prefixes with no contributions left are deleted from the map and the
    /// trie. The affected set is computed before deletion so it includes the
    /// removed prefix itself.
    pub(crate) fn remove(
        &self,
        prefix: PrefixCluster,
        resource: &ResourceId,
        items: &[IpMetadata],
    ) -> Vec<PrefixCluster> {
        let mut inner = self.inner.lock();
        remove_locked(&mut inner, prefix, resource, items)
    }

    /// Returns a copy of the flattened view for `prefix`, recomputing and
    /// caching it if a mutation invalidated it.
    pub(crate) fn get(&self, prefix: &PrefixCluster) -> Option<ResourceInfo> {
        let mut inner = self.inner.lock();
        get_locked(&mut inner, &prefix.canonical())
    }

    /// The highest-precedence source that has contributed metadata for
    /// `prefix`.
    pub(crate) fn source_by_prefix(&self, prefix: &PrefixCluster) -> Source {
        self.get(prefix).map(|f| f.source()).unwrap_or_default()
    }

    /// All prefixes whose flattened labels are a superset of `filter`.
    pub(crate) fn filter_by_labels(&self, filter: &Labels) -> Vec<PrefixCluster> {
        let mut inner = self.inner.lock();
        let prefixes: Vec<PrefixCluster> = inner.m.keys().copied().collect();
        prefixes
            .into_iter()
            .filter(|prefix| {
                get_locked(&mut inner, prefix)
                    .is_some_and(|flat| flat.labels().contains_all(filter))
            })
            .collect()
    }

    /// Removes `lbls` as contributed by `resource` from every prefix except
    /// those in `to_exclude`. Returns the affected prefixes.
    pub(crate) fn remove_labels_excluded(
        &self,
        lbls: &Labels,
        to_exclude: &HashSet<PrefixCluster>,
        resource: &ResourceId,
    ) -> Vec<PrefixCluster> {
        let mut inner = self.inner.lock();
        let candidates: Vec<PrefixCluster> = inner.m.keys().copied().collect();

        let mut affected = Vec::new();
        for prefix in candidates {
            if to_exclude.contains(&prefix) {
                continue;
            }
            let Some(flat) = get_locked(&mut inner, &prefix) else {
                continue;
            };
            if !flat.labels().contains_all(lbls) {
                continue;
            }
            let to_remove = labels_for_api_server_deletion(lbls, flat.labels());
            affected.extend(remove_locked(
                &mut inner,
                prefix,
                resource,
                &[IpMetadata::Labels(to_remove)],
            ));
        }
        affected
    }

    /// Pulls all labels of stored ancestor prefixes down into `lbls`, with
    /// longer prefixes taking precedence, keeping at most one `cidr:` label.
    pub(crate) fn merge_parent_labels(&self, lbls: &mut Labels, prefix: &PrefixCluster) {
        let mut inner = self.inner.lock();
        let mut has_cidr = lbls.has_source(LabelSource::Cidr);

        let mut ancestors = Vec::new();
        inner
            .prefixes
            .ancestors(prefix.cluster_id(), prefix.prefix(), |net, _| {
                ancestors.push(net);
                true
            });

        for parent in ancestors {
            let parent = PrefixCluster::new(parent, prefix.cluster_id());
            let Some(info) = get_locked(&mut inner, &parent) else {
                continue;
            };
            for label in info.labels().iter() {
                if label.source == LabelSource::Cidr && has_cidr {
                    continue;
                }
                if lbls.insert_if_absent(label.clone()) && label.source == LabelSource::Cidr {
                    has_cidr = true;
                }
            }
        }
    }

    /// Records (or clears, when `lbls` is `None`) the host-label contribution
    /// of `prefix` and returns the label union across all host prefixes,
    /// always including `reserved:host` itself.
    pub(crate) fn update_reserved_host_labels(
        &self,
        prefix: IpNet,
        lbls: Option<Labels>,
    ) -> Labels {
        let mut reserved = self.reserved_host.lock();
        match lbls {
            Some(lbls) => {
                reserved.insert(prefix, lbls);
            }
            None => {
                reserved.remove(&prefix);
            }
        }

        let mut merged = Labels::from([Label::host()]);
        for contribution in reserved.values() {
            merged.merge(contribution);
        }
        merged
    }

    /// Queues prefixes for label injection, returning the revision that will
    /// cover them once dequeued and injected.
    pub(crate) fn enqueue(&self, prefixes: &[PrefixCluster]) -> u64 {
        let mut queue = self.queue.lock();
        queue.queued.extend(prefixes.iter().copied());
        queue.queued_revision
    }

    /// Atomically snapshots and clears the queue. The returned revision,
    /// once passed to `set_injected_revision`, satisfies all waiters at or
    /// below it; newly queued prefixes belong to the next cycle.
    pub(crate) fn dequeue(&self) -> (Vec<PrefixCluster>, u64) {
        let mut queue = self.queue.lock();
        let prefixes: Vec<PrefixCluster> = queue.queued.drain().collect();
        let revision = queue.queued_revision;
        queue.queued_revision += 1;
        (prefixes, revision)
    }

    pub(crate) fn queue_len(&self) -> usize {
        self.queue.lock().queued.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().m.len()
    }

    pub(crate) fn injected_revision(&self) -> u64 {
        *self.injected_tx.borrow()
    }

    /// Advances the injected revision and wakes all waiters. The revision
    /// never moves backwards.
    pub(crate) fn set_injected_revision(&self, revision: u64) {
        self.injected_tx.send_modify(|current| {
            *current = (*current).max(revision);
        });
    }

    /// Blocks until the injected revision reaches `revision` or the caller's
    /// context is cancelled.
    pub(crate) async fn wait_for_revision(
        &self,
        ctx: &CancellationToken,
        revision: u64,
    ) -> Result<(), WaitError> {
        let mut rx = self.injected_tx.subscribe();
        tokio::select! {
            _ = ctx.cancelled() => Err(WaitError::Cancelled),
            res = rx.wait_for(|injected| *injected >= revision) => {
                res.map(|_| ()).map_err(|_| WaitError::Closed)
            }
        }
    }

    /// A sorted snapshot of every prefix and its flattened view.
    pub(crate) fn dump(&self) -> Vec<(PrefixCluster, ResourceInfo)> {
        let mut inner = self.inner.lock();
        let prefixes: Vec<PrefixCluster> = inner.m.keys().copied().collect();
        let mut out: Vec<(PrefixCluster, ResourceInfo)> = prefixes
            .into_iter()
            .filter_map(|p| get_locked(&mut inner, &p).map(|flat| (p, flat)))
            .collect();
        out.sort_by_key(|(p, _)| *p);
        out
    }

    #[cfg(test)]
    pub(crate) fn trie_contains(&self, prefix: &PrefixCluster) -> bool {
        let prefix = prefix.canonical();
        let inner = self.inner.lock();
        let mut found = false;
        if prefix.is_host_route() {
            inner
                .prefixes
                .descendants(prefix.cluster_id(), prefix.prefix(), |_, _| {
                    found = true;
                    false
                });
        } else {
            inner
                .prefixes
                .ancestors(prefix.cluster_id(), max_host_route(prefix.prefix()), |net, _| {
                    found |= net == prefix.prefix();
                    true
                });
        }
        found
    }
}

#[cfg(test)]
fn max_host_route(net: IpNet) -> IpNet {
    match net {
        IpNet::V4(p) => ipcache_core::Ipv4Net::new(p.addr(), 32)
            .map(IpNet::V4)
            .expect("host route"),
        IpNet::V6(p) => ipcache_core::Ipv6Net::new(p.addr(), 128)
            .map(IpNet::V6)
            .expect("host route"),
    }
}

fn get_locked(inner: &mut Inner, prefix: &PrefixCluster) -> Option<ResourceInfo> {
    let info = inner.m.get_mut(prefix)?;
    if info.flattened.is_none() {
        info.flattened = Some(info.flatten());
    }
    info.flattened.clone()
}

fn remove_locked(
    inner: &mut Inner,
    prefix: PrefixCluster,
    resource: &ResourceId,
    items: &[IpMetadata],
) -> Vec<PrefixCluster> {
    let prefix = prefix.canonical();
    let Inner { m, prefixes } = &mut *inner;

    let mut delete_prefix = false;
    let affected = {
        let Some(info) = m.get_mut(&prefix) else {
            return Vec::new();
        };
        let Some(rinfo) = info.by_resource.get_mut(resource) else {
            return Vec::new();
        };

        // Compute the affected set before any deletion so the prefix still
        // matches its own trie entry.
        let affected = affected_prefixes(prefixes, prefix);

        for item in items {
            rinfo.unapply(item);
        }
        if !rinfo.is_valid() {
            info.by_resource.remove(resource);
        }
        if info.is_valid() {
            info.flattened = None;
        } else {
            delete_prefix = true;
        }
        affected
    };

    if delete_prefix {
        m.remove(&prefix);
        prefixes.delete(prefix.cluster_id(), prefix.prefix());
    }
    affected
}

fn affected_prefixes(prefixes: &PrefixTrieMap<()>, prefix: PrefixCluster) -> Vec<PrefixCluster> {
    let mut affected = vec![prefix];
    if prefix.is_host_route() {
        return affected; // no children
    }
    prefixes.descendants(prefix.cluster_id(), prefix.prefix(), |child, _| {
        affected.push(PrefixCluster::new(child, prefix.cluster_id()));
        true
    });
    affected
}

/// Special case for API server entities deployed outside the cluster: when a
/// prefix's flattened labels are exactly the kube-apiserver label plus a
/// world label, removing only the kube-apiserver label would leave an
/// orphaned world identity, so the world label joins the removal set.
fn labels_for_api_server_deletion(lbls: &Labels, current: &Labels) -> Labels {
    let mut out = lbls.clone();
    if current.has_kube_apiserver_label() && current.has_world_label() && current.len() == 2 {
        for label in current.iter() {
            let world = label.source == LabelSource::Reserved
                && matches!(
                    label.key.as_str(),
                    LABEL_KEY_WORLD | LABEL_KEY_WORLD_IPV4 | LABEL_KEY_WORLD_IPV6
                );
            if world {
                out.insert(label.clone());
            }
        }
    }
    out
}
