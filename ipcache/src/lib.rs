//! IP-to-identity metadata cache with label injection.
//!
//! Producers (endpoint watchers, node discovery, FQDN resolution, policy
//! resources) contribute labels and datapath attributes for IP prefixes via
//! [`IpCache::upsert`] and [`IpCache::remove`]. Contributions are stored per
//! resource; the union of all contributions for a prefix, taken under source
//! precedence and parent-prefix inheritance, determines the prefix's numeric
//! security identity.
//!
//! Every mutation queues the affected prefixes. A single long-lived injector
//! task drains the queue and applies the resulting identity allocations,
//! entry replacements, and policy-selector updates in an order that never
//! drops traffic:
//!
//! ```text
//!  watchers ──upsert/remove──▶ [ metadata store ] ──queue──▶ [ injector ]
//!                                                                │
//!                                       policy selectors  ◀─(1)──┤
//!                                       entry cache        ◀─(2)─┤
//!                                       identity releases  ◀─(3)─┘
//! ```
//!
//! Callers observe their own writes downstream by waiting on the revision
//! returned from the mutators via [`IpCache::wait_for_revision`].

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod controller;
mod entries;
mod injector;
mod metrics;
mod resolver;
mod resource_info;
mod store;
mod trie;


pub use self::entries::{Entry, EntryIdentity, Listener, OverwriteError};
pub use self::metrics::Metrics;
pub use self::resource_info::{IpMetadata, ResourceInfo};
pub use self::store::WaitError;

use self::entries::EntryStore;
use self::store::MetadataStore;
use ahash::AHashSet as HashSet;
use ipcache_core::{
    CacheStatus, IdentityAllocator, IdentityUpdater, Labels, PrefixCluster, ResourceId, Source,
};
use parking_lot::{Mutex, RwLock};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Tunables for the metadata cache and the label injector.
#[derive(Clone, Debug)]
pub struct Config {
    /// Maximum number of prefixes processed per injection chunk. Chunking
    /// bounds the peak number of live identities, since references are
    /// released only after a chunk's entry writes land.
    pub chunk_size: usize,

    /// Cap on the injector's retry backoff.
    pub max_retry_interval: Duration,

    /// Permits CIDR, FQDN and CIDR-group labels on node prefixes.
    pub policy_cidr_matches_nodes: bool,

    /// Permits `node:`-source labels on node prefixes.
    pub per_node_labels_enabled: bool,

    /// Enables per-decision debug logs.
    pub debug_logging: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            chunk_size: 512,
            max_retry_interval: Duration::from_secs(60),
            policy_cidr_matches_nodes: false,
            per_node_labels_enabled: false,
            debug_logging: false,
        }
    }
}

/// The metadata cache plus its downstream entry cache and injector state.
pub struct IpCache {
    config: Config,
    metadata: MetadataStore,
    entries: Mutex<EntryStore>,
    allocator: RwLock<Option<Arc<dyn IdentityAllocator>>>,
    updater: Arc<dyn IdentityUpdater>,
    cache_status: CacheStatus,
    metrics: Metrics,
    injection_trigger: Notify,
    injector_task: OnceLock<JoinHandle<()>>,
    shutdown: CancellationToken,

    /// Back-reference handed to the injector task on first trigger.
    self_ref: Weak<IpCache>,
}

impl IpCache {
    pub fn new(
        config: Config,
        updater: Arc<dyn IdentityUpdater>,
        cache_status: CacheStatus,
        metrics: Metrics,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            config,
            metadata: MetadataStore::new(),
            entries: Mutex::new(EntryStore::default()),
            allocator: RwLock::new(None),
            updater,
            cache_status,
            metrics,
            injection_trigger: Notify::new(),
            injector_task: OnceLock::new(),
            shutdown: CancellationToken::new(),
            self_ref: self_ref.clone(),
        })
    }

    /// Installs the identity allocator. Until this is called, injection ticks
    /// fail and re-queue their prefixes.
    pub fn set_identity_allocator(&self, allocator: Arc<dyn IdentityAllocator>) {
        *self.allocator.write() = Some(allocator);
    }

    /// Registers an observer for downstream entry changes.
    pub fn register_listener(&self, listener: Arc<dyn Listener>) {
        self.entries.lock().register_listener(listener);
    }

    /// Merges `items` for `prefix` as contributed by `resource` and queues
    /// all affected prefixes for injection. Returns the revision that, once
    /// injected, makes the write visible downstream.
    pub fn upsert(
        &self,
        prefix: PrefixCluster,
        src: Source,
        resource: &ResourceId,
        items: &[IpMetadata],
    ) -> u64 {
        let affected = self.metadata.upsert(prefix, src, resource, items);
        self.finish_mutation(&affected)
    }

    /// Subtracts `items` for `prefix` as previously contributed by
    /// `resource`. Returns the revision covering the removal.
    pub fn remove(
        &self,
        prefix: PrefixCluster,
        resource: &ResourceId,
        items: &[IpMetadata],
    ) -> u64 {
        let affected = self.metadata.remove(prefix, resource, items);
        self.finish_mutation(&affected)
    }

    /// Removes `lbls` as contributed by `resource` from every prefix except
    /// those in `to_exclude`. Returns the revision covering the removals.
    pub fn remove_labels_excluded(
        &self,
        lbls: &Labels,
        to_exclude: &HashSet<PrefixCluster>,
        resource: &ResourceId,
    ) -> u64 {
        let affected = self
            .metadata
            .remove_labels_excluded(lbls, to_exclude, resource);
        self.finish_mutation(&affected)
    }

    fn finish_mutation(&self, affected: &[PrefixCluster]) -> u64 {
        let revision = self.metadata.enqueue(affected);
        self.metrics.prefixes.set(self.metadata.len() as i64);
        self.metrics
            .queue_depth
            .set(self.metadata.queue_len() as i64);
        self.trigger_label_injection();
        revision
    }

    /// Blocks until all changes enqueued at or before `revision` have been
    /// injected, or `ctx` is cancelled.
    pub async fn wait_for_revision(
        &self,
        ctx: &CancellationToken,
        revision: u64,
    ) -> Result<(), WaitError> {
        self.metadata.wait_for_revision(ctx, revision).await
    }

    /// A copy of the flattened metadata for `prefix`, if any.
    pub fn get(&self, prefix: &PrefixCluster) -> Option<ResourceInfo> {
        self.metadata.get(prefix)
    }

    /// The highest-precedence source that has provided metadata for `prefix`.
    pub fn get_metadata_source_by_prefix(&self, prefix: &PrefixCluster) -> Source {
        self.metadata.source_by_prefix(prefix)
    }

    /// All prefixes whose flattened labels are a superset of `filter`.
    pub fn filter_by_labels(&self, filter: &Labels) -> Vec<PrefixCluster> {
        self.metadata.filter_by_labels(filter)
    }

    /// A sorted snapshot of every prefix's flattened metadata.
    pub fn dump_flattened(&self) -> Vec<(PrefixCluster, ResourceInfo)> {
        self.metadata.dump()
    }

    /// The downstream entry for `prefix`, if one has been injected.
    pub fn lookup_entry(&self, prefix: &PrefixCluster) -> Option<Entry> {
        self.entries.lock().lookup(prefix)
    }

    /// Direct entry write, predating the metadata layer. Entries written here
    /// are tracked so both APIs can share ownership of a prefix; new callers
    /// should contribute metadata through [`IpCache::upsert`] instead.
    pub fn upsert_entry(
        &self,
        prefix: &PrefixCluster,
        entry: Entry,
        force: bool,
    ) -> Result<(), OverwriteError> {
        self.entries.lock().upsert(prefix, entry, force, true)
    }

    /// Direct entry removal for [`IpCache::upsert_entry`] writers.
    pub fn delete_entry(&self, prefix: &PrefixCluster, src: Source) -> bool {
        self.entries.lock().delete(prefix, src)
    }

    /// The most recently injected queue revision.
    pub fn injected_revision(&self) -> u64 {
        self.metadata.injected_revision()
    }

    /// Stops the injector task. Pending waiters observe their contexts.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}
