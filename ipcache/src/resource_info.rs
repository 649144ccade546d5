//! Per-resource metadata contributions and their flattened, per-prefix view.

use ipcache_core::{Labels, NumericIdentity, ResourceId, Source};
use std::collections::BTreeMap;
use std::net::IpAddr;

/// One attribute of a metadata contribution. An upsert carries any number of
/// these; only the attributes present participate in merging.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IpMetadata {
    Labels(Labels),
    TunnelPeer(IpAddr),
    EncryptKey(u8),
    EndpointFlags(u8),
    RequestedIdentity(NumericIdentity),
    /// When set, the contributed labels become the identity verbatim,
    /// bypassing inheritance and label invariants.
    OverrideIdentity(bool),
}

/// The contribution a single resource has made for one prefix, or the
/// flattened union of all contributions.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResourceInfo {
    pub(crate) labels: Labels,
    pub(crate) source: Source,
    pub(crate) identity_override: bool,
    pub(crate) tunnel_peer: Option<IpAddr>,
    pub(crate) encrypt_key: Option<u8>,
    pub(crate) endpoint_flags: Option<u8>,
    pub(crate) requested_identity: Option<NumericIdentity>,
}

impl ResourceInfo {
    pub fn labels(&self) -> &Labels {
        &self.labels
    }

    pub fn source(&self) -> Source {
        self.source
    }

    pub fn tunnel_peer(&self) -> Option<IpAddr> {
        self.tunnel_peer
    }

    pub fn encrypt_key(&self) -> u8 {
        self.encrypt_key.unwrap_or(0)
    }

    pub fn endpoint_flags(&self) -> u8 {
        self.endpoint_flags.unwrap_or(0)
    }

    pub fn identity_override(&self) -> bool {
        self.identity_override
    }

    pub fn requested_identity(&self) -> Option<NumericIdentity> {
        self.requested_identity
    }

    /// Applies one attribute of a fresh contribution from this resource,
    /// which is authoritative for its own previous values. Returns whether
    /// anything changed.
    pub(crate) fn apply(&mut self, item: &IpMetadata, src: Source) -> bool {
        let mut changed = self.source != src;
        self.source = src;
        match item {
            IpMetadata::Labels(labels) => changed |= self.labels.merge(labels),
            IpMetadata::TunnelPeer(ip) => {
                changed |= self.tunnel_peer != Some(*ip);
                self.tunnel_peer = Some(*ip);
            }
            IpMetadata::EncryptKey(key) => {
                changed |= self.encrypt_key != Some(*key);
                self.encrypt_key = Some(*key);
            }
            IpMetadata::EndpointFlags(flags) => {
                changed |= self.endpoint_flags != Some(*flags);
                self.endpoint_flags = Some(*flags);
            }
            IpMetadata::RequestedIdentity(id) => {
                changed |= self.requested_identity != Some(*id);
                self.requested_identity = Some(*id);
            }
            IpMetadata::OverrideIdentity(o) => {
                changed |= self.identity_override != *o;
                self.identity_override = *o;
            }
        }
        changed
    }

    /// Subtracts one attribute of a previous contribution: labels are removed
    /// by key, scalars cleared when they match the contribution.
    pub(crate) fn unapply(&mut self, item: &IpMetadata) {
        match item {
            IpMetadata::Labels(labels) => {
                self.labels.remove_all(labels);
            }
            IpMetadata::TunnelPeer(ip) => {
                if self.tunnel_peer == Some(*ip) {
                    self.tunnel_peer = None;
                }
            }
            IpMetadata::EncryptKey(key) => {
                if self.encrypt_key == Some(*key) {
                    self.encrypt_key = None;
                }
            }
            IpMetadata::EndpointFlags(flags) => {
                if self.endpoint_flags == Some(*flags) {
                    self.endpoint_flags = None;
                }
            }
            IpMetadata::RequestedIdentity(id) => {
                if self.requested_identity == Some(*id) {
                    self.requested_identity = None;
                }
            }
            IpMetadata::OverrideIdentity(_) => self.identity_override = false,
        }
    }

    /// A contribution with no labels and no set scalar attributes carries no
    /// information and is dropped from the store.
    pub(crate) fn is_valid(&self) -> bool {
        !self.labels.is_empty()
            || self.identity_override
            || self.tunnel_peer.is_some()
            || self.encrypt_key.is_some()
            || self.endpoint_flags.is_some()
    }

    /// Whether the flattened view already reflects every attribute of this
    /// contribution, making the write a no-op for downstream consumers. A
    /// write from a source outranking the flattened one is never covered, as
    /// it changes the view's effective source.
    pub(crate) fn covers(&self, src: Source, items: &[IpMetadata]) -> bool {
        if src > self.source {
            return false;
        }
        items.iter().all(|item| match item {
            IpMetadata::Labels(labels) => self.labels.contains_all(labels),
            IpMetadata::TunnelPeer(ip) => self.tunnel_peer == Some(*ip),
            IpMetadata::EncryptKey(key) => self.encrypt_key == Some(*key),
            IpMetadata::EndpointFlags(flags) => self.endpoint_flags == Some(*flags),
            IpMetadata::RequestedIdentity(id) => self.requested_identity == Some(*id),
            IpMetadata::OverrideIdentity(o) => self.identity_override == *o,
        })
    }

    /// Folds a lower-or-equal precedence contribution into this accumulator:
    /// label keys fill only when absent, scalars only when unset.
    fn accumulate(&mut self, other: &ResourceInfo) {
        for label in other.labels.iter() {
            self.labels.insert_if_absent(label.clone());
        }
        self.identity_override |= other.identity_override;
        if self.tunnel_peer.is_none() {
            self.tunnel_peer = other.tunnel_peer;
        }
        if self.encrypt_key.is_none() {
            self.encrypt_key = other.encrypt_key;
        }
        if self.endpoint_flags.is_none() {
            self.endpoint_flags = other.endpoint_flags;
        }
        if self.requested_identity.is_none() {
            self.requested_identity = other.requested_identity;
        }
    }
}

/// All metadata known for one prefix: the contributions by resource, plus a
/// lazily computed flattened union. Any mutation clears `flattened`; readers
/// recompute it under the store lock.
#[derive(Debug, Default)]
pub(crate) struct PrefixInfo {
    pub(crate) by_resource: BTreeMap<ResourceId, ResourceInfo>,
    pub(crate) flattened: Option<ResourceInfo>,
}

impl PrefixInfo {
    pub(crate) fn is_valid(&self) -> bool {
        !self.by_resource.is_empty()
    }

    /// Computes the union of all contributions. Contributions apply in
    /// descending source precedence; equal precedence is stabilized by
    /// resource ID order. The result's source is the highest precedence among
    /// contributors.
    pub(crate) fn flatten(&self) -> ResourceInfo {
        let mut contributors: Vec<(&ResourceId, &ResourceInfo)> = self.by_resource.iter().collect();
        contributors.sort_by(|(a_id, a), (b_id, b)| {
            b.source.cmp(&a.source).then_with(|| a_id.cmp(b_id))
        });

        let mut flattened = ResourceInfo::default();
        for (i, (_, info)) in contributors.iter().enumerate() {
            if i == 0 {
                flattened.source = info.source;
            }
            flattened.accumulate(info);
        }
        flattened
    }
}
