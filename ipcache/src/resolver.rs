//! Translates a prefix's flattened metadata into a numeric identity.

use crate::store::MetadataStore;
use crate::Config;
use ipcache_core::{
    AllocatorError, Identity, IdentityAllocator, Label, LabelSource, Labels, NumericIdentity,
    PrefixCluster, LOCAL_CLUSTER_ID,
};

use crate::resource_info::ResourceInfo;

/// Resolves the identity for `prefix`, allocating one when needed.
///
/// Every successful resolution takes a reference on the returned identity;
/// the caller must balance it through the allocator once the corresponding
/// entry is removed, or immediately if no entry is written.
pub(crate) fn resolve_identity(
    store: &MetadataStore,
    allocator: &dyn IdentityAllocator,
    config: &Config,
    prefix: &PrefixCluster,
    info: &ResourceInfo,
) -> Result<(Identity, bool), AllocatorError> {
    // Override identities bypass inheritance and the label invariants.
    if info.identity_override() {
        return allocator
            .allocate_local_identity(info.labels().clone(), None)
            .inspect_err(|error| {
                tracing::warn!(
                    %prefix,
                    %error,
                    labels = %info.labels(),
                    "failed to allocate identity for override labels",
                );
            });
    }

    let mut lbls = info.labels().clone();

    // Pull down all labels of covering prefixes before applying invariants.
    store.merge_parent_labels(&mut lbls, prefix);
    resolve_labels(&mut lbls, prefix, config);

    if prefix.cluster_id() == LOCAL_CLUSTER_ID && lbls.has_host_label() {
        // The reserved host identity has a fixed numeric ID with mutable
        // labels, and every host prefix feeds the same identity. Merge this
        // prefix's labels into the union rather than allocating.
        let merged = store.update_reserved_host_labels(prefix.prefix(), Some(lbls));
        if config.debug_logging {
            tracing::debug!(%prefix, labels = %merged, "merged labels for reserved host identity");
        }
        return Ok((Identity::new(NumericIdentity::HOST, merged), false));
    }

    let (mut identity, is_new) = allocator
        .allocate_local_identity(lbls.clone(), info.requested_identity())
        .inspect_err(|error| {
            tracing::warn!(%prefix, %error, labels = %lbls, "failed to allocate identity for prefix");
        })?;

    if lbls.has_world_label() {
        // Tag world identities with the prefix itself so CIDR policies can
        // select them.
        identity.cidr_label = Some(Label::cidr(prefix.prefix()));
    }
    Ok((identity, is_new))
}

/// Applies the in-cluster label invariants.
///
/// In-cluster entities (nodes, health, ingress) must not be selectable by
/// CIDR and CIDR-equivalent policies, and only prefixes outside the cluster
/// carry a world label.
pub(crate) fn resolve_labels(lbls: &mut Labels, prefix: &PrefixCluster, config: &Config) {
    let is_node = lbls.has_remote_node_label() || lbls.has_host_label();
    let is_in_cluster = is_node || lbls.has_health_label() || lbls.has_ingress_label();

    if is_in_cluster {
        lbls.remove(ipcache_core::labels::LABEL_KEY_WORLD);
        lbls.remove(ipcache_core::labels::LABEL_KEY_WORLD_IPV4);
        lbls.remove(ipcache_core::labels::LABEL_KEY_WORLD_IPV6);
    }

    if is_in_cluster && !(is_node && config.policy_cidr_matches_nodes) {
        lbls.remove_from_source(LabelSource::Cidr);
        lbls.remove_from_source(LabelSource::Fqdn);
        lbls.remove_from_source(LabelSource::CidrGroup);
    }

    if !(is_node && config.per_node_labels_enabled) {
        lbls.remove_from_source(LabelSource::Node);
    }

    // No empty label sets: fall back to the prefix's own CIDR label.
    if lbls.is_empty() {
        lbls.insert(Label::cidr(prefix.prefix()));
    }

    if !is_in_cluster {
        lbls.add_world_label(prefix.prefix());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prefix(s: &str) -> PrefixCluster {
        s.parse().expect("valid test prefix")
    }

    #[test]
    fn world_prefixes_get_world_label() {
        let mut lbls = Labels::from([Label::k8s("app", "web")]);
        resolve_labels(&mut lbls, &prefix("10.0.0.1/32"), &Config::default());
        assert!(lbls.contains(&Label::world_ipv4()));

        let mut v6 = Labels::new();
        resolve_labels(&mut v6, &prefix("2001:db8::1/128"), &Config::default());
        assert!(v6.contains(&Label::world_ipv6()));
    }

    #[test]
    fn empty_labels_fall_back_to_cidr() {
        let mut lbls = Labels::new();
        resolve_labels(&mut lbls, &prefix("10.0.0.0/8"), &Config::default());
        assert!(lbls.contains_key("10.0.0.0/8"));
        assert!(lbls.contains(&Label::world_ipv4()));
    }

    #[test]
    fn in_cluster_prefixes_lose_world_and_cidr_labels() {
        let mut lbls = Labels::from([
            Label::remote_node(),
            Label::world_ipv4(),
            Label::cidr("10.0.0.0/8".parse().expect("net")),
        ]);
        resolve_labels(&mut lbls, &prefix("10.0.0.7/32"), &Config::default());
        assert!(!lbls.has_world_label());
        assert!(!lbls.has_source(LabelSource::Cidr));
        assert!(lbls.has_remote_node_label());
    }

    #[test]
    fn nodes_keep_cidr_labels_when_configured() {
        let config = Config {
            policy_cidr_matches_nodes: true,
            ..Default::default()
        };
        let mut lbls = Labels::from([
            Label::remote_node(),
            Label::cidr("10.0.0.0/8".parse().expect("net")),
        ]);
        resolve_labels(&mut lbls, &prefix("10.0.0.7/32"), &config);
        assert!(lbls.has_source(LabelSource::Cidr));
    }

    #[test]
    fn node_source_labels_require_per_node_labels() {
        let mut stripped = Labels::from([Label::remote_node(), Label::node("zone", "us-1")]);
        resolve_labels(&mut stripped, &prefix("10.0.0.7/32"), &Config::default());
        assert!(!stripped.has_source(LabelSource::Node));

        let config = Config {
            per_node_labels_enabled: true,
            ..Default::default()
        };
        let mut kept = Labels::from([Label::remote_node(), Label::node("zone", "us-1")]);
        resolve_labels(&mut kept, &prefix("10.0.0.7/32"), &config);
        assert!(kept.has_source(LabelSource::Node));

        // Non-node prefixes drop node labels regardless.
        let mut non_node = Labels::from([Label::k8s("app", "web"), Label::node("zone", "us-1")]);
        resolve_labels(&mut non_node, &prefix("10.0.0.8/32"), &config);
        assert!(!non_node.has_source(LabelSource::Node));
    }

    #[test]
    fn health_and_ingress_are_in_cluster_but_not_nodes() {
        let config = Config {
            policy_cidr_matches_nodes: true,
            ..Default::default()
        };
        let mut lbls = Labels::from([
            Label::health(),
            Label::cidr("10.0.0.0/8".parse().expect("net")),
        ]);
        resolve_labels(&mut lbls, &prefix("10.0.0.9/32"), &config);
        // Health is in-cluster but not a node, so the node exception does not
        // apply and the cidr label is stripped.
        assert!(!lbls.has_source(LabelSource::Cidr));
        assert!(!lbls.has_world_label());
    }
}
