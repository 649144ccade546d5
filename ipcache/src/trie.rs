//! Longest-prefix-match tries over canonical prefixes, keyed per cluster.
//!
//! Prefixes from different clusters never shadow each other, so each cluster
//! ID owns an independent pair of tries (one per address family). IPv4 keys
//! are mapped into the high 32 bits of the shared 128-bit key space.

use ahash::AHashMap as HashMap;
use ipcache_core::{IpNet, Ipv4Net, Ipv6Net};
use std::net::{Ipv4Addr, Ipv6Addr};

pub(crate) struct PrefixTrieMap<V> {
    clusters: HashMap<u32, ClusterTries<V>>,
}

struct ClusterTries<V> {
    v4: Trie<V>,
    v6: Trie<V>,
}

struct Trie<V> {
    root: Node<V>,
}

struct Node<V> {
    value: Option<V>,
    children: [Option<Box<Node<V>>>; 2],
}

impl<V> Default for Node<V> {
    fn default() -> Self {
        Self {
            value: None,
            children: [None, None],
        }
    }
}

impl<V> Default for PrefixTrieMap<V> {
    fn default() -> Self {
        Self {
            clusters: HashMap::default(),
        }
    }
}

/// The trie key of a prefix: address bits left-aligned in a u128, the prefix
/// length, and the family marker needed to reconstruct the prefix.
fn key(prefix: IpNet) -> (u128, u8, bool) {
    match prefix {
        IpNet::V4(p) => {
            let bits = (u32::from(p.addr()) as u128) << 96;
            (bits, p.prefix_len(), true)
        }
        IpNet::V6(p) => (u128::from(p.addr()), p.prefix_len(), false),
    }
}

fn make_prefix(bits: u128, len: u8, is_v4: bool) -> IpNet {
    if is_v4 {
        let addr = Ipv4Addr::from((bits >> 96) as u32);
        IpNet::V4(Ipv4Net::new(addr, len).expect("prefix length within family bounds"))
    } else {
        let addr = Ipv6Addr::from(bits);
        IpNet::V6(Ipv6Net::new(addr, len).expect("prefix length within family bounds"))
    }
}

fn bit_at(bits: u128, index: u8) -> usize {
    ((bits >> (127 - index)) & 1) as usize
}

impl<V> PrefixTrieMap<V> {
    /// Inserts or replaces the value stored at `prefix`. Idempotent.
    pub(crate) fn upsert(&mut self, cluster_id: u32, prefix: IpNet, value: V) {
        let tries = self
            .clusters
            .entry(cluster_id)
            .or_insert_with(|| ClusterTries {
                v4: Trie {
                    root: Node::default(),
                },
                v6: Trie {
                    root: Node::default(),
                },
            });
        let (bits, len, is_v4) = key(prefix);
        let trie = if is_v4 { &mut tries.v4 } else { &mut tries.v6 };

        let mut node = &mut trie.root;
        for i in 0..len {
            node = node.children[bit_at(bits, i)].get_or_insert_with(Default::default);
        }
        node.value = Some(value);
    }

    /// Removes the value stored at `prefix`, if any. Idempotent.
    pub(crate) fn delete(&mut self, cluster_id: u32, prefix: IpNet) {
        let Some(tries) = self.clusters.get_mut(&cluster_id) else {
            return;
        };
        let (bits, len, is_v4) = key(prefix);
        let trie = if is_v4 { &mut tries.v4 } else { &mut tries.v6 };

        let mut node = &mut trie.root;
        for i in 0..len {
            match node.children[bit_at(bits, i)].as_deref_mut() {
                Some(child) => node = child,
                None => return,
            }
        }
        node.value = None;
    }

    /// Visits every stored prefix strictly contained in `parent`, in
    /// arbitrary order. A `parent` that is a host route visits only itself,
    /// if stored. The visitor returns false to stop the walk.
    pub(crate) fn descendants(
        &self,
        cluster_id: u32,
        parent: IpNet,
        mut visit: impl FnMut(IpNet, &V) -> bool,
    ) {
        let Some(tries) = self.clusters.get(&cluster_id) else {
            return;
        };
        let (bits, len, is_v4) = key(parent);
        let trie = if is_v4 { &tries.v4 } else { &tries.v6 };

        let mut node = &trie.root;
        for i in 0..len {
            match node.children[bit_at(bits, i)].as_deref() {
                Some(child) => node = child,
                None => return,
            }
        }

        if len == parent.max_prefix_len() {
            if let Some(value) = &node.value {
                visit(parent, value);
            }
            return;
        }

        walk(node, bits, len, is_v4, true, &mut visit);
    }

    /// Visits every stored prefix strictly containing `prefix`, from longest
    /// to shortest. The visitor returns false to stop the walk.
    pub(crate) fn ancestors(
        &self,
        cluster_id: u32,
        prefix: IpNet,
        mut visit: impl FnMut(IpNet, &V) -> bool,
    ) {
        let Some(tries) = self.clusters.get(&cluster_id) else {
            return;
        };
        let (bits, len, is_v4) = key(prefix);
        let trie = if is_v4 { &tries.v4 } else { &tries.v6 };

        let mut found = Vec::new();
        let mut node = &trie.root;
        for i in 0..len {
            if node.value.is_some() {
                found.push((node, i));
            }
            match node.children[bit_at(bits, i)].as_deref() {
                Some(child) => node = child,
                None => break,
            }
        }

        for (node, depth) in found.into_iter().rev() {
            let value = node.value.as_ref().expect("collected nodes hold values");
            let ancestor_bits = mask(bits, depth);
            if !visit(make_prefix(ancestor_bits, depth, is_v4), value) {
                return;
            }
        }
    }
}

/// Zeroes all bits of `bits` below the first `len` bits.
fn mask(bits: u128, len: u8) -> u128 {
    if len == 0 {
        0
    } else {
        bits & (u128::MAX << (128 - len))
    }
}

/// Depth-first walk over the subtree rooted at `node`, visiting stored
/// prefixes. The root of the walk itself is skipped when `skip_self` is set,
/// so enumeration is strict containment.
fn walk<V>(
    node: &Node<V>,
    bits: u128,
    len: u8,
    is_v4: bool,
    skip_self: bool,
    visit: &mut impl FnMut(IpNet, &V) -> bool,
) -> bool {
    if !skip_self {
        if let Some(value) = &node.value {
            if !visit(make_prefix(bits, len, is_v4), value) {
                return false;
            }
        }
    }
    for (i, child) in node.children.iter().enumerate() {
        if let Some(child) = child {
            let child_bits = bits | ((i as u128) << (127 - len));
            if !walk(child, child_bits, len + 1, is_v4, false, visit) {
                return false;
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> IpNet {
        s.parse().expect("valid test prefix")
    }

    fn collect_descendants(trie: &PrefixTrieMap<()>, cluster: u32, parent: &str) -> Vec<String> {
        let mut out = Vec::new();
        trie.descendants(cluster, net(parent), |p, _| {
            out.push(p.to_string());
            true
        });
        out.sort();
        out
    }

    fn collect_ancestors(trie: &PrefixTrieMap<()>, cluster: u32, prefix: &str) -> Vec<String> {
        let mut out = Vec::new();
        trie.ancestors(cluster, net(prefix), |p, _| {
            out.push(p.to_string());
            true
        });
        out
    }

    #[test]
    fn descendants_are_strictly_contained() {
        let mut trie = PrefixTrieMap::default();
        trie.upsert(0, net("10.0.0.0/8"), ());
        trie.upsert(0, net("10.1.0.0/16"), ());
        trie.upsert(0, net("10.1.1.0/24"), ());
        trie.upsert(0, net("10.1.1.1/32"), ());
        trie.upsert(0, net("192.168.0.0/16"), ());

        assert_eq!(
            collect_descendants(&trie, 0, "10.1.0.0/16"),
            vec!["10.1.1.0/24", "10.1.1.1/32"],
        );
        // The parent itself is not included even when stored.
        assert_eq!(
            collect_descendants(&trie, 0, "10.0.0.0/8"),
            vec!["10.1.0.0/16", "10.1.1.0/24", "10.1.1.1/32"],
        );
    }

    #[test]
    fn host_route_descends_only_to_itself() {
        let mut trie = PrefixTrieMap::default();
        trie.upsert(0, net("10.1.1.1/32"), ());
        assert_eq!(
            collect_descendants(&trie, 0, "10.1.1.1/32"),
            vec!["10.1.1.1/32"],
        );
        assert!(collect_descendants(&trie, 0, "10.1.1.2/32").is_empty());
    }

    #[test]
    fn ancestors_longest_first() {
        let mut trie = PrefixTrieMap::default();
        trie.upsert(0, net("0.0.0.0/0"), ());
        trie.upsert(0, net("10.0.0.0/8"), ());
        trie.upsert(0, net("10.1.0.0/16"), ());
        trie.upsert(0, net("10.1.1.0/24"), ());

        assert_eq!(
            collect_ancestors(&trie, 0, "10.1.1.0/24"),
            vec!["10.1.0.0/16", "10.0.0.0/8", "0.0.0.0/0"],
        );
    }

    #[test]
    fn ancestors_visit_can_stop_early() {
        let mut trie = PrefixTrieMap::default();
        trie.upsert(0, net("10.0.0.0/8"), ());
        trie.upsert(0, net("10.1.0.0/16"), ());

        let mut seen = Vec::new();
        trie.ancestors(0, net("10.1.1.0/24"), |p, _| {
            seen.push(p.to_string());
            false
        });
        assert_eq!(seen, vec!["10.1.0.0/16"]);
    }

    #[test]
    fn delete_is_idempotent() {
        let mut trie = PrefixTrieMap::default();
        trie.upsert(0, net("10.0.0.0/8"), ());
        trie.delete(0, net("10.0.0.0/8"));
        trie.delete(0, net("10.0.0.0/8"));
        trie.delete(0, net("172.16.0.0/12"));
        assert!(collect_descendants(&trie, 0, "0.0.0.0/0").is_empty());
    }

    #[test]
    fn clusters_are_isolated() {
        let mut trie = PrefixTrieMap::default();
        trie.upsert(0, net("10.1.0.0/16"), ());
        trie.upsert(7, net("10.2.0.0/16"), ());

        assert_eq!(
            collect_descendants(&trie, 0, "10.0.0.0/8"),
            vec!["10.1.0.0/16"],
        );
        assert_eq!(
            collect_descendants(&trie, 7, "10.0.0.0/8"),
            vec!["10.2.0.0/16"],
        );
    }

    #[test]
    fn families_are_isolated() {
        let mut trie = PrefixTrieMap::default();
        trie.upsert(0, net("10.0.0.0/8"), ());
        trie.upsert(0, net("2001:db8::/32"), ());

        assert_eq!(
            collect_descendants(&trie, 0, "::/0"),
            vec!["2001:db8::/32"],
        );
        assert_eq!(collect_ancestors(&trie, 0, "2001:db8::1/128"), vec![
            "2001:db8::/32"
        ]);
    }
}
