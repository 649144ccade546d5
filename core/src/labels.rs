use ipnet::IpNet;
use std::collections::BTreeMap;
use std::fmt;

/// Origin namespace of a label key.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LabelSource {
    #[default]
    Unspec,
    K8s,
    Reserved,
    Cidr,
    Fqdn,
    CidrGroup,
    Node,
}

impl LabelSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            LabelSource::Unspec => "unspec",
            LabelSource::K8s => "k8s",
            LabelSource::Reserved => "reserved",
            LabelSource::Cidr => "cidr",
            LabelSource::Fqdn => "fqdn",
            LabelSource::CidrGroup => "cidrgroup",
            LabelSource::Node => "node",
        }
    }
}

impl fmt::Display for LabelSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub const LABEL_KEY_HOST: &str = "host";
pub const LABEL_KEY_WORLD: &str = "world";
pub const LABEL_KEY_WORLD_IPV4: &str = "world-ipv4";
pub const LABEL_KEY_WORLD_IPV6: &str = "world-ipv6";
pub const LABEL_KEY_REMOTE_NODE: &str = "remote-node";
pub const LABEL_KEY_HEALTH: &str = "health";
pub const LABEL_KEY_INGRESS: &str = "ingress";
pub const LABEL_KEY_KUBE_APISERVER: &str = "kube-apiserver";

/// A single source-tagged label.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Label {
    pub source: LabelSource,
    pub key: String,
    pub value: String,
}

impl Label {
    pub fn new(
        source: LabelSource,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            source,
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn k8s(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(LabelSource::K8s, key, value)
    }

    pub fn node(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(LabelSource::Node, key, value)
    }

    fn reserved(key: &str) -> Self {
        Self::new(LabelSource::Reserved, key, "")
    }

    pub fn host() -> Self {
        Self::reserved(LABEL_KEY_HOST)
    }

    pub fn world() -> Self {
        Self::reserved(LABEL_KEY_WORLD)
    }

    pub fn world_ipv4() -> Self {
        Self::reserved(LABEL_KEY_WORLD_IPV4)
    }

    pub fn world_ipv6() -> Self {
        Self::reserved(LABEL_KEY_WORLD_IPV6)
    }

    pub fn remote_node() -> Self {
        Self::reserved(LABEL_KEY_REMOTE_NODE)
    }

    pub fn health() -> Self {
        Self::reserved(LABEL_KEY_HEALTH)
    }

    pub fn ingress() -> Self {
        Self::reserved(LABEL_KEY_INGRESS)
    }

    pub fn kube_apiserver() -> Self {
        Self::reserved(LABEL_KEY_KUBE_APISERVER)
    }

    /// The `cidr:<prefix>` label for a network prefix.
    pub fn cidr(net: IpNet) -> Self {
        Self::new(LabelSource::Cidr, net.to_string(), "")
    }

    fn is_reserved(&self, key: &str) -> bool {
        self.source == LabelSource::Reserved && self.key == key
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.value.is_empty() {
            write!(f, "{}:{}", self.source, self.key)
        } else {
            write!(f, "{}:{}={}", self.source, self.key, self.value)
        }
    }
}

/// A set of labels, keyed by label key.
///
/// Iteration order is the key order, which keeps merge tiebreaks and
/// serialized forms deterministic.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Labels(BTreeMap<String, Label>);

impl Labels {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Label> {
        self.0.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Whether the set contains this exact label.
    pub fn contains(&self, label: &Label) -> bool {
        self.0.get(&label.key) == Some(label)
    }

    /// Whether every label in `other` is present in this set.
    pub fn contains_all(&self, other: &Labels) -> bool {
        other.iter().all(|l| self.contains(l))
    }

    /// Inserts a label, replacing any previous label with the same key.
    /// Returns whether the set changed.
    pub fn insert(&mut self, label: Label) -> bool {
        match self.0.get(&label.key) {
            Some(existing) if *existing == label => false,
            _ => {
                self.0.insert(label.key.clone(), label);
                true
            }
        }
    }

    /// Inserts a label only if its key is absent. Returns whether the label
    /// was inserted.
    pub fn insert_if_absent(&mut self, label: Label) -> bool {
        if self.0.contains_key(&label.key) {
            return false;
        }
        self.0.insert(label.key.clone(), label);
        true
    }

    /// Merges `other` into this set, overwriting labels with equal keys.
    /// Returns whether the set changed.
    pub fn merge(&mut self, other: &Labels) -> bool {
        let mut changed = false;
        for label in other.iter() {
            changed |= self.insert(label.clone());
        }
        changed
    }

    pub fn remove(&mut self, key: &str) -> Option<Label> {
        self.0.remove(key)
    }

    /// Removes every label in `other` (matched by key) from this set.
    /// Returns whether the set changed.
    pub fn remove_all(&mut self, other: &Labels) -> bool {
        let mut changed = false;
        for label in other.iter() {
            changed |= self.0.remove(&label.key).is_some();
        }
        changed
    }

    /// Removes all labels carrying the given source.
    pub fn remove_from_source(&mut self, source: LabelSource) {
        self.0.retain(|_, l| l.source != source);
    }

    pub fn has_source(&self, source: LabelSource) -> bool {
        self.iter().any(|l| l.source == source)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Label> {
        self.0.values()
    }

    pub fn has_host_label(&self) -> bool {
        self.iter().any(|l| l.is_reserved(LABEL_KEY_HOST))
    }

    pub fn has_remote_node_label(&self) -> bool {
        self.iter().any(|l| l.is_reserved(LABEL_KEY_REMOTE_NODE))
    }

    pub fn has_health_label(&self) -> bool {
        self.iter().any(|l| l.is_reserved(LABEL_KEY_HEALTH))
    }

    pub fn has_ingress_label(&self) -> bool {
        self.iter().any(|l| l.is_reserved(LABEL_KEY_INGRESS))
    }

    pub fn has_kube_apiserver_label(&self) -> bool {
        self.iter().any(|l| l.is_reserved(LABEL_KEY_KUBE_APISERVER))
    }

    /// Whether any `reserved:world*` label is present.
    pub fn has_world_label(&self) -> bool {
        self.iter().any(|l| {
            l.is_reserved(LABEL_KEY_WORLD)
                || l.is_reserved(LABEL_KEY_WORLD_IPV4)
                || l.is_reserved(LABEL_KEY_WORLD_IPV6)
        })
    }

    /// Adds the world label variant matching the prefix's address family.
    pub fn add_world_label(&mut self, net: IpNet) {
        let label = match net {
            IpNet::V4(_) => Label::world_ipv4(),
            IpNet::V6(_) => Label::world_ipv6(),
        };
        self.insert(label);
    }
}

impl FromIterator<Label> for Labels {
    fn from_iter<T: IntoIterator<Item = Label>>(iter: T) -> Self {
        let mut labels = Labels::new();
        for l in iter {
            labels.insert(l);
        }
        labels
    }
}

impl<const N: usize> From<[Label; N]> for Labels {
    fn from(arr: [Label; N]) -> Self {
        arr.into_iter().collect()
    }
}

impl IntoIterator for Labels {
    type Item = Label;
    type IntoIter = std::collections::btree_map::IntoValues<String, Label>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_values()
    }
}

impl fmt::Display for Labels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for label in self.iter() {
            if !first {
                f.write_str(",")?;
            }
            write!(f, "{}", label)?;
            first = false;
        }
        Ok(())
    }
}
