use std::fmt;

/// Provenance of an ipcache contribution.
///
/// Sources form a total order expressing precedence. When two writers disagree
/// about an attribute of the same prefix, the contribution from the
/// higher-precedence source wins; equal precedence retains the first writer.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Source {
    /// No source specified.
    #[default]
    Unspec,

    /// Derived from other information, e.g. a DNS response.
    Generated,

    /// Propagated through the key-value store.
    KVStore,

    /// Declared by a custom resource (e.g. a CIDR group).
    CustomResource,

    /// Discovered locally on this node.
    Local,

    /// Pertains to the kube-apiserver entity; outranks everything else.
    KubeApiServer,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Unspec => "unspec",
            Source::Generated => "generated",
            Source::KVStore => "kvstore",
            Source::CustomResource => "custom-resource",
            Source::Local => "local",
            Source::KubeApiServer => "kube-apiserver",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether an entry from `new` is permitted to replace an entry from
/// `existing`.
pub fn allows_overwrite(existing: Source, new: Source) -> bool {
    new >= existing
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precedence_order() {
        assert!(Source::KubeApiServer > Source::Local);
        assert!(Source::Local > Source::CustomResource);
        assert!(Source::CustomResource > Source::KVStore);
        assert!(Source::KVStore > Source::Generated);
        assert!(Source::Generated > Source::Unspec);
    }

    #[test]
    fn overwrite_requires_equal_or_higher_precedence() {
        assert!(allows_overwrite(Source::KVStore, Source::KVStore));
        assert!(allows_overwrite(Source::KVStore, Source::Local));
        assert!(!allows_overwrite(Source::Local, Source::KVStore));
    }
}
