use crate::labels::{Label, Labels};
use std::fmt;

/// A numeric security identity.
///
/// Small values are reserved for well-known cluster entities; identities
/// derived from label sets are allocated from the local range.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NumericIdentity(pub u32);

impl NumericIdentity {
    pub const UNSPEC: Self = Self(0);
    pub const HOST: Self = Self(1);
    pub const WORLD: Self = Self(2);
    pub const HEALTH: Self = Self(4);
    pub const REMOTE_NODE: Self = Self(6);
    pub const KUBE_APISERVER: Self = Self(7);
    pub const INGRESS: Self = Self(8);
    pub const WORLD_IPV4: Self = Self(9);
    pub const WORLD_IPV6: Self = Self(10);

    /// First identity in the locally-allocated range.
    pub const LOCAL_BASE: Self = Self(0x0100_0000);

    pub fn is_reserved(&self) -> bool {
        self.0 < 256
    }
}

impl fmt::Display for NumericIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An allocated identity: a numeric ID plus the labels it stands for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identity {
    pub id: NumericIdentity,
    pub labels: Labels,

    /// For world-labeled prefixes, the `cidr:` label attached so that
    /// CIDR policies can select the identity.
    pub cidr_label: Option<Label>,
}

impl Identity {
    pub fn new(id: NumericIdentity, labels: Labels) -> Self {
        Self {
            id,
            labels,
            cidr_label: None,
        }
    }

    /// The complete label set pushed to policy selectors. The attached
    /// `cidr:` tag replaces any inherited `cidr:` label, so the selector view
    /// carries at most one, the one closest to the host.
    pub fn selector_labels(&self) -> Labels {
        let mut labels = self.labels.clone();
        if let Some(cidr) = &self.cidr_label {
            labels.remove_from_source(crate::labels::LabelSource::Cidr);
            labels.insert(cidr.clone());
        }
        labels
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_range() {
        assert!(NumericIdentity::HOST.is_reserved());
        assert!(NumericIdentity::WORLD_IPV6.is_reserved());
        assert!(!NumericIdentity::LOCAL_BASE.is_reserved());
    }

    #[test]
    fn selector_labels_include_cidr_tag() {
        let mut id = Identity::new(
            NumericIdentity(0x0100_0001),
            Labels::from([Label::world_ipv4()]),
        );
        id.cidr_label = Some(Label::cidr("10.0.0.1/32".parse().unwrap()));
        let labels = id.selector_labels();
        assert_eq!(labels.len(), 2);
        assert!(labels.contains_key("10.0.0.1/32"));
    }
}
