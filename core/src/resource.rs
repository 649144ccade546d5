use std::fmt;

/// Identifies the writer of a metadata contribution, unique per contributor
/// (e.g. `pod/kube-system/coredns-1234`).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceId(String);

impl ResourceId {
    pub fn new(kind: &str, namespace: &str, name: &str) -> Self {
        if namespace.is_empty() {
            Self(format!("{}//{}", kind, name))
        } else {
            Self(format!("{}/{}/{}", kind, namespace, name))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ResourceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ResourceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
