use ipnet::{IpNet, Ipv4Net};
use std::fmt;
use std::str::FromStr;

/// The local cluster.
pub const LOCAL_CLUSTER_ID: u32 = 0;

/// An IP prefix scoped to a cluster. This is the cache key of the metadata
/// layer; cluster-mesh members contribute prefixes under their own cluster ID.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PrefixCluster {
    prefix: IpNet,
    cluster_id: u32,
}

impl PrefixCluster {
    pub fn new(prefix: IpNet, cluster_id: u32) -> Self {
        Self { prefix, cluster_id }
    }

    /// A prefix in the local cluster.
    pub fn local(prefix: IpNet) -> Self {
        Self::new(prefix, LOCAL_CLUSTER_ID)
    }

    pub fn prefix(&self) -> IpNet {
        self.prefix
    }

    pub fn cluster_id(&self) -> u32 {
        self.cluster_id
    }

    /// Whether the prefix is a single address (`/32` or `/128`).
    pub fn is_host_route(&self) -> bool {
        self.prefix.prefix_len() == self.prefix.max_prefix_len()
    }

    /// The canonical form used for all map and trie lookups: host bits are
    /// zeroed and IPv4-mapped IPv6 prefixes are unmapped to their IPv4
    /// equivalent.
    pub fn canonical(&self) -> Self {
        let prefix = match self.prefix {
            IpNet::V6(v6) if v6.prefix_len() >= 96 => match v6.addr().to_ipv4_mapped() {
                Some(v4) => Ipv4Net::new(v4, v6.prefix_len() - 96)
                    .map(IpNet::V4)
                    .unwrap_or(self.prefix),
                None => self.prefix,
            },
            other => other,
        };
        Self {
            prefix: prefix.trunc(),
            cluster_id: self.cluster_id,
        }
    }
}

impl From<IpNet> for PrefixCluster {
    fn from(prefix: IpNet) -> Self {
        Self::local(prefix)
    }
}

impl fmt::Display for PrefixCluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.cluster_id == LOCAL_CLUSTER_ID {
            write!(f, "{}", self.prefix)
        } else {
            write!(f, "{}@{}", self.prefix, self.cluster_id)
        }
    }
}

impl FromStr for PrefixCluster {
    type Err = PrefixClusterParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (prefix, cluster) = match s.split_once('@') {
            Some((p, c)) => (
                p,
                c.parse::<u32>()
                    .map_err(|_| PrefixClusterParseError(s.to_string()))?,
            ),
            None => (s, LOCAL_CLUSTER_ID),
        };
        let prefix = prefix
            .parse::<IpNet>()
            .map_err(|_| PrefixClusterParseError(s.to_string()))?;
        Ok(Self::new(prefix, cluster))
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid prefix cluster: {0}")]
pub struct PrefixClusterParseError(String);
