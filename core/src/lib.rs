//! Core types and collaborator interfaces for the ipcache metadata layer.
//!
//! This crate is deliberately dependency-light: it defines the label and
//! identity model shared by producers (watchers, node discovery, FQDN
//! resolution) and the consumers that program policy selectors and the
//! datapath, plus the traits those consumers implement.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod identity;
pub mod labels;
pub mod prefix;
pub mod resource;
pub mod source;

pub use self::identity::{Identity, NumericIdentity};
pub use self::labels::{Label, LabelSource, Labels};
pub use self::prefix::{PrefixCluster, LOCAL_CLUSTER_ID};
pub use self::resource::ResourceId;
pub use self::source::Source;
pub use ipnet::{IpNet, Ipv4Net, Ipv6Net};

use std::collections::BTreeMap;
use thiserror::Error;
use tokio::sync::{oneshot, watch};

#[derive(Debug, Error)]
pub enum AllocatorError {
    /// The local identity allocator has not been initialized yet.
    #[error("local identity allocator uninitialized")]
    Uninitialized,

    /// The allocator could not produce an identity for the label set.
    #[error("identity allocation failed: {0}")]
    Allocation(String),
}

/// Allocates and releases local numeric identities for label sets.
///
/// Allocation is reference-counted: every successful call takes a reference
/// on the returned identity, and the caller must eventually balance it with
/// `release_local_identities`.
pub trait IdentityAllocator: Send + Sync {
    /// Returns the identity for `labels`, allocating one if none exists.
    /// `preferred` requests a specific numeric ID for fresh allocations.
    /// The returned flag is true when the identity was newly allocated.
    fn allocate_local_identity(
        &self,
        labels: Labels,
        preferred: Option<NumericIdentity>,
    ) -> Result<(Identity, bool), AllocatorError>;

    /// Releases one reference per given identity and returns the identities
    /// whose reference count reached zero.
    fn release_local_identities(
        &self,
        ids: &[NumericIdentity],
    ) -> Result<Vec<NumericIdentity>, AllocatorError>;
}

/// Pushes identity additions and deletions to the policy selector layer.
pub trait IdentityUpdater: Send + Sync {
    /// Registers the given identities with policy selectors. The returned
    /// receiver resolves once the update is fully visible; the datapath must
    /// not reference a new identity before then.
    fn update_identities(
        &self,
        add: BTreeMap<NumericIdentity, Labels>,
        delete: BTreeMap<NumericIdentity, Labels>,
    ) -> oneshot::Receiver<()>;
}

/// One-shot signal that the external resource caches have synchronized.
///
/// Label injection holds off until the signal fires so that identities are
/// not churned while the initial state is still streaming in.
#[derive(Clone, Debug)]
pub struct CacheStatus {
    rx: watch::Receiver<bool>,
}

impl CacheStatus {
    /// Returns a sender half and the status handle. Send `true` once caches
    /// have synchronized; the signal is sticky.
    pub fn new() -> (watch::Sender<bool>, Self) {
        let (tx, rx) = watch::channel(false);
        (tx, Self { rx })
    }

    /// A status that reports synchronized from the start.
    pub fn ready() -> Self {
        let (_, rx) = watch::channel(true);
        Self { rx }
    }

    pub fn is_synchronized(&self) -> bool {
        *self.rx.borrow()
    }

    /// Waits until the caches report synchronized. Returns false if the
    /// sender was dropped before signalling.
    pub async fn synchronized(&self) -> bool {
        self.rx.clone().wait_for(|ready| *ready).await.is_ok()
    }
}
