//! Network identity.
//!
//! An overlay network is owned by a user and named by that user; distinct
//! workloads referring to the same `(user, name)` pair must resolve to the
//! same network. The store therefore keys network workloads by this derived
//! id rather than by the workload id.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Derived identity of an overlay network: truncated sha256 over
/// `user:name`, hex-encoded.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NetworkId(String);

impl NetworkId {
    /// Compute the network id for a `(user, name)` pair.
    pub fn new(user: &str, name: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(user.as_bytes());
        hasher.update(b":");
        hasher.update(name.as_bytes());
        let digest = hasher.finalize();
        Self(hex::encode(&digest[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
