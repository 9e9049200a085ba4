//! The workload envelope and its closed type set.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::id::WorkloadId;

/// The closed set of workload kinds.
///
/// Adding a kind here is deliberately a breaking change: every dispatch site
/// matches exhaustively, so the compiler walks you to each place that needs
/// to learn about it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkloadType {
    Container,
    Volume,
    Network,
    Zdb,
    Kubernetes,
    /// Public IPv4 attachment. Spelled `ipv4` on the wire.
    #[serde(rename = "ipv4")]
    PublicIp,
}

impl WorkloadType {
    /// All kinds, in a stable order.
    pub const ALL: [WorkloadType; 6] = [
        WorkloadType::Container,
        WorkloadType::Volume,
        WorkloadType::Network,
        WorkloadType::Zdb,
        WorkloadType::Kubernetes,
        WorkloadType::PublicIp,
    ];

    /// Stable name used for index directories and log fields.
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkloadType::Container => "container",
            WorkloadType::Volume => "volume",
            WorkloadType::Network => "network",
            WorkloadType::Zdb => "zdb",
            WorkloadType::Kubernetes => "kubernetes",
            WorkloadType::PublicIp => "ipv4",
        }
    }
}

impl fmt::Display for WorkloadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Free-form key/value markers used for debugging only.
///
/// Tags never travel on the wire and never reach the store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tag(pub BTreeMap<String, String>);

impl Tag {
    pub fn single(key: &str, value: &str) -> Self {
        let mut map = BTreeMap::new();
        map.insert(key.to_string(), value.to_string());
        Self(map)
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (k, v) in &self.0 {
            if !first {
                f.write_str(", ")?;
            }
            write!(f, "{k}: {v}")?;
            first = false;
        }
        Ok(())
    }
}

/// Why a workload failed validation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("workload {0} has no duration")]
    NoDuration(WorkloadId),

    #[error("workload {0} has a zero creation date")]
    ZeroCreated(WorkloadId),

    #[error("workload {0} has expired")]
    Expired(WorkloadId),
}

/// A declarative request to deploy one workload on this node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workload {
    /// Globally unique id of this workload.
    pub id: WorkloadId,

    /// Identity of the user that requested the workload.
    #[serde(rename = "user_id")]
    pub user: String,

    /// Kind of the workload. Decides which handler applies it.
    #[serde(rename = "type")]
    pub kind: WorkloadType,

    /// Kind-specific payload, interpreted only by the matching handler.
    #[serde(default)]
    pub data: serde_json::Value,

    /// When the workload was accepted by the grid.
    pub created: DateTime<Utc>,

    /// How long the workload lives past `created`, in seconds.
    #[serde(with = "duration_secs")]
    pub duration: Duration,

    /// Set when the owner asked for the workload to go away before expiry.
    #[serde(default)]
    pub to_delete: bool,

    /// Signature over the request, verified upstream before the engine
    /// ever sees the workload.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub signature: String,

    /// Debug markers. Never serialized.
    #[serde(skip)]
    pub tag: Tag,
}

impl Workload {
    /// The absolute expiry instant. Saturates on overflow.
    pub fn expiry(&self) -> DateTime<Utc> {
        chrono::Duration::from_std(self.duration)
            .ok()
            .and_then(|d| self.created.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Whether the workload is past its expiry at `now`.
    pub fn expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expiry()
    }

    /// Validate the workload for provisioning.
    ///
    /// A workload is valid iff it has a positive duration, a non-zero
    /// creation date, and has not expired. The kind is closed by
    /// construction.
    pub fn validate(&self, now: DateTime<Utc>) -> Result<(), ValidationError> {
        if self.duration.is_zero() {
            return Err(ValidationError::NoDuration(self.id.clone()));
        }

        if self.created.timestamp() == 0 {
            return Err(ValidationError::ZeroCreated(self.id.clone()));
        }

        if self.expired(now) {
            return Err(ValidationError::Expired(self.id.clone()));
        }

        Ok(())
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
