//! Provisioning outcomes reported back to the workload source.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::WorkloadId;
use crate::workload::WorkloadType;

/// Terminal state of a provision attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultState {
    Ok,
    Error,
    Deleted,
}

impl ResultState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultState::Ok => "ok",
            ResultState::Error => "error",
            ResultState::Deleted => "deleted",
        }
    }
}

/// The signed outcome of one provision attempt.
///
/// `error` is empty iff `state` is [`ResultState::Ok`]. `data` is produced by
/// the per-kind handler and only the source knows how to interpret it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadResult {
    pub id: WorkloadId,

    #[serde(rename = "type")]
    pub kind: WorkloadType,

    /// When this result was produced.
    pub created: DateTime<Utc>,

    pub state: ResultState,

    /// Error message when `state` is `error`, empty otherwise.
    #[serde(rename = "message", default)]
    pub error: String,

    /// Handler-produced payload.
    #[serde(default)]
    pub data: serde_json::Value,

    /// Hex signature over [`WorkloadResult::signable_bytes`].
    #[serde(default)]
    pub signature: String,
}

impl WorkloadResult {
    /// The byte string a signer commits to: `state ‖ error ‖ data`.
    pub fn signable_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(self.state.as_str().as_bytes());
        buf.extend_from_slice(self.error.as_bytes());
        buf.extend_from_slice(
            serde_json::to_vec(&self.data)
                .unwrap_or_default()
                .as_slice(),
        );
        buf
    }
}
