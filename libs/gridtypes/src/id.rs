//! Workload identifiers.
//!
//! A workload id is two decimal integers joined by a hyphen: the global
//! reservation id followed by the workload index inside that reservation,
//! e.g. `1023-4`. The full string is globally unique and is used verbatim as
//! the primary key of the on-disk store and as the prefix of host resource
//! names (virtual disks, public-ip taps).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from parsing a workload id.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The id string is empty.
    #[error("workload id cannot be empty")]
    Empty,

    /// The id is missing the `-` separator.
    #[error("workload id missing '-' separator: {0}")]
    MissingSeparator(String),

    /// The reservation part is not a decimal integer.
    #[error("invalid reservation part in workload id: {0}")]
    InvalidReservationPart(String),

    /// The workload part is not a decimal integer.
    #[error("invalid workload part in workload id: {0}")]
    InvalidWorkloadPart(String),
}

/// A validated workload id of the shape `<reservation>-<workload>`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WorkloadId(String);

impl WorkloadId {
    /// Build an id from its two numeric parts.
    pub fn new(reservation: u64, workload: u64) -> Self {
        Self(format!("{reservation}-{workload}"))
    }

    /// Parse and validate an id string.
    pub fn parse(s: &str) -> Result<Self, IdError> {
        if s.is_empty() {
            return Err(IdError::Empty);
        }

        let (reservation, workload) = match s.split_once('-') {
            Some(parts) => parts,
            None => return Err(IdError::MissingSeparator(s.to_string())),
        };

        if reservation.is_empty() || reservation.bytes().any(|b| !b.is_ascii_digit()) {
            return Err(IdError::InvalidReservationPart(s.to_string()));
        }
        if workload.is_empty() || workload.bytes().any(|b| !b.is_ascii_digit()) {
            return Err(IdError::InvalidWorkloadPart(s.to_string()));
        }

        Ok(Self(s.to_string()))
    }

    /// Split into `(reservation, workload)` numeric parts.
    ///
    /// Splits at the first `-`; both halves are guaranteed decimal by
    /// construction.
    pub fn split(&self) -> (u64, u64) {
        let (reservation, workload) = self
            .0
            .split_once('-')
            .expect("validated on construction");
        (
            reservation.parse().expect("validated on construction"),
            workload.parse().expect("validated on construction"),
        )
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkloadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for WorkloadId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for WorkloadId {
    type Error = IdError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<WorkloadId> for String {
    fn from(id: WorkloadId) -> Self {
        id.0
    }
}
