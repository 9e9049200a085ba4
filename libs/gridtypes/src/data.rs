//! Typed per-kind workload payloads.
//!
//! The `data` blob on a [`crate::Workload`] is opaque to the engine; only the
//! matching handler and the resource accounting below look inside it. The
//! structs here mirror what the grid actually sends for each kind, trimmed to
//! the fields the node cares about.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::workload::{Workload, WorkloadType};

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

/// Disk class a storage payload lands on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Ssd,
    Hdd,
}

/// Volume payload. `size` is in GiB.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Volume {
    pub size: u64,
    #[serde(rename = "type")]
    pub kind: DeviceType,
}

/// 0-db namespace payload. `size` is in GiB.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Zdb {
    pub size: u64,
    pub disk_type: DeviceType,
    #[serde(default)]
    pub mode: String,
    #[serde(default)]
    pub public: bool,
}

/// Compute and rootfs capacity of a container. `memory` and `disk_size`
/// are in MiB.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerCapacity {
    pub cpu: u64,
    pub memory: u64,
    pub disk_type: DeviceType,
    pub disk_size: u64,
}

/// A volume mounted into a container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mount {
    pub volume_id: String,
    pub mountpoint: String,
}

/// Network membership of a container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Member {
    pub network_id: String,
    #[serde(default)]
    pub ips: Vec<IpAddr>,
}

/// Container payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Container {
    pub flist: String,
    #[serde(default)]
    pub entrypoint: String,
    #[serde(default)]
    pub env: std::collections::BTreeMap<String, String>,
    #[serde(default)]
    pub mounts: Vec<Mount>,
    pub network: Member,
    pub capacity: ContainerCapacity,
}

/// Kubernetes VM payload. `size` selects a fixed cpu/memory/disk shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Kubernetes {
    pub size: u8,
    pub network_id: String,
    pub ip: IpAddr,
    #[serde(default)]
    pub cluster_secret: String,
    #[serde(default)]
    pub ssh_keys: Vec<String>,
}

/// Public IPv4 payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicIp {
    pub ip: String,
}

/// Overlay network payload, trimmed to what the store needs to derive the
/// secondary key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Network {
    pub name: String,
    #[serde(default)]
    pub ip_range: String,
}

/// Errors from interpreting a workload payload.
#[derive(Debug, Error)]
pub enum DataError {
    #[error("malformed {kind} payload: {source}")]
    Malformed {
        kind: WorkloadType,
        #[source]
        source: serde_json::Error,
    },

    #[error("unsupported kubernetes vm size {0}")]
    UnsupportedVmSize(u8),
}

/// Aggregate resource units a workload occupies on the node.
///
/// CRU counts virtual cores; MRU, SRU and HRU are bytes of memory, ssd and
/// hdd capacity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceUnits {
    pub cru: u64,
    pub mru: u64,
    pub sru: u64,
    pub hru: u64,
}

impl ResourceUnits {
    /// Units declared by a workload, derived from its payload.
    ///
    /// Networks and public IPs occupy no counted capacity.
    pub fn of(workload: &Workload) -> Result<Self, DataError> {
        match workload.kind {
            WorkloadType::Volume => {
                let volume: Volume = decode(workload)?;
                Ok(storage_units(volume.size * GIB, volume.kind))
            }
            WorkloadType::Zdb => {
                let zdb: Zdb = decode(workload)?;
                Ok(storage_units(zdb.size * GIB, zdb.disk_type))
            }
            WorkloadType::Container => {
                let container: Container = decode(workload)?;
                let capacity = container.capacity;
                Ok(ResourceUnits {
                    cru: capacity.cpu,
                    mru: capacity.memory * MIB,
                    // container root fs is always ssd-backed
                    sru: capacity.disk_size * MIB,
                    hru: 0,
                })
            }
            WorkloadType::Kubernetes => {
                let vm: Kubernetes = decode(workload)?;
                match vm.size {
                    1 => Ok(ResourceUnits {
                        cru: 1,
                        mru: 2 * GIB,
                        sru: 50 * GIB,
                        hru: 0,
                    }),
                    2 => Ok(ResourceUnits {
                        cru: 2,
                        mru: 4 * GIB,
                        sru: 100 * GIB,
                        hru: 0,
                    }),
                    size => Err(DataError::UnsupportedVmSize(size)),
                }
            }
            WorkloadType::Network | WorkloadType::PublicIp => Ok(ResourceUnits::default()),
        }
    }
}

fn storage_units(bytes: u64, device: DeviceType) -> ResourceUnits {
    match device {
        DeviceType::Ssd => ResourceUnits {
            sru: bytes,
            ..Default::default()
        },
        DeviceType::Hdd => ResourceUnits {
            hru: bytes,
            ..Default::default()
        },
    }
}

fn decode<T: serde::de::DeserializeOwned>(workload: &Workload) -> Result<T, DataError> {
    serde_json::from_value(workload.data.clone()).map_err(|source| DataError::Malformed {
        kind: workload.kind,
        source,
    })
}
