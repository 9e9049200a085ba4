//! Live workload and resource-unit tallies.
//!
//! The counter set answers "how many workloads of each kind, and how much
//! capacity, is provisioned right now" without touching the disk. It is
//! owned by the store: every mutation happens inside a store write, and the
//! rest of the daemon only ever sees read-only snapshots.

use std::sync::atomic::{AtomicI64, Ordering};

use plfm_gridtypes::{ResourceUnits, WorkloadType};
use serde::Serialize;

/// Atomic tallies per workload kind and per resource unit.
///
/// All operations are lock-free; readers may race writers and still observe
/// a consistent per-counter value.
#[derive(Debug, Default)]
pub struct Counters {
    containers: AtomicI64,
    volumes: AtomicI64,
    networks: AtomicI64,
    zdbs: AtomicI64,
    vms: AtomicI64,
    public_ips: AtomicI64,

    cru: AtomicI64,
    mru: AtomicI64,
    sru: AtomicI64,
    hru: AtomicI64,
}

impl Counters {
    fn for_kind(&self, kind: WorkloadType) -> &AtomicI64 {
        match kind {
            WorkloadType::Container => &self.containers,
            WorkloadType::Volume => &self.volumes,
            WorkloadType::Network => &self.networks,
            WorkloadType::Zdb => &self.zdbs,
            WorkloadType::Kubernetes => &self.vms,
            WorkloadType::PublicIp => &self.public_ips,
        }
    }

    /// Count one more workload of `kind`.
    pub fn increment(&self, kind: WorkloadType) {
        self.for_kind(kind).fetch_add(1, Ordering::Relaxed);
    }

    /// Count one workload of `kind` gone.
    pub fn decrement(&self, kind: WorkloadType) {
        self.for_kind(kind).fetch_sub(1, Ordering::Relaxed);
    }

    /// Current tally for `kind`.
    pub fn current(&self, kind: WorkloadType) -> i64 {
        self.for_kind(kind).load(Ordering::Relaxed)
    }

    /// Add a workload's declared units.
    pub fn add_units(&self, units: ResourceUnits) {
        self.cru.fetch_add(units.cru as i64, Ordering::Relaxed);
        self.mru.fetch_add(units.mru as i64, Ordering::Relaxed);
        self.sru.fetch_add(units.sru as i64, Ordering::Relaxed);
        self.hru.fetch_add(units.hru as i64, Ordering::Relaxed);
    }

    /// Remove a workload's declared units.
    pub fn remove_units(&self, units: ResourceUnits) {
        self.cru.fetch_sub(units.cru as i64, Ordering::Relaxed);
        self.mru.fetch_sub(units.mru as i64, Ordering::Relaxed);
        self.sru.fetch_sub(units.sru as i64, Ordering::Relaxed);
        self.hru.fetch_sub(units.hru as i64, Ordering::Relaxed);
    }

    /// Reset everything to zero. Used before a resync from disk.
    pub fn reset(&self) {
        for counter in [
            &self.containers,
            &self.volumes,
            &self.networks,
            &self.zdbs,
            &self.vms,
            &self.public_ips,
            &self.cru,
            &self.mru,
            &self.sru,
            &self.hru,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    /// A point-in-time copy of all tallies.
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            containers: self.containers.load(Ordering::Relaxed),
            volumes: self.volumes.load(Ordering::Relaxed),
            networks: self.networks.load(Ordering::Relaxed),
            zdbs: self.zdbs.load(Ordering::Relaxed),
            vms: self.vms.load(Ordering::Relaxed),
            public_ips: self.public_ips.load(Ordering::Relaxed),
            cru: self.cru.load(Ordering::Relaxed),
            mru: self.mru.load(Ordering::Relaxed),
            sru: self.sru.load(Ordering::Relaxed),
            hru: self.hru.load(Ordering::Relaxed),
        }
    }
}

/// Read-only view of the counter set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub containers: i64,
    pub volumes: i64,
    pub networks: i64,
    pub zdbs: i64,
    pub vms: i64,
    pub public_ips: i64,

    pub cru: i64,
    pub mru: i64,
    pub sru: i64,
    pub hru: i64,
}

impl CounterSnapshot {
    /// Tally for one kind.
    pub fn of(&self, kind: WorkloadType) -> i64 {
        match kind {
            WorkloadType::Container => self.containers,
            WorkloadType::Volume => self.volumes,
            WorkloadType::Network => self.networks,
            WorkloadType::Zdb => self.zdbs,
            WorkloadType::Kubernetes => self.vms,
            WorkloadType::PublicIp => self.public_ips,
        }
    }
}
