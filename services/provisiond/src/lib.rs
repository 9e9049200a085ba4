//! Workload provisioning engine for grid nodes.
//!
//! `provisiond` runs on every node of the grid. It consumes workload
//! reservations from one or more sources, applies them to the local machine
//! through per-kind handlers, records accepted workloads in a crash-safe
//! on-disk store, and reconciles host state against the reservation record:
//! resources whose reservation has vanished or been flagged for deletion are
//! garbage-collected by the janitor.
//!
//! ## Architecture
//!
//! ```text
//! Source ──events──▶ Engine ──▶ Primitives dispatcher ──▶ per-kind Handler
//!                      │                                        │
//!                      │ persist/remove                         │ result
//!                      ▼                                        ▼
//!                   FsStore ◀──lookup── Janitor ──▶ HostInventory
//! ```
//!
//! The engine is the single writer: the store and the dedup cache are
//! mutated only from its loop. The janitor runs inline from that loop on the
//! midnight tick, once historical replay has drained.
//!
//! ## Modules
//!
//! - `engine`: the single-writer event loop
//! - `storage`: versioned filesystem reservation store
//! - `counters`: live workload and resource-unit tallies
//! - `provisioner`: dispatch to per-kind handlers, result signing
//! - `janitor`: host resource reconciliation
//! - `source`: reservation event sources (fifo, http, combined)
//! - `dedup`: TTL cache collapsing source replays

pub mod config;
pub mod counters;
pub mod dedup;
pub mod engine;
pub mod feedback;
pub mod janitor;
pub mod provisioner;
pub mod source;
pub mod storage;

pub use config::Config;
pub use engine::{Engine, EngineOptions};
pub use storage::FsStore;
