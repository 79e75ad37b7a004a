//! Certificate lifecycle and coordinated node-restart core of an
//! Elasticsearch operator.
//!
//! Three tightly coupled subsystems live here:
//!
//! - per-cluster certificate authorities, persisted and rotated through
//!   the object store ([`certificates`]),
//! - per-pod node certificates, signed from CSRs the node init containers
//!   serve over HTTP, together with each node's trust material
//!   ([`nodecerts`]),
//! - the coordinated full-cluster restart state machine, talking to each
//!   node's process manager over TLS rooted in the cluster's HTTP CA
//!   ([`restart`]).
//!
//! Everything is driven by periodic, idempotent reconciliation passes: the
//! surrounding runtime serializes passes per owning cluster, and all state
//! lives in the object store ([`client::ObjectStore`]), never in memory
//! across passes. X.509 primitives come from the companion
//! `elasticsearch-certs` crate.

pub mod certificates;
pub mod client;
pub mod duration;
pub mod elasticsearch;
pub mod events;
pub mod labels;
pub mod names;
pub mod nodecerts;
pub mod pods;
pub mod restart;

#[cfg(test)]
pub(crate) mod testing;

pub use duration::Duration;
