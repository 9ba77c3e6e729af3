//! Core building blocks of a partitioned pub/sub log broker.
//!
//! Three loosely coupled pieces share the cluster-metadata entities in
//! [`cluster`]:
//!
//! * [`placement`]: deterministic, optionally rack-aware assignment of
//!   partition replicas onto brokers,
//! * [`leadership`]: the election policies a controller runs when leaders
//!   fail, move, or shed load,
//! * [`client`]: a single-threaded, poll-driven network engine with
//!   per-connection pipelines and self-managed metadata refresh.
//!
//! [`admin`] and [`coordination`] are the thin persistence glue through
//! which placements reach the rest of the cluster.

pub mod admin;
pub mod client;
pub mod cluster;
pub mod config;
pub mod coordination;
pub mod leadership;
pub mod placement;
pub mod protocol;

pub type ProtocolError = protocol::error::Error;
