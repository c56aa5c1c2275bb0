//! Aggregates the auto-discovery node lists of several ElastiCache (memcached) clusters and
//! re-serves merged views of them over the same `config get cluster` protocol.
//!
//! ## Usage Example
//!
//! Write a config file listing the clusters to poll and the listeners to serve (see
//! [`config`] for the format), then run:
//!
//! ```text
//! cargo run --bin ecaggregate -- --conf ecaggregate.yml
//! ```
//!
//! Each mapping's listener answers `config get cluster` with the nodes of all its clusters,
//! so memcached clients with auto discovery support can be pointed at it like at a regular
//! configuration endpoint.
//!
//! ## Structure
//!
//! A single [`Updater`] polls every [cluster](Cluster) in the background and caches the
//! reported node lists. One [`Server`] per [mapping](Mapping) periodically merges the cached
//! lists of its clusters and hands the framed result to every client that asks for it.

pub use cluster::{Cluster, ClusterError, CommandVariant};
pub use config::{Config, ConfigError, Topology};
pub use mapping::Mapping;
pub use server::{BindError, Server, ServerHandle};
pub use updater::{NotFound, PollError, Updater};

pub mod cluster;
pub mod codec;
pub mod config;
pub mod mapping;
pub mod server;
pub mod updater;
