//! Downstream listener descriptors.

use std::net::SocketAddr;

use crate::cluster::{resolve_address, ClusterError};

/// A listen address together with the clusters whose nodes are served on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mapping {
    name: String,
    listen_address: SocketAddr,
    cluster_names: Vec<String>,
}

impl Mapping {
    /// Creates a mapping, resolving the listen address.
    ///
    /// The cluster names are kept in the given order. Checking that they refer to configured
    /// clusters is up to the caller.
    pub fn new(
        name: impl Into<String>,
        listen_address: &str,
        cluster_names: Vec<String>,
    ) -> Result<Self, ClusterError> {
        Ok(Self {
            name: name.into(),
            listen_address: resolve_address(listen_address)?,
            cluster_names,
        })
    }

    /// The name of the mapping, used in log messages.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn listen_address(&self) -> SocketAddr {
        self.listen_address
    }

    /// The clusters to aggregate, in response order.
    pub fn cluster_names(&self) -> &[String] {
        &self.cluster_names
    }
}
