//! Types for parsing ecaggregate configuration files.
//!
//! The top level config type is [`Config`]. After validation it is turned into a
//! [`Topology`], the set of cluster and mapping descriptors the updater and servers are
//! built from.
//!
//! ```yaml
//! clusters:
//!   - name: sessions
//!     endpoint: sessions.abc123.cfg.use1.cache.amazonaws.com:11211
//!     version: 1.4.14
//! mappings:
//!   - name: web
//!     listenAddress: 127.0.0.1:21211
//!     clusters: [sessions]
//! updateInterval: 30s
//! ```

use std::{
    collections::{HashMap, HashSet},
    error::Error,
    fmt::Display,
    fs, io,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{
    cluster::{Cluster, ClusterError},
    mapping::Mapping,
};

/// The top level config type.
///
/// Keys that are not known are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// The upstream configuration endpoints to poll.
    pub clusters: Vec<ClusterConfig>,
    /// The listeners to serve, each with the clusters it aggregates.
    pub mappings: Vec<MappingConfig>,
    /// Pause between two refresh passes, e.g. `30s` or `1m`.
    #[serde(with = "humantime_serde")]
    pub update_interval: Duration,
}

/// A single upstream cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub name: String,
    /// `host:port` of the cluster's configuration endpoint.
    pub endpoint: String,
    /// Engine version of the cluster, which determines the command used to poll it.
    pub version: String,
}

/// A single downstream listener.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingConfig {
    pub name: String,
    pub listen_address: String,
    /// Names of the clusters whose nodes are served, in response order.
    pub clusters: Vec<String>,
}

/// Validated descriptors built from a [`Config`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub clusters: Vec<Cluster>,
    /// Mappings in configuration order.
    pub mappings: Vec<Mapping>,
    pub update_interval: Duration,
}

impl Config {
    /// Reads and parses the config file at the given path.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        Self::from_yaml_str(&contents)
    }

    pub fn from_yaml_str(contents: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(contents).map_err(ConfigError::Parse)
    }

    /// Validates the config and resolves all cluster and mapping addresses.
    pub fn build(&self) -> Result<Topology, ConfigError> {
        if self.clusters.is_empty() {
            return Err(ConfigError::NoClusters);
        }
        if self.mappings.is_empty() {
            return Err(ConfigError::NoMappings);
        }

        let mut cluster_names = HashSet::new();
        let mut clusters = Vec::with_capacity(self.clusters.len());
        for cluster in &self.clusters {
            if !cluster_names.insert(cluster.name.as_str()) {
                return Err(ConfigError::DuplicateCluster(cluster.name.clone()));
            }
            let descriptor = Cluster::new(&*cluster.name, &cluster.endpoint, &cluster.version)
                .map_err(|source| ConfigError::Cluster {
                    name: cluster.name.clone(),
                    source,
                })?;
            clusters.push(descriptor);
        }

        let mut mapping_names = HashSet::new();
        let mut listen_addresses: HashMap<SocketAddr, &str> = HashMap::new();
        let mut mappings = Vec::with_capacity(self.mappings.len());
        for mapping in &self.mappings {
            if !mapping_names.insert(mapping.name.as_str()) {
                return Err(ConfigError::DuplicateMapping(mapping.name.clone()));
            }
            if mapping.clusters.is_empty() {
                return Err(ConfigError::EmptyMapping(mapping.name.clone()));
            }
            if let Some(unknown) = mapping
                .clusters
                .iter()
                .find(|name| !cluster_names.contains(name.as_str()))
            {
                return Err(ConfigError::UnknownCluster {
                    mapping: mapping.name.clone(),
                    cluster: unknown.clone(),
                });
            }

            let descriptor = Mapping::new(
                &*mapping.name,
                &mapping.listen_address,
                mapping.clusters.clone(),
            )
            .map_err(|source| ConfigError::Mapping {
                name: mapping.name.clone(),
                source,
            })?;

            if let Some(existing) =
                listen_addresses.insert(descriptor.listen_address(), &mapping.name)
            {
                return Err(ConfigError::DuplicateListenAddress {
                    mapping: mapping.name.clone(),
                    existing: existing.to_owned(),
                    address: descriptor.listen_address(),
                });
            }
            mappings.push(descriptor);
        }

        Ok(Topology {
            clusters,
            mappings,
            update_interval: self.update_interval,
        })
    }
}

/// Errors in the configuration file.
#[derive(Debug)]
pub enum ConfigError {
    /// The config file could not be read.
    Read { path: PathBuf, source: io::Error },
    /// The config file is not valid YAML or misses required entries.
    Parse(serde_yaml::Error),
    NoClusters,
    NoMappings,
    DuplicateCluster(String),
    DuplicateMapping(String),
    /// A mapping does not list any cluster.
    EmptyMapping(String),
    /// A mapping references a cluster that is not configured.
    UnknownCluster { mapping: String, cluster: String },
    /// Two mappings resolve to the same listen address.
    DuplicateListenAddress {
        mapping: String,
        existing: String,
        address: SocketAddr,
    },
    Cluster { name: String, source: ClusterError },
    Mapping { name: String, source: ClusterError },
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Read { path, .. } => {
                write!(f, "failed to read configuration file `{}`", path.display())
            }
            Self::Parse(_) => write!(f, "failed to parse configuration file"),
            Self::NoClusters => write!(f, "'clusters' must list at least one cluster"),
            Self::NoMappings => write!(f, "'mappings' must list at least one mapping"),
            Self::DuplicateCluster(name) => write!(f, "duplicate cluster found for '{}'", name),
            Self::DuplicateMapping(name) => write!(f, "duplicate mapping found for '{}'", name),
            Self::EmptyMapping(name) => write!(f, "mapping '{}' has no clusters", name),
            Self::UnknownCluster { mapping, cluster } => write!(
                f,
                "mapping '{}' references non-existent cluster '{}'",
                mapping, cluster
            ),
            Self::DuplicateListenAddress {
                mapping,
                existing,
                address,
            } => write!(
                f,
                "mapping '{}' has same listen address '{}' as existing mapping '{}'",
                mapping, address, existing
            ),
            Self::Cluster { name, .. } => write!(f, "invalid cluster '{}'", name),
            Self::Mapping { name, .. } => write!(f, "invalid mapping '{}'", name),
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Read { source, .. } => Some(source),
            Self::Parse(err) => Some(err),
            Self::Cluster { source, .. } | Self::Mapping { source, .. } => Some(source),
            _ => None,
        }
    }
}
