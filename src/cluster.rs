//! Upstream cluster descriptors.

use std::{
    error::Error,
    fmt::Display,
    io,
    net::{Ipv4Addr, SocketAddr, ToSocketAddrs},
};

use semver::Version;

/// Engines older than this version only understand the legacy `get` command.
pub const CONFIG_GET_VERSION: Version = Version::new(1, 4, 14);

/// The request command that a cluster's configuration endpoint understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandVariant {
    /// `config get cluster`, supported since engine version 1.4.14.
    Modern,
    /// `get AmazonElastiCache:cluster`, for older engines.
    Legacy,
}

impl CommandVariant {
    /// Selects the command variant for the given engine version.
    pub fn for_version(version: &Version) -> Self {
        if *version < CONFIG_GET_VERSION {
            Self::Legacy
        } else {
            Self::Modern
        }
    }

    /// The command text, without line terminator.
    pub fn command(self) -> &'static str {
        match self {
            Self::Modern => "config get cluster",
            Self::Legacy => "get AmazonElastiCache:cluster",
        }
    }
}

/// A configuration endpoint that is polled for its current node list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cluster {
    name: String,
    address: SocketAddr,
    command: CommandVariant,
}

impl Cluster {
    /// Creates a cluster from its configured endpoint address and engine version.
    ///
    /// Fails if the address does not resolve or the version is not a valid semantic version.
    pub fn new(
        name: impl Into<String>,
        address: &str,
        version: &str,
    ) -> Result<Self, ClusterError> {
        let address = resolve_address(address)?;
        let version =
            Version::parse(version.trim()).map_err(|source| ClusterError::VersionParse {
                version: version.to_owned(),
                source,
            })?;

        Ok(Self {
            name: name.into(),
            address,
            command: CommandVariant::for_version(&version),
        })
    }

    /// The name of the cluster, used as the node cache key.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The resolved address of the configuration endpoint.
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// The command variant selected from the engine version.
    pub fn command(&self) -> CommandVariant {
        self.command
    }
}

/// Resolves `raw` (`host:port`) to the first socket address it maps to.
///
/// An empty host (`:port`) stands for all interfaces.
pub(crate) fn resolve_address(raw: &str) -> Result<SocketAddr, ClusterError> {
    let resolution_error = |source| ClusterError::AddressResolution {
        address: raw.to_owned(),
        source,
    };

    let unspecified;
    let target = match raw.strip_prefix(':') {
        Some(port) => {
            unspecified = format!("{}:{}", Ipv4Addr::UNSPECIFIED, port);
            unspecified.as_str()
        }
        None => raw,
    };

    target
        .to_socket_addrs()
        .map_err(resolution_error)?
        .next()
        .ok_or_else(|| {
            resolution_error(io::Error::new(
                io::ErrorKind::NotFound,
                "address resolved to no socket addresses",
            ))
        })
}

/// Errors that can occur while building cluster and mapping descriptors.
#[derive(Debug)]
pub enum ClusterError {
    /// The configured address could not be resolved.
    AddressResolution {
        /// The address as given in the configuration.
        address: String,
        /// The underlying resolution error.
        source: io::Error,
    },
    /// The configured engine version is not a valid semantic version.
    VersionParse {
        /// The version as given in the configuration.
        version: String,
        /// The underlying parse error.
        source: semver::Error,
    },
}

impl Display for ClusterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AddressResolution { address, .. } => {
                write!(f, "error parsing address `{}`", address)
            }
            Self::VersionParse { version, .. } => {
                write!(f, "error parsing cluster version `{}`", version)
            }
        }
    }
}

impl Error for ClusterError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::AddressResolution { source, .. } => Some(source),
            Self::VersionParse { source, .. } => Some(source),
        }
    }
}
