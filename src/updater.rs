//! Background polling of the upstream configuration endpoints.
//!
//! The [`Updater`] owns the node cache. A single background task refreshes every configured
//! cluster once per pass and then sleeps for the refresh interval. Each cluster's entry is
//! replaced wholesale on a successful poll and left untouched on failure, so readers always
//! observe either the previous or the next complete node list.

use std::{
    collections::HashMap,
    error::Error,
    fmt::Display,
    io,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use arc_swap::ArcSwapOption;
use futures::{stream::FuturesUnordered, StreamExt};
use tokio::{
    io::{AsyncWriteExt, BufStream},
    net::TcpStream,
    task::JoinHandle,
};

use crate::{
    cluster::Cluster,
    codec::{self, FrameError, CRLF},
};

/// Upper bound for establishing a connection to a configuration endpoint.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Polls the configured clusters and caches their node lists.
pub struct Updater {
    clusters: HashMap<String, ClusterState>,
    refresh_interval: Duration,
}

/// Per-cluster cache entry.
struct ClusterState {
    cluster: Cluster,
    nodes: ArcSwapOption<Vec<String>>,
    consecutive_failures: AtomicU32,
}

impl Updater {
    /// Creates an updater for the given clusters. No entry is cached until the first
    /// successful poll.
    pub fn new(clusters: impl IntoIterator<Item = Cluster>, refresh_interval: Duration) -> Self {
        let clusters = clusters
            .into_iter()
            .map(|cluster| {
                let state = ClusterState {
                    cluster,
                    nodes: ArcSwapOption::empty(),
                    consecutive_failures: AtomicU32::new(0),
                };
                (state.cluster.name().to_owned(), state)
            })
            .collect();

        Self {
            clusters,
            refresh_interval,
        }
    }

    /// Spawns the refresh task.
    ///
    /// The task runs a full pass over all clusters, then sleeps for the refresh interval, so
    /// the interval is measured from the end of one pass to the start of the next.
    pub fn run(self: &Arc<Self>) -> JoinHandle<()> {
        let updater = self.clone();
        tokio::spawn(async move {
            loop {
                updater.refresh().await;
                tokio::time::sleep(updater.refresh_interval).await;
            }
        })
    }

    /// Runs a single refresh pass over all clusters.
    ///
    /// Clusters are polled concurrently; a failure for one cluster does not affect the others.
    pub async fn refresh(&self) {
        let mut polls: FuturesUnordered<_> = self
            .clusters
            .values()
            .map(|state| async move { (state, poll_cluster(&state.cluster).await) })
            .collect();

        while let Some((state, result)) = polls.next().await {
            state.record(result);
        }
    }

    /// Returns the most recently polled node list of the given cluster.
    pub fn nodes(&self, cluster_name: &str) -> Result<Arc<Vec<String>>, NotFound> {
        self.clusters
            .get(cluster_name)
            .and_then(|state| state.nodes.load_full())
            .ok_or_else(|| NotFound(cluster_name.to_owned()))
    }

    /// The number of polls of the given cluster that failed since its last successful one.
    ///
    /// Returns `None` for unknown clusters.
    pub fn consecutive_failures(&self, cluster_name: &str) -> Option<u32> {
        self.clusters
            .get(cluster_name)
            .map(|state| state.consecutive_failures.load(Ordering::Relaxed))
    }

    pub fn refresh_interval(&self) -> Duration {
        self.refresh_interval
    }

    #[cfg(test)]
    pub(crate) fn store_nodes(&self, cluster_name: &str, nodes: Vec<String>) {
        if let Some(state) = self.clusters.get(cluster_name) {
            state.record(Ok(nodes));
        }
    }
}

impl ClusterState {
    fn record(&self, result: Result<Vec<String>, PollError>) {
        let name = self.cluster.name();
        match result {
            Ok(nodes) => {
                let failures = self.consecutive_failures.swap(0, Ordering::Relaxed);
                if failures > 0 {
                    log::info!(
                        "Cluster '{}' recovered after {} failed poll(s)",
                        name,
                        failures
                    );
                }
                log::debug!("Cluster '{}' reports {} node(s)", name, nodes.len());
                self.nodes.store(Some(Arc::new(nodes)));
            }
            Err(err) => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                if failures == 1 {
                    log::warn!(
                        "Failed to refresh cluster '{}', keeping its last known nodes: {}",
                        name,
                        err
                    );
                } else {
                    log::debug!(
                        "Failed to refresh cluster '{}' ({} times in a row): {}",
                        name,
                        failures,
                        err
                    );
                }
            }
        }
    }
}

/// Performs one request/response exchange with the cluster's configuration endpoint and
/// returns the reported nodes.
pub async fn poll_cluster(cluster: &Cluster) -> Result<Vec<String>, PollError> {
    let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(cluster.address()))
        .await
        .map_err(|_| PollError::Connect(io::ErrorKind::TimedOut.into()))?
        .map_err(PollError::Connect)?;
    let mut stream = BufStream::new(stream);

    stream
        .write_all(cluster.command().command().as_bytes())
        .await
        .map_err(PollError::Write)?;
    stream.write_all(CRLF).await.map_err(PollError::Write)?;
    stream.flush().await.map_err(PollError::Write)?;

    let value = codec::parse_response(&mut stream).await?;
    drop(stream);

    parse_nodes(&value)
}

/// Extracts the node list from a configuration value.
///
/// The value consists of a config version line and a line of space-separated nodes.
pub fn parse_nodes(value: &[u8]) -> Result<Vec<String>, PollError> {
    let value = String::from_utf8_lossy(value);
    let parts: Vec<_> = value.trim().split('\n').collect();

    let nodes = match parts.as_slice() {
        [_version, nodes] => nodes,
        _ => return Err(PollError::MalformedBody { parts: parts.len() }),
    };

    let nodes: Vec<String> = nodes.split(' ').map(str::to_owned).collect();
    // Unreachable after the trim above, which turns a blank node line into a one-part body.
    if nodes.len() == 1 && nodes[0].is_empty() {
        return Err(PollError::NoNodes);
    }

    Ok(nodes)
}

/// Reasons why polling a cluster failed. The cached nodes are kept in all cases.
#[derive(Debug)]
pub enum PollError {
    /// Could not connect to the configuration endpoint within [`CONNECT_TIMEOUT`].
    Connect(io::Error),
    /// Failed to send the request.
    Write(io::Error),
    /// The response frame could not be decoded.
    Frame(FrameError),
    /// The configuration value did not consist of exactly two lines.
    MalformedBody {
        /// The number of lines found.
        parts: usize,
    },
    /// The endpoint reported an empty node list.
    NoNodes,
}

impl Display for PollError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connect(err) => write!(f, "failed to connect: {}", err),
            Self::Write(err) => write!(f, "failed to send config get command: {}", err),
            Self::Frame(err) => write!(f, "failed to parse get response: {}", err),
            Self::MalformedBody { parts } => write!(
                f,
                "invalid number of parts in response: {} part(s), expected 2",
                parts
            ),
            Self::NoNodes => write!(f, "no available nodes"),
        }
    }
}

impl Error for PollError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Connect(err) | Self::Write(err) => Some(err),
            Self::Frame(err) => Some(err),
            Self::MalformedBody { .. } | Self::NoNodes => None,
        }
    }
}

impl From<FrameError> for PollError {
    fn from(err: FrameError) -> Self {
        Self::Frame(err)
    }
}

/// Returned by [`Updater::nodes`] when a cluster has never been polled successfully.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotFound(pub String);

impl Display for NotFound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "nodes for cluster '{}' not found", self.0)
    }
}

impl Error for NotFound {}
