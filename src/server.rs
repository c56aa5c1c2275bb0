//! Listeners that serve the aggregated node list of a [`Mapping`].

use std::{error::Error, fmt::Display, io, net::SocketAddr, sync::Arc, time::Duration};

use arc_swap::ArcSwap;
use tokio::{
    io::{AsyncWriteExt, BufStream},
    net::{TcpListener, TcpStream},
    task::JoinHandle,
    time::MissedTickBehavior,
};

use crate::{codec, mapping::Mapping, updater::Updater};

/// How often the aggregated response is rebuilt from the node cache.
pub const AGGREGATION_INTERVAL: Duration = Duration::from_secs(1);

/// Config version reported to downstream clients.
const CONFIG_VERSION: u32 = 1;

const CONFIG_GET_CLUSTER: &[u8] = b"config get cluster";

/// Serves the merged node list of one mapping's clusters.
pub struct Server {
    mapping: Mapping,
    updater: Arc<Updater>,
    /// Fully framed reply to `config get cluster`.
    response: ArcSwap<Vec<u8>>,
}

impl Server {
    pub fn new(mapping: Mapping, updater: Arc<Updater>) -> Self {
        Self {
            mapping,
            updater,
            response: ArcSwap::from_pointee(codec::encode_config(CONFIG_VERSION, "")),
        }
    }

    pub fn mapping(&self) -> &Mapping {
        &self.mapping
    }

    /// Joins the cached nodes of the mapping's clusters in order.
    ///
    /// Clusters that were never polled successfully contribute nothing.
    pub fn aggregate(&self) -> String {
        let mut nodes: Vec<String> = Vec::new();
        for cluster_name in self.mapping.cluster_names() {
            if let Ok(cluster_nodes) = self.updater.nodes(cluster_name) {
                nodes.extend(cluster_nodes.iter().cloned());
            }
        }
        nodes.join(" ")
    }

    /// Rebuilds the cached response from the current node cache.
    pub fn refresh_response(&self) {
        let nodes = self.aggregate();
        self.response
            .store(Arc::new(codec::encode_config(CONFIG_VERSION, &nodes)));
    }

    /// The reply currently sent for `config get cluster` requests.
    pub fn response(&self) -> Arc<Vec<u8>> {
        self.response.load_full()
    }

    /// Starts the aggregation task, binds the listen address, and starts accepting
    /// connections.
    ///
    /// A bind failure is returned to the caller; it only affects this mapping.
    pub async fn listen(self: Arc<Self>) -> Result<ServerHandle, BindError> {
        self.refresh_response();
        let aggregation = {
            let server = self.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(AGGREGATION_INTERVAL);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    interval.tick().await;
                    server.refresh_response();
                }
            })
        };

        let listen_address = self.mapping.listen_address();
        let (listener, local_addr) = match bind(listen_address).await {
            Ok(bound) => bound,
            Err(source) => {
                aggregation.abort();
                return Err(BindError {
                    mapping: self.mapping.name().to_owned(),
                    address: listen_address,
                    source,
                });
            }
        };
        log::info!(
            "Mapping '{}' listening on {}",
            self.mapping.name(),
            local_addr
        );

        let accept = tokio::spawn(self.accept_loop(listener));

        Ok(ServerHandle {
            local_addr,
            aggregation,
            accept,
        })
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let server = self.clone();
                    tokio::spawn(async move {
                        if let Err(err) = server.handle_connection(stream).await {
                            log::debug!(
                                "Connection from {} to mapping '{}' failed: {}",
                                peer,
                                server.mapping.name(),
                                err
                            );
                        }
                    });
                }
                Err(err) => log::warn!(
                    "Failed to accept connection for mapping '{}': {}",
                    self.mapping.name(),
                    err
                ),
            }
        }
    }

    /// Serves requests on the connection until it is done, then flushes and closes it.
    async fn handle_connection(&self, stream: TcpStream) -> io::Result<()> {
        let mut stream = BufStream::new(stream);
        let mut line = Vec::with_capacity(128);

        let result = loop {
            match self.process_request(&mut stream, &mut line).await {
                Ok(true) => continue,
                Ok(false) => break Ok(()),
                Err(err) => break Err(err),
            }
        };

        let closed = stream.shutdown().await;
        result.and(closed)
    }

    /// Handles one request line. Returns whether the connection should stay open.
    async fn process_request(
        &self,
        stream: &mut BufStream<TcpStream>,
        line: &mut Vec<u8>,
    ) -> io::Result<bool> {
        if !codec::read_line(stream, line).await? || line.is_empty() {
            return Ok(false);
        }

        if line.starts_with(CONFIG_GET_CLUSTER) {
            let response = self.response();
            stream.write_all(&response).await?;
            return Ok(false);
        }

        log::debug!(
            "Ignoring unknown request on mapping '{}': {:?}",
            self.mapping.name(),
            String::from_utf8_lossy(line)
        );
        Ok(false)
    }
}

async fn bind(address: SocketAddr) -> io::Result<(TcpListener, SocketAddr)> {
    let listener = TcpListener::bind(address).await?;
    let local_addr = listener.local_addr()?;
    Ok((listener, local_addr))
}

/// A mapping's listener could not be set up.
#[derive(Debug)]
pub struct BindError {
    mapping: String,
    address: SocketAddr,
    source: io::Error,
}

impl BindError {
    /// The name of the mapping whose listener failed.
    pub fn mapping(&self) -> &str {
        &self.mapping
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn kind(&self) -> io::ErrorKind {
        self.source.kind()
    }
}

impl Display for BindError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "failed to bind listener for mapping '{}' on {}",
            self.mapping, self.address
        )
    }
}

impl Error for BindError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(&self.source)
    }
}

/// Handle to a running [`Server`].
///
/// Dropping the handle stops the aggregation and accept tasks. Connections that are already
/// being served are not interrupted.
#[derive(Debug)]
pub struct ServerHandle {
    local_addr: SocketAddr,
    aggregation: JoinHandle<()>,
    accept: JoinHandle<()>,
}

impl ServerHandle {
    /// The address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown(self) {
        drop(self)
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.aggregation.abort();
        self.accept.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::Cluster;
    use pretty_assertions::assert_eq;
    use tokio::io::AsyncReadExt;

    fn updater(names: &[&str]) -> Arc<Updater> {
        let clusters = names.iter().enumerate().map(|(i, name)| {
            Cluster::new(*name, &format!("127.0.0.1:{}", 11211 + i), "1.4.14").unwrap()
        });
        Arc::new(Updater::new(clusters, Duration::from_secs(60)))
    }

    fn server(updater: &Arc<Updater>, clusters: &[&str]) -> Arc<Server> {
        let mapping = Mapping::new(
            "test",
            "127.0.0.1:0",
            clusters.iter().map(|c| c.to_string()).collect(),
        )
        .unwrap();
        Arc::new(Server::new(mapping, updater.clone()))
    }

    fn nodes(nodes: &[&str]) -> Vec<String> {
        nodes.iter().map(|n| n.to_string()).collect()
    }

    async fn request(addr: SocketAddr, request: &[u8]) -> Vec<u8> {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(request).await.unwrap();
        stream.shutdown().await.unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        response
    }

    #[test]
    fn aggregates_in_mapping_order() {
        let updater = updater(&["a", "b"]);
        updater.store_nodes("a", nodes(&["10.0.0.1:11211", "10.0.0.2:11211"]));
        updater.store_nodes("b", nodes(&["10.0.0.3:11211"]));

        assert_eq!(
            server(&updater, &["a", "b"]).aggregate(),
            "10.0.0.1:11211 10.0.0.2:11211 10.0.0.3:11211"
        );
        assert_eq!(
            server(&updater, &["b", "a"]).aggregate(),
            "10.0.0.3:11211 10.0.0.1:11211 10.0.0.2:11211"
        );
    }

    #[test]
    fn skips_clusters_without_nodes() {
        let updater = updater(&["a", "b"]);
        updater.store_nodes("b", nodes(&["10.0.0.3:11211"]));

        assert_eq!(server(&updater, &["a", "b"]).aggregate(), "10.0.0.3:11211");
        assert_eq!(server(&updater, &["a"]).aggregate(), "");
    }

    #[test]
    fn response_follows_node_cache() {
        let updater = updater(&["a"]);
        let server = server(&updater, &["a"]);
        assert_eq!(
            *server.response(),
            b"CONFIG cluster 0 3\r\n1\r\n\r\n\r\nEND\r\n".to_vec()
        );

        updater.store_nodes("a", nodes(&["10.0.0.1:11211"]));
        server.refresh_response();
        assert_eq!(
            *server.response(),
            b"CONFIG cluster 0 17\r\n1\r\n10.0.0.1:11211\r\n\r\nEND\r\n".to_vec()
        );
    }

    #[tokio::test]
    async fn answers_config_get_cluster() {
        let updater = updater(&["a"]);
        updater.store_nodes("a", nodes(&["10.0.0.1:11211"]));
        let handle = server(&updater, &["a"]).listen().await.unwrap();

        let expected = b"CONFIG cluster 0 17\r\n1\r\n10.0.0.1:11211\r\n\r\nEND\r\n".to_vec();
        assert_eq!(request(handle.local_addr(), b"config get cluster\r\n").await, expected);
        assert_eq!(request(handle.local_addr(), b"config get cluster\n").await, expected);
        assert_eq!(
            request(handle.local_addr(), b"config get cluster extra\r\n").await,
            expected
        );
    }

    #[tokio::test]
    async fn closes_without_reply_on_other_requests() {
        let updater = updater(&["a"]);
        let handle = server(&updater, &["a"]).listen().await.unwrap();

        assert_eq!(request(handle.local_addr(), b"get foo\r\n").await, b"");
        assert_eq!(request(handle.local_addr(), b"\r\nconfig get cluster\r\n").await, b"");
        assert_eq!(request(handle.local_addr(), b"").await, b"");
    }

    #[tokio::test]
    async fn bind_failure_is_reported() {
        let updater = updater(&["a"]);
        let first = server(&updater, &["a"]).listen().await.unwrap();

        let mapping = Mapping::new("taken", &first.local_addr().to_string(), vec!["a".to_owned()])
            .unwrap();
        let server = Arc::new(Server::new(mapping, updater.clone()));
        let err = server.clone().listen().await.unwrap_err();
        assert_eq!(err.mapping(), "taken");
        assert_eq!(err.address(), first.local_addr());
        assert_eq!(err.kind(), io::ErrorKind::AddrInUse);
        assert!(err.source().is_some());

        // The failed listener stops its aggregation task and releases the server.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(Arc::strong_count(&server), 1);
    }
}
