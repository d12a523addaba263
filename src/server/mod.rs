pub mod context;

pub use context::{ContextError, ServerContext};

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use derive_more::{Display, Error, From};
use tokio::net::UdpSocket;
use tracing::{debug, info, instrument, warn};

use crate::buffer::buffer::BUF_SIZE;
use crate::nvs::NameBackend;
use crate::resolvers::{HandlerOutcome, Resolver};

#[derive(Debug, Display, From, Error)]
pub enum ServerError {
    Context(ContextError),
    Io(std::io::Error),
    #[display(fmt = "failed to install metrics exporter: {}", _0)]
    Metrics(#[error(not(source))] String),
}

pub type Result<T> = std::result::Result<T, ServerError>;

/// Installs the Prometheus exporter on `addr`, exposing the counters
/// recorded throughout request handling (`dns_queries_received_total`,
/// `dns_queries_answered_total`, `dns_queries_dropped_total`, and
/// whatever else the resolver records). Call once at startup before
/// serving traffic; a second call would panic on the global recorder
/// already being installed, so this is left for the caller to invoke
/// rather than done implicitly in `Server::bind`.
pub fn install_metrics_exporter(addr: SocketAddr) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| ServerError::Metrics(e.to_string()))
}

/// The UDP authoritative server loop. A single task owns the `Resolver`
/// (and through it the DAP table), matching the original's
/// single-threaded per-process DAP state — concurrent requests are
/// handled by awaiting each one to completion in turn rather than
/// spawning, since the DAP admission check must see every request in
/// arrival order to decay and charge correctly.
pub struct Server<B: NameBackend> {
    socket: UdpSocket,
    resolver: Resolver<B>,
    started_at: Instant,
    queries_served: AtomicUsize,
}

impl<B: NameBackend> Server<B> {
    pub async fn bind(context: Arc<ServerContext<B>>) -> Result<Self> {
        let port = context.config.port;
        let socket = match context.config.bind_addr {
            Some(addr) => UdpSocket::bind(SocketAddr::new(addr, port)).await?,
            None => bind_dual_stack(port).await?,
        };

        info!(local_addr = ?socket.local_addr().ok(), "dns server bound");

        Ok(Server {
            socket,
            resolver: Resolver::new(context),
            started_at: Instant::now(),
            queries_served: AtomicUsize::new(0),
        })
    }

    /// Runs the receive loop forever. Each iteration reads one datagram,
    /// resolves it, and (unless the outcome is a silent drop) writes the
    /// reply back to the sender.
    pub async fn run(&mut self) -> Result<()> {
        let mut buf = vec![0u8; BUF_SIZE];
        loop {
            let (len, source) = self.socket.recv_from(&mut buf).await?;
            self.handle_datagram(&buf[..len], source).await;
        }
    }

    #[instrument(skip(self, datagram))]
    async fn handle_datagram(&mut self, datagram: &[u8], source: SocketAddr) {
        let now = self.now_tick();
        metrics::increment_counter!("dns_queries_received_total");

        match self.resolver.handle_query(datagram, source.ip(), now).await {
            HandlerOutcome::Reply(bytes) => {
                metrics::increment_counter!("dns_queries_answered_total");
                self.queries_served.fetch_add(1, Ordering::Relaxed);
                if let Err(e) = self.socket.send_to(&bytes, source).await {
                    warn!(error = %e, "failed to send reply");
                }
            }
            HandlerOutcome::Drop => {
                metrics::increment_counter!("dns_queries_dropped_total");
                debug!(source = %source, "dropping query silently");
            }
        }
    }

    fn now_tick(&self) -> u16 {
        self.started_at.elapsed().as_secs() as u16
    }

    pub fn queries_served(&self) -> usize {
        self.queries_served.load(Ordering::Relaxed)
    }
}

/// Binds an IPv6 dual-stack socket (accepting both v4 and v6 clients) on
/// `port`, falling back to a plain IPv4 bind if the platform doesn't
/// support dual-stack IPv6 sockets (e.g. `IPV6_V6ONLY` can't be cleared).
async fn bind_dual_stack(port: u16) -> Result<UdpSocket> {
    match UdpSocket::bind(SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port)).await {
        Ok(socket) => Ok(socket),
        Err(e) => {
            warn!(error = %e, "ipv6 bind failed, falling back to ipv4");
            Ok(UdpSocket::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port)).await?)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AllowedTld, ServerConfig};
    use crate::nvs::test_support::InMemoryBackend;

    #[tokio::test]
    async fn binds_to_an_ephemeral_port() {
        let config = ServerConfig::new(0, vec![AllowedTld::dns(".coin").unwrap()]);
        let nvs = Arc::new(InMemoryBackend::new());
        let context = Arc::new(ServerContext::build(config, nvs).await.unwrap());
        let server = Server::bind(context).await.unwrap();
        assert_eq!(server.queries_served(), 0);
    }
}
