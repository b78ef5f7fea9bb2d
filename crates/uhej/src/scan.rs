//! Multicast scan for OpenDPS devices
//!
//! A scan owns its socket, its result set and a cancellation token. A
//! listener task records announces while the foreground re-sends a query at
//! a fixed interval until the scan deadline.

use crate::error::DiscoveryError;
use crate::frame::{DiscoveryFrame, ServiceType, MULTICAST_GROUP, MULTICAST_PORT};
use dashmap::DashMap;
use serde::Serialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Service name OpenDPS devices announce
pub const OPENDPS_SERVICE: &str = "opendps";

const MAX_DATAGRAM: usize = 1024;

/// Pause after a failed receive
const RECV_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Consecutive receive failures before the listener gives up
const MAX_RECV_ERRORS: u32 = 10;

/// Counts back-to-back receive failures
#[derive(Debug, Default)]
struct RecvFailures {
    consecutive: u32,
}

impl RecvFailures {
    /// Record a failure, returns true once the listener should stop
    fn record(&mut self) -> bool {
        self.consecutive += 1;
        self.consecutive >= MAX_RECV_ERRORS
    }

    fn reset(&mut self) {
        self.consecutive = 0;
    }
}

#[derive(Debug, Clone)]
pub struct ScanConfig {
    pub group: Ipv4Addr,
    pub port: u16,
    pub query_interval: Duration,
    pub duration: Duration,
    pub service_name: String,
    pub multicast_ttl: u32,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            group: MULTICAST_GROUP,
            port: MULTICAST_PORT,
            query_interval: Duration::from_secs(2),
            duration: Duration::from_secs(6),
            service_name: OPENDPS_SERVICE.to_string(),
            multicast_ttl: 32,
        }
    }
}

/// One discovered service
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveryRecord {
    pub addr: IpAddr,
    /// Port the service is offered on
    pub port: u16,
    pub service_type: ServiceType,
    pub name: String,
}

type RecordKey = (IpAddr, u16, ServiceType);

/// Scan-scoped state shared by the listener and the query loop
#[derive(Clone)]
pub struct ScanContext {
    socket: Arc<UdpSocket>,
    records: Arc<DashMap<RecordKey, DiscoveryRecord>>,
    service_name: Arc<str>,
    cancel: CancellationToken,
}

impl ScanContext {
    pub fn new(socket: UdpSocket, service_name: &str) -> Self {
        Self {
            socket: Arc::new(socket),
            records: Arc::new(DashMap::new()),
            service_name: Arc::from(service_name),
            cancel: CancellationToken::new(),
        }
    }

    /// Number of unique records so far
    #[must_use]
    pub fn count(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn records(&self) -> Vec<DiscoveryRecord> {
        self.records.iter().map(|r| r.value().clone()).collect()
    }

    /// Decode one datagram and return the records it adds
    ///
    /// Malformed datagrams are logged and dropped.
    pub fn observe(&self, data: &[u8], source: SocketAddr) -> Vec<DiscoveryRecord> {
        let services = match DiscoveryFrame::decode(data) {
            Ok(DiscoveryFrame::Announce(services)) => services,
            Ok(other) => {
                tracing::trace!(source = %source, frame_type = ?other.frame_type(), "Ignoring frame");
                return Vec::new();
            }
            Err(e) => {
                tracing::warn!(source = %source, error = %e, "Dropping illegal discovery frame");
                return Vec::new();
            }
        };

        let mut found = Vec::new();
        for service in services {
            if service.name != *self.service_name {
                continue;
            }
            let key = (source.ip(), service.port, service.service_type);
            if self.records.contains_key(&key) {
                continue;
            }
            let record = DiscoveryRecord {
                addr: source.ip(),
                port: service.port,
                service_type: service.service_type,
                name: service.name,
            };
            if self.records.insert(key, record.clone()).is_none() {
                tracing::debug!(addr = %record.addr, port = record.port, "Discovered device");
                found.push(record);
            }
        }
        found
    }

    /// Start the listener; it runs until [`ScanContext::cancel`]
    pub fn spawn_listener(&self, found_tx: mpsc::UnboundedSender<DiscoveryRecord>) -> JoinHandle<()> {
        let ctx = self.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            let mut failures = RecvFailures::default();
            loop {
                tokio::select! {
                    biased;

                    _ = ctx.cancel.cancelled() => {
                        tracing::debug!("Discovery listener cancelled");
                        break;
                    }

                    result = ctx.socket.recv_from(&mut buf) => {
                        match result {
                            Ok((n, source)) => {
                                failures.reset();
                                for record in ctx.observe(&buf[..n], source) {
                                    let _ = found_tx.send(record);
                                }
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, "Discovery receive error");
                                if failures.record() {
                                    tracing::error!("Discovery listener giving up after {} receive errors", MAX_RECV_ERRORS);
                                    break;
                                }
                                tokio::select! {
                                    _ = ctx.cancel.cancelled() => break,
                                    _ = tokio::time::sleep(RECV_ERROR_BACKOFF) => {}
                                }
                            }
                        }
                    }
                }
            }
        })
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    async fn send_query(&self, target: SocketAddr) {
        let query = DiscoveryFrame::query_any(ServiceType::Udp).encode();
        if let Err(e) = self.socket.send_to(&query, target).await {
            tracing::warn!(target = %target, error = %e, "Failed to send discovery query");
        }
    }
}

/// Bind and join the multicast group
pub async fn open_socket(config: &ScanConfig) -> Result<UdpSocket, DiscoveryError> {
    let addr = format!("0.0.0.0:{}", config.port);
    let socket = UdpSocket::bind(&addr)
        .await
        .map_err(|source| DiscoveryError::Bind { addr, source })?;
    socket.set_multicast_ttl_v4(config.multicast_ttl)?;
    socket.set_multicast_loop_v4(true)?;
    socket.join_multicast_v4(config.group, Ipv4Addr::UNSPECIFIED)?;
    tracing::debug!(group = %config.group, port = config.port, "Joined discovery group");
    Ok(socket)
}

/// Run a scan, calling `on_found` as each new device shows up
///
/// Returns the number of unique devices seen.
pub async fn scan(
    config: &ScanConfig,
    on_found: impl FnMut(&DiscoveryRecord),
) -> Result<usize, DiscoveryError> {
    let socket = open_socket(config).await?;
    let target = SocketAddr::new(IpAddr::V4(config.group), config.port);
    Ok(run_scan(ScanContext::new(socket, &config.service_name), target, config, on_found).await)
}

/// Query `target` on an interval while the listener records replies
pub async fn run_scan(
    ctx: ScanContext,
    target: SocketAddr,
    config: &ScanConfig,
    mut on_found: impl FnMut(&DiscoveryRecord),
) -> usize {
    let (found_tx, mut found_rx) = mpsc::unbounded_channel();
    let listener = ctx.spawn_listener(found_tx);

    let deadline = tokio::time::sleep(config.duration);
    tokio::pin!(deadline);
    let mut ticker = tokio::time::interval(config.query_interval);

    loop {
        tokio::select! {
            biased;

            _ = &mut deadline => break,

            Some(record) = found_rx.recv() => on_found(&record),

            _ = ticker.tick() => {
                tracing::trace!(target = %target, "Sending discovery query");
                ctx.send_query(target).await;
            }
        }
    }

    ctx.cancel();
    if let Err(e) = listener.await {
        tracing::warn!(error = %e, "Discovery listener ended abnormally");
    }
    while let Ok(record) = found_rx.try_recv() {
        on_found(&record);
    }

    let count = ctx.count();
    tracing::debug!(count, "Discovery complete");
    count
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recv_failures_give_up_after_limit() {
        let mut failures = RecvFailures::default();
        for _ in 1..MAX_RECV_ERRORS {
            assert!(!failures.record());
        }
        assert!(failures.record());

        failures.reset();
        assert!(!failures.record());
    }
    use crate::frame::Service;

    fn announce(services: &[(ServiceType, u16, &str)]) -> Vec<u8> {
        DiscoveryFrame::Announce(
            services
                .iter()
                .map(|(service_type, port, name)| Service {
                    service_type: *service_type,
                    port: *port,
                    name: name.to_string(),
                })
                .collect(),
        )
        .encode()
        .to_vec()
    }

    async fn context() -> ScanContext {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        ScanContext::new(socket, OPENDPS_SERVICE)
    }

    #[tokio::test]
    async fn test_duplicate_announce_counted_once() {
        let ctx = context().await;
        let source: SocketAddr = "192.168.1.40:4242".parse().unwrap();
        let data = announce(&[(ServiceType::Udp, 5005, "opendps")]);

        assert_eq!(ctx.observe(&data, source).len(), 1);
        assert!(ctx.observe(&data, source).is_empty());
        assert_eq!(ctx.count(), 1);
    }

    #[tokio::test]
    async fn test_other_services_ignored() {
        let ctx = context().await;
        let source: SocketAddr = "192.168.1.41:4242".parse().unwrap();
        let data = announce(&[(ServiceType::Tcp, 80, "web"), (ServiceType::Udp, 5005, "opendps")]);

        let found = ctx.observe(&data, source);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].port, 5005);
        assert_eq!(ctx.count(), 1);
    }

    #[tokio::test]
    async fn test_key_includes_port_and_type() {
        let ctx = context().await;
        let source: SocketAddr = "192.168.1.42:4242".parse().unwrap();
        ctx.observe(&announce(&[(ServiceType::Udp, 5005, "opendps")]), source);
        ctx.observe(&announce(&[(ServiceType::Tcp, 5005, "opendps")]), source);
        ctx.observe(&announce(&[(ServiceType::Udp, 5006, "opendps")]), source);
        assert_eq!(ctx.count(), 3);
    }

    #[tokio::test]
    async fn test_malformed_and_queries_ignored() {
        let ctx = context().await;
        let source: SocketAddr = "192.168.1.43:4242".parse().unwrap();
        assert!(ctx.observe(b"not a frame", source).is_empty());
        let query = DiscoveryFrame::query_any(ServiceType::Udp).encode();
        assert!(ctx.observe(&query, source).is_empty());
        assert_eq!(ctx.count(), 0);
    }

    #[tokio::test]
    async fn test_listener_survives_bad_datagrams() {
        let ctx = context().await;
        let listen_addr = ctx.socket.local_addr().unwrap();
        let (found_tx, mut found_rx) = mpsc::unbounded_channel();
        let listener = ctx.spawn_listener(found_tx);

        let device = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        device.send_to(&[0xFE, 0xDE], listen_addr).await.unwrap();
        device
            .send_to(&announce(&[(ServiceType::Udp, 5005, "opendps")]), listen_addr)
            .await
            .unwrap();

        let record = tokio::time::timeout(Duration::from_secs(2), found_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.addr, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(record.port, 5005);

        ctx.cancel();
        listener.await.unwrap();
    }

    #[tokio::test]
    async fn test_run_scan_streams_and_counts() {
        let ctx = context().await;
        let scanner_addr = ctx.socket.local_addr().unwrap();

        // A fake device that answers every query with an announce
        let device = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let device_addr = device.local_addr().unwrap();
        let responder = tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let mut queries = 0;
            while let Ok(Ok((n, _))) =
                tokio::time::timeout(Duration::from_millis(500), device.recv_from(&mut buf)).await
            {
                if let Ok(DiscoveryFrame::Query { .. }) = DiscoveryFrame::decode(&buf[..n]) {
                    queries += 1;
                    let reply = announce(&[(ServiceType::Udp, 5005, "opendps")]);
                    device.send_to(&reply, scanner_addr).await.unwrap();
                }
            }
            queries
        });

        let config = ScanConfig {
            query_interval: Duration::from_millis(50),
            duration: Duration::from_millis(220),
            ..ScanConfig::default()
        };
        let mut streamed = Vec::new();
        let count = run_scan(ctx, device_addr, &config, |r| streamed.push(r.clone())).await;

        assert_eq!(count, 1);
        assert_eq!(streamed.len(), 1);
        assert!(responder.await.unwrap() >= 2);
    }
}
