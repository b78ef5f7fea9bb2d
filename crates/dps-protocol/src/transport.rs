//! Byte transports to a DPS device: serial, UDP and TCP
//!
//! Every transport hands back exactly one raw frame per `receive` call. Serial
//! and TCP are byte streams and run incoming data through a
//! [`FrameAssembler`]; UDP delivers one reply per datagram.

use crate::escape::FrameAssembler;
use crate::types::ProtocolError;

use async_trait::async_trait;
use serial2::SerialPort;
use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;

/// Port the device listens on for UDP and TCP
pub const DEVICE_PORT: u16 = 5005;

/// Default serial baud rate
pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// Default read timeout for one exchange
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const SERIAL_POLL: Duration = Duration::from_millis(100);
const MAX_DATAGRAM: usize = 4096;

/// Asynchronous frame-level link to a device
///
/// Callers issue one request and read one reply; a transport is never shared
/// between concurrent exchanges.
#[async_trait]
pub trait Transport: Send {
    /// Write an encoded frame
    async fn send(&mut self, frame: &[u8]) -> Result<(), ProtocolError>;

    /// Wait up to `timeout` for the next complete raw frame
    ///
    /// Returns [`ProtocolError::DeviceTimeout`] if nothing arrives in time.
    async fn receive(&mut self, timeout: Duration) -> Result<Vec<u8>, ProtocolError>;

    /// Release the link; later calls fail with [`ProtocolError::NotConnected`]
    async fn close(&mut self) -> Result<(), ProtocolError>;
}

/// Where a device can be reached
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Serial { path: String, baud_rate: u32 },
    Udp(SocketAddr),
    Tcp { host: String, port: u16 },
}

impl Endpoint {
    /// Parse an interface selector
    ///
    /// `tcp:<host>[:port]` selects TCP, a bare IPv4 address selects UDP and
    /// anything else is taken as a serial device path.
    pub fn parse(selector: &str, baud_rate: u32) -> Result<Self, ProtocolError> {
        let selector = selector.trim();
        if selector.is_empty() {
            return Err(ProtocolError::InvalidEndpoint(selector.to_string()));
        }

        if let Some(rest) = selector.strip_prefix("tcp:") {
            let (host, port) = match rest.rsplit_once(':') {
                Some((host, port)) => {
                    let port = port
                        .parse::<u16>()
                        .map_err(|_| ProtocolError::InvalidEndpoint(selector.to_string()))?;
                    (host, port)
                }
                None => (rest, DEVICE_PORT),
            };
            if host.is_empty() {
                return Err(ProtocolError::InvalidEndpoint(selector.to_string()));
            }
            return Ok(Endpoint::Tcp {
                host: host.to_string(),
                port,
            });
        }

        if let Ok(IpAddr::V4(ip)) = selector.parse::<IpAddr>() {
            return Ok(Endpoint::Udp(SocketAddr::new(IpAddr::V4(ip), DEVICE_PORT)));
        }

        Ok(Endpoint::Serial {
            path: selector.to_string(),
            baud_rate,
        })
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Serial { path, baud_rate } => write!(f, "{path}@{baud_rate}"),
            Endpoint::Udp(addr) => write!(f, "udp:{addr}"),
            Endpoint::Tcp { host, port } => write!(f, "tcp:{host}:{port}"),
        }
    }
}

/// Open a transport for the endpoint
pub async fn open(endpoint: &Endpoint) -> Result<Box<dyn Transport>, ProtocolError> {
    let transport: Box<dyn Transport> = match endpoint {
        Endpoint::Serial { path, baud_rate } => {
            Box::new(SerialTransport::open(path, *baud_rate)?)
        }
        Endpoint::Udp(addr) => Box::new(UdpTransport::connect(*addr).await?),
        Endpoint::Tcp { host, port } => Box::new(TcpTransport::connect(host, *port).await?),
    };
    Ok(transport)
}

/// Serial port transport
///
/// A reader thread does blocking reads with a short timeout and forwards
/// complete frames over a channel.
pub struct SerialTransport {
    port: Option<Arc<SerialPort>>,
    frame_rx: mpsc::Receiver<Vec<u8>>,
    shutdown: Arc<AtomicBool>,
}

impl SerialTransport {
    pub fn open(path: &str, baud_rate: u32) -> Result<Self, ProtocolError> {
        tracing::info!("Opening serial port {} at {} baud", path, baud_rate);

        let mut port = SerialPort::open(path, baud_rate)?;
        port.set_read_timeout(SERIAL_POLL)?;

        let reader_port = port.try_clone()?;
        let (frame_tx, frame_rx) = mpsc::channel(16);
        let shutdown = Arc::new(AtomicBool::new(false));

        let reader_shutdown = shutdown.clone();
        std::thread::spawn(move || {
            Self::reader_thread(reader_port, frame_tx, reader_shutdown);
        });

        Ok(Self {
            port: Some(Arc::new(port)),
            frame_rx,
            shutdown,
        })
    }

    fn reader_thread(port: SerialPort, frame_tx: mpsc::Sender<Vec<u8>>, shutdown: Arc<AtomicBool>) {
        tracing::debug!("Serial reader thread started");
        let mut buffer = [0u8; 256];
        let mut assembler = FrameAssembler::new();

        while !shutdown.load(Ordering::Relaxed) {
            match port.read(&mut buffer) {
                Ok(0) => {
                    tracing::warn!("Serial port closed");
                    break;
                }
                Ok(n) => {
                    for frame in assembler.feed(&buffer[..n]) {
                        if frame_tx.blocking_send(frame).is_err() {
                            tracing::debug!("Frame channel closed");
                            return;
                        }
                    }
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
                Err(ref e) if e.raw_os_error() == Some(libc::EAGAIN) => continue,
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(10));
                    continue;
                }
                Err(e) => {
                    tracing::error!("Serial read error: {}", e);
                    break;
                }
            }
        }
        tracing::debug!("Serial reader thread shutting down");
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn send(&mut self, frame: &[u8]) -> Result<(), ProtocolError> {
        let port = self.port.clone().ok_or(ProtocolError::NotConnected)?;
        let data = frame.to_vec();
        tokio::task::spawn_blocking(move || {
            port.write_all(&data)?;
            port.flush()
        })
        .await
        .map_err(std::io::Error::other)??;
        Ok(())
    }

    async fn receive(&mut self, timeout: Duration) -> Result<Vec<u8>, ProtocolError> {
        if self.port.is_none() {
            return Err(ProtocolError::NotConnected);
        }
        match tokio::time::timeout(timeout, self.frame_rx.recv()).await {
            Ok(Some(frame)) => Ok(frame),
            Ok(None) => Err(ProtocolError::NotConnected),
            Err(_) => Err(ProtocolError::DeviceTimeout),
        }
    }

    async fn close(&mut self) -> Result<(), ProtocolError> {
        self.shutdown.store(true, Ordering::Relaxed);
        self.port = None;
        Ok(())
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}

/// UDP transport, one reply per datagram
pub struct UdpTransport {
    socket: Option<UdpSocket>,
    remote: SocketAddr,
}

impl UdpTransport {
    pub async fn connect(remote: SocketAddr) -> Result<Self, ProtocolError> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(remote).await?;
        tracing::debug!(remote = %remote, local = %socket.local_addr()?, "UDP socket ready");
        Ok(Self {
            socket: Some(socket),
            remote,
        })
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn send(&mut self, frame: &[u8]) -> Result<(), ProtocolError> {
        let socket = self.socket.as_ref().ok_or(ProtocolError::NotConnected)?;
        socket.send(frame).await?;
        Ok(())
    }

    async fn receive(&mut self, timeout: Duration) -> Result<Vec<u8>, ProtocolError> {
        let socket = self.socket.as_ref().ok_or(ProtocolError::NotConnected)?;
        let mut buf = vec![0u8; MAX_DATAGRAM];
        match tokio::time::timeout(timeout, socket.recv(&mut buf)).await {
            Ok(Ok(n)) => {
                buf.truncate(n);
                Ok(buf)
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => {
                tracing::debug!(remote = %self.remote, "No datagram before timeout");
                Err(ProtocolError::DeviceTimeout)
            }
        }
    }

    async fn close(&mut self) -> Result<(), ProtocolError> {
        self.socket = None;
        Ok(())
    }
}

/// TCP transport over a buffered stream
pub struct TcpTransport {
    stream: Option<TcpStream>,
    assembler: FrameAssembler,
    pending: VecDeque<Vec<u8>>,
}

impl TcpTransport {
    pub async fn connect(host: &str, port: u16) -> Result<Self, ProtocolError> {
        let addr = format!("{host}:{port}");
        tracing::info!("Connecting to {}", addr);

        let stream = match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                tracing::error!(addr = %addr, error = %e, "TCP connect failed");
                return Err(e.into());
            }
            Err(_) => {
                tracing::error!(addr = %addr, "TCP connect timed out");
                return Err(ProtocolError::DeviceTimeout);
            }
        };
        stream.set_nodelay(true)?;

        Ok(Self {
            stream: Some(stream),
            assembler: FrameAssembler::new(),
            pending: VecDeque::new(),
        })
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&mut self, frame: &[u8]) -> Result<(), ProtocolError> {
        let stream = self.stream.as_mut().ok_or(ProtocolError::NotConnected)?;
        stream.write_all(frame).await?;
        stream.flush().await?;
        Ok(())
    }

    async fn receive(&mut self, timeout: Duration) -> Result<Vec<u8>, ProtocolError> {
        if let Some(frame) = self.pending.pop_front() {
            return Ok(frame);
        }
        let stream = self.stream.as_mut().ok_or(ProtocolError::NotConnected)?;
        let deadline = tokio::time::Instant::now() + timeout;
        let mut buf = [0u8; 512];

        loop {
            let n = match tokio::time::timeout_at(deadline, stream.read(&mut buf)).await {
                Ok(Ok(0)) => {
                    tracing::warn!("Device closed the TCP connection");
                    self.stream = None;
                    return Err(ProtocolError::NotConnected);
                }
                Ok(Ok(n)) => n,
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => return Err(ProtocolError::DeviceTimeout),
            };
            self.pending.extend(self.assembler.feed(&buf[..n]));
            if let Some(frame) = self.pending.pop_front() {
                return Ok(frame);
            }
        }
    }

    async fn close(&mut self) -> Result<(), ProtocolError> {
        if let Some(mut stream) = self.stream.take() {
            stream.shutdown().await?;
        }
        self.assembler.clear();
        self.pending.clear();
        Ok(())
    }
}
