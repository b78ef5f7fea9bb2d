//! Discovery frame codec
//!
//! Frames are `magic:32 type:8 body`, big-endian, with no escaping and no
//! checksum.

use crate::error::IllegalFrame;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::Serialize;
use std::fmt;
use std::net::Ipv4Addr;

pub const MAGIC: u32 = 0xFEDE_BEDA;

/// Multicast group the discovery protocol runs on
pub const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(225, 0, 1, 250);
pub const MULTICAST_PORT: u16 = 4242;

/// Frame type byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Hello = 0,
    Announce = 1,
    Query = 2,
    Beacon = 3,
}

/// Transport a service is offered on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceType {
    Udp,
    Tcp,
    Multicast,
    Other(u8),
}

impl From<u8> for ServiceType {
    fn from(value: u8) -> Self {
        match value {
            0 => ServiceType::Udp,
            1 => ServiceType::Tcp,
            2 => ServiceType::Multicast,
            other => ServiceType::Other(other),
        }
    }
}

impl From<ServiceType> for u8 {
    fn from(value: ServiceType) -> Self {
        match value {
            ServiceType::Udp => 0,
            ServiceType::Tcp => 1,
            ServiceType::Multicast => 2,
            ServiceType::Other(n) => n,
        }
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceType::Udp => write!(f, "UDP"),
            ServiceType::Tcp => write!(f, "TCP"),
            ServiceType::Multicast => write!(f, "mcast"),
            ServiceType::Other(n) => write!(f, "type{n}"),
        }
    }
}

impl Serialize for ServiceType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// One service in an announce frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Service {
    pub service_type: ServiceType,
    pub port: u16,
    pub name: String,
}

/// Node self-announcement
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Hello {
    pub node_id: u32,
    pub ip: Ipv4Addr,
    pub mac: [u8; 6],
    pub name: String,
}

impl Hello {
    #[must_use]
    pub fn mac_string(&self) -> String {
        self.mac
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect::<Vec<_>>()
            .join(":")
    }
}

/// A decoded discovery frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryFrame {
    Hello(Hello),
    Announce(Vec<Service>),
    /// Ask for services of a type; a name of `*` matches any
    Query {
        service_type: ServiceType,
        name: String,
    },
    Beacon,
}

impl DiscoveryFrame {
    #[must_use]
    pub fn frame_type(&self) -> FrameType {
        match self {
            DiscoveryFrame::Hello(_) => FrameType::Hello,
            DiscoveryFrame::Announce(_) => FrameType::Announce,
            DiscoveryFrame::Query { .. } => FrameType::Query,
            DiscoveryFrame::Beacon => FrameType::Beacon,
        }
    }

    /// Query for any service of the given type
    #[must_use]
    pub fn query_any(service_type: ServiceType) -> Self {
        DiscoveryFrame::Query {
            service_type,
            name: "*".to_string(),
        }
    }

    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(32);
        buf.put_u32(MAGIC);
        buf.put_u8(self.frame_type() as u8);

        match self {
            DiscoveryFrame::Hello(hello) => {
                buf.put_u32(hello.node_id);
                buf.put_u32(u32::from(hello.ip));
                buf.put_slice(&hello.mac);
                put_cstr(&mut buf, &hello.name);
            }
            DiscoveryFrame::Announce(services) => {
                for service in services {
                    buf.put_u8(service.service_type.into());
                    buf.put_u16(service.port);
                    put_cstr(&mut buf, &service.name);
                }
            }
            DiscoveryFrame::Query { service_type, name } => {
                buf.put_u8((*service_type).into());
                put_cstr(&mut buf, name);
            }
            DiscoveryFrame::Beacon => {}
        }

        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> Result<Self, IllegalFrame> {
        let mut buf = data;
        let magic = get_u32(&mut buf)?;
        if magic != MAGIC {
            return Err(IllegalFrame::BadMagic(magic));
        }

        match get_u8(&mut buf)? {
            0 => {
                let node_id = get_u32(&mut buf)?;
                let ip = Ipv4Addr::from(get_u32(&mut buf)?);
                if buf.remaining() < 6 {
                    return Err(IllegalFrame::Truncated);
                }
                let mut mac = [0u8; 6];
                buf.copy_to_slice(&mut mac);
                let name = get_cstr(&mut buf)?;
                Ok(DiscoveryFrame::Hello(Hello {
                    node_id,
                    ip,
                    mac,
                    name,
                }))
            }
            1 => {
                let mut services = Vec::new();
                while buf.has_remaining() {
                    let service_type = ServiceType::from(get_u8(&mut buf)?);
                    let port = get_u16(&mut buf)?;
                    let name = get_cstr(&mut buf)?;
                    services.push(Service {
                        service_type,
                        port,
                        name,
                    });
                }
                Ok(DiscoveryFrame::Announce(services))
            }
            2 => {
                let service_type = ServiceType::from(get_u8(&mut buf)?);
                let name = get_cstr(&mut buf)?;
                Ok(DiscoveryFrame::Query { service_type, name })
            }
            3 => Ok(DiscoveryFrame::Beacon),
            other => Err(IllegalFrame::UnknownType(other)),
        }
    }
}

fn put_cstr(buf: &mut BytesMut, text: &str) {
    buf.put_slice(text.as_bytes());
    buf.put_u8(0);
}

fn get_u8(buf: &mut &[u8]) -> Result<u8, IllegalFrame> {
    if buf.remaining() < 1 {
        return Err(IllegalFrame::Truncated);
    }
    Ok(buf.get_u8())
}

fn get_u16(buf: &mut &[u8]) -> Result<u16, IllegalFrame> {
    if buf.remaining() < 2 {
        return Err(IllegalFrame::Truncated);
    }
    Ok(buf.get_u16())
}

fn get_u32(buf: &mut &[u8]) -> Result<u32, IllegalFrame> {
    if buf.remaining() < 4 {
        return Err(IllegalFrame::Truncated);
    }
    Ok(buf.get_u32())
}

fn get_cstr(buf: &mut &[u8]) -> Result<String, IllegalFrame> {
    let end = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or(IllegalFrame::UnterminatedString)?;
    let text = String::from_utf8_lossy(&buf[..end]).into_owned();
    buf.advance(end + 1);
    Ok(text)
}
