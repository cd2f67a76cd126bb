//! SOCKS5 address and UDP datagram codec.
//!
//! Wire layout: `RSV(2) | FRAG(1) | ATYP(1) | DST.ADDR | DST.PORT | DATA`.
//! On the public UDP socket RSV is always zero; when a datagram is carried
//! over the TCP mux stream RSV holds the data-segment length so the reader
//! can recover the boundary.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::io::{AsyncRead, AsyncReadExt};

pub const MAX_DATAGRAM: usize = 64 * 1024;

const ATYP_V4: u8 = 1;
const ATYP_DOMAIN: u8 = 3;
const ATYP_V6: u8 = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddrKind {
    V4,
    V6,
    Domain,
}

/// One SOCKS5 address field: ATYP + DST.ADDR + DST.PORT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Addr {
    pub kind: AddrKind,
    pub host: String,
    pub port: u16,
}

impl Addr {
    pub fn to_socket_addr(&self) -> Option<SocketAddr> {
        self.host
            .parse::<IpAddr>()
            .ok()
            .map(|ip| SocketAddr::new(ip, self.port))
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        match self.kind {
            AddrKind::V4 => {
                out.push(ATYP_V4);
                let ip: Ipv4Addr = self.host.parse().unwrap_or(Ipv4Addr::UNSPECIFIED);
                out.extend_from_slice(&ip.octets());
            }
            AddrKind::V6 => {
                out.push(ATYP_V6);
                let ip: Ipv6Addr = self.host.parse().unwrap_or(Ipv6Addr::UNSPECIFIED);
                out.extend_from_slice(&ip.octets());
            }
            AddrKind::Domain => {
                out.push(ATYP_DOMAIN);
                out.push(self.host.len() as u8);
                out.extend_from_slice(self.host.as_bytes());
            }
        }
        out.extend_from_slice(&self.port.to_be_bytes());
    }
}

impl std::fmt::Display for Addr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Read `ATYP | ADDR | PORT` off a byte stream (request parsing).
pub async fn read_addr<S: AsyncRead + Unpin>(stream: &mut S) -> std::io::Result<Addr> {
    let mut atyp = [0u8; 1];
    stream.read_exact(&mut atyp).await?;
    let (kind, host) = match atyp[0] {
        ATYP_V4 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await?;
            (AddrKind::V4, Ipv4Addr::from(octets).to_string())
        }
        ATYP_V6 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await?;
            (AddrKind::V6, Ipv6Addr::from(octets).to_string())
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut name = vec![0u8; len[0] as usize];
            stream.read_exact(&mut name).await?;
            (
                AddrKind::Domain,
                String::from_utf8_lossy(&name).to_string(),
            )
        }
        other => {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unsupported address type {other}"),
            ))
        }
    };
    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await?;
    Ok(Addr {
        kind,
        host,
        port: u16::from_be_bytes(port),
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpDatagram {
    pub rsv: u16,
    pub frag: u8,
    pub addr: Addr,
    pub data: Vec<u8>,
}

impl UdpDatagram {
    pub fn new(addr: Addr, data: Vec<u8>) -> Self {
        Self {
            rsv: 0,
            frag: 0,
            addr,
            data,
        }
    }

    /// Parse one complete datagram from the public UDP socket.
    pub fn parse(buf: &[u8]) -> std::io::Result<Self> {
        let mut cursor = std::io::Cursor::new(buf.to_vec());
        let mut head = [0u8; 3];
        std::io::Read::read_exact(&mut cursor, &mut head)
            .map_err(|_| truncated())?;
        let rsv = u16::from_be_bytes([head[0], head[1]]);
        let frag = head[2];

        let addr = read_addr_sync(&mut cursor)?;
        let pos = cursor.position() as usize;
        let data = buf[pos..].to_vec();
        Ok(Self {
            rsv,
            frag,
            addr,
            data,
        })
    }

    /// Stream framing: RSV carries the data length.
    pub fn set_length_framing(&mut self) {
        self.rsv = self.data.len() as u16;
    }

    /// Encode with the current RSV value (stream side).
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(6 + self.data.len());
        out.extend_from_slice(&self.rsv.to_be_bytes());
        out.push(self.frag);
        self.addr.encode_into(&mut out);
        out.extend_from_slice(&self.data);
        out
    }

    /// Encode for the public socket: RSV forced back to zero.
    pub fn encode_plain(&self) -> Vec<u8> {
        let mut copy = self.clone();
        copy.rsv = 0;
        copy.encode()
    }

    /// Read one length-framed datagram off the mux stream: the RSV field
    /// tells how many data bytes follow the address.
    pub async fn read_framed<S: AsyncRead + Unpin>(stream: &mut S) -> std::io::Result<Self> {
        let mut head = [0u8; 3];
        stream.read_exact(&mut head).await?;
        let rsv = u16::from_be_bytes([head[0], head[1]]);
        let frag = head[2];
        let addr = read_addr(stream).await?;
        let mut data = vec![0u8; rsv as usize];
        if rsv > 0 {
            stream.read_exact(&mut data).await?;
        }
        Ok(Self {
            rsv,
            frag,
            addr,
            data,
        })
    }
}

/// Synchronous address parse used by `UdpDatagram::parse`, mirroring
/// [`read_addr`] over an in-memory cursor.
fn read_addr_sync(cursor: &mut std::io::Cursor<Vec<u8>>) -> std::io::Result<Addr> {
    use std::io::Read;
    let mut atyp = [0u8; 1];
    Read::read_exact(cursor, &mut atyp).map_err(|_| truncated())?;
    let (kind, host) = match atyp[0] {
        ATYP_V4 => {
            let mut octets = [0u8; 4];
            Read::read_exact(cursor, &mut octets).map_err(|_| truncated())?;
            (AddrKind::V4, Ipv4Addr::from(octets).to_string())
        }
        ATYP_V6 => {
            let mut octets = [0u8; 16];
            Read::read_exact(cursor, &mut octets).map_err(|_| truncated())?;
            (AddrKind::V6, Ipv6Addr::from(octets).to_string())
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            Read::read_exact(cursor, &mut len).map_err(|_| truncated())?;
            let mut name = vec![0u8; len[0] as usize];
            Read::read_exact(cursor, &mut name).map_err(|_| truncated())?;
            (
                AddrKind::Domain,
                String::from_utf8_lossy(&name).to_string(),
            )
        }
        other => {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unsupported address type {other}"),
            ))
        }
    };
    let mut port = [0u8; 2];
    Read::read_exact(cursor, &mut port).map_err(|_| truncated())?;
    Ok(Addr {
        kind,
        host,
        port: u16::from_be_bytes(port),
    })
}

fn truncated() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, "truncated datagram")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_addr() -> Addr {
        Addr {
            kind: AddrKind::V4,
            host: "198.51.100.7".to_string(),
            port: 53,
        }
    }

    #[test]
    fn datagram_parse_and_encode_round_trip() {
        let original = UdpDatagram::new(sample_addr(), b"query".to_vec());
        let wire = original.encode_plain();
        let parsed = UdpDatagram::parse(&wire).unwrap();
        assert_eq!(parsed.addr, original.addr);
        assert_eq!(parsed.data, b"query");
        assert_eq!(parsed.rsv, 0);
    }

    #[tokio::test]
    async fn length_framing_survives_the_stream() {
        let payload = vec![0xabu8; 500];
        let mut packet = UdpDatagram::new(sample_addr(), payload.clone());
        packet.set_length_framing();

        let mut wire = packet.encode();
        // append a second datagram to prove the boundary is recovered
        let mut second = UdpDatagram::new(sample_addr(), b"tail".to_vec());
        second.set_length_framing();
        wire.extend_from_slice(&second.encode());

        let mut cursor = std::io::Cursor::new(wire);
        let first = UdpDatagram::read_framed(&mut cursor).await.unwrap();
        assert_eq!(first.data, payload);
        let next = UdpDatagram::read_framed(&mut cursor).await.unwrap();
        assert_eq!(next.data, b"tail");
    }

    #[tokio::test]
    async fn domain_addresses_round_trip() {
        let addr = Addr {
            kind: AddrKind::Domain,
            host: "example.com".to_string(),
            port: 80,
        };
        let mut packet = UdpDatagram::new(addr.clone(), b"x".to_vec());
        packet.set_length_framing();
        let mut cursor = std::io::Cursor::new(packet.encode());
        let parsed = UdpDatagram::read_framed(&mut cursor).await.unwrap();
        assert_eq!(parsed.addr, addr);
        assert_eq!(parsed.addr.to_string(), "example.com:80");
    }

    #[tokio::test]
    async fn read_addr_rejects_unknown_atyp() {
        let mut cursor = std::io::Cursor::new(vec![9u8, 0, 0]);
        assert!(read_addr(&mut cursor).await.is_err());
    }
}
