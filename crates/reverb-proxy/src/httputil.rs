//! HTTP/1.x head parsing for the proxy fabric.
//!
//! The vhost proxy, the HTTP-proxy tunnel mode and the port multiplexer all
//! read request heads straight off sockets; responses are parsed only as far
//! as framing requires (status line, content-length, chunked). Proper
//! parsing is delegated to `httparse`; this module owns the buffered socket
//! reads around it.

use base64::Engine;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

const MAX_HEAD: usize = 32 * 1024;
const MAX_HEADERS: usize = 64;

/// A parsed request head plus the raw bytes it came from.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    pub uri: String,
    pub headers: Vec<(String, String)>,
    /// Exact bytes of the head including the blank line.
    pub raw: Bytes,
}

impl RequestHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Request host with any `:port` suffix removed.
    pub fn host(&self) -> &str {
        let host = self.header("host").unwrap_or("");
        match host.rfind(':') {
            Some(idx) if host[idx + 1..].chars().all(|c| c.is_ascii_digit()) => &host[..idx],
            _ => host,
        }
    }

    /// Host including port, defaulted by scheme, for proxy-style dials.
    pub fn host_with_port(&self, default_port: u16) -> String {
        let host = self.header("host").unwrap_or("");
        if host.contains(':') {
            host.to_string()
        } else {
            format!("{host}:{default_port}")
        }
    }

    pub fn content_length(&self) -> usize {
        self.header("content-length")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0)
    }

    pub fn connection_close(&self) -> bool {
        self.header("connection")
            .map(|v| v.eq_ignore_ascii_case("close"))
            .unwrap_or(false)
    }

    pub fn basic_auth_matches(&self, user: &str, password: &str) -> bool {
        let Some(value) = self.header("authorization") else {
            return false;
        };
        let Some(encoded) = value.strip_prefix("Basic ") else {
            return false;
        };
        let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(encoded.trim()) else {
            return false;
        };
        String::from_utf8(decoded)
            .map(|creds| creds == format!("{user}:{password}"))
            .unwrap_or(false)
    }

    /// Rebuild the head with a rewritten Host header, extra headers and the
    /// forwarding chain appended.
    pub fn rewrite(
        &self,
        host_rewrite: &str,
        extra_headers: &str,
        client_addr: &str,
        add_origin: bool,
    ) -> Vec<u8> {
        let mut out = String::new();
        out.push_str(&format!("{} {} HTTP/1.1\r\n", self.method, self.uri));
        for (name, value) in &self.headers {
            if name.eq_ignore_ascii_case("host") && !host_rewrite.is_empty() {
                out.push_str(&format!("Host: {host_rewrite}\r\n"));
            } else {
                out.push_str(&format!("{name}: {value}\r\n"));
            }
        }
        for line in extra_headers.split('\n') {
            let line = line.trim();
            if !line.is_empty() {
                out.push_str(line);
                out.push_str("\r\n");
            }
        }
        if add_origin {
            let client_ip = match client_addr.rfind(':') {
                Some(idx) => &client_addr[..idx],
                None => client_addr,
            };
            match self.header("x-forwarded-for") {
                Some(prior) => out.push_str(&format!("X-Forwarded-For: {prior}, {client_ip}\r\n")),
                None => out.push_str(&format!("X-Forwarded-For: {client_ip}\r\n")),
            }
            out.push_str(&format!("X-Real-IP: {client_ip}\r\n"));
        }
        out.push_str("\r\n");
        out.into_bytes()
    }
}

/// Read one request head off the stream (up to the blank line).
/// `Ok(None)` means clean EOF before any byte arrived.
pub async fn read_request_head<S: AsyncRead + Unpin>(
    stream: &mut S,
) -> std::io::Result<Option<RequestHead>> {
    let Some(raw) = read_until_blank_line(stream).await? else {
        return Ok(None);
    };
    parse_request_head(raw).map(Some)
}

pub fn parse_request_head(raw: Bytes) -> std::io::Result<RequestHead> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    match req.parse(&raw) {
        Ok(httparse::Status::Complete(_)) => {}
        _ => return Err(bad_data("incomplete request head")),
    }
    let method = req.method.ok_or_else(|| bad_data("missing method"))?.to_string();
    let uri = req.path.ok_or_else(|| bad_data("missing uri"))?.to_string();
    let parsed_headers = req
        .headers
        .iter()
        .map(|h| {
            (
                h.name.to_string(),
                String::from_utf8_lossy(h.value).to_string(),
            )
        })
        .collect();
    Ok(RequestHead {
        method,
        uri,
        headers: parsed_headers,
        raw,
    })
}

/// A response head parsed only as far as framing needs.
#[derive(Debug)]
pub struct ResponseHead {
    pub status: u16,
    pub content_length: Option<usize>,
    pub chunked: bool,
    pub raw: Bytes,
}

pub async fn read_response_head<S: AsyncRead + Unpin>(
    stream: &mut S,
) -> std::io::Result<Option<ResponseHead>> {
    let Some(raw) = read_until_blank_line(stream).await? else {
        return Ok(None);
    };
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut resp = httparse::Response::new(&mut headers);
    match resp.parse(&raw) {
        Ok(httparse::Status::Complete(_)) => {}
        _ => return Err(bad_data("incomplete response head")),
    }
    let status = resp.code.ok_or_else(|| bad_data("missing status"))?;
    let mut content_length = None;
    let mut chunked = false;
    for h in resp.headers.iter() {
        if h.name.eq_ignore_ascii_case("content-length") {
            content_length = String::from_utf8_lossy(h.value).trim().parse().ok();
        } else if h.name.eq_ignore_ascii_case("transfer-encoding") {
            chunked = String::from_utf8_lossy(h.value)
                .to_ascii_lowercase()
                .contains("chunked");
        }
    }
    Ok(Some(ResponseHead {
        status,
        content_length,
        chunked,
        raw,
    }))
}

async fn read_until_blank_line<S: AsyncRead + Unpin>(
    stream: &mut S,
) -> std::io::Result<Option<Bytes>> {
    let mut buf = BytesMut::new();
    let mut byte = [0u8; 1];
    loop {
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        buf.extend_from_slice(&byte);
        if buf.len() >= 4 && &buf[buf.len() - 4..] == b"\r\n\r\n" {
            return Ok(Some(buf.freeze()));
        }
        if buf.len() > MAX_HEAD {
            return Err(bad_data("request head too large"));
        }
    }
}

fn bad_data(msg: &str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, msg.to_string())
}
