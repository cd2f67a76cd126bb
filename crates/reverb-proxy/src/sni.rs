//! SNI extraction from a raw TLS ClientHello record.
//!
//! The HTTPS listener must know the server name before deciding whether to
//! terminate TLS or hand the raw bytes through, so this parses just far
//! enough into the handshake to find the server_name extension.

use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum SniError {
    #[error("client hello truncated")]
    Truncated,

    #[error("not a tls handshake record")]
    NotHandshake,

    #[error("no server name present")]
    NoServerName,

    #[error("malformed server name")]
    Malformed,
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn u8(&mut self) -> Result<u8, SniError> {
        let b = *self.data.get(self.pos).ok_or(SniError::Truncated)?;
        self.pos += 1;
        Ok(b)
    }

    fn u16(&mut self) -> Result<u16, SniError> {
        let hi = self.u8()? as u16;
        let lo = self.u8()? as u16;
        Ok((hi << 8) | lo)
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], SniError> {
        let end = self.pos.checked_add(n).ok_or(SniError::Truncated)?;
        let slice = self.data.get(self.pos..end).ok_or(SniError::Truncated)?;
        self.pos = end;
        Ok(slice)
    }

    fn skip(&mut self, n: usize) -> Result<(), SniError> {
        self.take(n).map(|_| ())
    }
}

/// Pull the SNI hostname out of the first TLS record of a connection.
pub fn extract_sni(record: &[u8]) -> Result<String, SniError> {
    let mut cur = Cursor::new(record);

    // record header: type 0x16 (handshake), version, length
    if cur.u8()? != 0x16 {
        return Err(SniError::NotHandshake);
    }
    cur.skip(2)?; // record version
    let record_len = cur.u16()? as usize;
    if record.len() < 5 + record_len {
        return Err(SniError::Truncated);
    }

    // handshake header: type 0x01 (client hello) + 3-byte length
    if cur.u8()? != 0x01 {
        return Err(SniError::NotHandshake);
    }
    cur.skip(3)?;

    cur.skip(2)?; // client version
    cur.skip(32)?; // random
    let session_id_len = cur.u8()? as usize;
    cur.skip(session_id_len)?;
    let cipher_suites_len = cur.u16()? as usize;
    cur.skip(cipher_suites_len)?;
    let compression_len = cur.u8()? as usize;
    cur.skip(compression_len)?;

    let extensions_len = cur.u16()? as usize;
    let extensions = Cursor::new(cur.take(extensions_len)?);
    parse_extensions(extensions)
}

fn parse_extensions(mut cur: Cursor<'_>) -> Result<String, SniError> {
    loop {
        let ext_type = match cur.u16() {
            Ok(t) => t,
            Err(_) => return Err(SniError::NoServerName),
        };
        let ext_len = cur.u16()? as usize;
        let body = cur.take(ext_len)?;
        if ext_type != 0x0000 {
            continue;
        }

        // server_name_list: u16 list length, then entries of
        // (type u8, length u16, name)
        let mut names = Cursor::new(body);
        names.skip(2)?;
        let name_type = names.u8()?;
        if name_type != 0 {
            return Err(SniError::Malformed);
        }
        let name_len = names.u16()? as usize;
        let raw = names.take(name_len)?;
        let hostname = String::from_utf8(raw.to_vec()).map_err(|_| SniError::Malformed)?;
        if hostname.is_empty() {
            return Err(SniError::Malformed);
        }
        return Ok(hostname);
    }
}

#[cfg(test)]
pub(crate) fn build_client_hello(hostname: &str) -> Vec<u8> {
    let name = hostname.as_bytes();

    // server_name extension body
    let mut sni = Vec::new();
    sni.extend_from_slice(&((name.len() + 3) as u16).to_be_bytes()); // list len
    sni.push(0); // host_name
    sni.extend_from_slice(&(name.len() as u16).to_be_bytes());
    sni.extend_from_slice(name);

    let mut extensions = Vec::new();
    extensions.extend_from_slice(&0u16.to_be_bytes()); // type server_name
    extensions.extend_from_slice(&(sni.len() as u16).to_be_bytes());
    extensions.extend_from_slice(&sni);

    let mut hello = Vec::new();
    hello.extend_from_slice(&[0x03, 0x03]); // client version
    hello.extend_from_slice(&[0u8; 32]); // random
    hello.push(0); // session id
    hello.extend_from_slice(&2u16.to_be_bytes()); // cipher suites len
    hello.extend_from_slice(&[0x00, 0x2f]);
    hello.push(1); // compression methods
    hello.push(0);
    hello.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
    hello.extend_from_slice(&extensions);

    let mut handshake = vec![0x01];
    handshake.extend_from_slice(&(hello.len() as u32).to_be_bytes()[1..]);
    handshake.extend_from_slice(&hello);

    let mut record = vec![0x16, 0x03, 0x01];
    record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
    record.extend_from_slice(&handshake);
    record
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_hostname() {
        let record = build_client_hello("s.example");
        assert_eq!(extract_sni(&record).unwrap(), "s.example");
    }

    #[test]
    fn truncated_record_is_reported() {
        let mut record = build_client_hello("s.example");
        record.truncate(20);
        assert_eq!(extract_sni(&record), Err(SniError::Truncated));
    }

    #[test]
    fn non_handshake_bytes_are_rejected() {
        assert_eq!(
            extract_sni(b"GET / HTTP/1.1\r\n\r\n padding padding padding padding padding"),
            Err(SniError::NotHandshake)
        );
    }

    #[test]
    fn hello_without_sni_is_reported() {
        // build a hello, then rewrite the extension type so it is skipped
        let mut record = build_client_hello("x");
        let len = record.len();
        record[len - 8] = 0xff; // extension type no longer server_name
        assert!(matches!(
            extract_sni(&record),
            Err(SniError::NoServerName) | Err(SniError::Truncated)
        ));
    }
}
