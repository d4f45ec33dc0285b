use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Largest ClientHello record we are willing to peek at.
const MAX_RECORD: usize = 16384 + 5;

const PEEK_INTERVAL: Duration = Duration::from_millis(5);

/// What the first bytes of a connection look like.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Peeked {
    /// A TLS handshake, with the server name if the client sent one.
    Tls { sni: Option<String> },
    /// Anything else, including clients that sent nothing before the timeout.
    Plain,
}

impl Peeked {
    pub fn is_tls(&self) -> bool {
        matches!(self, Peeked::Tls { .. })
    }

    pub fn sni(&self) -> Option<&str> {
        match self {
            Peeked::Tls { sni } => sni.as_deref(),
            Peeked::Plain => None,
        }
    }
}

/// Look at the start of `stream` without consuming it.
pub async fn peek_client_hello(stream: &TcpStream, wait: Duration) -> std::io::Result<Peeked> {
    let mut first = [0u8; 1];

    let n = match timeout(wait, stream.peek(&mut first)).await {
        Ok(result) => result?,
        Err(_) => return Ok(Peeked::Plain),
    };

    // Content type 0x16 is a handshake record
    if n == 0 || first[0] != 0x16 {
        return Ok(Peeked::Plain);
    }

    let mut header = [0u8; 5];
    match timeout(wait, peek_exact(stream, &mut header)).await {
        Ok(Ok(true)) => {}
        Ok(Err(e)) => return Err(e),
        Ok(Ok(false)) | Err(_) => return Ok(Peeked::Tls { sni: None }),
    }

    let record_length = ((header[3] as usize) << 8) | (header[4] as usize);
    let mut record = vec![0u8; (5 + record_length).min(MAX_RECORD)];

    match timeout(wait, peek_exact(stream, &mut record)).await {
        Ok(Ok(true)) => Ok(Peeked::Tls {
            sni: parse_sni(&record[5..]),
        }),
        // Handshake started but stalled: still TLS, just without a name
        Ok(Ok(false)) | Err(_) => Ok(Peeked::Tls { sni: None }),
        Ok(Err(e)) => Err(e),
    }
}

/// Peek until `buf` is full. Returns false if the peer closed with
/// nothing buffered; callers bound the wait with a timeout.
async fn peek_exact(stream: &TcpStream, buf: &mut [u8]) -> std::io::Result<bool> {
    loop {
        let n = stream.peek(buf).await?;
        if n >= buf.len() {
            return Ok(true);
        }
        if n == 0 {
            return Ok(false);
        }
        tokio::time::sleep(PEEK_INTERVAL).await;
    }
}

fn be16(data: &[u8], offset: usize) -> Option<usize> {
    let bytes = data.get(offset..offset + 2)?;
    Some(((bytes[0] as usize) << 8) | bytes[1] as usize)
}

/// Extract the server name from a ClientHello handshake message.
pub(crate) fn parse_sni(data: &[u8]) -> Option<String> {
    // Handshake type (should be ClientHello = 1)
    if *data.first()? != 0x01 {
        return None;
    }

    // Skip: handshake type (1), length (3), version (2), random (32)
    let mut offset = 1 + 3 + 2 + 32;

    let session_id_len = *data.get(offset)? as usize;
    offset += 1 + session_id_len;

    let cipher_suites_len = be16(data, offset)?;
    offset += 2 + cipher_suites_len;

    let compression_len = *data.get(offset)? as usize;
    offset += 1 + compression_len;

    let extensions_len = be16(data, offset)?;
    offset += 2;

    let extensions_end = (offset + extensions_len).min(data.len());

    while offset + 4 <= extensions_end {
        let ext_type = be16(data, offset)?;
        let ext_len = be16(data, offset + 2)?;
        offset += 4;

        if ext_type == 0x0000 {
            return parse_sni_extension(data.get(offset..offset + ext_len)?);
        }

        offset += ext_len;
    }

    None
}

fn parse_sni_extension(data: &[u8]) -> Option<String> {
    // list length (2), name type (1), name length (2)
    if *data.get(2)? != 0 {
        return None;
    }

    let name_len = be16(data, 3)?;
    let name = data.get(5..5 + name_len)?;
    String::from_utf8(name.to_vec())
        .ok()
        .map(|s| s.to_ascii_lowercase())
}
