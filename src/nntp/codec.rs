//! Wire codec (§4.4): CRLF command lines and dot-stuffed multi-line bodies.
//! Unstuffing/stuffing here must be bit-exact — tested against round-trip
//! ARTICLE retrieval (§8 property 8).

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::NntpError;

/// Read one CRLF (or bare LF, tolerated) terminated command line. Returns
/// `Ok(None)` on a clean EOF before any bytes were read.
pub async fn read_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> std::io::Result<Option<String>> {
    let mut buf = Vec::new();
    let n = reader.read_until(b'\n', &mut buf).await?;
    if n == 0 {
        return Ok(None);
    }
    while buf.last() == Some(&b'\n') || buf.last() == Some(&b'\r') {
        buf.pop();
    }
    Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
}

/// Read a dot-terminated body (POST/IHAVE/TAKETHIS), unstuffing leading dots
/// and enforcing `max_bytes`.
pub async fn read_dotted_body<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    max_bytes: u64,
) -> Result<Vec<u8>, NntpError> {
    let mut body = Vec::new();
    loop {
        let mut line = Vec::new();
        let n = reader.read_until(b'\n', &mut line).await.map_err(NntpError::Io)?;
        if n == 0 {
            return Err(NntpError::Protocol("connection closed mid-body".into()));
        }
        while line.last() == Some(&b'\n') || line.last() == Some(&b'\r') {
            line.pop();
        }
        if line == b"." {
            break;
        }
        let unstuffed: &[u8] = if line.first() == Some(&b'.') { &line[1..] } else { &line };
        body.extend_from_slice(unstuffed);
        body.extend_from_slice(b"\r\n");
        if body.len() as u64 > max_bytes {
            return Err(NntpError::Protocol(format!(
                "article exceeds maximum size of {max_bytes} bytes"
            )));
        }
    }
    Ok(body)
}

/// Write a response body as dot-stuffed lines terminated by a bare `.`.
pub async fn write_dotted_body<W: AsyncWrite + Unpin>(
    writer: &mut W,
    body: &[u8],
) -> std::io::Result<()> {
    // Stored bodies always end in a single trailing "\r\n" (see
    // `read_dotted_body`); drop it before splitting so that trailing
    // newline doesn't produce a spurious blank line before the terminator.
    let body = body.strip_suffix(b"\r\n").or_else(|| body.strip_suffix(b"\n")).unwrap_or(body);
    for line in body.split(|&b| b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.first() == Some(&b'.') {
            writer.write_all(b".").await?;
        }
        writer.write_all(line).await?;
        writer.write_all(b"\r\n").await?;
    }
    writer.write_all(b".\r\n").await?;
    Ok(())
}

pub async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, line: &str) -> std::io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\r\n").await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn unstuffs_leading_dots() {
        let input = b"..leading dot\r\nplain\r\n.\r\n".to_vec();
        let mut cursor = Cursor::new(input);
        let body = read_dotted_body(&mut cursor, 1 << 20).await.unwrap();
        assert_eq!(body, b".leading dot\r\nplain\r\n".to_vec());
    }

    #[tokio::test]
    async fn stuffs_leading_dots_on_write() {
        let mut out = Vec::new();
        write_dotted_body(&mut out, b".leading\r\nplain").await.unwrap();
        assert_eq!(out, b"..leading\r\nplain\r\n.\r\n".to_vec());
    }

    #[tokio::test]
    async fn rejects_oversized_body() {
        let input = b"a very long line indeed\r\n.\r\n".to_vec();
        let mut cursor = Cursor::new(input);
        let result = read_dotted_body(&mut cursor, 4).await;
        assert!(result.is_err());
    }
}
