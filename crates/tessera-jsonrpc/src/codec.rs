//! `Content-Length` framing over async byte streams.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{Message, TransportError};

/// Default upper bound for a single frame body.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// Write one framed body.
pub async fn write_frame(
    writer: &mut (impl AsyncWrite + Unpin),
    body: &[u8],
) -> Result<(), TransportError> {
    let header = format!("Content-Length: {}\r\n\r\n", body.len());
    writer.write_all(header.as_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

/// Serialize and write one message.
pub async fn write_message(
    writer: &mut (impl AsyncWrite + Unpin),
    message: &Message,
) -> Result<(), TransportError> {
    let body = message.to_vec().map_err(|err| TransportError::Io {
        message: format!("failed to encode message: {err}"),
    })?;
    write_frame(writer, &body).await
}

/// Read one framed body.
///
/// Returns `Ok(None)` on a clean end of stream before any header byte. The declared length is
/// checked against `max_len` before the body is allocated.
pub async fn read_frame(
    reader: &mut (impl AsyncBufRead + Unpin),
    max_len: usize,
) -> Result<Option<Vec<u8>>, TransportError> {
    let mut content_length: Option<usize> = None;
    let mut saw_bytes = false;
    let mut header_lines = 0usize;

    loop {
        let mut line = String::new();
        let bytes_read = reader.read_line(&mut line).await?;
        if bytes_read == 0 {
            if saw_bytes {
                return Err(TransportError::Io {
                    message: "unexpected EOF while reading headers".into(),
                });
            }
            return Ok(None);
        }
        saw_bytes = true;

        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            // Stray blank lines between frames are tolerated.
            if header_lines == 0 {
                continue;
            }
            break;
        }
        header_lines += 1;

        if let Some((name, value)) = line.split_once(':') {
            if name.eq_ignore_ascii_case("Content-Length") {
                let len = value
                    .trim()
                    .parse::<usize>()
                    .map_err(|_| TransportError::InvalidHeader {
                        message: format!("bad Content-Length {:?}", value.trim()),
                    })?;
                content_length = Some(len);
            }
        }
    }

    let len = content_length.ok_or_else(|| TransportError::InvalidHeader {
        message: "missing Content-Length header".into(),
    })?;
    if len > max_len {
        return Err(TransportError::FrameTooLarge { len, max: max_len });
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn frames_round_trip_through_duplex() {
        let (client, server) = tokio::io::duplex(1024);
        let (_, mut client_write) = tokio::io::split(client);
        let (server_read, _) = tokio::io::split(server);
        let mut reader = BufReader::new(server_read);

        let msg = Message::request(1, "initialize", json!({"rootUri": "file:///w"}));
        write_message(&mut client_write, &msg).await.unwrap();
        write_frame(&mut client_write, b"{}").await.unwrap();
        drop(client_write);

        let body = read_frame(&mut reader, DEFAULT_MAX_FRAME_BYTES).await.unwrap().unwrap();
        assert_eq!(Message::from_slice(&body).unwrap(), msg);
        let body = read_frame(&mut reader, DEFAULT_MAX_FRAME_BYTES).await.unwrap().unwrap();
        assert_eq!(body, b"{}");
        assert_eq!(read_frame(&mut reader, DEFAULT_MAX_FRAME_BYTES).await.unwrap(), None);
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected_before_allocation() {
        let input: &[u8] = b"Content-Length: 4294967296\r\n\r\n";
        let mut reader = BufReader::new(input);
        let err = read_frame(&mut reader, 1024).await.unwrap_err();
        assert_eq!(
            err,
            TransportError::FrameTooLarge {
                len: 4_294_967_296,
                max: 1024
            }
        );
    }

    #[tokio::test]
    async fn missing_length_is_an_invalid_header() {
        let input: &[u8] = b"Content-Type: application/json\r\n\r\n{}";
        let mut reader = BufReader::new(input);
        let err = read_frame(&mut reader, 1024).await.unwrap_err();
        assert!(matches!(err, TransportError::InvalidHeader { .. }), "{err:?}");
    }
}
