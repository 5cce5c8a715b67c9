//! CBOR encoding and length-prefixed framing.
//!
//! Envelopes travel over the relay as bare CBOR documents (the broker keeps
//! message boundaries). The local control API runs over a plain byte stream
//! and uses the framed form: `[4-byte big-endian length][CBOR payload]`.

use crate::error::{GatewayError, GatewayResult};
use std::io::Cursor;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound for a single frame; anything larger is treated as corrupt.
pub const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

/// Encode a serializable value as a bare CBOR document.
pub fn cbor_encode<T: serde::Serialize>(value: &T) -> GatewayResult<Vec<u8>> {
    let mut payload = Vec::new();
    ciborium::into_writer(value, &mut payload)?;
    Ok(payload)
}

/// Decode a CBOR payload (without length prefix) into a typed value.
pub fn cbor_decode<T: serde::de::DeserializeOwned>(data: &[u8]) -> GatewayResult<T> {
    let value: T = ciborium::from_reader(Cursor::new(data))?;
    Ok(value)
}

/// Encode a serializable value into a length-prefixed CBOR frame.
pub fn frame_encode<T: serde::Serialize>(value: &T) -> GatewayResult<Vec<u8>> {
    let payload = cbor_encode(value)?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(GatewayError::Codec(format!(
            "frame of {} bytes exceeds limit of {MAX_FRAME_LEN}",
            payload.len()
        )));
    }

    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend(payload);
    Ok(frame)
}

/// Read one frame from an async stream and decode it.
///
/// Returns `Ok(None)` on a clean EOF before the length header.
pub async fn read_frame<R, T>(reader: &mut R) -> GatewayResult<Option<T>>
where
    R: AsyncRead + Unpin,
    T: serde::de::DeserializeOwned,
{
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(GatewayError::Codec(format!(
            "announced frame of {len} bytes exceeds limit"
        )));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    cbor_decode(&payload).map(Some)
}

/// Encode a value as a frame and write it to an async stream.
pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> GatewayResult<()>
where
    W: AsyncWrite + Unpin,
    T: serde::Serialize,
{
    let frame = frame_encode(value)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Probe {
        name: String,
        value: i64,
    }

    #[test]
    fn frame_carries_big_endian_length() {
        let msg = Probe {
            name: "len".into(),
            value: 7,
        };
        let frame = frame_encode(&msg).unwrap();
        let len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(len, frame.len() - 4);
        assert_eq!(cbor_decode::<Probe>(&frame[4..]).unwrap(), msg);
    }

    #[tokio::test]
    async fn rejects_oversized_header() {
        let header = ((MAX_FRAME_LEN + 1) as u32).to_be_bytes();
        let mut reader = &header[..];
        let err = read_frame::<_, Probe>(&mut reader).await.unwrap_err();
        assert!(matches!(err, GatewayError::Codec(_)));
    }

    #[tokio::test]
    async fn truncated_payload_is_an_error() {
        let frame = frame_encode(&Probe {
            name: "cut".into(),
            value: 1,
        })
        .unwrap();
        let mut reader = &frame[..frame.len() - 2];
        assert!(read_frame::<_, Probe>(&mut reader).await.is_err());
    }

    #[tokio::test]
    async fn frames_over_async_stream() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let msg = Probe {
            name: "async".into(),
            value: -3,
        };
        write_frame(&mut client, &msg).await.unwrap();
        drop(client);

        let got: Option<Probe> = read_frame(&mut server).await.unwrap();
        assert_eq!(got, Some(msg));
        let eof: Option<Probe> = read_frame(&mut server).await.unwrap();
        assert!(eof.is_none());
    }
}
