use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    ZeroLength,
    TooLarge(u32),
}

pub fn decode_frame_length(prefix: [u8; 4], max_frame: u32) -> Result<u32, FrameError> {
    let len = u32::from_be_bytes(prefix);
    if len == 0 {
        return Err(FrameError::ZeroLength);
    }
    if len > max_frame {
        return Err(FrameError::TooLarge(len));
    }
    Ok(len)
}

pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let len = payload.len() as u32;
    let mut out = Vec::with_capacity(4 + payload.len());
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// Reads one length-prefixed frame.
pub async fn read_frame<R>(stream: &mut R, max_frame: u32) -> io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = decode_frame_length(len_buf, max_frame).map_err(|err| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("invalid frame length: {:?}", err),
        )
    })?;
    let mut buf = vec![0u8; len as usize];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}

pub async fn write_frame<W>(stream: &mut W, payload: &[u8], max_frame: u32) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    if payload.is_empty() {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "empty payload"));
    }
    if payload.len() as u64 > u64::from(max_frame) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "payload exceeds max_frame",
        ));
    }
    stream.write_all(&encode_frame(payload)).await?;
    stream.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_and_oversized_lengths_are_rejected() {
        assert_eq!(
            decode_frame_length(0u32.to_be_bytes(), 16),
            Err(FrameError::ZeroLength)
        );
        assert_eq!(
            decode_frame_length(17u32.to_be_bytes(), 16),
            Err(FrameError::TooLarge(17))
        );
        assert_eq!(decode_frame_length(16u32.to_be_bytes(), 16), Ok(16));
    }

    #[tokio::test]
    async fn frames_survive_a_duplex_pipe() {
        let (mut client, mut server) = tokio::io::duplex(64);
        write_frame(&mut client, b"{\"type\":\"Health\"}", 1024)
            .await
            .unwrap();
        let frame = read_frame(&mut server, 1024).await.unwrap();
        assert_eq!(frame, b"{\"type\":\"Health\"}");
    }

    #[tokio::test]
    async fn oversized_frame_is_invalid_data() {
        let (mut client, mut server) = tokio::io::duplex(64);
        write_frame(&mut client, &[b'x'; 32], 1024).await.unwrap();
        let err = read_frame(&mut server, 16).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
