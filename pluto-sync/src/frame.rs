use std::io::{Error, ErrorKind};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single frame, large mails included.
pub const MAX_FRAME: usize = 256 << 20;

/// Control frames exchanged on sync streams. Real messages are MessagePack
/// encoded and always longer than one byte.
pub const ACK: &[u8] = b"+";
pub const NACK: &[u8] = b"-";
pub const PING: &[u8] = b"P";

/// Write one `"<N>;<payload>"` frame. The same framing is used on the wire
/// and in the on-disk journals.
pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, payload: &[u8]) -> std::io::Result<()> {
    if payload.len() > MAX_FRAME {
        return Err(Error::new(ErrorKind::InvalidInput, "frame exceeds ceiling"));
    }
    w.write_all(format!("{};", payload.len()).as_bytes()).await?;
    w.write_all(payload).await?;
    w.flush().await
}

/// Read one frame, enforcing the payload ceiling.
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> std::io::Result<Vec<u8>> {
    let mut len: usize = 0;
    let mut digits = 0;
    loop {
        let b = r.read_u8().await?;
        if b == b';' {
            break;
        }
        if !b.is_ascii_digit() || digits >= 12 {
            return Err(Error::new(ErrorKind::InvalidData, "bad frame length prefix"));
        }
        len = len * 10 + (b - b'0') as usize;
        digits += 1;
        if len > MAX_FRAME {
            return Err(Error::new(ErrorKind::InvalidData, "frame exceeds ceiling"));
        }
    }
    if digits == 0 {
        return Err(Error::new(ErrorKind::InvalidData, "empty frame length prefix"));
    }
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload).await?;
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_round_trip() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"hello").await.unwrap();
        write_frame(&mut buf, b"").await.unwrap();
        write_frame(&mut buf, ACK).await.unwrap();
        assert_eq!(&buf[..8], b"5;hello0");

        let mut r = std::io::Cursor::new(buf);
        assert_eq!(read_frame(&mut r).await.unwrap(), b"hello");
        assert_eq!(read_frame(&mut r).await.unwrap(), b"");
        assert_eq!(read_frame(&mut r).await.unwrap(), ACK);
    }

    #[tokio::test]
    async fn rejects_garbage_prefix() {
        let mut r = std::io::Cursor::new(b"x;abc".to_vec());
        assert!(read_frame(&mut r).await.is_err());

        let mut r = std::io::Cursor::new(b";abc".to_vec());
        assert!(read_frame(&mut r).await.is_err());
    }
}
