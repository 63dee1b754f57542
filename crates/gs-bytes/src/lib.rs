//! Wire framing primitives shared by the runtime's network layer and its
//! child-process stdio protocol.
//!
//! Two framings live here:
//!
//! - [`frame`]: a bare `u32`-length-prefixed byte frame, used verbatim for
//!   the child stdin/stdout protocol (`length=0` is a valid, meaningful
//!   frame there) and as a building block for the payloads below.
//! - [`wire`]: the three fixed-layout network messages exchanged between
//!   runtime instances — `Hello`, `Data`, `Ack` — all big-endian, as laid
//!   out in the data model.
//!
//! Everything here is async (`tokio::io`), since both callers (the TCP
//! forwarder/receiver pair and the child stdio pump) run inside a tokio
//! task and must stay cancellation-aware rather than blocking a thread.

use thiserror::Error;

/// Frames larger than this are rejected rather than trusted enough to
/// allocate for. Generous relative to any single operator message we
/// expect in practice.
pub const MAX_FRAME_LEN: u32 = 256 * 1024 * 1024;

/// Errors shared by both framings.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame length {0} exceeds max {MAX_FRAME_LEN}")]
    TooLarge(u32),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Bare `u32`-length-prefixed byte frames.
///
/// Used directly for the child stdin/stdout protocol, where `length = 0`
/// means "acknowledge the input, emit nothing downstream".
pub mod frame {
    use super::{FrameError, MAX_FRAME_LEN};
    use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

    /// Reads one length-prefixed frame. Returns `Ok(None)` on a clean EOF
    /// at a frame boundary (the other side closed its writer), `Ok(Some(_))`
    /// otherwise, including `Ok(Some(vec![]))` for a zero-length frame.
    pub async fn read<R: AsyncRead + Unpin>(r: &mut R) -> Result<Option<Vec<u8>>, FrameError> {
        let len = match r.read_u32().await {
            Ok(len) => len,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if len > MAX_FRAME_LEN {
            return Err(FrameError::TooLarge(len));
        }
        let mut buf = vec![0u8; len as usize];
        r.read_exact(&mut buf).await?;
        Ok(Some(buf))
    }

    /// Writes one length-prefixed frame.
    pub async fn write<W: AsyncWrite + Unpin>(w: &mut W, payload: &[u8]) -> Result<(), FrameError> {
        if payload.len() as u64 > MAX_FRAME_LEN as u64 {
            return Err(FrameError::TooLarge(payload.len() as u32));
        }
        w.write_u32(payload.len() as u32).await?;
        w.write_all(payload).await?;
        w.flush().await?;
        Ok(())
    }
}

/// The three network-level messages exchanged between runtime instances.
///
/// None of these frames carry a type tag: which one is expected next is
/// always implied by the connection's protocol state (a `Hello` is the
/// first thing either side reads on a fresh connection; after that, a
/// forwarder's read half only ever sees `Ack`s and a receiver's read half
/// only ever sees `Data`s), so the caller picks the matching `read` fn.
pub mod wire {
    use super::{FrameError, MAX_FRAME_LEN};
    use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

    /// Sent once by a downstream forwarder immediately on connecting, to
    /// identify itself (its own runtime name) to the accepting receiver.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Hello {
        pub name: String,
    }

    /// One outbound message, `message_id` the runtime's `output_message_id`.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Data {
        pub message_id: u32,
        pub flags: u16,
        pub payload: Vec<u8>,
    }

    /// Highest contiguously-received `message_id` on this connection.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Ack {
        pub ack: u32,
    }

    impl Hello {
        pub async fn write<W: AsyncWrite + Unpin>(&self, w: &mut W) -> Result<(), FrameError> {
            let bytes = self.name.as_bytes();
            w.write_u32(bytes.len() as u32).await?;
            w.write_all(bytes).await?;
            w.flush().await?;
            Ok(())
        }

        /// `Ok(None)` on a clean EOF before any byte of the frame arrives;
        /// propagates `Err` for a short read mid-frame.
        pub async fn read<R: AsyncRead + Unpin>(r: &mut R) -> Result<Option<Hello>, FrameError> {
            let len = match r.read_u32().await {
                Ok(len) => len,
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
                Err(e) => return Err(e.into()),
            };
            if len > MAX_FRAME_LEN {
                return Err(FrameError::TooLarge(len));
            }
            let mut buf = vec![0u8; len as usize];
            r.read_exact(&mut buf).await?;
            Ok(Some(Hello { name: String::from_utf8_lossy(&buf).into_owned() }))
        }
    }

    impl Data {
        pub async fn write<W: AsyncWrite + Unpin>(&self, w: &mut W) -> Result<(), FrameError> {
            w.write_u32(self.message_id).await?;
            w.write_u16(0).await?; // reserved
            w.write_u16(self.flags).await?;
            w.write_u32(self.payload.len() as u32).await?;
            w.write_all(&self.payload).await?;
            w.flush().await?;
            Ok(())
        }

        /// `Ok(None)` on a clean EOF at a frame boundary.
        pub async fn read<R: AsyncRead + Unpin>(r: &mut R) -> Result<Option<Data>, FrameError> {
            let message_id = match r.read_u32().await {
                Ok(id) => id,
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
                Err(e) => return Err(e.into()),
            };
            let _reserved = r.read_u16().await?;
            let flags = r.read_u16().await?;
            let len = r.read_u32().await?;
            if len > MAX_FRAME_LEN {
                return Err(FrameError::TooLarge(len));
            }
            let mut payload = vec![0u8; len as usize];
            r.read_exact(&mut payload).await?;
            Ok(Some(Data { message_id, flags, payload }))
        }
    }

    impl Ack {
        pub async fn write<W: AsyncWrite + Unpin>(&self, w: &mut W) -> Result<(), FrameError> {
            w.write_u32(self.ack).await?;
            w.flush().await?;
            Ok(())
        }

        /// `Ok(None)` on a clean EOF at a frame boundary.
        pub async fn read<R: AsyncRead + Unpin>(r: &mut R) -> Result<Option<Ack>, FrameError> {
            let ack = match r.read_u32().await {
                Ok(ack) => ack,
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
                Err(e) => return Err(e.into()),
            };
            Ok(Some(Ack { ack }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_round_trip() {
        let mut buf = Vec::new();
        frame::write(&mut buf, b"hello").await.unwrap();
        frame::write(&mut buf, b"").await.unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        assert_eq!(frame::read(&mut cursor).await.unwrap(), Some(b"hello".to_vec()));
        assert_eq!(frame::read(&mut cursor).await.unwrap(), Some(Vec::new()));
        assert_eq!(frame::read(&mut cursor).await.unwrap(), None);
    }

    #[tokio::test]
    async fn wire_hello_round_trip() {
        use wire::Hello;
        let mut buf = Vec::new();
        Hello { name: "s_a".into() }.write(&mut buf).await.unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        assert_eq!(Hello::read(&mut cursor).await.unwrap(), Some(Hello { name: "s_a".into() }));
        assert_eq!(Hello::read(&mut cursor).await.unwrap(), None);
    }

    #[tokio::test]
    async fn wire_data_round_trip() {
        use wire::Data;
        let mut buf = Vec::new();
        Data { message_id: 7, flags: 0, payload: vec![1, 2, 3] }
            .write(&mut buf)
            .await
            .unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        assert_eq!(
            Data::read(&mut cursor).await.unwrap(),
            Some(Data { message_id: 7, flags: 0, payload: vec![1, 2, 3] })
        );
        assert_eq!(Data::read(&mut cursor).await.unwrap(), None);
    }

    #[tokio::test]
    async fn wire_ack_round_trip() {
        use wire::Ack;
        let mut buf = Vec::new();
        Ack { ack: 7 }.write(&mut buf).await.unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        assert_eq!(Ack::read(&mut cursor).await.unwrap(), Some(Ack { ack: 7 }));
        assert_eq!(Ack::read(&mut cursor).await.unwrap(), None);
    }

    #[tokio::test]
    async fn rejects_oversized_frame() {
        let mut buf = Vec::new();
        use tokio::io::AsyncWriteExt;
        buf.write_u32(MAX_FRAME_LEN + 1).await.unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        assert!(matches!(frame::read(&mut cursor).await, Err(FrameError::TooLarge(_))));
    }
}
