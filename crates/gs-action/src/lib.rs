//! The thin I/O layer every action binary links against, grounded in
//! `original_source/lib/go-actionlib`: read one length-prefixed message
//! from stdin, write one (or an ack-only zero-length frame) to stdout.
//! Reuses [`gs_bytes::frame`] rather than re-deriving the framing here —
//! it's the exact same wire format the runtime's stdio pump expects.

use tokio::io::{AsyncRead, AsyncWrite, Stdin, Stdout};

/// Reads one message from the runtime. `Ok(None)` on a clean EOF (the
/// runtime closed stdin — the action should exit).
pub struct ActionInput;

impl ActionInput {
    pub async fn read<R: AsyncRead + Unpin>(stdin: &mut R) -> std::io::Result<Option<Vec<u8>>> {
        gs_bytes::frame::read(stdin).await.map_err(frame_err_to_io)
    }
}

/// Writes a message, or an ack-only (zero-length) frame, to the runtime.
pub struct ActionOutput;

impl ActionOutput {
    pub async fn write<W: AsyncWrite + Unpin>(stdout: &mut W, payload: &[u8]) -> std::io::Result<()> {
        gs_bytes::frame::write(stdout, payload).await.map_err(frame_err_to_io)
    }

    pub async fn ack_only<W: AsyncWrite + Unpin>(stdout: &mut W) -> std::io::Result<()> {
        gs_bytes::frame::write(stdout, &[]).await.map_err(frame_err_to_io)
    }
}

fn frame_err_to_io(err: gs_bytes::FrameError) -> std::io::Error {
    match err {
        gs_bytes::FrameError::Io(e) => e,
        gs_bytes::FrameError::TooLarge(n) => std::io::Error::new(std::io::ErrorKind::InvalidData, format!("frame too large: {n}")),
    }
}

/// Drives a simple one-message-in/zero-or-one-message-out action to
/// completion: reads a message, runs `handler`, writes its `Some` result
/// or acks on `None`, and repeats until stdin closes. Matches the shape
/// of `filter`'s `main` loop in `original_source/examples/simplepipe`.
pub async fn run_loop<F>(mut handler: F) -> std::io::Result<()>
where
    F: FnMut(Vec<u8>) -> Option<Vec<u8>>,
{
    let mut stdin: Stdin = tokio::io::stdin();
    let mut stdout: Stdout = tokio::io::stdout();
    loop {
        let Some(input) = ActionInput::read(&mut stdin).await? else {
            return Ok(());
        };
        match handler(input) {
            Some(output) => ActionOutput::write(&mut stdout, &output).await?,
            None => ActionOutput::ack_only(&mut stdout).await?,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let mut buf = Vec::new();
        ActionOutput::write(&mut buf, b"hello").await.unwrap();
        ActionOutput::ack_only(&mut buf).await.unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        assert_eq!(ActionInput::read(&mut cursor).await.unwrap(), Some(b"hello".to_vec()));
        assert_eq!(ActionInput::read(&mut cursor).await.unwrap(), Some(Vec::new()));
        assert_eq!(ActionInput::read(&mut cursor).await.unwrap(), None);
    }

    #[tokio::test]
    async fn run_loop_filters_odd_numbers() {
        let mut input_buf = Vec::new();
        for n in [2u32, 3, 4] {
            ActionOutput::write(&mut input_buf, &n.to_be_bytes()).await.unwrap();
        }
        let mut stdin = std::io::Cursor::new(input_buf);
        let mut stdout = Vec::new();

        loop {
            let Some(data) = ActionInput::read(&mut stdin).await.unwrap() else { break };
            let n = u32::from_be_bytes(data.clone().try_into().unwrap());
            match n % 2 {
                0 => ActionOutput::write(&mut stdout, &data).await.unwrap(),
                _ => ActionOutput::ack_only(&mut stdout).await.unwrap(),
            }
        }

        let mut cursor = std::io::Cursor::new(stdout);
        assert_eq!(ActionInput::read(&mut cursor).await.unwrap(), Some(2u32.to_be_bytes().to_vec()));
        assert_eq!(ActionInput::read(&mut cursor).await.unwrap(), Some(Vec::new()));
        assert_eq!(ActionInput::read(&mut cursor).await.unwrap(), Some(4u32.to_be_bytes().to_vec()));
        assert_eq!(ActionInput::read(&mut cursor).await.unwrap(), None);
    }
}
