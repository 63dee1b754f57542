//! The runtime's local control socket: a unix stream
//! socket the owning machine agent dials to `Ping` or request a
//! `ChangeOut`. Only one connection is entertained at a time; a new one
//! preempts whatever was previously connected.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use gs_lang::Address;
use gs_net::ForwarderCore;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::RuntimeError;

pub const CMD_PING: u8 = 0x01;
pub const CMD_CHANGE_OUT: u8 = 0x02;
pub const REPLY_OK: u8 = 0x00;
pub const REPLY_FAIL: u8 = 0x01;
pub const REPLY_UNKNOWN: u8 = 0x02;

/// Something the `Ping` command checks for liveness: `true` while the
/// child is believed running.
pub trait ChildLiveness: Send + Sync {
    fn is_alive(&self) -> bool;
}

/// Runs the accept loop until `cancel` fires, removing the socket file on
/// both entry (stale leftover from a crashed prior instance) and exit.
pub async fn run(
    path: PathBuf,
    forwarder: Arc<ForwarderCore>,
    liveness: Arc<dyn ChildLiveness>,
    cancel: CancellationToken,
) -> Result<(), RuntimeError> {
    let _ = tokio::fs::remove_file(&path).await;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.ok();
    }
    let listener = UnixListener::bind(&path)?;
    let current: Arc<AsyncMutex<Option<CancellationToken>>> = Arc::new(AsyncMutex::new(None));

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _addr)) => {
                        let conn_cancel = cancel.child_token();
                        {
                            let mut guard = current.lock().await;
                            if let Some(previous) = guard.replace(conn_cancel.clone()) {
                                previous.cancel();
                            }
                        }
                        let forwarder = Arc::clone(&forwarder);
                        let liveness = Arc::clone(&liveness);
                        tokio::spawn(async move {
                            if let Err(err) = handle_connection(stream, forwarder, liveness, conn_cancel).await {
                                warn!(%err, "control socket: connection error");
                            }
                        });
                    }
                    Err(err) => warn!(%err, "control socket: accept error"),
                }
            }
        }
    }
    let _ = tokio::fs::remove_file(&path).await;
    Ok(())
}

async fn handle_connection(
    mut stream: UnixStream,
    forwarder: Arc<ForwarderCore>,
    liveness: Arc<dyn ChildLiveness>,
    cancel: CancellationToken,
) -> Result<(), RuntimeError> {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            cmd = stream.read_u8() => {
                let cmd = match cmd {
                    Ok(c) => c,
                    Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
                    Err(e) => return Err(e.into()),
                };
                match cmd {
                    CMD_PING => {
                        if liveness.is_alive() {
                            stream.write_u8(REPLY_OK).await?;
                            stream.write_u32(forwarder.oldest_output() as u32).await?;
                        } else {
                            stream.write_u8(REPLY_FAIL).await?;
                        }
                    }
                    CMD_CHANGE_OUT => {
                        let reply = match read_change_out(&mut stream).await {
                            Ok((old_addr, new_addr)) => match forwarder.change_out(&old_addr, new_addr).await {
                                Ok(()) => REPLY_OK,
                                Err(err) => {
                                    warn!(%err, "control socket: change_out failed");
                                    REPLY_FAIL
                                }
                            },
                            Err(err) => {
                                warn!(%err, "control socket: malformed change_out body");
                                REPLY_FAIL
                            }
                        };
                        stream.write_u8(reply).await?;
                    }
                    _ => {
                        stream.write_u8(REPLY_UNKNOWN).await?;
                    }
                }
                stream.flush().await?;
            }
        }
    }
}

async fn read_change_out(stream: &mut UnixStream) -> Result<(Address, Address), RuntimeError> {
    let old_addr = read_addr(stream).await?;
    let new_addr = read_addr(stream).await?;
    Ok((old_addr, new_addr))
}

async fn read_addr(stream: &mut UnixStream) -> Result<Address, RuntimeError> {
    let len = stream.read_u64().await?;
    let mut buf = vec![0u8; len as usize];
    stream.read_exact(&mut buf).await?;
    let text = String::from_utf8(buf).map_err(|e| RuntimeError::ControlProtocol(e.to_string()))?;
    parse_addr(&text)
}

fn parse_addr(text: &str) -> Result<Address, RuntimeError> {
    let (host, port) = text
        .rsplit_once(':')
        .ok_or_else(|| RuntimeError::ControlProtocol(format!("address missing port: {text}")))?;
    let port: u16 = port.parse().map_err(|e| RuntimeError::ControlProtocol(format!("bad port in {text}: {e}")))?;
    Ok(Address { host: host.to_string(), port })
}

/// Writes a `ChangeOut` command body (the client side of this protocol,
/// used by `gs-agent`): `u64 old_len | old_bytes | u64 new_len | new_bytes`.
pub async fn write_change_out<W: tokio::io::AsyncWrite + Unpin>(w: &mut W, old_addr: &Address, new_addr: &Address) -> std::io::Result<()> {
    w.write_u8(CMD_CHANGE_OUT).await?;
    for addr in [old_addr, new_addr] {
        let text = addr.to_string();
        w.write_u64(text.len() as u64).await?;
        w.write_all(text.as_bytes()).await?;
    }
    w.flush().await?;
    Ok(())
}

/// Dials `path` and sends one `Ping`. `Ok(Some(oldest_output))` on a live
/// reply, `Ok(None)` on an explicit `Fail`, `Err` if the socket couldn't be
/// reached at all (stale path, runtime not up yet).
pub async fn ping(path: &Path) -> std::io::Result<Option<u32>> {
    let mut stream = UnixStream::connect(path).await?;
    stream.write_u8(CMD_PING).await?;
    stream.flush().await?;
    let reply = stream.read_u8().await?;
    if reply == REPLY_OK {
        Ok(Some(stream.read_u32().await?))
    } else {
        Ok(None)
    }
}

/// Dials `path` and requests a `ChangeOut`. Returns whether the runtime
/// replied `OK`.
pub async fn request_change_out(path: &Path, old_addr: &Address, new_addr: &Address) -> std::io::Result<bool> {
    let mut stream = UnixStream::connect(path).await?;
    write_change_out(&mut stream, old_addr, new_addr).await?;
    Ok(stream.read_u8().await? == REPLY_OK)
}

#[cfg(test)]
mod tests {
    use super::*;
    use gs_lang::RuntimeName;
    use gs_store::ForwardLog;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::io::AsyncWriteExt as _;

    struct AlwaysAlive;
    impl ChildLiveness for AlwaysAlive {
        fn is_alive(&self) -> bool {
            true
        }
    }

    struct Flag(AtomicBool);
    impl ChildLiveness for Flag {
        fn is_alive(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn parse_addr_splits_host_and_port() {
        let addr = parse_addr("example.internal:9001").unwrap();
        assert_eq!(addr.host, "example.internal");
        assert_eq!(addr.port, 9001);
    }

    #[test]
    fn parse_addr_rejects_missing_port() {
        assert!(parse_addr("no-port-here").is_err());
    }

    #[tokio::test]
    async fn ping_replies_ok_with_oldest_output_when_alive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("control.sock");
        let forwarder = ForwarderCore::new(ForwardLog::new(), RuntimeName::new("s", "a"), 0, CancellationToken::new());
        let cancel = CancellationToken::new();
        let server_cancel = cancel.clone();
        let server_path = path.clone();
        let server_forwarder = Arc::clone(&forwarder);
        let server = tokio::spawn(run(server_path, server_forwarder, Arc::new(AlwaysAlive), server_cancel));

        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        let mut client = UnixStream::connect(&path).await.unwrap();
        client.write_u8(CMD_PING).await.unwrap();
        client.flush().await.unwrap();
        let reply = client.read_u8().await.unwrap();
        assert_eq!(reply, REPLY_OK);
        let oldest = client.read_u32().await.unwrap();
        assert_eq!(oldest, 0);

        cancel.cancel();
        let _ = server.await;
    }

    #[tokio::test]
    async fn ping_replies_fail_when_dead() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("control.sock");
        let forwarder = ForwarderCore::new(ForwardLog::new(), RuntimeName::new("s", "a"), 0, CancellationToken::new());
        let cancel = CancellationToken::new();
        let server = tokio::spawn(run(path.clone(), forwarder, Arc::new(Flag(AtomicBool::new(false))), cancel.clone()));

        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        let mut client = UnixStream::connect(&path).await.unwrap();
        client.write_u8(CMD_PING).await.unwrap();
        client.flush().await.unwrap();
        assert_eq!(client.read_u8().await.unwrap(), REPLY_FAIL);

        cancel.cancel();
        let _ = server.await;
    }

    #[tokio::test]
    async fn unknown_command_gets_unknown_reply() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("control.sock");
        let forwarder = ForwarderCore::new(ForwardLog::new(), RuntimeName::new("s", "a"), 0, CancellationToken::new());
        let cancel = CancellationToken::new();
        let server = tokio::spawn(run(path.clone(), forwarder, Arc::new(AlwaysAlive), cancel.clone()));

        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        let mut client = UnixStream::connect(&path).await.unwrap();
        client.write_u8(0x7f).await.unwrap();
        client.flush().await.unwrap();
        assert_eq!(client.read_u8().await.unwrap(), REPLY_UNKNOWN);

        cancel.cancel();
        let _ = server.await;
    }
}
