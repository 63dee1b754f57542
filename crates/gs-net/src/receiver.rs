//! One [`ReceiverCore`] per runtime, owning every accepted upstream
//! connection.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use gs_bytes::wire;
use gs_lang::RuntimeName;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::UpstreamMessage;

struct UpstreamConn {
    index: usize,
    cancel: CancellationToken,
    ack_tx: mpsc::UnboundedSender<u32>,
}

/// Maintains the dedup windows `in-work` and `in-work-by-index`, fans
/// inbound Data frames into a single channel, and dispatches
/// `UpstreamAck` maps back out to the matching live connections.
pub struct ReceiverCore {
    declared_in: HashSet<RuntimeName>,
    in_work: Mutex<HashMap<RuntimeName, UpstreamConn>>,
    in_work_by_index: Mutex<HashMap<usize, RuntimeName>>,
    next_index: AtomicUsize,
    data_tx: mpsc::UnboundedSender<UpstreamMessage>,
    runtime_cancel: CancellationToken,
}

impl ReceiverCore {
    pub fn new(
        declared_in: HashSet<RuntimeName>,
        data_tx: mpsc::UnboundedSender<UpstreamMessage>,
        runtime_cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(ReceiverCore {
            declared_in,
            in_work: Mutex::new(HashMap::new()),
            in_work_by_index: Mutex::new(HashMap::new()),
            next_index: AtomicUsize::new(0),
            data_tx,
            runtime_cancel,
        })
    }

    /// Runs the accept loop until the runtime's cancellation token fires.
    /// One task is spawned per accepted connection.
    pub async fn run_accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            tokio::select! {
                _ = self.runtime_cancel.cancelled() => break,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let core = Arc::clone(&self);
                            tokio::spawn(async move { core.handle_connection(stream, peer).await });
                        }
                        Err(err) => warn!(%err, "receiver: accept error"),
                    }
                }
            }
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let (mut read_half, mut write_half) = stream.into_split();
        let hello = match wire::Hello::read(&mut read_half).await {
            Ok(Some(h)) => h,
            Ok(None) => return,
            Err(err) => {
                warn!(%peer, %err, "receiver: hello read error");
                return;
            }
        };
        let name = RuntimeName(hello.name);
        if !self.declared_in.contains(&name) {
            warn!(%peer, name = %name, "receiver: ErrUpstreamUnknown, closing connection");
            return;
        }

        if let Some(previous) = self.in_work.lock().unwrap().remove(&name) {
            self.in_work_by_index.lock().unwrap().remove(&previous.index);
            previous.cancel.cancel();
        }

        let index = self.next_index.fetch_add(1, Ordering::SeqCst);
        let (ack_tx, mut ack_rx) = mpsc::unbounded_channel::<u32>();
        let conn_cancel = self.runtime_cancel.child_token();
        self.in_work.lock().unwrap().insert(name.clone(), UpstreamConn { index, cancel: conn_cancel.clone(), ack_tx });
        self.in_work_by_index.lock().unwrap().insert(index, name.clone());

        let ack_writer_cancel = conn_cancel.clone();
        let ack_writer = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = ack_writer_cancel.cancelled() => break,
                    ack = ack_rx.recv() => {
                        match ack {
                            Some(ack) => {
                                if (wire::Ack { ack }).write(&mut write_half).await.is_err() {
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                }
            }
        });

        loop {
            tokio::select! {
                _ = conn_cancel.cancelled() => break,
                msg = wire::Data::read(&mut read_half) => {
                    match msg {
                        Ok(Some(d)) => {
                            let _ = self.data_tx.send(UpstreamMessage {
                                input_id: index as u16,
                                input_message_id: d.message_id,
                                payload: d.payload,
                            });
                        }
                        Ok(None) => break,
                        Err(err) => {
                            warn!(%err, "receiver: data read error");
                            break;
                        }
                    }
                }
            }
        }
        conn_cancel.cancel();
        let _ = ack_writer.await;

        let mut in_work = self.in_work.lock().unwrap();
        if in_work.get(&name).map(|c| c.index) == Some(index) {
            in_work.remove(&name);
            self.in_work_by_index.lock().unwrap().remove(&index);
        }
    }

    /// Dispatches one `UpstreamAck` map: an `Ack` frame per entry, to
    /// whichever connection currently holds that index. Entries whose
    /// upstream has gone away are dropped silently.
    pub fn dispatch_acks(&self, acks: HashMap<u16, u32>) {
        let by_index = self.in_work_by_index.lock().unwrap();
        for (input_id, ack) in acks {
            if let Some(name) = by_index.get(&(input_id as usize)) {
                if let Some(conn) = self.in_work.lock().unwrap().get(name) {
                    let _ = conn.ack_tx.send(ack);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    async fn spawn_core(declared: &[&str]) -> (Arc<ReceiverCore>, SocketAddr, mpsc::UnboundedReceiver<UpstreamMessage>) {
        let declared_in: HashSet<RuntimeName> = declared.iter().map(|s| RuntimeName(s.to_string())).collect();
        let (data_tx, data_rx) = mpsc::unbounded_channel();
        let core = ReceiverCore::new(declared_in, data_tx, CancellationToken::new());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(Arc::clone(&core).run_accept_loop(listener));
        (core, addr, data_rx)
    }

    #[tokio::test]
    async fn unknown_upstream_is_closed_after_hello() {
        let (_core, addr, _rx) = spawn_core(&["s_a"]).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        (wire::Hello { name: "s_intruder".into() }).write(&mut stream).await.unwrap();
        let mut buf = [0u8; 1];
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(n, 0, "connection should be closed without further bytes");
    }

    #[tokio::test]
    async fn declared_upstream_data_is_tagged_with_its_index() {
        let (_core, addr, mut rx) = spawn_core(&["s_a"]).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        (wire::Hello { name: "s_a".into() }).write(&mut stream).await.unwrap();
        (wire::Data { message_id: 1, flags: 0, payload: vec![9] }).write(&mut stream).await.unwrap();
        let msg = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert_eq!(msg.input_id, 0);
        assert_eq!(msg.input_message_id, 1);
        assert_eq!(msg.payload, vec![9]);
    }

    #[tokio::test]
    async fn duplicate_hello_retires_previous_connection() {
        let (_core, addr, _rx) = spawn_core(&["s_a"]).await;
        let mut first = TcpStream::connect(addr).await.unwrap();
        (wire::Hello { name: "s_a".into() }).write(&mut first).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let mut second = TcpStream::connect(addr).await.unwrap();
        (wire::Hello { name: "s_a".into() }).write(&mut second).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let mut buf = [0u8; 1];
        let n = first.read(&mut buf).await.unwrap();
        assert_eq!(n, 0, "first connection should have been canceled");
    }
}
