//! One [`ForwarderCore`] per runtime, owning the forward log and every
//! outbound [`DownstreamForwarder`] connection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use gs_bytes::wire;
use gs_lang::{Address, RuntimeName};
use gs_store::{Entry, ForwardLog, LogIter};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Debug, Error)]
pub enum NetError {
    #[error("no downstream forwarder bound to {0}")]
    UnknownDownstream(Address),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("framing error: {0}")]
    Frame(#[from] gs_bytes::FrameError),
    #[error("forward log error: {0}")]
    Store(#[from] gs_store::StoreError),
}

struct DownstreamSlot {
    addr: Address,
    cancel: CancellationToken,
    ack: Option<u64>,
    join: JoinHandle<()>,
}

/// Owns the forward log, every `downstream_index -> forwarder task`, the
/// per-downstream latest observed ack, and the `input_max` accumulator
/// drained on each trim tick. Shared via `Arc`; every mutable field lives
/// behind its own mutex, released before any `.await`.
pub struct ForwarderCore {
    log: ForwardLog,
    next_output_id: Mutex<u64>,
    declared_out_count: usize,
    downstreams: Mutex<HashMap<usize, DownstreamSlot>>,
    addr_index: Mutex<HashMap<Address, usize>>,
    next_index: AtomicUsize,
    input_max: Mutex<HashMap<u16, u32>>,
    own_name: RuntimeName,
    runtime_cancel: CancellationToken,
}

impl ForwarderCore {
    pub fn new(
        log: ForwardLog,
        own_name: RuntimeName,
        declared_out_count: usize,
        runtime_cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(ForwarderCore {
            log,
            next_output_id: Mutex::new(0),
            declared_out_count,
            downstreams: Mutex::new(HashMap::new()),
            addr_index: Mutex::new(HashMap::new()),
            next_index: AtomicUsize::new(0),
            input_max: Mutex::new(HashMap::new()),
            own_name,
            runtime_cancel,
        })
    }

    /// Starts a downstream forwarder task for a declared outbound edge.
    /// Called once per edge at runtime startup, in plan order.
    pub fn start_downstream(self: &Arc<Self>, addr: Address) {
        let index = self.next_index.fetch_add(1, Ordering::SeqCst);
        let task_cancel = self.runtime_cancel.child_token();
        let join = spawn_downstream_forwarder(Arc::clone(self), index, addr.clone(), task_cancel.clone());
        self.downstreams
            .lock()
            .unwrap()
            .insert(index, DownstreamSlot { addr: addr.clone(), cancel: task_cancel, ack: None, join });
        self.addr_index.lock().unwrap().insert(addr, index);
    }

    /// Records a forwarded message's provenance for the retransmit log and
    /// advances the per-input high-water mark used by the trim loop.
    pub fn forward(&self, input_id: u16, input_message_id: u32, payload: Vec<u8>) -> Result<(), NetError> {
        let output_id = {
            let mut next = self.next_output_id.lock().unwrap();
            let id = *next;
            *next += 1;
            id
        };
        if self.declared_out_count > 0 && !payload.is_empty() {
            self.log.append(Entry { input_id, flags: 0, input_message_id, output_message_id: output_id, payload })?;
        }
        let mut input_max = self.input_max.lock().unwrap();
        let slot = input_max.entry(input_id).or_insert(0);
        *slot = (*slot).max(input_message_id);
        Ok(())
    }

    /// One tick of the trim loop. Returns the `upstream_ack_snapshot` to
    /// publish on the runtime's outbound ack channel, or `None` if there's
    /// nothing to report this tick.
    pub fn trim_tick(&self) -> Option<HashMap<u16, u32>> {
        let mut snapshot = {
            let mut input_max = self.input_max.lock().unwrap();
            std::mem::take(&mut *input_max)
        };
        if !self.log.is_empty() {
            let downstreams = self.downstreams.lock().unwrap();
            if !downstreams.is_empty() && downstreams.values().all(|d| d.ack.is_some()) {
                let min_ack = downstreams.values().map(|d| d.ack.unwrap()).min().unwrap();
                drop(downstreams);
                for (input_id, max_id) in self.log.trim(min_ack) {
                    let slot = snapshot.entry(input_id).or_insert(0);
                    *slot = (*slot).max(max_id);
                }
            }
        }
        if snapshot.is_empty() {
            None
        } else {
            Some(snapshot)
        }
    }

    /// Ack ingestion from a downstream forwarder's reader loop.
    async fn on_ack(&self, index: usize, wire_ack: u32) {
        let next_output_id = *self.next_output_id.lock().unwrap();
        let full = crate::reconstruct_output_id(next_output_id, wire_ack);
        let mut downstreams = self.downstreams.lock().unwrap();
        if let Some(slot) = downstreams.get_mut(&index) {
            let advances = match slot.ack {
                None => true,
                Some(cur) => full > cur,
            };
            if advances {
                slot.ack = Some(full);
            }
        }
    }

    /// `oldest_output` for the Ping reply on the control socket.
    pub fn oldest_output(&self) -> u64 {
        let next = *self.next_output_id.lock().unwrap();
        self.log.oldest(next)
    }

    /// Swaps a downstream's address in place: stops the old forwarder
    /// task, preserves its per-index ack state, and starts a new one at a
    /// fresh log iterator.
    pub async fn change_out(self: &Arc<Self>, old_addr: &Address, new_addr: Address) -> Result<(), NetError> {
        let (index, removed) = {
            let mut addr_index = self.addr_index.lock().unwrap();
            let index = *addr_index.get(old_addr).ok_or_else(|| NetError::UnknownDownstream(old_addr.clone()))?;
            addr_index.remove(old_addr);
            let removed = self.downstreams.lock().unwrap().remove(&index);
            (index, removed)
        };
        let Some(old_slot) = removed else {
            return Err(NetError::UnknownDownstream(old_addr.clone()));
        };
        old_slot.cancel.cancel();
        let _ = old_slot.join.await;

        let task_cancel = self.runtime_cancel.child_token();
        let join = spawn_downstream_forwarder(Arc::clone(self), index, new_addr.clone(), task_cancel.clone());
        self.downstreams.lock().unwrap().insert(
            index,
            DownstreamSlot { addr: new_addr.clone(), cancel: task_cancel, ack: old_slot.ack, join },
        );
        self.addr_index.lock().unwrap().insert(new_addr, index);
        Ok(())
    }
}

fn spawn_downstream_forwarder(
    core: Arc<ForwarderCore>,
    index: usize,
    addr: Address,
    task_cancel: CancellationToken,
) -> JoinHandle<()> {
    let own_name = core.own_name.clone();
    let log_iter = core.log.iterator();
    tokio::spawn(async move {
        run_downstream_forwarder(core, index, addr, own_name, log_iter, task_cancel).await;
    })
}

async fn run_downstream_forwarder(
    core: Arc<ForwarderCore>,
    index: usize,
    addr: Address,
    own_name: RuntimeName,
    mut log_iter: LogIter,
    task_cancel: CancellationToken,
) {
    let stream = match TcpStream::connect((addr.host.as_str(), addr.port)).await {
        Ok(s) => s,
        Err(err) => {
            warn!(%addr, %err, "downstream forwarder: connect failed, not retrying");
            return;
        }
    };
    let (mut read_half, mut write_half) = stream.into_split();
    if let Err(err) = (wire::Hello { name: own_name.to_string() }).write(&mut write_half).await {
        warn!(%addr, %err, "downstream forwarder: hello failed");
        return;
    }

    let conn_cancel = task_cancel.child_token();
    let reader_cancel = conn_cancel.clone();
    let core_for_reader = Arc::clone(&core);
    let reader = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = reader_cancel.cancelled() => break,
                msg = wire::Ack::read(&mut read_half) => {
                    match msg {
                        Ok(Some(a)) => core_for_reader.on_ack(index, a.ack).await,
                        Ok(None) => break,
                        Err(err) => {
                            warn!(%err, "downstream forwarder: ack read error");
                            break;
                        }
                    }
                }
            }
        }
        reader_cancel.cancel();
    });

    loop {
        match log_iter.next(&conn_cancel).await {
            Some(entry) => {
                let data = wire::Data { message_id: entry.output_message_id as u32, flags: entry.flags, payload: entry.payload };
                if let Err(err) = data.write(&mut write_half).await {
                    warn!(%addr, %err, "downstream forwarder: write error, exiting (no reconnect)");
                    break;
                }
            }
            None => break,
        }
    }
    conn_cancel.cancel();
    let _ = reader.await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use gs_store::ForwardLog;
    use tokio::net::TcpListener;

    fn name() -> RuntimeName {
        RuntimeName::new("s", "a")
    }

    #[test]
    fn forward_skips_log_when_no_outbound_edges() {
        let log = ForwardLog::new();
        let core = ForwarderCore::new(log.clone(), name(), 0, CancellationToken::new());
        core.forward(0, 1, b"hi".to_vec()).unwrap();
        assert!(log.is_empty());
    }

    #[test]
    fn forward_skips_log_for_empty_payload() {
        let log = ForwardLog::new();
        let core = ForwarderCore::new(log.clone(), name(), 1, CancellationToken::new());
        core.forward(0, 1, Vec::new()).unwrap();
        assert!(log.is_empty());
    }

    #[test]
    fn forward_appends_when_out_non_empty_and_payload_non_empty() {
        let log = ForwardLog::new();
        let core = ForwarderCore::new(log.clone(), name(), 1, CancellationToken::new());
        core.forward(2, 7, b"x".to_vec()).unwrap();
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn trim_tick_reports_input_max_even_with_no_downstreams() {
        let log = ForwardLog::new();
        let core = ForwarderCore::new(log, name(), 0, CancellationToken::new());
        core.forward(3, 9, Vec::new()).unwrap();
        let snapshot = core.trim_tick().unwrap();
        assert_eq!(snapshot.get(&3), Some(&9));
    }

    #[test]
    fn trim_tick_is_none_when_nothing_to_report() {
        let log = ForwardLog::new();
        let core = ForwarderCore::new(log, name(), 0, CancellationToken::new());
        assert!(core.trim_tick().is_none());
    }

    #[tokio::test]
    async fn on_ack_only_advances_monotonically() {
        let log = ForwardLog::new();
        let core = ForwarderCore::new(log, name(), 1, CancellationToken::new());
        core.downstreams.lock().unwrap().insert(
            0,
            DownstreamSlot {
                addr: Address { host: "127.0.0.1".into(), port: 0 },
                cancel: CancellationToken::new(),
                ack: None,
                join: tokio::spawn(async {}),
            },
        );
        core.on_ack(0, 10).await;
        assert_eq!(core.downstreams.lock().unwrap().get(&0).unwrap().ack, Some(10));
        core.on_ack(0, 3).await;
        assert_eq!(core.downstreams.lock().unwrap().get(&0).unwrap().ack, Some(10));
        core.on_ack(0, 11).await;
        assert_eq!(core.downstreams.lock().unwrap().get(&0).unwrap().ack, Some(11));
    }

    #[tokio::test]
    async fn start_downstream_registers_address_index() {
        let log = ForwardLog::new();
        let core = ForwarderCore::new(log, name(), 1, CancellationToken::new());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = Address { host: "127.0.0.1".into(), port: listener.local_addr().unwrap().port() };
        drop(listener);
        core.start_downstream(addr.clone());
        assert_eq!(core.addr_index.lock().unwrap().get(&addr), Some(&0));
    }
}
