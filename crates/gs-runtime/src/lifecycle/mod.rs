//! The supervisor loop: spawns the child operator process under the
//! sandbox identity, wires it to the `gs-net` forwarder/receiver pair via
//! the in-flight queue of capacity 1, and runs every
//! concurrent task (receiver accept loop, forwarder core trim ticker,
//! stdin writer, stdout reader, stderr relay, control socket) to
//! completion, cancelling the rest the moment any one of them exits.

use std::os::unix::process::CommandExt;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use gs_lang::RuntimeName;
use gs_net::{ForwarderCore, ReceiverCore, UpstreamMessage};
use gs_store::ForwardLog;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::net::TcpListener;
use tokio::process::{ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::control::{self, ChildLiveness};
use crate::sandbox::Sandbox;
use crate::{RuntimeConfig, RuntimeError};

struct ChildAliveFlag(Arc<AtomicBool>);

impl ChildLiveness for ChildAliveFlag {
    fn is_alive(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Runs one operator instance to completion. Returns once the child has
/// exited and every concurrent task has wound down; the sandbox identity,
/// firewall chain, temp binary, and control socket are gone by the time
/// this returns, regardless of outcome.
///
/// `external_cancel` is the machine agent's handle on this runtime: firing
/// it is the "stop" operation — it SIGTERMs the child the
/// same way an internal task error would, just triggered from outside
/// instead of from a local failure.
pub async fn run(config: RuntimeConfig, sandbox: Arc<dyn Sandbox>, external_cancel: CancellationToken) -> Result<(), RuntimeError> {
    let identity = sandbox.create(&config.runtime_name.to_string(), &config.sandbox_allowlist).await?;

    let mut cmd = Command::new(&config.binary_path);
    cmd.args(&config.argv);
    cmd.envs(&config.env);
    cmd.uid(identity.uid).gid(identity.gid);
    cmd.stdin(Stdio::piped()).stdout(Stdio::piped()).stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(err) => {
            let _ = sandbox.destroy(&identity).await;
            return Err(err.into());
        }
    };
    let pid = child.id().ok_or(RuntimeError::ChildExited)?;
    let stdin = child.stdin.take().expect("piped stdin");
    let stdout = child.stdout.take().expect("piped stdout");
    let stderr = child.stderr.take().expect("piped stderr");

    let child_alive = Arc::new(AtomicBool::new(true));
    let wait_alive = Arc::clone(&child_alive);
    let mut child_wait_task = tokio::spawn(async move {
        let status = child.wait().await;
        wait_alive.store(false, Ordering::SeqCst);
        status
    });

    let runtime_cancel = external_cancel.child_token();
    let log = ForwardLog::new();
    let forwarder = ForwarderCore::new(log, config.runtime_name.clone(), config.outbound.len(), runtime_cancel.clone());
    for addr in &config.outbound {
        forwarder.start_downstream(addr.clone());
    }

    let (data_tx, data_rx) = mpsc::unbounded_channel::<UpstreamMessage>();
    let receiver = ReceiverCore::new(config.inbound.iter().cloned().collect(), data_tx, runtime_cancel.clone());
    let listener = TcpListener::bind(config.listen_addr).await?;

    let (in_flight_tx, in_flight_rx) = mpsc::channel::<UpstreamMessage>(1);
    let inbound_empty = config.inbound.is_empty();

    let mut tasks: JoinSet<Result<(), RuntimeError>> = JoinSet::new();
    {
        let receiver = Arc::clone(&receiver);
        tasks.spawn(async move {
            receiver.run_accept_loop(listener).await;
            Ok(())
        });
    }
    let stderr_log = match &config.log_path {
        Some(path) => Some(gs_log::RuntimeFileLog::open(path)?),
        None => None,
    };

    tasks.spawn(writer_task(stdin, inbound_empty, data_rx, in_flight_tx, runtime_cancel.clone()));
    tasks.spawn(reader_task(stdout, in_flight_rx, Arc::clone(&forwarder), runtime_cancel.clone()));
    tasks.spawn(stderr_task(stderr, config.runtime_name.clone(), stderr_log, runtime_cancel.clone()));
    tasks.spawn(trim_task(Arc::clone(&forwarder), Arc::clone(&receiver), config.ack_period, runtime_cancel.clone()));
    tasks.spawn(control::run(
        config.control_socket_path.clone(),
        Arc::clone(&forwarder),
        Arc::new(ChildAliveFlag(Arc::clone(&child_alive))),
        runtime_cancel.clone(),
    ));

    let mut first_err: Option<RuntimeError> = None;
    while let Some(joined) = tasks.join_next().await {
        runtime_cancel.cancel();
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!(%err, runtime = %config.runtime_name, "runtime task exited with error");
                if first_err.is_none() {
                    first_err = Some(err);
                }
            }
            Err(join_err) => warn!(%join_err, "runtime task panicked"),
        }
    }

    if child_alive.load(Ordering::SeqCst) {
        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
    }
    tokio::select! {
        status = &mut child_wait_task => {
            if let Ok(Ok(status)) = status {
                info!(runtime = %config.runtime_name, %status, "child exited");
            }
        }
        _ = tokio::time::sleep(config.kill_timeout) => {
            warn!(runtime = %config.runtime_name, "child did not exit within kill_timeout, sending SIGKILL");
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
            let _ = (&mut child_wait_task).await;
        }
    }

    let _ = tokio::fs::remove_file(&config.binary_path).await;
    if let Err(err) = sandbox.destroy(&identity).await {
        error!(%err, runtime = %config.runtime_name, "sandbox teardown failed");
        if first_err.is_none() {
            first_err = Some(err);
        }
    }

    first_err.map_or(Ok(()), Err)
}

async fn writer_task(
    mut stdin: ChildStdin,
    inbound_empty: bool,
    mut data_rx: mpsc::UnboundedReceiver<UpstreamMessage>,
    in_flight_tx: mpsc::Sender<UpstreamMessage>,
    cancel: CancellationToken,
) -> Result<(), RuntimeError> {
    loop {
        let msg = if inbound_empty {
            UpstreamMessage::dummy()
        } else {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                received = data_rx.recv() => match received {
                    Some(m) => m,
                    None => return Ok(()),
                },
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            sent = in_flight_tx.send(msg.clone()) => {
                if sent.is_err() {
                    return Ok(());
                }
            }
        }

        if !inbound_empty {
            use tokio::io::AsyncWriteExt;
            match gs_bytes::frame::write(&mut stdin, &msg.payload).await {
                Ok(()) => {}
                Err(gs_bytes::FrameError::Io(e)) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                    let _ = stdin.shutdown().await;
                    return Ok(());
                }
                Err(e) => return Err(RuntimeError::Io(std::io::Error::other(e.to_string()))),
            }
        }
    }
}

async fn reader_task(
    mut stdout: ChildStdout,
    mut in_flight_rx: mpsc::Receiver<UpstreamMessage>,
    forwarder: Arc<ForwarderCore>,
    cancel: CancellationToken,
) -> Result<(), RuntimeError> {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            f = gs_bytes::frame::read(&mut stdout) => f,
        };
        let payload = match frame {
            Ok(Some(p)) => p,
            Ok(None) => return Ok(()),
            Err(e) => return Err(RuntimeError::Io(std::io::Error::other(e.to_string()))),
        };
        let input = match in_flight_rx.recv().await {
            Some(i) => i,
            None => return Ok(()),
        };
        forwarder.forward(input.input_id, input.input_message_id, payload)?;
    }
}

async fn stderr_task(
    stderr: ChildStderr,
    runtime_name: RuntimeName,
    mut log: Option<gs_log::RuntimeFileLog>,
    cancel: CancellationToken,
) -> Result<(), RuntimeError> {
    use tokio::io::{AsyncBufReadExt, BufReader};
    let mut lines = BufReader::new(stderr).lines();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            line = lines.next_line() => {
                match line {
                    Ok(Some(l)) => {
                        error!(runtime = %runtime_name, "{l}");
                        if let Some(log) = &mut log {
                            let _ = log.write_line(&l);
                        }
                    }
                    Ok(None) => return Ok(()),
                    Err(e) => return Err(e.into()),
                }
            }
        }
    }
}

async fn trim_task(forwarder: Arc<ForwarderCore>, receiver: Arc<ReceiverCore>, period: Duration, cancel: CancellationToken) -> Result<(), RuntimeError> {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = tokio::time::sleep(period) => {
                if let Some(acks) = forwarder.trim_tick() {
                    receiver.dispatch_acks(acks);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::NullSandbox;
    use gs_lang::RuntimeName;
    use std::collections::{BTreeMap, HashSet};
    use std::net::SocketAddr;

    /// A source operator (`in` empty) whose binary exits immediately
    /// produces a benign stdout EOF; the supervisor should wind the whole
    /// lifecycle down and return `Ok(())` rather than treating the exit
    /// as an error.
    #[tokio::test]
    async fn source_runtime_shuts_down_cleanly_on_child_exit() {
        let dir = tempfile::tempdir().unwrap();
        let config = RuntimeConfig {
            runtime_name: RuntimeName::new("s", "a"),
            binary_path: "/bin/true".into(),
            argv: vec![],
            env: BTreeMap::new(),
            listen_addr: "127.0.0.1:0".parse::<SocketAddr>().unwrap(),
            inbound: HashSet::new(),
            outbound: vec![],
            control_socket_path: dir.path().join("control.sock"),
            sandbox_allowlist: vec![],
            ack_period: Duration::from_millis(20),
            kill_timeout: Duration::from_millis(200),
            log_path: None,
        };
        let outcome = tokio::time::timeout(Duration::from_secs(3), run(config, Arc::new(NullSandbox), CancellationToken::new())).await;
        assert_eq!(outcome.unwrap().unwrap(), ());
    }

    /// Child stderr lands in the configured per-runtime log file, truncated
    /// fresh on this start even though the file already had stale content.
    #[tokio::test]
    async fn child_stderr_is_persisted_to_the_configured_log_file() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("runtime.log");
        std::fs::write(&log_path, b"stale content from a previous run").unwrap();

        let config = RuntimeConfig {
            runtime_name: RuntimeName::new("s", "c"),
            binary_path: "/bin/sh".into(),
            argv: vec!["-c".into(), "echo from-the-child 1>&2".into()],
            env: BTreeMap::new(),
            listen_addr: "127.0.0.1:0".parse::<SocketAddr>().unwrap(),
            inbound: HashSet::new(),
            outbound: vec![],
            control_socket_path: dir.path().join("control.sock"),
            sandbox_allowlist: vec![],
            ack_period: Duration::from_millis(20),
            kill_timeout: Duration::from_millis(200),
            log_path: Some(log_path.clone()),
        };
        let outcome = tokio::time::timeout(Duration::from_secs(3), run(config, Arc::new(NullSandbox), CancellationToken::new())).await;
        assert_eq!(outcome.unwrap().unwrap(), ());

        // The non-blocking file writer flushes on its guard's drop, which
        // happens when `run` returns and `stderr_log` goes out of scope;
        // give the worker thread a moment to land the write regardless.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let contents = std::fs::read_to_string(&log_path).unwrap();
        assert_eq!(contents, "from-the-child\n");
    }

    /// Canceling the external token (the agent's "stop") tears the
    /// supervisor down even though the child would otherwise run forever.
    #[tokio::test]
    async fn external_cancel_stops_a_long_running_child() {
        let dir = tempfile::tempdir().unwrap();
        let config = RuntimeConfig {
            runtime_name: RuntimeName::new("s", "b"),
            binary_path: "/bin/cat".into(),
            argv: vec![],
            env: BTreeMap::new(),
            listen_addr: "127.0.0.1:0".parse::<SocketAddr>().unwrap(),
            inbound: HashSet::new(),
            outbound: vec![],
            control_socket_path: dir.path().join("control.sock"),
            sandbox_allowlist: vec![],
            ack_period: Duration::from_millis(20),
            kill_timeout: Duration::from_millis(200),
            log_path: None,
        };
        let external_cancel = CancellationToken::new();
        let stopper = external_cancel.clone();
        let handle = tokio::spawn(run(config, Arc::new(NullSandbox), external_cancel));
        tokio::time::sleep(Duration::from_millis(50)).await;
        stopper.cancel();
        let outcome = tokio::time::timeout(Duration::from_secs(3), handle).await;
        assert!(outcome.unwrap().unwrap().is_ok());
    }
}
