//! Plan lifecycle: start/stop in topological order, and the protection
//! loop that detects and fixes failed nodes.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use gs_agent::state::{ChangeOutRequest, RunRequest};
use gs_lang::{Address, Plan, PlanNode};
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::state::{MetaState, RunningPlan};
use crate::MetaError;

fn bare_name(runtime_name: &str, scheme: &str) -> String {
    runtime_name.strip_prefix(&format!("{scheme}_")).unwrap_or(runtime_name).to_string()
}

fn run_request_for(plan: &Plan, node: &PlanNode, listen_port: u16) -> RunRequest {
    RunRequest {
        scheme: plan.scheme.name.clone(),
        node: node.node.name.clone(),
        action: node.node.action.clone(),
        argv: node.node.argv.clone(),
        env: node.node.env.clone(),
        listen_addr: SocketAddr::from(([0, 0, 0, 0], listen_port)),
        inbound: node.inbound.iter().map(|r| r.0.clone()).collect(),
        outbound: node.outbound.clone(),
    }
}

/// Sends `run` to every node's agent in topological order; on any failure,
/// rolls back (stops) the nodes already started, in reverse, before
/// surfacing the error.
pub async fn start_plan(state: &Arc<MetaState>, name: &str) -> Result<(), MetaError> {
    if state.is_running(name).await {
        return Err(MetaError::Conflict(format!("scheme {name} is already running")));
    }
    let plan = state.load_plan(name).await?;

    let mut started: Vec<&PlanNode> = Vec::new();
    for node in &plan.nodes {
        let addr = node.active_address();
        let req = run_request_for(&plan, node, addr.port);
        if let Err(err) = state.agent_client().run(addr, &req).await {
            warn!(scheme = name, node = %node.node.name, %err, "watcher: start_plan failed, rolling back");
            for rollback in started.into_iter().rev() {
                let rollback_addr = rollback.active_address();
                let runtime_name = rollback.runtime_name(&plan.scheme.name);
                if let Err(stop_err) = state.agent_client().stop(&rollback_addr.host, &runtime_name.to_string()).await {
                    warn!(scheme = name, node = %rollback.node.name, %stop_err, "watcher: rollback stop failed");
                }
            }
            return Err(err);
        }
        started.push(node);
    }

    let cancel = CancellationToken::new();
    let (dashboard_tx, _) = broadcast::channel(16);
    let running_plan = RunningPlan {
        plan: Arc::new(Mutex::new(plan.clone())),
        cancel: cancel.clone(),
        watcher_task: {
            let state = Arc::clone(state);
            let name = name.to_string();
            let cancel = cancel.clone();
            let dashboard_tx = dashboard_tx.clone();
            tokio::spawn(async move { protection_loop(state, name, cancel, dashboard_tx).await })
        },
        dashboard_tx,
    };
    state.running.lock().await.insert(name.to_string(), running_plan);
    info!(scheme = name, "watcher: plan started");
    Ok(())
}

/// Cancels the protection loop, stops every node in reverse topological
/// order (best-effort), and drops the plan from the running table.
pub async fn stop_plan(state: &Arc<MetaState>, name: &str) -> Result<(), MetaError> {
    let running = state.running.lock().await.remove(name).ok_or_else(|| MetaError::NotFound(format!("running scheme {name}")))?;
    running.cancel.cancel();
    let _ = running.watcher_task.await;

    // Snapshot and drop the plan lock before dialing agents: nothing else
    // holds a reference to this plan anymore (it's already out of the
    // table and the watcher task has been joined), but keeping every lock
    // in this module scoped to plain data access, never to a network round
    // trip, is the pattern `fix_action` below also has to follow.
    let plan = running.plan.lock().await.clone();
    for node in plan.nodes.iter().rev() {
        let addr = node.active_address();
        let runtime_name = node.runtime_name(&plan.scheme.name);
        if let Err(err) = state.agent_client().stop(&addr.host, &runtime_name.to_string()).await {
            warn!(scheme = name, node = %node.node.name, %err, "watcher: stop_plan: stop failed (best-effort)");
        }
    }
    info!(scheme = name, "watcher: plan stopped");
    Ok(())
}

async fn protection_loop(state: Arc<MetaState>, name: String, cancel: CancellationToken, dashboard_tx: broadcast::Sender<String>) {
    let interval = state.config().protection_interval_ms;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(Duration::from_millis(interval)) => {
                protection_tick(&state, &name, &dashboard_tx).await;
            }
        }
    }
}

async fn protection_tick(state: &Arc<MetaState>, name: &str, dashboard_tx: &broadcast::Sender<String>) {
    let hosts: HashSet<String> = {
        let running = state.running.lock().await;
        let Some(entry) = running.get(name) else { return };
        entry.plan.lock().await.nodes.iter().map(|n| n.active_address().host.clone()).collect()
    };

    let mut live: HashMap<String, gs_agent::RuntimeTelemetry> = HashMap::new();
    for host in hosts {
        match state.agent_client().ping(&host).await {
            Ok(telemetry) => {
                for t in telemetry {
                    if t.scheme == name {
                        live.insert(t.node.clone(), t);
                    }
                }
            }
            Err(err) => warn!(scheme = name, host, %err, "watcher: ping failed for host"),
        }
    }

    // A liveness signal for `send_dashboard` subscribers; the full graph
    // snapshot (static edges + this telemetry) is assembled by the
    // websocket handler itself on each of its own ticks. `send` errors
    // when there are no subscribers, which is fine to ignore.
    let _ = dashboard_tx.send(serde_json::json!({ "scheme": name, "live_nodes": live.keys().collect::<Vec<_>>() }).to_string());

    let expected: HashSet<String> = {
        let running = state.running.lock().await;
        let Some(entry) = running.get(name) else { return };
        entry.plan.lock().await.nodes.iter().map(|n| n.node.name.clone()).collect()
    };

    let failed: Vec<String> = expected.difference(&live.keys().cloned().collect()).cloned().collect();
    for failed_node in failed {
        if let Err(err) = fix_action(state, name, &failed_node, &mut live).await {
            warn!(scheme = name, node = failed_node, %err, "watcher: fix_action failed, will retry next tick");
        }
    }
}

/// Rotates the failed node onto its next candidate address, restarts it
/// there, and cascades the move to its predecessors (a live predecessor
/// gets a `change_out`; an already-dead one just gets its bookkeeping
/// rewritten in place). Runs once per protection tick per failed node;
/// since a node that's still down stays in `expected \ live` on the next
/// tick, re-invoking this every tick is the infinite backoff retry, with
/// the protection interval itself as the fixed delay — no separate nested
/// retry loop is needed.
async fn fix_action(
    state: &Arc<MetaState>,
    scheme_name: &str,
    failed_node: &str,
    live: &mut HashMap<String, gs_agent::RuntimeTelemetry>,
) -> Result<(), MetaError> {
    // Clone the plan's `Arc<Mutex<_>>` out and release the table lock
    // immediately: everything below is a network call or a sleep, and the
    // table lock also gates unrelated schemes' `stop`/`is_running` calls.
    let plan_handle = {
        let running = state.running.lock().await;
        let entry = running.get(scheme_name).ok_or_else(|| MetaError::NotFound(scheme_name.to_string()))?;
        Arc::clone(&entry.plan)
    };

    let (old_addr, new_addr, new_index, req) = {
        let plan = plan_handle.lock().await;
        let node_idx = plan.nodes.iter().position(|n| n.node.name == failed_node).ok_or_else(|| MetaError::NotFound(failed_node.to_string()))?;
        let old_addr = plan.nodes[node_idx].active_address().clone();
        let addr_count = plan.nodes[node_idx].node.addresses.len();
        let new_index = (plan.nodes[node_idx].addr_index + 1) % addr_count;
        let new_addr = plan.nodes[node_idx].node.addresses[new_index].clone();
        let req = run_request_for(&plan, &plan.nodes[node_idx], new_addr.port);
        (old_addr, new_addr, new_index, req)
    };

    state.agent_client().run(&new_addr, &req).await?;
    info!(scheme = scheme_name, node = failed_node, old = %old_addr, new = %new_addr, "watcher: fix_action restarted node");

    let predecessors: Vec<String> = {
        let plan = plan_handle.lock().await;
        let node_idx = plan.nodes.iter().position(|n| n.node.name == failed_node).ok_or_else(|| MetaError::NotFound(failed_node.to_string()))?;
        plan.nodes[node_idx].inbound.iter().map(|r| bare_name(&r.0, scheme_name)).collect()
    };

    for pred_name in predecessors {
        if !live.contains_key(&pred_name) {
            // Predecessor is already dead: there's no agent to dial a
            // `change_out` against, so just rewrite our own bookkeeping.
            let mut plan = plan_handle.lock().await;
            if let Some(pred_idx) = plan.nodes.iter().position(|n| n.node.name == pred_name) {
                rewrite_outbound(&mut plan.nodes[pred_idx], &old_addr, &new_addr);
            }
            continue;
        }

        let (pred_host, pred_runtime_name) = {
            let plan = plan_handle.lock().await;
            let Some(pred_idx) = plan.nodes.iter().position(|n| n.node.name == pred_name) else { continue };
            (plan.nodes[pred_idx].active_address().host.clone(), plan.nodes[pred_idx].runtime_name(scheme_name).to_string())
        };
        let change_req = ChangeOutRequest { runtime_name: pred_runtime_name.clone(), old_addr: old_addr.clone(), new_addr: new_addr.clone() };

        let mut ok = false;
        for attempt in 0..state.config().change_out_retry_attempts {
            match state.agent_client().change_out(&pred_host, &change_req).await {
                Ok(()) => {
                    ok = true;
                    break;
                }
                Err(err) => {
                    warn!(scheme = scheme_name, node = pred_name, attempt, %err, "watcher: change_out attempt failed");
                    tokio::time::sleep(state.config().change_out_retry()).await;
                }
            }
        }

        let mut plan = plan_handle.lock().await;
        let Some(pred_idx) = plan.nodes.iter().position(|n| n.node.name == pred_name) else { continue };
        if ok {
            rewrite_outbound(&mut plan.nodes[pred_idx], &old_addr, &new_addr);
        } else {
            warn!(scheme = scheme_name, node = pred_name, "watcher: change_out exhausted retries, declaring predecessor dead");
            drop(plan);
            // Drop it from this tick's live set right away: a later failed
            // node in the same tick that shares this predecessor must see it
            // as already dead instead of burning a full retry cycle to find
            // that out itself.
            live.remove(&pred_name);
            if let Err(stop_err) = state.agent_client().stop(&pred_host, &pred_runtime_name).await {
                warn!(scheme = scheme_name, node = pred_name, %stop_err, "watcher: stop of dead predecessor failed (best-effort)");
            }
        }
    }

    let snapshot = {
        let mut plan = plan_handle.lock().await;
        if let Some(node_idx) = plan.nodes.iter().position(|n| n.node.name == failed_node) {
            plan.nodes[node_idx].addr_index = new_index;
        }
        plan.clone()
    };
    state.save_plan(&snapshot).await?;
    Ok(())
}

fn rewrite_outbound(node: &mut PlanNode, old_addr: &Address, new_addr: &Address) {
    for out in &mut node.outbound {
        if out == old_addr {
            *out = new_addr.clone();
        }
    }
}
