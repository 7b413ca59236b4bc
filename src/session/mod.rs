//! WebSocket session actor
//!
//! One session per live agent connection. Inbound frames are handled
//! strictly in arrival order; all outbound traffic funnels through a
//! single writer task so frame order to one agent is the order the hub
//! produced. The session itself is stateless beyond connection
//! identity: every inbound frame translates into a lifecycle or queue
//! call, and scheduler pushes arrive through the handle registered with
//! the lifecycle at identify time.

pub mod protocol;

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::auth::AuthTokens;
use crate::config::SessionConfig;
use crate::constants::PROTOCOL_VERSION;
use crate::lifecycle::{AgentLifecycle, SessionHandle};
use crate::models::AgentFsmState;
use crate::queue::TaskQueue;
use crate::ratelimit::{RateChannel, RateDecision, RateLimiter, RateTier};
use crate::validation::IngressValidator;

use protocol::{ClientFrame, ServerFrame};

/// Everything a session needs from the rest of the hub.
#[derive(Clone)]
pub struct SessionContext {
    pub lifecycle: AgentLifecycle,
    pub queue: TaskQueue,
    pub limiter: RateLimiter,
    pub auth: Arc<dyn AuthTokens>,
    pub validator: IngressValidator,
    pub config: SessionConfig,
}

/// Cost classification for the rate-limit gate, by frame type.
fn ingress_tier(frame: &ClientFrame) -> RateTier {
    match frame {
        ClientFrame::Identify { .. }
        | ClientFrame::TaskComplete { .. }
        | ClientFrame::TaskFailed { .. }
        | ClientFrame::StateReport { .. } => RateTier::Heavy,
        ClientFrame::TaskAccepted { .. }
        | ClientFrame::TaskRejected { .. }
        | ClientFrame::Ping { .. }
        | ClientFrame::Pong { .. }
        | ClientFrame::Close { .. } => RateTier::Normal,
        ClientFrame::TaskProgress { .. } => RateTier::Light,
    }
}

/// Drives one accepted WebSocket connection to its end. When this
/// returns the session is gone and the lifecycle has been told.
pub async fn serve_socket(socket: WebSocket, ctx: SessionContext) {
    let (mut sink, mut stream) = socket.split();
    let idle_timeout = Duration::from_millis(ctx.config.idle_timeout_ms);

    // Handshake: the first frame must be a valid identify.
    let identify = match tokio::time::timeout(idle_timeout, stream.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => match serde_json::from_str::<ClientFrame>(&text) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(error = %e, "undecodable handshake frame");
                let _ = send_raw(&mut sink, &ServerFrame::identify_error("malformed frame")).await;
                return;
            }
        },
        _ => {
            debug!("connection closed before identify");
            return;
        }
    };

    let ClientFrame::Identify {
        agent_id,
        token,
        capabilities,
        protocol_version,
        ..
    } = identify
    else {
        let _ = send_raw(
            &mut sink,
            &ServerFrame::identify_error("identify must be the first frame"),
        )
        .await;
        return;
    };

    if protocol_version > PROTOCOL_VERSION {
        let _ = send_raw(
            &mut sink,
            &ServerFrame::identify_error("unsupported protocol version"),
        )
        .await;
        return;
    }
    if ctx.validator.validate_agent_id(&agent_id).is_err()
        || ctx.validator.validate_capabilities(&capabilities).is_err()
    {
        let _ = send_raw(
            &mut sink,
            &ServerFrame::identify_error("invalid agent id or capabilities"),
        )
        .await;
        return;
    }

    if let RateDecision::Deny { retry_after_ms } =
        ctx.limiter
            .check(&agent_id, RateChannel::Ws, RateTier::Heavy, 1)
    {
        let _ = send_raw(
            &mut sink,
            &ServerFrame::rate_limited(RateTier::Heavy.as_str(), retry_after_ms),
        )
        .await;
        return;
    }

    if !ctx.auth.validate(&agent_id, &token).await {
        warn!(%agent_id, "identify failed token validation");
        let _ = send_raw(&mut sink, &ServerFrame::identify_error("invalid token")).await;
        return;
    }

    // Registered before `identified` goes out so a push cannot race the
    // handshake reply: both travel the same writer channel.
    let (tx, mut outbound) = mpsc::unbounded_channel::<ServerFrame>();
    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            match serde_json::to_string(&frame) {
                Ok(json) => {
                    if sink.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!(error = %e, "failed to encode outbound frame"),
            }
        }
    });

    let _ = tx.send(ServerFrame::identified(&agent_id));
    ctx.lifecycle
        .ensure(&agent_id, capabilities, tx.clone())
        .await;
    info!(%agent_id, "session established");

    run_read_loop(&ctx, &agent_id, &mut stream, &tx).await;

    // Only tear the agent down if a newer session has not already
    // replaced this one.
    ctx.lifecycle
        .on_session_loss_if_current(&agent_id, &tx)
        .await;
    drop(tx);
    let _ = writer.await;
    info!(%agent_id, "session closed");
}

async fn run_read_loop(
    ctx: &SessionContext,
    agent_id: &str,
    stream: &mut (impl Stream<Item = Result<Message, axum::Error>> + Unpin),
    tx: &SessionHandle,
) {
    let keepalive = Duration::from_millis(ctx.config.keepalive_ms);
    let idle_timeout = Duration::from_millis(ctx.config.idle_timeout_ms);
    let mut ticker = tokio::time::interval(keepalive);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last_inbound = tokio::time::Instant::now();

    loop {
        tokio::select! {
            message = stream.next() => {
                let Some(Ok(message)) = message else {
                    debug!(agent_id, "socket ended");
                    return;
                };
                last_inbound = tokio::time::Instant::now();
                match message {
                    Message::Text(text) => {
                        let frame = match serde_json::from_str::<ClientFrame>(&text) {
                            Ok(frame) => frame,
                            Err(e) => {
                                // Unknown type or malformed JSON closes
                                // the connection, loudly.
                                warn!(agent_id, error = %e, "closing on undecodable frame");
                                let _ = tx.send(ServerFrame::close(1002, "unknown frame type"));
                                return;
                            }
                        };
                        if !handle_frame(ctx, agent_id, frame, tx).await {
                            return;
                        }
                    }
                    Message::Close(_) => {
                        debug!(agent_id, "peer closed");
                        return;
                    }
                    // Transport-level ping/pong and binary frames carry
                    // no protocol meaning; they only refresh liveness.
                    _ => {}
                }
            }
            _ = ticker.tick() => {
                if last_inbound.elapsed() >= idle_timeout {
                    warn!(agent_id, "idle timeout, closing session");
                    let _ = tx.send(ServerFrame::close(1001, "idle timeout"));
                    return;
                }
                let _ = tx.send(ServerFrame::ping(rand::random::<u64>()));
            }
        }
    }
}

/// Handles one post-identify frame. Returns false when the session
/// should close.
pub(crate) async fn handle_frame(
    ctx: &SessionContext,
    agent_id: &str,
    frame: ClientFrame,
    tx: &SessionHandle,
) -> bool {
    let tier = ingress_tier(&frame);
    match ctx.limiter.check(agent_id, RateChannel::Ws, tier, 1) {
        RateDecision::Deny { retry_after_ms } => {
            let _ = tx.send(ServerFrame::rate_limited(tier.as_str(), retry_after_ms));
            return true;
        }
        RateDecision::AllowWarn => {
            let _ = tx.send(ServerFrame::rate_limited(tier.as_str(), 0));
        }
        RateDecision::Allow => {}
    }

    match frame {
        ClientFrame::Identify { .. } => {
            warn!(agent_id, "re-identify on established session");
            let _ = tx.send(ServerFrame::close(1002, "already identified"));
            false
        }
        ClientFrame::TaskAccepted {
            task_id,
            generation,
            ..
        } => {
            ctx.lifecycle
                .on_accepted(agent_id, &task_id, generation)
                .await;
            true
        }
        ClientFrame::TaskRejected {
            task_id,
            generation,
            reason,
            ..
        } => {
            ctx.lifecycle
                .on_rejected(
                    agent_id,
                    &task_id,
                    generation,
                    reason.as_deref().unwrap_or("rejected"),
                )
                .await;
            true
        }
        ClientFrame::TaskProgress {
            task_id,
            generation,
            percent,
            ..
        } => {
            ctx.queue.update_progress(&task_id, generation, percent).await;
            true
        }
        ClientFrame::TaskComplete {
            task_id,
            generation,
            result,
            ..
        } => {
            let ack = ctx
                .lifecycle
                .on_completed(agent_id, &task_id, generation, result)
                .await;
            let _ = tx.send(ServerFrame::task_ack(&task_id, ack.as_str()));
            true
        }
        ClientFrame::TaskFailed {
            task_id,
            generation,
            reason,
            ..
        } => {
            let ack = ctx
                .lifecycle
                .on_failed(agent_id, &task_id, generation, &reason)
                .await;
            let _ = tx.send(ServerFrame::task_ack(&task_id, ack.as_str()));
            true
        }
        ClientFrame::StateReport {
            task_id,
            status,
            generation,
            ..
        } => {
            reconcile_state_report(ctx, agent_id, task_id, &status, generation, tx).await;
            true
        }
        ClientFrame::Ping { nonce, .. } => {
            let _ = tx.send(ServerFrame::pong(nonce));
            true
        }
        ClientFrame::Pong { .. } => true,
        ClientFrame::Close { reason, .. } => {
            debug!(agent_id, ?reason, "graceful close requested");
            false
        }
    }
}

/// Reconnect reconciliation.
///
/// The hub's view wins: stale or unknown agent work is told to abandon,
/// an unacked assignment the agent is already working is promoted, and
/// an agent that came back idle while the hub still shows it working
/// has its task reclaimed.
async fn reconcile_state_report(
    ctx: &SessionContext,
    agent_id: &str,
    reported_task: Option<String>,
    reported_status: &str,
    reported_generation: Option<u64>,
    tx: &SessionHandle,
) {
    let hub_view = ctx.lifecycle.snapshot_of(agent_id).await;
    let hub_pair = hub_view.as_ref().and_then(|s| {
        s.current_task_id
            .clone()
            .zip(s.current_generation)
            .map(|(t, g)| (t, g, s.fsm_state))
    });
    let agent_is_idle = reported_task.is_none() || reported_status == "idle";

    match hub_pair {
        None => {
            if let Some(task_id) = reported_task {
                debug!(agent_id, %task_id, "reconcile: no assignment on record");
                let _ = tx.send(ServerFrame::task_abandon(
                    Some(&task_id),
                    "no assignment on record",
                ));
            }
        }
        Some((hub_task, hub_generation, hub_state)) => {
            if agent_is_idle {
                // Hub shows work in flight, agent came back empty.
                info!(agent_id, task_id = %hub_task, "reconcile: agent reports idle");
                ctx.lifecycle
                    .on_rejected(agent_id, &hub_task, hub_generation, "state_report: idle")
                    .await;
                return;
            }
            let matches = reported_task.as_deref() == Some(hub_task.as_str())
                && reported_generation == Some(hub_generation);
            if matches {
                if reported_status == "working" && hub_state == AgentFsmState::Assigned {
                    // The accept ack was lost with the old session.
                    ctx.lifecycle
                        .on_accepted(agent_id, &hub_task, hub_generation)
                        .await;
                }
                // Otherwise the views agree; carry on.
            } else {
                debug!(agent_id, "reconcile: stale generation");
                let _ = tx.send(ServerFrame::task_abandon(
                    reported_task.as_deref(),
                    "stale generation",
                ));
            }
        }
    }
}

async fn send_raw(
    sink: &mut (impl Sink<Message> + Unpin),
    frame: &ServerFrame,
) -> Result<(), ()> {
    let json = serde_json::to_string(frame).map_err(|_| ())?;
    sink.send(Message::Text(json.into())).await.map_err(|_| ())
}
