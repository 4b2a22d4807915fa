//! One logical client connection: state plus the four cooperating fibers
//! (reader, writer, heartbeater, retry-drainer) that pump it, grounded in
//! the reference service's per-connection WebSocket task shape (see
//! `ws_forwarder::handle_forwarder_socket`'s `tokio::select!` loop) but
//! split across dedicated fibers per the spec instead of one combined
//! loop, since this tier additionally needs an independent retry-drain
//! path fed by the Ack-Queue.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::ack_queue::AckQueue;
use crate::protocol::{error_codes, AckPayload, Envelope, MessageBody, MsgType, PollMessageReq};
use crate::shared::Shared;

/// Non-owning reference to a live connection; this is what the Hub keeps
/// in its registry and what the Ack-Queue/fan-out path sends through.
#[derive(Clone)]
pub struct ConnectionHandle {
    pub user_id: i64,
    /// Distinguishes this connection instance from a later replacement
    /// under the same user-id, so a stale close doesn't unregister a
    /// connection that has already superseded it.
    pub id: uuid::Uuid,
    write_tx: mpsc::Sender<Envelope>,
    pub ack_queue: AckQueue,
    cancel: CancellationToken,
}

impl ConnectionHandle {
    /// Non-blocking enqueue into the write channel; drops and logs if full
    /// or the connection is already closed -- the caller (fan-out) is not
    /// a correctness path for this connection's delivery.
    pub fn send(&self, msg: Envelope) {
        if self.write_tx.try_send(msg).is_err() {
            debug!(user_id = self.user_id, "write channel full or closed, dropping send");
        }
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }
}

/// Spawns a connection's fibers over an already-upgraded, already
/// authenticated socket and returns the handle the Hub registers.
pub fn spawn(user_id: i64, socket: WebSocket, shared: Arc<Shared>) -> ConnectionHandle {
    // Descends from the Hub's root token, so `hub::stop()` tears down every
    // live connection along with the dispatcher loop.
    let cancel = shared.root_cancel().child_token();
    let (write_tx, write_rx) = mpsc::channel(shared.config.write_channel_capacity);
    let (retry_tx, retry_rx) = mpsc::channel(shared.config.retry_channel_capacity);
    let (hb_tx, hb_rx) = mpsc::channel(1);
    let ack_queue = AckQueue::spawn(
        shared.config.ack_retry_timeout,
        shared.config.ack_retry_cap,
        retry_tx,
    );
    let last_acked_seq = Arc::new(Mutex::new(0i64));

    let handle = ConnectionHandle {
        user_id,
        id: uuid::Uuid::new_v4(),
        write_tx: write_tx.clone(),
        ack_queue: ack_queue.clone(),
        cancel: cancel.clone(),
    };

    let (sink, stream) = socket.split();

    tokio::spawn(write_fiber(sink, write_rx, cancel.clone()));
    tokio::spawn(heartbeat_fiber(
        hb_rx,
        cancel.clone(),
        shared.config.heartbeat_timeout,
    ));
    tokio::spawn(retry_drain_fiber(retry_rx, write_tx.clone(), cancel.clone()));
    tokio::spawn(read_fiber(
        stream,
        user_id,
        shared.clone(),
        ack_queue.clone(),
        hb_tx,
        last_acked_seq,
        write_tx,
        cancel.clone(),
    ));
    tokio::spawn(closer_fiber(user_id, handle.id, shared, ack_queue, cancel));

    handle
}

/// Waits for cancellation (from any fiber noticing the socket is dead, or
/// from the Hub replacing this connection) and runs the one-shot teardown:
/// Ack-Queue close, `Disconnect` RPC with a bounded timeout, registry
/// unlink. Centralizing this keeps `close()` idempotent regardless of
/// which fiber triggers it first.
async fn closer_fiber(
    user_id: i64,
    connection_id: uuid::Uuid,
    shared: Arc<Shared>,
    ack_queue: AckQueue,
    cancel: CancellationToken,
) {
    cancel.cancelled().await;
    ack_queue.close();

    let disconnect = shared.user_rpc.disconnect(user_id);
    match tokio::time::timeout(shared.config.disconnect_rpc_timeout, disconnect).await {
        Ok(Err(e)) => warn!(code = error_codes::RPC_DISCONNECT_FAILED, user_id, error = %e),
        Err(_) => warn!(code = error_codes::RPC_DISCONNECT_FAILED, user_id, "disconnect RPC timed out"),
        Ok(Ok(())) => {}
    }

    shared.unregister(user_id, connection_id);
    info!(user_id, "connection closed");
}

async fn write_fiber(
    mut sink: futures_util::stream::SplitSink<WebSocket, Message>,
    mut write_rx: mpsc::Receiver<Envelope>,
    cancel: CancellationToken,
) {
    loop {
        let envelope = tokio::select! {
            _ = cancel.cancelled() => return,
            msg = write_rx.recv() => match msg {
                Some(m) => m,
                None => return,
            },
        };
        let Ok(json) = serde_json::to_string(&envelope) else {
            continue;
        };
        if sink.send(Message::Text(json)).await.is_err() {
            cancel.cancel();
            return;
        }
    }
}

async fn heartbeat_fiber(
    mut hb_rx: mpsc::Receiver<()>,
    cancel: CancellationToken,
    timeout: Duration,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            signal = hb_rx.recv() => {
                if signal.is_none() {
                    return;
                }
                // Loop back around; the sleep below is re-armed fresh.
            }
            _ = tokio::time::sleep(timeout) => {
                cancel.cancel();
                return;
            }
        }
    }
}

async fn retry_drain_fiber(
    mut retry_rx: mpsc::Receiver<Envelope>,
    write_tx: mpsc::Sender<Envelope>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            msg = retry_rx.recv() => match msg {
                Some(m) => {
                    if write_tx.try_send(m).is_err() {
                        debug!("write channel full while draining a retry, dropping");
                    }
                }
                None => return,
            },
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn read_fiber(
    mut stream: futures_util::stream::SplitStream<WebSocket>,
    user_id: i64,
    shared: Arc<Shared>,
    ack_queue: AckQueue,
    hb_tx: mpsc::Sender<()>,
    last_acked_seq: Arc<Mutex<i64>>,
    write_tx: mpsc::Sender<Envelope>,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return,
            frame = stream.next() => frame,
        };
        let Some(frame) = frame else {
            cancel.cancel();
            return;
        };
        let msg = match frame {
            Ok(m) => m,
            Err(e) => {
                warn!(user_id, error = %e, "transport error reading frame");
                cancel.cancel();
                return;
            }
        };

        let text = match msg {
            Message::Text(t) => t,
            Message::Close(_) => {
                cancel.cancel();
                return;
            }
            // Binary frames are ignored per spec; ping/pong are handled
            // transparently by axum.
            _ => continue,
        };

        let envelope: Envelope = match serde_json::from_str(&text) {
            Ok(e) => e,
            Err(e) => {
                warn!(code = error_codes::PROTOCOL_DECODE_FAILED, user_id, error = %e, "dropping malformed frame");
                continue;
            }
        };

        if let Err(e) = dispatch(
            envelope,
            user_id,
            &shared,
            &ack_queue,
            &hb_tx,
            &last_acked_seq,
            &write_tx,
        )
        .await
        {
            warn!(user_id, error = %e, "dropping frame after decode/dispatch error");
        }
    }
}

async fn dispatch(
    envelope: Envelope,
    user_id: i64,
    shared: &Arc<Shared>,
    ack_queue: &AckQueue,
    hb_tx: &mpsc::Sender<()>,
    last_acked_seq: &Arc<Mutex<i64>>,
    write_tx: &mpsc::Sender<Envelope>,
) -> Result<(), serde_json::Error> {
    match envelope.ty {
        MsgType::Ack => {
            let ack: AckPayload = envelope.decode_data()?;
            if ack.ty.is_ack_id_tracked() {
                if let Some(ack_id) = ack.ack_id {
                    ack_queue.ack(ack_id);
                }
            } else if ack.ty == MsgType::Message {
                if let (Some(kind), Some(session_id), Some(seq)) = (ack.kind, ack.id, ack.seq) {
                    let mut guard = last_acked_seq.lock().await;
                    if seq > *guard {
                        shared.msg_box.ack(kind, session_id, seq).await;
                        *guard = seq;
                    }
                    drop(guard);
                    if let Err(e) = shared.message_rpc.ack_message(session_id, seq).await {
                        warn!(code = error_codes::RPC_ACK_MESSAGE_FAILED, session_id, seq, error = %e);
                    }
                }
            }
        }
        MsgType::Heartbeat => {
            if shared.user_rpc.heartbeat(user_id).await.is_ok() {
                let _ = hb_tx.try_send(());
            } else {
                warn!(code = error_codes::RPC_HEARTBEAT_FAILED, user_id);
            }
        }
        MsgType::Message => {
            let req: PollMessageReq = envelope.decode_data()?;
            let msgs: Vec<MessageBody> = shared
                .msg_box
                .list(req.kind, req.session_id, req.seq)
                .await;
            if msgs.is_empty() {
                // TODO: fall back to the message service's history API
                // when the local buffer has nothing to replay; left open
                // per spec rather than inventing a behavior.
            }
            let resp = Envelope::new(MsgType::Message, &msgs);
            let _ = write_tx.try_send(resp);
        }
        other => {
            warn!(user_id, ty = ?other, "unexpected client-originated frame type");
        }
    }
    Ok(())
}
