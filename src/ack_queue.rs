//! Per-connection FIFO of outbound messages awaiting a client ack.
//!
//! Mirrors the reference service's worker-task-over-a-channel shape (see
//! `ws_forwarder`'s command channel and the ack-tracking worker this
//! codebase models acks on): one dedicated task owns the FIFO + map and
//! talks to the rest of the connection only through channels.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::protocol::Envelope;

struct Entry {
    msg: Envelope,
    retry_count: u32,
    /// When this entry's retry timer next fires. Anchored to an `Instant`
    /// rather than re-armed as a fixed-duration sleep each loop pass, so
    /// unrelated `Put`/`Ack` traffic on other entries can't restart the
    /// head's countdown from zero.
    deadline: Instant,
}

enum Command {
    Put(Envelope, oneshot::Sender<i64>),
    Ack(i64),
    Close,
}

/// Handle to a running Ack-Queue. Cloning shares the same underlying worker.
#[derive(Clone)]
pub struct AckQueue {
    next_id: Arc<AtomicI64>,
    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl AckQueue {
    /// Spawns the worker task and returns a handle. `retry_tx` is the
    /// connection's retry channel; `timeout` is the fixed per-entry retry
    /// delay.
    pub fn spawn(timeout: Duration, retry_cap: u32, retry_tx: mpsc::Sender<Envelope>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let worker = Worker {
            entries: HashMap::new(),
            order: VecDeque::new(),
            timeout,
            retry_cap,
            retry_tx,
            closed: false,
        };
        tokio::spawn(worker.run(cmd_rx));
        Self {
            next_id: Arc::new(AtomicI64::new(1)),
            cmd_tx,
        }
    }

    /// Assigns the next ack-id (never 0, wraps past i64::MAX back to 1),
    /// enqueues the message, and returns the id. Mutates `msg.ack_id` to
    /// match, like the entry itself will carry.
    pub async fn put(&self, mut msg: Envelope) -> i64 {
        let ack_id = self.next_ack_id();
        msg.ack_id = Some(ack_id);
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Put(msg, tx)).is_err() {
            return ack_id;
        }
        rx.await.unwrap_or(ack_id)
    }

    pub fn ack(&self, ack_id: i64) {
        let _ = self.cmd_tx.send(Command::Ack(ack_id));
    }

    pub fn close(&self) {
        let _ = self.cmd_tx.send(Command::Close);
    }

    fn next_ack_id(&self) -> i64 {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
            // Wrapped through 0 (extraordinarily unlikely at i64 width);
            // skip-zero discipline per spec.
            self.next_id.store(1, Ordering::Relaxed);
        }
    }
}

struct Worker {
    entries: HashMap<i64, Entry>,
    order: VecDeque<i64>,
    timeout: Duration,
    retry_cap: u32,
    retry_tx: mpsc::Sender<Envelope>,
    closed: bool,
}

impl Worker {
    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<Command>) {
        loop {
            if self.closed {
                while cmd_rx.recv().await.is_some() {}
                return;
            }

            let head = self.order.front().copied();
            match head {
                None => {
                    // Idle: only commands can make progress.
                    match cmd_rx.recv().await {
                        Some(cmd) => self.handle(cmd),
                        None => return,
                    }
                }
                Some(ack_id) => {
                    // The head's deadline is anchored to an `Instant` set
                    // when the entry was (re-)queued, not a duration timer
                    // re-armed on every loop pass -- handling a `Put`/`Ack`
                    // for some other entry re-enters this loop and must not
                    // push the head's own retry further out.
                    let deadline = self.entries[&ack_id].deadline;
                    // Racing the command channel against the head entry's
                    // timer *is* the cancellation token from the spec: an
                    // incoming `Ack`/`Close` command is handled the instant
                    // it arrives, before the timer branch can fire, because
                    // both are driven by this single task's select loop.
                    tokio::select! {
                        biased;
                        cmd = cmd_rx.recv() => {
                            match cmd {
                                Some(cmd) => self.handle(cmd),
                                None => return,
                            }
                        }
                        _ = tokio::time::sleep_until(deadline) => {
                            self.fire_timeout(ack_id);
                        }
                    }
                }
            }
        }
    }

    fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Put(msg, reply) => {
                let ack_id = msg.ack_id.expect("ack_id assigned by caller");
                let entry = Entry {
                    msg,
                    retry_count: 0,
                    deadline: Instant::now() + self.timeout,
                };
                self.entries.insert(ack_id, entry);
                self.order.push_back(ack_id);
                let _ = reply.send(ack_id);
            }
            Command::Ack(ack_id) => {
                if self.entries.remove(&ack_id).is_some() {
                    self.order.retain(|id| *id != ack_id);
                }
            }
            Command::Close => {
                self.closed = true;
                self.entries.clear();
                self.order.clear();
            }
        }
    }

    fn fire_timeout(&mut self, ack_id: i64) {
        // The entry may have been acked between being chosen as head and
        // the timer firing if `handle` ran in between on this same task —
        // it can't have, since this function itself runs only when the
        // select's timer branch wins over the command branch.
        let Some(entry) = self.entries.get_mut(&ack_id) else {
            self.order.pop_front();
            return;
        };

        entry.retry_count += 1;
        let msg = entry.msg.clone();
        if self.retry_tx.try_send(msg).is_err() {
            debug!(ack_id, "retry channel full or closed, dropping delivery");
        }

        if entry.retry_count >= self.retry_cap {
            warn!(ack_id, "ack retry cap exceeded, dropping entry");
            self.entries.remove(&ack_id);
            self.order.pop_front();
        } else {
            entry.deadline = Instant::now() + self.timeout;
            self.order.pop_front();
            self.order.push_back(ack_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Kind, MsgType, NewMessageNotify};
    use std::time::Duration;

    fn sample_envelope() -> Envelope {
        Envelope::new(
            MsgType::NewMessage,
            &NewMessageNotify {
                kind: Kind::Single,
                session_id: 1,
                seq: 1,
            },
        )
    }

    #[tokio::test]
    async fn ack_before_timeout_suppresses_all_retries() {
        let (retry_tx, mut retry_rx) = mpsc::channel(8);
        let q = AckQueue::spawn(Duration::from_millis(40), 3, retry_tx);
        let ack_id = q.put(sample_envelope()).await;
        assert_ne!(ack_id, 0);
        q.ack(ack_id);

        let res = tokio::time::timeout(Duration::from_millis(150), retry_rx.recv()).await;
        assert!(res.is_err(), "expected no retry after ack");
    }

    #[tokio::test]
    async fn retry_cap_stops_after_three_attempts() {
        let (retry_tx, mut retry_rx) = mpsc::channel(8);
        let q = AckQueue::spawn(Duration::from_millis(20), 3, retry_tx);
        let _ack_id = q.put(sample_envelope()).await;

        for _ in 0..3 {
            let got = tokio::time::timeout(Duration::from_millis(200), retry_rx.recv()).await;
            assert!(got.unwrap().is_some());
        }
        let extra = tokio::time::timeout(Duration::from_millis(100), retry_rx.recv()).await;
        assert!(extra.is_err(), "no retries should be emitted past the cap");
    }

    #[tokio::test]
    async fn double_ack_and_unknown_ack_are_silent() {
        let (retry_tx, _retry_rx) = mpsc::channel(8);
        let q = AckQueue::spawn(Duration::from_millis(50), 3, retry_tx);
        let ack_id = q.put(sample_envelope()).await;
        q.ack(ack_id);
        q.ack(ack_id); // double ack, no panic
        q.ack(999_999); // unknown id, no panic
    }

    #[tokio::test]
    async fn ack_ids_are_nonzero_and_distinct() {
        let (retry_tx, _retry_rx) = mpsc::channel(8);
        let q = AckQueue::spawn(Duration::from_secs(10), 3, retry_tx);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..100 {
            let id = q.put(sample_envelope()).await;
            assert_ne!(id, 0);
            assert!(seen.insert(id), "ack ids must be distinct before wrap");
        }
    }

    #[tokio::test]
    async fn close_cancels_outstanding_entries() {
        let (retry_tx, mut retry_rx) = mpsc::channel(8);
        let q = AckQueue::spawn(Duration::from_millis(30), 3, retry_tx);
        let _ack_id = q.put(sample_envelope()).await;
        q.close();

        let res = tokio::time::timeout(Duration::from_millis(120), retry_rx.recv()).await;
        assert!(res.is_err(), "closed queue must not emit retries");
    }

    #[tokio::test]
    async fn unrelated_traffic_does_not_delay_the_head_retry() {
        let (retry_tx, mut retry_rx) = mpsc::channel(8);
        let q = AckQueue::spawn(Duration::from_millis(60), 3, retry_tx);
        let head_id = q.put(sample_envelope()).await;

        // Keep putting and acking unrelated entries every 20ms, well inside
        // the head's 60ms deadline, for longer than that deadline. If the
        // head's timer were re-armed on every loop pass instead of anchored
        // to its own deadline, this traffic would starve its retry.
        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let other_id = q.put(sample_envelope()).await;
            q.ack(other_id);
        }

        let got = tokio::time::timeout(Duration::from_millis(100), retry_rx.recv()).await;
        let retried = got.expect("head entry should have retried by now");
        assert_eq!(retried.unwrap().ack_id, Some(head_id));
    }
}
