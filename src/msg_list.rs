//! Per-session ordered buffer of messages awaiting recipient acks.
//!
//! A doubly-linked FIFO would be the direct translation of the reference
//! Go list, but an index-stable `VecDeque` plus a `seq -> index` map gives
//! the same O(1) ack-by-seq and O(1) append with a simpler borrow shape,
//! at the cost of O(n) unlink compaction -- acceptable since unlinked
//! entries are always removed from the *front* of the deque in practice
//! (insertion order matches seq order within a session).

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use crate::protocol::MessageBody;

struct Node {
    content: MessageBody,
    seq: i64,
    unread: i64,
}

struct Inner {
    nodes: VecDeque<Node>,
    index: HashMap<i64, usize>,
}

/// Per-session message buffer, safe to share behind an `Arc`.
pub struct MsgList {
    inner: Mutex<Inner>,
}

impl MsgList {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                nodes: VecDeque::new(),
                index: HashMap::new(),
            }),
        }
    }

    /// Appends a message at the tail with the given unread (recipient)
    /// count.
    pub fn insert(&self, content: MessageBody, unread: i64) {
        let seq = content.seq;
        let mut inner = self.inner.lock().unwrap();
        inner.nodes.push_back(Node {
            content,
            seq,
            unread,
        });
        let pos = inner.nodes.len() - 1;
        inner.index.insert(seq, pos);
    }

    /// Applies an ack at `seq`: walks backward from the node at `seq` to
    /// the head, decrementing `unread` on each node and removing any that
    /// reach zero. An ack at `seq` implies an ack of every earlier message
    /// in the session.
    pub fn ack(&self, seq: i64) {
        let mut inner = self.inner.lock().unwrap();
        let Some(&from_pos) = inner.index.get(&seq) else {
            return;
        };

        let mut to_remove = Vec::new();
        for pos in (0..=from_pos).rev() {
            let node = &mut inner.nodes[pos];
            node.unread -= 1;
            if node.unread <= 0 {
                to_remove.push(node.seq);
            }
        }
        for seq in to_remove {
            inner.remove(seq);
        }
    }

    /// Returns every message with seq >= `seq`, in insertion order.
    pub fn list(&self, seq: i64) -> Vec<MessageBody> {
        let inner = self.inner.lock().unwrap();
        inner
            .nodes
            .iter()
            .filter(|n| n.seq >= seq)
            .map(|n| n.content.clone())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().nodes.is_empty()
    }
}

impl Default for MsgList {
    fn default() -> Self {
        Self::new()
    }
}

impl Inner {
    fn remove(&mut self, seq: i64) {
        let Some(pos) = self.index.remove(&seq) else {
            return;
        };
        self.nodes.remove(pos);
        // Every index after `pos` shifted left by one.
        for v in self.index.values_mut() {
            if *v > pos {
                *v -= 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Kind;

    fn body(seq: i64) -> MessageBody {
        MessageBody {
            id: seq,
            session_id: 42,
            from_id: 1,
            to_id: 2,
            seq,
            kind: Kind::Single,
            content: format!("msg-{seq}"),
            created_at: 0,
        }
    }

    #[test]
    fn single_chat_ack_removes_node_immediately() {
        let list = MsgList::new();
        list.insert(body(7), 1);
        assert!(!list.is_empty());
        list.ack(7);
        assert!(list.is_empty());
    }

    #[test]
    fn implicit_ack_removes_all_earlier_nodes() {
        let list = MsgList::new();
        list.insert(body(10), 1);
        list.insert(body(11), 1);
        list.insert(body(12), 1);
        list.ack(12);
        assert!(list.is_empty());
    }

    #[test]
    fn group_node_survives_until_all_members_ack() {
        let list = MsgList::new();
        list.insert(body(1), 3);
        list.ack(1);
        assert_eq!(list.list(0).len(), 1, "still pending after first ack");
        list.ack(1);
        assert_eq!(list.list(0).len(), 1, "still pending after second ack");
        list.ack(1);
        assert!(list.is_empty(), "removed after third ack reaches zero");
    }

    #[test]
    fn list_returns_nodes_with_seq_at_or_above_query_in_order() {
        let list = MsgList::new();
        for seq in 1..=5 {
            list.insert(body(seq), 1000); // high unread so nothing is removed
        }
        let out = list.list(3);
        let seqs: Vec<i64> = out.iter().map(|m| m.seq).collect();
        assert_eq!(seqs, vec![3, 4, 5]);
    }

    #[test]
    fn ack_for_unknown_seq_is_silent() {
        let list = MsgList::new();
        list.insert(body(1), 1);
        list.ack(999);
        assert_eq!(list.list(0).len(), 1);
    }
}
