//! Shards [`MsgList`]s across a fixed bucket array keyed by `crc32(key) mod
//! N`, bounding lock contention the way the reference bucketed registries
//! in this codebase (see `state::BroadcastRegistry`) shard by key rather
//! than holding one big map under one lock.

use std::sync::{Arc, RwLock};

use tokio::sync::RwLock as AsyncRwLock;

use crate::msg_list::MsgList;
use crate::protocol::{Kind, MessageBody};

fn session_key(kind: Kind, session_id: i64) -> String {
    format!("box-{kind}:{session_id}")
}

fn bucket_index(key: &str, bucket_count: usize) -> usize {
    (crc32fast::hash(key.as_bytes()) as usize) % bucket_count
}

struct Bucket {
    entries: RwLock<std::collections::HashMap<String, Arc<MsgList>>>,
}

impl Bucket {
    fn new() -> Self {
        Self {
            entries: RwLock::new(std::collections::HashMap::new()),
        }
    }

    fn get_or_create(&self, key: &str) -> Arc<MsgList> {
        if let Some(list) = self.entries.read().unwrap().get(key) {
            return list.clone();
        }
        let mut entries = self.entries.write().unwrap();
        entries
            .entry(key.to_owned())
            .or_insert_with(|| Arc::new(MsgList::new()))
            .clone()
    }

    fn get(&self, key: &str) -> Option<Arc<MsgList>> {
        self.entries.read().unwrap().get(key).cloned()
    }
}

/// Sharded registry of per-session [`MsgList`]s.
pub struct MsgBox {
    buckets: Vec<AsyncRwLock<Option<Arc<Bucket>>>>,
}

impl MsgBox {
    pub fn new(bucket_count: usize) -> Self {
        let mut buckets = Vec::with_capacity(bucket_count);
        buckets.resize_with(bucket_count, || AsyncRwLock::new(None));
        Self { buckets }
    }

    /// Appends `msg` to the Msg-List for `(kind, msg.session_id)`, lazily
    /// creating the bucket and the list.
    pub async fn append(&self, msg: MessageBody, kind: Kind, unread: i64) {
        let key = session_key(kind, msg.session_id);
        let idx = bucket_index(&key, self.buckets.len());
        let bucket = self.bucket_or_create(idx).await;
        bucket.get_or_create(&key).insert(msg, unread);
    }

    /// Acks `seq` in the Msg-List for `(kind, session_id)`; a no-op if no
    /// such bucket/list exists yet.
    pub async fn ack(&self, kind: Kind, session_id: i64, seq: i64) {
        let key = session_key(kind, session_id);
        let idx = bucket_index(&key, self.buckets.len());
        if let Some(bucket) = self.buckets[idx].read().await.clone() {
            if let Some(list) = bucket.get(&key) {
                list.ack(seq);
            }
        }
    }

    /// Returns buffered messages with seq >= `seq` for `(kind,
    /// session_id)`, or an empty vec if no such bucket/list exists.
    pub async fn list(&self, kind: Kind, session_id: i64, seq: i64) -> Vec<MessageBody> {
        let key = session_key(kind, session_id);
        let idx = bucket_index(&key, self.buckets.len());
        let Some(bucket) = self.buckets[idx].read().await.clone() else {
            return Vec::new();
        };
        match bucket.get(&key) {
            Some(list) => list.list(seq),
            None => Vec::new(),
        }
    }

    async fn bucket_or_create(&self, idx: usize) -> Arc<Bucket> {
        if let Some(bucket) = self.buckets[idx].read().await.clone() {
            return bucket;
        }
        let mut slot = self.buckets[idx].write().await;
        if let Some(bucket) = slot.clone() {
            return bucket;
        }
        let bucket = Arc::new(Bucket::new());
        *slot = Some(bucket.clone());
        bucket
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Kind;

    fn body(session_id: i64, seq: i64) -> MessageBody {
        MessageBody {
            id: seq,
            session_id,
            from_id: 1,
            to_id: 2,
            seq,
            kind: Kind::Single,
            content: "hi".to_owned(),
            created_at: 0,
        }
    }

    #[tokio::test]
    async fn append_then_ack_empties_the_session_list() {
        let box_ = MsgBox::new(16);
        box_.append(body(42, 7), Kind::Single, 1).await;
        assert_eq!(box_.list(Kind::Single, 42, 0).await.len(), 1);
        box_.ack(Kind::Single, 42, 7).await;
        assert!(box_.list(Kind::Single, 42, 0).await.is_empty());
    }

    #[tokio::test]
    async fn ack_and_list_on_absent_session_are_harmless() {
        let box_ = MsgBox::new(16);
        box_.ack(Kind::Single, 1, 1).await;
        assert!(box_.list(Kind::Group, 999, 0).await.is_empty());
    }

    #[tokio::test]
    async fn distinct_sessions_do_not_interfere() {
        let box_ = MsgBox::new(16);
        box_.append(body(1, 1), Kind::Single, 1).await;
        box_.append(body(2, 1), Kind::Single, 1).await;
        box_.ack(Kind::Single, 1, 1).await;
        assert!(box_.list(Kind::Single, 1, 0).await.is_empty());
        assert_eq!(box_.list(Kind::Single, 2, 0).await.len(), 1);
    }
}
