//! State shared by every connection and by the Hub's dispatcher: the
//! registry, the Msg-Box, and the collaborator RPC clients. Connection
//! treats this as a non-owning handle back to the Hub (see the cyclic
//! ownership design note) -- it only ever calls `unregister`.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::connection::ConnectionHandle;
use crate::msg_box::MsgBox;
use crate::rpc::{MessageServiceClient, UserServiceClient};

pub struct Shared {
    pub config: Config,
    pub msg_box: MsgBox,
    pub user_rpc: Box<dyn UserServiceClient>,
    pub message_rpc: Box<dyn MessageServiceClient>,
    registry: Mutex<HashMap<i64, ConnectionHandle>>,
    /// Root of the cancellation hierarchy. Every connection's token is a
    /// child of this one, so cancelling it tears down every live
    /// connection along with the Hub's dispatcher loop.
    root_cancel: CancellationToken,
}

impl Shared {
    pub fn new(
        config: Config,
        user_rpc: Box<dyn UserServiceClient>,
        message_rpc: Box<dyn MessageServiceClient>,
    ) -> Self {
        Self {
            msg_box: MsgBox::new(config.msg_box_bucket_count),
            config,
            user_rpc,
            message_rpc,
            registry: Mutex::new(HashMap::new()),
            root_cancel: CancellationToken::new(),
        }
    }

    /// Token to select or race against for this connection's lifetime.
    /// Descends from the Hub's root token.
    pub fn root_cancel(&self) -> &CancellationToken {
        &self.root_cancel
    }

    /// Inserts `handle`, closing and returning any existing connection for
    /// the same user-id so the caller can await its teardown before
    /// proceeding (at most one active connection per user-id).
    pub fn register(&self, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        let mut registry = self.registry.lock().unwrap();
        registry.insert(handle.user_id, handle)
    }

    /// Removes `user_id`'s registry entry, but only if it still points at
    /// `connection_id` -- a stale close from a connection that has
    /// already been replaced must not unregister its successor.
    pub fn unregister(&self, user_id: i64, connection_id: uuid::Uuid) {
        let mut registry = self.registry.lock().unwrap();
        if let std::collections::hash_map::Entry::Occupied(entry) = registry.entry(user_id) {
            if entry.get().id == connection_id {
                entry.remove();
            }
        }
    }

    pub fn lookup(&self, user_id: i64) -> Option<ConnectionHandle> {
        self.registry.lock().unwrap().get(&user_id).cloned()
    }

    pub fn connection_count(&self) -> usize {
        self.registry.lock().unwrap().len()
    }
}
