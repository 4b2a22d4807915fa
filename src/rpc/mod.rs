//! Glue to the user and message services: the narrow RPC contracts named
//! in the external interfaces section. Modeled as `async_trait`s so
//! production HTTP-backed clients and in-memory test doubles share one
//! seam, the way the reference repo's `AppState` fields are themselves
//! swappable test doubles in its test modules.

mod http_client;

pub use http_client::{HttpMessageServiceClient, HttpUserServiceClient};

use async_trait::async_trait;

/// A single group member as returned by `ListGroupMember`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupMember {
    pub user_id: i64,
    pub session_id: i64,
}

/// `UserService.Connect/Disconnect/Heartbeat`.
#[async_trait]
pub trait UserServiceClient: Send + Sync {
    async fn connect(&self, user_id: i64) -> Result<(), String>;
    async fn disconnect(&self, user_id: i64) -> Result<(), String>;
    async fn heartbeat(&self, user_id: i64) -> Result<(), String>;
}

/// `MessageService.AckMessage/ListGroupMember`.
#[async_trait]
pub trait MessageServiceClient: Send + Sync {
    async fn ack_message(&self, session_id: i64, seq: i64) -> Result<(), String>;
    async fn list_group_member(
        &self,
        group_id: i64,
        requesting_user_id: i64,
    ) -> Result<Vec<GroupMember>, String>;
}
