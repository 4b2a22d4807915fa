//! Production RPC clients: thin JSON-over-HTTP POSTs to the user and
//! message services. The distilled spec leaves the transport between
//! services unspecified (out of scope); a JSON POST keeps this tier's
//! dependency footprint aligned with what the reference service already
//! pulls in (`reqwest`) rather than adding a gRPC stack for a contract
//! this spec treats as a black box.

use async_trait::async_trait;
use serde::Serialize;
use tracing::warn;

use super::{GroupMember, MessageServiceClient, UserServiceClient};
use crate::protocol::error_codes;

pub struct HttpUserServiceClient {
    base_url: String,
    client: reqwest::Client,
}

impl HttpUserServiceClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
        }
    }

    async fn post(&self, path: &str, body: impl Serialize) -> Result<(), String> {
        self.client
            .post(format!("{}{}", self.base_url, path))
            .json(&body)
            .send()
            .await
            .map_err(|e| e.to_string())?
            .error_for_status()
            .map_err(|e| e.to_string())?;
        Ok(())
    }
}

#[derive(Serialize)]
struct UserIdReq {
    user_id: i64,
}

#[async_trait]
impl UserServiceClient for HttpUserServiceClient {
    async fn connect(&self, user_id: i64) -> Result<(), String> {
        self.post("/user/connect", UserIdReq { user_id })
            .await
            .inspect_err(|e| warn!(code = error_codes::RPC_CONNECT_FAILED, user_id, error = %e))
    }

    async fn disconnect(&self, user_id: i64) -> Result<(), String> {
        self.post("/user/disconnect", UserIdReq { user_id })
            .await
            .inspect_err(|e| warn!(code = error_codes::RPC_DISCONNECT_FAILED, user_id, error = %e))
    }

    async fn heartbeat(&self, user_id: i64) -> Result<(), String> {
        self.post("/user/heartbeat", UserIdReq { user_id })
            .await
            .inspect_err(|e| warn!(code = error_codes::RPC_HEARTBEAT_FAILED, user_id, error = %e))
    }
}

pub struct HttpMessageServiceClient {
    base_url: String,
    client: reqwest::Client,
}

impl HttpMessageServiceClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Serialize)]
struct AckMessageReq {
    session_id: i64,
    seq: i64,
}

#[derive(Serialize)]
struct ListGroupMemberReq {
    group_id: i64,
    user_id: i64,
}

#[derive(serde::Deserialize)]
struct ListGroupMemberResp {
    members: Vec<GroupMemberDto>,
}

#[derive(serde::Deserialize)]
struct GroupMemberDto {
    user_id: i64,
    session_id: i64,
}

#[async_trait]
impl MessageServiceClient for HttpMessageServiceClient {
    async fn ack_message(&self, session_id: i64, seq: i64) -> Result<(), String> {
        self.client
            .post(format!("{}/message/ack", self.base_url))
            .json(&AckMessageReq { session_id, seq })
            .send()
            .await
            .map_err(|e| e.to_string())?
            .error_for_status()
            .map_err(|e| e.to_string())
            .inspect_err(|e| {
                warn!(code = error_codes::RPC_ACK_MESSAGE_FAILED, session_id, seq, error = %e)
            })?;
        Ok(())
    }

    async fn list_group_member(
        &self,
        group_id: i64,
        requesting_user_id: i64,
    ) -> Result<Vec<GroupMember>, String> {
        let resp: ListGroupMemberResp = self
            .client
            .post(format!("{}/message/list_group_member", self.base_url))
            .json(&ListGroupMemberReq {
                group_id,
                user_id: requesting_user_id,
            })
            .send()
            .await
            .map_err(|e| e.to_string())?
            .error_for_status()
            .map_err(|e| e.to_string())?
            .json()
            .await
            .map_err(|e| e.to_string())
            .inspect_err(|e| {
                warn!(code = error_codes::RPC_LIST_GROUP_MEMBER_FAILED, group_id, error = %e)
            })?;
        Ok(resp
            .members
            .into_iter()
            .map(|m| GroupMember {
                user_id: m.user_id,
                session_id: m.session_id,
            })
            .collect())
    }
}
