//! The process-wide registry front door and event dispatcher: the single
//! consumer of the event bus, fanning `message`/`friend-event`/
//! `group-event` traffic out to whichever connections are currently
//! registered in [`Shared`]. Grounded in the reference service's
//! `announcer`/dashboard broadcast fan-out shape (one consumer task
//! reading a channel and pushing onto per-connection senders) generalized
//! from a single broadcast topic to per-user targeted delivery.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::value::RawValue;
use tracing::warn;

use crate::events::{BusEvent, EventBusReceiver, Topic};
use crate::protocol::{Envelope, Kind, MessageBody, MsgType, NewMessageNotify};
use crate::shared::Shared;

/// Runs the dispatcher loop until the event bus is closed or `stop` cancels
/// the root token. Spawned once at startup alongside the accept loop.
pub async fn run(shared: Arc<Shared>, mut events: EventBusReceiver) {
    loop {
        tokio::select! {
            _ = shared.root_cancel().cancelled() => return,
            event = events.recv() => {
                let Some(event) = event else { return };
                dispatch_event(&shared, event).await;
            }
        }
    }
}

/// Cancels the root context: the dispatcher loop above exits, and every
/// live connection's child token is cancelled along with it, running each
/// connection's normal close discipline.
pub fn stop(shared: &Shared) {
    shared.root_cancel().cancel();
}

async fn dispatch_event(shared: &Arc<Shared>, event: BusEvent) {
    let Some(topic) = Topic::parse(&event.topic) else {
        warn!(topic = %event.topic, "dropping event on unknown topic");
        return;
    };
    match topic {
        Topic::Message => dispatch_message(shared, &event).await,
        Topic::FriendEvent | Topic::GroupEvent => dispatch_content_event(shared, &event).await,
    }
}

async fn dispatch_message(shared: &Arc<Shared>, event: &BusEvent) {
    let body: MessageBody = match serde_json::from_slice(&event.body) {
        Ok(b) => b,
        Err(e) => {
            warn!(error = %e, "dropping malformed message event body");
            return;
        }
    };

    match body.kind {
        Kind::Single => dispatch_single_message(shared, body).await,
        Kind::Group => dispatch_group_message(shared, body).await,
    }
}

/// Single-chat fan-out. Per the buffering Open Question, an offline
/// recipient's message is not appended to the Msg-Box here -- only
/// delivered messages get buffered for ack-tracked replay.
async fn dispatch_single_message(shared: &Arc<Shared>, body: MessageBody) {
    let Some(handle) = shared.lookup(body.to_id) else {
        return;
    };

    shared
        .msg_box
        .append(body.clone(), Kind::Single, 1)
        .await;

    let notify = NewMessageNotify {
        kind: Kind::Single,
        session_id: body.session_id,
        seq: body.seq,
    };
    let envelope = Envelope::new(MsgType::NewMessage, &notify);
    let ack_id = handle.ack_queue.put(envelope.clone()).await;
    handle.send(envelope.with_ack_id(ack_id));
}

/// Group fan-out: looks up the member list via the message service, then
/// delivers to every member but the sender. Per the group-NewMessage Open
/// Question, these notifies are not ack-tracked -- each member's own
/// `Message` poll is the durable replay path.
async fn dispatch_group_message(shared: &Arc<Shared>, body: MessageBody) {
    let members = match shared
        .message_rpc
        .list_group_member(body.to_id, body.from_id)
        .await
    {
        Ok(m) => m,
        Err(e) => {
            warn!(
                code = crate::protocol::error_codes::RPC_LIST_GROUP_MEMBER_FAILED,
                group_id = body.to_id,
                error = %e,
                "dropping group message, could not resolve members"
            );
            return;
        }
    };

    let unread = members.len() as i64;
    for member in &members {
        if member.user_id == body.from_id {
            continue;
        }

        let mut member_body = body.clone();
        member_body.session_id = member.session_id;
        shared
            .msg_box
            .append(member_body, Kind::Group, unread)
            .await;

        if let Some(handle) = shared.lookup(member.user_id) {
            let notify = NewMessageNotify {
                kind: Kind::Group,
                session_id: member.session_id,
                seq: body.seq,
            };
            handle.send(Envelope::new(MsgType::NewMessage, &notify));
        }
    }
}

/// `friend-event`/`group-event` payload shape: the key carries the content
/// type as a stringified [`MsgType`] value, and the body carries the
/// recipient set plus an opaque payload forwarded verbatim in the
/// envelope's `data`. `to_id` covers apply/result events (single
/// recipient); `to_ids` covers the broadcast-shaped info-updated events.
#[derive(Debug, Deserialize)]
struct ContentEventBody<'a> {
    #[serde(default)]
    to_id: Option<i64>,
    #[serde(default)]
    to_ids: Vec<i64>,
    #[serde(borrow)]
    payload: &'a RawValue,
}

async fn dispatch_content_event(shared: &Arc<Shared>, event: &BusEvent) {
    let Some(ty) = event
        .key
        .parse::<i64>()
        .ok()
        .and_then(MsgType::from_wire)
    else {
        warn!(key = %event.key, "dropping event with unrecognized content-type key");
        return;
    };

    let parsed: ContentEventBody = match serde_json::from_slice(&event.body) {
        Ok(b) => b,
        Err(e) => {
            warn!(error = %e, "dropping malformed content event body");
            return;
        }
    };

    let recipients = parsed.to_id.into_iter().chain(parsed.to_ids);
    for user_id in recipients {
        let Some(handle) = shared.lookup(user_id) else {
            continue;
        };
        let envelope = Envelope {
            ty,
            data: parsed.payload.get().to_owned(),
            ack_id: None,
        };
        let ack_id = handle.ack_queue.put(envelope.clone()).await;
        handle.send(envelope.with_ack_id(ack_id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::rpc::GroupMember;
    use async_trait::async_trait;
    use bytes::Bytes;

    struct FakeUserService;
    #[async_trait]
    impl crate::rpc::UserServiceClient for FakeUserService {
        async fn connect(&self, _user_id: i64) -> Result<(), String> {
            Ok(())
        }
        async fn disconnect(&self, _user_id: i64) -> Result<(), String> {
            Ok(())
        }
        async fn heartbeat(&self, _user_id: i64) -> Result<(), String> {
            Ok(())
        }
    }

    struct FakeMessageService {
        members: Vec<GroupMember>,
    }
    #[async_trait]
    impl crate::rpc::MessageServiceClient for FakeMessageService {
        async fn ack_message(&self, _session_id: i64, _seq: i64) -> Result<(), String> {
            Ok(())
        }
        async fn list_group_member(
            &self,
            _group_id: i64,
            _requesting_user_id: i64,
        ) -> Result<Vec<GroupMember>, String> {
            Ok(self.members.clone())
        }
    }

    fn test_shared(members: Vec<GroupMember>) -> Arc<Shared> {
        Arc::new(Shared::new(
            Config::from_env(),
            Box::new(FakeUserService),
            Box::new(FakeMessageService { members }),
        ))
    }

    fn body(kind: Kind, to_id: i64, session_id: i64, seq: i64) -> MessageBody {
        MessageBody {
            id: seq,
            session_id,
            from_id: 1,
            to_id,
            seq,
            kind,
            content: "hi".to_owned(),
            created_at: 0,
        }
    }

    #[tokio::test]
    async fn offline_single_chat_recipient_gets_no_msgbox_entry() {
        let shared = test_shared(vec![]);
        dispatch_single_message(&shared, body(Kind::Single, 2, 42, 1)).await;
        assert!(shared.msg_box.list(Kind::Single, 42, 0).await.is_empty());
    }

    #[tokio::test]
    async fn group_message_skips_the_sender_and_reaches_members() {
        let members = vec![
            GroupMember { user_id: 1, session_id: 42 },
            GroupMember { user_id: 2, session_id: 42 },
            GroupMember { user_id: 3, session_id: 43 },
        ];
        let shared = test_shared(members);
        dispatch_group_message(&shared, body(Kind::Group, 100, 42, 7)).await;

        let list_42 = shared.msg_box.list(Kind::Group, 42, 0).await;
        assert_eq!(list_42.len(), 1);
        let list_43 = shared.msg_box.list(Kind::Group, 43, 0).await;
        assert_eq!(list_43.len(), 1);
    }

    #[tokio::test]
    async fn stop_cancels_the_root_token_and_exits_the_dispatcher_loop() {
        let shared = test_shared(vec![]);
        let (_tx, rx) = crate::events::channel(8);
        let handle = tokio::spawn(run(shared.clone(), rx));

        stop(&shared);
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .expect("dispatcher loop should exit promptly after stop")
            .expect("dispatcher task should not panic");
        assert!(shared.root_cancel().is_cancelled());
    }

    #[tokio::test]
    async fn unknown_topic_is_dropped_without_panicking() {
        let shared = test_shared(vec![]);
        dispatch_event(
            &shared,
            BusEvent {
                topic: "nonsense".to_owned(),
                key: "1".to_owned(),
                body: Bytes::new(),
            },
        )
        .await;
    }
}
