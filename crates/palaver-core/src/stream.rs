//! Long-lived per-subscriber message streams.
//!
//! A session is keyed by (room, user). On open, the most recent page of
//! messages seeds a `seen` set without being delivered; the client is
//! expected to load history through the paginated read. A poll ticker then
//! emits every message not yet in `seen`, oldest first within each tick, and
//! a separate heartbeat ticker emits pings so idle connections stay alive
//! through NATs.
//!
//! Events travel over a small bounded channel: a slow consumer blocks the
//! fetcher instead of letting ticks pile up work. Dropping the receiver ends
//! the session. Store errors are absorbed and retried on the next tick;
//! once they persist across enough consecutive polls the session emits a
//! final [`StreamEvent::Error`] and tears down, so a still-connected client
//! learns the stream is dead instead of idling forever.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;

use palaver_shared::constants::{
    SSE_HEARTBEAT_SECS, STREAM_CHANNEL_BUFFER, STREAM_FETCH_LIMIT, STREAM_POLL_SECS,
};
use palaver_shared::ids::{valid_object_id, valid_user_id};
use palaver_shared::RequestMetadata;

use crate::encryption::MessageEncryption;
use crate::error::CoreError;
use crate::messages::render_content;
use crate::service::ChatService;
use crate::types::{message_view, ChatMessage};
use crate::SharedDb;

/// Consecutive failed polls tolerated before a session gives up and reports
/// a fatal error to the subscriber.
const MAX_CONSECUTIVE_FETCH_FAILURES: u32 = 5;

/// Tunables for one stream session.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub initial_fetch: u32,
    pub buffer: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(STREAM_POLL_SECS),
            heartbeat_interval: Duration::from_secs(SSE_HEARTBEAT_SECS),
            initial_fetch: STREAM_FETCH_LIMIT,
            buffer: STREAM_CHANNEL_BUFFER,
        }
    }
}

/// What a subscriber receives. `Error` is always the last event of a
/// session: it reports a fatal failure and the channel closes behind it.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Message(ChatMessage),
    Ping { timestamp: i64 },
    Error { message: String },
}

impl ChatService {
    /// Open a message stream for a member of the room.
    ///
    /// Returns the receiving end of the session channel; the producer task
    /// runs until the receiver is dropped or a send fails.
    pub async fn stream_messages(
        &self,
        room_id: &str,
        user_id: &str,
        config: StreamConfig,
        meta: &RequestMetadata,
    ) -> Result<mpsc::Receiver<StreamEvent>, CoreError> {
        if !valid_object_id(room_id) {
            return Err(CoreError::InvalidArgument("invalid room id".to_string()));
        }
        if !valid_user_id(user_id) {
            return Err(CoreError::InvalidArgument("invalid user id".to_string()));
        }

        let is_member = {
            let db = self.db.lock().await;
            db.is_member(room_id, user_id)
        }?;
        if !is_member {
            self.audit
                .access_denied(meta, user_id, room_id, "subscriber is not a member");
            return Err(CoreError::ForbiddenMember);
        }

        // Snapshot seeding: existing messages are marked seen, never emitted.
        // A failed seed is tolerated; the live loop retries the fetch anyway.
        let mut seen: HashSet<String> = HashSet::new();
        let snapshot = {
            let db = self.db.lock().await;
            db.get_messages(room_id, config.initial_fetch, None, None, None)
        };
        match snapshot {
            Ok((messages, _, _)) => {
                for message in &messages {
                    seen.insert(message.id.clone());
                }
                tracing::info!(
                    room_id,
                    user_id,
                    existing = seen.len(),
                    request_id = %meta.request_id,
                    "stream opened, snapshot seeded"
                );
            }
            Err(e) => {
                tracing::warn!(room_id, user_id, error = %e, "snapshot seed failed");
            }
        }

        let (tx, rx) = mpsc::channel(config.buffer.max(1));

        let session = Session {
            db: Arc::clone(&self.db),
            encryption: self.encryption.clone(),
            room_id: room_id.to_string(),
            user_id: user_id.to_string(),
            seen,
            config,
            fetch_failures: 0,
        };
        tokio::spawn(session.run(tx));

        Ok(rx)
    }
}

struct Session {
    db: SharedDb,
    encryption: MessageEncryption,
    room_id: String,
    user_id: String,
    seen: HashSet<String>,
    config: StreamConfig,
    fetch_failures: u32,
}

impl Session {
    async fn run(mut self, tx: mpsc::Sender<StreamEvent>) {
        let mut poll = tokio::time::interval(self.config.poll_interval);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        // Both intervals fire immediately on creation; the first real tick
        // should land one period in.
        poll.tick().await;
        heartbeat.tick().await;

        loop {
            tokio::select! {
                _ = tx.closed() => break,

                _ = heartbeat.tick() => {
                    let ping = StreamEvent::Ping { timestamp: Utc::now().timestamp() };
                    if tx.send(ping).await.is_err() {
                        break;
                    }
                }

                _ = poll.tick() => {
                    if !self.tick(&tx).await {
                        break;
                    }
                }
            }
        }

        tracing::info!(
            room_id = %self.room_id,
            user_id = %self.user_id,
            "stream ended"
        );
    }

    /// One poll: fetch the latest page, emit everything unseen in ascending
    /// `created_at` order. Returns `false` when the session must end, either
    /// because the subscriber is gone or because the store has been failing
    /// long enough that the subscriber was told to give up.
    async fn tick(&mut self, tx: &mpsc::Sender<StreamEvent>) -> bool {
        let page = {
            let db = self.db.lock().await;
            db.get_messages(&self.room_id, self.config.initial_fetch, None, None, None)
        };

        let messages = match page {
            Ok((messages, _, _)) => {
                self.fetch_failures = 0;
                messages
            }
            Err(e) => {
                self.fetch_failures += 1;
                tracing::error!(
                    room_id = %self.room_id,
                    error = %e,
                    consecutive = self.fetch_failures,
                    "stream fetch failed"
                );

                if self.fetch_failures >= MAX_CONSECUTIVE_FETCH_FAILURES {
                    // The client is still connected but the session cannot
                    // make progress; report the failure before tearing down.
                    let event = StreamEvent::Error {
                        message: "stream terminated: storage unavailable".to_string(),
                    };
                    let _ = tx.send(event).await;
                    return false;
                }

                // Transient so far; the next tick retries.
                return true;
            }
        };

        let mut delivered = 0usize;
        // The page is newest-first; emit oldest-first within the tick.
        for message in messages.iter().rev() {
            if !self.seen.insert(message.id.clone()) {
                continue;
            }

            let content = render_content(&self.encryption, message).await;
            let event = StreamEvent::Message(message_view(message, content));

            if tx.send(event).await.is_err() {
                return false;
            }
            delivered += 1;
        }

        if delivered > 0 {
            tracing::info!(
                room_id = %self.room_id,
                count = delivered,
                "delivered new messages"
            );
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::testutil::{meta, service};
    use crate::types::{CreateRoomRequest, SendMessageRequest};

    async fn room_with(svc: &ChatService, members: &[&str]) -> String {
        svc.create_room(
            CreateRoomRequest {
                name: "r".to_string(),
                room_type: "group".to_string(),
                owner_id: members[0].to_string(),
                member_ids: members.iter().map(|m| m.to_string()).collect(),
                settings: None,
            },
            &meta(),
        )
        .await
        .unwrap()
        .id
    }

    async fn send(svc: &ChatService, room_id: &str, content: &str) {
        svc.send_message(
            room_id,
            SendMessageRequest {
                sender_id: "u_alice".to_string(),
                content: content.to_string(),
                message_type: "text".to_string(),
            },
            &meta(),
        )
        .await
        .unwrap();
    }

    fn fast_config() -> StreamConfig {
        StreamConfig {
            poll_interval: Duration::from_millis(30),
            heartbeat_interval: Duration::from_secs(60),
            initial_fetch: 100,
            buffer: 10,
        }
    }

    async fn expect_message(rx: &mut mpsc::Receiver<StreamEvent>) -> ChatMessage {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("expected an event in time")
                .expect("stream closed unexpectedly");
            match event {
                StreamEvent::Message(message) => return message,
                StreamEvent::Ping { .. } => continue,
                StreamEvent::Error { message } => panic!("stream reported failure: {message}"),
            }
        }
    }

    async fn expect_silence(rx: &mut mpsc::Receiver<StreamEvent>, window: Duration) {
        let got = tokio::time::timeout(window, async {
            loop {
                match rx.recv().await {
                    Some(StreamEvent::Ping { .. }) => continue,
                    other => return other,
                }
            }
        })
        .await;
        assert!(got.is_err(), "expected no message events, got {got:?}");
    }

    #[tokio::test]
    async fn live_tail_without_history_replay() {
        let svc = service();
        let room_id = room_with(&svc, &["u_alice", "u_bob"]).await;

        send(&svc, &room_id, "m1").await;

        let mut rx = svc
            .stream_messages(&room_id, "u_bob", fast_config(), &meta())
            .await
            .unwrap();

        // m1 predates the stream: it is seeded as seen, never delivered.
        expect_silence(&mut rx, Duration::from_millis(150)).await;

        send(&svc, &room_id, "m2").await;
        let delivered = expect_message(&mut rx).await;
        assert_eq!(delivered.content, "m2");

        // At most once per session.
        expect_silence(&mut rx, Duration::from_millis(150)).await;

        // A new session re-seeds from history: m2 is not replayed.
        drop(rx);
        let mut rx = svc
            .stream_messages(&room_id, "u_bob", fast_config(), &meta())
            .await
            .unwrap();
        expect_silence(&mut rx, Duration::from_millis(150)).await;
    }

    #[tokio::test]
    async fn tick_emits_in_ascending_order() {
        let svc = service();
        let room_id = room_with(&svc, &["u_alice", "u_bob"]).await;

        let mut rx = svc
            .stream_messages(
                &room_id,
                "u_bob",
                StreamConfig {
                    poll_interval: Duration::from_millis(200),
                    ..fast_config()
                },
                &meta(),
            )
            .await
            .unwrap();

        // Two messages inside one poll window arrive oldest first.
        send(&svc, &room_id, "first").await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        send(&svc, &room_id, "second").await;

        let a = expect_message(&mut rx).await;
        let b = expect_message(&mut rx).await;
        assert_eq!(a.content, "first");
        assert_eq!(b.content, "second");
        assert!(a.created_at <= b.created_at);
    }

    #[tokio::test]
    async fn system_messages_flow_on_the_stream() {
        let svc = service();
        let room_id = room_with(&svc, &["u_alice", "u_bob"]).await;

        let mut rx = svc
            .stream_messages(&room_id, "u_bob", fast_config(), &meta())
            .await
            .unwrap();

        svc.join_room(&room_id, "u_carol", &meta()).await.unwrap();

        let event = expect_message(&mut rx).await;
        assert_eq!(event.message_type, "system");
        assert_eq!(event.content, "u_carol joined the group");
    }

    #[tokio::test]
    async fn heartbeat_fires_without_traffic() {
        let svc = service();
        let room_id = room_with(&svc, &["u_alice", "u_bob"]).await;

        let mut rx = svc
            .stream_messages(
                &room_id,
                "u_bob",
                StreamConfig {
                    poll_interval: Duration::from_secs(60),
                    heartbeat_interval: Duration::from_millis(40),
                    initial_fetch: 100,
                    buffer: 10,
                },
                &meta(),
            )
            .await
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("heartbeat in time")
            .expect("stream open");
        assert!(matches!(event, StreamEvent::Ping { .. }));
    }

    #[tokio::test]
    async fn non_member_is_rejected() {
        let svc = service();
        let room_id = room_with(&svc, &["u_alice"]).await;

        assert!(matches!(
            svc.stream_messages(&room_id, "u_mallory", fast_config(), &meta())
                .await,
            Err(CoreError::ForbiddenMember)
        ));
    }

    #[tokio::test]
    async fn persistent_store_failure_surfaces_error() {
        let svc = service();
        let room_id = room_with(&svc, &["u_alice", "u_bob"]).await;

        let mut rx = svc
            .stream_messages(
                &room_id,
                "u_bob",
                StreamConfig {
                    poll_interval: Duration::from_millis(20),
                    heartbeat_interval: Duration::from_secs(60),
                    initial_fetch: 100,
                    buffer: 10,
                },
                &meta(),
            )
            .await
            .unwrap();

        // Break the store underneath the running session.
        {
            let db = svc.db.lock().await;
            db.conn().execute_batch("DROP TABLE messages").unwrap();
        }

        loop {
            let event = tokio::time::timeout(Duration::from_secs(3), rx.recv())
                .await
                .expect("expected a terminal event")
                .expect("stream closed without reporting the failure");
            match event {
                StreamEvent::Error { message } => {
                    assert!(message.contains("storage unavailable"));
                    break;
                }
                _ => continue,
            }
        }

        // The error event is the last one; the channel closes behind it.
        let end = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("channel should close after the error event");
        assert!(end.is_none());
    }
}
