//! Session engine tests against the in-memory transport

use super::*;
use crate::connection::mock::{MockConnector, MockListener, MockServer};
use crate::connection::{ConnectionConfig, ConnectionStatus, ReconnectPolicy};
use crate::events::SessionEvent;
use crate::stream::NotificationPhase;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast;

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

struct Harness {
    handle: SessionHandle,
    events: broadcast::Receiver<SessionEvent>,
    listener: MockListener,
    store: DraftStore,
    _dir: TempDir,
}

fn test_config() -> EngineConfig {
    EngineConfig {
        ws_url: "ws://test/ws/chat".into(),
        connection: ConnectionConfig {
            reconnect: ReconnectPolicy {
                base_delay: Duration::from_millis(100),
                max_attempts: 5,
            },
            ..Default::default()
        },
        ..Default::default()
    }
}

fn build(session: Session) -> (SessionEngine, Harness) {
    let dir = TempDir::new().unwrap();
    let store = DraftStore::new(dir.path().join("draft.json"), 24);
    let (connector, listener) = MockConnector::new();
    let (engine, handle) =
        SessionEngine::new(test_config(), session, Arc::new(connector), store.clone());
    let events = handle.subscribe();
    (
        engine,
        Harness {
            handle,
            events,
            listener,
            store,
            _dir: dir,
        },
    )
}

/// Spawn an engine and wait until its first connection is open and synced.
async fn start() -> (Harness, MockServer) {
    let (engine, mut h) = build(Session::default());
    engine.spawn();
    let server = h.open_next().await;
    (h, server)
}

impl Harness {
    async fn open_next(&mut self) -> MockServer {
        let mut server = self.listener.accept().await;
        assert_eq!(server.recv().await["type"], "sync_state");
        self.wait_for(|e| {
            matches!(
                e,
                SessionEvent::ConnectionStatusChanged {
                    status: ConnectionStatus::Connected
                }
            )
        })
        .await;
        server
    }

    async fn next_event(&mut self) -> SessionEvent {
        tokio::time::timeout(EVENT_TIMEOUT, self.events.recv())
            .await
            .expect("timed out waiting for a session event")
            .expect("event bus closed")
    }

    async fn wait_for(&mut self, pred: impl Fn(&SessionEvent) -> bool) -> SessionEvent {
        loop {
            let event = self.next_event().await;
            if pred(&event) {
                return event;
            }
        }
    }

    /// Every event up to and including the first one matching `pred`
    async fn collect_until(&mut self, pred: impl Fn(&SessionEvent) -> bool) -> Vec<SessionEvent> {
        let mut out = Vec::new();
        loop {
            let event = self.next_event().await;
            let done = pred(&event);
            out.push(event);
            if done {
                return out;
            }
        }
    }

    fn drain(&mut self) -> Vec<SessionEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }

    async fn send_and_expect(&mut self, server: &mut MockServer, text: &str) {
        self.handle.send_message(text).unwrap();
        let frame = server.recv_kind("message").await;
        assert_eq!(frame["message"], text);
        self.wait_for(|e| is_generation(e, GenerationState::Streaming, ButtonState::Stop))
            .await;
    }
}

fn is_generation(event: &SessionEvent, state: GenerationState, button: ButtonState) -> bool {
    matches!(
        event,
        SessionEvent::GenerationStateChanged { state: s, button: b } if *s == state && *b == button
    )
}

fn generation_changes(events: &[SessionEvent]) -> Vec<(GenerationState, ButtonState)> {
    events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::GenerationStateChanged { state, button } => Some((*state, *button)),
            _ => None,
        })
        .collect()
}

fn is_status(event: &SessionEvent, expected: &ConnectionStatus) -> bool {
    matches!(event, SessionEvent::ConnectionStatusChanged { status } if status == expected)
}

// ============================================================================
// Streaming
// ============================================================================

#[tokio::test]
async fn test_send_stream_and_finish() {
    let (mut h, mut server) = start().await;

    h.handle.send_message("hello").unwrap();
    let frame = server.recv_kind("message").await;
    assert_eq!(frame["message"], "hello");
    assert_eq!(frame["provider"], "anthropic");
    assert_eq!(frame["conversation_id"], serde_json::Value::Null);

    server.push(json!({"type": "ai_chunk", "chunk": "Hi ", "sequence": 0, "conversation_id": "c1"}));
    server.push(json!({"type": "ai_chunk", "chunk": "there", "sequence": 1}));
    server.push(json!({"type": "ai_chunk", "chunk": "", "sequence": 2, "is_final": true}));

    let events = h
        .collect_until(|e| matches!(e, SessionEvent::ConversationListInvalidated))
        .await;

    assert_eq!(
        generation_changes(&events),
        vec![
            (GenerationState::Streaming, ButtonState::Transitioning),
            (GenerationState::Streaming, ButtonState::Stop),
            (GenerationState::Idle, ButtonState::Transitioning),
            (GenerationState::Idle, ButtonState::Send),
        ]
    );
    assert!(events.contains(&SessionEvent::ConversationAssigned {
        conversation_id: "c1".into()
    }));
    let deltas: Vec<&str> = events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::ContentDelta { text } => Some(text.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(deltas, vec!["Hi ", "there"]);
    assert!(events.contains(&SessionEvent::ResponseCompleted {
        content: "Hi there".into(),
        stopped: false
    }));
}

#[tokio::test]
async fn test_stale_and_duplicate_chunks_are_dropped() {
    let (mut h, mut server) = start().await;
    h.send_and_expect(&mut server, "count").await;

    server.push(json!({"type": "ai_chunk", "chunk": "one ", "sequence": 0}));
    server.push(json!({"type": "ai_chunk", "chunk": "one ", "sequence": 0}));
    server.push(json!({"type": "ai_chunk", "chunk": "three", "sequence": 2}));
    server.push(json!({"type": "ai_chunk", "chunk": "two ", "sequence": 1}));
    server.push(json!({"type": "ai_chunk", "chunk": "", "sequence": 3, "is_final": true}));

    let done = h
        .wait_for(|e| matches!(e, SessionEvent::ResponseCompleted { .. }))
        .await;
    assert_eq!(
        done,
        SessionEvent::ResponseCompleted {
            content: "one three".into(),
            stopped: false
        }
    );
}

#[tokio::test]
async fn test_fragmented_chunk_is_reassembled() {
    let (mut h, mut server) = start().await;
    h.send_and_expect(&mut server, "greet").await;

    let fragment = |index: usize, text: &str| {
        json!({
            "type": "ai_chunk", "chunk": text, "sequence": 0,
            "is_chunked": true, "chunk_sequence": index, "total_chunks": 3
        })
    };
    server.push(fragment(0, "Hel"));
    server.push(fragment(2, "d!"));
    server.push(fragment(1, "lo Worl"));

    let delta = h
        .wait_for(|e| matches!(e, SessionEvent::ContentDelta { .. }))
        .await;
    assert_eq!(
        delta,
        SessionEvent::ContentDelta {
            text: "Hello World!".into()
        }
    );
}

#[tokio::test]
async fn test_notifications_are_forwarded_with_phase() {
    let (mut h, mut server) = start().await;
    h.send_and_expect(&mut server, "write a report").await;

    server.push(json!({
        "type": "ai_chunk", "chunk": "", "sequence": 0, "is_notification": true,
        "notification_type": "document_generation", "early_notification": true
    }));
    server.push(json!({
        "type": "ai_chunk", "chunk": "report.pdf", "sequence": 1, "is_notification": true,
        "notification_type": "document_generation", "is_final": true
    }));

    let events = h
        .collect_until(|e| is_generation(e, GenerationState::Idle, ButtonState::Send))
        .await;
    let phases: Vec<NotificationPhase> = events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::Notification { phase, .. } => Some(*phase),
            _ => None,
        })
        .collect();
    assert_eq!(phases, vec![NotificationPhase::Early, NotificationPhase::Complete]);
}

#[tokio::test]
async fn test_tool_progress_usage_and_messages_are_forwarded() {
    let (mut h, server) = start().await;

    server.push(json!({"type": "tool_progress", "tool": "search", "status": "running"}));
    server.push(json!({"type": "token_usage_updated", "input_tokens": 12}));
    server.push(json!({"type": "message", "role": "assistant", "content": "done", "conversation_id": "c7"}));
    server.push(json!({"type": "chat_history", "messages": [{"role": "user", "content": "hi"}]}));

    let events = h
        .collect_until(|e| matches!(e, SessionEvent::HistoryLoaded { .. }))
        .await;
    assert!(events.iter().any(|e| matches!(
        e,
        SessionEvent::ToolProgress { payload } if payload["tool"] == "search"
    )));
    assert!(events.iter().any(|e| matches!(
        e,
        SessionEvent::UsageUpdated { payload } if payload["input_tokens"] == 12
    )));
    assert!(events.iter().any(|e| matches!(
        e,
        SessionEvent::MessageReceived { message } if message.content.as_deref() == Some("done")
    )));
    assert!(events.contains(&SessionEvent::ConversationAssigned {
        conversation_id: "c7".into()
    }));
}

#[tokio::test]
async fn test_unknown_and_malformed_frames_are_ignored() {
    let (mut h, mut server) = start().await;

    server.push_raw("not json at all");
    server.push(json!({"type": "brand_new_kind", "x": 1}));
    server.push(json!({"type": "heartbeat"}));
    assert_eq!(server.recv_kind("heartbeat_ack").await["type"], "heartbeat_ack");
    assert!(h.drain().is_empty());
}

// ============================================================================
// Send / stop control
// ============================================================================

#[tokio::test]
async fn test_stop_applies_locally_and_late_confirmation_is_noop() {
    let (mut h, mut server) = start().await;
    h.send_and_expect(&mut server, "long answer please").await;

    server.push(json!({"type": "ai_chunk", "chunk": "partial", "sequence": 0}));
    h.wait_for(|e| matches!(e, SessionEvent::ContentDelta { .. }))
        .await;

    h.handle.stop_generation().unwrap();
    let stop = server.recv_kind("stop_generation").await;
    assert_eq!(stop["type"], "stop_generation");

    let events = h
        .collect_until(|e| is_generation(e, GenerationState::StopRequested, ButtonState::Send))
        .await;
    assert!(events.contains(&SessionEvent::ContentDelta {
        text: STOPPED_MARKER.into()
    }));
    assert!(events.contains(&SessionEvent::ResponseCompleted {
        content: format!("partial{}", STOPPED_MARKER),
        stopped: true
    }));

    // Content still in flight and the eventual confirmation change nothing
    server.push(json!({"type": "ai_chunk", "chunk": "late", "sequence": 1}));
    server.push(json!({"type": "stop_confirmed"}));
    server.push(json!({"type": "heartbeat"}));
    server.recv_kind("heartbeat_ack").await;
    assert!(h.drain().is_empty());

    // The control accepts a new message right away
    h.send_and_expect(&mut server, "next question").await;
}

#[tokio::test]
async fn test_second_send_while_streaming_is_rejected() {
    let (mut h, mut server) = start().await;
    h.send_and_expect(&mut server, "first").await;

    h.handle.send_message("second").unwrap();
    let rejected = h
        .wait_for(|e| matches!(e, SessionEvent::ActionRejected { .. }))
        .await;
    assert!(matches!(
        rejected,
        SessionEvent::ActionRejected { ref action, .. } if action == "send_message"
    ));
    server.push(json!({"type": "heartbeat"}));
    assert_eq!(server.recv().await["type"], "heartbeat_ack");
}

#[tokio::test]
async fn test_empty_message_is_rejected() {
    let (mut h, mut server) = start().await;
    h.handle.send_message("   ").unwrap();
    let rejected = h.next_event().await;
    assert_eq!(
        rejected,
        SessionEvent::ActionRejected {
            action: "send_message".into(),
            reason: "message is empty".into()
        }
    );
    assert!(server.try_recv().is_none());
}

#[tokio::test]
async fn test_error_frame_returns_to_idle() {
    let (mut h, mut server) = start().await;
    h.send_and_expect(&mut server, "boom").await;

    server.push(json!({"type": "error", "message": "rate limited", "code": "429"}));
    let events = h
        .collect_until(|e| is_generation(e, GenerationState::Idle, ButtonState::Send))
        .await;
    assert!(events.contains(&SessionEvent::ServerError {
        message: "rate limited".into(),
        code: Some("429".into())
    }));
}

#[tokio::test]
async fn test_sync_response_resumes_server_stream() {
    let (mut h, server) = start().await;
    server.push(json!({"type": "sync_state_response", "is_streaming": true, "conversation_id": "c3"}));

    let events = h
        .collect_until(|e| is_generation(e, GenerationState::Streaming, ButtonState::Stop))
        .await;
    assert!(events.contains(&SessionEvent::ConversationAssigned {
        conversation_id: "c3".into()
    }));
}

#[tokio::test]
async fn test_explicit_sync_request() {
    let (mut h, mut server) = start().await;
    h.handle.request_sync().unwrap();
    let frame = server.recv_kind("sync_state").await;
    assert_eq!(frame["conversation_id"], serde_json::Value::Null);
}

// ============================================================================
// Connection lifecycle
// ============================================================================

#[tokio::test]
async fn test_heartbeat_is_acknowledged() {
    let (_h, mut server) = start().await;
    server.push(json!({"type": "heartbeat", "timestamp": 1700000000}));
    assert_eq!(server.recv().await, json!({"type": "heartbeat_ack"}));
}

#[tokio::test(start_paused = true)]
async fn test_missing_heartbeat_forces_reconnect() {
    let (mut h, _server) = start().await;

    tokio::time::sleep(Duration::from_secs(61)).await;

    let events = h
        .collect_until(|e| is_status(e, &ConnectionStatus::Connected))
        .await;
    assert!(events.iter().any(|e| is_status(
        e,
        &ConnectionStatus::Reconnecting {
            attempt: 1,
            delay_ms: 100
        }
    )));
    assert_eq!(h.listener.attempts(), 2);
    let mut second = h.listener.accept().await;
    assert_eq!(second.recv().await["type"], "sync_state");
}

#[tokio::test(start_paused = true)]
async fn test_heartbeats_keep_connection_alive() {
    let (h, mut server) = start().await;
    for _ in 0..4 {
        tokio::time::sleep(Duration::from_secs(40)).await;
        server.push(json!({"type": "heartbeat"}));
        assert_eq!(server.recv().await["type"], "heartbeat_ack");
    }
    assert_eq!(h.listener.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_clean_close_does_not_reconnect() {
    let (mut h, server) = start().await;
    server.close(true);
    h.wait_for(|e| is_status(e, &ConnectionStatus::Disconnected))
        .await;

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.listener.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_unclean_close_resets_generation_and_reconnects() {
    let (mut h, mut server) = start().await;
    h.send_and_expect(&mut server, "question").await;

    server.close(false);
    let events = h
        .collect_until(|e| is_status(e, &ConnectionStatus::Connected))
        .await;
    assert!(events
        .iter()
        .any(|e| is_generation(e, GenerationState::Idle, ButtonState::Send)));
    assert!(events
        .iter()
        .any(|e| matches!(e, SessionEvent::ConnectionStatusChanged { status: ConnectionStatus::Reconnecting { attempt: 1, .. } })));
    assert_eq!(h.listener.attempts(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_gives_up_after_max_attempts() {
    let (mut h, server) = start().await;
    h.listener.fail_always(true);
    server.close(false);

    h.wait_for(|e| is_status(e, &ConnectionStatus::Failed { attempts: 5 }))
        .await;
    assert_eq!(h.listener.attempts(), 6);

    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(h.listener.attempts(), 6, "no timer may remain after failing");

    // A manual reconnect starts over
    h.listener.fail_always(false);
    h.handle.reconnect().unwrap();
    h.open_next().await;
    assert_eq!(h.listener.attempts(), 7);
}

#[tokio::test(start_paused = true)]
async fn test_messages_sent_offline_are_flushed_on_open() {
    let (engine, mut h) = build(Session::default());
    h.listener.fail_next(1);
    engine.spawn();

    h.handle.send_message("queued while offline").unwrap();
    let mut server = h.listener.accept().await;
    assert_eq!(server.recv().await["type"], "sync_state");
    let frame = server.recv().await;
    assert_eq!(frame["type"], "message");
    assert_eq!(frame["message"], "queued while offline");

    // The sync answer predates the message and must not end the generation
    server.push(json!({"type": "sync_state_response", "is_streaming": false}));
    server.push(json!({"type": "heartbeat"}));
    server.recv_kind("heartbeat_ack").await;
    let changes = generation_changes(&h.drain());
    assert_eq!(
        changes.last(),
        Some(&(GenerationState::Streaming, ButtonState::Stop)),
        "delivery starts the generation: {:?}",
        changes
    );

    server.push(json!({"type": "ai_chunk", "chunk": "ok", "sequence": 0, "is_final": true}));
    h.wait_for(|e| is_generation(e, GenerationState::Idle, ButtonState::Send))
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_message_sent_during_backoff_waits_idle_until_delivered() {
    let (mut h, server) = start().await;
    h.listener.fail_always(true);
    server.close(false);
    h.wait_for(|e| {
        matches!(
            e,
            SessionEvent::ConnectionStatusChanged {
                status: ConnectionStatus::Reconnecting { attempt: 1, .. }
            }
        )
    })
    .await;

    h.handle.send_message("are you there").unwrap();
    let events = h
        .collect_until(|e| {
            matches!(
                e,
                SessionEvent::ConnectionStatusChanged {
                    status: ConnectionStatus::Reconnecting { attempt: 3, .. }
                }
            )
        })
        .await;
    assert_eq!(
        generation_changes(&events),
        vec![],
        "nothing generates while the message is undelivered"
    );

    h.listener.fail_always(false);
    let mut server = h.listener.accept().await;
    assert_eq!(server.recv().await["type"], "sync_state");
    let frame = server.recv_kind("message").await;
    assert_eq!(frame["message"], "are you there");
    let events = h
        .collect_until(|e| is_generation(e, GenerationState::Streaming, ButtonState::Stop))
        .await;
    assert_eq!(
        generation_changes(&events),
        vec![
            (GenerationState::Streaming, ButtonState::Transitioning),
            (GenerationState::Streaming, ButtonState::Stop),
        ]
    );
}

#[tokio::test]
async fn test_prefill_is_sent_once_open() {
    let (engine, mut h) = build(Session::default());
    engine.with_prefill("summarise this").spawn();

    let mut server = h.listener.accept().await;
    assert_eq!(server.recv().await["type"], "sync_state");
    let frame = server.recv().await;
    assert_eq!(frame["type"], "message");
    assert_eq!(frame["message"], "summarise this");
}

#[tokio::test]
async fn test_new_chat_drops_conversation_and_reconnects() {
    let (engine, mut h) = build(Session {
        conversation_id: Some("c1".into()),
        project_id: Some("p1".into()),
        ..Default::default()
    });
    engine.spawn();
    let first = h.open_next().await;
    assert_eq!(first.url, "ws://test/ws/chat?conversation_id=c1&project_id=p1");

    h.handle.new_chat().unwrap();
    let second = h.open_next().await;
    assert_eq!(second.url, "ws://test/ws/chat?project_id=p1");
}

#[tokio::test]
async fn test_shutdown_stops_engine() {
    let (engine, mut h) = build(Session::default());
    let task = engine.spawn();
    h.open_next().await;

    h.handle.shutdown().unwrap();
    tokio::time::timeout(EVENT_TIMEOUT, task)
        .await
        .expect("engine did not stop")
        .unwrap();
    assert!(h.handle.send_message("too late").is_err());
}

// ============================================================================
// Drafts
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_draft_saved_after_pause_and_cleared_on_send() {
    let (mut h, mut server) = start().await;

    h.handle.input_changed("work in progress").unwrap();
    tokio::time::sleep(Duration::from_millis(1500)).await;
    let saved = h.store.load().await.unwrap().unwrap();
    assert_eq!(saved.text, "work in progress");
    assert_eq!(saved.conversation_id, None);

    h.send_and_expect(&mut server, "work in progress").await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.store.load().await.unwrap(), None);
}

#[tokio::test]
async fn test_matching_draft_is_restored_on_start() {
    let (engine, mut h) = build(Session {
        conversation_id: Some("c1".into()),
        ..Default::default()
    });
    h.store
        .save(&Draft::new("unsent thought", Some("c1".into())))
        .await
        .unwrap();
    engine.spawn();

    let restored = h
        .wait_for(|e| matches!(e, SessionEvent::DraftRestored { .. }))
        .await;
    assert_eq!(
        restored,
        SessionEvent::DraftRestored {
            text: "unsent thought".into()
        }
    );
}

#[tokio::test]
async fn test_draft_for_other_conversation_is_not_restored() {
    let (engine, mut h) = build(Session {
        conversation_id: Some("c2".into()),
        ..Default::default()
    });
    h.store
        .save(&Draft::new("for c1", Some("c1".into())))
        .await
        .unwrap();
    engine.spawn();

    let events = h
        .collect_until(|e| is_status(e, &ConnectionStatus::Connected))
        .await;
    assert!(!events
        .iter()
        .any(|e| matches!(e, SessionEvent::DraftRestored { .. })));
    assert_eq!(h.store.load().await.unwrap(), None, "foreign draft is discarded");
}

#[tokio::test]
async fn test_dismiss_draft_clears_file() {
    let (mut h, _server) = start().await;
    h.store.save(&Draft::new("stale", None)).await.unwrap();
    h.handle.dismiss_draft().unwrap();

    for _ in 0..50 {
        if h.store.load().await.unwrap().is_none() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("draft was not cleared");
}
