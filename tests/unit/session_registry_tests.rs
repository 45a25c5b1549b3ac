//! Unit tests for the SSE session registry.

use std::sync::Arc;

use futures_util::StreamExt;

use stdio_bridge::bridge::session::{SessionRegistry, SseFrame};

fn registry(buffer: usize) -> Arc<SessionRegistry> {
    Arc::new(SessionRegistry::new(buffer))
}

#[tokio::test]
async fn connect_greets_first() {
    let sessions = registry(8);
    let mut stream = sessions.connect("tab-1");

    assert_eq!(stream.session_id(), "tab-1");
    assert!(sessions.contains("tab-1"));
    assert_eq!(stream.next().await, Some(SseFrame::Connected));
}

#[tokio::test]
async fn send_queues_data_event() {
    let sessions = registry(8);
    let mut stream = sessions.connect("tab-1");

    assert!(sessions.send("tab-1", r#"{"id":1}"#.into()));
    assert_eq!(stream.next().await, Some(SseFrame::Connected));
    assert_eq!(stream.next().await, Some(SseFrame::Message(r#"{"id":1}"#.into())));
}

#[test]
fn send_to_unknown_session_reports_false() {
    let sessions = registry(8);
    assert!(!sessions.send("ghost", "{}".into()));
}

#[test]
fn send_updates_last_activity() {
    let sessions = registry(8);
    let _stream = sessions.connect("tab-1");
    let before = sessions.get("tab-1").expect("registered");

    assert!(sessions.send("tab-1", "{}".into()));
    let after = sessions.get("tab-1").expect("registered");

    assert_eq!(before.connection_id, after.connection_id);
    assert!(after.last_activity >= before.last_activity);
    assert_eq!(after.connected_at, before.connected_at);
}

#[test]
fn dropping_the_stream_removes_the_session() {
    let sessions = registry(8);
    let stream = sessions.connect("tab-1");
    assert_eq!(sessions.len(), 1);

    drop(stream);
    assert!(!sessions.contains("tab-1"));
    assert!(sessions.is_empty());
}

#[tokio::test]
async fn reconnect_replaces_previous_stream() {
    let sessions = registry(8);
    let mut old = sessions.connect("tab-1");
    let new = sessions.connect("tab-1");

    assert_ne!(old.connection_id(), new.connection_id());
    assert_eq!(sessions.len(), 1);
    assert_eq!(
        sessions.get("tab-1").expect("registered").connection_id,
        new.connection_id()
    );

    // The stale stream drains its greeting and then ends.
    assert_eq!(old.next().await, Some(SseFrame::Connected));
    assert_eq!(old.next().await, None);
}

#[test]
fn stale_stream_drop_keeps_newer_session() {
    let sessions = registry(8);
    let old = sessions.connect("tab-1");
    let new = sessions.connect("tab-1");

    drop(old);
    assert!(sessions.contains("tab-1"));
    assert_eq!(
        sessions.get("tab-1").expect("registered").connection_id,
        new.connection_id()
    );
}

#[test]
fn backlogged_session_is_dropped() {
    let sessions = registry(1);
    // The greeting fills the single slot.
    let _stream = sessions.connect("slow");

    assert!(!sessions.send("slow", "{}".into()));
    assert!(!sessions.contains("slow"));
}

#[tokio::test]
async fn disconnect_ends_the_stream() {
    let sessions = registry(8);
    let mut stream = sessions.connect("tab-1");

    assert!(sessions.disconnect("tab-1"));
    assert!(!sessions.disconnect("tab-1"));
    assert_eq!(stream.next().await, Some(SseFrame::Connected));
    assert_eq!(stream.next().await, None);
}

#[tokio::test]
async fn broadcast_reaches_every_session() {
    let sessions = registry(8);
    let mut a = sessions.connect("a");
    let mut b = sessions.connect("b");

    assert_eq!(sessions.broadcast(r#"{"method":"notify"}"#), 2);

    for stream in [&mut a, &mut b] {
        assert_eq!(stream.next().await, Some(SseFrame::Connected));
        assert_eq!(
            stream.next().await,
            Some(SseFrame::Message(r#"{"method":"notify"}"#.into()))
        );
    }
}

#[test]
fn broadcast_with_no_sessions_reaches_nobody() {
    let sessions = registry(8);
    assert_eq!(sessions.broadcast("{}"), 0);
}

#[tokio::test]
async fn close_all_ends_streams_and_refuses_new_ones() {
    let sessions = registry(8);
    let mut open = sessions.connect("a");
    let _other = sessions.connect("b");

    assert_eq!(sessions.close_all(), 2);
    assert!(sessions.is_empty());
    assert_eq!(open.next().await, Some(SseFrame::Connected));
    assert_eq!(open.next().await, None);

    let mut late = sessions.connect("c");
    assert!(!sessions.contains("c"));
    assert_eq!(late.next().await, Some(SseFrame::Connected));
    assert_eq!(late.next().await, None);
}
