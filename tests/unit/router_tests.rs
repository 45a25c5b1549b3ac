//! Unit tests for response demultiplexing in `ResponseRouter`.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{stream, StreamExt};
use tokio_util::sync::CancellationToken;

use stdio_bridge::bridge::router::{Delivery, DeliveryTarget, ResponseRouter, RouteOutcome};
use stdio_bridge::bridge::rpc::RequestId;
use stdio_bridge::bridge::session::{SessionRegistry, SseFrame};
use stdio_bridge::child::codec::Frame;
use stdio_bridge::AppError;

const LONG: Duration = Duration::from_secs(30);

fn router() -> (Arc<ResponseRouter>, Arc<SessionRegistry>) {
    let sessions = Arc::new(SessionRegistry::new(8));
    let router = Arc::new(ResponseRouter::new(Arc::clone(&sessions)));
    (router, sessions)
}

fn response(id: i64) -> String {
    format!(r#"{{"jsonrpc":"2.0","id":{id},"result":{{"n":{id}}}}}"#)
}

#[tokio::test]
async fn reverse_order_responses_reach_their_own_callers() {
    let (router, _) = router();
    let first = router
        .register(RequestId::from(1), DeliveryTarget::Direct, LONG)
        .expect("register 1");
    let second = router
        .register(RequestId::from(2), DeliveryTarget::Direct, LONG)
        .expect("register 2");

    assert_eq!(router.route_line(&response(2)), RouteOutcome::Delivered(RequestId::from(2)));
    assert_eq!(router.route_line(&response(1)), RouteOutcome::Delivered(RequestId::from(1)));

    assert_eq!(router.wait(first).await, Ok(Delivery::Response(response(1))));
    assert_eq!(router.wait(second).await, Ok(Delivery::Response(response(2))));
    assert_eq!(router.pending_count(), 0);
}

#[tokio::test]
async fn string_and_numeric_ids_do_not_collide() {
    let (router, _) = router();
    let numeric = router
        .register(RequestId::from(1), DeliveryTarget::Direct, LONG)
        .expect("numeric");
    let text = router
        .register(RequestId::from("1"), DeliveryTarget::Direct, LONG)
        .expect("string");

    let text_line = r#"{"jsonrpc":"2.0","id":"1","result":"s"}"#;
    router.route_line(text_line);
    router.route_line(&response(1));

    assert_eq!(router.wait(text).await, Ok(Delivery::Response(text_line.to_owned())));
    assert_eq!(router.wait(numeric).await, Ok(Delivery::Response(response(1))));
}

#[test]
fn duplicate_pending_id_is_rejected() {
    let (router, _) = router();
    let _ticket = router
        .register(RequestId::from(5), DeliveryTarget::Direct, LONG)
        .expect("first");

    let err = router
        .register(RequestId::from(5), DeliveryTarget::Direct, LONG)
        .expect_err("duplicate");
    assert!(matches!(err, AppError::DuplicateId(_)));
    assert_eq!(router.pending_count(), 1);
}

#[tokio::test]
async fn id_is_reusable_after_delivery() {
    let (router, _) = router();
    let ticket = router
        .register(RequestId::from(5), DeliveryTarget::Direct, LONG)
        .expect("first");
    router.route_line(&response(5));
    router.wait(ticket).await.expect("delivered");

    router
        .register(RequestId::from(5), DeliveryTarget::Direct, LONG)
        .expect("id free again");
}

#[tokio::test(start_paused = true)]
async fn unanswered_request_times_out_once() {
    let (router, _) = router();
    let ticket = router
        .register(RequestId::from(9), DeliveryTarget::Direct, Duration::from_millis(500))
        .expect("register");

    let err = router.wait(ticket).await.expect_err("timeout");
    assert!(matches!(err, AppError::ResponseTimeout(_)));
    assert_eq!(router.pending_count(), 0);

    // A late answer is an orphan, not a second delivery.
    assert_eq!(
        router.route_line(&response(9)),
        RouteOutcome::Orphan(Some(RequestId::from(9)))
    );
}

#[tokio::test]
async fn delivery_before_wait_is_not_lost() {
    let (router, _) = router();
    let ticket = router
        .register(RequestId::from(3), DeliveryTarget::Direct, Duration::from_millis(1))
        .expect("register");
    router.route_line(&response(3));

    tokio::time::sleep(Duration::from_millis(10)).await;

    // Deadline has passed, but the entry was already taken for delivery.
    assert_eq!(router.wait(ticket).await, Ok(Delivery::Response(response(3))));
}

#[test]
fn dropped_ticket_frees_the_id() {
    let (router, _) = router();
    let ticket = router
        .register(RequestId::from(12), DeliveryTarget::Direct, LONG)
        .expect("register");

    drop(ticket);
    assert_eq!(router.pending_count(), 0);
    router
        .register(RequestId::from(12), DeliveryTarget::Direct, LONG)
        .expect("id free again");
}

#[tokio::test]
async fn integral_float_id_matches_integer_echo() {
    let (router, _) = router();
    let id = RequestId::from_value(&serde_json::json!(7.0)).expect("numeric id");
    let ticket = router
        .register(id, DeliveryTarget::Direct, LONG)
        .expect("register");

    assert_eq!(router.route_line(&response(7)), RouteOutcome::Delivered(RequestId::from(7)));
    assert_eq!(router.wait(ticket).await, Ok(Delivery::Response(response(7))));
}

#[test]
fn cancel_removes_without_delivery() {
    let (router, _) = router();
    let _ticket = router
        .register(RequestId::from(4), DeliveryTarget::Direct, LONG)
        .expect("register");

    assert!(router.cancel(&RequestId::from(4)));
    assert!(!router.cancel(&RequestId::from(4)));
    assert_eq!(
        router.route_line(&response(4)),
        RouteOutcome::Orphan(Some(RequestId::from(4)))
    );
}

#[tokio::test]
async fn abandoned_wait_frees_the_id() {
    let (router, _) = router();
    let ticket = router
        .register(RequestId::from(11), DeliveryTarget::Direct, LONG)
        .expect("register");

    // The outer timeout drops the wait future mid-await.
    let abandoned = tokio::time::timeout(Duration::from_millis(20), router.wait(ticket)).await;
    assert!(abandoned.is_err());

    assert_eq!(router.pending_count(), 0);
}

#[test]
fn malformed_and_blank_lines_are_dropped() {
    let (router, _) = router();
    let _ticket = router
        .register(RequestId::from(1), DeliveryTarget::Direct, LONG)
        .expect("register");

    assert_eq!(router.route_line("garbage{{"), RouteOutcome::Malformed);
    assert_eq!(router.route_line("   "), RouteOutcome::Ignored);
    assert_eq!(router.pending_count(), 1);
}

#[test]
fn response_without_id_is_orphan() {
    let (router, _) = router();
    assert_eq!(
        router.route_line(r#"{"jsonrpc":"2.0","id":null,"error":{"code":-32700,"message":"x"}}"#),
        RouteOutcome::Orphan(None)
    );
    assert_eq!(router.route_line("[1,2]"), RouteOutcome::Orphan(None));
}

#[tokio::test]
async fn child_initiated_messages_are_broadcast_not_matched() {
    let (router, sessions) = router();
    let mut stream = sessions.connect("s1");
    let _ticket = router
        .register(RequestId::from(1), DeliveryTarget::Direct, LONG)
        .expect("register");

    // A request from the child that happens to reuse id 1.
    let line = r#"{"jsonrpc":"2.0","id":1,"method":"sampling/createMessage"}"#;
    assert_eq!(router.route_line(line), RouteOutcome::Broadcast(1));
    assert_eq!(router.pending_count(), 1);

    assert_eq!(stream.next().await, Some(SseFrame::Connected));
    assert_eq!(stream.next().await, Some(SseFrame::Message(line.to_owned())));
}

#[tokio::test]
async fn session_target_goes_to_stream_and_acknowledges() {
    let (router, sessions) = router();
    let mut stream = sessions.connect("tab-1");
    let ticket = router
        .register(RequestId::from(1), DeliveryTarget::Session("tab-1".into()), LONG)
        .expect("register");

    router.route_line(&response(1));

    assert_eq!(router.wait(ticket).await, Ok(Delivery::Acknowledged));
    assert_eq!(stream.next().await, Some(SseFrame::Connected));
    assert_eq!(stream.next().await, Some(SseFrame::Message(response(1))));
}

#[tokio::test]
async fn disconnected_session_falls_back_to_post() {
    let (router, sessions) = router();
    let stream = sessions.connect("tab-1");
    let ticket = router
        .register(RequestId::from(1), DeliveryTarget::Session("tab-1".into()), LONG)
        .expect("register");

    drop(stream);
    assert!(!sessions.contains("tab-1"));

    router.route_line(&response(1));
    assert_eq!(router.wait(ticket).await, Ok(Delivery::Response(response(1))));
}

#[tokio::test]
async fn unknown_session_falls_back_to_post() {
    let (router, _) = router();
    let ticket = router
        .register(RequestId::from(2), DeliveryTarget::Session("nobody".into()), LONG)
        .expect("register");

    router.route_line(&response(2));
    assert_eq!(router.wait(ticket).await, Ok(Delivery::Response(response(2))));
}

#[tokio::test]
async fn close_fails_pending_and_refuses_new_registrations() {
    let (router, _) = router();
    let a = router
        .register(RequestId::from(1), DeliveryTarget::Direct, LONG)
        .expect("a");
    let b = router
        .register(RequestId::from(2), DeliveryTarget::Direct, LONG)
        .expect("b");

    assert_eq!(router.close("child process exited"), 2);
    assert!(router.is_closed());

    for ticket in [a, b] {
        let err = router.wait(ticket).await.expect_err("unavailable");
        assert!(matches!(err, AppError::ChildUnavailable(_)));
    }

    let err = router
        .register(RequestId::from(3), DeliveryTarget::Direct, LONG)
        .expect_err("closed");
    assert!(matches!(err, AppError::ChildUnavailable(ref msg) if msg == "child process exited"));
}

#[tokio::test]
async fn run_survives_garbage_between_responses() {
    let (router, _) = router();
    let a = router
        .register(RequestId::from(1), DeliveryTarget::Direct, LONG)
        .expect("a");
    let b = router
        .register(RequestId::from(2), DeliveryTarget::Direct, LONG)
        .expect("b");

    let lines = stream::iter(vec![
        Ok(Frame::Line(response(2))),
        Ok(Frame::Line("not json at all".into())),
        Ok(Frame::Discarded),
        Ok(Frame::Line(r#"{"jsonrpc":"2.0","id":99,"result":null}"#.into())),
        Ok(Frame::Line(response(1))),
    ]);
    router.run(lines, CancellationToken::new()).await;

    assert_eq!(router.wait(a).await, Ok(Delivery::Response(response(1))));
    assert_eq!(router.wait(b).await, Ok(Delivery::Response(response(2))));
    // Stream ended, so the router treats the child as gone.
    assert!(router.is_closed());
}

#[tokio::test]
async fn run_fails_pending_on_read_error() {
    let (router, _) = router();
    let ticket = router
        .register(RequestId::from(1), DeliveryTarget::Direct, LONG)
        .expect("register");

    let lines = stream::iter(vec![Err(AppError::Io("broken pipe".into()))]);
    router.run(lines, CancellationToken::new()).await;

    let err = router.wait(ticket).await.expect_err("unavailable");
    assert!(matches!(err, AppError::ChildUnavailable(ref msg) if msg.contains("broken pipe")));
}

#[tokio::test]
async fn run_stops_on_cancellation() {
    let (router, _) = router();
    let ticket = router
        .register(RequestId::from(1), DeliveryTarget::Direct, LONG)
        .expect("register");
    let cancel = CancellationToken::new();
    cancel.cancel();

    router.run(stream::pending(), cancel).await;

    let err = router.wait(ticket).await.expect_err("unavailable");
    assert!(matches!(err, AppError::ChildUnavailable(ref msg) if msg.contains("shutting down")));
}
