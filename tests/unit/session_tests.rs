//! Unit tests for the RPC session core.
//!
//! Each test drives a session against an in-memory peer and checks request
//! correlation, deadlines, notification delivery, and the abort path.

use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;

use peer_harness::rpc::message::METHOD_NOT_FOUND;
use peer_harness::rpc::{Message, RequestTimeouts, SessionOptions};
use peer_harness::{AbortCause, AbortKind, AppError};

use super::support::{connect, connect_with_buffer};

// ── Correlation ─────────────────────────────────────────────────────────────

/// Responses delivered in reverse order still reach their own callers.
#[tokio::test]
async fn out_of_order_responses_reach_their_callers() {
    let (session, mut peer) = connect(SessionOptions::default());

    let first = {
        let session = session.clone();
        tokio::spawn(async move { session.request("alpha", None).await })
    };
    let second = {
        let session = session.clone();
        tokio::spawn(async move { session.request("beta", None).await })
    };

    let mut seen = vec![peer.expect_request().await, peer.expect_request().await];
    seen.sort_by(|a, b| a.1.cmp(&b.1));
    let (alpha_id, beta_id) = (seen[0].0.clone(), seen[1].0.clone());
    assert_ne!(alpha_id, beta_id, "ids must be unique");

    peer.send(&Message::success(beta_id, json!("beta-result"))).await;
    peer.send(&Message::success(alpha_id, json!("alpha-result"))).await;

    assert_eq!(first.await.unwrap().expect("alpha"), json!("alpha-result"));
    assert_eq!(second.await.unwrap().expect("beta"), json!("beta-result"));
    assert_eq!(session.pending_count(), 0);
}

/// Request ids start at 1 and increase per request.
#[tokio::test]
async fn request_ids_increase_from_one() {
    let (session, mut peer) = connect(SessionOptions::default());

    for expected in 1..=3_u64 {
        let call = {
            let session = session.clone();
            tokio::spawn(async move { session.request("next", None).await })
        };
        let (id, _) = peer.expect_request().await;
        assert_eq!(id, json!(expected));
        peer.send(&Message::success(id, json!(null))).await;
        call.await.unwrap().expect("response");
    }
}

/// An error response fails only that request, with the peer's code.
#[tokio::test]
async fn error_response_surfaces_as_rpc_error() {
    let (session, mut peer) = connect(SessionOptions::default());

    let call = {
        let session = session.clone();
        tokio::spawn(async move { session.request("textDocument/hover", None).await })
    };
    let (id, _) = peer.expect_request().await;
    peer.send(&Message::failure(
        id,
        peer_harness::rpc::RpcErrorObject {
            code: -32602,
            message: "bad position".into(),
            data: None,
        },
    ))
    .await;

    let err = call.await.unwrap().expect_err("rpc error");
    assert!(matches!(err, AppError::Rpc { code: -32602, ref message } if message == "bad position"));
    assert!(!session.is_aborted());
}

// ── Deadlines ───────────────────────────────────────────────────────────────

/// A timed-out request leaves the table, and its late response changes nothing.
#[tokio::test]
async fn late_response_after_timeout_is_dropped() {
    let (session, mut peer) = connect(SessionOptions::default());

    let err = session
        .request_with_timeout("slow", None, Duration::from_millis(50))
        .await
        .expect_err("must time out");
    assert!(matches!(err, AppError::Timeout { ref method, .. } if method == "slow"));
    assert_eq!(session.pending_count(), 0);

    let (late_id, _) = peer.expect_request().await;
    peer.send(&Message::success(late_id, json!("too late"))).await;

    let next = {
        let session = session.clone();
        tokio::spawn(async move { session.request("fast", None).await })
    };
    let (id, method) = peer.expect_request().await;
    assert_eq!(method, "fast");
    peer.send(&Message::success(id, json!("fresh"))).await;

    assert_eq!(next.await.unwrap().expect("fast"), json!("fresh"));
    assert!(!session.is_aborted());
}

/// Per-method deadlines come from the session's timeout policy.
#[tokio::test]
async fn method_override_sets_request_deadline() {
    let timeouts = RequestTimeouts::new(Duration::from_secs(30))
        .with_override("quick", Duration::from_millis(30));
    let (session, _peer) = connect(SessionOptions {
        timeouts,
        ..SessionOptions::default()
    });

    let err = session.request("quick", None).await.expect_err("override applies");

    assert!(matches!(err, AppError::Timeout { after, .. } if after == Duration::from_millis(30)));
}

/// A peer that stops reading cannot hold a request past its deadline or
/// past an abort.
#[tokio::test]
async fn stalled_write_is_bounded_by_deadline_and_abort() {
    let (session, _peer) = connect_with_buffer(SessionOptions::default(), 1024);
    let bulk = json!({ "text": "x".repeat(100 * 1024) });

    let err = tokio::time::timeout(
        Duration::from_secs(3),
        session.request_with_timeout("didSave", Some(bulk), Duration::from_millis(100)),
    )
    .await
    .expect("deadline covers the write")
    .expect_err("peer never reads");
    assert!(matches!(err, AppError::Timeout { ref method, .. } if method == "didSave"));
    assert_eq!(session.pending_count(), 0);

    let queued = {
        let session = session.clone();
        tokio::spawn(async move {
            session
                .request_with_timeout("hover", None, Duration::from_secs(30))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    session.abort(AbortCause::explicit("peer wedged"));

    let err = tokio::time::timeout(Duration::from_secs(3), queued)
        .await
        .expect("abort covers a queued write")
        .unwrap()
        .expect_err("aborted");
    assert!(matches!(err, AppError::SessionAborted(ref c) if c.message == "peer wedged"));
}

/// A caller that stops waiting takes its pending entry with it.
#[tokio::test]
async fn abandoned_request_leaves_no_pending_entry() {
    let (session, mut peer) = connect(SessionOptions::default());

    let abandoned = tokio::time::timeout(Duration::from_millis(50), session.request("hover", None)).await;
    assert!(abandoned.is_err(), "the peer has not answered");
    assert_eq!(session.pending_count(), 0);

    let (late_id, method) = peer.expect_request().await;
    assert_eq!(method, "hover");
    peer.send(&Message::success(late_id, json!("nobody listening"))).await;

    let next = {
        let session = session.clone();
        tokio::spawn(async move { session.request("definition", None).await })
    };
    let (id, _) = peer.expect_request().await;
    peer.send(&Message::success(id, json!("fresh"))).await;
    assert_eq!(next.await.unwrap().expect("definition"), json!("fresh"));
    assert_eq!(session.pending_count(), 0);
}

// ── Abort ───────────────────────────────────────────────────────────────────

/// Aborting fails every pending request with the same cause and empties the table.
#[tokio::test]
async fn abort_fails_all_pending_requests() {
    let (session, mut peer) = connect(SessionOptions::default());

    let calls: Vec<_> = (0..3)
        .map(|i| {
            let session = session.clone();
            tokio::spawn(async move { session.request(&format!("op{i}"), None).await })
        })
        .collect();
    for _ in 0..3 {
        peer.expect_request().await;
    }
    assert_eq!(session.pending_count(), 3);

    assert!(session.abort(AbortCause::explicit("test teardown")));

    for call in calls {
        let err = call.await.unwrap().expect_err("aborted");
        assert!(
            matches!(err, AppError::SessionAborted(ref cause) if cause.kind == AbortKind::Explicit),
            "unexpected error: {err}"
        );
    }
    assert_eq!(session.pending_count(), 0);
}

/// Only the first abort applies; later calls fail fast with that cause.
#[tokio::test]
async fn first_abort_cause_wins() {
    let (session, _peer) = connect(SessionOptions::default());

    assert!(session.abort(AbortCause::explicit("first")));
    assert!(!session.abort(AbortCause::new(AbortKind::ProcessExit, "second")));

    let cause = session.abort_cause().expect("terminal");
    assert_eq!(cause.message, "first");

    let err = session.request("after", None).await.expect_err("terminal");
    assert!(matches!(err, AppError::SessionAborted(ref c) if c.message == "first"));

    let err = session.notify("after", None).await.expect_err("terminal");
    assert!(matches!(err, AppError::SessionAborted(_)));
}

/// The peer closing its output aborts the session with a stream-closed cause.
#[tokio::test]
async fn peer_eof_aborts_with_stream_closed() {
    let (session, peer) = connect(SessionOptions::default());

    let pending = {
        let session = session.clone();
        tokio::spawn(async move { session.request("never", None).await })
    };
    drop(peer);

    let cause = tokio::time::timeout(Duration::from_secs(1), session.aborted())
        .await
        .expect("abort after eof");
    assert_eq!(cause.kind, AbortKind::StreamClosed);

    let err = pending.await.unwrap().expect_err("aborted");
    assert!(matches!(err, AppError::SessionAborted(_) | AppError::Io(_)));
}

/// Without abort-on-eof the session stays live after the peer's output ends.
#[tokio::test]
async fn eof_is_left_to_supervisor_when_configured() {
    let (session, peer) = connect(SessionOptions {
        abort_on_eof: false,
        ..SessionOptions::default()
    });

    drop(peer);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(!session.is_aborted());
}

// ── Inbound traffic ─────────────────────────────────────────────────────────

/// Notifications reach the handler in wire order.
#[tokio::test]
async fn notifications_arrive_in_wire_order() {
    let (session, mut peer) = connect(SessionOptions::default());
    let (tx, mut rx) = mpsc::unbounded_channel();
    session.on_notification(move |n| {
        let _ = tx.send(n.params.clone());
    });

    for seq in 0..5 {
        peer.send(&Message::notification("progress", Some(json!({ "seq": seq }))))
            .await;
    }

    for seq in 0..5 {
        let params = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("delivered")
            .expect("channel open");
        assert_eq!(params, Some(json!({ "seq": seq })));
    }
}

/// A later handler replaces the earlier one.
#[tokio::test]
async fn registering_a_handler_replaces_the_previous_one() {
    let (session, mut peer) = connect(SessionOptions::default());
    let (old_tx, mut old_rx) = mpsc::unbounded_channel::<String>();
    let (new_tx, mut new_rx) = mpsc::unbounded_channel::<String>();
    session.on_notification(move |n| {
        let _ = old_tx.send(n.method.clone());
    });
    session.on_notification(move |n| {
        let _ = new_tx.send(n.method.clone());
    });

    peer.send(&Message::notification("hello", None)).await;

    let got = tokio::time::timeout(Duration::from_secs(1), new_rx.recv())
        .await
        .expect("delivered");
    assert_eq!(got.as_deref(), Some("hello"));
    assert!(old_rx.try_recv().is_err());
}

/// Peer-initiated requests get a method-not-found reply with their own id.
#[tokio::test]
async fn peer_request_is_declined() {
    let (_session, mut peer) = connect(SessionOptions::default());

    peer.send(&Message::Request {
        id: json!("srv-1"),
        method: "workspace/configuration".into(),
        params: Some(json!({ "items": [] })),
    })
    .await;

    match peer.recv().await {
        Message::Response { id, outcome } => {
            assert_eq!(id, json!("srv-1"));
            assert_eq!(outcome.expect_err("declined").code, METHOD_NOT_FOUND);
        }
        other => panic!("expected a response, got {other:?}"),
    }
}

/// Garbage on the wire does not disturb the session.
#[tokio::test]
async fn malformed_frames_do_not_abort() {
    let (session, mut peer) = connect(SessionOptions::default());

    let call = {
        let session = session.clone();
        tokio::spawn(async move { session.request("ping", None).await })
    };
    let (id, _) = peer.expect_request().await;
    peer.send_raw(b"Bogus: header\r\n\r\nContent-Length: 3\r\n\r\n{{{").await;
    peer.send(&Message::success(id, json!("pong"))).await;

    assert_eq!(call.await.unwrap().expect("pong"), json!("pong"));
    assert!(!session.is_aborted());
}
