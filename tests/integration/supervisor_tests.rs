//! Integration tests for peer supervision using small `sh` peers.
//!
//! Covers fatal stderr markers, unrequested exits, graceful shutdown, the
//! kill fallback, and spawn failures.

#![cfg(unix)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use peer_harness::rpc::RequestTimeouts;
use peer_harness::supervisor::{PeerProcess, PeerSpec, SupervisorOptions};
use peer_harness::{AbortKind, AppError};

fn sh(script: &str) -> PeerSpec {
    PeerSpec::new("sh", ["-c", script])
}

fn quick_options() -> SupervisorOptions {
    SupervisorOptions {
        timeouts: RequestTimeouts::new(Duration::from_secs(5)),
        shutdown_grace: Duration::from_millis(300),
        ..SupervisorOptions::default()
    }
}

// ── Abort propagation ───────────────────────────────────────────────────────

/// A fatal marker on stderr aborts the session while the peer still runs.
#[tokio::test]
async fn fatal_marker_aborts_pending_request() {
    let peer = PeerProcess::launch(
        &sh("echo 'booting' >&2; echo 'RuntimeError: unreachable executed' >&2; exec sleep 30"),
        quick_options(),
    )
    .expect("launch");

    let err = peer
        .session()
        .request("initialize", None)
        .await
        .expect_err("peer never answers");

    let AppError::SessionAborted(cause) = err else {
        panic!("expected an abort, got {err}");
    };
    assert_eq!(cause.kind, AbortKind::FatalDiagnostic);
    assert!(cause.message.contains("RuntimeError: unreachable executed"));
    assert!(peer.try_exit().is_none(), "the peer is still running");

    peer.kill();
    let exit = peer.wait_exit().await.expect("exit after kill");
    assert!(!exit.success());
}

/// An exit nobody asked for aborts with the exit code.
#[tokio::test]
async fn unrequested_exit_aborts_with_code() {
    let peer = PeerProcess::launch(&sh("echo 'last words' >&2; exit 3"), quick_options())
        .expect("launch");

    let cause = tokio::time::timeout(Duration::from_secs(5), peer.session().aborted())
        .await
        .expect("abort after exit");

    assert_eq!(cause.kind, AbortKind::ProcessExit);
    assert!(cause.message.contains("exited with code 3"), "{}", cause.message);
    assert_eq!(peer.wait_exit().await.expect("exit").code, Some(3));

    let err = peer.session().request("hover", None).await.expect_err("terminal");
    assert!(matches!(err, AppError::SessionAborted(ref c) if c.kind == AbortKind::ProcessExit));
}

/// Stderr lines land in the tail and reach the observer.
#[tokio::test]
async fn stderr_lines_are_kept_and_observed() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let options = SupervisorOptions {
        stderr_tail_lines: 2,
        stderr_observer: Some(Arc::new(move |line: &str| {
            sink.lock().unwrap().push(line.to_owned());
        })),
        ..quick_options()
    };
    let peer = PeerProcess::launch(&sh("printf 'one\\ntwo\\nthree\\n' >&2; exec sleep 30"), options)
        .expect("launch");

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while seen.lock().unwrap().len() < 3 {
        assert!(tokio::time::Instant::now() < deadline, "stderr never drained");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert_eq!(*seen.lock().unwrap(), vec!["one", "two", "three"]);
    assert_eq!(peer.stderr_tail().lines(), vec!["two", "three"]);
    assert_eq!(peer.stderr_tail().last_line().as_deref(), Some("three"));

    peer.kill();
    peer.wait_exit().await.expect("exit");
}

// ── Shutdown ────────────────────────────────────────────────────────────────

/// A peer that exits once its input closes shuts down cleanly.
#[tokio::test]
async fn shutdown_closes_input_and_collects_exit() {
    let peer = PeerProcess::launch(&sh("cat > /dev/null"), quick_options()).expect("launch");

    let exit = peer.shutdown().await.expect("shutdown");

    assert!(exit.success(), "{exit}");
    let cause = peer.session().abort_cause().expect("terminal after shutdown");
    assert_eq!(cause.kind, AbortKind::Shutdown);
}

/// A peer that ignores shutdown is killed after the grace period.
#[tokio::test]
async fn stubborn_peer_is_killed_after_grace() {
    let peer = PeerProcess::launch(&sh("exec sleep 30"), quick_options()).expect("launch");

    let exit = tokio::time::timeout(Duration::from_secs(5), peer.shutdown())
        .await
        .expect("shutdown finishes")
        .expect("exit collected");

    assert_eq!(exit.code, None);
    assert_eq!(exit.signal, Some(9));
    assert_eq!(
        peer.session().abort_cause().map(|c| c.kind),
        Some(AbortKind::Shutdown)
    );
}

#[tokio::test]
async fn missing_program_fails_to_spawn() {
    let err = PeerProcess::launch(
        &PeerSpec::new("/nonexistent/peer-binary", Vec::<String>::new()),
        quick_options(),
    )
    .expect_err("cannot spawn");

    assert!(matches!(err, AppError::Spawn(_)));
}
