mod common;

use std::time::{Duration, Instant};

use common::{reply, session};
use pretty_assertions::assert_eq;
use sigma_ipp::protocol::{Frame, Method, Transport};
use sigma_ipp::sim::{ReplayTransport, SimHandle};

#[test]
fn test_interleaved_sids_never_cross() {
    let transport = ReplayTransport::new(vec![
        reply("PURCHASE", "B", &["STATUS=0", "STAGE=6"]),
        reply("PURCHASE", "A", &["STATUS=0", "STAGE=2", "TIMEOUT=60"]),
        reply("PURCHASE", "B", &["STATUS=9"]),
        reply("GET_STATUS", "A", &["STATUS=0"]),
        reply("PURCHASE", "A", &["STATUS=0", "STAGE=6", "TIMEOUT=0", "TXID=A-1"]),
    ]);
    let mut session = session(transport);

    let exchange = session
        .await_exchange(
            Method::Purchase,
            "A",
            Duration::from_millis(200),
            Duration::from_millis(200),
            Frame::is_final,
        )
        .unwrap()
        .expect("exchange");
    assert_eq!(exchange.frame.sid(), Some("A"));
    assert_eq!(exchange.frame.get("TXID"), Some("A-1"));
    assert_eq!(exchange.frames, 2);
    assert!(exchange.completed);
}

#[test]
fn test_frame_split_across_read_windows_is_kept() {
    let progress = reply("PURCHASE", "A", &["STATUS=0", "STAGE=1", "TIMEOUT=60"]);
    let last = reply("PURCHASE", "A", &["STATUS=0", "STAGE=6", "TIMEOUT=0"]);
    let mut tail = progress[10..].to_vec();
    tail.extend_from_slice(&last);

    // The session reads in 5 ms windows; the tail arrives several windows later
    let transport = ReplayTransport::new(vec![
        progress[..10].to_vec(),
        Vec::new(),
        Vec::new(),
        Vec::new(),
        Vec::new(),
        Vec::new(),
        Vec::new(),
        tail,
    ]);
    let mut session = session(transport);

    let exchange = session
        .await_exchange(
            Method::Purchase,
            "A",
            Duration::from_millis(500),
            Duration::from_millis(500),
            Frame::is_final,
        )
        .unwrap()
        .expect("exchange");
    assert!(exchange.completed);
    assert_eq!(exchange.frames, 2);
    assert_eq!(exchange.frame.stage(), Some("6"));
}

#[test]
fn test_immediate_rejection_skips_final_wait() {
    let transport = ReplayTransport::new(vec![reply("PURCHASE", "A", &["STATUS=5", "STAGE=5", "TIMEOUT=30"])]);
    let mut session = session(transport);

    let start = Instant::now();
    let frame = session
        .await_response(
            Method::Purchase,
            "A",
            Duration::from_millis(500),
            Duration::from_secs(30),
        )
        .unwrap()
        .expect("frame");
    assert_eq!(frame.status(), Some("5"));
    assert!(start.elapsed() < Duration::from_secs(2));
}

#[test]
fn test_no_answer_returns_none_after_first_wait() {
    let mut session = session(ReplayTransport::default());

    let start = Instant::now();
    let frame = session
        .await_response(
            Method::Purchase,
            "A",
            Duration::from_millis(60),
            Duration::from_secs(30),
        )
        .unwrap();
    assert!(frame.is_none());
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(60));
    assert!(elapsed < Duration::from_secs(2));
}

#[test]
fn test_request_ignores_decoy_frames() {
    let handle = SimHandle::new();
    handle.update(|s| s.send_decoys = true);
    let mut session = session(handle.transport());

    let exchange = session
        .request(
            Method::GetStatus,
            &[],
            Duration::from_millis(200),
            Duration::from_millis(200),
            Frame::is_final,
        )
        .unwrap()
        .expect("exchange");
    assert_ne!(exchange.frame.sid(), Some("decoy-sid"));
    assert_eq!(exchange.frames, 1);
}

#[test]
fn test_request_carries_header_lines() {
    let mut session = session(ReplayTransport::default());
    let sid = session.send_request(Method::GetStatus, &[]).unwrap();

    let written = &session.transport().written[0];
    let frame = Frame::decode(written).expect("well-formed request");
    assert_eq!(frame.get("PROTOCOL"), Some("IPP"));
    assert_eq!(frame.method(), Some("GET_STATUS"));
    assert_eq!(frame.get("VERSION"), Some("202"));
    assert_eq!(frame.sid(), Some(sid.as_str()));
    assert!(uuid_like(&sid));
}

#[test]
fn test_close_is_idempotent() {
    let handle = SimHandle::new();
    let mut session = session(handle.transport());
    session.close();
    session.close();
    session.transport_mut().close();
    assert_eq!(handle.state().open_transports, 0);
}

fn uuid_like(sid: &str) -> bool {
    sid.len() == 36 && sid.chars().filter(|c| *c == '-').count() == 4
}
