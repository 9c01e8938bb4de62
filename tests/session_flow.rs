//! Session-level flows: auth ack, sequencing, replay, cancellation acks.
//!
//! These drive the session actor through the manager without a network
//! listener. No upstream services are configured, so pipeline runs fail
//! fast with an in-band error while still exercising the envelope
//! contract (ordering, sequencing, replay buffering).

use std::time::Duration;

use tokio::sync::mpsc;
use voxbridge::config::Config;
use voxbridge::protocol::ClientEnvelope;
use voxbridge::services::Services;
use voxbridge::session::{SessionManager, SessionMsg};

async fn next_frame(rx: &mut mpsc::UnboundedReceiver<String>) -> serde_json::Value {
    let frame = tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("timed out waiting for frame")
        .expect("outbound channel closed");
    serde_json::from_str(&frame).expect("frame is JSON")
}

/// Collect frames until one of the given type arrives (inclusive).
async fn collect_until(
    rx: &mut mpsc::UnboundedReceiver<String>,
    stop_type: &str,
) -> Vec<serde_json::Value> {
    let mut frames = Vec::new();
    loop {
        let frame = next_frame(rx).await;
        let done = frame["type"] == stop_type;
        frames.push(frame);
        if done {
            return frames;
        }
    }
}

fn manager() -> std::sync::Arc<SessionManager> {
    let config = Config::default();
    let services = Services::from_config(&config);
    SessionManager::new(&config, services)
}

#[tokio::test]
async fn fresh_connect_then_text_turn() {
    let manager = manager();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel();
    let (session_id, tx) = manager.attach(None, 0, out_tx).await;

    // Auth ack first, stamped with the opening sequence number
    let ack = next_frame(&mut out_rx).await;
    assert_eq!(ack["type"], "auth");
    assert_eq!(ack["status"], "ok");
    assert_eq!(ack["sessionId"], session_id.as_str());
    assert_eq!(ack["serverSeq"], 0);
    assert_eq!(ack["sseq"], 0);

    // A text turn with no LLM configured: thinking, in-band error, then
    // completion signalling
    tx.send(SessionMsg::Inbound {
        cseq: None,
        envelope: ClientEnvelope::Text { text: "Hola".to_string(), prefix: None },
    })
    .unwrap();

    let frames = collect_until(&mut out_rx, "status").await;
    assert_eq!(frames[0]["type"], "status");
    assert_eq!(frames[0]["state"], "thinking");

    let mut rest = frames;
    // Drain until idle
    while rest.last().map(|f| f["state"] != "idle").unwrap_or(false) {
        rest.extend(collect_until(&mut out_rx, "status").await);
    }

    let types: Vec<&str> = rest.iter().filter_map(|f| f["type"].as_str()).collect();
    assert!(types.contains(&"error"));
    assert!(types.contains(&"stream_done"));
    assert_eq!(rest.last().unwrap()["state"], "idle");

    // Sequence numbers strictly increase across everything emitted
    let mut seqs = vec![ack["sseq"].as_u64().unwrap()];
    seqs.extend(rest.iter().map(|f| f["sseq"].as_u64().unwrap()));
    for pair in seqs.windows(2) {
        assert!(pair[1] > pair[0], "sseq not strictly increasing: {:?}", seqs);
    }
}

#[tokio::test]
async fn ping_is_ephemeral_and_replay_resends_past_cursor() {
    let manager = manager();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel();
    let (session_id, tx) = manager.attach(None, 0, out_tx).await;
    let _ack = next_frame(&mut out_rx).await; // sseq 0

    tx.send(SessionMsg::Inbound {
        cseq: None,
        envelope: ClientEnvelope::Text { text: "Hola".to_string(), prefix: None },
    })
    .unwrap();

    // Run to completion: thinking, error, stream_done, idle (sseq 1..=4)
    let mut frames = Vec::new();
    while frames
        .last()
        .map(|f: &serde_json::Value| !(f["type"] == "status" && f["state"] == "idle"))
        .unwrap_or(true)
    {
        frames.push(next_frame(&mut out_rx).await);
    }
    let last_seq = frames.last().unwrap()["sseq"].as_u64().unwrap();

    // Pong goes out with the next sequence number but is never buffered
    tx.send(SessionMsg::Inbound { cseq: None, envelope: ClientEnvelope::Ping }).unwrap();
    let pong = next_frame(&mut out_rx).await;
    assert_eq!(pong["type"], "pong");
    assert_eq!(pong["sseq"], last_seq + 1);

    // Reconnect with lastServerSeq = 2: replayed envelopes are exactly
    // those buffered with sseq > 2, in order, each flagged, pong excluded
    let (out2_tx, mut out2_rx) = mpsc::unbounded_channel();
    let (sid2, _tx2) = manager.attach(Some(session_id.clone()), 2, out2_tx).await;
    assert_eq!(sid2, session_id);

    let ack2 = next_frame(&mut out2_rx).await;
    assert_eq!(ack2["type"], "auth");
    assert_eq!(ack2["serverSeq"], last_seq + 2);

    let mut replayed = Vec::new();
    for _ in 0..(last_seq - 2) {
        replayed.push(next_frame(&mut out2_rx).await);
    }
    let seqs: Vec<u64> = replayed.iter().map(|f| f["sseq"].as_u64().unwrap()).collect();
    let expected: Vec<u64> = (3..=last_seq).collect();
    assert_eq!(seqs, expected);
    for frame in &replayed {
        assert_eq!(frame["replay"], true, "missing replay flag: {}", frame);
        assert_ne!(frame["type"], "pong");
    }
}

#[tokio::test]
async fn unknown_session_id_mints_fresh_session() {
    let manager = manager();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel();
    let (session_id, _tx) = manager.attach(Some("stale-id".to_string()), 7, out_tx).await;
    assert_ne!(session_id, "stale-id");

    let ack = next_frame(&mut out_rx).await;
    assert_eq!(ack["serverSeq"], 0);
}

#[tokio::test]
async fn cancel_without_run_acks_idle() {
    let manager = manager();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel();
    let (_sid, tx) = manager.attach(None, 0, out_tx).await;
    let _ack = next_frame(&mut out_rx).await;

    tx.send(SessionMsg::Inbound { cseq: None, envelope: ClientEnvelope::Cancel }).unwrap();
    let frame = next_frame(&mut out_rx).await;
    assert_eq!(frame["type"], "status");
    assert_eq!(frame["state"], "idle");
}

#[tokio::test]
async fn barge_in_without_run_stops_playback_then_idles() {
    let manager = manager();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel();
    let (_sid, tx) = manager.attach(None, 0, out_tx).await;
    let _ack = next_frame(&mut out_rx).await;

    tx.send(SessionMsg::Inbound { cseq: None, envelope: ClientEnvelope::BargeIn }).unwrap();
    let stop = next_frame(&mut out_rx).await;
    assert_eq!(stop["type"], "stop_playback");
    let idle = next_frame(&mut out_rx).await;
    assert_eq!(idle["type"], "status");
    assert_eq!(idle["state"], "idle");
}

#[tokio::test]
async fn duplicate_cseq_is_ignored() {
    let manager = manager();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel();
    let (_sid, tx) = manager.attach(None, 0, out_tx).await;
    let _ack = next_frame(&mut out_rx).await;

    tx.send(SessionMsg::Inbound { cseq: Some(1), envelope: ClientEnvelope::Ping }).unwrap();
    let pong = next_frame(&mut out_rx).await;
    assert_eq!(pong["type"], "pong");

    // Same cseq again: silently dropped
    tx.send(SessionMsg::Inbound { cseq: Some(1), envelope: ClientEnvelope::Ping }).unwrap();
    // A later cseq still works
    tx.send(SessionMsg::Inbound { cseq: Some(2), envelope: ClientEnvelope::GetSettings }).unwrap();
    let next = next_frame(&mut out_rx).await;
    assert_eq!(next["type"], "settings", "duplicate ping should not produce a frame");
}

#[tokio::test]
async fn settings_roundtrip_and_wake_name_update() {
    let manager = manager();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel();
    let (_sid, tx) = manager.attach(None, 0, out_tx).await;
    let _ack = next_frame(&mut out_rx).await;

    tx.send(SessionMsg::Inbound { cseq: None, envelope: ClientEnvelope::GetSettings }).unwrap();
    let settings = next_frame(&mut out_rx).await;
    assert_eq!(settings["type"], "settings");
    assert_eq!(settings["wakeName"], "jarvis");
    assert_eq!(settings["ttsEngine"], "cloud");

    tx.send(SessionMsg::Inbound {
        cseq: None,
        envelope: ClientEnvelope::SetBotName { name: "nova".to_string() },
    })
    .unwrap();
    let updated = next_frame(&mut out_rx).await;
    assert_eq!(updated["wakeName"], "nova");
}
