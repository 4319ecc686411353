//! Unit tests for the `Content-Length` frame codec.
//!
//! Covers incremental decoding across arbitrary read boundaries, recovery
//! from malformed headers and bodies, and header parsing details.

use bytes::BytesMut;
use serde_json::json;
use tokio_util::codec::Decoder;

use peer_harness::rpc::codec::{decode, encode, FrameCodec};
use peer_harness::rpc::Message;

fn sample_messages() -> Vec<Message> {
    vec![
        Message::request(1, "initialize", Some(json!({ "capabilities": {} }))),
        Message::notification("textDocument/publishDiagnostics", Some(json!({ "uri": "file:///a.wm", "diagnostics": [] }))),
        Message::success(json!(1), json!({ "serverInfo": { "name": "démo ✓" } })),
    ]
}

fn wire(messages: &[Message]) -> Vec<u8> {
    messages
        .iter()
        .flat_map(|m| encode(m).expect("encode"))
        .collect()
}

/// Feed `chunks` through the stream decoder, collecting every message.
fn decode_chunks<'a>(chunks: impl IntoIterator<Item = &'a [u8]>) -> Vec<Message> {
    let mut codec = FrameCodec;
    let mut buf = BytesMut::new();
    let mut out = Vec::new();
    for chunk in chunks {
        buf.extend_from_slice(chunk);
        while let Some(msg) = codec.decode(&mut buf).expect("decode never fails on bytes") {
            out.push(msg);
        }
    }
    out
}

// ── Read boundaries ─────────────────────────────────────────────────────────

/// Splitting the same byte stream at any single point yields the same
/// messages in the same order.
#[test]
fn any_split_point_yields_same_messages() {
    let expected = sample_messages();
    let bytes = wire(&expected);

    for split in 0..=bytes.len() {
        let (head, tail) = bytes.split_at(split);
        assert_eq!(
            decode_chunks([head, tail]),
            expected,
            "split at byte {split} changed the decoded sequence"
        );
    }
}

/// Byte-at-a-time delivery still yields every message.
#[test]
fn one_byte_reads_yield_all_messages() {
    let expected = sample_messages();
    let bytes = wire(&expected);

    assert_eq!(decode_chunks(bytes.chunks(1)), expected);
}

/// The pure decoder hands back an incomplete frame untouched.
#[test]
fn pure_decode_returns_incomplete_tail() {
    let first = Message::notification("a", None);
    let mut bytes = encode(&first).expect("encode");
    let second = encode(&Message::notification("b", None)).expect("encode");
    bytes.extend_from_slice(&second[..second.len() - 3]);

    let (messages, rest) = decode(&bytes);

    assert_eq!(messages, vec![first]);
    assert_eq!(rest, &second[..second.len() - 3]);
}

// ── Recovery ────────────────────────────────────────────────────────────────

/// A header block without a length is skipped and the next frame decodes.
#[test]
fn header_without_length_is_skipped() {
    let valid = Message::notification("after", None);
    let mut bytes = b"X-Garbage: yes\r\n\r\n".to_vec();
    bytes.extend_from_slice(&encode(&valid).expect("encode"));

    let (messages, rest) = decode(&bytes);

    assert_eq!(messages, vec![valid]);
    assert!(rest.is_empty());
}

/// A body that is not JSON is dropped without losing the next frame.
#[test]
fn unparseable_body_is_dropped() {
    let valid = Message::notification("after", None);
    let mut bytes = b"Content-Length: 5\r\n\r\nnot{}".to_vec();
    bytes.extend_from_slice(&encode(&valid).expect("encode"));

    assert_eq!(decode_chunks([bytes.as_slice()]), vec![valid]);
}

/// A JSON body with neither `id` nor `method` is dropped.
#[test]
fn body_without_id_or_method_is_dropped() {
    let body = br#"{"jsonrpc":"2.0","result":1}"#;
    let mut bytes = format!("Content-Length: {}\r\n\r\n", body.len()).into_bytes();
    bytes.extend_from_slice(body);

    let (messages, rest) = decode(&bytes);

    assert!(messages.is_empty());
    assert!(rest.is_empty(), "the dropped frame must still be consumed");
}

// ── Header parsing ──────────────────────────────────────────────────────────

/// The header name is matched case-insensitively and among other headers.
#[test]
fn length_header_is_found_among_others_in_any_case() {
    let body = br#"{"jsonrpc":"2.0","method":"ping"}"#;
    let mut bytes = format!(
        "Content-Type: application/vscode-jsonrpc; charset=utf-8\r\ncontent-length:{}\r\n\r\n",
        body.len()
    )
    .into_bytes();
    bytes.extend_from_slice(body);

    let (messages, _) = decode(&bytes);

    assert_eq!(messages, vec![Message::notification("ping", None)]);
}

/// The declared length counts bytes, not characters.
#[test]
fn length_counts_utf8_bytes() {
    let msg = Message::notification("note", Some(json!({ "text": "héllo ✓" })));
    let frame = encode(&msg).expect("encode");
    let text = String::from_utf8(frame.clone()).expect("utf8");
    let body = text.split("\r\n\r\n").nth(1).expect("body");

    assert!(text.starts_with(&format!("Content-Length: {}\r\n\r\n", body.len())));
    assert_ne!(body.len(), body.chars().count());
    assert_eq!(decode(&frame).0, vec![msg]);
}
