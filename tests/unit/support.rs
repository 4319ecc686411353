//! In-memory peer for session-level tests.

use std::time::Duration;

use futures_util::StreamExt;
use serde_json::Value;
use tokio::io::{AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio_util::codec::FramedRead;

use peer_harness::rpc::codec::{self, FrameCodec};
use peer_harness::rpc::{Message, RpcSession, SessionOptions};

/// The far end of a duplex pipe, speaking framed JSON-RPC.
pub struct FakePeer {
    reader: FramedRead<ReadHalf<DuplexStream>, FrameCodec>,
    writer: WriteHalf<DuplexStream>,
}

impl FakePeer {
    /// Next message the client wrote; panics after one second of silence.
    pub async fn recv(&mut self) -> Message {
        tokio::time::timeout(Duration::from_secs(1), self.reader.next())
            .await
            .expect("client should write within a second")
            .expect("client stream should stay open")
            .expect("client frames should decode")
    }

    /// Write one frame to the client.
    pub async fn send(&mut self, message: &Message) {
        self.send_raw(&codec::encode(message).expect("encode")).await;
    }

    /// Write raw bytes to the client.
    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).await.expect("write to client");
        self.writer.flush().await.expect("flush to client");
    }

    /// Receive the next request and return its id and method.
    pub async fn expect_request(&mut self) -> (Value, String) {
        match self.recv().await {
            Message::Request { id, method, .. } => (id, method),
            other => panic!("expected a request, got {other:?}"),
        }
    }
}

/// Start a session wired to a fresh [`FakePeer`].
pub fn connect(options: SessionOptions) -> (RpcSession, FakePeer) {
    connect_with_buffer(options, 64 * 1024)
}

/// Like [`connect`], with `max_buf` bytes of pipe capacity in each direction.
pub fn connect_with_buffer(options: SessionOptions, max_buf: usize) -> (RpcSession, FakePeer) {
    let (client, peer) = tokio::io::duplex(max_buf);
    let (client_read, client_write) = tokio::io::split(client);
    let (peer_read, peer_write) = tokio::io::split(peer);

    let session = RpcSession::start(client_read, client_write, options);
    let peer = FakePeer {
        reader: FramedRead::new(peer_read, FrameCodec),
        writer: peer_write,
    };
    (session, peer)
}
