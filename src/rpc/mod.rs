//! JSON-RPC client plumbing for stdio peers.
//!
//! - `message`: the request / notification / response data model.
//! - `codec`: `Content-Length` framing, as a pure decoder and a stream codec.
//! - `timeouts`: per-method request deadlines.
//! - `session`: the pending-operation table, reader task, and abort path.

pub mod codec;
pub mod message;
pub mod session;
pub mod timeouts;

pub use message::{Message, RpcErrorObject};
pub use session::{Notification, RpcSession, SessionOptions};
pub use timeouts::RequestTimeouts;
