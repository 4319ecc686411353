//! RPC session core.
//!
//! An [`RpcSession`] owns one peer's byte streams. It assigns request ids,
//! keeps a table of pending operations keyed by id, and runs a single
//! reader task that decodes frames and dispatches them:
//!
//! - responses complete the pending operation with the same id, in any
//!   order; responses for unknown ids are dropped,
//! - notifications go to the registered handler, in wire order, on the
//!   reader task,
//! - peer-initiated requests are answered with `MethodNotFound`.
//!
//! Timeout and completion are mutually exclusive: whichever side removes
//! the entry from the pending table owns the outcome. Abort drains the
//! whole table under the same lock, so no operation is lost.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::oneshot;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, warn, Instrument};

use crate::errors::{AbortCause, AbortKind};
use crate::rpc::codec::{self, FrameCodec};
use crate::rpc::message::{Message, RpcErrorObject, METHOD_NOT_FOUND};
use crate::rpc::timeouts::RequestTimeouts;
use crate::{AppError, Result};

/// Notification delivered to the session's handler.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    /// Method name.
    pub method: String,
    /// Parameters, if the peer sent any.
    pub params: Option<Value>,
}

/// Callback invoked on the reader task for every inbound notification.
///
/// It must not block and must not register another handler on the same
/// session.
pub type NotificationHandler = Box<dyn FnMut(&Notification) + Send>;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Session construction options.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Deadline policy for [`RpcSession::request`].
    pub timeouts: RequestTimeouts,
    /// Abort with [`AbortKind::StreamClosed`] when the peer's output ends.
    ///
    /// Supervised sessions turn this off so the exit monitor can report the
    /// exit code instead.
    pub abort_on_eof: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            timeouts: RequestTimeouts::default(),
            abort_on_eof: true,
        }
    }
}

struct PendingOperation {
    method: String,
    created_at: Instant,
    slot: oneshot::Sender<Result<Value>>,
}

#[derive(Default)]
struct SessionState {
    next_id: u64,
    pending: HashMap<u64, PendingOperation>,
    abort_cause: Option<AbortCause>,
}

struct Inner {
    session_id: String,
    state: Mutex<SessionState>,
    writer: tokio::sync::Mutex<Option<BoxedWriter>>,
    handler: Mutex<Option<NotificationHandler>>,
    timeouts: RequestTimeouts,
    abort_on_eof: bool,
    cancel: CancellationToken,
}

/// Handle to a running JSON-RPC client session.
///
/// Cloning the handle shares the same session.
#[derive(Clone)]
pub struct RpcSession {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for RpcSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcSession")
            .field("session_id", &self.inner.session_id)
            .field("pending", &self.pending_count())
            .field("abort_cause", &self.abort_cause())
            .finish_non_exhaustive()
    }
}

impl RpcSession {
    /// Start a session over `reader` (peer output) and `writer` (peer input).
    ///
    /// Spawns the reader task on the current tokio runtime.
    pub fn start<R, W>(reader: R, writer: W, options: SessionOptions) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let session_id = uuid::Uuid::new_v4().to_string();
        let inner = Arc::new(Inner {
            session_id: session_id.clone(),
            state: Mutex::new(SessionState {
                next_id: 1,
                ..SessionState::default()
            }),
            writer: tokio::sync::Mutex::new(Some(Box::new(writer))),
            handler: Mutex::new(None),
            timeouts: options.timeouts,
            abort_on_eof: options.abort_on_eof,
            cancel: CancellationToken::new(),
        });

        tokio::spawn(
            read_loop(Arc::clone(&inner), reader).instrument(info_span!("rpc_reader", session_id = %session_id)),
        );

        Self { inner }
    }

    /// Identifier used in log lines for this session.
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    /// Send a request and wait for its response using the method's deadline.
    ///
    /// # Errors
    ///
    /// See [`request_with_timeout`](Self::request_with_timeout).
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        let timeout = self.inner.timeouts.for_method(method);
        self.request_with_timeout(method, params, timeout).await
    }

    /// Send a request and wait at most `timeout` for its response.
    ///
    /// # Errors
    ///
    /// - [`AppError::SessionAborted`] if the session is or becomes terminal.
    /// - [`AppError::Timeout`] if no response arrives in time; the pending
    ///   entry is removed and a late response is dropped.
    /// - [`AppError::Rpc`] if the peer answers with an error object.
    /// - [`AppError::Io`] if the request cannot be written.
    pub async fn request_with_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value> {
        let (id, mut rx) = self.inner.register(method)?;
        let _pending = PendingGuard {
            inner: &self.inner,
            id,
        };
        let frame = codec::encode(&Message::request(id, method, params))?;
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        // The write runs on its own task: a peer that stops reading cannot
        // hold the caller past its deadline, and a frame is never cut short
        // when the caller gives up.
        let mut write = tokio::spawn({
            let inner = Arc::clone(&self.inner);
            async move { inner.write_frame(&frame).await }
        });

        tokio::select! {
            written = &mut write => match written {
                Ok(Ok(())) => {}
                Ok(Err(err)) => return Err(err),
                Err(err) => return Err(AppError::Io(format!("request writer failed: {err}"))),
            },
            outcome = &mut rx => return self.inner.settle_outcome(outcome),
            () = &mut deadline => return self.expire(id, method, timeout, rx).await,
        }
        debug!(session_id = %self.inner.session_id, id, method, "request sent");

        tokio::select! {
            outcome = &mut rx => self.inner.settle_outcome(outcome),
            () = &mut deadline => self.expire(id, method, timeout, rx).await,
        }
    }

    /// Resolve a request whose deadline elapsed.
    async fn expire(
        &self,
        id: u64,
        method: &str,
        timeout: Duration,
        rx: oneshot::Receiver<Result<Value>>,
    ) -> Result<Value> {
        if self.inner.forget(id) {
            warn!(session_id = %self.inner.session_id, id, method, ?timeout, "request timed out");
            Err(AppError::Timeout {
                method: method.to_owned(),
                after: timeout,
            })
        } else {
            // Completed or aborted between the deadline and the removal;
            // the owner of the slot sends without awaiting anything.
            self.inner.settle_outcome(rx.await)
        }
    }

    /// Send a notification without waiting for any acknowledgement.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::SessionAborted`] if the session is terminal, or
    /// [`AppError::Io`] if the write fails.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        self.inner.ensure_live()?;
        let frame = codec::encode(&Message::notification(method, params))?;
        self.inner.write_frame(&frame).await?;
        debug!(session_id = %self.inner.session_id, method, "notification sent");
        Ok(())
    }

    /// Register the notification handler, replacing any previous one.
    pub fn on_notification<F>(&self, handler: F)
    where
        F: FnMut(&Notification) + Send + 'static,
    {
        *lock(&self.inner.handler) = Some(Box::new(handler));
    }

    /// Make the session terminal.
    ///
    /// Every pending request fails with `cause`, later calls fail
    /// immediately with it, and the reader task stops. Only the first call
    /// has any effect; returns whether this call applied its cause.
    pub fn abort(&self, cause: AbortCause) -> bool {
        self.inner.abort(cause)
    }

    /// First abort cause, if the session is terminal.
    #[must_use]
    pub fn abort_cause(&self) -> Option<AbortCause> {
        lock(&self.inner.state).abort_cause.clone()
    }

    /// Resolve once the session is terminal, with its cause.
    pub async fn aborted(&self) -> AbortCause {
        self.inner.cancel.cancelled().await;
        // The cause is recorded before the token is cancelled.
        self.abort_cause()
            .unwrap_or_else(|| AbortCause::explicit("session cancelled"))
    }

    /// Whether the session is terminal.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        lock(&self.inner.state).abort_cause.is_some()
    }

    /// Number of requests still awaiting a response.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        lock(&self.inner.state).pending.len()
    }

    /// Shut down and drop the write side, closing the peer's input.
    ///
    /// Later writes fail with [`AppError::Io`].
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Io`] if the final flush fails.
    pub async fn close_input(&self) -> Result<()> {
        let mut guard = self.inner.writer.lock().await;
        if let Some(mut writer) = guard.take() {
            writer.shutdown().await?;
        }
        Ok(())
    }
}

impl Inner {
    fn register(&self, method: &str) -> Result<(u64, oneshot::Receiver<Result<Value>>)> {
        let mut state = lock(&self.state);
        if let Some(cause) = &state.abort_cause {
            return Err(AppError::SessionAborted(cause.clone()));
        }
        let id = state.next_id;
        state.next_id += 1;
        let (slot, rx) = oneshot::channel();
        state.pending.insert(
            id,
            PendingOperation {
                method: method.to_owned(),
                created_at: Instant::now(),
                slot,
            },
        );
        Ok((id, rx))
    }

    /// Remove `id` from the pending table; `true` if this call removed it.
    fn forget(&self, id: u64) -> bool {
        lock(&self.state).pending.remove(&id).is_some()
    }

    fn ensure_live(&self) -> Result<()> {
        match &lock(&self.state).abort_cause {
            Some(cause) => Err(AppError::SessionAborted(cause.clone())),
            None => Ok(()),
        }
    }

    fn settle_outcome<E>(&self, outcome: std::result::Result<Result<Value>, E>) -> Result<Value> {
        // The slot is only dropped unsent when the session is torn down.
        outcome.unwrap_or_else(|_| Err(self.aborted_error()))
    }

    fn aborted_error(&self) -> AppError {
        let cause = lock(&self.state).abort_cause.clone().unwrap_or_else(|| {
            AbortCause::new(AbortKind::StreamClosed, "session dropped before response")
        });
        AppError::SessionAborted(cause)
    }

    /// Write one whole frame; gives up once the session aborts.
    async fn write_frame(&self, frame: &[u8]) -> Result<()> {
        let write = async {
            let mut guard = self.writer.lock().await;
            let writer = guard
                .as_mut()
                .ok_or_else(|| AppError::Io("peer input already closed".into()))?;
            writer.write_all(frame).await?;
            writer.flush().await?;
            Ok(())
        };
        tokio::select! {
            written = write => written,
            () = self.cancel.cancelled() => Err(self.aborted_error()),
        }
    }

    fn complete(&self, id: &Value, outcome: std::result::Result<Value, RpcErrorObject>) {
        let Some(id) = id.as_u64() else {
            debug!(session_id = %self.session_id, %id, "dropping response with non-integer id");
            return;
        };

        let Some(op) = lock(&self.state).pending.remove(&id) else {
            debug!(session_id = %self.session_id, id, "dropping response for unknown or expired id");
            return;
        };

        debug!(
            session_id = %self.session_id,
            id,
            method = %op.method,
            elapsed_ms = u64::try_from(op.created_at.elapsed().as_millis()).unwrap_or(u64::MAX),
            "response received"
        );
        // The caller may have stopped waiting; that is not an error here.
        let _ = op.slot.send(outcome.map_err(AppError::from));
    }

    fn deliver(&self, notification: &Notification) {
        if let Some(handler) = lock(&self.handler).as_mut() {
            handler(notification);
        } else {
            debug!(
                session_id = %self.session_id,
                method = %notification.method,
                "no notification handler registered"
            );
        }
    }

    fn abort(&self, cause: AbortCause) -> bool {
        let drained = {
            let mut state = lock(&self.state);
            if state.abort_cause.is_some() {
                return false;
            }
            state.abort_cause = Some(cause.clone());
            std::mem::take(&mut state.pending)
        };

        warn!(
            session_id = %self.session_id,
            %cause,
            pending = drained.len(),
            "session aborted"
        );
        for op in drained.into_values() {
            let _ = op.slot.send(Err(AppError::SessionAborted(cause.clone())));
        }
        self.cancel.cancel();
        true
    }
}

/// Reader task: decode frames from the peer and dispatch them in order.
async fn read_loop<R>(inner: Arc<Inner>, reader: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut framed = FramedRead::new(reader, FrameCodec);

    loop {
        tokio::select! {
            biased;

            () = inner.cancel.cancelled() => {
                debug!("rpc reader: session aborted, stopping");
                break;
            }

            item = framed.next() => match item {
                None => {
                    stream_ended(&inner, "peer closed its output stream");
                    break;
                }
                Some(Err(err)) => {
                    stream_ended(&inner, &format!("read from peer failed: {err}"));
                    break;
                }
                Some(Ok(message)) => dispatch(&inner, message),
            }
        }
    }
}

fn stream_ended(inner: &Arc<Inner>, reason: &str) {
    if inner.abort_on_eof {
        inner.abort(AbortCause::new(AbortKind::StreamClosed, reason));
    } else {
        debug!(reason, "rpc reader: output ended, leaving abort to the supervisor");
    }
}

fn dispatch(inner: &Arc<Inner>, message: Message) {
    match message {
        Message::Response { id, outcome } => inner.complete(&id, outcome),
        Message::Notification { method, params } => {
            inner.deliver(&Notification { method, params });
        }
        Message::Request { id, method, .. } => {
            debug!(%id, %method, "rpc reader: declining peer-initiated request");
            let reply = Message::failure(
                id,
                RpcErrorObject {
                    code: METHOD_NOT_FOUND,
                    message: format!("method not supported by client: {method}"),
                    data: None,
                },
            );
            let inner = Arc::clone(inner);
            tokio::spawn(async move {
                let sent = match codec::encode(&reply) {
                    Ok(frame) => inner.write_frame(&frame).await,
                    Err(err) => Err(err),
                };
                if let Err(err) = sent {
                    debug!(error = %err, "rpc reader: failed to answer peer request");
                }
            });
        }
    }
}

/// Drops a request's pending entry when its caller stops waiting.
///
/// Removal is idempotent, so the guard also runs after a response or a
/// timeout already took the entry.
struct PendingGuard<'a> {
    inner: &'a Inner,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.inner.forget(self.id) {
            debug!(session_id = %self.inner.session_id, id = self.id, "request abandoned by caller");
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
