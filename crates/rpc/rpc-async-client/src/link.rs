// Copyright (C) 2025 Ryan Daum <ryan.daum@gmail.com> This program is free
// software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, version
// 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

use crate::{Backoff, LinkConfig, LinkState};
use bytes::BytesMut;
use futures_util::SinkExt;
use rpc_common::{
    HostFrame, HostNotification, RpcError, encode_notification, encode_request, parse_host_frame,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{oneshot, watch};
use tokio_util::codec::{Decoder, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Invoked from the read loop for every unsolicited host notification. Must not block.
pub type EventHandler = Arc<dyn Fn(&HostNotification) + Send + Sync>;

/// Invoked on every connect / disconnect transition. Must not block.
pub type LifecycleHandler = Arc<dyn Fn(LinkLifecycle) + Send + Sync>;

/// Connection transitions, tagged with the connection generation they belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkLifecycle {
    Connected { generation: u64 },
    Disconnected { generation: u64 },
}

type Waiter = oneshot::Sender<Result<Value, RpcError>>;

struct Connection {
    generation: u64,
    /// Feeds the single writer task. Frames are written whole, in send order.
    writer: flume::Sender<String>,
    shutdown: CancellationToken,
}

struct LinkInner {
    config: LinkConfig,
    next_id: AtomicU64,
    generation: AtomicU64,
    connection: Mutex<Option<Connection>>,
    pending: Mutex<HashMap<u64, Waiter>>,
    state: watch::Sender<LinkState>,
    event_handlers: RwLock<Vec<EventHandler>>,
    lifecycle_handlers: RwLock<Vec<LifecycleHandler>>,
    connect_lock: tokio::sync::Mutex<()>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The one link to the control host. Cheap to clone; all clones share the same socket.
///
/// Calls from any number of tasks are multiplexed over the socket by correlation token. A single
/// reader task owns the read half and routes responses back to their waiters; a single writer
/// task owns the write half so frames from concurrent callers never interleave.
#[derive(Clone)]
pub struct UpstreamLink {
    inner: Arc<LinkInner>,
}

impl UpstreamLink {
    pub fn new(config: LinkConfig) -> Self {
        let (state, _) = watch::channel(LinkState::Disconnected);
        Self {
            inner: Arc::new(LinkInner {
                config,
                next_id: AtomicU64::new(1),
                generation: AtomicU64::new(0),
                connection: Mutex::new(None),
                pending: Mutex::new(HashMap::new()),
                state,
                event_handlers: RwLock::new(Vec::new()),
                lifecycle_handlers: RwLock::new(Vec::new()),
                connect_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn config(&self) -> &LinkConfig {
        &self.inner.config
    }

    pub fn state(&self) -> LinkState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<LinkState> {
        self.inner.state.subscribe()
    }

    /// The generation of the current (or most recent) connection. Bumped on every connect.
    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    /// Number of calls awaiting a response from the host.
    pub fn pending_calls(&self) -> usize {
        lock(&self.inner.pending).len()
    }

    pub fn on_event<F>(&self, handler: F)
    where
        F: Fn(&HostNotification) + Send + Sync + 'static,
    {
        self.inner
            .event_handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(handler));
    }

    pub fn on_lifecycle<F>(&self, handler: F)
    where
        F: Fn(LinkLifecycle) + Send + Sync + 'static,
    {
        self.inner
            .lifecycle_handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(handler));
    }

    /// Establish the connection. A no-op if already connected.
    pub async fn connect(&self) -> Result<(), RpcError> {
        let _connecting = self.inner.connect_lock.lock().await;
        if self.state().is_up() {
            return Ok(());
        }

        let socket_path = &self.inner.config.socket_path;
        self.inner.state.send_replace(LinkState::Connecting);
        let stream = match UnixStream::connect(socket_path).await {
            Ok(stream) => stream,
            Err(e) => {
                self.inner.state.send_replace(LinkState::Disconnected);
                return Err(RpcError::LinkUnavailable(format!(
                    "{}: {e}",
                    socket_path.display()
                )));
            }
        };
        let (read_half, write_half) = stream.into_split();

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (writer, frames) = flume::unbounded();
        let shutdown = CancellationToken::new();
        {
            let mut connection = lock(&self.inner.connection);
            *connection = Some(Connection {
                generation,
                writer,
                shutdown: shutdown.clone(),
            });
            self.inner.state.send_replace(LinkState::Connected);
        }
        info!(socket = ?socket_path, generation, "Connected to control host");

        // Listeners hear about the connection before the reader can possibly report its loss.
        self.inner
            .emit_lifecycle(LinkLifecycle::Connected { generation });

        tokio::spawn(write_loop(
            self.inner.clone(),
            write_half,
            frames,
            generation,
            shutdown.clone(),
        ));
        tokio::spawn(read_loop(
            self.inner.clone(),
            read_half,
            generation,
            shutdown,
        ));
        Ok(())
    }

    /// Drop the current connection, failing every pending call with `LinkReset`.
    pub fn disconnect(&self) {
        let generation = self.generation();
        self.inner.reset(generation, "disconnect requested");
    }

    /// Mark a live link as degraded (connected, but not in a trustworthy state).
    pub fn set_degraded(&self) {
        self.inner.state.send_if_modified(|state| {
            if *state == LinkState::Connected {
                *state = LinkState::Degraded;
                true
            } else {
                false
            }
        });
    }

    /// Clear a degraded mark.
    pub fn set_healthy(&self) {
        self.inner.state.send_if_modified(|state| {
            if *state == LinkState::Degraded {
                *state = LinkState::Connected;
                true
            } else {
                false
            }
        });
    }

    /// Call a host method using the configured default deadline.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        self.call_with_timeout(method, params, self.inner.config.call_timeout)
            .await
    }

    /// Call a host method, waiting at most `timeout` for its response.
    pub async fn call_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, RpcError> {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let frame = encode_request(id, method, params)?;

        // Registering the waiter and queueing the frame happen under the connection lock, so a
        // concurrent reset either sees this waiter (and fails it) or we see no connection.
        let response = {
            let connection = lock(&self.inner.connection);
            let Some(connection) = connection.as_ref() else {
                return Err(RpcError::LinkUnavailable(
                    "not connected to control host".to_string(),
                ));
            };
            let (tx, rx) = oneshot::channel();
            lock(&self.inner.pending).insert(id, tx);
            if connection.writer.send(frame).is_err() {
                lock(&self.inner.pending).remove(&id);
                return Err(RpcError::LinkReset);
            }
            rx
        };
        let _guard = PendingGuard {
            inner: &self.inner,
            id,
        };
        trace!(id, method, "Forwarded call to control host");

        let outcome = match timeout {
            Some(timeout) => match tokio::time::timeout(timeout, response).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    debug!(id, method, ?timeout, "Call to control host timed out");
                    return Err(RpcError::Timeout);
                }
            },
            None => response.await,
        };
        // A dropped sender means the waiter was discarded without an answer.
        outcome.unwrap_or(Err(RpcError::LinkReset))
    }

    /// Send a fire-and-forget notification to the host.
    pub fn notify(&self, method: &str, params: Value) -> Result<(), RpcError> {
        let frame = encode_notification(method, params)?;
        let connection = lock(&self.inner.connection);
        let Some(connection) = connection.as_ref() else {
            return Err(RpcError::LinkUnavailable(
                "not connected to control host".to_string(),
            ));
        };
        connection
            .writer
            .send(frame)
            .map_err(|_| RpcError::LinkReset)
    }

    /// Keep the link up until `shutdown` fires: connect with capped exponential backoff, wait for
    /// the connection to drop, and go again.
    pub async fn run_supervisor(&self, shutdown: CancellationToken) {
        let config = &self.inner.config;
        let mut backoff = Backoff::new(config.reconnect_min, config.reconnect_max);
        let mut state = self.watch_state();
        let mut failures: u64 = 0;
        loop {
            if shutdown.is_cancelled() {
                break;
            }
            match self.connect().await {
                Ok(()) => {
                    failures = 0;
                    backoff.reset();
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = state.wait_for(|s| *s == LinkState::Disconnected) => {}
                    }
                    // Don't spin if the host accepts and immediately hangs up.
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(config.reconnect_min) => {}
                    }
                }
                Err(e) => {
                    failures += 1;
                    let delay = backoff.next_delay();
                    if failures == 1 || failures % 10 == 0 {
                        warn!(error = %e, failures, ?delay, "Control host unavailable, retrying");
                    } else {
                        debug!(error = %e, failures, ?delay, "Control host unavailable, retrying");
                    }
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
        info!("Link supervisor stopping");
        self.disconnect();
    }
}

/// Removes a call's waiter however the call ends (response, timeout, or the caller going away).
struct PendingGuard<'a> {
    inner: &'a LinkInner,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock(&self.inner.pending).remove(&self.id);
    }
}

impl LinkInner {
    fn emit_lifecycle(&self, event: LinkLifecycle) {
        let handlers = self
            .lifecycle_handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for handler in handlers {
            handler(event);
        }
    }

    /// Tear down connection `generation` if it is still current. Every waiter is failed before
    /// anyone can register a new one.
    fn reset(&self, generation: u64, reason: &str) {
        let waiters = {
            let mut connection = lock(&self.connection);
            match connection.as_ref() {
                Some(current) if current.generation == generation => {}
                _ => return,
            }
            if let Some(current) = connection.take() {
                current.shutdown.cancel();
            }
            self.state.send_replace(LinkState::Disconnected);
            std::mem::take(&mut *lock(&self.pending))
        };
        warn!(
            generation,
            reason,
            failed_calls = waiters.len(),
            "Connection to control host lost"
        );
        for (_, waiter) in waiters {
            let _ = waiter.send(Err(RpcError::LinkReset));
        }
        self.emit_lifecycle(LinkLifecycle::Disconnected { generation });
    }

    fn dispatch(&self, bytes: &[u8]) {
        match parse_host_frame(bytes) {
            Ok(HostFrame::Response { id, result }) => {
                let waiter = lock(&self.pending).remove(&id);
                match waiter {
                    Some(waiter) => {
                        let _ = waiter.send(result.map_err(RpcError::from));
                    }
                    None => {
                        debug!(id, "Discarding response for expired or unknown call");
                    }
                }
            }
            Ok(HostFrame::UncorrelatedError(error)) => {
                warn!(code = error.code, message = %error.message, "Uncorrelated error from control host");
            }
            Ok(HostFrame::Notification(notification)) => {
                trace!(method = %notification.method, "Host notification");
                let handlers = self
                    .event_handlers
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone();
                for handler in handlers {
                    handler(&notification);
                }
            }
            Err(e) => {
                warn!(error = %e, "Dropping malformed frame from control host");
            }
        }
    }
}

async fn write_loop(
    inner: Arc<LinkInner>,
    write_half: OwnedWriteHalf,
    frames: flume::Receiver<String>,
    generation: u64,
    shutdown: CancellationToken,
) {
    let codec = inner.config.framing.codec(inner.config.max_frame_bytes);
    let mut sink = FramedWrite::new(write_half, codec);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = frames.recv_async() => {
                let Ok(frame) = frame else {
                    break;
                };
                if let Err(e) = sink.send(frame).await {
                    error!(generation, error = %e, "Unable to write to control host");
                    inner.reset(generation, "write failed");
                    break;
                }
            }
        }
    }
}

async fn read_loop(
    inner: Arc<LinkInner>,
    mut read_half: OwnedReadHalf,
    generation: u64,
    shutdown: CancellationToken,
) {
    let mut codec = inner.config.framing.codec(inner.config.max_frame_bytes);
    let mut buf = BytesMut::with_capacity(8 * 1024);
    let reason = 'read: loop {
        loop {
            match codec.decode(&mut buf) {
                Ok(Some(frame)) => {
                    let frame = frame.trim_ascii();
                    if !frame.is_empty() {
                        inner.dispatch(frame);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    // The codec skips ahead to the next delimiter on its own.
                    warn!(generation, error = %e, "Dropping oversized frame from control host");
                }
            }
        }

        tokio::select! {
            _ = shutdown.cancelled() => return,
            read = read_half.read_buf(&mut buf) => {
                match read {
                    Ok(0) => break 'read "end of stream".to_string(),
                    Ok(_) => {}
                    Err(e) => break 'read format!("read failed: {e}"),
                }
            }
        }
    };
    inner.reset(generation, &reason);
}
