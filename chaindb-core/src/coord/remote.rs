//! Coordination service over TCP
//!
//! Uses the same length-prefixed bincode framing as the table protocol.
//! Calls carry an id so replies can be matched; watch notifications are
//! pushed by the server as separate frames. A session lives exactly as
//! long as its connection.

use super::{ChildWatch, Coordinator, MemoryCoordinator, MemorySession, WatchEvent};
use crate::error::{ClientResult, CoordError, CoordResult};
use crate::protocol::{read_frame, write_frame, DEFAULT_MAX_FRAME_BYTES};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

#[derive(Debug, Serialize, Deserialize)]
struct CoordCall {
    id: u64,
    request: CoordRequest,
}

#[derive(Debug, Serialize, Deserialize)]
enum CoordRequest {
    EnsureExists { path: String },
    CreateEphemeralSequential { prefix: String, data: Vec<u8> },
    ChildrenAndWatch { path: String },
    ReadData { path: String },
    Close,
}

#[derive(Debug, Serialize, Deserialize)]
enum CoordReply {
    Done,
    Created(String),
    Children { children: Vec<String>, watch_id: u64 },
    Data(Vec<u8>),
    Failed { kind: FailureKind, detail: String },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
enum FailureKind {
    NoNode,
    NodeExists,
    NoChildrenForEphemerals,
    SessionExpired,
    Other,
}

#[derive(Debug, Serialize, Deserialize)]
enum ServerFrame {
    Reply { id: u64, reply: CoordReply },
    Watch { watch_id: u64, event: WatchEvent },
}

impl From<CoordError> for CoordReply {
    fn from(err: CoordError) -> Self {
        let (kind, detail) = match err {
            CoordError::NoNode(path) => (FailureKind::NoNode, path),
            CoordError::NodeExists(path) => (FailureKind::NodeExists, path),
            CoordError::NoChildrenForEphemerals(path) => {
                (FailureKind::NoChildrenForEphemerals, path)
            }
            CoordError::SessionExpired => (FailureKind::SessionExpired, String::new()),
            other => (FailureKind::Other, other.to_string()),
        };
        CoordReply::Failed { kind, detail }
    }
}

fn into_error(kind: FailureKind, detail: String) -> CoordError {
    match kind {
        FailureKind::NoNode => CoordError::NoNode(detail),
        FailureKind::NodeExists => CoordError::NodeExists(detail),
        FailureKind::NoChildrenForEphemerals => CoordError::NoChildrenForEphemerals(detail),
        FailureKind::SessionExpired => CoordError::SessionExpired,
        FailureKind::Other => CoordError::Connection(detail),
    }
}

/// Serves a [`MemoryCoordinator`] to remote sessions
pub struct CoordServer {
    listener: TcpListener,
    coordinator: MemoryCoordinator,
}

impl CoordServer {
    pub async fn bind(addr: impl ToSocketAddrs, coordinator: MemoryCoordinator) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!("Coordination server bound to {}", listener.local_addr()?);
        Ok(Self {
            listener,
            coordinator,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn coordinator(&self) -> &MemoryCoordinator {
        &self.coordinator
    }

    pub async fn serve(self) {
        self.serve_until(std::future::pending()).await
    }

    pub async fn serve_until(self, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Coordination server shutting down");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let session = self.coordinator.session();
                        tokio::spawn(async move {
                            let id = session.id();
                            debug!("Session {} opened from {}", id, peer);
                            if let Err(e) = serve_session(session, stream).await {
                                warn!("Session {} from {} ended with error: {}", id, peer, e);
                            }
                        });
                    }
                    Err(e) => error!("Failed to accept connection: {}", e),
                },
            }
        }
    }
}

async fn serve_session(session: MemorySession, stream: TcpStream) -> ClientResult<()> {
    stream.set_nodelay(true)?;
    let (mut reader, mut writer) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerFrame>();

    let writer_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = write_frame(&mut writer, &frame).await {
                debug!("Coordination write failed: {}", e);
                break;
            }
        }
    });

    let mut next_watch_id = 0u64;
    while let Some(call) = read_frame::<_, CoordCall>(&mut reader, DEFAULT_MAX_FRAME_BYTES).await? {
        let mut armed = None;
        let closing = matches!(call.request, CoordRequest::Close);

        let reply = match call.request {
            CoordRequest::EnsureExists { path } => {
                session.ensure_exists(&path).map(|_| CoordReply::Done)
            }
            CoordRequest::CreateEphemeralSequential { prefix, data } => session
                .create_ephemeral_sequential(&prefix, &data)
                .map(CoordReply::Created),
            CoordRequest::ChildrenAndWatch { path } => {
                session.children_and_watch(&path).map(|(children, watch)| {
                    next_watch_id += 1;
                    armed = Some((next_watch_id, watch));
                    CoordReply::Children {
                        children,
                        watch_id: next_watch_id,
                    }
                })
            }
            CoordRequest::ReadData { path } => session.read_data(&path).map(CoordReply::Data),
            CoordRequest::Close => {
                session.close();
                Ok(CoordReply::Done)
            }
        };

        let reply = reply.unwrap_or_else(CoordReply::from);
        if tx.send(ServerFrame::Reply { id: call.id, reply }).is_err() {
            break;
        }

        // Forwarded only after the reply is queued, so the client always
        // learns the watch id before the event
        if let Some((watch_id, watch)) = armed {
            let tx = tx.clone();
            tokio::spawn(async move {
                let event = watch.fired().await;
                let _ = tx.send(ServerFrame::Watch { watch_id, event });
            });
        }

        if closing {
            break;
        }
    }

    debug!("Session {} closed", session.id());
    drop(session);
    drop(tx);
    let _ = writer_task.await;
    Ok(())
}

struct Delivery {
    reply: CoordReply,
    watch: Option<ChildWatch>,
}

#[derive(Default)]
struct Shared {
    pending: Mutex<HashMap<u64, oneshot::Sender<Delivery>>>,
    watches: Mutex<HashMap<u64, oneshot::Sender<WatchEvent>>>,
    closed: AtomicBool,
}

impl Shared {
    fn shut_down(&self) {
        self.closed.store(true, Ordering::Release);
        self.pending.lock().clear();
        for (_, tx) in self.watches.lock().drain() {
            let _ = tx.send(WatchEvent::SessionClosed);
        }
    }
}

/// Removes a call's reply slot when the call finishes or is dropped
struct PendingCall<'a> {
    shared: &'a Shared,
    id: u64,
}

impl Drop for PendingCall<'_> {
    fn drop(&mut self) {
        self.shared.pending.lock().remove(&self.id);
    }
}

/// Client session on a [`CoordServer`]
///
/// Frames are written by a dedicated task, so a caller that gives up on a
/// call never leaves half a frame on the connection.
pub struct RemoteCoordinator {
    address: String,
    outgoing: mpsc::UnboundedSender<CoordCall>,
    shared: Arc<Shared>,
    next_id: AtomicU64,
    request_timeout: Duration,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl RemoteCoordinator {
    /// Dial `address`; `request_timeout` bounds the connect and every call
    pub async fn connect(
        address: impl Into<String>,
        request_timeout: Duration,
    ) -> CoordResult<Self> {
        let address = address.into();
        let stream = timeout(request_timeout, TcpStream::connect(&address))
            .await
            .map_err(|_| CoordError::Connection(format!("connect to {} timed out", address)))??;
        stream.set_nodelay(true)?;

        let (reader, writer) = stream.into_split();
        let shared = Arc::new(Shared::default());
        let reader = tokio::spawn(read_loop(reader, Arc::clone(&shared)));
        let (outgoing, calls) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_loop(writer, calls, Arc::clone(&shared)));

        debug!("Coordination session opened with {}", address);
        Ok(Self {
            address,
            outgoing,
            shared,
            next_id: AtomicU64::new(1),
            request_timeout,
            reader,
            writer,
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    async fn call(&self, request: CoordRequest) -> CoordResult<Delivery> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(CoordError::SessionExpired);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().insert(id, tx);
        let _pending = PendingCall {
            shared: &self.shared,
            id,
        };
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(CoordError::SessionExpired);
        }
        if self.outgoing.send(CoordCall { id, request }).is_err() {
            return Err(CoordError::SessionExpired);
        }

        match timeout(self.request_timeout, rx).await {
            Ok(Ok(Delivery {
                reply: CoordReply::Failed { kind, detail },
                ..
            })) => Err(into_error(kind, detail)),
            Ok(Ok(delivery)) => Ok(delivery),
            Ok(Err(_)) => Err(CoordError::SessionExpired),
            Err(_) => Err(CoordError::Connection(format!(
                "request to {} timed out",
                self.address
            ))),
        }
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut calls: mpsc::UnboundedReceiver<CoordCall>,
    shared: Arc<Shared>,
) {
    while let Some(call) = calls.recv().await {
        if let Err(e) = write_frame(&mut writer, &call).await {
            warn!("Coordination session write failed: {}", e);
            shared.shut_down();
            break;
        }
    }
}

async fn read_loop(mut reader: OwnedReadHalf, shared: Arc<Shared>) {
    loop {
        match read_frame::<_, ServerFrame>(&mut reader, DEFAULT_MAX_FRAME_BYTES).await {
            Ok(Some(ServerFrame::Reply { id, reply })) => {
                // Registered before the next frame is read, so a watch
                // event can never overtake its registration
                let watch = match &reply {
                    CoordReply::Children { watch_id, .. } => {
                        let (tx, rx) = oneshot::channel();
                        shared.watches.lock().insert(*watch_id, tx);
                        Some(ChildWatch::new(rx))
                    }
                    _ => None,
                };
                if let Some(tx) = shared.pending.lock().remove(&id) {
                    let _ = tx.send(Delivery { reply, watch });
                }
            }
            Ok(Some(ServerFrame::Watch { watch_id, event })) => {
                if let Some(tx) = shared.watches.lock().remove(&watch_id) {
                    let _ = tx.send(event);
                }
            }
            Ok(None) => {
                debug!("Coordination server closed the session");
                break;
            }
            Err(e) => {
                warn!("Coordination session read failed: {}", e);
                break;
            }
        }
    }
    shared.shut_down();
}

impl Drop for RemoteCoordinator {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

#[async_trait]
impl Coordinator for RemoteCoordinator {
    async fn ensure_exists(&self, path: &str) -> CoordResult<()> {
        match self
            .call(CoordRequest::EnsureExists {
                path: path.to_string(),
            })
            .await?
            .reply
        {
            CoordReply::Done => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn create_ephemeral_sequential(&self, prefix: &str, data: &[u8]) -> CoordResult<String> {
        let request = CoordRequest::CreateEphemeralSequential {
            prefix: prefix.to_string(),
            data: data.to_vec(),
        };
        match self.call(request).await?.reply {
            CoordReply::Created(path) => Ok(path),
            other => Err(unexpected(other)),
        }
    }

    async fn children_and_watch(&self, path: &str) -> CoordResult<(Vec<String>, ChildWatch)> {
        let delivery = self
            .call(CoordRequest::ChildrenAndWatch {
                path: path.to_string(),
            })
            .await?;
        match (delivery.reply, delivery.watch) {
            (CoordReply::Children { children, .. }, Some(watch)) => Ok((children, watch)),
            (other, _) => Err(unexpected(other)),
        }
    }

    async fn read_data(&self, path: &str) -> CoordResult<Vec<u8>> {
        match self
            .call(CoordRequest::ReadData {
                path: path.to_string(),
            })
            .await?
            .reply
        {
            CoordReply::Data(data) => Ok(data),
            other => Err(unexpected(other)),
        }
    }

    async fn close(&self) -> CoordResult<()> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        let result = self.call(CoordRequest::Close).await.map(|_| ());
        self.shared.shut_down();
        result
    }
}

fn unexpected(reply: CoordReply) -> CoordError {
    CoordError::Codec(format!("unexpected coordination reply: {:?}", reply))
}
