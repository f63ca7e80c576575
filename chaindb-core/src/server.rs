//! TCP table server
//!
//! One task per accepted connection, serving requests in a plain
//! read/dispatch/write loop until the client hangs up. The number of
//! concurrent connections is capped by a semaphore; connections over the
//! cap are closed immediately.

use crate::dispatch::Dispatcher;
use crate::error::ClientResult;
use crate::protocol::{read_frame, write_frame, Request, DEFAULT_MAX_FRAME_BYTES};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

const DEFAULT_MAX_CONNECTIONS: usize = 1024;

pub struct TableServer {
    listener: TcpListener,
    dispatcher: Dispatcher,
    connection_semaphore: Arc<Semaphore>,
    max_frame_bytes: usize,
}

impl TableServer {
    pub async fn bind(addr: impl ToSocketAddrs, dispatcher: Dispatcher) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!("Table server bound to {}", listener.local_addr()?);

        Ok(Self {
            listener,
            dispatcher,
            connection_semaphore: Arc::new(Semaphore::new(DEFAULT_MAX_CONNECTIONS)),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        })
    }

    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.connection_semaphore = Arc::new(Semaphore::new(max_connections));
        self
    }

    pub fn with_max_frame_bytes(mut self, max_frame_bytes: usize) -> Self {
        self.max_frame_bytes = max_frame_bytes;
        self
    }

    /// Actual bound address (useful when binding port 0)
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn serve(self) {
        self.serve_until(std::future::pending()).await
    }

    /// Accept connections until `shutdown` completes.
    ///
    /// Connections already being served keep running on their own tasks.
    pub async fn serve_until(self, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Table server shutting down");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => self.spawn_connection(stream, peer),
                    Err(e) => error!("Failed to accept connection: {}", e),
                },
            }
        }
    }

    fn spawn_connection(&self, stream: TcpStream, peer: SocketAddr) {
        let permit = match self.connection_semaphore.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                warn!("Connection limit reached, rejecting connection from {}", peer);
                return;
            }
        };

        let dispatcher = self.dispatcher.clone();
        let max_frame_bytes = self.max_frame_bytes;
        tokio::spawn(async move {
            if let Err(e) = handle_connection(&dispatcher, stream, peer, max_frame_bytes).await {
                warn!("Connection error from {}: {}", peer, e);
            }
            drop(permit);
        });
    }
}

async fn handle_connection(
    dispatcher: &Dispatcher,
    mut stream: TcpStream,
    peer: SocketAddr,
    max_frame_bytes: usize,
) -> ClientResult<()> {
    let _session = dispatcher.database().database().client_session();
    stream.set_nodelay(true)?;
    debug!("Client connected from {}", peer);

    while let Some(request) = read_frame::<_, Request>(&mut stream, max_frame_bytes).await? {
        let response = dispatcher.dispatch(request).await;
        write_frame(&mut stream, &response).await?;
    }

    debug!("Client {} disconnected", peer);
    Ok(())
}
