//! Client for a remote table server
//!
//! `RemoteTable` is the handle one chain node holds on its successor,
//! and the handle the chain client holds on the head and tail. Calls are
//! strictly request/response over one TCP stream. Any transport failure
//! drops the stream; the next call reconnects.

use crate::config::NetworkSettings;
use crate::error::{ClientError, ClientResult};
use crate::kv::Entry;
use crate::protocol::{read_frame, write_frame, ErrorCode, Request, Response};
use crate::stats::StatsSnapshot;
use std::io;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info};

pub struct RemoteTable {
    address: String,
    network: NetworkSettings,
    stream: Option<TcpStream>,
}

impl RemoteTable {
    /// Create a disconnected handle for `address` (`host:port`)
    pub fn new(address: impl Into<String>, network: NetworkSettings) -> ClientResult<Self> {
        let address = address.into();
        validate_address(&address)?;
        Ok(Self {
            address,
            network,
            stream: None,
        })
    }

    /// Create a handle and connect it
    pub async fn connect_to(
        address: impl Into<String>,
        network: NetworkSettings,
    ) -> ClientResult<Self> {
        let mut table = Self::new(address, network)?;
        table.connect().await?;
        Ok(table)
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    pub async fn connect(&mut self) -> ClientResult<()> {
        if self.stream.is_some() {
            return Ok(());
        }

        let stream = timeout(
            self.network.connect_timeout(),
            TcpStream::connect(&self.address),
        )
        .await
        .map_err(|_| ClientError::Timeout)??;
        stream.set_nodelay(true)?;

        info!("Connected to table server at {}", self.address);
        self.stream = Some(stream);
        Ok(())
    }

    /// Close the connection. Safe to call on a closed handle.
    pub fn disconnect(&mut self) {
        if self.stream.take().is_some() {
            info!("Disconnected from table server at {}", self.address);
        }
    }

    pub async fn put(&mut self, key: &str, value: &[u8]) -> ClientResult<()> {
        let request = Request::Put {
            key: key.to_string(),
            value: value.to_vec(),
        };
        match self.call(request).await? {
            Response::Done => Ok(()),
            _ => Err(ClientError::UnexpectedResponse("PUT")),
        }
    }

    /// `Ok(None)` when the key is absent on the remote table
    pub async fn get(&mut self, key: &str) -> ClientResult<Option<Vec<u8>>> {
        let request = Request::Get {
            key: key.to_string(),
        };
        match self.call(request).await {
            Ok(Response::Value(value)) => Ok(Some(value)),
            Ok(_) => Err(ClientError::UnexpectedResponse("GET")),
            Err(ClientError::Remote {
                code: ErrorCode::NotFound,
                ..
            }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn del(&mut self, key: &str) -> ClientResult<()> {
        let request = Request::Del {
            key: key.to_string(),
        };
        match self.call(request).await? {
            Response::Done => Ok(()),
            _ => Err(ClientError::UnexpectedResponse("DEL")),
        }
    }

    pub async fn size(&mut self) -> ClientResult<usize> {
        match self.call(Request::Size).await? {
            Response::Size(size) => Ok(size),
            _ => Err(ClientError::UnexpectedResponse("SIZE")),
        }
    }

    pub async fn keys(&mut self) -> ClientResult<Vec<String>> {
        match self.call(Request::GetKeys).await? {
            Response::Keys(keys) => Ok(keys),
            _ => Err(ClientError::UnexpectedResponse("GETKEYS")),
        }
    }

    pub async fn get_table(&mut self) -> ClientResult<Vec<Entry>> {
        match self.call(Request::GetTable).await? {
            Response::Table(entries) => Ok(entries),
            _ => Err(ClientError::UnexpectedResponse("GETTABLE")),
        }
    }

    pub async fn stats(&mut self) -> ClientResult<StatsSnapshot> {
        match self.call(Request::Stats).await? {
            Response::Stats(stats) => Ok(stats),
            _ => Err(ClientError::UnexpectedResponse("STATS")),
        }
    }

    async fn call(&mut self, request: Request) -> ClientResult<Response> {
        self.connect().await?;

        let op = request.opcode();
        let max_frame_bytes = self.network.max_frame_bytes;
        // Out of `self` until the reply is read, so a call dropped halfway
        // leaves the handle disconnected rather than out of step
        let mut stream = self.stream.take().ok_or(ClientError::NotConnected)?;

        let exchange = async {
            write_frame(&mut stream, &request).await?;
            read_frame::<_, Response>(&mut stream, max_frame_bytes)
                .await?
                .ok_or_else(|| {
                    ClientError::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "server closed the connection",
                    ))
                })
        };

        let response = match timeout(self.network.request_timeout(), exchange).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                debug!("{} to {} failed: {}", op.name(), self.address, e);
                return Err(e);
            }
            Err(_) => {
                debug!("{} to {} timed out", op.name(), self.address);
                return Err(ClientError::Timeout);
            }
        };
        self.stream = Some(stream);

        match response {
            Response::Error { code, message, .. } => Err(ClientError::Remote { code, message }),
            response => Ok(response),
        }
    }
}

impl Drop for RemoteTable {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl std::fmt::Debug for RemoteTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteTable")
            .field("address", &self.address)
            .field("connected", &self.is_connected())
            .finish()
    }
}

fn validate_address(address: &str) -> ClientResult<()> {
    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| ClientError::InvalidAddress(address.to_string()))?;
    if host.is_empty() || port.parse::<u16>().is_err() {
        return Err(ClientError::InvalidAddress(address.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{OpCode, DEFAULT_MAX_FRAME_BYTES};
    use std::time::Duration;
    use tokio::net::TcpListener;

    fn fast_network() -> NetworkSettings {
        NetworkSettings {
            connect_timeout_ms: 500,
            request_timeout_ms: 200,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }

    /// Answer every request on one connection with `reply`
    async fn canned_server(reply: Response) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            while let Ok(Some(_request)) =
                read_frame::<_, Request>(&mut stream, DEFAULT_MAX_FRAME_BYTES).await
            {
                write_frame(&mut stream, &reply).await.unwrap();
            }
        });
        addr
    }

    #[test]
    fn test_address_validation() {
        assert!(RemoteTable::new("127.0.0.1:5000", NetworkSettings::default()).is_ok());
        assert!(RemoteTable::new("localhost:1", NetworkSettings::default()).is_ok());
        assert!(matches!(
            RemoteTable::new("no-port", NetworkSettings::default()),
            Err(ClientError::InvalidAddress(_))
        ));
        assert!(RemoteTable::new(":5000", NetworkSettings::default()).is_err());
        assert!(RemoteTable::new("host:99999", NetworkSettings::default()).is_err());
    }

    #[test]
    fn test_new_starts_disconnected() {
        let mut table = RemoteTable::new("127.0.0.1:5000", NetworkSettings::default()).unwrap();
        assert!(!table.is_connected());
        table.disconnect();
        table.disconnect();
        assert!(!table.is_connected());
    }

    #[tokio::test]
    async fn test_get_not_found_is_none() {
        let addr = canned_server(Response::error(OpCode::Get, ErrorCode::NotFound, "missing")).await;
        let mut table = RemoteTable::connect_to(addr, fast_network()).await.unwrap();

        assert_eq!(table.get("k").await.unwrap(), None);
        assert!(table.is_connected());
    }

    #[tokio::test]
    async fn test_remote_error_surfaces() {
        let addr = canned_server(Response::error(OpCode::Del, ErrorCode::NotFound, "missing")).await;
        let mut table = RemoteTable::connect_to(addr, fast_network()).await.unwrap();

        let err = table.del("k").await.unwrap_err();
        assert!(matches!(
            err,
            ClientError::Remote {
                code: ErrorCode::NotFound,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_mismatched_response_rejected() {
        let addr = canned_server(Response::Size(3)).await;
        let mut table = RemoteTable::connect_to(addr, fast_network()).await.unwrap();

        assert!(matches!(
            table.put("k", b"v").await,
            Err(ClientError::UnexpectedResponse("PUT"))
        ));
        assert_eq!(table.size().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_timeout_drops_stream() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let mut table = RemoteTable::connect_to(addr, fast_network()).await.unwrap();
        assert!(matches!(table.size().await, Err(ClientError::Timeout)));
        assert!(!table.is_connected());
    }

    #[tokio::test]
    async fn test_abandoned_call_does_not_desync() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    while let Ok(Some(request)) =
                        read_frame::<_, Request>(&mut stream, DEFAULT_MAX_FRAME_BYTES).await
                    {
                        let reply = match request {
                            Request::Size => {
                                tokio::time::sleep(Duration::from_millis(100)).await;
                                Response::Size(42)
                            }
                            _ => Response::Value(b"v".to_vec()),
                        };
                        if write_frame(&mut stream, &reply).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });

        let mut table = RemoteTable::connect_to(addr, fast_network()).await.unwrap();
        assert!(timeout(Duration::from_millis(20), table.size()).await.is_err());
        assert!(!table.is_connected());

        // The late SIZE reply must not be read as the answer to GET
        assert_eq!(table.get("k").await.unwrap(), Some(b"v".to_vec()));
        assert!(table.is_connected());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let mut table = RemoteTable::new(addr, fast_network()).unwrap();
        assert!(table.connect().await.is_err());
        assert!(!table.is_connected());
    }
}
