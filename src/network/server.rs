//! TCP transport: a framed request/response server and client.

use super::delivery::{FailureReason, MessageDelivery, VerbHandler};
use super::rpc::{decode_message, encode_message, frame_message, Message, MAX_FRAME_SIZE};
use crate::error::{NetworkError, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

/// Read one length-prefixed frame. Returns `None` on a clean close.
async fn read_frame(stream: &mut TcpStream) -> Result<Option<Message>> {
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(NetworkError::Io(e).into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(NetworkError::MalformedFrame("message too large".to_string()).into());
    }

    let mut data = vec![0u8; len];
    stream.read_exact(&mut data).await.map_err(NetworkError::Io)?;
    decode_message(&data).map(Some)
}

/// TCP server dispatching inbound messages to a handler.
pub struct NetworkServer {
    listener: TcpListener,
    handler: Arc<dyn VerbHandler>,
    shutdown_rx: mpsc::Receiver<()>,
}

impl NetworkServer {
    /// Bind a server. Use port 0 to pick a free port.
    pub async fn bind(
        bind_addr: SocketAddr,
        handler: Arc<dyn VerbHandler>,
    ) -> Result<(Self, mpsc::Sender<()>)> {
        let listener = TcpListener::bind(bind_addr).await.map_err(NetworkError::Io)?;
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        Ok((
            Self {
                listener,
                handler,
                shutdown_rx,
            },
            shutdown_tx,
        ))
    }

    /// Address the server is listening on.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr().map_err(NetworkError::Io)?)
    }

    /// Run the server until shut down. Open connections are aborted on
    /// shutdown.
    pub async fn run(mut self) -> Result<()> {
        info!(addr = ?self.listener.local_addr().ok(), "Network server listening");
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            debug!(peer = %peer_addr, "Accepted connection");
                            let handler = self.handler.clone();
                            connections.spawn(async move {
                                if let Err(e) = Self::handle_connection(stream, handler).await {
                                    debug!(error = %e, "Connection handler error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                _ = self.shutdown_rx.recv() => {
                    info!(open = connections.len(), "Network server shutting down");
                    break;
                }
            }
        }

        connections.abort_all();
        while connections.join_next().await.is_some() {}
        Ok(())
    }

    async fn handle_connection(mut stream: TcpStream, handler: Arc<dyn VerbHandler>) -> Result<()> {
        while let Some(msg) = read_frame(&mut stream).await? {
            if let Some(response) = handler.handle(msg) {
                let framed = frame_message(&response)?;
                stream.write_all(&framed).await.map_err(NetworkError::Io)?;
            }
        }
        Ok(())
    }
}

/// Client side of the TCP transport: one connection per request.
#[derive(Debug, Default, Clone)]
pub struct TcpDelivery;

impl TcpDelivery {
    pub fn new() -> Self {
        Self
    }

    async fn exchange(to: SocketAddr, message: &Message) -> Result<Option<Message>> {
        let mut stream = TcpStream::connect(to).await.map_err(NetworkError::Io)?;
        let data = encode_message(message)?;
        stream
            .write_all(&(data.len() as u32).to_be_bytes())
            .await
            .map_err(NetworkError::Io)?;
        stream.write_all(&data).await.map_err(NetworkError::Io)?;
        read_frame(&mut stream).await
    }
}

#[async_trait::async_trait]
impl MessageDelivery for TcpDelivery {
    async fn request(&self, to: SocketAddr, message: Message) -> std::result::Result<Message, FailureReason> {
        match Self::exchange(to, &message).await {
            Ok(Some(response)) => Ok(response),
            Ok(None) => Err(FailureReason::NoHandler),
            Err(crate::error::Error::Network(NetworkError::Io(e)))
                if e.kind() == std::io::ErrorKind::ConnectionRefused =>
            {
                Err(FailureReason::Unreachable)
            }
            Err(e) => Err(FailureReason::Error(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::rpc::{Payload, Verb};

    struct EchoHandler;

    impl VerbHandler for EchoHandler {
        fn handle(&self, msg: Message) -> Option<Message> {
            Some(msg.response(msg.from, Verb::DiscoverRsp, Payload::Discover))
        }
    }

    #[tokio::test]
    async fn test_request_roundtrip() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let (server, shutdown_tx) = NetworkServer::bind(addr, Arc::new(EchoHandler)).await.unwrap();
        let server_addr = server.local_addr().unwrap();
        let handle = tokio::spawn(server.run());

        let delivery = TcpDelivery::new();
        let from: SocketAddr = "127.0.0.1:7000".parse().unwrap();
        let rsp = delivery
            .request(server_addr, Message::discover(11, from))
            .await
            .unwrap();
        assert_eq!(rsp.id, 11);
        assert_eq!(rsp.verb, Verb::DiscoverRsp);

        shutdown_tx.send(()).await.unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_closes_open_connections() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let (server, shutdown_tx) = NetworkServer::bind(addr, Arc::new(EchoHandler)).await.unwrap();
        let server_addr = server.local_addr().unwrap();
        let handle = tokio::spawn(server.run());

        // Keep one connection open after a full exchange.
        let from: SocketAddr = "127.0.0.1:7000".parse().unwrap();
        let mut stream = TcpStream::connect(server_addr).await.unwrap();
        let data = encode_message(&Message::discover(3, from)).unwrap();
        stream.write_all(&(data.len() as u32).to_be_bytes()).await.unwrap();
        stream.write_all(&data).await.unwrap();
        let rsp = read_frame(&mut stream).await.unwrap().unwrap();
        assert_eq!(rsp.id, 3);

        shutdown_tx.send(()).await.unwrap();
        handle.await.unwrap().unwrap();

        // The server side of the connection is gone: EOF or reset.
        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(std::time::Duration::from_secs(5), stream.read(&mut buf))
            .await
            .expect("connection left open after shutdown");
        assert!(matches!(read, Ok(0) | Err(_)), "{:?}", read);
    }

    #[tokio::test]
    async fn test_unreachable_peer() {
        // Bind then drop to get a port nobody listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let from: SocketAddr = "127.0.0.1:7000".parse().unwrap();
        let err = TcpDelivery::new()
            .request(addr, Message::discover(1, from))
            .await
            .unwrap_err();
        assert_eq!(err, FailureReason::Unreachable);
    }
}
