use std::net::SocketAddr;
use anyhow::Context;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// A bidirectional byte stream that a client connection can run on
pub trait RpcIo: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> RpcIo for T {}

/// Establishes connections for a client. The client calls this again whenever a connection
///  is lost, so an implementation should create a fresh connection on every call.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StreamConnector: Send + Sync + 'static {
    async fn connect(&self) -> anyhow::Result<Box<dyn RpcIo>>;
}

pub struct TcpConnector {
    addr: SocketAddr,
}

impl TcpConnector {
    pub fn new(addr: SocketAddr) -> TcpConnector {
        TcpConnector { addr }
    }
}

#[async_trait]
impl StreamConnector for TcpConnector {
    async fn connect(&self) -> anyhow::Result<Box<dyn RpcIo>> {
        debug!("connecting to {}", self.addr);
        let stream = TcpStream::connect(self.addr).await
            .with_context(|| format!("failed to connect to {}", self.addr))?;

        if let Err(e) = stream.set_nodelay(true) {
            warn!("failed to set TCP_NODELAY for connection to {}: {}", self.addr, e);
        }
        Ok(Box::new(stream))
    }
}
