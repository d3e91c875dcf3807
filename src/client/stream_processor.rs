use std::sync::Arc;
use anyhow::anyhow;
use tokio::io::{AsyncRead, AsyncWrite};
use crate::client::request_stream::RequestStream;
use crate::config::RpcConfig;
use crate::connection::ConnectionCore;
use crate::packet::Packet;
use crate::packet_stream::PacketStreamHandle;
use crate::queue::QueueReceiver;

/// The client side of a single connection. The client chooses request ids, so every incoming
///  packet must belong to a request that is currently active. Anything else closes the
///  connection.
pub struct ClientStreamProcessor {
    core: Arc<ConnectionCore>,
    writer_rx: QueueReceiver<Option<Packet>>,
}

/// The part of a client connection that is used to start calls while the connection is running
#[derive(Clone)]
pub struct ClientConnection {
    core: Arc<ConnectionCore>,
}

impl ClientStreamProcessor {
    pub fn new(config: Arc<RpcConfig>) -> ClientStreamProcessor {
        let (core, writer_rx) = ConnectionCore::new(config);
        ClientStreamProcessor {
            core,
            writer_rx,
        }
    }

    pub fn connection(&self) -> ClientConnection {
        ClientConnection {
            core: self.core.clone(),
        }
    }

    /// Runs the connection until it is closed or stopped, and returns after all calls on it are
    ///  finished
    pub async fn run<S: AsyncRead + AsyncWrite + Send + 'static>(self, socket: S) {
        let ClientStreamProcessor { core, writer_rx } = self;

        let route_core = core.clone();
        core.run(socket, writer_rx, move |packet| route(&route_core, packet)).await;
    }
}

fn route(core: &ConnectionCore, packet: &Packet) -> anyhow::Result<PacketStreamHandle> {
    core.lock_state().routes.get(packet.request_id())
        .cloned()
        .ok_or_else(|| anyhow!("protocol violation: {:?} packet for request {} which is not active", packet.packet_type(), packet.request_id()))
}

impl ClientConnection {
    /// Allocates a request id for a new call. This fails if the connection is stopped.
    pub fn open_request(&self) -> anyhow::Result<RequestStream> {
        let request = self.core.open_request()?;
        Ok(RequestStream::new(self.core.clone(), request))
    }

    pub fn is_stopped(&self) -> bool {
        self.core.is_stopped()
    }

    pub fn stop(&self) {
        self.core.stop();
    }

    pub fn num_active_requests(&self) -> usize {
        self.core.num_active_requests()
    }

    pub fn num_outstanding_packets(&self) -> usize {
        self.core.pool().outstanding()
    }
}
