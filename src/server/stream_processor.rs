use std::sync::Arc;
use anyhow::bail;
use tokio::io::{AsyncRead, AsyncWrite};
use crate::config::RpcConfig;
use crate::connection::ConnectionCore;
use crate::dispatch::interface::RpcInterface;
use crate::events::StopSignal;
use crate::packet::Packet;
use crate::packet_stream::PacketStreamHandle;
use crate::queue::QueueReceiver;
use crate::server::request_processor::RequestProcessor;

/// The server side of a single connection. The peer chooses request ids: a packet that starts a
///  message starts a new request processor (its request id must not be in use), and all other
///  packets must belong to an active request. Any violation closes the connection.
pub struct ServerStreamProcessor {
    core: Arc<ConnectionCore>,
    writer_rx: QueueReceiver<Option<Packet>>,
    interface: Arc<RpcInterface>,
}

impl ServerStreamProcessor {
    pub fn new(interface: Arc<RpcInterface>, config: Arc<RpcConfig>) -> ServerStreamProcessor {
        let (core, writer_rx) = ConnectionCore::new(config);
        ServerStreamProcessor {
            core,
            writer_rx,
            interface,
        }
    }

    pub fn stop_signal(&self) -> StopSignal {
        self.core.stop_signal().clone()
    }

    pub fn core(&self) -> &Arc<ConnectionCore> {
        &self.core
    }

    /// Serves requests on the connection until it is closed or stopped, and returns after all
    ///  of its requests are finished
    pub async fn run<S: AsyncRead + AsyncWrite + Send + 'static>(self, socket: S) {
        let ServerStreamProcessor { core, writer_rx, interface } = self;

        let route_core = core.clone();
        core.run(socket, writer_rx, move |packet| route(&route_core, &interface, packet)).await;
    }
}

fn route(core: &Arc<ConnectionCore>, interface: &Arc<RpcInterface>, packet: &Packet) -> anyhow::Result<PacketStreamHandle> {
    let request_id = packet.request_id();
    let packet_type = packet.packet_type();

    let mut state = core.lock_state();
    let existing = state.routes.get(request_id).cloned();
    match existing {
        Some(handle) if !packet_type.starts_message() => Ok(handle),
        Some(_) => bail!("protocol violation: {:?} packet for request {} which is still active", packet_type, request_id),
        None if packet_type.starts_message() => {
            let (request, handle) = core.open_request_with_id(&mut state, request_id)?;
            drop(state);

            RequestProcessor::new(core.clone(), interface.clone(), request).start();
            Ok(handle)
        }
        None => bail!("protocol violation: {:?} packet for request {} which is not active", packet_type, request_id),
    }
}
