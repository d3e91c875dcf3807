use std::sync::Arc;
use tracing::{span, trace, Instrument, Level};
use crate::connection::{ActiveRequest, ConnectionCore};
use crate::dispatch::data::RpcData;
use crate::dispatch::interface::RpcInterface;

/// Processes a single incoming request on its own task: it reads the request from its packet
///  stream, invokes the method's handler, and writes the response.
///
/// The processor is started by the connection's reader loop when the first packet of a request
///  arrives, and that packet is already queued for it. Any failure takes down the connection.
pub struct RequestProcessor {
    core: Arc<ConnectionCore>,
    interface: Arc<RpcInterface>,
    request: ActiveRequest,
}

impl RequestProcessor {
    pub fn new(core: Arc<ConnectionCore>, interface: Arc<RpcInterface>, request: ActiveRequest) -> RequestProcessor {
        RequestProcessor {
            core,
            interface,
            request,
        }
    }

    /// Spawns the processing task. Its completion is tracked by the connection through the
    ///  active request, so the join handle is not needed.
    pub fn start(self) {
        let span = span!(Level::DEBUG, "request", request_id = %self.request.request_id());
        tokio::spawn(self.run().instrument(span));
    }

    async fn run(mut self) {
        let request_id = self.request.request_id();

        match self.process().await {
            Ok(()) => {
                if let Err(e) = self.request.finish(&self.core).await {
                    self.core.notify_error(request_id, &e);
                }
            }
            Err(e) => {
                self.core.notify_error(request_id, &e);
                self.request.abort(&self.core);
            }
        }
    }

    async fn process(&mut self) -> anyhow::Result<()> {
        self.request.stream.initialize().await?;

        let mut data = RpcData::read_request(&self.interface, &mut self.request.stream).await?;
        if self.request.stream.is_incoming_message_complete() {
            self.request.release_request_id(&self.core);
        }

        trace!("invoking {}", data.method().name());
        data.invoke().await?;
        data.write_response(&mut self.request.stream).await
    }
}
