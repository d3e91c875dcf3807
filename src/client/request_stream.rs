use std::sync::Arc;
use crate::connection::{ActiveRequest, ConnectionCore};
use crate::dispatch::data::RpcData;
use crate::request_slots::RequestId;

/// The client side of a single call: it owns a request id and a packet stream for the duration
///  of the call, and gives them back when the call is finished (successfully or not).
pub struct RequestStream {
    core: Arc<ConnectionCore>,
    request: ActiveRequest,
}

impl RequestStream {
    pub(crate) fn new(core: Arc<ConnectionCore>, request: ActiveRequest) -> RequestStream {
        RequestStream { core, request }
    }

    pub fn request_id(&self) -> RequestId {
        self.request.request_id()
    }

    /// Sends the request, and reads the response into `data`. A failure takes down the
    ///  connection, since the state of the exchange is unknown.
    pub async fn invoke_rpc(mut self, data: &mut RpcData) -> anyhow::Result<()> {
        let request_id = self.request.request_id();

        self.request.stream.initialize_outgoing();
        if let Err(e) = data.invoke_remote_call(&mut self.request.stream).await {
            self.core.notify_error(request_id, &e);
            self.request.abort(&self.core);
            return Err(e);
        }
        self.request.finish(&self.core).await
    }
}
