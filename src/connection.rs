use std::io::ErrorKind;
use std::sync::{Arc, Mutex, MutexGuard};
use anyhow::bail;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn, Instrument, Span};
use crate::config::RpcConfig;
use crate::events::{ReleaseCounter, ReleaseGuard, StopSignal};
use crate::packet::{Packet, PacketType};
use crate::packet_pool::PacketPool;
use crate::packet_stream::{PacketStream, PacketStreamHandle};
use crate::queue::{blocking_queue, QueueReceiver, QueueSender};
use crate::request_slots::{RequestId, RequestSlots, MAX_REQUEST_IDS};
use crate::stream_pool::{StreamKey, StreamPool};
use crate::stream_writer::run_writer_loop;

/// Routing state of a connection, guarded by a single lock
pub struct ConnectionState {
    /// streams of the requests that currently own a request id
    pub routes: RequestSlots<PacketStreamHandle>,
    pub streams: StreamPool,
}

/// The part of a connection that is shared by the server and client stream processors: the
///  reader loop that demultiplexes incoming packets, the writer loop that multiplexes outgoing
///  packets, the routing table from request ids to packet streams, and the shutdown sequence.
///
/// ```ascii
/// socket --> reader loop --(route by request id)--> packet stream --> request task
/// socket <-- writer loop <--(one shared queue)----- packet stream <-- request task
/// ```
///
/// The side specific part is how incoming packets are routed: the server starts a new request
///  processor for a packet that starts a message, while the client requires every packet to
///  belong to a request it sent.
pub struct ConnectionCore {
    config: Arc<RpcConfig>,
    pool: Arc<PacketPool>,
    writer_queue: QueueSender<Option<Packet>>,
    stop: StopSignal,
    active_requests: ReleaseCounter,
    state: Mutex<ConnectionState>,
}

impl ConnectionCore {
    pub fn new(config: Arc<RpcConfig>) -> (Arc<ConnectionCore>, QueueReceiver<Option<Packet>>) {
        let (writer_queue, writer_rx) = blocking_queue(config.writer_queue_size);

        let core = ConnectionCore {
            pool: Arc::new(PacketPool::new(config.packet_pool_size)),
            writer_queue,
            stop: StopSignal::new(),
            active_requests: ReleaseCounter::new(),
            state: Mutex::new(ConnectionState {
                routes: RequestSlots::new(),
                streams: StreamPool::new(MAX_REQUEST_IDS),
            }),
            config,
        };
        (Arc::new(core), writer_rx)
    }

    pub fn pool(&self) -> &Arc<PacketPool> {
        &self.pool
    }

    pub fn stop_signal(&self) -> &StopSignal {
        &self.stop
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_stopped()
    }

    /// Stops the connection asynchronously; this does not wait for the shutdown to complete
    pub fn stop(&self) {
        self.stop.stop();
    }

    pub fn num_active_requests(&self) -> usize {
        self.active_requests.count()
    }

    pub fn lock_state(&self) -> MutexGuard<'_, ConnectionState> {
        self.state.lock().unwrap()
    }

    /// A failed request takes down the whole connection
    pub fn notify_error(&self, request_id: RequestId, e: &anyhow::Error) {
        if self.is_stopped() {
            debug!("request {} failed on a stopped connection: {:#}", request_id, e);
        }
        else {
            warn!("request {} failed, closing connection: {:#}", request_id, e);
            self.stop();
        }
    }

    fn bind_stream(&self, state: &mut ConnectionState, mut stream: PacketStream, request_id: RequestId) -> (ActiveRequest, PacketStreamHandle) {
        let handle = stream.attach(request_id);
        let key = state.streams.register_active(handle.clone());
        let request = ActiveRequest {
            stream,
            key,
            request_id,
            owns_request_id: true,
            _guard: self.active_requests.acquire(),
        };
        (request, handle)
    }

    fn new_stream(&self) -> PacketStream {
        PacketStream::new(self.config.clone(), self.pool.clone(), self.writer_queue.clone())
    }

    /// Occupies a given request id with a new request. This is for the server side, where the peer
    ///  chooses request ids.
    pub fn open_request_with_id(&self, state: &mut ConnectionState, request_id: RequestId) -> anyhow::Result<(ActiveRequest, PacketStreamHandle)> {
        if self.is_stopped() {
            bail!("connection is stopped");
        }
        if state.routes.contains(request_id) {
            bail!("request {} is already active", request_id);
        }

        let stream = state.streams.acquire(|| self.new_stream());
        let (request, handle) = self.bind_stream(state, stream, request_id);
        if state.routes.insert(request_id, handle.clone()).is_err() {
            unreachable!("request id was checked to be free");
        }
        trace!("opened request {}", request_id);
        Ok((request, handle))
    }

    /// Occupies the next free request id with a new request. This is for the client side.
    pub fn open_request(&self) -> anyhow::Result<ActiveRequest> {
        let mut state = self.lock_state();
        if self.is_stopped() {
            bail!("connection is stopped");
        }
        if state.routes.len() >= MAX_REQUEST_IDS {
            bail!("all {} request ids are in use", MAX_REQUEST_IDS);
        }

        let mut stream = state.streams.acquire(|| self.new_stream());
        let mut bound = None;
        let request_id = state.routes.allocate_with(|request_id| {
            let handle = stream.attach(request_id);
            bound = Some(handle.clone());
            handle
        });
        let (Some(request_id), Some(handle)) = (request_id, bound) else {
            unreachable!("request ids were checked to be available");
        };

        let key = state.streams.register_active(handle);
        trace!("opened request {}", request_id);
        Ok(ActiveRequest {
            stream,
            key,
            request_id,
            owns_request_id: true,
            _guard: self.active_requests.acquire(),
        })
    }

    /// Runs the connection until the socket fails or the connection is stopped, and then shuts it
    ///  down: all active requests are disconnected, and this waits until all of them released
    ///  their packet streams before it stops the writer loop.
    pub async fn run<S, F>(&self, socket: S, writer_rx: QueueReceiver<Option<Packet>>, route: F)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
        F: FnMut(&Packet) -> anyhow::Result<PacketStreamHandle> + Send,
    {
        let (reader, writer) = tokio::io::split(socket);
        let writer_task = tokio::spawn(
            run_writer_loop(writer, writer_rx, self.pool.clone(), self.stop.clone(), self.config.write_timeout)
                .instrument(Span::current()));

        self.read_packets(reader, route).await;
        self.shutdown(writer_task).await;
    }

    async fn read_packets<R, F>(&self, reader: R, mut route: F)
    where
        R: AsyncRead + Unpin,
        F: FnMut(&Packet) -> anyhow::Result<PacketStreamHandle>,
    {
        let mut reader = BufReader::new(reader);
        loop {
            let mut packet = self.pool.get_from_pool(RequestId::default(), PacketType::Single);
            let received = tokio::select! {
                result = packet.read_from_stream(&mut reader) => Some(result),
                _ = self.stop.stopped() => None,
            };

            match received {
                None => {
                    self.pool.return_to_pool(packet);
                    debug!("connection was stopped");
                    break;
                }
                Some(Err(e)) => {
                    self.pool.return_to_pool(packet);
                    let closed_by_peer = e.downcast_ref::<std::io::Error>()
                        .map(|e| e.kind() == ErrorKind::UnexpectedEof)
                        .unwrap_or(false);
                    if closed_by_peer {
                        debug!("connection closed by peer");
                    }
                    else {
                        warn!("error reading packet, closing connection: {:#}", e);
                    }
                    break;
                }
                Some(Ok(())) => {}
            }

            trace!("received {:?}", packet);
            if let Err(e) = self.dispatch(packet, &mut route).await {
                warn!("closing connection: {:#}", e);
                break;
            }
        }

        self.stop();
    }

    async fn dispatch<F>(&self, packet: Packet, route: &mut F) -> anyhow::Result<()>
    where F: FnMut(&Packet) -> anyhow::Result<PacketStreamHandle>
    {
        let handle = match route(&packet) {
            Ok(handle) => handle,
            Err(e) => {
                self.pool.return_to_pool(packet);
                return Err(e);
            }
        };

        // NB: the reader loop waits here while the request's queue is full, so a slow request
        //  holds up all other requests on this connection for up to the write timeout
        if let Err(packet) = handle.push_packet(packet, self.config.write_timeout).await {
            let request_id = packet.request_id();
            self.pool.return_to_pool(packet);
            bail!("request {} did not accept an incoming packet in time", request_id);
        }
        Ok(())
    }

    async fn shutdown(&self, writer_task: JoinHandle<()>) {
        self.stop();

        {
            let state = self.lock_state();
            debug!("shutting down connection with {} active requests", state.streams.num_active());
            state.streams.disconnect_all();
        }
        self.active_requests.wait_all_released().await;
        debug_assert!(self.lock_state().routes.is_empty());

        if self.writer_queue.put(None).await.is_err() {
            debug!("writer loop terminated already");
        }
        if let Err(e) = writer_task.await {
            error!("writer task failed: {}", e);
        }

        debug!("connection shut down");
    }
}

/// A request that currently owns a packet stream of a connection, and (usually) a request id.
///  It counts as active until it is finished, and the connection's shutdown waits for that.
pub struct ActiveRequest {
    pub stream: PacketStream,
    key: StreamKey,
    request_id: RequestId,
    owns_request_id: bool,
    _guard: ReleaseGuard,
}

impl ActiveRequest {
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Frees the request id for reuse before the request is finished. This is for the server
    ///  side, as soon as a request was read completely: the peer may reuse the id once it
    ///  received the response.
    pub fn release_request_id(&mut self, core: &ConnectionCore) {
        if self.owns_request_id {
            let removed = core.lock_state().routes.remove(self.request_id);
            debug_assert!(removed.is_some());
            self.owns_request_id = false;
            trace!("released request id {}", self.request_id);
        }
    }

    /// Shuts down the packet stream, discards packets that are still queued for it, and gives
    ///  it back to the connection
    pub async fn finish(mut self, core: &ConnectionCore) -> anyhow::Result<()> {
        let result = self.stream.shutdown().await;
        self.release(core);
        result
    }

    /// Gives the packet stream back after the request failed. Nothing more is written for the
    ///  request, not even the end of a message that was started.
    pub fn abort(mut self, core: &ConnectionCore) {
        self.stream.release_packets();
        self.release(core);
    }

    fn release(mut self, core: &ConnectionCore) {
        self.stream.clear_reader_queue();

        let mut state = core.lock_state();
        if self.owns_request_id {
            state.routes.remove(self.request_id);
        }
        state.streams.release(self.key, self.stream);
        trace!("released request {}", self.request_id);
    }
}
