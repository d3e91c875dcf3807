use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use tracing::{debug, trace, warn};
use crate::config::RpcConfig;
use crate::packet::{Packet, PacketType};
use crate::packet_pool::PacketPool;
use crate::queue::{blocking_queue, QueueReceiver, QueueSender};
use crate::request_slots::RequestId;
use crate::rpc_stream::RpcStream;

/// The logical byte stream of a single request: incoming packets (routed here by the connection's
///  reader loop) are reassembled into a continuous stream of bytes, and outgoing bytes are split
///  into packets that are handed to the connection's writer queue.
///
/// A packet stream is reused for many requests over its lifetime, one at a time:
///
/// ```ascii
///  attach(id) -> initialize() / initialize_outgoing() -> read / write / flush -> shutdown() -> detach()
/// ```
///
/// Every packet is owned by exactly one party at a time. Packets that are taken out of the pool by
///  this stream go back to the pool either through the writer loop (after they were written) or
///  through this stream (`shutdown`, `detach`, and every error path).
pub struct PacketStream {
    config: Arc<RpcConfig>,
    pool: Arc<PacketPool>,
    writer_queue: QueueSender<Option<Packet>>,
    request_id: RequestId,
    reader_queue: QueueReceiver<Packet>,
    disconnected: Arc<AtomicBool>,
    current_read_packet: Option<Packet>,
    current_write_packet: Option<Packet>,
}

impl PacketStream {
    pub fn new(config: Arc<RpcConfig>, pool: Arc<PacketPool>, writer_queue: QueueSender<Option<Packet>>) -> PacketStream {
        // placeholder, replaced when the stream is attached to a request
        let (_, reader_queue) = blocking_queue(1);

        PacketStream {
            config,
            pool,
            writer_queue,
            request_id: RequestId::default(),
            reader_queue,
            disconnected: Default::default(),
            current_read_packet: None,
            current_write_packet: None,
        }
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Binds the stream to a request id, returning the handle through which the connection
    ///  routes packets to this stream and disconnects it. Each attach creates a fresh reader
    ///  queue, so handles from a previous request can not deliver packets to this one.
    pub fn attach(&mut self, request_id: RequestId) -> PacketStreamHandle {
        debug_assert!(self.current_read_packet.is_none() && self.current_write_packet.is_none(), "attaching a stream that was not shut down");
        self.clear_reader_queue();

        let (reader_tx, reader_rx) = blocking_queue(self.config.reader_queue_size);
        self.request_id = request_id;
        self.reader_queue = reader_rx;
        self.disconnected = Default::default();

        PacketStreamHandle {
            request_id,
            reader_queue: reader_tx,
            disconnected: self.disconnected.clone(),
            pool: self.pool.clone(),
        }
    }

    /// Server side: waits for the first packet of the incoming request, which must start a
    ///  message, and prepares the response.
    pub async fn initialize(&mut self) -> anyhow::Result<()> {
        let first = self.next_packet(true).await?;
        trace!("request {}: received first packet {:?}", self.request_id, first);
        self.current_read_packet = Some(first);
        self.current_write_packet = Some(self.pool.get_from_pool(self.request_id, PacketType::Start));
        Ok(())
    }

    /// Client side: the stream starts by writing a request, the response is read lazily
    pub fn initialize_outgoing(&mut self) {
        debug_assert!(self.current_write_packet.is_none());
        self.current_write_packet = Some(self.pool.get_from_pool(self.request_id, PacketType::Start));
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }

    /// `true` if the last packet of the incoming message was reached. Its payload may not be
    ///  fully consumed yet.
    pub fn is_incoming_message_complete(&self) -> bool {
        self.current_read_packet.as_ref()
            .map(|p| p.packet_type().ends_message())
            .unwrap_or(false)
    }

    async fn next_packet(&mut self, starts_message: bool) -> anyhow::Result<Packet> {
        let packet = self.reader_queue.get_with_timeout(self.config.read_timeout).await
            .with_context(|| format!("request {}: no packet received", self.request_id))?;

        if self.is_disconnected() {
            self.pool.return_to_pool(packet);
            bail!("request {} was disconnected", self.request_id);
        }

        if packet.packet_type().starts_message() != starts_message {
            let packet_type = packet.packet_type();
            self.pool.return_to_pool(packet);
            bail!("request {}: framing error - unexpected packet type {:?}", self.request_id, packet_type);
        }

        Ok(packet)
    }

    pub async fn read(&mut self, buf: &mut [u8]) -> anyhow::Result<()> {
        let mut offs = 0;
        while offs < buf.len() {
            if let Some(packet) = self.current_read_packet.as_mut() {
                offs += packet.read_data(&mut buf[offs..]);
                if offs == buf.len() {
                    break;
                }

                if packet.packet_type().ends_message() {
                    bail!("request {}: message ended after {} of {} bytes", self.request_id, offs, buf.len());
                }

                let next = self.next_packet(false).await?;
                if let Some(prev) = self.current_read_packet.replace(next) {
                    self.pool.return_to_pool(prev);
                }
            }
            else {
                let first = self.next_packet(true).await?;
                self.current_read_packet = Some(first);
            }
        }
        Ok(())
    }

    pub async fn write(&mut self, buf: &[u8]) -> anyhow::Result<()> {
        let mut packet = self.current_write_packet.take()
            .ok_or_else(|| anyhow!("request {}: writing to a stream that was not initialized", self.request_id))?;

        if packet.packet_type() == PacketType::End {
            self.current_write_packet = Some(packet);
            bail!("request {}: writing after the end of the message", self.request_id);
        }

        let mut offs = 0;
        loop {
            offs += packet.write_data(&buf[offs..]);
            if offs == buf.len() {
                self.current_write_packet = Some(packet);
                return Ok(());
            }

            // the packet is full
            if let Err(e) = self.enqueue(packet).await {
                self.current_write_packet = Some(self.pool.get_from_pool(self.request_id, PacketType::End));
                return Err(e);
            }
            packet = self.pool.get_from_pool(self.request_id, PacketType::Middle);
        }
    }

    pub async fn flush(&mut self) -> anyhow::Result<()> {
        let mut packet = self.current_write_packet.take()
            .ok_or_else(|| anyhow!("request {}: flushing a stream that was not initialized", self.request_id))?;

        match packet.packet_type() {
            PacketType::Start => packet.set_packet_type(PacketType::Single),
            PacketType::Middle => packet.set_packet_type(PacketType::End),
            PacketType::End | PacketType::Single => {
                self.current_write_packet = Some(packet);
                bail!("request {}: the message was already terminated", self.request_id);
            }
        }

        let result = self.enqueue(packet).await;
        self.current_write_packet = Some(self.pool.get_from_pool(self.request_id, PacketType::End));
        result
    }

    async fn enqueue(&self, packet: Packet) -> anyhow::Result<()> {
        trace!("request {}: enqueueing {:?}", self.request_id, packet);
        match self.writer_queue.put_with_timeout(Some(packet), self.config.write_timeout).await {
            Ok(()) => Ok(()),
            Err(rejected) => {
                if let Some(packet) = rejected {
                    self.pool.return_to_pool(packet);
                }
                bail!("request {}: timed out handing a packet to the writer", self.request_id)
            }
        }
    }

    /// Terminates an unfinished outgoing message, and releases the packets this stream holds.
    ///  This must be called exactly once after initialization.
    pub async fn shutdown(&mut self) -> anyhow::Result<()> {
        let unterminated = matches!(
            self.current_write_packet.as_ref().map(|p| p.packet_type()),
            Some(PacketType::Start | PacketType::Middle));

        let result = if unterminated {
            debug!("request {}: flushing unterminated message on shutdown", self.request_id);
            self.flush().await
        }
        else {
            Ok(())
        };

        self.release_packets();
        result
    }

    /// Releases the packets this stream holds without terminating an unfinished outgoing
    ///  message. This is the shutdown for a request that failed.
    pub fn release_packets(&mut self) {
        if let Some(packet) = self.current_write_packet.take() {
            self.pool.return_to_pool(packet);
        }
        if let Some(packet) = self.current_read_packet.take() {
            self.pool.return_to_pool(packet);
        }
    }

    /// Releases all packets that are still queued for this stream, without waiting
    pub fn clear_reader_queue(&mut self) {
        let mut num_cleared = 0;
        while let Some(packet) = self.reader_queue.try_get() {
            self.pool.return_to_pool(packet);
            num_cleared += 1;
        }
        if num_cleared > 0 {
            debug!("request {}: discarded {} queued packets", self.request_id, num_cleared);
        }
    }

    /// Unbinds the stream from its request after shutdown, preparing it for reuse
    pub fn detach(&mut self) {
        debug_assert!(self.current_read_packet.is_none() && self.current_write_packet.is_none(), "detaching a stream that was not shut down");
        self.clear_reader_queue();

        let (_, reader_queue) = blocking_queue(1);
        self.reader_queue = reader_queue;
    }
}

#[async_trait]
impl RpcStream for PacketStream {
    async fn read(&mut self, buf: &mut [u8]) -> anyhow::Result<()> {
        PacketStream::read(self, buf).await
    }

    async fn write(&mut self, buf: &[u8]) -> anyhow::Result<()> {
        PacketStream::write(self, buf).await
    }

    async fn flush(&mut self) -> anyhow::Result<()> {
        PacketStream::flush(self).await
    }
}

impl Drop for PacketStream {
    fn drop(&mut self) {
        if self.current_read_packet.is_some() || self.current_write_packet.is_some() {
            warn!("request {}: packet stream dropped without shutdown", self.request_id);
        }
    }
}

/// The part of a [PacketStream] that other tasks use: the connection's reader loop routes
///  incoming packets through it, and shutdown disconnects the stream through it.
#[derive(Clone)]
pub struct PacketStreamHandle {
    request_id: RequestId,
    reader_queue: QueueSender<Packet>,
    disconnected: Arc<AtomicBool>,
    pool: Arc<PacketPool>,
}

impl PacketStreamHandle {
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Hands an incoming packet to the stream. If the stream does not accept it within the
    ///  timeout, the packet is handed back.
    pub async fn push_packet(&self, packet: Packet, timeout: Duration) -> Result<(), Packet> {
        self.reader_queue.put_with_timeout(packet, timeout).await
    }

    /// Marks the stream as disconnected and wakes up a task that is waiting for the next
    ///  packet. The owning task notices on its next read and fails it.
    pub fn disconnect(&self) {
        if self.disconnected.swap(true, Ordering::AcqRel) {
            return;
        }

        let wakeup = self.pool.get_from_pool(self.request_id, PacketType::End);
        if let Err(wakeup) = self.reader_queue.try_put(wakeup) {
            // the stream has unread packets, so it is not waiting
            trace!("request {}: reader queue is full, no wakeup packet", self.request_id);
            self.pool.return_to_pool(wakeup);
        }
    }
}
