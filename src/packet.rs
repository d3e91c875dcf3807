use std::cmp::min;
use std::fmt::{Debug, Formatter};
use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use crate::request_slots::RequestId;

/// The maximum payload size of a single packet. Messages of arbitrary length are split into
///  packets of (at most) this size.
pub const MAX_PACKET_SIZE: usize = 1 << 12;

/// A packet's position in the logical message it belongs to: `Start, Middle*, End` for a message
///  that spans several packets, or `Single` for a message that fits into one packet
#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum PacketType {
    Start = 0,
    Middle = 1,
    End = 2,
    Single = 3,
}

impl PacketType {
    pub fn starts_message(self) -> bool {
        matches!(self, PacketType::Start | PacketType::Single)
    }

    pub fn ends_message(self) -> bool {
        matches!(self, PacketType::End | PacketType::Single)
    }
}

/// Packet header on the wire:
///
/// ```ascii
/// 0: request id (u8)
/// 1: type and size (u32 LE): bits 0-1 are the packet type, bits 2-31 the payload size
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PacketHeader {
    pub request_id: RequestId,
    pub packet_type: PacketType,
    pub size: usize,
}

impl PacketHeader {
    pub const SERIALIZED_LEN: usize = 1 + size_of::<u32>();

    pub fn ser(&self, buf: &mut impl BufMut) {
        assert!(self.size <= MAX_PACKET_SIZE);

        buf.put_u8(self.request_id.to_raw());
        let type_and_size = u8::from(self.packet_type) as u32 | ((self.size as u32) << 2);
        buf.put_u32_le(type_and_size);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<PacketHeader> {
        if buf.remaining() < Self::SERIALIZED_LEN {
            bail!("incomplete packet header: {} bytes", buf.remaining());
        }

        let request_id = RequestId::new(buf.get_u8());
        let type_and_size = buf.get_u32_le();

        let packet_type = PacketType::try_from((type_and_size & 0x03) as u8)
            .map_err(|_| anyhow!("invalid packet type {}", type_and_size & 0x03))?;

        let size = (type_and_size >> 2) as usize;
        if size > MAX_PACKET_SIZE {
            bail!("packet for request {} declares a size of {} which exceeds the maximum of {} - the peer is broken or compromised", request_id, size, MAX_PACKET_SIZE);
        }

        Ok(PacketHeader {
            request_id,
            packet_type,
            size,
        })
    }
}

/// A fixed-capacity chunk of a logical message. Packets are reused through a
///  [crate::packet_pool::PacketPool], and they are moved between their owners (pool, queues,
///  streams) rather than shared.
///
/// Invariant: `cursor <= size <= MAX_PACKET_SIZE`
pub struct Packet {
    buf: Box<[u8]>,
    /// number of payload bytes in the buffer
    size: usize,
    /// read position inside the payload
    cursor: usize,
    packet_type: PacketType,
    request_id: RequestId,
}

impl Default for Packet {
    fn default() -> Self {
        Self::new()
    }
}

impl Packet {
    pub fn new() -> Packet {
        Packet {
            buf: vec![0; MAX_PACKET_SIZE].into_boxed_slice(),
            size: 0,
            cursor: 0,
            packet_type: PacketType::Start,
            request_id: RequestId::default(),
        }
    }

    /// Clears the payload, keeping the buffer for reuse
    pub fn reset(&mut self) {
        self.cursor = 0;
        self.size = 0;
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub fn set_request_id(&mut self, request_id: RequestId) {
        self.request_id = request_id;
    }

    pub fn packet_type(&self) -> PacketType {
        self.packet_type
    }

    pub fn set_packet_type(&mut self, packet_type: PacketType) {
        self.packet_type = packet_type;
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn is_fully_read(&self) -> bool {
        self.cursor == self.size
    }

    pub fn payload(&self) -> &[u8] {
        &self.buf[..self.size]
    }

    pub fn header(&self) -> PacketHeader {
        PacketHeader {
            request_id: self.request_id,
            packet_type: self.packet_type,
            size: self.size,
        }
    }

    /// Copies as many unread bytes as are available (up to `dst.len()`), returning the number of
    ///  bytes copied
    pub fn read_data(&mut self, dst: &mut [u8]) -> usize {
        debug_assert!(self.cursor <= self.size);

        let num_read = min(dst.len(), self.size - self.cursor);
        dst[..num_read].copy_from_slice(&self.buf[self.cursor..self.cursor + num_read]);
        self.cursor += num_read;
        num_read
    }

    /// Appends as many bytes as fit into the packet (up to `src.len()`), returning the number of
    ///  bytes appended
    pub fn write_data(&mut self, src: &[u8]) -> usize {
        debug_assert!(self.size <= MAX_PACKET_SIZE);

        let num_written = min(src.len(), MAX_PACKET_SIZE - self.size);
        self.buf[self.size..self.size + num_written].copy_from_slice(&src[..num_written]);
        self.size += num_written;
        num_written
    }

    /// Reads a complete packet (header and payload) from the wire. On failure the packet stays
    ///  empty; the caller decides whether that means the connection is broken.
    pub async fn read_from_stream<R: AsyncRead + Unpin + ?Sized>(&mut self, stream: &mut R) -> anyhow::Result<()> {
        debug_assert!(self.cursor == 0 && self.size == 0, "reading into a packet that was not reset");

        let mut header_buf = [0u8; PacketHeader::SERIALIZED_LEN];
        stream.read_exact(&mut header_buf).await?;
        let header = PacketHeader::deser(&mut header_buf.as_slice())?;

        stream.read_exact(&mut self.buf[..header.size]).await?;

        self.request_id = header.request_id;
        self.packet_type = header.packet_type;
        self.size = header.size;
        Ok(())
    }

    pub async fn write_to_stream<W: AsyncWrite + Unpin + ?Sized>(&self, stream: &mut W) -> anyhow::Result<()> {
        let mut header_buf = [0u8; PacketHeader::SERIALIZED_LEN];
        self.header().ser(&mut header_buf.as_mut_slice());

        stream.write_all(&header_buf).await?;
        stream.write_all(self.payload()).await?;
        Ok(())
    }
}

impl Debug for Packet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Packet")
            .field("request_id", &self.request_id)
            .field("packet_type", &self.packet_type)
            .field("size", &self.size)
            .field("cursor", &self.cursor)
            .finish()
    }
}
