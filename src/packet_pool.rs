use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tracing::{debug, trace};
use crate::packet::{Packet, PacketType};
use crate::request_slots::RequestId;

/// Packets are allocated lazily and reused. This pool keeps returned packets up to a configured
///  number, and it keeps track of the number of packets that are currently handed out so that
///  leaks can be detected.
pub struct PacketPool {
    max_pool_size: usize,
    packets: Mutex<Vec<Packet>>,
    outstanding: AtomicUsize,
}

impl PacketPool {
    pub fn new(max_pool_size: usize) -> Self {
        PacketPool {
            max_pool_size,
            packets: Mutex::new(Vec::new()),
            outstanding: AtomicUsize::new(0),
        }
    }

    pub fn get_from_pool(&self, request_id: RequestId, packet_type: PacketType) -> Packet {
        let mut packet = self._get_from_pool();
        packet.set_request_id(request_id);
        packet.set_packet_type(packet_type);
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        packet
    }

    fn _get_from_pool(&self) -> Packet {
        {
            let mut packets = self.packets.lock().unwrap();
            if let Some(packet) = packets.pop() {
                trace!("returning packet from pool");
                return packet;
            }
        }

        debug!("no packet in pool: creating new packet");
        Packet::new()
    }

    pub fn return_to_pool(&self, mut packet: Packet) {
        let prev = self.outstanding.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "this is a bug: a packet was returned to a pool it was not taken from");

        packet.reset();

        let mut packets = self.packets.lock().unwrap();
        if packets.len() < self.max_pool_size {
            trace!("returning packet to pool");
            packets.push(packet);
        }
        else {
            debug!("pool is full: discarding returned packet");
        }
    }

    /// the number of packets that were taken from the pool and not returned yet
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    pub fn num_pooled(&self) -> usize {
        self.packets.lock().unwrap().len()
    }
}
