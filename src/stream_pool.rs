use rustc_hash::FxHashMap;
use tracing::trace;
use crate::packet_stream::{PacketStream, PacketStreamHandle};

/// Identifies one activation of a packet stream, i.e. one request using it
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StreamKey(u64);

/// The per-connection pool of packet streams. Idle streams are reused for new requests; active
///  streams are owned by the task processing their request, and the pool keeps their handles
///  so that they can all be disconnected when the connection shuts down.
///
/// NB: A request stays active until its task released it, which can be after its request id
///  was released for reuse.
pub struct StreamPool {
    idle: Vec<PacketStream>,
    active: FxHashMap<StreamKey, PacketStreamHandle>,
    next_key: u64,
    max_idle: usize,
}

impl StreamPool {
    pub fn new(max_idle: usize) -> StreamPool {
        StreamPool {
            idle: Vec::new(),
            active: FxHashMap::default(),
            next_key: 0,
            max_idle,
        }
    }

    pub fn acquire(&mut self, create: impl FnOnce() -> PacketStream) -> PacketStream {
        match self.idle.pop() {
            Some(stream) => stream,
            None => {
                trace!("no idle packet stream, creating a new one");
                create()
            }
        }
    }

    pub fn register_active(&mut self, handle: PacketStreamHandle) -> StreamKey {
        let key = StreamKey(self.next_key);
        self.next_key += 1;
        self.active.insert(key, handle);
        key
    }

    /// Takes back a stream after its request finished; the stream must be shut down
    pub fn release(&mut self, key: StreamKey, mut stream: PacketStream) {
        let removed = self.active.remove(&key);
        debug_assert!(removed.is_some(), "releasing a stream that is not active");

        stream.detach();
        if self.idle.len() < self.max_idle {
            self.idle.push(stream);
        }
    }

    pub fn num_active(&self) -> usize {
        self.active.len()
    }

    pub fn num_idle(&self) -> usize {
        self.idle.len()
    }

    pub fn disconnect_all(&self) {
        for handle in self.active.values() {
            handle.disconnect();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use crate::config::RpcConfig;
    use crate::packet::Packet;
    use crate::packet_pool::PacketPool;
    use crate::queue::{blocking_queue, QueueReceiver, QueueSender};
    use crate::request_slots::RequestId;

    fn setup() -> (Arc<PacketPool>, QueueSender<Option<Packet>>, QueueReceiver<Option<Packet>>) {
        let (tx, rx) = blocking_queue(10);
        (Arc::new(PacketPool::new(10)), tx, rx)
    }

    #[test]
    fn test_acquire_and_release() {
        let (pool, tx, _rx) = setup();
        let config = Arc::new(RpcConfig::default());
        let mut streams = StreamPool::new(2);

        let mut num_created = 0;
        let mut stream = streams.acquire(|| {
            num_created += 1;
            PacketStream::new(config.clone(), pool.clone(), tx.clone())
        });
        let key = streams.register_active(stream.attach(RequestId::new(1)));
        assert_eq!(streams.num_active(), 1);
        assert_eq!(streams.num_idle(), 0);

        streams.release(key, stream);
        assert_eq!(streams.num_active(), 0);
        assert_eq!(streams.num_idle(), 1);

        let _stream = streams.acquire(|| panic!("an idle stream should be reused"));
        assert_eq!(num_created, 1);
    }

    #[test]
    fn test_idle_limit() {
        let (pool, tx, _rx) = setup();
        let config = Arc::new(RpcConfig::default());
        let mut streams = StreamPool::new(1);

        let mut a = PacketStream::new(config.clone(), pool.clone(), tx.clone());
        let mut b = PacketStream::new(config.clone(), pool.clone(), tx.clone());
        let key_a = streams.register_active(a.attach(RequestId::new(1)));
        let key_b = streams.register_active(b.attach(RequestId::new(2)));
        assert_ne!(key_a, key_b);

        streams.release(key_a, a);
        streams.release(key_b, b);
        assert_eq!(streams.num_idle(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_all() {
        let (pool, tx, _rx) = setup();
        let config = Arc::new(RpcConfig::default());
        let mut streams = StreamPool::new(10);

        let mut a = PacketStream::new(config.clone(), pool.clone(), tx.clone());
        let mut b = PacketStream::new(config.clone(), pool.clone(), tx.clone());
        let key_a = streams.register_active(a.attach(RequestId::new(1)));
        let key_b = streams.register_active(b.attach(RequestId::new(2)));

        streams.disconnect_all();
        assert!(a.is_disconnected());
        assert!(b.is_disconnected());
        // the wakeup packets
        assert_eq!(pool.outstanding(), 2);

        assert!(a.initialize().await.is_err());
        a.shutdown().await.unwrap();
        b.shutdown().await.unwrap();
        streams.release(key_a, a);
        streams.release(key_b, b);
        assert_eq!(pool.outstanding(), 0);
    }
}
