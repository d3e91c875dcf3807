use std::time::Duration;
use anyhow::bail;

pub struct RpcConfig {
    /// The maximum time a request waits for the next packet of a message it is reading. A peer
    ///  that stalls for longer than this in the middle of a message is considered broken, and the
    ///  connection is closed.
    pub read_timeout: Duration,

    /// The maximum time for handing a packet to the connection's writer queue, and for writing
    ///  it to the socket.
    pub write_timeout: Duration,

    /// The interval a client waits after a lost (or failed) connection before it tries to
    ///  reconnect
    pub reconnect_interval: Duration,

    /// This is the number of packets that can be queued for a single request before the
    ///  connection's reader loop has to wait
    pub reader_queue_size: usize,

    /// This is the number of packets (for all requests of a connection) that can be queued for
    ///  writing to the socket
    pub writer_queue_size: usize,

    /// This is the number of packets that will be pooled at a given time per connection - packets
    ///  in excess of this number are discarded when they are returned.
    pub packet_pool_size: usize,

    /// The maximum number of connections a server handles concurrently. Connections beyond this
    ///  limit are closed right after they are accepted.
    pub max_connections: usize,
}

impl Default for RpcConfig {
    fn default() -> Self {
        RpcConfig {
            read_timeout: Duration::from_millis(2000),
            write_timeout: Duration::from_millis(2000),
            reconnect_interval: Duration::from_millis(500),
            reader_queue_size: 100,
            writer_queue_size: 1000,
            packet_pool_size: 1000,
            max_connections: 256,
        }
    }
}

impl RpcConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.read_timeout.is_zero() || self.write_timeout.is_zero() {
            bail!("read and write timeouts must be positive");
        }
        if self.reconnect_interval.is_zero() {
            bail!("reconnect interval must be positive");
        }
        // one slot for the regular packet, one for a synthetic END injected on disconnect
        if self.reader_queue_size < 2 {
            bail!("reader queue size must be at least 2, was {}", self.reader_queue_size);
        }
        if self.writer_queue_size == 0 {
            bail!("writer queue size must be positive");
        }
        if self.max_connections == 0 {
            bail!("max connections must be positive");
        }
        Ok(())
    }
}
