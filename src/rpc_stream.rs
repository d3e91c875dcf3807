use async_trait::async_trait;

/// The byte stream abstraction the dispatch layer reads requests from and writes responses to.
///  It is implemented by [crate::packet_stream::PacketStream], and by an in-memory stream for
///  testing.
#[async_trait]
pub trait RpcStream: Send {
    /// Fills `buf` completely, failing if the logical message ends (or the connection is lost)
    ///  before `buf.len()` bytes were read
    async fn read(&mut self, buf: &mut [u8]) -> anyhow::Result<()>;

    async fn write(&mut self, buf: &[u8]) -> anyhow::Result<()>;

    /// Terminates the message that is currently being written
    async fn flush(&mut self) -> anyhow::Result<()>;
}
