//! Remote procedure calls over a single byte stream (typically a TCP connection), with many
//!  concurrent calls multiplexed on the same connection.
//!
//! Every message (a request or a response) is split into packets of at most
//!  [packet::MAX_PACKET_SIZE] payload bytes. Each packet starts with a five byte header:
//!
//! ```ascii
//! 0:  request id (u8)
//! 1:  type and size (u32 LE): bits 0-1 are the packet type (START, MIDDLE, END or SINGLE),
//!      bits 2-31 the payload size
//! ```
//!
//! A message is either a single SINGLE packet, or a START packet followed by any number of
//!  MIDDLE packets and an END packet. Packets of different requests may be interleaved freely.
//!
//! The client chooses the request id for each call, and the server sends the response with the
//!  same id. A request message starts with the method id (u8) followed by the request
//!  parameters, a response message contains the response parameters. Parameters have no tags:
//!  both sides know the method's signature from the shared [dispatch::interface::RpcInterface].
//!
//! On the server side, see [server::rpc_server::RpcServer]; on the client side, see
//!  [client::rpc_client::RpcClient].

pub mod client;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod events;
pub mod packet;
pub mod packet_pool;
pub mod packet_stream;
pub mod queue;
pub mod request_slots;
pub mod rpc_stream;
pub mod server;
pub mod stream_pool;
pub mod stream_writer;


#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
