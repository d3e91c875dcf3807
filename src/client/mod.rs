pub mod connector;
pub mod request_stream;
pub mod rpc_client;
pub mod stream_processor;
