pub mod request_processor;
pub mod rpc_server;
pub mod stream_processor;
