//! Turning a logical byte stream into method calls and back: a [interface::RpcInterface] is a table
//!  of [method::RpcMethod]s, each with typed request and response parameters
//!  ([param::ParamType]), and [data::RpcData] is a single call.

pub mod data;
pub mod interface;
pub mod method;
pub mod param;
