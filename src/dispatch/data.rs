use std::sync::Arc;
use anyhow::{anyhow, bail};
use tracing::trace;
use crate::dispatch::interface::RpcInterface;
use crate::dispatch::method::{ParamSpec, RpcMethod};
use crate::dispatch::param::ParamValue;
use crate::rpc_stream::RpcStream;

/// The data of a single call: the method, and its request and response parameters in the
///  method's parameter order.
///
/// On the wire, a request is the method id (a single byte) followed by the request parameters,
///  and a response is the response parameters. Each of them is a separate message, i.e. the
///  stream is flushed after it.
#[derive(Debug, Clone)]
pub struct RpcData {
    method_id: u8,
    method: Arc<RpcMethod>,
    request_params: Vec<ParamValue>,
    response_params: Vec<ParamValue>,
}

fn param_index(method: &RpcMethod, specs: &[ParamSpec], name: &str) -> anyhow::Result<usize> {
    specs.iter()
        .position(|p| p.name == name)
        .ok_or_else(|| anyhow!("method {} has no parameter {}", method.name(), name))
}

fn set_param(method: &RpcMethod, specs: &[ParamSpec], values: &mut [ParamValue], name: &str, value: ParamValue) -> anyhow::Result<()> {
    let idx = param_index(method, specs, name)?;
    if specs[idx].param_type != value.param_type() {
        bail!("method {}: parameter {} is {}, not {}", method.name(), name, specs[idx].param_type.name(), value.param_type().name());
    }
    values[idx] = value;
    Ok(())
}

impl RpcData {
    pub fn new(method_id: u8, method: Arc<RpcMethod>) -> RpcData {
        let request_params = method.request_params().iter()
            .map(|p| p.param_type.create())
            .collect();
        let response_params = method.response_params().iter()
            .map(|p| p.param_type.create())
            .collect();

        RpcData {
            method_id,
            method,
            request_params,
            response_params,
        }
    }

    pub fn method_id(&self) -> u8 {
        self.method_id
    }

    pub fn method(&self) -> &RpcMethod {
        &self.method
    }

    pub fn request_params(&self) -> &[ParamValue] {
        &self.request_params
    }

    pub fn response_params(&self) -> &[ParamValue] {
        &self.response_params
    }

    pub fn request(&self, name: &str) -> anyhow::Result<&ParamValue> {
        let idx = param_index(&self.method, self.method.request_params(), name)?;
        Ok(&self.request_params[idx])
    }

    pub fn set_request(&mut self, name: &str, value: impl Into<ParamValue>) -> anyhow::Result<()> {
        set_param(&self.method, self.method.request_params(), &mut self.request_params, name, value.into())
    }

    pub fn response(&self, name: &str) -> anyhow::Result<&ParamValue> {
        let idx = param_index(&self.method, self.method.response_params(), name)?;
        Ok(&self.response_params[idx])
    }

    pub fn set_response(&mut self, name: &str, value: impl Into<ParamValue>) -> anyhow::Result<()> {
        set_param(&self.method, self.method.response_params(), &mut self.response_params, name, value.into())
    }

    /// Combines the hashes of the key request parameters in parameter order, starting with
    ///  `start`
    pub fn request_hash(&self, start: u32) -> u32 {
        self.method.request_params().iter()
            .zip(self.request_params.iter())
            .filter(|(spec, _)| spec.is_key)
            .fold(start, |hash, (_, value)| value.hash(hash))
    }

    /// Server side: reads a method id and the method's request parameters
    pub async fn read_request(interface: &RpcInterface, stream: &mut (dyn RpcStream + '_)) -> anyhow::Result<RpcData> {
        let mut method_id = [0u8; 1];
        stream.read(&mut method_id).await?;
        let method_id = method_id[0];

        let method = interface.get_method(method_id)
            .ok_or_else(|| anyhow!("interface {}: unknown method id {}", interface.name(), method_id))?;
        trace!("received request for method {} ({})", method.name(), method_id);

        let mut data = RpcData::new(method_id, method.clone());
        for (idx, spec) in method.request_params().iter().enumerate() {
            data.request_params[idx] = spec.param_type.read(stream).await?;
        }
        Ok(data)
    }

    /// Runs the method's handler, which sets the response parameters
    pub async fn invoke(&mut self) -> anyhow::Result<()> {
        let handler = match self.method.get_handler() {
            Some(handler) => handler.clone(),
            None => bail!("method {} has no handler", self.method.name()),
        };
        handler.handle(self).await
    }

    /// Server side: writes the response parameters as a message of its own
    pub async fn write_response(&self, stream: &mut (dyn RpcStream + '_)) -> anyhow::Result<()> {
        for value in &self.response_params {
            value.write(stream).await?;
        }
        stream.flush().await
    }

    /// Client side: sends this request, and reads the response parameters
    pub async fn invoke_remote_call(&mut self, stream: &mut (dyn RpcStream + '_)) -> anyhow::Result<()> {
        stream.write(&[self.method_id]).await?;
        for value in &self.request_params {
            value.write(stream).await?;
        }
        stream.flush().await?;

        for (idx, spec) in self.method.response_params().iter().enumerate() {
            self.response_params[idx] = spec.param_type.read(stream).await?;
        }
        Ok(())
    }
}
