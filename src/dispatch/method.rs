use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use anyhow::bail;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashSet;
use crate::dispatch::data::RpcData;
use crate::dispatch::param::ParamType;

/// The maximum number of request (or response) parameters of a single method
pub const MAX_PARAMS: usize = 100;

/// Application code that handles calls of a method on the server side: it takes the request
///  parameters from the [RpcData] and sets the response parameters.
///
/// A failing handler aborts the call, i.e. no response is sent.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MethodHandler: Send + Sync + 'static {
    async fn handle(&self, data: &mut RpcData) -> anyhow::Result<()>;
}

#[async_trait]
impl<F> MethodHandler for F
where F: Fn(&mut RpcData) -> anyhow::Result<()> + Send + Sync + 'static
{
    async fn handle(&self, data: &mut RpcData) -> anyhow::Result<()> {
        self(data)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParamSpec {
    pub name: String,
    pub param_type: ParamType,
    /// Key parameters identify a request, i.e. two requests with the same key parameters are
    ///  considered to refer to the same thing. See [RpcData::request_hash].
    pub is_key: bool,
}

/// A method's signature, and (on the server) its handler
pub struct RpcMethod {
    name: String,
    request_params: Vec<ParamSpec>,
    response_params: Vec<ParamSpec>,
    handler: Option<Arc<dyn MethodHandler>>,
}

impl Debug for RpcMethod {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcMethod")
            .field("name", &self.name)
            .field("request_params", &self.request_params)
            .field("response_params", &self.response_params)
            .field("has_handler", &self.handler.is_some())
            .finish()
    }
}

impl RpcMethod {
    pub fn new(name: impl Into<String>) -> RpcMethod {
        RpcMethod {
            name: name.into(),
            request_params: Vec::new(),
            response_params: Vec::new(),
            handler: None,
        }
    }

    pub fn request(mut self, name: impl Into<String>, param_type: ParamType) -> RpcMethod {
        self.request_params.push(ParamSpec { name: name.into(), param_type, is_key: false });
        self
    }

    /// a request parameter that is part of the request's key
    pub fn request_key(mut self, name: impl Into<String>, param_type: ParamType) -> RpcMethod {
        self.request_params.push(ParamSpec { name: name.into(), param_type, is_key: true });
        self
    }

    pub fn response(mut self, name: impl Into<String>, param_type: ParamType) -> RpcMethod {
        self.response_params.push(ParamSpec { name: name.into(), param_type, is_key: false });
        self
    }

    pub fn handler(mut self, handler: impl MethodHandler) -> RpcMethod {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// a synchronous handler, for methods that do not need to await anything
    pub fn handler_fn<F>(self, handler: F) -> RpcMethod
    where F: Fn(&mut RpcData) -> anyhow::Result<()> + Send + Sync + 'static
    {
        self.handler(handler)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn request_params(&self) -> &[ParamSpec] {
        &self.request_params
    }

    pub fn response_params(&self) -> &[ParamSpec] {
        &self.response_params
    }

    pub fn get_handler(&self) -> Option<&Arc<dyn MethodHandler>> {
        self.handler.as_ref()
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.name.is_empty() {
            bail!("method name must not be empty");
        }
        for (kind, params) in [("request", &self.request_params), ("response", &self.response_params)] {
            if params.len() > MAX_PARAMS {
                bail!("method {}: {} {} parameters, the maximum is {}", self.name, params.len(), kind, MAX_PARAMS);
            }

            let mut names = FxHashSet::default();
            for param in params {
                if !names.insert(param.name.as_str()) {
                    bail!("method {}: duplicate {} parameter {}", self.name, kind, param.name);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_builder() {
        let method = RpcMethod::new("lookup")
            .request_key("id", ParamType::Uint64)
            .request("verbose", ParamType::Uint32)
            .response("value", ParamType::Blob)
            .handler_fn(|_| Ok(()));

        assert_eq!(method.name(), "lookup");
        assert_eq!(method.request_params(), &[
            ParamSpec { name: "id".to_string(), param_type: ParamType::Uint64, is_key: true },
            ParamSpec { name: "verbose".to_string(), param_type: ParamType::Uint32, is_key: false },
        ]);
        assert_eq!(method.response_params().len(), 1);
        assert!(method.get_handler().is_some());
        assert!(method.validate().is_ok());
    }

    #[test]
    fn test_without_handler() {
        let method = RpcMethod::new("ping");
        assert!(method.get_handler().is_none());
        assert!(method.validate().is_ok());
    }

    #[rstest]
    #[case::empty_name(RpcMethod::new(""))]
    #[case::duplicate_request(RpcMethod::new("m").request("a", ParamType::Uint32).request_key("a", ParamType::Int32))]
    #[case::duplicate_response(RpcMethod::new("m").response("a", ParamType::Uint32).response("a", ParamType::Uint32))]
    #[case::too_many_params((0..=MAX_PARAMS).fold(RpcMethod::new("m"), |m, i| m.request(format!("p{}", i), ParamType::Uint32)))]
    fn test_validate_rejects(#[case] method: RpcMethod) {
        assert!(method.validate().is_err());
    }

    #[test]
    fn test_same_name_in_request_and_response() {
        let method = RpcMethod::new("m")
            .request("data", ParamType::Blob)
            .response("data", ParamType::Blob);
        assert!(method.validate().is_ok());
    }
}
