use std::sync::Arc;
use anyhow::{anyhow, bail};
use rustc_hash::FxHashMap;
use crate::dispatch::data::RpcData;
use crate::dispatch::method::RpcMethod;

/// The maximum number of methods per interface: method ids are a single byte on the wire
pub const MAX_METHODS: usize = 0x100;

/// The immutable table of methods that a server serves and a client calls. Method ids are
///  assigned by position, so both sides must register the same methods in the same order.
///
/// An interface is built once at startup and shared as `Arc<RpcInterface>`.
#[derive(Debug)]
pub struct RpcInterface {
    name: String,
    methods: Vec<Arc<RpcMethod>>,
    method_ids: FxHashMap<String, u8>,
}

impl RpcInterface {
    pub fn new(name: impl Into<String>, methods: Vec<RpcMethod>) -> anyhow::Result<RpcInterface> {
        let name = name.into();
        if methods.len() > MAX_METHODS {
            bail!("interface {} has {} methods, the maximum is {}", name, methods.len(), MAX_METHODS);
        }

        let mut method_ids = FxHashMap::default();
        for (id, method) in methods.iter().enumerate() {
            method.validate()?;
            if method_ids.insert(method.name().to_string(), id as u8).is_some() {
                bail!("interface {}: duplicate method {}", name, method.name());
            }
        }

        Ok(RpcInterface {
            name,
            methods: methods.into_iter().map(Arc::new).collect(),
            method_ids,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn num_methods(&self) -> usize {
        self.methods.len()
    }

    pub fn get_method(&self, method_id: u8) -> Option<&Arc<RpcMethod>> {
        self.methods.get(method_id as usize)
    }

    pub fn method_id(&self, name: &str) -> Option<u8> {
        self.method_ids.get(name).copied()
    }

    /// Creates call data for a method, with all request parameters set to their type's default
    pub fn new_request(&self, method_name: &str) -> anyhow::Result<RpcData> {
        let method_id = self.method_id(method_name)
            .ok_or_else(|| anyhow!("interface {} has no method {}", self.name, method_name))?;
        Ok(RpcData::new(method_id, self.methods[method_id as usize].clone()))
    }
}
