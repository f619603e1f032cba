use serde::Serialize;
use serde_json::Value;
use strum_macros::{Display, IntoStaticStr};

pub const PROTOCOL_VERSION: &str = "2.0";

/// Backend methods the adapter calls.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Display, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum Method {
    /// Begin a debugging run, sent once right after connecting.
    Start,
    /// Resume execution. Parameters are the current breakpoint list.
    Continue,
}

/// Outbound call frame.
#[derive(Debug, Serialize)]
pub struct RpcRequest<'a> {
    pub method: &'static str,
    pub params: &'a [Value],
    pub jsonrpc: &'static str,
    pub id: u64,
}

impl<'a> RpcRequest<'a> {
    pub fn new(method: Method, params: &'a [Value], id: u64) -> Self {
        Self {
            method: method.into(),
            params,
            jsonrpc: PROTOCOL_VERSION,
            id,
        }
    }
}
