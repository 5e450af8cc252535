//! Wire envelopes for the adapter hook protocol.
//!
//! Field names are part of the protocol and serialize in PascalCase
//! exactly as adapters expect them. A missing body and a JSON `null`
//! body both deserialize to `None`; serialization always emits the
//! field (as `null` when absent) so replies round-trip unchanged.

use serde::{Deserialize, Serialize};

/// Protocol version carried in every envelope.
pub const PROTOCOL_VERSION: u32 = 1;

pub const PRE_HOOK_TYPE: &str = "pre-hook";
pub const POST_HOOK_TYPE: &str = "post-hook";

/// The client's request as adapters see it. `Request` is the request
/// target: path plus optional query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ClientRequest {
    pub method: String,
    pub request: String,
    pub body: Option<String>,
}

/// The upstream's response as adapters see it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServerResponse {
    pub content_type: String,
    pub body: Option<String>,
    pub code: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PreHookRequest {
    pub powerstrip_protocol_version: u32,
    #[serde(rename = "Type")]
    pub hook_type: String,
    pub client_request: ClientRequest,
}

impl PreHookRequest {
    pub fn new(client_request: ClientRequest) -> Self {
        Self {
            powerstrip_protocol_version: PROTOCOL_VERSION,
            hook_type: PRE_HOOK_TYPE.to_string(),
            client_request,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PreHookResponse {
    #[serde(default)]
    pub powerstrip_protocol_version: u32,
    pub modified_client_request: ClientRequest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PostHookRequest {
    pub powerstrip_protocol_version: u32,
    #[serde(rename = "Type")]
    pub hook_type: String,
    pub client_request: ClientRequest,
    pub server_response: ServerResponse,
}

impl PostHookRequest {
    pub fn new(client_request: ClientRequest, server_response: ServerResponse) -> Self {
        Self {
            powerstrip_protocol_version: PROTOCOL_VERSION,
            hook_type: POST_HOOK_TYPE.to_string(),
            client_request,
            server_response,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PostHookResponse {
    #[serde(default)]
    pub powerstrip_protocol_version: u32,
    pub modified_server_response: ServerResponse,
}
