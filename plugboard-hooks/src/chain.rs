use crate::client::HookClient;
use crate::protocol::{
    ClientRequest, PostHookRequest, PostHookResponse, PreHookRequest, PreHookResponse,
    ServerResponse,
};
use plugboard_core::routes::Adapter;
use std::sync::Arc;
use tracing::debug;

/// Fold the pre-hook chain over the client request.
///
/// Adapters run sequentially, in list order, each seeing the state left
/// by its predecessor. A failing adapter is skipped and the state flows
/// on unchanged: hooks are best-effort and must never fail the exchange.
///
/// Replies update `Body` and `Request` only. `Method` stays whatever the
/// client sent, and every adapter is reached at the client's original
/// request target even after a predecessor rewrites `Request`.
pub async fn apply_pre_hooks(
    client: &HookClient,
    adapters: &[Arc<Adapter>],
    initial: ClientRequest,
    request_target: &str,
) -> ClientRequest {
    let mut state = initial;
    for adapter in adapters {
        let envelope = PreHookRequest::new(state.clone());
        match client
            .call::<_, PreHookResponse>(adapter, request_target, &envelope)
            .await
        {
            Ok(reply) => {
                debug!(adapter = %adapter.name, "pre-hook applied");
                let modified = reply.modified_client_request;
                state.body = modified.body;
                state.request = modified.request;
            }
            Err(e) => {
                debug!(adapter = %adapter.name, error = %e, "pre-hook skipped");
            }
        }
    }
    state
}

/// Fold the post-hook chain over the upstream response.
///
/// `client_request.Body` must already be the post-pre-hook request body,
/// so adapters see what the upstream saw. Each successful reply wholly
/// replaces the response state: content type, code, and body.
pub async fn apply_post_hooks(
    client: &HookClient,
    adapters: &[Arc<Adapter>],
    client_request: &ClientRequest,
    initial: ServerResponse,
    request_target: &str,
) -> ServerResponse {
    let mut state = initial;
    for adapter in adapters {
        let envelope = PostHookRequest::new(client_request.clone(), state.clone());
        match client
            .call::<_, PostHookResponse>(adapter, request_target, &envelope)
            .await
        {
            Ok(reply) => {
                debug!(adapter = %adapter.name, code = reply.modified_server_response.code, "post-hook applied");
                state = reply.modified_server_response;
            }
            Err(e) => {
                debug!(adapter = %adapter.name, error = %e, "post-hook skipped");
            }
        }
    }
    state
}
