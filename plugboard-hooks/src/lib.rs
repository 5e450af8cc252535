pub mod chain;
pub mod client;
pub mod protocol;

pub use chain::{apply_post_hooks, apply_pre_hooks};
pub use client::{HookClient, HookError};
pub use protocol::{
    ClientRequest, PostHookRequest, PostHookResponse, PreHookRequest, PreHookResponse,
    ServerResponse,
};
