pub mod base;
pub mod cli_proxy;
pub mod http_chat;
pub mod sse;

pub use base::{ChatProvider, CompletionParams, CompletionRequest};
pub use cli_proxy::CliProxyProvider;
pub use http_chat::HttpChatProvider;
