// Re-export tcp.rs
#[allow(clippy::module_inception)]
pub(crate) mod tcp;
pub(crate) use tcp::*;

mod dispatch;
mod http;
mod tunnel;
