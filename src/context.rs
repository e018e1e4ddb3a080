use std::{cell::RefCell, future::Future, net::SocketAddr};

use anyhow::Result;
use tokio::task::futures::TaskLocalFuture;

tokio::task_local! {
    pub(crate) static REQ_CONTEXT: RefCell<ReqContext>;
}

/// Per-connection information, available to everything running on behalf of
/// a client connection (mostly for logging).
pub(crate) struct ReqContext {
    /// Local IP & port.
    pub(crate) local: SocketAddr,
    /// Peer IP & port.
    pub(crate) peer: SocketAddr,
    /// Request target, once the request was parsed.
    pub(crate) target: Option<String>,
}

impl ReqContext {
    pub(crate) fn from(local: SocketAddr, peer: SocketAddr) -> RefCell<Self> {
        RefCell::new(Self {
            local,
            peer,
            target: None,
        })
    }
}

/// Run a future with a request context.
pub(crate) fn with_req_context<F: Future>(
    context: RefCell<ReqContext>,
    f: F,
) -> TaskLocalFuture<RefCell<ReqContext>, F> {
    REQ_CONTEXT.scope(context, f)
}

/// Set the current context request target. Fails if no context is defined.
pub(crate) fn set_target(target: &str) -> Result<()> {
    REQ_CONTEXT.try_with(|context| context.borrow_mut().target = Some(target.to_string()))?;
    Ok(())
}
