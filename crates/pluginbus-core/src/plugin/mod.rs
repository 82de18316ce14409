//! Plugin-side runtime: connection bootstrap, outgoing calls, and inbound
//! request dispatch.

mod call;
mod client;
mod context;
mod correlator;
mod dispatcher;

pub use call::CallContext;
pub use client::Plugin;
pub use context::RequestContext;
pub use correlator::{PendingRequest, RequestCorrelator};
pub use dispatcher::{handler_fn, Handler, HandlerDispatcher, HandlerFn};
