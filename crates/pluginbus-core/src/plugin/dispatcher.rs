//! Method-name → handler dispatch for inbound requests.

use super::client::Plugin;
use super::context::RequestContext;
use crate::error::BusError;
use crate::protocol::Envelope;
use futures::FutureExt;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, error, warn};

/// A method handler.
///
/// The handler takes the request context, fills in its response, and hands
/// it back. Plain closures over `&mut RequestContext` implement this trait;
/// async closures can be wrapped with [`handler_fn`].
#[async_trait::async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, ctx: RequestContext) -> RequestContext;
}

#[async_trait::async_trait]
impl<F> Handler for F
where
    F: Fn(&mut RequestContext) + Send + Sync + 'static,
{
    async fn handle(&self, mut ctx: RequestContext) -> RequestContext {
        (self)(&mut ctx);
        ctx
    }
}

/// Adapter produced by [`handler_fn`].
pub struct HandlerFn<F>(F);

/// Wrap an async closure as a [`Handler`].
///
/// ```
/// use pluginbus_core::plugin::{handler_fn, Plugin};
///
/// let plugin = Plugin::new("Echo", "1.0.0");
/// plugin.handle("echo", handler_fn(|mut ctx| async move {
///     let data = ctx.request_data().to_vec();
///     ctx.reply_data(&data);
///     ctx
/// }));
/// ```
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(RequestContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = RequestContext> + Send + 'static,
{
    HandlerFn(f)
}

#[async_trait::async_trait]
impl<F, Fut> Handler for HandlerFn<F>
where
    F: Fn(RequestContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = RequestContext> + Send + 'static,
{
    async fn handle(&self, ctx: RequestContext) -> RequestContext {
        (self.0)(ctx).await
    }
}

/// Handlers keyed by method name, plus an optional fallback.
#[derive(Default)]
pub struct HandlerDispatcher {
    handlers: RwLock<HashMap<String, Arc<dyn Handler>>>,
    no_route: RwLock<Option<Arc<dyn Handler>>>,
}

impl HandlerDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a handler for `method`, replacing any previous one.
    pub fn handle(&self, method: impl Into<String>, handler: impl Handler) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(method.into(), Arc::new(handler));
    }

    /// Install the handler used when no method matches.
    pub fn set_no_route(&self, handler: impl Handler) {
        *self.no_route.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(handler));
    }

    /// Registered method names, sorted.
    pub fn methods(&self) -> Vec<String> {
        let mut methods: Vec<String> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        methods.sort();
        methods
    }

    fn lookup(&self, method: &str) -> Option<Arc<dyn Handler>> {
        let handler = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(method)
            .cloned();
        handler.or_else(|| {
            self.no_route
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        })
    }

    /// Run the handler for `request` and build its response envelope.
    pub async fn dispatch(&self, request: Envelope, plugin: Plugin) -> Envelope {
        let Some(handler) = self.lookup(&request.method) else {
            error!("No handler for method {} (from {})", request.method, request.from);
            let err = BusError::NoHandler {
                method: request.method.clone(),
            };
            return request.response_to().with_error(err.to_string());
        };

        debug!(
            "Dispatching {} id={} from {}",
            request.method, request.id, request.from
        );

        let fallback = request.response_to();
        let ctx = RequestContext::new(request, plugin);
        match AssertUnwindSafe(handler.handle(ctx)).catch_unwind().await {
            Ok(ctx) => ctx.into_response(),
            Err(_) => {
                warn!("Handler for {} panicked", fallback.method);
                let message = format!("handler for {} panicked", fallback.method);
                fallback.with_error(message)
            }
        }
    }
}

impl std::fmt::Debug for HandlerDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerDispatcher")
            .field("methods", &self.methods())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn request(method: &str, payload: &[u8]) -> Envelope {
        Envelope::request(5, "A", "B", method, payload.to_vec())
    }

    fn plugin() -> Plugin {
        Plugin::new("B", "1.0.0")
    }

    #[tokio::test]
    async fn test_sync_closure_handler() {
        let dispatcher = HandlerDispatcher::new();
        dispatcher.handle("ping", |ctx: &mut RequestContext| ctx.reply_data(b"pong"));

        let response = dispatcher.dispatch(request("ping", b"ping"), plugin()).await;
        assert_eq!(response.payload, b"pong".to_vec());
        assert_eq!(response.id, 5);
        assert_eq!(response.to, "A");
    }

    #[tokio::test]
    async fn test_async_handler_fn() {
        let dispatcher = HandlerDispatcher::new();
        dispatcher.handle(
            "slow_echo",
            handler_fn(|mut ctx| async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                let data = ctx.request_data().to_vec();
                ctx.reply_data(&data);
                ctx
            }),
        );

        let response = dispatcher.dispatch(request("slow_echo", b"hi"), plugin()).await;
        assert_eq!(response.payload, b"hi".to_vec());
    }

    #[tokio::test]
    async fn test_missing_handler_reports_method() {
        let dispatcher = HandlerDispatcher::new();
        let response = dispatcher.dispatch(request("missing", b""), plugin()).await;

        let error = response.error_message().expect("error response");
        assert!(error.contains("missing"));
        assert_eq!(error, "no handler for method: missing");
    }

    #[tokio::test]
    async fn test_no_route_fallback() {
        let dispatcher = HandlerDispatcher::new();
        dispatcher.set_no_route(|ctx: &mut RequestContext| {
            let method = ctx.method().to_string();
            ctx.reply(&serde_json::json!({ "unrouted": method }));
        });

        let response = dispatcher.dispatch(request("anything", b""), plugin()).await;
        assert!(response.error.is_none());
        assert_eq!(response.payload, br#"{"unrouted":"anything"}"#.to_vec());
    }

    #[tokio::test]
    async fn test_last_registration_wins() {
        let dispatcher = HandlerDispatcher::new();
        dispatcher.handle("v", |ctx: &mut RequestContext| ctx.reply_data(b"1"));
        dispatcher.handle("v", |ctx: &mut RequestContext| ctx.reply_data(b"2"));

        let response = dispatcher.dispatch(request("v", b""), plugin()).await;
        assert_eq!(response.payload, b"2".to_vec());
        assert_eq!(dispatcher.methods(), vec!["v".to_string()]);
    }

    #[tokio::test]
    async fn test_handler_error_becomes_response_error() {
        let dispatcher = HandlerDispatcher::new();
        dispatcher.handle("add", |ctx: &mut RequestContext| {
            if let Err(e) = ctx.bind::<serde_json::Value>() {
                ctx.set_error(e);
            }
        });

        let response = dispatcher.dispatch(request("add", b"{oops"), plugin()).await;
        assert!(response.error_message().unwrap().contains("Failed to bind"));
        assert!(response.payload.is_empty());
    }

    #[tokio::test]
    async fn test_panicking_handler_yields_error_response() {
        let dispatcher = HandlerDispatcher::new();
        dispatcher.handle("boom", |_ctx: &mut RequestContext| panic!("boom"));

        let response = dispatcher.dispatch(request("boom", b""), plugin()).await;
        assert_eq!(response.error_message(), Some("handler for boom panicked"));
    }
}
